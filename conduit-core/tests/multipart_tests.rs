//! Multipart extraction and FORM_DATA binding

use conduit_core::convert::{self, ByteStream};
use conduit_core::{
    BindingFailure, CallDescriptor, DispatchConfig, DispatchError, FileInfo, FormError, FormFile,
    FormParams, Microservice, MicroservicesRegistry, MultipartBody, ParameterInfo, Reply, Request,
    ResourceModel, ResourceModelProcessor, Responder,
};
use http::Method;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

const BOUNDARY: &str = "----conduit-boundary";

struct Profiles;
impl Microservice for Profiles {}

fn part(name: &str, file_name: Option<&str>, content_type: Option<&str>, data: &[u8]) -> Vec<u8> {
    let mut out = format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"").into_bytes();
    if let Some(file_name) = file_name {
        out.extend_from_slice(format!("; filename=\"{file_name}\"").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    if let Some(content_type) = content_type {
        out.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

fn multipart_request(parts: &[Vec<u8>]) -> Request {
    let mut body: Vec<u8> = parts.concat();
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    Request::builder()
        .method(Method::POST)
        .uri("/profiles")
        .content_type(&format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(body)
        .build()
        .unwrap()
}

fn alice_with_avatar() -> Request {
    multipart_request(&[
        part("name", None, None, b"Alice"),
        part("avatar", Some("avatar.png"), Some("image/png"), b"PNGDATA"),
    ])
}

fn bind(
    registry: &MicroservicesRegistry,
    request: &Request,
    params: Vec<ParameterInfo>,
) -> Result<CallDescriptor, DispatchError> {
    let mut builder = ResourceModel::builder(Arc::new(Profiles), "Profiles::upload").route(Method::POST, "/profiles");
    for param in params {
        builder = builder.param(param);
    }
    let model = Arc::new(builder.handler(|_, _| Ok(Reply::Empty)));
    ResourceModelProcessor::build_invocation(request, &Responder::new(), &HashMap::new(), &model, registry)
}

fn scratch_registry(dir: &tempfile::TempDir) -> MicroservicesRegistry {
    MicroservicesRegistry::with_config(DispatchConfig {
        temp_root: dir.path().to_path_buf(),
        ..DispatchConfig::default()
    })
}

#[test]
fn test_text_and_file_fields() {
    let scratch = tempfile::tempdir().unwrap();
    let registry = scratch_registry(&scratch);
    let request = alice_with_avatar();

    let model = Arc::new(
        ResourceModel::builder(Arc::new(Profiles), "Profiles::upload")
            .route(Method::POST, "/profiles")
            .param(ParameterInfo::form_data("name", convert::text()))
            .param(ParameterInfo::form_data("avatar", convert::byte_stream()))
            .handler(|_, mut call| {
                let name: String = call.args.take(0).unwrap().unwrap();
                let mut avatar: ByteStream = call.args.take(1).unwrap().unwrap();
                let mut content = String::new();
                avatar.read_to_string(&mut content).unwrap();
                Ok(Reply::Text(format!("{name}:{content}")))
            }),
    );
    let mut call = ResourceModelProcessor::build_invocation(
        &request,
        &Responder::new(),
        &HashMap::new(),
        &model,
        &registry,
    )
    .unwrap();

    assert_eq!(call.args().get_as::<String>(0).map(String::as_str), Some("Alice"));
    assert!(call.args().get(1).is_some_and(|arg| arg.is::<ByteStream>()));

    let tracked = call.resources().tracked_files().to_vec();
    assert_eq!(tracked.len(), 1);
    assert!(tracked[0].starts_with(scratch.path()));
    assert!(tracked[0].exists());

    match call.invoke().unwrap() {
        Reply::Text(text) => assert_eq!(text, "Alice:PNGDATA"),
        other => panic!("unexpected reply {other:?}"),
    }

    let mut resources = call.into_resources();
    resources.cleanup().unwrap();
    assert!(!tracked[0].exists());
    assert!(resources.tracked_files().is_empty());
}

#[test]
fn test_file_metadata_targets() {
    let scratch = tempfile::tempdir().unwrap();
    let registry = scratch_registry(&scratch);
    let request = alice_with_avatar();

    let call = bind(
        &registry,
        &request,
        vec![
            ParameterInfo::form_data("avatar", convert::file_info()),
            ParameterInfo::form_data("avatar", convert::form_file()),
        ],
    )
    .unwrap();

    let info = call.args().get_as::<FileInfo>(0).unwrap();
    assert_eq!(info.file_name, "avatar.png");
    assert_eq!(info.content_type, "image/png");
    assert_eq!(info.size, 7);

    let file = call.args().get_as::<FormFile>(1).unwrap();
    assert_eq!(file.read().unwrap(), b"PNGDATA");
}

#[test]
fn test_temp_files_removed_when_binding_fails() {
    let scratch = tempfile::tempdir().unwrap();
    let registry = scratch_registry(&scratch);
    let request = alice_with_avatar();

    let err = bind(
        &registry,
        &request,
        vec![
            ParameterInfo::form_data("avatar", convert::byte_stream()),
            ParameterInfo::form_data("age", convert::scalar::<u8>()),
        ],
    )
    .unwrap_err();

    assert!(matches!(err.cause(), BindingFailure::MissingParameter { key } if key == "age"));
    let leftovers = std::fs::read_dir(scratch.path()).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[derive(Debug, Deserialize, PartialEq)]
struct Address {
    city: String,
}

#[test]
fn test_json_part_goes_through_its_media_converter() {
    let scratch = tempfile::tempdir().unwrap();
    let registry = scratch_registry(&scratch);
    let request = multipart_request(&[part(
        "address",
        None,
        Some("application/json"),
        br#"{"city":"Colombo"}"#,
    )]);

    let call = bind(
        &registry,
        &request,
        vec![ParameterInfo::form_data("address", convert::bean::<Address>())],
    )
    .unwrap();
    assert_eq!(
        call.args().get_as::<Address>(0),
        Some(&Address {
            city: "Colombo".into()
        })
    );
}

#[test]
fn test_repeated_form_data_fields_keep_every_value() {
    let scratch = tempfile::tempdir().unwrap();
    let registry = scratch_registry(&scratch);
    let tags = || vec![ParameterInfo::form_data("tag", convert::list::<String>())];
    let expected = vec!["a".to_string(), "b".to_string()];

    let request = multipart_request(&[
        part("tag", None, None, b"a"),
        part("tag", None, Some("text/plain; charset=utf-8"), b"b"),
    ]);
    let call = bind(&registry, &request, tags()).unwrap();
    assert_eq!(call.args().get_as::<Vec<String>>(0), Some(&expected));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/profiles")
        .content_type("application/x-www-form-urlencoded")
        .body("tag=a&tag=b")
        .build()
        .unwrap();
    let call = bind(&registry, &request, tags()).unwrap();
    assert_eq!(call.args().get_as::<Vec<String>>(0), Some(&expected));
}

#[test]
fn test_form_field_sent_as_file_binds_its_contents() {
    let scratch = tempfile::tempdir().unwrap();
    let registry = scratch_registry(&scratch);
    let request = multipart_request(&[
        part("doc", Some("a.txt"), Some("text/plain"), b"hello"),
        part("blob", Some("b.bin"), Some("application/octet-stream"), &[0xff, 0xfe]),
    ]);

    let call = bind(&registry, &request, vec![ParameterInfo::form("doc", convert::text())]).unwrap();
    assert_eq!(call.args().get_as::<String>(0).map(String::as_str), Some("hello"));

    let err = bind(&registry, &request, vec![ParameterInfo::form("blob", convert::text())]).unwrap_err();
    assert!(matches!(err.cause(), BindingFailure::Conversion { key, .. } if key == "blob"));
}

#[test]
fn test_malformed_multipart_is_a_form_parsing_failure() {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/profiles")
        .content_type("multipart/form-data")
        .body("--x\r\n")
        .build()
        .unwrap();

    let err = bind(
        &MicroservicesRegistry::new(),
        &request,
        vec![ParameterInfo::form_data("name", convert::text())],
    )
    .unwrap_err();
    assert!(matches!(
        err.cause(),
        BindingFailure::FormParsing(FormError::MissingBoundary)
    ));
    assert!(err.is_client_error());
}

#[test]
fn test_part_limit() {
    let scratch = tempfile::tempdir().unwrap();
    let registry = MicroservicesRegistry::with_config(DispatchConfig {
        temp_root: scratch.path().to_path_buf(),
        max_form_parts: 1,
        ..DispatchConfig::default()
    });

    let err = bind(
        &registry,
        &alice_with_avatar(),
        vec![ParameterInfo::form_data("name", convert::text())],
    )
    .unwrap_err();
    assert!(matches!(
        err.cause(),
        BindingFailure::FormParsing(FormError::TooManyParts { limit: 1 })
    ));
}

#[test]
fn test_builtin_multipart_iterator_and_form_map() {
    let scratch = tempfile::tempdir().unwrap();
    let registry = scratch_registry(&scratch);
    let request = alice_with_avatar();

    let call = bind(
        &registry,
        &request,
        vec![
            ParameterInfo::context::<MultipartBody>(),
            ParameterInfo::context::<FormParams>(),
        ],
    )
    .unwrap();

    let body = call.args().get_as::<MultipartBody>(0).unwrap();
    assert_eq!(body.boundary(), BOUNDARY);
    let names: Vec<String> = body.iter().map(|item| item.unwrap().name).collect();
    assert_eq!(names, vec!["name", "avatar"]);

    let form = call.args().get_as::<FormParams>(1).unwrap();
    assert_eq!(form.first_text("name"), Some("Alice"));
    assert_eq!(form.files("avatar").len(), 1);
}
