//! Request dispatch
//!
//! Runs one matched route end to end:
//!
//! 1. request filters, global ones first, then those the service declares
//! 2. interceptor `pre_call` hooks in registration order
//! 3. argument binding
//! 4. the handler
//! 5. interceptor `post_call` hooks
//! 6. response filters, in the same order as request filters
//!
//! A failure at any step is turned into a response by the most specific
//! exception mapper for its kind, or a 500 when none matches. The request's
//! temp files are removed once the response exists.

use crate::exception::Failure;
use crate::filter::{RequestFilter, ResponseFilter};
use crate::form::RequestResources;
use crate::http::{Request, Responder, Response};
use crate::interceptor::{Flow, InterceptorContext};
use crate::invocation::{CallDescriptor, Reply};
use crate::media::{APPLICATION_JSON, APPLICATION_OCTET_STREAM};
use crate::model::ResourceModel;
use crate::processor::ResourceModelProcessor;
use crate::registry::{MicroservicesRegistry, RegistryState};
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Drives a request through filters, interceptors, binding and the handler
pub struct Dispatcher;

impl Dispatcher {
    /// Dispatch `request` to `model` with a fresh response sink
    pub fn dispatch(
        registry: &MicroservicesRegistry,
        model: &Arc<ResourceModel>,
        request: &Request,
        captures: &HashMap<String, String>,
    ) -> Response {
        Self::dispatch_with(registry, model, request, captures, &Responder::new())
    }

    /// Dispatch writing into a caller-supplied response sink
    pub fn dispatch_with(
        registry: &MicroservicesRegistry,
        model: &Arc<ResourceModel>,
        request: &Request,
        captures: &HashMap<String, String>,
        responder: &Responder,
    ) -> Response {
        let state = registry.snapshot();
        let _span = tracing::debug_span!("dispatch", method = model.name()).entered();

        let mut resources = None;
        let mut response = match run_request_filters(&state, model, request, responder) {
            Ok(Flow::Continue) => {
                let (response, taken) = invoke(registry, &state, model, request, captures, responder);
                resources = taken;
                response
            }
            Ok(Flow::Halt) => {
                debug!("Request filter halted the request");
                responder.to_response()
            }
            Err(failure) => map_failure(&state, &*failure),
        };

        if let Err(failure) = run_response_filters(&state, model, request, &mut response) {
            response = map_failure(&state, &*failure);
        }

        if let Some(mut resources) = resources
            && let Err(e) = resources.cleanup()
        {
            warn!(error = %e, "Failed to clean up request temp files");
        }
        response
    }
}

fn run_request_filters(
    state: &RegistryState,
    model: &ResourceModel,
    request: &Request,
    responder: &Responder,
) -> Result<Flow, Box<dyn Failure>> {
    let declared = model.service().request_filters();
    let filters = state
        .global_request_filters()
        .iter()
        .map(|(_, filter)| filter)
        .chain(declared.iter().filter_map(|key| state.request_filter(key)));
    for filter in filters {
        if filter.filter(request, responder)? == Flow::Halt {
            return Ok(Flow::Halt);
        }
    }
    Ok(Flow::Continue)
}

fn run_response_filters(
    state: &RegistryState,
    model: &ResourceModel,
    request: &Request,
    response: &mut Response,
) -> Result<(), Box<dyn Failure>> {
    let declared = model.service().response_filters();
    let filters = state
        .global_response_filters()
        .iter()
        .map(|(_, filter)| filter)
        .chain(declared.iter().filter_map(|key| state.response_filter(key)));
    for filter in filters {
        filter.filter(request, response)?;
    }
    Ok(())
}

/// Interceptors, binding and the handler. Returns the request's temp
/// resources when binding got far enough to create them.
fn invoke(
    registry: &MicroservicesRegistry,
    state: &RegistryState,
    model: &Arc<ResourceModel>,
    request: &Request,
    captures: &HashMap<String, String>,
    responder: &Responder,
) -> (Response, Option<RequestResources>) {
    let context = InterceptorContext {
        request,
        responder,
        service: &**model.service(),
        method: model.name(),
    };

    for interceptor in state.interceptors() {
        match interceptor.pre_call(&context) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Halt) => {
                debug!(interceptor = interceptor.name(), "Interceptor halted the call");
                return (responder.to_response(), None);
            }
            Err(failure) => return (map_failure(state, &*failure), None),
        }
    }

    let mut call = match ResourceModelProcessor::build_with_state(
        request,
        responder,
        captures,
        model,
        state,
        registry.config(),
    ) {
        Ok(call) => call,
        Err(err) => return (map_failure(state, &err), None),
    };

    let mut response = match call.invoke() {
        Ok(reply) => into_response(state, model, &call, reply),
        Err(failure) => map_failure(state, &*failure),
    };

    for interceptor in state.interceptors() {
        if let Err(failure) = interceptor.post_call(&context, &response) {
            response = map_failure(state, &*failure);
            break;
        }
    }

    (response, Some(call.into_resources()))
}

fn into_response(
    state: &RegistryState,
    model: &ResourceModel,
    call: &CallDescriptor,
    reply: Reply,
) -> Response {
    let responder = call.responder();
    match reply {
        Reply::Empty => match call.streamer().filter(|s| s.is_used()) {
            Some(streamer) => {
                let mut response = responder.to_response().with_body(streamer.take_body());
                if let Some(value) = streamer
                    .content_type()
                    .and_then(|ct| HeaderValue::from_str(&ct).ok())
                {
                    response.headers.insert(CONTENT_TYPE, value);
                }
                response
            }
            None if !responder.has_body() && responder.status() == StatusCode::OK => {
                let mut response = responder.to_response();
                response.status = StatusCode::NO_CONTENT;
                response
            }
            None => responder.to_response(),
        },
        Reply::Text(text) => {
            with_default_type(responder.to_response(), "text/plain; charset=utf-8").with_body(text)
        }
        Reply::Bytes(bytes) => {
            with_default_type(responder.to_response(), APPLICATION_OCTET_STREAM).with_body(bytes)
        }
        Reply::Value(value) => {
            let media_type = model.produces().unwrap_or(APPLICATION_JSON);
            let converter = state.media_converter(Some(media_type));
            match converter.to_bytes(&value) {
                Ok(body) => with_default_type(responder.to_response(), media_type).with_body(body),
                Err(e) => {
                    error!(error = %e, media_type, "Failed to serialise handler result");
                    Response::json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
                }
            }
        }
        Reply::Response(response) => {
            responder.apply(response);
            responder.to_response()
        }
    }
}

fn with_default_type(mut response: Response, content_type: &str) -> Response {
    if !response.headers.contains_key(CONTENT_TYPE)
        && let Ok(value) = HeaderValue::from_str(content_type)
    {
        response.headers.insert(CONTENT_TYPE, value);
    }
    response
}

/// Response for a failure: its mapper's, or a bare 500
pub fn map_failure(state: &RegistryState, failure: &dyn Failure) -> Response {
    match state.exception_mapper(failure) {
        Some(mapper) => {
            debug!(kind = failure.kind().name(), mapper = mapper.name(), error = %failure, "Mapped failure");
            mapper.to_response(failure)
        }
        None => {
            error!(kind = failure.kind().name(), error = %failure, "No exception mapper for failure");
            Response::json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert;
    use crate::model::ParameterInfo;
    use crate::service::Microservice;
    use http::Method;

    struct Greeter;
    impl Microservice for Greeter {
        fn base_path(&self) -> Option<&str> {
            Some("/greet")
        }
    }

    fn greet_model() -> Arc<ResourceModel> {
        Arc::new(
            ResourceModel::builder(Arc::new(Greeter), "Greeter::hello")
                .route(Method::GET, "/greet/{name}")
                .param(ParameterInfo::path("name", convert::text()))
                .handler(|_, mut call| {
                    let name: String = call.args.take(0).ok().flatten().unwrap_or_default();
                    Ok(Reply::Text(format!("hello {name}")))
                }),
        )
    }

    #[test]
    fn test_text_reply() {
        let registry = MicroservicesRegistry::new();
        let captures = HashMap::from([("name".to_string(), "ada".to_string())]);
        let request = Request::new(Method::GET, "/greet/ada");
        let response = Dispatcher::dispatch(&registry, &greet_model(), &request, &captures);

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body_str(), Some("hello ada"));
        assert_eq!(response.header("content-type"), Some("text/plain; charset=utf-8"));
    }

    #[test]
    fn test_missing_path_variable_maps_to_bad_request() {
        let registry = MicroservicesRegistry::new();
        let request = Request::new(Method::GET, "/greet/");
        let response = Dispatcher::dispatch(&registry, &greet_model(), &request, &HashMap::new());

        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["status"], 400);
    }

    #[test]
    fn test_empty_reply_is_no_content() {
        let registry = MicroservicesRegistry::new();
        let model = Arc::new(
            ResourceModel::builder(Arc::new(Greeter), "Greeter::noop")
                .route(Method::POST, "/greet")
                .handler(|_, _| Ok(Reply::Empty)),
        );
        let request = Request::new(Method::POST, "/greet");
        let response = Dispatcher::dispatch(&registry, &model, &request, &HashMap::new());
        assert_eq!(response.status, StatusCode::NO_CONTENT);
    }
}
