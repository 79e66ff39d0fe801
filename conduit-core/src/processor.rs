//! Argument binding
//!
//! [`ResourceModelProcessor`] turns a matched route and an incoming request
//! into a [`CallDescriptor`]: it injects context fields into the service,
//! binds every parameter from its declared source, applies a method-level
//! context directive and hands over the per-request temp resources.
//!
//! Binding works against one registry snapshot, so a registry change made
//! while a request is being bound never produces a mix of old and new
//! providers or converters.

use crate::config::DispatchConfig;
use crate::context::{ContextKey, HttpMethodContext};
use crate::convert::{ConvertFailure, ParamConverter};
use crate::error::{BindingFailure, DispatchError, FormError};
use crate::form::{FormParams, FormState, MultipartBody, RequestResources};
use crate::http::{HttpStreamer, Request, Responder};
use crate::invocation::CallDescriptor;
use crate::media::TEXT_PLAIN;
use crate::model::{ParamSource, ParameterInfo, ResourceModel};
use crate::registry::{MicroservicesRegistry, RegistryState};
use crate::value::{Arg, Arguments, TypeKey};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

type BindResult = Result<Arg, BindingFailure>;

/// Per-request binding state
pub struct ResourceModelProcessor<'a> {
    request: &'a Request,
    responder: &'a Responder,
    captures: &'a HashMap<String, String>,
    model: &'a Arc<ResourceModel>,
    state: &'a RegistryState,
    config: &'a DispatchConfig,
    query: Option<FormParams>,
    form: Option<FormState>,
    streamer: Option<HttpStreamer>,
    resources: RequestResources,
}

impl<'a> ResourceModelProcessor<'a> {
    /// Bind `model` against `request`.
    ///
    /// `captures` are the path variables the router matched. Temp files
    /// written for multipart uploads travel with the descriptor; when binding
    /// fails they are removed before the error is returned.
    pub fn build_invocation(
        request: &Request,
        responder: &Responder,
        captures: &HashMap<String, String>,
        model: &Arc<ResourceModel>,
        registry: &MicroservicesRegistry,
    ) -> Result<CallDescriptor, DispatchError> {
        let state = registry.snapshot();
        Self::build_with_state(request, responder, captures, model, &state, registry.config())
    }

    /// Like [`ResourceModelProcessor::build_invocation`], against an explicit
    /// snapshot and configuration
    pub fn build_with_state(
        request: &Request,
        responder: &Responder,
        captures: &HashMap<String, String>,
        model: &Arc<ResourceModel>,
        state: &RegistryState,
        config: &DispatchConfig,
    ) -> Result<CallDescriptor, DispatchError> {
        let processor = ResourceModelProcessor {
            request,
            responder,
            captures,
            model,
            state,
            config,
            query: None,
            form: None,
            streamer: None,
            resources: RequestResources::new(config.temp_root.clone()),
        };
        processor.build().map_err(|cause| {
            debug!(
                method = model.name(),
                request = %request.request_line(),
                error = %cause,
                "Argument binding failed"
            );
            DispatchError::new(model.name(), request.request_line(), cause)
        })
    }

    fn build(mut self) -> Result<CallDescriptor, BindingFailure> {
        let model = self.model;
        self.inject_fields()?;

        let mut args = Vec::with_capacity(model.params().len());
        for param in model.params() {
            let arg = self.bind(param)?;
            trace!(source = %param.source(), key = param.display_key(), value = ?arg, "Bound parameter");
            args.push(arg);
        }
        let mut args = Arguments::new(args);

        if let Some(directive) = model.method_context() {
            for (index, param) in model.params().iter().enumerate() {
                let key = ContextKey::new(param.target(), directive.qualifier.as_deref());
                let arg = self.provide(&key, param.target())?;
                args.replace(index, arg);
            }
        }

        Ok(CallDescriptor::new(
            Arc::clone(model),
            args,
            self.form.map(FormState::into_params),
            self.responder.clone(),
            self.streamer,
            self.resources,
        ))
    }

    fn http_context(&self) -> HttpMethodContext<'_> {
        HttpMethodContext {
            method: self.model.name(),
            handler: &**self.model.service(),
            request: self.request,
            responder: self.responder,
        }
    }

    fn inject_fields(&self) -> Result<(), BindingFailure> {
        for field in self.model.fields() {
            let key = field.context_key();
            let value = self.provide(&key, field.declared())?;
            field.inject(value).map_err(|reason| BindingFailure::Binding {
                target: format!("{}.{}", self.model.service().name(), field.name()),
                reason,
            })?;
            trace!(field = field.name(), key = %key, "Injected context field");
        }
        Ok(())
    }

    /// Run the provider registered for `key`, checking what it produced
    fn provide(&self, key: &ContextKey, expected: TypeKey) -> BindResult {
        let lookup = self.state.context_provider(key);
        let value = lookup
            .provide(key, &self.http_context())
            .map_err(|e| BindingFailure::Binding {
                target: key.to_string(),
                reason: e.to_string(),
            })?;
        if !value.is_absent() && !value.holds(&expected) {
            return Err(BindingFailure::Binding {
                target: key.to_string(),
                reason: format!("provider produced {}, expected {}", value.type_name(), expected),
            });
        }
        Ok(value)
    }

    fn bind(&mut self, param: &ParameterInfo) -> BindResult {
        match param.source() {
            ParamSource::Path => {
                let raw = param
                    .key()
                    .and_then(|key| self.captures.get(key))
                    .cloned()
                    .or_else(|| param.default_value().map(str::to_owned));
                match raw {
                    Some(value) => convert(param, Some(&[value])),
                    None => Err(missing(param)),
                }
            }
            ParamSource::Query => {
                let values = self.query()?.texts(param.key().unwrap_or_default());
                convert(param, with_default(values, param).as_deref())
            }
            ParamSource::Header => {
                let raw = param
                    .key()
                    .and_then(|key| self.request.header(key))
                    .filter(|value| !value.is_empty())
                    .map(str::to_owned)
                    .or_else(|| param.default_value().map(str::to_owned));
                convert(param, raw.map(|v| vec![v]).as_deref())
            }
            ParamSource::Cookie => self.bind_cookie(param),
            ParamSource::Context => self.bind_builtin(param),
            ParamSource::CustomContext => self.provide(&param.context_key(), param.target()),
            ParamSource::Form => self.bind_form(param, false),
            ParamSource::FormData => self.bind_form(param, true),
            ParamSource::Body => {
                let converter = converter_of(param)?;
                let content_type = self
                    .request
                    .content_type()
                    .unwrap_or(&self.config.default_media_type);
                let media = self.state.media_converter(Some(content_type));
                converter
                    .convert_body(&*media, &self.request.full_body())
                    .map_err(|failure| conversion(param, failure))
            }
        }
    }

    /// A request without a `Cookie` header binds an absent value unless
    /// configured otherwise; a header lacking the key falls back to the
    /// default.
    fn bind_cookie(&self, param: &ParameterInfo) -> BindResult {
        let key = param.key().unwrap_or_default();
        let Some(header) = self.request.cookie_header() else {
            if self.config.cookie_default_without_header
                && let Some(default) = param.default_value()
            {
                return convert(param, Some(&[default.to_owned()]));
            }
            return Ok(Arg::absent());
        };

        let raw = header
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| name.trim() == key)
            .map(|(_, value)| value.trim().to_owned())
            .or_else(|| param.default_value().map(str::to_owned));
        convert(param, raw.map(|v| vec![v]).as_deref())
    }

    fn bind_builtin(&mut self, param: &ParameterInfo) -> BindResult {
        let target = param.target();
        if target.is::<Request>() {
            Ok(Arg::new(self.request.clone()))
        } else if target.is::<Responder>() {
            Ok(Arg::new(self.responder.clone()))
        } else if target.is::<HttpStreamer>() {
            let streamer = self.streamer.get_or_insert_with(HttpStreamer::new);
            Ok(Arg::new(streamer.clone()))
        } else if target.is::<MultipartBody>() {
            let limits = self.config.form_limits();
            Ok(Arg::new(MultipartBody::from_request(self.request, limits)?))
        } else if target.is::<FormParams>() {
            if self.is_form_request() {
                Ok(Arg::new(self.form()?.params().clone()))
            } else {
                Ok(Arg::new(self.query()?.clone()))
            }
        } else {
            Err(BindingFailure::UnresolvedContextType {
                type_name: target.name(),
            })
        }
    }

    fn bind_form(&mut self, param: &ParameterInfo, form_data: bool) -> BindResult {
        let converter = Arc::clone(converter_of(param)?);
        let key = param.key().unwrap_or_default();

        let (files, mut texts, part_type) = {
            let form = self.form()?;
            (
                form.params().files(key),
                form.params().texts(key),
                form.content_type(key).map(str::to_owned),
            )
        };

        if !files.is_empty() {
            if let Some(result) = converter.convert_files(&files) {
                return result.map_err(|failure| conversion(param, failure));
            }
            if form_data {
                // A file part bound to a non-file target goes through the
                // media converter of its content type.
                let media = self.state.media_converter(part_type.as_deref());
                let data = files[0].read().map_err(FormError::Io)?;
                return converter
                    .convert_body(&*media, &data)
                    .map_err(|failure| conversion(param, failure));
            }
            // Plain form fields read every part as text, uploads included.
            for file in &files {
                let data = file.read().map_err(FormError::Io)?;
                let text = String::from_utf8(data).map_err(|_| {
                    conversion(param, ConvertFailure::invalid("file part is not valid UTF-8"))
                })?;
                texts.push(text);
            }
        }

        // Text parts and url-encoded fields keep every value; other part
        // types hold a single document for the media converter.
        let plain_text = part_type.as_deref().is_none_or(|media| media == TEXT_PLAIN);
        if form_data && !plain_text && let Some(text) = texts.first() {
            let media = self.state.media_converter(part_type.as_deref());
            return converter
                .convert_body(&*media, text.as_bytes())
                .map_err(|failure| conversion(param, failure));
        }

        convert(param, with_default(texts, param).as_deref())
    }

    fn is_form_request(&self) -> bool {
        self.request.media_type().is_some_and(|media_type| {
            media_type == crate::media::MULTIPART_FORM_DATA
                || media_type == crate::media::APPLICATION_FORM_URLENCODED
        })
    }

    /// The request's form, parsed on first use
    fn form(&mut self) -> Result<&FormState, BindingFailure> {
        if self.form.is_none() {
            let state =
                FormState::extract(self.request, self.config.form_limits(), &mut self.resources)?;
            self.form = Some(state);
        }
        Ok(self.form.get_or_insert_with(FormState::default))
    }

    fn query(&mut self) -> Result<&FormParams, BindingFailure> {
        if self.query.is_none() {
            let raw = self.request.query_string().unwrap_or_default();
            self.query = Some(FormParams::from_urlencoded(raw.as_bytes())?);
        }
        Ok(self.query.get_or_insert_with(FormParams::default))
    }
}

fn converter_of(param: &ParameterInfo) -> Result<&Arc<dyn ParamConverter>, BindingFailure> {
    param.converter().ok_or_else(|| BindingFailure::Binding {
        target: param.display_key().to_string(),
        reason: format!("{} parameter has no converter", param.source()),
    })
}

/// Values found for a parameter, or its default as a single value
fn with_default(values: Vec<String>, param: &ParameterInfo) -> Option<Vec<String>> {
    if values.is_empty() {
        param.default_value().map(|default| vec![default.to_owned()])
    } else {
        Some(values)
    }
}

fn convert(param: &ParameterInfo, raw: Option<&[String]>) -> BindResult {
    let converter = converter_of(param)?;
    converter
        .convert(raw)
        .map_err(|failure| conversion(param, failure))
}

fn missing(param: &ParameterInfo) -> BindingFailure {
    BindingFailure::MissingParameter {
        key: param.display_key().to_string(),
    }
}

fn conversion(param: &ParameterInfo, failure: ConvertFailure) -> BindingFailure {
    match failure {
        ConvertFailure::Missing => missing(param),
        ConvertFailure::Invalid(reason) => BindingFailure::Conversion {
            key: param.display_key().to_string(),
            target: param.target().name(),
            reason,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert;
    use crate::invocation::Reply;
    use crate::service::Microservice;
    use http::Method;

    struct Echo;
    impl Microservice for Echo {}

    fn model(params: Vec<ParameterInfo>) -> Arc<ResourceModel> {
        let mut builder = ResourceModel::builder(Arc::new(Echo), "Echo::call").route(Method::GET, "/echo");
        for param in params {
            builder = builder.param(param);
        }
        Arc::new(builder.handler(|_, _| Ok(Reply::Empty)))
    }

    fn bind(
        request: &Request,
        params: Vec<ParameterInfo>,
    ) -> Result<CallDescriptor, DispatchError> {
        let registry = MicroservicesRegistry::new();
        ResourceModelProcessor::build_invocation(
            request,
            &Responder::new(),
            &HashMap::new(),
            &model(params),
            &registry,
        )
    }

    #[test]
    fn test_query_repeated_values() {
        let request = Request::new(Method::GET, "/echo?tag=a&tag=b");
        let call = bind(&request, vec![ParameterInfo::query("tag", convert::list::<String>())]).unwrap();
        assert_eq!(
            call.args().get_as::<Vec<String>>(0),
            Some(&vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_header_default_when_empty() {
        let request = Request::builder()
            .uri("/echo")
            .header("x-page", "")
            .build()
            .unwrap();
        let call = bind(
            &request,
            vec![ParameterInfo::header("x-page", convert::scalar::<u32>()).with_default("3")],
        )
        .unwrap();
        assert_eq!(call.args().get_as::<u32>(0), Some(&3));
    }

    #[test]
    fn test_unknown_builtin_context() {
        struct Unknown;
        let request = Request::new(Method::GET, "/echo");
        let err = bind(&request, vec![ParameterInfo::context::<Unknown>()]).unwrap_err();
        assert!(matches!(err.cause(), BindingFailure::UnresolvedContextType { .. }));
        assert!(err.is_server_error());
    }

    #[test]
    fn test_streamer_handed_to_descriptor() {
        let request = Request::new(Method::GET, "/echo");
        let call = bind(&request, vec![ParameterInfo::context::<HttpStreamer>()]).unwrap();
        assert!(call.streamer().is_some());
        assert!(call.args().get(0).is_some_and(|arg| arg.is::<HttpStreamer>()));
    }

    #[test]
    fn test_form_params_from_query_when_not_a_form() {
        let request = Request::new(Method::GET, "/echo?q=rust");
        let call = bind(&request, vec![ParameterInfo::context::<FormParams>()]).unwrap();
        let params = call.args().get_as::<FormParams>(0).unwrap();
        assert_eq!(params.first_text("q"), Some("rust"));
        assert!(call.form_params().is_none());
    }
}
