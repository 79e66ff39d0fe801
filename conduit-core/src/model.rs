//! Resource models: per-route binding directives
//!
//! A [`ResourceModel`] is built once, when a service registers its routes,
//! and is read-only afterwards. It names the handler, lists one
//! [`ParameterInfo`] per argument, the service fields to inject and an
//! optional method-level context directive.
//!
//! ```
//! use std::sync::Arc;
//! use conduit_core::convert;
//! use conduit_core::invocation::Reply;
//! use conduit_core::model::{ParameterInfo, ResourceModel};
//! use conduit_core::service::Microservice;
//! use http::Method;
//!
//! struct Users;
//! impl Microservice for Users {}
//!
//! let model = ResourceModel::builder(Arc::new(Users), "Users::get")
//!     .route(Method::GET, "/users/{id}")
//!     .param(ParameterInfo::path("id", convert::scalar::<u64>()))
//!     .param(ParameterInfo::query("verbose", convert::scalar::<bool>()).with_default("false"))
//!     .handler(|_users, mut call| {
//!         let id: u64 = call.args.take(0).unwrap_or_default().unwrap_or_default();
//!         Ok(Reply::Text(format!("user {id}")))
//!     });
//! assert_eq!(model.params().len(), 2);
//! ```

use crate::context::{ContextField, ContextKey};
use crate::convert::ParamConverter;
use crate::invocation::{HandlerResult, Invocation};
use crate::service::Microservice;
use crate::value::{Arg, TypeKey};
use http::Method;
use std::fmt;
use std::sync::Arc;

/// Where a parameter's value comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamSource {
    Path,
    Query,
    Header,
    Cookie,
    Form,
    FormData,
    /// Built-in framework objects selected by declared type
    Context,
    /// Values built by a registered context provider
    CustomContext,
    Body,
}

impl fmt::Display for ParamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamSource::Path => "PATH",
            ParamSource::Query => "QUERY",
            ParamSource::Header => "HEADER",
            ParamSource::Cookie => "COOKIE",
            ParamSource::Form => "FORM",
            ParamSource::FormData => "FORM_DATA",
            ParamSource::Context => "CONTEXT",
            ParamSource::CustomContext => "CUSTOM_CONTEXT",
            ParamSource::Body => "BODY",
        };
        f.write_str(name)
    }
}

/// Binding directive of one handler argument
#[derive(Clone)]
pub struct ParameterInfo {
    source: ParamSource,
    key: Option<String>,
    default_value: Option<String>,
    qualifier: Option<String>,
    target: TypeKey,
    converter: Option<Arc<dyn ParamConverter>>,
}

impl ParameterInfo {
    fn keyed(source: ParamSource, key: &str, converter: Arc<dyn ParamConverter>) -> Self {
        Self {
            source,
            key: Some(key.to_string()),
            default_value: None,
            qualifier: None,
            target: converter.target(),
            converter: Some(converter),
        }
    }

    pub fn path(key: &str, converter: Arc<dyn ParamConverter>) -> Self {
        Self::keyed(ParamSource::Path, key, converter)
    }

    pub fn query(key: &str, converter: Arc<dyn ParamConverter>) -> Self {
        Self::keyed(ParamSource::Query, key, converter)
    }

    pub fn header(key: &str, converter: Arc<dyn ParamConverter>) -> Self {
        Self::keyed(ParamSource::Header, key, converter)
    }

    pub fn cookie(key: &str, converter: Arc<dyn ParamConverter>) -> Self {
        Self::keyed(ParamSource::Cookie, key, converter)
    }

    pub fn form(key: &str, converter: Arc<dyn ParamConverter>) -> Self {
        Self::keyed(ParamSource::Form, key, converter)
    }

    pub fn form_data(key: &str, converter: Arc<dyn ParamConverter>) -> Self {
        Self::keyed(ParamSource::FormData, key, converter)
    }

    /// The request body, decoded by the media converter for its content type
    pub fn body(converter: Arc<dyn ParamConverter>) -> Self {
        Self {
            source: ParamSource::Body,
            key: None,
            default_value: None,
            qualifier: None,
            target: converter.target(),
            converter: Some(converter),
        }
    }

    /// A built-in object: `Request`, `Responder`, `HttpStreamer`,
    /// `MultipartBody` or `FormParams`
    pub fn context<T: 'static>() -> Self {
        Self {
            source: ParamSource::Context,
            key: None,
            default_value: None,
            qualifier: None,
            target: TypeKey::of::<T>(),
            converter: None,
        }
    }

    /// A value from the context provider registered for `T`
    pub fn custom_context<T: 'static>() -> Self {
        Self {
            source: ParamSource::CustomContext,
            ..Self::context::<T>()
        }
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    pub fn source(&self) -> ParamSource {
        self.source
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Name used in diagnostics: the binding key, else the declared type
    pub fn display_key(&self) -> &str {
        self.key.as_deref().unwrap_or(self.target.name())
    }

    pub fn default_value(&self) -> Option<&str> {
        self.default_value.as_deref()
    }

    pub fn qualifier(&self) -> Option<&str> {
        self.qualifier.as_deref()
    }

    pub fn target(&self) -> TypeKey {
        self.target
    }

    pub fn converter(&self) -> Option<&Arc<dyn ParamConverter>> {
        self.converter.as_ref()
    }

    /// Provider key for this parameter's declared type and qualifier
    pub fn context_key(&self) -> ContextKey {
        ContextKey::new(self.target, self.qualifier.as_deref())
    }
}

impl fmt::Debug for ParameterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterInfo")
            .field("source", &self.source)
            .field("key", &self.key)
            .field("default_value", &self.default_value)
            .field("qualifier", &self.qualifier)
            .field("target", &self.target)
            .finish()
    }
}

type Injector = Arc<dyn Fn(Arg) -> Result<(), String> + Send + Sync>;

/// A service field filled by a context provider before every call
#[derive(Clone)]
pub struct FieldInfo {
    name: &'static str,
    declared: TypeKey,
    qualifier: Option<String>,
    inject: Injector,
}

impl FieldInfo {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn declared(&self) -> TypeKey {
        self.declared
    }

    pub fn context_key(&self) -> ContextKey {
        ContextKey::new(self.declared, self.qualifier.as_deref())
    }

    /// Store a produced value into the field
    pub fn inject(&self, value: Arg) -> Result<(), String> {
        (self.inject)(value)
    }
}

impl fmt::Debug for FieldInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldInfo")
            .field("name", &self.name)
            .field("declared", &self.declared)
            .field("qualifier", &self.qualifier)
            .finish()
    }
}

/// Method-level custom-context directive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodContext {
    pub qualifier: Option<String>,
}

pub type Handler = Arc<dyn Fn(Invocation) -> HandlerResult + Send + Sync>;

/// Immutable descriptor of one route
#[derive(Clone)]
pub struct ResourceModel {
    name: String,
    http_method: Method,
    path: String,
    produces: Option<String>,
    service: Arc<dyn Microservice>,
    params: Vec<ParameterInfo>,
    fields: Vec<FieldInfo>,
    method_context: Option<MethodContext>,
    handler: Handler,
}

impl ResourceModel {
    pub fn builder<S: Microservice>(service: Arc<S>, name: impl Into<String>) -> ResourceModelBuilder<S> {
        ResourceModelBuilder {
            service,
            name: name.into(),
            http_method: Method::GET,
            path: "/".to_string(),
            produces: None,
            params: Vec::new(),
            fields: Vec::new(),
            method_context: None,
        }
    }

    /// Resource method name, e.g. `UserService::get`
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn http_method(&self) -> &Method {
        &self.http_method
    }

    /// Route template relative to the service base path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Media type for value replies; JSON when unset
    pub fn produces(&self) -> Option<&str> {
        self.produces.as_deref()
    }

    pub fn service(&self) -> &Arc<dyn Microservice> {
        &self.service
    }

    pub fn params(&self) -> &[ParameterInfo] {
        &self.params
    }

    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    pub fn method_context(&self) -> Option<&MethodContext> {
        self.method_context.as_ref()
    }

    pub fn call(&self, invocation: Invocation) -> HandlerResult {
        (self.handler)(invocation)
    }
}

impl fmt::Debug for ResourceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceModel")
            .field("name", &self.name)
            .field("http_method", &self.http_method)
            .field("path", &self.path)
            .field("service", &self.service.name())
            .field("params", &self.params)
            .field("fields", &self.fields)
            .field("method_context", &self.method_context)
            .finish()
    }
}

pub struct ResourceModelBuilder<S> {
    service: Arc<S>,
    name: String,
    http_method: Method,
    path: String,
    produces: Option<String>,
    params: Vec<ParameterInfo>,
    fields: Vec<FieldInfo>,
    method_context: Option<MethodContext>,
}

impl<S: Microservice> ResourceModelBuilder<S> {
    pub fn route(mut self, method: Method, path: impl Into<String>) -> Self {
        self.http_method = method;
        self.path = path.into();
        self
    }

    pub fn produces(mut self, media_type: impl Into<String>) -> Self {
        self.produces = Some(media_type.into());
        self
    }

    /// Append the directive for the next argument
    pub fn param(mut self, param: ParameterInfo) -> Self {
        self.params.push(param);
        self
    }

    /// Inject a context value into a service field before each call.
    ///
    /// `accessor` may reach private fields when written next to `S`.
    pub fn context_field<T: Send + Sync + 'static>(
        mut self,
        name: &'static str,
        qualifier: Option<&str>,
        accessor: fn(&S) -> &ContextField<T>,
    ) -> Self {
        let service = Arc::clone(&self.service);
        let inject: Injector = Arc::new(move |value: Arg| {
            let value = value
                .take::<T>()
                .map_err(|other| format!("provider produced {}", other.type_name()))?;
            accessor(&*service).set(value);
            Ok(())
        });
        self.fields.push(FieldInfo {
            name,
            declared: TypeKey::of::<T>(),
            qualifier: qualifier.map(str::to_owned),
            inject,
        });
        self
    }

    /// Resolve every argument through context providers instead of the
    /// per-parameter directives
    pub fn method_context(mut self, qualifier: Option<&str>) -> Self {
        self.method_context = Some(MethodContext {
            qualifier: qualifier.map(str::to_owned),
        });
        self
    }

    pub fn handler<F>(self, handler: F) -> ResourceModel
    where
        F: Fn(&S, Invocation) -> HandlerResult + Send + Sync + 'static,
    {
        let typed = Arc::clone(&self.service);
        let service: Arc<dyn Microservice> = self.service;
        ResourceModel {
            name: self.name,
            http_method: self.http_method,
            path: self.path,
            produces: self.produces,
            service,
            params: self.params,
            fields: self.fields,
            method_context: self.method_context,
            handler: Arc::new(move |invocation| handler(&*typed, invocation)),
        }
    }
}
