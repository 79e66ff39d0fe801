// Core of the Conduit microservice dispatch layer
// Registry, argument binding, context providers, multipart extraction and
// the dispatcher that ties them together. Route matching and the transport
// live outside this crate.

pub mod config;
pub mod context;
pub mod convert;
pub mod dispatcher;
pub mod error;
pub mod exception;
pub mod filter;
pub mod form;
pub mod http;
pub mod interceptor;
pub mod invocation;
pub mod logging;
pub mod media;
pub mod metadata;
pub mod model;
pub mod processor;
pub mod registry;
pub mod service;
pub mod value;

// Re-export commonly used types
pub use crate::config::DispatchConfig;
pub use crate::context::{
    ContextError, ContextField, ContextKey, ContextProvider, EmptyContextProvider,
    FnContextProvider, HttpMethodContext, ProviderLookup,
};
pub use crate::convert::{ByteStream, ConvertFailure, ParamConverter};
pub use crate::dispatcher::Dispatcher;
pub use crate::error::*;
pub use crate::exception::{
    ANY_FAILURE, BoxFailure, DispatchErrorMapper, ExceptionMapper, Failure, FailureKind,
    MapperTable,
};
pub use crate::filter::{RequestFilter, ResponseFilter};
pub use crate::form::{
    FileInfo, FormFile, FormItem, FormLimits, FormParams, FormState, FormValue, MultipartBody,
    MultipartParser, RequestResources,
};
pub use crate::http::{HttpStreamer, Request, RequestBuilder, Responder, Response};
pub use crate::interceptor::{Flow, Interceptor, InterceptorContext, LoggingInterceptor};
pub use crate::invocation::{CallDescriptor, HandlerResult, Invocation, Reply};
pub use crate::logging::{LogConfig, LogFormat, LogLevel, LogOutput, LogSettings, Rotation};
pub use crate::media::{ConverterRegistry, MediaTypeConverter};
pub use crate::metadata::MicroserviceMetadata;
pub use crate::model::{ParamSource, ParameterInfo, ResourceModel, ResourceModelBuilder};
pub use crate::processor::ResourceModelProcessor;
pub use crate::registry::{MicroservicesRegistry, RegistryState};
pub use crate::service::{LifecycleResult, Microservice};
pub use crate::value::{Arg, ArgumentError, Arguments, TypeKey};
