// Conduit - a microservice dispatch layer for Rust
//
// Deploys services into a registry, binds request data to resource method
// parameters, supplies custom context objects and runs every call through
// filters, interceptors and exception mappers.

// Re-export core functionality
pub use conduit_core::*;

/// Everything needed to declare services and dispatch requests to them.
///
/// The `http` module is left out so the `http` crate stays usable next to a
/// glob import of the prelude.
///
/// ```
/// use conduit::prelude::*;
/// use std::sync::Arc;
///
/// struct Health;
/// impl Microservice for Health {
///     fn base_path(&self) -> Option<&str> {
///         Some("/health")
///     }
/// }
///
/// let registry = MicroservicesRegistry::new();
/// registry.add_service("/health", Arc::new(Health));
/// assert_eq!(registry.service_count(), 1);
/// ```
pub mod prelude {
    pub use conduit_core::convert;
    pub use conduit_core::{
        Arg, Arguments, BindingFailure, BoxFailure, ByteStream, CallDescriptor, ContextError,
        ContextField, ContextKey, ContextProvider, DispatchConfig, DispatchError, Dispatcher,
        ExceptionMapper, Failure, FailureKind, FileInfo, Flow, FnContextProvider, FormFile,
        FormParams, HandlerResult, HttpMethodContext, HttpStreamer, Interceptor,
        InterceptorContext, Invocation, LifecycleResult, Microservice, MicroservicesRegistry,
        MultipartBody, ParameterInfo, RegistryError, Reply, Request, RequestFilter, ResourceModel,
        ResourceModelProcessor, Responder, Response, ResponseFilter, TypeKey,
    };
}
