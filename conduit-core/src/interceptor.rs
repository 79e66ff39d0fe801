// Interceptors around resource method invocation

use crate::exception::BoxFailure;
use crate::http::{Request, Responder, Response};
use crate::service::Microservice;

/// Whether the chain goes on to the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Stop here; the responder holds the response
    Halt,
}

/// What an interceptor sees of the call
pub struct InterceptorContext<'a> {
    pub request: &'a Request,
    pub responder: &'a Responder,
    pub service: &'a dyn Microservice,
    /// Resource method, e.g. `UserService::get`
    pub method: &'a str,
}

/// Runs before and after every resource method.
///
/// `pre_call` hooks run in registration order; `post_call` hooks run in the
/// same order once a response exists.
pub trait Interceptor: Send + Sync {
    fn pre_call(&self, _context: &InterceptorContext<'_>) -> Result<Flow, BoxFailure> {
        Ok(Flow::Continue)
    }

    fn post_call(
        &self,
        _context: &InterceptorContext<'_>,
        _response: &Response,
    ) -> Result<(), BoxFailure> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Interceptor that logs every call at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn pre_call(&self, context: &InterceptorContext<'_>) -> Result<Flow, BoxFailure> {
        tracing::debug!(
            method = context.method,
            request = %context.request.request_line(),
            "→ invoking resource method"
        );
        Ok(Flow::Continue)
    }

    fn post_call(
        &self,
        context: &InterceptorContext<'_>,
        response: &Response,
    ) -> Result<(), BoxFailure> {
        tracing::debug!(
            method = context.method,
            status = response.status.as_u16(),
            "← resource method returned"
        );
        Ok(())
    }
}
