// Request and response filters

use crate::exception::BoxFailure;
use crate::http::{Request, Responder, Response};
use crate::interceptor::Flow;

/// Runs before interceptors and binding.
///
/// Returning [`Flow::Halt`] answers the request with whatever was written to
/// the responder.
pub trait RequestFilter: Send + Sync {
    fn filter(&self, request: &Request, responder: &Responder) -> Result<Flow, BoxFailure>;
}

/// Runs on the finished response, including mapped failures
pub trait ResponseFilter: Send + Sync {
    fn filter(&self, request: &Request, response: &mut Response) -> Result<(), BoxFailure>;
}

impl<F> RequestFilter for F
where
    F: Fn(&Request, &Responder) -> Result<Flow, BoxFailure> + Send + Sync,
{
    fn filter(&self, request: &Request, responder: &Responder) -> Result<Flow, BoxFailure> {
        self(request, responder)
    }
}
