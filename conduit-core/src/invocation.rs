// Call descriptors and handler results

use crate::exception::BoxFailure;
use crate::form::{FormParams, RequestResources};
use crate::http::{HttpStreamer, Responder, Response};
use crate::model::ResourceModel;
use crate::value::Arguments;
use bytes::Bytes;
use std::sync::Arc;

/// What a handler returns on success
#[derive(Debug)]
pub enum Reply {
    /// Nothing beyond what was written to the responder or streamer
    Empty,
    Text(String),
    Bytes(Bytes),
    /// Serialised by the media converter the route produces (JSON by default)
    Value(serde_json::Value),
    Response(Response),
}

impl Reply {
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Reply::Value)
    }
}

pub type HandlerResult = Result<Reply, BoxFailure>;

/// Everything a handler receives
#[derive(Debug)]
pub struct Invocation {
    pub args: Arguments,
    pub responder: Responder,
    /// Present when a parameter asked for the streaming helper
    pub streamer: Option<HttpStreamer>,
    /// Parsed form, when binding touched one
    pub form: Option<FormParams>,
}

/// A fully bound call, ready to run
pub struct CallDescriptor {
    model: Arc<ResourceModel>,
    args: Arguments,
    form_params: Option<FormParams>,
    responder: Responder,
    streamer: Option<HttpStreamer>,
    resources: RequestResources,
}

impl CallDescriptor {
    pub(crate) fn new(
        model: Arc<ResourceModel>,
        args: Arguments,
        form_params: Option<FormParams>,
        responder: Responder,
        streamer: Option<HttpStreamer>,
        resources: RequestResources,
    ) -> Self {
        Self {
            model,
            args,
            form_params,
            responder,
            streamer,
            resources,
        }
    }

    pub fn model(&self) -> &Arc<ResourceModel> {
        &self.model
    }

    pub fn method(&self) -> &str {
        self.model.name()
    }

    pub fn args(&self) -> &Arguments {
        &self.args
    }

    pub fn form_params(&self) -> Option<&FormParams> {
        self.form_params.as_ref()
    }

    pub fn responder(&self) -> &Responder {
        &self.responder
    }

    pub fn streamer(&self) -> Option<&HttpStreamer> {
        self.streamer.as_ref()
    }

    pub fn resources(&self) -> &RequestResources {
        &self.resources
    }

    /// Run the handler.
    ///
    /// The arguments move into the handler, so a second call sees an empty
    /// argument list. Temp resources stay with the descriptor.
    pub fn invoke(&mut self) -> HandlerResult {
        let invocation = Invocation {
            args: std::mem::take(&mut self.args),
            responder: self.responder.clone(),
            streamer: self.streamer.clone(),
            form: self.form_params.clone(),
        };
        self.model.call(invocation)
    }

    /// Give up the request's temp resources for deferred cleanup
    pub fn into_resources(self) -> RequestResources {
        self.resources
    }
}

impl std::fmt::Debug for CallDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallDescriptor")
            .field("method", &self.model.name())
            .field("args", &self.args)
            .field("streaming", &self.streamer.is_some())
            .field("temp_files", &self.resources.tracked_files().len())
            .finish()
    }
}
