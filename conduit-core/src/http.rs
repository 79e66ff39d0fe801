// HTTP request, response sink and streaming helper

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_TYPE, COOKIE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Inbound request as handed over by the transport.
///
/// Method, URI and headers are already parsed; the body is kept as the
/// sequence of buffers it arrived in.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    uri: String,
    version: Version,
    headers: HeaderMap,
    body: Vec<Bytes>,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// URI without the query string
    pub fn path(&self) -> &str {
        match self.uri.split_once('?') {
            Some((path, _)) => path,
            None => &self.uri,
        }
    }

    pub fn query_string(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, query)| query)
    }

    /// First value of the named header, if it is valid text
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn raw_headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn cookie_header(&self) -> Option<&str> {
        self.headers.get(COOKIE).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Lower-cased media type without parameters, e.g. `multipart/form-data`
    pub fn media_type(&self) -> Option<String> {
        self.content_type().map(media_type_essence)
    }

    pub fn body_buffers(&self) -> &[Bytes] {
        &self.body
    }

    pub fn body_len(&self) -> usize {
        self.body.iter().map(Bytes::len).sum()
    }

    /// The whole body as one buffer
    pub fn full_body(&self) -> Bytes {
        match self.body.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            many => {
                let mut merged = BytesMut::with_capacity(self.body_len());
                for chunk in many {
                    merged.extend_from_slice(chunk);
                }
                merged.freeze()
            }
        }
    }

    /// `GET /users/42 HTTP/1.1`
    pub fn request_line(&self) -> String {
        format!("{} {} {:?}", self.method, self.uri, self.version)
    }
}

impl From<http::Request<Bytes>> for Request {
    fn from(req: http::Request<Bytes>) -> Self {
        let (parts, body) = req.into_parts();
        let body = if body.is_empty() { Vec::new() } else { vec![body] };
        Self {
            method: parts.method,
            uri: parts.uri.to_string(),
            version: parts.version,
            headers: parts.headers,
            body,
        }
    }
}

/// Lower-cased media type with parameters stripped
pub fn media_type_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Builder for [`Request`]; header errors are reported by [`RequestBuilder::build`]
#[derive(Debug, Default)]
pub struct RequestBuilder {
    method: Method,
    uri: String,
    headers: HeaderMap,
    body: Vec<Bytes>,
    error: Option<http::Error>,
}

impl RequestBuilder {
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    /// Append a header value
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if self.error.is_some() {
            return self;
        }
        let name = match HeaderName::from_bytes(name.as_bytes()) {
            Ok(name) => name,
            Err(e) => {
                self.error = Some(e.into());
                return self;
            }
        };
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.append(name, value);
            }
            Err(e) => self.error = Some(e.into()),
        }
        self
    }

    pub fn content_type(self, value: &str) -> Self {
        self.header(CONTENT_TYPE.as_str(), value)
    }

    /// Append a body buffer
    pub fn chunk(mut self, chunk: impl Into<Bytes>) -> Self {
        self.body.push(chunk.into());
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = vec![body.into()];
        self
    }

    pub fn build(self) -> Result<Request, http::Error> {
        if let Some(err) = self.error {
            return Err(err);
        }
        Ok(Request {
            method: self.method,
            uri: self.uri,
            version: Version::HTTP_11,
            headers: self.headers,
            body: self.body,
        })
    }
}

/// Outgoing HTTP response
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    pub fn no_content() -> Self {
        Self::new(StatusCode::NO_CONTENT)
    }

    pub fn bad_request() -> Self {
        Self::new(StatusCode::BAD_REQUEST)
    }

    pub fn internal_server_error() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_header(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        )
        .with_body(text.into())
    }

    pub fn with_json<T: Serialize>(mut self, value: &T) -> Result<Self, serde_json::Error> {
        self.body = Bytes::from(serde_json::to_vec(value)?);
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(self)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// `{"status": <code>, "error": <message>}` with the given status
    pub fn json_error(status: StatusCode, message: &str) -> Self {
        let body = serde_json::json!({
            "status": status.as_u16(),
            "error": message,
        });
        Self::new(status)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_body(body.to_string())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

#[derive(Debug)]
struct ResponseParts {
    status: StatusCode,
    headers: HeaderMap,
    body: Option<Bytes>,
}

/// Response sink shared between the transport, the handler and filters.
///
/// Clones refer to the same response.
#[derive(Debug, Clone)]
pub struct Responder {
    parts: Arc<Mutex<ResponseParts>>,
}

impl Default for Responder {
    fn default() -> Self {
        Self::new()
    }
}

impl Responder {
    pub fn new() -> Self {
        Self {
            parts: Arc::new(Mutex::new(ResponseParts {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: None,
            })),
        }
    }

    pub fn set_status(&self, status: StatusCode) {
        self.parts.lock().status = status;
    }

    pub fn status(&self) -> StatusCode {
        self.parts.lock().status
    }

    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) {
        self.parts.lock().headers.insert(name, value);
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.parts
            .lock()
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    }

    pub fn set_body(&self, body: impl Into<Bytes>) {
        self.parts.lock().body = Some(body.into());
    }

    pub fn has_body(&self) -> bool {
        self.parts.lock().body.is_some()
    }

    /// Snapshot of the response as currently set
    pub fn to_response(&self) -> Response {
        let parts = self.parts.lock();
        Response {
            status: parts.status,
            headers: parts.headers.clone(),
            body: parts.body.clone().unwrap_or_default(),
        }
    }

    /// Copy status, headers and body of `response` into this sink
    pub fn apply(&self, response: Response) {
        let mut parts = self.parts.lock();
        parts.status = response.status;
        for (name, value) in response.headers.iter() {
            parts.headers.insert(name.clone(), value.clone());
        }
        parts.body = Some(response.body);
    }
}

/// Returned when writing to a streamer that was already finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stream already finished")]
pub struct StreamClosed;

#[derive(Debug, Default)]
struct StreamState {
    content_type: Option<String>,
    chunks: Vec<Bytes>,
    finished: bool,
}

/// Streaming helper handed to handlers that write their response in chunks.
///
/// Chunks are buffered until the dispatcher finishes the response.
#[derive(Debug, Clone, Default)]
pub struct HttpStreamer {
    state: Arc<Mutex<StreamState>>,
}

impl HttpStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_content_type(&self, content_type: impl Into<String>) {
        self.state.lock().content_type = Some(content_type.into());
    }

    pub fn content_type(&self) -> Option<String> {
        self.state.lock().content_type.clone()
    }

    pub fn send_chunk(&self, chunk: impl Into<Bytes>) -> Result<(), StreamClosed> {
        let mut state = self.state.lock();
        if state.finished {
            return Err(StreamClosed);
        }
        state.chunks.push(chunk.into());
        Ok(())
    }

    pub fn finish(&self) {
        self.state.lock().finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// True once anything was written or the stream was closed
    pub fn is_used(&self) -> bool {
        let state = self.state.lock();
        state.finished || !state.chunks.is_empty()
    }

    /// Drain the buffered chunks into one body
    pub fn take_body(&self) -> Bytes {
        let chunks = std::mem::take(&mut self.state.lock().chunks);
        let mut body = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
        for chunk in chunks {
            body.extend_from_slice(&chunk);
        }
        body.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder_and_accessors() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/users/42?verbose=true")
            .content_type("Application/JSON; charset=utf-8")
            .chunk(&b"{\"a\":"[..])
            .chunk(&b"1}"[..])
            .build()
            .unwrap();

        assert_eq!(req.path(), "/users/42");
        assert_eq!(req.query_string(), Some("verbose=true"));
        assert_eq!(req.media_type().as_deref(), Some("application/json"));
        assert_eq!(&req.full_body()[..], b"{\"a\":1}");
        assert_eq!(req.request_line(), "POST /users/42?verbose=true HTTP/1.1");
    }

    #[test]
    fn test_request_builder_rejects_bad_header() {
        let result = Request::builder().uri("/").header("bad header", "x").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_request_from_http() {
        let req = http::Request::builder()
            .method(Method::PUT)
            .uri("/items?id=3")
            .header("X-Trace", "abc")
            .body(Bytes::from_static(b"payload"))
            .unwrap();
        let req = Request::from(req);
        assert_eq!(req.method(), Method::PUT);
        assert_eq!(req.header("x-trace"), Some("abc"));
        assert_eq!(req.query_string(), Some("id=3"));
        assert_eq!(req.body_len(), 7);
    }

    #[test]
    fn test_responder_is_shared() {
        let responder = Responder::new();
        let other = responder.clone();
        other.set_status(StatusCode::CREATED);
        other.set_body("done");
        let response = responder.to_response();
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.body_str(), Some("done"));
    }

    #[test]
    fn test_json_error_response() {
        let response = Response::json_error(StatusCode::BAD_REQUEST, "nope");
        assert_eq!(response.header("content-type"), Some("application/json"));
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["status"], 400);
        assert_eq!(body["error"], "nope");
    }

    #[test]
    fn test_streamer_buffers_until_finished() {
        let streamer = HttpStreamer::new();
        assert!(!streamer.is_used());
        streamer.send_chunk("ab").unwrap();
        streamer.send_chunk("cd").unwrap();
        streamer.finish();
        assert_eq!(streamer.send_chunk("ef"), Err(StreamClosed));
        assert_eq!(&streamer.take_body()[..], b"abcd");
    }
}
