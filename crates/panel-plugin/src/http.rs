//! HTTP-style route dispatch.
//!
//! The panel proxies requests for plugin-owned paths. Resolution tries an
//! exact method+path match first, then scans routes in registration order
//! for a method match (or `*`) whose pattern matches the path. Nothing
//! matching yields a 404 with a JSON error body.
//!
//! Request bodies are offered twice: the raw bytes, which never fail, and a
//! parsed JSON object. A body that is absent or not a JSON object leaves the
//! parsed form empty; handlers that care can inspect [`Request::body_state`].

use std::sync::Arc;

use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::envelope::HttpCall;
use crate::envelope::HttpReply;
use crate::envelope::StringMap;
use crate::registry::HandlerRegistry;

/// Callback invoked for a matched route.
pub type RouteHandler = Arc<dyn Fn(Request) -> Response + Send + Sync>;

const CONTENT_TYPE: &str = "Content-Type";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Outcome of parsing the request body as a JSON object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyState {
    /// No body bytes were sent.
    Absent,
    /// Body bytes were present but not a JSON object.
    Invalid(String),
    /// Body parsed into [`Request::body`].
    Parsed,
}

/// An inbound request handed to a route handler.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: StringMap,
    pub query: StringMap,
    pub user_id: String,
    raw_body: Vec<u8>,
    body: Map<String, Value>,
    body_state: BodyState,
}

impl Request {
    /// Build a request from its wire form, parsing the body best-effort.
    pub fn from_call(call: HttpCall) -> Self {
        let (body, body_state) = parse_body(&call.body);
        Self {
            method: call.method,
            path: call.path,
            headers: call.headers,
            query: call.query,
            user_id: call.user_id,
            raw_body: call.body,
            body,
            body_state,
        }
    }

    /// Raw body bytes as sent by the panel.
    pub fn raw_body(&self) -> &[u8] {
        &self.raw_body
    }

    /// Parsed JSON object body; empty when absent or invalid.
    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Whether [`Request::body`] holds a parsed document.
    pub fn body_state(&self) -> &BodyState {
        &self.body_state
    }

    /// Parsed body, or the reason it is unavailable.
    pub fn try_body(&self) -> Result<&Map<String, Value>, &BodyState> {
        match self.body_state {
            BodyState::Parsed => Ok(&self.body),
            ref other => Err(other),
        }
    }

    /// Look up a single top-level body field.
    pub fn body_field(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }
}

fn parse_body(raw: &[u8]) -> (Map<String, Value>, BodyState) {
    if raw.is_empty() {
        return (Map::new(), BodyState::Absent);
    }
    match serde_json::from_slice::<Map<String, Value>>(raw) {
        Ok(map) => (map, BodyState::Parsed),
        Err(e) => (Map::new(), BodyState::Invalid(e.to_string())),
    }
}

/// Response produced by a route handler. The body is already serialized and
/// is forwarded to the panel byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: StringMap,
    body: Vec<u8>,
}

#[derive(Serialize)]
struct SuccessBody<'a, T: Serialize> {
    success: bool,
    data: &'a T,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    success: bool,
    error: &'a str,
}

impl Response {
    /// `200` with `{"success":true,"data":<data>}`.
    pub fn json<T: Serialize>(data: &T) -> Self {
        match serde_json::to_vec(&SuccessBody { success: true, data }) {
            Ok(body) => Self::with_body(200, JSON_CONTENT_TYPE, body),
            Err(e) => {
                warn!(error = %e, "failed to serialize response data");
                Self::error(500, "failed to serialize response")
            }
        }
    }

    /// `status` with `{"success":false,"error":<message>}`.
    pub fn error(status: u16, message: &str) -> Self {
        let body = serde_json::to_vec(&ErrorBody {
            success: false,
            error: message,
        })
        .unwrap_or_default();
        Self::with_body(status, JSON_CONTENT_TYPE, body)
    }

    /// `200` plain text.
    pub fn text(text: impl Into<String>) -> Self {
        Self::with_body(200, "text/plain", text.into().into_bytes())
    }

    /// Arbitrary bytes with an explicit content type.
    pub fn bytes(status: u16, content_type: &str, body: Vec<u8>) -> Self {
        Self::with_body(status, content_type, body)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    fn with_body(status: u16, content_type: &str, body: Vec<u8>) -> Self {
        let mut headers = StringMap::new();
        headers.insert(CONTENT_TYPE.to_string(), content_type.to_string());
        Self { status, headers, body }
    }
}

impl From<Response> for HttpReply {
    fn from(resp: Response) -> Self {
        HttpReply {
            status: resp.status,
            headers: resp.headers,
            body: resp.body,
        }
    }
}

/// Resolve and run the route for `call`.
pub(crate) fn dispatch(registry: &HandlerRegistry, call: HttpCall) -> HttpReply {
    let Some(route) = registry.resolve_route(&call.method, &call.path) else {
        debug!(method = %call.method, path = %call.path, "no route matched");
        return Response::error(404, "not found").into();
    };

    let request = Request::from_call(call);
    if let BodyState::Invalid(reason) = request.body_state() {
        debug!(path = %request.path, reason = %reason, "request body is not a JSON object");
    }
    (route.handler)(request).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Plugin;

    fn call(method: &str, path: &str) -> HttpCall {
        HttpCall {
            method: method.to_string(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    fn tagged(tag: &'static str) -> impl Fn(Request) -> Response + Send + Sync + 'static {
        move |_| Response::text(tag)
    }

    #[test]
    fn exact_route_beats_overlapping_wildcard() {
        let registry = Plugin::new("test", "0.1.0")
            .route("GET", "/api/*", tagged("wildcard"))
            .route("GET", "/api/status", tagged("exact"))
            .into_registry();

        assert_eq!(dispatch(&registry, call("GET", "/api/status")).body, b"exact");
        assert_eq!(dispatch(&registry, call("GET", "/api/other")).body, b"wildcard");
    }

    #[test]
    fn star_method_route_accepts_any_method() {
        let registry = Plugin::new("test", "0.1.0").route("*", "/hooks/*", tagged("any")).into_registry();
        assert_eq!(dispatch(&registry, call("PATCH", "/hooks/x")).body, b"any");
    }

    #[test]
    fn first_registered_wildcard_wins() {
        let registry = Plugin::new("test", "0.1.0")
            .route("GET", "/a/*", tagged("first"))
            .route("GET", "/a/b/*", tagged("second"))
            .into_registry();
        assert_eq!(dispatch(&registry, call("GET", "/a/b/c")).body, b"first");
    }

    #[test]
    fn unmatched_route_is_404_with_error_body() {
        let registry = Plugin::new("test", "0.1.0").into_registry();
        let reply = dispatch(&registry, call("GET", "/missing"));
        assert_eq!(reply.status, 404);
        assert_eq!(reply.body, br#"{"success":false,"error":"not found"}"#);
        assert_eq!(reply.headers.get("Content-Type").map(String::as_str), Some("application/json"));
    }

    #[test]
    fn invalid_body_is_tolerated_and_raw_bytes_survive() {
        let registry = Plugin::new("test", "0.1.0")
            .route("POST", "/echo", |req| {
                assert!(req.body().is_empty());
                assert!(matches!(req.body_state(), BodyState::Invalid(_)));
                Response::bytes(200, "application/octet-stream", req.raw_body().to_vec())
            })
            .into_registry();

        let mut bad = call("POST", "/echo");
        bad.body = b"not json at all".to_vec();
        let reply = dispatch(&registry, bad);
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, b"not json at all");
    }

    #[test]
    fn parsed_body_is_available() {
        let registry = Plugin::new("test", "0.1.0")
            .route("POST", "/items", |req| {
                let name = req.body_field("name").and_then(Value::as_str).unwrap_or_default().to_string();
                Response::json(&name).with_status(201)
            })
            .into_registry();

        let mut create = call("POST", "/items");
        create.body = br#"{"name":"widget"}"#.to_vec();
        let reply = dispatch(&registry, create);
        assert_eq!(reply.status, 201);
        assert_eq!(reply.body, br#"{"success":true,"data":"widget"}"#);
    }

    #[test]
    fn handler_headers_and_body_are_copied_verbatim() {
        let registry = Plugin::new("test", "0.1.0")
            .route("GET", "/raw", |_| Response::text("{not: reinterpreted}").with_header("X-Trace", "abc"))
            .into_registry();
        let reply = dispatch(&registry, call("GET", "/raw"));
        assert_eq!(reply.body, b"{not: reinterpreted}");
        assert_eq!(reply.headers.get("X-Trace").map(String::as_str), Some("abc"));
        assert_eq!(reply.headers.get("Content-Type").map(String::as_str), Some("text/plain"));
    }

    #[test]
    fn empty_body_is_absent_not_invalid() {
        let request = Request::from_call(call("GET", "/"));
        assert_eq!(request.body_state(), &BodyState::Absent);
        assert!(request.try_body().is_err());
    }
}
