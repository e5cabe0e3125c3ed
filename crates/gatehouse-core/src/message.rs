use crate::GatewayError;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, ALLOW, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode};
use serde::Serialize;
use std::net::IpAddr;

/// An inbound request as received by the gateway pipeline.
///
/// Immutable once handed to the pipeline; anything derived from it (API
/// version, resolved route, claims) travels alongside it instead.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    /// HTTP method.
    pub method: Method,
    /// Raw path, including any gateway prefix, without the query string.
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: Option<String>,
    /// Request headers (case-insensitive).
    pub headers: HeaderMap,
    /// Raw body bytes.
    pub body: Bytes,
    /// Peer address, when the transport knows it.
    pub client_ip: Option<IpAddr>,
}

impl GatewayRequest {
    /// Build a request from a method and a path-and-query string.
    pub fn new(method: Method, uri: &str) -> Self {
        let (path, query) = match uri.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string()).filter(|q| !q.is_empty())),
            None => (uri.to_string(), None),
        };
        Self {
            method,
            path,
            query,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_ip: None,
        }
    }

    /// Add a header; invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    /// Replace the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Set the peer address.
    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    /// First value of a header as UTF-8, if present and valid.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The `Content-Type` header.
    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE.as_str())
    }

    /// Identity used for per-client bookkeeping such as rate limiting.
    pub fn client_key(&self) -> String {
        self.client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// A normalized response: `{status, headers, body}`.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse {
    /// HTTP status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    success: bool,
    message: String,
    code: &'a str,
}

impl GatewayResponse {
    /// A response with the given status and no body.
    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// A JSON response.
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        let mut resp = Self::empty(status);
        resp.body = Bytes::from(value.to_string());
        resp.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        resp
    }

    /// Render an error as `{success: false, message, code}`.
    ///
    /// Adds the `Allow` header for 405 and the rate-limit headers for 429.
    pub fn from_error(err: &GatewayError) -> Self {
        let body = ErrorBody {
            success: false,
            message: err.public_message(),
            code: err.code(),
        };
        let value = serde_json::to_value(&body).unwrap_or(serde_json::Value::Null);
        let mut resp = Self::json(err.status(), &value);

        match err {
            GatewayError::MethodNotAllowed { allowed, .. } => {
                resp.set_header(ALLOW.as_str(), &allowed.join(", "));
            }
            GatewayError::RateLimited { limit, reset_at } => {
                resp.set_header("x-ratelimit-limit", &limit.to_string());
                resp.set_header("x-ratelimit-remaining", "0");
                resp.set_header("x-ratelimit-reset", &reset_at.to_string());
            }
            _ => {}
        }
        resp
    }

    /// Insert or replace a header; invalid names or values are ignored.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
    }

    /// A header value as UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Parse the body as JSON.
    pub fn body_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}
