//! Core types and error definitions for the Gatehouse API gateway.
//!
//! This crate provides the foundational types shared across all Gatehouse
//! crates: the transport-neutral request/response pair, the gateway error
//! taxonomy and the clock abstraction used by every time-dependent component.
//!
//! # Main types
//!
//! - [`GatewayError`] — Unified error enum; every variant maps to one HTTP status.
//! - [`GatewayResult`] — Convenience alias for `Result<T, GatewayError>`.
//! - [`GatewayRequest`] — An inbound request as seen by the pipeline.
//! - [`GatewayResponse`] — The normalized `{status, headers, body}` triple.
//! - [`Clock`] — Millisecond wall clock, swappable for a [`ManualClock`] in tests.

/// Clock abstraction.
pub mod clock;
/// Request and response types.
pub mod message;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use message::{GatewayRequest, GatewayResponse};

use http::StatusCode;

// --- Error types ---

/// Top-level error type for the gateway.
///
/// Each variant corresponds to one failure class of the request pipeline and
/// maps to exactly one HTTP status via [`GatewayError::status`].
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Missing, malformed, badly signed or expired credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Valid identity without the privileges the path requires.
    #[error("Access denied: {0}")]
    Authorization(String),

    /// A state-changing request without a usable CSRF token.
    #[error("CSRF check failed: {0}")]
    Csrf(String),

    /// No route matches the normalized path.
    #[error("Route not found: {0}")]
    RouteNotFound(String),

    /// The path exists but not for this method.
    #[error("Method {method} not allowed")]
    MethodNotAllowed {
        /// The rejected method.
        method: String,
        /// Methods the route accepts, used for the `Allow` header.
        allowed: Vec<String>,
    },

    /// Request body larger than the configured cap.
    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge {
        /// The cap in bytes.
        limit: usize,
    },

    /// The sliding window for this client and route is full.
    #[error("Too many requests")]
    RateLimited {
        /// Admissions allowed per window.
        limit: u32,
        /// Epoch seconds at which the oldest admission leaves the window.
        reset_at: u64,
    },

    /// The circuit breaker for a downstream target is rejecting calls.
    #[error("Service unavailable: circuit open for {0}")]
    CircuitOpen(String),

    /// A downstream call exceeded its deadline.
    #[error("Downstream timeout: {0}")]
    DownstreamTimeout(String),

    /// A downstream call failed at the transport level or returned garbage.
    #[error("Downstream error: {0}")]
    Downstream(String),

    /// A handler failed or panicked.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Malformed request body or parameters.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An error related to session persistence or token minting.
    #[error("Session error: {0}")]
    Session(String),

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`GatewayError`].
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// HTTP status this error is surfaced as.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Authorization(_) | Self::Csrf(_) => StatusCode::FORBIDDEN,
            Self::RouteNotFound(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::DownstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Downstream(_) => StatusCode::BAD_GATEWAY,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Handler(_)
            | Self::Session(_)
            | Self::Config(_)
            | Self::Json(_)
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code placed in the error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "AUTHENTICATION_FAILED",
            Self::Authorization(_) => "ACCESS_DENIED",
            Self::Csrf(_) => "CSRF_TOKEN_INVALID",
            Self::RouteNotFound(_) => "ROUTE_NOT_FOUND",
            Self::MethodNotAllowed { .. } => "METHOD_NOT_ALLOWED",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::CircuitOpen(_) => "CIRCUIT_OPEN",
            Self::DownstreamTimeout(_) => "DOWNSTREAM_TIMEOUT",
            Self::Downstream(_) => "DOWNSTREAM_ERROR",
            Self::Handler(_) => "HANDLER_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Session(_) | Self::Config(_) | Self::Json(_) | Self::Io(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to show the caller.
    ///
    /// Internal failures collapse to a generic text; their detail only goes
    /// to the log.
    pub fn public_message(&self) -> String {
        match self {
            Self::Handler(_)
            | Self::Session(_)
            | Self::Config(_)
            | Self::Json(_)
            | Self::Io(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}
