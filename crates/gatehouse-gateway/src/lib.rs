//! Request pipeline, routing, dispatch and HTTP server of the Gatehouse API
//! gateway.
//!
//! Every inbound request runs through [`Gateway::handle`]: size check,
//! preflight, trace context, version and rate limit checks, route resolution,
//! authentication, response cache, payload conversion, CSRF and field
//! validation, and dispatch to a local handler or an upstream service behind
//! a circuit breaker.
//!
//! # Main types
//!
//! - [`Gateway`] — The pipeline and the state it shares across requests.
//! - [`GatewayConfig`] — TOML configuration with environment overrides.
//! - [`GatewayServer`] — axum front end serving a [`Gateway`].
//! - [`RouteTable`] — Exact and `{name}`-pattern route lookup.
//! - [`CircuitBreakerRegistry`] — Per-upstream breakers.
//! - [`ResponseCache`] — TTL cache for successful GET responses.
//! - [`TraceContext`] — Trace/span ids propagated through headers.

/// Response cache.
pub mod cache;
/// Per-upstream circuit breakers.
pub mod circuit_breaker;
/// Configuration loading and validation.
pub mod config;
/// Handlers, upstream forwarding and the dispatcher.
pub mod dispatch;
/// Built-in handlers.
pub mod handlers;
/// CORS headers.
pub mod middleware;
/// Request body conversion.
pub mod payload;
/// The request pipeline.
pub mod pipeline;
/// Path normalization and route lookup.
pub mod router;
/// axum server.
pub mod server;
/// Trace context propagation.
pub mod trace;
/// Payload validation rules and the CSRF check.
pub mod validate;

pub use cache::ResponseCache;
pub use circuit_breaker::{BreakerPolicy, BreakerSnapshot, CircuitBreakerRegistry, CircuitState};
pub use config::{GatewayConfig, RouteConfig};
pub use dispatch::{handler_fn, Handler, HandlerRegistry, HandlerRequest};
pub use pipeline::{Gateway, GatewayBuilder};
pub use router::{Route, RouteTable, Target};
pub use server::GatewayServer;
pub use trace::TraceContext;
pub use validate::{Rule, RuleSet};
