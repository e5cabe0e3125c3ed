//! Security primitives for the Gatehouse gateway.
//!
//! Provides credential verification, path-based authorization and per-client
//! admission control used by the request pipeline.
//!
//! # Main types
//!
//! - [`TokenAuthenticator`] — Verifies bearer JWTs and API keys into [`AuthClaims`].
//! - [`JwtCodec`] — HS256 signer/verifier for compact JWTs.
//! - [`AuthFailure`] — Why a caller was rejected (401 vs 403).
//! - [`RateLimiter`] — Sliding-window limiter keyed by client and route.

/// Authentication and authorization.
pub mod auth;
/// HS256 JWT encoding and verification.
pub mod jwt;
/// Sliding-window rate limiting.
pub mod rate_limit;

pub use auth::{AuthClaims, AuthFailure, Grants, TokenAuthenticator, TokenPayload};
pub use jwt::{JwtCodec, JwtError};
pub use rate_limit::{RateDecision, RateLimitRule, RateLimiter};
