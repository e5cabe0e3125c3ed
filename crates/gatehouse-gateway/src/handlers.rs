//! Built-in route targets.

use crate::cache::ResponseCache;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::dispatch::{Handler, HandlerRegistry, HandlerRequest};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use gatehouse_core::{GatewayError, GatewayResponse, GatewayResult, SharedClock};
use gatehouse_security::RateLimiter;
use gatehouse_session::SessionManager;
use http::StatusCode;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

pub const GATEWAY_INFO: &str = "gateway.info";
pub const GATEWAY_HEALTH: &str = "gateway.health";
pub const SYSTEM_STATUS: &str = "system.status";
pub const SYSTEM_REFRESH: &str = "system.refresh";
pub const DEVICE_REFRESH: &str = "device.refresh";
pub const SESSION_CREATE: &str = "session.create";
pub const SESSION_REFRESH: &str = "session.refresh";
pub const SESSION_DELETE: &str = "session.delete";

const SERVICE_NAME: &str = "gatehouse";

fn rfc3339(millis: u64) -> String {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Shared components the built-ins report on or act through.
#[derive(Clone)]
pub struct BuiltinContext {
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub cache: Arc<ResponseCache>,
    pub limiter: Arc<RateLimiter>,
    pub sessions: Arc<SessionManager>,
    pub clock: SharedClock,
    /// `METHOD path` lines for the info endpoint.
    pub endpoints: Vec<String>,
}

/// Register every built-in handler.
pub fn register_builtins(registry: &mut HandlerRegistry, ctx: &BuiltinContext) {
    registry.register(
        GATEWAY_INFO,
        Arc::new(GatewayInfo {
            endpoints: ctx.endpoints.clone(),
        }),
    );
    registry.register(
        GATEWAY_HEALTH,
        Arc::new(Health {
            clock: ctx.clock.clone(),
        }),
    );
    registry.register(
        SYSTEM_STATUS,
        Arc::new(SystemStatus {
            ctx: ctx.clone(),
            started: Instant::now(),
        }),
    );
    registry.register(
        SYSTEM_REFRESH,
        Arc::new(Refresh {
            action: "system_refresh",
            message: "System refreshed",
            clock: ctx.clock.clone(),
        }),
    );
    registry.register(
        DEVICE_REFRESH,
        Arc::new(Refresh {
            action: "device_refresh",
            message: "Device refreshed",
            clock: ctx.clock.clone(),
        }),
    );
    registry.register(
        SESSION_CREATE,
        Arc::new(SessionCreate {
            sessions: ctx.sessions.clone(),
            clock: ctx.clock.clone(),
        }),
    );
    registry.register(
        SESSION_REFRESH,
        Arc::new(SessionRefresh {
            sessions: ctx.sessions.clone(),
            clock: ctx.clock.clone(),
        }),
    );
    registry.register(
        SESSION_DELETE,
        Arc::new(SessionDelete {
            sessions: ctx.sessions.clone(),
        }),
    );
}

struct GatewayInfo {
    endpoints: Vec<String>,
}

#[async_trait]
impl Handler for GatewayInfo {
    async fn call(&self, request: HandlerRequest) -> GatewayResult<GatewayResponse> {
        Ok(GatewayResponse::json(
            StatusCode::OK,
            &json!({
                "success": true,
                "data": {
                    "name": SERVICE_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                    "api_version": request.version,
                    "endpoints": self.endpoints,
                }
            }),
        ))
    }
}

struct Health {
    clock: SharedClock,
}

#[async_trait]
impl Handler for Health {
    async fn call(&self, _request: HandlerRequest) -> GatewayResult<GatewayResponse> {
        Ok(GatewayResponse::json(
            StatusCode::OK,
            &json!({
                "status": "ok",
                "service": SERVICE_NAME,
                "time": rfc3339(self.clock.now_millis()),
            }),
        ))
    }
}

struct SystemStatus {
    ctx: BuiltinContext,
    started: Instant,
}

#[async_trait]
impl Handler for SystemStatus {
    async fn call(&self, _request: HandlerRequest) -> GatewayResult<GatewayResponse> {
        let sessions = self.ctx.sessions.count().await?;
        Ok(GatewayResponse::json(
            StatusCode::OK,
            &json!({
                "success": true,
                "data": {
                    "uptime_secs": self.started.elapsed().as_secs(),
                    "time": rfc3339(self.ctx.clock.now_millis()),
                    "breakers": self.ctx.breakers.snapshots(),
                    "cache": { "entries": self.ctx.cache.len() },
                    "rate_limiter": { "windows": self.ctx.limiter.tracked_windows() },
                    "sessions": { "count": sessions },
                }
            }),
        ))
    }
}

struct Refresh {
    action: &'static str,
    message: &'static str,
    clock: SharedClock,
}

#[async_trait]
impl Handler for Refresh {
    async fn call(&self, request: HandlerRequest) -> GatewayResult<GatewayResponse> {
        tracing::info!(
            action = self.action,
            subject = request.claims.as_ref().map(|c| c.sub.as_str()).unwrap_or("-"),
            "Refresh requested"
        );
        Ok(GatewayResponse::json(
            StatusCode::OK,
            &json!({
                "success": true,
                "message": self.message,
                "timestamp": self.clock.now_secs(),
            }),
        ))
    }
}

fn session_id(request: &HandlerRequest) -> GatewayResult<&str> {
    request
        .claims
        .as_ref()
        .and_then(|c| c.session_id.as_deref())
        .ok_or_else(|| GatewayError::Validation("A session token is required".into()))
}

struct SessionCreate {
    sessions: Arc<SessionManager>,
    clock: SharedClock,
}

#[async_trait]
impl Handler for SessionCreate {
    async fn call(&self, request: HandlerRequest) -> GatewayResult<GatewayResponse> {
        let claims = request
            .claims
            .as_ref()
            .ok_or_else(|| GatewayError::Authentication("credentials required".into()))?;
        let session = self.sessions.create(claims).await?;
        Ok(GatewayResponse::json(
            StatusCode::OK,
            &json!({
                "success": true,
                "data": session.summary(self.clock.now_millis()),
            }),
        ))
    }
}

struct SessionRefresh {
    sessions: Arc<SessionManager>,
    clock: SharedClock,
}

#[async_trait]
impl Handler for SessionRefresh {
    async fn call(&self, request: HandlerRequest) -> GatewayResult<GatewayResponse> {
        let id = session_id(&request)?;
        let session = self
            .sessions
            .refresh(id)
            .await?
            .ok_or_else(|| GatewayError::Authentication("session expired".into()))?;
        Ok(GatewayResponse::json(
            StatusCode::OK,
            &json!({
                "success": true,
                "data": session.summary(self.clock.now_millis()),
            }),
        ))
    }
}

struct SessionDelete {
    sessions: Arc<SessionManager>,
}

#[async_trait]
impl Handler for SessionDelete {
    async fn call(&self, request: HandlerRequest) -> GatewayResult<GatewayResponse> {
        let id = session_id(&request)?;
        let removed = self.sessions.delete(id).await?;
        Ok(GatewayResponse::json(
            StatusCode::OK,
            &json!({
                "success": removed,
                "message": if removed { "Session closed" } else { "Session not found" },
            }),
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerPolicy;
    use crate::trace::TraceContext;
    use gatehouse_core::ManualClock;
    use gatehouse_security::{AuthClaims, JwtCodec};
    use gatehouse_session::MemorySessionStore;
    use http::{HeaderMap, Method};
    use serde_json::Value;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn context() -> BuiltinContext {
        let clock = ManualClock::new(1_700_000_000_000);
        BuiltinContext {
            breakers: Arc::new(CircuitBreakerRegistry::new(BreakerPolicy::default(), clock.clone())),
            cache: Arc::new(ResponseCache::new(10, Duration::from_secs(30), clock.clone())),
            limiter: Arc::new(RateLimiter::new(10, Duration::from_secs(60), clock.clone())),
            sessions: Arc::new(SessionManager::new(
                Arc::new(MemorySessionStore::new()),
                JwtCodec::new("k"),
                Duration::from_secs(3600),
                clock.clone(),
            )),
            clock,
            endpoints: vec!["GET /".into()],
        }
    }

    fn request(claims: Option<AuthClaims>) -> HandlerRequest {
        HandlerRequest {
            method: Method::POST,
            path: "/".into(),
            version: "v1".into(),
            payload: Value::Null,
            captures: BTreeMap::new(),
            headers: HeaderMap::new(),
            claims,
            trace: TraceContext::default(),
        }
    }

    fn registry(ctx: &BuiltinContext) -> HandlerRegistry {
        let mut reg = HandlerRegistry::new();
        register_builtins(&mut reg, ctx);
        reg
    }

    #[tokio::test]
    async fn test_refresh_shape() {
        let ctx = context();
        let reg = registry(&ctx);
        let resp = reg.get(DEVICE_REFRESH).unwrap().call(request(None)).await.unwrap();
        let body = resp.body_json().unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["timestamp"], 1_700_000_000u64);
    }

    #[tokio::test]
    async fn test_session_lifecycle_through_handlers() {
        let ctx = context();
        let reg = registry(&ctx);
        let mut owner = AuthClaims::service(0);
        owner.sub = "alice".into();

        let created = reg
            .get(SESSION_CREATE)
            .unwrap()
            .call(request(Some(owner)))
            .await
            .unwrap()
            .body_json()
            .unwrap();
        let id = created["data"]["session_id"].as_str().unwrap().to_string();
        assert_eq!(created["data"]["expires_in"], 3600);

        let mut session_claims = AuthClaims::service(0);
        session_claims.session_id = Some(id.clone());
        let closed = reg
            .get(SESSION_DELETE)
            .unwrap()
            .call(request(Some(session_claims)))
            .await
            .unwrap()
            .body_json()
            .unwrap();
        assert_eq!(closed["success"], true);
        assert_eq!(ctx.sessions.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_session_refresh_needs_session_token() {
        let ctx = context();
        let reg = registry(&ctx);
        let err = reg
            .get(SESSION_REFRESH)
            .unwrap()
            .call(request(Some(AuthClaims::service(0))))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[tokio::test]
    async fn test_status_reports_components() {
        let ctx = context();
        ctx.breakers.record_outcome("device", false);
        let reg = registry(&ctx);
        let body = reg
            .get(SYSTEM_STATUS)
            .unwrap()
            .call(request(None))
            .await
            .unwrap()
            .body_json()
            .unwrap();
        assert_eq!(body["data"]["breakers"]["device"]["state"], "closed");
        assert_eq!(body["data"]["breakers"]["device"]["consecutive_failures"], 1);
        assert_eq!(body["data"]["sessions"]["count"], 0);
    }
}
