use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::router::{ResolvedRoute, Target};
use crate::trace::TraceContext;
use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::FutureExt;
use gatehouse_core::{GatewayError, GatewayResponse, GatewayResult};
use gatehouse_security::AuthClaims;
use http::{HeaderMap, HeaderValue, Method};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Everything a handler sees of a request.
#[derive(Debug, Clone)]
pub struct HandlerRequest {
    pub method: Method,
    /// Normalized path.
    pub path: String,
    /// API version extracted from the path.
    pub version: String,
    /// Converted body with query, captures and route parameters merged in.
    pub payload: Value,
    /// Path captures of a `{name}` route.
    pub captures: BTreeMap<String, String>,
    pub headers: HeaderMap,
    /// `None` on public routes.
    pub claims: Option<AuthClaims>,
    pub trace: TraceContext,
}

/// A locally implemented route target.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, request: HandlerRequest) -> GatewayResult<GatewayResponse>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(HandlerRequest) -> Fut + Send + Sync,
    Fut: Future<Output = GatewayResult<GatewayResponse>> + Send,
{
    async fn call(&self, request: HandlerRequest) -> GatewayResult<GatewayResponse> {
        (self.0)(request).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(HandlerRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = GatewayResult<GatewayResponse>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Static table of local handlers, keyed by target id.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: &str, handler: Arc<dyn Handler>) {
        debug!(handler = %id, "Registered handler");
        self.handlers.insert(id.to_string(), handler);
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Upstream body cap unless configured otherwise.
pub const DEFAULT_UPSTREAM_BODY_LIMIT: usize = 1024 * 1024;

/// Why forwarding to an upstream produced no response.
#[derive(Debug, thiserror::Error)]
enum ForwardError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("upstream body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
}

/// HTTP client for upstream services, by name.
pub struct Upstreams {
    client: reqwest::Client,
    services: HashMap<String, String>,
    body_limit: usize,
}

impl Upstreams {
    pub fn new(services: &BTreeMap<String, String>) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            services: services
                .iter()
                .map(|(k, v)| (k.clone(), v.trim_end_matches('/').to_string()))
                .collect(),
            body_limit: DEFAULT_UPSTREAM_BODY_LIMIT,
        })
    }

    /// Refuse upstream bodies larger than `limit` bytes.
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    pub fn base_url(&self, service: &str) -> Option<&str> {
        self.services.get(service).map(String::as_str)
    }

    /// Forward the converted payload to `service`.
    ///
    /// Bodiless methods carry the payload as a query string, the rest as JSON.
    /// Transport failures and oversized bodies are `Err`; any HTTP status is `Ok`.
    async fn forward(
        &self,
        service: &str,
        request: &HandlerRequest,
    ) -> Result<GatewayResponse, ForwardError> {
        let base = self.base_url(service).unwrap_or_default();
        let url = format!("{base}{}", request.path);

        let mut builder = self.client.request(request.method.clone(), &url);
        let mut headers = HeaderMap::new();
        request.trace.child().apply(&mut headers);
        if let Some(claims) = &request.claims {
            if let Ok(sub) = HeaderValue::from_str(&claims.sub) {
                headers.insert("x-gateway-subject", sub);
            }
        }
        builder = builder.headers(headers);

        builder = if matches!(request.method, Method::GET | Method::HEAD | Method::DELETE) {
            builder.query(&query_pairs(&request.payload))
        } else {
            builder.json(&request.payload)
        };

        let mut response = builder.send().await?;
        let status = response.status();
        let mut headers = HeaderMap::new();
        if let Some(ct) = response.headers().get(http::header::CONTENT_TYPE) {
            headers.insert(http::header::CONTENT_TYPE, ct.clone());
        }

        let limit = self.body_limit;
        let declared = response.content_length().unwrap_or(0);
        if declared > u64::try_from(limit).unwrap_or(u64::MAX) {
            return Err(ForwardError::BodyTooLarge { limit });
        }
        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > limit {
                return Err(ForwardError::BodyTooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(GatewayResponse {
            status,
            headers,
            body: body.freeze(),
        })
    }
}

/// Flatten scalar payload values into query pairs.
fn query_pairs(payload: &Value) -> Vec<(String, String)> {
    let Value::Object(map) = payload else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((k.clone(), v))
        })
        .collect()
}

/// Invokes route targets with a deadline, a breaker for upstreams and panic
/// containment for local handlers.
pub struct Dispatcher {
    handlers: HandlerRegistry,
    upstreams: Upstreams,
    breakers: Arc<CircuitBreakerRegistry>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        handlers: HandlerRegistry,
        upstreams: Upstreams,
        breakers: Arc<CircuitBreakerRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            handlers,
            upstreams,
            breakers,
            timeout,
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Invoke the route's target. Every failure comes back as a typed error.
    pub async fn dispatch(
        &self,
        resolved: &ResolvedRoute,
        request: HandlerRequest,
    ) -> GatewayResult<GatewayResponse> {
        match &resolved.route.target {
            Target::Local(id) => self.call_local(id, request).await,
            Target::Remote(service) => self.call_remote(service, request).await,
        }
    }

    async fn call_local(&self, id: &str, request: HandlerRequest) -> GatewayResult<GatewayResponse> {
        let handler = self
            .handlers
            .get(id)
            .ok_or_else(|| GatewayError::Handler(format!("no handler registered for '{id}'")))?;

        let call = AssertUnwindSafe(handler.call(request)).catch_unwind();
        match tokio::time::timeout(self.timeout, call).await {
            Err(_) => {
                warn!(handler = %id, timeout_ms = self.timeout.as_millis(), "Handler timed out");
                Err(GatewayError::DownstreamTimeout(id.to_string()))
            }
            Ok(Err(panic)) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(handler = %id, panic = %detail, "Handler panicked");
                Err(GatewayError::Handler(format!("handler '{id}' panicked")))
            }
            Ok(Ok(result)) => {
                if let Err(e) = &result {
                    if e.status().is_server_error() {
                        error!(handler = %id, error = %e, "Handler failed");
                    }
                }
                result
            }
        }
    }

    async fn call_remote(
        &self,
        service: &str,
        request: HandlerRequest,
    ) -> GatewayResult<GatewayResponse> {
        if self.upstreams.base_url(service).is_none() {
            return Err(GatewayError::Config(format!("unknown upstream '{service}'")));
        }
        let permit = self.breakers.acquire(service).inspect_err(|_| {
            warn!(upstream = %service, "Circuit open, rejecting call");
        })?;

        match tokio::time::timeout(self.timeout, self.upstreams.forward(service, &request)).await {
            Err(_) => {
                permit.record(false);
                warn!(upstream = %service, "Upstream timed out");
                Err(GatewayError::DownstreamTimeout(service.to_string()))
            }
            Ok(Err(e)) => {
                permit.record(false);
                warn!(upstream = %service, error = %e, "Upstream call failed");
                Err(GatewayError::Downstream(service.to_string()))
            }
            Ok(Ok(response)) if response.status.is_server_error() => {
                permit.record(false);
                warn!(upstream = %service, status = response.status.as_u16(), "Upstream returned server error");
                Err(GatewayError::Downstream(service.to_string()))
            }
            Ok(Ok(response)) => {
                permit.record(true);
                info!(upstream = %service, status = response.status.as_u16(), "Upstream responded");
                Ok(response)
            }
        }
    }
}
