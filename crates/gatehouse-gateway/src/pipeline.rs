use crate::cache::{cache_key, ResponseCache};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::GatewayConfig;
use crate::dispatch::{Dispatcher, Handler, HandlerRegistry, HandlerRequest, Upstreams};
use crate::handlers::{self, BuiltinContext};
use crate::middleware::{apply_cors, preflight};
use crate::payload::build_payload;
use crate::router::{self, Route, RouteTable, Target};
use crate::trace::TraceContext;
use crate::validate;
use gatehouse_core::{
    GatewayError, GatewayRequest, GatewayResponse, GatewayResult, SharedClock, SystemClock,
};
use gatehouse_security::{AuthClaims, JwtCodec, RateLimiter, TokenAuthenticator};
use gatehouse_session::{MemorySessionStore, SessionManager, SessionStore};
use http::{Method, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Response header telling whether a cacheable GET was served from cache.
pub const CACHE_HEADER: &str = "x-cache";
/// Response header echoing the API version.
pub const VERSION_HEADER: &str = "x-api-version";

/// Rate window shared by every request of a client that matched no route.
const UNMATCHED_RATE_KEY: &str = "(unmatched)";

/// Routes served by built-in handlers.
fn builtin_routes() -> Vec<Route> {
    vec![
        Route::new("/", &[Method::GET], Target::Local(handlers::GATEWAY_INFO.into())).public(),
        Route::new("/health", &[Method::GET], Target::Local(handlers::GATEWAY_HEALTH.into()))
            .public()
            .uncached(),
        Route::new(
            "/auth/session",
            &[Method::POST],
            Target::Local(handlers::SESSION_CREATE.into()),
        ),
        Route::new(
            "/auth/session",
            &[Method::DELETE],
            Target::Local(handlers::SESSION_DELETE.into()),
        ),
        Route::new(
            "/auth/session/refresh",
            &[Method::POST],
            Target::Local(handlers::SESSION_REFRESH.into()),
        ),
    ]
}

/// The request pipeline and every piece of state it shares across requests.
pub struct Gateway {
    prefix: String,
    default_version: String,
    max_body_bytes: usize,
    sampling_rate: f64,
    /// Minimum CSRF token length, `None` when the check is off.
    csrf_min_length: Option<usize>,
    authenticator: TokenAuthenticator,
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    cache: Arc<ResponseCache>,
    sessions: Arc<SessionManager>,
    routes: RouteTable,
    dispatcher: Dispatcher,
}

/// Assembles a [`Gateway`] from configuration plus optional overrides.
pub struct GatewayBuilder {
    config: GatewayConfig,
    clock: SharedClock,
    store: Option<Arc<dyn SessionStore>>,
    handlers: Vec<(String, Arc<dyn Handler>)>,
    routes: Vec<Route>,
}

impl GatewayBuilder {
    /// Use a different clock for every time-dependent component.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Use a different session store.
    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register an extra local handler, replacing a built-in of the same id.
    pub fn handler(mut self, id: &str, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push((id.to_string(), handler));
        self
    }

    /// Add a route on top of the configured ones.
    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    /// Validate the configuration and assemble every component.
    pub fn build(self) -> GatewayResult<Gateway> {
        let config = self.config;
        config.validate()?;
        let clock = self.clock;

        let authenticator =
            TokenAuthenticator::new(&config.jwt.secret, &config.auth.api_keys, clock.clone());
        let limiter = Arc::new(
            RateLimiter::new(
                config.rate_limiting.limit,
                Duration::from_secs(config.rate_limiting.window),
                clock.clone(),
            )
            .with_rules(&config.rate_limiting.rules)?,
        );
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.breaker_policy(),
            clock.clone(),
        ));
        let cache = Arc::new(ResponseCache::new(
            config.cache.capacity,
            Duration::from_secs(config.cache.ttl),
            clock.clone(),
        ));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()));
        let sessions = Arc::new(SessionManager::new(
            store,
            JwtCodec::new(&config.jwt.secret),
            Duration::from_secs(config.session.expiration),
            clock.clone(),
        ));

        let mut routes = RouteTable::new();
        for route in builtin_routes() {
            routes.add(route)?;
        }
        for route in &config.routes {
            routes.add(route.to_route()?)?;
        }
        for route in self.routes {
            routes.add(route)?;
        }

        let mut registry = HandlerRegistry::new();
        handlers::register_builtins(
            &mut registry,
            &BuiltinContext {
                breakers: breakers.clone(),
                cache: cache.clone(),
                limiter: limiter.clone(),
                sessions: sessions.clone(),
                clock: clock.clone(),
                endpoints: routes
                    .routes()
                    .flat_map(|r| r.methods.iter().map(move |m| format!("{m} {}", r.path)))
                    .collect(),
            },
        );
        for (id, handler) in self.handlers {
            registry.register(&id, handler);
        }

        let upstreams =
            Upstreams::new(&config.services)?.with_body_limit(config.gateway.max_upstream_body_bytes);
        for route in routes.routes() {
            match &route.target {
                Target::Local(id) if !registry.contains(id) => {
                    return Err(GatewayError::Config(format!(
                        "route {} targets unknown handler '{id}'",
                        route.path
                    )));
                }
                Target::Remote(service) if upstreams.base_url(service).is_none() => {
                    return Err(GatewayError::Config(format!(
                        "route {} targets unknown upstream '{service}'",
                        route.path
                    )));
                }
                _ => {}
            }
        }

        info!(
            routes = routes.len(),
            handlers = registry.len(),
            api_keys = config.auth.api_keys.len(),
            "Gateway assembled"
        );

        let dispatcher = Dispatcher::new(
            registry,
            upstreams,
            breakers.clone(),
            config.handler_timeout(),
        );
        Ok(Gateway {
            prefix: config.gateway.prefix,
            default_version: config.gateway.default_version,
            max_body_bytes: config.gateway.max_body_bytes,
            sampling_rate: config.tracing.sampling_rate,
            csrf_min_length: config.csrf.enabled.then_some(config.csrf.min_length),
            authenticator,
            limiter,
            breakers,
            cache,
            sessions,
            routes,
            dispatcher,
        })
    }
}

impl Gateway {
    /// Start assembling a gateway from `config`.
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder {
            config,
            clock: SystemClock::shared(),
            store: None,
            handlers: Vec::new(),
            routes: Vec::new(),
        }
    }

    /// A gateway with the system clock and an in-memory session store.
    pub fn from_config(config: GatewayConfig) -> GatewayResult<Self> {
        Self::builder(config).build()
    }

    /// Run one request through the full pipeline.
    ///
    /// Never fails: every error is rendered as a JSON error response, and
    /// CORS headers are attached to whatever comes back.
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        if let Some(err) = self.oversized(&request) {
            return self.reject(&err);
        }
        if request.method == Method::OPTIONS {
            return preflight();
        }

        let trace = TraceContext::init(&request.headers, self.sampling_rate);
        let span = info_span!(
            "request",
            method = %request.method,
            path = %request.path,
            trace_id = %trace.trace_id,
        );

        async {
            let started = Instant::now();
            let mut response = match self.process(&request, &trace).await {
                Ok(response) => response,
                Err(err) => {
                    log_error(&err);
                    GatewayResponse::from_error(&err)
                }
            };
            apply_cors(&mut response.headers);
            trace.apply(&mut response.headers);
            info!(
                status = response.status.as_u16(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                client = %request.client_key(),
                "Request completed"
            );
            response
        }
        .instrument(span)
        .await
    }

    /// Render an error the way [`handle`](Self::handle) would.
    pub fn reject(&self, err: &GatewayError) -> GatewayResponse {
        let mut response = GatewayResponse::from_error(err);
        apply_cors(&mut response.headers);
        response
    }

    /// The body cap in bytes.
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    fn oversized(&self, request: &GatewayRequest) -> Option<GatewayError> {
        let declared = request
            .header(http::header::CONTENT_LENGTH.as_str())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let limit = self.max_body_bytes;
        let too_big = request.body.len() > limit
            || declared.is_some_and(|n| n > u64::try_from(limit).unwrap_or(u64::MAX));
        too_big.then_some(GatewayError::PayloadTooLarge { limit })
    }

    async fn process(
        &self,
        request: &GatewayRequest,
        trace: &TraceContext,
    ) -> GatewayResult<GatewayResponse> {
        let normalized = router::normalize(&request.path, &self.prefix);
        let version = router::negotiate_version(
            normalized.version.as_deref(),
            &request.headers,
            request.query.as_deref(),
            &self.default_version,
        );
        router::check_version(&version)?;
        let path = normalized.path;

        let resolution = self.routes.resolve(&path, &request.method);
        let rate_key = match &resolution {
            Ok(resolved) => resolved.route.path.as_str(),
            Err(_) => UNMATCHED_RATE_KEY,
        };
        let decision = self.limiter.check(&request.client_key(), rate_key);
        if !decision.allowed {
            return Err(GatewayError::RateLimited {
                limit: decision.limit,
                reset_at: decision.reset_at,
            });
        }

        let resolved = resolution.map_err(|e| e.into_gateway_error(&path, &request.method))?;
        let route = resolved.route.clone();

        let claims = if route.public {
            None
        } else {
            Some(self.authenticate(request, &path).await?)
        };

        let cache_key = (request.method == Method::GET && route.cacheable)
            .then(|| cache_key(&request.method, &path, request.query.as_deref()));
        if let Some(key) = &cache_key {
            if let Some(mut hit) = self.cache.get(key) {
                debug!(key = %key, "Cache hit");
                hit.set_header(CACHE_HEADER, "HIT");
                finish(&mut hit, &version, &decision);
                return Ok(hit);
            }
        }

        let mut payload = build_payload(request, &route, &resolved.captures).await?;
        if let Some(min_length) = self.csrf_min_length {
            if claims.is_none() && validate::is_unsafe(&request.method) {
                validate::check_csrf(&request.headers, &mut payload, min_length)
                    .inspect_err(|_| warn!(path = %path, "CSRF token rejected"))?;
            }
        }
        route.rules.validate(&payload)?;
        let handler_request = HandlerRequest {
            method: request.method.clone(),
            path: path.clone(),
            version: version.clone(),
            payload,
            captures: resolved.captures.clone(),
            headers: request.headers.clone(),
            claims,
            trace: trace.clone(),
        };
        let mut response = self.dispatcher.dispatch(&resolved, handler_request).await?;

        if let Some(key) = &cache_key {
            if response.status == StatusCode::OK {
                self.cache.put(key, &response, self.cache.ttl());
            }
            response.set_header(CACHE_HEADER, "MISS");
        }
        finish(&mut response, &version, &decision);
        Ok(response)
    }

    /// Verify credentials, authorize the path and, for session tokens,
    /// require the session to still exist.
    async fn authenticate(&self, request: &GatewayRequest, path: &str) -> GatewayResult<AuthClaims> {
        let claims = self
            .authenticator
            .authenticate(&request.headers)
            .inspect_err(|failure| debug!(reason = ?failure, "Authentication failed"))?;
        TokenAuthenticator::authorize(&claims, path).inspect_err(|_| {
            warn!(subject = %claims.sub, path = %path, "Access denied");
        })?;
        if let Some(session_id) = &claims.session_id {
            if !self.sessions.is_live(session_id).await? {
                return Err(GatewayError::Authentication("session is no longer active".into()));
            }
        }
        Ok(claims)
    }

    /// Purge expired sessions and cache entries and idle rate windows.
    pub async fn run_maintenance(&self) {
        match self.sessions.cleanup_expired().await {
            Ok(n) if n > 0 => debug!(sessions = n, "Expired sessions removed"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Session cleanup failed"),
        }
        let purged = self.cache.purge_expired();
        if purged > 0 {
            debug!(entries = purged, "Expired cache entries removed");
        }
        self.limiter.prune_idle();
    }

    /// Run [`run_maintenance`](Self::run_maintenance) every `every`.
    pub fn spawn_maintenance(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                gateway.run_maintenance().await;
            }
        })
    }

    /// The resolved route table.
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

fn finish(response: &mut GatewayResponse, version: &str, decision: &gatehouse_security::RateDecision) {
    response.set_header(VERSION_HEADER, version);
    response.set_header("x-ratelimit-limit", &decision.limit.to_string());
    response.set_header("x-ratelimit-remaining", &decision.remaining.to_string());
    response.set_header("x-ratelimit-reset", &decision.reset_at.to_string());
}

fn log_error(err: &GatewayError) {
    if err.status().is_server_error() {
        error!(error = %err, code = err.code(), "Request failed");
    } else {
        debug!(error = %err, code = err.code(), "Request rejected");
    }
}
