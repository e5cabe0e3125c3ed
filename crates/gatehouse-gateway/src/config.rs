use crate::circuit_breaker::BreakerPolicy;
use crate::router::{Route, Target};
use crate::validate::RuleSet;
use gatehouse_core::{GatewayError, GatewayResult};
use gatehouse_security::RateLimitRule;
use http::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Environment variable overriding `jwt.secret`.
pub const ENV_JWT_SECRET: &str = "GATEHOUSE_JWT_SECRET";
/// Environment variable overriding `auth.api_keys` (comma separated).
pub const ENV_API_KEYS: &str = "GATEHOUSE_API_KEYS";

/// Paths served by built-in handlers regardless of `routes`.
pub const RESERVED_PATHS: &[&str] = &["/", "/health", "/auth/session", "/auth/session/refresh"];

/// Full gateway configuration, built once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gateway: PipelineConfig,
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limiting: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub csrf: CsrfConfig,
    /// Upstream services by name.
    #[serde(default = "default_services")]
    pub services: BTreeMap<String, String>,
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Path prefix stripped before routing.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Cap on upstream response bodies.
    #[serde(default = "default_max_upstream_body_bytes")]
    pub max_upstream_body_bytes: usize,
    /// Per-call deadline in seconds.
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout: u64,
    #[serde(default = "default_version")]
    pub default_version: String,
    /// Seconds between maintenance sweeps.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval: u64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    #[serde(default)]
    pub secret: String,
    /// Lifetime of tokens minted by the CLI, in seconds.
    #[serde(default = "default_jwt_expiration")]
    pub expiration: u64,
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("secret", &"<redacted>")
            .field("expiration", &self.expiration)
            .finish()
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub api_keys: Vec<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("api_keys", &self.api_keys.len())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Default window in seconds.
    #[serde(default = "default_rate_window")]
    pub window: u64,
    /// Default admissions per window.
    #[serde(default = "default_rate_limit")]
    pub limit: u32,
    /// Per-route overrides; first match wins.
    #[serde(default = "default_rate_rules")]
    pub rules: Vec<RateLimitRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds.
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout: u64,
    #[serde(default = "default_half_open_max")]
    pub half_open_max_requests: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds.
    #[serde(default = "default_session_expiration")]
    pub expiration: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Seconds.
    #[serde(default = "default_cache_ttl")]
    pub ttl: u64,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

/// CSRF token check for state-changing requests without credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrfConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_csrf_min_length")]
    pub min_length: usize,
}

/// One `[[routes]]` entry. Exactly one of `handler` and `upstream` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub path: String,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub defaults: BTreeMap<String, String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default = "default_true")]
    pub cache: bool,
    /// Field rules such as `"required|string|max:50"`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub validate: BTreeMap<String, String>,
}

impl RouteConfig {
    fn new(path: &str, methods: &[&str]) -> Self {
        Self {
            path: path.to_string(),
            methods: methods.iter().map(|m| (*m).to_string()).collect(),
            handler: None,
            upstream: None,
            params: BTreeMap::new(),
            defaults: BTreeMap::new(),
            public: false,
            cache: true,
            validate: BTreeMap::new(),
        }
    }

    fn handler(mut self, id: &str) -> Self {
        self.handler = Some(id.to_string());
        self
    }

    fn upstream(mut self, service: &str) -> Self {
        self.upstream = Some(service.to_string());
        self
    }

    fn param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    fn default_value(mut self, key: &str, value: &str) -> Self {
        self.defaults.insert(key.to_string(), value.to_string());
        self
    }

    fn uncached(mut self) -> Self {
        self.cache = false;
        self
    }

    fn rule(mut self, field: &str, rules: &str) -> Self {
        self.validate.insert(field.to_string(), rules.to_string());
        self
    }

    /// Convert to a routing table entry.
    pub fn to_route(&self) -> GatewayResult<Route> {
        let target = match (&self.handler, &self.upstream) {
            (Some(id), None) => Target::Local(id.clone()),
            (None, Some(service)) => Target::Remote(service.clone()),
            _ => {
                return Err(GatewayError::Config(format!(
                    "route {} must set exactly one of handler or upstream",
                    self.path
                )))
            }
        };
        let methods = self
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()).map_err(|_| {
                    GatewayError::Config(format!("route {}: invalid method '{m}'", self.path))
                })
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        Ok(Route {
            path: self.path.clone(),
            methods,
            target,
            params: self.params.clone(),
            defaults: self.defaults.clone(),
            public: self.public,
            cacheable: self.cache,
            rules: RuleSet::parse(&self.validate).map_err(|e| {
                GatewayError::Config(format!("route {}: {e}", self.path))
            })?,
        })
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            gateway: PipelineConfig::default(),
            jwt: JwtConfig::default(),
            auth: AuthConfig::default(),
            rate_limiting: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            session: SessionConfig::default(),
            tracing: TracingConfig::default(),
            cache: CacheConfig::default(),
            csrf: CsrfConfig::default(),
            services: default_services(),
            routes: default_routes(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            max_body_bytes: default_max_body_bytes(),
            max_upstream_body_bytes: default_max_upstream_body_bytes(),
            handler_timeout: default_handler_timeout(),
            default_version: default_version(),
            maintenance_interval: default_maintenance_interval(),
        }
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            expiration: default_jwt_expiration(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: default_rate_window(),
            limit: default_rate_limit(),
            rules: default_rate_rules(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
            half_open_max_requests: default_half_open_max(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiration: default_session_expiration(),
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            sampling_rate: default_sampling_rate(),
        }
    }
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_length: default_csrf_min_length(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
            capacity: default_cache_capacity(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_prefix() -> String {
    "/api/gateway".to_string()
}
fn default_max_body_bytes() -> usize {
    1024 * 1024
}
fn default_max_upstream_body_bytes() -> usize {
    8 * 1024 * 1024
}
fn default_csrf_min_length() -> usize {
    16
}
fn default_handler_timeout() -> u64 {
    10
}
fn default_version() -> String {
    "v1".to_string()
}
fn default_maintenance_interval() -> u64 {
    60
}
fn default_jwt_expiration() -> u64 {
    3600
}
fn default_rate_window() -> u64 {
    60
}
fn default_rate_limit() -> u32 {
    100
}
fn default_rate_rules() -> Vec<RateLimitRule> {
    vec![RateLimitRule {
        pattern: "/auth/*".to_string(),
        limit: 10,
        window: 60,
    }]
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout() -> u64 {
    30
}
fn default_half_open_max() -> u32 {
    3
}
fn default_session_expiration() -> u64 {
    3600
}
fn default_sampling_rate() -> f64 {
    1.0
}
fn default_cache_ttl() -> u64 {
    30
}
fn default_cache_capacity() -> usize {
    100
}
fn default_methods() -> Vec<String> {
    vec!["GET".to_string()]
}
fn default_true() -> bool {
    true
}

fn default_services() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("device".to_string(), "http://127.0.0.1:8081".to_string()),
        ("plugin".to_string(), "http://127.0.0.1:8082".to_string()),
        ("message".to_string(), "http://127.0.0.1:8083".to_string()),
    ])
}

/// The device/plugin/message/system path map.
fn default_routes() -> Vec<RouteConfig> {
    vec![
        RouteConfig::new("/device/status", &["GET"])
            .upstream("device")
            .param("id", "{device_id}"),
        RouteConfig::new("/device/refresh", &["POST"]).handler("device.refresh"),
        RouteConfig::new("/plugin/list", &["GET"]).upstream("plugin"),
        RouteConfig::new("/plugin/status", &["GET"])
            .upstream("plugin")
            .param("deviceId", "{device_id}"),
        RouteConfig::new("/plugin/toggle", &["POST"])
            .upstream("plugin")
            .param("id", "{plugin_id}")
            .default_value("status", "disabled")
            .rule("plugin_id", "required")
            .rule("status", "optional|in:enabled,disabled"),
        RouteConfig::new("/message/push", &["POST"])
            .upstream("message")
            .default_value("type", "text")
            .rule("device_id", "required")
            .rule("content", "required|string|max:2000")
            .rule("type", "optional|string|in:text,image,audio")
            .rule("sender", "optional|string|max:50"),
        RouteConfig::new("/message/list", &["GET"])
            .upstream("message")
            .param("deviceId", "{device_id}"),
        RouteConfig::new("/system/status", &["GET"])
            .handler("system.status")
            .uncached(),
        RouteConfig::new("/system/refresh", &["POST"]).handler("system.refresh"),
    ]
}

impl GatewayConfig {
    /// Parse TOML; missing sections take their defaults.
    pub fn from_toml_str(text: &str) -> GatewayResult<Self> {
        toml::from_str(text).map_err(|e| GatewayError::Config(format!("invalid config: {e}")))
    }

    /// Load from `path` (defaults if the file does not exist), apply
    /// environment overrides and validate.
    pub async fn load(path: &Path) -> GatewayResult<Self> {
        let mut config = match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::from_toml_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(GatewayError::Config(format!(
                    "failed to read config file '{}': {e}",
                    path.display()
                )))
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `GATEHOUSE_JWT_SECRET` and `GATEHOUSE_API_KEYS`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(
            std::env::var(ENV_JWT_SECRET).ok(),
            std::env::var(ENV_API_KEYS).ok(),
        );
    }

    fn apply_overrides(&mut self, secret: Option<String>, api_keys: Option<String>) {
        if let Some(secret) = secret.filter(|s| !s.is_empty()) {
            self.jwt.secret = secret;
        }
        if let Some(keys) = api_keys {
            self.auth.api_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    /// Reject configurations the gateway cannot run with.
    pub fn validate(&self) -> GatewayResult<()> {
        let fail = |msg: String| Err(GatewayError::Config(msg));

        if self.jwt.secret.trim().is_empty() {
            return fail(format!("jwt.secret is empty (set it or {ENV_JWT_SECRET})"));
        }
        if self.auth.api_keys.iter().any(|k| k.trim().is_empty()) {
            return fail("auth.api_keys contains an empty key".into());
        }
        if self.rate_limiting.limit == 0 || self.rate_limiting.window == 0 {
            return fail("rate_limiting.limit and rate_limiting.window must be positive".into());
        }
        if let Some(rule) = self
            .rate_limiting
            .rules
            .iter()
            .find(|r| r.limit == 0 || r.window == 0 || r.pattern.is_empty())
        {
            return fail(format!("invalid rate limit rule '{}'", rule.pattern));
        }
        if self.circuit_breaker.failure_threshold == 0
            || self.circuit_breaker.half_open_max_requests == 0
        {
            return fail("circuit_breaker thresholds must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.tracing.sampling_rate) {
            return fail(format!(
                "tracing.sampling_rate {} is outside [0, 1]",
                self.tracing.sampling_rate
            ));
        }
        if self.gateway.max_body_bytes == 0
            || self.gateway.max_upstream_body_bytes == 0
            || self.gateway.handler_timeout == 0
        {
            return fail(
                "gateway body limits and gateway.handler_timeout must be positive".into(),
            );
        }
        if crate::router::version_number(&self.gateway.default_version).is_none() {
            return fail(format!(
                "gateway.default_version '{}' is not of the form v<N>",
                self.gateway.default_version
            ));
        }
        if self.session.expiration == 0 {
            return fail("session.expiration must be positive".into());
        }

        for (name, base) in &self.services {
            if url::Url::parse(base).is_err() {
                return fail(format!("service '{name}' has an invalid URL '{base}'"));
            }
        }
        for route in &self.routes {
            let parsed = route.to_route()?;
            if !parsed.path.starts_with('/') {
                return fail(format!("route path '{}' must start with '/'", route.path));
            }
            let normalized = crate::router::normalize(&parsed.path, "").path;
            if RESERVED_PATHS.contains(&normalized.as_str()) {
                return fail(format!("route path '{}' is reserved", route.path));
            }
            if let Target::Remote(service) = &parsed.target {
                if !self.services.contains_key(service) {
                    return fail(format!(
                        "route {} references unknown upstream '{service}'",
                        route.path
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway.handler_timeout)
    }

    pub fn breaker_policy(&self) -> BreakerPolicy {
        BreakerPolicy {
            failure_threshold: self.circuit_breaker.failure_threshold,
            recovery_timeout: Duration::from_secs(self.circuit_breaker.recovery_timeout),
            half_open_max_requests: self.circuit_breaker.half_open_max_requests,
        }
    }

    /// A default configuration with the given secret, for tests and tooling.
    pub fn with_secret(secret: &str) -> Self {
        let mut config = Self::default();
        config.jwt.secret = secret.to_string();
        config
    }
}
