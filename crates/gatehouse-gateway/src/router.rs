use crate::validate::RuleSet;
use gatehouse_core::{GatewayError, GatewayResult};
use http::{HeaderMap, Method};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Lowest API version still served.
pub const MIN_API_VERSION: u32 = 1;

/// Where a route's requests go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A handler in the [`HandlerRegistry`](crate::dispatch::HandlerRegistry).
    Local(String),
    /// An upstream service by name.
    Remote(String),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(id) => write!(f, "handler:{id}"),
            Self::Remote(service) => write!(f, "upstream:{service}"),
        }
    }
}

/// One entry of the route table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Normalized path, possibly with `{name}` segments.
    pub path: String,
    pub methods: Vec<Method>,
    pub target: Target,
    /// Static parameters; a value of `{field}` copies the payload's `field`.
    pub params: BTreeMap<String, String>,
    /// Values used for payload keys the caller left out.
    pub defaults: BTreeMap<String, String>,
    /// Skip authentication.
    pub public: bool,
    /// GET responses may be cached.
    pub cacheable: bool,
    /// Field rules the converted payload must satisfy.
    pub rules: RuleSet,
}

impl Route {
    /// A protected, cacheable route with no parameters.
    pub fn new(path: &str, methods: &[Method], target: Target) -> Self {
        Self {
            path: path.to_string(),
            methods: methods.to_vec(),
            target,
            params: BTreeMap::new(),
            defaults: BTreeMap::new(),
            public: false,
            cacheable: true,
            rules: RuleSet::default(),
        }
    }

    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }

    pub fn uncached(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn default_value(mut self, key: &str, value: &str) -> Self {
        self.defaults.insert(key.to_string(), value.to_string());
        self
    }

    pub fn validated(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }
}

/// A route matched against a request, with its path captures.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub route: Arc<Route>,
    pub captures: BTreeMap<String, String>,
}

/// Why a path/method pair did not resolve.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("route not found")]
    NotFound,
    #[error("method not allowed")]
    MethodNotAllowed {
        /// Sorted methods the path accepts.
        allowed: Vec<String>,
    },
}

impl RouteError {
    /// Attach the request details for the error response.
    pub fn into_gateway_error(self, path: &str, method: &Method) -> GatewayError {
        match self {
            Self::NotFound => GatewayError::RouteNotFound(path.to_string()),
            Self::MethodNotAllowed { allowed } => GatewayError::MethodNotAllowed {
                method: method.to_string(),
                allowed,
            },
        }
    }
}

/// Request header naming the API version when the path carries none.
pub const VERSION_REQUEST_HEADER: &str = "x-api-version";
/// Query parameter naming the API version when path and header carry none.
pub const VERSION_QUERY_PARAM: &str = "api_version";

/// A request path with the gateway prefix and version segment removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPath {
    pub path: String,
    /// The leading `v<N>` segment, if there was one.
    pub version: Option<String>,
}

/// Normalize a raw request path.
///
/// Strips the query, the gateway prefix and a leading `v<N>` segment, then
/// collapses the rest to a single-slash-led path without a trailing slash.
pub fn normalize(raw: &str, prefix: &str) -> NormalizedPath {
    let path = raw.split_once('?').map_or(raw, |(p, _)| p);
    let prefix = prefix.trim_end_matches('/');
    let path = match path.strip_prefix(prefix) {
        Some(rest) if !prefix.is_empty() && (rest.is_empty() || rest.starts_with('/')) => rest,
        _ => path,
    };

    let mut segments = path.split('/').filter(|s| !s.is_empty()).peekable();
    let version = match segments.peek() {
        Some(first) if version_number(first).is_some() => {
            let v = first.to_string();
            segments.next();
            Some(v)
        }
        _ => None,
    };

    let rest: Vec<&str> = segments.collect();
    NormalizedPath {
        path: format!("/{}", rest.join("/")),
        version,
    }
}

/// The number of a `v<N>` segment.
pub fn version_number(segment: &str) -> Option<u32> {
    let digits = segment.strip_prefix('v')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Pick the API version: path segment, then `X-API-Version`, then the
/// `api_version` query parameter, then `default`. Header and query values
/// not of the form `v<N>` are ignored.
pub fn negotiate_version(
    path_version: Option<&str>,
    headers: &HeaderMap,
    query: Option<&str>,
    default: &str,
) -> String {
    if let Some(v) = path_version {
        return v.to_string();
    }
    let from_header = headers
        .get(VERSION_REQUEST_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| version_number(v).is_some())
        .map(str::to_string);
    let from_query = || {
        url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
            .find(|(k, _)| k == VERSION_QUERY_PARAM)
            .map(|(_, v)| v.into_owned())
            .filter(|v| version_number(v).is_some())
    };
    from_header
        .or_else(from_query)
        .unwrap_or_else(|| default.to_string())
}

/// Reject versions below [`MIN_API_VERSION`].
pub fn check_version(version: &str) -> GatewayResult<()> {
    match version_number(version) {
        Some(n) if n >= MIN_API_VERSION => Ok(()),
        _ => Err(GatewayError::Validation(format!(
            "Unsupported API version {version}"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Capture(String),
}

fn parse_pattern(path: &str) -> Option<Vec<Segment>> {
    let segments: Vec<Segment> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some(name) => Segment::Capture(name.to_string()),
            None => Segment::Literal(s.to_string()),
        })
        .collect();
    segments
        .iter()
        .any(|s| matches!(s, Segment::Capture(_)))
        .then_some(segments)
}

fn match_pattern(pattern: &[Segment], path: &str) -> Option<BTreeMap<String, String>> {
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if parts.len() != pattern.len() {
        return None;
    }
    let mut captures = BTreeMap::new();
    for (segment, part) in pattern.iter().zip(parts) {
        match segment {
            Segment::Literal(lit) if lit == part => {}
            Segment::Literal(_) => return None,
            Segment::Capture(name) => {
                captures.insert(name.clone(), part.to_string());
            }
        }
    }
    Some(captures)
}

/// Route lookup: exact paths first, then `{name}` patterns in declaration order.
#[derive(Debug, Default)]
pub struct RouteTable {
    exact: HashMap<String, Vec<Arc<Route>>>,
    patterns: Vec<(Vec<Segment>, Arc<Route>)>,
    declared: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route. A path may appear more than once with disjoint methods.
    pub fn add(&mut self, mut route: Route) -> GatewayResult<()> {
        route.path = normalize(&route.path, "").path;
        if route.methods.is_empty() {
            return Err(GatewayError::Config(format!(
                "route {} declares no methods",
                route.path
            )));
        }
        for existing in self.declared.iter().filter(|r| r.path == route.path) {
            if let Some(m) = route.methods.iter().find(|m| existing.methods.contains(m)) {
                return Err(GatewayError::Config(format!(
                    "duplicate route {m} {}",
                    route.path
                )));
            }
        }

        let route = Arc::new(route);
        match parse_pattern(&route.path) {
            Some(pattern) => self.patterns.push((pattern, route.clone())),
            None => self
                .exact
                .entry(route.path.clone())
                .or_default()
                .push(route.clone()),
        }
        self.declared.push(route);
        Ok(())
    }

    /// Resolve a normalized path and method.
    pub fn resolve(&self, path: &str, method: &Method) -> Result<ResolvedRoute, RouteError> {
        let mut allowed = BTreeSet::new();

        if let Some(routes) = self.exact.get(path) {
            for route in routes {
                if route.methods.contains(method) {
                    return Ok(ResolvedRoute {
                        route: route.clone(),
                        captures: BTreeMap::new(),
                    });
                }
                allowed.extend(route.methods.iter().map(ToString::to_string));
            }
        } else {
            for (pattern, route) in &self.patterns {
                let Some(captures) = match_pattern(pattern, path) else {
                    continue;
                };
                if route.methods.contains(method) {
                    return Ok(ResolvedRoute {
                        route: route.clone(),
                        captures,
                    });
                }
                allowed.extend(route.methods.iter().map(ToString::to_string));
            }
        }

        if allowed.is_empty() {
            Err(RouteError::NotFound)
        } else {
            Err(RouteError::MethodNotAllowed {
                allowed: allowed.into_iter().collect(),
            })
        }
    }

    /// Routes in declaration order.
    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.declared.iter().map(AsRef::as_ref)
    }

    pub fn len(&self) -> usize {
        self.declared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declared.is_empty()
    }
}
