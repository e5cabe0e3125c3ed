use dashmap::DashMap;
use gatehouse_core::{GatewayError, GatewayResult, SharedClock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// A per-route override of the global limit.
///
/// `pattern` is matched against the normalized route path; `*` matches any
/// run of characters (`/auth/*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Glob over the normalized path.
    pub pattern: String,
    /// Admissions per window.
    pub limit: u32,
    /// Window length in seconds.
    pub window: u64,
}

struct CompiledRule {
    pattern: String,
    regex: Regex,
    limit: u32,
    window_ms: u64,
}

struct RateWindow {
    stamps: VecDeque<u64>,
    window_ms: u64,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request was admitted.
    pub allowed: bool,
    /// The limit that applied.
    pub limit: u32,
    /// Slots left in the current window after this decision.
    pub remaining: u32,
    /// Epoch seconds at which the oldest admission leaves the window.
    pub reset_at: u64,
}

/// Sliding-window rate limiter keyed by client and route.
///
/// Each window lives in its own map entry, so unrelated clients never
/// contend on the same lock.
pub struct RateLimiter {
    default_limit: u32,
    default_window_ms: u64,
    rules: Vec<CompiledRule>,
    windows: DashMap<(String, String), RateWindow>,
    clock: SharedClock,
}

fn compile_glob(pattern: &str) -> Result<Regex, regex::Error> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$"))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl RateLimiter {
    /// Create a limiter admitting `limit` requests per `window` by default.
    pub fn new(limit: u32, window: Duration, clock: SharedClock) -> Self {
        Self {
            default_limit: limit,
            default_window_ms: millis(window),
            rules: Vec::new(),
            windows: DashMap::new(),
            clock,
        }
    }

    /// Add route-specific rules; the first matching rule wins.
    pub fn with_rules(mut self, rules: &[RateLimitRule]) -> GatewayResult<Self> {
        for rule in rules {
            let regex = compile_glob(&rule.pattern).map_err(|e| {
                GatewayError::Config(format!("invalid rate limit pattern '{}': {e}", rule.pattern))
            })?;
            self.rules.push(CompiledRule {
                pattern: rule.pattern.clone(),
                regex,
                limit: rule.limit,
                window_ms: rule.window.saturating_mul(1000),
            });
        }
        Ok(self)
    }

    /// Returns `true` if the request is admitted.
    pub fn allow(&self, client_key: &str, route_key: &str) -> bool {
        self.check(client_key, route_key).allowed
    }

    /// Admit or reject one request, reporting the window state.
    ///
    /// Rejections do not consume a slot.
    pub fn check(&self, client_key: &str, route_key: &str) -> RateDecision {
        let (bucket, limit, window_ms) = match self.rules.iter().find(|r| r.regex.is_match(route_key)) {
            Some(rule) => (rule.pattern.as_str(), rule.limit, rule.window_ms),
            None => (route_key, self.default_limit, self.default_window_ms),
        };
        let now = self.clock.now_millis();

        let mut entry = self
            .windows
            .entry((client_key.to_string(), bucket.to_string()))
            .or_insert_with(|| RateWindow {
                stamps: VecDeque::new(),
                window_ms,
            });
        let window = entry.value_mut();
        window.window_ms = window_ms;

        while let Some(&oldest) = window.stamps.front() {
            if now.saturating_sub(oldest) >= window_ms {
                window.stamps.pop_front();
            } else {
                break;
            }
        }

        let count = u32::try_from(window.stamps.len()).unwrap_or(u32::MAX);
        let allowed = count < limit;
        if allowed {
            window.stamps.push_back(now);
        }

        let oldest = window.stamps.front().copied().unwrap_or(now);
        let reset_at = oldest.saturating_add(window_ms).div_ceil(1000);
        let used = u32::try_from(window.stamps.len()).unwrap_or(u32::MAX);

        if !allowed {
            debug!(client = %client_key, bucket = %bucket, limit, "Rate limit window full");
        }

        RateDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(used),
            reset_at,
        }
    }

    /// Drop windows whose every entry has aged out.
    pub fn prune_idle(&self) {
        let now = self.clock.now_millis();
        self.windows.retain(|_, w| {
            w.stamps
                .back()
                .is_some_and(|&newest| now.saturating_sub(newest) < w.window_ms)
        });
    }

    /// Number of tracked windows.
    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }
}
