//! Distributed trace context propagated through `X-Trace-ID`-style headers.

use http::{HeaderMap, HeaderValue};

/// Inbound and outbound trace id header.
pub const TRACE_ID_HEADER: &str = "x-trace-id";
/// Span id header.
pub const SPAN_ID_HEADER: &str = "x-span-id";
/// Parent span id header.
pub const PARENT_SPAN_ID_HEADER: &str = "x-parent-span-id";
/// Sampling decision header (`1`/`0`).
pub const SAMPLED_HEADER: &str = "x-sampled";

const MAX_ID_LEN: usize = 128;

/// Trace identity of one request.
///
/// An unsampled context carries no ids and produces no headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    /// 32 hex chars when generated here.
    pub trace_id: String,
    /// 16 hex chars when generated here.
    pub span_id: String,
    /// The caller's span, if it sent one.
    pub parent_span_id: Option<String>,
    /// Whether this trace is recorded.
    pub sampled: bool,
}

impl TraceContext {
    /// Build the context for an inbound request.
    ///
    /// An inherited `X-Sampled` decision wins over the local rate; the caller's
    /// `X-Span-ID` (or, failing that, `X-Parent-Span-ID`) becomes the parent.
    pub fn init(headers: &HeaderMap, sampling_rate: f64) -> Self {
        let sampled = match header_str(headers, SAMPLED_HEADER) {
            Some(v) if is_truthy(v) => true,
            Some(v) if is_falsy(v) => false,
            _ => sampling_rate >= 1.0 || rand::random::<f64>() < sampling_rate,
        };
        if !sampled {
            return Self::default();
        }

        match header_str(headers, TRACE_ID_HEADER).filter(|id| valid_id(id)) {
            Some(trace_id) => {
                let parent_span_id = header_str(headers, SPAN_ID_HEADER)
                    .or_else(|| header_str(headers, PARENT_SPAN_ID_HEADER))
                    .filter(|id| valid_id(id))
                    .map(str::to_string);
                Self {
                    trace_id: trace_id.to_string(),
                    span_id: random_hex::<8>(),
                    parent_span_id,
                    sampled: true,
                }
            }
            None => Self {
                trace_id: random_hex::<16>(),
                span_id: random_hex::<8>(),
                parent_span_id: None,
                sampled: true,
            },
        }
    }

    /// A new span in the same trace, parented on this one.
    pub fn child(&self) -> Self {
        if !self.sampled {
            return Self::default();
        }
        Self {
            trace_id: self.trace_id.clone(),
            span_id: random_hex::<8>(),
            parent_span_id: Some(self.span_id.clone()),
            sampled: true,
        }
    }

    /// Write the tracing headers. No-op when unsampled.
    pub fn apply(&self, headers: &mut HeaderMap) {
        if !self.sampled {
            return;
        }
        insert(headers, TRACE_ID_HEADER, &self.trace_id);
        insert(headers, SPAN_ID_HEADER, &self.span_id);
        if let Some(parent) = &self.parent_span_id {
            insert(headers, PARENT_SPAN_ID_HEADER, parent);
        }
        insert(headers, SAMPLED_HEADER, "1");
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(name, v);
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

fn is_falsy(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no")
}

fn valid_id(id: &str) -> bool {
    id.len() <= MAX_ID_LEN && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    if getrandom::getrandom(&mut buf).is_err() {
        let fallback = uuid::Uuid::new_v4();
        for (dst, src) in buf.iter_mut().zip(fallback.as_bytes().iter().cycle()) {
            *dst = *src;
        }
    }
    buf
}

fn random_hex<const N: usize>() -> String {
    hex::encode(random_bytes::<N>())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        h
    }

    #[test]
    fn test_new_trace_has_hex_ids() {
        let ctx = TraceContext::init(&HeaderMap::new(), 1.0);
        assert!(ctx.sampled);
        assert_eq!(ctx.trace_id.len(), 32);
        assert_eq!(ctx.span_id.len(), 16);
        assert!(ctx.trace_id.bytes().all(|b| b.is_ascii_hexdigit()));
        assert!(ctx.parent_span_id.is_none());
    }

    #[test]
    fn test_inherits_trace_and_parents_on_caller_span() {
        let h = headers(&[("x-trace-id", "abc123"), ("x-span-id", "caller01")]);
        let ctx = TraceContext::init(&h, 1.0);
        assert_eq!(ctx.trace_id, "abc123");
        assert_eq!(ctx.parent_span_id.as_deref(), Some("caller01"));
        assert_ne!(ctx.span_id, "caller01");
    }

    #[test]
    fn test_explicit_parent_used_without_span() {
        let h = headers(&[("x-trace-id", "abc"), ("x-parent-span-id", "p1")]);
        let ctx = TraceContext::init(&h, 1.0);
        assert_eq!(ctx.parent_span_id.as_deref(), Some("p1"));
    }

    #[test]
    fn test_inherited_sampling_decision_wins() {
        let off = headers(&[("x-trace-id", "abc"), ("x-sampled", "0")]);
        assert_eq!(TraceContext::init(&off, 1.0), TraceContext::default());

        let on = headers(&[("x-sampled", "1")]);
        assert!(TraceContext::init(&on, 0.0).sampled);
    }

    #[test]
    fn test_zero_rate_never_samples() {
        for _ in 0..100 {
            assert!(!TraceContext::init(&HeaderMap::new(), 0.0).sampled);
        }
    }

    #[test]
    fn test_invalid_inherited_id_is_replaced() {
        let h = headers(&[("x-trace-id", "bad id;drop")]);
        let ctx = TraceContext::init(&h, 1.0);
        assert_eq!(ctx.trace_id.len(), 32);
    }

    #[test]
    fn test_child_shares_trace() {
        let ctx = TraceContext::init(&HeaderMap::new(), 1.0);
        let child = ctx.child();
        assert_eq!(child.trace_id, ctx.trace_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(ctx.span_id.as_str()));
        assert_ne!(child.span_id, ctx.span_id);
    }

    #[test]
    fn test_apply_headers() {
        let mut out = HeaderMap::new();
        TraceContext::default().apply(&mut out);
        assert!(out.is_empty());

        let ctx = TraceContext::init(&headers(&[("x-trace-id", "t1"), ("x-span-id", "s0")]), 1.0);
        ctx.apply(&mut out);
        assert_eq!(out.get("x-trace-id").unwrap(), "t1");
        assert_eq!(out.get("x-parent-span-id").unwrap(), "s0");
        assert_eq!(out.get("x-sampled").unwrap(), "1");
    }

    #[test]
    fn test_partial_rate_samples_some_traces() {
        let sampled = (0..2000)
            .filter(|_| TraceContext::init(&HeaderMap::new(), 0.5).sampled)
            .count();
        assert!((700..1300).contains(&sampled), "sampled {sampled} of 2000");
    }
}
