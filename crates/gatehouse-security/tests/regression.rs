#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Regression tests for gatehouse-security: JWT verification, API keys,
//! authorization policy and the sliding-window limiter under concurrency.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use gatehouse_core::{Clock, ManualClock};
use gatehouse_security::{AuthFailure, JwtCodec, RateLimitRule, RateLimiter, TokenAuthenticator};
use http::{HeaderMap, HeaderValue};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const NOW: u64 = 1_750_000_000;

fn bearer(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
    );
    headers
}

// --- TokenAuthenticator ---

#[test]
fn test_every_mutated_signature_byte_is_rejected() {
    let clock = ManualClock::new(NOW * 1000);
    let auth = TokenAuthenticator::new("k3y", &[], clock);
    let token = JwtCodec::new("k3y")
        .encode(&json!({"sub": "alice", "roles": "admin", "exp": NOW + 300, "iat": NOW}))
        .unwrap();
    assert_eq!(auth.authenticate(&bearer(&token)).unwrap().sub, "alice");

    let (signing_input, signature) = token.rsplit_once('.').unwrap();
    let raw = URL_SAFE_NO_PAD.decode(signature).unwrap();
    for i in 0..raw.len() {
        let mut mutated = raw.clone();
        mutated[i] ^= 0x01;
        let forged = format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(&mutated));
        assert_eq!(
            auth.authenticate(&bearer(&forged)),
            Err(AuthFailure::InvalidSignature),
            "byte {i} flip accepted"
        );
    }
}

#[test]
fn test_tampered_payload_is_rejected() {
    let clock = ManualClock::new(NOW * 1000);
    let auth = TokenAuthenticator::new("k3y", &[], clock);
    let token = JwtCodec::new("k3y")
        .encode(&json!({"sub": "bob", "exp": NOW + 300}))
        .unwrap();
    let mut parts: Vec<&str> = token.split('.').collect();
    let escalated = URL_SAFE_NO_PAD.encode(br#"{"sub":"bob","roles":"admin","exp":9999999999}"#);
    parts[1] = &escalated;
    assert_eq!(
        auth.verify_token(&parts.join(".")),
        Err(AuthFailure::InvalidSignature)
    );
}

#[test]
fn test_token_expires_when_clock_passes_exp() {
    let clock = ManualClock::new(NOW * 1000);
    let auth = TokenAuthenticator::new("k3y", &[], clock.clone());
    let token = JwtCodec::new("k3y")
        .encode(&json!({"sub": "carol", "exp": NOW + 30}))
        .unwrap();
    assert!(auth.verify_token(&token).is_ok());
    clock.advance(Duration::from_secs(30));
    assert_eq!(auth.verify_token(&token), Err(AuthFailure::Expired));
}

#[test]
fn test_any_configured_api_key_is_accepted() {
    let clock = ManualClock::new(NOW * 1000);
    let keys = vec!["first-key".to_string(), "second-key".to_string()];
    let auth = TokenAuthenticator::new("k3y", &keys, clock);
    assert!(auth.verify_api_key("first-key").is_ok());
    assert!(auth.verify_api_key("second-key").is_ok());
    assert_eq!(auth.verify_api_key("second"), Err(AuthFailure::InvalidSignature));
    assert_eq!(auth.verify_api_key(""), Err(AuthFailure::InvalidSignature));
}

#[test]
fn test_no_configured_keys_rejects_every_key() {
    let clock = ManualClock::new(NOW * 1000);
    let auth = TokenAuthenticator::new("k3y", &[], clock);
    assert!(!auth.api_keys_enabled());
    assert!(auth.verify_api_key("anything").is_err());
}

// --- RateLimiter ---

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admissions_never_exceed_limit() {
    let clock = ManualClock::new(NOW * 1000);
    let limiter = Arc::new(RateLimiter::new(10, Duration::from_secs(60), clock));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move { limiter.allow("10.1.1.1", "/message/push") }));
    }

    let mut admitted = 0;
    for h in handles {
        if h.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);
}

#[test]
fn test_auth_rule_is_tighter_than_default() {
    let clock = ManualClock::new(NOW * 1000);
    let limiter = RateLimiter::new(100, Duration::from_secs(60), clock.clone())
        .with_rules(&[RateLimitRule {
            pattern: "/auth/*".into(),
            limit: 10,
            window: 60,
        }])
        .unwrap();

    for _ in 0..10 {
        assert!(limiter.allow("ip", "/auth/session"));
    }
    let decision = limiter.check("ip", "/auth/session");
    assert!(!decision.allowed);
    assert_eq!(decision.limit, 10);
    assert_eq!(decision.reset_at, clock.now_secs() + 60);

    for _ in 0..20 {
        assert!(limiter.allow("ip", "/device/status"));
    }
}
