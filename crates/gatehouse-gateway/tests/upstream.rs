#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Upstream forwarding, circuit breaking and caching against mock services.

use gatehouse_core::{GatewayRequest, ManualClock};
use gatehouse_gateway::{CircuitState, Gateway, GatewayConfig, Route, Target};
use http::{Method, StatusCode};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, header_exists, method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const API_KEY: &str = "upstream-key";

fn gateway(upstream: &MockServer, clock: Arc<ManualClock>) -> Gateway {
    let mut config = GatewayConfig::with_secret("upstream-secret");
    config.auth.api_keys = vec![API_KEY.to_string()];
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.half_open_max_requests = 1;
    config.gateway.handler_timeout = 1;
    for base in config.services.values_mut() {
        *base = upstream.uri();
    }
    Gateway::builder(config).clock(clock).build().unwrap()
}

fn request(m: Method, uri: &str) -> GatewayRequest {
    GatewayRequest::new(m, uri).with_header("x-api-key", API_KEY)
}

#[tokio::test]
async fn test_get_forwards_params_as_query() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/device/status"))
        .and(query_param("id", "42"))
        .and(query_param("device_id", "42"))
        .and(header_exists("x-trace-id"))
        .and(header("x-gateway-subject", "api-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"online": true})))
        .expect(1)
        .mount(&upstream)
        .await;

    let gw = gateway(&upstream, ManualClock::new(0));
    let resp = gw
        .handle(request(Method::GET, "/api/gateway/device/status?device_id=42"))
        .await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body_json().unwrap()["online"], true);
    assert_eq!(resp.header("x-cache"), Some("MISS"));

    let again = gw
        .handle(request(Method::GET, "/api/gateway/device/status?device_id=42"))
        .await;
    assert_eq!(again.header("x-cache"), Some("HIT"));
}

#[tokio::test]
async fn test_post_body_gets_route_defaults() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/plugin/toggle"))
        .and(body_json(json!({"plugin_id": "p9", "id": "p9", "status": "disabled"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(1)
        .mount(&upstream)
        .await;

    let gw = gateway(&upstream, ManualClock::new(0));
    let resp = gw
        .handle(
            request(Method::POST, "/api/gateway/plugin/toggle")
                .with_header("content-type", "application/json")
                .with_body(r#"{"plugin_id":"p9"}"#),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);
}

#[tokio::test]
async fn test_form_body_is_converted_to_json() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/message/push"))
        .and(body_json(json!({"device_id": "d1", "content": "hi there", "type": "text"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"queued": 1})))
        .expect(1)
        .mount(&upstream)
        .await;

    let gw = gateway(&upstream, ManualClock::new(0));
    let resp = gw
        .handle(
            request(Method::POST, "/api/gateway/message/push")
                .with_header("content-type", "application/x-www-form-urlencoded")
                .with_body("device_id=d1&content=hi+there"),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);
}

#[tokio::test]
async fn test_breaker_opens_then_recovers() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/plugin/list"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/plugin/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"plugins": []})))
        .expect(1)
        .mount(&upstream)
        .await;

    let clock = ManualClock::new(1_000_000);
    let gw = gateway(&upstream, clock.clone());

    for _ in 0..2 {
        let resp = gw.handle(request(Method::GET, "/api/gateway/plugin/list")).await;
        assert_eq!(resp.status, StatusCode::BAD_GATEWAY);
        assert_eq!(resp.body_json().unwrap()["code"], "DOWNSTREAM_ERROR");
        assert_ne!(resp.header("x-cache"), Some("HIT"));
    }
    assert_eq!(gw.breakers().snapshot("plugin").state, CircuitState::Open);

    let rejected = gw.handle(request(Method::GET, "/api/gateway/plugin/list")).await;
    assert_eq!(rejected.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(rejected.body_json().unwrap()["code"], "CIRCUIT_OPEN");

    clock.advance(Duration::from_secs(31));
    let trial = gw.handle(request(Method::GET, "/api/gateway/plugin/list")).await;
    assert_eq!(trial.status, StatusCode::OK);
    assert_eq!(gw.breakers().snapshot("plugin").state, CircuitState::Closed);
}

#[tokio::test]
async fn test_slow_upstream_times_out() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/message/list"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&upstream)
        .await;

    let gw = gateway(&upstream, ManualClock::new(0));
    let resp = gw
        .handle(request(Method::GET, "/api/gateway/message/list?device_id=7"))
        .await;
    assert_eq!(resp.status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(gw.breakers().snapshot("message").consecutive_failures, 1);
}

#[tokio::test]
async fn test_unreachable_upstream_is_502() {
    let mut config = GatewayConfig::with_secret("upstream-secret");
    config.auth.api_keys = vec![API_KEY.to_string()];
    config
        .services
        .insert("device".into(), "http://127.0.0.1:1".into());
    let gw = Gateway::from_config(config).unwrap();

    let resp = gw
        .handle(request(Method::GET, "/api/gateway/device/status?device_id=1"))
        .await;
    assert_eq!(resp.status, StatusCode::BAD_GATEWAY);
    assert_eq!(resp.body_json().unwrap()["code"], "DOWNSTREAM_ERROR");
}

#[tokio::test]
async fn test_upstream_server_error_is_enveloped() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/plugin/list"))
        .respond_with(
            ResponseTemplate::new(500).set_body_string("Traceback: db password=hunter2 at /srv/app.py"),
        )
        .mount(&upstream)
        .await;

    let gw = gateway(&upstream, ManualClock::new(0));
    let resp = gw.handle(request(Method::GET, "/api/gateway/plugin/list")).await;
    assert_eq!(resp.status, StatusCode::BAD_GATEWAY);
    assert_eq!(resp.header("content-type"), Some("application/json"));
    let body = resp.body_json().unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "DOWNSTREAM_ERROR");
    let raw = String::from_utf8_lossy(&resp.body);
    assert!(!raw.contains("hunter2"));
    assert!(!raw.contains("Traceback"));
    assert_eq!(gw.breakers().snapshot("plugin").consecutive_failures, 1);
}

#[tokio::test]
async fn test_upstream_client_error_passes_through() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/plugin/list"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"success": false})))
        .mount(&upstream)
        .await;

    let gw = gateway(&upstream, ManualClock::new(0));
    let resp = gw.handle(request(Method::GET, "/api/gateway/plugin/list")).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
    assert_eq!(gw.breakers().snapshot("plugin").consecutive_failures, 0);
}

#[tokio::test]
async fn test_oversized_upstream_body_is_502() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/plugin/list"))
        .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
        .mount(&upstream)
        .await;

    let mut config = GatewayConfig::with_secret("upstream-secret");
    config.auth.api_keys = vec![API_KEY.to_string()];
    config.gateway.max_upstream_body_bytes = 1024;
    for base in config.services.values_mut() {
        *base = upstream.uri();
    }
    let gw = Gateway::builder(config)
        .clock(ManualClock::new(0))
        .build()
        .unwrap();

    let resp = gw.handle(request(Method::GET, "/api/gateway/plugin/list")).await;
    assert_eq!(resp.status, StatusCode::BAD_GATEWAY);
    assert_eq!(resp.body_json().unwrap()["code"], "DOWNSTREAM_ERROR");
}

#[tokio::test]
async fn test_invalid_payload_never_reaches_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/message/push"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let gw = gateway(&upstream, ManualClock::new(0));
    let resp = gw
        .handle(
            request(Method::POST, "/api/gateway/message/push")
                .with_header("content-type", "application/json")
                .with_body(r#"{"device_id":"d1","type":"video"}"#),
        )
        .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    let body = resp.body_json().unwrap();
    assert_eq!(body["code"], "VALIDATION_ERROR");
    let message = body["message"].as_str().unwrap();
    assert!(message.contains("content is required"));
    assert!(message.contains("type must be one of"));
}

#[tokio::test]
async fn test_parameterised_route_shares_one_rate_window() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/device/[0-9]+/log$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"lines": []})))
        .expect(2)
        .mount(&upstream)
        .await;

    let mut config = GatewayConfig::with_secret("upstream-secret");
    config.auth.api_keys = vec![API_KEY.to_string()];
    config.rate_limiting.limit = 2;
    for base in config.services.values_mut() {
        *base = upstream.uri();
    }
    let gw = Gateway::builder(config)
        .clock(ManualClock::new(0))
        .route(Route::new("/device/{id}/log", &[Method::GET], Target::Remote("device".into())).uncached())
        .build()
        .unwrap();

    for id in 1..=2 {
        let resp = gw
            .handle(request(Method::GET, &format!("/api/gateway/device/{id}/log")))
            .await;
        assert_eq!(resp.status, StatusCode::OK);
    }
    let resp = gw.handle(request(Method::GET, "/api/gateway/device/3/log")).await;
    assert_eq!(resp.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.header("x-ratelimit-remaining"), Some("0"));
    assert_eq!(resp.body_json().unwrap()["code"], "RATE_LIMITED");
}
