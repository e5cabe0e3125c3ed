//! Conversion of request bodies into the JSON payload handed to handlers.

use crate::router::Route;
use bytes::Bytes;
use gatehouse_core::{GatewayError, GatewayRequest, GatewayResult};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Parse the body by content type and apply the route's parameter mapping.
///
/// Order: body, then query parameters for keys still missing, then path
/// captures and static parameters (which override), then defaults.
pub async fn build_payload(
    request: &GatewayRequest,
    route: &Route,
    captures: &BTreeMap<String, String>,
) -> GatewayResult<Value> {
    let mut payload = parse_body(request).await?;

    if let Some(query) = request.query.as_deref() {
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            payload
                .entry(k.into_owned())
                .or_insert_with(|| Value::String(v.into_owned()));
        }
    }

    for (k, v) in captures {
        payload.insert(k.clone(), Value::String(v.clone()));
    }
    apply_params(&mut payload, &route.params);

    for (k, v) in &route.defaults {
        let missing = payload
            .get(k)
            .map_or(true, |v| v.is_null() || v.as_str() == Some(""));
        if missing {
            payload.insert(k.clone(), Value::String(v.clone()));
        }
    }

    Ok(Value::Object(payload))
}

/// Static values override; `{field}` copies the payload's `field`, and
/// clears `key` when `field` is absent.
fn apply_params(payload: &mut Map<String, Value>, params: &BTreeMap<String, String>) {
    for (key, value) in params {
        let placeholder = value.strip_prefix('{').and_then(|v| v.strip_suffix('}'));
        match placeholder {
            Some(field) => match payload.get(field).cloned() {
                Some(v) => {
                    payload.insert(key.clone(), v);
                }
                None => {
                    payload.remove(key);
                }
            },
            None => {
                payload.insert(key.clone(), Value::String(value.clone()));
            }
        }
    }
}

async fn parse_body(request: &GatewayRequest) -> GatewayResult<Map<String, Value>> {
    if request.body.is_empty() {
        return Ok(Map::new());
    }
    let content_type = request
        .content_type()
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.contains("json") {
        let value: Value = serde_json::from_slice(&request.body)
            .map_err(|e| GatewayError::Validation(format!("Malformed JSON body: {e}")))?;
        return Ok(match value {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => Map::from_iter([("data".to_string(), other)]),
        });
    }
    if content_type.starts_with("multipart/form-data") {
        let raw = request.content_type().unwrap_or_default();
        return parse_multipart(raw, request.body.clone()).await;
    }
    Ok(parse_form(&request.body))
}

fn parse_form(body: &[u8]) -> Map<String, Value> {
    url::form_urlencoded::parse(body)
        .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
        .collect()
}

/// Text fields become strings; file fields become `{filename, content_type, size}`.
async fn parse_multipart(content_type: &str, body: Bytes) -> GatewayResult<Map<String, Value>> {
    let boundary = multer::parse_boundary(content_type)
        .map_err(|e| GatewayError::Validation(format!("Invalid multipart content type: {e}")))?;
    let stream = futures_util::stream::once(async move { Ok::<Bytes, std::io::Error>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut fields = Map::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GatewayError::Validation(format!("Malformed multipart body: {e}")))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let filename = field.file_name().map(str::to_string);
        let part_type = field.content_type().map(ToString::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| GatewayError::Validation(format!("Malformed multipart body: {e}")))?;

        let value = match filename {
            Some(filename) => serde_json::json!({
                "filename": filename,
                "content_type": part_type.unwrap_or_else(|| "application/octet-stream".to_string()),
                "size": data.len(),
            }),
            None => Value::String(String::from_utf8_lossy(&data).into_owned()),
        };
        fields.insert(name, value);
    }
    Ok(fields)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::router::Target;
    use http::Method;
    use serde_json::json;

    fn route() -> Route {
        Route::new("/plugin/toggle", &[Method::POST], Target::Remote("plugin".into()))
    }

    fn post(content_type: &str, body: &'static str) -> GatewayRequest {
        GatewayRequest::new(Method::POST, "/plugin/toggle")
            .with_header("content-type", content_type)
            .with_body(body)
    }

    #[tokio::test]
    async fn test_json_body() {
        let req = post("application/json", r#"{"plugin_id": 3, "status": "enabled"}"#);
        let v = build_payload(&req, &route(), &BTreeMap::new()).await.unwrap();
        assert_eq!(v, json!({"plugin_id": 3, "status": "enabled"}));
    }

    #[tokio::test]
    async fn test_malformed_json_is_validation_error() {
        let req = post("application/json", "{nope");
        let err = build_payload(&req, &route(), &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[tokio::test]
    async fn test_empty_body_is_empty_object() {
        let req = GatewayRequest::new(Method::GET, "/plugin/list");
        let v = build_payload(&req, &route(), &BTreeMap::new()).await.unwrap();
        assert_eq!(v, json!({}));
    }

    #[tokio::test]
    async fn test_form_body_and_query_fill() {
        let req = GatewayRequest::new(Method::POST, "/message/push?type=alert&content=ignored")
            .with_header("content-type", "application/x-www-form-urlencoded")
            .with_body("device_id=7&content=hello+world");
        let v = build_payload(&req, &route(), &BTreeMap::new()).await.unwrap();
        assert_eq!(
            v,
            json!({"device_id": "7", "content": "hello world", "type": "alert"})
        );
    }

    #[tokio::test]
    async fn test_unknown_content_type_tries_form() {
        let req = post("text/plain", "a=1&b=2");
        let v = build_payload(&req, &route(), &BTreeMap::new()).await.unwrap();
        assert_eq!(v, json!({"a": "1", "b": "2"}));
    }

    #[tokio::test]
    async fn test_placeholder_and_static_params() {
        let route = route()
            .param("id", "{plugin_id}")
            .param("source", "gateway")
            .default_value("status", "disabled");
        let req = post("application/json", r#"{"plugin_id": 9, "source": "client"}"#);
        let v = build_payload(&req, &route, &BTreeMap::new()).await.unwrap();
        assert_eq!(v["id"], 9);
        assert_eq!(v["source"], "gateway");
        assert_eq!(v["status"], "disabled");
    }

    #[tokio::test]
    async fn test_captures_feed_placeholders() {
        let route = route().param("id", "{device_id}");
        let captures = BTreeMap::from([("device_id".to_string(), "42".to_string())]);
        let req = GatewayRequest::new(Method::GET, "/device/42");
        let v = build_payload(&req, &route, &captures).await.unwrap();
        assert_eq!(v["id"], "42");
    }

    #[tokio::test]
    async fn test_missing_placeholder_source_drops_client_value() {
        let route = route().param("id", "{plugin_id}");
        let req = post("application/json", r#"{"id": "client-chosen"}"#);
        let v = build_payload(&req, &route, &BTreeMap::new()).await.unwrap();
        assert!(v.get("id").is_none());
        assert_eq!(v, json!({}));
    }

    #[tokio::test]
    async fn test_multipart_fields_and_files() {
        let body = "--XyZ\r\n\
Content-Disposition: form-data; name=\"device_id\"\r\n\r\n\
12\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"firmware\"; filename=\"fw.bin\"\r\n\
Content-Type: application/octet-stream\r\n\r\n\
ABCDEFGH\r\n\
--XyZ--\r\n";
        let req = post("multipart/form-data; boundary=XyZ", body);
        let v = build_payload(&req, &route(), &BTreeMap::new()).await.unwrap();
        assert_eq!(v["device_id"], "12");
        assert_eq!(
            v["firmware"],
            json!({"filename": "fw.bin", "content_type": "application/octet-stream", "size": 8})
        );
    }
}
