use crate::pipeline::Gateway;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    response::{IntoResponse, Response},
    Router,
};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use gatehouse_core::{GatewayError, GatewayRequest, GatewayResponse};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// HTTP front of the gateway.
pub struct GatewayServer;

impl GatewayServer {
    /// Build an axum app that hands every request to the pipeline.
    ///
    /// Routing happens inside the pipeline, so the app has a single fallback.
    pub fn build(gateway: Arc<Gateway>) -> Router {
        Router::new().fallback(entry).with_state(gateway)
    }

    /// Serve on `listener` until `shutdown` resolves.
    pub async fn serve<F>(
        gateway: Arc<Gateway>,
        listener: TcpListener,
        shutdown: F,
    ) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Gateway listening");
        }
        let app = Self::build(gateway);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
    }
}

async fn entry(State(gateway): State<Arc<Gateway>>, request: Request) -> Response {
    let limit = gateway.max_body_bytes();
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let (parts, body) = request.into_parts();

    let uri = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), ToString::to_string);
    let mut inbound = GatewayRequest::new(parts.method, &uri);
    inbound.headers = parts.headers;
    if let Some(ip) = client_ip {
        inbound = inbound.with_client_ip(ip);
    }

    let declared_too_big = inbound
        .header(http::header::CONTENT_LENGTH.as_str())
        .and_then(|v| v.trim().parse::<usize>().ok())
        .is_some_and(|n| n > limit);
    if declared_too_big {
        return into_response(gateway.reject(&GatewayError::PayloadTooLarge { limit }));
    }

    match read_body(body, limit).await {
        Ok(bytes) => inbound = inbound.with_body(bytes),
        Err(err) => {
            warn!(error = %err, "Request body rejected");
            return into_response(gateway.reject(&err));
        }
    }

    into_response(gateway.handle(inbound).await)
}

/// Collect at most `limit` bytes. Overflow is 413; a broken stream is 400.
async fn read_body(body: Body, limit: usize) -> Result<Bytes, GatewayError> {
    let mut stream = body.into_data_stream();
    let mut collected = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|e| GatewayError::Validation(format!("Failed to read request body: {e}")))?;
        if collected.len() + chunk.len() > limit {
            return Err(GatewayError::PayloadTooLarge { limit });
        }
        collected.extend_from_slice(&chunk);
    }
    Ok(collected.freeze())
}

fn into_response(response: GatewayResponse) -> Response {
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = response.status;
    *out.headers_mut() = response.headers;
    out.into_response()
}
