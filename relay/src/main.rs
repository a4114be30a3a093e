use anyhow::Result;
use axum::{
    body::Body,
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, Request, StatusCode},
    response::IntoResponse,
    routing::{any, get},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use hyper::header::{HeaderName, HeaderValue};
use hyper::Response;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

use porthole_shared::codec;
use porthole_shared::protocol::{is_keepalive, RequestFrame, ResponseFrame, MAX_MESSAGE_SIZE};
use porthole_shared::TunnelError;

mod correlation;
mod session;

use correlation::CorrelationTable;
use session::SessionSlot;

const NO_TUNNEL_BODY: &str = "Tunneling agent is not currently connected.";
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    sessions: Arc<SessionSlot>,
    correlation: Arc<CorrelationTable>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(SessionSlot::new()),
            correlation: Arc::new(CorrelationTable::new()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("porthole_relay=info")
        .init();

    let port: u16 = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PORT").ok())
        .and_then(|p| p.parse().ok())
        .unwrap_or(8008);

    let state = AppState::new();

    let app = Router::new()
        .route("/tunnel", get(ws_handler))
        .route("/health", get(|| async { "OK" }))
        .fallback(any(proxy_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Porthole relay listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let peer = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    ws.on_upgrade(|socket| handle_socket(socket, state, peer))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, peer: String) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    let Some(handle) = state.sessions.try_adopt(tx, peer.clone()).await else {
        warn!("Refusing tunnel from {}: an agent is already connected", peer);
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "A tunnel agent is already connected.".into(),
            })))
            .await;
        return;
    };

    info!("Tunnel connected from {}", peer);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) if is_keepalive(&text) => {
                        debug!("Keepalive from {}", peer);
                    }
                    Some(Ok(Message::Binary(data))) => handle_frame(&state, &data),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("Tunnel transport error from {}: {}", peer, e);
                        break;
                    }
                    _ => {}
                }
            }
            Some(data) = rx.recv() => {
                if sender.send(Message::Binary(data)).await.is_err() {
                    break;
                }
            }
        }
    }

    // Close the outbound channel first so a request handler racing this
    // teardown sees its send fail instead of waiting out the timeout.
    drop(rx);
    state.sessions.release(&handle).await;
    state.correlation.drain_and_fail("tunnel agent disconnected");
    info!("Tunnel disconnected from {}", handle.peer());
}

/// One inbound binary message from the agent. A malformed frame or an id
/// with no pending entry is dropped here; neither tears down the session.
fn handle_frame(state: &AppState, data: &[u8]) {
    match codec::decode_response(data) {
        Ok(frame) => {
            if let Err(e) = state.correlation.resolve(frame) {
                debug!("Dropping response: {}", e);
            }
        }
        Err(e) => warn!("Discarding malformed frame: {}", e),
    }
}

async fn proxy_handler(
    State(state): State<AppState>,
    req: Request<Body>,
) -> axum::response::Response {
    // No session: complete immediately, no queuing, no correlation entry.
    let Some(session) = state.sessions.current().await else {
        return (StatusCode::SERVICE_UNAVAILABLE, NO_TUNNEL_BODY).into_response();
    };

    let method = req.method().to_string();
    let url = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|val| (k.as_str().to_string(), val.to_string()))
        })
        .collect();

    // Bodies are fully buffered; the protocol has no streaming.
    let body = match axum::body::to_bytes(req.into_body(), MAX_MESSAGE_SIZE).await {
        Ok(b) => b.to_vec(),
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response()
        }
    };

    let id = state.correlation.next_id();
    let (tx, rx) = oneshot::channel();
    if let Err(e) = state.correlation.register(id, tx) {
        error!("Correlation invariant violated: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response();
    }

    let frame = RequestFrame {
        id,
        url,
        method,
        headers,
        body,
    };
    let encoded = match codec::encode_request(&frame) {
        Ok(data) => data,
        Err(e) => {
            state.correlation.discard(id);
            warn!("Failed to encode request {}: {}", id, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Encoding error").into_response();
        }
    };

    if session.send(encoded).await.is_err() {
        state.correlation.discard(id);
        return (StatusCode::BAD_GATEWAY, "Upstream send failed").into_response();
    }

    match timeout(RESPONSE_TIMEOUT, rx).await {
        Ok(Ok(Ok(resp))) => build_response(resp),
        Ok(Ok(Err(err @ TunnelError::UpstreamUnavailable(_)))) => {
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
        }
        Ok(Ok(Err(err))) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
        Ok(Err(_)) => {
            state.correlation.discard(id);
            (StatusCode::BAD_GATEWAY, "Upstream closed").into_response()
        }
        Err(_) => {
            state.correlation.discard(id);
            (StatusCode::GATEWAY_TIMEOUT, "Timeout").into_response()
        }
    }
}

/// Map a decoded Response frame onto the waiting public response. Only the
/// headers the backend specified are forwarded; entries that do not form
/// valid header names or values are skipped.
fn build_response(frame: ResponseFrame) -> axum::response::Response {
    let mut builder =
        Response::builder().status(StatusCode::from_u16(frame.status).unwrap_or(StatusCode::OK));
    if let Some(headers_mut) = builder.headers_mut() {
        for (k, v) in frame.headers {
            if let (Ok(hn), Ok(hv)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(&v),
            ) {
                headers_mut.insert(hn, hv);
            }
        }
    }
    match builder.body(Body::from(frame.body)) {
        Ok(r) => r.into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Response build error").into_response(),
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_response_maps_status_headers_and_body() {
        let resp = build_response(ResponseFrame {
            id: 0,
            status: 201,
            headers: vec![
                ("content-type".to_string(), "text/plain".to_string()),
                ("bad name!!\0".to_string(), "skipped".to_string()),
            ],
            body: b"hello".to_vec(),
        });
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers().get("content-type").unwrap(), "text/plain");
        assert_eq!(resp.headers().len(), 1);
    }

    #[test]
    fn test_build_response_tolerates_bogus_status() {
        let resp = build_response(ResponseFrame {
            id: 0,
            status: 7,
            headers: Vec::new(),
            body: Vec::new(),
        });
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
