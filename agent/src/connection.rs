//! Outbound tunnel connection lifecycle.
//!
//! One select loop owns the WebSocket. Inbound Request frames are handed to
//! spawned forwarding tasks, so a slow backend never blocks the loop, and
//! their Response frames funnel back through a single outbound channel —
//! the socket has exactly one writer. Responses therefore leave in
//! completion order, not arrival order; the relay correlates by id.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use porthole_shared::codec;
use porthole_shared::protocol::{is_keepalive, KEEPALIVE_INTERVAL_SECS, KEEPALIVE_TOKEN};

use crate::forward;

/// Link lifecycle. A single pass through `Connecting → Open → Closed`;
/// there is no automatic reconnection — the operator restarts the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
}

impl LinkState {
    pub fn can_transition(self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Connecting, Open) | (Connecting, Closed) | (Open, Closed)
        )
    }
}

fn advance(state: &mut LinkState, next: LinkState) {
    debug_assert!(state.can_transition(next), "{:?} -> {:?}", state, next);
    debug!("Link {:?} -> {:?}", state, next);
    *state = next;
}

/// Connect to the relay and serve the tunnel until the connection ends.
pub async fn run(relay_uri: &str, base_target_url: String) -> Result<()> {
    let mut state = LinkState::Connecting;
    info!("Connecting to relay: {}", relay_uri);

    let (ws_stream, _) = match connect_async(relay_uri).await {
        Ok(ok) => ok,
        Err(e) => {
            advance(&mut state, LinkState::Closed);
            return Err(e).context("We were unable to establish a connection with the server");
        }
    };

    advance(&mut state, LinkState::Open);
    info!("Connected to {}", relay_uri);
    info!("Tunneling requests to {}...", base_target_url);

    let (mut write, mut read) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
    let client = forward::backend_client()?;

    // First ping goes out one full period after open.
    let period = Duration::from_secs(KEEPALIVE_INTERVAL_SECS);
    let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        handle_message(&data, &client, &base_target_url, &out_tx);
                    }
                    Some(Ok(Message::Text(text))) if is_keepalive(&text) => {}
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            Some(out) = out_rx.recv() => {
                if write.send(out).await.is_err() {
                    break;
                }
            }
            _ = keepalive.tick() => {
                if write.send(Message::Text(KEEPALIVE_TOKEN.into())).await.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                let _ = write.send(Message::Close(None)).await;
                break;
            }
        }
    }

    // Dropping the loop cancels the keepalive timer with it.
    advance(&mut state, LinkState::Closed);
    info!("The connection has been terminated.");
    Ok(())
}

/// Decode one inbound message and spawn the backend call. A malformed frame
/// is logged and skipped without closing the connection.
fn handle_message(
    data: &[u8],
    client: &reqwest::Client,
    base_target_url: &str,
    out_tx: &mpsc::Sender<Message>,
) {
    let frame = match codec::decode_request(data) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Ignoring malformed frame: {}", e);
            return;
        }
    };

    info!("> {} {}", frame.method, frame.url);
    let client = client.clone();
    let base = base_target_url.to_string();
    let out = out_tx.clone();
    tokio::spawn(async move {
        let response = forward::dispatch(&client, &base, frame).await;
        let id = response.id;
        match codec::encode_response(&response) {
            Ok(encoded) => {
                if out.send(Message::Binary(encoded)).await.is_err() {
                    warn!("Connection closed before response {} could be sent", id);
                }
            }
            Err(e) => error!("Failed to encode response {}: {}", id, e),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_state_transitions() {
        use LinkState::*;
        assert!(Connecting.can_transition(Open));
        assert!(Connecting.can_transition(Closed));
        assert!(Open.can_transition(Closed));

        assert!(!Open.can_transition(Connecting));
        assert!(!Closed.can_transition(Open));
        assert!(!Closed.can_transition(Connecting));
        assert!(!Open.can_transition(Open));
    }
}
