//! Binary protocol types for relay/agent communication.

use serde::{Deserialize, Serialize};

/// Maximum message size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Keepalive token, sent agent-to-relay as a text message. Purely advisory;
/// it keeps intermediaries from idling out the connection.
pub const KEEPALIVE_TOKEN: &str = "PING";

/// Keepalive period in seconds.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 60;

/// Frame tags, first byte of every binary message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameTag {
    /// Public request forwarded relay-to-agent
    Request = 0x01,
    /// Backend answer forwarded agent-to-relay
    Response = 0x02,
}

impl FrameTag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(FrameTag::Request),
            0x02 => Some(FrameTag::Response),
            _ => None,
        }
    }
}

/// One public HTTP request, forwarded through the tunnel.
///
/// `id` is assigned by the relay, monotonically from 0, and is unique among
/// in-flight requests. `url` carries the full path and query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// The backend's answer to a [`RequestFrame`] with the same `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// True if an incoming text message is the keepalive token. Checked before
/// any binary decode is attempted.
pub fn is_keepalive(text: &str) -> bool {
    text == KEEPALIVE_TOKEN
}
