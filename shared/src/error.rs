//! Error types for Porthole.

use thiserror::Error;

use crate::codec::CodecError;

pub type Result<T> = std::result::Result<T, TunnelError>;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A correlation entry already exists for this id. Monotonic assignment
    /// makes this unreachable; hitting it is a programming error.
    #[error("Duplicate request id {0}")]
    DuplicateId(u64),

    /// A response frame arrived for an id with no pending entry.
    #[error("No pending request for id {0}")]
    NotFound(u64),

    /// No tunnel session, or the session dropped while the request was
    /// pending.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The local backend call failed.
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
