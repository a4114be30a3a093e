//! Porthole Shared Library
//!
//! Frame types, wire codec, and error taxonomy common to the relay and
//! the tunnel agent.

pub mod codec;
pub mod error;
pub mod protocol;

pub use error::{Result, TunnelError};
