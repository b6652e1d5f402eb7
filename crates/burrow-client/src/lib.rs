//! Client side of the burrow reverse tunnel
//!
//! Holds a persistent control channel open to the relay and, on demand,
//! opens reverse connections back to it, splicing each one against the
//! local upstream service.

pub mod client;
pub mod config;
mod tunnel;

pub use client::TunnelClient;
pub use config::ClientConfig;

use thiserror::Error;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] burrow_proto::CodecError),

    #[error("invalid upstream URL: {0}")]
    InvalidUpstream(String),

    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error("control channel closed by relay: {0}")]
    ClosedByRelay(String),

    #[error("control channel closed")]
    ChannelClosed,

    #[error("timed out waiting for registration reply")]
    HandshakeTimeout,

    #[error("protocol error: {0}")]
    Protocol(String),
}
