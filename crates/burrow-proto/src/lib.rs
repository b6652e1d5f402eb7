//! Burrow Protocol Definitions
//!
//! This crate defines the control-channel messages, the length-prefixed
//! framing used on control connections, and the data-leg preamble that tags
//! a reverse connection with its tunnel id.

pub mod codec;
pub mod messages;
pub mod preamble;

pub use codec::{read_message, write_message, CodecError, ControlCodec};
pub use messages::ControlMessage;
pub use preamble::{decode_tunnel_id, encode_tunnel_id, TUNNEL_PREAMBLE_LEN};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;
