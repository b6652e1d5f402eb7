//! Control-channel message types

use serde::{Deserialize, Serialize};

/// Messages exchanged on a control channel.
///
/// The channel carries nothing beyond registration, liveness, and the
/// open-tunnel signal; tunnel payload travels on dedicated reverse
/// connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlMessage {
    /// Client announces itself: the domain it serves, the absolute upstream
    /// URL requests should be forwarded to, and an optional credential.
    Register {
        domain: String,
        upstream: String,
        credential: Option<String>,
    },

    /// Relay accepted the registration; the channel is now live.
    Registered { domain: String },

    /// Relay asks the client to open a reverse connection tagged with `id`.
    OpenTunnel { id: u32 },

    /// Either side is closing the channel, with a human-readable reason.
    /// Sent by the relay on rejected registrations and on shutdown.
    Goodbye { reason: String },
}
