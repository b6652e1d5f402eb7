//! Relay side of the burrow reverse tunnel
//!
//! Clients behind NAT register a domain over a persistent control channel;
//! the broker turns `dial(domain)` calls from an HTTP engine into reverse
//! connections the clients open back to the relay's public endpoint.

pub mod broker;
pub mod channel;
pub mod config;
pub mod demux;
pub mod pending;
pub mod registry;
pub mod server;

pub use broker::{DialError, TunnelBroker, DEFAULT_DIAL_TIMEOUT};
pub use channel::{ChannelError, ControlChannel};
pub use config::{Credentials, RelayConfig};
pub use demux::{BadGatewayFallback, Demultiplexer, FallbackHandler, ReverseStream};
pub use pending::PendingTunnels;
pub use registry::{
    ClientRegistration, ClientRegistry, RegisterError, RegistrySnapshot, RouteEntry,
};
pub use server::{Relay, RelayError};
