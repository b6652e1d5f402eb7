//! Per-client control channel
//!
//! Wraps the write half of a client's persistent connection. The channel
//! carries only the open-tunnel signal and liveness; everything received
//! after the handshake is discarded.

use burrow_proto::{read_message, write_message, ControlMessage};
use std::sync::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Control channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("control channel closed")]
    Closed,
}

/// Channel lifecycle: `Open -> Closing -> Closed`, Closed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Open,
    Closing,
    Closed,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The server-side handle to one client's control connection
pub struct ControlChannel {
    id: u64,
    domain: String,
    writer: tokio::sync::Mutex<BoxedWriter>,
    state: Mutex<ChannelState>,
    closed_tx: watch::Sender<bool>,
}

impl ControlChannel {
    /// Wrap the write half of an accepted control connection
    ///
    /// `id` is a process-unique identity used to resolve unregister races;
    /// it is unrelated to tunnel ids.
    pub fn new<W>(id: u64, domain: String, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed_tx, _) = watch::channel(false);
        Self {
            id,
            domain,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            state: Mutex::new(ChannelState::Open),
            closed_tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn is_closed(&self) -> bool {
        *self.state.lock().unwrap() != ChannelState::Open
    }

    /// Ask the client to open a reverse connection tagged with `id`
    pub async fn send_open_tunnel(&self, id: u32) -> Result<(), ChannelError> {
        self.send(&ControlMessage::OpenTunnel { id }).await
    }

    /// Acknowledge a successful registration
    pub async fn send_registered(&self) -> Result<(), ChannelError> {
        self.send(&ControlMessage::Registered {
            domain: self.domain.clone(),
        })
        .await
    }

    async fn send(&self, msg: &ControlMessage) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let mut writer = self.writer.lock().await;
        match write_message(&mut *writer, msg).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(channel = self.id, domain = %self.domain, "control send failed: {}", e);
                drop(writer);
                self.mark_closed();
                Err(ChannelError::Closed)
            }
        }
    }

    /// Read from the channel until the peer closes it or the link fails
    ///
    /// Received payloads are discarded; the read side exists purely to
    /// detect loss of the peer. Marks the channel Closed on return.
    pub async fn wait_closed<R>(&self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            match read_message(&mut reader).await {
                Ok(Some(_)) => {
                    trace!(channel = self.id, domain = %self.domain, "discarding control payload");
                }
                Ok(None) => break,
                Err(e) => {
                    trace!(channel = self.id, domain = %self.domain, "control read failed: {}", e);
                    break;
                }
            }
        }
        self.mark_closed();
    }

    /// Best-effort graceful close with a reason; the peer may already be gone
    pub async fn close(&self, reason: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ChannelState::Open {
                return;
            }
            *state = ChannelState::Closing;
        }

        let goodbye = ControlMessage::Goodbye {
            reason: reason.to_string(),
        };
        let mut writer = self.writer.lock().await;
        let _ = write_message(&mut *writer, &goodbye).await;
        let _ = writer.shutdown().await;
        drop(writer);

        self.mark_closed();
    }

    /// Resolves once the channel has left the Open state
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn mark_closed(&self) {
        *self.state.lock().unwrap() = ChannelState::Closed;
        self.closed_tx.send_replace(true);
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .field("closed", &self.is_closed())
            .finish()
    }
}
