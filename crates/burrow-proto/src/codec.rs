//! Framing for control-channel messages
//!
//! Each message is one frame: `[length: u32 big-endian][bincode payload]`.

use crate::messages::ControlMessage;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Control message codec
pub struct ControlCodec;

impl ControlCodec {
    /// Maximum control frame size (64KB)
    ///
    /// Control messages are small; anything larger is a protocol violation
    /// or a stray non-protocol peer.
    pub const MAX_FRAME_SIZE: usize = 64 * 1024;

    /// Encode a control message to a framed byte buffer
    pub fn encode(msg: &ControlMessage) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode one control message from the front of `buf`
    ///
    /// Returns Ok(Some(message)) if a complete frame was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error
    pub fn decode(buf: &mut BytesMut) -> Result<Option<ControlMessage>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let msg_bytes = buf.split_to(length);
        let msg: ControlMessage = bincode::deserialize(&msg_bytes)?;

        Ok(Some(msg))
    }
}

/// Write one framed control message to `writer`
pub async fn write_message<W>(writer: &mut W, msg: &ControlMessage) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = ControlCodec::encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed control message from `reader`
///
/// Returns `None` on a clean end-of-stream at a frame boundary.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<ControlMessage>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut length_bytes = [0u8; 4];
    match reader.read_exact(&mut length_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(length_bytes) as usize;
    if length > ControlCodec::MAX_FRAME_SIZE {
        return Err(CodecError::MessageTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    let msg = bincode::deserialize(&payload).map_err(CodecError::from)?;
    Ok(Some(msg))
}
