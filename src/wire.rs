//! Frames for the bundled TCP transport.
//!
//! Each frame is a 4-byte big-endian length followed by a JSON message.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RpcError;
use crate::service::reply::Payload;
use crate::value::Args;

/// Maximum frame body size.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16 MB

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "call")]
    Call {
        id: u64,
        path: String,
        args: Args,
        /// Marks calls relayed from an HTTP-style gateway.
        #[serde(default)]
        gateway: bool,
    },

    #[serde(rename = "reply")]
    Reply { id: u64, payload: Payload },

    #[serde(rename = "error")]
    Error {
        id: u64,
        code: i32,
        kind: String,
        message: String,
    },
}

impl WireMessage {
    pub fn id(&self) -> u64 {
        match self {
            WireMessage::Call { id, .. }
            | WireMessage::Reply { id, .. }
            | WireMessage::Error { id, .. } => *id,
        }
    }

    pub fn from_error(id: u64, error: &RpcError) -> Self {
        WireMessage::Error {
            id,
            code: error.status_code(),
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

/// Encode a message body, enforcing the frame limit.
pub fn encode_message(message: &WireMessage) -> Result<Vec<u8>, WireError> {
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(bytes)
}

/// Decode a message body. Size is checked before parsing.
pub fn decode_message(bytes: &[u8]) -> Result<WireMessage, WireError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(serde_json::from_slice(bytes)?)
}

pub async fn write_frame<W>(writer: &mut W, message: &WireMessage) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let body = encode_message(message)?;
    let len = u32::try_from(body.len()).map_err(|_| WireError::FrameTooLarge {
        size: body.len(),
        max: MAX_FRAME_SIZE,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<WireMessage>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_message(&body).map(Some)
}
