//! Message framing over TCP.
//!
//! Small control messages are length-prefixed bincode; bulk pack data is
//! passed through raw. Stream-control tags separate the packs of a bulk
//! transfer.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use walb_core::{Error, ErrorKind, Result};

/// Upper bound for one control message; bulk data never goes through
/// message frames.
const MAX_MSG_SIZE: u32 = 1 << 20;

/// Connection greeting sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Greeting {
    /// Client node id.
    pub client_id: String,
    /// Requested protocol name.
    pub protocol: String,
}

/// Greeting reply sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GreetingReply {
    /// The server accepts the protocol.
    Accept {
        /// Server node id.
        server_id: String,
    },
    /// The server does not speak the requested protocol.
    Reject {
        /// Human-readable reason.
        reason: String,
    },
}

/// A generic request reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply<T> {
    /// Success.
    Ok(T),
    /// Failure with its wire classification.
    Err {
        /// Error class, used for retry decisions.
        kind: ErrorKind,
        /// Human-readable message.
        msg: String,
    },
}

impl<T> Reply<T> {
    /// Build an error reply from an [`Error`].
    #[must_use]
    pub fn from_error(e: &Error) -> Self {
        Self::Err { kind: e.kind(), msg: e.to_string() }
    }

    /// Unwrap into a `Result`, mapping a wire error back to an [`Error`].
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Ok(v) => Ok(v),
            Self::Err { kind, msg } => Err(match kind {
                ErrorKind::InvalidFormat => Error::InvalidFormat(msg),
                ErrorKind::BadState => Error::BadState(msg),
                ErrorKind::NotFound => Error::NotFound(msg),
                ErrorKind::Io => {
                    Error::Io(std::io::Error::new(std::io::ErrorKind::Other, msg))
                }
                ErrorKind::Timeout => Error::Timeout(msg),
                ErrorKind::Overflow => Error::Overflow(msg),
                ErrorKind::ProtocolMismatch => Error::ProtocolMismatch(msg),
                ErrorKind::Cancelled => Error::Cancelled,
                ErrorKind::Internal => Error::Internal(msg),
            }),
        }
    }
}

/// Stream-control tags bracketing bulk transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamControl {
    /// Another pack follows.
    Next = 1,
    /// The stream is complete.
    End = 2,
    /// The sender aborts the stream.
    Error = 3,
}

impl StreamControl {
    fn from_wire(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Next),
            2 => Ok(Self::End),
            3 => Ok(Self::Error),
            _ => Err(Error::ProtocolMismatch(format!("bad stream control tag {v}"))),
        }
    }
}

/// Send one length-prefixed bincode message.
pub async fn send_msg<S, T>(stream: &mut S, msg: &T) -> Result<()>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = bincode::serialize(msg)
        .map_err(|e| Error::internal(format!("message serialize: {e}")))?;
    if data.len() as u32 > MAX_MSG_SIZE {
        return Err(Error::internal("message too large".to_string()));
    }
    stream.write_u32_le(data.len() as u32).await?;
    stream.write_all(&data).await?;
    stream.flush().await?;
    Ok(())
}

/// Receive one length-prefixed bincode message.
pub async fn recv_msg<S, T>(stream: &mut S) -> Result<T>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = stream.read_u32_le().await?;
    if len > MAX_MSG_SIZE {
        return Err(Error::ProtocolMismatch(format!("message length {len} too large")));
    }
    let mut data = vec![0u8; len as usize];
    stream.read_exact(&mut data).await?;
    bincode::deserialize(&data)
        .map_err(|e| Error::ProtocolMismatch(format!("message decode: {e}")))
}

/// Send raw bytes (no framing).
pub async fn send_bytes<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) -> Result<()> {
    stream.write_all(data).await?;
    Ok(())
}

/// Receive exactly `len` raw bytes.
pub async fn recv_bytes<S: AsyncRead + Unpin>(stream: &mut S, len: usize) -> Result<Vec<u8>> {
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    Ok(data)
}

/// Send a stream-control tag.
pub async fn send_stream_control<S: AsyncWrite + Unpin>(
    stream: &mut S,
    ctrl: StreamControl,
) -> Result<()> {
    stream.write_u8(ctrl as u8).await?;
    stream.flush().await?;
    Ok(())
}

/// Receive a stream-control tag.
pub async fn recv_stream_control<S: AsyncRead + Unpin>(stream: &mut S) -> Result<StreamControl> {
    let v = stream.read_u8().await?;
    StreamControl::from_wire(v)
}
