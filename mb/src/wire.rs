//! Control-socket wire format
//!
//! Control messages are newline-terminated UTF-8 tokens. The descriptor is
//! the one structured record on the wire; it travels as an explicit,
//! versioned frame (1 version byte, u32 big-endian length, JSON body) so
//! the orchestrator and its agents never need to share a runtime image.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::descriptor::NodeDescriptor;

/// Sent by a node once its local setup finished.
pub const TOKEN_INIT: &str = "INIT";
/// Sent to a client when the run may begin.
pub const TOKEN_START: &str = "START";
/// Sent to a broker once every broker has started.
pub const TOKEN_LINK: &str = "LINK";
/// Sent by a broker once its neighbour connections are up.
pub const TOKEN_LINKED: &str = "LINKED";
/// Sent by a node that failed mid-handshake, so its handler fails fast.
pub const TOKEN_ERROR: &str = "ERROR";

/// Version byte of the descriptor frame. Bump on layout changes.
pub const DESCRIPTOR_VERSION: u8 = 1;

/// Upper bound on a descriptor frame; anything larger is a protocol error.
const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

/// Protocol violations on the control socket
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Control socket closed mid-handshake")]
    ConnectionClosed,

    #[error("Peer reported an error")]
    PeerError,

    #[error("Expected token {expected}, got {got}")]
    UnexpectedToken { expected: &'static str, got: String },

    #[error("Unsupported descriptor version {0}")]
    UnsupportedVersion(u8),

    #[error("Descriptor frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u32),

    #[error("Malformed descriptor body: {0}")]
    MalformedDescriptor(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write one newline-terminated token.
pub async fn send_token<W>(writer: &mut W, token: &str) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(token.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Read one newline-terminated line, without the terminator.
pub async fn read_line<R>(reader: &mut R) -> Result<String, WireError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(WireError::ConnectionClosed);
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Read a line and require it to be `expected`.
///
/// A peer-sent `ERROR` token is surfaced as its own variant so handlers can
/// distinguish "the node told us it died" from garbled traffic.
pub async fn expect_token<R>(reader: &mut R, expected: &'static str) -> Result<(), WireError>
where
    R: AsyncBufReadExt + Unpin,
{
    let got = read_line(reader).await?;
    if got == TOKEN_ERROR {
        return Err(WireError::PeerError);
    }
    if got != expected {
        return Err(WireError::UnexpectedToken { expected, got });
    }
    Ok(())
}

/// Serialize and frame a descriptor onto the socket.
pub async fn send_descriptor<W>(writer: &mut W, descriptor: &NodeDescriptor) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(descriptor)?;
    let len = body.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }

    writer.write_u8(DESCRIPTOR_VERSION).await?;
    writer.write_u32(len).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode one framed descriptor.
pub async fn read_descriptor<R>(reader: &mut R) -> Result<NodeDescriptor, WireError>
where
    R: AsyncReadExt + Unpin,
{
    let version = reader.read_u8().await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => WireError::ConnectionClosed,
        _ => WireError::Io(e),
    })?;
    if version != DESCRIPTOR_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }

    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}
