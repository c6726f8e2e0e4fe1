//! Minimal framing for the PostgreSQL frontend/backend wire protocol.
//!
//! Every regular message after the startup phase looks like
//! `tag:u8 len:i32(includes self, excludes tag) body:[u8; len-4]`. During
//! startup there is no tag byte, just `len:i32 body:[u8; len-4]`.
//!
//! This module only frames messages — it never interprets `body`. Interpreting
//! specific message kinds lives in [`crate::frontend`] and [`crate::backend`],
//! so a message the proxy doesn't care about can be forwarded as opaque bytes.

use crate::error::{ProtoError, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard ceiling on a single message body, independent of the row/byte
/// capture ceilings in the interceptor. Guards against a peer claiming an
/// absurd length and exhausting memory before the capture logic ever runs.
pub const MAX_MESSAGE_BODY: usize = 256 * 1024 * 1024;

/// A message with its protocol tag byte, already stripped of the length
/// prefix. `body` excludes the tag and the length field.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub tag: u8,
    pub body: Bytes,
}

impl RawMessage {
    /// Re-serialize this message exactly as it would appear on the wire.
    /// Used to forward messages the interceptor does not act on, verbatim.
    pub fn to_wire_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(5 + self.body.len());
        buf.extend_from_slice(&[self.tag]);
        buf.extend_from_slice(&((self.body.len() + 4) as i32).to_be_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// An untagged message, only seen during the startup phase.
#[derive(Debug, Clone)]
pub struct RawUntagged {
    pub body: Bytes,
}

/// Read one tagged message from `reader`. Returns `Ok(None)` on a clean EOF
/// between messages (the peer closed the connection).
pub async fn read_tagged<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<RawMessage>> {
    let mut tag_buf = [0u8; 1];
    let n = read_or_eof(reader, &mut tag_buf).await?;
    if n == 0 {
        return Ok(None);
    }
    let body = read_framed_body(reader).await?;
    Ok(Some(RawMessage {
        tag: tag_buf[0],
        body,
    }))
}

/// Read one untagged (startup-phase) message from `reader`.
pub async fn read_untagged<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<RawUntagged>> {
    let mut len_buf = [0u8; 4];
    let n = read_or_eof(reader, &mut len_buf).await?;
    if n == 0 {
        return Ok(None);
    }
    let body = read_body_after_len(reader, &len_buf).await?;
    Ok(Some(RawUntagged { body }))
}

/// Read exactly `buf.len()` bytes, or return `0` if the first read hits EOF
/// with nothing consumed yet (a clean disconnect between messages).
async fn read_or_eof<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    match reader.read_exact(buf).await {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(0),
        Err(e) => Err(e.into()),
    }
}

async fn read_framed_body<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    read_body_after_len(reader, &len_buf).await
}

async fn read_body_after_len<R: AsyncRead + Unpin>(
    reader: &mut R,
    len_buf: &[u8; 4],
) -> Result<Bytes> {
    let len = i32::from_be_bytes(*len_buf);
    if len < 4 {
        return Err(ProtoError::Malformed("message length smaller than its own prefix"));
    }
    let body_len = (len as usize) - 4;
    if body_len > MAX_MESSAGE_BODY {
        return Err(ProtoError::TooLarge(body_len));
    }
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

/// Write a tagged message (`tag` + length prefix + `body`) and flush.
pub async fn write_tagged<W: AsyncWrite + Unpin>(writer: &mut W, tag: u8, body: &[u8]) -> Result<()> {
    let mut buf = BytesMut::with_capacity(5 + body.len());
    buf.extend_from_slice(&[tag]);
    buf.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    buf.extend_from_slice(body);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Write an untagged (startup-phase) message and flush.
pub async fn write_untagged<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    buf.extend_from_slice(body);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Forward a previously-read message verbatim, unmodified.
pub async fn forward_raw<W: AsyncWrite + Unpin>(writer: &mut W, msg: &RawMessage) -> Result<()> {
    writer.write_all(&msg.to_wire_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
