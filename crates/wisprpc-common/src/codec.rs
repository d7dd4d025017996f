//! Framing codec: a serialization format selected by content-type tag,
//! carried over length-prefixed frames on a duplex byte stream.
//!
//! # Wire Protocol
//!
//! After the handshake line, every message is a pair of frames, each with a
//! 4-byte length prefix (big-endian u32) followed by the encoded data:
//!
//! ```text
//! [4-byte length] [header] [4-byte length] [body] ...
//! ```
//!
//! One header frame is always followed by exactly one body frame. A reader
//! that does not want a body (a response for a call that was cancelled) still
//! consumes its frame, so the stream stays aligned.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{Result, RpcError};
use crate::protocol::{Header, Options, BINARY_CONTENT_TYPE, JSON_CONTENT_TYPE};

/// Maximum frame payload size (64 MB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Maximum length of the handshake line (8 KB).
const MAX_HANDSHAKE_BYTES: usize = 8 * 1024;

/// Serialization format negotiated during the handshake.
///
/// Resolved from the content-type tag in [`Options::codec_type`]; the set of
/// supported formats is fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    /// Binary codec (the default).
    Postcard,
    /// JSON codec.
    Json,
}

impl CodecKind {
    /// Resolves a content-type tag to a codec kind.
    pub fn from_content_type(tag: &str) -> Option<Self> {
        match tag {
            BINARY_CONTENT_TYPE => Some(CodecKind::Postcard),
            JSON_CONTENT_TYPE => Some(CodecKind::Json),
            _ => None,
        }
    }

    /// The content-type tag this kind registers under.
    pub fn content_type(&self) -> &'static str {
        match self {
            CodecKind::Postcard => BINARY_CONTENT_TYPE,
            CodecKind::Json => JSON_CONTENT_TYPE,
        }
    }

    /// Encodes a value into a frame payload.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            CodecKind::Postcard => Ok(postcard::to_allocvec(value)?),
            CodecKind::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Decodes a frame payload into a value.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            CodecKind::Postcard => Ok(postcard::from_bytes(bytes)?),
            CodecKind::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

/// Writes the handshake record as one JSON line and flushes.
pub async fn write_handshake<W>(writer: &mut W, options: &Options) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(options)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the handshake record from the head of a connection.
///
/// Goes through the same buffered reader the frame loop uses afterwards, so
/// no bytes past the newline are lost.
pub async fn read_handshake<R>(reader: &mut BufReader<R>) -> Result<Options>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    let mut limited = reader.take(MAX_HANDSHAKE_BYTES as u64);
    let n = limited.read_line(&mut line).await?;
    if n == 0 {
        return Err(RpcError::InvalidHandshake(
            "connection closed before handshake".to_string(),
        ));
    }
    if !line.ends_with('\n') && n >= MAX_HANDSHAKE_BYTES {
        return Err(RpcError::InvalidHandshake(format!(
            "handshake line exceeds {} bytes",
            MAX_HANDSHAKE_BYTES
        )));
    }
    serde_json::from_str(line.trim())
        .map_err(|e| RpcError::InvalidHandshake(format!("malformed options record: {}", e)))
}

/// Reads one length-prefixed frame.
async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Reading half of a connection's codec.
///
/// One `read_header` must be paired with exactly one body read
/// ([`read_body`](FrameReader::read_body),
/// [`read_body_bytes`](FrameReader::read_body_bytes) or
/// [`discard_body`](FrameReader::discard_body)) before the next header.
/// Any I/O error leaves the stream in an unrecoverable state.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    kind: CodecKind,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, kind: CodecKind) -> Self {
        Self::from_buffered(BufReader::new(inner), kind)
    }

    /// Wraps a reader that already carries buffered bytes (the handshake and
    /// the HTTP acceptor read through the same buffer).
    pub fn from_buffered(reader: BufReader<R>, kind: CodecKind) -> Self {
        FrameReader { reader, kind }
    }

    pub async fn read_header(&mut self) -> Result<Header> {
        let frame = read_frame(&mut self.reader).await?;
        self.kind.decode(&frame)
    }

    pub async fn read_body<T: DeserializeOwned>(&mut self) -> Result<T> {
        let frame = read_frame(&mut self.reader).await?;
        self.kind.decode(&frame)
    }

    /// Reads the body frame without decoding it. The server consumes bodies
    /// this way before method resolution, so a lookup failure never leaves a
    /// half-read message on the wire.
    pub async fn read_body_bytes(&mut self) -> Result<Vec<u8>> {
        read_frame(&mut self.reader).await
    }

    /// Reads and drops one body frame.
    pub async fn discard_body(&mut self) -> Result<()> {
        read_frame(&mut self.reader).await?;
        Ok(())
    }
}

/// Writing half of a connection's codec.
///
/// Callers serialize writes themselves (the server's response mutex, the
/// client's send mutex); each write puts the header and body frames on the
/// wire contiguously and flushes before returning.
pub struct FrameWriter<W> {
    writer: W,
    kind: CodecKind,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, kind: CodecKind) -> Self {
        FrameWriter { writer, kind }
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Encodes and writes one `(header, body)` message.
    pub async fn write<T: Serialize + ?Sized>(&mut self, header: &Header, body: &T) -> Result<()> {
        let body = self.kind.encode(body)?;
        self.write_raw(header, &body).await
    }

    /// Writes one message whose body is already encoded.
    pub async fn write_raw(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let header_bytes = self.kind.encode(header)?;
        let mut buf = Vec::with_capacity(8 + header_bytes.len() + body.len());
        buf.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(body);
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shuts down the write direction of the underlying stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
