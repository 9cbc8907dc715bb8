//! Stream reader and writer for the channel envelope.
//!
//! Post-handshake traffic is a sequence of `{ChannelId}{payload}` pairs in
//! the negotiated [`Format`]. The reader keeps one buffer across reads: any
//! bytes pulled past the end of a message (JSON decoding over-reads freely)
//! stay buffered for the next message, and survive the switch to an
//! encrypted stream via [`MessageReader::into_parts`].

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtoError;
use crate::message::{ChannelId, Format, Message, MessageKind};

/// Ceiling for envelope and handshake messages.
pub const CONTROL_MAX_SIZE: usize = 16 * 1024;

/// Extra room allowed on top of a payload limit for prefixes and JSON
/// whitespace before a message is declared oversize.
const FRAMING_SLACK: usize = 64;

const READ_CHUNK: usize = 8 * 1024;

pub struct MessageReader<R> {
    inner: R,
    buf: BytesMut,
    format: Format,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R, format: Format) -> Self {
        Self::with_buffer(inner, format, BytesMut::new())
    }

    /// Resume reading with bytes already pulled off the stream.
    pub fn with_buffer(inner: R, format: Format, buf: BytesMut) -> Self {
        Self { inner, buf, format }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Read one message of `kind`, failing once `max_size` bytes are
    /// buffered without a complete message.
    pub async fn read(&mut self, kind: MessageKind, max_size: usize) -> Result<Message, ProtoError> {
        loop {
            if let Some((msg, used)) = Message::decode(kind, self.format, &self.buf)? {
                if used > max_size.saturating_add(FRAMING_SLACK) {
                    return Err(ProtoError::TooLarge { max: max_size });
                }
                self.buf.advance(used);
                return Ok(msg);
            }
            if self.buf.len() > max_size.saturating_add(FRAMING_SLACK) {
                return Err(ProtoError::TooLarge { max: max_size });
            }
            self.buf.reserve(READ_CHUNK);
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(if self.at_boundary() {
                    ProtoError::Closed
                } else {
                    std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into()
                });
            }
        }
    }

    /// True when nothing but inter-message padding is buffered.
    fn at_boundary(&self) -> bool {
        match self.format {
            Format::Binary => self.buf.is_empty(),
            Format::Json => self.buf.iter().all(u8::is_ascii_whitespace),
        }
    }

    /// Read the channel id that precedes every payload.
    pub async fn read_channel(&mut self) -> Result<String, ProtoError> {
        match self.read(MessageKind::ChannelId, CONTROL_MAX_SIZE).await? {
            Message::ChannelId(id) => Ok(id.name),
            other => Err(unexpected(MessageKind::ChannelId, &other)),
        }
    }

    /// Hand back the stream and whatever was read past the last message.
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.buf)
    }
}

pub struct MessageWriter<W> {
    inner: W,
    format: Format,
    scratch: BytesMut,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W, format: Format) -> Self {
        Self {
            inner,
            format,
            scratch: BytesMut::new(),
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Write a bare message (handshake traffic) and flush.
    pub async fn write(&mut self, msg: &Message) -> Result<(), ProtoError> {
        self.scratch.clear();
        msg.encode(self.format, &mut self.scratch)?;
        self.inner.write_all(&self.scratch).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Write `msg` on `channel` as one logical write, then flush.
    pub async fn send(&mut self, channel: &str, msg: &Message) -> Result<(), ProtoError> {
        self.scratch.clear();
        let id = Message::ChannelId(ChannelId {
            name: channel.to_string(),
        });
        id.encode(self.format, &mut self.scratch)?;
        msg.encode(self.format, &mut self.scratch)?;
        self.inner.write_all(&self.scratch).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtoError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

pub(crate) fn unexpected(expected: MessageKind, got: &Message) -> ProtoError {
    ProtoError::Malformed {
        kind: expected,
        reason: format!("decoded as {}", got.kind()),
    }
}
