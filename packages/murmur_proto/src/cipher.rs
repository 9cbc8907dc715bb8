//! Encrypting stream adapters.
//!
//! Both sides wrap their halves of the connection right after the key
//! exchange. Anything the plain [`MessageReader`](crate::codec::MessageReader)
//! had already buffered past the key exchange is ciphertext and must go
//! through [`decrypt_leftover`] before reading resumes.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::session_keys::KeyStream;

pub struct CipherReader<R> {
    inner: R,
    keystream: KeyStream,
}

impl<R> CipherReader<R> {
    pub fn new(inner: R, keystream: KeyStream) -> Self {
        Self { inner, keystream }
    }

    /// Decrypt bytes read off `inner` before this adapter existed. Must be
    /// called before the first `poll_read` so the keystream stays aligned.
    pub fn decrypt_leftover(&mut self, buf: &mut BytesMut) {
        self.keystream.apply(buf);
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CipherReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.keystream.apply(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

/// Encrypts on write. Accepted bytes are encrypted immediately and held
/// until the inner writer takes them, so the keystream never has to
/// rewind.
pub struct CipherWriter<W> {
    inner: W,
    keystream: KeyStream,
    pending: BytesMut,
}

impl<W> CipherWriter<W> {
    pub fn new(inner: W, keystream: KeyStream) -> Self {
        Self {
            inner,
            keystream,
            pending: BytesMut::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> CipherWriter<W> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CipherWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        let start = this.pending.len();
        this.pending.extend_from_slice(buf);
        this.keystream.apply(&mut this.pending[start..]);

        // The bytes are ours now; push what we can without waiting.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
