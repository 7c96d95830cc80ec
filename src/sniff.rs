//! First-bytes classification for freshly accepted client streams.
//!
//! The listener serves plain HTTP proxy requests and TLS-wrapped proxy
//! requests on the same port. [`sniff`] reads the first few bytes of a
//! stream under a deadline, decides TLS vs. clear, and hands back a
//! [`Prefixed`] stream that re-presents the consumed bytes to whoever
//! reads next — including a TLS server handshake.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::BytesMut;
use n0_error::e;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio_util::time::FutureExt;

use crate::error::ProxyError;

/// How many bytes the classifier looks at.
pub(crate) const PEEK_LEN: usize = 5;

/// How long the classifier waits for the first bytes to arrive.
pub(crate) const PEEK_DEADLINE: Duration = Duration::from_secs(5);

/// Initial capacity for the prefix buffer.
const INITIAL_CAPACITY: usize = 4 * 1024;

/// Outcome of classifying the first bytes of a client stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The stream starts with a TLS handshake record.
    Tls,
    /// Anything else; treated as a plain-text proxy request.
    Clear,
}

/// Returns whether `prefix` starts a TLS handshake.
///
/// True iff the first byte is a handshake record (0x16) followed by a
/// TLS 1.0–1.3 record version (0x03 0x01..=0x04). A prefix shorter than
/// three bytes is never TLS.
pub fn is_tls_client_hello(prefix: &[u8]) -> bool {
    prefix.len() >= 3 && prefix[0] == 0x16 && prefix[1] == 0x03 && (0x01..=0x04).contains(&prefix[2])
}

/// Reads up to [`PEEK_LEN`] bytes from `stream` under [`PEEK_DEADLINE`] and
/// classifies the stream.
///
/// The returned [`Prefixed`] stream yields the peeked bytes before any new
/// bytes from the socket, so no data is lost to classification.
pub async fn sniff<S>(stream: S) -> Result<(Prefixed<S>, Verdict), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = Prefixed::new(stream, crate::HEADER_SECTION_MAX_LENGTH);
    let n = match stream.read_more(PEEK_LEN).timeout(PEEK_DEADLINE).await {
        Err(_elapsed) => return Err(e!(ProxyError::ClassifyTimeout)),
        Ok(Err(source)) => return Err(e!(ProxyError::Io { source })),
        Ok(Ok(n)) => n,
    };
    if n == 0 {
        return Err(e!(ProxyError::ClientDisconnect));
    }
    let verdict = if is_tls_client_hello(stream.peeked()) {
        Verdict::Tls
    } else {
        Verdict::Clear
    };
    Ok((stream, verdict))
}

/// A stream wrapper with an explicit prefix buffer.
///
/// Bytes accumulated with [`read_more`](Self::read_more) can be inspected
/// through [`peeked`](Self::peeked) and partially dropped with
/// [`discard`](Self::discard); reads drain the buffer before falling
/// through to the inner stream. Writes pass through untouched, which makes
/// `Prefixed` usable as the transport of a TLS server handshake.
#[derive(Debug)]
pub struct Prefixed<S> {
    inner: S,
    buf: BytesMut,
    max_len: usize,
}

impl<S> Prefixed<S> {
    pub(crate) fn new(inner: S, max_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            max_len,
        }
    }

    /// Returns the unconsumed prefix bytes.
    pub(crate) fn peeked(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Returns whether the prefix buffer reached its limit.
    pub(crate) fn is_full(&self) -> bool {
        self.buf.len() >= self.max_len
    }

    /// Drops `n` bytes from the front of the prefix buffer.
    pub(crate) fn discard(&mut self, n: usize) {
        let _ = self.buf.split_to(n.min(self.buf.len()));
    }
}

impl<S: AsyncRead + Unpin> Prefixed<S> {
    /// Reads once from the inner stream into the prefix buffer.
    ///
    /// At most `hint` bytes are requested (clamped to the buffer limit).
    /// Returns the number of bytes read; zero means EOF or a full buffer.
    pub(crate) async fn read_more(&mut self, hint: usize) -> io::Result<usize> {
        let max = hint.min(self.max_len.saturating_sub(self.buf.len()));
        let n = (&mut self.inner)
            .take(max as u64)
            .read_buf(&mut self.buf)
            .await?;
        Ok(n)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
