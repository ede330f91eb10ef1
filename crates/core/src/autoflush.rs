//! Writer adapter that flushes after every write.

use pin_project_lite::pin_project;
use std::io::{self, IoSlice, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, ReadBuf};

pin_project! {
    /// Wraps a stream so that every successful write is immediately followed by a flush.
    ///
    /// Used for streaming requests where a buffered writer further down would otherwise
    /// hold back small messages. Reads and seeks pass straight through.
    #[derive(Debug)]
    pub struct AutoFlushWriter<W> {
        #[pin]
        inner: W,
        // Bytes accepted by the last write whose flush has not completed yet.
        pending: Option<usize>,
    }
}

impl<W> AutoFlushWriter<W> {
    /// Wrap `inner`.
    pub const fn new(inner: W) -> Self {
        Self {
            inner,
            pending: None,
        }
    }

    /// Borrow the wrapped stream.
    pub const fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Mutably borrow the wrapped stream.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Unwrap the stream.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite> AutoFlushWriter<W> {
    fn poll_write_with<F>(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        write: F,
    ) -> Poll<io::Result<usize>>
    where
        F: FnOnce(Pin<&mut W>, &mut Context<'_>) -> Poll<io::Result<usize>>,
    {
        let mut this = self.project();
        let written = match *this.pending {
            Some(written) => written,
            None => {
                let written = ready!(write(this.inner.as_mut(), cx))?;
                *this.pending = Some(written);
                written
            }
        };
        let flushed = ready!(this.inner.poll_flush(cx));
        *this.pending = None;
        Poll::Ready(flushed.map(|()| written))
    }
}

impl<W: AsyncWrite> AsyncWrite for AutoFlushWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_write_with(cx, |inner, cx| inner.poll_write(cx, buf))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.poll_write_with(cx, |inner, cx| inner.poll_write_vectored(cx, bufs))
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

impl<W: AsyncRead> AsyncRead for AutoFlushWriter<W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl<W: AsyncSeek> AsyncSeek for AutoFlushWriter<W> {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        self.project().inner.start_seek(position)
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        self.project().inner.poll_complete(cx)
    }
}

impl<W: io::Write> io::Write for AutoFlushWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.inner.flush()?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
