use bytes::Bytes;
use http_body::Frame;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// [`AsyncWrite`] end of an outgoing body.
///
/// Each write becomes one data frame on the channel. Writes wait for channel capacity, so a
/// slow destination applies backpressure to the copy feeding this writer. Writing after
/// the receiving body was dropped fails with [`io::ErrorKind::BrokenPipe`].
#[derive(Debug)]
pub(crate) struct FrameWriter {
    sender: PollSender<Frame<Bytes>>,
}

impl FrameWriter {
    pub(crate) fn new(sender: mpsc::Sender<Frame<Bytes>>) -> Self {
        Self {
            sender: PollSender::new(sender),
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "outgoing body was dropped")
}

impl AsyncWrite for FrameWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(self.sender.poll_reserve(cx)).map_err(|_| closed())?;
        self.sender
            .send_item(Frame::data(Bytes::copy_from_slice(buf)))
            .map_err(|_| closed())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.sender.is_closed() {
            return Poll::Ready(Err(closed()));
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.sender.close();
        Poll::Ready(Ok(()))
    }
}
