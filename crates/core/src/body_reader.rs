use crate::errors::BoxError;
use bytes::{Buf, Bytes};
use http::HeaderMap;
use http_body::Body;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, ReadBuf};

pin_project! {
    /// Reads the data frames of an HTTP body as a byte stream.
    ///
    /// Trailers are kept aside and can be taken once the stream reached its end.
    #[derive(Debug)]
    pub(crate) struct BodyReader<B> {
        #[pin]
        body: B,
        chunk: Bytes,
        trailers: Option<HeaderMap>,
        done: bool,
    }
}

impl<B> BodyReader<B> {
    pub(crate) const fn new(body: B) -> Self {
        Self {
            body,
            chunk: Bytes::new(),
            trailers: None,
            done: false,
        }
    }

    pub(crate) fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }
}

impl<B> AsyncRead for BodyReader<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        loop {
            if this.chunk.has_remaining() {
                let len = this.chunk.len().min(buf.remaining());
                buf.put_slice(&this.chunk[..len]);
                this.chunk.advance(len);
                return Poll::Ready(Ok(()));
            }
            if *this.done {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.body.as_mut().poll_frame(cx)) {
                None => *this.done = true,
                Some(Err(error)) => {
                    *this.done = true;
                    let error: BoxError = error.into();
                    return Poll::Ready(Err(io::Error::other(error)));
                }
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => *this.chunk = data,
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            this.trailers.get_or_insert_with(HeaderMap::new).extend(trailers);
                        }
                    }
                },
            }
        }
    }
}
