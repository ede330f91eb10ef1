use crate::autoflush::AutoFlushWriter;
use crate::body_reader::BodyReader;
use crate::channel::FrameWriter;
use crate::context::IncomingBody;
use crate::copy::{CopyTags, StreamCopier, StreamCopyResult};
use crate::errors::{BoxError, Canceled, SharedError};
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll, ready};
use tokio::io::BufWriter;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETED: u8 = 2;

const FRAME_CHANNEL_CAPACITY: usize = 4;
const WRITE_BUFFER_SIZE: usize = 16 * 1024;

/// Final state of a request body copy.
#[derive(Debug, Clone)]
pub struct BodyOutcome {
    /// How the copy ended.
    pub result: StreamCopyResult,
    /// The failure, absent on success.
    pub error: Option<SharedError>,
}

impl BodyOutcome {
    fn new(result: StreamCopyResult, error: Option<io::Error>) -> Self {
        Self {
            result,
            error: error.map(|error| Arc::new(error) as SharedError),
        }
    }

    fn canceled() -> Self {
        Self::new(StreamCopyResult::Canceled, Some(Canceled::into_io()))
    }

    /// Whether the whole body reached the destination.
    pub fn is_success(&self) -> bool {
        self.result == StreamCopyResult::Success
    }
}

struct Shared {
    state: AtomicU8,
    auto_flush: bool,
    outcome: watch::Sender<Option<BodyOutcome>>,
}

impl Shared {
    fn complete(&self, outcome: BodyOutcome) {
        let published = self.outcome.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        });
        if published {
            self.state.store(COMPLETED, Ordering::Release);
        }
    }

    fn completed(&self) -> Option<BodyOutcome> {
        self.outcome.borrow().clone()
    }
}

/// Handle on the background copy of one request body.
///
/// The copy runs at most once. [`Self::outcome`] may be awaited any number of times and
/// yields the same cached result.
#[derive(Clone)]
pub struct RequestBodyForwarder {
    shared: Arc<Shared>,
}

impl fmt::Debug for RequestBodyForwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBodyForwarder")
            .field("started", &self.started())
            .field("auto_flush", &self.shared.auto_flush)
            .field("completed", &self.completed().map(|o| o.result))
            .finish()
    }
}

impl RequestBodyForwarder {
    /// Wrap `source` as an outgoing body.
    ///
    /// `cancel` stops the copy; `auto_flush` pushes every write to the destination
    /// transport immediately.
    pub fn new(
        source: IncomingBody,
        auto_flush: bool,
        cancel: CancellationToken,
        copier: StreamCopier,
        tags: CopyTags,
    ) -> (Self, ForwardedBody) {
        let (outcome, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            state: AtomicU8::new(NOT_STARTED),
            auto_flush,
            outcome,
        });
        let (sender, receiver) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let job = CopyJob {
            source,
            sender,
            cancel,
            copier,
            tags,
            shared: shared.clone(),
        };
        let body = ForwardedBody {
            job: Some(job),
            receiver,
            shared: shared.clone(),
            finished: false,
        };
        (Self { shared }, body)
    }

    /// Whether the destination transport started reading the body.
    pub fn started(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) != NOT_STARTED
    }

    /// Whether writes are flushed immediately.
    pub fn auto_flush(&self) -> bool {
        self.shared.auto_flush
    }

    /// The outcome, if the copy already ended.
    pub fn completed(&self) -> Option<BodyOutcome> {
        self.shared.completed()
    }

    /// Wait for the copy to end.
    ///
    /// Only resolves once the copy [started](Self::started).
    pub async fn outcome(&self) -> BodyOutcome {
        let mut receiver = self.shared.outcome.subscribe();
        match receiver.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone().unwrap_or_else(BodyOutcome::canceled),
            Err(_) => BodyOutcome::canceled(),
        }
    }
}

struct CopyJob {
    source: IncomingBody,
    sender: mpsc::Sender<Frame<Bytes>>,
    cancel: CancellationToken,
    copier: StreamCopier,
    tags: CopyTags,
    shared: Arc<Shared>,
}

impl CopyJob {
    fn start(self) {
        self.shared.state.store(RUNNING, Ordering::Release);
        tokio::spawn(self.run());
    }

    async fn run(self) {
        let Self {
            source,
            sender,
            cancel,
            copier,
            tags,
            shared,
        } = self;
        let guard = CompletionGuard(shared);
        let mut reader = BodyReader::new(source);
        let trailer_sender = sender.clone();
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, FrameWriter::new(sender));

        let outcome = if guard.0.auto_flush {
            let mut writer = AutoFlushWriter::new(&mut writer);
            copier.copy(&mut reader, &mut writer, &cancel, &tags).await
        } else {
            copier.copy(&mut reader, &mut writer, &cancel, &tags).await
        };
        let (mut result, mut error) = outcome.into_parts();

        if result == StreamCopyResult::Success {
            if let Some(trailers) = reader.take_trailers() {
                if trailer_sender.send(Frame::trailers(trailers)).await.is_err() {
                    result = StreamCopyResult::OutputError;
                    error = Some(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "outgoing body was dropped before its trailers",
                    ));
                }
            }
        }

        // Publish before closing the channel so the body sees the outcome at end of stream.
        guard.0.complete(BodyOutcome::new(result, error));
        drop(writer);
        drop(trailer_sender);
    }
}

/// Marks a running copy as canceled if its task goes away before publishing an outcome.
struct CompletionGuard(Arc<Shared>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.0.state.load(Ordering::Acquire) == RUNNING {
            self.0.complete(BodyOutcome::canceled());
        }
    }
}

/// Request body handed to the destination invoker.
pub struct ForwardedBody {
    job: Option<CopyJob>,
    receiver: mpsc::Receiver<Frame<Bytes>>,
    shared: Arc<Shared>,
    finished: bool,
}

impl fmt::Debug for ForwardedBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardedBody")
            .field("started", &self.job.is_none())
            .field("finished", &self.finished)
            .finish()
    }
}

impl Body for ForwardedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        if self.finished {
            return Poll::Ready(None);
        }
        if let Some(job) = self.job.take() {
            job.start();
        }
        if let Some(frame) = ready!(self.receiver.poll_recv(cx)) {
            return Poll::Ready(Some(Ok(frame)));
        }
        self.finished = true;
        match self.shared.completed() {
            Some(outcome) if outcome.is_success() => Poll::Ready(None),
            Some(outcome) => {
                let error: BoxError = match outcome.error {
                    Some(error) => Box::new(ForwardedBodyError(error)),
                    None => Box::new(Canceled),
                };
                Poll::Ready(Some(Err(error)))
            }
            None => Poll::Ready(Some(Err(Box::new(Canceled)))),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished
    }
}

/// The request body copy failed; the outgoing request must not end cleanly.
#[derive(Debug, thiserror::Error)]
#[error("request body copy failed: {0}")]
pub struct ForwardedBodyError(SharedError);

/// Body of an outgoing request.
#[derive(Debug)]
pub enum OutgoingBody {
    /// The request has no body.
    Empty,
    /// The client body, copied in the background.
    Forwarded(ForwardedBody),
}

impl Body for OutgoingBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        match self.get_mut() {
            Self::Empty => Poll::Ready(None),
            Self::Forwarded(body) => Pin::new(body).poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Forwarded(body) => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            Self::Empty => SizeHint::with_exact(0),
            Self::Forwarded(body) => body.size_hint(),
        }
    }
}
