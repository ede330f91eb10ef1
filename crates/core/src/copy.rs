//! Cancellable stream copy with pooled buffers and per-copy telemetry.

use crate::errors::is_canceled;
use crate::pool::{BufferPool, PooledBuffer, SharedBufferPool};
use crate::telemetry::{self, CopyDirection, RouteInfo, TransferStats};
use ferry_config::DEFAULT_COPY_BUFFER_SIZE;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How a copy ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCopyResult {
    /// The source reached end of stream and the destination was flushed.
    Success,
    /// Reading from the source failed.
    InputError,
    /// Writing to or flushing the destination failed.
    OutputError,
    /// The cancellation token fired.
    Canceled,
}

/// Labels attached to the telemetry of one copy.
#[derive(Debug, Clone)]
pub struct CopyTags {
    direction: CopyDirection,
    route: RouteInfo,
}

impl CopyTags {
    /// Create tags for a copy in `direction` on `route`.
    pub const fn new(direction: CopyDirection, route: RouteInfo) -> Self {
        Self { direction, route }
    }

    /// Copy direction.
    pub const fn direction(&self) -> CopyDirection {
        self.direction
    }

    /// Route labels.
    pub const fn route(&self) -> &RouteInfo {
        &self.route
    }
}

/// Result of [`StreamCopier::copy`].
#[derive(Debug)]
pub struct CopyOutcome {
    /// How the copy ended.
    pub result: StreamCopyResult,
    /// The failure, absent on success.
    pub error: Option<io::Error>,
    /// Transfer totals.
    pub stats: TransferStats,
}

impl CopyOutcome {
    /// Split into result and error.
    pub fn into_parts(self) -> (StreamCopyResult, Option<io::Error>) {
        (self.result, self.error)
    }
}

/// Copies a byte stream into another until end of stream, failure, or cancellation.
#[derive(Debug, Clone)]
pub struct StreamCopier {
    pool: Arc<dyn BufferPool>,
    buffer_size: usize,
}

impl Default for StreamCopier {
    fn default() -> Self {
        Self::new(Arc::new(SharedBufferPool), DEFAULT_COPY_BUFFER_SIZE)
    }
}

impl StreamCopier {
    /// Create a copier renting `buffer_size` bytes from `pool` per copy.
    pub fn new(pool: Arc<dyn BufferPool>, buffer_size: usize) -> Self {
        Self {
            pool,
            buffer_size: buffer_size.max(1),
        }
    }

    /// Size of the buffer rented for each copy.
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Copy `source` into `destination`.
    ///
    /// The destination is flushed once the source ends. Exactly one buffer is rented and it
    /// is returned to the pool on every exit path. Errors raised because `cancel` fired are
    /// reported as [`StreamCopyResult::Canceled`].
    pub async fn copy<R, W>(
        &self,
        source: &mut R,
        destination: &mut W,
        cancel: &CancellationToken,
        tags: &CopyTags,
    ) -> CopyOutcome
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let started = Instant::now();
        let mut stats = TransferStats::default();
        let (result, error) = self
            .copy_inner(source, destination, cancel, &mut stats)
            .await;
        stats.elapsed = started.elapsed();
        telemetry::content_transferred(
            tags.route(),
            tags.direction(),
            stats,
            result == StreamCopyResult::Success,
        );
        CopyOutcome {
            result,
            error,
            stats,
        }
    }

    async fn copy_inner<R, W>(
        &self,
        source: &mut R,
        destination: &mut W,
        cancel: &CancellationToken,
        stats: &mut TransferStats,
    ) -> (StreamCopyResult, Option<io::Error>)
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buffer = PooledBuffer::rent(self.pool.as_ref(), self.buffer_size);
        loop {
            if cancel.is_cancelled() {
                return canceled();
            }
            let read = tokio::select! {
                biased;
                () = cancel.cancelled() => return canceled(),
                read = source.read(&mut buffer) => read,
            };
            stats.reads += 1;
            let read = match read {
                Ok(0) => break,
                Ok(read) => read,
                Err(error) => return failed(StreamCopyResult::InputError, error, cancel),
            };

            if cancel.is_cancelled() {
                return canceled();
            }
            let written = tokio::select! {
                biased;
                () = cancel.cancelled() => return canceled(),
                written = destination.write_all(&buffer[..read]) => written,
            };
            stats.writes += 1;
            if let Err(error) = written {
                return failed(StreamCopyResult::OutputError, error, cancel);
            }
            stats.bytes += read as u64;
        }

        let flushed = tokio::select! {
            biased;
            () = cancel.cancelled() => return canceled(),
            flushed = destination.flush() => flushed,
        };
        match flushed {
            Ok(()) => (StreamCopyResult::Success, None),
            Err(error) => failed(StreamCopyResult::OutputError, error, cancel),
        }
    }
}

fn canceled() -> (StreamCopyResult, Option<io::Error>) {
    (
        StreamCopyResult::Canceled,
        Some(crate::errors::Canceled::into_io()),
    )
}

fn failed(
    result: StreamCopyResult,
    error: io::Error,
    cancel: &CancellationToken,
) -> (StreamCopyResult, Option<io::Error>) {
    if cancel.is_cancelled() || is_canceled(&error) {
        (StreamCopyResult::Canceled, Some(error))
    } else {
        (result, Some(error))
    }
}
