//! Relays an upgraded connection after a `101 Switching Protocols`.

use crate::classify::{CopyPhase, Severity, classify, report};
use crate::context::{AbortReason, RequestContext, UpgradeFuture, UpgradedIo};
use crate::copy::{CopyOutcome, CopyTags, StreamCopier, StreamCopyResult};
use crate::errors::{ForwarderError, ProxyError, SharedError};
use crate::telemetry::{self, CopyDirection, ForwarderStage};
use futures_util::future::{Either, select};
use http::StatusCode;
use std::pin::pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Complete both upgrade handshakes and relay bytes until the tunnel closes.
///
/// The client response must still be unstarted with the destination's `101` status and
/// headers copied onto it.
pub(crate) async fn handle_upgrade(
    context: &mut RequestContext,
    destination: Option<UpgradeFuture>,
    copier: &StreamCopier,
) -> Result<(), ForwarderError> {
    let destination = destination.ok_or(ForwarderError::MissingUpgradeStream)?;

    let destination = match destination.await {
        Ok(io) => io,
        Err(error) => {
            fail_unstarted(context, ProxyError::UpgradeResponseDestination, Arc::new(error));
            return Ok(());
        }
    };

    let Some(client) = context.request.take_upgrade() else {
        let error = std::io::Error::other("the client connection cannot be upgraded");
        fail_unstarted(context, ProxyError::UpgradeResponseClient, Arc::new(error));
        return Ok(());
    };

    context.response.start();
    let client = match client.await {
        Ok(io) => io,
        Err(error) => {
            let source: SharedError = Arc::new(error);
            report(context, ProxyError::UpgradeResponseClient, Some(source), Severity::Primary);
            context.response.abort(AbortReason::InternalError);
            return Ok(());
        }
    };

    telemetry::forwarder_stage(&context.route, ForwarderStage::ResponseUpgrade);
    relay(context, client, destination, copier).await;
    Ok(())
}

fn fail_unstarted(context: &mut RequestContext, error: ProxyError, source: SharedError) {
    report(context, error, Some(source), Severity::Primary);
    context.response.clear();
    context.response.set_status(StatusCode::BAD_GATEWAY);
}

async fn relay(
    context: &mut RequestContext,
    client: UpgradedIo,
    destination: UpgradedIo,
    copier: &StreamCopier,
) {
    let cancel = context.disconnect.child_token();
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut destination_read, mut destination_write) = tokio::io::split(destination);
    let request_tags = CopyTags::new(CopyDirection::Request, context.route.clone());
    let response_tags = CopyTags::new(CopyDirection::Response, context.route.clone());

    let request_copy = pin!(copy_half(
        copier,
        &mut client_read,
        &mut destination_write,
        &cancel,
        &request_tags
    ));
    let response_copy = pin!(copy_half(
        copier,
        &mut destination_read,
        &mut client_write,
        &cancel,
        &response_tags
    ));

    let finished = select(request_copy, response_copy).await;
    let (first_phase, first, second_phase, second) = match finished {
        Either::Left((outcome, remaining)) => {
            (CopyPhase::UpgradeRequest, outcome, CopyPhase::UpgradeResponse, remaining)
        }
        Either::Right((outcome, remaining)) => {
            (CopyPhase::UpgradeResponse, outcome, CopyPhase::UpgradeRequest, remaining)
        }
    };

    if first.result == StreamCopyResult::Success {
        debug!(phase = ?first_phase, bytes = first.stats.bytes, "upgraded stream half closed");
        let second = second.await;
        if second.result != StreamCopyResult::Success {
            report_copy(context, second_phase, second);
        }
    } else {
        report_copy(context, first_phase, first);
        cancel.cancel();
        // Induced by the cancellation above; not reported.
        let _ = second.await;
    }
}

async fn copy_half<R, W>(
    copier: &StreamCopier,
    source: &mut ReadHalf<R>,
    destination: &mut WriteHalf<W>,
    cancel: &CancellationToken,
    tags: &CopyTags,
) -> CopyOutcome
where
    R: AsyncRead + AsyncWrite,
    W: AsyncRead + AsyncWrite,
{
    let outcome = copier.copy(source, destination, cancel, tags).await;
    if outcome.result == StreamCopyResult::Success {
        // Propagate end of stream to the peer; the other direction keeps running.
        if let Err(error) = destination.shutdown().await {
            debug!(%error, "failed to half close upgraded stream");
        }
    }
    outcome
}

fn report_copy(context: &mut RequestContext, phase: CopyPhase, outcome: CopyOutcome) {
    let error = classify(outcome.result, phase);
    let source = outcome.error.map(|error| Arc::new(error) as SharedError);
    report(context, error, source, Severity::Primary);
}
