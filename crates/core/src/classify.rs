use crate::context::RequestContext;
use crate::copy::StreamCopyResult;
use crate::errors::{ProxyError, ProxyErrorRecord, SharedError};
use crate::telemetry;
use tracing::{info, warn};

/// Which copy produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPhase {
    /// Client request body to destination.
    RequestBody,
    /// Destination response body to client.
    ResponseBody,
    /// Client to destination on an upgraded connection.
    UpgradeRequest,
    /// Destination to client on an upgraded connection.
    UpgradeResponse,
}

/// Classify a failed copy.
///
/// Request side copies read from the client and write to the destination; response side
/// copies do the reverse.
///
/// # Panics
///
/// Panics on [`StreamCopyResult::Success`], which is not a failure.
pub fn classify(result: StreamCopyResult, phase: CopyPhase) -> ProxyError {
    use CopyPhase as P;
    use StreamCopyResult as R;

    match (phase, result) {
        (_, R::Success) => panic!("a successful {phase:?} copy has no error classification"),
        (P::RequestBody, R::InputError) => ProxyError::RequestBodyClient,
        (P::RequestBody, R::OutputError) => ProxyError::RequestBodyDestination,
        (P::RequestBody, R::Canceled) => ProxyError::RequestBodyCanceled,
        (P::ResponseBody, R::InputError) => ProxyError::ResponseBodyDestination,
        (P::ResponseBody, R::OutputError) => ProxyError::ResponseBodyClient,
        (P::ResponseBody, R::Canceled) => ProxyError::ResponseBodyCanceled,
        (P::UpgradeRequest, R::InputError) => ProxyError::UpgradeRequestClient,
        (P::UpgradeRequest, R::OutputError) => ProxyError::UpgradeRequestDestination,
        (P::UpgradeRequest, R::Canceled) => ProxyError::UpgradeRequestCanceled,
        (P::UpgradeResponse, R::InputError) => ProxyError::UpgradeResponseDestination,
        (P::UpgradeResponse, R::OutputError) => ProxyError::UpgradeResponseClient,
        (P::UpgradeResponse, R::Canceled) => ProxyError::UpgradeResponseCanceled,
    }
}

/// How loudly a failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The failure decided the outcome of the exchange.
    Primary,
    /// The failure happened after the client already got a good response.
    Secondary,
}

impl Severity {
    /// Stable identifier used in metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

/// Log `error`, count it, and attach it to the exchange.
pub fn report(
    context: &mut RequestContext,
    error: ProxyError,
    source: Option<SharedError>,
    severity: Severity,
) {
    let cause = source.as_ref().map(ToString::to_string);
    let quiet = severity == Severity::Secondary || error.is_cancellation();
    if quiet {
        info!(
            %error,
            cause = cause.as_deref().unwrap_or("none"),
            cluster = context.route.cluster_id(),
            route = context.route.route_id(),
            "{}",
            error.description()
        );
    } else {
        warn!(
            %error,
            cause = cause.as_deref().unwrap_or("none"),
            cluster = context.route.cluster_id(),
            route = context.route.route_id(),
            "{}",
            error.description()
        );
    }
    telemetry::forwarder_failed(&context.route, error, severity);
    context.error = Some(ProxyErrorRecord::new(error, source));
}
