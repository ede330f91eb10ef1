use http::{Method, StatusCode};
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Type-erased error produced by bodies, invokers and transforms.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased error that can be observed more than once.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the host runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Failed to bind to the requested socket.
    #[error("failed to bind proxy socket: {0}")]
    Bind(io::Error),
    /// Axum server error.
    #[error("server error: {0}")]
    Server(io::Error),
    /// The configured destination prefix cannot be forwarded to.
    #[error("invalid destination prefix: {0}")]
    Destination(#[from] ForwarderError),
}

/// Contract violations that make a forward impossible.
///
/// These are never classified as a [`ProxyError`]; they indicate a caller bug.
#[derive(Debug, Error)]
pub enum ForwarderError {
    /// The destination prefix is too short or not an absolute URI.
    #[error("destination prefix '{0}' is not an absolute URI prefix")]
    InvalidDestinationPrefix(String),
    /// The incoming method cannot be forwarded.
    #[error("method {0} is not supported by the forwarder")]
    UnsupportedMethod(Method),
    /// The invoker buffers whole responses and cannot stream.
    #[error("destination invoker buffers responses; a streaming invoker is required")]
    BufferingInvoker,
    /// The destination switched protocols without exposing the upgraded stream.
    #[error("destination responded 101 without an upgraded stream")]
    MissingUpgradeStream,
    /// The request transform failed before anything was sent.
    #[error("request transform failed: {0}")]
    RequestTransform(BoxError),
    /// The response trailer transform failed.
    #[error("response trailer transform failed: {0}")]
    ResponseTrailersTransform(SharedError),
    /// The destination URI could not be built.
    #[error("failed to build destination uri: {0}")]
    DestinationUri(#[from] http::uri::InvalidUri),
    /// The outgoing request could not be built.
    #[error("failed to build outgoing request: {0}")]
    OutgoingRequest(#[from] http::Error),
}

/// Every externally reportable forwarding failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyError {
    /// The request could not be sent, or no response arrived.
    Request,
    /// The destination did not start responding within the request timeout.
    RequestTimedOut,
    /// The client went away before a response arrived.
    RequestCanceled,
    /// Copying the request body was canceled.
    RequestBodyCanceled,
    /// Reading the request body from the client failed.
    RequestBodyClient,
    /// Writing the request body to the destination failed.
    RequestBodyDestination,
    /// Copying the response status and headers failed.
    ResponseHeaders,
    /// Copying the response body was canceled.
    ResponseBodyCanceled,
    /// Writing the response body to the client failed.
    ResponseBodyClient,
    /// Reading the response body from the destination failed.
    ResponseBodyDestination,
    /// The client to destination half of an upgraded connection was canceled.
    UpgradeRequestCanceled,
    /// Reading from the client on an upgraded connection failed.
    UpgradeRequestClient,
    /// Writing to the destination on an upgraded connection failed.
    UpgradeRequestDestination,
    /// The destination to client half of an upgraded connection was canceled.
    UpgradeResponseCanceled,
    /// Upgrading the client connection, or writing to it, failed.
    UpgradeResponseClient,
    /// Upgrading the destination connection, or reading from it, failed.
    UpgradeResponseDestination,
}

impl ProxyError {
    /// Every variant, in declaration order.
    pub const ALL: [Self; 16] = [
        Self::Request,
        Self::RequestTimedOut,
        Self::RequestCanceled,
        Self::RequestBodyCanceled,
        Self::RequestBodyClient,
        Self::RequestBodyDestination,
        Self::ResponseHeaders,
        Self::ResponseBodyCanceled,
        Self::ResponseBodyClient,
        Self::ResponseBodyDestination,
        Self::UpgradeRequestCanceled,
        Self::UpgradeRequestClient,
        Self::UpgradeRequestDestination,
        Self::UpgradeResponseCanceled,
        Self::UpgradeResponseClient,
        Self::UpgradeResponseDestination,
    ];

    /// Stable identifier used in logs and metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::RequestTimedOut => "request_timed_out",
            Self::RequestCanceled => "request_canceled",
            Self::RequestBodyCanceled => "request_body_canceled",
            Self::RequestBodyClient => "request_body_client",
            Self::RequestBodyDestination => "request_body_destination",
            Self::ResponseHeaders => "response_headers",
            Self::ResponseBodyCanceled => "response_body_canceled",
            Self::ResponseBodyClient => "response_body_client",
            Self::ResponseBodyDestination => "response_body_destination",
            Self::UpgradeRequestCanceled => "upgrade_request_canceled",
            Self::UpgradeRequestClient => "upgrade_request_client",
            Self::UpgradeRequestDestination => "upgrade_request_destination",
            Self::UpgradeResponseCanceled => "upgrade_response_canceled",
            Self::UpgradeResponseClient => "upgrade_response_client",
            Self::UpgradeResponseDestination => "upgrade_response_destination",
        }
    }

    /// Status sent to the client when nothing has been sent yet.
    pub const fn status_code(self) -> StatusCode {
        match self {
            Self::RequestTimedOut => StatusCode::GATEWAY_TIMEOUT,
            Self::RequestBodyClient => StatusCode::BAD_REQUEST,
            Self::Request
            | Self::RequestCanceled
            | Self::RequestBodyCanceled
            | Self::RequestBodyDestination
            | Self::ResponseHeaders
            | Self::ResponseBodyCanceled
            | Self::ResponseBodyClient
            | Self::ResponseBodyDestination
            | Self::UpgradeRequestCanceled
            | Self::UpgradeRequestClient
            | Self::UpgradeRequestDestination
            | Self::UpgradeResponseCanceled
            | Self::UpgradeResponseClient
            | Self::UpgradeResponseDestination => StatusCode::BAD_GATEWAY,
        }
    }

    /// Human readable description logged alongside the error.
    pub const fn description(self) -> &'static str {
        match self {
            Self::Request => "an error was encountered before receiving a response",
            Self::RequestTimedOut => "the request timed out before receiving a response",
            Self::RequestCanceled => "the request was canceled before receiving a response",
            Self::RequestBodyCanceled => "copying the request body was canceled",
            Self::RequestBodyClient => {
                "the client reported an error while sending the request body"
            }
            Self::RequestBodyDestination => {
                "the destination reported an error while receiving the request body"
            }
            Self::ResponseHeaders => "the response headers could not be copied to the client",
            Self::ResponseBodyCanceled => "copying the response body was canceled",
            Self::ResponseBodyClient => {
                "the client reported an error while receiving the response body"
            }
            Self::ResponseBodyDestination => {
                "the destination reported an error while sending the response body"
            }
            Self::UpgradeRequestCanceled => "copying the upgraded request stream was canceled",
            Self::UpgradeRequestClient => {
                "the client reported an error on the upgraded request stream"
            }
            Self::UpgradeRequestDestination => {
                "the destination reported an error on the upgraded request stream"
            }
            Self::UpgradeResponseCanceled => "copying the upgraded response stream was canceled",
            Self::UpgradeResponseClient => {
                "the client reported an error on the upgraded response stream"
            }
            Self::UpgradeResponseDestination => {
                "the destination reported an error on the upgraded response stream"
            }
        }
    }

    /// Whether the failure stems from a cancellation rather than a fault.
    pub const fn is_cancellation(self) -> bool {
        matches!(
            self,
            Self::RequestCanceled
                | Self::RequestBodyCanceled
                | Self::ResponseBodyCanceled
                | Self::UpgradeRequestCanceled
                | Self::UpgradeResponseCanceled
        )
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The failure attached to a forwarded request for downstream diagnostics.
#[derive(Debug, Clone)]
pub struct ProxyErrorRecord {
    error: ProxyError,
    source: Option<SharedError>,
}

impl ProxyErrorRecord {
    /// Create a new record.
    pub const fn new(error: ProxyError, source: Option<SharedError>) -> Self {
        Self { error, source }
    }

    /// The classified failure.
    pub const fn error(&self) -> ProxyError {
        self.error
    }

    /// The underlying error, if one was captured.
    pub fn source(&self) -> Option<&SharedError> {
        self.source.as_ref()
    }
}

/// Marker error for an operation stopped by its cancellation token.
#[derive(Debug, Clone, Copy, Default, Error)]
#[error("the operation was canceled")]
pub struct Canceled;

impl Canceled {
    /// Wrap the marker in an [`io::Error`].
    pub fn into_io() -> io::Error {
        io::Error::new(io::ErrorKind::Interrupted, Self)
    }
}

/// Returns `true` when `error` was raised by a cancellation.
pub fn is_canceled(error: &io::Error) -> bool {
    error
        .get_ref()
        .is_some_and(|inner| inner.is::<Canceled>() || source_chain_has_canceled(inner))
}

fn source_chain_has_canceled(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut cause = error.source();
    while let Some(inner) = cause {
        if inner.is::<Canceled>() {
            return true;
        }
        cause = inner.source();
    }
    false
}

/// A root-cause failure reported together with the failure it probably triggered.
#[derive(Debug, Error)]
#[error("{primary} (followed by: {secondary})")]
pub struct AggregateError {
    primary: SharedError,
    secondary: BoxError,
}

impl AggregateError {
    /// Combine `primary` with the `secondary` failure it caused.
    pub fn new(primary: SharedError, secondary: BoxError) -> Self {
        Self { primary, secondary }
    }

    /// The root-cause failure.
    pub const fn primary(&self) -> &SharedError {
        &self.primary
    }

    /// The failure observed afterwards.
    pub fn secondary(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.secondary.as_ref()
    }
}
