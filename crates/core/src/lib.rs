#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/ferry-proxy/ferry/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod autoflush;
mod body_reader;
mod channel;
mod classify;
mod context;
mod copy;
mod errors;
mod forwarder;
mod invoker;
mod pool;
mod request_body;
mod runtime;
mod server;
mod telemetry;
mod transform;
mod upgrade;

pub use autoflush::AutoFlushWriter;
pub use classify::{CopyPhase, Severity, classify, report};
pub use context::{
    AbortReason, ClientRequest, ClientResponse, Duplex, IncomingBody, RequestBodyLimits,
    RequestContext, ResponseBody, ResponseWriter, UpgradeFuture, UpgradedIo,
};
pub use copy::{CopyOutcome, CopyTags, StreamCopier, StreamCopyResult};
pub use errors::{
    AggregateError, BoxError, Canceled, ForwarderError, ProxyError, ProxyErrorRecord,
    RuntimeError, SharedError, is_canceled,
};
pub use forwarder::{ForwarderSettings, HttpForwarder};
pub use invoker::{
    DestinationBody, DestinationInvoker, DestinationResponse, HyperInvoker, select_version,
};
pub use pool::{BufferPool, PooledBuffer, SharedBufferPool};
pub use request_body::{
    BodyOutcome, ForwardedBody, ForwardedBodyError, OutgoingBody, RequestBodyForwarder,
};
pub use runtime::{run, run_with_state};
pub use server::{AppState, BodyLimitError, router};
pub use telemetry::{CopyDirection, ForwarderStage, RouteInfo, TransferStats};
pub use transform::{
    DefaultTransformer, HttpTransformer, OutgoingRequest, REQUEST_SKIPPED_HEADERS,
    RESPONSE_SKIPPED_HEADERS, copy_request_headers, copy_response_headers,
    is_request_header_skipped, is_response_header_skipped, make_destination_uri,
};
