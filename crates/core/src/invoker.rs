use crate::context::{UpgradeFuture, UpgradedIo};
use crate::errors::BoxError;
use crate::request_body::OutgoingBody;
use bytes::Bytes;
use ferry_config::VersionPolicy;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::{Request, Response, StatusCode, Version, response};
use http_body::Body;
use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::fmt;
use std::io;
use tracing::trace;

/// Body of a destination response.
pub type DestinationBody = UnsyncBoxBody<Bytes, BoxError>;

/// The head and streaming body of a destination response.
pub struct DestinationResponse {
    /// Status, version and headers.
    pub parts: response::Parts,
    /// The response body, streamed.
    pub body: DestinationBody,
    /// Upgraded destination connection, present on `101 Switching Protocols`.
    pub upgrade: Option<UpgradeFuture>,
}

impl fmt::Debug for DestinationResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationResponse")
            .field("parts", &self.parts)
            .field("upgradable", &self.upgrade.is_some())
            .finish_non_exhaustive()
    }
}

impl DestinationResponse {
    /// Wrap a response whose body streams.
    pub fn new<B>(response: Response<B>) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = response.into_parts();
        Self {
            parts,
            body: body.map_err(Into::into).boxed_unsync(),
            upgrade: None,
        }
    }

    /// Attach the upgraded destination connection.
    pub fn with_upgrade(mut self, upgrade: UpgradeFuture) -> Self {
        self.upgrade = Some(upgrade);
        self
    }
}

/// Streaming HTTP client used to reach destinations.
///
/// Implementations must stream response bodies; invokers that buffer whole responses are
/// rejected by the forwarder.
pub trait DestinationInvoker: Send + Sync {
    /// Send `request` and resolve once the response head arrived.
    fn send(
        &self,
        request: Request<OutgoingBody>,
    ) -> BoxFuture<'static, Result<DestinationResponse, BoxError>>;

    /// Whether the invoker reads whole response bodies before returning.
    fn buffers_responses(&self) -> bool {
        false
    }
}

/// Protocol actually spoken to a destination for a requested version and policy.
///
/// HTTP/2 without TLS can only be used with prior knowledge, so it is chosen only when the
/// policy forbids falling back to a lower version.
pub fn select_version(version: Version, policy: VersionPolicy) -> Version {
    if version >= Version::HTTP_2 && policy != VersionPolicy::RequestVersionOrLower {
        Version::HTTP_2
    } else {
        Version::HTTP_11
    }
}

/// [`DestinationInvoker`] backed by pooled hyper clients.
#[derive(Debug, Clone)]
pub struct HyperInvoker {
    http1: Client<HttpConnector, OutgoingBody>,
    http2: Client<HttpConnector, OutgoingBody>,
}

impl Default for HyperInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl HyperInvoker {
    /// Create an invoker with one pool per protocol.
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let http1 = Client::builder(TokioExecutor::new()).build(connector.clone());
        let http2 = Client::builder(TokioExecutor::new())
            .http2_only(true)
            .build(connector);
        Self { http1, http2 }
    }
}

impl DestinationInvoker for HyperInvoker {
    fn send(
        &self,
        mut request: Request<OutgoingBody>,
    ) -> BoxFuture<'static, Result<DestinationResponse, BoxError>> {
        let policy = request
            .extensions()
            .get::<VersionPolicy>()
            .copied()
            .unwrap_or_default();
        let version = select_version(request.version(), policy);
        *request.version_mut() = version;
        let client = if version == Version::HTTP_2 {
            self.http2.clone()
        } else {
            self.http1.clone()
        };
        trace!(uri = %request.uri(), ?version, "sending request to destination");

        async move {
            let mut response = client.request(request).await?;
            let upgrade = (response.status() == StatusCode::SWITCHING_PROTOCOLS).then(|| {
                let on_upgrade = hyper::upgrade::on(&mut response);
                async move {
                    let upgraded = on_upgrade.await.map_err(io::Error::other)?;
                    Ok::<_, io::Error>(Box::new(TokioIo::new(upgraded)) as UpgradedIo)
                }
                .boxed()
            });
            let response = DestinationResponse::new(response);
            Ok::<_, BoxError>(match upgrade {
                Some(upgrade) => response.with_upgrade(upgrade),
                None => response,
            })
        }
        .boxed()
    }
}
