use crate::errors::{BoxError, ProxyErrorRecord};
use crate::telemetry::RouteInfo;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, Method, Response, StatusCode, Uri, Version, request};
use http_body::{Body, Frame};
use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard, PollSender};

const RESPONSE_CHANNEL_CAPACITY: usize = 4;

/// Body of the incoming client request.
pub type IncomingBody = UnsyncBoxBody<Bytes, BoxError>;

/// A bidirectional byte stream obtained from a protocol upgrade.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Duplex for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Upgraded connection handed over after a `101 Switching Protocols`.
pub type UpgradedIo = Box<dyn Duplex>;

/// Resolves to the upgraded connection once the upgrade handshake completed.
pub type UpgradeFuture = BoxFuture<'static, io::Result<UpgradedIo>>;

/// Limits the host applies while reading the client request body.
///
/// Shared with the host body wrapper; the forwarder lifts them for streaming requests
/// before the body is read.
#[derive(Debug)]
pub struct RequestBodyLimits {
    max_size: AtomicU64,
    // Milliseconds.
    read_timeout: AtomicU64,
}

// Stored in place of a disabled limit.
const UNLIMITED: u64 = u64::MAX;

impl Default for RequestBodyLimits {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl RequestBodyLimits {
    /// Create limits for a maximum body size and a per-read idle timeout.
    pub fn new(max_size: Option<u64>, read_timeout: Option<Duration>) -> Self {
        let read_timeout =
            read_timeout.map(|timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        Self {
            max_size: AtomicU64::new(encode_limit(max_size)),
            read_timeout: AtomicU64::new(encode_limit(read_timeout)),
        }
    }

    /// Maximum number of body bytes accepted from the client. `Some(0)` accepts no data.
    pub fn max_size(&self) -> Option<u64> {
        match self.max_size.load(Ordering::Acquire) {
            UNLIMITED => None,
            size => Some(size),
        }
    }

    /// Longest time a single body read may wait for client data.
    pub fn read_timeout(&self) -> Option<Duration> {
        match self.read_timeout.load(Ordering::Acquire) {
            UNLIMITED => None,
            millis => Some(Duration::from_millis(millis)),
        }
    }

    /// Lift every limit.
    pub fn disable(&self) {
        self.max_size.store(UNLIMITED, Ordering::Release);
        self.read_timeout.store(UNLIMITED, Ordering::Release);
    }
}

const fn encode_limit(limit: Option<u64>) -> u64 {
    match limit {
        Some(limit) if limit < UNLIMITED => limit,
        Some(_) => UNLIMITED - 1,
        None => UNLIMITED,
    }
}

/// The request received from the client.
pub struct ClientRequest {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Option<IncomingBody>,
    upgrade: Option<UpgradeFuture>,
    can_have_body: Option<bool>,
    limits: Arc<RequestBodyLimits>,
}

impl fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRequest")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .field("upgradable", &self.upgrade.is_some())
            .field("can_have_body", &self.can_have_body)
            .finish()
    }
}

impl ClientRequest {
    /// Create a request from its head and body.
    pub fn new(parts: request::Parts, body: IncomingBody) -> Self {
        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body: Some(body),
            upgrade: None,
            can_have_body: None,
            limits: Arc::default(),
        }
    }

    /// Create a request from any body type.
    pub fn from_request<B>(request: http::Request<B>) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = request.into_parts();
        Self::new(parts, body.map_err(Into::into).boxed_unsync())
    }

    /// Attach the host facility that upgrades the client connection.
    pub fn with_upgrade(mut self, upgrade: UpgradeFuture) -> Self {
        self.upgrade = Some(upgrade);
        self
    }

    /// Record the host's authoritative answer on whether a body follows the head.
    pub const fn with_can_have_body(mut self, can_have_body: Option<bool>) -> Self {
        self.can_have_body = can_have_body;
        self
    }

    /// Share body limits with the host.
    pub fn with_limits(mut self, limits: Arc<RequestBodyLimits>) -> Self {
        self.limits = limits;
        self
    }

    /// Request method.
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// Request target as received.
    pub const fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Protocol version the client spoke.
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Request headers.
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Host signal on whether a body follows, if the host knows.
    pub const fn can_have_body(&self) -> Option<bool> {
        self.can_have_body
    }

    /// Body limits.
    pub fn limits(&self) -> &RequestBodyLimits {
        &self.limits
    }

    /// Whether the host can upgrade the client connection.
    pub const fn is_upgradable(&self) -> bool {
        self.upgrade.is_some()
    }

    pub(crate) fn take_body(&mut self) -> Option<IncomingBody> {
        self.body.take()
    }

    pub(crate) fn take_upgrade(&mut self) -> Option<UpgradeFuture> {
        self.upgrade.take()
    }
}

/// Why a response that already started is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The exchange was canceled.
    Cancelled,
    /// The proxy failed mid-response.
    InternalError,
}

impl AbortReason {
    /// HTTP/2 reset code sent to the client.
    pub const fn reason(self) -> h2::Reason {
        match self {
            Self::Cancelled => h2::Reason::CANCEL,
            Self::InternalError => h2::Reason::INTERNAL_ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Completed,
    Aborted(AbortReason),
}

/// The response written back to the client.
///
/// Status and headers can be changed until the response [started](Self::has_started).
/// Dropping the response without [completing](Self::complete) it aborts the body.
pub struct ClientResponse {
    status: StatusCode,
    headers: HeaderMap,
    trailers: HeaderMap,
    head: Option<oneshot::Sender<Response<ResponseBody>>>,
    body: Option<ResponseBody>,
    frames: Option<mpsc::Sender<Frame<Bytes>>>,
    finish: Option<oneshot::Sender<Finish>>,
}

impl fmt::Debug for ClientResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("started", &self.has_started())
            .field("finished", &self.finish.is_none())
            .finish()
    }
}

impl ClientResponse {
    /// Create a response and the receiver the host awaits its head on.
    ///
    /// `disconnect` fires if the host drops the body before its end, unless the response
    /// switches protocols.
    pub fn channel(
        disconnect: Option<DropGuard>,
    ) -> (Self, oneshot::Receiver<Response<ResponseBody>>) {
        let (head_tx, head_rx) = oneshot::channel();
        let (frames_tx, frames_rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let (finish_tx, finish_rx) = oneshot::channel();
        let body = ResponseBody {
            disconnect,
            frames: frames_rx,
            finish: Some(finish_rx),
            state: None,
            done: false,
        };
        let response = Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            trailers: HeaderMap::new(),
            head: Some(head_tx),
            body: Some(body),
            frames: Some(frames_tx),
            finish: Some(finish_tx),
        };
        (response, head_rx)
    }

    /// Response status.
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Set the status. Ignored once started.
    pub fn set_status(&mut self, status: StatusCode) {
        if !self.has_started() {
            self.status = status;
        }
    }

    /// Response headers.
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable response headers. Changes after the start are not sent.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Trailers sent by [`Self::send_trailers`].
    pub fn trailers_mut(&mut self) -> &mut HeaderMap {
        &mut self.trailers
    }

    /// Whether the head was handed to the host.
    pub const fn has_started(&self) -> bool {
        self.body.is_none()
    }

    /// Hand the head to the host. Does nothing if already started.
    pub fn start(&mut self) {
        let Some(mut body) = self.body.take() else {
            return;
        };
        if self.status == StatusCode::SWITCHING_PROTOCOLS {
            // The connection outlives this body once upgraded.
            if let Some(guard) = body.disconnect.take() {
                guard.disarm();
            }
            body.done = true;
            self.frames = None;
        }
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers.clone();
        if let Some(head) = self.head.take() {
            // The host stopped waiting; the disconnect token reports it.
            let _ = head.send(response);
        }
    }

    /// Reset status, headers and trailers. Returns `false` if the response already started.
    pub fn clear(&mut self) -> bool {
        if self.has_started() {
            return false;
        }
        self.status = StatusCode::OK;
        self.headers.clear();
        self.trailers.clear();
        true
    }

    /// Writer for the response body; the response starts on the first non-empty write.
    pub fn body_writer(&mut self) -> ResponseWriter<'_> {
        let sender = self.frames.clone().map(PollSender::new);
        ResponseWriter {
            response: self,
            sender,
        }
    }

    /// Send the collected trailers, if any.
    pub async fn send_trailers(&mut self) -> io::Result<()> {
        if self.trailers.is_empty() {
            return Ok(());
        }
        self.start();
        let trailers = std::mem::take(&mut self.trailers);
        let Some(frames) = &self.frames else {
            return Err(body_closed());
        };
        frames
            .send(Frame::trailers(trailers))
            .await
            .map_err(|_| body_closed())
    }

    /// Tear down a started response so the client cannot mistake it for complete.
    pub fn abort(&mut self, reason: AbortReason) {
        if let Some(finish) = self.finish.take() {
            let _ = finish.send(Finish::Aborted(reason));
        }
        self.head = None;
        self.frames = None;
    }

    /// Start the response if needed and end its body.
    pub fn complete(&mut self) {
        self.start();
        if let Some(finish) = self.finish.take() {
            let _ = finish.send(Finish::Completed);
        }
        self.frames = None;
    }

    /// Whether the response was completed or aborted.
    pub const fn is_finished(&self) -> bool {
        self.finish.is_none()
    }
}

fn body_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client response body was closed")
}

/// [`AsyncWrite`] over the body of a [`ClientResponse`].
pub struct ResponseWriter<'a> {
    response: &'a mut ClientResponse,
    sender: Option<PollSender<Frame<Bytes>>>,
}

impl fmt::Debug for ResponseWriter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseWriter")
            .field("response", &self.response)
            .finish_non_exhaustive()
    }
}

impl AsyncWrite for ResponseWriter<'_> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        this.response.start();
        let Some(sender) = this.sender.as_mut() else {
            return Poll::Ready(Err(body_closed()));
        };
        ready!(sender.poll_reserve(cx)).map_err(|_| body_closed())?;
        sender
            .send_item(Frame::data(Bytes::copy_from_slice(buf)))
            .map_err(|_| body_closed())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Body the host streams to the client.
///
/// Yields the frames written through [`ClientResponse`]. If the response is aborted, or
/// dropped unfinished, the body fails with an [`h2::Error`] carrying the reset reason,
/// which hyper turns into a stream reset on HTTP/2 and a closed connection on HTTP/1.
pub struct ResponseBody {
    // Dropped first so writers see the disconnect before the closed channel.
    disconnect: Option<DropGuard>,
    frames: mpsc::Receiver<Frame<Bytes>>,
    finish: Option<oneshot::Receiver<Finish>>,
    state: Option<Finish>,
    done: bool,
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody").field("done", &self.done).finish()
    }
}

impl ResponseBody {
    fn poll_finish(&mut self, cx: &mut Context<'_>) -> Option<Finish> {
        if let Some(finish) = self.finish.as_mut() {
            match Pin::new(finish).poll(cx) {
                Poll::Ready(Ok(state)) => {
                    self.finish = None;
                    self.state = Some(state);
                }
                // Dropped without completing.
                Poll::Ready(Err(_)) => {
                    self.finish = None;
                    self.state = Some(Finish::Aborted(AbortReason::InternalError));
                }
                Poll::Pending => {}
            }
        }
        self.state
    }

    fn aborted(&mut self, reason: AbortReason) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        self.done = true;
        Poll::Ready(Some(Err(Box::new(h2::Error::from(reason.reason())))))
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if let Some(Finish::Aborted(reason)) = this.poll_finish(cx) {
            return this.aborted(reason);
        }
        if let Some(frame) = ready!(this.frames.poll_recv(cx)) {
            return Poll::Ready(Some(Ok(frame)));
        }
        match this.poll_finish(cx) {
            Some(Finish::Completed) => {
                this.done = true;
                if let Some(guard) = this.disconnect.take() {
                    guard.disarm();
                }
                Poll::Ready(None)
            }
            Some(Finish::Aborted(reason)) => this.aborted(reason),
            None => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done
    }
}

/// Everything the forwarder reads from and writes to for one client exchange.
#[derive(Debug)]
pub struct RequestContext {
    pub(crate) request: ClientRequest,
    pub(crate) response: ClientResponse,
    pub(crate) disconnect: CancellationToken,
    pub(crate) route: RouteInfo,
    pub(crate) error: Option<ProxyErrorRecord>,
}

impl RequestContext {
    /// Bundle an exchange. `disconnect` must fire when the client goes away.
    pub fn new(
        request: ClientRequest,
        response: ClientResponse,
        disconnect: CancellationToken,
    ) -> Self {
        Self {
            request,
            response,
            disconnect,
            route: RouteInfo::default(),
            error: None,
        }
    }

    /// Label telemetry with the matched route.
    pub fn with_route(mut self, route: RouteInfo) -> Self {
        self.route = route;
        self
    }

    /// The client request.
    pub const fn request(&self) -> &ClientRequest {
        &self.request
    }

    /// The client response.
    pub const fn response(&self) -> &ClientResponse {
        &self.response
    }

    /// Mutable client response.
    pub fn response_mut(&mut self) -> &mut ClientResponse {
        &mut self.response
    }

    /// Token fired when the client disconnects.
    pub const fn disconnect(&self) -> &CancellationToken {
        &self.disconnect
    }

    /// Route labels.
    pub const fn route(&self) -> &RouteInfo {
        &self.route
    }

    /// The failure reported for this exchange, if any.
    pub const fn proxy_error(&self) -> Option<&ProxyErrorRecord> {
        self.error.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::io::AsyncWriteExt;

    #[rstest]
    fn limits_can_be_lifted() {
        let limits = RequestBodyLimits::new(Some(1024), Some(Duration::from_secs(5)));
        assert_eq!(limits.max_size(), Some(1024));
        assert_eq!(limits.read_timeout(), Some(Duration::from_secs(5)));
        limits.disable();
        assert_eq!(limits.max_size(), None);
        assert_eq!(limits.read_timeout(), None);
    }

    #[rstest]
    fn zero_limits_are_kept() {
        let limits = RequestBodyLimits::new(Some(0), Some(Duration::ZERO));
        assert_eq!(limits.max_size(), Some(0));
        assert_eq!(limits.read_timeout(), Some(Duration::ZERO));
        assert_eq!(RequestBodyLimits::default().max_size(), None);
    }

    #[tokio::test]
    async fn first_write_starts_the_response() {
        let (mut response, head) = ClientResponse::channel(None);
        response.set_status(StatusCode::CREATED);
        response.headers_mut().insert("x-test", "1".parse().unwrap());
        assert!(!response.has_started());

        response.body_writer().write_all(b"hello").await.unwrap();
        assert!(response.has_started());
        response.set_status(StatusCode::IM_A_TEAPOT);
        response.complete();

        let head = head.await.unwrap();
        assert_eq!(head.status(), StatusCode::CREATED);
        assert_eq!(head.headers()["x-test"], "1");
        let body = head.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn clear_only_before_start() {
        let (mut response, _head) = ClientResponse::channel(None);
        response.set_status(StatusCode::NOT_FOUND);
        response.headers_mut().insert("x-test", "1".parse().unwrap());
        assert!(response.clear());
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().is_empty());

        response.start();
        assert!(!response.clear());
    }

    #[tokio::test]
    async fn abort_fails_the_body_with_reset_reason() {
        let (mut response, head) = ClientResponse::channel(None);
        response.body_writer().write_all(b"partial").await.unwrap();
        response.abort(AbortReason::Cancelled);

        let mut body = head.await.unwrap().into_body();
        let mut reason = None;
        while let Some(frame) = body.frame().await {
            if let Err(error) = frame {
                reason = error.downcast_ref::<h2::Error>().and_then(h2::Error::reason);
                break;
            }
        }
        assert_eq!(reason, Some(h2::Reason::CANCEL));
    }

    #[tokio::test]
    async fn dropped_response_is_not_a_clean_end() {
        let (mut response, head) = ClientResponse::channel(None);
        response.start();
        drop(response);
        let result = head.await.unwrap().into_body().collect().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn body_dropped_early_fires_disconnect() {
        let token = CancellationToken::new();
        let (mut response, head) = ClientResponse::channel(Some(token.clone().drop_guard()));
        response.start();
        drop(head.await.unwrap());
        assert!(token.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_body_cancels_before_writers_see_it_closed() {
        let token = CancellationToken::new();
        let (mut response, head) = ClientResponse::channel(Some(token.clone().drop_guard()));
        let observer = token.clone();
        let writer = tokio::spawn(async move {
            let mut writer = response.body_writer();
            loop {
                if writer.write_all(b"chunk").await.is_err() {
                    return observer.is_cancelled();
                }
            }
        });

        drop(head.await.unwrap());
        assert!(writer.await.unwrap());
    }

    #[tokio::test]
    async fn completed_body_leaves_disconnect_untouched() {
        let token = CancellationToken::new();
        let (mut response, head) = ClientResponse::channel(Some(token.clone().drop_guard()));
        response.trailers_mut().insert("grpc-status", "0".parse().unwrap());
        response.send_trailers().await.unwrap();
        response.complete();
        let collected = head.await.unwrap().into_body().collect().await.unwrap();
        assert_eq!(
            collected.trailers().map(|t| t["grpc-status"].clone()),
            Some("0".parse().unwrap())
        );
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn switching_protocols_disarms_disconnect() {
        let token = CancellationToken::new();
        let (mut response, head) = ClientResponse::channel(Some(token.clone().drop_guard()));
        response.set_status(StatusCode::SWITCHING_PROTOCOLS);
        response.start();
        drop(head.await.unwrap());
        assert!(!token.is_cancelled());
    }
}
