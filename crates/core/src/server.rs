use crate::context::{
    AbortReason, ClientRequest, ClientResponse, RequestBodyLimits, RequestContext, UpgradedIo,
};
use crate::errors::{BoxError, ForwarderError};
use crate::forwarder::{HttpForwarder, validate_destination_prefix};
use crate::invoker::{DestinationInvoker, HyperInvoker};
use crate::telemetry::RouteInfo;
use crate::transform::{DefaultTransformer, HttpTransformer};
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use bytes::Bytes;
use ferry_config::{Config, ForwardingOptions};
use futures_util::FutureExt;
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::BodyExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const CLUSTER_ID: &str = "default";
const ROUTE_ID: &str = "catch-all";

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    bind_address: SocketAddr,
    destination_prefix: Arc<str>,
    options: Arc<ForwardingOptions>,
    forwarder: HttpForwarder,
    invoker: Arc<dyn DestinationInvoker>,
    transformer: Arc<dyn HttpTransformer>,
    max_request_body_size: Option<u64>,
    request_body_read_timeout: Option<Duration>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("bind_address", &self.bind_address)
            .field("destination_prefix", &self.destination_prefix)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Create a new [`AppState`] from the resolved [`Config`].
    pub fn try_from_config(config: &Config) -> Result<Self, ForwarderError> {
        validate_destination_prefix(config.destination_prefix())?;

        debug!(
            bind_address = %config.bind_address(),
            destination_prefix = config.destination_prefix(),
            request_timeout = ?config.options().request_timeout(),
            "initializing app state"
        );

        Ok(Self {
            bind_address: config.bind_address(),
            destination_prefix: Arc::from(config.destination_prefix()),
            options: Arc::new(config.options().clone()),
            forwarder: HttpForwarder::default(),
            invoker: Arc::new(HyperInvoker::new()),
            transformer: Arc::new(DefaultTransformer),
            max_request_body_size: config.max_request_body_size(),
            request_body_read_timeout: config.request_body_read_timeout(),
        })
    }

    /// Replace the client used to reach the destination.
    pub fn with_invoker(mut self, invoker: Arc<dyn DestinationInvoker>) -> Self {
        self.invoker = invoker;
        self
    }

    /// Replace the request and response transforms.
    pub fn with_transformer(mut self, transformer: Arc<dyn HttpTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Replace the forwarder.
    pub fn with_forwarder(mut self, forwarder: HttpForwarder) -> Self {
        self.forwarder = forwarder;
        self
    }

    /// Socket address bound by the proxy.
    pub const fn bind_address(&self) -> SocketAddr {
        self.bind_address
    }
}

/// Constructs a new Axum [`Router`] forwarding every request with the provided state.
pub fn router(state: AppState) -> Router {
    Router::new().fallback(any(proxy_handler)).with_state(state)
}

async fn proxy_handler(State(state): State<AppState>, mut req: Request<Body>) -> Response {
    let upgrade = req.extensions_mut().remove::<OnUpgrade>().map(|on_upgrade| {
        async move {
            let upgraded = on_upgrade.await.map_err(io::Error::other)?;
            Ok::<_, io::Error>(Box::new(TokioIo::new(upgraded)) as UpgradedIo)
        }
        .boxed()
    });
    let can_have_body = !req.body().is_end_stream();
    let limits = Arc::new(RequestBodyLimits::new(
        state.max_request_body_size,
        state.request_body_read_timeout,
    ));

    let (parts, body) = req.into_parts();
    let body = LimitedBody::new(body, limits.clone()).boxed_unsync();
    let mut request = ClientRequest::new(parts, body)
        .with_can_have_body(Some(can_have_body))
        .with_limits(limits);
    if let Some(upgrade) = upgrade {
        request = request.with_upgrade(upgrade);
    }

    // Fires when either this handler or the response body is dropped early.
    let disconnect = CancellationToken::new();
    let handler_guard = disconnect.clone().drop_guard();
    let (response, head) = ClientResponse::channel(Some(disconnect.clone().drop_guard()));
    let route = RouteInfo::new(CLUSTER_ID, ROUTE_ID, state.destination_prefix.as_ref());
    let context = RequestContext::new(request, response, disconnect).with_route(route);

    tokio::spawn(forward(state, context));

    let response = head.await;
    handler_guard.disarm();
    match response {
        Ok(response) => response.map(Body::new),
        Err(_) => {
            error!("forwarder ended without a response");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

async fn forward(state: AppState, mut context: RequestContext) {
    let result = state
        .forwarder
        .forward(
            &mut context,
            &state.destination_prefix,
            state.invoker.as_ref(),
            &state.options,
            state.transformer.as_ref(),
        )
        .await;
    if let Err(error) = result {
        error!(%error, "request could not be forwarded");
        let response = context.response_mut();
        if response.clear() {
            response.set_status(StatusCode::INTERNAL_SERVER_ERROR);
        } else {
            response.abort(AbortReason::InternalError);
        }
    }
    context.response_mut().complete();
}

/// Request body limits enforced while the client body is read.
#[derive(Debug, Error)]
pub enum BodyLimitError {
    /// More data arrived than allowed.
    #[error("request body exceeds {0} bytes")]
    TooLarge(u64),
    /// The client stopped sending data.
    #[error("no request body data received within {0:?}")]
    ReadTimeout(Duration),
}

pin_project! {
    /// Client request body checked against live [`RequestBodyLimits`].
    struct LimitedBody<B> {
        #[pin]
        inner: B,
        limits: Arc<RequestBodyLimits>,
        received: u64,
        idle: Option<Pin<Box<Sleep>>>,
    }
}

impl<B> LimitedBody<B> {
    const fn new(inner: B, limits: Arc<RequestBodyLimits>) -> Self {
        Self {
            inner,
            limits,
            received: 0,
            idle: None,
        }
    }
}

impl<B> HttpBody for LimitedBody<B>
where
    B: HttpBody<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.project();
        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                *this.idle = None;
                if let Some(data) = frame.data_ref() {
                    *this.received = this
                        .received
                        .saturating_add(u64::try_from(data.len()).unwrap_or(u64::MAX));
                    if let Some(max) = this.limits.max_size()
                        && *this.received > max
                    {
                        return Poll::Ready(Some(Err(BodyLimitError::TooLarge(max).into())));
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(error))) => Poll::Ready(Some(Err(error.into()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => {
                let Some(timeout) = this.limits.read_timeout() else {
                    *this.idle = None;
                    return Poll::Pending;
                };
                let idle = this
                    .idle
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                match idle.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        Poll::Ready(Some(Err(BodyLimitError::ReadTimeout(timeout).into())))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::OutgoingRequest;
    use http::Request;
    use http_body_util::{Full, StreamBody};
    use rstest::rstest;
    use tokio::net::TcpListener;
    use tower::util::ServiceExt;

    struct FailingTransformer;

    impl HttpTransformer for FailingTransformer {
        fn transform_request(
            &self,
            _request: &ClientRequest,
            _outgoing: &mut OutgoingRequest,
            _destination_prefix: &str,
        ) -> Result<(), BoxError> {
            Err("missing routing header".into())
        }
    }

    fn config(destination_prefix: String) -> Config {
        Config::new(
            "127.0.0.1:0".parse().unwrap(),
            destination_prefix,
            ForwardingOptions::default(),
            None,
        )
    }

    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[rstest]
    fn relative_prefix_is_rejected() {
        let result = AppState::try_from_config(&config("/api".into()));
        assert!(matches!(result, Err(ForwarderError::InvalidDestinationPrefix(_))));
    }

    #[tokio::test]
    async fn unreachable_destination_yields_bad_gateway() {
        let address = closed_port().await;
        let state = AppState::try_from_config(&config(format!("http://{address}"))).unwrap();

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = router(state).oneshot(request).await.expect("proxy response");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn forwarder_errors_yield_internal_server_error() {
        let address = closed_port().await;
        let state = AppState::try_from_config(&config(format!("http://{address}")))
            .unwrap()
            .with_transformer(Arc::new(FailingTransformer));

        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = router(state).oneshot(request).await.expect("proxy response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn oversized_bodies_fail() {
        let limits = Arc::new(RequestBodyLimits::new(Some(4), None));
        let body = LimitedBody::new(Full::new(Bytes::from_static(b"0123456789")), limits);
        let error = body.collect().await.unwrap_err();
        assert!(error.is::<BodyLimitError>());
        assert_eq!(error.to_string(), "request body exceeds 4 bytes");
    }

    #[tokio::test]
    async fn zero_size_limit_rejects_any_data() {
        let limits = Arc::new(RequestBodyLimits::new(Some(0), None));
        let body = LimitedBody::new(Full::new(Bytes::from_static(b"x")), limits);
        let error = body.collect().await.unwrap_err();
        assert_eq!(error.to_string(), "request body exceeds 0 bytes");
    }

    #[tokio::test]
    async fn disabled_limits_pass_everything() {
        let limits = Arc::new(RequestBodyLimits::new(Some(4), None));
        limits.disable();
        let body = LimitedBody::new(Full::new(Bytes::from_static(b"0123456789")), limits);
        assert_eq!(body.collect().await.unwrap().to_bytes(), "0123456789");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_bodies_time_out() {
        let limits = Arc::new(RequestBodyLimits::new(None, Some(Duration::from_secs(3))));
        let silent = StreamBody::new(futures_util::stream::pending::<io::Result<Frame<Bytes>>>());
        let body = LimitedBody::new(silent, limits);
        let error = body.collect().await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<BodyLimitError>(),
            Some(BodyLimitError::ReadTimeout(timeout)) if *timeout == Duration::from_secs(3)
        ));
    }
}
