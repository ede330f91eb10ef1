use crate::body_reader::BodyReader;
use crate::classify::{CopyPhase, Severity, classify, report};
use crate::context::{AbortReason, ClientRequest, RequestContext};
use crate::copy::{CopyTags, StreamCopier, StreamCopyResult};
use crate::errors::{
    AggregateError, BoxError, Canceled, ForwarderError, ProxyError, ProxyErrorRecord, SharedError,
};
use crate::invoker::{DestinationInvoker, DestinationResponse};
use crate::pool::{BufferPool, SharedBufferPool};
use crate::request_body::{BodyOutcome, OutgoingBody, RequestBodyForwarder};
use crate::telemetry::{self, CopyDirection, ForwarderStage};
use crate::transform::{HttpTransformer, OutgoingRequest};
use crate::upgrade;
use ferry_config::{DEFAULT_COPY_BUFFER_SIZE, ForwardingOptions, VersionPolicy};
use http::header::{self, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use std::sync::Arc;
use tokio::io::BufWriter;
use tracing::debug;

const MIN_DESTINATION_PREFIX_LEN: usize = "http://a".len();

/// Shared resources of an [`HttpForwarder`].
#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    buffer_size: usize,
    pool: Arc<dyn BufferPool>,
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_COPY_BUFFER_SIZE,
            pool: Arc::new(SharedBufferPool),
        }
    }
}

impl ForwarderSettings {
    /// Replace the size of the buffer rented per copy.
    pub const fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Replace the pool copy buffers are rented from.
    pub fn with_pool(mut self, pool: Arc<dyn BufferPool>) -> Self {
        self.pool = pool;
        self
    }
}

/// Forwards client exchanges to destinations.
#[derive(Debug, Clone, Default)]
pub struct HttpForwarder {
    copier: StreamCopier,
}

impl HttpForwarder {
    /// Create a forwarder.
    pub fn new(settings: ForwarderSettings) -> Self {
        Self {
            copier: StreamCopier::new(settings.pool, settings.buffer_size),
        }
    }

    /// Forward the exchange in `context` to `destination_prefix`.
    ///
    /// Returns `Err` only for invalid arguments, a rejected request or a failing
    /// request or trailer transform. Transport failures, and a failing trailer transform,
    /// are reported through [`RequestContext::proxy_error`].
    ///
    /// Unless the request is streaming (or all responses are configured to complete), the
    /// client response is left open for the host to complete.
    pub async fn forward(
        &self,
        context: &mut RequestContext,
        destination_prefix: &str,
        invoker: &dyn DestinationInvoker,
        options: &ForwardingOptions,
        transformer: &dyn HttpTransformer,
    ) -> Result<(), ForwarderError> {
        validate_destination_prefix(destination_prefix)?;
        if invoker.buffers_responses() {
            return Err(ForwarderError::BufferingInvoker);
        }

        telemetry::forwarder_start(&context.route, destination_prefix);
        let result = self
            .forward_exchange(context, destination_prefix, invoker, options, transformer)
            .await;
        telemetry::forwarder_stop(
            &context.route,
            context.response.status(),
            context.error.as_ref().map(ProxyErrorRecord::error),
        );
        result
    }

    async fn forward_exchange(
        &self,
        context: &mut RequestContext,
        destination_prefix: &str,
        invoker: &dyn DestinationInvoker,
        options: &ForwardingOptions,
        transformer: &dyn HttpTransformer,
    ) -> Result<(), ForwarderError> {
        let content_type = context
            .request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok());
        let is_streaming = options
            .streaming()
            .is_streaming(context.request.version(), content_type);

        let method = context.request.method().clone();
        if method == Method::CONNECT {
            return Err(ForwarderError::UnsupportedMethod(method));
        }
        let upgrade_protocol = upgrade_protocol(&context.request);
        let mut outgoing = if upgrade_protocol.is_some() {
            // Upgrades only exist in HTTP/1.1.
            OutgoingRequest::new(method, Version::HTTP_11, VersionPolicy::RequestVersionExact)
        } else {
            OutgoingRequest::new(method, options.version(), options.version_policy())
        };

        let body_cancel = context.disconnect.child_token();
        // Stops the body copy on every early return.
        let _body_guard = body_cancel.clone().drop_guard();
        let (body_forwarder, body) = match request_has_body(&context.request)
            .then(|| context.request.take_body())
            .flatten()
        {
            Some(source) => {
                if is_streaming {
                    context.request.limits().disable();
                }
                let tags = CopyTags::new(CopyDirection::Request, context.route.clone());
                let (forwarder, body) = RequestBodyForwarder::new(
                    source,
                    is_streaming,
                    body_cancel,
                    self.copier.clone(),
                    tags,
                );
                (Some(forwarder), OutgoingBody::Forwarded(body))
            }
            None => (None, OutgoingBody::Empty),
        };

        transformer
            .transform_request(&context.request, &mut outgoing, destination_prefix)
            .map_err(ForwarderError::RequestTransform)?;
        if let Some(protocol) = upgrade_protocol {
            outgoing
                .headers
                .insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            outgoing.headers.insert(header::UPGRADE, protocol);
        }
        let request = outgoing.into_request(destination_prefix, context.request.uri(), body)?;

        telemetry::forwarder_stage(&context.route, ForwarderStage::SendAsyncStart);
        let send = tokio::time::timeout(options.request_timeout(), invoker.send(request));
        let sent = tokio::select! {
            biased;
            () = context.disconnect.cancelled() => Err(SendFailure::Canceled),
            result = send => match result {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(error)) => Err(SendFailure::Failed(error)),
                Err(elapsed) => Err(SendFailure::TimedOut(elapsed)),
            },
        };
        let destination = match sent {
            Ok(destination) => destination,
            Err(failure) => {
                let (error, source) = match failure {
                    SendFailure::Canceled => {
                        (ProxyError::RequestCanceled, Arc::new(Canceled) as SharedError)
                    }
                    SendFailure::TimedOut(elapsed) => {
                        (ProxyError::RequestTimedOut, Arc::new(elapsed) as SharedError)
                    }
                    SendFailure::Failed(error) => match failed_body(body_forwarder.as_ref()) {
                        Some(body) => body_failure(body, error),
                        None => (ProxyError::Request, SharedError::from(error)),
                    },
                };
                fail_response(context, error, source);
                return Ok(());
            }
        };
        telemetry::forwarder_stage(&context.route, ForwarderStage::SendAsyncStop);

        let DestinationResponse { parts, body, upgrade } = destination;
        if context.request.version() >= Version::HTTP_2 && parts.version < Version::HTTP_2 {
            debug!(
                request_version = ?context.request.version(),
                destination_version = ?parts.version,
                "destination answered with a lower protocol version"
            );
        }

        if let Err(error) = transformer.transform_response(&parts, &mut context.response) {
            drop(body);
            drop(upgrade);
            fail_response(context, ProxyError::ResponseHeaders, SharedError::from(error));
            return Ok(());
        }

        if parts.status == StatusCode::SWITCHING_PROTOCOLS {
            drop(body);
            return upgrade::handle_upgrade(context, upgrade, &self.copier).await;
        }

        telemetry::forwarder_stage(&context.route, ForwarderStage::ResponseContentTransferStart);
        let mut reader = BodyReader::new(body);
        let tags = CopyTags::new(CopyDirection::Response, context.route.clone());
        let outcome = if options.response_buffering_enabled() {
            let capacity = self.copier.buffer_size();
            let mut writer = BufWriter::with_capacity(capacity, context.response.body_writer());
            self.copier
                .copy(&mut reader, &mut writer, &context.disconnect, &tags)
                .await
        } else {
            let mut writer = context.response.body_writer();
            self.copier
                .copy(&mut reader, &mut writer, &context.disconnect, &tags)
                .await
        };
        if outcome.result != StreamCopyResult::Success {
            let copy_error: BoxError = match outcome.error {
                Some(error) => Box::new(error),
                None => Box::new(Canceled),
            };
            let (error, source) = match failed_body(body_forwarder.as_ref()) {
                Some(body) => body_failure(body, copy_error),
                None => (
                    classify(outcome.result, CopyPhase::ResponseBody),
                    SharedError::from(copy_error),
                ),
            };
            fail_response(context, error, source);
            return Ok(());
        }

        if let Some(trailers) = reader.take_trailers()
            && let Err(error) =
                transformer.transform_response_trailers(&trailers, &mut context.response)
        {
            let error = SharedError::from(error);
            report(context, ProxyError::ResponseHeaders, Some(error.clone()), Severity::Primary);
            return Err(ForwarderError::ResponseTrailersTransform(error));
        }
        if let Err(error) = context.response.send_trailers().await {
            fail_response(context, ProxyError::ResponseBodyClient, Arc::new(error));
            return Ok(());
        }

        if options.streaming().should_complete_response(is_streaming) {
            context.response.complete();
        }

        if let Some(forwarder) = body_forwarder.filter(RequestBodyForwarder::started) {
            let outcome = forwarder.outcome().await;
            if !outcome.is_success() {
                let error = classify(outcome.result, CopyPhase::RequestBody);
                report(context, error, outcome.error, Severity::Secondary);
            }
        }
        Ok(())
    }
}

enum SendFailure {
    Canceled,
    TimedOut(tokio::time::error::Elapsed),
    Failed(BoxError),
}

pub(crate) fn validate_destination_prefix(prefix: &str) -> Result<(), ForwarderError> {
    let invalid = || ForwarderError::InvalidDestinationPrefix(prefix.to_owned());
    if prefix.len() < MIN_DESTINATION_PREFIX_LEN {
        return Err(invalid());
    }
    let uri: Uri = prefix.parse().map_err(|_| invalid())?;
    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(invalid());
    }
    Ok(())
}

/// The upgrade protocol requested by an HTTP/1.x client, if it is one we relay.
fn upgrade_protocol(request: &ClientRequest) -> Option<HeaderValue> {
    if request.version() > Version::HTTP_11 {
        return None;
    }
    let value = request.headers().get(header::UPGRADE)?;
    let relayed = value.to_str().ok()?.split(',').map(str::trim).any(|protocol| {
        protocol.eq_ignore_ascii_case("websocket")
            || protocol
                .get(..5)
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case("spdy/"))
    });
    relayed.then(|| value.clone())
}

/// Whether a body follows the request head.
pub(crate) fn request_has_body(request: &ClientRequest) -> bool {
    let method = request.method();
    if method == Method::TRACE {
        return false;
    }
    if let Some(can_have_body) = request.can_have_body() {
        return can_have_body;
    }
    let headers = request.headers();
    if is_chunked(headers) {
        return true;
    }
    if let Some(length) = content_length(headers) {
        return length > 0;
    }
    if request.version() < Version::HTTP_2 {
        return false;
    }
    !matches!(*method, Method::GET | Method::HEAD | Method::DELETE | Method::CONNECT)
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn failed_body(forwarder: Option<&RequestBodyForwarder>) -> Option<BodyOutcome> {
    forwarder?.completed().filter(|outcome| !outcome.is_success())
}

/// Attribute a failure to an earlier request body failure that likely caused it.
fn body_failure(body: BodyOutcome, observed: BoxError) -> (ProxyError, SharedError) {
    let error = classify(body.result, CopyPhase::RequestBody);
    let source = match body.error {
        Some(primary) => Arc::new(AggregateError::new(primary, observed)) as SharedError,
        None => SharedError::from(observed),
    };
    (error, source)
}

fn fail_response(context: &mut RequestContext, error: ProxyError, source: SharedError) {
    report(context, error, Some(source), Severity::Primary);
    if context.response.clear() {
        context.response.set_status(error.status_code());
    } else if error.is_cancellation() {
        context.response.abort(AbortReason::Cancelled);
    } else {
        context.response.abort(AbortReason::InternalError);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{
        ClientResponse, RequestBodyLimits, ResponseBody, UpgradeFuture, UpgradedIo,
    };
    use crate::pool::tests::CountingPool;
    use crate::telemetry::tests::CountingRecorder;
    use crate::transform::DefaultTransformer;
    use bytes::Bytes;
    use futures_util::future::BoxFuture;
    use futures_util::{FutureExt, StreamExt};
    use http::{Request, Response};
    use http_body::{Body, Frame};
    use http_body_util::{BodyExt, Empty, Full, StreamBody};
    use rstest::rstest;
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio_util::sync::CancellationToken;

    type Head = oneshot::Receiver<Response<ResponseBody>>;
    type SendFuture = BoxFuture<'static, Result<DestinationResponse, BoxError>>;

    const PREFIX: &str = "http://backend:8080";

    struct Scripted<F>(F);

    impl<F> DestinationInvoker for Scripted<F>
    where
        F: Fn(Request<OutgoingBody>) -> SendFuture + Send + Sync,
    {
        fn send(&self, request: Request<OutgoingBody>) -> SendFuture {
            (self.0)(request)
        }
    }

    fn scripted<F>(respond: F) -> Scripted<F>
    where
        F: Fn(Request<OutgoingBody>) -> SendFuture + Send + Sync,
    {
        Scripted(respond)
    }

    struct Buffering;

    impl DestinationInvoker for Buffering {
        fn send(&self, _request: Request<OutgoingBody>) -> SendFuture {
            futures_util::future::pending().boxed()
        }

        fn buffers_responses(&self) -> bool {
            true
        }
    }

    struct RejectingTransformer;

    impl HttpTransformer for RejectingTransformer {
        fn transform_response(
            &self,
            destination: &http::response::Parts,
            response: &mut ClientResponse,
        ) -> Result<(), BoxError> {
            response.set_status(destination.status);
            response.headers_mut().insert("x-partial", HeaderValue::from_static("1"));
            Err("response rejected".into())
        }
    }

    fn exchange<B>(request: Request<B>) -> (RequestContext, Head)
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (response, head) = ClientResponse::channel(None);
        let request = ClientRequest::from_request(request);
        let context = RequestContext::new(request, response, CancellationToken::new());
        (context, head)
    }

    fn text_response(text: &'static str) -> DestinationResponse {
        DestinationResponse::new(
            Response::builder()
                .header(header::CONTENT_TYPE, "text/plain")
                .header(header::TRANSFER_ENCODING, "chunked")
                .body(Full::new(Bytes::from_static(text.as_bytes())))
                .unwrap(),
        )
    }

    type Frames = futures_util::stream::Iter<std::vec::IntoIter<io::Result<Frame<Bytes>>>>;

    fn failing_stream(data: &'static [u8], error: &'static str) -> StreamBody<Frames> {
        let mut frames = Vec::new();
        if !data.is_empty() {
            frames.push(Ok(Frame::data(Bytes::from_static(data))));
        }
        frames.push(Err(io::Error::other(error)));
        StreamBody::new(futures_util::stream::iter(frames))
    }

    fn failing_response(data: &'static [u8]) -> DestinationResponse {
        DestinationResponse::new(Response::new(failing_stream(data, "destination reset")))
    }

    fn trailers_response(data: Option<&'static [u8]>) -> DestinationResponse {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        let mut frames = Vec::new();
        if let Some(data) = data {
            frames.push(Ok::<_, io::Error>(Frame::data(Bytes::from_static(data))));
        }
        frames.push(Ok(Frame::trailers(trailers)));
        let body = StreamBody::new(futures_util::stream::iter(frames));
        DestinationResponse::new(Response::new(body))
    }

    async fn reset_reason(mut body: ResponseBody) -> Option<h2::Reason> {
        while let Some(frame) = body.frame().await {
            if let Err(error) = frame {
                return error.downcast_ref::<h2::Error>().and_then(h2::Error::reason);
            }
        }
        None
    }

    fn error_of(context: &RequestContext) -> Option<ProxyError> {
        context.proxy_error().map(ProxyErrorRecord::error)
    }

    async fn forward(
        context: &mut RequestContext,
        invoker: &dyn DestinationInvoker,
        options: &ForwardingOptions,
    ) -> Result<(), ForwarderError> {
        HttpForwarder::default()
            .forward(context, PREFIX, invoker, options, &DefaultTransformer)
            .await
    }

    #[rstest]
    #[case(None)]
    #[case(Some(true))]
    #[tokio::test]
    async fn forwards_head_and_body(#[case] buffering: Option<bool>) {
        let seen = Arc::new(Mutex::new(None));
        let captured = seen.clone();
        let invoker = scripted(move |request| {
            *captured.lock().unwrap() = Some((request.uri().clone(), request.headers().clone()));
            async { Ok(text_response("hello")) }.boxed()
        });
        let (mut context, head) = exchange(
            Request::get("http://proxy/items?id=1")
                .header("x-trace", "abc")
                .header(header::CONNECTION, "keep-alive")
                .body(Empty::<Bytes>::new())
                .unwrap(),
        );
        let options = ForwardingOptions::default().with_response_buffering(buffering);

        forward(&mut context, &invoker, &options).await.unwrap();
        assert!(context.proxy_error().is_none());
        context.response.complete();

        let (uri, headers) = seen.lock().unwrap().take().unwrap();
        assert_eq!(uri, "http://backend:8080/items?id=1");
        assert_eq!(headers["x-trace"], "abc");
        assert!(!headers.contains_key(header::CONNECTION));

        let response = head.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert!(!response.headers().contains_key(header::TRANSFER_ENCODING));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "hello");
    }

    #[tokio::test]
    async fn forwards_request_body() {
        let invoker = scripted(|request| {
            async move {
                let body = request.into_body().collect().await?.to_bytes();
                Ok::<_, BoxError>(DestinationResponse::new(Response::new(Full::new(body))))
            }
            .boxed()
        });
        let (mut context, head) = exchange(
            Request::post("http://proxy/echo")
                .header(header::CONTENT_LENGTH, "5")
                .body(Full::new(Bytes::from_static(b"12345")))
                .unwrap(),
        );

        forward(&mut context, &invoker, &ForwardingOptions::default()).await.unwrap();
        assert!(context.proxy_error().is_none());
        context.response.complete();

        let body = head.await.unwrap().into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "12345");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_destination_times_out() {
        let invoker = scripted(|_| futures_util::future::pending().boxed());
        let (mut context, head) = exchange(Request::new(Empty::<Bytes>::new()));
        let options = ForwardingOptions::default().with_request_timeout(Duration::from_secs(5));

        let started = tokio::time::Instant::now();
        forward(&mut context, &invoker, &options).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(error_of(&context), Some(ProxyError::RequestTimedOut));

        context.response.complete();
        assert_eq!(head.await.unwrap().status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn client_disconnect_cancels_the_send() {
        let invoker = scripted(|_| futures_util::future::pending().boxed());
        let (mut context, head) = exchange(Request::new(Empty::<Bytes>::new()));
        context.disconnect.cancel();

        forward(&mut context, &invoker, &ForwardingOptions::default()).await.unwrap();
        assert_eq!(error_of(&context), Some(ProxyError::RequestCanceled));

        context.response.complete();
        assert_eq!(head.await.unwrap().status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn failed_client_body_is_blamed_on_the_client() {
        let invoker = scripted(|request| {
            async move {
                request.into_body().collect().await?;
                Ok::<_, BoxError>(text_response("unreachable"))
            }
            .boxed()
        });
        let (mut context, head) = exchange(
            Request::post("http://proxy/upload")
                .header(header::TRANSFER_ENCODING, "chunked")
                .body(failing_stream(b"part", "client reset"))
                .unwrap(),
        );

        forward(&mut context, &invoker, &ForwardingOptions::default()).await.unwrap();
        let record = context.proxy_error().unwrap();
        assert_eq!(record.error(), ProxyError::RequestBodyClient);
        assert!(record.source().unwrap().to_string().contains("client reset"));

        context.response.complete();
        assert_eq!(head.await.unwrap().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn failed_header_transform_leaves_a_clean_bad_gateway() {
        let invoker = scripted(|_| async { Ok(text_response("body")) }.boxed());
        let (mut context, head) = exchange(Request::new(Empty::<Bytes>::new()));

        let options = ForwardingOptions::default();
        HttpForwarder::default()
            .forward(&mut context, PREFIX, &invoker, &options, &RejectingTransformer)
            .await
            .unwrap();
        assert_eq!(error_of(&context), Some(ProxyError::ResponseHeaders));

        context.response.complete();
        let response = head.await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(!response.headers().contains_key("x-partial"));
        assert!(response.into_body().collect().await.unwrap().to_bytes().is_empty());
    }

    #[tokio::test]
    async fn destination_body_failure_before_any_byte_is_a_clean_bad_gateway() {
        let invoker = scripted(|_| async { Ok(failing_response(b"")) }.boxed());
        let (mut context, head) = exchange(Request::new(Empty::<Bytes>::new()));

        forward(&mut context, &invoker, &ForwardingOptions::default()).await.unwrap();
        assert_eq!(error_of(&context), Some(ProxyError::ResponseBodyDestination));

        context.response.complete();
        let response = head.await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.into_body().collect().await.unwrap().to_bytes().is_empty());
    }

    #[tokio::test]
    async fn destination_body_failure_after_flushed_bytes_aborts_the_client_body() {
        let invoker = scripted(|_| async { Ok(failing_response(b"abc")) }.boxed());
        let (mut context, head) = exchange(Request::new(Empty::<Bytes>::new()));

        forward(&mut context, &invoker, &ForwardingOptions::default()).await.unwrap();
        assert_eq!(error_of(&context), Some(ProxyError::ResponseBodyDestination));
        assert!(context.response.is_finished());

        let response = head.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            reset_reason(response.into_body()).await,
            Some(h2::Reason::INTERNAL_ERROR)
        );
    }

    #[rstest]
    #[case(Some(b"reply".as_slice()))]
    #[case(None)]
    #[tokio::test]
    async fn gone_client_is_a_client_response_failure(#[case] data: Option<&'static [u8]>) {
        let invoker = scripted(move |_| async move { Ok(trailers_response(data)) }.boxed());
        let (mut context, head) = exchange(Request::new(Empty::<Bytes>::new()));
        drop(head);

        forward(&mut context, &invoker, &ForwardingOptions::default()).await.unwrap();
        assert_eq!(error_of(&context), Some(ProxyError::ResponseBodyClient));
        assert!(context.response.is_finished());
    }

    #[tokio::test]
    async fn failed_trailer_transform_is_reported_and_returned() {
        struct TrailerRejecting;

        impl HttpTransformer for TrailerRejecting {
            fn transform_response_trailers(
                &self,
                _trailers: &HeaderMap,
                _response: &mut ClientResponse,
            ) -> Result<(), BoxError> {
                Err("trailer rejected".into())
            }
        }

        let invoker = scripted(|_| async { Ok(trailers_response(Some(b"reply"))) }.boxed());
        let (mut context, _head) = exchange(Request::new(Empty::<Bytes>::new()));

        let options = ForwardingOptions::default();
        let result = HttpForwarder::default()
            .forward(&mut context, PREFIX, &invoker, &options, &TrailerRejecting)
            .await;

        assert!(matches!(result, Err(ForwarderError::ResponseTrailersTransform(_))));
        let record = context.proxy_error().unwrap();
        assert_eq!(record.error(), ProxyError::ResponseHeaders);
        assert_eq!(record.source().map(ToString::to_string).as_deref(), Some("trailer rejected"));
    }

    #[tokio::test]
    async fn late_client_body_failure_keeps_the_response() {
        let invoker = scripted(|request| {
            async move {
                let mut body = request.into_body();
                let _ = body.frame().await;
                tokio::spawn(async move {
                    let _ = body.collect().await;
                });
                Ok::<_, BoxError>(text_response("done"))
            }
            .boxed()
        });
        let (mut context, head) = exchange(
            Request::post("http://proxy/upload")
                .header(header::TRANSFER_ENCODING, "chunked")
                .body(failing_stream(b"abc", "late reset"))
                .unwrap(),
        );

        let recorder = CountingRecorder::default();
        let _recorder = metrics::set_default_local_recorder(&recorder);

        forward(&mut context, &invoker, &ForwardingOptions::default()).await.unwrap();
        assert_eq!(error_of(&context), Some(ProxyError::RequestBodyClient));
        assert_eq!(recorder.total("ferry_forwarder_errors_total", &[]), 1);
        let secondary = [("error", "request_body_client"), ("severity", "secondary")];
        assert_eq!(recorder.total("ferry_forwarder_errors_total", &secondary), 1);

        context.response.complete();
        let response = head.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.into_body().collect().await.unwrap().to_bytes(), "done");
    }

    #[tokio::test]
    async fn upgrade_requests_use_http11_and_keep_upgrade_headers() {
        let seen = Arc::new(Mutex::new(None));
        let captured = seen.clone();
        let invoker = scripted(move |request| {
            *captured.lock().unwrap() = Some((
                request.version(),
                request.extensions().get::<VersionPolicy>().copied(),
                request.headers().clone(),
            ));
            let (proxy_side, _peer) = tokio::io::duplex(64);
            let upgraded: UpgradeFuture =
                async move { Ok(Box::new(proxy_side) as UpgradedIo) }.boxed();
            let response = Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header(header::CONNECTION, "upgrade")
                .header(header::UPGRADE, "websocket")
                .body(Empty::<Bytes>::new())
                .unwrap();
            async move { Ok(DestinationResponse::new(response).with_upgrade(upgraded)) }.boxed()
        });
        let pool = Arc::new(CountingPool::default());
        let forwarder = HttpForwarder::new(ForwarderSettings::default().with_pool(pool.clone()));
        let (mut context, head) = exchange(
            Request::get("http://proxy/socket")
                .header(header::CONNECTION, "Upgrade")
                .header(header::UPGRADE, "websocket")
                .body(Empty::<Bytes>::new())
                .unwrap(),
        );

        let options = ForwardingOptions::default();
        forwarder
            .forward(&mut context, PREFIX, &invoker, &options, &DefaultTransformer)
            .await
            .unwrap();

        let (version, policy, headers) = seen.lock().unwrap().take().unwrap();
        assert_eq!(version, Version::HTTP_11);
        assert_eq!(policy, Some(VersionPolicy::RequestVersionExact));
        assert_eq!(headers[header::CONNECTION], "upgrade");
        assert_eq!(headers[header::UPGRADE], "websocket");

        // The client connection cannot be upgraded, so nothing is relayed.
        assert_eq!(error_of(&context), Some(ProxyError::UpgradeResponseClient));
        assert_eq!(pool.rents(), 0);
        context.response.complete();
        assert_eq!(head.await.unwrap().status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn grpc_responses_complete_while_the_request_streams() {
        let invoker = scripted(|request| {
            let mut body = request.into_body();
            async move {
                let _ = body.frame().await;
                tokio::spawn(async move {
                    let _ = body.collect().await;
                });
                let mut trailers = HeaderMap::new();
                trailers.insert("grpc-status", HeaderValue::from_static("0"));
                let frames = futures_util::stream::iter(vec![
                    Ok::<_, io::Error>(Frame::data(Bytes::from_static(b"reply"))),
                    Ok(Frame::trailers(trailers)),
                ]);
                let response = Response::builder()
                    .header(header::CONTENT_TYPE, "application/grpc")
                    .body(StreamBody::new(frames))
                    .unwrap();
                Ok::<_, BoxError>(DestinationResponse::new(response))
            }
            .boxed()
        });
        let call = Ok::<_, io::Error>(Frame::data(Bytes::from_static(b"call")));
        let request_frames =
            futures_util::stream::iter(vec![call]).chain(futures_util::stream::pending());
        let request = Request::post("http://proxy/svc/Method")
            .version(Version::HTTP_2)
            .header(header::CONTENT_TYPE, "application/grpc")
            .body(StreamBody::new(request_frames))
            .unwrap();
        let limits = Arc::new(RequestBodyLimits::new(Some(1024), Some(Duration::from_secs(1))));
        let (response, head) = ClientResponse::channel(None);
        let disconnect = CancellationToken::new();
        let mut context = RequestContext::new(
            ClientRequest::from_request(request).with_limits(limits.clone()),
            response,
            disconnect.clone(),
        );

        let forwarding = tokio::spawn(async move {
            forward(&mut context, &invoker, &ForwardingOptions::default()).await.unwrap();
            context
        });

        let collected = head.await.unwrap().into_body().collect().await.unwrap();
        assert_eq!(
            collected.trailers().map(|t| t["grpc-status"].clone()),
            Some(HeaderValue::from_static("0"))
        );
        assert_eq!(collected.to_bytes(), "reply");
        assert_eq!(limits.max_size(), None);
        assert_eq!(limits.read_timeout(), None);

        disconnect.cancel();
        let context = forwarding.await.unwrap();
        assert_ne!(error_of(&context), Some(ProxyError::ResponseBodyCanceled));
    }

    #[rstest]
    #[case(Method::TRACE, Version::HTTP_11, Some(true), Some(("content-length", "5")), false)]
    #[case(Method::POST, Version::HTTP_11, Some(false), Some(("content-length", "5")), false)]
    #[case(Method::GET, Version::HTTP_11, Some(true), None, true)]
    #[case(Method::POST, Version::HTTP_11, None, Some(("transfer-encoding", "gzip,chunked")), true)]
    #[case(Method::POST, Version::HTTP_11, None, Some(("content-length", "0")), false)]
    #[case(Method::POST, Version::HTTP_11, None, Some(("content-length", "12")), true)]
    #[case(Method::POST, Version::HTTP_11, None, None, false)]
    #[case(Method::POST, Version::HTTP_2, None, None, true)]
    #[case(Method::PATCH, Version::HTTP_2, None, None, true)]
    #[case(Method::GET, Version::HTTP_2, None, None, false)]
    #[case(Method::HEAD, Version::HTTP_2, None, None, false)]
    #[case(Method::DELETE, Version::HTTP_2, None, None, false)]
    fn body_detection(
        #[case] method: Method,
        #[case] version: Version,
        #[case] can_have_body: Option<bool>,
        #[case] header: Option<(&str, &str)>,
        #[case] expected: bool,
    ) {
        let mut builder = Request::builder().method(method).version(version);
        if let Some((name, value)) = header {
            builder = builder.header(name, value);
        }
        let request = ClientRequest::from_request(builder.body(Empty::<Bytes>::new()).unwrap())
            .with_can_have_body(can_have_body);
        assert_eq!(request_has_body(&request), expected);
    }

    #[rstest]
    #[case("websocket", Version::HTTP_11, true)]
    #[case("WebSocket", Version::HTTP_10, true)]
    #[case("SPDY/3.1", Version::HTTP_11, true)]
    #[case("h2c", Version::HTTP_11, false)]
    #[case("websocket", Version::HTTP_2, false)]
    fn upgrade_detection(#[case] protocol: &str, #[case] version: Version, #[case] relayed: bool) {
        let request = ClientRequest::from_request(
            Request::get("/")
                .version(version)
                .header(header::UPGRADE, protocol)
                .body(Empty::<Bytes>::new())
                .unwrap(),
        );
        assert_eq!(upgrade_protocol(&request).is_some(), relayed);
    }

    #[rstest]
    #[case("")]
    #[case("http://")]
    #[case("/relative/path")]
    #[case("http://bad host")]
    #[tokio::test]
    async fn invalid_prefixes_are_rejected(#[case] prefix: &str) {
        let (mut context, _head) = exchange(Request::new(Empty::<Bytes>::new()));
        let options = ForwardingOptions::default();
        let result = HttpForwarder::default()
            .forward(&mut context, prefix, &Buffering, &options, &DefaultTransformer)
            .await;
        assert!(matches!(result, Err(ForwarderError::InvalidDestinationPrefix(_))));
    }

    #[tokio::test]
    async fn buffering_invokers_and_connect_are_rejected() {
        let (mut context, _head) = exchange(Request::new(Empty::<Bytes>::new()));
        let result = forward(&mut context, &Buffering, &ForwardingOptions::default()).await;
        assert!(matches!(result, Err(ForwarderError::BufferingInvoker)));

        let invoker = scripted(|_| futures_util::future::pending().boxed());
        let (mut context, _head) = exchange(
            Request::builder()
                .method(Method::CONNECT)
                .uri("backend:443")
                .body(Empty::<Bytes>::new())
                .unwrap(),
        );
        let result = forward(&mut context, &invoker, &ForwardingOptions::default()).await;
        assert!(matches!(
            result,
            Err(ForwarderError::UnsupportedMethod(method)) if method == Method::CONNECT
        ));
    }
}
