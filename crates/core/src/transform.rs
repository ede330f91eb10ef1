use crate::context::{ClientRequest, ClientResponse};
use crate::errors::{BoxError, ForwarderError};
use ferry_config::VersionPolicy;
use http::header::{self, HeaderName};
use http::response;
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri, Version};

/// Request headers never copied to the destination.
pub static REQUEST_SKIPPED_HEADERS: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
    HeaderName::from_static("http2-settings"),
];

/// Response headers and trailers never copied to the client.
pub static RESPONSE_SKIPPED_HEADERS: [HeaderName; 6] = [
    header::TRANSFER_ENCODING,
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::TRAILER,
    header::UPGRADE,
];

/// The request being prepared for the destination.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    /// Method sent to the destination.
    pub method: Method,
    /// Preferred protocol version.
    pub version: Version,
    /// How strictly [`Self::version`] applies.
    pub version_policy: VersionPolicy,
    /// Headers sent to the destination.
    pub headers: HeaderMap,
    /// Absolute destination URI. Synthesized from the destination prefix when left unset.
    pub uri: Option<Uri>,
}

impl OutgoingRequest {
    /// Create an empty request for `method`.
    pub fn new(method: Method, version: Version, version_policy: VersionPolicy) -> Self {
        Self {
            method,
            version,
            version_policy,
            headers: HeaderMap::new(),
            uri: None,
        }
    }

    /// Build the final request around `body`.
    ///
    /// Without an explicit [`Self::uri`] the target is `destination_prefix` joined with the
    /// path and query of `incoming`. The version policy travels as a request extension for
    /// the destination invoker.
    pub fn into_request<B>(
        self,
        destination_prefix: &str,
        incoming: &Uri,
        body: B,
    ) -> Result<Request<B>, ForwarderError> {
        let uri = match self.uri {
            Some(uri) => uri,
            None => make_destination_uri(destination_prefix, incoming)?,
        };
        let mut request = Request::builder()
            .method(self.method)
            .version(self.version)
            .uri(uri)
            .body(body)?;
        *request.headers_mut() = self.headers;
        request.extensions_mut().insert(self.version_policy);
        Ok(request)
    }
}

/// Join `prefix` with the path and query of `incoming`.
pub fn make_destination_uri(prefix: &str, incoming: &Uri) -> Result<Uri, ForwarderError> {
    let prefix = prefix.trim_end_matches('/');
    let path = incoming.path();
    let mut uri = String::with_capacity(prefix.len() + path.len() + 1);
    uri.push_str(prefix);
    if !path.starts_with('/') {
        uri.push('/');
    }
    uri.push_str(path);
    if let Some(query) = incoming.query() {
        uri.push('?');
        uri.push_str(query);
    }
    Ok(uri.parse()?)
}

/// Whether a request header must be dropped on the way to the destination.
pub fn is_request_header_skipped(name: &HeaderName, value: &HeaderValue) -> bool {
    if name.as_str().starts_with(':') {
        return true;
    }
    if name == header::TE {
        return !value.as_bytes().eq_ignore_ascii_case(b"trailers");
    }
    REQUEST_SKIPPED_HEADERS.contains(name)
}

/// Whether a response header or trailer must be dropped on the way to the client.
pub fn is_response_header_skipped(name: &HeaderName, status: Option<StatusCode>) -> bool {
    if status == Some(StatusCode::SWITCHING_PROTOCOLS)
        && (name == header::CONNECTION || name == header::UPGRADE)
    {
        return false;
    }
    RESPONSE_SKIPPED_HEADERS.contains(name)
}

/// Copy the client request headers onto the outgoing request.
pub fn copy_request_headers(source: &HeaderMap, destination: &mut HeaderMap) {
    for (name, value) in source {
        if !is_request_header_skipped(name, value) {
            destination.append(name.clone(), value.clone());
        }
    }
    // Framing is renegotiated by the outgoing connection.
    if source.contains_key(header::TRANSFER_ENCODING) {
        destination.remove(header::CONTENT_LENGTH);
    }
}

/// Copy destination response headers onto the client response.
pub fn copy_response_headers(source: &HeaderMap, status: StatusCode, destination: &mut HeaderMap) {
    for (name, value) in source {
        if !is_response_header_skipped(name, Some(status)) {
            destination.append(name.clone(), value.clone());
        }
    }
}

/// Customization points invoked while a request is forwarded.
///
/// Every hook has a default that copies headers according to the skip tables above.
pub trait HttpTransformer: Send + Sync {
    /// Prepare `outgoing` before it is sent. Runs before anything reaches the destination.
    fn transform_request(
        &self,
        request: &ClientRequest,
        outgoing: &mut OutgoingRequest,
        _destination_prefix: &str,
    ) -> Result<(), BoxError> {
        copy_request_headers(request.headers(), &mut outgoing.headers);
        Ok(())
    }

    /// Copy the destination status and headers onto the client response.
    fn transform_response(
        &self,
        destination: &response::Parts,
        response: &mut ClientResponse,
    ) -> Result<(), BoxError> {
        response.set_status(destination.status);
        copy_response_headers(&destination.headers, destination.status, response.headers_mut());
        Ok(())
    }

    /// Copy destination trailers onto the client response.
    fn transform_response_trailers(
        &self,
        trailers: &HeaderMap,
        response: &mut ClientResponse,
    ) -> Result<(), BoxError> {
        let destination = response.trailers_mut();
        for (name, value) in trailers {
            if !is_response_header_skipped(name, None) {
                destination.append(name.clone(), value.clone());
            }
        }
        Ok(())
    }
}

/// Transformer applying only the default header policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTransformer;

impl HttpTransformer for DefaultTransformer {}
