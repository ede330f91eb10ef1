use crate::{DEFAULT_REQUEST_TIMEOUT, default_streaming_content_types};
use http::Version;
use std::time::Duration;

/// How the requested outgoing protocol version may be negotiated with a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionPolicy {
    /// Use the requested version, or fall back to a lower one.
    #[default]
    RequestVersionOrLower,
    /// Use the requested version, or negotiate a higher one.
    RequestVersionOrHigher,
    /// Only the requested version is acceptable.
    RequestVersionExact,
}

impl VersionPolicy {
    /// Parse the textual form used in configuration files (`or-lower`, `or-higher`, `exact`).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "or-lower" => Some(Self::RequestVersionOrLower),
            "or-higher" => Some(Self::RequestVersionOrHigher),
            "exact" => Some(Self::RequestVersionExact),
            _ => None,
        }
    }
}

/// Parse the textual protocol version used in configuration files.
pub fn parse_version(value: &str) -> Option<Version> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1.1" | "http/1.1" => Some(Version::HTTP_11),
        "2" | "2.0" | "http/2" => Some(Version::HTTP_2),
        _ => None,
    }
}

/// Decides which requests need unbuffered, low-latency body transfer.
///
/// A request is streaming when it arrived over HTTP/2 or newer and its content type starts
/// with one of [`Self::content_types`], followed by nothing, `+` or `;`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingPolicy {
    content_types: Vec<String>,
    complete_all_responses: bool,
}

impl Default for StreamingPolicy {
    fn default() -> Self {
        Self {
            content_types: default_streaming_content_types(),
            complete_all_responses: false,
        }
    }
}

impl StreamingPolicy {
    /// Create a policy matching the given content types.
    pub fn new(content_types: Vec<String>, complete_all_responses: bool) -> Self {
        let content_types = content_types
            .into_iter()
            .map(|content_type| content_type.trim().to_ascii_lowercase())
            .filter(|content_type| !content_type.is_empty())
            .collect();
        Self {
            content_types,
            complete_all_responses,
        }
    }

    /// Content type prefixes classified as streaming (lowercase).
    pub fn content_types(&self) -> &[String] {
        &self.content_types
    }

    /// Whether every forwarded response is explicitly completed, not only streaming ones.
    pub const fn complete_all_responses(&self) -> bool {
        self.complete_all_responses
    }

    /// Returns `true` if `content_type` matches one of the configured prefixes.
    pub fn matches_content_type(&self, content_type: &str) -> bool {
        let content_type = content_type.trim();
        self.content_types.iter().any(|prefix| {
            content_type.len() >= prefix.len()
                && content_type.is_char_boundary(prefix.len())
                && content_type[..prefix.len()].eq_ignore_ascii_case(prefix)
                && matches!(
                    content_type.as_bytes().get(prefix.len()),
                    None | Some(b'+') | Some(b';')
                )
        })
    }

    /// Classify a request by its protocol version and content type.
    pub fn is_streaming(&self, version: Version, content_type: Option<&str>) -> bool {
        version >= Version::HTTP_2 && content_type.is_some_and(|ct| self.matches_content_type(ct))
    }

    /// Whether the response of a request should be explicitly completed once forwarded.
    pub const fn should_complete_response(&self, is_streaming: bool) -> bool {
        is_streaming || self.complete_all_responses
    }
}

/// Immutable options applied to a single forwarded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingOptions {
    request_timeout: Duration,
    version: Version,
    version_policy: VersionPolicy,
    allow_response_buffering: Option<bool>,
    streaming: StreamingPolicy,
}

impl Default for ForwardingOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            version: Version::HTTP_2,
            version_policy: VersionPolicy::default(),
            allow_response_buffering: None,
            streaming: StreamingPolicy::default(),
        }
    }
}

impl ForwardingOptions {
    /// Replace the time a destination has to start responding.
    pub const fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Replace the preferred outgoing protocol version.
    pub const fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Replace the version negotiation policy.
    pub const fn with_version_policy(mut self, version_policy: VersionPolicy) -> Self {
        self.version_policy = version_policy;
        self
    }

    /// Allow or forbid the host to buffer the response body.
    pub const fn with_response_buffering(mut self, allow: Option<bool>) -> Self {
        self.allow_response_buffering = allow;
        self
    }

    /// Replace the streaming classification policy.
    pub fn with_streaming(mut self, streaming: StreamingPolicy) -> Self {
        self.streaming = streaming;
        self
    }

    /// Time a destination has to start responding.
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Preferred outgoing protocol version.
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Version negotiation policy.
    pub const fn version_policy(&self) -> VersionPolicy {
        self.version_policy
    }

    /// Explicit response buffering choice, `None` when left to the default (disabled).
    pub const fn allow_response_buffering(&self) -> Option<bool> {
        self.allow_response_buffering
    }

    /// Whether the response body may be coalesced before it reaches the client.
    pub fn response_buffering_enabled(&self) -> bool {
        self.allow_response_buffering.unwrap_or(false)
    }

    /// Streaming classification policy.
    pub const fn streaming(&self) -> &StreamingPolicy {
        &self.streaming
    }
}
