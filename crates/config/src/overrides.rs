use http::Uri;
use std::net::SocketAddr;
use std::time::Duration;

/// Overrides provided via the CLI.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    bind_address: Option<SocketAddr>,
    destination_prefix: Option<Uri>,
    request_timeout: Option<Duration>,
    metrics_address: Option<SocketAddr>,
}

impl Overrides {
    /// Create a new overrides instance.
    pub const fn new(
        bind_address: Option<SocketAddr>,
        destination_prefix: Option<Uri>,
        request_timeout: Option<Duration>,
        metrics_address: Option<SocketAddr>,
    ) -> Self {
        Self {
            bind_address,
            destination_prefix,
            request_timeout,
            metrics_address,
        }
    }

    /// Returns `true` if no overriding values were provided.
    pub const fn is_empty(&self) -> bool {
        self.bind_address.is_none()
            && self.destination_prefix.is_none()
            && self.request_timeout.is_none()
            && self.metrics_address.is_none()
    }

    /// Accessor for the bind address override.
    pub const fn bind_address(&self) -> Option<SocketAddr> {
        self.bind_address
    }

    /// Accessor for the destination prefix override.
    pub const fn destination_prefix(&self) -> Option<&Uri> {
        self.destination_prefix.as_ref()
    }

    /// Accessor for the request timeout override.
    pub const fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Accessor for the metrics address override.
    pub const fn metrics_address(&self) -> Option<SocketAddr> {
        self.metrics_address
    }
}
