use crate::ForwardingOptions;
use std::net::SocketAddr;
use std::time::Duration;

/// Fully resolved proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    bind_address: SocketAddr,
    destination_prefix: String,
    options: ForwardingOptions,
    metrics_address: Option<SocketAddr>,
    max_request_body_size: Option<u64>,
    request_body_read_timeout: Option<Duration>,
}

impl Config {
    /// Construct a new [`Config`].
    pub const fn new(
        bind_address: SocketAddr,
        destination_prefix: String,
        options: ForwardingOptions,
        metrics_address: Option<SocketAddr>,
    ) -> Self {
        Self {
            bind_address,
            destination_prefix,
            options,
            metrics_address,
            max_request_body_size: None,
            request_body_read_timeout: None,
        }
    }

    /// Limit client request bodies. Streaming requests are exempt.
    pub const fn with_request_body_limits(
        mut self,
        max_size: Option<u64>,
        read_timeout: Option<Duration>,
    ) -> Self {
        self.max_request_body_size = max_size;
        self.request_body_read_timeout = read_timeout;
        self
    }

    /// Address the proxy server will bind to.
    pub const fn bind_address(&self) -> SocketAddr {
        self.bind_address
    }

    /// Absolute URI prefix requests are forwarded to.
    pub fn destination_prefix(&self) -> &str {
        &self.destination_prefix
    }

    /// Options applied to every forwarded request.
    pub const fn options(&self) -> &ForwardingOptions {
        &self.options
    }

    /// Address of the Prometheus metrics listener, if enabled.
    pub const fn metrics_address(&self) -> Option<SocketAddr> {
        self.metrics_address
    }

    /// Largest client request body accepted, if limited.
    pub const fn max_request_body_size(&self) -> Option<u64> {
        self.max_request_body_size
    }

    /// Longest wait for the next chunk of a client request body, if limited.
    pub const fn request_body_read_timeout(&self) -> Option<Duration> {
        self.request_body_read_timeout
    }
}
