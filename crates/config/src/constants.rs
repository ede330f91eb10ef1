//! Constants used by the configuration.

use std::time::Duration;

/// Default socket address the proxy binds to.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default destination prefix requests are forwarded to.
pub const DEFAULT_DESTINATION_PREFIX: &str = "http://127.0.0.1:5000";

/// Default on-disk configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = ".ferry.toml";

/// Default time allowed for a destination to start responding.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(100);

/// Default size of the buffer rented for every directional copy.
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 81920;

/// Content type announcing a gRPC payload.
pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// Content types classified as streaming when no explicit list is configured.
pub const DEFAULT_STREAMING_CONTENT_TYPES: &[&str] = &[GRPC_CONTENT_TYPE];

/// Returns an owned copy of [`DEFAULT_STREAMING_CONTENT_TYPES`].
pub fn default_streaming_content_types() -> Vec<String> {
    DEFAULT_STREAMING_CONTENT_TYPES
        .iter()
        .map(|content_type| (*content_type).to_string())
        .collect()
}
