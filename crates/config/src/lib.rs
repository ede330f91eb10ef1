//! Configuration loading, resolution and per-request forwarding options for ferry.

mod config;
mod constants;
mod errors;
mod file;
mod options;
mod overrides;
mod resolver;

pub use config::Config;
pub use constants::{
    DEFAULT_BIND_ADDRESS, DEFAULT_CONFIG_PATH, DEFAULT_COPY_BUFFER_SIZE,
    DEFAULT_DESTINATION_PREFIX, DEFAULT_REQUEST_TIMEOUT, DEFAULT_STREAMING_CONTENT_TYPES,
    GRPC_CONTENT_TYPE, default_streaming_content_types,
};
pub use errors::ConfigError;
pub use file::{FileConfig, load_file};
pub use options::{ForwardingOptions, StreamingPolicy, VersionPolicy, parse_version};
pub use overrides::Overrides;
pub use resolver::resolve_config;
