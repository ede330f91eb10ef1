use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Representation of the on-disk `.ferry.toml` configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
pub struct FileConfig {
    /// Address the proxy should bind to.
    pub bind_address: Option<String>,
    /// Absolute URI prefix every request is forwarded to.
    pub destination_prefix: Option<String>,
    /// Seconds a destination has to start responding.
    pub request_timeout_secs: Option<u64>,
    /// Preferred outgoing protocol version (`"1.1"` or `"2"`).
    pub version: Option<String>,
    /// Version negotiation policy (`"or-lower"`, `"or-higher"`, `"exact"`).
    pub version_policy: Option<String>,
    /// Allow the response body to be buffered before reaching the client.
    pub allow_response_buffering: Option<bool>,
    /// Content types classified as streaming on HTTP/2.
    pub streaming_content_types: Option<Vec<String>>,
    /// Explicitly complete every response instead of streaming ones only.
    pub complete_all_responses: Option<bool>,
    /// Largest client request body accepted, in bytes. `0` leaves bodies unlimited.
    pub max_request_body_size: Option<u64>,
    /// Seconds to wait for the next chunk of a client request body. `0` waits forever.
    pub request_body_read_timeout_secs: Option<u64>,
    /// Address for the Prometheus metrics listener.
    pub metrics_address: Option<String>,
}

/// Parse and load the configuration file, returning `Ok(None)` when it is missing.
pub fn load_file(path: &Path) -> Result<Option<FileConfig>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: FileConfig =
        toml::from_str(&contents).map_err(|source| ConfigError::TomlParse { source })?;
    Ok(Some(parsed))
}
