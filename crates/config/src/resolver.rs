use crate::{
    Config, ConfigError, DEFAULT_BIND_ADDRESS, DEFAULT_DESTINATION_PREFIX, FileConfig,
    ForwardingOptions, Overrides, StreamingPolicy, VersionPolicy, default_streaming_content_types,
    parse_version,
};
use http::Uri;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Resolve the final configuration by merging file values with CLI overrides.
pub fn resolve_config(
    file: Option<FileConfig>,
    overrides: Overrides,
) -> Result<Config, ConfigError> {
    let file = file.unwrap_or_default();

    let bind_address = if let Some(addr) = overrides.bind_address() {
        addr
    } else if let Some(value) = file.bind_address.as_deref() {
        parse_socket_addr(value)?
    } else {
        parse_socket_addr(DEFAULT_BIND_ADDRESS)?
    };

    let destination_prefix = if let Some(uri) = overrides.destination_prefix() {
        parse_destination_prefix(&uri.to_string())?
    } else if let Some(value) = file.destination_prefix.as_deref() {
        parse_destination_prefix(value)?
    } else {
        parse_destination_prefix(DEFAULT_DESTINATION_PREFIX)?
    };

    let mut options = ForwardingOptions::default();
    if let Some(timeout) = overrides.request_timeout() {
        options = options.with_request_timeout(timeout);
    } else if let Some(secs) = file.request_timeout_secs {
        options = options.with_request_timeout(Duration::from_secs(secs));
    }
    if let Some(value) = file.version.as_deref() {
        let version = parse_version(value).ok_or_else(|| ConfigError::ProtocolVersion {
            value: value.to_string(),
        })?;
        options = options.with_version(version);
    }
    if let Some(value) = file.version_policy.as_deref() {
        let policy = VersionPolicy::parse(value).ok_or_else(|| ConfigError::VersionPolicy {
            value: value.to_string(),
        })?;
        options = options.with_version_policy(policy);
    }
    options = options.with_response_buffering(file.allow_response_buffering);
    options = options.with_streaming(StreamingPolicy::new(
        file.streaming_content_types
            .unwrap_or_else(default_streaming_content_types),
        file.complete_all_responses.unwrap_or(false),
    ));

    let metrics_address = if let Some(addr) = overrides.metrics_address() {
        Some(addr)
    } else if let Some(value) = file.metrics_address.as_deref() {
        Some(parse_metrics_addr(value)?)
    } else {
        None
    };

    Ok(Config::new(
        bind_address,
        destination_prefix,
        options,
        metrics_address,
    )
    .with_request_body_limits(
        file.max_request_body_size.filter(|size| *size > 0),
        file.request_body_read_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs),
    ))
}

fn parse_socket_addr(value: &str) -> Result<SocketAddr, ConfigError> {
    SocketAddr::from_str(value).map_err(|source| ConfigError::BindAddress {
        value: value.to_string(),
        source,
    })
}

fn parse_metrics_addr(value: &str) -> Result<SocketAddr, ConfigError> {
    SocketAddr::from_str(value).map_err(|source| ConfigError::MetricsAddress {
        value: value.to_string(),
        source,
    })
}

fn parse_destination_prefix(value: &str) -> Result<String, ConfigError> {
    let value = value.trim();
    let invalid = |reason: &str| ConfigError::DestinationPrefix {
        value: value.to_string(),
        reason: reason.to_string(),
    };
    let uri = Uri::from_str(value).map_err(|error| invalid(&error.to_string()))?;
    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(invalid("scheme and authority are required"));
    }
    Ok(value.to_string())
}
