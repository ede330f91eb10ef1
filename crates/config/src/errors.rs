use thiserror::Error;

/// Errors that can occur while loading or resolving the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying IO failure.
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        /// Path of the configuration file that could not be read.
        path: std::path::PathBuf,
        /// Underlying IO error produced while reading the file.
        source: std::io::Error,
    },
    /// Failure to parse TOML.
    #[error("unable to parse config file as TOML: {source}")]
    TomlParse {
        #[from]
        /// Error returned by the TOML parser.
        source: toml::de::Error,
    },
    /// Invalid socket address for bind.
    #[error("invalid bind address '{value}': {source}")]
    BindAddress {
        /// The offending bind address supplied by the user.
        value: String,
        /// Error returned while parsing the socket address.
        source: std::net::AddrParseError,
    },
    /// Invalid socket address for the metrics listener.
    #[error("invalid metrics address '{value}': {source}")]
    MetricsAddress {
        /// The offending metrics address supplied by the user.
        value: String,
        /// Error returned while parsing the socket address.
        source: std::net::AddrParseError,
    },
    /// Destination prefix that is not an absolute URI.
    #[error("invalid destination prefix '{value}': {reason}")]
    DestinationPrefix {
        /// The destination prefix provided by the user.
        value: String,
        /// Why the prefix was rejected.
        reason: String,
    },
    /// Unknown outgoing protocol version.
    #[error("unsupported protocol version '{value}', expected \"1.1\" or \"2\"")]
    ProtocolVersion {
        /// The version string provided by the user.
        value: String,
    },
    /// Unknown version negotiation policy.
    #[error("unsupported version policy '{value}', expected or-lower, or-higher or exact")]
    VersionPolicy {
        /// The policy string provided by the user.
        value: String,
    },
}
