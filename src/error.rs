//! Error taxonomy for peer forwarding
//!
//! - [`BufferError`]: local resource exhaustion, surfaced to the immediate caller
//! - [`ConfigurationError`]: fatal at startup / pipeline build time, never retried
//! - [`ForwardingFailure`]: remote failures, always absorbed by local fallback
//! - [`ServerError`]: forwarding endpoint failed to start

use std::path::PathBuf;
use std::time::Duration;

/// Failure to write into a buffer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// Capacity was not available within the deadline, or the breaker is open
    #[error("buffer capacity unavailable within {timeout:?}")]
    Timeout { timeout: Duration },
    /// A single write larger than the whole buffer
    #[error("write of {requested} records exceeds buffer capacity {capacity}")]
    SizeOverflow { requested: usize, capacity: usize },
}

impl BufferError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BufferError::Timeout { .. })
    }
}

/// Invalid or inconsistent settings. The pipeline refuses to start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("`{key}` is required when {condition}")]
    MissingParameter {
        key: &'static str,
        condition: &'static str,
    },

    #[error("failed to read configuration file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("processor `{plugin_id}` does not declare a peer forwarding capability")]
    UnsupportedProcessor { plugin_id: String },

    #[error("processor `{plugin_id}` declares empty identification keys")]
    EmptyIdentificationKeys { plugin_id: String },

    #[error(
        "processors of `{plugin_id}` declare different identification keys: {expected:?} vs {found:?}"
    )]
    MismatchedIdentificationKeys {
        plugin_id: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("discovery mode `{mode}` needs an externally supplied peer list provider")]
    UnsupportedDiscoveryMode { mode: &'static str },

    #[error("peer forwarder already registered for pipeline `{pipeline}` plugin `{plugin_id}`")]
    DuplicateRegistration { pipeline: String, plugin_id: String },

    #[error("failed to build peer client for {address}: {reason}")]
    PeerClient { address: String, reason: String },
}

/// Failure to hand a batch to a peer. Never surfaced to the pipeline; the
/// records are processed locally instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForwardingFailure {
    #[error("peer responded with status {0}")]
    Status(u16),
    #[error("request to peer timed out")]
    Timeout,
    #[error("connection to peer failed: {0}")]
    Connection(String),
    #[error("failed to encode batch: {0}")]
    Encoding(String),
    #[error("peer client unavailable: {0}")]
    Client(String),
    #[error("forwarding worker failed: {0}")]
    Worker(String),
}

/// Certificate and key loading errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read certificate from {path:?}: {source}")]
    CertificateRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read private key from {path:?}: {source}")]
    PrivateKeyRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no certificates found in {path:?}")]
    NoCertificates { path: PathBuf },
    #[error("no private key found in {path:?}")]
    NoPrivateKey { path: PathBuf },
    #[error("invalid certificate: {reason}")]
    InvalidCertificate { reason: String },
    #[error("TLS configuration error: {reason}")]
    Config { reason: String },
}

/// Forwarding endpoint failed to start
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind forwarding server on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Config(#[from] ConfigurationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_error_messages() {
        let overflow = BufferError::SizeOverflow {
            requested: 14,
            capacity: 13,
        };
        assert_eq!(
            overflow.to_string(),
            "write of 14 records exceeds buffer capacity 13"
        );
        assert!(!overflow.is_timeout());
        assert!(BufferError::Timeout {
            timeout: Duration::from_millis(100)
        }
        .is_timeout());
    }

    #[test]
    fn test_configuration_error_names_key() {
        let err = ConfigurationError::InvalidValue {
            key: "buffer_size",
            reason: "must be a positive integer".to_string(),
        };
        assert!(err.to_string().contains("buffer_size"));
    }
}
