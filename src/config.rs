//! Peer forwarder configuration
//!
//! Loaded once at startup from TOML and validated eagerly: any invalid value
//! fails startup with a [`ConfigurationError`] naming the offending key.
//!
//! ```toml
//! port = 4994
//! ssl = true
//! ssl_certificate_file = "config/default_certificate.pem"
//! ssl_key_file = "config/default_private_key.pem"
//! discovery_mode = "static"
//! static_endpoints = ["10.0.0.11", "10.0.0.12"]
//! buffer_size = 512
//! batch_size = 48
//! ```

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u32 = 4994;
pub const DEFAULT_FORWARDING_PATH: &str = "/event/forward";
pub const DEFAULT_CERTIFICATE_FILE_PATH: &str = "config/default_certificate.pem";
pub const DEFAULT_PRIVATE_KEY_FILE_PATH: &str = "config/default_private_key.pem";
pub const MAX_FORWARDING_BATCH_SIZE: usize = 15_000;
pub const DEFAULT_VIRTUAL_NODES: usize = 128;

/// Where the peer list comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Single node; forwarding disabled
    #[default]
    LocalNode,
    /// `static_endpoints`
    Static,
    /// Peer list from DNS records of `domain_name`
    Dns,
    /// Peer list from a cloud service-discovery namespace
    AwsCloudMap,
}

impl DiscoveryMode {
    pub fn name(&self) -> &'static str {
        match self {
            DiscoveryMode::LocalNode => "local_node",
            DiscoveryMode::Static => "static",
            DiscoveryMode::Dns => "dns",
            DiscoveryMode::AwsCloudMap => "aws_cloud_map",
        }
    }
}

/// Authentication between peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ForwardingAuthentication {
    #[default]
    Unauthenticated,
    /// Server requires client certificates; only valid with `ssl = true`
    MutualTls,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerForwarderConfig {
    pub port: u32,
    pub forwarding_path: String,
    pub request_timeout_ms: u64,
    pub client_timeout_ms: u64,
    pub server_thread_count: usize,
    pub max_connection_count: usize,
    pub max_pending_requests: usize,

    pub ssl: bool,
    pub ssl_certificate_file: PathBuf,
    pub ssl_key_file: PathBuf,
    pub ssl_insecure_disable_verification: bool,
    pub ssl_fingerprint_verification_only: bool,
    pub authentication: ForwardingAuthentication,

    pub discovery_mode: DiscoveryMode,
    pub static_endpoints: Vec<String>,
    pub domain_name: Option<String>,
    pub aws_cloud_map_namespace_name: Option<String>,
    pub aws_cloud_map_service_name: Option<String>,
    pub aws_region: Option<String>,
    pub aws_cloud_map_query_parameters: HashMap<String, String>,
    pub virtual_nodes: usize,

    pub client_thread_count: usize,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub buffer_size: usize,
    pub drain_timeout_ms: u64,
    pub forwarding_batch_size: usize,
    pub forwarding_batch_queue_depth: usize,
    pub forwarding_batch_timeout_ms: u64,

    /// Identification key sets for which peer forwarding is turned off
    pub exclude_identification_keys: Vec<Vec<String>>,
}

impl Default for PeerForwarderConfig {
    fn default() -> Self {
        PeerForwarderConfig {
            port: DEFAULT_PORT,
            forwarding_path: DEFAULT_FORWARDING_PATH.to_string(),
            request_timeout_ms: 10_000,
            client_timeout_ms: 60_000,
            server_thread_count: 200,
            max_connection_count: 500,
            max_pending_requests: 1024,
            ssl: true,
            ssl_certificate_file: PathBuf::from(DEFAULT_CERTIFICATE_FILE_PATH),
            ssl_key_file: PathBuf::from(DEFAULT_PRIVATE_KEY_FILE_PATH),
            ssl_insecure_disable_verification: false,
            ssl_fingerprint_verification_only: false,
            authentication: ForwardingAuthentication::Unauthenticated,
            discovery_mode: DiscoveryMode::LocalNode,
            static_endpoints: Vec::new(),
            domain_name: None,
            aws_cloud_map_namespace_name: None,
            aws_cloud_map_service_name: None,
            aws_region: None,
            aws_cloud_map_query_parameters: HashMap::new(),
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            client_thread_count: 200,
            batch_size: 48,
            batch_delay_ms: 3_000,
            buffer_size: 512,
            drain_timeout_ms: 10_000,
            forwarding_batch_size: 1500,
            forwarding_batch_queue_depth: 1,
            forwarding_batch_timeout_ms: 0,
            exclude_identification_keys: Vec::new(),
        }
    }
}

impl PeerForwarderConfig {
    /// Plaintext static-discovery config with short deadlines
    pub fn for_tests() -> Self {
        PeerForwarderConfig {
            ssl: false,
            discovery_mode: DiscoveryMode::Static,
            request_timeout_ms: 200,
            client_timeout_ms: 1_000,
            client_thread_count: 4,
            batch_size: 8,
            batch_delay_ms: 0,
            buffer_size: 64,
            drain_timeout_ms: 500,
            forwarding_batch_size: 16,
            ..Default::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigurationError> {
        let config: PeerForwarderConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.server_port()?;
        if !self.forwarding_path.starts_with('/') {
            return Err(invalid("forwarding_path", "must start with '/'"));
        }
        if self.request_timeout_ms <= 1 {
            return Err(invalid(
                "request_timeout_ms",
                "must be a positive integer greater than 1",
            ));
        }
        positive("client_timeout_ms", self.client_timeout_ms as usize)?;
        positive("server_thread_count", self.server_thread_count)?;
        positive("max_connection_count", self.max_connection_count)?;
        positive("max_pending_requests", self.max_pending_requests)?;
        positive("client_thread_count", self.client_thread_count)?;
        positive("batch_size", self.batch_size)?;
        positive("buffer_size", self.buffer_size)?;
        positive("forwarding_batch_queue_depth", self.forwarding_batch_queue_depth)?;
        positive("virtual_nodes", self.virtual_nodes)?;

        if self.forwarding_batch_size == 0 || self.forwarding_batch_size > MAX_FORWARDING_BATCH_SIZE {
            return Err(invalid(
                "forwarding_batch_size",
                format!("must be between 1 and {} inclusive", MAX_FORWARDING_BATCH_SIZE),
            ));
        }

        if self.authentication == ForwardingAuthentication::MutualTls && !self.ssl {
            return Err(invalid(
                "authentication",
                "mutual TLS is only available when ssl is enabled",
            ));
        }
        if self.ssl {
            if self.ssl_certificate_file.as_os_str().is_empty() {
                return Err(missing("ssl_certificate_file", "ssl is enabled"));
            }
            if self.ssl_key_file.as_os_str().is_empty() {
                return Err(missing("ssl_key_file", "ssl is enabled"));
            }
        }

        match self.discovery_mode {
            DiscoveryMode::LocalNode | DiscoveryMode::Static => {}
            DiscoveryMode::Dns => {
                if is_blank(&self.domain_name) {
                    return Err(missing("domain_name", "discovery_mode is dns"));
                }
            }
            DiscoveryMode::AwsCloudMap => {
                const CONDITION: &str = "discovery_mode is aws_cloud_map";
                if is_blank(&self.aws_cloud_map_namespace_name) {
                    return Err(missing("aws_cloud_map_namespace_name", CONDITION));
                }
                if is_blank(&self.aws_cloud_map_service_name) {
                    return Err(missing("aws_cloud_map_service_name", CONDITION));
                }
                if is_blank(&self.aws_region) {
                    return Err(missing("aws_region", CONDITION));
                }
            }
        }

        for keys in &self.exclude_identification_keys {
            if keys.is_empty() {
                return Err(invalid(
                    "exclude_identification_keys",
                    "entries must not be empty",
                ));
            }
        }

        Ok(())
    }

    pub fn server_port(&self) -> Result<u16, ConfigurationError> {
        u16::try_from(self.port).map_err(|_| invalid("port", "must be between 0 and 65535"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn forwarding_batch_timeout(&self) -> Duration {
        Duration::from_millis(self.forwarding_batch_timeout_ms)
    }

    pub fn uses_mutual_tls(&self) -> bool {
        self.authentication == ForwardingAuthentication::MutualTls
    }

    /// Whether `identification_keys` matches one of the excluded key sets
    /// (order-insensitive)
    pub fn is_excluded(&self, identification_keys: &[String]) -> bool {
        let keys: BTreeSet<&str> = identification_keys.iter().map(String::as_str).collect();
        self.exclude_identification_keys.iter().any(|excluded| {
            let excluded: BTreeSet<&str> = excluded.iter().map(String::as_str).collect();
            excluded == keys
        })
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        key,
        reason: reason.into(),
    }
}

fn missing(key: &'static str, condition: &'static str) -> ConfigurationError {
    ConfigurationError::MissingParameter { key, condition }
}

fn positive(key: &'static str, value: usize) -> Result<(), ConfigurationError> {
    if value == 0 {
        Err(invalid(key, "must be a positive integer"))
    } else {
        Ok(())
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}
