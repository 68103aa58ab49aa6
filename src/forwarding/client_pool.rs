//! One outbound HTTP client per peer address, built on first use

use crate::config::PeerForwarderConfig;
use crate::error::ConfigurationError;
use crate::security::PeerTlsConfig;
use parking_lot::Mutex;
use reqwest::{Certificate, Client, Identity};
use std::collections::HashMap;
use std::time::Duration;

/// TLS material shared by every peer client
#[derive(Clone)]
struct ClientTls {
    trusted: Certificate,
    identity: Option<Identity>,
    skip_hostname_verification: bool,
    skip_verification: bool,
}

pub struct PeerClientPool {
    clients: Mutex<HashMap<String, Client>>,
    timeout: Duration,
    tls: Option<ClientTls>,
}

impl PeerClientPool {
    /// Plaintext pool
    pub fn new(timeout: Duration) -> Self {
        PeerClientPool {
            clients: Mutex::new(HashMap::new()),
            timeout,
            tls: None,
        }
    }

    /// Certificates are read here, so a bad certificate fails startup rather
    /// than the first forward.
    pub fn from_config(config: &PeerForwarderConfig) -> Result<Self, ConfigurationError> {
        let mut pool = PeerClientPool::new(config.client_timeout());
        if let Some(tls) = PeerTlsConfig::from_config(config) {
            let trusted = Certificate::from_pem(&tls.certificate_pem()?).map_err(|e| {
                ConfigurationError::InvalidValue {
                    key: "ssl_certificate_file",
                    reason: e.to_string(),
                }
            })?;
            let identity = if config.uses_mutual_tls() {
                Some(Identity::from_pem(&tls.identity_pem()?).map_err(|e| {
                    ConfigurationError::InvalidValue {
                        key: "ssl_key_file",
                        reason: e.to_string(),
                    }
                })?)
            } else {
                None
            };
            pool.tls = Some(ClientTls {
                trusted,
                identity,
                skip_hostname_verification: config.ssl_fingerprint_verification_only,
                skip_verification: config.ssl_insecure_disable_verification,
            });
        }
        Ok(pool)
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "https"
        } else {
            "http"
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Cached client for `address`, building it if absent
    pub fn client(&self, address: &str) -> Result<Client, ConfigurationError> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(address) {
            return Ok(client.clone());
        }
        let client = self.build_client().map_err(|e| ConfigurationError::PeerClient {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
        clients.insert(address.to_string(), client.clone());
        Ok(client)
    }

    /// Number of cached clients
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn build_client(&self) -> reqwest::Result<Client> {
        let mut builder = Client::builder().timeout(self.timeout).use_rustls_tls();
        if let Some(tls) = &self.tls {
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(tls.trusted.clone())
                .danger_accept_invalid_hostnames(tls.skip_hostname_verification)
                .danger_accept_invalid_certs(tls.skip_verification);
            if let Some(identity) = &tls.identity {
                builder = builder.identity(identity.clone());
            }
        }
        builder.build()
    }
}
