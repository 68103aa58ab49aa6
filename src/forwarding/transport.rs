//! Sending an encoded batch to one peer

use super::address::PeerAddress;
use super::client_pool::PeerClientPool;
use super::codec::ForwardingEnvelope;
use crate::config::PeerForwarderConfig;
use crate::error::{ConfigurationError, ForwardingFailure};
use async_trait::async_trait;
use reqwest::StatusCode;

/// Delivers envelopes to peers. `Ok` means the peer accepted the batch and
/// now owns the records.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(&self, address: &str, envelope: &ForwardingEnvelope) -> Result<(), ForwardingFailure>;
}

/// `POST {scheme}://{peer}:{port}{forwarding_path}` with a JSON body
pub struct HttpPeerTransport {
    pool: PeerClientPool,
    port: u16,
    path: String,
}

impl HttpPeerTransport {
    pub fn new(pool: PeerClientPool, port: u16, path: impl Into<String>) -> Self {
        HttpPeerTransport {
            pool,
            port,
            path: path.into(),
        }
    }

    pub fn from_config(config: &PeerForwarderConfig) -> Result<Self, ConfigurationError> {
        Ok(HttpPeerTransport::new(
            PeerClientPool::from_config(config)?,
            config.server_port()?,
            config.forwarding_path.clone(),
        ))
    }

    pub fn pool(&self) -> &PeerClientPool {
        &self.pool
    }

    pub fn url(&self, address: &str) -> String {
        PeerAddress::parse(address, self.port).url(self.pool.scheme(), &self.path)
    }
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn send(&self, address: &str, envelope: &ForwardingEnvelope) -> Result<(), ForwardingFailure> {
        let client = self
            .pool
            .client(address)
            .map_err(|e| ForwardingFailure::Client(e.to_string()))?;
        let body = envelope.to_bytes()?;

        let response = client
            .post(self.url(address))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ForwardingFailure::Timeout
                } else {
                    ForwardingFailure::Connection(e.to_string())
                }
            })?;

        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(ForwardingFailure::Status(status.as_u16())),
        }
    }
}
