//! Forwarding endpoint: receives batches from peers into receive buffers
//!
//! `POST {forwarding_path}` with a JSON [`ForwardingEnvelope`]:
//!
//! | status | meaning |
//! |---|---|
//! | 200 | every record was written to the destination buffer |
//! | 400 | body is not a valid envelope |
//! | 404 | no receive buffer for (pipeline, plugin) |
//! | 408 | buffer had no capacity within `request_timeout_ms` |
//! | 413 | batch larger than the whole buffer |
//!
//! Anything but 200 makes the sending peer process the batch itself.

use super::codec::ForwardingEnvelope;
use super::provider::PeerForwarderProvider;
use crate::config::PeerForwarderConfig;
use crate::error::{BufferError, ServerError};
use crate::security::{ForwardingStream, PeerTlsConfig, TlsAcceptor};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower::limit::ConcurrencyLimitLayer;
use tracing::{debug, info, warn};

/// Upper bound on one forwarded batch body
pub const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024 * 1024;

struct EndpointState {
    provider: Arc<PeerForwarderProvider>,
    request_timeout: Duration,
}

async fn receive_batch(State(state): State<Arc<EndpointState>>, body: Bytes) -> StatusCode {
    let envelope = match ForwardingEnvelope::from_bytes(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "rejecting malformed forwarding request");
            return StatusCode::BAD_REQUEST;
        }
    };
    let pipeline = envelope.destination_pipeline_name.clone();
    let plugin_id = envelope.destination_plugin_id.clone();

    let Some(buffer) = state.provider.buffer(&pipeline, &plugin_id) else {
        warn!(%pipeline, %plugin_id, "no receive buffer for forwarded records");
        return StatusCode::NOT_FOUND;
    };
    let events = match envelope.into_events() {
        Ok(events) => events,
        Err(e) => {
            warn!(%pipeline, %plugin_id, error = %e, "rejecting undecodable forwarded events");
            return StatusCode::BAD_REQUEST;
        }
    };

    let records = events.len();
    match buffer.write_all(events, state.request_timeout).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!(%pipeline, %plugin_id, records, error = %e, "receive buffer rejected forwarded records");
            match e {
                BufferError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
                BufferError::SizeOverflow { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            }
        }
    }
}

/// Router serving the forwarding path, limited to `max_pending_requests`
/// concurrent requests
pub fn router(config: &PeerForwarderConfig, provider: Arc<PeerForwarderProvider>) -> Router {
    let state = Arc::new(EndpointState {
        provider,
        request_timeout: config.request_timeout(),
    });
    Router::new()
        .route(&config.forwarding_path, post(receive_batch))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(ConcurrencyLimitLayer::new(config.max_pending_requests))
        .with_state(state)
}

pub struct ForwardingServer {
    listener: TcpListener,
    router: Router,
    acceptor: Option<TlsAcceptor>,
    require_client_cert: bool,
    connections: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl ForwardingServer {
    /// Bind on all interfaces at the configured port
    pub async fn bind(
        config: &PeerForwarderConfig,
        provider: Arc<PeerForwarderProvider>,
    ) -> Result<Self, ServerError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.server_port()?));
        Self::bind_addr(addr, config, provider).await
    }

    pub async fn bind_addr(
        addr: SocketAddr,
        config: &PeerForwarderConfig,
        provider: Arc<PeerForwarderProvider>,
    ) -> Result<Self, ServerError> {
        let tls = PeerTlsConfig::from_config(config);
        let acceptor = tls.as_ref().map(PeerTlsConfig::build_acceptor).transpose()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(ForwardingServer {
            listener,
            router: router(config, provider),
            acceptor,
            require_client_cert: tls.is_some_and(|t| t.require_client_cert),
            connections: Arc::new(Semaphore::new(config.max_connection_count.max(1))),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Cancelling the token stops accepting and gracefully closes connections
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until shut down. At most `max_connection_count`
    /// connections are served at once; further clients wait in the backlog.
    pub async fn serve(self) {
        let local_addr = self.local_addr().ok();
        info!(addr = ?local_addr, tls = self.acceptor.is_some(), "forwarding server listening");

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.connections.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let (tcp, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            let connection = Connection {
                router: self.router.clone(),
                acceptor: self.acceptor.clone(),
                require_client_cert: self.require_client_cert,
                shutdown: self.shutdown.clone(),
            };
            tokio::spawn(async move {
                let _permit = permit;
                connection.run(tcp, peer).await;
            });
        }

        info!(addr = ?local_addr, "forwarding server stopped");
    }
}

struct Connection {
    router: Router,
    acceptor: Option<TlsAcceptor>,
    require_client_cert: bool,
    shutdown: CancellationToken,
}

impl Connection {
    async fn run(self, tcp: TcpStream, peer: SocketAddr) {
        let stream = match &self.acceptor {
            Some(acceptor) => match acceptor.accept(tcp).await {
                Ok(tls) => ForwardingStream::Tls(Box::new(tls)),
                Err(e) => {
                    warn!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
            },
            None => ForwardingStream::Plain(tcp),
        };
        if self.require_client_cert && !stream.has_client_certificate() {
            warn!(%peer, "client certificate required");
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "failed to set TCP_NODELAY");
        }

        let builder = auto::Builder::new(TokioExecutor::new());
        let conn = builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(self.router));
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = self.shutdown.cancelled() => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };
        if let Err(e) = result {
            debug!(%peer, error = %e, "connection closed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{PeerListProvider, StaticPeerListProvider};
    use crate::error::ForwardingFailure;
    use crate::event::Event;
    use crate::forwarding::transport::PeerTransport;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    struct Unused;

    #[async_trait]
    impl PeerTransport for Unused {
        async fn send(&self, _address: &str, _envelope: &ForwardingEnvelope) -> Result<(), ForwardingFailure> {
            Err(ForwardingFailure::Connection("unused".to_string()))
        }
    }

    fn setup(buffer_size: usize) -> (PeerForwarderConfig, Arc<PeerForwarderProvider>) {
        let config = PeerForwarderConfig {
            buffer_size,
            request_timeout_ms: 50,
            ..PeerForwarderConfig::for_tests()
        };
        let peers: Arc<dyn PeerListProvider> =
            Arc::new(StaticPeerListProvider::new(vec!["192.0.2.1".to_string()]));
        let provider = Arc::new(PeerForwarderProvider::new(config.clone(), Some(peers), Some(Arc::new(Unused))));
        provider
            .register("traces", "aggregate", &["traceId".to_string()], 1)
            .unwrap();
        (config, provider)
    }

    fn body(n: usize, plugin_id: &str) -> Vec<u8> {
        let events: Vec<Event> = (0..n)
            .map(|i| Event::from_value("span", json!({"traceId": i})))
            .collect();
        ForwardingEnvelope::from_events(&events, plugin_id, "traces")
            .unwrap()
            .to_bytes()
            .unwrap()
    }

    async fn post_body(router: Router, body: Vec<u8>) -> StatusCode {
        let request = Request::post("/event/forward")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        router.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_accepts_batch_into_buffer() {
        let (config, provider) = setup(10);
        let status = post_body(router(&config, provider.clone()), body(3, "aggregate")).await;
        assert_eq!(status, StatusCode::OK);

        let buffer = provider.buffer("traces", "aggregate").unwrap();
        let (records, state) = buffer.read(Duration::ZERO).await;
        assert_eq!(records.len(), 3);
        buffer.checkpoint(state);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let (config, provider) = setup(4);

        assert_eq!(
            post_body(router(&config, provider.clone()), b"not json".to_vec()).await,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            post_body(router(&config, provider.clone()), body(1, "unknown")).await,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            post_body(router(&config, provider.clone()), body(5, "aggregate")).await,
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            post_body(router(&config, provider.clone()), body(4, "aggregate")).await,
            StatusCode::OK
        );
        assert_eq!(
            post_body(router(&config, provider), body(1, "aggregate")).await,
            StatusCode::REQUEST_TIMEOUT
        );
    }

    #[tokio::test]
    async fn test_wrong_path_is_not_found() {
        let (config, provider) = setup(4);
        let request = Request::post("/other").body(Body::from(body(1, "aggregate"))).unwrap();
        let response = router(&config, provider).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
