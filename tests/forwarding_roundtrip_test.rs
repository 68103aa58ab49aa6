//! Forwarding Roundtrip Tests
//!
//! A real forwarding server on loopback, fed by the HTTP transport and by a
//! remote forwarder on a second provider.

use async_trait::async_trait;
use peer_forwarder::buffer::Buffer;
use peer_forwarder::config::PeerForwarderConfig;
use peer_forwarder::discovery::{PeerListProvider, StaticPeerListProvider};
use peer_forwarder::error::ForwardingFailure;
use peer_forwarder::event::Event;
use peer_forwarder::forwarding::{
    ForwardingEnvelope, ForwardingServer, HttpPeerTransport, PeerClientPool, PeerForwarder,
    PeerForwarderProvider, PeerTransport,
};
use serde_json::json;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PIPELINE: &str = "traces";
const PLUGIN: &str = "aggregate";
/// Documentation range address, never local; rewritten to loopback
const REMOTE_PEER: &str = "192.0.2.10";

fn keys() -> Vec<String> {
    vec!["traceId".to_string()]
}

fn spans(n: usize) -> Vec<Event> {
    (0..n)
        .map(|i| Event::from_value("span", json!({"traceId": format!("trace-{}", i), "seq": i})))
        .collect()
}

fn receiver_config(buffer_size: usize) -> PeerForwarderConfig {
    PeerForwarderConfig {
        buffer_size,
        batch_size: buffer_size,
        request_timeout_ms: 100,
        ..PeerForwarderConfig::for_tests()
    }
}

fn tls_config(buffer_size: usize) -> PeerForwarderConfig {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("config");
    PeerForwarderConfig {
        ssl: true,
        ssl_certificate_file: dir.join("default_certificate.pem"),
        ssl_key_file: dir.join("default_private_key.pem"),
        ..receiver_config(buffer_size)
    }
}

/// Receiving node: provider with one registration and a server on an
/// ephemeral loopback port
async fn start_receiver(
    config: PeerForwarderConfig,
) -> (Arc<PeerForwarderProvider>, SocketAddr, CancellationToken) {
    // Peer list naming a remote node so the registration gets a receive buffer
    let peers: Arc<dyn PeerListProvider> =
        Arc::new(StaticPeerListProvider::new(vec![REMOTE_PEER.to_string()]));
    let provider = Arc::new(PeerForwarderProvider::new(
        config.clone(),
        Some(peers),
        Some(Arc::new(Unreachable)),
    ));
    provider.register(PIPELINE, PLUGIN, &keys(), 1).unwrap();

    let server = ForwardingServer::bind_addr("127.0.0.1:0".parse().unwrap(), &config, provider.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_token();
    tokio::spawn(server.serve());
    (provider, addr, shutdown)
}

struct Unreachable;

#[async_trait]
impl PeerTransport for Unreachable {
    async fn send(&self, _address: &str, _envelope: &ForwardingEnvelope) -> Result<(), ForwardingFailure> {
        Err(ForwardingFailure::Connection("receiver does not forward".to_string()))
    }
}

/// HTTP transport that sends every peer's traffic to loopback
struct LoopbackTransport {
    inner: HttpPeerTransport,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn send(&self, _address: &str, envelope: &ForwardingEnvelope) -> Result<(), ForwardingFailure> {
        self.inner.send("127.0.0.1", envelope).await
    }
}

fn http_transport(config: &PeerForwarderConfig, port: u16) -> HttpPeerTransport {
    HttpPeerTransport::new(
        PeerClientPool::from_config(config).unwrap(),
        port,
        config.forwarding_path.clone(),
    )
}

async fn drain(provider: &PeerForwarderProvider) -> Vec<Event> {
    let buffer = provider.buffer(PIPELINE, PLUGIN).unwrap();
    let (records, state) = buffer.read(Duration::ZERO).await;
    buffer.checkpoint(state);
    records
}

// =============================================================================
// HTTP Transport
// =============================================================================

#[tokio::test]
async fn test_batch_lands_in_receive_buffer() {
    let config = receiver_config(16);
    let (provider, addr, shutdown) = start_receiver(config.clone()).await;
    let transport = http_transport(&config, addr.port());

    let events = spans(5);
    let envelope = ForwardingEnvelope::from_events(&events, PLUGIN, PIPELINE).unwrap();
    transport.send("127.0.0.1", &envelope).await.unwrap();

    assert_eq!(drain(&provider).await, events);
    shutdown.cancel();
}

#[tokio::test]
async fn test_full_buffer_is_rejected() {
    let config = receiver_config(4);
    let (provider, addr, shutdown) = start_receiver(config.clone()).await;
    let transport = http_transport(&config, addr.port());

    let fill = ForwardingEnvelope::from_events(&spans(4), PLUGIN, PIPELINE).unwrap();
    transport.send("127.0.0.1", &fill).await.unwrap();

    // No capacity within request_timeout
    let more = ForwardingEnvelope::from_events(&spans(1), PLUGIN, PIPELINE).unwrap();
    let result = transport.send("127.0.0.1", &more).await;
    assert!(matches!(result, Err(ForwardingFailure::Status(408))), "{:?}", result);

    // Larger than the whole buffer
    let oversized = ForwardingEnvelope::from_events(&spans(5), PLUGIN, PIPELINE).unwrap();
    let result = transport.send("127.0.0.1", &oversized).await;
    assert!(matches!(result, Err(ForwardingFailure::Status(413))), "{:?}", result);

    // Draining frees the buffer again
    assert_eq!(drain(&provider).await.len(), 4);
    transport.send("127.0.0.1", &more).await.unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn test_unknown_destination_is_rejected() {
    let config = receiver_config(4);
    let (_provider, addr, shutdown) = start_receiver(config.clone()).await;
    let transport = http_transport(&config, addr.port());

    let envelope = ForwardingEnvelope::from_events(&spans(1), "other-plugin", PIPELINE).unwrap();
    let result = transport.send("127.0.0.1", &envelope).await;
    assert!(matches!(result, Err(ForwardingFailure::Status(404))), "{:?}", result);
    shutdown.cancel();
}

#[tokio::test]
async fn test_batch_over_tls() {
    let config = tls_config(16);
    let (provider, addr, shutdown) = start_receiver(config.clone()).await;
    let transport = http_transport(&config, addr.port());
    assert!(transport.url("127.0.0.1").starts_with("https://"));

    let events = spans(3);
    let envelope = ForwardingEnvelope::from_events(&events, PLUGIN, PIPELINE).unwrap();
    transport.send("127.0.0.1", &envelope).await.unwrap();

    assert_eq!(drain(&provider).await, events);
    shutdown.cancel();
}

#[tokio::test]
async fn test_plaintext_client_cannot_reach_tls_server() {
    let (_provider, addr, shutdown) = start_receiver(tls_config(4)).await;
    let transport = http_transport(&receiver_config(4), addr.port());

    let envelope = ForwardingEnvelope::from_events(&spans(1), PLUGIN, PIPELINE).unwrap();
    assert!(transport.send("127.0.0.1", &envelope).await.is_err());
    shutdown.cancel();
}

// =============================================================================
// Forwarder To Server
// =============================================================================

#[tokio::test]
async fn test_remote_forwarder_delivers_to_owner() {
    let receiver_cfg = receiver_config(64);
    let (receiver, addr, shutdown) = start_receiver(receiver_cfg.clone()).await;

    // Sender owns nothing: its ring holds only the remote peer
    let peers: Arc<dyn PeerListProvider> =
        Arc::new(StaticPeerListProvider::new(vec![REMOTE_PEER.to_string()]));
    let transport = LoopbackTransport {
        inner: http_transport(&receiver_cfg, addr.port()),
    };
    let sender = PeerForwarderProvider::new(
        PeerForwarderConfig::for_tests(),
        Some(peers),
        Some(Arc::new(transport)),
    );
    let forwarder = sender.register(PIPELINE, PLUGIN, &keys(), 1).unwrap();

    let events = spans(10);
    let local = forwarder.forward(events.clone()).await;
    assert!(local.is_empty(), "everything belongs to the remote peer");

    let metrics = sender.metrics(PIPELINE, PLUGIN).unwrap();
    assert_eq!(metrics.records_to_be_forwarded, 10);
    assert_eq!(metrics.records_successfully_forwarded, 10);
    assert_eq!(metrics.records_failed_forwarding, 0);
    assert_eq!(metrics.requests_successful, 1);

    let mut received = drain(&receiver).await;
    received.sort_by_key(|e| e.get("seq").and_then(|v| v.as_u64()));
    assert_eq!(received, events);
    shutdown.cancel();
}

#[tokio::test]
async fn test_rejected_batch_comes_back_for_local_processing() {
    let receiver_cfg = receiver_config(4);
    let (_receiver, addr, shutdown) = start_receiver(receiver_cfg.clone()).await;

    let peers: Arc<dyn PeerListProvider> =
        Arc::new(StaticPeerListProvider::new(vec![REMOTE_PEER.to_string()]));
    let transport = LoopbackTransport {
        inner: http_transport(&receiver_cfg, addr.port()),
    };
    let sender = PeerForwarderProvider::new(
        PeerForwarderConfig::for_tests(),
        Some(peers),
        Some(Arc::new(transport)),
    );
    let forwarder = sender.register(PIPELINE, PLUGIN, &keys(), 1).unwrap();

    // Eight records cannot fit a four-record receive buffer
    let events = spans(8);
    let local = forwarder.forward(events.clone()).await;
    assert_eq!(local.len(), 8);

    let metrics = sender.metrics(PIPELINE, PLUGIN).unwrap();
    assert_eq!(metrics.records_failed_forwarding, 8);
    assert_eq!(metrics.requests_failed, 1);
    assert_eq!(metrics.records_actually_processed_locally, 8);
    shutdown.cancel();
}
