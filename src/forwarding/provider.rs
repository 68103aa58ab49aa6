//! Registry of peer forwarders, one per (pipeline, plugin)
//!
//! Registration creates the receive buffer that the forwarding endpoint
//! writes into and the forwarder the decorated processor calls. Stages whose
//! identification keys are excluded, and nodes running with `local_node`
//! discovery, get a [`LocalPeerForwarder`] and no buffer.

use super::forwarder::{
    ForwardingContext, ForwardingSettings, LocalPeerForwarder, PeerForwarder, RemotePeerForwarder,
};
use super::hash_ring::{HashRing, HashRingHandle};
use super::metrics::{ForwarderMetrics, MetricsSnapshot};
use super::transport::{HttpPeerTransport, PeerTransport};
use crate::buffer::{Buffer, CircuitBreaker, CircuitBreakingBuffer, PeerForwarderReceiveBuffer};
use crate::config::PeerForwarderConfig;
use crate::discovery::{self, PeerListProvider};
use crate::error::ConfigurationError;
use crate::event::Event;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Poll interval while waiting for buffers to drain
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct Registration {
    buffer: Arc<dyn Buffer<Event>>,
    metrics: Arc<ForwarderMetrics>,
    forwarder: Arc<RemotePeerForwarder>,
}

pub struct PeerForwarderProvider {
    config: Arc<PeerForwarderConfig>,
    peer_list: Option<Arc<dyn PeerListProvider>>,
    context: Option<ForwardingContext>,
    breaker: Option<Arc<dyn CircuitBreaker>>,
    registrations: RwLock<HashMap<(String, String), Registration>>,
    refresh: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl PeerForwarderProvider {
    /// Provider for the modes this crate serves on its own (`local_node`,
    /// `static`), talking HTTP to peers.
    pub fn from_config(config: PeerForwarderConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let peer_list: Option<Arc<dyn PeerListProvider>> =
            discovery::provider_from_config(&config)?.map(Arc::from);
        let transport: Arc<dyn PeerTransport> = match peer_list {
            Some(_) => Arc::new(HttpPeerTransport::from_config(&config)?),
            None => return Ok(Self::new(config, None, None)),
        };
        Ok(Self::new(config, peer_list, Some(transport)))
    }

    /// Provider with an externally supplied peer list and transport. Without
    /// a peer list every registration stays local.
    pub fn new(
        config: PeerForwarderConfig,
        peer_list: Option<Arc<dyn PeerListProvider>>,
        transport: Option<Arc<dyn PeerTransport>>,
    ) -> Self {
        let context = match (&peer_list, transport, config.server_port()) {
            (Some(peers), Some(transport), Ok(port)) => {
                let ring = HashRing::new(&peers.peer_list(), config.virtual_nodes);
                Some(ForwardingContext::new(
                    Arc::new(HashRingHandle::new(ring)),
                    transport,
                    port,
                    config.client_thread_count,
                ))
            }
            (Some(_), Some(_), Err(error)) => {
                warn!(%error, "peer forwarding disabled");
                None
            }
            _ => None,
        };
        PeerForwarderProvider {
            config: Arc::new(config),
            peer_list,
            context,
            breaker: None,
            registrations: RwLock::new(HashMap::new()),
            refresh: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Gate every receive buffer's write path with `breaker`
    pub fn with_circuit_breaker(mut self, breaker: Arc<dyn CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn config(&self) -> &PeerForwarderConfig {
        &self.config
    }

    /// Current ring snapshot, if this node forwards at all
    pub fn hash_ring(&self) -> Option<Arc<HashRing>> {
        self.context.as_ref().map(|context| context.ring.snapshot())
    }

    pub fn register(
        &self,
        pipeline_name: &str,
        plugin_id: &str,
        identification_keys: &[String],
        pipeline_worker_threads: usize,
    ) -> Result<Arc<dyn PeerForwarder>, ConfigurationError> {
        let context = match &self.context {
            Some(context) if !self.config.is_excluded(identification_keys) => context.clone(),
            _ => return Ok(Arc::new(LocalPeerForwarder)),
        };

        let key = (pipeline_name.to_string(), plugin_id.to_string());
        let mut registrations = self.registrations.write();
        if registrations.contains_key(&key) {
            return Err(ConfigurationError::DuplicateRegistration {
                pipeline: key.0,
                plugin_id: key.1,
            });
        }

        let receive_buffer: Arc<dyn Buffer<Event>> = Arc::new(
            PeerForwarderReceiveBuffer::new(self.config.buffer_size, self.config.batch_size)
                .with_drain_timeout(self.config.drain_timeout()),
        );
        let buffer: Arc<dyn Buffer<Event>> = match &self.breaker {
            Some(breaker) => Arc::new(CircuitBreakingBuffer::new(receive_buffer, breaker.clone())),
            None => receive_buffer,
        };
        let metrics = Arc::new(ForwarderMetrics::new());

        let forwarder = Arc::new(RemotePeerForwarder::new(
            context,
            buffer.clone(),
            metrics.clone(),
            ForwardingSettings::from_config(&self.config, pipeline_worker_threads),
            identification_keys.to_vec(),
            pipeline_name,
            plugin_id,
        ));
        registrations.insert(
            key,
            Registration {
                buffer,
                metrics,
                forwarder: forwarder.clone(),
            },
        );
        drop(registrations);

        info!(
            pipeline = pipeline_name,
            plugin_id,
            keys = ?identification_keys,
            "registered peer forwarder"
        );
        self.ensure_ring_refresh();
        Ok(forwarder)
    }

    /// Start following peer list changes once a runtime is available
    fn ensure_ring_refresh(&self) {
        let (Some(context), Some(peers)) = (&self.context, &self.peer_list) else {
            return;
        };
        let mut refresh = self.refresh.lock();
        if refresh.is_some() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            let receiver = peers.subscribe();
            *refresh = Some(context.ring.clone().spawn_refresh(receiver, self.shutdown.clone()));
        }
    }

    /// Whether any stage forwards, i.e. the forwarding endpoint must run
    pub fn is_peer_forwarding_required(&self) -> bool {
        !self.registrations.read().is_empty()
    }

    /// Buffer for a destination. An empty pipeline name matches the plugin's
    /// only registration, if it is unambiguous.
    pub fn buffer(&self, pipeline_name: &str, plugin_id: &str) -> Option<Arc<dyn Buffer<Event>>> {
        let registrations = self.registrations.read();
        if !pipeline_name.is_empty() {
            return registrations
                .get(&(pipeline_name.to_string(), plugin_id.to_string()))
                .map(|r| r.buffer.clone());
        }
        let mut matches = registrations
            .iter()
            .filter(|((_, plugin), _)| plugin == plugin_id)
            .map(|(_, r)| r.buffer.clone());
        match (matches.next(), matches.next()) {
            (Some(buffer), None) => Some(buffer),
            _ => None,
        }
    }

    pub fn metrics(&self, pipeline_name: &str, plugin_id: &str) -> Option<MetricsSnapshot> {
        self.registrations
            .read()
            .get(&(pipeline_name.to_string(), plugin_id.to_string()))
            .map(|r| r.metrics.snapshot())
    }

    /// Stop accepting forwarded records and wait up to the drain timeout for
    /// every receive buffer and outbound batching queue to empty. Returns
    /// whether they all did.
    pub async fn await_drain(&self) -> bool {
        let (buffers, forwarders): (Vec<Arc<dyn Buffer<Event>>>, Vec<Arc<RemotePeerForwarder>>) = self
            .registrations
            .read()
            .values()
            .map(|r| (r.buffer.clone(), r.forwarder.clone()))
            .unzip();
        for buffer in &buffers {
            buffer.shutdown();
        }

        let drain_timeout = buffers
            .iter()
            .map(|b| b.drain_timeout())
            .max()
            .unwrap_or(Duration::ZERO);
        let deadline = Instant::now() + drain_timeout;
        loop {
            let queued: usize = forwarders.iter().map(|f| f.queued()).sum();
            if queued == 0 && buffers.iter().all(|b| b.is_empty()) {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(?drain_timeout, queued, "peer forwarder not drained before timeout");
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Stop the ring refresh task
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for PeerForwarderProvider {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ManualCircuitBreaker;
    use crate::config::DiscoveryMode;
    use crate::discovery::{StaticPeerListProvider, WatchPeerListProvider};
    use crate::error::ForwardingFailure;
    use crate::forwarding::codec::ForwardingEnvelope;
    use async_trait::async_trait;
    use serde_json::json;

    struct AcceptAll;

    #[async_trait]
    impl PeerTransport for AcceptAll {
        async fn send(&self, _address: &str, _envelope: &ForwardingEnvelope) -> Result<(), ForwardingFailure> {
            Ok(())
        }
    }

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn provider_with(config: PeerForwarderConfig, peers: &[&str]) -> PeerForwarderProvider {
        let peers: Arc<dyn PeerListProvider> = Arc::new(StaticPeerListProvider::new(keys(peers)));
        PeerForwarderProvider::new(config, Some(peers), Some(Arc::new(AcceptAll)))
    }

    #[test]
    fn test_local_node_registers_nothing() {
        let config = PeerForwarderConfig {
            discovery_mode: DiscoveryMode::LocalNode,
            ..PeerForwarderConfig::for_tests()
        };
        let provider = PeerForwarderProvider::from_config(config).unwrap();
        provider.register("traces", "aggregate", &keys(&["traceId"]), 1).unwrap();
        assert!(!provider.is_peer_forwarding_required());
        assert!(provider.hash_ring().is_none());
    }

    #[test]
    fn test_dns_without_provider_is_rejected() {
        let config = PeerForwarderConfig {
            discovery_mode: DiscoveryMode::Dns,
            domain_name: Some("peers.internal".to_string()),
            ..PeerForwarderConfig::for_tests()
        };
        assert!(matches!(
            PeerForwarderProvider::from_config(config),
            Err(ConfigurationError::UnsupportedDiscoveryMode { mode: "dns" })
        ));
    }

    #[test]
    fn test_static_from_config_builds_ring() {
        let config = PeerForwarderConfig {
            static_endpoints: keys(&["10.0.0.1", "10.0.0.2"]),
            ..PeerForwarderConfig::for_tests()
        };
        let provider = PeerForwarderProvider::from_config(config).unwrap();
        let ring = provider.hash_ring().unwrap();
        assert_eq!(ring.peers().len(), 2);
        assert_eq!(ring.virtual_nodes(), 128);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let provider = provider_with(PeerForwarderConfig::for_tests(), &["192.0.2.1"]);
        provider.register("traces", "aggregate", &keys(&["traceId"]), 1).unwrap();
        let err = provider
            .register("traces", "aggregate", &keys(&["traceId"]), 1)
            .err()
            .unwrap();
        assert!(matches!(err, ConfigurationError::DuplicateRegistration { .. }));

        provider.register("logs", "aggregate", &keys(&["traceId"]), 1).unwrap();
        assert!(provider.is_peer_forwarding_required());
    }

    #[test]
    fn test_excluded_keys_get_local_forwarder() {
        let config = PeerForwarderConfig {
            exclude_identification_keys: vec![keys(&["serviceName"])],
            ..PeerForwarderConfig::for_tests()
        };
        let provider = provider_with(config, &["192.0.2.1"]);
        provider.register("traces", "service-map", &keys(&["serviceName"]), 1).unwrap();
        assert!(!provider.is_peer_forwarding_required());
        assert!(provider.buffer("traces", "service-map").is_none());
    }

    #[test]
    fn test_buffer_lookup() {
        let provider = provider_with(PeerForwarderConfig::for_tests(), &["192.0.2.1"]);
        provider.register("traces", "aggregate", &keys(&["traceId"]), 1).unwrap();

        assert!(provider.buffer("traces", "aggregate").is_some());
        assert!(provider.buffer("", "aggregate").is_some());
        assert!(provider.buffer("logs", "aggregate").is_none());

        provider.register("logs", "aggregate", &keys(&["traceId"]), 1).unwrap();
        assert!(provider.buffer("", "aggregate").is_none(), "ambiguous without pipeline name");
        assert!(provider.metrics("logs", "aggregate").is_some());
    }

    #[tokio::test]
    async fn test_circuit_breaker_wraps_buffers() {
        let breaker = Arc::new(ManualCircuitBreaker::new());
        let provider = provider_with(PeerForwarderConfig::for_tests(), &["192.0.2.1"])
            .with_circuit_breaker(breaker.clone());
        provider.register("traces", "aggregate", &keys(&["traceId"]), 1).unwrap();
        let buffer = provider.buffer("traces", "aggregate").unwrap();

        let event = Event::from_value("span", json!({"traceId": "a"}));
        breaker.open();
        assert!(buffer.write(event.clone(), Duration::from_millis(10)).await.is_err());
        breaker.close();
        assert!(buffer.write(event, Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_await_drain() {
        let config = PeerForwarderConfig {
            drain_timeout_ms: 100,
            ..PeerForwarderConfig::for_tests()
        };
        let provider = provider_with(config, &["192.0.2.1"]);
        let forwarder = provider.register("traces", "aggregate", &keys(&["traceId"]), 1).unwrap();
        assert!(provider.await_drain().await, "nothing buffered");

        let provider = provider_with(
            PeerForwarderConfig {
                drain_timeout_ms: 50,
                ..PeerForwarderConfig::for_tests()
            },
            &["192.0.2.1"],
        );
        let forwarder_b = provider.register("traces", "aggregate", &keys(&["traceId"]), 1).unwrap();
        let buffer = provider.buffer("traces", "aggregate").unwrap();
        buffer
            .write(Event::from_value("span", json!({"traceId": "a"})), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(!provider.await_drain().await, "record never consumed");

        assert_eq!(forwarder_b.receive().await.len(), 1);
        assert!(provider.await_drain().await);
        assert!(forwarder.receive().await.is_empty());
    }

    #[tokio::test]
    async fn test_await_drain_waits_for_batching_queues() {
        let config = PeerForwarderConfig {
            drain_timeout_ms: 50,
            forwarding_batch_timeout_ms: 60_000,
            ..PeerForwarderConfig::for_tests()
        };
        let provider = provider_with(config, &["192.0.2.1"]);
        let forwarder = provider.register("traces", "aggregate", &keys(&["traceId"]), 1).unwrap();

        let spans: Vec<Event> = (0..5)
            .map(|i| Event::from_value("span", json!({"traceId": format!("t-{}", i)})))
            .collect();
        assert!(forwarder.forward(spans).await.is_empty());
        assert_eq!(forwarder.queued(), 5);
        assert!(!provider.await_drain().await, "records still queued for the peer");

        assert!(forwarder.drain().await.is_empty());
        assert!(provider.await_drain().await);
        let metrics = provider.metrics("traces", "aggregate").unwrap();
        assert_eq!(metrics.records_successfully_forwarded, 5);
    }

    #[test]
    fn test_out_of_range_port_disables_forwarding() {
        let config = PeerForwarderConfig {
            port: 70_000,
            ..PeerForwarderConfig::for_tests()
        };
        let provider = provider_with(config, &["192.0.2.1"]);
        assert!(provider.hash_ring().is_none());
        provider.register("traces", "aggregate", &keys(&["traceId"]), 1).unwrap();
        assert!(!provider.is_peer_forwarding_required());
    }

    #[tokio::test]
    async fn test_ring_follows_peer_list() {
        let peers = Arc::new(WatchPeerListProvider::new(keys(&["192.0.2.1"])));
        let provider = PeerForwarderProvider::new(
            PeerForwarderConfig::for_tests(),
            Some(peers.clone()),
            Some(Arc::new(AcceptAll)),
        );
        provider.register("traces", "aggregate", &keys(&["traceId"]), 1).unwrap();

        peers.update(keys(&["192.0.2.1", "192.0.2.2"]));
        let mut updated = false;
        for _ in 0..100 {
            if provider.hash_ring().map(|r| r.peers().len()) == Some(2) {
                updated = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(updated);
        provider.shutdown();
    }
}
