//! Peer list discovery
//!
//! The forwarder only consumes a [`PeerListProvider`]: the current peer list
//! plus a change notification. Static configuration is handled here; DNS and
//! cloud service discovery adapters are supplied by the host and push their
//! results through a [`WatchPeerListProvider`].

use crate::config::{DiscoveryMode, PeerForwarderConfig};
use crate::error::ConfigurationError;
use tokio::sync::watch;
use tracing::info;

/// Address used for this node when no peer list is available
pub const LOCAL_ENDPOINT: &str = "127.0.0.1";

pub trait PeerListProvider: Send + Sync {
    /// Current peer addresses
    fn peer_list(&self) -> Vec<String>;

    /// Receiver notified whenever the peer list changes
    fn subscribe(&self) -> watch::Receiver<Vec<String>>;
}

/// Fixed peer list from `static_endpoints`
pub struct StaticPeerListProvider {
    endpoints: watch::Sender<Vec<String>>,
}

impl StaticPeerListProvider {
    pub fn new(endpoints: Vec<String>) -> Self {
        let (endpoints, _) = watch::channel(normalize(endpoints));
        StaticPeerListProvider { endpoints }
    }
}

impl PeerListProvider for StaticPeerListProvider {
    fn peer_list(&self) -> Vec<String> {
        self.endpoints.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.endpoints.subscribe()
    }
}

/// Peer list pushed by an external discovery mechanism
pub struct WatchPeerListProvider {
    peers: watch::Sender<Vec<String>>,
}

impl WatchPeerListProvider {
    pub fn new(initial: Vec<String>) -> Self {
        let (peers, _) = watch::channel(normalize(initial));
        WatchPeerListProvider { peers }
    }

    /// Replace the peer list. Subscribers are only notified on an actual change.
    pub fn update(&self, peers: Vec<String>) {
        let peers = normalize(peers);
        let changed = self.peers.send_if_modified(|current| {
            if *current == peers {
                false
            } else {
                *current = peers;
                true
            }
        });
        if changed {
            info!(peers = self.peers.borrow().len(), "peer list updated");
        }
    }
}

impl PeerListProvider for WatchPeerListProvider {
    fn peer_list(&self) -> Vec<String> {
        self.peers.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.peers.subscribe()
    }
}

/// Sorted and deduplicated, so equal sets compare equal regardless of order
fn normalize(mut peers: Vec<String>) -> Vec<String> {
    peers.retain(|peer| !peer.trim().is_empty());
    for peer in peers.iter_mut() {
        *peer = peer.trim().to_string();
    }
    peers.sort();
    peers.dedup();
    peers
}

/// Build the provider for modes this crate can serve on its own.
///
/// `local_node` needs no provider and yields `None`. `dns` and
/// `aws_cloud_map` require an externally supplied provider.
pub fn provider_from_config(
    config: &PeerForwarderConfig,
) -> Result<Option<Box<dyn PeerListProvider>>, ConfigurationError> {
    match config.discovery_mode {
        DiscoveryMode::LocalNode => Ok(None),
        DiscoveryMode::Static => Ok(Some(Box::new(StaticPeerListProvider::new(
            config.static_endpoints.clone(),
        )))),
        mode @ (DiscoveryMode::Dns | DiscoveryMode::AwsCloudMap) => {
            Err(ConfigurationError::UnsupportedDiscoveryMode { mode: mode.name() })
        }
    }
}
