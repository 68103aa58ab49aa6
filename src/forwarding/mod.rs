//! Peer forwarding: key ownership, routing, and the receiving endpoint

pub mod address;
pub mod client_pool;
pub mod codec;
pub mod forwarder;
pub mod hash_ring;
pub mod metrics;
pub mod provider;
pub mod server;
pub mod transport;

pub use address::{AddressClassifier, Destination, PeerAddress};
pub use client_pool::PeerClientPool;
pub use codec::{ForwardingEnvelope, WireEvent};
pub use forwarder::{
    ForwardingContext, ForwardingSettings, LocalPeerForwarder, PeerForwarder, RemotePeerForwarder,
};
pub use hash_ring::{HashRing, HashRingHandle};
pub use metrics::{ForwarderMetrics, MetricsSnapshot};
pub use provider::PeerForwarderProvider;
pub use server::{router, ForwardingServer};
pub use transport::{HttpPeerTransport, PeerTransport};
