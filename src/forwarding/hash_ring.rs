//! Consistent-hash ring mapping partition keys to peer addresses
//!
//! Each peer contributes `virtual_nodes` points (`address#i`) to a sorted
//! `u64` ring. A key belongs to the first point at or after its hash, wrapping
//! to the smallest point. Adding or removing a peer only moves the keys that
//! land on that peer's points (about 1/N of them).
//!
//! Rings are immutable; [`HashRingHandle`] swaps in a freshly built ring when
//! the peer list changes, so resolvers always see a complete snapshot.

use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Joins the parts of a multi-field partition key before hashing
const KEY_PART_SEPARATOR: char = '\u{1f}';

/// 64-bit ring position: the first 8 bytes of the SHA-1 digest, big-endian
pub fn ring_hash(input: &[u8]) -> u64 {
    let digest = Sha1::digest(input);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Hash of a partition key. Missing parts hash as empty strings.
pub fn key_hash<S: AsRef<str>>(parts: &[Option<S>]) -> u64 {
    let mut joined = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            joined.push(KEY_PART_SEPARATOR);
        }
        if let Some(part) = part {
            joined.push_str(part.as_ref());
        }
    }
    ring_hash(joined.as_bytes())
}

#[derive(Debug, Clone)]
pub struct HashRing {
    points: BTreeMap<u64, String>,
    peers: Vec<String>,
    virtual_nodes: usize,
}

impl HashRing {
    pub fn new(peers: &[String], virtual_nodes: usize) -> Self {
        let mut peers: Vec<String> = peers.to_vec();
        peers.sort();
        peers.dedup();

        let mut points = BTreeMap::new();
        for peer in &peers {
            for i in 0..virtual_nodes {
                let point = format!("{}#{}", peer, i);
                points.insert(ring_hash(point.as_bytes()), peer.clone());
            }
        }

        let ring = HashRing {
            points,
            peers,
            virtual_nodes,
        };
        ring.verify_invariants();
        ring
    }

    pub fn empty(virtual_nodes: usize) -> Self {
        Self::new(&[], virtual_nodes)
    }

    /// Peer owning this partition key, or `None` when the ring is empty
    pub fn resolve<S: AsRef<str>>(&self, parts: &[Option<S>]) -> Option<&str> {
        self.resolve_hash(key_hash(parts))
    }

    pub fn resolve_hash(&self, hash: u64) -> Option<&str> {
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, peer)| peer.as_str())
    }

    /// Sorted, deduplicated peer addresses on the ring
    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// Number of points on the ring
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Verify all invariants hold (debug builds only)
    #[cfg(debug_assertions)]
    pub fn verify_invariants(&self) {
        debug_assert!(
            self.points.len() <= self.peers.len() * self.virtual_nodes,
            "Invariant violated: {} points for {} peers x {} virtual nodes",
            self.points.len(),
            self.peers.len(),
            self.virtual_nodes
        );
        debug_assert!(
            self.peers.is_empty() == self.points.is_empty() || self.virtual_nodes == 0,
            "Invariant violated: ring emptiness disagrees with peer list"
        );
        debug_assert!(
            self.points.values().all(|p| self.peers.binary_search(p).is_ok()),
            "Invariant violated: ring point owned by unknown peer"
        );
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    pub fn verify_invariants(&self) {}
}

/// Shared, atomically replaceable ring snapshot
#[derive(Debug)]
pub struct HashRingHandle {
    current: RwLock<Arc<HashRing>>,
}

impl HashRingHandle {
    pub fn new(ring: HashRing) -> Self {
        HashRingHandle {
            current: RwLock::new(Arc::new(ring)),
        }
    }

    /// Current snapshot; stays valid even if the ring is replaced afterwards
    pub fn snapshot(&self) -> Arc<HashRing> {
        self.current.read().clone()
    }

    pub fn replace(&self, ring: HashRing) {
        *self.current.write() = Arc::new(ring);
    }

    /// Build a ring for `peers` (outside the lock) and swap it in
    pub fn rebuild(&self, peers: &[String]) {
        let virtual_nodes = self.current.read().virtual_nodes();
        let ring = HashRing::new(peers, virtual_nodes);
        info!(peers = ring.peers().len(), points = ring.len(), "hash ring rebuilt");
        self.replace(ring);
    }

    /// Rebuild the ring on every peer list change until cancelled or the
    /// sender goes away.
    pub fn spawn_refresh(
        self: Arc<Self>,
        mut peers: watch::Receiver<Vec<String>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = peers.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let list = peers.borrow_and_update().clone();
                        self.rebuild(&list);
                    }
                }
            }
        })
    }
}
