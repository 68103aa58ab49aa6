//! Processor seam used by the peer forwarding decorator
//!
//! A stateful processor opts into peer forwarding by returning its
//! [`RequiresPeerForwarding`] capability from [`Processor::peer_forwarding`].
//! Capabilities are checked once, when the pipeline is built.

mod decorator;

pub use decorator::{decorate_processors, PeerForwardingProcessorDecorator};

use crate::event::Event;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Processor: Send {
    async fn execute(&mut self, records: Vec<Event>) -> Vec<Event>;

    /// Called once before shutdown; the pipeline keeps calling `execute`
    /// until `is_ready_for_shutdown` holds
    async fn prepare_for_shutdown(&mut self) {}

    fn is_ready_for_shutdown(&self) -> bool {
        true
    }

    fn shutdown(&mut self) {}

    /// Peer forwarding capability, if this processor keeps per-key state
    fn peer_forwarding(&self) -> Option<Arc<dyn RequiresPeerForwarding>> {
        None
    }
}

/// Declared by processors whose state is partitioned by identification keys
pub trait RequiresPeerForwarding: Send + Sync {
    /// Event fields forming the partition key. Must be non-empty and identical
    /// across every instance of one stage.
    fn identification_keys(&self) -> Vec<String>;

    /// Whether this event takes part in forwarding at all
    fn is_applicable_event_for_peer_forwarding(&self, _event: &Event) -> bool {
        true
    }

    /// For events that are not forwarded: whether the processor still
    /// handles them locally instead of passing them through untouched
    fn is_for_local_processing_only(&self, _event: &Event) -> bool {
        false
    }
}
