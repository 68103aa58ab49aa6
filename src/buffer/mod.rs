//! Buffers between the forwarding endpoint and the stateful stage
//!
//! Every buffer hands out a [`CheckpointState`] with each read. The reader
//! redeems it through [`Buffer::checkpoint`] once the records are processed,
//! which is what releases capacity back to writers.

mod circuit_breaker;
mod receive_buffer;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakingBuffer, ManualCircuitBreaker, UsageCircuitBreaker,
};
pub use receive_buffer::PeerForwarderReceiveBuffer;

use crate::error::BufferError;
use async_trait::async_trait;
use std::time::Duration;

/// Receipt for one [`Buffer::read`]. Not `Clone`: it can be redeemed once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "capacity is only released when the checkpoint is redeemed"]
pub struct CheckpointState {
    records: usize,
}

impl CheckpointState {
    pub(crate) fn new(records: usize) -> Self {
        CheckpointState { records }
    }

    /// Number of records the matching read returned
    pub fn records(&self) -> usize {
        self.records
    }
}

/// Bounded multi-producer / multi-consumer record buffer
#[async_trait]
pub trait Buffer<T: Send + 'static>: Send + Sync {
    /// Write one record, waiting at most `timeout` for capacity
    async fn write(&self, record: T, timeout: Duration) -> Result<(), BufferError>;

    /// Write all records or none, waiting at most `timeout` for capacity
    async fn write_all(&self, records: Vec<T>, timeout: Duration) -> Result<(), BufferError>;

    /// Read up to one batch. A zero timeout returns only what is already queued.
    async fn read(&self, timeout: Duration) -> (Vec<T>, CheckpointState);

    fn checkpoint(&self, state: CheckpointState);

    /// Nothing queued and nothing read but not yet checkpointed
    fn is_empty(&self) -> bool;

    /// How long shutdown should wait for this buffer to empty
    fn drain_timeout(&self) -> Duration {
        Duration::ZERO
    }

    /// Stop accepting writes. Queued records stay readable.
    fn shutdown(&self) {}
}
