//! Receive buffer for records forwarded in by peers
//!
//! A lock-free `ArrayQueue` holds the records; a semaphore sized to the same
//! capacity gates writers. Permits are consumed on write and only returned on
//! checkpoint, so records that were read but not yet processed still count
//! against capacity.
//!
//! Invariants:
//! - consumed permits == queued records + in-flight records when quiescent
//! - available permits <= capacity
//! - a write either enqueues every record or consumes no capacity

use super::{Buffer, CheckpointState};
use crate::error::BufferError;
use async_trait::async_trait;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// Sleep between drain attempts while a timed read waits for a full batch
const READ_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub struct PeerForwarderReceiveBuffer<T> {
    queue: ArrayQueue<T>,
    permits: Semaphore,
    capacity: usize,
    batch_size: usize,
    drain_timeout: Duration,
    in_flight: AtomicUsize,
}

impl<T: Send + 'static> PeerForwarderReceiveBuffer<T> {
    /// Capacity is clamped to at least one record and to the semaphore's
    /// permit limit.
    pub fn new(capacity: usize, batch_size: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        PeerForwarderReceiveBuffer {
            queue: ArrayQueue::new(capacity),
            permits: Semaphore::new(capacity),
            capacity,
            batch_size: batch_size.max(1),
            drain_timeout: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Records currently queued (not counting in-flight)
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Records read but not yet checkpointed
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Capacity free for new writes
    pub fn available_capacity(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn is_shutdown(&self) -> bool {
        self.permits.is_closed()
    }

    fn drain_into(&self, records: &mut Vec<T>) {
        while records.len() < self.batch_size {
            // Count as in flight before popping so is_empty never sees a gap
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            match self.queue.pop() {
                Some(record) => records.push(record),
                None => {
                    self.in_flight.fetch_sub(1, Ordering::AcqRel);
                    break;
                }
            }
        }
    }

    /// Verify all invariants hold (debug builds only)
    #[cfg(debug_assertions)]
    pub fn verify_invariants(&self) {
        let available = self.permits.available_permits();
        debug_assert!(
            available <= self.capacity,
            "Invariant violated: {} permits available with capacity {}",
            available,
            self.capacity
        );
        debug_assert!(
            self.queue.len() <= self.capacity,
            "Invariant violated: queue holds {} records with capacity {}",
            self.queue.len(),
            self.capacity
        );
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    pub fn verify_invariants(&self) {}
}

#[async_trait]
impl<T: Send + 'static> Buffer<T> for PeerForwarderReceiveBuffer<T> {
    async fn write(&self, record: T, timeout: Duration) -> Result<(), BufferError> {
        let permit = match tokio::time::timeout(timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            // Elapsed, or closed by shutdown
            Ok(Err(_)) | Err(_) => return Err(BufferError::Timeout { timeout }),
        };
        permit.forget();

        if self.queue.push(record).is_err() {
            self.permits.add_permits(1);
            return Err(BufferError::Timeout { timeout });
        }
        Ok(())
    }

    async fn write_all(&self, records: Vec<T>, timeout: Duration) -> Result<(), BufferError> {
        let count = records.len();
        if count > self.capacity {
            return Err(BufferError::SizeOverflow {
                requested: count,
                capacity: self.capacity,
            });
        }
        if count == 0 {
            return Ok(());
        }
        let wanted = u32::try_from(count).map_err(|_| BufferError::SizeOverflow {
            requested: count,
            capacity: self.capacity,
        })?;

        let permit = match tokio::time::timeout(timeout, self.permits.acquire_many(wanted)).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => return Err(BufferError::Timeout { timeout }),
        };
        permit.forget();

        let mut rejected = 0;
        for record in records {
            if self.queue.push(record).is_err() {
                rejected += 1;
            }
        }
        if rejected > 0 {
            self.permits.add_permits(rejected);
            return Err(BufferError::Timeout { timeout });
        }
        Ok(())
    }

    async fn read(&self, timeout: Duration) -> (Vec<T>, CheckpointState) {
        let mut records = Vec::with_capacity(self.batch_size.min(self.capacity));

        if timeout.is_zero() {
            self.drain_into(&mut records);
        } else {
            let deadline = Instant::now() + timeout;
            loop {
                self.drain_into(&mut records);
                let now = Instant::now();
                if records.len() >= self.batch_size || now >= deadline {
                    break;
                }
                tokio::time::sleep(READ_POLL_INTERVAL.min(deadline - now)).await;
            }
        }

        let state = CheckpointState::new(records.len());
        (records, state)
    }

    fn checkpoint(&self, state: CheckpointState) {
        let released = state.records();
        if released == 0 {
            return;
        }
        let previous = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(released))
            })
            .unwrap_or_else(|current| current);
        debug_assert!(
            previous >= released,
            "checkpoint of {} records with only {} in flight",
            released,
            previous
        );
        self.permits.add_permits(released.min(previous));
        self.verify_invariants();
    }

    fn is_empty(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) == 0 && self.queue.is_empty()
    }

    fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    fn shutdown(&self) {
        self.permits.close();
    }
}
