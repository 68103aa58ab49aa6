//! Circuit breaking on the buffer write path
//!
//! While the breaker is open, writes fail fast with a timeout instead of
//! touching the wrapped buffer. Reads and checkpoints always go through so the
//! buffer can drain.

use super::{Buffer, CheckpointState};
use crate::error::BufferError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub trait CircuitBreaker: Send + Sync {
    fn is_open(&self) -> bool;
}

/// Breaker toggled explicitly by an operator or a test
#[derive(Debug, Default)]
pub struct ManualCircuitBreaker {
    open: AtomicBool,
}

impl ManualCircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::Release);
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl CircuitBreaker for ManualCircuitBreaker {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

type UsageGauge = Box<dyn Fn() -> u64 + Send + Sync>;

/// Trips while a usage gauge (memory, queue depth...) exceeds a threshold.
///
/// The gauge is re-evaluated at most once per check interval; in between the
/// last verdict is reused.
pub struct UsageCircuitBreaker {
    threshold: u64,
    gauge: UsageGauge,
    check_interval: Duration,
    last_check: Mutex<Option<Instant>>,
    open: AtomicBool,
}

impl UsageCircuitBreaker {
    pub fn new(threshold: u64, gauge: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        UsageCircuitBreaker {
            threshold,
            gauge: Box::new(gauge),
            check_interval: Duration::ZERO,
            last_check: Mutex::new(None),
            open: AtomicBool::new(false),
        }
    }

    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    fn evaluate(&self) {
        let usage = (self.gauge)();
        let open = usage > self.threshold;
        let was_open = self.open.swap(open, Ordering::AcqRel);
        if open && !was_open {
            warn!(usage, threshold = self.threshold, "circuit breaker opened");
        } else if !open && was_open {
            info!(usage, threshold = self.threshold, "circuit breaker closed");
        }
    }
}

impl CircuitBreaker for UsageCircuitBreaker {
    fn is_open(&self) -> bool {
        let mut last_check = self.last_check.lock();
        let due = match *last_check {
            Some(at) => at.elapsed() >= self.check_interval,
            None => true,
        };
        if due {
            self.evaluate();
            *last_check = Some(Instant::now());
        }
        self.open.load(Ordering::Acquire)
    }
}

/// Buffer decorator that rejects writes while `breaker` is open
pub struct CircuitBreakingBuffer<T> {
    inner: Arc<dyn Buffer<T>>,
    breaker: Arc<dyn CircuitBreaker>,
}

impl<T: Send + 'static> CircuitBreakingBuffer<T> {
    pub fn new(inner: Arc<dyn Buffer<T>>, breaker: Arc<dyn CircuitBreaker>) -> Self {
        CircuitBreakingBuffer { inner, breaker }
    }

    fn check_breaker(&self, timeout: Duration) -> Result<(), BufferError> {
        if self.breaker.is_open() {
            Err(BufferError::Timeout { timeout })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Buffer<T> for CircuitBreakingBuffer<T> {
    async fn write(&self, record: T, timeout: Duration) -> Result<(), BufferError> {
        self.check_breaker(timeout)?;
        self.inner.write(record, timeout).await
    }

    async fn write_all(&self, records: Vec<T>, timeout: Duration) -> Result<(), BufferError> {
        self.check_breaker(timeout)?;
        self.inner.write_all(records, timeout).await
    }

    async fn read(&self, timeout: Duration) -> (Vec<T>, CheckpointState) {
        self.inner.read(timeout).await
    }

    fn checkpoint(&self, state: CheckpointState) {
        self.inner.checkpoint(state)
    }

    fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn drain_timeout(&self) -> Duration {
        self.inner.drain_timeout()
    }

    fn shutdown(&self) {
        self.inner.shutdown()
    }
}
