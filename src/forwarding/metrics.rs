//! Forwarding counters
//!
//! One [`ForwarderMetrics`] per (pipeline, plugin) registration. Counter names
//! are stable: they are what dashboards key on.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

pub const RECORDS_TO_BE_FORWARDED: &str = "recordsToBeForwarded";
pub const RECORDS_SUCCESSFULLY_FORWARDED: &str = "recordsSuccessfullyForwarded";
pub const RECORDS_FAILED_FORWARDING: &str = "recordsFailedForwarding";
pub const RECORDS_TO_BE_PROCESSED_LOCALLY: &str = "recordsToBeProcessedLocally";
pub const RECORDS_ACTUALLY_PROCESSED_LOCALLY: &str = "recordsActuallyProcessedLocally";
pub const RECORDS_RECEIVED_FROM_PEERS: &str = "recordsReceivedFromPeers";
pub const RECORDS_MISSING_IDENTIFICATION_KEYS: &str = "recordsMissingIdentificationKeys";
pub const REQUESTS_SUCCESSFUL: &str = "requestsSuccessful";
pub const REQUESTS_FAILED: &str = "requestsFailed";

#[derive(Debug, Default)]
pub struct ForwarderMetrics {
    records_to_be_forwarded: AtomicU64,
    records_successfully_forwarded: AtomicU64,
    records_failed_forwarding: AtomicU64,
    records_to_be_processed_locally: AtomicU64,
    records_actually_processed_locally: AtomicU64,
    records_received_from_peers: AtomicU64,
    records_missing_identification_keys: AtomicU64,
    requests_successful: AtomicU64,
    requests_failed: AtomicU64,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub records_to_be_forwarded: u64,
    pub records_successfully_forwarded: u64,
    pub records_failed_forwarding: u64,
    pub records_to_be_processed_locally: u64,
    pub records_actually_processed_locally: u64,
    pub records_received_from_peers: u64,
    pub records_missing_identification_keys: u64,
    pub requests_successful: u64,
    pub requests_failed: u64,
}

impl MetricsSnapshot {
    /// (stable name, value) pairs
    pub fn counters(&self) -> [(&'static str, u64); 9] {
        [
            (RECORDS_TO_BE_FORWARDED, self.records_to_be_forwarded),
            (RECORDS_SUCCESSFULLY_FORWARDED, self.records_successfully_forwarded),
            (RECORDS_FAILED_FORWARDING, self.records_failed_forwarding),
            (RECORDS_TO_BE_PROCESSED_LOCALLY, self.records_to_be_processed_locally),
            (RECORDS_ACTUALLY_PROCESSED_LOCALLY, self.records_actually_processed_locally),
            (RECORDS_RECEIVED_FROM_PEERS, self.records_received_from_peers),
            (RECORDS_MISSING_IDENTIFICATION_KEYS, self.records_missing_identification_keys),
            (REQUESTS_SUCCESSFUL, self.requests_successful),
            (REQUESTS_FAILED, self.requests_failed),
        ]
    }
}

#[inline]
fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

impl ForwarderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records_to_be_forwarded(&self, n: usize) {
        add(&self.records_to_be_forwarded, n);
    }

    pub fn records_successfully_forwarded(&self, n: usize) {
        add(&self.records_successfully_forwarded, n);
    }

    pub fn records_failed_forwarding(&self, n: usize) {
        add(&self.records_failed_forwarding, n);
    }

    pub fn records_to_be_processed_locally(&self, n: usize) {
        add(&self.records_to_be_processed_locally, n);
    }

    pub fn records_actually_processed_locally(&self, n: usize) {
        add(&self.records_actually_processed_locally, n);
    }

    pub fn records_received_from_peers(&self, n: usize) {
        add(&self.records_received_from_peers, n);
    }

    pub fn records_missing_identification_keys(&self, n: usize) {
        add(&self.records_missing_identification_keys, n);
    }

    pub fn request_succeeded(&self) {
        add(&self.requests_successful, 1);
    }

    pub fn request_failed(&self) {
        add(&self.requests_failed, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            records_to_be_forwarded: load(&self.records_to_be_forwarded),
            records_successfully_forwarded: load(&self.records_successfully_forwarded),
            records_failed_forwarding: load(&self.records_failed_forwarding),
            records_to_be_processed_locally: load(&self.records_to_be_processed_locally),
            records_actually_processed_locally: load(&self.records_actually_processed_locally),
            records_received_from_peers: load(&self.records_received_from_peers),
            records_missing_identification_keys: load(&self.records_missing_identification_keys),
            requests_successful: load(&self.requests_successful),
            requests_failed: load(&self.requests_failed),
        }
    }
}
