//! Routing record batches to the peers that own them
//!
//! [`RemotePeerForwarder::forward`] groups records by owning peer, keeps the
//! ones this node owns, and ships the rest. Nothing is ever dropped: any record
//! that cannot be handed to its owner comes back in the returned local batch.
//!
//! Remote records first land in a bounded per-peer queue. Every full
//! `forwarding_batch_size` chunk is cut off and sent as soon as it forms; the
//! partial remainder waits until `forwarding_batch_timeout` has passed since
//! the queue's last flush. With the default zero timeout every call flushes
//! everything it queued. [`PeerForwarder::drain`] empties the queues
//! regardless of the timer at shutdown.

use super::address::{AddressClassifier, Destination};
use super::codec::ForwardingEnvelope;
use super::hash_ring::HashRingHandle;
use super::metrics::ForwarderMetrics;
use super::transport::PeerTransport;
use crate::buffer::Buffer;
use crate::config::PeerForwarderConfig;
use crate::error::ForwardingFailure;
use crate::event::Event;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::warn;

#[async_trait]
pub trait PeerForwarder: Send + Sync {
    /// Route `records`; returns the records this node must process itself
    async fn forward(&self, records: Vec<Event>) -> Vec<Event>;

    /// Records forwarded to this node by peers
    async fn receive(&self) -> Vec<Event>;

    /// Send everything still waiting in batching queues, ignoring the batch
    /// timeout. Returns the records that could not be delivered.
    async fn drain(&self) -> Vec<Event> {
        Vec::new()
    }

    /// Records waiting in batching queues
    fn queued(&self) -> usize {
        0
    }
}

/// Forwarding disabled: everything stays local
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalPeerForwarder;

#[async_trait]
impl PeerForwarder for LocalPeerForwarder {
    async fn forward(&self, records: Vec<Event>) -> Vec<Event> {
        records
    }

    async fn receive(&self) -> Vec<Event> {
        Vec::new()
    }
}

/// Collaborators shared by every remote forwarder of one node
#[derive(Clone)]
pub struct ForwardingContext {
    pub ring: Arc<HashRingHandle>,
    pub transport: Arc<dyn PeerTransport>,
    pub classifier: Arc<AddressClassifier>,
    /// Bounds concurrent outbound requests (`client_thread_count`)
    pub workers: Arc<Semaphore>,
}

impl ForwardingContext {
    /// `local_port` is this node's forwarding port, used to tell self from peers
    pub fn new(
        ring: Arc<HashRingHandle>,
        transport: Arc<dyn PeerTransport>,
        local_port: u16,
        client_thread_count: usize,
    ) -> Self {
        ForwardingContext {
            ring,
            transport,
            classifier: Arc::new(AddressClassifier::new(local_port)),
            workers: Arc::new(Semaphore::new(client_thread_count.max(1))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForwardingSettings {
    /// How long `receive` waits for a full batch
    pub batch_delay: Duration,
    pub forwarding_batch_size: usize,
    pub forwarding_batch_timeout: Duration,
    /// Per-peer queue bound
    pub batch_queue_capacity: usize,
}

impl ForwardingSettings {
    pub fn from_config(config: &PeerForwarderConfig, pipeline_worker_threads: usize) -> Self {
        let forwarding_batch_size = config.forwarding_batch_size.max(1);
        ForwardingSettings {
            batch_delay: config.batch_delay(),
            forwarding_batch_size,
            forwarding_batch_timeout: config.forwarding_batch_timeout(),
            batch_queue_capacity: forwarding_batch_size
                .saturating_mul(pipeline_worker_threads.max(1))
                .saturating_mul(config.forwarding_batch_queue_depth.max(1)),
        }
    }
}

struct PeerBatchQueue {
    records: VecDeque<Event>,
    last_flush: Instant,
}

type PeerBatch = (String, Vec<Event>);

/// Forwarder for one (pipeline, plugin) registration
pub struct RemotePeerForwarder {
    context: ForwardingContext,
    buffer: Arc<dyn Buffer<Event>>,
    metrics: Arc<ForwarderMetrics>,
    settings: ForwardingSettings,
    identification_keys: Vec<String>,
    pipeline_name: String,
    plugin_id: String,
    queues: Mutex<HashMap<String, PeerBatchQueue>>,
}

impl RemotePeerForwarder {
    pub fn new(
        context: ForwardingContext,
        buffer: Arc<dyn Buffer<Event>>,
        metrics: Arc<ForwarderMetrics>,
        settings: ForwardingSettings,
        identification_keys: Vec<String>,
        pipeline_name: impl Into<String>,
        plugin_id: impl Into<String>,
    ) -> Self {
        RemotePeerForwarder {
            context,
            buffer,
            metrics,
            settings,
            identification_keys,
            pipeline_name: pipeline_name.into(),
            plugin_id: plugin_id.into(),
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn identification_keys(&self) -> &[String] {
        &self.identification_keys
    }

    pub fn metrics(&self) -> &Arc<ForwarderMetrics> {
        &self.metrics
    }

    /// Records waiting in the batching queue for `address`
    pub fn queued_for(&self, address: &str) -> usize {
        self.queues
            .lock()
            .get(address)
            .map_or(0, |queue| queue.records.len())
    }

    /// Split into records without any identification key and records per
    /// owning peer. An empty ring owns nothing.
    fn group_by_owner(&self, records: Vec<Event>) -> (Vec<Event>, Vec<(String, Vec<Event>)>) {
        let ring = self.context.ring.snapshot();
        let mut unowned = Vec::new();
        let mut owned: Vec<(String, Vec<Event>)> = Vec::new();
        let mut slots: HashMap<String, usize> = HashMap::new();
        let mut missing_keys = 0;

        for record in records {
            let parts: Vec<Option<String>> = self
                .identification_keys
                .iter()
                .map(|key| record.key_string(key))
                .collect();
            if parts.iter().all(Option::is_none) {
                missing_keys += 1;
                unowned.push(record);
                continue;
            }
            match ring.resolve(parts.as_slice()) {
                Some(owner) => {
                    let slot = *slots.entry(owner.to_string()).or_insert_with(|| {
                        owned.push((owner.to_string(), Vec::new()));
                        owned.len() - 1
                    });
                    owned[slot].1.push(record);
                }
                None => unowned.push(record),
            }
        }

        if missing_keys > 0 {
            self.metrics.records_missing_identification_keys(missing_keys);
        }
        (unowned, owned)
    }

    /// Queue records for `address`. Each full forwarding batch is moved to
    /// `ready` as soon as it forms, so only the partial tail occupies the
    /// queue. Returns the records that did not fit.
    fn enqueue(&self, address: &str, records: Vec<Event>, ready: &mut Vec<PeerBatch>) -> Vec<Event> {
        let batch_size = self.settings.forwarding_batch_size;
        let capacity = self.settings.batch_queue_capacity;
        let mut queues = self.queues.lock();
        let queue = queues.entry(address.to_string()).or_insert_with(|| PeerBatchQueue {
            records: VecDeque::new(),
            last_flush: Instant::now(),
        });

        let mut overflow = Vec::new();
        for record in records {
            if queue.records.len() >= capacity {
                overflow.push(record);
                continue;
            }
            queue.records.push_back(record);
            if queue.records.len() >= batch_size {
                ready.push((address.to_string(), queue.records.drain(..batch_size).collect()));
                queue.last_flush = Instant::now();
            }
        }
        overflow
    }

    /// Drain queues in chunks of at most one forwarding batch. Unless `force`
    /// is set, only queues whose batch timeout has passed are drained.
    fn take_batches(&self, force: bool) -> Vec<PeerBatch> {
        let batch_size = self.settings.forwarding_batch_size;
        let timeout = self.settings.forwarding_batch_timeout;
        let now = Instant::now();
        let mut batches = Vec::new();
        let mut queues = self.queues.lock();

        for (address, queue) in queues.iter_mut() {
            if queue.records.is_empty() {
                continue;
            }
            if !force && now.duration_since(queue.last_flush) < timeout {
                continue;
            }
            queue.last_flush = now;
            while !queue.records.is_empty() {
                let take = batch_size.min(queue.records.len());
                batches.push((address.clone(), queue.records.drain(..take).collect()));
            }
        }
        batches
    }

    fn forwarding_failed(&self, address: &str, records: usize, error: &ForwardingFailure) {
        warn!(
            peer = address,
            pipeline = %self.pipeline_name,
            plugin_id = %self.plugin_id,
            records,
            error = %error,
            "forwarding to peer failed, processing locally"
        );
        self.metrics.records_failed_forwarding(records);
        self.metrics.request_failed();
    }

    /// Send batches concurrently on the worker pool and wait for all of
    /// them. Failed batches are appended to `local`.
    async fn send_batches(&self, batches: Vec<PeerBatch>, local: &mut Vec<Event>) {
        if batches.is_empty() {
            return;
        }

        let mut in_flight = Vec::with_capacity(batches.len());
        for (address, batch) in batches {
            let envelope = match ForwardingEnvelope::from_events(&batch, &self.plugin_id, &self.pipeline_name) {
                Ok(envelope) => envelope,
                Err(error) => {
                    self.forwarding_failed(&address, batch.len(), &error);
                    local.extend(batch);
                    continue;
                }
            };
            let permit = match self.context.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    let error = ForwardingFailure::Worker("worker pool closed".to_string());
                    self.forwarding_failed(&address, batch.len(), &error);
                    local.extend(batch);
                    continue;
                }
            };
            let transport = self.context.transport.clone();
            let task_address = address.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                transport.send(&task_address, &envelope).await
            });
            in_flight.push((address, batch, handle));
        }

        let (targets, handles): (Vec<_>, Vec<_>) = in_flight
            .into_iter()
            .map(|(address, batch, handle)| ((address, batch), handle))
            .unzip();
        let outcomes = futures::future::join_all(handles).await;

        for ((address, batch), outcome) in targets.into_iter().zip(outcomes) {
            let result = outcome.unwrap_or_else(|join_error| Err(ForwardingFailure::Worker(join_error.to_string())));
            match result {
                Ok(()) => {
                    self.metrics.records_successfully_forwarded(batch.len());
                    self.metrics.request_succeeded();
                }
                Err(error) => {
                    self.forwarding_failed(&address, batch.len(), &error);
                    local.extend(batch);
                }
            }
        }
    }
}

#[async_trait]
impl PeerForwarder for RemotePeerForwarder {
    async fn forward(&self, records: Vec<Event>) -> Vec<Event> {
        let (unowned, owned) = self.group_by_owner(records);

        self.metrics.records_to_be_processed_locally(unowned.len());
        let mut local = unowned;
        let mut ready = Vec::new();

        for (address, group) in owned {
            match self.context.classifier.classify(&address).await {
                Destination::Local => {
                    self.metrics.records_to_be_processed_locally(group.len());
                    local.extend(group);
                }
                Destination::Remote(address) => {
                    self.metrics.records_to_be_forwarded(group.len());
                    let overflow = self.enqueue(&address, group, &mut ready);
                    if !overflow.is_empty() {
                        warn!(
                            peer = %address,
                            records = overflow.len(),
                            "batching queue full, processing locally"
                        );
                        self.metrics.records_failed_forwarding(overflow.len());
                        local.extend(overflow);
                    }
                }
            }
        }

        ready.extend(self.take_batches(false));
        self.send_batches(ready, &mut local).await;

        self.metrics.records_actually_processed_locally(local.len());
        local
    }

    async fn receive(&self) -> Vec<Event> {
        let (records, checkpoint) = self.buffer.read(self.settings.batch_delay).await;
        self.buffer.checkpoint(checkpoint);
        self.metrics.records_received_from_peers(records.len());
        records
    }

    async fn drain(&self) -> Vec<Event> {
        let batches = self.take_batches(true);
        if batches.is_empty() {
            return Vec::new();
        }
        let mut local = Vec::new();
        self.send_batches(batches, &mut local).await;
        self.metrics.records_actually_processed_locally(local.len());
        local
    }

    fn queued(&self) -> usize {
        self.queues.lock().values().map(|queue| queue.records.len()).sum()
    }
}
