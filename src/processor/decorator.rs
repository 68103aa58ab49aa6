//! Makes peer forwarding transparent to a stateful processor
//!
//! Per batch: applicable records are forwarded and only the locally owned
//! share is kept, records received from peers are added, and the inner
//! processor sees the union. Records the stage does not care about are
//! appended to its output untouched.
//!
//! Once shutdown is prepared, the forwarder's batching queues are drained on
//! every call and undeliverable records are processed here.

use super::{Processor, RequiresPeerForwarding};
use crate::error::ConfigurationError;
use crate::event::Event;
use crate::forwarding::{PeerForwarder, PeerForwarderProvider};
use async_trait::async_trait;
use std::sync::Arc;

pub struct PeerForwardingProcessorDecorator {
    inner: Box<dyn Processor>,
    forwarder: Arc<dyn PeerForwarder>,
    capability: Arc<dyn RequiresPeerForwarding>,
    peer_forwarding_disabled: bool,
    shutting_down: bool,
    /// Drained records that could not be delivered, processed on the next call
    returned: Vec<Event>,
}

impl PeerForwardingProcessorDecorator {
    pub fn new(
        inner: Box<dyn Processor>,
        forwarder: Arc<dyn PeerForwarder>,
        capability: Arc<dyn RequiresPeerForwarding>,
        peer_forwarding_disabled: bool,
    ) -> Self {
        PeerForwardingProcessorDecorator {
            inner,
            forwarder,
            capability,
            peer_forwarding_disabled,
            shutting_down: false,
            returned: Vec::new(),
        }
    }

    /// True when the stage's identification keys are excluded from forwarding
    pub fn is_peer_forwarding_disabled(&self) -> bool {
        self.peer_forwarding_disabled
    }
}

#[async_trait]
impl Processor for PeerForwardingProcessorDecorator {
    async fn execute(&mut self, records: Vec<Event>) -> Vec<Event> {
        let mut applicable = Vec::new();
        let mut local_only = Vec::new();
        let mut skipped = Vec::new();
        for record in records {
            if self.capability.is_applicable_event_for_peer_forwarding(&record) {
                applicable.push(record);
            } else if self.capability.is_for_local_processing_only(&record) {
                local_only.push(record);
            } else {
                skipped.push(record);
            }
        }

        let mut to_process = std::mem::take(&mut self.returned);
        to_process.extend(self.forwarder.forward(applicable).await);
        if self.shutting_down {
            to_process.extend(self.forwarder.drain().await);
        }
        to_process.extend(self.forwarder.receive().await);
        to_process.extend(local_only);

        let mut output = self.inner.execute(to_process).await;
        output.extend(skipped);
        output
    }

    async fn prepare_for_shutdown(&mut self) {
        self.inner.prepare_for_shutdown().await;
        self.shutting_down = true;
        let undelivered = self.forwarder.drain().await;
        self.returned.extend(undelivered);
    }

    fn is_ready_for_shutdown(&self) -> bool {
        self.inner.is_ready_for_shutdown() && self.returned.is_empty() && self.forwarder.queued() == 0
    }

    fn shutdown(&mut self) {
        self.inner.shutdown();
    }
}

/// Wrap every instance of one stateful stage. All instances must declare the
/// same non-empty identification keys; they share a single forwarder.
pub fn decorate_processors(
    processors: Vec<Box<dyn Processor>>,
    provider: &PeerForwarderProvider,
    pipeline_name: &str,
    plugin_id: &str,
    pipeline_worker_threads: usize,
) -> Result<Vec<Box<dyn Processor>>, ConfigurationError> {
    if processors.is_empty() {
        return Ok(Vec::new());
    }

    let mut capabilities = Vec::with_capacity(processors.len());
    let mut expected_keys: Option<Vec<String>> = None;
    for processor in &processors {
        let capability = processor
            .peer_forwarding()
            .ok_or_else(|| ConfigurationError::UnsupportedProcessor {
                plugin_id: plugin_id.to_string(),
            })?;
        let keys = capability.identification_keys();
        if keys.is_empty() {
            return Err(ConfigurationError::EmptyIdentificationKeys {
                plugin_id: plugin_id.to_string(),
            });
        }
        match &expected_keys {
            Some(expected) if *expected != keys => {
                return Err(ConfigurationError::MismatchedIdentificationKeys {
                    plugin_id: plugin_id.to_string(),
                    expected: expected.clone(),
                    found: keys,
                });
            }
            Some(_) => {}
            None => expected_keys = Some(keys),
        }
        capabilities.push(capability);
    }

    let keys = expected_keys.unwrap_or_default();
    let disabled = provider.config().is_excluded(&keys);
    let forwarder = provider.register(pipeline_name, plugin_id, &keys, pipeline_worker_threads)?;

    Ok(processors
        .into_iter()
        .zip(capabilities)
        .map(|(processor, capability)| {
            Box::new(PeerForwardingProcessorDecorator::new(
                processor,
                forwarder.clone(),
                capability,
                disabled,
            )) as Box<dyn Processor>
        })
        .collect())
}
