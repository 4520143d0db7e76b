//! The sink registry: typed persistence handlers per resource type.
//!
//! Inbound batches are opaque to the engine. At configuration time the
//! host registers one typed handler per resource type; draining the
//! inbound queue decodes each batch and dispatches it to the matching
//! handler. An unregistered resource type is a protocol error, detected
//! at drain time rather than silently dropped.

use crate::datastore::DatastoreFactory;
use crate::error::{EngineError, EngineResult};
use medisync_pool::ConnectionPool;
use medisync_store::{QueueEntry, QueueKind};
use serde::de::DeserializeOwned;
use std::collections::HashMap;

type ApplyFn = Box<dyn Fn(&QueueEntry) -> EngineResult<()> + Send + Sync>;
type PurgeFn = Box<dyn Fn() -> EngineResult<()> + Send + Sync>;

struct ResourceSink {
    apply: ApplyFn,
    purge: Option<PurgeFn>,
}

/// Maps resource-type identifiers to their persistence handlers.
///
/// Built once at configuration time, then shared read-only.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: HashMap<String, ResourceSink>,
}

impl SinkRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a raw handler that receives whole queue entries.
    pub fn register_raw(
        &mut self,
        resource_type: impl Into<String>,
        apply: impl Fn(&QueueEntry) -> EngineResult<()> + Send + Sync + 'static,
    ) {
        self.sinks.insert(
            resource_type.into(),
            ResourceSink {
                apply: Box::new(apply),
                purge: None,
            },
        );
    }

    /// Registers a typed handler.
    ///
    /// The entry payload is decoded as a CBOR batch of serialized
    /// records, each record decoded as `T`; the handler receives the
    /// whole decoded batch. Decode failures surface as protocol errors.
    pub fn register<T: DeserializeOwned>(
        &mut self,
        resource_type: impl Into<String>,
        apply: impl Fn(Vec<T>) -> EngineResult<()> + Send + Sync + 'static,
    ) {
        let resource_type = resource_type.into();
        let label = resource_type.clone();
        self.register_raw(resource_type, move |entry: &QueueEntry| {
            let raw: Vec<Vec<u8>> = ciborium::from_reader(entry.payload.as_slice())
                .map_err(|e| EngineError::protocol(format!("bad {label} batch: {e}")))?;
            let mut records = Vec::with_capacity(raw.len());
            for item in raw {
                records.push(ciborium::from_reader(item.as_slice()).map_err(|e| {
                    EngineError::protocol(format!("bad {label} record: {e}"))
                })?);
            }
            apply(records)
        });
    }

    /// Attaches a purge handler, called by resync before a forced pull
    /// to drop the locally persisted copies of a resource.
    pub fn set_purge(
        &mut self,
        resource_type: &str,
        purge: impl Fn() -> EngineResult<()> + Send + Sync + 'static,
    ) {
        if let Some(sink) = self.sinks.get_mut(resource_type) {
            sink.purge = Some(Box::new(purge));
        }
    }

    /// True if a handler is registered for the resource type.
    #[must_use]
    pub fn handles(&self, resource_type: &str) -> bool {
        self.sinks.contains_key(resource_type)
    }

    /// Applies one entry through its handler.
    pub fn apply(&self, entry: &QueueEntry) -> EngineResult<()> {
        let sink = self.sinks.get(&entry.resource_type).ok_or_else(|| {
            EngineError::protocol(format!("no sink for resource type {}", entry.resource_type))
        })?;
        (sink.apply)(entry)
    }

    /// Purges locally persisted copies of a resource, if a purge handler
    /// was registered.
    pub fn purge(&self, resource_type: &str) -> EngineResult<()> {
        if let Some(purge) = self.sinks.get(resource_type).and_then(|s| s.purge.as_ref()) {
            purge()?;
        }
        Ok(())
    }

    /// Drains the inbound queue through the registered handlers.
    ///
    /// Each entry is removed only after its handler returns success;
    /// a failing entry stays queued and the drain continues with the
    /// rest. Returns the number of entries applied.
    pub fn drain_inbound(
        &self,
        pool: &ConnectionPool<DatastoreFactory>,
        source: &str,
    ) -> EngineResult<u64> {
        let entries = {
            let datastore = pool.read(source)?;
            datastore.queue().entries_in_order(QueueKind::Inbound)
        };

        let mut applied = 0u64;
        for entry in entries {
            match self.apply(&entry) {
                Ok(()) => {
                    let datastore = pool.write(source)?;
                    datastore.queue().remove(entry.id)?;
                    applied += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        entry = entry.id,
                        resource_type = %entry.resource_type,
                        error = %e,
                        "inbound entry left queued"
                    );
                }
            }
        }
        if applied > 0 {
            tracing::debug!(applied, "drained inbound queue");
        }
        Ok(applied)
    }
}

impl std::fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkRegistry")
            .field("resource_types", &self.sinks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medisync_store::{Operation, Priority};
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Patient {
        id: u32,
    }

    fn batch_payload(ids: &[u32]) -> Vec<u8> {
        let items: Vec<Vec<u8>> = ids
            .iter()
            .map(|id| {
                let mut buf = Vec::new();
                ciborium::into_writer(&Patient { id: *id }, &mut buf).unwrap();
                buf
            })
            .collect();
        let mut payload = Vec::new();
        ciborium::into_writer(&items, &mut payload).unwrap();
        payload
    }

    fn entry(resource_type: &str, payload: Vec<u8>) -> QueueEntry {
        QueueEntry {
            id: 1,
            creation_time: 0,
            resource_type: resource_type.to_string(),
            payload,
            operation: Operation::Sync,
            kind: QueueKind::Inbound,
            priority: Priority::Normal,
        }
    }

    #[test]
    fn typed_handler_decodes_batches() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SinkRegistry::new();
        let sink = Arc::clone(&seen);
        registry.register("Patient", move |records: Vec<Patient>| {
            sink.lock().extend(records.into_iter().map(|p| p.id));
            Ok(())
        });

        registry
            .apply(&entry("Patient", batch_payload(&[1, 2, 3])))
            .unwrap();
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn unknown_resource_type_is_a_protocol_error() {
        let registry = SinkRegistry::new();
        let err = registry.apply(&entry("Act", vec![])).unwrap_err();
        assert!(matches!(err, EngineError::Protocol { .. }));
    }

    #[test]
    fn malformed_payload_is_a_protocol_error() {
        let mut registry = SinkRegistry::new();
        registry.register("Patient", |_: Vec<Patient>| Ok(()));

        let err = registry
            .apply(&entry("Patient", vec![0xff, 0x00]))
            .unwrap_err();
        assert!(matches!(err, EngineError::Protocol { .. }));
    }

    #[test]
    fn purge_runs_only_when_registered() {
        let purged = Arc::new(Mutex::new(0u32));
        let mut registry = SinkRegistry::new();
        registry.register("Patient", |_: Vec<Patient>| Ok(()));

        // No purge handler yet
        registry.purge("Patient").unwrap();
        assert_eq!(*purged.lock(), 0);

        let counter = Arc::clone(&purged);
        registry.set_purge("Patient", move || {
            *counter.lock() += 1;
            Ok(())
        });
        registry.purge("Patient").unwrap();
        assert_eq!(*purged.lock(), 1);
    }
}
