//! Buffer of serialized envelopes awaiting delivery.
//!
//! Payloads are either pending, meaning they have not been sent yet, or in flight, meaning they
//! were handed to a transport that has not confirmed delivery. A payload is in at most one of the
//! two sets. Acknowledged payloads are removed.
//!
//! With a [`StorageProvider`], both sets are persisted after every change. Payloads found in
//! storage on startup are all treated as pending, since in-flight payloads may never have reached
//! the collector.

use std::fmt;
use std::sync::Arc;

use courier_log::LogError;
use courier_protocol::BatchFormat;
use serde_json::json;

use crate::diagnostics::{Diagnostics, MessageId, Severity};

mod storage;

pub use self::storage::*;

/// Storage key of the pending payloads.
pub const BUFFER_KEY: &str = "courier_buffer";

/// Storage key of the in-flight payloads.
pub const SENT_BUFFER_KEY: &str = "courier_sent_buffer";

/// A serialized envelope in the [`SendBuffer`].
///
/// Payloads are identified by an id assigned on enqueue, so equal envelopes enqueued twice are
/// tracked separately.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferedPayload {
    id: u64,
    data: Arc<str>,
}

impl BufferedPayload {
    /// Returns the id assigned by the buffer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the serialized envelope.
    pub fn as_str(&self) -> &str {
        &self.data
    }

    /// Returns the size of the payload in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug)]
struct Persistence {
    provider: Arc<dyn StorageProvider>,
    buffer_key: String,
    sent_key: String,
}

/// Ordered store of payloads across their delivery states.
pub struct SendBuffer {
    pending: Vec<BufferedPayload>,
    in_flight: Vec<BufferedPayload>,
    max_items: usize,
    next_id: u64,
    full: bool,
    persistence: Option<Persistence>,
    diagnostics: Arc<Diagnostics>,
}

impl SendBuffer {
    /// Creates a buffer that only lives in memory.
    pub fn new(max_items: usize, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            pending: Vec::new(),
            in_flight: Vec::new(),
            max_items,
            next_id: 0,
            full: false,
            persistence: None,
            diagnostics,
        }
    }

    /// Creates a buffer persisted to `provider` under keys with the given prefix.
    ///
    /// Previously pending and in-flight payloads are loaded as pending, capped to `max_items`,
    /// and written back immediately.
    pub fn with_storage(
        max_items: usize,
        provider: Arc<dyn StorageProvider>,
        prefix: &str,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        let mut buffer = Self::new(max_items, diagnostics);
        let persistence = Persistence {
            provider,
            buffer_key: format!("{prefix}{BUFFER_KEY}"),
            sent_key: format!("{prefix}{SENT_BUFFER_KEY}"),
        };

        let mut restored = buffer.load(&persistence, &persistence.buffer_key);
        restored.extend(buffer.load(&persistence, &persistence.sent_key));
        restored.truncate(max_items);

        if !restored.is_empty() {
            courier_log::debug!(count = restored.len(), "restored buffered payloads");
        }

        for data in restored {
            let payload = buffer.next_payload(data.into());
            buffer.pending.push(payload);
        }

        buffer.persistence = Some(persistence);
        buffer.persist();
        buffer
    }

    /// Returns the maximum number of payloads.
    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// Returns the number of pending payloads.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Returns the number of in-flight payloads.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns the number of payloads in both sets.
    pub fn len(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    /// Returns `true` if the buffer holds no payloads.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the size of a request body with all pending payloads.
    pub fn pending_batch_len(&self, format: BatchFormat) -> usize {
        format.batch_len(self.pending.iter().map(BufferedPayload::as_str))
    }

    /// Returns the size of a request body with all pending payloads followed by `extra`.
    pub fn pending_batch_len_with(&self, format: BatchFormat, extra: &str) -> usize {
        let pending = self.pending.iter().map(BufferedPayload::as_str);
        format.batch_len(pending.chain(std::iter::once(extra)))
    }

    /// Appends a payload to the pending set.
    ///
    /// Returns `false` if the buffer is full and the payload was dropped. A full buffer is
    /// reported once until space becomes available again.
    pub fn enqueue(&mut self, data: impl Into<Arc<str>>) -> bool {
        if self.len() >= self.max_items {
            if !self.full {
                self.full = true;
                self.diagnostics.log(
                    Severity::Warning,
                    MessageId::BufferFull,
                    "maximum buffer size reached",
                    Some(json!({ "max_items": self.max_items })),
                    true,
                );
            }
            return false;
        }

        self.full = false;
        let payload = self.next_payload(data.into());
        self.pending.push(payload);
        self.persist();
        true
    }

    /// Returns a snapshot of all pending payloads without removing them.
    pub fn batch(&self) -> Vec<BufferedPayload> {
        self.pending.clone()
    }

    /// Moves payloads from the pending to the in-flight set.
    pub fn mark_in_flight(&mut self, payloads: &[BufferedPayload]) {
        let mut changed = false;

        for payload in payloads {
            if let Some(index) = position(&self.pending, payload) {
                let payload = self.pending.remove(index);
                self.in_flight.push(payload);
                changed = true;
            }
        }

        if changed {
            self.persist();
        }
    }

    /// Removes payloads from both sets.
    ///
    /// Acknowledging a payload that is no longer buffered is a no-op.
    pub fn acknowledge(&mut self, payloads: &[BufferedPayload]) {
        let before = self.len();

        self.pending.retain(|p| !contains(payloads, p));
        self.in_flight.retain(|p| !contains(payloads, p));

        if self.len() != before {
            self.persist();
        }
    }

    /// Moves in-flight payloads back to the front of the pending set for a retry.
    ///
    /// Payloads that have been removed in the meantime are not restored.
    pub fn requeue(&mut self, payloads: &[BufferedPayload]) {
        let mut restored = Vec::new();

        for payload in payloads {
            if let Some(index) = position(&self.in_flight, payload) {
                restored.push(self.in_flight.remove(index));
            }
        }

        if restored.is_empty() {
            return;
        }

        restored.append(&mut self.pending);
        self.pending = restored;
        self.persist();
    }

    /// Drops all payloads. Returns the number of dropped payloads.
    pub fn clear(&mut self) -> usize {
        let count = self.len();
        self.pending.clear();
        self.in_flight.clear();
        self.full = false;
        self.persist();
        count
    }

    fn next_payload(&mut self, data: Arc<str>) -> BufferedPayload {
        let id = self.next_id;
        self.next_id += 1;
        BufferedPayload { id, data }
    }

    fn load(&self, persistence: &Persistence, key: &str) -> Vec<String> {
        let stored = match persistence.provider.get(key) {
            Ok(stored) => stored,
            Err(error) => {
                self.storage_failure(key, &error);
                return Vec::new();
            }
        };

        match stored.map(|s| serde_json::from_str::<Vec<String>>(&s)) {
            None => Vec::new(),
            Some(Ok(payloads)) => payloads,
            Some(Err(error)) => {
                self.storage_failure(key, &error);
                Vec::new()
            }
        }
    }

    fn persist(&self) {
        let Some(ref persistence) = self.persistence else {
            return;
        };

        let sets = [
            (&persistence.buffer_key, &self.pending),
            (&persistence.sent_key, &self.in_flight),
        ];

        for (key, payloads) in sets {
            let strings: Vec<&str> = payloads.iter().map(BufferedPayload::as_str).collect();
            let result = match serde_json::to_string(&strings) {
                Ok(value) => persistence.provider.set(key, &value),
                Err(error) => Err(StorageError::Io(error.into())),
            };

            if let Err(error) = result {
                self.storage_failure(key, &error);
            }
        }
    }

    fn storage_failure(&self, key: &str, error: &(dyn std::error::Error + 'static)) {
        self.diagnostics.log(
            Severity::Warning,
            MessageId::StorageFailure,
            format!("failed to access stored buffer: {}", LogError(error)),
            Some(json!({ "key": key })),
            false,
        );
    }
}

impl fmt::Debug for SendBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendBuffer")
            .field("pending", &self.pending.len())
            .field("in_flight", &self.in_flight.len())
            .field("max_items", &self.max_items)
            .field("persistent", &self.persistence.is_some())
            .finish()
    }
}

fn position(payloads: &[BufferedPayload], payload: &BufferedPayload) -> Option<usize> {
    payloads.iter().position(|p| p.id == payload.id)
}

fn contains(payloads: &[BufferedPayload], payload: &BufferedPayload) -> bool {
    position(payloads, payload).is_some()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn buffer(max_items: usize) -> SendBuffer {
        SendBuffer::new(max_items, Arc::new(Diagnostics::default()))
    }

    fn assert_disjoint(buffer: &SendBuffer) {
        let pending: BTreeSet<_> = buffer.pending.iter().map(|p| p.id).collect();
        let in_flight: BTreeSet<_> = buffer.in_flight.iter().map(|p| p.id).collect();

        assert!(pending.is_disjoint(&in_flight));
        assert_eq!(pending.len(), buffer.pending.len());
        assert_eq!(in_flight.len(), buffer.in_flight.len());
        assert!(buffer.len() <= buffer.max_items());
    }

    #[test]
    fn test_state_sets_stay_disjoint() {
        let mut buffer = buffer(4);

        for i in 0..3 {
            assert!(buffer.enqueue(format!("p{i}")));
            assert_disjoint(&buffer);
        }

        let batch = buffer.batch();
        buffer.mark_in_flight(&batch[..2]);
        assert_disjoint(&buffer);
        assert_eq!((buffer.pending_len(), buffer.in_flight_len()), (1, 2));

        assert!(buffer.enqueue("p3"));
        assert!(!buffer.enqueue("p4"));
        assert_disjoint(&buffer);

        buffer.mark_in_flight(&batch[..2]);
        assert_disjoint(&buffer);

        buffer.acknowledge(&batch[..1]);
        buffer.acknowledge(&batch[..1]);
        assert_disjoint(&buffer);
        assert_eq!(buffer.len(), 3);

        buffer.requeue(&batch[1..2]);
        buffer.requeue(&batch[1..2]);
        assert_disjoint(&buffer);
        assert_eq!(buffer.pending_len(), 3);
        assert_eq!(buffer.batch()[0].as_str(), "p1");

        buffer.acknowledge(&buffer.batch());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_requeue_skips_acknowledged() {
        let mut buffer = buffer(10);
        buffer.enqueue("a");

        let batch = buffer.batch();
        buffer.mark_in_flight(&batch);
        buffer.acknowledge(&batch);
        buffer.requeue(&batch);

        assert!(buffer.is_empty());
    }

    #[test]
    fn test_full_buffer_frees_up() {
        courier_log::init_test!();

        let diagnostics = Arc::new(Diagnostics::new(
            courier_config::DiagnosticLevel::Information,
            25,
        ));
        let mut buffer = SendBuffer::new(1, diagnostics.clone());

        assert!(buffer.enqueue("a"));
        assert!(!buffer.enqueue("b"));
        assert!(!buffer.enqueue("c"));
        assert_eq!(diagnostics.drain().len(), 1);

        buffer.acknowledge(&buffer.batch());
        assert!(buffer.enqueue("d"));
        assert!(!buffer.enqueue("e"));
        assert_eq!(diagnostics.drain().len(), 1);
    }

    #[test]
    fn test_pending_batch_len() {
        let mut buffer = buffer(10);
        assert_eq!(buffer.pending_batch_len(BatchFormat::JsonArray), 0);

        buffer.enqueue("{}");
        buffer.enqueue("{}");
        assert_eq!(buffer.pending_batch_len(BatchFormat::JsonArray), 7);
        assert_eq!(buffer.pending_batch_len(BatchFormat::LineDelimited), 5);
        assert_eq!(
            buffer.pending_batch_len_with(BatchFormat::JsonArray, "{}"),
            10
        );
    }

    #[test]
    fn test_restore_from_storage() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .set("app_courier_buffer", r#"["p1","p2"]"#)
            .unwrap();
        storage
            .set("app_courier_sent_buffer", r#"["s1","s2"]"#)
            .unwrap();

        let buffer = SendBuffer::with_storage(
            3,
            storage.clone(),
            "app_",
            Arc::new(Diagnostics::default()),
        );

        let restored: Vec<_> = buffer.batch().iter().map(|p| p.as_str().to_owned()).collect();
        assert_eq!(restored, ["p1", "p2", "s1"]);
        assert_eq!(buffer.in_flight_len(), 0);

        assert_eq!(
            storage.get("app_courier_buffer").unwrap().as_deref(),
            Some(r#"["p1","p2","s1"]"#)
        );
        assert_eq!(
            storage.get("app_courier_sent_buffer").unwrap().as_deref(),
            Some("[]")
        );
    }

    #[test]
    fn test_persists_every_change() {
        let storage = Arc::new(MemoryStorage::new());
        let mut buffer =
            SendBuffer::with_storage(10, storage.clone(), "", Arc::new(Diagnostics::default()));

        buffer.enqueue("a");
        buffer.enqueue("b");
        let batch = buffer.batch();
        buffer.mark_in_flight(&batch[..1]);

        assert_eq!(
            storage.get(BUFFER_KEY).unwrap().as_deref(),
            Some(r#"["b"]"#)
        );
        assert_eq!(
            storage.get(SENT_BUFFER_KEY).unwrap().as_deref(),
            Some(r#"["a"]"#)
        );

        let restored =
            SendBuffer::with_storage(10, storage, "", Arc::new(Diagnostics::default()));
        assert_eq!(restored.pending_len(), 2);
    }

    #[test]
    fn test_corrupt_storage_ignored() {
        courier_log::init_test!();

        let storage = Arc::new(MemoryStorage::new());
        storage.set(BUFFER_KEY, "not json").unwrap();

        let buffer = SendBuffer::with_storage(10, storage, "", Arc::new(Diagnostics::default()));
        assert!(buffer.is_empty());
    }
}
