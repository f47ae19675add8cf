//! Notifications about the progress of telemetry through the sender.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;

/// The reason a send was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SendRequestReason {
    /// No specific reason.
    Undefined,
    /// The batch timer fired.
    NormalSchedule,
    /// The producer requested a flush.
    ManualFlush,
    /// The process is shutting down.
    Unload,
    /// Adding an item would exceed the maximum batch size.
    MaxBatchSize,
    /// A failed batch is sent again.
    Retry,
}

/// The reason items were dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiscardReason {
    /// No specific reason.
    Unknown,
    /// The collector rejected the items with a non-retriable status.
    NonRetryableStatus,
    /// The item was empty or invalid.
    InvalidEvent,
    /// The item is larger than a batch may be.
    SizeLimitExceeded,
    /// The send buffer was full.
    QueueFull,
    /// The item was sampled out.
    Sampled,
}

courier_common::derive_fromstr_and_display!(SendRequestReason, UnknownReasonError, {
    SendRequestReason::Undefined => "undefined",
    SendRequestReason::NormalSchedule => "normal_schedule",
    SendRequestReason::ManualFlush => "manual_flush",
    SendRequestReason::Unload => "unload",
    SendRequestReason::MaxBatchSize => "max_batch_size",
    SendRequestReason::Retry => "retry",
});

courier_common::derive_fromstr_and_display!(DiscardReason, UnknownReasonError, {
    DiscardReason::Unknown => "unknown",
    DiscardReason::NonRetryableStatus => "non_retryable_status",
    DiscardReason::InvalidEvent => "invalid_event",
    DiscardReason::SizeLimitExceeded => "size_limit_exceeded",
    DiscardReason::QueueFull => "queue_full",
    DiscardReason::Sampled => "sampled",
});

/// Error returned when parsing an unknown reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnknownReasonError;

/// Receives notifications from the sender.
///
/// All methods have empty default implementations. Listeners are called synchronously and must
/// return quickly.
pub trait NotificationListener: Send + Sync {
    /// A send of the buffered items was requested.
    fn events_send_request(&self, _reason: SendRequestReason, _is_async: bool) {}

    /// Items were dropped and will not be sent.
    fn events_discarded(&self, _count: usize, _reason: DiscardReason) {}

    /// Items were accepted by the collector.
    fn events_sent(&self, _count: usize) {}
}

/// Fans notifications out to registered listeners.
///
/// A panicking listener is logged and does not affect the other listeners or the caller.
#[derive(Default)]
pub struct NotificationManager {
    listeners: RwLock<Vec<Arc<dyn NotificationListener>>>,
}

impl NotificationManager {
    /// Creates a manager without listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    pub fn add_listener(&self, listener: Arc<dyn NotificationListener>) {
        self.listeners.write().push(listener);
    }

    /// Removes a previously registered listener. Returns `true` if it was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn NotificationListener>) -> bool {
        let mut listeners = self.listeners.write();
        let len = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != len
    }

    /// Returns the number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Returns `true` if no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Notifies that a send was requested.
    pub fn events_send_request(&self, reason: SendRequestReason, is_async: bool) {
        self.notify("events_send_request", |l| {
            l.events_send_request(reason, is_async)
        });
    }

    /// Notifies that items were dropped.
    pub fn events_discarded(&self, count: usize, reason: DiscardReason) {
        if count > 0 {
            self.notify("events_discarded", |l| l.events_discarded(count, reason));
        }
    }

    /// Notifies that items were accepted.
    pub fn events_sent(&self, count: usize) {
        if count > 0 {
            self.notify("events_sent", |l| l.events_sent(count));
        }
    }

    fn notify(&self, name: &'static str, f: impl Fn(&dyn NotificationListener)) {
        // Listeners may register other listeners, so do not hold the lock while calling them.
        let listeners = self.listeners.read().clone();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                courier_log::error!(notification = name, "notification listener panicked");
            }
        }
    }
}

impl fmt::Debug for NotificationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationManager")
            .field("listeners", &self.len())
            .finish()
    }
}
