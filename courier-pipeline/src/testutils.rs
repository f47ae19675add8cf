//! Helpers for testing the pipeline.

use std::collections::VecDeque;
use std::sync::Arc;

use courier_config::Config;
use courier_protocol::TelemetryItem;
use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::notifications::{DiscardReason, NotificationListener, SendRequestReason};
use crate::plugins::{Plugin, PluginError, ProcessContext, TelemetryPlugin};
use crate::services::transport::{
    FIRE_AND_FORGET_MAX_PAYLOAD_SIZE, Transport, TransportKind, TransportOutcome,
    TransportRequest, TransportResponse,
};

/// A valid instrumentation key.
pub const TEST_IKEY: &str = "0f6a1d2c-8b3e-4c5d-9e7f-1a2b3c4d5e6f";

/// Creates a config with [`TEST_IKEY`], deep-merged with the given JSON overrides.
pub fn test_config(overrides: Value) -> Arc<Config> {
    let mut values = json!({
        "core": {"instrumentation_key": TEST_IKEY},
    });
    merge(&mut values, overrides);
    Arc::new(Config::from_json_value(values).unwrap())
}

fn merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                merge(target.entry(key).or_insert(Value::Null), value);
            }
        }
        (target, source) => *target = source,
    }
}

/// A transport replaying scripted outcomes and recording all requests.
///
/// Once the script is exhausted, requests succeed with status 200, or are queued for
/// fire-and-forget transports.
#[derive(Debug)]
pub struct MockTransport {
    kind: TransportKind,
    max_payload_size: Option<usize>,
    outcomes: Mutex<VecDeque<TransportOutcome>>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl MockTransport {
    /// Creates a request transport.
    pub fn new() -> Self {
        Self::with_kind(TransportKind::Request, None)
    }

    /// Creates a fire-and-forget transport with the default payload limit.
    pub fn fire_and_forget() -> Self {
        Self::with_kind(
            TransportKind::FireAndForget,
            Some(FIRE_AND_FORGET_MAX_PAYLOAD_SIZE),
        )
    }

    /// Creates a transport of the given kind.
    pub fn with_kind(kind: TransportKind, max_payload_size: Option<usize>) -> Self {
        Self {
            kind,
            max_payload_size,
            outcomes: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Appends an outcome to the script.
    pub fn push_outcome(&self, outcome: TransportOutcome) {
        self.outcomes.lock().push_back(outcome);
    }

    /// Appends a response to the script.
    pub fn push_response(&self, response: TransportResponse) {
        self.push_outcome(TransportOutcome::Response(response));
    }

    /// Appends a response with an empty body to the script.
    pub fn push_status(&self, status: u16) {
        self.push_response(TransportResponse::status(status));
    }

    /// Returns all recorded requests.
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().clone()
    }

    /// Returns the bodies of all recorded requests.
    pub fn bodies(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|request| String::from_utf8_lossy(&request.body).into_owned())
            .collect()
    }

    /// Returns the number of recorded requests.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn max_payload_size(&self) -> Option<usize> {
        self.max_payload_size
    }

    fn send(&self, request: TransportRequest) -> BoxFuture<'static, TransportOutcome> {
        self.requests.lock().push(request);

        let outcome = self.outcomes.lock().pop_front().unwrap_or(match self.kind {
            TransportKind::FireAndForget => TransportOutcome::Queued,
            _ => TransportOutcome::Response(TransportResponse::status(200)),
        });

        Box::pin(future::ready(outcome))
    }
}

/// A notification received by a [`RecordingListener`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notification {
    /// See [`NotificationListener::events_send_request`].
    SendRequest(SendRequestReason, bool),
    /// See [`NotificationListener::events_discarded`].
    Discarded(usize, DiscardReason),
    /// See [`NotificationListener::events_sent`].
    Sent(usize),
}

/// Records all notifications.
#[derive(Debug, Default)]
pub struct RecordingListener {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingListener {
    /// Returns all notifications in order.
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    /// Returns the total number of sent items.
    pub fn sent(&self) -> usize {
        self.notifications
            .lock()
            .iter()
            .map(|n| match n {
                Notification::Sent(count) => *count,
                _ => 0,
            })
            .sum()
    }

    /// Returns the total number of items discarded for the given reason.
    pub fn discarded(&self, reason: DiscardReason) -> usize {
        self.notifications
            .lock()
            .iter()
            .map(|n| match n {
                Notification::Discarded(count, r) if *r == reason => *count,
                _ => 0,
            })
            .sum()
    }

    /// Returns the reasons of all send requests.
    pub fn send_requests(&self) -> Vec<SendRequestReason> {
        self.notifications
            .lock()
            .iter()
            .filter_map(|n| match n {
                Notification::SendRequest(reason, _) => Some(*reason),
                _ => None,
            })
            .collect()
    }
}

impl NotificationListener for RecordingListener {
    fn events_send_request(&self, reason: SendRequestReason, is_async: bool) {
        self.notifications
            .lock()
            .push(Notification::SendRequest(reason, is_async));
    }

    fn events_discarded(&self, count: usize, reason: DiscardReason) {
        self.notifications
            .lock()
            .push(Notification::Discarded(count, reason));
    }

    fn events_sent(&self, count: usize) {
        self.notifications.lock().push(Notification::Sent(count));
    }
}

#[derive(Debug, Default)]
struct CapturedInner {
    items: Vec<TelemetryItem>,
    lifecycle: Vec<String>,
}

/// Items and lifecycle calls seen by a [`CapturePlugin`].
#[derive(Clone, Debug, Default)]
pub struct Captured(Arc<Mutex<CapturedInner>>);

impl Captured {
    /// Returns the processed items.
    pub fn items(&self) -> Vec<TelemetryItem> {
        self.0.lock().items.clone()
    }

    /// Returns the number of processed items.
    pub fn len(&self) -> usize {
        self.0.lock().items.len()
    }

    /// Returns `true` if no item was processed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the lifecycle calls, for instance `flush(manual_flush)`.
    pub fn lifecycle(&self) -> Vec<String> {
        self.0.lock().lifecycle.clone()
    }

    fn record(&self, call: String) {
        self.0.lock().lifecycle.push(call);
    }
}

/// A telemetry plugin recording items and forwarding them.
pub struct CapturePlugin {
    identifier: String,
    priority: u32,
    tag: Option<(String, String)>,
    captured: Captured,
}

impl CapturePlugin {
    /// Creates the plugin.
    pub fn new(identifier: impl Into<String>, priority: u32) -> Self {
        Self {
            identifier: identifier.into(),
            priority,
            tag: None,
            captured: Captured::default(),
        }
    }

    /// Sets a tag on every item before forwarding it.
    pub fn tagging(mut self, key: &str, value: &str) -> Self {
        self.tag = Some((key.to_owned(), value.to_owned()));
        self
    }

    /// Returns a handle to the recorded data.
    pub fn captured(&self) -> Captured {
        self.captured.clone()
    }
}

impl Plugin for CapturePlugin {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn flush(&self, _is_async: bool, reason: SendRequestReason) -> BoxFuture<'static, ()> {
        self.captured.record(format!("flush({reason})"));
        Box::pin(async {})
    }

    fn teardown(&self) -> BoxFuture<'static, ()> {
        self.captured.record("teardown".to_owned());
        Box::pin(async {})
    }

    fn set_enabled(&self, enabled: bool) {
        self.captured.record(format!("set_enabled({enabled})"));
    }

    fn pause(&self) {
        self.captured.record("pause".to_owned());
    }

    fn resume(&self) {
        self.captured.record("resume".to_owned());
    }
}

impl TelemetryPlugin for CapturePlugin {
    fn process_telemetry(
        &self,
        item: &mut TelemetryItem,
        context: &mut ProcessContext<'_>,
    ) -> Result<(), PluginError> {
        if let Some((ref key, ref value)) = self.tag {
            item.set_tag(key.clone(), value.clone());
        }

        self.captured.0.lock().items.push(item.clone());
        context.process_next(item);
        Ok(())
    }
}
