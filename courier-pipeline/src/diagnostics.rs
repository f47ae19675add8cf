//! Internal diagnostics of the pipeline.
//!
//! Components report recoverable problems through [`Diagnostics::log`]. Messages are forwarded to
//! the process log and, depending on the configured level, queued so the core can send them as
//! regular trace telemetry.

use std::collections::HashSet;
use std::fmt;

use courier_config::DiagnosticLevel;
use courier_protocol::{SeverityLevel, TelemetryItem};
use parking_lot::Mutex;
use serde_json::Value;

/// Severity of a diagnostic message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// The pipeline lost data or cannot operate.
    Critical = 1,
    /// Undesirable but recovered behavior.
    Warning = 2,
    /// Informational messages.
    Information = 3,
}

impl Severity {
    fn is_enabled(self, level: DiagnosticLevel) -> bool {
        let threshold = match level {
            DiagnosticLevel::Off => return false,
            DiagnosticLevel::Critical => Severity::Critical,
            DiagnosticLevel::Warning => Severity::Warning,
            DiagnosticLevel::Information => Severity::Information,
        };
        self <= threshold
    }

    fn as_severity_level(self) -> SeverityLevel {
        match self {
            Severity::Critical => SeverityLevel::Critical,
            Severity::Warning => SeverityLevel::Warning,
            Severity::Information => SeverityLevel::Information,
        }
    }
}

/// Stable identifiers of diagnostic messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// A notification listener panicked.
    NotificationException = 1,
    /// A plugin failed to process an item.
    PluginException = 2,
    /// An item could not be sent because it is empty or inconsistent.
    InvalidEvent = 3,
    /// The instrumentation key is missing or malformed.
    InvalidInstrumentationKey = 4,
    /// A batch was dropped after a non-retriable failure.
    TransmissionFailed = 5,
    /// The send buffer is full and new items are dropped.
    BufferFull = 6,
    /// The configured sampling percentage is invalid.
    SampleRateOutOfRange = 7,
    /// An item was sampled out.
    TelemetrySampledAndNotSent = 8,
    /// An item violated its contract.
    InvalidEnvelope = 9,
    /// A value exceeded its limit and was truncated.
    StringValueTooLong = 10,
    /// A value was nested too deeply.
    DepthLimitExceeded = 11,
    /// The collector responded with an invalid body.
    InvalidBackendResponse = 12,
    /// The send buffer could not be persisted.
    StorageFailure = 13,
    /// The redirect budget is exhausted.
    RedirectLimitExceeded = 14,
    /// The maximum number of internal messages was reached.
    MessageLimitPerSession = 15,
    /// Sending a batch failed and it will be retried.
    TransmissionRetried = 16,
}

impl MessageId {
    /// Returns the numeric code of the message.
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A diagnostic message queued for internal telemetry.
#[derive(Clone, Debug, PartialEq)]
pub struct DiagnosticMessage {
    /// Severity of the message.
    pub severity: Severity,
    /// The message identifier.
    pub id: MessageId,
    /// Human readable text.
    pub message: String,
    /// Additional context.
    pub properties: Option<Value>,
}

impl DiagnosticMessage {
    /// Converts the message into a trace item.
    pub fn to_item(&self) -> TelemetryItem {
        let text = format!(
            "courier (internal): {} message: {}",
            self.id.code(),
            self.message
        );
        let mut item = TelemetryItem::trace(text, self.severity.as_severity_level());

        if let Some(ref properties) = self.properties {
            let mut data = courier_protocol::Object::new();
            data.insert("properties".to_owned(), properties.clone());
            item.data = Some(data);
        }

        item
    }
}

#[derive(Debug, Default)]
struct State {
    emitted: HashSet<MessageId>,
    queue: Vec<DiagnosticMessage>,
    queued: usize,
}

/// Leveled, throttled logger for pipeline diagnostics.
///
/// Every message goes to the process log. Messages that are not user facing are queued
/// as internal telemetry at most once per [`MessageId`] until [`reset`](Self::reset) is
/// called.
#[derive(Debug)]
pub struct Diagnostics {
    level: DiagnosticLevel,
    max_messages: usize,
    state: Mutex<State>,
}

impl Diagnostics {
    /// Creates a logger queueing messages up to `level`, at most `max_messages` per session.
    pub fn new(level: DiagnosticLevel, max_messages: usize) -> Self {
        Self {
            level,
            max_messages,
            state: Mutex::new(State::default()),
        }
    }

    /// Logs a diagnostic message.
    pub fn log(
        &self,
        severity: Severity,
        id: MessageId,
        message: impl Into<String>,
        properties: Option<Value>,
        is_user_facing: bool,
    ) {
        let message = message.into();
        emit(severity, id, &message, properties.as_ref());

        let mut state = self.state.lock();
        let first = state.emitted.insert(id);

        if !first && !is_user_facing {
            return;
        }

        if !severity.is_enabled(self.level) || state.queued >= self.max_messages {
            return;
        }

        state.queued += 1;
        state.queue.push(DiagnosticMessage {
            severity,
            id,
            message,
            properties,
        });

        if state.queued == self.max_messages {
            let throttled = DiagnosticMessage {
                severity: Severity::Critical,
                id: MessageId::MessageLimitPerSession,
                message: "internal events throttle limit per session reached".to_owned(),
                properties: None,
            };
            emit(throttled.severity, throttled.id, &throttled.message, None);
            state.queue.push(throttled);
        }
    }

    /// Takes all queued messages.
    pub fn drain(&self) -> Vec<DiagnosticMessage> {
        std::mem::take(&mut self.state.lock().queue)
    }

    /// Returns the number of queued messages.
    pub fn queued_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Starts a new session, re-arming throttled messages.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.emitted.clear();
        state.queued = 0;
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(DiagnosticLevel::default(), 25)
    }
}

fn emit(severity: Severity, id: MessageId, message: &str, properties: Option<&Value>) {
    let code = id.code();
    let properties = properties.map(Value::to_string).unwrap_or_default();

    match severity {
        Severity::Critical => courier_log::error!(code, %id, %properties, "{message}"),
        Severity::Warning => courier_log::warn!(code, %id, %properties, "{message}"),
        Severity::Information => courier_log::debug!(code, %id, %properties, "{message}"),
    }
}
