//! The terminal plugin delivering telemetry to the collector.
//!
//! [`SenderPlugin`] samples every item, builds its envelope and hands the serialized envelope to
//! the [`TelemetrySenderService`]. The service owns the [`SendBuffer`], the batch timer and the
//! retry state, and runs on its own task. All buffer state changes happen inside the service, so
//! concurrent flushes triggered by the timer and by the producer are serialized.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use courier_config::Config;
use courier_log::LogError;
use courier_protocol::{
    BaseType, ContractViolation, Envelope, EnvelopeContext, SampleRate, TelemetryItem,
};
use courier_sampling::{Sampler, is_valid_percentage};
use courier_system::{Addr, Service};
use futures::future::BoxFuture;
use serde_json::json;

use crate::diagnostics::{Diagnostics, MessageId, Severity};
use crate::notifications::{DiscardReason, NotificationManager, SendRequestReason};
use crate::pipeline::is_valid_instrumentation_key;
use crate::plugins::{InitContext, Plugin, PluginError, ProcessContext, TelemetryPlugin};
use crate::services::buffer::{FileStorage, MemoryStorage, SendBuffer, StorageProvider};
use crate::services::transport::Transports;

mod backoff;
mod response;
mod service;

pub use self::backoff::*;
pub use self::response::*;
pub use self::service::*;

/// Identifier of the [`SenderPlugin`].
pub const SENDER_ID: &str = "CourierSender";

/// Priority of the [`SenderPlugin`]. It runs after all processing plugins.
pub const SENDER_PRIORITY: u32 = 1001;

/// Terminal plugin that samples, serializes and sends telemetry.
pub struct SenderPlugin {
    addr: Option<Addr<TelemetrySender>>,
    enabled: Arc<AtomicBool>,
    sampler: Sampler,
    default_ikey: String,
    diagnostics: Arc<Diagnostics>,
    notifications: Arc<NotificationManager>,
    transports: Option<Transports>,
    storage: Option<Arc<dyn StorageProvider>>,
    retry: Option<RetryState>,
}

impl SenderPlugin {
    /// Creates the plugin. The transports are selected on initialization.
    pub fn new() -> Self {
        Self {
            addr: None,
            enabled: Arc::new(AtomicBool::new(true)),
            sampler: Sampler::default(),
            default_ikey: String::new(),
            diagnostics: Arc::default(),
            notifications: Arc::default(),
            transports: None,
            storage: None,
            retry: None,
        }
    }

    /// Uses the given transports instead of detecting them.
    pub fn with_transports(mut self, transports: Transports) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Persists the send buffer to the given storage if storage is enabled.
    pub fn with_storage(mut self, storage: Arc<dyn StorageProvider>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Replaces the retry state of the service.
    pub fn with_retry(mut self, retry: RetryState) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Returns the address of the running service.
    ///
    /// This is `None` before the plugin was initialized.
    pub fn addr(&self) -> Option<&Addr<TelemetrySender>> {
        self.addr.as_ref()
    }

    fn open_buffer(&mut self, config: &Config) -> SendBuffer {
        let max_items = config.buffer_max_items();
        let diagnostics = self.diagnostics.clone();

        if !config.storage_enabled() {
            return SendBuffer::new(max_items, diagnostics);
        }

        let provider: Arc<dyn StorageProvider> = match (self.storage.take(), config.storage_path())
        {
            (Some(provider), _) => provider,
            (None, Some(path)) => match FileStorage::open(path) {
                Ok(storage) => Arc::new(storage),
                Err(error) => {
                    self.diagnostics.log(
                        Severity::Warning,
                        MessageId::StorageFailure,
                        format!("cannot open storage, buffering in memory: {}", LogError(&error)),
                        Some(json!({ "path": path.display().to_string() })),
                        true,
                    );
                    Arc::new(MemoryStorage::new())
                }
            },
            (None, None) => Arc::new(MemoryStorage::new()),
        };

        SendBuffer::with_storage(max_items, provider, config.storage_prefix(), diagnostics)
    }

    fn invalid_event(&self, message: &str) {
        self.diagnostics.log(
            Severity::Critical,
            MessageId::InvalidEvent,
            message,
            None,
            true,
        );
        self.notifications
            .events_discarded(1, DiscardReason::InvalidEvent);
    }

    fn report_violations(&self, violations: &[ContractViolation]) {
        for violation in violations {
            let (severity, id) = match violation {
                ContractViolation::MissingRequired { .. }
                | ContractViolation::InvalidType { .. }
                | ContractViolation::UnknownBaseType(_) => {
                    (Severity::Warning, MessageId::InvalidEnvelope)
                }
                ContractViolation::Truncated { .. } | ContractViolation::KeyTruncated { .. } => {
                    (Severity::Warning, MessageId::StringValueTooLong)
                }
                ContractViolation::DepthExceeded { .. } => {
                    (Severity::Critical, MessageId::DepthLimitExceeded)
                }
            };

            self.diagnostics
                .log(severity, id, violation.to_string(), None, false);
        }
    }
}

impl Default for SenderPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for SenderPlugin {
    fn identifier(&self) -> &str {
        SENDER_ID
    }

    fn priority(&self) -> u32 {
        SENDER_PRIORITY
    }

    fn initialize(&mut self, context: &InitContext<'_>) -> Result<(), PluginError> {
        let config = context.config;
        self.diagnostics = context.diagnostics.clone();
        self.notifications = context.notifications.clone();

        let ikey = config.instrumentation_key().unwrap_or_default();
        if !config.instrumentation_key_validation_disabled() && !is_valid_instrumentation_key(ikey)
        {
            self.diagnostics.log(
                Severity::Critical,
                MessageId::InvalidInstrumentationKey,
                "invalid instrumentation key",
                Some(json!({ "instrumentation_key": ikey })),
                true,
            );
            return Err(PluginError::Initialization(format!(
                "invalid instrumentation key {ikey:?}"
            )));
        }
        self.default_ikey = ikey.to_owned();

        if let Some(percentage) = config.sampling_percentage() {
            if !is_valid_percentage(percentage) {
                self.diagnostics.log(
                    Severity::Warning,
                    MessageId::SampleRateOutOfRange,
                    "sampling percentage must be in (0, 100], keeping all telemetry",
                    Some(json!({ "percentage": percentage })),
                    true,
                );
            }
        }
        self.sampler = Sampler::new(config.sampling_percentage());

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(PluginError::Initialization(
                "the sender requires a tokio runtime".to_owned(),
            ));
        }

        let transports = match self.transports.take() {
            Some(transports) => transports,
            None => Transports::from_config(config)
                .map_err(|error| PluginError::Initialization(LogError(&error).to_string()))?,
        };

        let buffer = self.open_buffer(config);
        let enabled = !config.telemetry_disabled();
        self.enabled.store(enabled, Ordering::Relaxed);

        let mut service = TelemetrySenderService::new(
            config,
            buffer,
            transports,
            self.enabled.clone(),
            self.diagnostics.clone(),
            self.notifications.clone(),
        )
        .map_err(|error| PluginError::Initialization(LogError(&error).to_string()))?;
        if let Some(retry) = self.retry.take() {
            service = service.with_retry(retry);
        }

        self.addr = Some(service.start_detached());
        Ok(())
    }

    fn flush(&self, is_async: bool, reason: SendRequestReason) -> BoxFuture<'static, ()> {
        let Some(ref addr) = self.addr else {
            return Box::pin(async {});
        };

        let request = addr.send(FlushBuffer { is_async, reason });
        Box::pin(async move {
            request.await.ok();
        })
    }

    fn teardown(&self) -> BoxFuture<'static, ()> {
        let Some(ref addr) = self.addr else {
            return Box::pin(async {});
        };

        let request = addr.send(Teardown);
        Box::pin(async move {
            request.await.ok();
        })
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn pause(&self) {
        if let Some(ref addr) = self.addr {
            addr.send(Pause);
        }
    }

    fn resume(&self) {
        if let Some(ref addr) = self.addr {
            addr.send(Resume);
        }
    }
}

impl TelemetryPlugin for SenderPlugin {
    fn process_telemetry(
        &self,
        item: &mut TelemetryItem,
        context: &mut ProcessContext<'_>,
    ) -> Result<(), PluginError> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }

        let Some(ref addr) = self.addr else {
            return Err(PluginError::Processing(
                "sender is not initialized".to_owned(),
            ));
        };

        if item.is_empty() {
            self.invalid_event("cannot send empty telemetry");
            return Ok(());
        }

        if item.base_type.is_none() && item.base_data.is_some() {
            self.invalid_event("cannot send telemetry with baseData but without baseType");
            return Ok(());
        }

        if item.base_type.is_none() {
            item.base_type = Some(BaseType::Event.to_string());
        }

        if !self.sampler.is_sampled_in(item) {
            self.diagnostics.log(
                Severity::Information,
                MessageId::TelemetrySampledAndNotSent,
                "telemetry item was sampled out and not sent",
                Some(json!({ "percentage": self.sampler.percentage() })),
                false,
            );
            self.notifications
                .events_discarded(1, DiscardReason::Sampled);
            return Ok(());
        }

        let envelope_context = EnvelopeContext {
            default_ikey: &self.default_ikey,
            sample_rate: SampleRate::new(self.sampler.percentage()).unwrap_or_default(),
        };

        let envelope = match Envelope::from_item(item, &envelope_context) {
            Ok(envelope) => envelope,
            Err(violations) => {
                let (envelope, violations) = violations.into_parts();
                self.report_violations(&violations);
                envelope
            }
        };

        match envelope.to_json() {
            Ok(payload) => addr.send(EnqueuePayload(payload)),
            Err(error) => {
                self.invalid_event(&format!(
                    "cannot serialize envelope: {}",
                    LogError(&error)
                ));
                return Ok(());
            }
        }

        context.process_next(item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_protocol::{Object, UserExt};
    use serde_json::Value;

    use super::*;
    use crate::plugins::PluginChain;
    use crate::testutils::{MockTransport, RecordingListener, TEST_IKEY, test_config};

    struct Setup {
        chain: PluginChain,
        plugin: Arc<SenderPlugin>,
        transport: Arc<MockTransport>,
        listener: Arc<RecordingListener>,
        diagnostics: Arc<Diagnostics>,
    }

    fn setup(config: Value) -> Setup {
        let config = test_config(config);
        let diagnostics = Arc::new(Diagnostics::new(config.internal_telemetry_level(), 25));
        let notifications = Arc::new(NotificationManager::new());
        let listener = Arc::new(RecordingListener::default());
        notifications.add_listener(listener.clone());

        let transport = Arc::new(MockTransport::new());
        let mut plugin = SenderPlugin::new().with_transports(Transports::new(transport.clone()));
        plugin
            .initialize(&InitContext {
                config: &config,
                diagnostics: &diagnostics,
                notifications: &notifications,
            })
            .unwrap();

        let plugin = Arc::new(plugin);
        Setup {
            chain: PluginChain::new(vec![plugin.clone()]),
            plugin,
            transport,
            listener,
            diagnostics,
        }
    }

    fn envelopes(transport: &MockTransport) -> Vec<Value> {
        transport
            .bodies()
            .iter()
            .flat_map(|body| serde_json::from_str::<Vec<Value>>(body).unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_envelopes() {
        let s = setup(serde_json::json!({}));

        let mut item = TelemetryItem::event("clicked");
        s.chain.process(&mut item, &s.diagnostics);
        s.plugin.flush(true, SendRequestReason::ManualFlush).await;

        let envelopes = envelopes(&s.transport);
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0]["iKey"], TEST_IKEY);
        assert_eq!(envelopes[0]["data"]["baseType"], "EventData");
        assert_eq!(envelopes[0]["data"]["baseData"]["name"], "clicked");
        assert_eq!(s.listener.sent(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_invalid_items() {
        let s = setup(serde_json::json!({}));

        let mut empty = TelemetryItem::default();
        s.chain.process(&mut empty, &s.diagnostics);

        let mut untyped = TelemetryItem {
            name: "untyped".to_owned(),
            base_data: Some(Object::new()),
            ..Default::default()
        };
        s.chain.process(&mut untyped, &s.diagnostics);

        s.plugin.flush(false, SendRequestReason::ManualFlush).await;

        assert_eq!(s.transport.request_count(), 0);
        assert_eq!(s.listener.discarded(DiscardReason::InvalidEvent), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_drops_and_tags_rate() {
        let s = setup(serde_json::json!({"sampling": {"percentage": 50.0}}));

        let mut kept = 0;
        for i in 0..50 {
            let mut item = TelemetryItem::event("sampled");
            item.ext.user = Some(UserExt {
                id: Some(format!("user-{i}")),
                ..Default::default()
            });
            s.chain.process(&mut item, &s.diagnostics);
        }

        s.plugin.flush(true, SendRequestReason::ManualFlush).await;

        for envelope in envelopes(&s.transport) {
            assert_eq!(envelope["sampleRate"], 50.0);
            kept += 1;
        }

        let dropped = s.listener.discarded(DiscardReason::Sampled);
        assert_eq!(kept + dropped, 50);
        assert!(kept > 0 && dropped > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_drops_silently() {
        let s = setup(serde_json::json!({}));
        s.plugin.set_enabled(false);

        let mut item = TelemetryItem::event("e");
        s.chain.process(&mut item, &s.diagnostics);
        s.plugin.flush(true, SendRequestReason::ManualFlush).await;

        assert_eq!(s.transport.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_timer() {
        let s = setup(serde_json::json!({"sender": {"max_batch_interval_ms": 1000}}));

        let mut item = TelemetryItem::trace("hello", courier_protocol::SeverityLevel::Warning);
        s.chain.process(&mut item, &s.diagnostics);

        tokio::time::sleep(Duration::from_millis(1500)).await;

        let envelopes = envelopes(&s.transport);
        assert_eq!(envelopes[0]["data"]["baseType"], "MessageData");
        assert_eq!(envelopes[0]["data"]["baseData"]["message"], "hello");
    }

    #[tokio::test]
    async fn test_invalid_instrumentation_key() {
        let config = test_config(serde_json::json!({"core": {"instrumentation_key": "abc"}}));
        let diagnostics = Arc::new(Diagnostics::default());
        let notifications = Arc::new(NotificationManager::new());

        let mut plugin = SenderPlugin::new()
            .with_transports(Transports::new(Arc::new(MockTransport::new())));
        let result = plugin.initialize(&InitContext {
            config: &config,
            diagnostics: &diagnostics,
            notifications: &notifications,
        });

        assert!(matches!(result, Err(PluginError::Initialization(_))));
        assert!(plugin.addr().is_none());
    }

    #[test]
    fn test_requires_runtime() {
        let config = test_config(serde_json::json!({}));
        let diagnostics = Arc::new(Diagnostics::default());
        let notifications = Arc::new(NotificationManager::new());

        let mut plugin = SenderPlugin::new();
        let result = plugin.initialize(&InitContext {
            config: &config,
            diagnostics: &diagnostics,
            notifications: &notifications,
        });

        assert!(matches!(result, Err(PluginError::Initialization(_))));
    }
}
