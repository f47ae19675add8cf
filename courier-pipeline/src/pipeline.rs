//! The process-wide entry point of the pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use courier_config::Config;
use courier_protocol::{BaseType, TelemetryItem};
use parking_lot::{Mutex, RwLock};

use crate::diagnostics::Diagnostics;
use crate::notifications::{NotificationListener, NotificationManager, SendRequestReason};
use crate::plugins::{
    ActivePlugins, ChannelController, InitContext, PluginEntry, PluginInitError, find_duplicate,
};

/// Returns `true` if `key` is a GUID in the hyphenated 8-4-4-4-12 format.
///
/// ```
/// use courier_pipeline::is_valid_instrumentation_key;
///
/// assert!(is_valid_instrumentation_key("b1a2c3d4-e5f6-4a7b-8c9d-0e1f2a3b4c5d"));
/// assert!(!is_valid_instrumentation_key("b1a2c3d4e5f64a7b8c9d0e1f2a3b4c5d"));
/// ```
pub fn is_valid_instrumentation_key(key: &str) -> bool {
    key.len() == 36 && uuid::Uuid::try_parse(key).is_ok()
}

/// An error initializing the [`Core`].
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// No instrumentation key is configured.
    #[error("instrumentation key is required")]
    MissingInstrumentationKey,
    /// The instrumentation key is not a GUID.
    #[error("invalid instrumentation key {0:?}")]
    InvalidInstrumentationKey(String),
    /// Two plugins share an identifier.
    #[error("duplicate plugin identifier {0:?}")]
    DuplicatePlugin(String),
    /// No plugin processes telemetry.
    #[error("at least one telemetry plugin is required")]
    NoTelemetryPlugin,
    /// A plugin failed to initialize.
    #[error(transparent)]
    Plugin(#[from] PluginInitError),
}

struct Ready {
    config: Arc<Config>,
    plugins: ActivePlugins,
    diagnostics: Arc<Diagnostics>,
}

impl Ready {
    fn fill_defaults(&self, item: &mut TelemetryItem) {
        if item.ikey.as_deref().is_none_or(str::is_empty) {
            item.ikey = self.config.instrumentation_key().map(str::to_owned);
        }

        if item.base_type.is_none() && item.base_data.is_none() {
            item.base_type = Some(BaseType::Event.to_string());
        }
    }

    fn dispatch(&self, mut item: TelemetryItem) {
        self.fill_defaults(&mut item);
        self.plugins.chain().process(&mut item, &self.diagnostics);
    }

    fn forward_diagnostics(&self) {
        if !self.config.internal_telemetry_enabled() {
            return;
        }

        for message in self.diagnostics.drain() {
            let mut item = message.to_item();
            item.time = Some(Utc::now());
            self.dispatch(item);
        }
    }
}

/// Entry point of the pipeline.
///
/// The core owns the initialized plugins and dispatches tracked items through their chain. Items
/// tracked before a successful [`initialize`](Self::initialize) are queued and dispatched once the
/// core is ready.
pub struct Core {
    ready: RwLock<Option<Arc<Ready>>>,
    pending: Mutex<Vec<TelemetryItem>>,
    enabled: AtomicBool,
    diagnostics: Arc<Diagnostics>,
    notifications: Arc<NotificationManager>,
}

impl Core {
    /// Creates an uninitialized core.
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(None),
            pending: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
            diagnostics: Arc::default(),
            notifications: Arc::new(NotificationManager::new()),
        }
    }

    /// Initializes the core with the given plugins.
    pub fn initialize(&self, config: Arc<Config>, plugins: Vec<PluginEntry>) -> Result<(), CoreError> {
        self.initialize_with_channels(config, plugins, Vec::new())
    }

    /// Initializes the core with plugins and parallel channel groups.
    ///
    /// Each channel group runs as an independent chain behind a [`ChannelController`]. On error,
    /// the core stays uninitialized and keeps queued items. Initializing an initialized core does
    /// nothing.
    pub fn initialize_with_channels(
        &self,
        config: Arc<Config>,
        mut plugins: Vec<PluginEntry>,
        channels: Vec<Vec<PluginEntry>>,
    ) -> Result<(), CoreError> {
        let mut ready = self.ready.write();
        if ready.is_some() {
            courier_log::debug!("core already initialized");
            return Ok(());
        }

        let ikey = config
            .instrumentation_key()
            .ok_or(CoreError::MissingInstrumentationKey)?;
        if !config.instrumentation_key_validation_disabled() && !is_valid_instrumentation_key(ikey)
        {
            return Err(CoreError::InvalidInstrumentationKey(ikey.to_owned()));
        }

        let controller = (!channels.is_empty()).then(|| ChannelController::new(channels));

        let has_telemetry_plugin = plugins.iter().any(PluginEntry::is_telemetry)
            || controller
                .as_ref()
                .is_some_and(ChannelController::has_telemetry_plugin);
        if !has_telemetry_plugin {
            return Err(CoreError::NoTelemetryPlugin);
        }

        let identifiers = plugins
            .iter()
            .map(PluginEntry::identifier)
            .chain(controller.iter().flat_map(ChannelController::identifiers));
        if let Some(duplicate) = find_duplicate(identifiers) {
            return Err(CoreError::DuplicatePlugin(duplicate.to_owned()));
        }

        if let Some(controller) = controller {
            plugins.push(PluginEntry::telemetry(controller));
        }

        let diagnostics = Arc::new(Diagnostics::new(
            config.internal_telemetry_level(),
            config.max_internal_messages(),
        ));

        let context = InitContext {
            config: &config,
            diagnostics: &diagnostics,
            notifications: &self.notifications,
        };
        let plugins = ActivePlugins::initialize(plugins, &context)?;

        courier_log::debug!(chain = ?plugins.chain(), "core initialized");

        self.enabled
            .store(!config.telemetry_disabled(), Ordering::Relaxed);
        *ready = Some(Arc::new(Ready {
            config,
            plugins,
            diagnostics,
        }));
        drop(ready);

        let pending = std::mem::take(&mut *self.pending.lock());
        if !pending.is_empty() {
            courier_log::debug!(count = pending.len(), "dispatching queued items");
        }
        for item in pending {
            self.track(item);
        }

        Ok(())
    }

    fn ready(&self) -> Option<Arc<Ready>> {
        self.ready.read().clone()
    }

    /// Returns `true` once the core was initialized successfully.
    pub fn is_initialized(&self) -> bool {
        self.ready.read().is_some()
    }

    /// Returns the configuration of an initialized core.
    pub fn config(&self) -> Option<Arc<Config>> {
        self.ready().map(|ready| ready.config.clone())
    }

    /// Returns the internal diagnostics.
    pub fn diagnostics(&self) -> Arc<Diagnostics> {
        match self.ready() {
            Some(ready) => ready.diagnostics.clone(),
            None => self.diagnostics.clone(),
        }
    }

    /// Tracks a telemetry item.
    ///
    /// The item is timestamped and dispatched through the plugin chain. Before initialization,
    /// it is queued instead. While telemetry is disabled, the item is dropped.
    pub fn track(&self, mut item: TelemetryItem) {
        if item.time.is_none() {
            item.time = Some(Utc::now());
        }

        let Some(ready) = self.ready() else {
            self.pending.lock().push(item);
            return;
        };

        if !self.enabled.load(Ordering::Relaxed) {
            courier_log::trace!("telemetry disabled, dropping item");
            return;
        }

        ready.dispatch(item);
    }

    /// Returns the number of items queued before initialization.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drops all items queued before initialization and returns their number.
    pub fn discard_pending(&self) -> usize {
        std::mem::take(&mut *self.pending.lock()).len()
    }

    /// Requests all plugins to send buffered data.
    ///
    /// The flush is not awaited. Queued internal diagnostics are tracked first if internal
    /// telemetry is enabled.
    pub fn flush(&self, is_async: bool) {
        if let Some(ready) = self.ready() {
            ready.forward_diagnostics();
            drop(ready.plugins.flush(is_async, SendRequestReason::ManualFlush));
        }
    }

    /// Flushes all plugins and waits until they completed.
    pub async fn flush_and_wait(&self) {
        if let Some(ready) = self.ready() {
            ready.forward_diagnostics();
            ready
                .plugins
                .flush(true, SendRequestReason::ManualFlush)
                .await;
        }
    }

    /// Performs the final flush before shutdown and waits until it completed.
    pub async fn teardown(&self) {
        if let Some(ready) = self.ready() {
            ready.forward_diagnostics();
            ready.plugins.teardown().await;
        }
    }

    /// Enables or disables telemetry at runtime.
    pub fn set_telemetry_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        if let Some(ready) = self.ready() {
            ready.plugins.set_enabled(enabled);
        }
    }

    /// Returns `true` unless telemetry is disabled.
    pub fn telemetry_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Stops sending until [`resume`](Self::resume) is called.
    pub fn pause(&self) {
        if let Some(ready) = self.ready() {
            ready.plugins.pause();
        }
    }

    /// Resumes sending after [`pause`](Self::pause).
    pub fn resume(&self) {
        if let Some(ready) = self.ready() {
            ready.plugins.resume();
        }
    }

    /// Registers a listener for sender notifications.
    pub fn add_notification_listener(&self, listener: Arc<dyn NotificationListener>) {
        self.notifications.add_listener(listener);
    }

    /// Unregisters a listener. Returns `false` if it was not registered.
    pub fn remove_notification_listener(&self, listener: &Arc<dyn NotificationListener>) -> bool {
        self.notifications.remove_listener(listener)
    }
}

impl Default for Core {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::diagnostics::{MessageId, Severity};
    use crate::testutils::{CapturePlugin, TEST_IKEY, test_config};

    #[test]
    fn test_instrumentation_key_format() {
        assert!(is_valid_instrumentation_key(TEST_IKEY));
        assert!(is_valid_instrumentation_key(
            "B1A2C3D4-E5F6-4A7B-8C9D-0E1F2A3B4C5D"
        ));
        assert!(!is_valid_instrumentation_key(""));
        assert!(!is_valid_instrumentation_key("not-a-key"));
        assert!(!is_valid_instrumentation_key(
            "{b1a2c3d4-e5f6-4a7b-8c9d-0e1f2a3b4c5d}"
        ));
        assert!(!is_valid_instrumentation_key(
            "g1a2c3d4-e5f6-4a7b-8c9d-0e1f2a3b4c5d"
        ));
    }

    #[test]
    fn test_queue_until_initialized() {
        let core = Core::new();
        core.track(TelemetryItem::event("early"));
        core.track(TelemetryItem::event("earlier"));
        assert_eq!(core.pending_count(), 2);

        let plugin = CapturePlugin::new("capture", 100);
        let captured = plugin.captured();
        core.initialize(test_config(json!({})), vec![PluginEntry::telemetry(plugin)])
            .unwrap();

        assert_eq!(core.pending_count(), 0);
        let names: Vec<_> = captured.items().into_iter().map(|i| i.name).collect();
        assert_eq!(names, ["early", "earlier"]);

        let first = &captured.items()[0];
        assert_eq!(first.ikey.as_deref(), Some(TEST_IKEY));
        assert!(first.time.is_some());
    }

    #[test]
    fn test_failed_initialization_keeps_queue() {
        let core = Core::new();
        core.track(TelemetryItem::event("queued"));

        let missing = core.initialize(
            test_config(json!({"core": {"instrumentation_key": null}})),
            vec![PluginEntry::telemetry(CapturePlugin::new("capture", 1))],
        );
        assert!(matches!(missing, Err(CoreError::MissingInstrumentationKey)));

        let invalid = core.initialize(
            test_config(json!({"core": {"instrumentation_key": "abc"}})),
            vec![PluginEntry::telemetry(CapturePlugin::new("capture", 1))],
        );
        assert!(matches!(invalid, Err(CoreError::InvalidInstrumentationKey(_))));

        let no_telemetry = core.initialize(
            test_config(json!({})),
            vec![PluginEntry::extension(CapturePlugin::new("capture", 1))],
        );
        assert!(matches!(no_telemetry, Err(CoreError::NoTelemetryPlugin)));

        let duplicate = core.initialize(
            test_config(json!({})),
            vec![
                PluginEntry::telemetry(CapturePlugin::new("capture", 1)),
                PluginEntry::telemetry(CapturePlugin::new("capture", 2)),
            ],
        );
        assert!(matches!(duplicate, Err(CoreError::DuplicatePlugin(id)) if id == "capture"));

        assert!(!core.is_initialized());
        assert_eq!(core.pending_count(), 1);
        assert_eq!(core.discard_pending(), 1);
    }

    #[test]
    fn test_validation_can_be_disabled() {
        let core = Core::new();
        let config = test_config(json!({
            "core": {
                "instrumentation_key": "custom-key",
                "disable_instrumentation_key_validation": true,
            }
        }));

        core.initialize(
            config,
            vec![PluginEntry::telemetry(CapturePlugin::new("capture", 1))],
        )
        .unwrap();
        assert!(core.is_initialized());
    }

    #[test]
    fn test_reinitialize_is_noop() {
        let core = Core::new();
        let first = CapturePlugin::new("first", 1);
        let captured = first.captured();
        core.initialize(test_config(json!({})), vec![PluginEntry::telemetry(first)])
            .unwrap();

        let second = CapturePlugin::new("second", 1);
        let ignored = second.captured();
        core.initialize(test_config(json!({})), vec![PluginEntry::telemetry(second)])
            .unwrap();

        core.track(TelemetryItem::event("e"));
        assert_eq!(captured.len(), 1);
        assert!(ignored.is_empty());
    }

    #[test]
    fn test_disabled_telemetry_is_dropped() {
        let core = Core::new();
        let plugin = CapturePlugin::new("capture", 1);
        let captured = plugin.captured();
        core.initialize(test_config(json!({})), vec![PluginEntry::telemetry(plugin)])
            .unwrap();

        core.set_telemetry_enabled(false);
        core.track(TelemetryItem::event("dropped"));
        core.set_telemetry_enabled(true);
        core.track(TelemetryItem::event("kept"));

        let names: Vec<_> = captured.items().into_iter().map(|i| i.name).collect();
        assert_eq!(names, ["kept"]);
        assert_eq!(captured.lifecycle(), ["set_enabled(false)", "set_enabled(true)"]);
    }

    #[test]
    fn test_default_base_type() {
        let core = Core::new();
        let plugin = CapturePlugin::new("capture", 1);
        let captured = plugin.captured();
        core.initialize(test_config(json!({})), vec![PluginEntry::telemetry(plugin)])
            .unwrap();

        core.track(TelemetryItem {
            name: "bare".to_owned(),
            ..Default::default()
        });

        assert_eq!(
            captured.items()[0].base_type.as_deref(),
            Some("EventData")
        );
    }

    #[test]
    fn test_channels_receive_copies() {
        let core = Core::new();
        let main = CapturePlugin::new("main", 1000);
        let left = CapturePlugin::new("left", 1).tagging("channel", "left");
        let right = CapturePlugin::new("right", 1).tagging("channel", "right");
        let (main_items, left_items, right_items) =
            (main.captured(), left.captured(), right.captured());

        core.initialize_with_channels(
            test_config(json!({})),
            vec![PluginEntry::telemetry(main)],
            vec![
                vec![PluginEntry::telemetry(left)],
                vec![PluginEntry::telemetry(right)],
            ],
        )
        .unwrap();

        core.track(TelemetryItem::event("fan-out"));

        assert_eq!(left_items.len(), 1);
        assert_eq!(right_items.len(), 1);
        assert_eq!(main_items.len(), 1);
        assert_eq!(main_items.items()[0].tag("channel"), None);
    }

    #[test]
    fn test_duplicate_across_channels() {
        let core = Core::new();
        let result = core.initialize_with_channels(
            test_config(json!({})),
            vec![PluginEntry::telemetry(CapturePlugin::new("shared", 1))],
            vec![vec![PluginEntry::telemetry(CapturePlugin::new("shared", 1))]],
        );

        assert!(matches!(result, Err(CoreError::DuplicatePlugin(_))));
    }

    #[test]
    fn test_forwards_internal_diagnostics() {
        let core = Core::new();
        let plugin = CapturePlugin::new("capture", 1);
        let captured = plugin.captured();
        let config = test_config(json!({
            "core": {
                "enable_internal_telemetry": true,
                "internal_telemetry_level": "warning",
            }
        }));
        core.initialize(config, vec![PluginEntry::telemetry(plugin)])
            .unwrap();

        core.diagnostics().log(
            Severity::Warning,
            MessageId::BufferFull,
            "maximum buffer size reached",
            None,
            true,
        );
        core.flush(true);

        let items = captured.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].base_type.as_deref(), Some("MessageData"));
        assert_eq!(captured.lifecycle(), ["flush(manual_flush)"]);
    }

    #[tokio::test]
    async fn test_lifecycle_forwarded() {
        let core = Core::new();
        let plugin = CapturePlugin::new("capture", 1);
        let captured = plugin.captured();
        core.initialize(test_config(json!({})), vec![PluginEntry::telemetry(plugin)])
            .unwrap();

        core.pause();
        core.resume();
        core.flush_and_wait().await;
        core.teardown().await;

        assert_eq!(
            captured.lifecycle(),
            ["pause", "resume", "flush(manual_flush)", "teardown"]
        );
    }
}
