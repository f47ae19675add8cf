use std::collections::BTreeSet;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use courier_protocol::TelemetryItem;
use futures::future::{self, BoxFuture};

use crate::diagnostics::{Diagnostics, MessageId, Severity};
use crate::notifications::SendRequestReason;
use crate::plugins::{InitContext, Plugin, PluginError, TelemetryPlugin};

/// A plugin before initialization.
pub enum PluginEntry {
    /// A plugin taking part in telemetry processing.
    Telemetry(Box<dyn TelemetryPlugin>),
    /// A plugin that only participates in the lifecycle.
    Extension(Box<dyn Plugin>),
}

impl PluginEntry {
    /// Wraps a telemetry plugin.
    pub fn telemetry(plugin: impl TelemetryPlugin + 'static) -> Self {
        Self::Telemetry(Box::new(plugin))
    }

    /// Wraps an extension plugin.
    pub fn extension(plugin: impl Plugin + 'static) -> Self {
        Self::Extension(Box::new(plugin))
    }

    /// Returns the identifier of the plugin.
    pub fn identifier(&self) -> &str {
        match self {
            Self::Telemetry(plugin) => plugin.identifier(),
            Self::Extension(plugin) => plugin.identifier(),
        }
    }

    /// Returns `true` if the plugin processes telemetry.
    pub fn is_telemetry(&self) -> bool {
        matches!(self, Self::Telemetry(_))
    }

    /// Telemetry plugins run first in ascending priority, extensions keep their order.
    fn sort_key(&self) -> (u8, u32) {
        match self {
            Self::Telemetry(plugin) => (0, plugin.priority()),
            Self::Extension(_) => (1, 0),
        }
    }

    fn initialize(&mut self, context: &InitContext<'_>) -> Result<(), PluginError> {
        match self {
            Self::Telemetry(plugin) => plugin.initialize(context),
            Self::Extension(plugin) => plugin.initialize(context),
        }
    }
}

impl fmt::Debug for PluginEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_telemetry() {
            "Telemetry"
        } else {
            "Extension"
        };
        f.debug_tuple(kind).field(&self.identifier()).finish()
    }
}

/// Sorts plugins into dispatch order.
///
/// Telemetry plugins come first in ascending priority, followed by extensions. The sort is stable,
/// so plugins with equal priority keep their insertion order.
pub fn sort_plugins(entries: &mut [PluginEntry]) {
    entries.sort_by_key(PluginEntry::sort_key);
}

/// Returns the first identifier that occurs more than once.
pub fn find_duplicate<'a>(identifiers: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    let mut seen = BTreeSet::new();
    identifiers.into_iter().find(|id| !seen.insert(*id))
}

/// A plugin failed to initialize.
#[derive(Debug, thiserror::Error)]
#[error("plugin {identifier} failed to initialize")]
pub struct PluginInitError {
    /// Identifier of the failing plugin.
    pub identifier: String,
    /// The error raised by the plugin.
    #[source]
    pub source: PluginError,
}

#[derive(Clone)]
enum ActivePlugin {
    Telemetry(Arc<dyn TelemetryPlugin>),
    Extension(Arc<dyn Plugin>),
}

impl ActivePlugin {
    fn flush(&self, is_async: bool, reason: SendRequestReason) -> BoxFuture<'static, ()> {
        match self {
            Self::Telemetry(plugin) => plugin.flush(is_async, reason),
            Self::Extension(plugin) => plugin.flush(is_async, reason),
        }
    }

    fn teardown(&self) -> BoxFuture<'static, ()> {
        match self {
            Self::Telemetry(plugin) => plugin.teardown(),
            Self::Extension(plugin) => plugin.teardown(),
        }
    }

    fn set_enabled(&self, enabled: bool) {
        match self {
            Self::Telemetry(plugin) => plugin.set_enabled(enabled),
            Self::Extension(plugin) => plugin.set_enabled(enabled),
        }
    }

    fn pause(&self) {
        match self {
            Self::Telemetry(plugin) => plugin.pause(),
            Self::Extension(plugin) => plugin.pause(),
        }
    }

    fn resume(&self) {
        match self {
            Self::Telemetry(plugin) => plugin.resume(),
            Self::Extension(plugin) => plugin.resume(),
        }
    }
}

/// Initialized plugins in dispatch order.
#[derive(Clone)]
pub struct ActivePlugins {
    plugins: Vec<ActivePlugin>,
    chain: PluginChain,
}

impl ActivePlugins {
    /// Sorts and initializes plugins.
    ///
    /// Initialization stops at the first failing plugin.
    pub fn initialize(
        mut entries: Vec<PluginEntry>,
        context: &InitContext<'_>,
    ) -> Result<Self, PluginInitError> {
        sort_plugins(&mut entries);

        let mut plugins = Vec::with_capacity(entries.len());
        let mut nodes = Vec::new();

        for mut entry in entries {
            entry.initialize(context).map_err(|source| PluginInitError {
                identifier: entry.identifier().to_owned(),
                source,
            })?;

            courier_log::trace!(plugin = entry.identifier(), "plugin initialized");

            match entry {
                PluginEntry::Telemetry(plugin) => {
                    let plugin: Arc<dyn TelemetryPlugin> = Arc::from(plugin);
                    nodes.push(plugin.clone());
                    plugins.push(ActivePlugin::Telemetry(plugin));
                }
                PluginEntry::Extension(plugin) => {
                    plugins.push(ActivePlugin::Extension(Arc::from(plugin)));
                }
            }
        }

        Ok(Self {
            plugins,
            chain: PluginChain::new(nodes),
        })
    }

    /// Returns the chain of telemetry plugins.
    pub fn chain(&self) -> &PluginChain {
        &self.chain
    }

    /// Returns the number of plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Returns `true` if there are no plugins.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Flushes all plugins and returns a future that resolves once all completed.
    pub fn flush(&self, is_async: bool, reason: SendRequestReason) -> BoxFuture<'static, ()> {
        let flushes: Vec<_> = self
            .plugins
            .iter()
            .map(|p| p.flush(is_async, reason))
            .collect();
        Box::pin(async move {
            future::join_all(flushes).await;
        })
    }

    /// Tears down all plugins.
    pub fn teardown(&self) -> BoxFuture<'static, ()> {
        let teardowns: Vec<_> = self.plugins.iter().map(ActivePlugin::teardown).collect();
        Box::pin(async move {
            future::join_all(teardowns).await;
        })
    }

    /// Enables or disables telemetry on all plugins.
    pub fn set_enabled(&self, enabled: bool) {
        self.plugins.iter().for_each(|p| p.set_enabled(enabled));
    }

    /// Pauses all plugins.
    pub fn pause(&self) {
        self.plugins.iter().for_each(ActivePlugin::pause);
    }

    /// Resumes all plugins.
    pub fn resume(&self) {
        self.plugins.iter().for_each(ActivePlugin::resume);
    }
}

impl fmt::Debug for ActivePlugins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivePlugins")
            .field("len", &self.plugins.len())
            .field("chain", &self.chain)
            .finish()
    }
}

/// An immutable, ordered chain of telemetry plugins.
///
/// Cloning the chain is cheap and shares the plugins.
#[derive(Clone)]
pub struct PluginChain {
    nodes: Arc<[Arc<dyn TelemetryPlugin>]>,
}

impl PluginChain {
    /// Creates a chain from plugins already in dispatch order.
    pub fn new(nodes: Vec<Arc<dyn TelemetryPlugin>>) -> Self {
        Self {
            nodes: nodes.into(),
        }
    }

    /// Returns the number of plugins in the chain.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the chain has no plugins.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the identifiers of the plugins in dispatch order.
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|node| node.identifier())
    }

    /// Dispatches an item through the chain.
    pub fn process(&self, item: &mut TelemetryItem, diagnostics: &Diagnostics) {
        ProcessContext::new(&self.nodes, diagnostics).process_next(item);
    }
}

impl fmt::Debug for PluginChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.identifiers()).finish()
    }
}

/// The position of one item in a [`PluginChain`].
///
/// A context is created per item and moves forward only. Every plugin runs at most once for the
/// item within the same context.
pub struct ProcessContext<'a> {
    nodes: &'a [Arc<dyn TelemetryPlugin>],
    next: usize,
    executed: Vec<bool>,
    diagnostics: &'a Diagnostics,
}

impl<'a> ProcessContext<'a> {
    /// Creates a context positioned at the first plugin.
    pub fn new(nodes: &'a [Arc<dyn TelemetryPlugin>], diagnostics: &'a Diagnostics) -> Self {
        Self {
            nodes,
            next: 0,
            executed: vec![false; nodes.len()],
            diagnostics,
        }
    }

    /// Returns the diagnostics logger.
    pub fn diagnostics(&self) -> &'a Diagnostics {
        self.diagnostics
    }

    /// Returns `true` if there are plugins left to run.
    pub fn has_next(&self) -> bool {
        self.next < self.nodes.len()
    }

    /// Returns the identifier of the plugin that runs next.
    pub fn next_identifier(&self) -> Option<&'a str> {
        let nodes = self.nodes;
        nodes.get(self.next).map(|node| node.identifier())
    }

    /// Creates an independent context positioned at the plugin with the given identifier.
    ///
    /// The current context is not affected. Returns `None` if no plugin has the identifier.
    pub fn create_from(&self, identifier: &str) -> Option<ProcessContext<'a>> {
        let nodes = self.nodes;
        let start = nodes.iter().position(|n| n.identifier() == identifier)?;
        Some(ProcessContext::new(&nodes[start..], self.diagnostics))
    }

    /// Runs the next plugin on the item.
    ///
    /// Returns `false` if the end of the chain was reached.
    pub fn process_next(&mut self, item: &mut TelemetryItem) -> bool {
        let index = self.next;
        let nodes = self.nodes;
        let Some(plugin) = nodes.get(index) else {
            return false;
        };

        self.next = index + 1;
        self.executed[index] = true;

        let result = catch_unwind(AssertUnwindSafe(|| {
            plugin.process_telemetry(item, self)
        }));

        let failure = match result {
            Ok(Ok(())) => return true,
            Ok(Err(error)) => error.to_string(),
            Err(payload) => panic_message(payload.as_ref()),
        };

        self.diagnostics.log(
            Severity::Critical,
            MessageId::PluginException,
            format!("plugin [{}] failed: {failure}", plugin.identifier()),
            None,
            false,
        );

        let following = index + 1;
        if following < nodes.len() && !self.executed[following] {
            self.next = following;
            self.process_next(item);
        }

        true
    }
}

impl fmt::Debug for ProcessContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessContext")
            .field("next", &self.next_identifier())
            .field("executed", &self.executed)
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "plugin panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    enum Behavior {
        Forward,
        Stop,
        Fail,
        Panic,
        FailAfterForward,
    }

    struct Recorder {
        id: &'static str,
        priority: u32,
        behavior: Behavior,
        log: Log,
    }

    impl Recorder {
        fn entry(id: &'static str, priority: u32, behavior: Behavior, log: &Log) -> PluginEntry {
            PluginEntry::telemetry(Self {
                id,
                priority,
                behavior,
                log: log.clone(),
            })
        }
    }

    impl Plugin for Recorder {
        fn identifier(&self) -> &str {
            self.id
        }

        fn priority(&self) -> u32 {
            self.priority
        }
    }

    impl TelemetryPlugin for Recorder {
        fn process_telemetry(
            &self,
            item: &mut TelemetryItem,
            context: &mut ProcessContext<'_>,
        ) -> Result<(), PluginError> {
            self.log.lock().push(self.id.to_owned());
            item.set_tag("visited", self.id);

            match self.behavior {
                Behavior::Forward => {
                    context.process_next(item);
                    Ok(())
                }
                Behavior::Stop => Ok(()),
                Behavior::Fail => Err(PluginError::Processing("boom".to_owned())),
                Behavior::Panic => panic!("plugin panicked on purpose"),
                Behavior::FailAfterForward => {
                    context.process_next(item);
                    Err(PluginError::Processing("late".to_owned()))
                }
            }
        }
    }

    struct Extension(&'static str);

    impl Plugin for Extension {
        fn identifier(&self) -> &str {
            self.0
        }

        fn priority(&self) -> u32 {
            0
        }
    }

    fn chain(entries: Vec<PluginEntry>) -> PluginChain {
        let config = Arc::new(courier_config::Config::default());
        let diagnostics = Arc::new(Diagnostics::default());
        let notifications = Arc::new(crate::notifications::NotificationManager::new());
        let context = InitContext {
            config: &config,
            diagnostics: &diagnostics,
            notifications: &notifications,
        };

        ActivePlugins::initialize(entries, &context)
            .unwrap()
            .chain()
            .clone()
    }

    fn run(chain: &PluginChain) {
        let diagnostics = Diagnostics::default();
        chain.process(&mut TelemetryItem::event("e"), &diagnostics);
    }

    #[test]
    fn test_sort_order() {
        let log = Log::default();
        let mut entries = vec![
            PluginEntry::extension(Extension("ext-a")),
            Recorder::entry("c", 300, Behavior::Forward, &log),
            Recorder::entry("a1", 100, Behavior::Forward, &log),
            PluginEntry::extension(Extension("ext-b")),
            Recorder::entry("a2", 100, Behavior::Forward, &log),
            Recorder::entry("b", 200, Behavior::Forward, &log),
        ];

        sort_plugins(&mut entries);

        let order: Vec<_> = entries.iter().map(PluginEntry::identifier).collect();
        assert_eq!(order, ["a1", "a2", "b", "c", "ext-a", "ext-b"]);
    }

    #[test]
    fn test_dispatch_in_priority_order() {
        let log = Log::default();
        let chain = chain(vec![
            Recorder::entry("sender", 1000, Behavior::Stop, &log),
            Recorder::entry("first", 10, Behavior::Forward, &log),
            Recorder::entry("second", 20, Behavior::Forward, &log),
        ]);

        run(&chain);
        assert_eq!(*log.lock(), ["first", "second", "sender"]);
    }

    #[test]
    fn test_veto_stops_processing() {
        let log = Log::default();
        let chain = chain(vec![
            Recorder::entry("veto", 10, Behavior::Stop, &log),
            Recorder::entry("sender", 1000, Behavior::Stop, &log),
        ]);

        run(&chain);
        assert_eq!(*log.lock(), ["veto"]);
    }

    #[test]
    fn test_error_continues_with_next() {
        courier_log::init_test!();

        let log = Log::default();
        let chain = chain(vec![
            Recorder::entry("failing", 10, Behavior::Fail, &log),
            Recorder::entry("panicking", 20, Behavior::Panic, &log),
            Recorder::entry("sender", 1000, Behavior::Stop, &log),
        ]);

        run(&chain);
        assert_eq!(*log.lock(), ["failing", "panicking", "sender"]);
    }

    #[test]
    fn test_error_after_forward_does_not_rerun() {
        let log = Log::default();
        let chain = chain(vec![
            Recorder::entry("late", 10, Behavior::FailAfterForward, &log),
            Recorder::entry("sender", 1000, Behavior::Stop, &log),
        ]);

        run(&chain);
        assert_eq!(*log.lock(), ["late", "sender"]);
    }

    #[test]
    fn test_create_from_is_a_view() {
        let log = Log::default();
        let chain = chain(vec![
            Recorder::entry("a", 10, Behavior::Forward, &log),
            Recorder::entry("b", 20, Behavior::Forward, &log),
            Recorder::entry("c", 30, Behavior::Stop, &log),
        ]);

        let diagnostics = Diagnostics::default();
        let context = ProcessContext::new(&chain.nodes, &diagnostics);

        let mut partial = context.create_from("b").unwrap();
        partial.process_next(&mut TelemetryItem::event("e"));

        assert_eq!(*log.lock(), ["b", "c"]);
        assert_eq!(context.next_identifier(), Some("a"));
        assert!(context.create_from("missing").is_none());
    }

    #[test]
    fn test_duplicates() {
        assert_eq!(find_duplicate(["a", "b", "c"]), None);
        assert_eq!(find_duplicate(["a", "b", "a"]), Some("a"));
    }
}
