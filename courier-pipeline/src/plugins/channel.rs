use std::sync::Arc;

use courier_protocol::TelemetryItem;
use futures::future::{self, BoxFuture};

use crate::diagnostics::Diagnostics;
use crate::notifications::SendRequestReason;
use crate::plugins::{
    ActivePlugins, InitContext, Plugin, PluginEntry, PluginError, ProcessContext, TelemetryPlugin,
};

/// Identifier of the [`ChannelController`].
pub const CHANNEL_CONTROLLER_ID: &str = "ChannelControllerPlugin";

/// Priority of the [`ChannelController`] in the main chain.
pub const CHANNEL_CONTROLLER_PRIORITY: u32 = 500;

/// Routes every item to a set of parallel channel groups.
///
/// Each group is an independent chain of plugins sorted by priority. The item is copied for every
/// group, so groups cannot observe each other's modifications. After all groups ran, processing
/// continues in the main chain.
pub struct ChannelController {
    groups: Vec<Vec<PluginEntry>>,
    channels: Vec<ActivePlugins>,
    diagnostics: Arc<Diagnostics>,
}

impl ChannelController {
    /// Creates a controller for the given channel groups.
    pub fn new(groups: Vec<Vec<PluginEntry>>) -> Self {
        Self {
            groups,
            channels: Vec::new(),
            diagnostics: Arc::default(),
        }
    }

    /// Returns the identifiers of all plugins in all groups.
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().flatten().map(PluginEntry::identifier)
    }

    /// Returns `true` if any group contains a telemetry plugin.
    pub fn has_telemetry_plugin(&self) -> bool {
        self.groups.iter().flatten().any(PluginEntry::is_telemetry)
    }

    /// Returns the number of channel groups.
    pub fn len(&self) -> usize {
        self.groups.len().max(self.channels.len())
    }

    /// Returns `true` if there are no channel groups.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Plugin for ChannelController {
    fn identifier(&self) -> &str {
        CHANNEL_CONTROLLER_ID
    }

    fn priority(&self) -> u32 {
        CHANNEL_CONTROLLER_PRIORITY
    }

    fn initialize(&mut self, context: &InitContext<'_>) -> Result<(), PluginError> {
        self.diagnostics = context.diagnostics.clone();

        for group in std::mem::take(&mut self.groups) {
            let channel = ActivePlugins::initialize(group, context)
                .map_err(|error| PluginError::Other(Box::new(error)))?;
            self.channels.push(channel);
        }

        Ok(())
    }

    fn flush(&self, is_async: bool, reason: SendRequestReason) -> BoxFuture<'static, ()> {
        let flushes: Vec<_> = self
            .channels
            .iter()
            .map(|c| c.flush(is_async, reason))
            .collect();
        Box::pin(async move {
            future::join_all(flushes).await;
        })
    }

    fn teardown(&self) -> BoxFuture<'static, ()> {
        let teardowns: Vec<_> = self.channels.iter().map(ActivePlugins::teardown).collect();
        Box::pin(async move {
            future::join_all(teardowns).await;
        })
    }

    fn set_enabled(&self, enabled: bool) {
        for channel in &self.channels {
            channel.set_enabled(enabled);
        }
    }

    fn pause(&self) {
        self.channels.iter().for_each(ActivePlugins::pause);
    }

    fn resume(&self) {
        self.channels.iter().for_each(ActivePlugins::resume);
    }
}

impl TelemetryPlugin for ChannelController {
    fn process_telemetry(
        &self,
        item: &mut TelemetryItem,
        context: &mut ProcessContext<'_>,
    ) -> Result<(), PluginError> {
        for channel in &self.channels {
            let chain = channel.chain();
            if chain.is_empty() {
                continue;
            }

            let mut copy = item.clone();
            chain.process(&mut copy, &self.diagnostics);
        }

        context.process_next(item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::notifications::NotificationManager;
    use crate::plugins::PluginChain;

    type Seen = Arc<Mutex<Vec<(String, Option<String>)>>>;

    struct Tagger {
        id: &'static str,
        priority: u32,
        seen: Seen,
    }

    impl Plugin for Tagger {
        fn identifier(&self) -> &str {
            self.id
        }

        fn priority(&self) -> u32 {
            self.priority
        }
    }

    impl TelemetryPlugin for Tagger {
        fn process_telemetry(
            &self,
            item: &mut TelemetryItem,
            context: &mut ProcessContext<'_>,
        ) -> Result<(), PluginError> {
            let previous = item
                .tag("group")
                .and_then(|v| v.as_str())
                .map(str::to_owned);
            self.seen.lock().push((self.id.to_owned(), previous));
            item.set_tag("group", self.id);
            context.process_next(item);
            Ok(())
        }
    }

    fn tagger(id: &'static str, priority: u32, seen: &Seen) -> PluginEntry {
        PluginEntry::telemetry(Tagger {
            id,
            priority,
            seen: seen.clone(),
        })
    }

    #[test]
    fn test_groups_are_independent() {
        let seen = Seen::default();

        let mut controller = ChannelController::new(vec![
            vec![tagger("a2", 20, &seen), tagger("a1", 10, &seen)],
            vec![tagger("b1", 10, &seen)],
        ]);
        assert_eq!(
            controller.identifiers().collect::<Vec<_>>(),
            ["a2", "a1", "b1"]
        );

        let config = Arc::new(courier_config::Config::default());
        let diagnostics = Arc::new(Diagnostics::default());
        let notifications = Arc::new(NotificationManager::new());
        controller
            .initialize(&InitContext {
                config: &config,
                diagnostics: &diagnostics,
                notifications: &notifications,
            })
            .unwrap();

        let chain = PluginChain::new(vec![Arc::new(controller)]);
        let mut item = TelemetryItem::event("e");
        chain.process(&mut item, &diagnostics);

        assert_eq!(
            *seen.lock(),
            [
                ("a1".to_owned(), None),
                ("a2".to_owned(), Some("a1".to_owned())),
                ("b1".to_owned(), None),
            ]
        );
        assert_eq!(item.tag("group"), None);
    }
}
