//! Plugins and the ordered dispatch of telemetry through them.
//!
//! Every plugin implements [`Plugin`], which covers its lifecycle. Plugins that take part in the
//! processing of telemetry additionally implement [`TelemetryPlugin`]. The core sorts the
//! telemetry plugins by [priority](Plugin::priority) into a [`PluginChain`] and dispatches every
//! tracked item through it. Each plugin decides whether to forward the item by calling
//! [`ProcessContext::process_next`].

use std::error::Error;
use std::sync::Arc;

use courier_config::Config;
use futures::future::BoxFuture;

use crate::diagnostics::Diagnostics;
use crate::notifications::{NotificationManager, SendRequestReason};

mod chain;
mod channel;

pub use self::chain::*;
pub use self::channel::*;

/// Error raised by a plugin.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The plugin could not be initialized.
    #[error("initialization failed: {0}")]
    Initialization(String),
    /// The item cannot be handled by this plugin.
    #[error("invalid item: {0}")]
    InvalidItem(String),
    /// Processing the item failed.
    #[error("processing failed: {0}")]
    Processing(String),
    /// Any other error.
    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
}

/// Shared pipeline state handed to plugins on initialization.
#[derive(Clone, Copy, Debug)]
pub struct InitContext<'a> {
    /// The resolved configuration.
    pub config: &'a Arc<Config>,
    /// Internal diagnostics.
    pub diagnostics: &'a Arc<Diagnostics>,
    /// Listeners for sender notifications.
    pub notifications: &'a Arc<NotificationManager>,
}

/// Lifecycle of a plugin.
///
/// Only [`identifier`](Self::identifier) and [`priority`](Self::priority) are required. All
/// lifecycle hooks default to doing nothing.
pub trait Plugin: Send + Sync {
    /// Unique name of the plugin.
    fn identifier(&self) -> &str;

    /// Dispatch order of the plugin. Lower values run earlier.
    fn priority(&self) -> u32;

    /// Initializes the plugin before any item is processed.
    ///
    /// This is called at most once per plugin.
    fn initialize(&mut self, _context: &InitContext<'_>) -> Result<(), PluginError> {
        Ok(())
    }

    /// Sends buffered data.
    ///
    /// The flush is requested immediately. The returned future resolves once it completed and
    /// does not need to be awaited.
    fn flush(&self, _is_async: bool, _reason: SendRequestReason) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }

    /// Flushes for shutdown and releases resources.
    fn teardown(&self) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }

    /// Enables or disables telemetry at runtime.
    fn set_enabled(&self, _enabled: bool) {}

    /// Stops sending until [`resume`](Self::resume) is called.
    fn pause(&self) {}

    /// Resumes sending after [`pause`](Self::pause).
    fn resume(&self) {}
}

/// A plugin that processes telemetry items.
pub trait TelemetryPlugin: Plugin {
    /// Processes an item.
    ///
    /// To continue processing, the plugin calls [`ProcessContext::process_next`]. Returning
    /// without forwarding stops processing of the item. Errors and panics are caught by the
    /// chain, which then continues with the next plugin.
    fn process_telemetry(
        &self,
        item: &mut courier_protocol::TelemetryItem,
        context: &mut ProcessContext<'_>,
    ) -> Result<(), PluginError>;
}
