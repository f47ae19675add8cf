//! The telemetry processing and delivery pipeline.
//!
//! Producers hand [`TelemetryItem`](courier_protocol::TelemetryItem)s to the [`Core`], which
//! dispatches them through an ordered chain of [plugins](plugins). The terminal
//! [`SenderPlugin`](services::sender::SenderPlugin) samples each item, converts it into an
//! envelope and buffers it until a batch is sent to the collector.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_config::Config;
//! use courier_pipeline::Core;
//! use courier_pipeline::plugins::PluginEntry;
//! use courier_pipeline::services::sender::SenderPlugin;
//! use courier_protocol::TelemetryItem;
//!
//! # async fn run() -> Result<(), courier_pipeline::CoreError> {
//! let core = Core::new();
//! core.initialize(
//!     Arc::new(Config::default()),
//!     vec![PluginEntry::telemetry(SenderPlugin::new())],
//! )?;
//!
//! core.track(TelemetryItem::event("started"));
//! core.flush_and_wait().await;
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]

pub mod diagnostics;
pub mod notifications;
pub mod plugins;
pub mod services;
#[cfg(any(test, feature = "testutils"))]
pub mod testutils;
pub mod utils;

mod pipeline;

pub use self::pipeline::*;
