//! Configuration for the courier telemetry pipeline.
//!
//! The configuration is loaded from a `config.yml` file in a configuration folder and can be
//! amended with [`OverridableConfig`] values coming from the command line or the environment.
//! All values have defaults, so an empty file is a valid configuration.
//!
//! ```yaml
//! core:
//!   connection_string: "InstrumentationKey=...;IngestionEndpoint=https://..."
//! sender:
//!   max_batch_interval_ms: 15000
//!   max_batch_size: 100KiB
//! sampling:
//!   percentage: 50
//! logging:
//!   level: debug
//! ```
#![warn(missing_docs)]

mod byte_size;
mod config;
mod connection;

pub use crate::byte_size::*;
pub use crate::config::*;
pub use crate::connection::*;
