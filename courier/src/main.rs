//! Courier sends telemetry from the command line.
//!
//! Items are read as JSON lines, tracked through the full pipeline and flushed to the collector
//! before the process exits. The collector endpoint, instrumentation key and sampling percentage
//! can be given in the config folder, on the command line or through environment variables.
//!
//! # Workspace Crates
//!
//!  - `courier`: Main entry point and command line interface.
//!  - [`courier-common`]: Common utilities and macros.
//!  - [`courier-config`]: Static configuration for the pipeline and the CLI.
//!  - [`courier-log`]: Logging setup and helpers.
//!  - [`courier-pipeline`]: The plugin chain, buffering and delivery.
//!  - [`courier-protocol`]: Telemetry items, envelopes and data contracts.
//!  - [`courier-sampling`]: Deterministic sampling.
//!  - [`courier-system`]: Foundational service components.
//!
//! [`courier-common`]: ../courier_common/index.html
//! [`courier-config`]: ../courier_config/index.html
//! [`courier-log`]: ../courier_log/index.html
//! [`courier-pipeline`]: ../courier_pipeline/index.html
//! [`courier-protocol`]: ../courier_protocol/index.html
//! [`courier-sampling`]: ../courier_sampling/index.html
//! [`courier-system`]: ../courier_system/index.html

mod cli;
mod cliapp;
mod setup;

use std::process;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            courier_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
