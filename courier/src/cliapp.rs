//! Definition of the command line app.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(
    name = "courier",
    version,
    about = "Sends telemetry to a collector through the courier pipeline.",
    max_term_width = 79,
    disable_help_subcommand = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct App {
    /// The path to the config folder.
    #[arg(long, short, global = true, value_name = "CONFIG", default_value = ".courier")]
    pub config: PathBuf,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

/// Values that override the config file.
#[derive(Debug, Args)]
pub struct Overrides {
    /// The collector endpoint.
    #[arg(long, global = true, value_name = "URL", env = "COURIER_ENDPOINT")]
    pub endpoint: Option<String>,

    /// The instrumentation key attached to all telemetry.
    #[arg(
        long,
        global = true,
        value_name = "KEY",
        env = "COURIER_INSTRUMENTATION_KEY"
    )]
    pub instrumentation_key: Option<String>,

    /// The percentage of users whose telemetry is sent.
    #[arg(
        long,
        global = true,
        value_name = "PERCENT",
        env = "COURIER_SAMPLING_PERCENTAGE"
    )]
    pub sampling: Option<String>,

    /// The log level of courier itself.
    #[arg(long, global = true, value_name = "LEVEL", env = "COURIER_LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send telemetry items read as JSON lines.
    ///
    /// Each non-empty line holds one telemetry item. All items are tracked and flushed before
    /// the command exits.
    Send {
        /// The file to read items from. Reads standard input if omitted or `-`.
        #[arg(long, short, value_name = "FILE")]
        input: Option<PathBuf>,
    },

    /// Send a single custom event.
    Event {
        /// The name of the event.
        name: String,

        /// Custom properties as `key=value` pairs.
        #[arg(long = "property", short, value_name = "KEY=VALUE")]
        properties: Vec<String>,
    },

    /// Manage the courier config.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show the effective config including defaults.
    Show {
        /// The output format.
        #[arg(long, short, value_enum, default_value_t = ConfigFormat::Yaml)]
        format: ConfigFormat,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Debug,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_app_definition() {
        App::command().debug_assert();
    }

    #[test]
    fn test_parse_send() {
        let app = App::try_parse_from([
            "courier",
            "send",
            "--input",
            "items.jsonl",
            "--sampling",
            "50",
        ])
        .unwrap();

        assert_eq!(app.overrides.sampling.as_deref(), Some("50"));
        assert!(matches!(app.command, Command::Send { input: Some(ref p) } if p.ends_with("items.jsonl")));
    }

    #[test]
    fn test_parse_event_properties() {
        let app = App::try_parse_from(["courier", "event", "deploy", "-p", "stage=prod"]).unwrap();

        let Command::Event { name, properties } = app.command else {
            panic!("expected event command");
        };
        assert_eq!(name, "deploy");
        assert_eq!(properties, ["stage=prod"]);
    }
}
