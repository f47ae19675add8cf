use std::env;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt as tfmt, prelude::*};

// Import CRATE_NAMES, which lists all crates in the workspace.
include!(concat!(env!("OUT_DIR"), "/constants.gen.rs"));

/// Controls the log format.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    #[default]
    Auto,

    /// Pretty printing with colors.
    ///
    /// ```text
    ///  INFO  courier_pipeline::pipeline > pipeline initialized
    /// ```
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2026-01-04T12:10:32.123Z  INFO courier_pipeline::pipeline: pipeline initialized
    /// ```
    Simplified,

    /// Dump out JSON lines.
    ///
    /// ```text
    /// {"timestamp":"2026-01-04T12:11:08.729716Z","level":"INFO","fields":{"message":"pipeline initialized"},"target":"courier_pipeline::pipeline"}
    /// ```
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// The log level for the courier crates.
    #[serde(with = "level_serde")]
    pub level: LevelFilter,

    /// Controls the log output format.
    ///
    /// Defaults to [`LogFormat::Auto`], which detects the best format based on the TTY.
    pub format: LogFormat,

    /// When set to `true`, backtraces are forced on.
    ///
    /// Otherwise, backtraces can be enabled by setting the `RUST_BACKTRACE` variable to `full`.
    pub enable_backtraces: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: false,
        }
    }
}

mod level_serde {
    use super::*;

    pub fn serialize<S: Serializer>(level: &LevelFilter, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&LevelName(*level))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LevelFilter, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }

    struct LevelName(LevelFilter);

    impl fmt::Display for LevelName {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let name = match self.0 {
                LevelFilter::OFF => "off",
                LevelFilter::ERROR => "error",
                LevelFilter::WARN => "warn",
                LevelFilter::INFO => "info",
                LevelFilter::DEBUG => "debug",
                _ => "trace",
            };
            f.write_str(name)
        }
    }
}

/// Builds the default filter directives when `RUST_LOG` is not set.
///
/// Third-party crates log at `INFO`, the courier crates at the configured level.
fn default_directives(level: LevelFilter) -> String {
    let mut directives = String::from("info");

    for name in CRATE_NAMES {
        directives.push_str(&format!(",{name}={level}"));
    }

    directives
}

/// Initialize the logging system.
///
/// Repeated calls are ignored, the first installed subscriber stays active.
///
/// # Example
///
/// ```
/// let log_config = courier_log::LogConfig {
///     enable_backtraces: true,
///     ..Default::default()
/// };
///
/// courier_log::init(&log_config);
/// ```
pub fn init(config: &LogConfig) {
    if config.enable_backtraces {
        // SAFETY: Called during startup before any other threads are spawned.
        unsafe { env::set_var("RUST_BACKTRACE", "full") };
    }

    let filter = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(default_directives(config.level)),
    };

    let format: Box<dyn Layer<Registry> + Send + Sync> =
        match (config.format, console::user_attended()) {
            (LogFormat::Auto, true) | (LogFormat::Pretty, _) => {
                tfmt::layer().compact().with_ansi(true).boxed()
            }
            (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
                tfmt::layer().with_ansi(false).boxed()
            }
            (LogFormat::Json, _) => tfmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .boxed(),
        };

    tracing_subscriber::registry()
        .with(format.with_filter(filter))
        .try_init()
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_config() {
        let yaml = "level: debug\nformat: json\n";
        let config: LogConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.level, LevelFilter::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert!(!config.enable_backtraces);
    }

    #[test]
    fn test_serialize_log_level() {
        let config = LogConfig {
            level: LevelFilter::WARN,
            ..Default::default()
        };

        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("level: warn"));
    }

    #[test]
    fn test_default_filter_covers_workspace() {
        let directives = default_directives(LevelFilter::TRACE);
        assert!(directives.starts_with("info,"));
        assert!(directives.contains(",courier_log=trace"));
    }
}
