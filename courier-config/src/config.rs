use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use courier_log::{LevelFilter, LogConfig};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::byte_size::ByteSize;
use crate::connection::ConnectionString;

/// The collector endpoint used when neither an endpoint nor a connection string is configured.
pub const DEFAULT_ENDPOINT: &str = "https://dc.services.example.com/v2/track";

/// The name of the configuration file inside the configuration folder.
pub const CONFIG_FILE_NAME: &str = "config.yml";

/// Defines the source of a config error
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override (an env var, or a CLI parameter).
    FieldOverride(String),
}

impl fmt::Display for ConfigErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErrorSource::None => Ok(()),
            ConfigErrorSource::File(file_name) => {
                write!(f, " (file {})", file_name.display())
            }
            ConfigErrorSource::FieldOverride(name) => write!(f, " (field {name})"),
        }
    }
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    inner: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            inner: None,
        }
    }

    #[inline]
    fn wrap<E>(inner: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            source: ConfigErrorSource::None,
            kind,
            inner: Some(Box::new(inner)),
        }
    }

    #[inline]
    fn for_field<E>(inner: E, field: &'static str) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::wrap(inner, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file(mut self, p: impl AsRef<Path>) -> Self {
        self.source = ConfigErrorSource::File(p.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.source = ConfigErrorSource::FieldOverride(name.to_owned());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind, self.source)
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.as_ref().map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to save a file.
    #[error("could not write config file")]
    CouldNotWriteFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// Invalid config value
    #[error("invalid config value")]
    InvalidValue,
}

/// Structure used to hold information about configuration overrides via
/// CLI parameters or environment variables
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The collector endpoint URL.
    pub endpoint: Option<String>,
    /// The instrumentation key used to route telemetry.
    pub instrumentation_key: Option<String>,
    /// The sampling percentage in `(0, 100]`.
    pub sampling_percentage: Option<String>,
    /// The log level of the courier crates.
    pub log_level: Option<String>,
}

/// Severity threshold for queueing internal diagnostics as telemetry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    /// Nothing is queued.
    Off,
    /// Only critical messages are queued.
    #[default]
    Critical,
    /// Critical and warning messages are queued.
    Warning,
    /// Every message is queued.
    Information,
}

/// Process-wide pipeline settings.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Core {
    /// The routing key attached to every envelope.
    instrumentation_key: Option<String>,
    /// Connection string providing key and ingestion endpoint.
    connection_string: Option<ConnectionString>,
    /// Skips the GUID format check on the instrumentation key.
    disable_instrumentation_key_validation: bool,
    /// Starts the pipeline with collection disabled.
    disable_telemetry: bool,
    /// Forwards queued internal diagnostics as trace telemetry on flush.
    enable_internal_telemetry: bool,
    /// Threshold for queueing internal diagnostics.
    internal_telemetry_level: DiagnosticLevel,
    /// Maximum number of queued internal diagnostics per session.
    max_internal_messages: usize,
}

impl Default for Core {
    fn default() -> Self {
        Core {
            instrumentation_key: None,
            connection_string: None,
            disable_instrumentation_key_validation: false,
            disable_telemetry: false,
            enable_internal_telemetry: false,
            internal_telemetry_level: DiagnosticLevel::Critical,
            max_internal_messages: 25,
        }
    }
}

/// Batching and delivery settings.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Sender {
    /// Explicit collector endpoint, overriding the connection string.
    endpoint: Option<Url>,
    /// Interval of the batch timer in milliseconds.
    max_batch_interval_ms: u64,
    /// Maximum size of a batch before an early send is triggered.
    max_batch_size: ByteSize,
    /// Drops failed batches instead of retrying them.
    retry_disabled: bool,
    /// Sends batches as newline-delimited JSON instead of a JSON array.
    line_delimited_json: bool,
    /// Disables the fire-and-forget transport for regular sends.
    disable_fire_and_forget: bool,
    /// Disables the fire-and-forget transport on teardown flushes.
    disable_teardown_fire_and_forget: bool,
    /// Extra headers attached to every request.
    custom_headers: BTreeMap<String, String>,
    /// Maximum number of redirects followed per sender instance.
    max_redirects: u32,
    /// HTTP request timeout in seconds.
    timeout: u64,
    /// Maximum number of buffered payloads when storage is disabled.
    events_limit_in_memory: usize,
}

impl Default for Sender {
    fn default() -> Self {
        Sender {
            endpoint: None,
            max_batch_interval_ms: 15_000,
            max_batch_size: ByteSize::kibibytes(100),
            retry_disabled: false,
            line_delimited_json: false,
            disable_fire_and_forget: true,
            disable_teardown_fire_and_forget: false,
            custom_headers: BTreeMap::new(),
            max_redirects: 10,
            timeout: 30,
            events_limit_in_memory: 10_000,
        }
    }
}

/// Sampling settings.
#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(default)]
struct Sampling {
    /// Percentage of telemetry kept. Unset keeps everything.
    percentage: Option<f64>,
}

/// Send buffer persistence settings.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Storage {
    /// Persists the send buffer through a storage provider.
    enabled: bool,
    /// Directory for file storage. Storage is kept in memory if unset.
    path: Option<PathBuf>,
    /// Prefix prepended to the storage keys.
    prefix: String,
    /// Maximum number of persisted payloads.
    max_items: usize,
}

impl Default for Storage {
    fn default() -> Self {
        Storage {
            enabled: true,
            path: None,
            prefix: String::new(),
            max_items: 2000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(default)]
struct ConfigValues {
    core: Core,
    sender: Sender,
    sampling: Sampling,
    storage: Storage,
    logging: LogConfig,
}

impl ConfigValues {
    /// Loads the config file from within the given directory location.
    fn load(base: &Path) -> Result<Self, ConfigError> {
        let path = base.join(CONFIG_FILE_NAME);

        let f = fs::File::open(&path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&path))?;

        serde_yaml::from_reader(io::BufReader::new(f))
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&path))
    }
}

/// Config struct.
#[derive(Default)]
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Config {
    /// Loads a config from a given config folder.
    ///
    /// A missing `config.yml` is not an error, defaults are used instead.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = std::env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        let values = if path.join(CONFIG_FILE_NAME).exists() {
            ConfigValues::load(&path)?
        } else {
            ConfigValues::default()
        };

        Ok(Config { values, path })
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        Ok(Config {
            values: serde_json::from_value(value)
                .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::BadJson))?,
            path: PathBuf::new(),
        })
    }

    /// Override configuration with values coming from other sources (e.g. env variables or
    /// command line parameters)
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        if let Some(endpoint) = overrides.endpoint {
            self.values.sender.endpoint = Some(
                endpoint
                    .parse::<Url>()
                    .map_err(|err| ConfigError::for_field(err, "endpoint"))?,
            );
        }

        if let Some(key) = overrides.instrumentation_key {
            self.values.core.instrumentation_key = Some(key);
        }

        if let Some(percentage) = overrides.sampling_percentage {
            let percentage = percentage
                .parse::<f64>()
                .map_err(|err| ConfigError::for_field(err, "sampling_percentage"))?;
            self.values.sampling.percentage = Some(percentage);
        }

        if let Some(level) = overrides.log_level {
            self.values.logging.level = level
                .parse::<LevelFilter>()
                .map_err(|err| ConfigError::for_field(err, "log_level"))?;
        }

        Ok(self)
    }

    /// Serializes the effective configuration as YAML.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile))
    }

    /// Returns the folder the config was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }

    /// Returns the instrumentation key.
    ///
    /// An explicitly configured key takes precedence over the connection string.
    pub fn instrumentation_key(&self) -> Option<&str> {
        let core = &self.values.core;
        core.instrumentation_key
            .as_deref()
            .or_else(|| core.connection_string.as_ref()?.instrumentation_key())
            .filter(|key| !key.trim().is_empty())
    }

    /// Returns `true` if the instrumentation key must not be checked for the GUID format.
    pub fn instrumentation_key_validation_disabled(&self) -> bool {
        self.values.core.disable_instrumentation_key_validation
    }

    /// Returns `true` if the pipeline starts with collection disabled.
    pub fn telemetry_disabled(&self) -> bool {
        self.values.core.disable_telemetry
    }

    /// Returns `true` if internal diagnostics are forwarded as telemetry.
    pub fn internal_telemetry_enabled(&self) -> bool {
        self.values.core.enable_internal_telemetry
    }

    /// Returns the threshold for queueing internal diagnostics.
    pub fn internal_telemetry_level(&self) -> DiagnosticLevel {
        self.values.core.internal_telemetry_level
    }

    /// Returns the maximum number of queued internal diagnostics.
    pub fn max_internal_messages(&self) -> usize {
        self.values.core.max_internal_messages
    }

    /// Returns the collector endpoint.
    ///
    /// Resolution order: explicit endpoint, connection string, [`DEFAULT_ENDPOINT`].
    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        if let Some(ref endpoint) = self.values.sender.endpoint {
            return Ok(endpoint.clone());
        }

        let from_connection = self
            .values
            .core
            .connection_string
            .as_ref()
            .and_then(ConnectionString::track_endpoint);

        match from_connection {
            Some(endpoint) => Ok(endpoint),
            None => Url::parse(DEFAULT_ENDPOINT)
                .map_err(|err| ConfigError::for_field(err, "endpoint")),
        }
    }

    /// Returns the interval of the batch timer.
    pub fn max_batch_interval(&self) -> Duration {
        Duration::from_millis(self.values.sender.max_batch_interval_ms)
    }

    /// Returns the maximum size of a batch in bytes.
    pub fn max_batch_size(&self) -> usize {
        self.values.sender.max_batch_size.as_bytes()
    }

    /// Returns `true` if failed batches are dropped instead of retried.
    pub fn retry_disabled(&self) -> bool {
        self.values.sender.retry_disabled
    }

    /// Returns `true` if batches are sent as newline-delimited JSON.
    pub fn line_delimited_json(&self) -> bool {
        self.values.sender.line_delimited_json
    }

    /// Returns `true` if the fire-and-forget transport is disabled for regular sends.
    pub fn fire_and_forget_disabled(&self) -> bool {
        self.values.sender.disable_fire_and_forget
    }

    /// Returns `true` if the fire-and-forget transport is disabled on teardown.
    pub fn teardown_fire_and_forget_disabled(&self) -> bool {
        self.values.sender.disable_teardown_fire_and_forget
    }

    /// Returns the headers attached to every request.
    pub fn custom_headers(&self) -> &BTreeMap<String, String> {
        &self.values.sender.custom_headers
    }

    /// Returns the redirect budget of a sender instance.
    pub fn max_redirects(&self) -> u32 {
        self.values.sender.max_redirects
    }

    /// Returns the HTTP request timeout.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.values.sender.timeout)
    }

    /// Returns the sampling percentage, if configured.
    pub fn sampling_percentage(&self) -> Option<f64> {
        self.values.sampling.percentage
    }

    /// Returns `true` if the send buffer is persisted.
    pub fn storage_enabled(&self) -> bool {
        self.values.storage.enabled
    }

    /// Returns the directory for file storage, if configured.
    pub fn storage_path(&self) -> Option<&Path> {
        self.values.storage.path.as_deref()
    }

    /// Returns the prefix of the storage keys.
    pub fn storage_prefix(&self) -> &str {
        &self.values.storage.prefix
    }

    /// Returns the maximum number of buffered payloads.
    ///
    /// The limit depends on whether the buffer is persisted.
    pub fn buffer_max_items(&self) -> usize {
        if self.storage_enabled() {
            self.values.storage.max_items
        } else {
            self.values.sender.events_limit_in_memory
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.endpoint().unwrap().as_str(), DEFAULT_ENDPOINT);
        assert_eq!(config.max_batch_interval(), Duration::from_secs(15));
        assert_eq!(config.max_batch_size(), 102_400);
        assert_eq!(config.sampling_percentage(), None);
        assert!(!config.retry_disabled());
        assert!(!config.line_delimited_json());
        assert!(config.fire_and_forget_disabled());
        assert!(!config.teardown_fire_and_forget_disabled());
        assert!(config.storage_enabled());
        assert_eq!(config.buffer_max_items(), 2000);
        assert_eq!(config.max_redirects(), 10);
        assert_eq!(config.http_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_internal_messages(), 25);
    }

    #[test]
    fn test_default_endpoint_resolves() {
        let endpoint = Config::default().endpoint().unwrap();
        assert_eq!(endpoint.scheme(), "https");
        assert_eq!(endpoint.path(), "/v2/track");
    }

    #[test]
    fn test_connection_string_fallback() {
        let config = Config::from_json_value(json!({
            "core": {
                "connection_string": "InstrumentationKey=abc;IngestionEndpoint=https://ingest.test/"
            }
        }))
        .unwrap();

        assert_eq!(config.instrumentation_key(), Some("abc"));
        assert_eq!(config.endpoint().unwrap().as_str(), "https://ingest.test/v2/track");
    }

    #[test]
    fn test_explicit_settings_win() {
        let config = Config::from_json_value(json!({
            "core": {
                "instrumentation_key": "explicit",
                "connection_string": "InstrumentationKey=abc;IngestionEndpoint=https://ingest.test/"
            },
            "sender": {
                "endpoint": "https://other.test/track"
            }
        }))
        .unwrap();

        assert_eq!(config.instrumentation_key(), Some("explicit"));
        assert_eq!(config.endpoint().unwrap().as_str(), "https://other.test/track");
    }

    #[test]
    fn test_blank_instrumentation_key() {
        let config = Config::from_json_value(json!({
            "core": { "instrumentation_key": "  " }
        }))
        .unwrap();

        assert_eq!(config.instrumentation_key(), None);
    }

    #[test]
    fn test_in_memory_limit() {
        let config = Config::from_json_value(json!({
            "storage": { "enabled": false },
            "sender": { "events_limit_in_memory": 5 }
        }))
        .unwrap();

        assert_eq!(config.buffer_max_items(), 5);
    }

    #[test]
    fn test_apply_override() {
        let mut config = Config::default();
        config
            .apply_override(OverridableConfig {
                endpoint: Some("https://override.test/v2/track".to_owned()),
                instrumentation_key: Some("key".to_owned()),
                sampling_percentage: Some("12.5".to_owned()),
                log_level: Some("debug".to_owned()),
            })
            .unwrap();

        assert_eq!(config.endpoint().unwrap().as_str(), "https://override.test/v2/track");
        assert_eq!(config.instrumentation_key(), Some("key"));
        assert_eq!(config.sampling_percentage(), Some(12.5));
        assert_eq!(config.logging().level, LevelFilter::DEBUG);
    }

    #[test]
    fn test_apply_override_invalid() {
        let mut config = Config::default();
        let error = config
            .apply_override(OverridableConfig {
                sampling_percentage: Some("half".to_owned()),
                ..Default::default()
            })
            .unwrap_err();

        assert_eq!(error.kind(), ConfigErrorKind::InvalidValue);
        assert_eq!(
            error.to_string(),
            "invalid config value (field sampling_percentage)"
        );
        assert!(error.source().is_some());
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.yml"),
            "sender:\n  max_batch_size: 1KiB\n  line_delimited_json: true\nsampling:\n  percentage: 25\n",
        )
        .unwrap();

        let config = Config::from_path(dir.path()).unwrap();
        assert_eq!(config.max_batch_size(), 1024);
        assert!(config.line_delimited_json());
        assert_eq!(config.sampling_percentage(), Some(25.0));
    }

    #[test]
    fn test_from_path_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_path(dir.path()).unwrap();
        assert_eq!(config.max_batch_size(), 102_400);
    }

    #[test]
    fn test_from_path_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.yml"), "sender: [").unwrap();

        let error = Config::from_path(dir.path()).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::BadYaml);
    }

    #[test]
    fn test_yaml_output() {
        let config = Config::from_json_value(json!({
            "sampling": { "percentage": 50.0 }
        }))
        .unwrap();

        let yaml = config.to_yaml_string().unwrap();
        insta::assert_snapshot!(yaml, @r#"
        core:
          instrumentation_key: null
          connection_string: null
          disable_instrumentation_key_validation: false
          disable_telemetry: false
          enable_internal_telemetry: false
          internal_telemetry_level: critical
          max_internal_messages: 25
        sender:
          endpoint: null
          max_batch_interval_ms: 15000
          max_batch_size: 100KiB
          retry_disabled: false
          line_delimited_json: false
          disable_fire_and_forget: true
          disable_teardown_fire_and_forget: false
          custom_headers: {}
          max_redirects: 10
          timeout: 30
          events_limit_in_memory: 10000
        sampling:
          percentage: 50.0
        storage:
          enabled: true
          path: null
          prefix: ''
          max_items: 2000
        logging:
          level: info
          format: auto
          enable_backtraces: false
        "#);
    }
}
