use anyhow::Result;
use courier_config::{CONFIG_FILE_NAME, Config};
use courier_pipeline::is_valid_instrumentation_key;

/// Checks settings the pipeline cannot start without.
pub fn check_config(config: &Config) -> Result<()> {
    let Some(key) = config.instrumentation_key() else {
        anyhow::bail!(
            "no instrumentation key configured. Set `core.instrumentation_key` in the config \
             file, pass --instrumentation-key or set COURIER_INSTRUMENTATION_KEY."
        );
    };

    if !config.instrumentation_key_validation_disabled() && !is_valid_instrumentation_key(key) {
        anyhow::bail!("instrumentation key {key:?} is not a valid GUID");
    }

    config.endpoint()?;
    Ok(())
}

pub fn init_logging(config: &Config) {
    courier_log::init(config.logging());
}

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    if config.path().join(CONFIG_FILE_NAME).exists() {
        courier_log::info!("using config folder {}", config.path().display());
    } else {
        courier_log::info!("launching courier without config file");
    }

    match config.endpoint() {
        Ok(endpoint) => courier_log::info!("  endpoint: {endpoint}"),
        Err(_) => courier_log::info!("  endpoint: -"),
    }
    match config.sampling_percentage() {
        Some(percentage) => courier_log::info!("  sampling: {percentage}%"),
        None => courier_log::info!("  sampling: -"),
    }
    match config.storage_path() {
        Some(path) if config.storage_enabled() => {
            courier_log::info!("  storage: {}", path.display())
        }
        _ => courier_log::info!("  storage: -"),
    }
    courier_log::info!("  log level: {}", config.logging().level);
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_missing_key() {
        let config = Config::from_json_value(json!({})).unwrap();
        assert!(check_config(&config).is_err());
    }

    #[test]
    fn test_invalid_key() {
        let config =
            Config::from_json_value(json!({"core": {"instrumentation_key": "abc"}})).unwrap();
        assert!(check_config(&config).is_err());

        let config = Config::from_json_value(json!({
            "core": {
                "instrumentation_key": "abc",
                "disable_instrumentation_key_validation": true,
            }
        }))
        .unwrap();
        assert!(check_config(&config).is_ok());
    }

    #[test]
    fn test_valid_key() {
        let config = Config::from_json_value(json!({
            "core": {"instrumentation_key": "0f6a1d2c-8b3e-4c5d-9e7f-1a2b3c4d5e6f"}
        }))
        .unwrap();
        assert!(check_config(&config).is_ok());
    }
}
