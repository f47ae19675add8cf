use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use courier_config::{Config, OverridableConfig};
use courier_pipeline::Core;
use courier_pipeline::notifications::{DiscardReason, NotificationListener};
use courier_pipeline::plugins::PluginEntry;
use courier_pipeline::services::sender::SenderPlugin;
use courier_protocol::{Object, TelemetryItem};
use serde_json::Value;

use crate::cliapp::{App, Command, ConfigCommand, ConfigFormat, Overrides};
use crate::setup;

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let app = App::parse();

    let mut config = Config::from_path(&app.config)?;
    config.apply_override(extract_overrides(app.overrides))?;

    setup::init_logging(&config);

    match app.command {
        Command::Send { input } => {
            let items = read_items(input)?;
            send(config, items)
        }
        Command::Event { name, properties } => {
            let item = make_event(name, &properties)?;
            send(config, vec![item])
        }
        Command::Config(ConfigCommand::Show { format }) => show_config(&config, format),
    }
}

fn extract_overrides(overrides: Overrides) -> OverridableConfig {
    OverridableConfig {
        endpoint: overrides.endpoint,
        instrumentation_key: overrides.instrumentation_key,
        sampling_percentage: overrides.sampling,
        log_level: overrides.log_level,
    }
}

fn read_items(input: Option<PathBuf>) -> Result<Vec<TelemetryItem>> {
    match input {
        Some(path) if path.as_os_str() != "-" => {
            let file = File::open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            parse_items(BufReader::new(file))
        }
        _ => parse_items(io::stdin().lock()),
    }
}

/// Parses one telemetry item per non-empty line.
fn parse_items(reader: impl BufRead) -> Result<Vec<TelemetryItem>> {
    let mut items = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.context("failed to read input")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let item = serde_json::from_str(line)
            .with_context(|| format!("invalid telemetry item on line {}", index + 1))?;
        items.push(item);
    }

    Ok(items)
}

fn make_event(name: String, properties: &[String]) -> Result<TelemetryItem> {
    let mut item = TelemetryItem::event(name);

    if !properties.is_empty() {
        let mut data = Object::new();
        for property in properties {
            let (key, value) = property
                .split_once('=')
                .with_context(|| format!("property {property:?} is not of the form key=value"))?;
            data.insert(key.to_owned(), Value::String(value.to_owned()));
        }
        item.data = Some(data);
    }

    Ok(item)
}

/// Counts delivery outcomes for the final summary.
#[derive(Debug, Default)]
struct Summary {
    sent: AtomicUsize,
    discarded: AtomicUsize,
}

impl NotificationListener for Summary {
    fn events_discarded(&self, count: usize, reason: DiscardReason) {
        courier_log::debug!(count, %reason, "telemetry discarded");
        self.discarded.fetch_add(count, Ordering::Relaxed);
    }

    fn events_sent(&self, count: usize) {
        self.sent.fetch_add(count, Ordering::Relaxed);
    }
}

fn send(config: Config, items: Vec<TelemetryItem>) -> Result<()> {
    setup::check_config(&config)?;
    setup::dump_spawn_infos(&config);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    let summary = Arc::new(Summary::default());
    let count = items.len();

    runtime.block_on(async {
        let core = Core::new();
        core.add_notification_listener(summary.clone());
        core.initialize(
            Arc::new(config),
            vec![PluginEntry::telemetry(SenderPlugin::new())],
        )?;

        for item in items {
            core.track(item);
        }

        core.flush_and_wait().await;
        core.teardown().await;
        anyhow::Ok(())
    })?;

    let sent = summary.sent.load(Ordering::Relaxed);
    let discarded = summary.discarded.load(Ordering::Relaxed);
    courier_log::info!(tracked = count, sent, discarded, "finished sending telemetry");

    if sent == 0 && discarded > 0 {
        anyhow::bail!("none of the {count} items were delivered");
    }

    Ok(())
}

#[allow(clippy::print_stdout)]
fn show_config(config: &Config, format: ConfigFormat) -> Result<()> {
    match format {
        ConfigFormat::Yaml => print!("{}", config.to_yaml_string()?),
        ConfigFormat::Debug => println!("{config:#?}"),
    }

    Ok(())
}
