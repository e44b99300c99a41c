//! Logging setup for `create_datasets` and the run-level events it emits.
//!
//! Logs go to stderr so the binary's stdout summary stays parseable.

use std::env;
use std::str::FromStr;

use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::pipeline::RunReport;
use crate::registry::MappingReport;

const LEVEL_VAR: &str = "RAIL_FEATURES_LOG_LEVEL";
const FORMAT_VAR: &str = "RAIL_FEATURES_LOG_FORMAT";
const TARGET_VAR: &str = "RAIL_FEATURES_LOG_TARGET";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    // An `EnvFilter` directive, e.g. `rail_features=debug,parquet=warn`.
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: false,
        }
    }
}

impl LoggingConfig {
    // Unset, blank or unparseable values keep the default.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let value = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        if let Some(level) = value(LEVEL_VAR).or_else(|| value("RUST_LOG")) {
            config.level = level;
        }
        if let Some(format) = value(FORMAT_VAR).and_then(|raw| raw.parse().ok()) {
            config.format = format;
        }
        if let Some(include_target) = value(TARGET_VAR).and_then(|raw| parse_switch(&raw)) {
            config.include_target = include_target;
        }
        config
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    LoggingConfig::from_lookup(|key| env::var(key).ok())
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(config.include_target);

    match config.format {
        LogFormat::Json => {
            tracing::subscriber::set_global_default(builder.json().with_ansi(false).finish())?
        }
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.compact().finish())?,
    }

    Ok(())
}

pub fn log_app_start(config: &LoggingConfig) {
    info!(
        component = "create_datasets",
        event = "app.start",
        version = env!("CARGO_PKG_VERSION"),
        log_level = %config.level,
        log_format = ?config.format
    );
}

pub fn log_run_summary(report: &RunReport) {
    info!(
        component = "pipeline",
        event = "pipeline.complete",
        start = %report.range.start(),
        end = %report.range.end(),
        windows = report.windows,
        segments = report.segments,
        hours = report.hours,
        rows = report.rows,
        partitions = report.committed_partitions.len(),
        schema_version = report.schema.version,
        schema_fingerprint = %report.schema.fingerprint,
        holidays_in_calendar = report.holidays_in_calendar,
        weather_stations_with_data = report.weather.stations_with_data,
        weather_segments_without_station = report.weather.segments_without_station,
        train_hops_counted = report.trains.counted_rows,
        incidents_counted = report.incidents.counted_incidents,
        incident_duplicates = report.incidents.duplicate_rows
    );

    for (feed, mapping) in [
        ("weather", &report.weather.mapping),
        ("train_hops", &report.trains.mapping),
        ("incidents", &report.incidents.mapping),
    ] {
        log_dropped_rows(feed, mapping);
    }
}

fn log_dropped_rows(feed: &str, mapping: &MappingReport) {
    if mapping.dropped_rows == 0 {
        return;
    }
    let first = mapping.samples.first().map(ToString::to_string);
    warn!(
        component = "pipeline",
        event = "pipeline.rows.dropped",
        feed,
        dropped_rows = mapping.dropped_rows,
        first_sample = first.as_deref().unwrap_or("")
    );
}

fn parse_switch(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
