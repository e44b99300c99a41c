//! Typed pipeline configuration.
//!
//! One [`PipelineConfig`] is built per run (defaults, JSON file, or env
//! overrides) and passed by reference to every stage.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_ROLLING_WINDOW_HOURS: u32 = 48;
pub const DEFAULT_FREEZE_THRESHOLD_C: f64 = 0.0;

const RESERVED_INCIDENT_SUFFIXES: [&str; 4] = ["TOTAL", "OTHER", "DELAY_MINUTES", "FLAG"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid pipeline config: {0}")]
    Invalid(String),
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherColumn {
    AirTemperature,
    Precipitation,
    SnowDepth,
    Visibility,
    GustSpeed,
    GustDirection,
    PresentWeatherCode,
}

impl WeatherColumn {
    pub const ALL: [WeatherColumn; 7] = [
        WeatherColumn::AirTemperature,
        WeatherColumn::Precipitation,
        WeatherColumn::SnowDepth,
        WeatherColumn::Visibility,
        WeatherColumn::GustSpeed,
        WeatherColumn::GustDirection,
        WeatherColumn::PresentWeatherCode,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AirTemperature => "air_temperature",
            Self::Precipitation => "precipitation",
            Self::SnowDepth => "snow_depth",
            Self::Visibility => "visibility",
            Self::GustSpeed => "gust_speed",
            Self::GustDirection => "gust_direction",
            Self::PresentWeatherCode => "present_weather_code",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::AirTemperature => 0,
            Self::Precipitation => 1,
            Self::SnowDepth => 2,
            Self::Visibility => 3,
            Self::GustSpeed => 4,
            Self::GustDirection => 5,
            Self::PresentWeatherCode => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateAction {
    Min,
    Max,
    Sum,
    Mean,
}

impl AggregateAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Mean => "mean",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    AtOrBelow,
    AtOrAbove,
}

impl Comparison {
    pub fn aggregate(self) -> AggregateAction {
        match self {
            Self::AtOrBelow => AggregateAction::Min,
            Self::AtOrAbove => AggregateAction::Max,
        }
    }

    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::AtOrBelow => value <= threshold,
            Self::AtOrAbove => value >= threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StationSelection {
    Nearest,
    Mean,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowAggregate {
    pub column: WeatherColumn,
    pub action: AggregateAction,
    pub window_hours: u32,
}

impl WindowAggregate {
    pub fn new(column: WeatherColumn, action: AggregateAction, window_hours: u32) -> Self {
        Self {
            column,
            action,
            window_hours,
        }
    }

    pub fn column_name(&self) -> String {
        format!(
            "{}_{}_{}h",
            self.column.as_str(),
            self.action.as_str(),
            self.window_hours
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagRule {
    pub name: String,
    pub column: WeatherColumn,
    pub window_hours: u32,
    pub comparison: Comparison,
    pub threshold: f64,
}

impl FlagRule {
    pub fn freeze(window_hours: u32, threshold_c: f64) -> Self {
        Self {
            name: "freeze".to_string(),
            column: WeatherColumn::AirTemperature,
            window_hours,
            comparison: Comparison::AtOrBelow,
            threshold: threshold_c,
        }
    }

    pub fn column_name(&self) -> String {
        format!("flag_{}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    pub station_selection: StationSelection,
    pub carry_forward_hours: u32,
    pub aggregates: Vec<WindowAggregate>,
    pub flags: Vec<FlagRule>,
}

impl WeatherConfig {
    pub fn lookback_hours(&self) -> usize {
        let widest = self
            .aggregates
            .iter()
            .map(|a| a.window_hours)
            .chain(self.flags.iter().map(|f| f.window_hours))
            .max()
            .unwrap_or(1);
        widest.saturating_sub(1) as usize + self.carry_forward_hours as usize
    }
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            station_selection: StationSelection::Nearest,
            carry_forward_hours: 1,
            aggregates: vec![
                WindowAggregate::new(
                    WeatherColumn::AirTemperature,
                    AggregateAction::Min,
                    DEFAULT_ROLLING_WINDOW_HOURS,
                ),
                WindowAggregate::new(
                    WeatherColumn::AirTemperature,
                    AggregateAction::Max,
                    DEFAULT_ROLLING_WINDOW_HOURS,
                ),
                WindowAggregate::new(WeatherColumn::Precipitation, AggregateAction::Sum, 24),
                WindowAggregate::new(
                    WeatherColumn::SnowDepth,
                    AggregateAction::Max,
                    DEFAULT_ROLLING_WINDOW_HOURS,
                ),
                WindowAggregate::new(WeatherColumn::GustSpeed, AggregateAction::Max, 24),
            ],
            flags: vec![FlagRule::freeze(
                DEFAULT_ROLLING_WINDOW_HOURS,
                DEFAULT_FREEZE_THRESHOLD_C,
            )],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainCountConfig {
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentCategory {
    pub name: String,
    #[serde(default)]
    pub cause_codes: Vec<String>,
}

impl IncidentCategory {
    pub fn new(name: &str, cause_codes: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            cause_codes: cause_codes.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn column_name(&self) -> String {
        format!("INCIDENT_{}", column_suffix(&self.name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentConfig {
    pub categories: Vec<IncidentCategory>,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            categories: vec![
                IncidentCategory::new("signal", &["IA", "IB", "IC", "ID"]),
                IncidentCategory::new("track", &["IQ", "IR", "IS", "IT"]),
                IncidentCategory::new("weather", &["XW", "XT", "JX"]),
                IncidentCategory::new("fleet", &["MT", "MU", "MV"]),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub root: PathBuf,
    pub max_write_retries: u32,
    pub retry_backoff_ms: u64,
    // Days built and written per pass; the whole range at once when absent.
    pub chunk_days: Option<u32>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/features"),
            max_write_retries: 2,
            retry_backoff_ms: 200,
            chunk_days: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub segments: Option<Vec<String>>,
    pub weather: WeatherConfig,
    pub trains: TrainCountConfig,
    pub incidents: IncidentConfig,
    pub output: OutputConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_weather(&self.weather)?;
        validate_trains(&self.trains)?;
        validate_incidents(&self.incidents)?;

        if self.output.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "output.root must not be empty".to_string(),
            ));
        }
        if self.output.chunk_days == Some(0) {
            return Err(ConfigError::Invalid(
                "output.chunk_days must be > 0 when set".to_string(),
            ));
        }

        if let Some(segments) = &self.segments {
            if segments.iter().any(|s| s.trim().is_empty()) {
                return Err(ConfigError::Invalid(
                    "segments entries must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

pub fn load_pipeline_config(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: PipelineConfig =
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    config.validate()?;
    Ok(config)
}

pub fn pipeline_config_from_env() -> Result<PipelineConfig, ConfigError> {
    let mut config = match env::var("RAIL_FEATURES_CONFIG") {
        Ok(path) if !path.trim().is_empty() => load_pipeline_config(Path::new(path.trim()))?,
        _ => PipelineConfig::default(),
    };

    if let Ok(root) = env::var("RAIL_FEATURES_OUTPUT_ROOT") {
        let trimmed = root.trim();
        if !trimmed.is_empty() {
            config.output.root = PathBuf::from(trimmed);
        }
    }

    if let Ok(days) = env::var("RAIL_FEATURES_CHUNK_DAYS") {
        let trimmed = days.trim();
        if !trimmed.is_empty() {
            let parsed = trimmed.parse::<u32>().map_err(|err| {
                ConfigError::Invalid(format!("RAIL_FEATURES_CHUNK_DAYS={trimmed}: {err}"))
            })?;
            config.output.chunk_days = Some(parsed);
        }
    }

    config.validate()?;
    Ok(config)
}

pub fn column_suffix(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_uppercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

fn validate_weather(cfg: &WeatherConfig) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for aggregate in &cfg.aggregates {
        if aggregate.window_hours == 0 {
            return Err(ConfigError::Invalid(format!(
                "weather aggregate {} must have window_hours > 0",
                aggregate.column_name()
            )));
        }
        if !names.insert(aggregate.column_name()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate weather aggregate {}",
                aggregate.column_name()
            )));
        }
    }

    for flag in &cfg.flags {
        let valid_name = !flag.name.is_empty()
            && flag
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid_name {
            return Err(ConfigError::Invalid(format!(
                "flag name '{}' must be non-empty snake_case",
                flag.name
            )));
        }
        if flag.window_hours == 0 {
            return Err(ConfigError::Invalid(format!(
                "flag {} must have window_hours > 0",
                flag.name
            )));
        }
        if !flag.threshold.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "flag {} threshold must be finite",
                flag.name
            )));
        }
        if !names.insert(flag.column_name()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate weather flag {}",
                flag.name
            )));
        }
    }

    Ok(())
}

fn validate_trains(cfg: &TrainCountConfig) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for category in &cfg.categories {
        let suffix = column_suffix(category);
        if suffix.is_empty() || suffix == "OTHER" {
            return Err(ConfigError::Invalid(format!(
                "train category '{category}' is empty or reserved"
            )));
        }
        if !seen.insert(suffix) {
            return Err(ConfigError::Invalid(format!(
                "duplicate train category '{category}'"
            )));
        }
    }
    Ok(())
}

fn validate_incidents(cfg: &IncidentConfig) -> Result<(), ConfigError> {
    let mut suffixes = HashSet::new();
    let mut codes = HashSet::new();
    for category in &cfg.categories {
        let suffix = column_suffix(&category.name);
        if suffix.is_empty() || RESERVED_INCIDENT_SUFFIXES.contains(&suffix.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "incident category '{}' is empty or reserved",
                category.name
            )));
        }
        if !suffixes.insert(suffix) {
            return Err(ConfigError::Invalid(format!(
                "duplicate incident category '{}'",
                category.name
            )));
        }
        for code in std::iter::once(&category.name).chain(&category.cause_codes) {
            if !codes.insert(code.trim().to_ascii_uppercase()) {
                return Err(ConfigError::Invalid(format!(
                    "cause code '{code}' is claimed by more than one incident category"
                )));
            }
        }
    }
    Ok(())
}
