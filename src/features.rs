//! Feature schema and the grid join of the three builder outputs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::config::{column_suffix, PipelineConfig, WeatherColumn};
use crate::incidents::IncidentFeatureRow;
use crate::timebase::{SegmentHourKey, Timebase};
use crate::train_counts::TrainCountRow;
use crate::weather::WeatherFeatureRow;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

pub const SEGMENT_COLUMN: &str = "ELR_MIL";
pub const HOUR_START_COLUMN: &str = "hour_start";
pub const WEATHER_STATION_COLUMN: &str = "weather_station";
pub const TRAIN_COUNT_COLUMN: &str = "train_count";
pub const INCIDENT_PREFIX: &str = "INCIDENT_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureDType {
    Utf8,
    Int32,
    Int64,
    Float64,
    Boolean,
    TimestampMs,
}

impl FeatureDType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Utf8 => "utf8",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::Boolean => "boolean",
            Self::TimestampMs => "timestamp_ms",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
    pub nullable: bool,
}

impl FeatureColumn {
    fn required(name: impl Into<String>, dtype: FeatureDType) -> Self {
        Self {
            name: name.into(),
            dtype,
            nullable: false,
        }
    }

    fn nullable(name: impl Into<String>, dtype: FeatureDType) -> Self {
        Self {
            name: name.into(),
            dtype,
            nullable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeatureValue {
    Utf8(Option<String>),
    Int32(Option<i32>),
    Int64(i64),
    Float64(Option<f64>),
    Boolean(bool),
    TimestampMs(i64),
}

impl FeatureValue {
    pub fn dtype(&self) -> FeatureDType {
        match self {
            Self::Utf8(_) => FeatureDType::Utf8,
            Self::Int32(_) => FeatureDType::Int32,
            Self::Int64(_) => FeatureDType::Int64,
            Self::Float64(_) => FeatureDType::Float64,
            Self::Boolean(_) => FeatureDType::Boolean,
            Self::TimestampMs(_) => FeatureDType::TimestampMs,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(
            self,
            Self::Utf8(None) | Self::Int32(None) | Self::Float64(None)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub key: SegmentHourKey,
    pub values: Vec<FeatureValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub schema: FeatureSchema,
    pub rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn value(&self, row: usize, column: &str) -> Option<&FeatureValue> {
        let idx = self.schema.column_index(column)?;
        self.rows.get(row)?.values.get(idx)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },
    #[error("existing schema {path} is unreadable: {message}")]
    Unreadable { path: PathBuf, message: String },
}

// Builder output that does not line up with the grid. Always a bug in a
// builder, never a data-quality condition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GridIntegrityError {
    #[error("{builder} output is missing grid key {key}")]
    MissingKey {
        builder: &'static str,
        key: SegmentHourKey,
    },
    #[error("{builder} output repeats grid key {key}")]
    DuplicateKey {
        builder: &'static str,
        key: SegmentHourKey,
    },
    #[error("{builder} output has key {key} outside the grid")]
    ForeignKey {
        builder: &'static str,
        key: SegmentHourKey,
    },
    #[error("{builder} produced {actual} rows, grid has {expected}")]
    RowCountMismatch {
        builder: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{builder} row {key} has {actual} values, expected {expected}")]
    ColumnCountMismatch {
        builder: &'static str,
        key: SegmentHourKey,
        expected: usize,
        actual: usize,
    },
}

pub fn build_feature_schema(cfg: &PipelineConfig) -> FeatureSchema {
    let mut columns = vec![
        FeatureColumn::required(SEGMENT_COLUMN, FeatureDType::Utf8),
        FeatureColumn::required(HOUR_START_COLUMN, FeatureDType::TimestampMs),
    ];
    for name in [
        "year",
        "month",
        "day",
        "hour",
        "day_of_week",
        "day_of_year",
    ] {
        columns.push(FeatureColumn::required(name, FeatureDType::Int32));
    }
    for name in ["sin_hod", "cos_hod", "sin_doy", "cos_doy"] {
        columns.push(FeatureColumn::required(name, FeatureDType::Float64));
    }
    columns.push(FeatureColumn::required("is_weekend", FeatureDType::Boolean));
    columns.push(FeatureColumn::required("is_holiday", FeatureDType::Boolean));

    columns.push(FeatureColumn::nullable(
        WEATHER_STATION_COLUMN,
        FeatureDType::Utf8,
    ));
    for column in WeatherColumn::ALL {
        let dtype = if column == WeatherColumn::PresentWeatherCode {
            FeatureDType::Int32
        } else {
            FeatureDType::Float64
        };
        columns.push(FeatureColumn::nullable(column.as_str(), dtype));
    }
    for aggregate in &cfg.weather.aggregates {
        columns.push(FeatureColumn::nullable(
            aggregate.column_name(),
            FeatureDType::Float64,
        ));
    }
    for flag in &cfg.weather.flags {
        columns.push(FeatureColumn::required(
            flag.column_name(),
            FeatureDType::Boolean,
        ));
    }

    columns.push(FeatureColumn::required(
        TRAIN_COUNT_COLUMN,
        FeatureDType::Int64,
    ));
    if !cfg.trains.categories.is_empty() {
        for category in &cfg.trains.categories {
            columns.push(FeatureColumn::required(
                format!("{TRAIN_COUNT_COLUMN}_{}", column_suffix(category).to_ascii_lowercase()),
                FeatureDType::Int64,
            ));
        }
        columns.push(FeatureColumn::required(
            format!("{TRAIN_COUNT_COLUMN}_other"),
            FeatureDType::Int64,
        ));
    }

    columns.push(FeatureColumn::required(
        format!("{INCIDENT_PREFIX}TOTAL"),
        FeatureDType::Int64,
    ));
    for category in &cfg.incidents.categories {
        columns.push(FeatureColumn::required(
            category.column_name(),
            FeatureDType::Int64,
        ));
    }
    columns.push(FeatureColumn::required(
        format!("{INCIDENT_PREFIX}OTHER"),
        FeatureDType::Int64,
    ));
    columns.push(FeatureColumn::required(
        format!("{INCIDENT_PREFIX}DELAY_MINUTES"),
        FeatureDType::Float64,
    ));
    columns.push(FeatureColumn::required(
        format!("{INCIDENT_PREFIX}FLAG"),
        FeatureDType::Boolean,
    ));

    let fingerprint = schema_fingerprint(FEATURE_SCHEMA_VERSION, &columns);

    info!(
        component = "features",
        event = "features.schema.built",
        version = FEATURE_SCHEMA_VERSION,
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        fingerprint,
        columns,
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), SchemaError> {
    if expected_version != actual.version {
        return Err(SchemaError::VersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(SchemaError::FingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

pub fn join_features(
    timebase: &Timebase,
    weather: &[WeatherFeatureRow],
    trains: &[TrainCountRow],
    incidents: &[IncidentFeatureRow],
    cfg: &PipelineConfig,
) -> Result<FeatureTable, GridIntegrityError> {
    let schema = build_feature_schema(cfg);

    info!(
        component = "features",
        event = "features.join.start",
        grid_rows = timebase.len(),
        weather_rows = weather.len(),
        train_rows = trains.len(),
        incident_rows = incidents.len()
    );

    let weather = index_by_grid("weather", timebase, weather, |r| &r.key)?;
    let trains = index_by_grid("train_counts", timebase, trains, |r| &r.key)?;
    let incidents = index_by_grid("incidents", timebase, incidents, |r| &r.key)?;

    let train_slots = if cfg.trains.categories.is_empty() {
        0
    } else {
        cfg.trains.categories.len() + 1
    };
    let incident_slots = cfg.incidents.categories.len() + 1;

    let mut rows = Vec::with_capacity(timebase.len());
    for (position, key) in timebase.keys().enumerate() {
        let bucket = &timebase.hours()[position % timebase.hour_count()];
        let weather_row = weather[position];
        let train_row = trains[position];
        let incident_row = incidents[position];

        check_width("weather", &key, cfg.weather.aggregates.len(), weather_row.aggregates.len())?;
        check_width("weather", &key, cfg.weather.flags.len(), weather_row.flags.len())?;
        check_width("train_counts", &key, train_slots, train_row.by_category.len())?;
        check_width("incidents", &key, incident_slots, incident_row.by_category.len())?;

        let mut values = Vec::with_capacity(schema.columns.len());
        values.push(FeatureValue::Utf8(Some(key.segment.to_string())));
        values.push(FeatureValue::TimestampMs(
            key.hour.and_utc().timestamp_millis(),
        ));
        values.extend(
            [
                bucket.year,
                bucket.month as i32,
                bucket.day as i32,
                bucket.hour as i32,
                bucket.day_of_week as i32,
                bucket.day_of_year as i32,
            ]
            .map(|v| FeatureValue::Int32(Some(v))),
        );
        values.extend(
            [bucket.sin_hod, bucket.cos_hod, bucket.sin_doy, bucket.cos_doy]
                .map(|v| FeatureValue::Float64(Some(v))),
        );
        values.push(FeatureValue::Boolean(bucket.is_weekend));
        values.push(FeatureValue::Boolean(bucket.is_holiday));

        values.push(FeatureValue::Utf8(weather_row.station.clone()));
        for column in WeatherColumn::ALL {
            values.push(if column == WeatherColumn::PresentWeatherCode {
                FeatureValue::Int32(weather_row.measurements.present_weather_code())
            } else {
                FeatureValue::Float64(weather_row.measurements.get(column))
            });
        }
        values.extend(weather_row.aggregates.iter().map(|v| FeatureValue::Float64(*v)));
        values.extend(weather_row.flags.iter().map(|v| FeatureValue::Boolean(*v)));

        values.push(FeatureValue::Int64(count(train_row.total)));
        values.extend(
            train_row
                .by_category
                .iter()
                .map(|v| FeatureValue::Int64(count(*v))),
        );

        values.push(FeatureValue::Int64(count(incident_row.total)));
        values.extend(
            incident_row
                .by_category
                .iter()
                .map(|v| FeatureValue::Int64(count(*v))),
        );
        values.push(FeatureValue::Float64(Some(incident_row.delay_minutes)));
        values.push(FeatureValue::Boolean(incident_row.flag()));

        check_width("join", &key, schema.columns.len(), values.len())?;
        rows.push(FeatureRow { key, values });
    }

    if rows.len() != timebase.len() {
        return Err(GridIntegrityError::RowCountMismatch {
            builder: "join",
            expected: timebase.len(),
            actual: rows.len(),
        });
    }

    info!(
        component = "features",
        event = "features.join.complete",
        rows = rows.len(),
        column_count = schema.columns.len()
    );

    Ok(FeatureTable { schema, rows })
}

fn index_by_grid<'a, R>(
    builder: &'static str,
    timebase: &Timebase,
    rows: &'a [R],
    key_of: impl Fn(&R) -> &SegmentHourKey,
) -> Result<Vec<&'a R>, GridIntegrityError> {
    let mut slots: Vec<Option<&'a R>> = vec![None; timebase.len()];
    for row in rows {
        let key = key_of(row);
        let position = timebase
            .position_of(&key.segment, key.hour)
            .filter(|position| timebase.key_at(*position).as_ref() == Some(key))
            .ok_or_else(|| GridIntegrityError::ForeignKey {
                builder,
                key: key.clone(),
            })?;
        if slots[position].replace(row).is_some() {
            return Err(GridIntegrityError::DuplicateKey {
                builder,
                key: key.clone(),
            });
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(position, slot)| {
            slot.ok_or_else(|| GridIntegrityError::MissingKey {
                builder,
                key: timebase
                    .key_at(position)
                    .expect("grid position is within the timebase"),
            })
        })
        .collect()
}

fn check_width(
    builder: &'static str,
    key: &SegmentHourKey,
    expected: usize,
    actual: usize,
) -> Result<(), GridIntegrityError> {
    if expected != actual {
        return Err(GridIntegrityError::ColumnCountMismatch {
            builder,
            key: key.clone(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn schema_fingerprint(version: u32, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};"));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(format!(
            ":{}:{};",
            column.dtype.as_str(),
            if column.nullable { "null" } else { "required" }
        ));
    }
    hex::encode(hasher.finalize())
}
