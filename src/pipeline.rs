//! End-to-end dataset creation for one contiguous range.
//!
//! Long ranges can be built in consecutive windows (`output.chunk_days`).
//! Each window replays the weather hours its rolling windows reach back into
//! and selects stations from the run-wide reporting set, so a windowed run
//! writes the same bytes as a single pass.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, PipelineConfig};
use crate::features::{
    assert_schema_compatible, build_feature_schema, join_features, FeatureSchema,
    GridIntegrityError, SchemaError,
};
use crate::incidents::{summarize_incidents, IncidentFeatures, IncidentRecord, IncidentReport};
use crate::observability::log_run_summary;
use crate::partition::{
    read_schema_file, write_partitions, write_schema_file, FsPartitionSink, PartitionSink,
    PartitionWriteError,
};
use crate::registry::{LocationMapping, RegistryError, SegmentCode, SegmentRegistry};
use crate::sources::{FeedSource, SourceError};
use crate::timebase::{
    build_timebase, Holiday, HolidayCalendar, HourRange, InvalidRangeError, Timebase,
};
use crate::train_counts::{count_train_hops, TrainCountReport, TrainCounts, TrainHop};
use crate::weather::{
    align_weather_window, reporting_stations, WeatherFeatures, WeatherRecord, WeatherReport,
    WeatherWindow,
};

pub struct PipelineInputs {
    pub mappings: Box<dyn FeedSource<LocationMapping>>,
    pub weather: Box<dyn FeedSource<WeatherRecord>>,
    pub train_hops: Box<dyn FeedSource<TrainHop>>,
    pub incidents: Box<dyn FeedSource<IncidentRecord>>,
    pub holidays: Option<Box<dyn FeedSource<Holiday>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Config,
    Registry,
    Timebase,
    Weather,
    TrainCounts,
    Incidents,
    Join,
    Write,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Config => "config",
            Self::Registry => "registry",
            Self::Timebase => "timebase",
            Self::Weather => "weather",
            Self::TrainCounts => "train_counts",
            Self::Incidents => "incidents",
            Self::Join => "join",
            Self::Write => "write",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Range(#[from] InvalidRangeError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Grid(#[from] GridIntegrityError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Write(#[from] PartitionWriteError),
}

#[derive(Debug, Error)]
#[error(
    "pipeline failed at stage {stage} ({} partitions committed, {} failed): {source}",
    .committed_partitions.len(),
    .failed_partitions.len()
)]
pub struct PipelineError {
    pub stage: PipelineStage,
    pub committed_partitions: Vec<PathBuf>,
    pub failed_partitions: Vec<PathBuf>,
    #[source]
    pub source: StageError,
}

impl PipelineError {
    fn at(stage: PipelineStage, source: impl Into<StageError>) -> Self {
        Self {
            stage,
            committed_partitions: Vec::new(),
            failed_partitions: Vec::new(),
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub range: HourRange,
    pub windows: usize,
    pub segments: usize,
    pub hours: usize,
    pub rows: usize,
    pub holidays_in_calendar: usize,
    pub schema: FeatureSchema,
    pub committed_partitions: Vec<PathBuf>,
    pub weather: WeatherReport,
    pub trains: TrainCountReport,
    pub incidents: IncidentReport,
}

// Shared, read-only state for every window of one run.
struct RunContext<'a> {
    range: HourRange,
    cfg: &'a PipelineConfig,
    inputs: &'a PipelineInputs,
    sink: &'a dyn PartitionSink,
    registry: &'a SegmentRegistry,
    active: &'a [SegmentCode],
    holidays: &'a HolidayCalendar,
    reporting: Option<&'a HashSet<String>>,
}

struct WindowOutcome {
    rows: usize,
    committed: Vec<PathBuf>,
    weather: WeatherReport,
    trains: TrainCountReport,
    incidents: IncidentReport,
}

pub fn create_datasets(
    start_date: NaiveDate,
    end_date: NaiveDate,
    cfg: &PipelineConfig,
    inputs: &PipelineInputs,
) -> Result<RunReport, PipelineError> {
    let range = HourRange::from_dates(start_date, end_date)
        .map_err(|err| PipelineError::at(PipelineStage::Timebase, err))?;
    create_datasets_for_range(range, cfg, inputs)
}

pub fn create_datasets_for_range(
    range: HourRange,
    cfg: &PipelineConfig,
    inputs: &PipelineInputs,
) -> Result<RunReport, PipelineError> {
    let sink = FsPartitionSink::new(&cfg.output.root);
    create_datasets_with_sink(range, cfg, inputs, &sink)
}

pub fn create_datasets_with_sink(
    range: HourRange,
    cfg: &PipelineConfig,
    inputs: &PipelineInputs,
    sink: &dyn PartitionSink,
) -> Result<RunReport, PipelineError> {
    cfg.validate()
        .map_err(|err| PipelineError::at(PipelineStage::Config, err))?;

    let windows = match cfg.output.chunk_days {
        Some(days) => range.chunks(days as usize * 24),
        None => vec![range],
    };

    info!(
        component = "pipeline",
        event = "pipeline.start",
        start = %range.start(),
        end = %range.end(),
        hours = range.hour_count(),
        windows = windows.len(),
        output_root = %cfg.output.root.display()
    );

    let registry = load_registry(&range, inputs)
        .map_err(|err| PipelineError::at(PipelineStage::Registry, err))?;
    let active = registry
        .active_segments(cfg.segments.as_deref())
        .map_err(|err| PipelineError::at(PipelineStage::Registry, err))?;
    let holidays = load_holidays(&range, inputs);

    let schema = build_feature_schema(cfg);
    check_existing_schema(&schema, sink)
        .map_err(|err| PipelineError::at(PipelineStage::Write, err))?;

    let reporting = if windows.len() > 1 {
        let stations = collect_reporting_stations(&windows, &registry, inputs)
            .map_err(|err| PipelineError::at(PipelineStage::Weather, err))?;
        Some(stations)
    } else {
        None
    };

    let ctx = RunContext {
        range,
        cfg,
        inputs,
        sink,
        registry: &registry,
        active: &active,
        holidays: &holidays,
        reporting: reporting.as_ref(),
    };

    let mut committed: Vec<PathBuf> = Vec::new();
    let mut rows = 0;
    let mut weather = WeatherReport::default();
    let mut trains = TrainCountReport::default();
    let mut incidents = IncidentReport::default();
    for window in &windows {
        let outcome = match run_window(*window, &ctx) {
            Ok(outcome) => outcome,
            Err(mut err) => {
                committed.append(&mut err.committed_partitions);
                err.committed_partitions = committed;
                return Err(err);
            }
        };
        rows += outcome.rows;
        committed.extend(outcome.committed);
        weather.absorb(outcome.weather);
        trains.absorb(outcome.trains);
        incidents.absorb(outcome.incidents);
    }

    if let Err(err) = write_schema_file(&schema, sink, &cfg.output) {
        return Err(PipelineError {
            stage: PipelineStage::Write,
            committed_partitions: committed,
            failed_partitions: vec![err.path().to_path_buf()],
            source: err.into(),
        });
    }

    let report = RunReport {
        range,
        windows: windows.len(),
        segments: active.len(),
        hours: range.hour_count(),
        rows,
        holidays_in_calendar: holidays.len(),
        schema,
        committed_partitions: committed,
        weather,
        trains,
        incidents,
    };
    log_run_summary(&report);
    Ok(report)
}

fn run_window(window: HourRange, ctx: &RunContext<'_>) -> Result<WindowOutcome, PipelineError> {
    let cfg = ctx.cfg;
    let timebase = build_timebase(window, ctx.active.iter().cloned(), ctx.holidays);
    let weather_span = window.extend_back(cfg.weather.lookback_hours(), ctx.range.start());
    let weather_window = WeatherWindow {
        warmup_hours: weather_span.hour_count() - window.hour_count(),
        reporting_stations: ctx.reporting,
    };

    let (weather, (trains, incidents)) = rayon::join(
        || build_weather(&timebase, ctx, &weather_span, weather_window),
        || {
            rayon::join(
                || build_train_counts(&timebase, ctx),
                || build_incidents(&timebase, ctx),
            )
        },
    );
    let weather = weather.map_err(|err| PipelineError::at(PipelineStage::Weather, err))?;
    let trains = trains.map_err(|err| PipelineError::at(PipelineStage::TrainCounts, err))?;
    let incidents =
        incidents.map_err(|err| PipelineError::at(PipelineStage::Incidents, err))?;

    let table = join_features(
        &timebase,
        &weather.rows,
        &trains.rows,
        &incidents.rows,
        cfg,
    )
    .map_err(|err| PipelineError::at(PipelineStage::Join, err))?;

    let outcome = write_partitions(&table, ctx.sink, &cfg.output);
    if !outcome.is_complete() {
        let failed_partitions: Vec<PathBuf> = outcome
            .failed
            .iter()
            .map(|err| err.path().to_path_buf())
            .collect();
        let mut failed = outcome.failed;
        let first = failed.remove(0);
        return Err(PipelineError {
            stage: PipelineStage::Write,
            committed_partitions: outcome.committed,
            failed_partitions,
            source: first.into(),
        });
    }

    debug!(
        component = "pipeline",
        event = "pipeline.window.complete",
        start = %window.start(),
        end = %window.end(),
        rows = table.rows.len()
    );

    Ok(WindowOutcome {
        rows: table.rows.len(),
        committed: outcome.committed,
        weather: weather.report,
        trains: trains.report,
        incidents: incidents.report,
    })
}

fn check_existing_schema(
    schema: &FeatureSchema,
    sink: &dyn PartitionSink,
) -> Result<(), SchemaError> {
    let Some(existing) = read_schema_file(sink)? else {
        return Ok(());
    };
    assert_schema_compatible(existing.version, &existing.fingerprint, schema).map_err(|err| {
        warn!(
            component = "pipeline",
            event = "pipeline.schema.incompatible",
            error = %err
        );
        err
    })
}

fn collect_reporting_stations(
    windows: &[HourRange],
    registry: &SegmentRegistry,
    inputs: &PipelineInputs,
) -> Result<HashSet<String>, SourceError> {
    let mut stations = HashSet::new();
    for window in windows {
        let records = inputs.weather.load(window)?;
        stations.extend(reporting_stations(registry, &records, window));
    }
    info!(
        component = "pipeline",
        event = "pipeline.weather.stations",
        reporting_stations = stations.len()
    );
    Ok(stations)
}

fn load_registry(range: &HourRange, inputs: &PipelineInputs) -> Result<SegmentRegistry, StageError> {
    let mappings = inputs.mappings.load(range)?;
    Ok(SegmentRegistry::from_mappings(mappings)?)
}

fn load_holidays(range: &HourRange, inputs: &PipelineInputs) -> HolidayCalendar {
    let Some(feed) = &inputs.holidays else {
        return HolidayCalendar::default();
    };
    match feed.load(range) {
        Ok(holidays) => HolidayCalendar::from_holidays(&holidays),
        Err(err) => {
            warn!(
                component = "pipeline",
                event = "pipeline.holidays.unavailable",
                feed = %feed.name(),
                error = %err
            );
            HolidayCalendar::default()
        }
    }
}

fn build_weather(
    timebase: &Timebase,
    ctx: &RunContext<'_>,
    span: &HourRange,
    window: WeatherWindow<'_>,
) -> Result<WeatherFeatures, SourceError> {
    let records = ctx.inputs.weather.load(span)?;
    Ok(align_weather_window(
        timebase,
        ctx.registry,
        &records,
        &ctx.cfg.weather,
        window,
    ))
}

fn build_train_counts(timebase: &Timebase, ctx: &RunContext<'_>) -> Result<TrainCounts, SourceError> {
    let hops = ctx.inputs.train_hops.load(timebase.range())?;
    Ok(count_train_hops(timebase, ctx.registry, &hops, &ctx.cfg.trains))
}

fn build_incidents(
    timebase: &Timebase,
    ctx: &RunContext<'_>,
) -> Result<IncidentFeatures, SourceError> {
    let records = ctx.inputs.incidents.load(timebase.range())?;
    Ok(summarize_incidents(timebase, ctx.registry, &records, &ctx.cfg.incidents))
}
