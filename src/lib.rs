//! Railway segment-hour feature pipeline.
//!
//! Turns weather observations, timetable hops and incident logs into one
//! complete feature row per (track segment, hour):
//! - segment registry and canonical timebase
//! - weather alignment, rolling aggregates and flags
//! - train counts and incident summaries
//! - grid join and partitioned, atomic output

mod config;
mod features;
mod incidents;
mod observability;
mod partition;
mod pipeline;
mod registry;
mod sources;
mod timebase;
mod train_counts;
mod weather;

pub use config::{
    column_suffix, load_pipeline_config, pipeline_config_from_env, AggregateAction, Comparison,
    ConfigError, FlagRule, IncidentCategory, IncidentConfig, OutputConfig, PipelineConfig,
    StationSelection, TrainCountConfig, WeatherColumn, WeatherConfig, WindowAggregate,
    DEFAULT_FREEZE_THRESHOLD_C, DEFAULT_ROLLING_WINDOW_HOURS,
};
pub use features::{
    assert_schema_compatible, build_feature_schema, join_features, FeatureColumn, FeatureDType,
    FeatureRow, FeatureSchema, FeatureTable, FeatureValue, GridIntegrityError, SchemaError,
    FEATURE_SCHEMA_VERSION, HOUR_START_COLUMN, INCIDENT_PREFIX, SEGMENT_COLUMN,
    TRAIN_COUNT_COLUMN, WEATHER_STATION_COLUMN,
};
pub use incidents::{
    summarize_incidents, CauseClassifier, IncidentFeatureRow, IncidentFeatures, IncidentRecord,
    IncidentReport, INCIDENT_FEED,
};
pub use observability::{
    init_logging, log_app_start, log_run_summary, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use partition::{
    arrow_schema, encode_partition, read_schema_file, write_partitions, write_schema_file,
    FsPartitionSink, PartitionKey, PartitionSink, PartitionWriteError, PartitionWriteOutcome,
    PARTITION_FILE_NAME, SCHEMA_FILE_NAME,
};
pub use pipeline::{
    create_datasets, create_datasets_for_range, create_datasets_with_sink, PipelineError,
    PipelineInputs, PipelineStage, RunReport, StageError,
};
pub use registry::{
    normalize_location, LocationMapping, MappingError, MappingReport, RegistryError,
    SegmentCode, SegmentRegistry, StationCandidate,
};
pub use sources::{
    BankHolidaysJsonFeed, CsvFeed, ExpandedScheduleFeed, FeedRecord, FeedSource, InMemoryFeed,
    SourceError,
};
pub use timebase::{
    build_timebase, cyclical_encoding, truncate_to_hour, Holiday, HolidayCalendar, HourBucket,
    HourRange, InvalidRangeError, SegmentHourKey, Timebase,
};
pub use train_counts::{
    count_train_hops, expand_schedules, ScheduleExpansion, ScheduleRecord, TrainCountReport,
    TrainCountRow, TrainCounts, TrainHop, TRAIN_HOP_FEED,
};
pub use weather::{
    align_weather, align_weather_window, reporting_stations, rolling_aggregate,
    WeatherFeatureRow, WeatherFeatures, WeatherMeasurements, WeatherRecord, WeatherReport,
    WeatherWindow, WEATHER_FEED,
};
