use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use arrow::array::{Array, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use chrono::{NaiveDate, NaiveDateTime};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use rail_features::{
    align_weather, build_timebase, count_train_hops, create_datasets, create_datasets_for_range,
    create_datasets_with_sink, join_features, summarize_incidents, FeatureSchema, FeedSource,
    FsPartitionSink, GridIntegrityError, Holiday, HolidayCalendar, HourRange, InMemoryFeed,
    IncidentCategory, IncidentRecord, LocationMapping, PartitionKey, PartitionSink,
    PipelineConfig, PipelineInputs, PipelineStage, SchemaError, SegmentCode, SegmentHourKey,
    SourceError, StageError, StationSelection, TrainHop, WeatherRecord, SCHEMA_FILE_NAME,
};
use tempfile::tempdir;

fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, d)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
}

fn mapping(location: &str, bucket: u32, distance_m: f64) -> LocationMapping {
    LocationMapping {
        location_code: location.to_string(),
        elr: "ECM1".to_string(),
        mile_bucket: bucket,
        distance_m,
    }
}

fn temp(hour: u32, value: f64) -> WeatherRecord {
    WeatherRecord {
        air_temperature: Some(value),
        ..WeatherRecord::new("STN1", at(1, hour, 0))
    }
}

fn three_hour_range() -> HourRange {
    HourRange::from_hours(at(1, 0, 0), at(1, 2, 0)).unwrap()
}

fn example_inputs() -> PipelineInputs {
    PipelineInputs {
        mappings: Box::new(InMemoryFeed::new(
            "mappings",
            vec![mapping("STN1", 5, 120.0), mapping("87701", 5, 15.0)],
        )),
        weather: Box::new(InMemoryFeed::new(
            "weather",
            vec![temp(0, 2.0), temp(1, -1.0), temp(2, -3.0)],
        )),
        train_hops: Box::new(InMemoryFeed::new(
            "train_hops",
            vec![TrainHop {
                train_id: "1A01".to_string(),
                location: "87701".to_string(),
                entered_at: at(1, 1, 30),
                category: None,
            }],
        )),
        incidents: Box::new(InMemoryFeed::new(
            "incidents",
            vec![IncidentRecord {
                incident_id: Some("INC-1".to_string()),
                location: "87701".to_string(),
                started_at: at(1, 0, 45),
                delay_minutes: Some(7.0),
                cause_code: Some("signal".to_string()),
            }],
        )),
        holidays: None,
    }
}

fn config_for(root: &Path) -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.output.root = root.to_path_buf();
    cfg.output.retry_backoff_ms = 0;
    cfg
}

fn read_partition(path: &Path) -> RecordBatch {
    let file = File::open(path).expect("partition should exist");
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .expect("valid parquet footer")
        .build()
        .expect("reader should build");
    let mut batches: Vec<RecordBatch> = reader.collect::<Result<_, _>>().expect("batches decode");
    assert_eq!(batches.len(), 1);
    batches.remove(0)
}

fn int64(batch: &RecordBatch, name: &str) -> i64 {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
        .unwrap_or_else(|| panic!("int64 column {name}"))
        .value(0)
}

fn boolean(batch: &RecordBatch, name: &str) -> bool {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<BooleanArray>())
        .unwrap_or_else(|| panic!("bool column {name}"))
        .value(0)
}

fn float64(batch: &RecordBatch, name: &str) -> Option<f64> {
    let col = batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
        .unwrap_or_else(|| panic!("f64 column {name}"));
    (!col.is_null(0)).then(|| col.value(0))
}

fn files_under(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    fn walk(dir: &Path, root: &Path, out: &mut Vec<(PathBuf, Vec<u8>)>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(&path, root, out);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_path_buf();
                out.push((rel, fs::read(&path).unwrap()));
            }
        }
    }
    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}

#[test]
fn three_hour_segment_example_produces_expected_rows() {
    let dir = tempdir().unwrap();
    let cfg = config_for(dir.path());

    let report = create_datasets_for_range(three_hour_range(), &cfg, &example_inputs())
        .expect("pipeline should succeed");

    assert_eq!(report.segments, 1);
    assert_eq!(report.hours, 3);
    assert_eq!(report.rows, 3);
    assert_eq!(report.committed_partitions.len(), 3);
    assert!(report.trains.mapping.is_clean());

    let segment = SegmentCode::new("ECM1_005").unwrap();
    let expected = [
        // (train_count, incident total, signal, freeze)
        (0, 1, 1, false),
        (1, 0, 0, true),
        (0, 0, 0, true),
    ];
    for (hour, (trains, incidents, signal, freeze)) in expected.into_iter().enumerate() {
        let key = SegmentHourKey::new(segment.clone(), at(1, hour as u32, 0));
        let path = dir.path().join(PartitionKey::from_key(&key).relative_path());
        let batch = read_partition(&path);

        assert_eq!(batch.num_rows(), 1);
        assert_eq!(int64(&batch, "train_count"), trains, "hour {hour}");
        assert_eq!(int64(&batch, "INCIDENT_TOTAL"), incidents, "hour {hour}");
        assert_eq!(int64(&batch, "INCIDENT_SIGNAL"), signal, "hour {hour}");
        assert_eq!(int64(&batch, "INCIDENT_OTHER"), 0);
        assert_eq!(boolean(&batch, "flag_freeze"), freeze, "hour {hour}");
        assert_eq!(boolean(&batch, "INCIDENT_FLAG"), incidents > 0);

        let station = batch
            .column_by_name("weather_station")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .unwrap();
        assert_eq!(station.value(0), "STN1");
        let hour_col = batch
            .column_by_name("hour")
            .and_then(|c| c.as_any().downcast_ref::<Int32Array>())
            .unwrap();
        assert_eq!(hour_col.value(0), hour as i32);
        assert!(float64(&batch, "visibility").is_none());
    }

    let last = dir.path().join(
        PartitionKey::from_key(&SegmentHourKey::new(segment, at(1, 2, 0))).relative_path(),
    );
    let batch = read_partition(&last);
    assert_eq!(float64(&batch, "air_temperature"), Some(-3.0));
    assert_eq!(float64(&batch, "air_temperature_min_48h"), Some(-3.0));
    assert_eq!(float64(&batch, "INCIDENT_DELAY_MINUTES"), Some(0.0));

    let schema: FeatureSchema =
        serde_json::from_slice(&fs::read(dir.path().join(SCHEMA_FILE_NAME)).unwrap()).unwrap();
    assert_eq!(schema, report.schema);
}

#[test]
fn partitions_follow_segment_and_calendar_layout() {
    let dir = tempdir().unwrap();
    let cfg = config_for(dir.path());
    create_datasets_for_range(three_hour_range(), &cfg, &example_inputs()).unwrap();

    let paths: Vec<PathBuf> = files_under(dir.path()).into_iter().map(|(p, _)| p).collect();
    assert_eq!(
        paths,
        vec![
            PathBuf::from("ELR_MIL=ECM1_005/year=2024/month=1/day=1/hour=0/part-0.parquet"),
            PathBuf::from("ELR_MIL=ECM1_005/year=2024/month=1/day=1/hour=1/part-0.parquet"),
            PathBuf::from("ELR_MIL=ECM1_005/year=2024/month=1/day=1/hour=2/part-0.parquet"),
            PathBuf::from(SCHEMA_FILE_NAME),
        ]
    );
}

#[test]
fn rerunning_a_range_rewrites_identical_bytes() {
    let dir = tempdir().unwrap();
    let cfg = config_for(dir.path());
    let inputs = example_inputs();

    create_datasets_for_range(three_hour_range(), &cfg, &inputs).unwrap();
    let first = files_under(dir.path());
    create_datasets_for_range(three_hour_range(), &cfg, &inputs).unwrap();
    let second = files_under(dir.path());

    assert_eq!(first.len(), 4);
    assert_eq!(first, second);
}

#[test]
fn whole_day_range_and_allow_list() {
    let dir = tempdir().unwrap();
    let mut cfg = config_for(dir.path());
    cfg.segments = Some(vec!["ecm1_005".to_string()]);
    let mut inputs = example_inputs();
    inputs.mappings = Box::new(InMemoryFeed::new(
        "mappings",
        vec![
            mapping("STN1", 5, 120.0),
            mapping("87701", 5, 15.0),
            mapping("87702", 6, 15.0),
        ],
    ));

    let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let report = create_datasets(day, day, &cfg, &inputs).unwrap();
    assert_eq!(report.segments, 1);
    assert_eq!(report.rows, 24);
    assert_eq!(report.committed_partitions.len(), 24);
}

#[test]
fn inverted_dates_fail_before_anything_is_written() {
    let dir = tempdir().unwrap();
    let cfg = config_for(dir.path());
    let err = create_datasets(
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        &cfg,
        &example_inputs(),
    )
    .unwrap_err();

    assert_eq!(err.stage, PipelineStage::Timebase);
    assert!(matches!(err.source, StageError::Range(_)));
    assert!(err.committed_partitions.is_empty());
    assert!(files_under(dir.path()).is_empty());
}

#[test]
fn unknown_allow_list_segment_is_a_registry_failure() {
    let dir = tempdir().unwrap();
    let mut cfg = config_for(dir.path());
    cfg.segments = Some(vec!["ZZZ9_001".to_string()]);
    let err = create_datasets_for_range(three_hour_range(), &cfg, &example_inputs()).unwrap_err();
    assert_eq!(err.stage, PipelineStage::Registry);
}

struct FailingHolidays;

impl FeedSource<Holiday> for FailingHolidays {
    fn name(&self) -> &str {
        "bank_holidays"
    }

    fn load(&self, _range: &HourRange) -> Result<Vec<Holiday>, SourceError> {
        Err(SourceError::Io {
            path: PathBuf::from("bank-holidays.json"),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        })
    }
}

#[test]
fn unavailable_holiday_feed_degrades_to_no_holidays() {
    let dir = tempdir().unwrap();
    let cfg = config_for(dir.path());
    let mut inputs = example_inputs();
    inputs.holidays = Some(Box::new(FailingHolidays));

    let report = create_datasets_for_range(three_hour_range(), &cfg, &inputs).unwrap();
    assert_eq!(report.holidays_in_calendar, 0);
    assert_eq!(report.rows, 3);
}

/// Fails the first `failures` commits of every path; `broken` never commits.
struct FlakySink {
    inner: FsPartitionSink,
    failures: u32,
    broken: Option<PathBuf>,
    attempts: Mutex<HashMap<PathBuf, u32>>,
}

impl PartitionSink for FlakySink {
    fn commit(&self, relative_path: &Path, bytes: &[u8]) -> io::Result<()> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(relative_path.to_path_buf()).or_insert(0);
            *n += 1;
            *n
        };
        if self.broken.as_deref() == Some(relative_path) || attempt <= self.failures {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated storage fault"));
        }
        self.inner.commit(relative_path, bytes)
    }

    fn read(&self, relative_path: &Path) -> io::Result<Option<Vec<u8>>> {
        self.inner.read(relative_path)
    }
}

#[test]
fn transient_write_failures_are_retried() {
    let dir = tempdir().unwrap();
    let cfg = config_for(dir.path());
    let sink = FlakySink {
        inner: FsPartitionSink::new(dir.path()),
        failures: 2,
        broken: None,
        attempts: Mutex::new(HashMap::new()),
    };

    let report =
        create_datasets_with_sink(three_hour_range(), &cfg, &example_inputs(), &sink).unwrap();
    assert_eq!(report.committed_partitions.len(), 3);
    let attempts = sink.attempts.lock().unwrap();
    assert!(attempts.values().all(|n| *n == 3));
}

#[test]
fn persistent_write_failure_is_reported_per_partition() {
    let dir = tempdir().unwrap();
    let cfg = config_for(dir.path());
    let segment = SegmentCode::new("ECM1_005").unwrap();
    let broken = PartitionKey::from_key(&SegmentHourKey::new(segment, at(1, 1, 0))).relative_path();
    let sink = FlakySink {
        inner: FsPartitionSink::new(dir.path()),
        failures: 0,
        broken: Some(broken.clone()),
        attempts: Mutex::new(HashMap::new()),
    };

    let err = create_datasets_with_sink(three_hour_range(), &cfg, &example_inputs(), &sink)
        .unwrap_err();

    assert_eq!(err.stage, PipelineStage::Write);
    assert_eq!(err.failed_partitions, vec![broken.clone()]);
    assert_eq!(err.committed_partitions.len(), 2);
    assert!(!dir.path().join(&broken).exists());
    assert!(!dir.path().join(SCHEMA_FILE_NAME).exists());
    assert_eq!(
        sink.attempts.lock().unwrap()[&broken],
        cfg.output.max_write_retries + 1
    );
}

#[test]
fn incompatible_existing_schema_blocks_the_run() {
    let dir = tempdir().unwrap();
    let cfg = config_for(dir.path());
    let day_one = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    create_datasets(day_one, day_one, &cfg, &example_inputs()).unwrap();
    let before = files_under(dir.path());

    let mut widened = cfg.clone();
    widened
        .incidents
        .categories
        .push(IncidentCategory::new("trespass", &["XQ"]));
    let day_two = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
    let err = create_datasets(day_two, day_two, &widened, &example_inputs()).unwrap_err();

    assert_eq!(err.stage, PipelineStage::Write);
    assert!(matches!(
        err.source,
        StageError::Schema(SchemaError::FingerprintMismatch { .. })
    ));
    assert!(err.committed_partitions.is_empty());
    assert_eq!(files_under(dir.path()), before);

    // The matching layout still appends.
    create_datasets(day_two, day_two, &cfg, &example_inputs()).unwrap();
    assert_eq!(files_under(dir.path()).len(), before.len() + 24);
}

#[test]
fn corrupt_schema_file_is_reported_not_overwritten() {
    let dir = tempdir().unwrap();
    let cfg = config_for(dir.path());
    fs::write(dir.path().join(SCHEMA_FILE_NAME), "{ truncated").unwrap();

    let err = create_datasets_for_range(three_hour_range(), &cfg, &example_inputs()).unwrap_err();

    assert!(matches!(
        err.source,
        StageError::Schema(SchemaError::Unreadable { .. })
    ));
    assert_eq!(
        fs::read_to_string(dir.path().join(SCHEMA_FILE_NAME)).unwrap(),
        "{ truncated"
    );
    assert_eq!(files_under(dir.path()).len(), 1);
}

fn multi_day_inputs() -> PipelineInputs {
    let reading = |station: &str, observed_at, value| WeatherRecord {
        air_temperature: Some(value),
        ..WeatherRecord::new(station, observed_at)
    };
    let hop = |location: &str, entered_at| TrainHop {
        train_id: "2B07".to_string(),
        location: location.to_string(),
        entered_at,
        category: None,
    };
    PipelineInputs {
        mappings: Box::new(InMemoryFeed::new(
            "mappings",
            vec![
                mapping("STN1", 5, 120.0),
                mapping("NEAR", 5, 10.0),
                mapping("87701", 5, 15.0),
                LocationMapping {
                    elr: "ECM2".to_string(),
                    ..mapping("STN2", 6, 40.0)
                },
                LocationMapping {
                    elr: "ECM2".to_string(),
                    ..mapping("87702", 6, 5.0)
                },
            ],
        )),
        weather: Box::new(InMemoryFeed::new(
            "weather",
            vec![
                reading("STN1", at(1, 22, 0), 2.0),
                reading("STN1", at(1, 23, 10), -1.5),
                reading("STN1", at(2, 1, 0), 3.0),
                reading("STN2", at(1, 23, 0), -0.5),
                reading("STN2", at(2, 0, 0), 1.0),
                reading("STN2", at(3, 5, 0), 4.0),
                reading("NEAR", at(3, 12, 0), 6.0),
                reading("GHOST", at(2, 3, 0), 9.0),
            ],
        )),
        train_hops: Box::new(InMemoryFeed::new(
            "train_hops",
            vec![
                hop("87701", at(1, 23, 55)),
                hop("87702", at(2, 0, 5)),
                hop("87701", at(3, 8, 0)),
            ],
        )),
        incidents: Box::new(InMemoryFeed::new(
            "incidents",
            vec![
                IncidentRecord {
                    incident_id: Some("INC-7".to_string()),
                    location: "87702".to_string(),
                    started_at: at(1, 23, 40),
                    delay_minutes: Some(12.0),
                    cause_code: Some("IA".to_string()),
                },
                IncidentRecord {
                    incident_id: Some("INC-8".to_string()),
                    location: "87701".to_string(),
                    started_at: at(2, 0, 20),
                    delay_minutes: None,
                    cause_code: Some("XW".to_string()),
                },
            ],
        )),
        holidays: Some(Box::new(InMemoryFeed::new(
            "bank_holidays",
            vec![Holiday {
                date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                title: "New Year's Day".to_string(),
            }],
        ))),
    }
}

#[test]
fn windowed_run_writes_the_same_partitions_as_a_single_pass() {
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let end = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();

    for selection in [StationSelection::Nearest, StationSelection::Mean] {
        let single_dir = tempdir().unwrap();
        let mut single_cfg = config_for(single_dir.path());
        single_cfg.weather.station_selection = selection;
        let single = create_datasets(start, end, &single_cfg, &multi_day_inputs()).unwrap();

        let windowed_dir = tempdir().unwrap();
        let mut windowed_cfg = config_for(windowed_dir.path());
        windowed_cfg.weather.station_selection = selection;
        windowed_cfg.output.chunk_days = Some(1);
        let windowed = create_datasets(start, end, &windowed_cfg, &multi_day_inputs()).unwrap();

        assert_eq!(single.windows, 1);
        assert_eq!(windowed.windows, 3);
        assert_eq!(windowed.rows, single.rows);
        assert_eq!(windowed.rows, 2 * 72);
        let sorted = |paths: &[PathBuf]| {
            let mut paths = paths.to_vec();
            paths.sort();
            paths
        };
        assert_eq!(
            sorted(&windowed.committed_partitions),
            sorted(&single.committed_partitions)
        );
        assert_eq!(windowed.weather.input_rows, single.weather.input_rows);
        assert_eq!(windowed.weather.mapping, single.weather.mapping);
        assert_eq!(windowed.weather.stations_with_data, single.weather.stations_with_data);
        assert_eq!(windowed.trains.counted_rows, single.trains.counted_rows);
        assert_eq!(
            windowed.incidents.counted_incidents,
            single.incidents.counted_incidents
        );

        let single_files = files_under(single_dir.path());
        assert_eq!(single_files.len(), 2 * 72 + 1);
        assert_eq!(
            files_under(windowed_dir.path()),
            single_files,
            "{selection:?} windowed output differs"
        );
    }
}

#[test]
fn freeze_flag_carries_across_a_window_boundary() {
    let dir = tempdir().unwrap();
    let mut cfg = config_for(dir.path());
    cfg.output.chunk_days = Some(1);
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let end = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
    create_datasets(start, end, &cfg, &multi_day_inputs()).unwrap();

    let segment = SegmentCode::new("ECM2_006").unwrap();
    let batch = read_partition(&dir.path().join(
        PartitionKey::from_key(&SegmentHourKey::new(segment, at(2, 6, 0))).relative_path(),
    ));
    assert_eq!(float64(&batch, "air_temperature_min_48h"), Some(-0.5));
    assert!(boolean(&batch, "flag_freeze"));
}

#[test]
fn join_rejects_builder_output_that_misses_the_grid() {
    let cfg = PipelineConfig::default();
    let registry = rail_features::SegmentRegistry::from_mappings(vec![
        mapping("STN1", 5, 120.0),
        mapping("87701", 5, 15.0),
    ])
    .unwrap();
    let tb = build_timebase(
        three_hour_range(),
        registry.active_segments(None).unwrap(),
        &HolidayCalendar::default(),
    );
    let weather = align_weather(&tb, &registry, &[], &cfg.weather);
    let trains = count_train_hops(&tb, &registry, &[], &cfg.trains);
    let incidents = summarize_incidents(&tb, &registry, &[], &cfg.incidents);

    let mut short = weather.rows.clone();
    short.pop();
    assert!(matches!(
        join_features(&tb, &short, &trains.rows, &incidents.rows, &cfg),
        Err(GridIntegrityError::MissingKey { builder: "weather", .. })
    ));

    let mut doubled = trains.rows.clone();
    doubled.push(trains.rows[0].clone());
    assert!(matches!(
        join_features(&tb, &weather.rows, &doubled, &incidents.rows, &cfg),
        Err(GridIntegrityError::DuplicateKey { builder: "train_counts", .. })
    ));

    let mut foreign = incidents.rows.clone();
    foreign[0].key.hour = at(5, 0, 0);
    assert!(matches!(
        join_features(&tb, &weather.rows, &trains.rows, &foreign, &cfg),
        Err(GridIntegrityError::ForeignKey { builder: "incidents", .. })
    ));

    let table = join_features(&tb, &weather.rows, &trains.rows, &incidents.rows, &cfg).unwrap();
    assert_eq!(table.rows.len(), 3);
    assert!(table
        .rows
        .iter()
        .all(|r| r.values.len() == table.schema.columns.len()));
}
