use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use rail_features::{
    build_timebase, count_train_hops, create_datasets_for_range, log_app_start, HolidayCalendar,
    HourRange, InMemoryFeed, IncidentRecord, LocationMapping, LoggingConfig, PipelineConfig,
    PipelineInputs, SegmentRegistry, TrainCountConfig, TrainHop, WeatherRecord,
};
use tempfile::tempdir;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn range() -> HourRange {
    let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    HourRange::from_dates(day, day).unwrap()
}

fn mappings() -> Vec<LocationMapping> {
    vec![LocationMapping {
        location_code: "87701".to_string(),
        elr: "ECM1".to_string(),
        mile_bucket: 5,
        distance_m: 10.0,
    }]
}

#[test]
fn dropped_hops_are_logged_at_debug() {
    let logs = capture_logs(Level::DEBUG, || {
        let registry = SegmentRegistry::from_mappings(mappings()).unwrap();
        let tb = build_timebase(
            range(),
            registry.active_segments(None).unwrap(),
            &HolidayCalendar::default(),
        );
        let hops = vec![TrainHop {
            train_id: "1A01".to_string(),
            location: "NOWHERE".to_string(),
            entered_at: range().start(),
            category: None,
        }];
        let out = count_train_hops(&tb, &registry, &hops, &TrainCountConfig::default());
        assert_eq!(out.report.mapping.dropped_rows, 1);
    });

    assert!(logs.contains("\"event\":\"registry.built\""));
    assert!(logs.contains("\"event\":\"timebase.built\""));
    assert!(logs.contains("\"event\":\"registry.mapping.dropped\""));
    assert!(logs.contains("\"event\":\"train_counts.complete\""));
}

#[test]
fn pipeline_run_emits_start_and_summary_events() {
    let dir = tempdir().unwrap();
    let mut cfg = PipelineConfig::default();
    cfg.output.root = dir.path().to_path_buf();
    let inputs = PipelineInputs {
        mappings: Box::new(InMemoryFeed::new("mappings", mappings())),
        weather: Box::new(InMemoryFeed::<WeatherRecord>::new("weather", Vec::new())),
        train_hops: Box::new(InMemoryFeed::<TrainHop>::new("train_hops", Vec::new())),
        incidents: Box::new(InMemoryFeed::<IncidentRecord>::new("incidents", Vec::new())),
        holidays: None,
    };

    let logs = capture_logs(Level::INFO, || {
        let report = create_datasets_for_range(range(), &cfg, &inputs)
            .expect("pipeline should succeed");
        assert_eq!(report.rows, 24);
    });

    assert!(logs.contains("\"event\":\"pipeline.start\""));
    assert!(logs.contains("\"event\":\"features.join.complete\""));
    assert!(logs.contains("\"event\":\"partition.write.complete\""));
    assert!(logs.contains("\"event\":\"pipeline.complete\""));
}

#[test]
fn app_start_helper_emits_baseline_event() {
    let logs = capture_logs(Level::INFO, || {
        log_app_start(&LoggingConfig::default());
    });

    assert!(logs.contains("\"event\":\"app.start\""));
}
