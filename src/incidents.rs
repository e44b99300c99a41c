//! Incident/delay log summarisation into per-segment hourly counts.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::IncidentConfig;
use crate::registry::{MappingReport, SegmentRegistry};
use crate::timebase::{SegmentHourKey, Timebase};

pub const INCIDENT_FEED: &str = "incidents";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    // Delay logs repeat an incident once per delayed train; rows sharing an
    // id within one segment-hour are one incident.
    #[serde(default)]
    pub incident_id: Option<String>,
    pub location: String,
    pub started_at: NaiveDateTime,
    #[serde(default)]
    pub delay_minutes: Option<f64>,
    #[serde(default)]
    pub cause_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentFeatureRow {
    pub key: SegmentHourKey,
    pub total: u64,
    pub by_category: Vec<u64>,
    pub delay_minutes: f64,
}

impl IncidentFeatureRow {
    pub fn flag(&self) -> bool {
        self.total > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentReport {
    pub input_rows: u64,
    pub counted_incidents: u64,
    pub duplicate_rows: u64,
    pub out_of_range_rows: u64,
    pub mapping: MappingReport,
}

impl IncidentReport {
    pub fn absorb(&mut self, other: IncidentReport) {
        self.input_rows += other.input_rows;
        self.counted_incidents += other.counted_incidents;
        self.duplicate_rows += other.duplicate_rows;
        self.out_of_range_rows += other.out_of_range_rows;
        self.mapping.absorb(other.mapping);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncidentFeatures {
    pub rows: Vec<IncidentFeatureRow>,
    pub report: IncidentReport,
}

#[derive(Debug, Clone)]
pub struct CauseClassifier {
    lookup: HashMap<String, usize>,
    category_count: usize,
}

impl CauseClassifier {
    pub fn new(cfg: &IncidentConfig) -> Self {
        let mut lookup = HashMap::new();
        for (slot, category) in cfg.categories.iter().enumerate() {
            for code in std::iter::once(&category.name).chain(&category.cause_codes) {
                lookup
                    .entry(code.trim().to_ascii_uppercase())
                    .or_insert(slot);
            }
        }
        Self {
            lookup,
            category_count: cfg.categories.len(),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.category_count + 1
    }

    pub fn other_slot(&self) -> usize {
        self.category_count
    }

    pub fn classify(&self, cause_code: Option<&str>) -> usize {
        cause_code
            .and_then(|code| self.lookup.get(&code.trim().to_ascii_uppercase()))
            .copied()
            .unwrap_or(self.category_count)
    }
}

pub fn summarize_incidents(
    timebase: &Timebase,
    registry: &SegmentRegistry,
    records: &[IncidentRecord],
    cfg: &IncidentConfig,
) -> IncidentFeatures {
    let classifier = CauseClassifier::new(cfg);
    let mut report = IncidentReport {
        input_rows: records.len() as u64,
        ..IncidentReport::default()
    };

    let mut placed: Vec<(usize, usize)> = Vec::with_capacity(records.len());
    for (input_index, record) in records.iter().enumerate() {
        let Some(hour_index) = timebase.range().index_of(record.started_at) else {
            report.out_of_range_rows += 1;
            continue;
        };
        let segment = match registry.resolve(INCIDENT_FEED, &record.location, |s| {
            timebase.contains_segment(s)
        }) {
            Ok(segment) => segment,
            Err(err) => {
                report.mapping.record(err);
                continue;
            }
        };
        if let Some(segment_index) = timebase.segment_index(segment) {
            placed.push((timebase.position(segment_index, hour_index), input_index));
        }
    }

    // The earliest row of a repeated incident decides its category.
    placed.sort_by_key(|(_, input_index)| (records[*input_index].started_at, *input_index));

    let mut totals = vec![0u64; timebase.len()];
    let mut by_category = vec![vec![0u64; classifier.slot_count()]; timebase.len()];
    let mut delay_minutes = vec![0.0f64; timebase.len()];
    let mut seen: HashSet<(usize, &str)> = HashSet::new();

    for (position, input_index) in placed {
        let record = &records[input_index];
        if let Some(delay) = record.delay_minutes.filter(|d| d.is_finite()) {
            delay_minutes[position] += delay;
        }

        if let Some(id) = record.incident_id.as_deref().map(str::trim) {
            if !id.is_empty() && !seen.insert((position, id)) {
                report.duplicate_rows += 1;
                continue;
            }
        }

        totals[position] += 1;
        by_category[position][classifier.classify(record.cause_code.as_deref())] += 1;
        report.counted_incidents += 1;
    }

    let rows: Vec<IncidentFeatureRow> = timebase
        .keys()
        .zip(totals)
        .zip(by_category)
        .zip(delay_minutes)
        .map(|(((key, total), by_category), delay_minutes)| IncidentFeatureRow {
            key,
            total,
            by_category,
            delay_minutes,
        })
        .collect();

    info!(
        component = "incidents",
        event = "incidents.complete",
        rows = rows.len(),
        input_rows = report.input_rows,
        counted_incidents = report.counted_incidents,
        duplicate_rows = report.duplicate_rows,
        out_of_range_rows = report.out_of_range_rows,
        dropped_rows = report.mapping.dropped_rows
    );

    IncidentFeatures { rows, report }
}
