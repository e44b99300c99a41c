//! Timetable hop expansion into per-segment hourly train counts.

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TrainCountConfig;
use crate::registry::{MappingReport, SegmentRegistry};
use crate::timebase::{HourRange, SegmentHourKey, Timebase};

pub const TRAIN_HOP_FEED: &str = "train_hops";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainHop {
    pub train_id: String,
    pub location: String,
    pub entered_at: NaiveDateTime,
    #[serde(default)]
    pub category: Option<String>,
}

// Timetable entry for one train at one location, valid on the days marked
// in `days_run` (`"1111100"`, Monday first) between `valid_from` and
// `valid_to` inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub train_id: String,
    pub location: String,
    pub days_run: String,
    pub valid_from: NaiveDate,
    pub valid_to: NaiveDate,
    // `HHMM`, optionally suffixed with `H` for the half minute.
    pub passing_time: String,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleExpansion {
    pub hops: Vec<TrainHop>,
    pub invalid_rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainCountRow {
    pub key: SegmentHourKey,
    pub total: u64,
    pub by_category: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainCountReport {
    pub input_rows: u64,
    pub counted_rows: u64,
    pub out_of_range_rows: u64,
    pub mapping: MappingReport,
}

impl TrainCountReport {
    pub fn absorb(&mut self, other: TrainCountReport) {
        self.input_rows += other.input_rows;
        self.counted_rows += other.counted_rows;
        self.out_of_range_rows += other.out_of_range_rows;
        self.mapping.absorb(other.mapping);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainCounts {
    pub rows: Vec<TrainCountRow>,
    pub report: TrainCountReport,
}

pub fn count_train_hops(
    timebase: &Timebase,
    registry: &SegmentRegistry,
    hops: &[TrainHop],
    cfg: &TrainCountConfig,
) -> TrainCounts {
    let category_slots = if cfg.categories.is_empty() {
        0
    } else {
        cfg.categories.len() + 1
    };
    let mut totals = vec![0u64; timebase.len()];
    let mut by_category = vec![vec![0u64; category_slots]; timebase.len()];
    let mut report = TrainCountReport {
        input_rows: hops.len() as u64,
        ..TrainCountReport::default()
    };

    for hop in hops {
        let Some(hour_index) = timebase.range().index_of(hop.entered_at) else {
            report.out_of_range_rows += 1;
            continue;
        };
        let segment = match registry.resolve(TRAIN_HOP_FEED, &hop.location, |s| {
            timebase.contains_segment(s)
        }) {
            Ok(segment) => segment,
            Err(err) => {
                report.mapping.record(err);
                continue;
            }
        };
        let Some(segment_index) = timebase.segment_index(segment) else {
            continue;
        };

        let position = timebase.position(segment_index, hour_index);
        totals[position] += 1;
        if category_slots > 0 {
            let slot = category_slot(&cfg.categories, hop.category.as_deref());
            by_category[position][slot] += 1;
        }
        report.counted_rows += 1;
    }

    let rows: Vec<TrainCountRow> = timebase
        .keys()
        .zip(totals)
        .zip(by_category)
        .map(|((key, total), by_category)| TrainCountRow {
            key,
            total,
            by_category,
        })
        .collect();

    info!(
        component = "train_counts",
        event = "train_counts.complete",
        rows = rows.len(),
        input_rows = report.input_rows,
        counted_rows = report.counted_rows,
        out_of_range_rows = report.out_of_range_rows,
        dropped_rows = report.mapping.dropped_rows
    );

    TrainCounts { rows, report }
}

fn category_slot(categories: &[String], category: Option<&str>) -> usize {
    category
        .map(str::trim)
        .and_then(|c| {
            categories
                .iter()
                .position(|known| known.trim().eq_ignore_ascii_case(c))
        })
        .unwrap_or(categories.len())
}

pub fn expand_schedules(schedules: &[ScheduleRecord], range: &HourRange) -> ScheduleExpansion {
    let mut expansion = ScheduleExpansion::default();
    // A passing time belongs to its running day, so only days in the range
    // can produce in-range hops.
    let first_day = range.start_date();
    let last_day = range.end_date();

    for schedule in schedules {
        let (Some(mask), Some(time)) = (
            parse_days_run(&schedule.days_run),
            parse_passing_time(&schedule.passing_time),
        ) else {
            debug!(
                component = "train_counts",
                event = "train_counts.schedule.invalid",
                train_id = %schedule.train_id,
                days_run = %schedule.days_run,
                passing_time = %schedule.passing_time
            );
            expansion.invalid_rows += 1;
            continue;
        };

        let from = schedule.valid_from.max(first_day);
        let to = schedule.valid_to.min(last_day);
        if from > to {
            continue;
        }

        for day in from.iter_days().take_while(|day| *day <= to) {
            if !mask[day.weekday().num_days_from_monday() as usize] {
                continue;
            }
            let entered_at = day.and_time(time);
            if !range.contains(entered_at) {
                continue;
            }
            expansion.hops.push(TrainHop {
                train_id: schedule.train_id.clone(),
                location: schedule.location.clone(),
                entered_at,
                category: schedule.category.clone(),
            });
        }
    }

    debug!(
        component = "train_counts",
        event = "train_counts.schedule.expanded",
        schedules = schedules.len(),
        hops = expansion.hops.len(),
        invalid_rows = expansion.invalid_rows
    );

    expansion
}

fn parse_days_run(raw: &str) -> Option<[bool; 7]> {
    let raw = raw.trim();
    if raw.len() != 7 {
        return None;
    }
    let mut mask = [false; 7];
    for (slot, c) in mask.iter_mut().zip(raw.chars()) {
        *slot = match c {
            '1' => true,
            '0' => false,
            _ => return None,
        };
    }
    Some(mask)
}

fn parse_passing_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    let (digits, half_minute) = match raw.strip_suffix(['H', 'h']) {
        Some(rest) => (rest, true),
        None => (raw, false),
    };
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hour: u32 = digits[..2].parse().ok()?;
    let minute: u32 = digits[2..].parse().ok()?;
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    Some(if half_minute {
        time + ChronoDuration::seconds(30)
    } else {
        time
    })
}
