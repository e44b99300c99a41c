//! Weather alignment onto the segment-hour grid.
//!
//! Steps, per run:
//! 1. every in-range observation is truncated to its hour; within one hour
//!    the latest non-null value of each measurement wins
//! 2. empty hours borrow a station's own value from at most
//!    `carry_forward_hours` earlier hours
//! 3. each segment picks its station(s) from the registry candidates that
//!    actually reported in range
//! 4. rolling aggregates and threshold flags are computed over the trailing
//!    in-range hours of the selected series

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::NaiveDateTime;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{AggregateAction, StationSelection, WeatherColumn, WeatherConfig};
use crate::registry::{normalize_location, MappingReport, SegmentCode, SegmentRegistry};
use crate::timebase::{HourRange, SegmentHourKey, Timebase};

pub const WEATHER_FEED: &str = "weather";

const MEASUREMENT_COUNT: usize = WeatherColumn::ALL.len();
const MAX_REPORTED_UNMATCHED_SEGMENTS: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    pub station: String,
    pub observed_at: NaiveDateTime,
    #[serde(default)]
    pub air_temperature: Option<f64>,
    #[serde(default)]
    pub precipitation: Option<f64>,
    #[serde(default)]
    pub snow_depth: Option<f64>,
    #[serde(default)]
    pub visibility: Option<f64>,
    #[serde(default)]
    pub gust_speed: Option<f64>,
    #[serde(default)]
    pub gust_direction: Option<f64>,
    #[serde(default)]
    pub present_weather_code: Option<u16>,
}

impl WeatherRecord {
    pub fn new(station: &str, observed_at: NaiveDateTime) -> Self {
        Self {
            station: station.to_string(),
            observed_at,
            air_temperature: None,
            precipitation: None,
            snow_depth: None,
            visibility: None,
            gust_speed: None,
            gust_direction: None,
            present_weather_code: None,
        }
    }

    pub fn measurements(&self) -> WeatherMeasurements {
        let mut out = WeatherMeasurements::default();
        out.set(WeatherColumn::AirTemperature, self.air_temperature);
        out.set(WeatherColumn::Precipitation, self.precipitation);
        out.set(WeatherColumn::SnowDepth, self.snow_depth);
        out.set(WeatherColumn::Visibility, self.visibility);
        out.set(WeatherColumn::GustSpeed, self.gust_speed);
        out.set(WeatherColumn::GustDirection, self.gust_direction);
        out.set(
            WeatherColumn::PresentWeatherCode,
            self.present_weather_code.map(f64::from),
        );
        out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherMeasurements {
    values: [Option<f64>; MEASUREMENT_COUNT],
}

impl WeatherMeasurements {
    pub fn get(&self, column: WeatherColumn) -> Option<f64> {
        self.values[column.index()]
    }

    pub fn set(&mut self, column: WeatherColumn, value: Option<f64>) {
        self.values[column.index()] = value.filter(|v| v.is_finite());
    }

    pub fn present_weather_code(&self) -> Option<i32> {
        self.get(WeatherColumn::PresentWeatherCode)
            .map(|v| v.round() as i32)
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherFeatureRow {
    pub key: SegmentHourKey,
    pub station: Option<String>,
    pub measurements: WeatherMeasurements,
    pub aggregates: Vec<Option<f64>>,
    pub flags: Vec<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeatherReport {
    pub input_rows: u64,
    pub out_of_range_rows: u64,
    pub mapping: MappingReport,
    pub stations_with_data: u64,
    pub segments_with_station: u64,
    pub segments_without_station: u64,
    pub unmatched_segment_samples: Vec<SegmentCode>,
}

impl WeatherReport {
    // Fold in the report of a later window of the same run. Station and
    // segment facts are fixed for the run, so the later window's values win.
    pub fn absorb(&mut self, other: WeatherReport) {
        self.input_rows += other.input_rows;
        self.out_of_range_rows += other.out_of_range_rows;
        self.mapping.absorb(other.mapping);
        self.stations_with_data = other.stations_with_data;
        self.segments_with_station = other.segments_with_station;
        self.segments_without_station = other.segments_without_station;
        self.unmatched_segment_samples = other.unmatched_segment_samples;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeatherFeatures {
    pub rows: Vec<WeatherFeatureRow>,
    pub report: WeatherReport,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WeatherWindow<'a> {
    // Hours right before the timebase that are replayed to rebuild rolling
    // and carry-forward state. No rows are produced for them.
    pub warmup_hours: usize,
    // Stations reporting anywhere in the run. Without it, selection uses the
    // stations reporting inside the replayed span.
    pub reporting_stations: Option<&'a HashSet<String>>,
}

#[derive(Debug, Clone)]
struct RollingWindow {
    values: VecDeque<Option<f64>>,
    window: usize,
}

impl RollingWindow {
    fn new(window: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(window),
            window,
        }
    }

    fn push(&mut self, value: Option<f64>) {
        self.values.push_back(value);
        while self.values.len() > self.window {
            self.values.pop_front();
        }
    }

    fn aggregate(&self, action: AggregateAction) -> Option<f64> {
        let mut present = self.values.iter().flatten().copied();
        let first = present.next()?;
        let (acc, count) = present.fold((first, 1u32), |(acc, count), v| {
            let acc = match action {
                AggregateAction::Min => acc.min(v),
                AggregateAction::Max => acc.max(v),
                AggregateAction::Sum | AggregateAction::Mean => acc + v,
            };
            (acc, count + 1)
        });
        match action {
            AggregateAction::Mean => Some(acc / f64::from(count)),
            _ => Some(acc),
        }
    }
}

pub fn rolling_aggregate(
    series: &[Option<f64>],
    window_hours: u32,
    action: AggregateAction,
) -> Vec<Option<f64>> {
    let mut window = RollingWindow::new(window_hours.max(1) as usize);
    series
        .iter()
        .map(|value| {
            window.push(*value);
            window.aggregate(action)
        })
        .collect()
}

#[derive(Debug, Clone)]
struct StationSeries {
    slots: Vec<WeatherMeasurements>,
}

impl StationSeries {
    fn from_observations(
        hour_count: usize,
        mut observations: Vec<(usize, NaiveDateTime, WeatherMeasurements)>,
        carry_forward_hours: u32,
    ) -> Self {
        // Stable sort keeps feed order for identical timestamps.
        observations.sort_by_key(|(_, observed_at, _)| *observed_at);

        let mut raw = vec![WeatherMeasurements::default(); hour_count];
        for (hour_index, _, measurements) in observations {
            for column in WeatherColumn::ALL {
                if let Some(value) = measurements.get(column) {
                    raw[hour_index].set(column, Some(value));
                }
            }
        }

        let carry = carry_forward_hours as usize;
        let slots = (0..hour_count)
            .map(|hour_index| {
                let mut aligned = raw[hour_index];
                for column in WeatherColumn::ALL {
                    if aligned.get(column).is_some() {
                        continue;
                    }
                    let borrowed = (1..=carry)
                        .take_while(|back| *back <= hour_index)
                        .find_map(|back| raw[hour_index - back].get(column));
                    aligned.set(column, borrowed);
                }
                aligned
            })
            .collect();

        Self { slots }
    }

    fn has_data(&self) -> bool {
        self.slots.iter().any(|slot| !slot.is_empty())
    }
}

pub fn reporting_stations(
    registry: &SegmentRegistry,
    records: &[WeatherRecord],
    range: &HourRange,
) -> HashSet<String> {
    records
        .iter()
        .filter(|record| range.contains(record.observed_at))
        .filter(|record| !record.measurements().is_empty())
        .map(|record| normalize_location(&record.station))
        .filter(|station| registry.nearest_segment(station).is_some())
        .collect()
}

pub fn align_weather(
    timebase: &Timebase,
    registry: &SegmentRegistry,
    records: &[WeatherRecord],
    cfg: &WeatherConfig,
) -> WeatherFeatures {
    align_weather_window(timebase, registry, records, cfg, WeatherWindow::default())
}

pub fn align_weather_window(
    timebase: &Timebase,
    registry: &SegmentRegistry,
    records: &[WeatherRecord],
    cfg: &WeatherConfig,
    window: WeatherWindow<'_>,
) -> WeatherFeatures {
    let span = timebase
        .range()
        .extend_back(window.warmup_hours, NaiveDateTime::MIN);
    let span_hours = span.hour_count();
    let warmup = span_hours - timebase.hour_count();
    let mut report = WeatherReport::default();

    info!(
        component = "weather",
        event = "weather.align.start",
        input_rows = records.len(),
        segments = timebase.segment_count(),
        hours = timebase.hour_count(),
        warmup_hours = warmup,
        station_selection = ?cfg.station_selection
    );

    let mut grouped: HashMap<String, Vec<(usize, NaiveDateTime, WeatherMeasurements)>> =
        HashMap::new();
    for record in records {
        let Some(span_index) = span.index_of(record.observed_at) else {
            report.input_rows += 1;
            report.out_of_range_rows += 1;
            continue;
        };
        let replayed = span_index < warmup;
        if !replayed {
            report.input_rows += 1;
        }
        if let Err(err) = registry.resolve(WEATHER_FEED, &record.station, |_| true) {
            if !replayed {
                report.mapping.record(err);
            }
            continue;
        }
        grouped
            .entry(normalize_location(&record.station))
            .or_default()
            .push((span_index, record.observed_at, record.measurements()));
    }

    let stations: HashMap<String, StationSeries> = grouped
        .into_par_iter()
        .map(|(station, observations)| {
            let series =
                StationSeries::from_observations(span_hours, observations, cfg.carry_forward_hours);
            (station, series)
        })
        .filter(|(_, series)| series.has_data())
        .collect();
    report.stations_with_data = match window.reporting_stations {
        Some(reporting) => reporting.len() as u64,
        None => stations.len() as u64,
    };

    let selection = Selection {
        stations: &stations,
        reporting: window.reporting_stations,
        span_hours,
        warmup,
    };
    let per_segment: Vec<(Vec<WeatherFeatureRow>, bool)> = timebase
        .segments()
        .par_iter()
        .map(|segment| segment_rows(timebase, registry, &selection, segment, cfg))
        .collect();

    let mut rows = Vec::with_capacity(timebase.len());
    for (segment, (segment_rows, matched)) in timebase.segments().iter().zip(per_segment) {
        if matched {
            report.segments_with_station += 1;
        } else {
            report.segments_without_station += 1;
            debug!(
                component = "weather",
                event = "weather.segment.no_station",
                segment = %segment
            );
            if report.unmatched_segment_samples.len() < MAX_REPORTED_UNMATCHED_SEGMENTS {
                report.unmatched_segment_samples.push(segment.clone());
            }
        }
        rows.extend(segment_rows);
    }

    info!(
        component = "weather",
        event = "weather.align.complete",
        rows = rows.len(),
        out_of_range_rows = report.out_of_range_rows,
        dropped_rows = report.mapping.dropped_rows,
        stations_with_data = report.stations_with_data,
        segments_without_station = report.segments_without_station
    );

    WeatherFeatures { rows, report }
}

struct Selection<'a> {
    stations: &'a HashMap<String, StationSeries>,
    reporting: Option<&'a HashSet<String>>,
    span_hours: usize,
    warmup: usize,
}

impl Selection<'_> {
    fn is_reporting(&self, station: &str) -> bool {
        match self.reporting {
            Some(reporting) => reporting.contains(station),
            None => self.stations.contains_key(station),
        }
    }

    fn slots(&self, station: &str) -> Vec<WeatherMeasurements> {
        self.stations.get(station).map_or_else(
            || vec![WeatherMeasurements::default(); self.span_hours],
            |series| series.slots.clone(),
        )
    }
}

fn segment_rows(
    timebase: &Timebase,
    registry: &SegmentRegistry,
    selection: &Selection<'_>,
    segment: &SegmentCode,
    cfg: &WeatherConfig,
) -> (Vec<WeatherFeatureRow>, bool) {
    let reporting: Vec<&str> = registry
        .candidates(segment)
        .iter()
        .map(|c| c.station.as_str())
        .filter(|station| selection.is_reporting(station))
        .collect();

    let (label, series) = match (cfg.station_selection, reporting.as_slice()) {
        (_, []) => (
            None,
            vec![WeatherMeasurements::default(); selection.span_hours],
        ),
        (StationSelection::Nearest, [station, ..]) => {
            (Some(station.to_string()), selection.slots(station))
        }
        (StationSelection::Mean, all) => {
            let with_data: Vec<&StationSeries> = all
                .iter()
                .filter_map(|station| selection.stations.get(*station))
                .collect();
            (
                Some(all.join(",")),
                mean_series(selection.span_hours, &with_data),
            )
        }
    };
    let matched = label.is_some();

    let aggregates: Vec<Vec<Option<f64>>> = cfg
        .aggregates
        .iter()
        .map(|agg| {
            let column: Vec<Option<f64>> = series.iter().map(|m| m.get(agg.column)).collect();
            rolling_aggregate(&column, agg.window_hours, agg.action)
        })
        .collect();
    let flags: Vec<Vec<bool>> = cfg
        .flags
        .iter()
        .map(|rule| {
            let column: Vec<Option<f64>> = series.iter().map(|m| m.get(rule.column)).collect();
            rolling_aggregate(&column, rule.window_hours, rule.comparison.aggregate())
                .into_iter()
                .map(|value| value.is_some_and(|v| rule.comparison.holds(v, rule.threshold)))
                .collect()
        })
        .collect();

    let rows = timebase
        .hours()
        .iter()
        .enumerate()
        .map(|(hour_index, bucket)| {
            let slot = selection.warmup + hour_index;
            WeatherFeatureRow {
                key: SegmentHourKey::new(segment.clone(), bucket.start),
                station: label.clone(),
                measurements: series[slot],
                aggregates: aggregates.iter().map(|a| a[slot]).collect(),
                flags: flags.iter().map(|f| f[slot]).collect(),
            }
        })
        .collect();

    (rows, matched)
}

// The present-weather code is a category, so it comes from the nearest
// station that has one rather than being averaged.
fn mean_series(hour_count: usize, stations: &[&StationSeries]) -> Vec<WeatherMeasurements> {
    (0..hour_count)
        .map(|hour_index| {
            let mut out = WeatherMeasurements::default();
            for column in WeatherColumn::ALL {
                let mut values = stations
                    .iter()
                    .filter_map(|series| series.slots[hour_index].get(column));
                let value = if column == WeatherColumn::PresentWeatherCode {
                    values.next()
                } else {
                    let (sum, count) = values.fold((0.0, 0u32), |(s, c), v| (s + v, c + 1));
                    (count > 0).then(|| sum / f64::from(count))
                };
                out.set(column, value);
            }
            out
        })
        .collect()
}
