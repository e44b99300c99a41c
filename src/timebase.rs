//! Canonical (segment, hour) grid.
//!
//! The grid is the Cartesian product of the active segments and every
//! clock hour of an inclusive [`HourRange`]. Rows are laid out segment-major:
//! position = `segment_index * hour_count + hour_index`.

use std::collections::BTreeSet;
use std::f64::consts::PI;
use std::fmt;

use chrono::{
    Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime,
    Timelike, Weekday,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::registry::SegmentCode;

const HOURS_PER_DAY: f64 = 24.0;
const DAYS_PER_YEAR: f64 = 365.25;
const DEFAULT_HOLIDAY_DIVISION: &str = "england-and-wales";

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum InvalidRangeError {
    #[error("range start {start} is after range end {end}")]
    Inverted {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
    #[error("range bound {0} is not aligned to a whole hour")]
    Misaligned(NaiveDateTime),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HourRange {
    start: NaiveDateTime,
    end: NaiveDateTime,
}

impl HourRange {
    pub fn from_dates(start: NaiveDate, end: NaiveDate) -> Result<Self, InvalidRangeError> {
        let first = start.and_time(NaiveTime::default());
        let last = end.and_time(NaiveTime::default()) + ChronoDuration::hours(23);
        if start > end {
            return Err(InvalidRangeError::Inverted {
                start: first,
                end: last,
            });
        }
        Self::from_hours(first, last)
    }

    pub fn from_hours(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self, InvalidRangeError> {
        for bound in [start, end] {
            if truncate_to_hour(bound) != Some(bound) {
                return Err(InvalidRangeError::Misaligned(bound));
            }
        }
        if start > end {
            return Err(InvalidRangeError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    pub fn end(&self) -> NaiveDateTime {
        self.end
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start.date()
    }

    pub fn end_date(&self) -> NaiveDate {
        self.end.date()
    }

    pub fn hour_count(&self) -> usize {
        ((self.end - self.start).num_hours() + 1) as usize
    }

    pub fn index_of(&self, ts: NaiveDateTime) -> Option<usize> {
        let hour = truncate_to_hour(ts)?;
        if hour < self.start || hour > self.end {
            return None;
        }
        Some((hour - self.start).num_hours() as usize)
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        self.index_of(ts).is_some()
    }

    pub fn hour_at(&self, index: usize) -> Option<NaiveDateTime> {
        if index >= self.hour_count() {
            return None;
        }
        Some(self.start + ChronoDuration::hours(index as i64))
    }

    pub fn hours(&self) -> impl Iterator<Item = NaiveDateTime> + '_ {
        (0..self.hour_count()).map(move |idx| self.start + ChronoDuration::hours(idx as i64))
    }

    pub fn chunks(&self, hours_per_chunk: usize) -> Vec<HourRange> {
        let step = hours_per_chunk.max(1);
        let total = self.hour_count();
        (0..total)
            .step_by(step)
            .map(|first| {
                let last = (first + step).min(total) - 1;
                Self {
                    start: self.start + ChronoDuration::hours(first as i64),
                    end: self.start + ChronoDuration::hours(last as i64),
                }
            })
            .collect()
    }

    pub fn extend_back(&self, hours: usize, floor: NaiveDateTime) -> HourRange {
        let start = self
            .start
            .checked_sub_signed(ChronoDuration::hours(hours as i64))
            .map_or(floor, |start| start.max(floor))
            .min(self.start);
        Self {
            start,
            end: self.end,
        }
    }
}

pub fn truncate_to_hour(ts: NaiveDateTime) -> Option<NaiveDateTime> {
    ts.date().and_hms_opt(ts.hour(), 0, 0)
}

pub fn cyclical_encoding(value: f64, period: f64) -> (f64, f64) {
    let angle = 2.0 * PI * (value / period);
    (angle.sin(), angle.cos())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holiday {
    pub date: NaiveDate,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Deserialize)]
struct BankHolidayDivision {
    #[serde(default)]
    events: Vec<Holiday>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HolidayCalendar {
    dates: BTreeSet<NaiveDate>,
}

impl HolidayCalendar {
    pub fn new(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            dates: dates.into_iter().collect(),
        }
    }

    pub fn from_holidays<'a>(holidays: impl IntoIterator<Item = &'a Holiday>) -> Self {
        Self::new(holidays.into_iter().map(|h| h.date))
    }

    pub fn parse_bank_holidays_json(
        json: &str,
        division: Option<&str>,
    ) -> Result<Vec<Holiday>, serde_json::Error> {
        let mut divisions: std::collections::HashMap<String, BankHolidayDivision> =
            serde_json::from_str(json)?;
        let division = division.unwrap_or(DEFAULT_HOLIDAY_DIVISION);
        Ok(divisions
            .remove(division)
            .map(|d| d.events)
            .unwrap_or_default())
    }

    pub fn from_bank_holidays_json(
        json: &str,
        division: Option<&str>,
    ) -> Result<Self, serde_json::Error> {
        let holidays = Self::parse_bank_holidays_json(json, division)?;
        Ok(Self::from_holidays(&holidays))
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.dates.contains(&date)
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HourBucket {
    pub start: NaiveDateTime,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    // 0 = Monday.
    pub day_of_week: u32,
    pub day_of_year: u32,
    pub sin_hod: f64,
    pub cos_hod: f64,
    pub sin_doy: f64,
    pub cos_doy: f64,
    pub is_weekend: bool,
    pub is_holiday: bool,
}

impl HourBucket {
    pub fn new(start: NaiveDateTime, holidays: &HolidayCalendar) -> Self {
        let date = start.date();
        let (sin_hod, cos_hod) = cyclical_encoding(start.hour() as f64, HOURS_PER_DAY);
        let (sin_doy, cos_doy) = cyclical_encoding(date.ordinal() as f64, DAYS_PER_YEAR);
        let weekday = date.weekday();

        Self {
            start,
            year: date.year(),
            month: date.month(),
            day: date.day(),
            hour: start.hour(),
            day_of_week: weekday.num_days_from_monday(),
            day_of_year: date.ordinal(),
            sin_hod,
            cos_hod,
            sin_doy,
            cos_doy,
            is_weekend: matches!(weekday, Weekday::Sat | Weekday::Sun),
            is_holiday: holidays.contains(date),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentHourKey {
    pub segment: SegmentCode,
    pub hour: NaiveDateTime,
}

impl SegmentHourKey {
    pub fn new(segment: SegmentCode, hour: NaiveDateTime) -> Self {
        Self { segment, hour }
    }
}

impl fmt::Display for SegmentHourKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.segment, self.hour.format("%Y-%m-%dT%H:00"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Timebase {
    range: HourRange,
    segments: Vec<SegmentCode>,
    hours: Vec<HourBucket>,
}

pub fn build_timebase(
    range: HourRange,
    segments: impl IntoIterator<Item = SegmentCode>,
    holidays: &HolidayCalendar,
) -> Timebase {
    let segments: Vec<SegmentCode> = segments
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let hours: Vec<HourBucket> = range
        .hours()
        .map(|hour| HourBucket::new(hour, holidays))
        .collect();

    info!(
        component = "timebase",
        event = "timebase.built",
        start = %range.start(),
        end = %range.end(),
        segments = segments.len(),
        hours = hours.len(),
        holidays_in_calendar = holidays.len()
    );

    Timebase {
        range,
        segments,
        hours,
    }
}

impl Timebase {
    pub fn range(&self) -> &HourRange {
        &self.range
    }

    pub fn segments(&self) -> &[SegmentCode] {
        &self.segments
    }

    pub fn hours(&self) -> &[HourBucket] {
        &self.hours
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn hour_count(&self) -> usize {
        self.hours.len()
    }

    pub fn len(&self) -> usize {
        self.segments.len() * self.hours.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn segment_index(&self, segment: &SegmentCode) -> Option<usize> {
        self.segments.binary_search(segment).ok()
    }

    pub fn contains_segment(&self, segment: &SegmentCode) -> bool {
        self.segment_index(segment).is_some()
    }

    pub fn position(&self, segment_index: usize, hour_index: usize) -> usize {
        segment_index * self.hours.len() + hour_index
    }

    pub fn position_of(&self, segment: &SegmentCode, ts: NaiveDateTime) -> Option<usize> {
        let segment_index = self.segment_index(segment)?;
        let hour_index = self.range.index_of(ts)?;
        Some(self.position(segment_index, hour_index))
    }

    pub fn key_at(&self, position: usize) -> Option<SegmentHourKey> {
        let hour_count = self.hours.len();
        if hour_count == 0 {
            return None;
        }
        let segment = self.segments.get(position / hour_count)?;
        let bucket = self.hours.get(position % hour_count)?;
        Some(SegmentHourKey::new(segment.clone(), bucket.start))
    }

    pub fn keys(&self) -> impl Iterator<Item = SegmentHourKey> + '_ {
        self.segments.iter().flat_map(move |segment| {
            self.hours
                .iter()
                .map(move |bucket| SegmentHourKey::new(segment.clone(), bucket.start))
        })
    }
}
