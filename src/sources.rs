//! Uniform "typed rows for a date range" capability over the input feeds.

use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::incidents::IncidentRecord;
use crate::registry::LocationMapping;
use crate::timebase::{HolidayCalendar, Holiday, HourRange};
use crate::train_counts::{expand_schedules, ScheduleRecord, TrainHop};
use crate::weather::WeatherRecord;

const MAX_LOGGED_BAD_ROWS: usize = 5;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read csv {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("failed to parse json {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// Row type carried by a feed. Rows with an event time outside the requested
// range are filtered by the feed; rows without one are always returned.
pub trait FeedRecord {
    fn event_time(&self) -> Option<NaiveDateTime> {
        None
    }
}

impl FeedRecord for LocationMapping {}
impl FeedRecord for Holiday {}
impl FeedRecord for ScheduleRecord {}

impl FeedRecord for WeatherRecord {
    fn event_time(&self) -> Option<NaiveDateTime> {
        Some(self.observed_at)
    }
}

impl FeedRecord for TrainHop {
    fn event_time(&self) -> Option<NaiveDateTime> {
        Some(self.entered_at)
    }
}

impl FeedRecord for IncidentRecord {
    fn event_time(&self) -> Option<NaiveDateTime> {
        Some(self.started_at)
    }
}

fn in_range<T: FeedRecord>(record: &T, range: &HourRange) -> bool {
    record.event_time().map_or(true, |ts| range.contains(ts))
}

pub trait FeedSource<T>: Send + Sync {
    fn name(&self) -> &str;
    fn load(&self, range: &HourRange) -> Result<Vec<T>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct InMemoryFeed<T> {
    name: String,
    records: Vec<T>,
}

impl<T> InMemoryFeed<T> {
    pub fn new(name: impl Into<String>, records: Vec<T>) -> Self {
        Self {
            name: name.into(),
            records,
        }
    }
}

impl<T> FeedSource<T> for InMemoryFeed<T>
where
    T: FeedRecord + Clone + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self, range: &HourRange) -> Result<Vec<T>, SourceError> {
        Ok(self
            .records
            .iter()
            .filter(|r| in_range(*r, range))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct CsvFeed<T> {
    name: String,
    path: PathBuf,
    _row: PhantomData<fn() -> T>,
}

impl<T> CsvFeed<T> {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            _row: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T> FeedSource<T> for CsvFeed<T>
where
    T: FeedRecord + DeserializeOwned,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self, range: &HourRange) -> Result<Vec<T>, SourceError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .map_err(|source| SourceError::Csv {
                path: self.path.clone(),
                source,
            })?;

        let mut rows = Vec::new();
        let mut skipped_rows: u64 = 0;
        let mut outside_range: u64 = 0;
        for (idx, result) in reader.deserialize::<T>().enumerate() {
            match result {
                Ok(row) if in_range(&row, range) => rows.push(row),
                Ok(_) => outside_range += 1,
                Err(err) => {
                    if (skipped_rows as usize) < MAX_LOGGED_BAD_ROWS {
                        debug!(
                            component = "sources",
                            event = "sources.csv.bad_row",
                            feed = %self.name,
                            row = idx + 1,
                            error = %err
                        );
                    }
                    skipped_rows += 1;
                }
            }
        }

        if skipped_rows > 0 {
            warn!(
                component = "sources",
                event = "sources.csv.rows_skipped",
                feed = %self.name,
                path = %self.path.display(),
                skipped_rows = skipped_rows
            );
        }
        info!(
            component = "sources",
            event = "sources.csv.loaded",
            feed = %self.name,
            rows = rows.len(),
            outside_range = outside_range,
            skipped_rows = skipped_rows
        );

        Ok(rows)
    }
}

#[derive(Debug, Clone)]
pub struct BankHolidaysJsonFeed {
    path: PathBuf,
    division: Option<String>,
}

impl BankHolidaysJsonFeed {
    pub fn new(path: impl Into<PathBuf>, division: Option<String>) -> Self {
        Self {
            path: path.into(),
            division,
        }
    }
}

impl FeedSource<Holiday> for BankHolidaysJsonFeed {
    fn name(&self) -> &str {
        "bank_holidays"
    }

    fn load(&self, _range: &HourRange) -> Result<Vec<Holiday>, SourceError> {
        let raw = fs::read_to_string(&self.path).map_err(|source| SourceError::Io {
            path: self.path.clone(),
            source,
        })?;
        HolidayCalendar::parse_bank_holidays_json(&raw, self.division.as_deref()).map_err(
            |source| SourceError::Json {
                path: self.path.clone(),
                source,
            },
        )
    }
}

pub struct ExpandedScheduleFeed {
    schedules: Box<dyn FeedSource<ScheduleRecord>>,
}

impl ExpandedScheduleFeed {
    pub fn new(schedules: Box<dyn FeedSource<ScheduleRecord>>) -> Self {
        Self { schedules }
    }
}

impl FeedSource<TrainHop> for ExpandedScheduleFeed {
    fn name(&self) -> &str {
        self.schedules.name()
    }

    fn load(&self, range: &HourRange) -> Result<Vec<TrainHop>, SourceError> {
        let schedules = self.schedules.load(range)?;
        let expansion = expand_schedules(&schedules, range);
        if expansion.invalid_rows > 0 {
            warn!(
                component = "sources",
                event = "sources.schedule.invalid_rows",
                feed = %self.schedules.name(),
                invalid_rows = expansion.invalid_rows
            );
        }
        Ok(expansion.hops)
    }
}
