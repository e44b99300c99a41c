//! Location to track-segment registry.
//!
//! The registry is built from a precomputed mapping table (one row per
//! location/segment pair with the location's distance to the segment). Raw
//! STANOX/TIPLOC codes and weather station ids all live in the same table.
//!
//! Rules implemented:
//! - segment codes are `{ELR}_{mile_bucket:03}` (`ECM1_005`)
//! - location codes are compared trimmed and upper-cased
//! - a location mapped to several segments resolves to the nearest one,
//!   ties broken by segment code
//! - station candidates per segment are ordered by distance, then code

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

const MAX_REPORTED_MAPPING_SAMPLES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SegmentCode(String);

impl SegmentCode {
    pub fn new(code: impl Into<String>) -> Result<Self, RegistryError> {
        let code = code.into();
        let trimmed = code.trim();
        let valid = !trimmed.is_empty()
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(RegistryError::InvalidSegmentCode(code));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn from_parts(elr: &str, mile_bucket: u32) -> Result<Self, RegistryError> {
        Self::new(format!("{}_{mile_bucket:03}", elr.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SegmentCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SegmentCode {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SegmentCode> for String {
    fn from(value: SegmentCode) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationMapping {
    pub location_code: String,
    pub elr: String,
    pub mile_bucket: u32,
    pub distance_m: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationCandidate {
    pub station: String,
    pub distance_m: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("invalid segment code '{0}'")]
    InvalidSegmentCode(String),
    #[error("mapping row {row} has an empty location code")]
    EmptyLocationCode { row: usize },
    #[error("mapping row {row} for location '{location}' has invalid distance {distance_m}")]
    InvalidDistance {
        row: usize,
        location: String,
        distance_m: f64,
    },
    #[error("segment '{0}' requested as active but absent from the registry")]
    UnknownSegment(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum MappingError {
    #[error("{feed} row references unknown location '{location}'")]
    UnknownLocation { feed: String, location: String },
    #[error("{feed} row references location '{location}' outside the active segment set")]
    InactiveSegment { feed: String, location: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingReport {
    pub dropped_rows: u64,
    pub samples: Vec<MappingError>,
}

impl MappingReport {
    pub fn record(&mut self, err: MappingError) {
        debug!(
            component = "registry",
            event = "registry.mapping.dropped",
            reason = %err
        );
        self.dropped_rows = self.dropped_rows.saturating_add(1);
        if self.samples.len() < MAX_REPORTED_MAPPING_SAMPLES {
            self.samples.push(err);
        }
    }

    pub fn is_clean(&self) -> bool {
        self.dropped_rows == 0
    }

    pub fn absorb(&mut self, other: MappingReport) {
        self.dropped_rows = self.dropped_rows.saturating_add(other.dropped_rows);
        let room = MAX_REPORTED_MAPPING_SAMPLES.saturating_sub(self.samples.len());
        self.samples.extend(other.samples.into_iter().take(room));
    }
}

#[derive(Debug, Clone, Default)]
pub struct SegmentRegistry {
    by_location: HashMap<String, Vec<(SegmentCode, f64)>>,
    by_segment: BTreeMap<SegmentCode, Vec<StationCandidate>>,
}

pub fn normalize_location(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

impl SegmentRegistry {
    pub fn from_mappings(
        mappings: impl IntoIterator<Item = LocationMapping>,
    ) -> Result<Self, RegistryError> {
        let mut pairs: BTreeMap<(String, SegmentCode), f64> = BTreeMap::new();

        for (row, mapping) in mappings.into_iter().enumerate() {
            let location = normalize_location(&mapping.location_code);
            if location.is_empty() {
                return Err(RegistryError::EmptyLocationCode { row });
            }
            if !mapping.distance_m.is_finite() || mapping.distance_m < 0.0 {
                return Err(RegistryError::InvalidDistance {
                    row,
                    location,
                    distance_m: mapping.distance_m,
                });
            }
            let segment = SegmentCode::from_parts(&mapping.elr, mapping.mile_bucket)?;
            pairs
                .entry((location, segment))
                .and_modify(|d| *d = d.min(mapping.distance_m))
                .or_insert(mapping.distance_m);
        }

        let mut by_location: HashMap<String, Vec<(SegmentCode, f64)>> = HashMap::new();
        let mut by_segment: BTreeMap<SegmentCode, Vec<StationCandidate>> = BTreeMap::new();
        for ((location, segment), distance_m) in pairs {
            by_location
                .entry(location.clone())
                .or_default()
                .push((segment.clone(), distance_m));
            by_segment.entry(segment).or_default().push(StationCandidate {
                station: location,
                distance_m,
            });
        }

        for segments in by_location.values_mut() {
            segments.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        }
        for candidates in by_segment.values_mut() {
            candidates.sort_by(|a, b| {
                a.distance_m
                    .total_cmp(&b.distance_m)
                    .then_with(|| a.station.cmp(&b.station))
            });
        }

        info!(
            component = "registry",
            event = "registry.built",
            locations = by_location.len(),
            segments = by_segment.len()
        );

        Ok(Self {
            by_location,
            by_segment,
        })
    }

    pub fn segments(&self) -> impl Iterator<Item = &SegmentCode> {
        self.by_segment.keys()
    }

    pub fn segment_count(&self) -> usize {
        self.by_segment.len()
    }

    pub fn location_count(&self) -> usize {
        self.by_location.len()
    }

    pub fn contains_segment(&self, segment: &SegmentCode) -> bool {
        self.by_segment.contains_key(segment)
    }

    pub fn candidates(&self, segment: &SegmentCode) -> &[StationCandidate] {
        self.by_segment
            .get(segment)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn nearest_segment(&self, location: &str) -> Option<&SegmentCode> {
        self.by_location
            .get(&normalize_location(location))
            .and_then(|segments| segments.first())
            .map(|(segment, _)| segment)
    }

    pub fn resolve(
        &self,
        feed: &str,
        location: &str,
        is_active: impl Fn(&SegmentCode) -> bool,
    ) -> Result<&SegmentCode, MappingError> {
        let normalized = normalize_location(location);
        let Some(segments) = self.by_location.get(&normalized) else {
            return Err(MappingError::UnknownLocation {
                feed: feed.to_string(),
                location: normalized,
            });
        };

        segments
            .iter()
            .map(|(segment, _)| segment)
            .find(|segment| is_active(segment))
            .ok_or(MappingError::InactiveSegment {
                feed: feed.to_string(),
                location: normalized,
            })
    }

    pub fn active_segments(
        &self,
        allow_list: Option<&[String]>,
    ) -> Result<Vec<SegmentCode>, RegistryError> {
        let Some(allow_list) = allow_list else {
            return Ok(self.by_segment.keys().cloned().collect());
        };

        let mut active = BTreeSet::new();
        for raw in allow_list {
            let segment = SegmentCode::new(raw.as_str())?;
            if !self.contains_segment(&segment) {
                return Err(RegistryError::UnknownSegment(segment.to_string()));
            }
            active.insert(segment);
        }
        Ok(active.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(location: &str, elr: &str, bucket: u32, distance_m: f64) -> LocationMapping {
        LocationMapping {
            location_code: location.to_string(),
            elr: elr.to_string(),
            mile_bucket: bucket,
            distance_m,
        }
    }

    #[test]
    fn segment_code_is_elr_and_padded_bucket() {
        let code = SegmentCode::from_parts("ecm1", 5).unwrap();
        assert_eq!(code.as_str(), "ECM1_005");
        assert!(SegmentCode::new("bad/code").is_err());
        assert!(SegmentCode::new("  ").is_err());
    }

    #[test]
    fn location_resolves_to_nearest_segment_with_code_tie_break() {
        let registry = SegmentRegistry::from_mappings(vec![
            mapping("87701", "ECM1", 6, 120.0),
            mapping("87701", "ECM1", 5, 120.0),
            mapping("87701", "MLN1", 1, 400.0),
        ])
        .unwrap();

        let nearest = registry.nearest_segment(" 87701 ").unwrap();
        assert_eq!(nearest.as_str(), "ECM1_005");

        let resolved = registry
            .resolve("hops", "87701", |s| s.as_str() == "MLN1_001")
            .unwrap();
        assert_eq!(resolved.as_str(), "MLN1_001");
    }

    #[test]
    fn resolve_reports_unknown_and_inactive_locations() {
        let registry =
            SegmentRegistry::from_mappings(vec![mapping("KNGX", "ECM1", 0, 10.0)]).unwrap();

        assert_eq!(
            registry.resolve("hops", "york", |_| true).unwrap_err(),
            MappingError::UnknownLocation {
                feed: "hops".to_string(),
                location: "YORK".to_string()
            }
        );
        assert!(matches!(
            registry.resolve("hops", "kngx", |_| false).unwrap_err(),
            MappingError::InactiveSegment { .. }
        ));
    }

    #[test]
    fn candidates_are_ordered_by_distance_then_code() {
        let registry = SegmentRegistry::from_mappings(vec![
            mapping("STN_B", "ECM1", 5, 900.0),
            mapping("STN_C", "ECM1", 5, 300.0),
            mapping("STN_A", "ECM1", 5, 300.0),
            mapping("STN_A", "ECM1", 5, 250.0),
        ])
        .unwrap();

        let segment = SegmentCode::new("ECM1_005").unwrap();
        let order: Vec<_> = registry
            .candidates(&segment)
            .iter()
            .map(|c| (c.station.as_str(), c.distance_m))
            .collect();
        assert_eq!(
            order,
            vec![("STN_A", 250.0), ("STN_C", 300.0), ("STN_B", 900.0)]
        );
    }

    #[test]
    fn invalid_rows_are_rejected() {
        assert_eq!(
            SegmentRegistry::from_mappings(vec![mapping(" ", "ECM1", 1, 1.0)]).unwrap_err(),
            RegistryError::EmptyLocationCode { row: 0 }
        );
        assert!(matches!(
            SegmentRegistry::from_mappings(vec![mapping("X", "ECM1", 1, -3.0)]).unwrap_err(),
            RegistryError::InvalidDistance { .. }
        ));
    }

    #[test]
    fn allow_list_must_reference_known_segments() {
        let registry =
            SegmentRegistry::from_mappings(vec![mapping("KNGX", "ECM1", 0, 10.0)]).unwrap();
        let active = registry
            .active_segments(Some(&["ecm1_000".to_string()]))
            .unwrap();
        assert_eq!(active[0].as_str(), "ECM1_000");

        assert_eq!(
            registry
                .active_segments(Some(&["ECM9_001".to_string()]))
                .unwrap_err(),
            RegistryError::UnknownSegment("ECM9_001".to_string())
        );
    }

    #[test]
    fn mapping_report_caps_samples_but_counts_everything() {
        let mut report = MappingReport::default();
        for idx in 0..40 {
            report.record(MappingError::UnknownLocation {
                feed: "hops".to_string(),
                location: format!("L{idx}"),
            });
        }
        assert_eq!(report.dropped_rows, 40);
        assert_eq!(report.samples.len(), MAX_REPORTED_MAPPING_SAMPLES);
        assert!(!report.is_clean());
    }

    #[test]
    fn absorbed_reports_keep_the_earliest_samples() {
        let unknown = |location: &str| MappingError::UnknownLocation {
            feed: "weather".to_string(),
            location: location.to_string(),
        };
        let mut first = MappingReport::default();
        for idx in 0..10 {
            first.record(unknown(&format!("A{idx}")));
        }
        let mut second = MappingReport::default();
        for idx in 0..10 {
            second.record(unknown(&format!("B{idx}")));
        }

        first.absorb(second);
        assert_eq!(first.dropped_rows, 20);
        assert_eq!(first.samples.len(), MAX_REPORTED_MAPPING_SAMPLES);
        assert_eq!(first.samples[9], unknown("A9"));
        assert_eq!(first.samples[10], unknown("B0"));
    }
}
