//! Canonical time series model.
//!
//! Every adapter output passes through [`CanonicalTimeSeries::from_observations`],
//! which enforces the model's invariants:
//!
//! - timestamps strictly increasing
//! - one value per timestamp, collisions resolved by the adapter's [`MergePolicy`]
//! - non-finite values stored as absent
//!
//! Values are expected to already be in SI units (see [`crate::variable::convert`]).

use std::fmt::Write as _;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::variable::Variable;

/// One value at one instant. `None` marks a reported-but-missing value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    /// Observation time (UTC).
    pub timestamp: DateTime<Utc>,
    /// Value in SI units.
    pub value: Option<f64>,
}

impl Observation {
    /// Creates an observation, storing non-finite values as absent.
    #[must_use]
    pub fn new(timestamp: DateTime<Utc>, value: Option<f64>) -> Self {
        Self {
            timestamp,
            value: value.filter(|v| v.is_finite()),
        }
    }

    /// Creates an observation at midnight UTC of `date`.
    #[must_use]
    pub fn on_date(date: NaiveDate, value: Option<f64>) -> Self {
        Self::new(start_of_day(date), value)
    }
}

/// How observations sharing a timestamp are collapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Keep the first value in source order.
    First,
    /// Keep the last value in source order.
    #[default]
    Last,
    /// Average the present values.
    Mean,
}

/// Ordered, deduplicated observations for one (gauge, variable) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalTimeSeries {
    gauge_id: String,
    variable: Variable,
    observations: Vec<Observation>,
}

impl CanonicalTimeSeries {
    /// Creates a series with no observations.
    #[must_use]
    pub fn empty(gauge_id: impl Into<String>, variable: Variable) -> Self {
        Self {
            gauge_id: gauge_id.into(),
            variable,
            observations: Vec::new(),
        }
    }

    /// Builds a series from unordered observations.
    ///
    /// Sorting is stable, so `First` and `Last` refer to the order observations
    /// were supplied in.
    #[must_use]
    pub fn from_observations(
        gauge_id: impl Into<String>,
        variable: Variable,
        mut observations: Vec<Observation>,
        policy: MergePolicy,
    ) -> Self {
        observations.sort_by_key(|o| o.timestamp);

        let mut merged: Vec<Observation> = Vec::with_capacity(observations.len());
        let mut group: Vec<Option<f64>> = Vec::new();
        let mut current: Option<DateTime<Utc>> = None;

        for obs in observations {
            let value = obs.value.filter(|v| v.is_finite());
            if current != Some(obs.timestamp) {
                if let Some(ts) = current {
                    merged.push(Observation::new(ts, merge(&group, policy)));
                }
                group.clear();
                current = Some(obs.timestamp);
            }
            group.push(value);
        }
        if let Some(ts) = current {
            merged.push(Observation::new(ts, merge(&group, policy)));
        }

        Self {
            gauge_id: gauge_id.into(),
            variable,
            observations: merged,
        }
    }

    /// Restricts the series to the closed date interval `[start, end]`.
    ///
    /// The whole of `end` is included, so sub-daily observations on the last
    /// day survive.
    #[must_use]
    pub fn clip(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        let lower = start_of_day(start);
        let upper = end
            .succ_opt()
            .map_or(DateTime::<Utc>::MAX_UTC, start_of_day);
        self.observations
            .retain(|o| o.timestamp >= lower && o.timestamp < upper);
        self
    }

    /// Gauge the series belongs to.
    #[must_use]
    pub fn gauge_id(&self) -> &str {
        &self.gauge_id
    }

    /// Variable the series measures.
    #[must_use]
    pub fn variable(&self) -> &Variable {
        &self.variable
    }

    /// Ordered observations.
    #[must_use]
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// Number of observations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// Whether the series holds no observations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Renders the series as CSV with a `time,<variable-id>` header.
    ///
    /// Missing values are written as empty cells.
    #[must_use]
    pub fn to_csv(&self) -> String {
        let mut out = format!("time,{}\n", self.variable.id());
        for obs in &self.observations {
            let time = obs.timestamp.format("%Y-%m-%dT%H:%M:%SZ");
            match obs.value {
                Some(v) => {
                    let _ = writeln!(out, "{time},{v}");
                }
                None => {
                    let _ = writeln!(out, "{time},");
                }
            }
        }
        out
    }
}

fn merge(values: &[Option<f64>], policy: MergePolicy) -> Option<f64> {
    match policy {
        MergePolicy::First => values.first().copied().flatten(),
        MergePolicy::Last => values.last().copied().flatten(),
        MergePolicy::Mean => {
            let present: Vec<f64> = values.iter().filter_map(|v| *v).collect();
            if present.is_empty() {
                None
            } else {
                #[allow(clippy::cast_precision_loss)]
                let n = present.len() as f64;
                Some(present.iter().sum::<f64>() / n)
            }
        }
    }
}

/// Descriptive metadata for one gauge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StationMetadata {
    /// Provider-scoped gauge identifier.
    pub gauge_id: String,
    /// Station name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// River or water body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub river: Option<String>,
    /// Latitude (WGS84).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    /// Longitude (WGS84).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    /// Altitude in metres above sea level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    /// Catchment area in km².
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<f64>,
    /// Country name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Data source (agency).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl StationMetadata {
    /// Creates metadata with only the gauge identifier set.
    #[must_use]
    pub fn new(gauge_id: impl Into<String>) -> Self {
        Self {
            gauge_id: gauge_id.into(),
            ..Self::default()
        }
    }
}

/// Midnight UTC at the start of `date`.
#[must_use]
pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Parses the timestamp shapes agencies commonly emit.
///
/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM:SS`, `YYYY-MM-DD HH:MM:SS` (with or
/// without seconds) and plain `YYYY-MM-DD`. Naive timestamps are taken as UTC.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(start_of_day)
}

/// Truncates a timestamp to midnight of its UTC day.
#[must_use]
pub fn truncate_to_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    start_of_day(ts.date_naive())
}
