//! Core domain model for plot telemetry reconciliation.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "plotsync-core";

/// The four sensor channels reported both site-wide and per plot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorValues {
    pub humidity: f64,
    pub temperature: f64,
    pub rainfall: f64,
    pub sunlight: f64,
}

impl SensorValues {
    pub fn new(humidity: f64, temperature: f64, rainfall: f64, sunlight: f64) -> Self {
        Self {
            humidity,
            temperature,
            rainfall,
            sunlight,
        }
    }
}

/// Decides whether `candidate` warrants a new history row.
///
/// Fields are compared with exact equality; there is no tolerance band. A missing
/// previous reading always counts as a change.
pub fn has_changed(previous: Option<&SensorValues>, candidate: &SensorValues) -> bool {
    match previous {
        None => true,
        Some(prev) => {
            prev.humidity != candidate.humidity
                || prev.temperature != candidate.temperature
                || prev.rainfall != candidate.rainfall
                || prev.sunlight != candidate.sunlight
        }
    }
}

/// Descriptive attributes of a plot, as reported upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotAttributes {
    pub name: String,
    pub location: Option<String>,
    pub responsible: Option<String>,
    pub crop_type: Option<String>,
    pub last_irrigated_at: Option<DateTime<Utc>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl PlotAttributes {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: None,
            responsible: None,
            crop_type: None,
            last_irrigated_at: None,
            latitude: None,
            longitude: None,
        }
    }
}

/// One plot entry of an upstream snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotSnapshot {
    pub external_id: String,
    pub attributes: PlotAttributes,
    pub sensors: SensorValues,
}

/// Strictly typed handoff contract from the feed decoder into the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub general: SensorValues,
    pub plots: Vec<PlotSnapshot>,
}

impl Snapshot {
    pub fn external_ids(&self) -> HashSet<&str> {
        self.plots.iter().map(|p| p.external_id.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralReading {
    pub id: i64,
    pub values: SensorValues,
    pub captured_at: DateTime<Utc>,
}

/// A live plot row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plot {
    pub id: i64,
    pub external_id: String,
    pub attributes: PlotAttributes,
    pub sensors: SensorValues,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotSensorRecord {
    pub id: i64,
    pub plot_id: i64,
    pub values: SensorValues,
    pub captured_at: DateTime<Utc>,
}

/// Permanent copy of a plot withdrawn from the upstream feed.
///
/// `external_id` is `None` only for rows archived before the identifier was copied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedPlot {
    pub id: i64,
    pub external_id: Option<String>,
    pub attributes: PlotAttributes,
    pub archived_at: DateTime<Utc>,
}

impl ArchivedPlot {
    /// Whether a live plot now stands for the same site.
    ///
    /// Matches on `external_id` when the archive row carries one, otherwise on exact
    /// name + location equality.
    pub fn has_reappeared_in(&self, live: &[Plot]) -> bool {
        match &self.external_id {
            Some(external_id) => live.iter().any(|p| &p.external_id == external_id),
            None => live.iter().any(|p| {
                p.attributes.name == self.attributes.name
                    && p.attributes.location == self.attributes.location
            }),
        }
    }
}

/// Archived plot annotated with whether the withdrawal is still in effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedPlotStatus {
    #[serde(flatten)]
    pub archived: ArchivedPlot,
    pub still_archived: bool,
}

/// Descriptive subset of a plot joined onto its history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotSummary {
    pub id: i64,
    pub external_id: String,
    pub name: String,
    pub location: Option<String>,
    pub crop_type: Option<String>,
}

impl From<&Plot> for PlotSummary {
    fn from(plot: &Plot) -> Self {
        Self {
            id: plot.id,
            external_id: plot.external_id.clone(),
            name: plot.attributes.name.clone(),
            location: plot.attributes.location.clone(),
            crop_type: plot.attributes.crop_type.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotHistory {
    pub plot: PlotSummary,
    pub records: Vec<PlotSensorRecord>,
}

/// Latest site-wide reading plus every live plot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    pub general: Option<GeneralReading>,
    pub plots: Vec<Plot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap()
    }

    fn live(id: i64, external_id: &str, name: &str, location: Option<&str>) -> Plot {
        let mut attributes = PlotAttributes::named(name);
        attributes.location = location.map(ToString::to_string);
        Plot {
            id,
            external_id: external_id.to_string(),
            attributes,
            sensors: SensorValues::new(1.0, 2.0, 3.0, 4.0),
            created_at: ts(),
            updated_at: ts(),
        }
    }

    fn archived(external_id: Option<&str>, name: &str, location: Option<&str>) -> ArchivedPlot {
        let mut attributes = PlotAttributes::named(name);
        attributes.location = location.map(ToString::to_string);
        ArchivedPlot {
            id: 1,
            external_id: external_id.map(ToString::to_string),
            attributes,
            archived_at: ts(),
        }
    }

    #[test]
    fn absent_previous_is_always_a_change() {
        assert!(has_changed(None, &SensorValues::new(0.0, 0.0, 0.0, 0.0)));
    }

    #[test]
    fn any_single_field_difference_is_a_change() {
        let prev = SensorValues::new(10.0, 20.0, 0.0, 5.0);
        let candidates = [
            SensorValues::new(11.0, 20.0, 0.0, 5.0),
            SensorValues::new(10.0, 20.5, 0.0, 5.0),
            SensorValues::new(10.0, 20.0, 0.1, 5.0),
            SensorValues::new(10.0, 20.0, 0.0, 4.0),
        ];
        for candidate in candidates {
            assert!(has_changed(Some(&prev), &candidate), "{candidate:?}");
        }
        assert!(!has_changed(Some(&prev), &prev));
    }

    #[test]
    fn equality_has_no_tolerance_band() {
        let prev = SensorValues::new(10.0, 20.0, 0.0, 5.0);
        let nudged = SensorValues::new(10.0 + 1e-9, 20.0, 0.0, 5.0);
        assert!(has_changed(Some(&prev), &nudged));
    }

    #[test]
    fn reappearance_matches_on_external_id_first() {
        let row = archived(Some("P1"), "Norte", Some("Campo A"));
        assert!(row.has_reappeared_in(&[live(7, "P1", "Renamed", None)]));
        // same name and location under another id is a different plot
        assert!(!row.has_reappeared_in(&[live(8, "P9", "Norte", Some("Campo A"))]));
    }

    #[test]
    fn legacy_rows_fall_back_to_name_and_location() {
        let row = archived(None, "Norte", Some("Campo A"));
        assert!(row.has_reappeared_in(&[live(8, "P9", "Norte", Some("Campo A"))]));
        assert!(!row.has_reappeared_in(&[live(8, "P9", "Norte", Some("Campo B"))]));
        assert!(!row.has_reappeared_in(&[]));
    }

    #[test]
    fn archived_status_serializes_flat() {
        let status = ArchivedPlotStatus {
            archived: archived(Some("P1"), "Norte", None),
            still_archived: true,
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["external_id"], "P1");
        assert_eq!(value["still_archived"], true);
        assert_eq!(value["attributes"]["name"], "Norte");
    }
}
