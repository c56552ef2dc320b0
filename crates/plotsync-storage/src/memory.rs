use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plotsync_core::{
    ArchivedPlot, GeneralReading, Plot, PlotHistory, PlotSensorRecord, PlotSnapshot,
    PlotSummary, SensorValues,
};
use tokio::sync::Mutex;

use crate::{Store, StoreError};

/// Store operations that can be made to fail once, for exercising cycle aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    AppendGeneralReading,
    InsertPlot,
    RefreshPlot,
    AppendPlotRecord,
    ArchivePlot,
}

/// In-process store with the same semantics as [`crate::PgStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    last_id: i64,
    general: Vec<GeneralReading>,
    plots: BTreeMap<i64, Plot>,
    records: Vec<PlotSensorRecord>,
    archived: Vec<ArchivedPlot>,
    // (operation, remaining successful calls before it fails)
    failures: Vec<(FailPoint, usize)>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn check(&mut self, op: FailPoint) -> Result<(), StoreError> {
        let Some(pos) = self.failures.iter().position(|(p, _)| *p == op) else {
            return Ok(());
        };
        if self.failures[pos].1 > 0 {
            self.failures[pos].1 -= 1;
            return Ok(());
        }
        self.failures.remove(pos);
        Err(StoreError::Unavailable(format!("injected failure at {op:?}")))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `op` fail once, after `skip` successful calls.
    pub async fn fail_after(&self, op: FailPoint, skip: usize) {
        self.state.lock().await.failures.push((op, skip));
    }

    pub async fn general_reading_count(&self) -> usize {
        self.state.lock().await.general.len()
    }

    pub async fn plot_record_count(&self, plot_id: i64) -> usize {
        self.state
            .lock()
            .await
            .records
            .iter()
            .filter(|r| r.plot_id == plot_id)
            .count()
    }

    pub async fn archived_count(&self) -> usize {
        self.state.lock().await.archived.len()
    }
}

fn latest_by_capture<'a, T: 'a>(
    items: impl Iterator<Item = &'a T>,
    key: impl Fn(&T) -> (DateTime<Utc>, i64),
) -> Option<&'a T> {
    items.max_by_key(|item| key(item))
}

#[async_trait]
impl Store for MemoryStore {
    async fn latest_general_reading(&self) -> Result<Option<GeneralReading>, StoreError> {
        let state = self.state.lock().await;
        Ok(latest_by_capture(state.general.iter(), |r| (r.captured_at, r.id)).cloned())
    }

    async fn append_general_reading(
        &self,
        values: &SensorValues,
        captured_at: DateTime<Utc>,
    ) -> Result<GeneralReading, StoreError> {
        let mut state = self.state.lock().await;
        state.check(FailPoint::AppendGeneralReading)?;
        let reading = GeneralReading {
            id: state.next_id(),
            values: *values,
            captured_at,
        };
        state.general.push(reading.clone());
        Ok(reading)
    }

    async fn find_plot_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Plot>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .plots
            .values()
            .find(|p| p.external_id == external_id)
            .cloned())
    }

    async fn insert_plot(&self, entry: &PlotSnapshot, at: DateTime<Utc>) -> Result<Plot, StoreError> {
        let mut state = self.state.lock().await;
        state.check(FailPoint::InsertPlot)?;
        if state.plots.values().any(|p| p.external_id == entry.external_id) {
            return Err(StoreError::Conflict(format!(
                "plot {} already exists",
                entry.external_id
            )));
        }
        let plot = Plot {
            id: state.next_id(),
            external_id: entry.external_id.clone(),
            attributes: entry.attributes.clone(),
            sensors: entry.sensors,
            created_at: at,
            updated_at: at,
        };
        state.plots.insert(plot.id, plot.clone());
        Ok(plot)
    }

    async fn refresh_plot(
        &self,
        plot_id: i64,
        entry: &PlotSnapshot,
        at: DateTime<Utc>,
    ) -> Result<Plot, StoreError> {
        let mut state = self.state.lock().await;
        state.check(FailPoint::RefreshPlot)?;
        let plot = state
            .plots
            .get_mut(&plot_id)
            .ok_or_else(|| StoreError::NotFound(format!("plot row {plot_id}")))?;
        plot.attributes = entry.attributes.clone();
        plot.sensors = entry.sensors;
        plot.updated_at = at;
        Ok(plot.clone())
    }

    async fn latest_plot_record(
        &self,
        plot_id: i64,
    ) -> Result<Option<PlotSensorRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(latest_by_capture(
            state.records.iter().filter(|r| r.plot_id == plot_id),
            |r| (r.captured_at, r.id),
        )
        .cloned())
    }

    async fn append_plot_record(
        &self,
        plot_id: i64,
        values: &SensorValues,
        captured_at: DateTime<Utc>,
    ) -> Result<PlotSensorRecord, StoreError> {
        let mut state = self.state.lock().await;
        state.check(FailPoint::AppendPlotRecord)?;
        if !state.plots.contains_key(&plot_id) {
            return Err(StoreError::NotFound(format!("plot row {plot_id}")));
        }
        let record = PlotSensorRecord {
            id: state.next_id(),
            plot_id,
            values: *values,
            captured_at,
        };
        state.records.push(record.clone());
        Ok(record)
    }

    async fn list_plots(&self) -> Result<Vec<Plot>, StoreError> {
        Ok(self.state.lock().await.plots.values().cloned().collect())
    }

    async fn archive_plot(
        &self,
        plot: &Plot,
        archived_at: DateTime<Utc>,
    ) -> Result<ArchivedPlot, StoreError> {
        let mut state = self.state.lock().await;
        state.check(FailPoint::ArchivePlot)?;
        if !state.plots.contains_key(&plot.id) {
            return Err(StoreError::NotFound(format!("plot row {}", plot.id)));
        }
        let archived = ArchivedPlot {
            id: state.next_id(),
            external_id: Some(plot.external_id.clone()),
            attributes: plot.attributes.clone(),
            archived_at,
        };
        state.archived.push(archived.clone());
        state.records.retain(|r| r.plot_id != plot.id);
        state.plots.remove(&plot.id);
        Ok(archived)
    }

    async fn general_history(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<GeneralReading>, StoreError> {
        let state = self.state.lock().await;
        let mut out = state
            .general
            .iter()
            .filter(|r| r.captured_at >= since)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|r| (r.captured_at, r.id));
        Ok(out)
    }

    async fn plot_history(
        &self,
        plot_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Option<PlotHistory>, StoreError> {
        let state = self.state.lock().await;
        let Some(plot) = state.plots.get(&plot_id) else {
            return Ok(None);
        };
        let mut records = state
            .records
            .iter()
            .filter(|r| r.plot_id == plot_id && r.captured_at >= since)
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by_key(|r| (r.captured_at, r.id));
        Ok(Some(PlotHistory {
            plot: PlotSummary::from(plot),
            records,
        }))
    }

    async fn archived_plots_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ArchivedPlot>, StoreError> {
        let state = self.state.lock().await;
        let mut out = state
            .archived
            .iter()
            .filter(|a| a.archived_at >= since)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|a| std::cmp::Reverse((a.archived_at, a.id)));
        Ok(out)
    }
}
