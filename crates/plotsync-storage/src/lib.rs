//! Persistence contracts + HTTP fetch utilities for plotsync.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plotsync_core::{
    ArchivedPlot, ArchivedPlotStatus, GeneralReading, Overview, Plot, PlotHistory,
    PlotSensorRecord, PlotSnapshot, SensorValues,
};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

mod memory;
mod pg;

pub use memory::{FailPoint, MemoryStore};
pub use pg::PgStore;

pub const CRATE_NAME: &str = "plotsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistent entities maintained by the reconciliation job.
///
/// Readings and plot records are append-only. The only deletions happen inside
/// [`Store::archive_plot`].
#[async_trait]
pub trait Store: Send + Sync {
    async fn latest_general_reading(&self) -> Result<Option<GeneralReading>, StoreError>;

    async fn append_general_reading(
        &self,
        values: &SensorValues,
        captured_at: DateTime<Utc>,
    ) -> Result<GeneralReading, StoreError>;

    async fn find_plot_by_external_id(&self, external_id: &str)
        -> Result<Option<Plot>, StoreError>;

    /// Creates a live plot. Fails with [`StoreError::Conflict`] if the external id is taken.
    async fn insert_plot(
        &self,
        entry: &PlotSnapshot,
        at: DateTime<Utc>,
    ) -> Result<Plot, StoreError>;

    /// Overwrites attributes and current sensor values of an existing plot.
    async fn refresh_plot(
        &self,
        plot_id: i64,
        entry: &PlotSnapshot,
        at: DateTime<Utc>,
    ) -> Result<Plot, StoreError>;

    async fn latest_plot_record(&self, plot_id: i64)
        -> Result<Option<PlotSensorRecord>, StoreError>;

    async fn append_plot_record(
        &self,
        plot_id: i64,
        values: &SensorValues,
        captured_at: DateTime<Utc>,
    ) -> Result<PlotSensorRecord, StoreError>;

    /// Every live plot, ordered by row id.
    async fn list_plots(&self) -> Result<Vec<Plot>, StoreError>;

    /// Copies the plot into the archive, then deletes its records, then the plot row.
    async fn archive_plot(
        &self,
        plot: &Plot,
        archived_at: DateTime<Utc>,
    ) -> Result<ArchivedPlot, StoreError>;

    /// Readings captured at or after `since`, oldest first.
    async fn general_history(&self, since: DateTime<Utc>)
        -> Result<Vec<GeneralReading>, StoreError>;

    /// Records of one plot captured at or after `since`, oldest first.
    async fn plot_history(
        &self,
        plot_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Option<PlotHistory>, StoreError>;

    /// Archive rows written at or after `since`, newest first.
    async fn archived_plots_since(&self, since: DateTime<Utc>)
        -> Result<Vec<ArchivedPlot>, StoreError>;
}

pub async fn overview(store: &dyn Store) -> Result<Overview, StoreError> {
    let general = store.latest_general_reading().await?;
    let plots = store.list_plots().await?;
    Ok(Overview { general, plots })
}

pub async fn archived_plot_statuses(
    store: &dyn Store,
    since: DateTime<Utc>,
) -> Result<Vec<ArchivedPlotStatus>, StoreError> {
    let archived = store.archived_plots_since(since).await?;
    let live = store.list_plots().await?;
    Ok(archived
        .into_iter()
        .map(|archived| {
            let still_archived = !archived.has_reappeared_in(&live);
            ArchivedPlotStatus {
                archived,
                still_archived,
            }
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Transport-level retry policy. Zero retries means a failed request fails the cycle.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        warn!(%status, attempt, "retryable upstream status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        warn!(error = %err, attempt, "retryable request failure");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
