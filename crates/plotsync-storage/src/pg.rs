use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plotsync_core::{
    ArchivedPlot, GeneralReading, Plot, PlotAttributes, PlotHistory, PlotSensorRecord,
    PlotSnapshot, PlotSummary, SensorValues,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use crate::{Store, StoreError};

const PLOT_COLUMNS: &str = "id, external_id, name, location, responsible, crop_type, \
     last_irrigated_at, latitude, longitude, humidity, temperature, rainfall, sunlight, \
     created_at, updated_at";

const ARCHIVED_COLUMNS: &str = "id, external_id, name, location, responsible, crop_type, \
     last_irrigated_at, latitude, longitude, archived_at";

/// PostgreSQL-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn sensors_from_row(row: &PgRow) -> Result<SensorValues, sqlx::Error> {
    Ok(SensorValues {
        humidity: row.try_get("humidity")?,
        temperature: row.try_get("temperature")?,
        rainfall: row.try_get("rainfall")?,
        sunlight: row.try_get("sunlight")?,
    })
}

fn attributes_from_row(row: &PgRow) -> Result<PlotAttributes, sqlx::Error> {
    Ok(PlotAttributes {
        name: row.try_get("name")?,
        location: row.try_get("location")?,
        responsible: row.try_get("responsible")?,
        crop_type: row.try_get("crop_type")?,
        last_irrigated_at: row.try_get("last_irrigated_at")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
    })
}

fn general_from_row(row: &PgRow) -> Result<GeneralReading, sqlx::Error> {
    Ok(GeneralReading {
        id: row.try_get("id")?,
        values: sensors_from_row(row)?,
        captured_at: row.try_get("captured_at")?,
    })
}

fn plot_from_row(row: &PgRow) -> Result<Plot, sqlx::Error> {
    Ok(Plot {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        attributes: attributes_from_row(row)?,
        sensors: sensors_from_row(row)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn record_from_row(row: &PgRow) -> Result<PlotSensorRecord, sqlx::Error> {
    Ok(PlotSensorRecord {
        id: row.try_get("id")?,
        plot_id: row.try_get("plot_id")?,
        values: sensors_from_row(row)?,
        captured_at: row.try_get("captured_at")?,
    })
}

fn archived_from_row(row: &PgRow) -> Result<ArchivedPlot, sqlx::Error> {
    Ok(ArchivedPlot {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        attributes: attributes_from_row(row)?,
        archived_at: row.try_get("archived_at")?,
    })
}

fn map_insert_error(err: sqlx::Error, external_id: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(format!("plot {external_id} already exists"))
        }
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn latest_general_reading(&self) -> Result<Option<GeneralReading>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, humidity, temperature, rainfall, sunlight, captured_at
              FROM general_readings
             ORDER BY captured_at DESC, id DESC
             LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(general_from_row).transpose()?)
    }

    async fn append_general_reading(
        &self,
        values: &SensorValues,
        captured_at: DateTime<Utc>,
    ) -> Result<GeneralReading, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO general_readings (humidity, temperature, rainfall, sunlight, captured_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, humidity, temperature, rainfall, sunlight, captured_at
            "#,
        )
        .bind(values.humidity)
        .bind(values.temperature)
        .bind(values.rainfall)
        .bind(values.sunlight)
        .bind(captured_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(general_from_row(&row)?)
    }

    async fn find_plot_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Plot>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PLOT_COLUMNS} FROM plots WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(plot_from_row).transpose()?)
    }

    async fn insert_plot(&self, entry: &PlotSnapshot, at: DateTime<Utc>) -> Result<Plot, StoreError> {
        let attrs = &entry.attributes;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO plots (external_id, name, location, responsible, crop_type,
                               last_irrigated_at, latitude, longitude,
                               humidity, temperature, rainfall, sunlight,
                               created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
            RETURNING {PLOT_COLUMNS}
            "#
        ))
        .bind(&entry.external_id)
        .bind(&attrs.name)
        .bind(&attrs.location)
        .bind(&attrs.responsible)
        .bind(&attrs.crop_type)
        .bind(attrs.last_irrigated_at)
        .bind(attrs.latitude)
        .bind(attrs.longitude)
        .bind(entry.sensors.humidity)
        .bind(entry.sensors.temperature)
        .bind(entry.sensors.rainfall)
        .bind(entry.sensors.sunlight)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| map_insert_error(err, &entry.external_id))?;
        Ok(plot_from_row(&row)?)
    }

    async fn refresh_plot(
        &self,
        plot_id: i64,
        entry: &PlotSnapshot,
        at: DateTime<Utc>,
    ) -> Result<Plot, StoreError> {
        let attrs = &entry.attributes;
        let row = sqlx::query(&format!(
            r#"
            UPDATE plots
               SET name = $2, location = $3, responsible = $4, crop_type = $5,
                   last_irrigated_at = $6, latitude = $7, longitude = $8,
                   humidity = $9, temperature = $10, rainfall = $11, sunlight = $12,
                   updated_at = $13
             WHERE id = $1
            RETURNING {PLOT_COLUMNS}
            "#
        ))
        .bind(plot_id)
        .bind(&attrs.name)
        .bind(&attrs.location)
        .bind(&attrs.responsible)
        .bind(&attrs.crop_type)
        .bind(attrs.last_irrigated_at)
        .bind(attrs.latitude)
        .bind(attrs.longitude)
        .bind(entry.sensors.humidity)
        .bind(entry.sensors.temperature)
        .bind(entry.sensors.rainfall)
        .bind(entry.sensors.sunlight)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(plot_from_row(&row)?),
            None => Err(StoreError::NotFound(format!("plot row {plot_id}"))),
        }
    }

    async fn latest_plot_record(
        &self,
        plot_id: i64,
    ) -> Result<Option<PlotSensorRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, plot_id, humidity, temperature, rainfall, sunlight, captured_at
              FROM plot_sensor_records
             WHERE plot_id = $1
             ORDER BY captured_at DESC, id DESC
             LIMIT 1
            "#,
        )
        .bind(plot_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn append_plot_record(
        &self,
        plot_id: i64,
        values: &SensorValues,
        captured_at: DateTime<Utc>,
    ) -> Result<PlotSensorRecord, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO plot_sensor_records (plot_id, humidity, temperature, rainfall, sunlight, captured_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, plot_id, humidity, temperature, rainfall, sunlight, captured_at
            "#,
        )
        .bind(plot_id)
        .bind(values.humidity)
        .bind(values.temperature)
        .bind(values.rainfall)
        .bind(values.sunlight)
        .bind(captured_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(record_from_row(&row)?)
    }

    async fn list_plots(&self) -> Result<Vec<Plot>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {PLOT_COLUMNS} FROM plots ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(plot_from_row(&row)?);
        }
        Ok(out)
    }

    async fn archive_plot(
        &self,
        plot: &Plot,
        archived_at: DateTime<Utc>,
    ) -> Result<ArchivedPlot, StoreError> {
        let attrs = &plot.attributes;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO archived_plots (external_id, name, location, responsible, crop_type,
                                        last_irrigated_at, latitude, longitude, archived_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {ARCHIVED_COLUMNS}
            "#
        ))
        .bind(&plot.external_id)
        .bind(&attrs.name)
        .bind(&attrs.location)
        .bind(&attrs.responsible)
        .bind(&attrs.crop_type)
        .bind(attrs.last_irrigated_at)
        .bind(attrs.latitude)
        .bind(attrs.longitude)
        .bind(archived_at)
        .fetch_one(&mut *tx)
        .await?;
        let archived = archived_from_row(&row)?;

        sqlx::query("DELETE FROM plot_sensor_records WHERE plot_id = $1")
            .bind(plot.id)
            .execute(&mut *tx)
            .await?;

        let deleted = sqlx::query("DELETE FROM plots WHERE id = $1")
            .bind(plot.id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::NotFound(format!("plot row {}", plot.id)));
        }

        tx.commit().await?;
        Ok(archived)
    }

    async fn general_history(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<GeneralReading>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, humidity, temperature, rainfall, sunlight, captured_at
              FROM general_readings
             WHERE captured_at >= $1
             ORDER BY captured_at ASC, id ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(general_from_row(&row)?);
        }
        Ok(out)
    }

    async fn plot_history(
        &self,
        plot_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Option<PlotHistory>, StoreError> {
        let plot_row = sqlx::query(&format!("SELECT {PLOT_COLUMNS} FROM plots WHERE id = $1"))
            .bind(plot_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(plot_row) = plot_row else {
            return Ok(None);
        };
        let plot = plot_from_row(&plot_row)?;

        let rows = sqlx::query(
            r#"
            SELECT id, plot_id, humidity, temperature, rainfall, sunlight, captured_at
              FROM plot_sensor_records
             WHERE plot_id = $1
               AND captured_at >= $2
             ORDER BY captured_at ASC, id ASC
            "#,
        )
        .bind(plot_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(record_from_row(&row)?);
        }
        Ok(Some(PlotHistory {
            plot: PlotSummary::from(&plot),
            records,
        }))
    }

    async fn archived_plots_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ArchivedPlot>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ARCHIVED_COLUMNS}
              FROM archived_plots
             WHERE archived_at >= $1
             ORDER BY archived_at DESC, id DESC
            "#
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(archived_from_row(&row)?);
        }
        Ok(out)
    }
}
