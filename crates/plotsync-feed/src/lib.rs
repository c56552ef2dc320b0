//! Upstream telemetry sources + strict snapshot decoding.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use plotsync_core::{PlotAttributes, PlotSnapshot, SensorValues, Snapshot};
use plotsync_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "plotsync-feed";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing required field `{path}`")]
    MissingField { path: String },
    #[error("field `{path}` is not {expected}")]
    InvalidField { path: String, expected: &'static str },
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Where a reconciliation cycle pulls its snapshot from.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn source_name(&self) -> &str;

    async fn fetch(&self) -> Result<Snapshot, FeedError>;
}

/// Polls the upstream telemetry endpoint over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSnapshotSource {
    http: HttpFetcher,
    url: String,
}

impl HttpSnapshotSource {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    fn source_name(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<Snapshot, FeedError> {
        let resp = self.http.fetch_bytes(&self.url).await?;
        debug!(bytes = resp.body.len(), url = %resp.final_url, "snapshot payload received");
        Ok(decode_snapshot(&resp.body)?)
    }
}

/// Re-reads an upstream-shaped JSON document from disk on every fetch.
#[derive(Debug, Clone)]
pub struct FixtureSnapshotSource {
    path: PathBuf,
    name: String,
}

impl FixtureSnapshotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self { path, name }
    }

}

#[async_trait]
impl SnapshotSource for FixtureSnapshotSource {
    fn source_name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Snapshot, FeedError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| FetchError::Io {
                path: self.name.clone(),
                source,
            })?;
        Ok(decode_snapshot(&bytes)?)
    }
}

/// Serves an in-memory snapshot that callers can swap between cycles.
#[derive(Debug)]
pub struct StaticSnapshotSource {
    snapshot: Mutex<Snapshot>,
}

impl StaticSnapshotSource {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    pub async fn replace(&self, snapshot: Snapshot) {
        *self.snapshot.lock().await = snapshot;
    }
}

#[async_trait]
impl SnapshotSource for StaticSnapshotSource {
    fn source_name(&self) -> &str {
        "static"
    }

    async fn fetch(&self) -> Result<Snapshot, FeedError> {
        Ok(self.snapshot.lock().await.clone())
    }
}

/// Parses one upstream document into a [`Snapshot`].
///
/// Required: `sensores` with all four channels, `parcelas` as an array, and per plot
/// `id`, `nombre` and `sensor`. Everything descriptive beyond the name is optional.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot, DecodeError> {
    let value: JsonValue = serde_json::from_slice(bytes)?;
    decode_snapshot_value(&value)
}

pub fn decode_snapshot_value(value: &JsonValue) -> Result<Snapshot, DecodeError> {
    if !value.is_object() {
        return Err(invalid("$", "an object"));
    }
    let general = sensor_values(required(value, "sensores", "sensores")?, "sensores")?;
    let entries = required(value, "parcelas", "parcelas")?
        .as_array()
        .ok_or_else(|| invalid("parcelas", "an array"))?;

    let plots = entries
        .iter()
        .enumerate()
        .map(|(i, entry)| plot_snapshot(entry, &format!("parcelas[{i}]")))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Snapshot { general, plots })
}

fn plot_snapshot(entry: &JsonValue, path: &str) -> Result<PlotSnapshot, DecodeError> {
    if !entry.is_object() {
        return Err(invalid(path, "an object"));
    }
    let external_id = external_id(entry, path)?;
    let name_path = format!("{path}.nombre");
    let name = required(entry, "nombre", &name_path)?
        .as_str()
        .ok_or_else(|| invalid(&name_path, "a string"))?
        .to_string();

    let attributes = PlotAttributes {
        name,
        location: optional_str(entry, "ubicacion", path)?,
        responsible: optional_str(entry, "responsable", path)?,
        crop_type: optional_str(entry, "tipo_cultivo", path)?,
        last_irrigated_at: optional_timestamp(entry, "ultimo_riego", path)?,
        latitude: optional_number(entry, "latitud", path)?,
        longitude: optional_number(entry, "longitud", path)?,
    };
    let sensor_path = format!("{path}.sensor");
    let sensors = sensor_values(required(entry, "sensor", &sensor_path)?, &sensor_path)?;

    Ok(PlotSnapshot {
        external_id,
        attributes,
        sensors,
    })
}

fn sensor_values(value: &JsonValue, path: &str) -> Result<SensorValues, DecodeError> {
    if !value.is_object() {
        return Err(invalid(path, "an object"));
    }
    let channel = |key: &str| -> Result<f64, DecodeError> {
        let field_path = format!("{path}.{key}");
        let raw = required(value, key, &field_path)?;
        number(raw).ok_or_else(|| invalid(&field_path, "a finite number"))
    };
    Ok(SensorValues {
        humidity: channel("humedad")?,
        temperature: channel("temperatura")?,
        rainfall: channel("lluvia")?,
        sunlight: channel("sol")?,
    })
}

fn external_id(entry: &JsonValue, path: &str) -> Result<String, DecodeError> {
    let id_path = format!("{path}.id");
    let id = match required(entry, "id", &id_path)? {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) if n.is_i64() || n.is_u64() => n.to_string(),
        _ => return Err(invalid(&id_path, "a string or integer")),
    };
    if id.is_empty() {
        return Err(invalid(&id_path, "a non-empty identifier"));
    }
    Ok(id)
}

fn required<'a>(value: &'a JsonValue, key: &str, path: &str) -> Result<&'a JsonValue, DecodeError> {
    match value.get(key) {
        Some(JsonValue::Null) | None => Err(DecodeError::MissingField {
            path: path.to_string(),
        }),
        Some(v) => Ok(v),
    }
}

fn present<'a>(value: &'a JsonValue, key: &str) -> Option<&'a JsonValue> {
    value.get(key).filter(|v| !v.is_null())
}

fn optional_str(value: &JsonValue, key: &str, path: &str) -> Result<Option<String>, DecodeError> {
    let Some(raw) = present(value, key) else {
        return Ok(None);
    };
    let s = raw
        .as_str()
        .ok_or_else(|| invalid(&format!("{path}.{key}"), "a string"))?;
    let trimmed = s.trim();
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}

fn optional_number(value: &JsonValue, key: &str, path: &str) -> Result<Option<f64>, DecodeError> {
    match present(value, key) {
        None => Ok(None),
        Some(raw) => number(raw)
            .map(Some)
            .ok_or_else(|| invalid(&format!("{path}.{key}"), "a finite number")),
    }
}

fn optional_timestamp(
    value: &JsonValue,
    key: &str,
    path: &str,
) -> Result<Option<DateTime<Utc>>, DecodeError> {
    let field_path = format!("{path}.{key}");
    let Some(raw) = optional_str(value, key, path)? else {
        return Ok(None);
    };
    parse_timestamp(&raw)
        .map(Some)
        .ok_or_else(|| invalid(&field_path, "a timestamp"))
}

/// Accepts JSON numbers and numeric strings; rejects NaN and infinities.
fn number(value: &JsonValue) -> Option<f64> {
    let n = match value {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// RFC 3339, or a naive date/datetime taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn invalid(path: &str, expected: &'static str) -> DecodeError {
    DecodeError::InvalidField {
        path: path.to_string(),
        expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample() -> JsonValue {
        json!({
            "sensores": {"humedad": 40, "temperatura": 22.5, "lluvia": 0, "sol": 3},
            "parcelas": [{
                "id": "P1",
                "nombre": "Norte",
                "ubicacion": "Campo A",
                "responsable": "Lucía",
                "tipo_cultivo": "Maíz",
                "ultimo_riego": "2026-02-28 06:30:00",
                "latitud": 21.1619,
                "longitud": -86.8515,
                "sensor": {"humedad": 35, "temperatura": 21, "lluvia": 0, "sol": 2}
            }]
        })
    }

    fn expect_invalid(value: &JsonValue, expected_path: &str) {
        match decode_snapshot_value(value) {
            Err(DecodeError::InvalidField { path, .. }) | Err(DecodeError::MissingField { path }) => {
                assert_eq!(path, expected_path)
            }
            other => panic!("expected decode error at {expected_path}, got {other:?}"),
        }
    }

    #[test]
    fn decodes_full_payload() {
        let snapshot = decode_snapshot_value(&sample()).unwrap();
        assert_eq!(snapshot.general, SensorValues::new(40.0, 22.5, 0.0, 3.0));
        assert_eq!(snapshot.plots.len(), 1);
        let plot = &snapshot.plots[0];
        assert_eq!(plot.external_id, "P1");
        assert_eq!(plot.attributes.name, "Norte");
        assert_eq!(plot.attributes.crop_type.as_deref(), Some("Maíz"));
        assert_eq!(
            plot.attributes.last_irrigated_at,
            Utc.with_ymd_and_hms(2026, 2, 28, 6, 30, 0).single()
        );
        assert_eq!(plot.attributes.longitude, Some(-86.8515));
        assert_eq!(plot.sensors, SensorValues::new(35.0, 21.0, 0.0, 2.0));
    }

    #[test]
    fn numeric_ids_and_numeric_strings_are_normalized() {
        let mut value = sample();
        value["parcelas"][0]["id"] = json!(17);
        value["parcelas"][0]["sensor"]["sol"] = json!(" 2.5 ");
        let snapshot = decode_snapshot_value(&value).unwrap();
        assert_eq!(snapshot.plots[0].external_id, "17");
        assert_eq!(snapshot.plots[0].sensors.sunlight, 2.5);
    }

    #[test]
    fn optional_descriptive_fields_may_be_absent_or_blank() {
        let value = json!({
            "sensores": {"humedad": 1, "temperatura": 2, "lluvia": 3, "sol": 4},
            "parcelas": [{
                "id": "P2",
                "nombre": "Sur",
                "ubicacion": "  ",
                "responsable": null,
                "sensor": {"humedad": 1, "temperatura": 2, "lluvia": 3, "sol": 4}
            }]
        });
        let snapshot = decode_snapshot_value(&value).unwrap();
        let attrs = &snapshot.plots[0].attributes;
        assert_eq!(attrs.location, None);
        assert_eq!(attrs.responsible, None);
        assert_eq!(attrs.last_irrigated_at, None);
        assert_eq!(attrs.latitude, None);
    }

    #[test]
    fn missing_sensor_channel_names_its_path() {
        let mut value = sample();
        value["parcelas"][0]["sensor"]
            .as_object_mut()
            .unwrap()
            .remove("lluvia");
        expect_invalid(&value, "parcelas[0].sensor.lluvia");

        let mut value = sample();
        value["sensores"]["sol"] = JsonValue::Null;
        expect_invalid(&value, "sensores.sol");
    }

    #[test]
    fn wrongly_typed_fields_are_rejected() {
        let mut value = sample();
        value["sensores"]["humedad"] = json!("wet");
        expect_invalid(&value, "sensores.humedad");

        let mut value = sample();
        value["parcelas"][0]["id"] = json!({"nested": true});
        expect_invalid(&value, "parcelas[0].id");

        let mut value = sample();
        value["parcelas"][0]["id"] = json!("");
        expect_invalid(&value, "parcelas[0].id");

        let mut value = sample();
        value["parcelas"][0]["ultimo_riego"] = json!("yesterday");
        expect_invalid(&value, "parcelas[0].ultimo_riego");

        let mut value = sample();
        value["parcelas"] = json!({"P1": {}});
        expect_invalid(&value, "parcelas");
    }

    #[test]
    fn missing_plot_list_is_an_error_but_empty_list_is_fine() {
        let mut value = sample();
        value.as_object_mut().unwrap().remove("parcelas");
        expect_invalid(&value, "parcelas");

        let mut value = sample();
        value["parcelas"] = json!([]);
        assert!(decode_snapshot_value(&value).unwrap().plots.is_empty());
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        assert!(matches!(decode_snapshot(b"{not json"), Err(DecodeError::Json(_))));
        assert!(matches!(
            decode_snapshot(b"[1, 2]"),
            Err(DecodeError::InvalidField { .. })
        ));
    }

    #[test]
    fn timestamps_accept_common_upstream_shapes() {
        let expected = Utc.with_ymd_and_hms(2026, 2, 28, 6, 30, 0).single();
        assert_eq!(parse_timestamp("2026-02-28T06:30:00Z"), expected);
        assert_eq!(parse_timestamp("2026-02-28T00:30:00-06:00"), expected);
        assert_eq!(parse_timestamp("2026-02-28T06:30:00"), expected);
        let with_millis = expected.map(|ts| ts + chrono::Duration::milliseconds(123));
        assert_eq!(parse_timestamp("2026-02-28T06:30:00.123"), with_millis);
        assert_eq!(parse_timestamp("2026-02-28 06:30:00.123"), with_millis);
        assert_eq!(
            parse_timestamp("2026-02-28"),
            Utc.with_ymd_and_hms(2026, 2, 28, 0, 0, 0).single()
        );
        assert_eq!(parse_timestamp("28/02/2026"), None);
    }

    #[tokio::test]
    async fn static_source_serves_replacements() {
        let first = decode_snapshot_value(&sample()).unwrap();
        let source = StaticSnapshotSource::new(first.clone());
        assert_eq!(source.fetch().await.unwrap(), first);

        let empty = Snapshot {
            general: first.general,
            plots: vec![],
        };
        source.replace(empty.clone()).await;
        assert_eq!(source.fetch().await.unwrap(), empty);
    }

    #[tokio::test]
    async fn missing_fixture_is_a_fetch_error() {
        let source = FixtureSnapshotSource::new("/definitely/not/here.json");
        assert!(matches!(
            source.fetch().await,
            Err(FeedError::Fetch(FetchError::Io { .. }))
        ));
    }
}
