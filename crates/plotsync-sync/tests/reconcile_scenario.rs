use std::sync::Arc;

use plotsync_feed::{decode_snapshot_value, StaticSnapshotSource};
use plotsync_storage::{archived_plot_statuses, overview, MemoryStore, Store};
use plotsync_sync::{Reconciler, Shutdown};
use serde_json::json;
use uuid::Uuid;

fn upstream(plot_humidity: Option<f64>) -> serde_json::Value {
    let parcelas = match plot_humidity {
        Some(humedad) => json!([{
            "id": "P1",
            "nombre": "Norte",
            "ubicacion": "Campo A",
            "tipo_cultivo": "Maíz",
            "latitud": 21.16,
            "longitud": -86.85,
            "sensor": { "humedad": humedad, "temperatura": 21, "lluvia": 0, "sol": 2 }
        }]),
        None => json!([]),
    };
    json!({
        "sensores": { "humedad": 40, "temperatura": 22, "lluvia": 0, "sol": 3 },
        "parcelas": parcelas,
    })
}

#[tokio::test]
async fn plot_lifecycle_across_three_cycles() {
    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(StaticSnapshotSource::new(
        decode_snapshot_value(&upstream(Some(35.0))).unwrap(),
    ));
    let reconciler = Reconciler::new(source.clone(), store.clone());
    let never = Shutdown::never();

    let first = reconciler.run_cycle(Uuid::new_v4(), &never).await.unwrap();
    assert!(first.general_reading_appended);
    assert_eq!(first.plots_created, 1);
    assert_eq!(first.plot_records_appended, 1);

    let view = overview(store.as_ref()).await.unwrap();
    assert_eq!(view.plots.len(), 1);
    let norte = &view.plots[0];
    assert_eq!(norte.attributes.name, "Norte");
    assert_eq!(norte.attributes.location.as_deref(), Some("Campo A"));
    assert_eq!(store.general_reading_count().await, 1);
    assert_eq!(store.plot_record_count(norte.id).await, 1);

    let second = reconciler.run_cycle(Uuid::new_v4(), &never).await.unwrap();
    assert!(!second.general_reading_appended);
    assert_eq!(second.plots_created, 0);
    assert_eq!(second.plot_records_appended, 0);
    assert_eq!(store.general_reading_count().await, 1);
    assert_eq!(store.plot_record_count(norte.id).await, 1);

    source
        .replace(decode_snapshot_value(&upstream(None)).unwrap())
        .await;
    let third = reconciler.run_cycle(Uuid::new_v4(), &never).await.unwrap();
    assert_eq!(third.plots_archived, 1);
    assert!(store.list_plots().await.unwrap().is_empty());
    assert_eq!(store.plot_record_count(norte.id).await, 0);

    let statuses = archived_plot_statuses(store.as_ref(), norte.created_at)
        .await
        .unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].archived.attributes, norte.attributes);
    assert!(statuses[0].still_archived);
}

#[tokio::test]
async fn sensor_change_is_recorded_without_touching_general_history() {
    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(StaticSnapshotSource::new(
        decode_snapshot_value(&upstream(Some(35.0))).unwrap(),
    ));
    let reconciler = Reconciler::new(source.clone(), store.clone());
    let never = Shutdown::never();

    reconciler.run_cycle(Uuid::new_v4(), &never).await.unwrap();
    source
        .replace(decode_snapshot_value(&upstream(Some(36.5))).unwrap())
        .await;
    let report = reconciler.run_cycle(Uuid::new_v4(), &never).await.unwrap();
    assert_eq!(report.plot_records_appended, 1);
    assert!(!report.general_reading_appended);

    let plot = store.find_plot_by_external_id("P1").await.unwrap().unwrap();
    assert_eq!(plot.sensors.humidity, 36.5);
    let latest = store.latest_plot_record(plot.id).await.unwrap().unwrap();
    assert_eq!(latest.values, plot.sensors);
    assert_eq!(store.plot_record_count(plot.id).await, 2);
}
