use std::path::Path;

use plotsync_feed::{FixtureSnapshotSource, SnapshotSource};

#[tokio::test]
async fn sample_upstream_fixture_decodes() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let source = FixtureSnapshotSource::new(root.join("fixtures/upstream/sample.json"));

    let snapshot = source.fetch().await.expect("fixture decodes");
    assert_eq!(snapshot.general.humidity, 40.0);
    let ids = snapshot
        .plots
        .iter()
        .map(|p| p.external_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["P1", "2"]);
    assert_eq!(snapshot.plots[1].attributes.latitude, Some(21.1502));
    assert!(snapshot.plots[1].attributes.last_irrigated_at.is_some());
}

#[tokio::test]
async fn fixture_is_reread_on_every_fetch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("snapshot.json");
    let document = |humedad: f64| {
        format!(
            r#"{{"sensores": {{"humedad": {humedad}, "temperatura": 22, "lluvia": 0, "sol": 3}}, "parcelas": []}}"#
        )
    };

    std::fs::write(&path, document(40.0)).expect("write first");
    let source = FixtureSnapshotSource::new(&path);
    assert_eq!(source.fetch().await.expect("first").general.humidity, 40.0);

    std::fs::write(&path, document(41.5)).expect("write second");
    assert_eq!(source.fetch().await.expect("second").general.humidity, 41.5);

    std::fs::write(&path, "{\"sensores\": ").expect("write broken");
    let err = source.fetch().await.expect_err("truncated document");
    assert!(matches!(err, plotsync_feed::FeedError::Decode(_)));
}
