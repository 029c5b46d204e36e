#![forbid(unsafe_code)]

mod support;

use std::time::Duration;

use orka_apply::crd::CRD_SET_ID;
use orka_apply::ownership::ANN_ID;
use orka_apply::{ApplyError, CrdDefinition, CrdRegistrar};
use support::FakeCluster;
use tokio_util::sync::CancellationToken;

fn widget() -> CrdDefinition {
    CrdDefinition::new("example.io", "v1", "Widget").with_status().short_name("wd")
}

#[tokio::test(start_paused = true)]
async fn ensure_creates_and_waits_for_established() {
    let cluster = FakeCluster::establishing_crds();
    let registrar = CrdRegistrar::new(cluster.clone()).with_poll_interval(Duration::from_millis(10));
    registrar
        .ensure(&[widget(), CrdDefinition::new("example.io", "v1", "Gizmo").cluster_scoped()])
        .await
        .unwrap();
    assert_eq!(
        cluster.writes(),
        vec![
            "create CustomResourceDefinition widgets.example.io",
            "create CustomResourceDefinition gizmos.example.io",
        ]
    );
    let live = cluster.record("CustomResourceDefinition", None, "widgets.example.io").unwrap();
    assert_eq!(live["metadata"]["annotations"][ANN_ID], CRD_SET_ID);
    assert_eq!(live["spec"]["names"]["shortNames"][0], "wd");

    cluster.take_writes();
    registrar.ensure(&[widget()]).await.unwrap();
    assert!(cluster.writes().is_empty(), "already registered: {:?}", cluster.writes());
}

#[tokio::test(start_paused = true)]
async fn existing_definition_is_updated_in_place() {
    let cluster = FakeCluster::establishing_crds();
    cluster.seed(widget().to_record().unwrap());
    cluster.stale_get("widgets.example.io");

    CrdRegistrar::new(cluster.clone()).ensure(&[widget()]).await.unwrap();
    assert_eq!(cluster.writes(), vec!["update CustomResourceDefinition widgets.example.io"]);
    let live = cluster.record("CustomResourceDefinition", None, "widgets.example.io").unwrap();
    assert_eq!(live["metadata"]["annotations"][ANN_ID], CRD_SET_ID);
}

#[tokio::test(start_paused = true)]
async fn waiting_times_out() {
    let cluster = FakeCluster::new();
    let err = CrdRegistrar::new(cluster.clone())
        .with_poll_interval(Duration::from_millis(10))
        .with_timeout(Duration::from_millis(50))
        .ensure(&[widget()])
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::Timeout(_)), "{err}");
    assert_eq!(cluster.count("CustomResourceDefinition"), 1);
}

#[tokio::test(start_paused = true)]
async fn waiting_is_cancellable() {
    let cluster = FakeCluster::new();
    let token = CancellationToken::new();
    let registrar = CrdRegistrar::new(cluster.clone())
        .with_timeout(Duration::from_secs(3600))
        .with_cancellation(token.clone());
    let task = registrar.spawn_batch(vec![widget()]);
    tokio::time::sleep(Duration::from_secs(5)).await;
    token.cancel();
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, ApplyError::Cancelled));
}
