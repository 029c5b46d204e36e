#![forbid(unsafe_code)]

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use orka_apply::ownership::{decode_applied, ANN_APPLIED, ANN_ID, ANN_OWNER_NAME, ANN_PRUNE, LABEL_HASH};
use orka_apply::{ApplyError, DesiredSet, ObjectSet, Owner, PatchDoc, Patcher, PlanAction, Reconciler};
use orka_core::{ClientError, Gvk, ObjectKey, PatchKey, ResourceCache};
use serde_json::{json, Value as Json};
use support::{cm, cm_gvk, secret, FakeCluster};
use tokio_util::sync::CancellationToken;

fn engine(cluster: &Arc<FakeCluster>, id: &str) -> DesiredSet {
    DesiredSet::new(cluster.clone()).with_set_id(id)
}

#[tokio::test]
async fn second_apply_is_a_no_op() {
    let cluster = FakeCluster::new();
    let ds = engine(&cluster, "web");
    let objs = vec![cm("apps", "a", json!({"k": "1"})), cm("apps", "b", json!({"k": "2"}))];

    ds.apply_objects(objs.clone()).await.unwrap();
    assert_eq!(cluster.take_writes(), vec!["create ConfigMap apps/a", "create ConfigMap apps/b"]);

    let live = cluster.record("ConfigMap", Some("apps"), "a").unwrap();
    assert_eq!(live["metadata"]["annotations"][ANN_ID], "web");
    assert_eq!(live["metadata"]["labels"][LABEL_HASH].as_str().unwrap().len(), 40);
    let applied = decode_applied(live["metadata"]["annotations"][ANN_APPLIED].as_str().unwrap()).unwrap();
    assert_eq!(applied["data"], json!({"k": "1"}));

    ds.apply_objects(objs).await.unwrap();
    assert!(cluster.writes().is_empty(), "{:?}", cluster.writes());
}

#[tokio::test]
async fn drift_is_patched_and_foreign_fields_survive() {
    let cluster = FakeCluster::new();
    let ds = engine(&cluster, "web");
    ds.apply_objects([cm("apps", "a", json!({"one": "1", "two": "2"}))]).await.unwrap();
    cluster.edit("ConfigMap", Some("apps"), "a", |v| {
        v["data"]["one"] = json!("changed");
        v["data"]["extra"] = json!("theirs");
    });
    cluster.take_writes();

    ds.apply_objects([cm("apps", "a", json!({"one": "1"}))]).await.unwrap();
    assert_eq!(cluster.take_writes(), vec!["patch ConfigMap apps/a"]);
    let live = cluster.record("ConfigMap", Some("apps"), "a").unwrap();
    assert_eq!(live["data"], json!({"one": "1", "extra": "theirs"}));
}

#[tokio::test]
async fn unmanaged_record_is_taken_over() {
    let cluster = FakeCluster::new();
    cluster.seed(cm("apps", "a", json!({"k": "old"})));
    engine(&cluster, "web").apply_objects([cm("apps", "a", json!({"k": "new"}))]).await.unwrap();
    assert_eq!(cluster.take_writes(), vec!["patch ConfigMap apps/a"]);
    let live = cluster.record("ConfigMap", Some("apps"), "a").unwrap();
    assert_eq!(live["data"]["k"], "new");
    assert!(live["metadata"]["labels"][LABEL_HASH].is_string());
}

#[tokio::test]
async fn records_that_fall_out_are_pruned() {
    let cluster = FakeCluster::new();
    let ds = engine(&cluster, "web").with_prune_types([Gvk::new("", "v1", "Secret")]);
    ds.apply_objects([cm("apps", "a", json!({})), cm("apps", "b", json!({})), secret("apps", "s")]).await.unwrap();
    cluster.take_writes();

    ds.apply_objects([cm("apps", "a", json!({}))]).await.unwrap();
    let mut writes = cluster.take_writes();
    writes.sort();
    assert_eq!(writes, vec!["delete ConfigMap apps/b", "delete Secret apps/s"]);
    assert_eq!(cluster.count("ConfigMap"), 1);
}

#[tokio::test]
async fn other_sets_are_left_alone() {
    let cluster = FakeCluster::new();
    engine(&cluster, "one").apply_objects([cm("apps", "a", json!({}))]).await.unwrap();
    engine(&cluster, "two").apply_objects([cm("apps", "b", json!({}))]).await.unwrap();
    cluster.take_writes();
    engine(&cluster, "two").with_prune_types([cm_gvk()]).apply(ObjectSet::new()).await.unwrap();
    assert_eq!(cluster.take_writes(), vec!["delete ConfigMap apps/b"]);
    assert!(cluster.record("ConfigMap", Some("apps"), "a").is_some());
}

#[tokio::test]
async fn deletion_can_be_disabled() {
    let cluster = FakeCluster::new();
    let ds = engine(&cluster, "web");
    let mut keep = cm("apps", "keep", json!({}));
    keep["metadata"]["annotations"] = json!({ ANN_PRUNE: "false" });
    ds.apply_objects([cm("apps", "a", json!({})), keep]).await.unwrap();
    cluster.take_writes();

    ds.with_prune_types([cm_gvk()]).with_no_delete(true).apply(ObjectSet::new()).await.unwrap();
    ds.with_prune_types([cm_gvk()]).with_no_delete_for(Gvk::new("", "v2", "ConfigMap")).apply(ObjectSet::new()).await.unwrap();
    assert!(cluster.writes().is_empty());

    ds.with_prune_types([cm_gvk()]).apply(ObjectSet::new()).await.unwrap();
    assert_eq!(cluster.take_writes(), vec!["delete ConfigMap apps/a"]);
    assert!(cluster.record("ConfigMap", Some("apps"), "keep").is_some());
}

#[tokio::test]
async fn prune_tolerates_records_already_gone() {
    let cluster = FakeCluster::new();
    let ds = engine(&cluster, "web");
    ds.apply_objects([cm("apps", "a", json!({})), cm("apps", "b", json!({}))]).await.unwrap();
    cluster.vanish_on_delete("b");
    ds.apply_objects([cm("apps", "a", json!({}))]).await.unwrap();
    assert_eq!(cluster.count("ConfigMap"), 1);
}

#[tokio::test]
async fn failed_namespace_listing_aborts_before_writes() {
    let cluster = FakeCluster::new();
    cluster.fail_list_in("b");
    cluster.fail_list_in("c");
    let ds = engine(&cluster, "web").with_listing_namespaces(["a", "b", "c"]);
    let err = ds.apply_objects([cm("a", "x", json!({}))]).await.unwrap_err();
    let leaves = err.leaves();
    assert_eq!(leaves.len(), 2, "{err}");
    assert!(leaves.iter().all(|e| matches!(e.client_error(), Some(ClientError::Transport(_)))));
    assert!(cluster.writes().is_empty());
}

#[tokio::test]
async fn namespaces_are_defaulted_and_checked() {
    let cluster = FakeCluster::new();
    let bare = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x"}});

    let err = engine(&cluster, "web").apply_objects([bare.clone()]).await.unwrap_err();
    assert!(matches!(err, ApplyError::Scope(_)), "{err}");

    let err = engine(&cluster, "web")
        .with_listing_namespaces(["allowed"])
        .apply_objects([cm("other", "y", json!({})), bare.clone(), cm("allowed", "z", json!({}))])
        .await
        .unwrap_err();
    assert_eq!(err.leaves().len(), 2);
    assert_eq!(cluster.take_writes(), vec!["create ConfigMap allowed/z"]);

    let ns = json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "team", "namespace": "ignored"}});
    engine(&cluster, "web").with_default_namespace("dflt").apply_objects([bare, ns]).await.unwrap();
    assert!(cluster.record("ConfigMap", Some("dflt"), "x").is_some());
    assert!(cluster.record("Namespace", None, "team").is_some());
}

#[tokio::test]
async fn rejected_records_do_not_block_the_rest() {
    let cluster = FakeCluster::new();
    let ns = json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "team"}});
    let ds = engine(&cluster, "web").with_prune_types([Gvk::new("", "v1", "Namespace")]);
    ds.apply_objects([ns.clone()]).await.unwrap();
    cluster.take_writes();

    let err = ds
        .with_restrict_cluster_scoped(true)
        .apply_objects([cm("apps", "a", json!({})), ns])
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::Scope(_)), "{err}");
    assert_eq!(cluster.take_writes(), vec!["create ConfigMap apps/a"]);
    assert!(cluster.record("Namespace", None, "team").is_some(), "a rejected record is not pruned");
}

#[tokio::test]
async fn prune_type_under_another_version_matches_by_group_kind() {
    let cluster = FakeCluster::new();
    let ds = engine(&cluster, "web").with_prune_types([Gvk::new("example.io", "v1beta1", "Widget")]);
    let w = json!({"apiVersion": "example.io/v1", "kind": "Widget", "metadata": {"name": "w", "namespace": "apps"}, "spec": {"size": 1}});

    ds.apply_objects([w.clone()]).await.unwrap();
    assert_eq!(cluster.take_writes(), vec!["create Widget apps/w"]);
    ds.apply_objects([w]).await.unwrap();
    assert!(cluster.writes().is_empty(), "{:?}", cluster.writes());
    assert!(cluster.record("Widget", Some("apps"), "w").is_some());

    ds.apply(ObjectSet::new()).await.unwrap();
    assert_eq!(cluster.take_writes(), vec!["delete Widget apps/w"]);
}

#[tokio::test]
async fn dry_run_plans_exactly_what_apply_does() {
    let cluster = FakeCluster::new();
    let ds = engine(&cluster, "web");
    ds.apply_objects([cm("apps", "a", json!({"v": "1"})), cm("apps", "b", json!({}))]).await.unwrap();
    cluster.take_writes();

    let next = vec![cm("apps", "a", json!({"v": "2"})), cm("apps", "c", json!({}))];
    let plan = ds.dry_run(next.clone()).await.unwrap();
    assert!(cluster.writes().is_empty());
    let summary = plan.summary();
    assert_eq!((summary.creates, summary.updates, summary.deletes), (1, 1, 1));
    let a = PatchKey::new(cm_gvk(), ObjectKey::new(Some("apps"), "a"));
    let planned = match plan.get(&a) {
        Some(PlanAction::Update { patch }) => patch.clone(),
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(planned.body["data"], json!({"v": "2"}));

    ds.apply_objects(next).await.unwrap();
    let mut writes = cluster.take_writes();
    writes.sort();
    assert_eq!(writes, vec!["create ConfigMap apps/c", "delete ConfigMap apps/b", "patch ConfigMap apps/a"]);
    let sent = cluster.take_patches();
    assert_eq!(sent, vec![planned.clone()]);
    assert_eq!(sent[0].to_bytes().unwrap(), planned.to_bytes().unwrap());
}

#[tokio::test]
async fn strict_caching_reads_from_the_cache() {
    let cluster = FakeCluster::new();
    let ds = engine(&cluster, "web");
    ds.apply_objects([cm("apps", "a", json!({})), cm("apps", "b", json!({}))]).await.unwrap();
    cluster.take_writes();

    let stale = orka_store::CacheHandle::preloaded([cluster.record("ConfigMap", Some("apps"), "a").unwrap()]);
    let cache: Arc<dyn ResourceCache> = Arc::new(stale);
    let cached = ds.with_cache(cm_gvk(), cache.clone());

    cached.apply_objects([cm("apps", "a", json!({}))]).await.unwrap();
    assert_eq!(cluster.take_writes(), vec!["delete ConfigMap apps/b"], "cache is ignored without strict caching");

    ds.apply_objects([cm("apps", "a", json!({})), cm("apps", "b", json!({}))]).await.unwrap();
    cluster.take_writes();
    cached.with_strict_caching(true).apply_objects([cm("apps", "a", json!({}))]).await.unwrap();
    assert!(cluster.writes().is_empty(), "the cache never saw b");
}

#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Reconciler for Recorder {
    async fn reconcile(&self, existing: &Json, desired: Option<&Json>) -> Result<bool, ApplyError> {
        let name = existing["metadata"]["name"].as_str().unwrap_or_default().to_string();
        let what = if desired.is_some() { "update" } else { "prune" };
        self.seen.lock().unwrap().push(format!("{} {}", what, name));
        Ok(true)
    }
}

#[async_trait]
impl Patcher for Recorder {
    async fn patch(&self, _gvk: &Gvk, key: &ObjectKey, patch: &PatchDoc) -> Result<(), ClientError> {
        self.seen.lock().unwrap().push(format!("patch {} {}", key, patch.body["data"]));
        Ok(())
    }
}

#[tokio::test]
async fn reconciler_takes_over_updates_and_prunes() {
    let cluster = FakeCluster::new();
    let ds = engine(&cluster, "web");
    ds.apply_objects([cm("apps", "a", json!({"v": "1"})), cm("apps", "b", json!({}))]).await.unwrap();
    cluster.take_writes();

    let rec = Recorder::default();
    ds.with_reconciler(Gvk::new("", "v2", "ConfigMap"), rec.clone())
        .apply_objects([cm("apps", "a", json!({"v": "2"}))])
        .await
        .unwrap();
    assert!(cluster.writes().is_empty());
    assert_eq!(*rec.seen.lock().unwrap(), vec!["update a", "prune b"]);
}

#[tokio::test]
async fn patcher_replaces_the_client_patch() {
    let cluster = FakeCluster::new();
    let ds = engine(&cluster, "web");
    ds.apply_objects([cm("apps", "a", json!({"v": "1"}))]).await.unwrap();
    cluster.take_writes();

    let rec = Recorder::default();
    ds.with_patcher(cm_gvk(), rec.clone()).apply_objects([cm("apps", "a", json!({"v": "2"}))]).await.unwrap();
    assert!(cluster.writes().is_empty());
    assert_eq!(*rec.seen.lock().unwrap(), vec![r#"patch apps/a {"v":"2"}"#]);
}

#[tokio::test]
async fn injectors_rewrite_the_set() {
    let cluster = FakeCluster::new();
    engine(&cluster, "web")
        .with_injector(|mut objs: Vec<Json>| {
            for o in &mut objs {
                o["metadata"]["labels"] = json!({"team": "core"});
            }
            objs.push(cm("apps", "injected", json!({})));
            Ok::<_, ApplyError>(objs)
        })
        .apply_objects([cm("apps", "a", json!({}))])
        .await
        .unwrap();
    assert_eq!(cluster.count("ConfigMap"), 2);
    let live = cluster.record("ConfigMap", Some("apps"), "a").unwrap();
    assert_eq!(live["metadata"]["labels"]["team"], "core");
}

#[tokio::test]
async fn invalid_input_aborts_before_any_call() {
    let cluster = FakeCluster::new();
    let err = engine(&cluster, "web")
        .apply_objects([cm("apps", "a", json!({})), json!({"kind": "ConfigMap", "metadata": {"name": "x"}})])
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::Malformed(_)), "{err}");

    let err = DesiredSet::new(cluster.clone()).apply_objects([cm("apps", "a", json!({}))]).await.unwrap_err();
    assert!(matches!(err, ApplyError::Ownership(_)), "{err}");

    let token = CancellationToken::new();
    token.cancel();
    let err = engine(&cluster, "web").with_cancellation(token).apply_objects([cm("apps", "a", json!({}))]).await.unwrap_err();
    assert!(matches!(err, ApplyError::Cancelled));
    assert!(cluster.writes().is_empty());
}

#[tokio::test]
async fn orphans_are_purged_once_the_owner_is_gone() {
    let cluster = FakeCluster::new();
    let owner = json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "web", "namespace": "apps"}});
    cluster.seed(owner.clone());
    let ds = DesiredSet::new(cluster.clone()).with_owner(Owner::of(&owner).unwrap());
    ds.apply_objects([cm("apps", "child", json!({}))]).await.unwrap();
    let child = cluster.record("ConfigMap", Some("apps"), "child").unwrap();
    assert_eq!(child["metadata"]["annotations"][ANN_OWNER_NAME], "web");

    assert!(!ds.purge_orphan(&cm_gvk(), &child).await.unwrap());
    assert!(cluster.record("ConfigMap", Some("apps"), "child").is_some());

    cluster.remove("Deployment", Some("apps"), "web");
    assert!(!ds.with_no_delete(true).purge_orphan(&cm_gvk(), &child).await.unwrap());
    assert!(ds.purge_orphan(&cm_gvk(), &child).await.unwrap());
    assert!(cluster.record("ConfigMap", Some("apps"), "child").is_none());
}

#[tokio::test]
async fn diff_patches_ride_on_every_update() {
    let cluster = FakeCluster::new();
    let ds = engine(&cluster, "web");
    ds.apply_objects([cm("apps", "a", json!({"v": "1"}))]).await.unwrap();
    cluster.take_writes();

    let a = PatchKey::new(cm_gvk(), ObjectKey::new(Some("apps"), "a"));
    ds.with_diff_patch(a, json!({"data": {"forced": "yes"}})).apply_objects([cm("apps", "a", json!({"v": "1"}))]).await.unwrap();
    assert_eq!(cluster.take_writes(), vec!["patch ConfigMap apps/a"]);
    let live = cluster.record("ConfigMap", Some("apps"), "a").unwrap();
    assert_eq!(live["data"], json!({"v": "1", "forced": "yes"}));
}

#[tokio::test]
async fn fast_apply_deletes_only_replacing_fields() {
    let cluster = FakeCluster::new();
    let ds = engine(&cluster, "web");
    ds.apply_objects([cm("apps", "a", json!({"one": "1", "two": "2"}))]).await.unwrap();
    cluster.edit("ConfigMap", Some("apps"), "a", |v| v["data"]["theirs"] = json!("x"));

    ds.with_fast_apply(Vec::<String>::new()).apply_objects([cm("apps", "a", json!({"one": "1b"}))]).await.unwrap();
    let live = cluster.record("ConfigMap", Some("apps"), "a").unwrap();
    assert_eq!(live["data"], json!({"one": "1b", "two": "2", "theirs": "x"}));

    ds.with_fast_apply(["data"]).apply_objects([cm("apps", "a", json!({"one": "1c"}))]).await.unwrap();
    let live = cluster.record("ConfigMap", Some("apps"), "a").unwrap();
    assert_eq!(live["data"], json!({"one": "1c"}));
    assert_eq!(live["metadata"]["annotations"][ANN_ID], "web");
}

#[tokio::test]
async fn owner_references_stay_within_the_owner_namespace() {
    let cluster = FakeCluster::new();
    cluster.seed(json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "web", "namespace": "apps"}}));
    let owner = cluster.record("Deployment", Some("apps"), "web").unwrap();
    let ds = DesiredSet::new(cluster.clone()).with_owner(Owner::of(&owner).unwrap()).with_owner_reference(true, false);
    ds.apply_objects([cm("apps", "near", json!({})), cm("elsewhere", "far", json!({}))]).await.unwrap();

    let near = cluster.record("ConfigMap", Some("apps"), "near").unwrap();
    assert_eq!(
        near["metadata"]["ownerReferences"],
        json!([{
            "apiVersion": "apps/v1", "kind": "Deployment", "name": "web",
            "uid": owner["metadata"]["uid"], "controller": true, "blockOwnerDeletion": false
        }])
    );
    let far = cluster.record("ConfigMap", Some("elsewhere"), "far").unwrap();
    assert!(far["metadata"].get("ownerReferences").is_none());
}

#[tokio::test(start_paused = true)]
async fn rate_limit_spaces_client_calls() {
    let cluster = FakeCluster::new();
    let objs = [cm("apps", "a", json!({})), cm("apps", "b", json!({})), cm("apps", "c", json!({}))];
    let start = tokio::time::Instant::now();
    engine(&cluster, "web").with_rate_limit(10.0).apply_objects(objs).await.unwrap();
    // scope + list + (get, create) per record, the first one unpaced
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(700) && elapsed < Duration::from_millis(800), "{:?}", elapsed);
    assert_eq!(cluster.count("ConfigMap"), 3);
}
