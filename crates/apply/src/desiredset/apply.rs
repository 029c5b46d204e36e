use std::time::Instant;

use metrics::{counter, histogram};
use orka_core::{GroupKind, Gvk, ObjectKey, ObjectSet, PatchKey, ResourceClient};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use super::discover::{list_managed, Lookup};
use super::plan::{Plan, PlanAction};
use super::DesiredSet;
use crate::error::{ApplyError, ErrorList};
use crate::ownership::{original_of, prune_disabled, set_applied, set_owner_reference, Owner, OwnershipMarker};
use crate::pacer::Pacer;
use crate::patch::{PatchInputs, PatchMode};

/// Per-call state: pacing and the scope of each type seen so far.
struct Call<'a> {
    client: &'a dyn ResourceClient,
    pacer: Option<Pacer>,
    scopes: FxHashMap<Gvk, bool>,
    dry_run: bool,
    plan: Plan,
}

impl<'a> Call<'a> {
    async fn pace(&self) {
        if let Some(p) = &self.pacer {
            p.wait().await;
        }
    }

    async fn is_namespaced(&mut self, gvk: &Gvk) -> Result<bool, ApplyError> {
        if let Some(ns) = self.scopes.get(gvk) {
            return Ok(*ns);
        }
        self.pace().await;
        let namespaced = self
            .client
            .is_namespaced(gvk)
            .await
            .map_err(|e| ApplyError::client("discover scope of", gvk.key(), e))?;
        self.scopes.insert(gvk.clone(), namespaced);
        Ok(namespaced)
    }
}

struct Discovered {
    gvk: Gvk,
    key: ObjectKey,
    obj: Json,
    matched: bool,
}

impl DesiredSet {
    /// Make the cluster match `set`: create, patch and prune.
    pub async fn apply(&self, set: ObjectSet) -> Result<(), ApplyError> {
        self.run(set, false).await.map(|_| ())
    }

    pub async fn apply_objects(&self, objs: impl IntoIterator<Item = Json>) -> Result<(), ApplyError> {
        self.apply(ObjectSet::from_values(objs)).await
    }

    /// Everything [`DesiredSet::apply`] would do, without writing.
    pub async fn dry_run(&self, objs: impl IntoIterator<Item = Json>) -> Result<Plan, ApplyError> {
        self.dry_run_set(ObjectSet::from_values(objs)).await
    }

    pub async fn dry_run_set(&self, set: ObjectSet) -> Result<Plan, ApplyError> {
        self.run(set, true).await
    }

    /// Delete a managed record whose recorded owner no longer exists. Returns whether it was deleted.
    pub async fn purge_orphan(&self, gvk: &Gvk, record: &Json) -> Result<bool, ApplyError> {
        let key = ObjectKey::of(record)?;
        let Some(owner) = Owner::recorded_on(record) else {
            warn!(gvk = %gvk.key(), key = %key, "no recorded owner; not purging");
            return Ok(false);
        };
        let pacer = self.rate_limit.and_then(Pacer::per_second);
        if let Some(p) = &pacer {
            p.wait().await;
        }
        let owner_present = match self.client.get(&owner.gvk, &owner.key).await {
            Ok(found) => found.is_some(),
            Err(e) if e.is_not_found() || matches!(e, orka_core::ClientError::UnknownType(_)) => false,
            Err(e) => return Err(ApplyError::client("get owner", format!("{} {}", owner.gvk.key(), owner.key), e)),
        };
        if owner_present {
            debug!(gvk = %gvk.key(), key = %key, owner = %owner.key, "owner still present");
            return Ok(false);
        }
        if self.no_delete || self.no_delete_for(gvk) || prune_disabled(record) {
            warn!(gvk = %gvk.key(), key = %key, "owner gone but deletion is disabled");
            return Ok(false);
        }
        if let Some(p) = &pacer {
            p.wait().await;
        }
        match self.client.delete(gvk, &key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(ApplyError::client("delete", PatchKey::new(gvk.clone(), key), e)),
        }
        counter!("apply_delete_total", 1u64);
        info!(gvk = %gvk.key(), key = %key, owner = %owner.key, "purged orphan");
        Ok(true)
    }

    async fn run(&self, set: ObjectSet, dry_run: bool) -> Result<Plan, ApplyError> {
        let t0 = Instant::now();
        let res = self.run_inner(set, dry_run).await;
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if let Err(e) = &res {
            counter!("apply_error_total", e.leaves().len() as u64);
        }
        res
    }

    async fn run_inner(&self, set: ObjectSet, dry_run: bool) -> Result<Plan, ApplyError> {
        set.err()?;
        if self.cancel.is_cancelled() {
            return Err(ApplyError::Cancelled);
        }
        let marker = OwnershipMarker::new(&self.set_id, self.owner.as_ref())?;

        let mut objs = set.into_values();
        for injector in &self.injectors {
            objs = injector.inject(objs)?;
        }
        let injected = ObjectSet::from_values(objs);
        injected.err()?;

        let mut call = Call {
            client: self.client.as_ref(),
            pacer: self.rate_limit.and_then(Pacer::per_second),
            scopes: FxHashMap::default(),
            dry_run,
            plan: Plan::default(),
        };
        let mut errs = ErrorList::new();
        let (desired, rejected) = self.place(&mut call, injected, &marker, &mut errs).await;
        let mut existing = match self.discover(&mut call, &desired, &marker).await {
            Ok(found) => found,
            Err(ApplyError::Cancelled) => return Err(ApplyError::Cancelled),
            Err(e) => {
                errs.push(e);
                errs.into_result()?;
                return Ok(call.plan);
            }
        };
        let mut index: FxHashMap<(GroupKind, ObjectKey), usize> = FxHashMap::default();
        for (i, d) in existing.iter().enumerate() {
            index.insert((d.gvk.group_kind(), d.key.clone()), i);
        }
        debug!(set = %self.set_id, desired = desired.len(), existing = existing.len(), dry_run, "compared desired set");

        for (gvk, key, obj) in desired.iter() {
            let live = match index.get(&(gvk.group_kind(), key.clone())) {
                Some(&i) => {
                    existing[i].matched = true;
                    Some(existing[i].obj.clone())
                }
                None => match self.fetch(&call, gvk, key).await {
                    Ok(v) => v,
                    Err(e) => {
                        errs.push(e);
                        continue;
                    }
                },
            };
            let res = match live {
                None => self.create(&mut call, gvk, key, obj).await,
                Some(live) => self.update(&mut call, gvk, key, obj, &live).await,
            };
            if let Err(e) = res {
                errs.push(e);
            }
        }

        for d in existing.iter().filter(|d| !d.matched) {
            if rejected.contains(&(d.gvk.group_kind(), d.key.clone())) {
                warn!(gvk = %d.gvk.key(), key = %d.key, "desired record was rejected; not pruning");
                continue;
            }
            if let Err(e) = self.prune(&mut call, d).await {
                errs.push(e);
            }
        }
        errs.into_result()?;
        Ok(call.plan)
    }

    fn lookup(&self, gvk: &Gvk) -> Lookup {
        if !self.strict_caching {
            return Lookup::Live;
        }
        match self.prune_types.iter().find(|p| &p.gvk == gvk).and_then(|p| p.cache.clone()) {
            Some(cache) => Lookup::Cache(cache),
            None => Lookup::Live,
        }
    }

    async fn fetch(&self, call: &Call<'_>, gvk: &Gvk, key: &ObjectKey) -> Result<Option<Json>, ApplyError> {
        let lookup = self.lookup(gvk);
        if !lookup.is_cache() {
            call.pace().await;
        }
        lookup
            .get(call.client, gvk, key)
            .await
            .map_err(|e| ApplyError::client("get", PatchKey::new(gvk.clone(), key.clone()), e))
    }

    /// Default or check namespaces, then stamp ownership and applied state.
    ///
    /// Rejected records are left out and their errors pushed onto `errs`; their keys come back
    /// so that the live copies are not pruned.
    async fn place(
        &self,
        call: &mut Call<'_>,
        set: ObjectSet,
        marker: &OwnershipMarker,
        errs: &mut ErrorList,
    ) -> (ObjectSet, FxHashSet<(GroupKind, ObjectKey)>) {
        let mut rejected = FxHashSet::default();
        let mut placed = Vec::with_capacity(set.len());
        for obj in set.into_values() {
            let pk = PatchKey::of(&obj).ok();
            match self.place_one(call, obj, marker).await {
                Ok(obj) => placed.push(obj),
                Err(e) => {
                    if let Some(pk) = pk {
                        let gk = pk.gvk.group_kind();
                        rejected.insert((gk.clone(), ObjectKey::new(None, pk.key.name.clone())));
                        rejected.insert((gk, pk.key));
                    }
                    errs.push(e);
                }
            }
        }
        let placed = ObjectSet::from_values(placed);
        if let Err(e) = placed.err() {
            errs.push(e.into());
        }
        (placed, rejected)
    }

    async fn place_one(&self, call: &mut Call<'_>, mut obj: Json, marker: &OwnershipMarker) -> Result<Json, ApplyError> {
        let pk = PatchKey::of(&obj)?;
        let namespace = if call.is_namespaced(&pk.gvk).await? {
            let ns = match pk.key.namespace() {
                Some(ns) => ns.to_string(),
                None => self
                    .default_namespace
                    .clone()
                    .ok_or_else(|| ApplyError::Scope(format!("{}: namespaced record without a namespace and no default", pk)))?,
            };
            if !self.listing_namespaces.is_empty() && !self.listing_namespaces.contains(&ns) {
                return Err(ApplyError::Scope(format!("{}: namespace {} is outside the listing namespaces", pk, ns)));
            }
            if let Some(meta) = obj.get_mut("metadata").and_then(Json::as_object_mut) {
                meta.insert("namespace".into(), Json::String(ns.clone()));
            }
            Some(ns)
        } else {
            if self.restrict_cluster_scoped {
                return Err(ApplyError::Scope(format!("{}: cluster-scoped records are not allowed", pk)));
            }
            if let Some(meta) = obj.get_mut("metadata").and_then(Json::as_object_mut) {
                meta.remove("namespace");
            }
            None
        };

        marker.stamp(&mut obj);
        if let (Some(policy), Some(owner)) = (self.owner_ref, &self.owner) {
            if owner.can_reference(namespace.as_deref()) {
                match owner.reference(policy.controller, policy.block_owner_deletion) {
                    Some(r) => set_owner_reference(&mut obj, r),
                    None => warn!(owner = %owner.key, "owner has no uid; skipping owner reference"),
                }
            }
        }
        set_applied(&mut obj)?;
        Ok(obj)
    }

    async fn discover(&self, call: &mut Call<'_>, desired: &ObjectSet, marker: &OwnershipMarker) -> Result<Vec<Discovered>, ApplyError> {
        // One listing per group+kind; the version only picks the endpoint.
        let mut types: Vec<Gvk> = Vec::new();
        for gvk in self.prune_types.iter().map(|p| &p.gvk).chain(desired.types()) {
            if !types.iter().any(|t| t.group_kind() == gvk.group_kind()) {
                types.push(gvk.clone());
            }
        }

        let mut errs = ErrorList::new();
        let mut out: Vec<Discovered> = Vec::new();
        let mut seen: FxHashSet<(GroupKind, ObjectKey)> = FxHashSet::default();
        for gvk in &types {
            let namespaces: Vec<Option<String>> = match call.is_namespaced(gvk).await {
                Ok(true) if !self.listing_namespaces.is_empty() => self.listing_namespaces.iter().cloned().map(Some).collect(),
                Ok(_) => vec![None],
                Err(e) => {
                    errs.push(e);
                    continue;
                }
            };
            let lookup = self.lookup(gvk);
            debug!(gvk = %gvk.key(), cached = lookup.is_cache(), namespaces = namespaces.len(), "discovering managed records");
            match list_managed(call.client, &lookup, call.pacer.as_ref(), gvk, &namespaces, marker, &self.cancel).await {
                Ok(found) => {
                    for obj in found {
                        let Ok(key) = ObjectKey::of(&obj) else { continue };
                        if seen.insert((gvk.group_kind(), key.clone())) {
                            out.push(Discovered { gvk: gvk.clone(), key, obj, matched: false });
                        }
                    }
                }
                Err(ApplyError::Cancelled) => return Err(ApplyError::Cancelled),
                Err(e) => errs.push(e),
            }
        }
        errs.into_result()?;
        Ok(out)
    }

    async fn create(&self, call: &mut Call<'_>, gvk: &Gvk, key: &ObjectKey, obj: &Json) -> Result<(), ApplyError> {
        let pk = PatchKey::new(gvk.clone(), key.clone());
        if call.dry_run {
            call.plan.push(pk, PlanAction::Create { record: obj.clone() });
            return Ok(());
        }
        call.pace().await;
        self.client.create(gvk, obj).await.map_err(|e| ApplyError::client("create", &pk, e))?;
        counter!("apply_create_total", 1u64);
        info!(set = %self.set_id, gvk = %gvk.key(), key = %key, "created");
        Ok(())
    }

    fn patch_mode(&self) -> PatchMode {
        match (&self.fast_apply, self.ignore_previous_applied) {
            (Some(fields), _) => PatchMode::TwoWay(fields.clone()),
            (None, true) => PatchMode::IgnoreOriginal,
            (None, false) => PatchMode::ThreeWay,
        }
    }

    async fn update(&self, call: &mut Call<'_>, gvk: &Gvk, key: &ObjectKey, desired: &Json, live: &Json) -> Result<(), ApplyError> {
        let pk = PatchKey::new(gvk.clone(), key.clone());
        let original = if self.ignore_previous_applied { None } else { original_of(live)? };
        let diff_patches = self.diff_patches.get(&pk).map(Vec::as_slice).unwrap_or(&[]);
        let inputs = PatchInputs { original: original.as_ref(), modified: desired, current: live };
        let Some(doc) = self.engine.prepare(gvk, inputs, &self.patch_mode(), diff_patches)? else {
            debug!(gvk = %gvk.key(), key = %key, "up to date");
            return Ok(());
        };
        if call.dry_run {
            call.plan.push(pk, PlanAction::Update { patch: doc });
            return Ok(());
        }
        if let Some(reconciler) = self.reconciler_for(gvk) {
            let handled = reconciler.reconcile(live, Some(desired)).await.map_err(|e| ApplyError::Hook {
                hook: "reconciler",
                target: pk.to_string(),
                reason: e.to_string(),
            })?;
            if handled {
                debug!(gvk = %gvk.key(), key = %key, "update handled by reconciler");
                return Ok(());
            }
        }
        call.pace().await;
        debug!(gvk = %gvk.key(), key = %key, patch = %doc, "patching");
        let sent = match self.patchers.get(gvk) {
            Some(patcher) => patcher.patch(gvk, key, &doc).await,
            None => self.client.patch(gvk, key, &doc).await.map(|_| ()),
        };
        sent.map_err(|e| ApplyError::client("patch", &pk, e))?;
        counter!("apply_patch_total", 1u64);
        info!(set = %self.set_id, gvk = %gvk.key(), key = %key, "patched");
        Ok(())
    }

    async fn prune(&self, call: &mut Call<'_>, d: &Discovered) -> Result<(), ApplyError> {
        if self.no_delete || self.no_delete_for(&d.gvk) {
            debug!(gvk = %d.gvk.key(), key = %d.key, "deletion disabled; keeping");
            return Ok(());
        }
        if prune_disabled(&d.obj) {
            debug!(gvk = %d.gvk.key(), key = %d.key, "prune opt-out; keeping");
            return Ok(());
        }
        if d.obj.pointer("/metadata/deletionTimestamp").map(|v| !v.is_null()).unwrap_or(false) {
            debug!(gvk = %d.gvk.key(), key = %d.key, "already terminating");
            return Ok(());
        }
        let pk = PatchKey::new(d.gvk.clone(), d.key.clone());
        if call.dry_run {
            call.plan.push(pk, PlanAction::Delete);
            return Ok(());
        }
        if let Some(reconciler) = self.reconciler_for(&d.gvk) {
            let handled = reconciler.reconcile(&d.obj, None).await.map_err(|e| ApplyError::Hook {
                hook: "reconciler",
                target: pk.to_string(),
                reason: e.to_string(),
            })?;
            if handled {
                debug!(gvk = %d.gvk.key(), key = %d.key, "prune handled by reconciler");
                return Ok(());
            }
        }
        call.pace().await;
        match self.client.delete(&d.gvk, &d.key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(gvk = %d.gvk.key(), key = %d.key, "already gone"),
            Err(e) => return Err(ApplyError::client("delete", &pk, e)),
        }
        counter!("apply_delete_total", 1u64);
        info!(set = %self.set_id, gvk = %d.gvk.key(), key = %d.key, "pruned");
        Ok(())
    }
}
