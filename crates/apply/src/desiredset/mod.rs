//! Desired-set apply: create what is missing, patch what drifted, prune what fell out.
//!
//! A [`DesiredSet`] is an immutable configuration value. Every `with_*` call
//! returns a modified copy, so one base value can serve as a template for
//! many callers:
//!
//! ```ignore
//! let base = DesiredSet::new(client).with_set_id("addons").with_default_namespace("kube-system");
//! base.with_rate_limit(20.0).apply(set).await?;
//! ```

mod apply;
mod discover;
mod plan;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use orka_core::{ClientError, Gvk, ObjectKey, PatchDoc, PatchKey, ResourceCache, ResourceClient};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;

use crate::error::ApplyError;
use crate::ownership::Owner;
use crate::patch::{MergeSchemaRegistry, PatchEngine, ReplacingFields};

pub use discover::Lookup;
pub use plan::{Plan, PlanAction, PlanEntry, PlanSummary};

/// Rewrites the whole desired set before anything else happens.
pub trait Injector: Send + Sync {
    fn inject(&self, objs: Vec<Json>) -> Result<Vec<Json>, ApplyError>;
}

impl<F> Injector for F
where
    F: Fn(Vec<Json>) -> Result<Vec<Json>, ApplyError> + Send + Sync,
{
    fn inject(&self, objs: Vec<Json>) -> Result<Vec<Json>, ApplyError> { self(objs) }
}

/// Sends a computed patch in place of the client's PATCH.
#[async_trait]
pub trait Patcher: Send + Sync {
    async fn patch(&self, gvk: &Gvk, key: &ObjectKey, patch: &PatchDoc) -> Result<(), ClientError>;
}

/// Gets the first say over an update (`desired = Some`) or a prune (`desired = None`).
/// Returning `true` means the reconciler handled it and the engine does nothing more.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, existing: &Json, desired: Option<&Json>) -> Result<bool, ApplyError>;
}

#[derive(Clone)]
pub(crate) struct PruneType {
    pub gvk: Gvk,
    pub cache: Option<Arc<dyn ResourceCache>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OwnerRefPolicy {
    pub controller: bool,
    pub block_owner_deletion: bool,
}

#[derive(Clone)]
pub struct DesiredSet {
    pub(crate) client: Arc<dyn ResourceClient>,
    pub(crate) engine: PatchEngine,
    pub(crate) owner: Option<Owner>,
    pub(crate) set_id: String,
    pub(crate) default_namespace: Option<String>,
    pub(crate) listing_namespaces: Vec<String>,
    pub(crate) prune_types: Vec<PruneType>,
    pub(crate) patchers: FxHashMap<Gvk, Arc<dyn Patcher>>,
    pub(crate) reconcilers: FxHashMap<Gvk, Arc<dyn Reconciler>>,
    pub(crate) diff_patches: FxHashMap<PatchKey, Vec<Json>>,
    pub(crate) injectors: Vec<Arc<dyn Injector>>,
    pub(crate) strict_caching: bool,
    pub(crate) rate_limit: Option<f64>,
    pub(crate) no_delete: bool,
    pub(crate) no_delete_types: Vec<Gvk>,
    pub(crate) fast_apply: Option<ReplacingFields>,
    pub(crate) ignore_previous_applied: bool,
    pub(crate) owner_ref: Option<OwnerRefPolicy>,
    pub(crate) restrict_cluster_scoped: bool,
    pub(crate) cancel: CancellationToken,
}

impl fmt::Debug for DesiredSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DesiredSet")
            .field("set_id", &self.set_id)
            .field("owner", &self.owner)
            .field("default_namespace", &self.default_namespace)
            .field("listing_namespaces", &self.listing_namespaces)
            .field("prune_types", &self.prune_types.iter().map(|p| p.gvk.key()).collect::<Vec<_>>())
            .field("strict_caching", &self.strict_caching)
            .field("no_delete", &self.no_delete)
            .field("fast_apply", &self.fast_apply)
            .finish_non_exhaustive()
    }
}

impl DesiredSet {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self {
            client,
            engine: PatchEngine::default(),
            owner: None,
            set_id: String::new(),
            default_namespace: None,
            listing_namespaces: Vec::new(),
            prune_types: Vec::new(),
            patchers: FxHashMap::default(),
            reconcilers: FxHashMap::default(),
            diff_patches: FxHashMap::default(),
            injectors: Vec::new(),
            strict_caching: false,
            rate_limit: None,
            no_delete: false,
            no_delete_types: Vec::new(),
            fast_apply: None,
            ignore_previous_applied: false,
            owner_ref: None,
            restrict_cluster_scoped: false,
            cancel: CancellationToken::new(),
        }
    }

    fn edit(&self, f: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        f(&mut next);
        next
    }

    pub fn set_id(&self) -> &str { &self.set_id }
    pub fn owner(&self) -> Option<&Owner> { self.owner.as_ref() }

    pub fn with_owner(&self, owner: Owner) -> Self { self.edit(|d| d.owner = Some(owner)) }

    pub fn with_owner_key(&self, gvk: Gvk, key: ObjectKey) -> Self {
        self.with_owner(Owner::new(gvk, key))
    }

    pub fn with_set_id(&self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.edit(|d| d.set_id = id)
    }

    pub fn with_default_namespace(&self, ns: impl Into<String>) -> Self {
        let ns = ns.into();
        self.edit(|d| d.default_namespace = Some(ns).filter(|n| !n.is_empty()))
    }

    /// Restrict discovery to these namespaces and reject namespaced records outside them.
    pub fn with_listing_namespaces<S: Into<String>>(&self, namespaces: impl IntoIterator<Item = S>) -> Self {
        let mut ns: Vec<String> = namespaces.into_iter().map(Into::into).filter(|n: &String| !n.is_empty()).collect();
        ns.sort();
        ns.dedup();
        self.edit(|d| d.listing_namespaces = ns)
    }

    /// Types whose managed records are pruned even when the set has none of them.
    pub fn with_prune_types(&self, types: impl IntoIterator<Item = Gvk>) -> Self {
        let types: Vec<Gvk> = types.into_iter().collect();
        self.edit(|d| {
            for gvk in types {
                if !d.prune_types.iter().any(|p| p.gvk == gvk) {
                    d.prune_types.push(PruneType { gvk, cache: None });
                }
            }
        })
    }

    /// Register a cache for a type; it also becomes a prune type.
    pub fn with_cache(&self, gvk: Gvk, cache: Arc<dyn ResourceCache>) -> Self {
        self.edit(|d| match d.prune_types.iter_mut().find(|p| p.gvk == gvk) {
            Some(p) => p.cache = Some(cache),
            None => d.prune_types.push(PruneType { gvk, cache: Some(cache) }),
        })
    }

    pub fn with_patcher(&self, gvk: Gvk, patcher: impl Patcher + 'static) -> Self {
        let patcher: Arc<dyn Patcher> = Arc::new(patcher);
        self.edit(|d| {
            d.patchers.insert(gvk, patcher);
        })
    }

    pub fn with_reconciler(&self, gvk: Gvk, reconciler: impl Reconciler + 'static) -> Self {
        let reconciler: Arc<dyn Reconciler> = Arc::new(reconciler);
        self.edit(|d| {
            d.reconcilers.insert(gvk, reconciler);
        })
    }

    /// A static patch layered onto every computed patch for this record.
    pub fn with_diff_patch(&self, key: PatchKey, patch: Json) -> Self {
        self.edit(|d| d.diff_patches.entry(key).or_default().push(patch))
    }

    pub fn with_injector(&self, injector: impl Injector + 'static) -> Self {
        let injector: Arc<dyn Injector> = Arc::new(injector);
        self.edit(|d| d.injectors.push(injector))
    }

    /// Read from registered caches instead of listing live.
    pub fn with_strict_caching(&self, on: bool) -> Self { self.edit(|d| d.strict_caching = on) }

    /// Client calls per second; non-positive disables pacing.
    pub fn with_rate_limit(&self, per_second: f64) -> Self {
        self.edit(|d| d.rate_limit = Some(per_second).filter(|r| r.is_finite() && *r > 0.0))
    }

    pub fn with_no_delete(&self, on: bool) -> Self { self.edit(|d| d.no_delete = on) }

    pub fn with_no_delete_for(&self, gvk: Gvk) -> Self {
        self.edit(|d| {
            if !d.no_delete_types.contains(&gvk) {
                d.no_delete_types.push(gvk);
            }
        })
    }

    /// Two-way patching from the live state; deletions survive only under `replacing_fields`.
    pub fn with_fast_apply<S: Into<String>>(&self, replacing_fields: impl IntoIterator<Item = S>) -> Self {
        let fields = ReplacingFields::new(replacing_fields);
        self.edit(|d| d.fast_apply = Some(fields))
    }

    pub fn with_ignore_previous_applied(&self, on: bool) -> Self { self.edit(|d| d.ignore_previous_applied = on) }

    pub fn with_owner_reference(&self, controller: bool, block_owner_deletion: bool) -> Self {
        self.edit(|d| d.owner_ref = Some(OwnerRefPolicy { controller, block_owner_deletion }))
    }

    pub fn with_restrict_cluster_scoped(&self, on: bool) -> Self { self.edit(|d| d.restrict_cluster_scoped = on) }

    pub fn with_cancellation(&self, token: CancellationToken) -> Self { self.edit(|d| d.cancel = token) }

    pub fn with_merge_schemas(&self, schemas: MergeSchemaRegistry) -> Self {
        let engine = PatchEngine::new(Arc::new(schemas));
        self.edit(|d| d.engine = engine)
    }

    pub(crate) fn no_delete_for(&self, gvk: &Gvk) -> bool {
        let gk = gvk.group_kind();
        self.no_delete_types.iter().any(|g| g.group_kind() == gk)
    }

    pub(crate) fn reconciler_for(&self, gvk: &Gvk) -> Option<&Arc<dyn Reconciler>> {
        self.reconcilers.get(gvk).or_else(|| {
            let gk = gvk.group_kind();
            self.reconcilers.iter().find(|(g, _)| g.group_kind() == gk).map(|(_, r)| r)
        })
    }
}
