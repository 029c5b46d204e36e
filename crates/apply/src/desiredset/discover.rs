use std::sync::Arc;

use futures::future::join_all;
use orka_core::{ClientError, Gvk, LabelSelector, ObjectKey, ResourceCache, ResourceClient};
use rustc_hash::FxHashSet;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ApplyError, ErrorList};
use crate::ownership::OwnershipMarker;
use crate::pacer::Pacer;

/// Where reads for one type go, decided once per call.
#[derive(Clone)]
pub enum Lookup {
    Cache(Arc<dyn ResourceCache>),
    Live,
}

impl Lookup {
    pub fn is_cache(&self) -> bool { matches!(self, Lookup::Cache(_)) }

    pub async fn get(&self, client: &dyn ResourceClient, gvk: &Gvk, key: &ObjectKey) -> Result<Option<Json>, ClientError> {
        match self {
            Lookup::Cache(cache) => Ok(cache.get(key)),
            Lookup::Live => client.get(gvk, key).await,
        }
    }

    pub async fn list(
        &self,
        client: &dyn ResourceClient,
        gvk: &Gvk,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<Json>, ClientError> {
        match self {
            Lookup::Cache(cache) => Ok(cache.list(namespace, selector)),
            Lookup::Live => client.list(gvk, namespace, selector).await,
        }
    }
}

/// Records of one type carrying `marker`, listed across `namespaces` concurrently.
///
/// Any failed namespace fails the whole listing, with every failure reported.
pub(crate) async fn list_managed(
    client: &dyn ResourceClient,
    lookup: &Lookup,
    pacer: Option<&Pacer>,
    gvk: &Gvk,
    namespaces: &[Option<String>],
    marker: &OwnershipMarker,
    cancel: &CancellationToken,
) -> Result<Vec<Json>, ApplyError> {
    let selector = marker.selector();
    let calls = namespaces.iter().map(|ns| {
        let selector = &selector;
        async move {
            if let Some(p) = pacer {
                if !lookup.is_cache() {
                    p.wait().await;
                }
            }
            let scope = ns.as_deref().unwrap_or("all namespaces");
            lookup
                .list(client, gvk, ns.as_deref(), selector)
                .await
                .map_err(|e| ApplyError::client("list", format!("{} in {}", gvk.key(), scope), e))
        }
    });
    let results = tokio::select! {
        r = join_all(calls) => r,
        _ = cancel.cancelled() => return Err(ApplyError::Cancelled),
    };

    let mut errs = ErrorList::new();
    let mut out: Vec<Json> = Vec::new();
    let mut seen: FxHashSet<ObjectKey> = FxHashSet::default();
    for r in results {
        match r {
            Ok(items) => {
                for obj in items {
                    if !marker.matches(&obj) {
                        debug!(gvk = %gvk.key(), "skipping hash collision");
                        continue;
                    }
                    let Ok(key) = ObjectKey::of(&obj) else { continue };
                    if seen.insert(key) {
                        out.push(obj);
                    }
                }
            }
            Err(e) => errs.push(e),
        }
    }
    errs.into_result()?;
    Ok(out)
}
