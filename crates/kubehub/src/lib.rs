//! Orka kubehub: kube-rs backed resource client, discovery and watcher wiring.

#![forbid(unsafe_code)]

use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use orka_core::{
    ClientError, Delta, DeltaKind, Gvk, LabelSelector, ObjectKey, PatchDoc, PatchType, ResourceClient,
};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from default config")
}

fn to_kube_gvk(gvk: &Gvk) -> GroupVersionKind {
    GroupVersionKind { group: gvk.group.clone(), version: gvk.version.clone(), kind: gvk.kind.clone() }
}

fn map_kube_err(e: kube::Error, what: &str) -> ClientError {
    match e {
        kube::Error::Api(ae) => match (ae.code, ae.reason.as_str()) {
            (404, _) => ClientError::NotFound(format!("{}: {}", what, ae.message)),
            (409, "AlreadyExists") => ClientError::AlreadyExists(format!("{}: {}", what, ae.message)),
            (409, _) => ClientError::Conflict(format!("{}: {}", what, ae.message)),
            (403, _) => ClientError::Forbidden(format!("{}: {}", what, ae.message)),
            (504, _) | (_, "Timeout") => ClientError::Timeout(format!("{}: {}", what, ae.message)),
            (code, _) => ClientError::Transport(format!("{}: {} ({})", what, ae.message, code)),
        },
        other => ClientError::Transport(format!("{}: {}", what, other)),
    }
}

fn to_dynamic(obj: &Json) -> Result<DynamicObject, ClientError> {
    serde_json::from_value(obj.clone()).map_err(|e| ClientError::Transport(format!("encoding object: {}", e)))
}

fn from_dynamic(obj: DynamicObject) -> Result<Json, ClientError> {
    serde_json::to_value(obj).map_err(|e| ClientError::Transport(format!("decoding object: {}", e)))
}

/// [`ResourceClient`] over `Api<DynamicObject>` with a per-type discovery cache.
pub struct KubeResourceClient {
    client: Client,
    resources: Mutex<FxHashMap<Gvk, (ApiResource, bool)>>,
}

impl KubeResourceClient {
    pub fn new(client: Client) -> Self {
        Self { client, resources: Mutex::new(FxHashMap::default()) }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(get_kube_client().await?))
    }

    pub fn kube_client(&self) -> Client { self.client.clone() }

    /// Resolve the served resource for a type, pinned to its group/version.
    async fn resource(&self, gvk: &Gvk) -> Result<(ApiResource, bool), ClientError> {
        if let Some(hit) = self.resources.lock().ok().and_then(|m| m.get(gvk).cloned()) {
            return Ok(hit);
        }
        let (ar, caps) = discovery::pinned_kind(&self.client, &to_kube_gvk(gvk))
            .await
            .map_err(|e| match e {
                kube::Error::Api(ae) if ae.code == 404 => ClientError::UnknownType(gvk.key()),
                other => map_kube_err(other, &format!("discovering {}", gvk.key())),
            })?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(gvk = %gvk.key(), plural = %ar.plural, namespaced, "resolved api resource");
        if let Ok(mut m) = self.resources.lock() {
            m.insert(gvk.clone(), (ar.clone(), namespaced));
        }
        Ok((ar, namespaced))
    }

    async fn api(&self, gvk: &Gvk, namespace: Option<&str>) -> Result<Api<DynamicObject>, ClientError> {
        let (ar, namespaced) = self.resource(gvk).await?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }

    async fn api_for_key(&self, gvk: &Gvk, key: &ObjectKey) -> Result<Api<DynamicObject>, ClientError> {
        let (_, namespaced) = self.resource(gvk).await?;
        if namespaced && key.namespace().is_none() {
            return Err(ClientError::Transport(format!("namespace required for namespaced kind {}", gvk.key())));
        }
        self.api(gvk, key.namespace()).await
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn is_namespaced(&self, gvk: &Gvk) -> Result<bool, ClientError> {
        Ok(self.resource(gvk).await?.1)
    }

    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> Result<Option<Json>, ClientError> {
        let api = self.api_for_key(gvk, key).await?;
        match api.get_opt(&key.name).await.map_err(|e| map_kube_err(e, &format!("get {}", key)))? {
            Some(obj) => Ok(Some(from_dynamic(obj)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, gvk: &Gvk, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<Json>, ClientError> {
        let api = self.api(gvk, namespace).await?;
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&selector.to_string());
        }
        let list = api.list(&lp).await.map_err(|e| map_kube_err(e, &format!("list {}", gvk.key())))?;
        list.items.into_iter().map(from_dynamic).collect()
    }

    async fn create(&self, gvk: &Gvk, obj: &Json) -> Result<Json, ClientError> {
        let key = ObjectKey::of(obj).map_err(|e| ClientError::Transport(e.to_string()))?;
        let api = self.api_for_key(gvk, &key).await?;
        let created = api
            .create(&PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_kube_err(e, &format!("create {}", key)))?;
        counter!("kube_writes_total", 1u64);
        from_dynamic(created)
    }

    async fn update(&self, gvk: &Gvk, obj: &Json) -> Result<Json, ClientError> {
        let key = ObjectKey::of(obj).map_err(|e| ClientError::Transport(e.to_string()))?;
        let api = self.api_for_key(gvk, &key).await?;
        let updated = api
            .replace(&key.name, &PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_kube_err(e, &format!("update {}", key)))?;
        counter!("kube_writes_total", 1u64);
        from_dynamic(updated)
    }

    async fn patch(&self, gvk: &Gvk, key: &ObjectKey, patch: &PatchDoc) -> Result<Json, ClientError> {
        let api = self.api_for_key(gvk, key).await?;
        let pp = PatchParams::default();
        let res = match patch.patch_type {
            PatchType::JsonMerge => api.patch(&key.name, &pp, &Patch::Merge(&patch.body)).await,
            PatchType::StrategicMerge => api.patch(&key.name, &pp, &Patch::Strategic(&patch.body)).await,
        };
        let patched = res.map_err(|e| map_kube_err(e, &format!("patch {}", key)))?;
        counter!("kube_writes_total", 1u64);
        from_dynamic(patched)
    }

    async fn delete(&self, gvk: &Gvk, key: &ObjectKey) -> Result<(), ClientError> {
        let api = self.api_for_key(gvk, key).await?;
        api.delete(&key.name, &DeleteParams::background())
            .await
            .map_err(|e| map_kube_err(e, &format!("delete {}", key)))?;
        counter!("kube_writes_total", 1u64);
        Ok(())
    }
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn delta_from(obj: &DynamicObject, kind: DeltaKind) -> Result<Delta> {
    let uid_str = obj
        .metadata
        .uid
        .as_deref()
        .ok_or_else(|| anyhow!("object missing metadata.uid"))?;
    let uid = orka_core::parse_uid(uid_str)?;
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(Delta { uid, kind, raw })
}

/// Run list+watch for one type and forward deltas until the stream ends or the receiver is dropped.
pub async fn watch_deltas(client: &KubeResourceClient, gvk: &Gvk, namespace: Option<&str>, delta_tx: mpsc::Sender<Delta>) -> Result<()> {
    let api = client.api(gvk, namespace).await?;
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(gvk = %gvk.key(), ns = ?namespace, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        let batch = match ev {
            Event::Applied(o) => vec![delta_from(&o, DeltaKind::Applied)?],
            Event::Deleted(o) => vec![delta_from(&o, DeltaKind::Deleted)?],
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                list.iter().map(|o| delta_from(o, DeltaKind::Applied)).collect::<Result<Vec<_>>>()?
            }
        };
        for d in batch {
            if delta_tx.send(d).await.is_err() {
                debug!(gvk = %gvk.key(), "delta receiver dropped; stopping watcher");
                return Ok(());
            }
        }
    }
    warn!(gvk = %gvk.key(), "watcher stream ended");
    Ok(())
}
