//! CustomResourceDefinition registration and readiness.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceColumnDefinition, CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
    CustomResourceDefinitionVersion, CustomResourceSubresourceStatus, CustomResourceSubresources, CustomResourceValidation,
    JSONSchemaProps,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use metrics::histogram;
use orka_core::{ClientError, Gvk, LabelSelector, ObjectKey, ObjectSet, PatchDoc, ResourceClient};
use serde_json::Value as Json;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::desiredset::DesiredSet;
use crate::error::{ApplyError, ErrorList};

pub const CRD_SET_ID: &str = "orka-crds";

pub fn crd_gvk() -> Gvk { Gvk::new("apiextensions.k8s.io", "v1", "CustomResourceDefinition") }

pub fn crd_poll_interval() -> Duration {
    std::env::var("ORKA_CRD_POLL_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(500))
}

pub fn crd_wait_timeout() -> Duration {
    std::env::var("ORKA_CRD_WAIT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(60))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrdScope {
    #[default]
    Namespaced,
    Cluster,
}

#[derive(Debug, Clone)]
pub struct PrinterColumn {
    pub name: String,
    pub json_path: String,
    pub type_: String,
}

/// Builder for a single-version CRD.
#[derive(Debug, Clone)]
pub struct CrdDefinition {
    gvk: Gvk,
    plural: Option<String>,
    scope: CrdScope,
    status: bool,
    categories: Vec<String>,
    short_names: Vec<String>,
    columns: Vec<PrinterColumn>,
    schema: Option<Json>,
}

impl CrdDefinition {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            gvk: Gvk::new(group, version, kind),
            plural: None,
            scope: CrdScope::Namespaced,
            status: false,
            categories: Vec::new(),
            short_names: Vec::new(),
            columns: Vec::new(),
            schema: None,
        }
    }

    pub fn plural(mut self, plural: &str) -> Self {
        self.plural = Some(plural.to_string());
        self
    }

    pub fn cluster_scoped(mut self) -> Self {
        self.scope = CrdScope::Cluster;
        self
    }

    pub fn with_status(mut self) -> Self {
        self.status = true;
        self
    }

    pub fn category(mut self, category: &str) -> Self {
        self.categories.push(category.to_string());
        self
    }

    pub fn short_name(mut self, short: &str) -> Self {
        self.short_names.push(short.to_string());
        self
    }

    pub fn column(mut self, name: &str, json_path: &str, type_: &str) -> Self {
        self.columns.push(PrinterColumn { name: name.into(), json_path: json_path.into(), type_: type_.into() });
        self
    }

    /// OpenAPI v3 schema; without one the CRD preserves unknown fields.
    pub fn schema(mut self, schema: Json) -> Self {
        self.schema = Some(schema);
        self
    }

    /// The custom type this CRD serves.
    pub fn gvk(&self) -> &Gvk { &self.gvk }

    pub fn plural_name(&self) -> String {
        self.plural.clone().unwrap_or_else(|| pluralize(&self.gvk.kind.to_lowercase()))
    }

    /// `<plural>.<group>`
    pub fn name(&self) -> String { format!("{}.{}", self.plural_name(), self.gvk.group) }

    pub fn to_crd(&self) -> Result<CustomResourceDefinition, ApplyError> {
        let schema = match &self.schema {
            Some(s) => serde_json::from_value::<JSONSchemaProps>(s.clone())
                .map_err(|e| ApplyError::Scope(format!("crd {}: invalid schema: {}", self.name(), e)))?,
            None => JSONSchemaProps {
                type_: Some("object".into()),
                x_kubernetes_preserve_unknown_fields: Some(true),
                ..Default::default()
            },
        };
        let version = CustomResourceDefinitionVersion {
            name: self.gvk.version.clone(),
            served: true,
            storage: true,
            schema: Some(CustomResourceValidation { open_api_v3_schema: Some(schema) }),
            subresources: self.status.then(|| CustomResourceSubresources {
                status: Some(CustomResourceSubresourceStatus(serde_json::json!({}))),
                ..Default::default()
            }),
            additional_printer_columns: (!self.columns.is_empty()).then(|| {
                self.columns
                    .iter()
                    .map(|c| CustomResourceColumnDefinition {
                        name: c.name.clone(),
                        json_path: c.json_path.clone(),
                        type_: c.type_.clone(),
                        ..Default::default()
                    })
                    .collect()
            }),
            ..Default::default()
        };
        Ok(CustomResourceDefinition {
            metadata: ObjectMeta { name: Some(self.name()), ..Default::default() },
            spec: CustomResourceDefinitionSpec {
                group: self.gvk.group.clone(),
                names: CustomResourceDefinitionNames {
                    kind: self.gvk.kind.clone(),
                    list_kind: Some(format!("{}List", self.gvk.kind)),
                    plural: self.plural_name(),
                    singular: Some(self.gvk.kind.to_lowercase()),
                    short_names: (!self.short_names.is_empty()).then(|| self.short_names.clone()),
                    categories: (!self.categories.is_empty()).then(|| self.categories.clone()),
                },
                scope: match self.scope {
                    CrdScope::Namespaced => "Namespaced".into(),
                    CrdScope::Cluster => "Cluster".into(),
                },
                versions: vec![version],
                ..Default::default()
            },
            status: None,
        })
    }

    pub fn to_record(&self) -> Result<Json, ApplyError> {
        let crd = self.to_crd()?;
        serde_json::to_value(&crd).map_err(|e| ApplyError::Scope(format!("crd {}: {}", self.name(), e)))
    }
}

fn pluralize(lower: &str) -> String {
    if lower.ends_with('s') || lower.ends_with('x') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y').filter(|s| !s.ends_with(['a', 'e', 'i', 'o', 'u'])) {
        format!("{}ies", stem)
    } else {
        format!("{}s", lower)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Readiness {
    established: bool,
    names_rejected: Option<String>,
}

fn readiness(live: &Json) -> Result<Readiness, ApplyError> {
    let crd: CustomResourceDefinition = serde_json::from_value(live.clone())
        .map_err(|e| ApplyError::Scope(format!("decoding crd status: {}", e)))?;
    let mut out = Readiness::default();
    for c in crd.status.and_then(|s| s.conditions).unwrap_or_default() {
        match (c.type_.as_str(), c.status.as_str()) {
            ("Established", "True") => out.established = true,
            ("NamesAccepted", "False") => out.names_rejected = Some(c.message.unwrap_or_default()),
            _ => {}
        }
    }
    Ok(out)
}

/// Create falls back to refetch + update when the record turns out to exist.
struct CreateOrUpdate {
    inner: Arc<dyn ResourceClient>,
}

#[async_trait]
impl ResourceClient for CreateOrUpdate {
    async fn is_namespaced(&self, gvk: &Gvk) -> Result<bool, ClientError> { self.inner.is_namespaced(gvk).await }

    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> Result<Option<Json>, ClientError> { self.inner.get(gvk, key).await }

    async fn list(&self, gvk: &Gvk, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<Json>, ClientError> {
        self.inner.list(gvk, namespace, selector).await
    }

    async fn create(&self, gvk: &Gvk, obj: &Json) -> Result<Json, ClientError> {
        match self.inner.create(gvk, obj).await {
            Err(e) if e.is_already_exists() => {
                let key = ObjectKey::of(obj).map_err(|_| e.clone())?;
                let Some(live) = self.inner.get(gvk, &key).await? else { return Err(e) };
                let mut next = obj.clone();
                if let (Some(rv), Some(meta)) = (
                    live.pointer("/metadata/resourceVersion").cloned(),
                    next.get_mut("metadata").and_then(Json::as_object_mut),
                ) {
                    meta.insert("resourceVersion".into(), rv);
                }
                debug!(key = %key, "already exists; updating instead");
                self.inner.update(gvk, &next).await
            }
            other => other,
        }
    }

    async fn update(&self, gvk: &Gvk, obj: &Json) -> Result<Json, ClientError> { self.inner.update(gvk, obj).await }

    async fn patch(&self, gvk: &Gvk, key: &ObjectKey, patch: &PatchDoc) -> Result<Json, ClientError> {
        self.inner.patch(gvk, key, patch).await
    }

    async fn delete(&self, gvk: &Gvk, key: &ObjectKey) -> Result<(), ClientError> { self.inner.delete(gvk, key).await }
}

/// Applies CRDs and waits for the API server to serve them.
#[derive(Clone)]
pub struct CrdRegistrar {
    client: Arc<dyn ResourceClient>,
    poll: Duration,
    timeout: Duration,
    cancel: CancellationToken,
}

impl CrdRegistrar {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self { client, poll: crd_poll_interval(), timeout: crd_wait_timeout(), cancel: CancellationToken::new() }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Apply every definition, then wait until each is established.
    pub async fn ensure(&self, crds: &[CrdDefinition]) -> Result<(), ApplyError> {
        let mut set = ObjectSet::new();
        for crd in crds {
            set.add_value(crd.to_record()?);
        }
        let client: Arc<dyn ResourceClient> = Arc::new(CreateOrUpdate { inner: self.client.clone() });
        DesiredSet::new(client)
            .with_set_id(CRD_SET_ID)
            .with_no_delete(true)
            .with_cancellation(self.cancel.clone())
            .apply(set)
            .await?;

        let mut errs = ErrorList::new();
        for crd in crds {
            if let Err(e) = self.wait_established(&crd.name()).await {
                if matches!(e, ApplyError::Cancelled) {
                    return Err(e);
                }
                errs.push(e);
            }
        }
        errs.into_result()
    }

    /// [`CrdRegistrar::ensure`] on a spawned task.
    pub fn spawn_batch(&self, crds: Vec<CrdDefinition>) -> JoinHandle<Result<(), ApplyError>> {
        let this = self.clone();
        tokio::spawn(async move { this.ensure(&crds).await })
    }

    pub async fn wait_established(&self, name: &str) -> Result<(), ApplyError> {
        let t0 = Instant::now();
        let key = ObjectKey::new(None, name);
        let mut warned = false;
        loop {
            match self.client.get(&crd_gvk(), &key).await {
                Ok(Some(live)) => {
                    let r = readiness(&live)?;
                    if let (Some(msg), false) = (&r.names_rejected, warned) {
                        warn!(crd = %name, message = %msg, "names not accepted");
                        warned = true;
                    }
                    if r.established {
                        histogram!("crd_wait_ms", t0.elapsed().as_secs_f64() * 1000.0);
                        info!(crd = %name, "established");
                        return Ok(());
                    }
                }
                Ok(None) => debug!(crd = %name, "not visible yet"),
                Err(e) if e.is_not_found() => debug!(crd = %name, "not visible yet"),
                Err(e) => return Err(ApplyError::client("get", format!("crd {}", name), e)),
            }
            if t0.elapsed() >= self.timeout {
                return Err(ApplyError::Timeout(format!("crd {} not established after {:?}", name, self.timeout)));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll) => {}
                _ = self.cancel.cancelled() => return Err(ApplyError::Cancelled),
            }
        }
    }
}
