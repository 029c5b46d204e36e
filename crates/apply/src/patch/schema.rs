//! Structural merge metadata for strategic merge patches.
//!
//! A [`MergeSchema`] describes, field by field, how lists merge (replace, by
//! merge key, or as a primitive set), whether a map carries `retainKeys`
//! semantics, and the schema of nested values. Fields without metadata merge
//! maps recursively and replace lists wholesale.

use std::collections::BTreeMap;
use std::sync::Arc;

use orka_core::{GroupKind, Gvk};
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListStrategy {
    #[default]
    Replace,
    Merge,
}

#[derive(Debug, Clone, Default)]
pub struct FieldMeta {
    pub strategy: ListStrategy,
    /// Present for lists of maps merged by key; absent for primitive merge lists.
    pub merge_key: Option<String>,
    /// The map (or each list element) keeps only the keys named in the patch.
    pub retain_keys: bool,
    /// Schema of the nested map, or of each list element.
    pub schema: Option<Arc<MergeSchema>>,
}

impl FieldMeta {
    pub fn nested(schema: MergeSchema) -> Self {
        Self { schema: Some(Arc::new(schema)), ..Default::default() }
    }

    pub fn merge_by(key: &str, element: MergeSchema) -> Self {
        Self {
            strategy: ListStrategy::Merge,
            merge_key: Some(key.to_string()),
            retain_keys: false,
            schema: Some(Arc::new(element)),
        }
    }

    pub fn merge_primitives() -> Self {
        Self { strategy: ListStrategy::Merge, ..Default::default() }
    }

    pub fn retain_keys(mut self) -> Self {
        self.retain_keys = true;
        self
    }

    pub fn is_keyed_merge(&self) -> bool {
        self.strategy == ListStrategy::Merge && self.merge_key.is_some()
    }

    pub fn is_primitive_merge(&self) -> bool {
        self.strategy == ListStrategy::Merge && self.merge_key.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeSchema {
    fields: BTreeMap<String, FieldMeta>,
}

impl MergeSchema {
    pub fn new() -> Self { Self::default() }

    pub fn field(mut self, name: &str, meta: FieldMeta) -> Self {
        self.fields.insert(name.to_string(), meta);
        self
    }

    pub fn lookup(&self, name: &str) -> Option<&FieldMeta> { self.fields.get(name) }
}

/// Group+kind → merge schema. Registered kinds patch with strategic merge.
#[derive(Debug, Clone, Default)]
pub struct MergeSchemaRegistry {
    by_kind: FxHashMap<GroupKind, Arc<MergeSchema>>,
}

impl MergeSchemaRegistry {
    pub fn empty() -> Self { Self::default() }

    /// Schemas for the built-in workload, config and RBAC kinds.
    pub fn builtin() -> Self {
        let mut r = Self::empty();
        for kind in ["ConfigMap", "Secret", "Namespace", "PersistentVolumeClaim", "Endpoints"] {
            r.register(GroupKind::new("", kind), plain_kind());
        }
        r.register(GroupKind::new("", "Pod"), plain_kind().field("spec", FieldMeta::nested(pod_spec())));
        r.register(GroupKind::new("", "Service"), plain_kind().field("spec", FieldMeta::nested(service_spec())));
        r.register(
            GroupKind::new("", "ServiceAccount"),
            plain_kind()
                .field("secrets", FieldMeta::merge_by("name", MergeSchema::new()))
                .field("imagePullSecrets", FieldMeta::merge_by("name", MergeSchema::new())),
        );
        for kind in ["DaemonSet", "StatefulSet", "ReplicaSet"] {
            r.register(GroupKind::new("apps", kind), plain_kind().field("spec", FieldMeta::nested(templated_spec())));
        }
        r.register(
            GroupKind::new("apps", "Deployment"),
            plain_kind().field(
                "spec",
                FieldMeta::nested(templated_spec().field("strategy", FieldMeta::default().retain_keys())),
            ),
        );
        r.register(GroupKind::new("batch", "Job"), plain_kind().field("spec", FieldMeta::nested(templated_spec())));
        r.register(
            GroupKind::new("batch", "CronJob"),
            plain_kind().field(
                "spec",
                FieldMeta::nested(
                    MergeSchema::new().field(
                        "jobTemplate",
                        FieldMeta::nested(
                            MergeSchema::new()
                                .field("metadata", FieldMeta::nested(object_meta()))
                                .field("spec", FieldMeta::nested(templated_spec())),
                        ),
                    ),
                ),
            ),
        );
        for kind in ["Ingress", "NetworkPolicy"] {
            r.register(GroupKind::new("networking.k8s.io", kind), plain_kind());
        }
        for kind in ["Role", "ClusterRole", "RoleBinding", "ClusterRoleBinding"] {
            r.register(GroupKind::new("rbac.authorization.k8s.io", kind), plain_kind());
        }
        r
    }

    pub fn register(&mut self, gk: GroupKind, schema: MergeSchema) {
        self.by_kind.insert(gk, Arc::new(schema));
    }

    pub fn get(&self, gvk: &Gvk) -> Option<Arc<MergeSchema>> {
        self.by_kind.get(&gvk.group_kind()).cloned()
    }
}

fn object_meta() -> MergeSchema {
    MergeSchema::new()
        .field("finalizers", FieldMeta::merge_primitives())
        .field("ownerReferences", FieldMeta::merge_by("uid", MergeSchema::new()))
}

fn plain_kind() -> MergeSchema {
    MergeSchema::new().field("metadata", FieldMeta::nested(object_meta()))
}

fn container() -> MergeSchema {
    MergeSchema::new()
        .field("env", FieldMeta::merge_by("name", MergeSchema::new()))
        .field("ports", FieldMeta::merge_by("containerPort", MergeSchema::new()))
        .field("volumeMounts", FieldMeta::merge_by("mountPath", MergeSchema::new()))
        .field("volumeDevices", FieldMeta::merge_by("devicePath", MergeSchema::new()))
}

fn pod_spec() -> MergeSchema {
    MergeSchema::new()
        .field("containers", FieldMeta::merge_by("name", container()))
        .field("initContainers", FieldMeta::merge_by("name", container()))
        .field("ephemeralContainers", FieldMeta::merge_by("name", container()))
        .field("volumes", FieldMeta::merge_by("name", MergeSchema::new()).retain_keys())
        .field("imagePullSecrets", FieldMeta::merge_by("name", MergeSchema::new()))
        .field("hostAliases", FieldMeta::merge_by("ip", MergeSchema::new()))
        .field("topologySpreadConstraints", FieldMeta::merge_by("topologyKey", MergeSchema::new()))
}

fn templated_spec() -> MergeSchema {
    MergeSchema::new().field(
        "template",
        FieldMeta::nested(
            MergeSchema::new()
                .field("metadata", FieldMeta::nested(object_meta()))
                .field("spec", FieldMeta::nested(pod_spec())),
        ),
    )
}

fn service_spec() -> MergeSchema {
    MergeSchema::new().field("ports", FieldMeta::merge_by("port", MergeSchema::new()))
}
