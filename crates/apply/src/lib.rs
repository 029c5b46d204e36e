//! Orka apply: desired-set reconciliation against a Kubernetes-style API.
//!
//! Callers describe the records that should exist as an [`ObjectSet`] and hand
//! it to a [`DesiredSet`]. The engine creates what is missing, patches what
//! drifted from the last applied state and prunes records it previously
//! created that are no longer desired.

#![forbid(unsafe_code)]

pub mod crd;
mod desiredset;
mod error;
pub mod manifest;
pub mod ownership;
mod pacer;
pub mod patch;

pub use crd::{CrdDefinition, CrdRegistrar, CrdScope};
pub use desiredset::{
    DesiredSet, Injector, Lookup, Patcher, Plan, PlanAction, PlanEntry, PlanSummary, Reconciler,
};
pub use error::{ApplyError, ErrorList, PatchError};
pub use ownership::{Owner, OwnershipMarker};
pub use pacer::Pacer;
pub use patch::{PatchEngine, PatchInputs, PatchMode, ReplacingFields};

pub use orka_core::{ObjectSet, PatchDoc, PatchKey};
