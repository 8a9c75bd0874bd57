//! Ordo kubehub: kube client wiring, settings and the mapping between
//! StatefulSets and planner state.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::Client;
use ordo_core::{GroupState, Ordinal, DEFAULT_DEFER_DELETE_ANNOTATION};
use tracing::warn;

pub mod annotations;

pub use annotations::{decode_delete_slots, encode_delete_slots};

pub const DEFAULT_DELETE_SLOTS_ANNOTATION: &str = "delete-slots";
pub const DEFAULT_FIELD_MANAGER: &str = "ordo";

/// Runtime settings, read from `ORDO_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Annotation on the StatefulSet holding its delete slots.
    pub delete_slots_annotation: String,
    /// Annotation on a claim recording that its member's removal was confirmed.
    pub defer_delete_annotation: String,
    /// When off, delete slots are neither read nor written.
    pub delete_slots_enabled: bool,
    pub field_manager: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            delete_slots_annotation: DEFAULT_DELETE_SLOTS_ANNOTATION.to_string(),
            defer_delete_annotation: DEFAULT_DEFER_DELETE_ANNOTATION.to_string(),
            delete_slots_enabled: true,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build settings from an arbitrary key lookup; unset or blank keys keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let d = Self::default();
        Self {
            delete_slots_annotation: get("ORDO_DELETE_SLOTS_ANNOTATION").unwrap_or(d.delete_slots_annotation),
            defer_delete_annotation: get("ORDO_DEFER_DELETE_ANNOTATION").unwrap_or(d.defer_delete_annotation),
            delete_slots_enabled: get("ORDO_DELETE_SLOTS_ENABLED")
                .map(|v| !(v == "0" || v.eq_ignore_ascii_case("false")))
                .unwrap_or(d.delete_slots_enabled),
            field_manager: get("ORDO_FIELD_MANAGER").unwrap_or(d.field_manager),
        }
    }
}

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from default config")
}

/// Observed planner state of a StatefulSet.
///
/// A missing `spec.replicas` means the Kubernetes default of one. An
/// undecodable delete-slots annotation is logged and treated as empty.
pub fn group_state_of(sts: &StatefulSet, settings: &Settings) -> GroupState {
    let raw_replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let replicas = u32::try_from(raw_replicas).unwrap_or(0);
    let delete_slots = if settings.delete_slots_enabled {
        let raw = sts
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(&settings.delete_slots_annotation))
            .map(String::as_str);
        match decode_delete_slots(raw) {
            Ok(slots) => slots,
            Err(e) => {
                warn!(sts = ?sts.metadata.name, error = %e, "ignoring undecodable delete slots");
                BTreeSet::new()
            }
        }
    } else {
        BTreeSet::new()
    };
    GroupState { replicas, delete_slots }
}

/// Merge patch setting `spec.replicas` and the delete-slots annotation
/// (`null` removes it).
pub fn scale_patch(replicas: u32, delete_slots: &BTreeSet<Ordinal>, settings: &Settings) -> serde_json::Value {
    let replicas = i32::try_from(replicas).unwrap_or(i32::MAX);
    let mut patch = serde_json::json!({ "spec": { "replicas": replicas } });
    if settings.delete_slots_enabled {
        let value = match encode_delete_slots(delete_slots) {
            Some(v) => serde_json::Value::String(v),
            None => serde_json::Value::Null,
        };
        let mut annotations = serde_json::Map::new();
        annotations.insert(settings.delete_slots_annotation.clone(), value);
        patch["metadata"] = serde_json::json!({ "annotations": annotations });
    }
    patch
}
