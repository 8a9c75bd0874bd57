//! Ordo Ops: imperative Kubernetes operations behind the planner and the
//! deferred claim guard, plus a single reconciler pass tying them together.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::{api::{Api, DeleteParams, Patch, PatchParams}, Client};
use metrics::{counter, histogram};
use ordo_core::prelude::*;
use ordo_core::scale_one;
use ordo_kubehub::{group_state_of, scale_patch, Settings};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Read and mutate the scale of a named member group.
#[async_trait::async_trait]
pub trait GroupBackend: Send + Sync {
    async fn observe(&self, name: &str) -> Result<GroupState>;
    /// Apply the resulting replicas and delete slots of `step`.
    async fn apply(&self, name: &str, step: &ScaleStep) -> Result<()>;
}

/// StatefulSets of one namespace.
pub struct KubeGroups {
    api: Api<StatefulSet>,
    settings: Settings,
}

impl KubeGroups {
    pub fn new(client: Client, namespace: &str, settings: Settings) -> Self {
        Self { api: Api::namespaced(client, namespace), settings }
    }
}

#[async_trait::async_trait]
impl GroupBackend for KubeGroups {
    async fn observe(&self, name: &str) -> Result<GroupState> {
        let sts = self.api.get(name).await.with_context(|| format!("getting statefulset {}", name))?;
        Ok(group_state_of(&sts, &self.settings))
    }

    async fn apply(&self, name: &str, step: &ScaleStep) -> Result<()> {
        let patch = scale_patch(step.replicas, &step.delete_slots, &self.settings);
        let pp = PatchParams { field_manager: Some(self.settings.field_manager.clone()), ..Default::default() };
        self.api
            .patch(name, &pp, &Patch::Merge(&patch))
            .await
            .with_context(|| format!("patching statefulset {}", name))?;
        info!(sts = %name, replicas = step.replicas, delete_slots = ?step.delete_slots, "scale statefulset");
        Ok(())
    }
}

/// PersistentVolumeClaims of one namespace.
pub struct KubeClaims {
    api: Api<PersistentVolumeClaim>,
    settings: Settings,
}

impl KubeClaims {
    pub fn new(client: Client, namespace: &str, settings: Settings) -> Self {
        Self { api: Api::namespaced(client, namespace), settings }
    }

    /// Stamp the defer-delete marker on a claim, recording that its member's
    /// removal is intended. The value is the current time (RFC 3339).
    pub async fn mark_deferred(&self, name: &str) -> Result<()> {
        let ts = chrono::Utc::now().to_rfc3339();
        let mut annotations = serde_json::Map::new();
        annotations.insert(self.settings.defer_delete_annotation.clone(), serde_json::Value::String(ts));
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        let pp = PatchParams { field_manager: Some(self.settings.field_manager.clone()), ..Default::default() };
        self.api
            .patch(name, &pp, &Patch::Merge(&patch))
            .await
            .with_context(|| format!("marking claim {} for deferred deletion", name))?;
        info!(claim = %name, "claim marked for deferred deletion");
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClaimBackend for KubeClaims {
    async fn get_claim(&self, name: &str) -> Result<Option<ClaimRecord>> {
        let pvc = self.api.get_opt(name).await.with_context(|| format!("getting claim {}", name))?;
        Ok(pvc.map(|p| ClaimRecord {
            name: p.metadata.name.unwrap_or_else(|| name.to_string()),
            annotations: p.metadata.annotations,
        }))
    }

    async fn delete_claim(&self, name: &str) -> Result<()> {
        let _ = self
            .api
            .delete(name, &DeleteParams::default())
            .await
            .with_context(|| format!("deleting claim {}", name))?;
        Ok(())
    }
}

/// Build the guard for a namespace using the configured marker annotation.
pub fn kube_guard(client: Client, namespace: &str, settings: &Settings) -> DeferredStorageGuard<KubeClaims> {
    DeferredStorageGuard::new(KubeClaims::new(client, namespace, settings.clone()))
        .with_marker_key(settings.defer_delete_annotation.clone())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result", content = "reason")]
pub enum ReclaimOutcome {
    Deleted,
    Skipped(SkipReason),
}

impl From<Option<SkipReason>> for ReclaimOutcome {
    fn from(v: Option<SkipReason>) -> Self {
        match v {
            Some(r) => ReclaimOutcome::Skipped(r),
            None => ReclaimOutcome::Deleted,
        }
    }
}

/// What one reconciler pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassOutcome {
    pub observed: GroupState,
    pub step: ScaleStep,
    /// Guard result for the step's ordinal, when the guard ran.
    pub reclaim: Option<ReclaimOutcome>,
}

impl PassOutcome {
    /// Whether another pass is needed to reach the target.
    pub fn needs_another_pass(&self) -> bool {
        !self.step.is_settled()
    }
}

/// One reconciler pass for group `name`: observe, plan one step, apply it.
///
/// Before a member is created its ordinal's claim goes through the guard so a
/// recorded leftover is not reused; after a member is removed the guard runs
/// for the removed ordinal. Skips never fail the pass, hard errors do. The
/// caller must serialize passes per group.
pub async fn reconcile_once<G, B>(
    groups: &G,
    guard: &DeferredStorageGuard<B>,
    name: &str,
    member_kind: &str,
    desired: &GroupState,
) -> Result<PassOutcome>
where
    G: GroupBackend,
    B: ClaimBackend,
{
    let observed = groups.observe(name).await?;
    let step = scale_one(&observed, desired);
    debug!(group = %name, direction = %step.direction, ordinal = step.ordinal_or_sentinel(), "planned step");

    let ordinal = match (step.direction, step.ordinal) {
        (ScaleDirection::None, _) | (_, None) => {
            return Ok(PassOutcome { observed, step, reclaim: None });
        }
        (_, Some(o)) => o,
    };

    let mut reclaim = None;
    if step.direction == ScaleDirection::Grow {
        reclaim = Some(run_guard(guard, name, member_kind, ordinal).await?);
    }

    let started = std::time::Instant::now();
    groups.apply(name, &step).await?;
    histogram!("ordo_step_apply_ms", started.elapsed().as_secs_f64() * 1000.0);
    counter!("ordo_scale_steps_total", 1u64, "direction" => step.direction.to_string());
    info!(group = %name, direction = %step.direction, ordinal, replicas = step.replicas, slots = ?step.delete_slots, "applied scale step");

    if step.direction == ScaleDirection::Shrink {
        reclaim = Some(run_guard(guard, name, member_kind, ordinal).await?);
    }

    Ok(PassOutcome { observed, step, reclaim })
}

async fn run_guard<B: ClaimBackend>(guard: &DeferredStorageGuard<B>, name: &str, member_kind: &str, ordinal: Ordinal) -> Result<ReclaimOutcome> {
    match guard.reclaim(name, member_kind, ordinal).await {
        Ok(Some(reason)) => {
            counter!("ordo_reclaim_skipped_total", 1u64, "reason" => reason.to_string());
            Ok(ReclaimOutcome::Skipped(reason))
        }
        Ok(None) => {
            counter!("ordo_reclaim_deleted_total", 1u64);
            Ok(ReclaimOutcome::Deleted)
        }
        Err(e) => {
            counter!("ordo_reclaim_errors_total", 1u64);
            warn!(group = %name, ordinal, error = %e, "claim reclamation failed");
            Err(anyhow::Error::new(e).context(format!("reclaiming ordinal {} of {}", ordinal, name)))
        }
    }
}
