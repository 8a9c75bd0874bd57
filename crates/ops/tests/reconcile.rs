#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use ordo_core::prelude::*;
use ordo_core::DEFAULT_DEFER_DELETE_ANNOTATION;
use ordo_ops::{reconcile_once, GroupBackend, ReclaimOutcome};

type Log = Arc<Mutex<Vec<String>>>;

struct MemGroups {
    state: Mutex<GroupState>,
    log: Log,
}

#[async_trait::async_trait]
impl GroupBackend for MemGroups {
    async fn observe(&self, _name: &str) -> Result<GroupState> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn apply(&self, _name: &str, step: &ScaleStep) -> Result<()> {
        self.log.lock().unwrap().push(format!("apply {} {}", step.direction, step.ordinal_or_sentinel()));
        *self.state.lock().unwrap() = step.resulting_state();
        Ok(())
    }
}

struct MemClaims {
    claims: Mutex<BTreeMap<String, ClaimRecord>>,
    fail_delete: bool,
    log: Log,
}

#[async_trait::async_trait]
impl ClaimBackend for MemClaims {
    async fn get_claim(&self, name: &str) -> Result<Option<ClaimRecord>> {
        Ok(self.claims.lock().unwrap().get(name).cloned())
    }

    async fn delete_claim(&self, name: &str) -> Result<()> {
        if self.fail_delete {
            return Err(anyhow!("delete timed out"));
        }
        self.claims.lock().unwrap().remove(name);
        self.log.lock().unwrap().push(format!("delete {}", name));
        Ok(())
    }
}

fn fixture(state: GroupState, claims: Vec<ClaimRecord>, fail_delete: bool) -> (MemGroups, DeferredStorageGuard<MemClaims>, Log) {
    let log: Log = Arc::default();
    let groups = MemGroups { state: Mutex::new(state), log: log.clone() };
    let claims = MemClaims {
        claims: Mutex::new(claims.into_iter().map(|c| (c.name.clone(), c)).collect()),
        fail_delete,
        log: log.clone(),
    };
    (groups, DeferredStorageGuard::new(claims), log)
}

fn marked(name: &str) -> ClaimRecord {
    ClaimRecord::new(name).with_annotation(DEFAULT_DEFER_DELETE_ANNOTATION, "2024-05-01T10:00:00Z")
}

#[tokio::test]
async fn settled_group_is_left_alone() {
    let (groups, guard, log) = fixture(GroupState::new(3, []), vec![], false);
    let out = reconcile_once(&groups, &guard, "demo-tikv", "tikv", &GroupState::new(3, [])).await.expect("pass");
    assert!(!out.needs_another_pass());
    assert_eq!(out.reclaim, None);
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn shrink_applies_then_runs_guard() {
    let (groups, guard, log) = fixture(GroupState::new(3, []), vec![marked("tikv-demo-tikv-2")], false);
    let out = reconcile_once(&groups, &guard, "demo-tikv", "tikv", &GroupState::new(2, [])).await.expect("pass");
    assert_eq!(out.step.direction, ScaleDirection::Shrink);
    assert_eq!(out.reclaim, Some(ReclaimOutcome::Deleted));
    assert_eq!(*log.lock().unwrap(), vec!["apply shrink 2".to_string(), "delete tikv-demo-tikv-2".to_string()]);
}

#[tokio::test]
async fn shrink_without_marker_reports_skip() {
    let (groups, guard, _log) = fixture(GroupState::new(3, []), vec![ClaimRecord::new("tikv-demo-tikv-2")], false);
    let out = reconcile_once(&groups, &guard, "demo-tikv", "tikv", &GroupState::new(2, [])).await.expect("pass");
    assert_eq!(out.reclaim, Some(ReclaimOutcome::Skipped(SkipReason::MarkerAbsent)));
    assert_eq!(out.step.replicas, 2);
}

#[tokio::test]
async fn grow_clears_marked_leftover_before_creating() {
    let (groups, guard, log) = fixture(GroupState::new(2, [1]), vec![marked("tikv-demo-tikv-1")], false);
    let out = reconcile_once(&groups, &guard, "demo-tikv", "tikv", &GroupState::new(3, [])).await.expect("pass");
    assert_eq!(out.step.ordinal, Some(1));
    assert_eq!(*log.lock().unwrap(), vec!["delete tikv-demo-tikv-1".to_string(), "apply grow 1".to_string()]);
}

#[tokio::test]
async fn failed_delete_aborts_grow_before_apply() {
    let (groups, guard, log) = fixture(GroupState::new(2, [1]), vec![marked("tikv-demo-tikv-1")], true);
    let err = reconcile_once(&groups, &guard, "demo-tikv", "tikv", &GroupState::new(3, [])).await.expect_err("must fail");
    assert!(format!("{:#}", err).contains("delete timed out"));
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(*groups.state.lock().unwrap(), GroupState::new(2, [1]));
}

#[tokio::test]
async fn repeated_passes_reach_target() {
    let desired = GroupState::new(3, [1, 2, 3]);
    let (groups, guard, log) = fixture(GroupState::new(5, [1]), vec![], false);
    let mut passes = 0;
    loop {
        let out = reconcile_once(&groups, &guard, "demo-tikv", "tikv", &desired).await.expect("pass");
        if !out.needs_another_pass() {
            break;
        }
        passes += 1;
        assert!(passes <= 4, "did not settle");
    }
    assert_eq!(passes, 2);
    assert_eq!(*groups.state.lock().unwrap(), desired);
    assert_eq!(*log.lock().unwrap(), vec!["apply shrink 3".to_string(), "apply shrink 2".to_string()]);
}
