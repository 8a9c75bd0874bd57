//! Ordo core: live ordinal resolution, one-step scale planning and deferred
//! claim reclamation for ordinally-identified workload members.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod ordinals;
pub mod planner;
pub mod reclaim;

pub use ordinals::resolve;
pub use planner::{scale_one, simulate};
pub use reclaim::{ClaimBackend, DeferredStorageGuard, ReclaimError};

/// Stable position of a member within its group.
pub type Ordinal = u32;

/// Annotation carrying the defer-delete marker on a storage claim.
pub const DEFAULT_DEFER_DELETE_ANNOTATION: &str = "ordo.io/pvc-defer-deleting";

/// Observed or target configuration of one member group.
///
/// `delete_slots` may hold entries beyond the resolved width; they are redundant
/// bookkeeping and are tolerated everywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupState {
    pub replicas: u32,
    #[serde(default)]
    pub delete_slots: BTreeSet<Ordinal>,
}

impl GroupState {
    pub fn new(replicas: u32, delete_slots: impl IntoIterator<Item = Ordinal>) -> Self {
        Self { replicas, delete_slots: delete_slots.into_iter().collect() }
    }

    /// Ordinals currently considered live.
    pub fn live_ordinals(&self) -> BTreeSet<Ordinal> {
        ordinals::resolve(self.replicas, &self.delete_slots)
    }

    /// Delete slots that actually carve a hole below the resolved width.
    pub fn effective_delete_slots(&self) -> BTreeSet<Ordinal> {
        ordinals::effective_delete_slots(self.replicas, &self.delete_slots)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScaleDirection {
    Grow,
    Shrink,
    /// Group already matches its target.
    None,
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScaleDirection::Grow => "grow",
            ScaleDirection::Shrink => "shrink",
            ScaleDirection::None => "none",
        };
        f.write_str(s)
    }
}

/// Exactly one atomic mutation of a group. Consumed immediately, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleStep {
    pub direction: ScaleDirection,
    /// Ordinal created or removed; `None` iff `direction` is `None`.
    /// Rendered as `-1` on the wire.
    #[serde(with = "sentinel_ordinal")]
    pub ordinal: Option<Ordinal>,
    /// Replica count after the step.
    pub replicas: u32,
    /// Delete slots after the step.
    pub delete_slots: BTreeSet<Ordinal>,
}

impl ScaleStep {
    pub fn is_settled(&self) -> bool {
        self.direction == ScaleDirection::None
    }

    /// The ordinal with `-1` standing in for "no ordinal".
    pub fn ordinal_or_sentinel(&self) -> i64 {
        self.ordinal.map(i64::from).unwrap_or(-1)
    }

    /// Group state the step leaves behind.
    pub fn resulting_state(&self) -> GroupState {
        GroupState { replicas: self.replicas, delete_slots: self.delete_slots.clone() }
    }
}

mod sentinel_ordinal {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Ordinal;

    pub fn serialize<S: Serializer>(v: &Option<Ordinal>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(o) => s.serialize_i64(i64::from(*o)),
            None => s.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Ordinal>, D::Error> {
        let raw = i64::deserialize(d)?;
        if raw < 0 { Ok(None) } else { Ordinal::try_from(raw).map(Some).map_err(serde::de::Error::custom) }
    }
}

/// Non-error reasons a claim was left in place during this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    ClaimNotFound,
    MarkerAbsent,
    MarkerEmpty,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::ClaimNotFound => "claim not found",
            SkipReason::MarkerAbsent => "claim has no annotations",
            SkipReason::MarkerEmpty => "defer-delete marker is empty",
        };
        f.write_str(s)
    }
}

/// The fields of a storage claim the guard consults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub name: String,
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ClaimRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), annotations: None }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.get_or_insert_with(BTreeMap::new).insert(key.into(), value.into());
        self
    }
}

/// Name of the claim backing `ordinal` of `group_name`.
///
/// Shared with whatever provisions the storage; changing the format orphans
/// claims created under the old one.
pub fn claim_name(member_kind: &str, group_name: &str, ordinal: Ordinal) -> String {
    format!("{}-{}-{}", member_kind, group_name, ordinal)
}

pub mod prelude {
    pub use super::{
        claim_name, ClaimBackend, ClaimRecord, DeferredStorageGuard, GroupState, Ordinal, ReclaimError,
        ScaleDirection, ScaleStep, SkipReason,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_name_is_kind_group_ordinal() {
        assert_eq!(claim_name("tikv", "basic-tikv", 3), "tikv-basic-tikv-3");
    }

    #[test]
    fn claim_name_distinguishes_ordinals() {
        assert_ne!(claim_name("pd", "demo", 1), claim_name("pd", "demo", 11));
    }

    #[test]
    fn settled_step_serializes_ordinal_as_minus_one() {
        let step = ScaleStep { direction: ScaleDirection::None, ordinal: None, replicas: 2, delete_slots: BTreeSet::new() };
        let v = serde_json::to_value(&step).expect("serialize");
        assert_eq!(v["ordinal"], serde_json::json!(-1));
        assert_eq!(v["direction"], serde_json::json!("NONE"));
        let back: ScaleStep = serde_json::from_value(v).expect("deserialize");
        assert_eq!(back, step);
    }

    #[test]
    fn group_state_defaults_missing_delete_slots() {
        let g: GroupState = serde_json::from_str(r#"{"replicas":3}"#).expect("parse");
        assert_eq!(g, GroupState::new(3, []));
    }
}
