//! One-step scale planning.
//!
//! [`scale_one`] moves a group exactly one ordinal closer to its target. Missing
//! ordinals are filled lowest first and always before anything is removed, so a
//! hole that moves from one position to another passes through a superset of
//! the required members. Surplus ordinals are removed highest first.
//!
//! The delete slots of a step are rebuilt so that they resolve to the current
//! members plus or minus the stepped ordinal: slots that fall past the new width
//! are pruned, and every target slot that is not live after the step is carried.
//!
//! Callers re-observe the group between steps; the planner holds no state.

use std::collections::BTreeSet;

use crate::ordinals::width;
use crate::{GroupState, Ordinal, ScaleDirection, ScaleStep};

/// Compute the next single step that takes `actual` towards `desired`.
pub fn scale_one(actual: &GroupState, desired: &GroupState) -> ScaleStep {
    let current = actual.live_ordinals();
    let target = desired.live_ordinals();

    if let Some(&o) = target.difference(&current).min() {
        let replicas = actual.replicas.saturating_add(1);
        let mut slots = actual.delete_slots.clone();
        slots.remove(&o);
        let mut live = current;
        live.insert(o);
        return ScaleStep {
            direction: ScaleDirection::Grow,
            ordinal: Some(o),
            replicas,
            delete_slots: next_delete_slots(replicas, slots, desired, &live),
        };
    }

    if let Some(&o) = current.difference(&target).max() {
        let replicas = actual.replicas.saturating_sub(1);
        let mut slots = actual.delete_slots.clone();
        // Only a slot the target retires becomes a hole; otherwise this is a plain count reduction.
        if desired.delete_slots.contains(&o) {
            slots.insert(o);
        }
        let mut live = current;
        live.remove(&o);
        return ScaleStep {
            direction: ScaleDirection::Shrink,
            ordinal: Some(o),
            replicas,
            delete_slots: next_delete_slots(replicas, slots, desired, &live),
        };
    }

    ScaleStep {
        direction: ScaleDirection::None,
        ordinal: None,
        replicas: actual.replicas,
        delete_slots: actual.delete_slots.clone(),
    }
}

fn next_delete_slots(
    replicas: u32,
    mut slots: BTreeSet<Ordinal>,
    desired: &GroupState,
    live: &BTreeSet<Ordinal>,
) -> BTreeSet<Ordinal> {
    let w = width(replicas, &slots);
    slots.retain(|s| *s < w);
    slots.extend(desired.delete_slots.iter().filter(|s| !live.contains(s)).copied());
    slots
}

/// Offline preview: feeds each step's result back into [`scale_one`] until the
/// group settles. The settling `None` step is not yielded.
///
/// Live reconcilers must not use this to drive a cluster; they observe the
/// group again after every applied step.
pub fn simulate(actual: GroupState, desired: GroupState) -> Simulation {
    Simulation { actual, desired, settled: false }
}

#[derive(Debug, Clone)]
pub struct Simulation {
    actual: GroupState,
    desired: GroupState,
    settled: bool,
}

impl Simulation {
    /// State reached so far.
    pub fn state(&self) -> &GroupState {
        &self.actual
    }
}

impl Iterator for Simulation {
    type Item = ScaleStep;

    fn next(&mut self) -> Option<ScaleStep> {
        if self.settled {
            return None;
        }
        let step = scale_one(&self.actual, &self.desired);
        if step.is_settled() {
            self.settled = true;
            return None;
        }
        self.actual = step.resulting_state();
        Some(step)
    }
}
