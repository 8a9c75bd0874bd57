//! Live ordinal sets.
//!
//! A group with `replicas` members and a set of delete slots occupies the
//! ordinals `[0, w) \ delete_slots`, where `w` is the smallest width for which
//! `w - |delete_slots ∩ [0, w)| == replicas`. Slots at or past `w` are redundant.

use std::collections::BTreeSet;

use crate::Ordinal;

/// Smallest width `w` satisfying `w - |delete_slots ∩ [0, w)| == replicas`.
///
/// Walks the slots in ascending order; every slot below the running width
/// pushes the width out by one. Once a slot lands at or past the width all
/// later ones do too.
pub fn width(replicas: u32, delete_slots: &BTreeSet<Ordinal>) -> u32 {
    let mut w = replicas;
    for &slot in delete_slots {
        if slot >= w {
            break;
        }
        w = w.saturating_add(1);
    }
    w
}

/// Delete slots strictly below the resolved width.
pub fn effective_delete_slots(replicas: u32, delete_slots: &BTreeSet<Ordinal>) -> BTreeSet<Ordinal> {
    let w = width(replicas, delete_slots);
    delete_slots.range(..w).copied().collect()
}

/// Live ordinals for `replicas` members with the given delete slots.
pub fn resolve(replicas: u32, delete_slots: &BTreeSet<Ordinal>) -> BTreeSet<Ordinal> {
    let w = width(replicas, delete_slots);
    (0..w).filter(|o| !delete_slots.contains(o)).collect()
}

/// Same result as [`resolve`], found by trying every candidate width from zero.
pub fn resolve_by_scan(replicas: u32, delete_slots: &BTreeSet<Ordinal>) -> BTreeSet<Ordinal> {
    let target = u64::from(replicas);
    let mut w: u64 = 0;
    let mut holes: u64 = 0;
    while w - holes != target {
        if delete_slots.contains(&(w as Ordinal)) {
            holes += 1;
        }
        w += 1;
    }
    (0..w as Ordinal).filter(|o| !delete_slots.contains(o)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(v: &[Ordinal]) -> BTreeSet<Ordinal> {
        v.iter().copied().collect()
    }

    #[test]
    fn no_slots_is_contiguous_prefix() {
        assert_eq!(resolve(3, &set(&[])), set(&[0, 1, 2]));
        assert_eq!(width(3, &set(&[])), 3);
    }

    #[test]
    fn holes_push_width_out() {
        assert_eq!(resolve(3, &set(&[1, 2, 3])), set(&[0, 4, 5]));
        assert_eq!(resolve(5, &set(&[1])), set(&[0, 2, 3, 4, 5]));
        assert_eq!(resolve(3, &set(&[0])), set(&[1, 2, 3]));
    }

    #[test]
    fn redundant_slots_are_ignored() {
        assert_eq!(resolve(2, &set(&[7, 9])), set(&[0, 1]));
        assert_eq!(effective_delete_slots(2, &set(&[1, 7])), set(&[1]));
    }

    #[test]
    fn zero_replicas_is_empty_regardless_of_slots() {
        assert!(resolve(0, &set(&[0, 5])).is_empty());
        assert_eq!(width(0, &set(&[0, 5])), 0);
        assert!(effective_delete_slots(0, &set(&[0, 5])).is_empty());
    }

    #[test]
    fn scan_agrees_on_examples() {
        for (r, d) in [(0, vec![]), (3, vec![1, 2, 3]), (5, vec![1]), (4, vec![0, 1, 9]), (1, vec![0, 2])] {
            let d = set(&d);
            assert_eq!(resolve(r, &d), resolve_by_scan(r, &d), "replicas={} slots={:?}", r, d);
        }
    }
}
