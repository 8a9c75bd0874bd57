//! Delete-slot annotation codec: a JSON array of ordinals, e.g. `[1,3]`.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use ordo_core::Ordinal;
use tracing::warn;

/// Decode the annotation value. Absent or blank means no delete slots.
/// Entries that cannot be ordinals (negative, too large) are dropped.
pub fn decode_delete_slots(raw: Option<&str>) -> Result<BTreeSet<Ordinal>> {
    let raw = match raw.map(str::trim) {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(BTreeSet::new()),
    };
    let values: Vec<i64> = serde_json::from_str(raw).with_context(|| format!("parsing delete slots {:?}", raw))?;
    let mut out = BTreeSet::new();
    for v in values {
        match Ordinal::try_from(v) {
            Ok(o) => {
                out.insert(o);
            }
            Err(_) => warn!(value = v, "ignoring out-of-range delete slot"),
        }
    }
    Ok(out)
}

/// Encode delete slots as a sorted JSON array; `None` when there are none,
/// meaning the annotation should be removed.
pub fn encode_delete_slots(slots: &BTreeSet<Ordinal>) -> Option<String> {
    if slots.is_empty() {
        return None;
    }
    let list: Vec<String> = slots.iter().map(|o| o.to_string()).collect();
    Some(format!("[{}]", list.join(",")))
}
