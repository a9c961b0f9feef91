//! Round-robin partitioning of targets over worker slots

use crate::proxy::WorkerSlot;
use std::collections::BTreeMap;

/// Orders slots so consecutive positions alternate between backend groups
///
/// `[a0, a1, b0, b1, c0]` becomes `[a0, b0, c0, a1, b1]`.
pub fn interleave_by_group(slots: &[WorkerSlot]) -> Vec<WorkerSlot> {
    let mut groups: BTreeMap<usize, Vec<&WorkerSlot>> = BTreeMap::new();
    for slot in slots {
        groups.entry(slot.group).or_default().push(slot);
    }

    let depth = groups.values().map(Vec::len).max().unwrap_or(0);
    let mut ordered = Vec::with_capacity(slots.len());
    for round in 0..depth {
        for members in groups.values() {
            if let Some(slot) = members.get(round) {
                ordered.push((*slot).clone());
            }
        }
    }
    ordered
}

/// Deals `items` round-robin over `slots`
///
/// Every item lands in exactly one partition and partition sizes differ by at
/// most one. Items keep their relative order within a partition. Partitions
/// are returned in slot id order; with no slots nothing is assigned.
pub fn partition<T>(items: Vec<T>, slots: &[WorkerSlot]) -> Vec<(WorkerSlot, Vec<T>)> {
    let ordered = interleave_by_group(slots);
    if ordered.is_empty() {
        return Vec::new();
    }

    let mut buckets: Vec<Vec<T>> = ordered.iter().map(|_| Vec::new()).collect();
    for (i, item) in items.into_iter().enumerate() {
        buckets[i % ordered.len()].push(item);
    }

    let mut parts: Vec<(WorkerSlot, Vec<T>)> = ordered.into_iter().zip(buckets).collect();
    parts.sort_by_key(|(slot, _)| slot.slot_id);
    parts
}
