//! Packing of a document's objects into one ordered sequence.
//!
//! Objects of the same type are stored next to each other, so decoding is a
//! single pass that opens a new group whenever the type changes. A type that
//! reappears after its group was closed means the sequence was written out
//! of order; decoding then continues by bucketing every remaining instance
//! into its type's group, which yields the same result as a full stable
//! repartition.

use indexmap::IndexMap;
use tracing::warn;

use dynastore_core::{StoreError, StoreResult};

use crate::converter::RecordInstance;

/// Instances grouped by type name, groups in first-appearance order.
pub type ObjectGroups = IndexMap<String, Vec<RecordInstance>>;

/// Regroups a stored sequence by type name. Order within each group is the
/// order of the sequence.
#[must_use]
pub fn decode(sequence: Vec<RecordInstance>) -> ObjectGroups {
    let mut groups = ObjectGroups::new();
    let mut running: Option<usize> = None;
    let mut in_order = true;
    for (position, instance) in sequence.into_iter().enumerate() {
        let same_group = running
            .and_then(|i| groups.get_index(i))
            .is_some_and(|(name, _)| *name == instance.type_name);
        if in_order && !same_group && groups.contains_key(&instance.type_name) {
            warn!(
                type_name = %instance.type_name,
                position,
                "object sequence is not grouped by type, repartitioning"
            );
            in_order = false;
        }
        let entry = groups.entry(instance.type_name.clone());
        let index = entry.index();
        entry.or_default().push(instance);
        running = Some(index);
    }
    groups
}

/// Flattens grouped instances into one sequence, each group contiguous and
/// in map order.
///
/// # Errors
///
/// Returns [`StoreError::TypeMismatch`] if an instance is grouped under a
/// type name other than its own.
pub fn encode(groups: ObjectGroups) -> StoreResult<Vec<RecordInstance>> {
    let mut sequence = Vec::with_capacity(groups.values().map(Vec::len).sum());
    for (type_name, instances) in groups {
        for instance in instances {
            if instance.type_name != type_name {
                return Err(StoreError::TypeMismatch {
                    type_name,
                    member: instance.key,
                    expected: "instance of the grouping type".to_string(),
                    found: instance.type_name,
                });
            }
            sequence.push(instance);
        }
    }
    Ok(sequence)
}
