//! Conversion between property bags and record instances.
//!
//! A [`RecordInstance`] stores values under escaped member names, exactly as
//! the query surface sees them. Both directions are pure functions.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use dynastore_core::escape::escape;
use dynastore_core::{PropertyBag, SchemaDefinition, StoreError, StoreResult, Value};

use crate::registry::GeneratedRecordType;

/// Value of a generated record type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordInstance {
    /// Type name the instance was converted against.
    pub type_name: String,
    /// Identity, unique within the containing document.
    pub key: String,
    /// Set members by escaped name. Unset members are absent.
    pub values: IndexMap<String, Value>,
}

impl RecordInstance {
    pub fn new(type_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            key: key.into(),
            values: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Value of the member with escaped name `member`.
    #[must_use]
    pub fn get(&self, member: &str) -> Option<&Value> {
        self.values.get(member)
    }
}

fn mismatch(type_name: &str, member: &str, expected: impl ToString, found: impl ToString) -> StoreError {
    StoreError::TypeMismatch {
        type_name: type_name.to_string(),
        member: member.to_string(),
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

/// Copies the members `ty` declares out of `bag`.
///
/// An empty text value for a numeric member counts as unset. Properties the
/// type does not declare are ignored. The returned instance has an empty
/// key; callers assign one with [`RecordInstance::with_key`].
///
/// # Errors
///
/// Returns [`StoreError::TypeMismatch`] if `bag` belongs to another type or
/// a value's kind differs from its member's kind.
pub fn from_bag(bag: &PropertyBag, ty: &GeneratedRecordType) -> StoreResult<RecordInstance> {
    if bag.type_name != ty.type_name() {
        return Err(mismatch(ty.type_name(), "", ty.type_name(), &bag.type_name));
    }
    let mut instance = RecordInstance::new(ty.type_name(), String::new());
    for member in ty.members() {
        let Some(value) = bag.get(&member.raw_name) else {
            continue;
        };
        if member.kind.is_numeric() && value.is_empty_text() {
            continue;
        }
        if value.kind() != member.kind {
            return Err(mismatch(
                ty.type_name(),
                &member.raw_name,
                member.kind,
                value.kind(),
            ));
        }
        instance.values.insert(member.name.clone(), value.clone());
    }
    Ok(instance)
}

/// Rebuilds the property bag of `instance` under `schema`.
///
/// Entries follow the schema's field order. Set members with no field in
/// `schema` are omitted.
///
/// # Errors
///
/// Returns [`StoreError::TypeMismatch`] if a stored value's kind differs
/// from the kind `schema` now declares for it.
pub fn to_bag(instance: &RecordInstance, schema: &SchemaDefinition) -> StoreResult<PropertyBag> {
    let mut bag = PropertyBag::new(instance.type_name.clone());
    for field in schema.fields() {
        let Some(value) = instance.values.get(&escape(field.name)) else {
            continue;
        };
        if value.kind() != field.kind {
            return Err(mismatch(
                &instance.type_name,
                field.name,
                field.kind,
                value.kind(),
            ));
        }
        bag.set(field.name, value.clone());
    }
    let omitted = instance.values.len() - bag.len();
    if omitted > 0 {
        trace!(
            type_name = %instance.type_name,
            key = %instance.key,
            omitted,
            "dropped members missing from current schema"
        );
    }
    Ok(bag)
}
