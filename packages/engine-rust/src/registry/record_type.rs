//! Generated record types: the storage-side form of a dynamic class.
//!
//! A [`GeneratedRecordType`] is data, not code: an ordered member list whose
//! names are escaped identifiers, plus the `MsgPack` form persisted in the
//! durable store. Instances are interpreted against it by the converter.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use dynastore_core::escape::escape;
use dynastore_core::{SchemaDefinition, StoreError, StoreResult, ValueKind};

use crate::storage::{decode_record, encode_record};

const RECORD_TYPE: &str = "record type";

/// One member of a generated record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Escaped identifier, safe for the query surface.
    pub name: String,
    /// Field name as declared by the schema.
    pub raw_name: String,
    pub kind: ValueKind,
}

/// Process-local identity of a registered type version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeHandle {
    /// Registry generation at which this version was installed.
    pub generation: u64,
}

#[derive(Serialize, Deserialize)]
struct StoredRecordType {
    type_name: String,
    members: Vec<StoredMember>,
}

#[derive(Serialize, Deserialize)]
struct StoredMember {
    name: String,
    kind: ValueKind,
}

/// Typed record descriptor compiled from a schema definition.
#[derive(Debug)]
pub struct GeneratedRecordType {
    type_name: String,
    members: IndexMap<String, Member>,
    serialized: Bytes,
    handle: Option<TypeHandle>,
    dirty: AtomicBool,
}

impl GeneratedRecordType {
    /// Builds a new, dirty, unregistered type from raw member names.
    ///
    /// Redeclared members keep their first position and take the last kind.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the descriptor cannot be encoded.
    pub fn build(
        type_name: impl Into<String>,
        members: impl IntoIterator<Item = (String, ValueKind)>,
    ) -> StoreResult<Self> {
        let type_name = type_name.into();
        let mut by_name: IndexMap<String, Member> = IndexMap::new();
        for (raw_name, kind) in members {
            let name = escape(&raw_name);
            by_name.insert(
                name.clone(),
                Member {
                    name,
                    raw_name,
                    kind,
                },
            );
        }
        let stored = StoredRecordType {
            type_name: type_name.clone(),
            members: by_name
                .values()
                .map(|m| StoredMember {
                    name: m.raw_name.clone(),
                    kind: m.kind,
                })
                .collect(),
        };
        let serialized = Bytes::from(encode_record(RECORD_TYPE, &stored)?);
        Ok(Self {
            type_name,
            members: by_name,
            serialized,
            handle: None,
            dirty: AtomicBool::new(true),
        })
    }

    /// Rebuilds a persisted type. The result is clean.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if `bytes` do not decode, or decode to
    /// a different type name than the one they were stored under.
    pub fn from_serialized(type_name: &str, bytes: &[u8]) -> StoreResult<Self> {
        let stored: StoredRecordType = decode_record(RECORD_TYPE, bytes)?;
        if stored.type_name != type_name {
            return Err(StoreError::Corrupt {
                what: RECORD_TYPE,
                reason: format!(
                    "stored under {type_name} but describes {}",
                    stored.type_name
                ),
            });
        }
        let members = stored
            .members
            .into_iter()
            .map(|m| {
                let name = escape(&m.name);
                (
                    name.clone(),
                    Member {
                        name,
                        raw_name: m.name,
                        kind: m.kind,
                    },
                )
            })
            .collect();
        Ok(Self {
            type_name: stored.type_name,
            members,
            serialized: Bytes::copy_from_slice(bytes),
            handle: None,
            dirty: AtomicBool::new(false),
        })
    }

    pub(crate) fn with_handle(mut self, generation: u64) -> Self {
        self.handle = Some(TypeHandle { generation });
        self
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Members in declaration order.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Member by escaped name.
    #[must_use]
    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    /// Member by raw (schema) name.
    #[must_use]
    pub fn member_by_raw(&self, raw_name: &str) -> Option<&Member> {
        self.members.get(&escape(raw_name))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// `MsgPack` descriptor persisted under the type name.
    #[must_use]
    pub fn serialized_form(&self) -> &Bytes {
        &self.serialized
    }

    /// `None` until the type has been installed in a registry.
    #[must_use]
    pub fn handle(&self) -> Option<TypeHandle> {
        self.handle
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.handle.is_some()
    }

    /// `true` until the serialized form has been durably committed.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Records that the serialized form is durable.
    pub fn mark_persisted(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Whether both versions declare the same members with the same kinds,
    /// ignoring order.
    #[must_use]
    pub fn same_members(&self, other: &GeneratedRecordType) -> bool {
        self.members == other.members
    }

    /// Schema definition covering every member of this type.
    #[must_use]
    pub fn schema(&self) -> SchemaDefinition {
        self.members().fold(
            SchemaDefinition::new(self.type_name.clone()),
            |schema, m| schema.with_field(m.raw_name.clone(), m.kind),
        )
    }
}
