use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::reference::{type_name, DocumentReference};
use crate::types::{PropertyBag, ValueKind};

/// Schema definition for a dynamic class: raw field names to value kinds,
/// in declaration order.
///
/// Identified by the canonical type name of the class document. A schema
/// is immutable once compiled; a later definition for the same name
/// supersedes it through schema evolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    /// Canonical type name this schema defines.
    pub type_name: String,
    /// Field definitions keyed by raw field name.
    fields: IndexMap<String, ValueKind>,
}

/// Single field definition within a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef<'a> {
    /// Raw (unescaped) name of the field.
    pub name: &'a str,
    /// Kind of values the field holds.
    pub kind: ValueKind,
}

impl SchemaDefinition {
    /// Creates an empty schema for `type_name`.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: IndexMap::new(),
        }
    }

    /// Creates an empty schema named after a class document.
    #[must_use]
    pub fn for_class(class: &DocumentReference) -> Self {
        Self::new(type_name(class))
    }

    /// Builds a schema from field names and kind names as supplied by the
    /// application layer.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::MalformedSchema`] if any kind name is
    /// outside the fixed set.
    pub fn from_raw<'a>(
        type_name: impl Into<String>,
        fields: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> StoreResult<Self> {
        let mut schema = Self::new(type_name);
        for (name, kind) in fields {
            let kind = ValueKind::parse(&schema.type_name, kind)?;
            schema.fields.insert(name.to_string(), kind);
        }
        Ok(schema)
    }

    /// Derives a schema from the kinds of the values an object carries.
    ///
    /// Used when an object is stored before its class has been defined.
    #[must_use]
    pub fn from_bag(bag: &PropertyBag) -> Self {
        Self {
            type_name: bag.type_name.clone(),
            fields: bag
                .properties
                .iter()
                .map(|(name, value)| (name.clone(), value.kind()))
                .collect(),
        }
    }

    /// Builder-style field declaration. Redeclaring a field replaces its kind
    /// but keeps its position.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.fields.insert(name.into(), kind);
        self
    }

    /// Kind of the named field, if declared.
    #[must_use]
    pub fn kind_of(&self, name: &str) -> Option<ValueKind> {
        self.fields.get(name).copied()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = FieldDef<'_>> {
        self.fields.iter().map(|(name, &kind)| FieldDef { name, kind })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use crate::StoreError;

    #[test]
    fn from_raw_keeps_declaration_order() {
        let schema =
            SchemaDefinition::from_raw("w.S.C", [("b", "Integer"), ("a", "Text")]).unwrap();
        let names: Vec<_> = schema.fields().map(|f| f.name).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(schema.kind_of("b"), Some(ValueKind::Integer));
    }

    #[test]
    fn from_raw_rejects_unknown_kind() {
        let err = SchemaDefinition::from_raw("w.S.C", [("flag", "Boolean")]).unwrap_err();
        assert!(matches!(err, StoreError::MalformedSchema { ref type_name, .. } if type_name == "w.S.C"));
    }

    #[test]
    fn for_class_uses_type_name() {
        let class = DocumentReference::new("xwiki", ["XWiki"], "User Class");
        assert_eq!(
            SchemaDefinition::for_class(&class).type_name,
            "xwiki.XWiki.UserX20Class"
        );
    }

    #[test]
    fn from_bag_infers_kinds() {
        let bag = PropertyBag::new("w.S.C")
            .with("name", Value::Text("x".to_string()))
            .with("born", Value::Date(0));
        let schema = SchemaDefinition::from_bag(&bag);
        assert_eq!(schema.type_name, "w.S.C");
        assert_eq!(schema.kind_of("name"), Some(ValueKind::Text));
        assert_eq!(schema.kind_of("born"), Some(ValueKind::Date));
    }

    #[test]
    fn redeclared_field_keeps_position() {
        let schema = SchemaDefinition::new("T")
            .with_field("a", ValueKind::Text)
            .with_field("b", ValueKind::Text)
            .with_field("a", ValueKind::Long);
        let fields: Vec<_> = schema.fields().collect();
        assert_eq!(fields[0].name, "a");
        assert_eq!(fields[0].kind, ValueKind::Long);
        assert_eq!(schema.len(), 2);
    }
}
