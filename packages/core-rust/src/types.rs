use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Closed set of value kinds a dynamic class field may declare.
///
/// Kind names parse case-sensitively from their variant names (`"Text"`,
/// `"TextList"`, …); anything else is a [`StoreError::MalformedSchema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    /// Short string.
    Text,
    /// Unbounded string.
    LongText,
    /// Signed 32-bit integer.
    Integer,
    /// Signed 64-bit integer.
    Long,
    /// 32-bit IEEE 754 float.
    Float,
    /// 64-bit IEEE 754 float.
    Double,
    /// Milliseconds since the Unix epoch.
    Date,
    /// Ordered list of strings.
    TextList,
}

impl ValueKind {
    /// Every kind, in declaration order.
    pub const ALL: [ValueKind; 8] = [
        ValueKind::Text,
        ValueKind::LongText,
        ValueKind::Integer,
        ValueKind::Long,
        ValueKind::Float,
        ValueKind::Double,
        ValueKind::Date,
        ValueKind::TextList,
    ];

    /// Name used in schema definitions and error messages.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Text => "Text",
            ValueKind::LongText => "LongText",
            ValueKind::Integer => "Integer",
            ValueKind::Long => "Long",
            ValueKind::Float => "Float",
            ValueKind::Double => "Double",
            ValueKind::Date => "Date",
            ValueKind::TextList => "TextList",
        }
    }

    /// Parses a kind name declared by a schema for `type_name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MalformedSchema`] for names outside the fixed set.
    pub fn parse(type_name: &str, kind: &str) -> StoreResult<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.name() == kind)
            .ok_or_else(|| StoreError::MalformedSchema {
                type_name: type_name.to_string(),
                reason: format!("unsupported value kind [{kind}]"),
            })
    }

    /// Whether an empty-text bag value stands for "unset" in this kind.
    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ValueKind::Integer | ValueKind::Long | ValueKind::Float | ValueKind::Double
        )
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Tagged value of a dynamic property, one variant per [`ValueKind`].
///
/// Serializes to `MsgPack` via `rmp-serde` inside stored record instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Text(String),
    LongText(String),
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Date(i64),
    TextList(Vec<String>),
}

impl Value {
    /// Kind tag of this value.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Text(_) => ValueKind::Text,
            Value::LongText(_) => ValueKind::LongText,
            Value::Integer(_) => ValueKind::Integer,
            Value::Long(_) => ValueKind::Long,
            Value::Float(_) => ValueKind::Float,
            Value::Double(_) => ValueKind::Double,
            Value::Date(_) => ValueKind::Date,
            Value::TextList(_) => ValueKind::TextList,
        }
    }

    /// `true` for `Text("")` and `LongText("")`.
    ///
    /// The dynamic model writes unset numeric fields as empty text.
    #[must_use]
    pub fn is_empty_text(&self) -> bool {
        matches!(self, Value::Text(s) | Value::LongText(s) if s.is_empty())
    }
}

/// Dynamic, pre-conversion form of an object: raw property names to values,
/// attached to the type name of the object's class.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PropertyBag {
    /// Canonical type name of the class this object instantiates.
    pub type_name: String,
    /// Property values keyed by raw (unescaped) property name.
    pub properties: IndexMap<String, Value>,
}

impl PropertyBag {
    /// Creates an empty bag for `type_name`.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            properties: IndexMap::new(),
        }
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Sets a property, returning the previous value if any.
    pub fn set(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.properties.insert(name.into(), value)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}
