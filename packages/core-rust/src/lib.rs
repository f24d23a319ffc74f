//! `dynastore` core: identifier escaping, canonical keys, schema definitions,
//! property bags, and the error taxonomy shared by the engine.

pub mod error;
pub mod escape;
pub mod key;
pub mod reference;
pub mod schema;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use key::canonical_key;
pub use reference::{resolve_type_name, type_name, DocumentReference, EntityType};
pub use schema::{FieldDef, SchemaDefinition};
pub use types::{PropertyBag, Value, ValueKind};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
