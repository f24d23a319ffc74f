//! Class lookup collaborator.
//!
//! The engine asks a [`ClassProvider`] for the schema of a class it has
//! never seen, before it falls back to deriving one from an object's own
//! properties.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use dynastore_core::{DocumentReference, SchemaDefinition, StoreResult};

/// Supplies schema definitions for class documents.
///
/// Used as `Arc<dyn ClassProvider>`.
#[async_trait]
pub trait ClassProvider: Send + Sync {
    /// Schema declared by `class`, or `None` if the provider does not know
    /// the class.
    async fn class_schema(&self, class: &DocumentReference)
        -> StoreResult<Option<SchemaDefinition>>;
}

/// Provider that knows no classes.
pub struct NoClassProvider;

#[async_trait]
impl ClassProvider for NoClassProvider {
    async fn class_schema(
        &self,
        _class: &DocumentReference,
    ) -> StoreResult<Option<SchemaDefinition>> {
        Ok(None)
    }
}

/// Provider backed by an in-process table of schemas.
#[derive(Default)]
pub struct StaticClassProvider {
    schemas: RwLock<HashMap<DocumentReference, SchemaDefinition>>,
}

impl StaticClassProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces the schema declared by `class`.
    pub fn insert(&self, class: DocumentReference, schema: SchemaDefinition) {
        self.schemas.write().insert(class, schema);
    }
}

#[async_trait]
impl ClassProvider for StaticClassProvider {
    async fn class_schema(
        &self,
        class: &DocumentReference,
    ) -> StoreResult<Option<SchemaDefinition>> {
        Ok(self.schemas.read().get(class).cloned())
    }
}

/// Answers for one document with the schema it is about to store, and
/// delegates every other class.
///
/// A document whose class has a member typed as its own class resolves
/// against its in-progress schema instead of loading itself. Only this one
/// level is short-circuited.
pub struct OverridingClassProvider<'a> {
    inner: &'a dyn ClassProvider,
    class: &'a DocumentReference,
    schema: Option<&'a SchemaDefinition>,
}

impl<'a> OverridingClassProvider<'a> {
    #[must_use]
    pub fn new(
        inner: &'a dyn ClassProvider,
        class: &'a DocumentReference,
        schema: Option<&'a SchemaDefinition>,
    ) -> Self {
        Self {
            inner,
            class,
            schema,
        }
    }
}

#[async_trait]
impl ClassProvider for OverridingClassProvider<'_> {
    async fn class_schema(
        &self,
        class: &DocumentReference,
    ) -> StoreResult<Option<SchemaDefinition>> {
        if class == self.class {
            if let Some(schema) = self.schema {
                return Ok(Some(schema.clone()));
            }
        }
        self.inner.class_schema(class).await
    }
}
