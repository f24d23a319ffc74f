//! Schema compiler: turns schema definitions into generated record types.
//!
//! Compiling a schema for a type name that already has a version performs a
//! union merge. The merged member set keeps every prior member, adds the
//! new fields, and takes the new kind on a name collision. Members are
//! never dropped, so instances written under an older version stay
//! decodable.
//!
//! New versions are staged per session in [`StagedTypes`] and reach the
//! registry through [`SchemaCompiler::publish`] once that session has
//! committed. A rolled-back session leaves the registry as it was.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, warn};

use dynastore_core::{
    type_name, DocumentReference, PropertyBag, SchemaDefinition, StoreError, StoreResult,
};

use crate::classes::ClassProvider;
use crate::registry::{GeneratedRecordType, TypeRegistry};
use crate::storage::{StoreSession, TYPES_TABLE};

/// Merges `schema` into `prior`, or builds a fresh type if there is none.
///
/// # Errors
///
/// Returns [`StoreError::Corrupt`] if the merged descriptor cannot be
/// encoded.
pub fn merge(
    prior: Option<&GeneratedRecordType>,
    schema: &SchemaDefinition,
) -> StoreResult<GeneratedRecordType> {
    let retained = prior
        .into_iter()
        .flat_map(GeneratedRecordType::members)
        .map(|m| (m.raw_name.clone(), m.kind));
    let declared = schema.fields().map(|f| (f.name.to_string(), f.kind));
    GeneratedRecordType::build(schema.type_name.clone(), retained.chain(declared))
}

/// Record type versions compiled within one session and not yet visible in
/// the registry.
#[derive(Debug, Default)]
pub struct StagedTypes {
    types: IndexMap<String, Arc<GeneratedRecordType>>,
}

impl StagedTypes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, type_name: &str) -> Option<&Arc<GeneratedRecordType>> {
        self.types.get(type_name)
    }

    /// Staged versions, in the order their type names were first staged.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<GeneratedRecordType>> {
        self.types.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Compiles schema definitions against a [`TypeRegistry`].
#[derive(Clone)]
pub struct SchemaCompiler {
    registry: Arc<TypeRegistry>,
}

impl SchemaCompiler {
    #[must_use]
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Compiles `schema` into the current version of its type.
    ///
    /// The current version is the one in `staged`, else the registry's,
    /// else the one stored. It is returned untouched if merging adds
    /// nothing. Otherwise the merged version is added to `staged` and stays
    /// dirty until [`persist`](Self::persist) and
    /// [`publish`](Self::publish) have run.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Corrupt`] if a stored prior version does not decode
    /// - [`StoreError::Io`] if loading the prior version fails
    pub async fn compile(
        &self,
        session: &mut dyn StoreSession,
        staged: &mut StagedTypes,
        schema: &SchemaDefinition,
    ) -> StoreResult<Arc<GeneratedRecordType>> {
        let prior = self.resolve_staged(session, staged, &schema.type_name).await?;
        let next = merge(prior.as_deref(), schema)?;
        if let Some(prior) = prior.filter(|p| p.same_members(&next)) {
            return Ok(prior);
        }
        debug!(type_name = %schema.type_name, members = next.len(), "staging record type");
        let next = Arc::new(next);
        staged
            .types
            .insert(schema.type_name.clone(), Arc::clone(&next));
        Ok(next)
    }

    /// Writes the serialized form of a dirty type into `session`.
    ///
    /// Returns whether anything was written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the session write fails.
    pub async fn persist(
        &self,
        session: &mut dyn StoreSession,
        ty: &GeneratedRecordType,
    ) -> StoreResult<bool> {
        if !ty.is_dirty() {
            return Ok(false);
        }
        session
            .put(TYPES_TABLE, ty.type_name(), ty.serialized_form().to_vec())
            .await?;
        debug!(type_name = %ty.type_name(), "persisting record type");
        Ok(true)
    }

    /// Writes every staged version into `session`. Returns how many were
    /// written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if a session write fails.
    pub async fn persist_staged(
        &self,
        session: &mut dyn StoreSession,
        staged: &StagedTypes,
    ) -> StoreResult<usize> {
        let mut written = 0;
        for ty in staged.iter() {
            if self.persist(session, ty).await? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Installs versions staged and persisted by a committed session into
    /// the registry.
    ///
    /// Each version is merged into whatever the registry holds by then,
    /// running redefinition observers as needed. A published version that
    /// matches its staged form is marked persisted. A version that cannot
    /// be installed is evicted so the next lookup reloads it from the
    /// store.
    pub fn publish(&self, staged: StagedTypes) {
        for ty in staged.types.into_values() {
            let schema = ty.schema();
            match self
                .registry
                .install(ty.type_name(), |current| merge(current, &schema))
            {
                Ok(installed) => {
                    if installed.same_members(&ty) {
                        installed.mark_persisted();
                    }
                }
                Err(err) => {
                    warn!(type_name = %ty.type_name(), error = %err, "failed to publish record type");
                    self.registry.evict(ty.type_name());
                }
            }
        }
    }

    /// Type for an object of `class`, defining or extending it as needed.
    ///
    /// Resolution order: `staged`, the registry (cache, then durable store),
    /// then `classes`, then a schema derived from `bag` itself. Properties of
    /// `bag` that the resolved type lacks are merged in with the kinds they
    /// carry.
    ///
    /// # Errors
    ///
    /// - [`StoreError::MalformedSchema`] if `classes` answers with a schema
    ///   for a different type name
    /// - any error from [`compile`](Self::compile)
    pub async fn compile_for_object(
        &self,
        session: &mut dyn StoreSession,
        staged: &mut StagedTypes,
        class: &DocumentReference,
        bag: &PropertyBag,
        classes: &dyn ClassProvider,
    ) -> StoreResult<Arc<GeneratedRecordType>> {
        let name = type_name(class);
        let ty = match self.resolve_staged(session, staged, &name).await? {
            Some(ty) => ty,
            None => match classes.class_schema(class).await? {
                Some(schema) => {
                    if schema.type_name != name {
                        return Err(StoreError::MalformedSchema {
                            type_name: name,
                            reason: format!("class provider returned schema for {}", schema.type_name),
                        });
                    }
                    self.compile(session, staged, &schema).await?
                }
                None => {
                    debug!(type_name = %name, "defining record type from object properties");
                    let mut schema = SchemaDefinition::from_bag(bag);
                    schema.type_name.clone_from(&name);
                    return self.compile(session, staged, &schema).await;
                }
            },
        };

        let missing = bag
            .properties
            .iter()
            .filter(|(raw, _)| ty.member_by_raw(raw).is_none())
            .fold(SchemaDefinition::new(name), |schema, (raw, value)| {
                schema.with_field(raw.clone(), value.kind())
            });
        if missing.is_empty() {
            return Ok(ty);
        }
        debug!(
            type_name = %missing.type_name,
            added = missing.len(),
            "extending record type with object properties"
        );
        self.compile(session, staged, &missing).await
    }

    /// Current version of `name` for a session. A registry version that
    /// was never persisted is staged so the session writes it.
    async fn resolve_staged(
        &self,
        session: &mut dyn StoreSession,
        staged: &mut StagedTypes,
        name: &str,
    ) -> StoreResult<Option<Arc<GeneratedRecordType>>> {
        if let Some(ty) = staged.get(name) {
            return Ok(Some(Arc::clone(ty)));
        }
        match self.registry.resolve(session, name).await {
            Ok(ty) => {
                if ty.is_dirty() {
                    staged.types.insert(name.to_string(), Arc::clone(&ty));
                }
                Ok(Some(ty))
            }
            Err(StoreError::UnknownType { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use dynastore_core::{Value, ValueKind};

    use super::*;
    use crate::classes::{NoClassProvider, StaticClassProvider};
    use crate::registry::RedefinitionObserver;
    use crate::storage::engines::MemoryStore;
    use crate::storage::DurableStore;

    fn schema(fields: &[(&str, ValueKind)]) -> SchemaDefinition {
        fields.iter().fold(SchemaDefinition::new("xwiki.Main.T"), |s, (n, k)| {
            s.with_field(*n, *k)
        })
    }

    fn kinds(ty: &GeneratedRecordType) -> Vec<(String, ValueKind)> {
        ty.members().map(|m| (m.raw_name.clone(), m.kind)).collect()
    }

    #[derive(Default)]
    struct CountRedefinitions(AtomicUsize);

    impl RedefinitionObserver for CountRedefinitions {
        fn on_redefine(&self, _: &str, _: &GeneratedRecordType, _: &GeneratedRecordType) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn merge_without_prior_uses_schema_fields() {
        let ty = merge(None, &schema(&[("a", ValueKind::Text), ("b", ValueKind::Integer)])).unwrap();
        assert_eq!(
            kinds(&ty),
            vec![
                ("a".to_string(), ValueKind::Text),
                ("b".to_string(), ValueKind::Integer)
            ]
        );
        assert!(ty.is_dirty());
    }

    #[test]
    fn merge_is_a_union_where_new_kinds_win() {
        let prior = merge(None, &schema(&[("a", ValueKind::Text), ("b", ValueKind::Integer)])).unwrap();
        let merged = merge(
            Some(&prior),
            &schema(&[("b", ValueKind::Long), ("c", ValueKind::Date)]),
        )
        .unwrap();
        assert_eq!(
            kinds(&merged),
            vec![
                ("a".to_string(), ValueKind::Text),
                ("b".to_string(), ValueKind::Long),
                ("c".to_string(), ValueKind::Date)
            ]
        );
    }

    #[tokio::test]
    async fn recompiling_after_persist_keeps_old_members() {
        let store = MemoryStore::new();
        let compiler = SchemaCompiler::new(Arc::new(TypeRegistry::default()));

        let mut session = store.begin_session().await.unwrap();
        let mut staged = StagedTypes::new();
        let v1 = compiler
            .compile(
                session.as_mut(),
                &mut staged,
                &schema(&[("a", ValueKind::Text), ("b", ValueKind::Integer)]),
            )
            .await
            .unwrap();
        assert!(compiler.persist(session.as_mut(), &v1).await.unwrap());
        session.commit().await.unwrap();
        compiler.publish(staged);
        assert!(!compiler.registry().get("xwiki.Main.T").unwrap().is_dirty());

        // A fresh process only sees the stored version.
        let compiler = SchemaCompiler::new(Arc::new(TypeRegistry::default()));
        let mut session = store.begin_session().await.unwrap();
        let v2 = compiler
            .compile(
                session.as_mut(),
                &mut StagedTypes::new(),
                &schema(&[("b", ValueKind::Integer), ("c", ValueKind::Date)]),
            )
            .await
            .unwrap();
        for name in ["a", "b", "c"] {
            assert!(v2.member_by_raw(name).is_some(), "missing {name}");
        }
        assert!(v2.is_dirty());
    }

    #[tokio::test]
    async fn staged_versions_stay_out_of_the_registry_until_published() {
        let store = MemoryStore::new();
        let registry = Arc::new(TypeRegistry::default());
        let observer = Arc::new(CountRedefinitions::default());
        registry.register_observer(observer.clone());
        let compiler = SchemaCompiler::new(registry.clone());

        let mut session = store.begin_session().await.unwrap();
        let mut staged = StagedTypes::new();
        compiler
            .compile(session.as_mut(), &mut staged, &schema(&[("a", ValueKind::Text)]))
            .await
            .unwrap();
        let extended = compiler
            .compile(session.as_mut(), &mut staged, &schema(&[("b", ValueKind::Long)]))
            .await
            .unwrap();
        assert_eq!(extended.len(), 2);
        assert_eq!(staged.len(), 1);
        assert!(registry.is_empty());

        // Dropping the stage is what a rolled-back save does.
        drop(staged);
        session.rollback().await;
        assert!(registry.is_empty());
        assert_eq!(observer.0.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn unchanged_schema_is_not_a_redefinition() {
        let store = MemoryStore::new();
        let registry = Arc::new(TypeRegistry::default());
        let observer = Arc::new(CountRedefinitions::default());
        registry.register_observer(observer.clone());
        let compiler = SchemaCompiler::new(registry.clone());

        let mut session = store.begin_session().await.unwrap();
        let mut staged = StagedTypes::new();
        compiler
            .compile(session.as_mut(), &mut staged, &schema(&[("a", ValueKind::Text)]))
            .await
            .unwrap();
        assert_eq!(compiler.persist_staged(session.as_mut(), &staged).await.unwrap(), 1);
        compiler.publish(staged);
        let first = registry.get("xwiki.Main.T").unwrap();

        let mut staged = StagedTypes::new();
        let again = compiler
            .compile(session.as_mut(), &mut staged, &schema(&[("a", ValueKind::Text)]))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(staged.is_empty());
        assert!(!compiler.persist(session.as_mut(), &again).await.unwrap());

        compiler
            .compile(session.as_mut(), &mut staged, &schema(&[("z", ValueKind::Double)]))
            .await
            .unwrap();
        assert_eq!(observer.0.load(Ordering::Relaxed), 0);
        compiler.publish(staged);
        assert_eq!(observer.0.load(Ordering::Relaxed), 1);
        assert!(!registry.is_current(&first));
    }

    #[tokio::test]
    async fn object_of_unknown_class_defines_type_from_properties() {
        let store = MemoryStore::new();
        let compiler = SchemaCompiler::new(Arc::new(TypeRegistry::default()));
        let class = DocumentReference::new("xwiki", ["Main"], "T");
        let bag = PropertyBag::new("xwiki.Main.T")
            .with("title", Value::Text("x".to_string()))
            .with("count", Value::Long(3));

        let mut session = store.begin_session().await.unwrap();
        let ty = compiler
            .compile_for_object(session.as_mut(), &mut StagedTypes::new(), &class, &bag, &NoClassProvider)
            .await
            .unwrap();
        assert_eq!(ty.type_name(), "xwiki.Main.T");
        assert_eq!(ty.member_by_raw("count").map(|m| m.kind), Some(ValueKind::Long));
    }

    #[tokio::test]
    async fn object_of_provided_class_uses_provider_schema() {
        let store = MemoryStore::new();
        let compiler = SchemaCompiler::new(Arc::new(TypeRegistry::default()));
        let class = DocumentReference::new("xwiki", ["Main"], "T");
        let provider = StaticClassProvider::new();
        provider.insert(
            class.clone(),
            schema(&[("title", ValueKind::LongText), ("extra", ValueKind::Date)]),
        );
        let bag = PropertyBag::new("xwiki.Main.T").with("title", Value::LongText("x".to_string()));

        let mut session = store.begin_session().await.unwrap();
        let ty = compiler
            .compile_for_object(session.as_mut(), &mut StagedTypes::new(), &class, &bag, &provider)
            .await
            .unwrap();
        assert_eq!(ty.member_by_raw("title").map(|m| m.kind), Some(ValueKind::LongText));
        assert!(ty.member_by_raw("extra").is_some());
    }

    #[tokio::test]
    async fn object_with_new_property_extends_known_type() {
        let store = MemoryStore::new();
        let compiler = SchemaCompiler::new(Arc::new(TypeRegistry::default()));
        let class = DocumentReference::new("xwiki", ["Main"], "T");

        let mut session = store.begin_session().await.unwrap();
        let mut staged = StagedTypes::new();
        compiler
            .compile(session.as_mut(), &mut staged, &schema(&[("age", ValueKind::Integer)]))
            .await
            .unwrap();
        // Unset numeric value arrives as empty text; the member keeps its kind.
        let bag = PropertyBag::new("xwiki.Main.T")
            .with("age", Value::Text(String::new()))
            .with("nick", Value::Text("bo".to_string()));
        let ty = compiler
            .compile_for_object(session.as_mut(), &mut staged, &class, &bag, &NoClassProvider)
            .await
            .unwrap();
        assert_eq!(ty.member_by_raw("age").map(|m| m.kind), Some(ValueKind::Integer));
        assert_eq!(ty.member_by_raw("nick").map(|m| m.kind), Some(ValueKind::Text));
    }

    #[tokio::test]
    async fn provider_schema_for_wrong_type_is_malformed() {
        let store = MemoryStore::new();
        let compiler = SchemaCompiler::new(Arc::new(TypeRegistry::default()));
        let class = DocumentReference::new("xwiki", ["Main"], "T");
        let provider = StaticClassProvider::new();
        provider.insert(class.clone(), SchemaDefinition::new("xwiki.Main.Other"));

        let mut session = store.begin_session().await.unwrap();
        let err = compiler
            .compile_for_object(
                session.as_mut(),
                &mut StagedTypes::new(),
                &class,
                &PropertyBag::new("xwiki.Main.T"),
                &provider,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MalformedSchema { .. }));
    }
}
