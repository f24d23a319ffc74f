//! Fully wired engine.
//!
//! [`Engine`] is the dependency injection point: it validates an
//! [`EngineConfig`] and connects one [`TypeRegistry`], the
//! [`SchemaCompiler`] over it, a [`ChunkedBlobStore`], a
//! [`DocumentStore`] and a [`LinkAndLockStore`] to a shared
//! [`DurableStore`].

use std::sync::Arc;

use tracing::info;

use dynastore_core::StoreResult;

use crate::attachment::AttachmentContentStore;
use crate::blob::{BlobStore, ChunkedBlobStore};
use crate::classes::{ClassProvider, NoClassProvider};
use crate::compiler::SchemaCompiler;
use crate::config::EngineConfig;
use crate::document::links::LinkAndLockStore;
use crate::document::DocumentStore;
use crate::registry::TypeRegistry;
use crate::storage::engines::MemoryStore;
use crate::storage::DurableStore;

/// Registry, compiler, blob store and document store sharing one durable
/// store.
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn DurableStore>,
    compiler: SchemaCompiler,
    blobs: Arc<ChunkedBlobStore>,
    documents: DocumentStore,
    links: LinkAndLockStore,
}

impl Engine {
    /// Wires an engine over `store`, resolving unregistered classes through
    /// `classes`.
    ///
    /// # Errors
    ///
    /// Returns [`dynastore_core::StoreError::MalformedSchema`] if `config`
    /// does not validate.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn DurableStore>,
        classes: Arc<dyn ClassProvider>,
    ) -> StoreResult<Self> {
        config.validate()?;
        let engine = Self::wire(config, store, classes);
        info!(
            chunk_size = engine.config.blob.chunk_size,
            max_cached_types = engine.config.registry.max_cached_types,
            document_cache = engine.config.document.cache_capacity,
            "engine ready"
        );
        Ok(engine)
    }

    /// Engine over a fresh [`MemoryStore`] with no class provider.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn in_memory(config: EngineConfig) -> StoreResult<Self> {
        Self::new(config, Arc::new(MemoryStore::new()), Arc::new(NoClassProvider))
    }

    fn wire(
        config: EngineConfig,
        store: Arc<dyn DurableStore>,
        classes: Arc<dyn ClassProvider>,
    ) -> Self {
        let compiler = SchemaCompiler::new(Arc::new(TypeRegistry::new(config.registry.clone())));
        let blobs = Arc::new(ChunkedBlobStore::new(Arc::clone(&store), &config.blob));
        let documents = DocumentStore::new(
            Arc::clone(&store),
            compiler.clone(),
            classes,
            AttachmentContentStore::new(blobs.clone()),
            &config.document,
        );
        let links = LinkAndLockStore::new(Arc::clone(&store));
        Self {
            config,
            store,
            compiler,
            blobs,
            documents,
            links,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        self.compiler.registry()
    }

    #[must_use]
    pub fn compiler(&self) -> &SchemaCompiler {
        &self.compiler
    }

    /// The chunked blob store, for session-scoped calls.
    #[must_use]
    pub fn chunked_blobs(&self) -> &Arc<ChunkedBlobStore> {
        &self.blobs
    }

    #[must_use]
    pub fn blobs(&self) -> Arc<dyn BlobStore> {
        self.blobs.clone()
    }

    #[must_use]
    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    #[must_use]
    pub fn links(&self) -> &LinkAndLockStore {
        &self.links
    }
}
