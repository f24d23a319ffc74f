//! Process-wide registry of generated record types.
//!
//! Lookups of cached types read an immutable snapshot through [`ArcSwap`]
//! and take no lock. Registration, redefinition and eviction are serialized
//! by one mutex and publish a new snapshot when done. Observers are called
//! after that mutex is released.
//!
//! Every installed version gets a fresh generation number. A reader holding
//! an `Arc<GeneratedRecordType>` checks [`TypeRegistry::is_current`] before
//! reusing it across operations; a redefined or evicted type is no longer
//! current.

pub mod observer;
pub mod record_type;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use dynastore_core::{StoreError, StoreResult};

use crate::config::RegistryConfig;
use crate::storage::{StoreSession, TYPES_TABLE};

pub use observer::{CompositeRedefinitionObserver, RedefinitionObserver};
pub use record_type::{GeneratedRecordType, Member, TypeHandle};

type Snapshot = HashMap<String, Arc<GeneratedRecordType>>;

#[derive(Default)]
struct RegistryState {
    next_generation: u64,
    /// Cached type names, oldest registration first.
    order: VecDeque<String>,
}

/// Cache and loader of [`GeneratedRecordType`]s keyed by type name.
pub struct TypeRegistry {
    config: RegistryConfig,
    entries: ArcSwap<Snapshot>,
    state: Mutex<RegistryState>,
    observers: RwLock<CompositeRedefinitionObserver>,
}

impl TypeRegistry {
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            entries: ArcSwap::from_pointee(Snapshot::new()),
            state: Mutex::new(RegistryState {
                next_generation: 1,
                order: VecDeque::new(),
            }),
            observers: RwLock::new(CompositeRedefinitionObserver::default()),
        }
    }

    /// Cached type, without touching the durable store.
    #[must_use]
    pub fn get(&self, type_name: &str) -> Option<Arc<GeneratedRecordType>> {
        self.entries.load().get(type_name).cloned()
    }

    /// Cached type, or the persisted one loaded through `session`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::UnknownType`] if the type is neither cached nor stored
    /// - [`StoreError::Corrupt`] if the stored descriptor does not decode
    /// - [`StoreError::Io`] if the session read fails
    pub async fn resolve(
        &self,
        session: &mut dyn StoreSession,
        type_name: &str,
    ) -> StoreResult<Arc<GeneratedRecordType>> {
        if let Some(ty) = self.get(type_name) {
            return Ok(ty);
        }
        let ty = Self::load_from(session, type_name).await?;
        debug!(type_name = %type_name, members = ty.len(), "loaded record type from store");
        Ok(self.register_loaded(ty))
    }

    /// Stored version of `type_name` as `session` sees it, including the
    /// session's own uncommitted writes. Nothing is cached.
    ///
    /// # Errors
    ///
    /// See [`resolve`](Self::resolve).
    pub async fn load_from(
        session: &mut dyn StoreSession,
        type_name: &str,
    ) -> StoreResult<GeneratedRecordType> {
        let Some(bytes) = session.get(TYPES_TABLE, type_name).await? else {
            return Err(StoreError::unknown_type(type_name));
        };
        GeneratedRecordType::from_serialized(type_name, &bytes)
    }

    /// Caches a type read from the durable store. If another caller cached
    /// the same name first, that entry wins and is returned.
    pub fn register_loaded(&self, ty: GeneratedRecordType) -> Arc<GeneratedRecordType> {
        let mut state = self.state.lock();
        if let Some(existing) = self.get(ty.type_name()) {
            return existing;
        }
        let ty = Arc::new(ty.with_handle(state.next_generation));
        state.next_generation += 1;
        self.publish(&mut state, Arc::clone(&ty));
        let evicted = self.enforce_capacity(&mut state);
        drop(state);
        self.notify_evicted(&evicted);
        ty
    }

    /// Installs the version produced by `build` for `type_name`.
    ///
    /// `build` receives the currently cached version. If the built version
    /// declares the same members, the cached one is kept and returned.
    /// Otherwise observers are notified and the new version replaces it
    /// under a fresh generation. Observers run without any registry lock
    /// held; if the entry changed meanwhile, `build` runs again against the
    /// newer version.
    ///
    /// # Errors
    ///
    /// Propagates any error from `build`; the registry is unchanged then.
    pub fn install(
        &self,
        type_name: &str,
        build: impl Fn(Option<&GeneratedRecordType>) -> StoreResult<GeneratedRecordType>,
    ) -> StoreResult<Arc<GeneratedRecordType>> {
        loop {
            let current = self.get(type_name);
            let next = build(current.as_deref())?;

            if let Some(current) = &current {
                if current.same_members(&next) {
                    return Ok(Arc::clone(current));
                }
                debug!(
                    type_name = %type_name,
                    previous = current.len(),
                    next = next.len(),
                    "redefining record type"
                );
                self.observers().on_redefine(type_name, current, &next);
            } else {
                debug!(type_name = %type_name, members = next.len(), "defining record type");
            }

            let mut state = self.state.lock();
            let unchanged = match (&current, self.get(type_name)) {
                (Some(expected), Some(cached)) => Arc::ptr_eq(expected, &cached),
                (None, None) => true,
                _ => false,
            };
            if !unchanged {
                drop(state);
                debug!(type_name = %type_name, "record type changed while notifying, retrying");
                continue;
            }
            let next = Arc::new(next.with_handle(state.next_generation));
            state.next_generation += 1;
            self.publish(&mut state, Arc::clone(&next));
            let evicted = self.enforce_capacity(&mut state);
            drop(state);
            self.notify_evicted(&evicted);
            return Ok(next);
        }
    }

    /// Adds an observer for redefinitions and evictions. Observers live as
    /// long as the registry.
    pub fn register_observer(&self, observer: Arc<dyn RedefinitionObserver>) {
        self.observers.write().add(observer);
    }

    /// Generation of the cached version of `type_name`.
    #[must_use]
    pub fn generation(&self, type_name: &str) -> Option<u64> {
        self.entries
            .load()
            .get(type_name)
            .and_then(|ty| ty.handle())
            .map(|h| h.generation)
    }

    /// Whether `ty` is still the cached version of its type name.
    #[must_use]
    pub fn is_current(&self, ty: &GeneratedRecordType) -> bool {
        match ty.handle() {
            Some(handle) => self.generation(ty.type_name()) == Some(handle.generation),
            None => false,
        }
    }

    /// Drops `type_name` from the cache. It is reloaded from the durable
    /// store on next use.
    pub fn evict(&self, type_name: &str) -> bool {
        let mut state = self.state.lock();
        let Some(ty) = self.get(type_name) else {
            return false;
        };
        if ty.is_dirty() {
            warn!(type_name = %type_name, "evicting record type that was never persisted");
        }
        self.unpublish(&mut state, type_name);
        drop(state);
        self.observers().on_evict(type_name);
        true
    }

    /// Drops every cached type.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.order.clear();
        self.entries.store(Arc::new(Snapshot::new()));
        drop(state);
        self.observers().on_clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    fn publish(&self, state: &mut RegistryState, ty: Arc<GeneratedRecordType>) {
        let name = ty.type_name().to_string();
        let mut next = Snapshot::clone(&self.entries.load());
        next.insert(name.clone(), ty);
        self.entries.store(Arc::new(next));
        state.order.retain(|n| *n != name);
        state.order.push_back(name);
    }

    fn unpublish(&self, state: &mut RegistryState, type_name: &str) {
        let mut next = Snapshot::clone(&self.entries.load());
        next.remove(type_name);
        self.entries.store(Arc::new(next));
        state.order.retain(|n| n != type_name);
    }

    /// Observers registered so far, detached from the registry's lock.
    fn observers(&self) -> CompositeRedefinitionObserver {
        self.observers.read().clone()
    }

    fn notify_evicted(&self, evicted: &[String]) {
        if evicted.is_empty() {
            return;
        }
        let observers = self.observers();
        for type_name in evicted {
            observers.on_evict(type_name);
        }
    }

    /// Evicts clean entries, oldest first, until the cache fits. Dirty
    /// entries are never evicted here. Returns the evicted names; the
    /// caller notifies observers once the state lock is released.
    fn enforce_capacity(&self, state: &mut RegistryState) -> Vec<String> {
        let max = self.config.max_cached_types;
        let mut evicted = Vec::new();
        if max == 0 {
            return evicted;
        }
        while self.len() > max {
            let snapshot = self.entries.load();
            let victim = state
                .order
                .iter()
                .find(|name| snapshot.get(*name).is_some_and(|ty| !ty.is_dirty()))
                .cloned();
            let Some(victim) = victim else {
                warn!(
                    cached = snapshot.len(),
                    max, "type cache over capacity with only unpersisted entries"
                );
                break;
            };
            drop(snapshot);
            debug!(type_name = %victim, "evicting record type from cache");
            self.unpublish(state, &victim);
            evicted.push(victim);
        }
        evicted
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use dynastore_core::ValueKind;

    use super::*;
    use crate::storage::engines::MemoryStore;
    use crate::storage::DurableStore;

    fn build(name: &str, fields: &[(&str, ValueKind)]) -> GeneratedRecordType {
        GeneratedRecordType::build(name, fields.iter().map(|(n, k)| ((*n).to_string(), *k)))
            .unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        redefined: parking_lot::Mutex<Vec<String>>,
        evicted: AtomicUsize,
    }

    impl RedefinitionObserver for Recorder {
        fn on_redefine(&self, type_name: &str, _: &GeneratedRecordType, _: &GeneratedRecordType) {
            self.redefined.lock().push(type_name.to_string());
        }

        fn on_evict(&self, _: &str) {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn resolve_unknown_type_fails() {
        let registry = TypeRegistry::default();
        let store = MemoryStore::new();
        let mut session = store.begin_session().await.unwrap();
        let err = registry
            .resolve(session.as_mut(), "xwiki.Main.Missing")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownType { ref type_name } if type_name == "xwiki.Main.Missing"));
    }

    #[tokio::test]
    async fn resolve_loads_persisted_type_and_caches_it() {
        let store = MemoryStore::new();
        let ty = build("w.S.C", &[("a", ValueKind::Text)]);
        let mut session = store.begin_session().await.unwrap();
        session
            .put(TYPES_TABLE, "w.S.C", ty.serialized_form().to_vec())
            .await
            .unwrap();
        session.commit().await.unwrap();

        let registry = TypeRegistry::default();
        let mut session = store.begin_session().await.unwrap();
        let loaded = registry.resolve(session.as_mut(), "w.S.C").await.unwrap();
        assert!(loaded.is_loaded());
        assert!(!loaded.is_dirty());
        assert!(registry.is_current(&loaded));
        assert!(Arc::ptr_eq(&loaded, &registry.get("w.S.C").unwrap()));
    }

    #[test]
    fn install_identical_members_keeps_existing_version() {
        let registry = TypeRegistry::default();
        let recorder = Arc::new(Recorder::default());
        registry.register_observer(recorder.clone());

        let first = registry
            .install("T", |_| Ok(build("T", &[("a", ValueKind::Text)])))
            .unwrap();
        let second = registry
            .install("T", |_| Ok(build("T", &[("a", ValueKind::Text)])))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(recorder.redefined.lock().is_empty());
    }

    #[test]
    fn redefinition_notifies_before_replacing() {
        struct SeesPrevious {
            registry: std::sync::Weak<TypeRegistry>,
            saw_previous: AtomicUsize,
        }
        impl RedefinitionObserver for SeesPrevious {
            fn on_redefine(&self, name: &str, previous: &GeneratedRecordType, _: &GeneratedRecordType) {
                let registry = self.registry.upgrade().unwrap();
                let cached = registry.get(name).unwrap();
                if cached.handle() == previous.handle() {
                    self.saw_previous.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let registry = Arc::new(TypeRegistry::default());
        let observer = Arc::new(SeesPrevious {
            registry: Arc::downgrade(&registry),
            saw_previous: AtomicUsize::new(0),
        });
        registry.register_observer(observer.clone());

        let v1 = registry
            .install("T", |_| Ok(build("T", &[("a", ValueKind::Text)])))
            .unwrap();
        let v2 = registry
            .install("T", |_| Ok(build("T", &[("b", ValueKind::Text)])))
            .unwrap();

        assert_eq!(observer.saw_previous.load(Ordering::Relaxed), 1);
        assert!(!registry.is_current(&v1));
        assert!(registry.is_current(&v2));
        assert!(registry.generation("T").unwrap() > v1.handle().unwrap().generation);
    }

    #[test]
    fn build_error_leaves_registry_unchanged() {
        let registry = TypeRegistry::default();
        let err = registry
            .install("T", |_| Err(StoreError::unknown_type("T")))
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownType { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn observers_may_call_back_into_the_registry() {
        struct Reentrant {
            registry: std::sync::Weak<TypeRegistry>,
            calls: AtomicUsize,
        }
        impl RedefinitionObserver for Reentrant {
            fn on_redefine(&self, name: &str, _: &GeneratedRecordType, _: &GeneratedRecordType) {
                let registry = self.registry.upgrade().unwrap();
                if name == "T" {
                    registry
                        .install("U", |_| Ok(build("U", &[("u", ValueKind::Text)])))
                        .unwrap();
                    registry.evict("V");
                    registry.register_observer(Arc::new(Recorder::default()));
                }
                self.calls.fetch_add(1, Ordering::Relaxed);
            }

            fn on_evict(&self, name: &str) {
                let registry = self.registry.upgrade().unwrap();
                assert!(registry.get(name).is_none());
            }
        }

        let registry = Arc::new(TypeRegistry::default());
        let observer = Arc::new(Reentrant {
            registry: Arc::downgrade(&registry),
            calls: AtomicUsize::new(0),
        });
        registry.register_observer(observer.clone());
        registry.register_loaded(build("V", &[]));

        registry
            .install("T", |_| Ok(build("T", &[("a", ValueKind::Text)])))
            .unwrap();
        let v2 = registry
            .install("T", |_| Ok(build("T", &[("b", ValueKind::Text)])))
            .unwrap();

        assert_eq!(observer.calls.load(Ordering::Relaxed), 1);
        assert!(registry.is_current(&v2));
        assert!(registry.get("U").is_some());
        assert!(registry.get("V").is_none());
    }

    #[test]
    fn redefinition_during_notification_is_merged_on_retry() {
        struct Interloper {
            registry: std::sync::Weak<TypeRegistry>,
            fired: std::sync::atomic::AtomicBool,
        }
        impl RedefinitionObserver for Interloper {
            fn on_redefine(&self, _: &str, _: &GeneratedRecordType, _: &GeneratedRecordType) {
                if !self.fired.swap(true, Ordering::SeqCst) {
                    let registry = self.registry.upgrade().unwrap();
                    registry
                        .install("T", |current| {
                            let mut fields: Vec<_> =
                                current.unwrap().members().map(|m| (m.raw_name.clone(), m.kind)).collect();
                            fields.push(("other".to_string(), ValueKind::Long));
                            GeneratedRecordType::build("T", fields)
                        })
                        .unwrap();
                }
            }
        }

        let registry = Arc::new(TypeRegistry::default());
        registry
            .install("T", |_| Ok(build("T", &[("a", ValueKind::Text)])))
            .unwrap();
        registry.register_observer(Arc::new(Interloper {
            registry: Arc::downgrade(&registry),
            fired: std::sync::atomic::AtomicBool::new(false),
        }));

        let merged = registry
            .install("T", |current| {
                let mut fields: Vec<_> =
                    current.unwrap().members().map(|m| (m.raw_name.clone(), m.kind)).collect();
                fields.push(("mine".to_string(), ValueKind::Text));
                GeneratedRecordType::build("T", fields)
            })
            .unwrap();

        let names: Vec<&str> = merged.members().map(|m| m.raw_name.as_str()).collect();
        assert_eq!(names, vec!["a", "other", "mine"]);
        assert!(registry.is_current(&merged));
    }

    #[tokio::test]
    async fn load_from_reads_without_caching() {
        let store = MemoryStore::new();
        let ty = build("w.S.C", &[("a", ValueKind::Text)]);
        let mut session = store.begin_session().await.unwrap();
        session
            .put(TYPES_TABLE, "w.S.C", ty.serialized_form().to_vec())
            .await
            .unwrap();

        let registry = TypeRegistry::default();
        let loaded = TypeRegistry::load_from(session.as_mut(), "w.S.C").await.unwrap();
        assert!(loaded.same_members(&ty));
        assert!(registry.is_empty());
    }

    #[test]
    fn capacity_evicts_oldest_clean_entries() {
        let registry = TypeRegistry::new(RegistryConfig {
            max_cached_types: 2,
        });
        let recorder = Arc::new(Recorder::default());
        registry.register_observer(recorder.clone());

        let dirty = registry.register_loaded(build("A", &[("x", ValueKind::Text)]));
        // Loaded types are clean; make this one look unpersisted.
        dirty.mark_dirty();
        registry.register_loaded(build("B", &[("x", ValueKind::Text)]));
        registry.register_loaded(build("C", &[("x", ValueKind::Text)]));

        assert_eq!(registry.len(), 2);
        assert!(registry.get("A").is_some());
        assert!(registry.get("B").is_none());
        assert!(registry.get("C").is_some());
        assert_eq!(recorder.evicted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn evict_and_clear() {
        let registry = TypeRegistry::default();
        registry.register_loaded(build("A", &[]));
        registry.register_loaded(build("B", &[]));
        assert!(registry.evict("A"));
        assert!(!registry.evict("A"));
        assert_eq!(registry.len(), 1);
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.generation("B"), None);
    }

    #[test]
    fn register_loaded_keeps_first_entry() {
        let registry = TypeRegistry::default();
        let first = registry.register_loaded(build("A", &[("x", ValueKind::Text)]));
        let second = registry.register_loaded(build("A", &[("y", ValueKind::Text)]));
        assert!(Arc::ptr_eq(&first, &second));
    }
}
