//! Redefinition observer trait and composite implementation.
//!
//! Defines [`RedefinitionObserver`] for reacting to a record type being
//! replaced or dropped from the [`TypeRegistry`](super::TypeRegistry), and
//! [`CompositeRedefinitionObserver`] which fans out notifications to
//! multiple observers.

use std::sync::Arc;

use super::record_type::GeneratedRecordType;

/// Observer for changes to registered record types.
///
/// Callbacks run synchronously on the thread that changed the registry,
/// after it released its locks. They may read, install, evict or register
/// observers.
///
/// Used as `Arc<dyn RedefinitionObserver>`.
pub trait RedefinitionObserver: Send + Sync {
    /// Called before `next` replaces `previous`. `type_name` stays resolvable
    /// to `previous` until every observer has returned.
    fn on_redefine(
        &self,
        type_name: &str,
        previous: &GeneratedRecordType,
        next: &GeneratedRecordType,
    );

    /// Called after a type is evicted from the cache.
    fn on_evict(&self, _type_name: &str) {}

    /// Called after the whole cache is cleared.
    fn on_clear(&self) {}
}

/// Composite observer that fans out to multiple observers.
#[derive(Clone, Default)]
pub struct CompositeRedefinitionObserver {
    observers: Vec<Arc<dyn RedefinitionObserver>>,
}

impl CompositeRedefinitionObserver {
    /// Creates a composite observer with the given list of observers.
    #[must_use]
    pub fn new(observers: Vec<Arc<dyn RedefinitionObserver>>) -> Self {
        Self { observers }
    }

    /// Adds an observer after construction.
    pub fn add(&mut self, observer: Arc<dyn RedefinitionObserver>) {
        self.observers.push(observer);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl RedefinitionObserver for CompositeRedefinitionObserver {
    fn on_redefine(
        &self,
        type_name: &str,
        previous: &GeneratedRecordType,
        next: &GeneratedRecordType,
    ) {
        for observer in &self.observers {
            observer.on_redefine(type_name, previous, next);
        }
    }

    fn on_evict(&self, type_name: &str) {
        for observer in &self.observers {
            observer.on_evict(type_name);
        }
    }

    fn on_clear(&self) {
        for observer in &self.observers {
            observer.on_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use dynastore_core::ValueKind;

    use super::*;

    #[derive(Default)]
    struct Counting {
        redefined: AtomicUsize,
        evicted: AtomicUsize,
        cleared: AtomicUsize,
    }

    impl RedefinitionObserver for Counting {
        fn on_redefine(&self, _: &str, _: &GeneratedRecordType, _: &GeneratedRecordType) {
            self.redefined.fetch_add(1, Ordering::Relaxed);
        }

        fn on_evict(&self, _: &str) {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }

        fn on_clear(&self) {
            self.cleared.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn composite_fans_out_to_all_observers() {
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());
        let mut composite = CompositeRedefinitionObserver::new(vec![first.clone()]);
        composite.add(second.clone());
        assert_eq!(composite.len(), 2);

        let old = GeneratedRecordType::build("T", [("a".to_string(), ValueKind::Text)]).unwrap();
        let new = GeneratedRecordType::build("T", [("b".to_string(), ValueKind::Text)]).unwrap();
        composite.on_redefine("T", &old, &new);
        composite.on_evict("T");
        composite.on_clear();

        for observer in [&first, &second] {
            assert_eq!(observer.redefined.load(Ordering::Relaxed), 1);
            assert_eq!(observer.evicted.load(Ordering::Relaxed), 1);
            assert_eq!(observer.cleared.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn empty_composite_is_a_no_op() {
        let composite = CompositeRedefinitionObserver::default();
        assert!(composite.is_empty());
        composite.on_clear();
    }
}
