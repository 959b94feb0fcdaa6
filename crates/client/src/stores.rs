// Store registry: routes data messages to pluggable per-collection sinks.
//
// A store that arrives late still sees everything: updates for collections
// with no registered sink are buffered and replayed at registration time.

use std::collections::{BTreeMap, HashMap};

use syncwire_common::types::{DocId, Document};

/// A mutation applied to a single document in a store.
///
/// `Replace` never appears on the wire: it is how the overlay hands a store
/// the authoritative document once every writing method has resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreUpdate {
    Added { id: DocId, fields: Document },
    Changed { id: DocId, fields: Document, cleared: Vec<String> },
    Removed { id: DocId },
    Replace { id: DocId, document: Option<Document> },
}

/// Mutation sink for one collection.
///
/// Every method has a no-op default body, so a sink only implements what it
/// cares about.
pub trait Store {
    /// Start a transactional batch of `batch_size` updates. `reset` means
    /// all previously known documents must be dropped first.
    fn begin_update(&mut self, _batch_size: usize, _reset: bool) {}

    fn update(&mut self, _update: &StoreUpdate) {}

    fn end_update(&mut self) {}

    /// Start tracking pre-write versions of documents, for stub simulation.
    fn save_originals(&mut self) {}

    /// Stop tracking and return the pre-write versions of every document
    /// written since `save_originals`. `None` means the document did not
    /// exist before the write.
    fn retrieve_originals(&mut self) -> HashMap<DocId, Option<Document>> {
        HashMap::new()
    }
}

/// Named stores plus the buffer for collections nobody listens to yet.
#[derive(Default)]
pub struct StoreRegistry {
    stores: BTreeMap<String, Box<dyn Store>>,
    pending_unknown: BTreeMap<String, Vec<StoreUpdate>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink for `name`. Returns false if one is already
    /// registered. Buffered updates for the collection are replayed
    /// immediately as a single batch.
    pub fn register(&mut self, name: String, store: Box<dyn Store>) -> bool {
        if self.stores.contains_key(&name) {
            return false;
        }
        let mut store = store;
        if let Some(queued) = self.pending_unknown.remove(&name) {
            store.begin_update(queued.len(), false);
            for update in &queued {
                store.update(update);
            }
            store.end_update();
        }
        self.stores.insert(name, store);
        true
    }

    pub fn save_originals_all(&mut self) {
        for store in self.stores.values_mut() {
            store.save_originals();
        }
    }

    pub fn retrieve_originals_all(&mut self) -> Vec<(String, HashMap<DocId, Option<Document>>)> {
        self.stores
            .iter_mut()
            .map(|(name, store)| (name.clone(), store.retrieve_originals()))
            .collect()
    }

    /// Apply one transactional batch across all stores. Every registered
    /// store sees begin/end even when it has no updates, so resets reach
    /// every collection.
    pub fn apply_updates(&mut self, updates: BTreeMap<String, Vec<StoreUpdate>>, reset: bool) {
        for (name, store) in &mut self.stores {
            let batch_size = updates.get(name).map_or(0, Vec::len);
            store.begin_update(batch_size, reset);
        }

        for (name, batch) in updates {
            match self.stores.get_mut(&name) {
                Some(store) => {
                    for update in &batch {
                        store.update(update);
                    }
                }
                None => {
                    // Nobody is listening for this collection yet; hold the
                    // updates until a store registers.
                    self.pending_unknown.entry(name).or_default().extend(batch);
                }
            }
        }

        for store in self.stores.values_mut() {
            store.end_update();
        }
    }

    /// Drop all local document state, as an empty reset batch.
    pub fn reset_all(&mut self) {
        self.apply_updates(BTreeMap::new(), true);
    }

    pub fn clear_pending_unknown(&mut self) {
        self.pending_unknown.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Begin(usize, bool),
        Update(StoreUpdate),
        End,
    }

    #[derive(Default)]
    struct RecordingStore {
        events: Rc<RefCell<Vec<Event>>>,
    }

    impl Store for RecordingStore {
        fn begin_update(&mut self, batch_size: usize, reset: bool) {
            self.events.borrow_mut().push(Event::Begin(batch_size, reset));
        }

        fn update(&mut self, update: &StoreUpdate) {
            self.events.borrow_mut().push(Event::Update(update.clone()));
        }

        fn end_update(&mut self) {
            self.events.borrow_mut().push(Event::End);
        }
    }

    fn added(id: &str) -> StoreUpdate {
        let mut fields = Document::new();
        fields.insert("x".into(), json!(1));
        StoreUpdate::Added { id: DocId::from(id), fields }
    }

    #[test]
    fn register_rejects_duplicates() {
        let mut registry = StoreRegistry::new();
        assert!(registry.register("tasks".into(), Box::new(RecordingStore::default())));
        assert!(!registry.register("tasks".into(), Box::new(RecordingStore::default())));
    }

    #[test]
    fn updates_for_unknown_collection_replay_on_registration() {
        let mut registry = StoreRegistry::new();

        let mut updates = BTreeMap::new();
        updates.insert("tasks".to_string(), vec![added("t1"), added("t2")]);
        registry.apply_updates(updates, false);

        let events = Rc::new(RefCell::new(Vec::new()));
        let store = RecordingStore { events: Rc::clone(&events) };
        assert!(registry.register("tasks".into(), Box::new(store)));

        let seen = events.borrow();
        assert_eq!(seen[0], Event::Begin(2, false));
        assert_eq!(seen[1], Event::Update(added("t1")));
        assert_eq!(seen[2], Event::Update(added("t2")));
        assert_eq!(seen[3], Event::End);
    }

    #[test]
    fn reset_reaches_stores_with_no_updates() {
        let mut registry = StoreRegistry::new();
        let events = Rc::new(RefCell::new(Vec::new()));
        registry.register("tasks".into(), Box::new(RecordingStore { events: Rc::clone(&events) }));

        registry.reset_all();

        assert_eq!(*events.borrow(), vec![Event::Begin(0, true), Event::End]);
    }

    #[test]
    fn clearing_pending_drops_buffered_updates() {
        let mut registry = StoreRegistry::new();
        let mut updates = BTreeMap::new();
        updates.insert("tasks".to_string(), vec![added("t1")]);
        registry.apply_updates(updates, false);

        registry.clear_pending_unknown();

        let events = Rc::new(RefCell::new(Vec::new()));
        registry.register("tasks".into(), Box::new(RecordingStore { events: Rc::clone(&events) }));
        assert!(events.borrow().is_empty());
    }

    #[test]
    fn default_store_methods_are_no_ops() {
        struct Inert;
        impl Store for Inert {}

        let mut registry = StoreRegistry::new();
        registry.register("inert".into(), Box::new(Inert));
        registry.save_originals_all();
        let originals = registry.retrieve_originals_all();
        assert_eq!(originals.len(), 1);
        assert!(originals[0].1.is_empty());
        registry.reset_all();
    }
}
