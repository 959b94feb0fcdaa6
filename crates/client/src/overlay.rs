// Server-document overlay.
//
// While a stub's optimistic write is outstanding, the store shows the
// stub's version but the session must keep tracking what the server
// believes. Each overlaid document records the authoritative value (or its
// known absence) and the set of in-flight methods whose stubs wrote it.
// When the last writer resolves, the authoritative value replaces the
// optimistic one in the store.

use std::collections::{HashMap, HashSet};

use tracing::error;

use syncwire_common::types::{merge_document_fields, DocId, Document, MethodId};

use crate::error::ConnectionError;
use crate::quiescence::DeferredAction;

/// Address of a document: collection name plus id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct DocumentKey {
    pub collection: String,
    pub id: DocId,
}

struct ServerDocument {
    /// The server's view of the document. `None` means the server believes
    /// it does not exist.
    authoritative: Option<Document>,
    /// Methods whose stubs wrote this document and whose data-done message
    /// has not yet been processed.
    written_by_stubs: HashSet<MethodId>,
    /// Watchers to notify when this document flushes.
    flush_watchers: Vec<u64>,
}

struct FlushWatcher {
    remaining: usize,
    action: DeferredAction,
}

/// The result of processing one method's data-done notification.
#[derive(Default)]
pub(crate) struct DataDoneOutcome {
    /// Authoritative values to push into the stores, replacing the
    /// optimistic ones. `None` removes the document.
    pub replaces: Vec<(DocumentKey, Option<Document>)>,
    /// Watcher actions whose last pinned document just flushed.
    pub matured: Vec<DeferredAction>,
}

#[derive(Default)]
pub(crate) struct DocumentOverlay {
    documents: HashMap<String, HashMap<DocId, ServerDocument>>,
    written_by_stub: HashMap<MethodId, Vec<DocumentKey>>,
    watchers: HashMap<u64, FlushWatcher>,
    next_watcher: u64,
}

impl DocumentOverlay {
    /// Fold one simulation's per-store originals into the overlay, keyed by
    /// the invoking method.
    pub fn record_stub_writes(
        &mut self,
        method_id: &MethodId,
        originals_by_collection: Vec<(String, HashMap<DocId, Option<Document>>)>,
    ) {
        let mut written = Vec::new();
        for (collection, originals) in originals_by_collection {
            for (id, original) in originals {
                written.push(DocumentKey { collection: collection.clone(), id: id.clone() });
                let doc = self
                    .documents
                    .entry(collection.clone())
                    .or_default()
                    .entry(id)
                    .or_insert_with(|| ServerDocument {
                        authoritative: None,
                        written_by_stubs: HashSet::new(),
                        flush_watchers: Vec::new(),
                    });
                if doc.written_by_stubs.is_empty() {
                    // First stub to touch this document: the pre-write value
                    // is the server's view.
                    doc.authoritative = original;
                }
                doc.written_by_stubs.insert(method_id.clone());
            }
        }
        if written.is_empty() {
            return;
        }
        if self.written_by_stub.insert(method_id.clone(), written).is_some() {
            // Method ids are allocated fresh per invocation.
            error!(%method_id, "stub writes recorded twice for one method");
        }
    }

    /// Absorb a server `added`. Returns the fields back when no overlay
    /// entry exists, meaning the message goes straight to the store.
    pub fn absorb_added(
        &mut self,
        collection: &str,
        id: &DocId,
        fields: Document,
    ) -> Result<Option<Document>, ConnectionError> {
        match self.get_mut(collection, id) {
            Some(doc) => {
                if doc.authoritative.is_some() {
                    return Err(ConnectionError::AddedExistingDocument {
                        collection: collection.to_string(),
                        id: id.clone(),
                    });
                }
                doc.authoritative = Some(fields);
                Ok(None)
            }
            None => Ok(Some(fields)),
        }
    }

    /// Absorb a server `changed` into the overlaid authoritative document,
    /// or return the payload for direct store application.
    pub fn absorb_changed(
        &mut self,
        collection: &str,
        id: &DocId,
        fields: Document,
        cleared: Vec<String>,
    ) -> Result<Option<(Document, Vec<String>)>, ConnectionError> {
        match self.get_mut(collection, id) {
            Some(doc) => match &mut doc.authoritative {
                Some(authoritative) => {
                    merge_document_fields(authoritative, &fields, &cleared);
                    Ok(None)
                }
                None => Err(ConnectionError::ChangedMissingDocument {
                    collection: collection.to_string(),
                    id: id.clone(),
                }),
            },
            None => Ok(Some((fields, cleared))),
        }
    }

    /// Absorb a server `removed`. Returns true when absorbed by an overlay
    /// entry, false when the message goes straight to the store.
    pub fn absorb_removed(
        &mut self,
        collection: &str,
        id: &DocId,
    ) -> Result<bool, ConnectionError> {
        match self.get_mut(collection, id) {
            Some(doc) => {
                if doc.authoritative.is_none() {
                    return Err(ConnectionError::RemovedMissingDocument {
                        collection: collection.to_string(),
                        id: id.clone(),
                    });
                }
                doc.authoritative = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Process a method's data-done notification: drop the method from the
    /// writer set of every document it wrote, flushing documents whose
    /// writer set becomes empty.
    pub fn method_data_done(
        &mut self,
        method_id: &MethodId,
    ) -> Result<DataDoneOutcome, ConnectionError> {
        let written = self.written_by_stub.remove(method_id).unwrap_or_default();
        let mut outcome = DataDoneOutcome::default();

        for key in written {
            let Some(doc) = self.get_mut(&key.collection, &key.id) else {
                return Err(ConnectionError::OverlayRecordLost {
                    collection: key.collection,
                    id: key.id,
                    method_id: method_id.clone(),
                });
            };
            if !doc.written_by_stubs.remove(method_id) {
                return Err(ConnectionError::NotWrittenByMethod {
                    collection: key.collection,
                    id: key.id,
                    method_id: method_id.clone(),
                });
            }
            if !doc.written_by_stubs.is_empty() {
                continue;
            }

            // Last writer resolved: surface the authoritative value and
            // retire the overlay entry.
            let Some(flushed) = self.remove(&key.collection, &key.id) else {
                continue;
            };
            for watcher_id in flushed.flush_watchers {
                let matured = match self.watchers.get_mut(&watcher_id) {
                    Some(watcher) => {
                        watcher.remaining -= 1;
                        watcher.remaining == 0
                    }
                    None => false,
                };
                if matured {
                    if let Some(watcher) = self.watchers.remove(&watcher_id) {
                        outcome.matured.push(watcher.action);
                    }
                }
            }
            outcome.replaces.push((key, flushed.authoritative));
        }

        Ok(outcome)
    }

    /// Defer `action` until every document currently pinned by a
    /// sent-but-unfinished method has flushed. Returns the action back when
    /// nothing is pinned, so the caller can queue it for the next update
    /// cycle directly.
    pub fn schedule_after_flush(
        &mut self,
        action: DeferredAction,
        method_sent: impl Fn(&MethodId) -> bool,
    ) -> Option<DeferredAction> {
        let mut pinned = Vec::new();
        for (collection, docs) in &self.documents {
            for (id, doc) in docs {
                if doc.written_by_stubs.iter().any(|m| method_sent(m)) {
                    pinned.push((collection.clone(), id.clone()));
                }
            }
        }

        if pinned.is_empty() {
            return Some(action);
        }

        let watcher_id = self.next_watcher;
        self.next_watcher += 1;
        self.watchers.insert(watcher_id, FlushWatcher { remaining: pinned.len(), action });
        for (collection, id) in pinned {
            if let Some(doc) = self.get_mut(&collection, &id) {
                doc.flush_watchers.push(watcher_id);
            }
        }
        None
    }

    /// Forget everything. Used when a reconnect resets all stores: the
    /// stubs' effects are moot because every collection is about to be
    /// rebuilt from scratch.
    pub fn clear(&mut self) {
        self.documents.clear();
        self.written_by_stub.clear();
        self.watchers.clear();
    }

    fn get_mut(&mut self, collection: &str, id: &DocId) -> Option<&mut ServerDocument> {
        self.documents.get_mut(collection)?.get_mut(id)
    }

    fn remove(&mut self, collection: &str, id: &DocId) -> Option<ServerDocument> {
        // Empty per-collection maps are left in place; there are few
        // collections and they are written repeatedly.
        self.documents.get_mut(collection)?.remove(id)
    }
}
