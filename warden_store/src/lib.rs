// SPDX-License-Identifier: MIT OR Apache-2.0
//! Embedded transactional document store.
//!
//! Collections of JSON documents with per-document revision numbers,
//! multi-document transactions, and a committed-change broadcast stream.
//!
//! Mutations are expressed as pure builders: a closure reads the current
//! state and returns an op list plus commit-time preconditions. The store
//! validates everything under the commit lock and applies atomically; an
//! assertion failure aborts the attempt and the builder runs again against
//! fresh state, up to a bounded number of attempts.
//!
//! Clone creates a shared handle to the same underlying storage.

mod error;
mod stream;
mod txn;

pub use error::{Result, StoreError};
pub use stream::{ChangeBatch, ChangeKind, DocChange};
pub use txn::{Op, Precondition, Txn, TxnOutcome};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

/// A stored document: a flat JSON object.
pub type Document = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone)]
struct VersionedDoc {
    revno: u64,
    doc: Document,
}

#[derive(Default)]
struct State {
    collections: HashMap<String, HashMap<String, VersionedDoc>>,
    seq: u64,
}

/// Tunables for a [`DocStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Broadcast buffer per change-stream subscriber.
    pub event_capacity: usize,
    /// Attempts before a contended transaction gives up with
    /// [`StoreError::Conflict`].
    pub max_txn_attempts: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            max_txn_attempts: 5,
        }
    }
}

struct Inner {
    state: RwLock<State>,
    events: broadcast::Sender<ChangeBatch>,
    hooks: Mutex<VecDeque<Box<dyn FnOnce() + Send>>>,
    /// True while a hook runs, so transactions the hook itself performs do
    /// not consume further queued hooks.
    hook_running: AtomicBool,
    config: StoreConfig,
}

/// Handle to an embedded document store.
#[derive(Clone)]
pub struct DocStore {
    inner: Arc<Inner>,
}

impl Default for DocStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of store state, handed to transaction builders and
/// commit-time checks. All reads through one reader observe a single
/// consistent state.
pub struct StoreReader<'a> {
    state: &'a State,
}

impl StoreReader<'_> {
    /// Returns a clone of the document, or `None` if absent.
    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.state
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|v| v.doc.clone())
    }

    pub fn exists(&self, collection: &str, id: &str) -> bool {
        self.revno(collection, id).is_some()
    }

    /// Current revision number of the document, if present.
    pub fn revno(&self, collection: &str, id: &str) -> Option<u64> {
        self.state
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|v| v.revno)
    }

    /// All `(id, doc)` pairs whose id starts with `prefix`, sorted by id.
    pub fn scan(&self, collection: &str, prefix: &str) -> Vec<(String, Document)> {
        let mut rows: Vec<(String, Document)> = self
            .state
            .collections
            .get(collection)
            .map(|c| {
                c.iter()
                    .filter(|(id, _)| id.starts_with(prefix))
                    .map(|(id, v)| (id.clone(), v.doc.clone()))
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    pub fn count(&self, collection: &str) -> usize {
        self.state
            .collections
            .get(collection)
            .map_or(0, HashMap::len)
    }
}

enum ApplyResult<E> {
    Committed,
    Transient(String),
    Terminal(E),
}

impl DocStore {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                events,
                hooks: Mutex::new(VecDeque::new()),
                hook_running: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Run `f` against a consistent read view.
    pub fn read<R>(&self, f: impl FnOnce(&StoreReader<'_>) -> R) -> R {
        let state = self.inner.state.read();
        f(&StoreReader { state: &*state })
    }

    /// Returns a clone of the document or [`StoreError::NotFound`].
    pub fn get(&self, collection: &str, id: &str) -> Result<Document> {
        self.read(|r| r.get(collection, id))
            .ok_or_else(|| StoreError::not_found(collection, id))
    }

    pub fn exists(&self, collection: &str, id: &str) -> bool {
        self.read(|r| r.exists(collection, id))
    }

    pub fn scan(&self, collection: &str, prefix: &str) -> Vec<(String, Document)> {
        self.read(|r| r.scan(collection, prefix))
    }

    pub fn count(&self, collection: &str) -> usize {
        self.read(|r| r.count(collection))
    }

    /// Subscribe to the committed-change stream from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> {
        self.inner.events.subscribe()
    }

    /// Atomically snapshot the named collections and subscribe to the change
    /// stream. No commit is missed or seen twice between the snapshot and the
    /// first received batch: commits publish under the write lock, and the
    /// snapshot subscribes under the read lock.
    pub fn snapshot_and_subscribe(
        &self,
        collections: &[&str],
    ) -> (Vec<(String, String, Document)>, broadcast::Receiver<ChangeBatch>) {
        let state = self.inner.state.read();
        let reader = StoreReader { state: &*state };
        let mut rows = Vec::new();
        for &collection in collections {
            for (id, doc) in reader.scan(collection, "") {
                rows.push((collection.to_string(), id, doc));
            }
        }
        let rx = self.inner.events.subscribe();
        (rows, rx)
    }

    /// Queue a one-shot hook, run between the build and apply steps of the
    /// next transaction attempt. Hooks let tests interleave a competing
    /// writer at the point where the builder's reads have gone stale; they
    /// run without any store lock held, in FIFO order, one per attempt.
    pub fn queue_before_commit_hook(&self, hook: impl FnOnce() + Send + 'static) {
        self.inner.hooks.lock().push_back(Box::new(hook));
    }

    fn run_queued_hook(&self) {
        if self.inner.hook_running.load(Ordering::SeqCst) {
            return;
        }
        let hook = self.inner.hooks.lock().pop_front();
        if let Some(hook) = hook {
            self.inner.hook_running.store(true, Ordering::SeqCst);
            hook();
            self.inner.hook_running.store(false, Ordering::SeqCst);
        }
    }

    /// Run a transaction to completion.
    ///
    /// `build` is called with a consistent read view and the attempt number
    /// (0-based); it returns the ops and preconditions to commit, or
    /// [`TxnOutcome::NoOp`] to end the loop successfully. Transient assertion
    /// failures retry with a rebuilt transaction; terminal `Check` failures
    /// and build errors return immediately; exhausted retries surface
    /// [`StoreError::Conflict`].
    pub fn run_txn<E, F>(&self, mut build: F) -> std::result::Result<(), E>
    where
        E: From<StoreError>,
        F: FnMut(&StoreReader<'_>, usize) -> std::result::Result<TxnOutcome<E>, E>,
    {
        let attempts = self.inner.config.max_txn_attempts;
        for attempt in 0..attempts {
            let outcome = {
                let state = self.inner.state.read();
                build(&StoreReader { state: &*state }, attempt)?
            };
            self.run_queued_hook();
            match outcome {
                TxnOutcome::NoOp => return Ok(()),
                TxnOutcome::Commit(txn) => match self.apply(txn) {
                    ApplyResult::Committed => return Ok(()),
                    ApplyResult::Terminal(err) => return Err(err),
                    ApplyResult::Transient(reason) => {
                        tracing::debug!(attempt, %reason, "transaction attempt aborted, retrying");
                    }
                },
            }
        }
        Err(StoreError::Conflict(attempts).into())
    }

    /// Validate and apply one transaction under the commit lock.
    fn apply<E>(&self, txn: Txn<E>) -> ApplyResult<E> {
        let mut state = self.inner.state.write();

        // Validate everything before touching anything.
        {
            let reader = StoreReader { state: &*state };
            for op in &txn.ops {
                let revno = reader.revno(op.collection(), op.id());
                match op {
                    Op::Insert { .. } => {
                        if revno.is_some() {
                            return ApplyResult::Transient(format!(
                                "insert target exists: {}/{}",
                                op.collection(),
                                op.id()
                            ));
                        }
                    }
                    Op::Update { assert_revno, .. } | Op::Remove { assert_revno, .. } => {
                        let Some(actual) = revno else {
                            return ApplyResult::Transient(format!(
                                "target missing: {}/{}",
                                op.collection(),
                                op.id()
                            ));
                        };
                        if let Some(expected) = assert_revno {
                            if actual != *expected {
                                return ApplyResult::Transient(format!(
                                    "revno moved: {}/{} expected {expected}, got {actual}",
                                    op.collection(),
                                    op.id()
                                ));
                            }
                        }
                    }
                }
            }
            for precondition in &txn.preconditions {
                match precondition {
                    Precondition::DocMissing { collection, id } => {
                        if reader.exists(collection, id) {
                            return ApplyResult::Transient(format!(
                                "expected missing: {collection}/{id}"
                            ));
                        }
                    }
                    Precondition::DocExists { collection, id } => {
                        if !reader.exists(collection, id) {
                            return ApplyResult::Transient(format!(
                                "expected present: {collection}/{id}"
                            ));
                        }
                    }
                    Precondition::RevnoIs {
                        collection,
                        id,
                        revno,
                    } => {
                        if reader.revno(collection, id) != Some(*revno) {
                            return ApplyResult::Transient(format!(
                                "revno moved: {collection}/{id}"
                            ));
                        }
                    }
                    Precondition::Check { check, .. } => {
                        if let Err(err) = check(&reader) {
                            return ApplyResult::Terminal(err);
                        }
                    }
                }
            }
        }

        // Apply.
        let mut changes = Vec::with_capacity(txn.ops.len());
        for op in txn.ops {
            match op {
                Op::Insert {
                    collection,
                    id,
                    doc,
                } => {
                    state
                        .collections
                        .entry(collection.clone())
                        .or_default()
                        .insert(id.clone(), VersionedDoc {
                            revno: 1,
                            doc: doc.clone(),
                        });
                    changes.push(DocChange {
                        collection,
                        id,
                        kind: ChangeKind::Created,
                        doc,
                    });
                }
                Op::Update {
                    collection,
                    id,
                    doc,
                    ..
                } => {
                    let entry = state
                        .collections
                        .get_mut(&collection)
                        .and_then(|c| c.get_mut(&id))
                        .expect("validated above");
                    entry.revno += 1;
                    entry.doc = doc.clone();
                    changes.push(DocChange {
                        collection,
                        id,
                        kind: ChangeKind::Updated,
                        doc,
                    });
                }
                Op::Remove { collection, id, .. } => {
                    let removed = state
                        .collections
                        .get_mut(&collection)
                        .and_then(|c| c.remove(&id))
                        .expect("validated above");
                    changes.push(DocChange {
                        collection,
                        id,
                        kind: ChangeKind::Removed,
                        doc: removed.doc,
                    });
                }
            }
        }

        state.seq += 1;
        let batch = ChangeBatch {
            seq: state.seq,
            changes,
        };
        tracing::debug!(seq = batch.seq, changes = batch.changes.len(), "committed");
        // Publish in commit order, still under the lock. Send only fails
        // when there are no subscribers.
        let _ = self.inner.events.send(batch);
        ApplyResult::Committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(pairs: &[(&str, serde_json::Value)]) -> Document {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn put(store: &DocStore, collection: &str, id: &str, doc_in: Document) {
        store
            .run_txn::<StoreError, _>(|r, _| {
                let mut txn = Txn::new();
                if let Some(revno) = r.revno(collection, id) {
                    txn.push(Op::update(collection, id, doc_in.clone(), Some(revno)));
                } else {
                    txn.push(Op::insert(collection, id, doc_in.clone()));
                }
                Ok(TxnOutcome::Commit(txn))
            })
            .unwrap();
    }

    #[test]
    fn test_insert_get_remove() {
        let store = DocStore::new();
        put(&store, "things", "a", doc(&[("x", json!(1))]));

        let fetched = store.get("things", "a").unwrap();
        assert_eq!(fetched.get("x"), Some(&json!(1)));

        store
            .run_txn::<StoreError, _>(|_, _| {
                let mut txn = Txn::new();
                txn.push(Op::remove("things", "a", None));
                Ok(TxnOutcome::Commit(txn))
            })
            .unwrap();

        assert!(store.get("things", "a").unwrap_err().is_not_found());
    }

    #[test]
    fn test_same_value_update_bumps_revno() {
        let store = DocStore::new();
        put(&store, "things", "a", doc(&[("x", json!(1))]));
        let before = store.read(|r| r.revno("things", "a")).unwrap();

        put(&store, "things", "a", doc(&[("x", json!(1))]));
        let after = store.read(|r| r.revno("things", "a")).unwrap();
        assert_eq!(after, before + 1);
    }

    #[test]
    fn test_hook_forces_retry_and_rebuild() {
        let store = DocStore::new();
        put(&store, "counters", "n", doc(&[("value", json!(0))]));

        let competing = store.clone();
        store.queue_before_commit_hook(move || {
            put(&competing, "counters", "n", doc(&[("value", json!(10))]));
        });

        let mut builds = 0;
        store
            .run_txn::<StoreError, _>(|r, _| {
                builds += 1;
                let current = r.get("counters", "n").unwrap();
                let value = current.get("value").unwrap().as_i64().unwrap();
                let revno = r.revno("counters", "n").unwrap();
                let mut txn = Txn::new();
                txn.push(Op::update(
                    "counters",
                    "n",
                    doc(&[("value", json!(value + 1))]),
                    Some(revno),
                ));
                Ok(TxnOutcome::Commit(txn))
            })
            .unwrap();

        assert_eq!(builds, 2);
        let final_doc = store.get("counters", "n").unwrap();
        assert_eq!(final_doc.get("value"), Some(&json!(11)));
    }

    #[test]
    fn test_retries_exhausted_is_conflict() {
        let store = DocStore::with_config(StoreConfig {
            max_txn_attempts: 3,
            ..StoreConfig::default()
        });
        put(&store, "counters", "n", doc(&[("value", json!(0))]));

        for _ in 0..3 {
            let competing = store.clone();
            store.queue_before_commit_hook(move || {
                put(&competing, "counters", "n", doc(&[("value", json!(-1))]));
            });
        }

        let err = store
            .run_txn::<StoreError, _>(|r, _| {
                let revno = r.revno("counters", "n").unwrap();
                let mut txn = Txn::new();
                txn.push(Op::update(
                    "counters",
                    "n",
                    doc(&[("value", json!(1))]),
                    Some(revno),
                ));
                Ok(TxnOutcome::Commit(txn))
            })
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_terminal_check_propagates() {
        let store = DocStore::new();
        let err = store
            .run_txn::<StoreError, _>(|_, _| {
                let mut txn = Txn::new();
                txn.push(Op::insert("things", "a", Document::new()));
                txn.require(Precondition::check("always fails", |_| {
                    Err(StoreError::already_exists("things", "a"))
                }));
                Ok(TxnOutcome::Commit(txn))
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
        // Terminal failure must not have applied anything.
        assert!(!store.exists("things", "a"));
    }

    #[test]
    fn test_atomicity_on_transient_failure() {
        let store = DocStore::new();
        put(&store, "things", "a", doc(&[("x", json!(1))]));

        // One op valid, one not: nothing may be applied, and with no further
        // state change the retry loop must end in Conflict.
        let err = store
            .run_txn::<StoreError, _>(|_, _| {
                let mut txn = Txn::new();
                txn.push(Op::insert("things", "b", Document::new()));
                txn.push(Op::update("things", "missing", Document::new(), None));
                Ok(TxnOutcome::Commit(txn))
            })
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(!store.exists("things", "b"));
    }

    #[test]
    fn test_snapshot_and_subscribe_tiles_exactly() {
        let store = DocStore::new();
        put(&store, "things", "a", doc(&[("x", json!(1))]));

        let (snapshot, mut rx) = store.snapshot_and_subscribe(&["things"]);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].1, "a");

        // The pre-subscription commit is not replayed.
        assert!(rx.try_recv().is_err());

        put(&store, "things", "b", doc(&[("x", json!(2))]));
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.changes.len(), 1);
        assert_eq!(batch.changes[0].id, "b");
        assert_eq!(batch.changes[0].kind, ChangeKind::Created);
    }

    #[test]
    fn test_noop_outcome_commits_nothing() {
        let store = DocStore::new();
        store
            .run_txn::<StoreError, _>(|_, _| Ok(TxnOutcome::NoOp))
            .unwrap();
        assert_eq!(store.count("things"), 0);
    }
}
