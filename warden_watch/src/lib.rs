// SPDX-License-Identifier: MIT OR Apache-2.0
//! Change-driven watchers over the secrets store.
//!
//! Each watcher is a background task consuming the store's committed-change
//! stream, filtering and coalescing into a pending buffer that the consumer
//! drains one batch at a time:
//!
//! - [`watch_rotation_changes`] / [`watch_revision_expiry_changes`] emit
//!   [`TriggerChange`] events from the rotation and expiry indices.
//! - [`watch_consumed_secrets`] emits a URI whenever a consumed secret has a
//!   newer revision than the consumer adopted, or was deleted.
//! - [`watch_obsolete`] emits `uri/revision` for revisions no consumer pins,
//!   and the bare URI when an owned secret is deleted (superseding any
//!   pending per-revision entries).
//!
//! Watchers are one-shot: `kill` requests termination, `wait` joins the task
//! and returns the terminal error, and a stopped watcher cannot be
//! restarted. Multiple changes to the same key between consumer reads
//! coalesce to the most recent state.

mod strings;
mod trigger;

pub use strings::{watch_consumed_secrets, watch_obsolete};
pub use trigger::{watch_revision_expiry_changes, watch_rotation_changes};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use warden_secrets::SecretUri;

/// Result type for watcher operations.
pub type Result<T> = std::result::Result<T, WatchError>;

/// Terminal watcher errors, surfaced by [`Watcher::wait`].
#[derive(Debug, Error)]
pub enum WatchError {
    /// The watcher fell too far behind the commit rate and lost changes.
    #[error("watcher change stream lagged, {0} batches dropped")]
    Lagged(u64),

    /// The watcher task itself failed.
    #[error("watcher task failed: {0}")]
    Task(String),
}

/// One rotation- or expiry-index event.
///
/// `next_trigger_time_ms` of 0 means the index row was removed. `revision`
/// is 0 for rotation events, which are per-secret rather than per-revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerChange {
    pub uri: SecretUri,
    pub revision: u32,
    pub next_trigger_time_ms: i64,
}

/// Pending-event buffer shared between a watcher task and its consumer.
///
/// `Some(vec)` means a batch awaits delivery; the initial event is a
/// pre-populated (possibly empty) batch. Once drained it flips to `None`
/// until the task merges more events in.
pub(crate) struct Shared<T> {
    pending: Mutex<Option<Vec<T>>>,
    notify: Notify,
    closed: AtomicBool,
}

impl<T> Shared<T> {
    pub(crate) fn with_initial(initial: Vec<T>) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Some(initial)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Merge events into the pending batch and wake the consumer. When
    /// nothing is pending and the merge adds nothing, no batch materialises:
    /// a commit with no relevant changes must not surface as an empty event.
    pub(crate) fn update(&self, merge: impl FnOnce(&mut Vec<T>)) {
        let mut pending = self.pending.lock();
        match pending.as_mut() {
            Some(batch) => merge(batch),
            None => {
                let mut batch = Vec::new();
                merge(&mut batch);
                if batch.is_empty() {
                    return;
                }
                *pending = Some(batch);
            }
        }
        drop(pending);
        self.notify.notify_one();
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// Handle to a running watcher task.
///
/// The consumer side is single-reader: `recv` drains the whole pending
/// batch, blocking until one is available or the watcher stops.
pub struct Watcher<T> {
    shared: Arc<Shared<T>>,
    kill_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<Result<()>>>,
}

/// Watcher delivering [`TriggerChange`] batches.
pub type TriggerWatcher = Watcher<TriggerChange>;

/// Watcher delivering batches of URI (or `URI/revision`) strings.
pub type StringsWatcher = Watcher<String>;

impl<T> Watcher<T> {
    pub(crate) fn new(
        shared: Arc<Shared<T>>,
        kill_tx: broadcast::Sender<()>,
        handle: JoinHandle<Result<()>>,
    ) -> Self {
        Self {
            shared,
            kill_tx,
            handle: Some(handle),
        }
    }

    /// Receive the next batch of changes. Returns `None` once the watcher
    /// has stopped and everything pending was delivered.
    pub async fn recv(&mut self) -> Option<Vec<T>> {
        loop {
            let notified = self.shared.notify.notified();
            {
                if let Some(batch) = self.shared.pending.lock().take() {
                    return Some(batch);
                }
                if self.shared.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Request termination. Idempotent; does not block.
    pub fn kill(&self) {
        let _ = self.kill_tx.send(());
    }

    /// Wait for the task to release its resources and return the terminal
    /// error, if any. Call [`kill`](Self::kill) first for a prompt stop.
    pub async fn wait(mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match handle.await {
            Ok(result) => result,
            Err(err) => Err(WatchError::Task(err.to_string())),
        }
    }

    /// Kill and wait in one step.
    pub async fn stop(self) -> Result<()> {
        self.kill();
        self.wait().await
    }
}

impl<T> Drop for Watcher<T> {
    fn drop(&mut self) {
        // A dropped watcher should not leave its task behind.
        let _ = self.kill_tx.send(());
    }
}
