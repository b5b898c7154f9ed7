// SPDX-License-Identifier: MIT OR Apache-2.0
//! Trigger watchers over the rotation and expiry indices.
//!
//! Both watchers have the same shape and differ only in the index they
//! follow. On subscription every currently-indexed row owned by one of the
//! given owners is delivered as the initial batch, unconditionally; a
//! restarted watcher therefore re-announces all current schedules and
//! consumers must be idempotent. After that, a row upsert emits the new
//! trigger time and a row removal emits a zero time.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast;
use warden_secrets::records;
use warden_secrets::{SecretUri, SecretsStore, Tag};
use warden_store::{ChangeBatch, ChangeKind, Document};

use crate::{Result, Shared, TriggerChange, TriggerWatcher, WatchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TriggerKind {
    Rotation,
    Expiry,
}

impl TriggerKind {
    fn collection(self) -> &'static str {
        match self {
            Self::Rotation => records::ROTATE,
            Self::Expiry => records::EXPIRY,
        }
    }

    fn time_field(self) -> &'static str {
        match self {
            Self::Rotation => "next_rotate_ms",
            Self::Expiry => "expire_ms",
        }
    }
}

/// Watch the rotation schedule of secrets owned by `owners`.
pub fn watch_rotation_changes(secrets: &SecretsStore, owners: &[Tag]) -> TriggerWatcher {
    spawn(secrets, owners, TriggerKind::Rotation)
}

/// Watch the expiry deadlines of secret revisions owned by `owners`.
pub fn watch_revision_expiry_changes(secrets: &SecretsStore, owners: &[Tag]) -> TriggerWatcher {
    spawn(secrets, owners, TriggerKind::Expiry)
}

fn spawn(secrets: &SecretsStore, owners: &[Tag], kind: TriggerKind) -> TriggerWatcher {
    let owners: HashSet<String> = owners.iter().map(Tag::to_string).collect();
    let (snapshot, rx) = secrets
        .doc_store()
        .snapshot_and_subscribe(&[kind.collection()]);

    let mut initial = Vec::new();
    for (_, id, doc) in snapshot {
        if let Some(change) = trigger_event(kind, &id, ChangeKind::Created, &doc, &owners) {
            initial.push(change);
        }
    }

    let shared = Shared::with_initial(initial);
    let (kill_tx, kill_rx) = broadcast::channel(1);
    let task_shared = Arc::clone(&shared);
    let handle = tokio::spawn(run(rx, task_shared, kill_rx, kind, owners));
    TriggerWatcher::new(shared, kill_tx, handle)
}

async fn run(
    mut rx: broadcast::Receiver<ChangeBatch>,
    shared: Arc<Shared<TriggerChange>>,
    mut kill_rx: broadcast::Receiver<()>,
    kind: TriggerKind,
    owners: HashSet<String>,
) -> Result<()> {
    let result = loop {
        tokio::select! {
            _ = kill_rx.recv() => break Ok(()),
            received = rx.recv() => match received {
                Ok(batch) => {
                    let events: Vec<TriggerChange> = batch
                        .changes
                        .iter()
                        .filter(|change| change.collection == kind.collection())
                        .filter_map(|change| {
                            trigger_event(kind, &change.id, change.kind, &change.doc, &owners)
                        })
                        .collect();
                    if !events.is_empty() {
                        shared.update(|pending| merge(pending, events));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "trigger watcher lagged behind commits");
                    break Err(WatchError::Lagged(missed));
                }
                // Store dropped: nothing more will ever arrive.
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            }
        }
    };
    shared.close();
    result
}

/// Coalesce: a newer event for the same `(uri, revision)` replaces the
/// pending one.
fn merge(pending: &mut Vec<TriggerChange>, events: Vec<TriggerChange>) {
    for event in events {
        match pending
            .iter_mut()
            .find(|p| p.uri == event.uri && p.revision == event.revision)
        {
            Some(existing) => *existing = event,
            None => pending.push(event),
        }
    }
}

fn trigger_event(
    kind: TriggerKind,
    id: &str,
    change: ChangeKind,
    doc: &Document,
    owners: &HashSet<String>,
) -> Option<TriggerChange> {
    let owner = doc.get("owner_tag")?.as_str()?;
    if !owners.contains(owner) {
        return None;
    }
    let (uri_id, revision) = match kind {
        TriggerKind::Rotation => (id, 0),
        TriggerKind::Expiry => {
            let (uri_id, _) = id.split_once('/')?;
            let revision = doc.get("revision")?.as_u64()? as u32;
            (uri_id, revision)
        }
    };
    let uri = SecretUri::from_id(uri_id).ok()?;
    let next_trigger_time_ms = match change {
        ChangeKind::Removed => 0,
        ChangeKind::Created | ChangeKind::Updated => doc.get(kind.time_field())?.as_i64()?,
    };
    Some(TriggerChange {
        uri,
        revision,
        next_trigger_time_ms,
    })
}
