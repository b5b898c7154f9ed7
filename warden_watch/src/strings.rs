// SPDX-License-Identifier: MIT OR Apache-2.0
//! Strings watchers: consumed-revision changes and obsolete revisions.
//!
//! Both deliver batches of strings. The consumed watcher emits bare URIs;
//! the obsolete watcher emits `uri/revision` for newly obsolete revisions
//! and the bare URI for a whole-secret deletion, which supersedes any
//! pending per-revision entries for that secret. Initial event: empty.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast;
use warden_secrets::records;
use warden_secrets::{SecretUri, SecretsStore, Tag};
use warden_store::{ChangeBatch, ChangeKind, DocChange};

use crate::{Result, Shared, StringsWatcher, WatchError};

/// Watch the secrets `consumer` consumes. Emits a secret's URI when a newer
/// revision than the consumer's current one exists, or when the secret was
/// deleted. Recording a consumer row that is already up to date emits
/// nothing.
pub fn watch_consumed_secrets(secrets: &SecretsStore, consumer: &Tag) -> StringsWatcher {
    let consumer_tag = consumer.to_string();
    let (_, rx) = secrets
        .doc_store()
        .snapshot_and_subscribe(&[records::CONSUMERS]);
    let shared = Shared::with_initial(Vec::new());
    let task_shared = Arc::clone(&shared);
    let (kill_tx, kill_rx) = broadcast::channel(1);
    let handle = tokio::spawn(run(rx, task_shared, kill_rx, move |pending, change| {
        consumed_event(pending, change, &consumer_tag);
    }));
    StringsWatcher::new(shared, kill_tx, handle)
}

/// Watch for obsolete revisions and deletions of secrets owned by `owners`.
pub fn watch_obsolete(secrets: &SecretsStore, owners: &[Tag]) -> StringsWatcher {
    let owners: HashSet<String> = owners.iter().map(Tag::to_string).collect();
    let (_, rx) = secrets
        .doc_store()
        .snapshot_and_subscribe(&[records::REVISIONS, records::METADATA]);
    let shared = Shared::with_initial(Vec::new());
    let task_shared = Arc::clone(&shared);
    let (kill_tx, kill_rx) = broadcast::channel(1);
    let handle = tokio::spawn(run(rx, task_shared, kill_rx, move |pending, change| {
        obsolete_event(pending, change, &owners);
    }));
    StringsWatcher::new(shared, kill_tx, handle)
}

async fn run(
    mut rx: broadcast::Receiver<ChangeBatch>,
    shared: Arc<Shared<String>>,
    mut kill_rx: broadcast::Receiver<()>,
    mut process: impl FnMut(&mut Vec<String>, &DocChange) + Send,
) -> Result<()> {
    let result = loop {
        tokio::select! {
            _ = kill_rx.recv() => break Ok(()),
            received = rx.recv() => match received {
                Ok(batch) => {
                    shared.update(|pending| {
                        for change in &batch.changes {
                            process(pending, change);
                        }
                    });
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "strings watcher lagged behind commits");
                    break Err(WatchError::Lagged(missed));
                }
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            }
        }
    };
    shared.close();
    result
}

fn push_unique(pending: &mut Vec<String>, value: String) {
    if !pending.contains(&value) {
        pending.push(value);
    }
}

fn consumed_event(pending: &mut Vec<String>, change: &DocChange, consumer_tag: &str) {
    if change.collection != records::CONSUMERS {
        return;
    }
    let is_ours = change
        .doc
        .get("consumer_tag")
        .and_then(serde_json::Value::as_str)
        .is_some_and(|tag| tag == consumer_tag);
    if !is_ours {
        return;
    }
    let Some((uri_id, _)) = change.id.split_once('#') else {
        return;
    };
    let Ok(uri) = SecretUri::from_id(uri_id) else {
        return;
    };
    match change.kind {
        // The secret this consumer uses was deleted out from under it.
        ChangeKind::Removed => push_unique(pending, uri.to_string()),
        ChangeKind::Created | ChangeKind::Updated => {
            let current = change
                .doc
                .get("current_revision")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0);
            let latest = change
                .doc
                .get("latest_revision")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0);
            // Only a gap between current and latest means work to do.
            if latest > current {
                push_unique(pending, uri.to_string());
            }
        }
    }
}

fn obsolete_event(pending: &mut Vec<String>, change: &DocChange, owners: &HashSet<String>) {
    let owned = change
        .doc
        .get("owner_tag")
        .and_then(serde_json::Value::as_str)
        .is_some_and(|owner| owners.contains(owner));
    if !owned {
        return;
    }
    match (change.collection.as_str(), change.kind) {
        (records::REVISIONS, ChangeKind::Created | ChangeKind::Updated) => {
            let obsolete = change
                .doc
                .get("obsolete")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            let pending_delete = change
                .doc
                .get("pending_delete")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            if !obsolete || pending_delete {
                return;
            }
            let Some((uri_id, _)) = change.id.split_once('/') else {
                return;
            };
            let Ok(uri) = SecretUri::from_id(uri_id) else {
                return;
            };
            let Some(revision) = change
                .doc
                .get("revision")
                .and_then(serde_json::Value::as_u64)
            else {
                return;
            };
            push_unique(pending, format!("{uri}/{revision}"));
        }
        (records::METADATA, ChangeKind::Removed) => {
            let Ok(uri) = SecretUri::from_id(&change.id) else {
                return;
            };
            // Whole-secret deletion supersedes any undelivered per-revision
            // entries for it.
            let prefix = format!("{uri}/");
            pending.retain(|entry| !entry.starts_with(&prefix));
            push_unique(pending, uri.to_string());
        }
        _ => {}
    }
}
