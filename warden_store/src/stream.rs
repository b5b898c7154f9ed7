// SPDX-License-Identifier: MIT OR Apache-2.0
//! Committed-change stream types.
//!
//! Every committed transaction publishes one [`ChangeBatch`] on the store's
//! broadcast channel. Batches arrive in commit order; the sequence number is
//! strictly increasing. Watchers subscribe with
//! [`DocStore::snapshot_and_subscribe`](crate::DocStore::snapshot_and_subscribe)
//! so the snapshot and the stream tile exactly, with no gap and no overlap.

use crate::Document;

/// What happened to a document inside a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Removed,
}

/// One document touched by a committed transaction.
///
/// `doc` is the post-image for `Created`/`Updated` and the pre-image for
/// `Removed`, so subscribers can see the owner or revision of a row that no
/// longer exists.
#[derive(Debug, Clone)]
pub struct DocChange {
    pub collection: String,
    pub id: String,
    pub kind: ChangeKind,
    pub doc: Document,
}

/// All documents touched by one committed transaction.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    /// Commit sequence number, strictly increasing.
    pub seq: u64,
    pub changes: Vec<DocChange>,
}
