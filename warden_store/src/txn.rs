// SPDX-License-Identifier: MIT OR Apache-2.0
//! Transaction building blocks.
//!
//! A mutation is expressed as a pure function from the current store state to
//! a list of [`Op`]s plus a list of [`Precondition`]s. The store validates
//! every op assertion and precondition under the commit lock and applies the
//! ops atomically, or aborts the attempt so the builder can re-read and
//! rebuild.

use crate::{Document, StoreReader};

/// A single document write.
///
/// `Insert` asserts the document is absent; `Update` and `Remove` assert it is
/// present, optionally at a specific revision number. Assertion failures are
/// transient: the transaction attempt aborts and the builder runs again
/// against fresh state.
#[derive(Debug, Clone)]
pub enum Op {
    Insert {
        collection: String,
        id: String,
        doc: Document,
    },
    Update {
        collection: String,
        id: String,
        doc: Document,
        assert_revno: Option<u64>,
    },
    Remove {
        collection: String,
        id: String,
        assert_revno: Option<u64>,
    },
}

impl Op {
    pub fn insert(collection: &str, id: impl Into<String>, doc: Document) -> Self {
        Self::Insert {
            collection: collection.to_string(),
            id: id.into(),
            doc,
        }
    }

    pub fn update(
        collection: &str,
        id: impl Into<String>,
        doc: Document,
        assert_revno: Option<u64>,
    ) -> Self {
        Self::Update {
            collection: collection.to_string(),
            id: id.into(),
            doc,
            assert_revno,
        }
    }

    pub fn remove(collection: &str, id: impl Into<String>, assert_revno: Option<u64>) -> Self {
        Self::Remove {
            collection: collection.to_string(),
            id: id.into(),
            assert_revno,
        }
    }

    pub(crate) fn collection(&self) -> &str {
        match self {
            Self::Insert { collection, .. }
            | Self::Update { collection, .. }
            | Self::Remove { collection, .. } => collection,
        }
    }

    pub(crate) fn id(&self) -> &str {
        match self {
            Self::Insert { id, .. } | Self::Update { id, .. } | Self::Remove { id, .. } => id,
        }
    }
}

/// A commit-time assertion checked under the commit lock.
///
/// The document-shaped variants fail *transiently* (the attempt aborts and the
/// builder retries). `Check` failures are *terminal*: the closure's error is
/// returned to the caller unchanged. Terminal checks are how domain
/// preconditions such as leader-token validity or label uniqueness surface as
/// their own error kinds instead of a retry.
pub enum Precondition<E> {
    DocMissing {
        collection: String,
        id: String,
    },
    DocExists {
        collection: String,
        id: String,
    },
    RevnoIs {
        collection: String,
        id: String,
        revno: u64,
    },
    Check {
        desc: String,
        check: Box<dyn Fn(&StoreReader<'_>) -> std::result::Result<(), E> + Send>,
    },
}

impl<E> Precondition<E> {
    pub fn doc_missing(collection: &str, id: impl Into<String>) -> Self {
        Self::DocMissing {
            collection: collection.to_string(),
            id: id.into(),
        }
    }

    pub fn doc_exists(collection: &str, id: impl Into<String>) -> Self {
        Self::DocExists {
            collection: collection.to_string(),
            id: id.into(),
        }
    }

    pub fn revno_is(collection: &str, id: impl Into<String>, revno: u64) -> Self {
        Self::RevnoIs {
            collection: collection.to_string(),
            id: id.into(),
            revno,
        }
    }

    pub fn check<F>(desc: impl Into<String>, check: F) -> Self
    where
        F: Fn(&StoreReader<'_>) -> std::result::Result<(), E> + Send + 'static,
    {
        Self::Check {
            desc: desc.into(),
            check: Box::new(check),
        }
    }
}

impl<E> std::fmt::Debug for Precondition<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DocMissing { collection, id } => {
                write!(f, "DocMissing({collection}/{id})")
            }
            Self::DocExists { collection, id } => {
                write!(f, "DocExists({collection}/{id})")
            }
            Self::RevnoIs {
                collection,
                id,
                revno,
            } => write!(f, "RevnoIs({collection}/{id}@{revno})"),
            Self::Check { desc, .. } => write!(f, "Check({desc})"),
        }
    }
}

/// The ops and preconditions of one transaction attempt.
#[derive(Debug, Default)]
pub struct Txn<E> {
    pub ops: Vec<Op>,
    pub preconditions: Vec<Precondition<E>>,
}

impl<E> Txn<E> {
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            preconditions: Vec::new(),
        }
    }

    pub fn push(&mut self, op: Op) {
        self.ops.push(op);
    }

    pub fn require(&mut self, precondition: Precondition<E>) {
        self.preconditions.push(precondition);
    }
}

/// What a transaction builder decided to do this attempt.
#[derive(Debug)]
pub enum TxnOutcome<E> {
    /// Commit these ops (subject to assertions).
    Commit(Txn<E>),
    /// Nothing to do; the retry loop ends successfully.
    NoOp,
}
