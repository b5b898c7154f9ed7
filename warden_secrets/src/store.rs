// SPDX-License-Identifier: MIT OR Apache-2.0
//! Core secrets store: create, update, read, list, delete, rotation
//! scheduling, consumers, and reference counts.
//!
//! Every mutation is built as a pure function from the current store state to
//! an op list plus commit-time preconditions, then run through the document
//! store's bounded retry loop. Leader tokens and label uniqueness are
//! re-validated inside the commit; stale reads abort the attempt and the
//! builder runs again.

use std::collections::HashSet;
use std::sync::Arc;

use warden_store::{DocStore, Op, Precondition, StoreReader, Txn, TxnOutcome};

use crate::leader::leader_precondition;
use crate::records::{
    self, from_document, to_document, ConsumerDoc, ExpiryDoc, MetadataDoc, RefCountDoc,
    RevisionDoc, RotateDoc,
};
use crate::{
    Clock, CreateSecretParams, EntityChecker, LeaderToken, Result, SecretConsumerMetadata,
    SecretMetadata, SecretRevisionMetadata, SecretUri, SecretValue, SecretsError, SecretsFilter,
    Tag, UpdateSecretParams,
};

/// Transactional store of secrets, their revisions, consumers, permissions,
/// and rotation/expiry schedules.
///
/// Cheap to clone; clones share the same underlying document store.
#[derive(Clone)]
pub struct SecretsStore {
    store: DocStore,
    entities: Arc<dyn EntityChecker>,
    clock: Arc<dyn Clock>,
}

impl SecretsStore {
    pub fn new(store: DocStore, entities: Arc<dyn EntityChecker>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            entities,
            clock,
        }
    }

    /// The backing document store. Watchers subscribe through this; tests use
    /// it to assert on raw collection state.
    pub fn doc_store(&self) -> &DocStore {
        &self.store
    }

    /// Create a new secret under a freshly minted URI.
    pub fn create_secret(
        &self,
        uri: &SecretUri,
        params: CreateSecretParams,
    ) -> Result<SecretMetadata> {
        params.update.validate()?;
        if !params.update.has_new_content() {
            return Err(SecretsError::InvalidArgument(
                "cannot create a secret without content".to_string(),
            ));
        }
        let policy = params.update.rotate_policy.unwrap_or_default();
        let next_rotate_ms = params.update.next_rotate_time_ms.unwrap_or(0);
        if policy.will_rotate() && next_rotate_ms <= 0 {
            return Err(SecretsError::InvalidArgument(
                "must specify a rotate time for a rotating secret".to_string(),
            ));
        }
        if !self.entities.life(&params.owner).is_alive() {
            return Err(SecretsError::NotAlive(format!(
                "cannot create secret for owner {} which is not alive",
                params.owner
            )));
        }

        let owner_tag = params.owner.to_string();
        let mut created = None;
        self.store.run_txn::<SecretsError, _>(|r, _attempt| {
            if r.exists(records::METADATA, uri.id()) {
                return Err(SecretsError::AlreadyExists(uri.to_string()));
            }
            let label = params.update.label.clone().unwrap_or_default();
            if !label.is_empty() && label_in_use(r, &owner_tag, &label, None) {
                return Err(SecretsError::LabelExists(label));
            }

            let now = self.clock.now_ms();
            let expire_ms = params.update.expire_time_ms.unwrap_or(0);
            let metadata = MetadataDoc {
                owner_tag: owner_tag.clone(),
                version: params.version,
                description: params.update.description.clone().unwrap_or_default(),
                label: label.clone(),
                rotate_policy: policy,
                latest_revision: 1,
                latest_expire_ms: expire_ms,
                create_time_ms: now,
                update_time_ms: now,
            };
            let revision = RevisionDoc {
                owner_tag: owner_tag.clone(),
                revision: 1,
                data: params.update.data.clone(),
                provider_id: params.update.provider_id.clone(),
                expire_ms,
                obsolete: false,
                pending_delete: false,
                create_time_ms: now,
                update_time_ms: now,
            };

            let mut txn = Txn::new();
            txn.push(Op::insert(
                records::METADATA,
                uri.id(),
                to_document(&metadata)?,
            ));
            txn.push(Op::insert(
                records::REVISIONS,
                records::revision_id(uri, 1),
                to_document(&revision)?,
            ));
            if policy.will_rotate() {
                txn.push(Op::insert(
                    records::ROTATE,
                    uri.id(),
                    to_document(&RotateDoc {
                        owner_tag: owner_tag.clone(),
                        next_rotate_ms,
                    })?,
                ));
            }
            if expire_ms > 0 {
                txn.push(Op::insert(
                    records::EXPIRY,
                    records::revision_id(uri, 1),
                    to_document(&ExpiryDoc {
                        owner_tag: owner_tag.clone(),
                        revision: 1,
                        expire_ms,
                    })?,
                ));
            }
            txn.require(leader_precondition(&params.update.leader_token));
            if !label.is_empty() {
                txn.require(label_precondition(&owner_tag, &label, None));
            }

            created = Some(self.to_metadata(
                uri,
                &metadata,
                if policy.will_rotate() { next_rotate_ms } else { 0 },
            )?);
            Ok(TxnOutcome::Commit(txn))
        })?;
        tracing::debug!(%uri, owner = %owner_tag, "secret created");
        Ok(created.expect("a committed create always builds metadata"))
    }

    /// Update metadata and, when content is supplied, append a new revision.
    pub fn update_secret(
        &self,
        uri: &SecretUri,
        params: UpdateSecretParams,
    ) -> Result<SecretMetadata> {
        params.validate()?;
        if !params.has_update() {
            return Err(SecretsError::InvalidArgument(
                "must specify a new value or metadata to update a secret".to_string(),
            ));
        }

        let mut updated = None;
        self.store.run_txn::<SecretsError, _>(|r, _attempt| {
            let (metadata, metadata_revno) = read_metadata(r, uri)?;
            let now = self.clock.now_ms();
            let mut txn = Txn::new();
            let mut new_metadata = metadata.clone();
            new_metadata.update_time_ms = now;

            if let Some(description) = &params.description {
                new_metadata.description = description.clone();
            }
            let label_changing = match &params.label {
                Some(label) => {
                    if !label.is_empty()
                        && *label != metadata.label
                        && label_in_use(r, &metadata.owner_tag, label, Some(uri.id()))
                    {
                        return Err(SecretsError::LabelExists(label.clone()));
                    }
                    new_metadata.label = label.clone();
                    *label != metadata.label && !label.is_empty()
                }
                None => false,
            };

            // Rotation schedule.
            let mut next_rotate_ms = read_next_rotate(r, uri);
            if let Some(policy) = params.rotate_policy {
                new_metadata.rotate_policy = policy;
                if policy.will_rotate() {
                    let next = params
                        .next_rotate_time_ms
                        .filter(|t| *t > 0)
                        .ok_or_else(|| {
                            SecretsError::InvalidArgument(
                                "must specify a rotate time for a rotating secret".to_string(),
                            )
                        })?;
                    upsert(
                        &mut txn,
                        r,
                        records::ROTATE,
                        uri.id(),
                        to_document(&RotateDoc {
                            owner_tag: metadata.owner_tag.clone(),
                            next_rotate_ms: next,
                        })?,
                    );
                    next_rotate_ms = next;
                } else {
                    if let Some(revno) = r.revno(records::ROTATE, uri.id()) {
                        txn.push(Op::remove(records::ROTATE, uri.id(), Some(revno)));
                    }
                    next_rotate_ms = 0;
                }
            } else if let Some(next) = params.next_rotate_time_ms {
                if !metadata.rotate_policy.will_rotate() {
                    return Err(SecretsError::InvalidArgument(
                        "cannot set a rotate time on a secret without a rotate policy".to_string(),
                    ));
                }
                if next <= 0 {
                    return Err(SecretsError::InvalidArgument(
                        "must specify a positive rotate time".to_string(),
                    ));
                }
                upsert(
                    &mut txn,
                    r,
                    records::ROTATE,
                    uri.id(),
                    to_document(&RotateDoc {
                        owner_tag: metadata.owner_tag.clone(),
                        next_rotate_ms: next,
                    })?,
                );
                next_rotate_ms = next;
            }

            if params.has_new_content() {
                let new_latest = metadata.latest_revision + 1;
                new_metadata.latest_revision = new_latest;
                let expire_ms = params.expire_time_ms.filter(|t| *t > 0).unwrap_or(0);
                new_metadata.latest_expire_ms = expire_ms;

                let revision = RevisionDoc {
                    owner_tag: metadata.owner_tag.clone(),
                    revision: new_latest,
                    data: params.data.clone(),
                    provider_id: params.provider_id.clone(),
                    expire_ms,
                    obsolete: false,
                    pending_delete: false,
                    create_time_ms: now,
                    update_time_ms: now,
                };
                txn.push(Op::insert(
                    records::REVISIONS,
                    records::revision_id(uri, new_latest),
                    to_document(&revision)?,
                ));
                if expire_ms > 0 {
                    txn.push(Op::insert(
                        records::EXPIRY,
                        records::revision_id(uri, new_latest),
                        to_document(&ExpiryDoc {
                            owner_tag: metadata.owner_tag.clone(),
                            revision: new_latest,
                            expire_ms,
                        })?,
                    ));
                }

                // Every existing consumer learns a newer revision exists.
                let consumers = read_consumers(r, uri)?;
                for (id, revno, consumer) in &consumers {
                    let mut bumped = consumer.clone();
                    bumped.latest_revision = new_latest;
                    txn.push(Op::update(
                        records::CONSUMERS,
                        id.clone(),
                        to_document(&bumped)?,
                        Some(*revno),
                    ));
                }

                // (Re)mark unpinned revisions obsolete. Re-marking an
                // already-obsolete row still bumps it, which re-announces it
                // on the change stream.
                let pinned: HashSet<u32> =
                    consumers.iter().map(|(_, _, c)| c.current_revision).collect();
                for (id, revno, mut rev) in read_revisions(r, uri)? {
                    if rev.pending_delete || pinned.contains(&rev.revision) {
                        continue;
                    }
                    rev.obsolete = true;
                    rev.update_time_ms = now;
                    txn.push(Op::update(
                        records::REVISIONS,
                        id,
                        to_document(&rev)?,
                        Some(revno),
                    ));
                }
            } else if let Some(expire_ms) = params.expire_time_ms {
                // Applies to the latest revision.
                let id = records::revision_id(uri, metadata.latest_revision);
                let revno = r.revno(records::REVISIONS, &id).ok_or_else(|| {
                    SecretsError::NotFound(format!(
                        "secret revision {uri}/{}",
                        metadata.latest_revision
                    ))
                })?;
                let doc = r.get(records::REVISIONS, &id).ok_or_else(|| {
                    SecretsError::NotFound(format!(
                        "secret revision {uri}/{}",
                        metadata.latest_revision
                    ))
                })?;
                let mut rev: RevisionDoc = from_document(&doc)?;
                rev.expire_ms = expire_ms;
                rev.update_time_ms = now;
                txn.push(Op::update(
                    records::REVISIONS,
                    id.clone(),
                    to_document(&rev)?,
                    Some(revno),
                ));
                if expire_ms > 0 {
                    upsert(
                        &mut txn,
                        r,
                        records::EXPIRY,
                        &id,
                        to_document(&ExpiryDoc {
                            owner_tag: metadata.owner_tag.clone(),
                            revision: metadata.latest_revision,
                            expire_ms,
                        })?,
                    );
                } else if let Some(expiry_revno) = r.revno(records::EXPIRY, &id) {
                    txn.push(Op::remove(records::EXPIRY, id, Some(expiry_revno)));
                }
                new_metadata.latest_expire_ms = expire_ms;
            }

            txn.push(Op::update(
                records::METADATA,
                uri.id(),
                to_document(&new_metadata)?,
                Some(metadata_revno),
            ));
            txn.require(leader_precondition(&params.leader_token));
            if label_changing {
                txn.require(label_precondition(
                    &metadata.owner_tag,
                    &new_metadata.label,
                    Some(uri.id().to_string()),
                ));
            }

            updated = Some(self.to_metadata(uri, &new_metadata, next_rotate_ms)?);
            Ok(TxnOutcome::Commit(txn))
        })?;
        tracing::debug!(%uri, "secret updated");
        Ok(updated.expect("a committed update always builds metadata"))
    }

    /// Fetch a secret's metadata.
    pub fn get_secret(&self, uri: &SecretUri) -> Result<SecretMetadata> {
        self.store.read(|r| {
            let (metadata, _) = read_metadata(r, uri)?;
            self.to_metadata(uri, &metadata, read_next_rotate(r, uri))
        })
    }

    /// Fetch one revision's content: the inline value or the backend
    /// content id.
    pub fn get_secret_value(
        &self,
        uri: &SecretUri,
        revision: u32,
    ) -> Result<(SecretValue, Option<String>)> {
        let id = records::revision_id(uri, revision);
        let doc = self.store.read(|r| r.get(records::REVISIONS, &id));
        let doc =
            doc.ok_or_else(|| SecretsError::NotFound(format!("secret revision {uri}/{revision}")))?;
        let rev: RevisionDoc = from_document(&doc)?;
        Ok((
            SecretValue::new(rev.data.unwrap_or_default()),
            rev.provider_id,
        ))
    }

    /// List secrets matching the filter (all populated fields must match).
    pub fn list_secrets(&self, filter: &SecretsFilter) -> Result<Vec<SecretMetadata>> {
        self.store.read(|r| {
            let owner_tags: HashSet<String> =
                filter.owner_tags.iter().map(Tag::to_string).collect();
            let consumable: Option<HashSet<String>> = if filter.consumer_tags.is_empty() {
                None
            } else {
                let subjects: HashSet<String> =
                    filter.consumer_tags.iter().map(Tag::to_string).collect();
                let mut uris = HashSet::new();
                for (id, doc) in r.scan(records::PERMISSIONS, "") {
                    let permission: records::PermissionDoc = from_document(&doc)?;
                    if subjects.contains(&permission.subject_tag)
                        && permission.role.allows(crate::SecretRole::View)
                    {
                        if let Some((uri_id, _)) = id.split_once('#') {
                            uris.insert(uri_id.to_string());
                        }
                    }
                }
                Some(uris)
            };

            let mut result = Vec::new();
            for (id, doc) in r.scan(records::METADATA, "") {
                if let Some(uri) = &filter.uri {
                    if uri.id() != id {
                        continue;
                    }
                }
                let metadata: MetadataDoc = from_document(&doc)?;
                if !owner_tags.is_empty() && !owner_tags.contains(&metadata.owner_tag) {
                    continue;
                }
                if let Some(consumable) = &consumable {
                    if !consumable.contains(&id) {
                        continue;
                    }
                }
                let uri = SecretUri::from_id(&id)?;
                let next_rotate_ms = read_next_rotate(r, &uri);
                result.push(self.to_metadata(&uri, &metadata, next_rotate_ms)?);
            }
            result.sort_by(|a, b| a.uri.cmp(&b.uri));
            Ok(result)
        })
    }

    /// List all revisions of a secret, oldest first.
    pub fn list_secret_revisions(&self, uri: &SecretUri) -> Result<Vec<SecretRevisionMetadata>> {
        self.store.read(|r| {
            read_metadata(r, uri)?;
            let mut revisions: Vec<SecretRevisionMetadata> = read_revisions(r, uri)?
                .into_iter()
                .map(|(_, _, rev)| to_revision_metadata(&rev))
                .collect();
            revisions.sort_by_key(|rev| rev.revision);
            Ok(revisions)
        })
    }

    /// Fetch one revision's metadata.
    pub fn get_secret_revision(
        &self,
        uri: &SecretUri,
        revision: u32,
    ) -> Result<SecretRevisionMetadata> {
        let id = records::revision_id(uri, revision);
        let doc = self.store.read(|r| r.get(records::REVISIONS, &id));
        let doc =
            doc.ok_or_else(|| SecretsError::NotFound(format!("secret revision {uri}/{revision}")))?;
        let rev: RevisionDoc = from_document(&doc)?;
        Ok(to_revision_metadata(&rev))
    }

    /// Look up a secret by the label its owner gave it.
    pub fn get_uri_by_secret_label(&self, label: &str, owner: &Tag) -> Result<SecretUri> {
        if label.is_empty() {
            return Err(SecretsError::InvalidArgument("empty label".to_string()));
        }
        let owner_tag = owner.to_string();
        self.store.read(|r| {
            for (id, doc) in r.scan(records::METADATA, "") {
                let metadata: MetadataDoc = from_document(&doc)?;
                if metadata.owner_tag == owner_tag && metadata.label == label {
                    return SecretUri::from_id(&id);
                }
            }
            Err(SecretsError::NotFound(format!(
                "secret with label {label:?}"
            )))
        })
    }

    /// Look up a secret by the label a consumer gave it.
    pub fn get_uri_by_consumer_label(&self, label: &str, consumer: &Tag) -> Result<SecretUri> {
        if label.is_empty() {
            return Err(SecretsError::InvalidArgument("empty label".to_string()));
        }
        let consumer_tag = consumer.to_string();
        self.store.read(|r| {
            for (id, doc) in r.scan(records::CONSUMERS, "") {
                let doc: ConsumerDoc = from_document(&doc)?;
                if doc.consumer_tag == consumer_tag && doc.label == label {
                    if let Some((uri_id, _)) = id.split_once('#') {
                        return SecretUri::from_id(uri_id);
                    }
                }
            }
            Err(SecretsError::NotFound(format!(
                "secret with consumer label {label:?}"
            )))
        })
    }

    /// Delete the whole secret, or only the given revisions. Removing the
    /// last revision removes the whole secret. Returns whether the secret is
    /// entirely gone. Idempotent: deleting an already-deleted secret
    /// succeeds with `true`.
    pub fn delete_secret(
        &self,
        uri: &SecretUri,
        leader_token: Arc<dyn LeaderToken>,
        revisions: &[u32],
    ) -> Result<bool> {
        let mut all_removed = false;
        self.store.run_txn::<SecretsError, _>(|r, _attempt| {
            let Some(metadata_revno) = r.revno(records::METADATA, uri.id()) else {
                // Lost a race, or repeat call: already removed.
                all_removed = true;
                return Ok(TxnOutcome::NoOp);
            };

            let existing = read_revisions(r, uri)?;
            let mut txn = Txn::new();

            let whole = if revisions.is_empty() {
                true
            } else {
                let targets: HashSet<u32> = revisions.iter().copied().collect();
                existing
                    .iter()
                    .all(|(_, _, rev)| targets.contains(&rev.revision))
            };

            if whole {
                txn.push(Op::remove(records::METADATA, uri.id(), Some(metadata_revno)));
                for (id, revno, _) in &existing {
                    txn.push(Op::remove(records::REVISIONS, id.clone(), Some(*revno)));
                }
                for (id, _) in r.scan(records::CONSUMERS, &format!("{}#", uri.id())) {
                    txn.push(Op::remove(records::CONSUMERS, id, None));
                }
                for (id, _) in r.scan(records::PERMISSIONS, &format!("{}#", uri.id())) {
                    txn.push(Op::remove(records::PERMISSIONS, id, None));
                }
                if r.exists(records::ROTATE, uri.id()) {
                    txn.push(Op::remove(records::ROTATE, uri.id(), None));
                }
                for (id, _) in r.scan(records::EXPIRY, &format!("{}/", uri.id())) {
                    txn.push(Op::remove(records::EXPIRY, id, None));
                }
                let refcount_id = records::refcount_id(uri);
                if r.exists(records::REFCOUNTS, &refcount_id) {
                    txn.push(Op::remove(records::REFCOUNTS, refcount_id, None));
                }
                all_removed = true;
            } else {
                let targets: HashSet<u32> = revisions.iter().copied().collect();
                let latest = read_metadata(r, uri)?.0.latest_revision;
                if targets.contains(&latest) {
                    // Leaving older revisions behind the removed latest would
                    // break latest-revision bookkeeping for every consumer.
                    return Err(SecretsError::InvalidArgument(format!(
                        "cannot delete the latest revision of {uri} without deleting the secret"
                    )));
                }
                for (id, revno, rev) in &existing {
                    if !targets.contains(&rev.revision) {
                        continue;
                    }
                    txn.push(Op::remove(records::REVISIONS, id.clone(), Some(*revno)));
                    if r.exists(records::EXPIRY, id) {
                        txn.push(Op::remove(records::EXPIRY, id.clone(), None));
                    }
                }
                // Serialise against concurrent revision appends.
                txn.require(Precondition::revno_is(
                    records::METADATA,
                    uri.id(),
                    metadata_revno,
                ));
                all_removed = false;
            }

            txn.require(leader_precondition(&leader_token));
            Ok(TxnOutcome::Commit(txn))
        })?;
        tracing::debug!(%uri, all_removed, "secret delete");
        Ok(all_removed)
    }

    /// Record that rotation happened and schedule the next one.
    ///
    /// Concurrent schedulers resolve to the earliest time: the first attempt
    /// writes unconditionally, and a retry caused by a concurrent writer
    /// keeps the stored time unless ours is earlier.
    pub fn secret_rotated(&self, uri: &SecretUri, next_rotate_ms: i64) -> Result<()> {
        if next_rotate_ms <= 0 {
            return Err(SecretsError::InvalidArgument(
                "must specify a positive next rotate time".to_string(),
            ));
        }
        self.store.run_txn::<SecretsError, _>(|r, attempt| {
            if !r.exists(records::METADATA, uri.id()) {
                return Err(SecretsError::NotFound(format!("secret {uri}")));
            }
            let revno = r.revno(records::ROTATE, uri.id()).ok_or_else(|| {
                SecretsError::NotFound(format!("rotation schedule for secret {uri}"))
            })?;
            let doc = r.get(records::ROTATE, uri.id()).ok_or_else(|| {
                SecretsError::NotFound(format!("rotation schedule for secret {uri}"))
            })?;
            let rotate: RotateDoc = from_document(&doc)?;
            if attempt > 0 && rotate.next_rotate_ms <= next_rotate_ms {
                // A concurrent scheduler stored an earlier time; it wins.
                return Ok(TxnOutcome::NoOp);
            }
            let mut txn = Txn::new();
            txn.push(Op::update(
                records::ROTATE,
                uri.id(),
                to_document(&RotateDoc {
                    owner_tag: rotate.owner_tag,
                    next_rotate_ms,
                })?,
                Some(revno),
            ));
            Ok(TxnOutcome::Commit(txn))
        })
    }

    /// Record which revision a consumer uses and its local label.
    ///
    /// The stored latest-revision is re-read inside the transaction, so
    /// `current ≤ latest` holds however the save races with updates; a
    /// current-revision beyond the store's latest names a revision that does
    /// not exist and is refused. Creating a new consumer row increments the
    /// secret's consumer refcount.
    pub fn save_secret_consumer(
        &self,
        uri: &SecretUri,
        consumer: &Tag,
        metadata: &SecretConsumerMetadata,
    ) -> Result<()> {
        let consumer_tag = consumer.to_string();
        self.store.run_txn::<SecretsError, _>(|r, _attempt| {
            let (secret_metadata, _) = read_metadata(r, uri)?;
            if metadata.current_revision > secret_metadata.latest_revision {
                return Err(SecretsError::NotFound(format!(
                    "secret revision {uri}/{}",
                    metadata.current_revision
                )));
            }
            let now = self.clock.now_ms();
            let id = records::consumer_id(uri, consumer);
            let doc = ConsumerDoc {
                consumer_tag: consumer_tag.clone(),
                label: metadata.label.clone(),
                current_revision: metadata.current_revision,
                latest_revision: secret_metadata.latest_revision,
            };

            let mut txn = Txn::new();
            match r.revno(records::CONSUMERS, &id) {
                Some(revno) => {
                    txn.push(Op::update(
                        records::CONSUMERS,
                        id.clone(),
                        to_document(&doc)?,
                        Some(revno),
                    ));
                }
                None => {
                    txn.push(Op::insert(records::CONSUMERS, id.clone(), to_document(&doc)?));
                    bump_refcount(&mut txn, r, uri, 1)?;
                }
            }

            // Revisions this save leaves unpinned become obsolete; only
            // newly flipped rows are touched.
            let mut pinned: HashSet<u32> = read_consumers(r, uri)?
                .into_iter()
                .filter(|(other_id, _, _)| *other_id != id)
                .map(|(_, _, c)| c.current_revision)
                .collect();
            pinned.insert(metadata.current_revision);
            for (rev_id, revno, mut rev) in read_revisions(r, uri)? {
                if rev.pending_delete
                    || rev.obsolete
                    || rev.revision == secret_metadata.latest_revision
                    || pinned.contains(&rev.revision)
                {
                    continue;
                }
                rev.obsolete = true;
                rev.update_time_ms = now;
                txn.push(Op::update(
                    records::REVISIONS,
                    rev_id,
                    to_document(&rev)?,
                    Some(revno),
                ));
            }
            Ok(TxnOutcome::Commit(txn))
        })
    }

    /// Drop a consumer's row, e.g. when the consuming unit has gone away.
    /// Decrements the refcount and marks revisions the consumer leaves
    /// unpinned obsolete. Succeeds if the row (or the secret) is already
    /// gone.
    pub fn remove_secret_consumer(&self, uri: &SecretUri, consumer: &Tag) -> Result<()> {
        self.store.run_txn::<SecretsError, _>(|r, _attempt| {
            let id = records::consumer_id(uri, consumer);
            let Some(revno) = r.revno(records::CONSUMERS, &id) else {
                return Ok(TxnOutcome::NoOp);
            };
            let Ok((secret_metadata, _)) = read_metadata(r, uri) else {
                return Ok(TxnOutcome::NoOp);
            };
            let now = self.clock.now_ms();
            let mut txn = Txn::new();
            txn.push(Op::remove(records::CONSUMERS, id.clone(), Some(revno)));
            bump_refcount(&mut txn, r, uri, -1)?;

            let pinned: HashSet<u32> = read_consumers(r, uri)?
                .into_iter()
                .filter(|(other_id, _, _)| *other_id != id)
                .map(|(_, _, c)| c.current_revision)
                .collect();
            for (rev_id, rev_revno, mut rev) in read_revisions(r, uri)? {
                if rev.pending_delete
                    || rev.obsolete
                    || rev.revision == secret_metadata.latest_revision
                    || pinned.contains(&rev.revision)
                {
                    continue;
                }
                rev.obsolete = true;
                rev.update_time_ms = now;
                txn.push(Op::update(
                    records::REVISIONS,
                    rev_id,
                    to_document(&rev)?,
                    Some(rev_revno),
                ));
            }
            Ok(TxnOutcome::Commit(txn))
        })
    }

    /// Fetch what a consumer recorded about a secret.
    pub fn get_secret_consumer(
        &self,
        uri: &SecretUri,
        consumer: &Tag,
    ) -> Result<SecretConsumerMetadata> {
        let id = records::consumer_id(uri, consumer);
        let doc = self.store.read(|r| r.get(records::CONSUMERS, &id));
        let doc = doc.ok_or_else(|| {
            SecretsError::NotFound(format!("consumer {consumer} of secret {uri}"))
        })?;
        let consumer: ConsumerDoc = from_document(&doc)?;
        Ok(SecretConsumerMetadata {
            label: consumer.label,
            current_revision: consumer.current_revision,
            latest_revision: consumer.latest_revision,
        })
    }

    /// The secret's consumer refcount. Not part of the public contract;
    /// tests use it to assert whole-secret delete reclaimed everything.
    pub fn consumer_refcount(&self, uri: &SecretUri) -> Result<i64> {
        let id = records::refcount_id(uri);
        let doc = self.store.read(|r| r.get(records::REFCOUNTS, &id));
        let doc = doc
            .ok_or_else(|| SecretsError::NotFound(format!("consumer refcount for {uri}")))?;
        let refcount: RefCountDoc = from_document(&doc)?;
        Ok(refcount.refcount)
    }

    pub(crate) fn entities(&self) -> &Arc<dyn EntityChecker> {
        &self.entities
    }

    fn to_metadata(
        &self,
        uri: &SecretUri,
        doc: &MetadataDoc,
        next_rotate_ms: i64,
    ) -> Result<SecretMetadata> {
        Ok(SecretMetadata {
            uri: uri.clone(),
            owner: Tag::parse(&doc.owner_tag)?,
            version: doc.version,
            description: doc.description.clone(),
            label: doc.label.clone(),
            rotate_policy: doc.rotate_policy,
            next_rotate_time_ms: next_rotate_ms,
            latest_revision: doc.latest_revision,
            latest_expire_time_ms: doc.latest_expire_ms,
            create_time_ms: doc.create_time_ms,
            update_time_ms: doc.update_time_ms,
        })
    }
}

fn to_revision_metadata(rev: &RevisionDoc) -> SecretRevisionMetadata {
    SecretRevisionMetadata {
        revision: rev.revision,
        provider_id: rev.provider_id.clone(),
        expire_time_ms: rev.expire_ms,
        obsolete: rev.obsolete,
        create_time_ms: rev.create_time_ms,
        update_time_ms: rev.update_time_ms,
    }
}

pub(crate) fn read_metadata(
    r: &StoreReader<'_>,
    uri: &SecretUri,
) -> Result<(MetadataDoc, u64)> {
    let revno = r
        .revno(records::METADATA, uri.id())
        .ok_or_else(|| SecretsError::NotFound(format!("secret {uri}")))?;
    let doc = r
        .get(records::METADATA, uri.id())
        .ok_or_else(|| SecretsError::NotFound(format!("secret {uri}")))?;
    Ok((from_document(&doc)?, revno))
}

fn read_next_rotate(r: &StoreReader<'_>, uri: &SecretUri) -> i64 {
    r.get(records::ROTATE, uri.id())
        .and_then(|doc| from_document::<RotateDoc>(&doc).ok())
        .map_or(0, |rotate| rotate.next_rotate_ms)
}

fn read_consumers(
    r: &StoreReader<'_>,
    uri: &SecretUri,
) -> Result<Vec<(String, u64, ConsumerDoc)>> {
    let mut result = Vec::new();
    for (id, doc) in r.scan(records::CONSUMERS, &format!("{}#", uri.id())) {
        let revno = r
            .revno(records::CONSUMERS, &id)
            .ok_or_else(|| SecretsError::Serialization(format!("consumer row {id} vanished")))?;
        result.push((id, revno, from_document(&doc)?));
    }
    Ok(result)
}

fn read_revisions(
    r: &StoreReader<'_>,
    uri: &SecretUri,
) -> Result<Vec<(String, u64, RevisionDoc)>> {
    let mut result = Vec::new();
    for (id, doc) in r.scan(records::REVISIONS, &format!("{}/", uri.id())) {
        let revno = r
            .revno(records::REVISIONS, &id)
            .ok_or_else(|| SecretsError::Serialization(format!("revision row {id} vanished")))?;
        result.push((id, revno, from_document(&doc)?));
    }
    Ok(result)
}

fn label_in_use(
    r: &StoreReader<'_>,
    owner_tag: &str,
    label: &str,
    exclude_id: Option<&str>,
) -> bool {
    for (id, doc) in r.scan(records::METADATA, "") {
        if exclude_id == Some(id.as_str()) {
            continue;
        }
        let same_owner = doc
            .get("owner_tag")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|tag| tag == owner_tag);
        let same_label = doc
            .get("label")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|l| l == label);
        if same_owner && same_label {
            return true;
        }
    }
    false
}

fn label_precondition(
    owner_tag: &str,
    label: &str,
    exclude_id: Option<String>,
) -> Precondition<SecretsError> {
    let owner_tag = owner_tag.to_string();
    let label = label.to_string();
    Precondition::check("owner label unique", move |r| {
        if label_in_use(r, &owner_tag, &label, exclude_id.as_deref()) {
            return Err(SecretsError::LabelExists(label.clone()));
        }
        Ok(())
    })
}

fn upsert(
    txn: &mut Txn<SecretsError>,
    r: &StoreReader<'_>,
    collection: &str,
    id: &str,
    doc: warden_store::Document,
) {
    match r.revno(collection, id) {
        Some(revno) => txn.push(Op::update(collection, id, doc, Some(revno))),
        None => txn.push(Op::insert(collection, id, doc)),
    }
}

fn bump_refcount(
    txn: &mut Txn<SecretsError>,
    r: &StoreReader<'_>,
    uri: &SecretUri,
    delta: i64,
) -> Result<()> {
    let id = records::refcount_id(uri);
    match r.revno(records::REFCOUNTS, &id) {
        Some(revno) => {
            let doc = r
                .get(records::REFCOUNTS, &id)
                .ok_or_else(|| SecretsError::Serialization(format!("refcount row {id} vanished")))?;
            let refcount: RefCountDoc = from_document(&doc)?;
            txn.push(Op::update(
                records::REFCOUNTS,
                id,
                to_document(&RefCountDoc {
                    refcount: refcount.refcount + delta,
                })?,
                Some(revno),
            ));
        }
        None => {
            txn.push(Op::insert(
                records::REFCOUNTS,
                id,
                to_document(&RefCountDoc { refcount: delta })?,
            ));
        }
    }
    Ok(())
}
