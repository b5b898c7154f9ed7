// SPDX-License-Identifier: MIT OR Apache-2.0
//! Access control: grant, revoke, and look up a subject's role on a secret.
//!
//! Permissions are keyed by `(URI, subject)` so revocation is a single
//! document removal and the consumed-filter of `list_secrets` is one index
//! scan. The scope (a relation, or the owner application) records why the
//! grant exists; changing the role of an existing grant overwrites it.

use crate::leader::leader_precondition;
use crate::records::{self, from_document, to_document, PermissionDoc};
use crate::store::read_metadata;
use crate::{
    Result, SecretAccessParams, SecretRole, SecretUri, SecretsError, SecretsStore, Tag,
};

use std::sync::Arc;

use warden_store::{Op, Txn, TxnOutcome};

use crate::LeaderToken;

impl SecretsStore {
    /// Grant `subject` a role on the secret, scoped by a relation or the
    /// owner application. Granting the same access twice is a no-op;
    /// granting a different role overwrites.
    pub fn grant_secret_access(&self, uri: &SecretUri, params: SecretAccessParams) -> Result<()> {
        let doc_store = self.doc_store().clone();
        doc_store.run_txn::<SecretsError, _>(|r, _attempt| {
            read_metadata(r, uri)?;
            if !self.entities().life(&params.scope).is_alive() {
                return Err(SecretsError::NotAlive(format!(
                    "cannot grant access to secret in scope of {} which is not alive",
                    params.scope
                )));
            }
            if !self.entities().life(&params.subject).is_alive() {
                return Err(SecretsError::NotAlive(format!(
                    "cannot grant access to secret for subject {} which is not alive",
                    params.subject
                )));
            }
            if self.entities().is_cross_model(&params.subject) {
                return Err(SecretsError::NotSupported(format!(
                    "cannot grant secret access to cross-model subject {}",
                    params.subject
                )));
            }

            let id = records::permission_id(uri, &params.subject);
            let doc = to_document(&PermissionDoc {
                subject_tag: params.subject.to_string(),
                scope_tag: params.scope.to_string(),
                role: params.role,
            })?;
            let mut txn = Txn::new();
            match r.revno(records::PERMISSIONS, &id) {
                Some(revno) => txn.push(Op::update(records::PERMISSIONS, id, doc, Some(revno))),
                None => txn.push(Op::insert(records::PERMISSIONS, id, doc)),
            }
            txn.require(leader_precondition(&params.leader_token));
            Ok(TxnOutcome::Commit(txn))
        })
    }

    /// Remove `subject`'s access. Succeeds whether or not a grant exists.
    pub fn revoke_secret_access(
        &self,
        uri: &SecretUri,
        leader_token: Arc<dyn LeaderToken>,
        subject: &Tag,
    ) -> Result<()> {
        let id = records::permission_id(uri, subject);
        let doc_store = self.doc_store().clone();
        doc_store.run_txn::<SecretsError, _>(|r, _attempt| {
            let Some(revno) = r.revno(records::PERMISSIONS, &id) else {
                return Ok(TxnOutcome::NoOp);
            };
            let mut txn = Txn::new();
            txn.push(Op::remove(records::PERMISSIONS, id.clone(), Some(revno)));
            txn.require(leader_precondition(&leader_token));
            Ok(TxnOutcome::Commit(txn))
        })
    }

    /// The role `subject` holds on the secret; `None` when no grant exists.
    pub fn secret_access(&self, uri: &SecretUri, subject: &Tag) -> Result<SecretRole> {
        let id = records::permission_id(uri, subject);
        let doc = self
            .doc_store()
            .read(|r| r.get(records::PERMISSIONS, &id));
        match doc {
            Some(doc) => {
                let permission: PermissionDoc = from_document(&doc)?;
                Ok(permission.role)
            }
            None => Ok(SecretRole::None),
        }
    }
}
