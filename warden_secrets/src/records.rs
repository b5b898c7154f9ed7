// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persisted document schema.
//!
//! Seven collections back the subsystem. Ids encode the natural key:
//! revisions and expiry entries as `<uri-id>/<rev>`, consumers and
//! permissions as `<uri-id>#<tag>`, the consumer refcount as
//! `<uri-id>#consumer`. Revision and expiry documents carry the owner tag so
//! ownership-filtered watchers need no join.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use warden_store::Document;

use crate::{Result, RotatePolicy, SecretRole, SecretUri, SecretsError, Tag};

pub const METADATA: &str = "secretMetadata";
pub const REVISIONS: &str = "secretRevisions";
pub const CONSUMERS: &str = "secretConsumers";
pub const PERMISSIONS: &str = "secretPermissions";
pub const ROTATE: &str = "secretRotate";
pub const EXPIRY: &str = "secretExpiry";
pub const REFCOUNTS: &str = "refcounts";

/// Every collection a secret may leave rows in.
pub const ALL_COLLECTIONS: [&str; 7] = [
    METADATA, REVISIONS, CONSUMERS, PERMISSIONS, ROTATE, EXPIRY, REFCOUNTS,
];

pub fn revision_id(uri: &SecretUri, revision: u32) -> String {
    format!("{}/{revision}", uri.id())
}

pub fn consumer_id(uri: &SecretUri, consumer: &Tag) -> String {
    format!("{}#{consumer}", uri.id())
}

pub fn permission_id(uri: &SecretUri, subject: &Tag) -> String {
    format!("{}#{subject}", uri.id())
}

pub fn refcount_id(uri: &SecretUri) -> String {
    format!("{}#consumer", uri.id())
}

/// One record per secret, keyed by the URI id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataDoc {
    pub owner_tag: String,
    pub version: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub rotate_policy: RotatePolicy,
    pub latest_revision: u32,
    /// Expiry of the latest revision; 0 when it has none.
    #[serde(default)]
    pub latest_expire_ms: i64,
    pub create_time_ms: i64,
    pub update_time_ms: i64,
}

/// One record per `(URI, revision)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionDoc {
    pub owner_tag: String,
    pub revision: u32,
    /// Inline encoded data; exactly one of `data` and `provider_id` is set.
    #[serde(default)]
    pub data: Option<BTreeMap<String, String>>,
    /// Content id in the external backend.
    #[serde(default)]
    pub provider_id: Option<String>,
    /// Expiry deadline; 0 when none.
    #[serde(default)]
    pub expire_ms: i64,
    /// A non-latest revision no consumer pins.
    #[serde(default)]
    pub obsolete: bool,
    /// Staged for deletion; suppresses obsolete announcements.
    #[serde(default)]
    pub pending_delete: bool,
    pub create_time_ms: i64,
    pub update_time_ms: i64,
}

/// One record per `(URI, consumer)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerDoc {
    pub consumer_tag: String,
    #[serde(default)]
    pub label: String,
    pub current_revision: u32,
    pub latest_revision: u32,
}

/// One record per `(URI, subject)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionDoc {
    pub subject_tag: String,
    pub scope_tag: String,
    pub role: SecretRole,
}

/// Rotation index entry; present iff the secret's policy rotates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateDoc {
    pub owner_tag: String,
    pub next_rotate_ms: i64,
}

/// Expiry index entry; present iff the revision has an expiry deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiryDoc {
    pub owner_tag: String,
    pub revision: u32,
    pub expire_ms: i64,
}

/// Per-secret consumer refcount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefCountDoc {
    pub refcount: i64,
}

/// Encode a record as a store document.
pub fn to_document<T: Serialize>(record: &T) -> Result<Document> {
    match serde_json::to_value(record) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(SecretsError::Serialization(format!(
            "record did not encode to an object: {other}"
        ))),
        Err(err) => Err(SecretsError::Serialization(err.to_string())),
    }
}

/// Decode a store document back into a record.
pub fn from_document<T: DeserializeOwned>(doc: &Document) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(doc.clone()))
        .map_err(|err| SecretsError::Serialization(err.to_string()))
}
