// SPDX-License-Identifier: MIT OR Apache-2.0
//! Warden secrets core: a transactional, multi-tenant store of versioned
//! secret values with owner/consumer access control, rotation scheduling,
//! expiry scheduling, and a committed-change stream for reactive watchers.
//!
//! Producing workloads own secrets and mutate them under a leader token;
//! consuming workloads record which revision they use. The store guarantees
//! that readers can discover new revisions, that owners can be told when
//! rotation or expiry is due, and that obsolete revisions can be reclaimed.
//!
//! Secret material is either an inline key/value map or a content id
//! pointing into an external backend; encryption at rest belongs to that
//! backend, not to this crate.

mod access;
mod clock;
mod error;
mod leader;
mod params;
pub mod records;
mod store;
mod tags;
mod uri;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, SecretsError};
pub use leader::{AlwaysLeader, LeaderToken, RevocableLeader};
pub use params::{CreateSecretParams, SecretAccessParams, SecretsFilter, UpdateSecretParams};
pub use store::SecretsStore;
pub use tags::{EntityChecker, FakeEntityWorld, Life, Tag};
pub use uri::{SecretUri, ID_LENGTH, URI_SCHEME};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How often a secret's owner intends to rotate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotatePolicy {
    #[default]
    Never,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl RotatePolicy {
    /// Whether this policy puts the secret on the rotation schedule.
    pub fn will_rotate(self) -> bool {
        self != Self::Never
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }
}

impl fmt::Display for RotatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RotatePolicy {
    type Err = SecretsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "never" => Ok(Self::Never),
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "yearly" => Ok(Self::Yearly),
            _ => Err(SecretsError::InvalidArgument(format!(
                "invalid rotate policy {s:?}"
            ))),
        }
    }
}

/// Access level a subject holds on a secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretRole {
    #[default]
    None,
    View,
    Rotate,
    Manage,
}

impl SecretRole {
    /// Check whether this role covers the given operation level.
    pub fn allows(self, required: Self) -> bool {
        self.level() >= required.level() && required != Self::None
    }

    fn level(self) -> u8 {
        match self {
            Self::None => 0,
            Self::View => 1,
            Self::Rotate => 2,
            Self::Manage => 3,
        }
    }
}

/// Inline secret content: an encoded key/value map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretValue(BTreeMap<String, String>);

impl SecretValue {
    pub fn new(data: BTreeMap<String, String>) -> Self {
        Self(data)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// The encoded key/value pairs.
    pub fn encoded(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl<const N: usize> From<[(&str, &str); N]> for SecretValue {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

/// Metadata of one secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretMetadata {
    pub uri: SecretUri,
    pub owner: Tag,
    /// Schema version of the record.
    pub version: u32,
    pub description: String,
    pub label: String,
    pub rotate_policy: RotatePolicy,
    /// Next scheduled rotation; 0 when the secret does not rotate.
    pub next_rotate_time_ms: i64,
    pub latest_revision: u32,
    /// Expiry of the latest revision; 0 when it has none.
    pub latest_expire_time_ms: i64,
    pub create_time_ms: i64,
    pub update_time_ms: i64,
}

/// Metadata of one secret revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRevisionMetadata {
    pub revision: u32,
    /// Content id in the external backend, for externally-held revisions.
    pub provider_id: Option<String>,
    /// Expiry deadline; 0 when the revision has none.
    pub expire_time_ms: i64,
    /// A non-latest revision no consumer pins.
    pub obsolete: bool,
    pub create_time_ms: i64,
    pub update_time_ms: i64,
}

/// What a consumer knows about a secret it uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretConsumerMetadata {
    /// The consumer's local nickname for the secret.
    pub label: String,
    /// The revision the consumer has adopted.
    pub current_revision: u32,
    /// The latest revision known to exist at the time of the last save.
    /// Maintained by the store; the caller's value is ignored on save.
    pub latest_revision: u32,
}
