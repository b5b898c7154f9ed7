// SPDX-License-Identifier: MIT OR Apache-2.0
//! Operation parameter types.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{
    LeaderToken, Result, RotatePolicy, SecretRole, SecretUri, SecretsError, Tag,
};

/// Options recognised by a secret update.
///
/// At most one of `data` and `provider_id` may be set; supplying either
/// appends a new revision. An `expire_time_ms` of 0 clears the latest
/// revision's expiry; a non-zero value sets it.
#[derive(Debug, Clone)]
pub struct UpdateSecretParams {
    /// Capability re-validated at commit for owner-mutating calls.
    pub leader_token: Arc<dyn LeaderToken>,
    pub rotate_policy: Option<RotatePolicy>,
    pub next_rotate_time_ms: Option<i64>,
    pub description: Option<String>,
    pub label: Option<String>,
    pub expire_time_ms: Option<i64>,
    /// Opaque hint forwarded to the backend driver; never persisted.
    pub params: Option<BTreeMap<String, String>>,
    /// Inline content for the new revision.
    pub data: Option<BTreeMap<String, String>>,
    /// External-backend content id for the new revision.
    pub provider_id: Option<String>,
}

impl UpdateSecretParams {
    pub fn new(leader_token: Arc<dyn LeaderToken>) -> Self {
        Self {
            leader_token,
            rotate_policy: None,
            next_rotate_time_ms: None,
            description: None,
            label: None,
            expire_time_ms: None,
            params: None,
            data: None,
            provider_id: None,
        }
    }

    pub fn with_data(mut self, data: BTreeMap<String, String>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_provider_id(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_rotate_policy(mut self, policy: RotatePolicy, next_rotate_ms: i64) -> Self {
        self.rotate_policy = Some(policy);
        if policy.will_rotate() {
            self.next_rotate_time_ms = Some(next_rotate_ms);
        }
        self
    }

    pub fn with_expire_time(mut self, expire_ms: i64) -> Self {
        self.expire_time_ms = Some(expire_ms);
        self
    }

    /// Whether anything at all would change.
    pub fn has_update(&self) -> bool {
        self.rotate_policy.is_some()
            || self.next_rotate_time_ms.is_some()
            || self.description.is_some()
            || self.label.is_some()
            || self.expire_time_ms.is_some()
            || self.data.is_some()
            || self.provider_id.is_some()
    }

    /// Structural validation shared by create and update.
    pub fn validate(&self) -> Result<()> {
        match (&self.data, &self.provider_id) {
            (Some(_), Some(_)) => {
                return Err(SecretsError::InvalidArgument(
                    "cannot specify both secret data and a provider id".to_string(),
                ))
            }
            (Some(data), None) if data.is_empty() => {
                return Err(SecretsError::InvalidArgument(
                    "cannot specify empty secret data".to_string(),
                ))
            }
            (None, Some(id)) if id.is_empty() => {
                return Err(SecretsError::InvalidArgument(
                    "cannot specify an empty provider id".to_string(),
                ))
            }
            _ => {}
        }
        if let Some(expire_ms) = self.expire_time_ms {
            if expire_ms < 0 {
                return Err(SecretsError::InvalidArgument(
                    "expire time must not be negative".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Whether this update appends a new revision.
    pub fn has_new_content(&self) -> bool {
        self.data.is_some() || self.provider_id.is_some()
    }
}

/// Parameters for creating a secret.
#[derive(Debug, Clone)]
pub struct CreateSecretParams {
    /// Schema version of the metadata record.
    pub version: u32,
    pub owner: Tag,
    pub update: UpdateSecretParams,
}

/// Parameters for granting access to a secret.
#[derive(Debug, Clone)]
pub struct SecretAccessParams {
    pub leader_token: Arc<dyn LeaderToken>,
    /// The relation (or the owner application) justifying the grant.
    pub scope: Tag,
    pub subject: Tag,
    pub role: SecretRole,
}

/// Filter for [`SecretsStore::list_secrets`](crate::SecretsStore::list_secrets).
/// All populated fields must match (AND).
#[derive(Debug, Clone, Default)]
pub struct SecretsFilter {
    pub uri: Option<SecretUri>,
    pub owner_tags: Vec<Tag>,
    /// Secrets any of these subjects can view (view role or higher).
    pub consumer_tags: Vec<Tag>,
}

impl SecretsFilter {
    pub fn by_uri(uri: SecretUri) -> Self {
        Self {
            uri: Some(uri),
            ..Self::default()
        }
    }

    pub fn by_owners(owner_tags: Vec<Tag>) -> Self {
        Self {
            owner_tags,
            ..Self::default()
        }
    }

    pub fn by_consumers(consumer_tags: Vec<Tag>) -> Self {
        Self {
            consumer_tags,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.uri.is_none() && self.owner_tags.is_empty() && self.consumer_tags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AlwaysLeader;

    fn token() -> Arc<dyn LeaderToken> {
        Arc::new(AlwaysLeader)
    }

    #[test]
    fn test_empty_params_have_no_update() {
        assert!(!UpdateSecretParams::new(token()).has_update());
    }

    #[test]
    fn test_data_and_provider_id_conflict() {
        let params = UpdateSecretParams::new(token())
            .with_data(BTreeMap::from([("k".to_string(), "v".to_string())]))
            .with_provider_id("backend-id");
        assert!(params.validate().unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_empty_data_rejected() {
        let params = UpdateSecretParams::new(token()).with_data(BTreeMap::new());
        assert!(params.validate().unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_zero_expire_means_clear_and_is_valid() {
        let params = UpdateSecretParams::new(token()).with_expire_time(0);
        assert!(params.validate().is_ok());
        assert!(params.has_update());
        assert!(!params.has_new_content());
    }
}
