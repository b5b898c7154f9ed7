// SPDX-License-Identifier: MIT OR Apache-2.0
//! Secret identifiers.
//!
//! A secret is addressed by a globally unique URI with the textual form
//! `secret:<id>`, where `<id>` is 20 characters from the `0-9a-z` alphabet.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Result, SecretsError};

/// Scheme prefix of the textual form.
pub const URI_SCHEME: &str = "secret:";

/// Length of a secret id.
pub const ID_LENGTH: usize = 20;

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Globally unique secret identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretUri {
    id: String,
}

impl SecretUri {
    /// Mint a fresh identifier.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let id = (0..ID_LENGTH)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        Self { id }
    }

    /// Parse the textual form `secret:<id>`.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(SecretsError::InvalidArgument("empty URI".to_string()));
        }
        let id = s
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| SecretsError::InvalidArgument(format!("invalid secret URI {s:?}")))?;
        Self::from_id(id)
    }

    /// Build a URI from a bare id, validating length and alphabet.
    pub fn from_id(id: &str) -> Result<Self> {
        if id.len() != ID_LENGTH || !id.bytes().all(|b| ALPHABET.contains(&b)) {
            return Err(SecretsError::InvalidArgument(format!(
                "invalid secret id {id:?}"
            )));
        }
        Ok(Self { id: id.to_string() })
    }

    /// The bare id, without the scheme prefix.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Default for SecretUri {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SecretUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{URI_SCHEME}{}", self.id)
    }
}

impl fmt::Debug for SecretUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretUri({URI_SCHEME}{})", self.id)
    }
}

impl FromStr for SecretUri {
    type Err = SecretsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
