// SPDX-License-Identifier: MIT OR Apache-2.0
//! Entity tags.
//!
//! The surrounding model addresses applications, units, relations, and
//! models by tag strings (`application-mysql`, `unit-mariadb-0`,
//! `relation-wordpress.db#mysql.server`, `model-<uuid>`). The core keeps
//! the payload opaque and enforces only the shape.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{Result, SecretsError};

/// A typed entity reference with a canonical string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tag {
    /// `application-<name>`
    Application(String),
    /// `unit-<name>-<n>`; the unit name is held as `<name>/<n>`.
    Unit(String),
    /// `relation-<ep1>#<ep2>`
    Relation(String),
    /// `model-<uuid>`
    Model(String),
}

impl Tag {
    pub fn application(name: impl Into<String>) -> Self {
        Self::Application(name.into())
    }

    /// A unit tag from a `<application>/<number>` unit name.
    pub fn unit(name: impl Into<String>) -> Self {
        Self::Unit(name.into())
    }

    pub fn relation(key: impl Into<String>) -> Self {
        Self::Relation(key.into())
    }

    pub fn model(uuid: impl Into<String>) -> Self {
        Self::Model(uuid.into())
    }

    /// Parse a canonical tag string.
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(name) = s.strip_prefix("application-") {
            if name.is_empty() {
                return Err(SecretsError::InvalidArgument(format!("invalid tag {s:?}")));
            }
            return Ok(Self::Application(name.to_string()));
        }
        if let Some(rest) = s.strip_prefix("unit-") {
            let (name, number) = rest
                .rsplit_once('-')
                .ok_or_else(|| SecretsError::InvalidArgument(format!("invalid tag {s:?}")))?;
            if name.is_empty() || number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit())
            {
                return Err(SecretsError::InvalidArgument(format!("invalid tag {s:?}")));
            }
            return Ok(Self::Unit(format!("{name}/{number}")));
        }
        if let Some(key) = s.strip_prefix("relation-") {
            if key.is_empty() {
                return Err(SecretsError::InvalidArgument(format!("invalid tag {s:?}")));
            }
            return Ok(Self::Relation(key.to_string()));
        }
        if let Some(uuid) = s.strip_prefix("model-") {
            if uuid.is_empty() {
                return Err(SecretsError::InvalidArgument(format!("invalid tag {s:?}")));
            }
            return Ok(Self::Model(uuid.to_string()));
        }
        Err(SecretsError::InvalidArgument(format!(
            "unrecognised tag {s:?}"
        )))
    }

    /// The entity kind, e.g. `"unit"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Application(_) => "application",
            Self::Unit(_) => "unit",
            Self::Relation(_) => "relation",
            Self::Model(_) => "model",
        }
    }

    /// The untyped payload, e.g. the unit name `mariadb/0`.
    pub fn id(&self) -> &str {
        match self {
            Self::Application(s) | Self::Unit(s) | Self::Relation(s) | Self::Model(s) => s,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application(name) => write!(f, "application-{name}"),
            Self::Unit(name) => write!(f, "unit-{}", name.replace('/', "-")),
            Self::Relation(key) => write!(f, "relation-{key}"),
            Self::Model(uuid) => write!(f, "model-{uuid}"),
        }
    }
}

impl FromStr for Tag {
    type Err = SecretsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Lifecycle state of an entity, as reported by the surrounding model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Life {
    Alive,
    Dying,
    Dead,
}

impl Life {
    pub fn is_alive(self) -> bool {
        self == Self::Alive
    }
}

/// External collaborator answering lifecycle questions about tags.
///
/// The secrets core stores tags as opaque keys; whether the entity behind a
/// tag is alive, and whether it is a cross-model proxy, is the surrounding
/// domain model's knowledge.
pub trait EntityChecker: fmt::Debug + Send + Sync {
    fn life(&self, tag: &Tag) -> Life;
    fn is_cross_model(&self, tag: &Tag) -> bool;
}

/// In-memory [`EntityChecker`] for tests: everything is alive unless marked
/// otherwise.
#[derive(Debug, Default)]
pub struct FakeEntityWorld {
    life: RwLock<HashMap<String, Life>>,
    cross_model: RwLock<HashSet<String>>,
}

impl FakeEntityWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_life(&self, tag: &Tag, life: Life) {
        self.life.write().insert(tag.to_string(), life);
    }

    pub fn mark_cross_model(&self, tag: &Tag) {
        self.cross_model.write().insert(tag.to_string());
    }
}

impl EntityChecker for FakeEntityWorld {
    fn life(&self, tag: &Tag) -> Life {
        self.life
            .read()
            .get(&tag.to_string())
            .copied()
            .unwrap_or(Life::Alive)
    }

    fn is_cross_model(&self, tag: &Tag) -> bool {
        self.cross_model.read().contains(&tag.to_string())
    }
}
