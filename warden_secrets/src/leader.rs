// SPDX-License-Identifier: MIT OR Apache-2.0
//! Leader tokens.
//!
//! Owner-mutating operations carry an opaque capability proving the caller
//! is the current application leader. The token is re-validated as a
//! precondition inside the commit, so leadership lost between call entry and
//! commit aborts the transaction rather than slipping through.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use warden_store::Precondition;

use crate::{Result, SecretsError};

/// Capability asserting application leadership.
pub trait LeaderToken: fmt::Debug + Send + Sync {
    /// Succeeds while the caller still holds leadership.
    fn check(&self) -> Result<()>;
}

/// The commit-time leader assertion every owner-mutating transaction
/// carries. One definition, so the discipline cannot drift between call
/// sites.
pub(crate) fn leader_precondition(token: &Arc<dyn LeaderToken>) -> Precondition<SecretsError> {
    let token = Arc::clone(token);
    Precondition::check("leader token still valid", move |_| token.check())
}

/// A token that always validates. The default for unit owners, which lead
/// themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysLeader;

impl LeaderToken for AlwaysLeader {
    fn check(&self) -> Result<()> {
        Ok(())
    }
}

/// A token that can be revoked mid-flight; used to exercise the
/// leadership-lost path in tests.
#[derive(Debug, Default)]
pub struct RevocableLeader {
    revoked: AtomicBool,
}

impl RevocableLeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }
}

impl LeaderToken for RevocableLeader {
    fn check(&self) -> Result<()> {
        if self.revoked.load(Ordering::SeqCst) {
            return Err(SecretsError::LeadershipLost(
                "leader token no longer valid".to_string(),
            ));
        }
        Ok(())
    }
}
