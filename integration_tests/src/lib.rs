// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared helpers for the warden integration tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use warden_secrets::{
    AlwaysLeader, Clock, CreateSecretParams, FakeEntityWorld, LeaderToken, ManualClock,
    RotatePolicy, SecretsStore, Tag, UpdateSecretParams,
};
use warden_store::DocStore;
use warden_watch::Watcher;

pub const MINUTE_MS: i64 = 60 * 1_000;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;

/// A secrets store over a fresh in-memory document store, with a manual
/// clock and an entity world where everything is alive unless marked.
pub struct TestEnv {
    pub secrets: SecretsStore,
    pub world: Arc<FakeEntityWorld>,
    pub clock: Arc<ManualClock>,
}

impl TestEnv {
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}

pub fn create_test_env() -> TestEnv {
    let world = Arc::new(FakeEntityWorld::new());
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let secrets = SecretsStore::new(DocStore::new(), world.clone(), clock.clone());
    TestEnv {
        secrets,
        world,
        clock,
    }
}

pub fn token() -> Arc<dyn LeaderToken> {
    Arc::new(AlwaysLeader)
}

pub fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Create-params for a plain secret holding `{"foo": "bar"}`.
pub fn basic_create(owner: &Tag) -> CreateSecretParams {
    CreateSecretParams {
        version: 1,
        owner: owner.clone(),
        update: UpdateSecretParams::new(token()).with_data(data(&[("foo", "bar")])),
    }
}

/// Create-params for a daily-rotating secret.
pub fn rotating_create(owner: &Tag, next_rotate_ms: i64) -> CreateSecretParams {
    let mut params = basic_create(owner);
    params.update = params
        .update
        .with_rotate_policy(RotatePolicy::Daily, next_rotate_ms);
    params
}

/// Create-params for a secret whose first revision expires.
pub fn expiring_create(owner: &Tag, expire_ms: i64) -> CreateSecretParams {
    let mut params = basic_create(owner);
    params.update = params.update.with_expire_time(expire_ms);
    params
}

/// Receive the next batch, failing if none arrives promptly.
pub async fn next_batch<T>(watcher: &mut Watcher<T>) -> Vec<T> {
    tokio::time::timeout(Duration::from_secs(5), watcher.recv())
        .await
        .expect("timed out waiting for a watcher event")
        .expect("watcher closed while an event was expected")
}

/// Assert that no batch arrives within a grace period. On a current-thread
/// runtime the await also lets the watcher task drain everything already
/// committed.
pub async fn assert_no_change<T: std::fmt::Debug>(watcher: &mut Watcher<T>) {
    let outcome = tokio::time::timeout(Duration::from_millis(100), watcher.recv()).await;
    if let Ok(batch) = outcome {
        panic!("expected no watcher event, got {batch:?}");
    }
}
