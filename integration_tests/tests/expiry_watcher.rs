// SPDX-License-Identifier: MIT OR Apache-2.0
//! Expiry trigger watcher scenarios.

use integration_tests::{
    assert_no_change, create_test_env, data, expiring_create, next_batch, token, HOUR_MS,
    MINUTE_MS,
};
use warden_secrets::{SecretUri, Tag, UpdateSecretParams};
use warden_watch::{watch_revision_expiry_changes, TriggerChange};

fn change(uri: &SecretUri, revision: u32, next_trigger_time_ms: i64) -> TriggerChange {
    TriggerChange {
        uri: uri.clone(),
        revision,
        next_trigger_time_ms,
    }
}

#[tokio::test]
async fn test_initial_event_carries_revision() {
    let env = create_test_env();
    let owner = Tag::application("mysql");
    let uri = SecretUri::new();
    let expire = env.now_ms() + MINUTE_MS;
    env.secrets
        .create_secret(&uri, expiring_create(&owner, expire))
        .unwrap();

    let mut watcher =
        watch_revision_expiry_changes(&env.secrets, &[owner.clone(), Tag::unit("mysql/0")]);
    assert_eq!(next_batch(&mut watcher).await, vec![change(&uri, 1, expire)]);
    assert_no_change(&mut watcher).await;
    watcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_clear_then_set_expiry() {
    let env = create_test_env();
    let owner = Tag::application("mysql");
    let uri = SecretUri::new();
    env.secrets
        .create_secret(&uri, expiring_create(&owner, env.now_ms() + MINUTE_MS))
        .unwrap();
    let mut watcher = watch_revision_expiry_changes(&env.secrets, &[owner.clone()]);
    next_batch(&mut watcher).await;

    // Zero expire-time clears the deadline: a removal event, revision kept.
    env.secrets
        .update_secret(&uri, UpdateSecretParams::new(token()).with_expire_time(0))
        .unwrap();
    assert_eq!(next_batch(&mut watcher).await, vec![change(&uri, 1, 0)]);

    let expire = env.now_ms() + 2 * HOUR_MS;
    env.secrets
        .update_secret(&uri, UpdateSecretParams::new(token()).with_expire_time(expire))
        .unwrap();
    assert_eq!(next_batch(&mut watcher).await, vec![change(&uri, 1, expire)]);
    assert_no_change(&mut watcher).await;
    watcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_new_expiring_revision_is_announced() {
    let env = create_test_env();
    let owner = Tag::application("mysql");
    let uri = SecretUri::new();
    env.secrets
        .create_secret(&uri, expiring_create(&owner, env.now_ms() + MINUTE_MS))
        .unwrap();
    let mut watcher = watch_revision_expiry_changes(&env.secrets, &[owner.clone()]);
    next_batch(&mut watcher).await;

    let expire = env.now_ms() + HOUR_MS;
    env.secrets
        .update_secret(
            &uri,
            UpdateSecretParams::new(token())
                .with_data(data(&[("foo", "bar2")]))
                .with_expire_time(expire),
        )
        .unwrap();
    assert_eq!(next_batch(&mut watcher).await, vec![change(&uri, 2, expire)]);
    watcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_secret_delete_emits_removals() {
    let env = create_test_env();
    let owner = Tag::application("mysql");
    let uri = SecretUri::new();
    env.secrets
        .create_secret(&uri, expiring_create(&owner, env.now_ms() + MINUTE_MS))
        .unwrap();
    let mut watcher = watch_revision_expiry_changes(&env.secrets, &[owner.clone()]);
    next_batch(&mut watcher).await;

    env.secrets.delete_secret(&uri, token(), &[]).unwrap();
    assert_eq!(next_batch(&mut watcher).await, vec![change(&uri, 1, 0)]);
    assert_no_change(&mut watcher).await;

    // A new expiring secret after the delete is announced normally.
    let uri2 = SecretUri::new();
    let expire = env.now_ms() + MINUTE_MS;
    env.secrets
        .create_secret(&uri2, expiring_create(&owner, expire))
        .unwrap();
    assert_eq!(next_batch(&mut watcher).await, vec![change(&uri2, 1, expire)]);
    watcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_revision_delete_emits_removal() {
    let env = create_test_env();
    let owner = Tag::application("mysql");
    let uri = SecretUri::new();
    env.secrets
        .create_secret(&uri, expiring_create(&owner, env.now_ms() + MINUTE_MS))
        .unwrap();
    // A second revision so the revision-form delete does not cascade.
    env.secrets
        .update_secret(
            &uri,
            UpdateSecretParams::new(token()).with_data(data(&[("foo", "bar2")])),
        )
        .unwrap();
    let mut watcher = watch_revision_expiry_changes(&env.secrets, &[owner.clone()]);
    next_batch(&mut watcher).await;

    let removed = env.secrets.delete_secret(&uri, token(), &[1]).unwrap();
    assert!(!removed);
    assert_eq!(next_batch(&mut watcher).await, vec![change(&uri, 1, 0)]);
    assert_no_change(&mut watcher).await;
    watcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_foreign_owner_is_filtered() {
    let env = create_test_env();
    let owner = Tag::application("mysql");
    let other = Tag::application("wordpress");
    let mut watcher = watch_revision_expiry_changes(&env.secrets, &[owner]);
    assert_eq!(next_batch(&mut watcher).await, Vec::new());

    env.secrets
        .create_secret(
            &SecretUri::new(),
            expiring_create(&other, env.now_ms() + MINUTE_MS),
        )
        .unwrap();
    assert_no_change(&mut watcher).await;
    watcher.stop().await.unwrap();
}
