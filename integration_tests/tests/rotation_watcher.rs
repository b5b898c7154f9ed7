// SPDX-License-Identifier: MIT OR Apache-2.0
//! Rotation trigger watcher scenarios.

use integration_tests::{
    assert_no_change, basic_create, create_test_env, next_batch, rotating_create, token, HOUR_MS,
    MINUTE_MS,
};
use warden_secrets::{RotatePolicy, SecretUri, Tag, UpdateSecretParams};
use warden_watch::{watch_rotation_changes, TriggerChange};

#[tokio::test]
async fn test_initial_event_announces_current_schedule() {
    let env = create_test_env();
    let owner = Tag::application("mysql");
    let uri = SecretUri::new();
    let next = env.now_ms() + MINUTE_MS;
    env.secrets
        .create_secret(&uri, rotating_create(&owner, next))
        .unwrap();

    let mut watcher = watch_rotation_changes(
        &env.secrets,
        &[owner.clone(), Tag::unit("mysql/0")],
    );
    let initial = next_batch(&mut watcher).await;
    assert_eq!(
        initial,
        vec![TriggerChange {
            uri: uri.clone(),
            revision: 0,
            next_trigger_time_ms: next,
        }]
    );
    assert_no_change(&mut watcher).await;
    watcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_rotated_emits_new_time() {
    let env = create_test_env();
    let owner = Tag::application("mysql");
    let uri = SecretUri::new();
    env.secrets
        .create_secret(&uri, rotating_create(&owner, env.now_ms() + MINUTE_MS))
        .unwrap();
    let mut watcher = watch_rotation_changes(&env.secrets, &[owner.clone()]);
    next_batch(&mut watcher).await;

    let next = env.now_ms() + 2 * HOUR_MS;
    env.secrets.secret_rotated(&uri, next).unwrap();

    assert_eq!(
        next_batch(&mut watcher).await,
        vec![TriggerChange {
            uri: uri.clone(),
            revision: 0,
            next_trigger_time_ms: next,
        }]
    );
    assert_no_change(&mut watcher).await;
    watcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_policy_never_emits_removal() {
    let env = create_test_env();
    let owner = Tag::application("mysql");
    let uri = SecretUri::new();
    env.secrets
        .create_secret(&uri, rotating_create(&owner, env.now_ms() + MINUTE_MS))
        .unwrap();
    let mut watcher = watch_rotation_changes(&env.secrets, &[owner.clone()]);
    next_batch(&mut watcher).await;

    env.secrets
        .update_secret(
            &uri,
            UpdateSecretParams::new(token()).with_rotate_policy(RotatePolicy::Never, 0),
        )
        .unwrap();

    assert_eq!(
        next_batch(&mut watcher).await,
        vec![TriggerChange {
            uri: uri.clone(),
            revision: 0,
            next_trigger_time_ms: 0,
        }]
    );
    assert_no_change(&mut watcher).await;
    watcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_unread_changes_coalesce_to_latest_state() {
    let env = create_test_env();
    let owner = Tag::application("mysql");
    let uri = SecretUri::new();
    let now = env.now_ms();
    env.secrets
        .create_secret(&uri, rotating_create(&owner, now + MINUTE_MS))
        .unwrap();
    let mut watcher = watch_rotation_changes(&env.secrets, &[owner.clone()]);
    next_batch(&mut watcher).await;

    // Two reschedules before the consumer reads: one event, final state.
    env.secrets.secret_rotated(&uri, now + HOUR_MS).unwrap();
    env.secrets.secret_rotated(&uri, now + 2 * HOUR_MS).unwrap();

    assert_eq!(
        next_batch(&mut watcher).await,
        vec![TriggerChange {
            uri: uri.clone(),
            revision: 0,
            next_trigger_time_ms: now + 2 * HOUR_MS,
        }]
    );
    watcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_owner_filter_and_restart_reannounces() {
    let env = create_test_env();
    let app = Tag::application("mysql");
    let unit = Tag::unit("mysql/0");
    let other_unit = Tag::unit("mysql/1");
    let now = env.now_ms();

    let uri1 = SecretUri::new();
    env.secrets
        .create_secret(&uri1, rotating_create(&app, now + MINUTE_MS))
        .unwrap();

    let mut watcher = watch_rotation_changes(&env.secrets, &[app.clone(), unit.clone()]);
    assert_eq!(next_batch(&mut watcher).await.len(), 1);

    // Owned by a unit the watcher covers.
    let uri2 = SecretUri::new();
    env.secrets
        .create_secret(&uri2, rotating_create(&unit, now + MINUTE_MS))
        .unwrap();
    // Owned by a unit it does not cover.
    let uri3 = SecretUri::new();
    env.secrets
        .create_secret(&uri3, rotating_create(&other_unit, now + MINUTE_MS))
        .unwrap();

    assert_eq!(
        next_batch(&mut watcher).await,
        vec![TriggerChange {
            uri: uri2.clone(),
            revision: 0,
            next_trigger_time_ms: now + MINUTE_MS,
        }]
    );
    assert_no_change(&mut watcher).await;
    watcher.stop().await.unwrap();

    // A fresh watcher with different owners re-announces everything it
    // covers, already-seen or not.
    let mut watcher = watch_rotation_changes(&env.secrets, &[app.clone(), other_unit.clone()]);
    let mut initial = next_batch(&mut watcher).await;
    initial.sort_by(|a, b| a.uri.cmp(&b.uri));
    let mut expected = vec![
        TriggerChange {
            uri: uri1,
            revision: 0,
            next_trigger_time_ms: now + MINUTE_MS,
        },
        TriggerChange {
            uri: uri3,
            revision: 0,
            next_trigger_time_ms: now + MINUTE_MS,
        },
    ];
    expected.sort_by(|a, b| a.uri.cmp(&b.uri));
    assert_eq!(initial, expected);
    watcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_non_rotating_secret_is_invisible() {
    let env = create_test_env();
    let owner = Tag::application("mysql");
    let mut watcher = watch_rotation_changes(&env.secrets, &[owner.clone()]);
    assert_eq!(next_batch(&mut watcher).await, Vec::new());

    env.secrets
        .create_secret(&SecretUri::new(), basic_create(&owner))
        .unwrap();
    assert_no_change(&mut watcher).await;
    watcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_kill_closes_changes() {
    let env = create_test_env();
    let owner = Tag::application("mysql");
    let mut watcher = watch_rotation_changes(&env.secrets, &[owner]);
    next_batch(&mut watcher).await;

    watcher.kill();
    // Drain until closed; the kill may race one last empty poll.
    while watcher.recv().await.is_some() {}
    watcher.wait().await.unwrap();
}
