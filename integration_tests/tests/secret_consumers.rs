// SPDX-License-Identifier: MIT OR Apache-2.0
//! Consumer rows: revision tracking, labels, refcounts, removal.

use integration_tests::{basic_create, create_test_env, data, token};
use warden_secrets::{SecretConsumerMetadata, SecretUri, Tag, UpdateSecretParams};

fn consumer(label: &str, revision: u32) -> SecretConsumerMetadata {
    SecretConsumerMetadata {
        label: label.to_string(),
        current_revision: revision,
        latest_revision: 0,
    }
}

#[test]
fn test_save_and_get_roundtrip() {
    let env = create_test_env();
    let owner = Tag::application("mysql");
    let uri = SecretUri::new();
    env.secrets.create_secret(&uri, basic_create(&owner)).unwrap();
    let unit = Tag::unit("mariadb/0");

    assert!(env
        .secrets
        .get_secret_consumer(&uri, &unit)
        .unwrap_err()
        .is_not_found());

    env.secrets
        .save_secret_consumer(&uri, &unit, &consumer("foobar", 1))
        .unwrap();
    let stored = env.secrets.get_secret_consumer(&uri, &unit).unwrap();
    assert_eq!(stored.label, "foobar");
    assert_eq!(stored.current_revision, 1);
    assert_eq!(stored.latest_revision, 1);

    // Another consumer has no row.
    assert!(env
        .secrets
        .get_secret_consumer(&uri, &Tag::unit("mysql/0"))
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_save_rejects_nonexistent_revision() {
    let env = create_test_env();
    let owner = Tag::application("mysql");
    let uri = SecretUri::new();
    env.secrets.create_secret(&uri, basic_create(&owner)).unwrap();
    let unit = Tag::unit("mariadb/0");

    // A consumer cannot adopt a revision the store has never seen; that
    // keeps current <= latest for every stored row.
    let err = env
        .secrets
        .save_secret_consumer(&uri, &unit, &consumer("foobar", 666))
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(env
        .secrets
        .get_secret_consumer(&uri, &unit)
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_refcount_tracks_consumer_rows() {
    let env = create_test_env();
    let owner = Tag::application("mysql");
    let uri = SecretUri::new();
    env.secrets.create_secret(&uri, basic_create(&owner)).unwrap();
    let mariadb = Tag::unit("mariadb/0");
    let mysql = Tag::unit("mysql/0");

    assert!(env.secrets.consumer_refcount(&uri).unwrap_err().is_not_found());

    env.secrets
        .save_secret_consumer(&uri, &mariadb, &consumer("a", 1))
        .unwrap();
    env.secrets
        .save_secret_consumer(&uri, &mysql, &consumer("b", 1))
        .unwrap();
    assert_eq!(env.secrets.consumer_refcount(&uri).unwrap(), 2);

    // Updating an existing row does not double-count.
    env.secrets
        .save_secret_consumer(&uri, &mariadb, &consumer("a", 1))
        .unwrap();
    assert_eq!(env.secrets.consumer_refcount(&uri).unwrap(), 2);

    env.secrets.remove_secret_consumer(&uri, &mysql).unwrap();
    assert_eq!(env.secrets.consumer_refcount(&uri).unwrap(), 1);

    // Removing an absent row is a no-op.
    env.secrets.remove_secret_consumer(&uri, &mysql).unwrap();
    assert_eq!(env.secrets.consumer_refcount(&uri).unwrap(), 1);
}

#[test]
fn test_removing_last_consumer_orphans_revision() {
    let env = create_test_env();
    let owner = Tag::application("mysql");
    let uri = SecretUri::new();
    env.secrets.create_secret(&uri, basic_create(&owner)).unwrap();
    let unit = Tag::unit("mariadb/0");
    env.secrets
        .save_secret_consumer(&uri, &unit, &consumer("a", 1))
        .unwrap();
    env.secrets
        .update_secret(
            &uri,
            UpdateSecretParams::new(token()).with_data(data(&[("foo", "bar2")])),
        )
        .unwrap();

    // Revision 1 is pinned, so not yet obsolete.
    let revisions = env.secrets.list_secret_revisions(&uri).unwrap();
    assert!(!revisions.iter().find(|r| r.revision == 1).unwrap().obsolete);

    env.secrets.remove_secret_consumer(&uri, &unit).unwrap();
    let revisions = env.secrets.list_secret_revisions(&uri).unwrap();
    assert!(revisions.iter().find(|r| r.revision == 1).unwrap().obsolete);
    assert!(!revisions.iter().find(|r| r.revision == 2).unwrap().obsolete);
}

#[test]
fn test_save_consumer_of_deleted_secret_fails() {
    let env = create_test_env();
    let owner = Tag::application("mysql");
    let uri = SecretUri::new();
    env.secrets.create_secret(&uri, basic_create(&owner)).unwrap();
    env.secrets.delete_secret(&uri, token(), &[]).unwrap();

    let err = env
        .secrets
        .save_secret_consumer(&uri, &Tag::unit("mariadb/0"), &consumer("a", 1))
        .unwrap_err();
    assert!(err.is_not_found());
}
