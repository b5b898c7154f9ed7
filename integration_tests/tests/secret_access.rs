// SPDX-License-Identifier: MIT OR Apache-2.0
//! Access-control laws across operations.

use integration_tests::{basic_create, create_test_env, token};
use warden_secrets::{SecretAccessParams, SecretRole, SecretUri, Tag};

fn grant(subject: &Tag, role: SecretRole) -> SecretAccessParams {
    SecretAccessParams {
        leader_token: token(),
        scope: Tag::relation("wordpress.db#mysql.server"),
        subject: subject.clone(),
        role,
    }
}

#[test]
fn test_grant_revoke_laws() {
    let env = create_test_env();
    let owner = Tag::application("mysql");
    let uri = SecretUri::new();
    env.secrets.create_secret(&uri, basic_create(&owner)).unwrap();
    let subject = Tag::application("wordpress");

    // grant; grant == grant
    env.secrets
        .grant_secret_access(&uri, grant(&subject, SecretRole::View))
        .unwrap();
    env.secrets
        .grant_secret_access(&uri, grant(&subject, SecretRole::View))
        .unwrap();
    assert_eq!(
        env.secrets.secret_access(&uri, &subject).unwrap(),
        SecretRole::View
    );

    // revoke; revoke both succeed
    env.secrets.revoke_secret_access(&uri, token(), &subject).unwrap();
    env.secrets.revoke_secret_access(&uri, token(), &subject).unwrap();
    assert_eq!(
        env.secrets.secret_access(&uri, &subject).unwrap(),
        SecretRole::None
    );
}

#[test]
fn test_cross_model_subject_rejected_without_a_trace() {
    let env = create_test_env();
    let owner = Tag::application("mysql");
    let uri = SecretUri::new();
    env.secrets.create_secret(&uri, basic_create(&owner)).unwrap();

    let proxy = Tag::application("remote-wordpress");
    env.world.mark_cross_model(&proxy);

    let err = env
        .secrets
        .grant_secret_access(&uri, grant(&proxy, SecretRole::View))
        .unwrap_err();
    assert!(err.is_not_supported());
    assert_eq!(
        env.secrets.secret_access(&uri, &proxy).unwrap(),
        SecretRole::None
    );
}

#[test]
fn test_delete_discards_permissions() {
    let env = create_test_env();
    let owner = Tag::application("mysql");
    let uri = SecretUri::new();
    env.secrets.create_secret(&uri, basic_create(&owner)).unwrap();
    let subject = Tag::application("wordpress");
    env.secrets
        .grant_secret_access(&uri, grant(&subject, SecretRole::Manage))
        .unwrap();

    env.secrets.delete_secret(&uri, token(), &[]).unwrap();
    assert_eq!(
        env.secrets.secret_access(&uri, &subject).unwrap(),
        SecretRole::None
    );
    // Re-granting on the deleted secret is refused.
    let err = env
        .secrets
        .grant_secret_access(&uri, grant(&subject, SecretRole::View))
        .unwrap_err();
    assert!(err.is_not_found());
}
