mod common;

use std::sync::atomic::Ordering;

use common::harness;
use lumen_core::{CancellationToken, Credential, LumenError};
use lumen_pg::session::SESSION_TTL_SECS;

#[tokio::test]
async fn test_probe_with_no_databases_creates_no_session() {
    let h = harness().await;
    let cancel = CancellationToken::new();

    let err = h
        .state
        .broker
        .probe(&Credential::new("u", "p"), &[], &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LumenError::NoAccessibleDb { .. }));
    assert_eq!(h.server.opened(), 0);
    assert!(h.state.sessions.is_empty());
}

#[tokio::test]
async fn test_login_lands_on_first_reachable_table() {
    let h = harness().await;
    let cancel = CancellationToken::new();

    let login = h.state.auth.login("alice", "wonderland", &cancel).await.unwrap();
    assert!(login.success);
    assert_eq!(login.initial_db, "app");
    assert_eq!(login.initial_schema.as_deref(), Some("public"));
    assert_eq!(login.initial_table.as_deref(), Some("customers"));
    assert_eq!(login.session_id.len(), 64);

    let credential = h.state.sessions.credential(&login.session_id).unwrap();
    assert_eq!(credential.username, "alice");
    assert_eq!(credential.secret.expose(), "wonderland");
    // The probe connection is closed again.
    assert_eq!(h.server.opened(), h.server.closed());
}

#[tokio::test]
async fn test_login_skips_databases_the_server_refuses() {
    let h = harness().await;
    h.server.deny_connect("alice", "app");

    let login = h
        .state
        .auth
        .login("alice", "wonderland", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(login.initial_db, "reports");
    assert_eq!(login.initial_table.as_deref(), Some("summary"));
}

#[tokio::test]
async fn test_wrong_password_fails_without_session() {
    let h = harness().await;

    let err = h
        .state
        .auth
        .login("alice", "queen-of-hearts", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LumenError::AuthenticationFailed { .. }));
    assert_eq!(err.code(), "AUTHENTICATION_FAILED");
    assert!(h.state.sessions.is_empty());
}

#[tokio::test]
async fn test_role_without_grants_has_no_accessible_db() {
    let h = harness().await;

    let err = h
        .state
        .auth
        .login("carol", "singer", &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NO_ACCESSIBLE_DB");
    assert_eq!(h.server.opened(), 0);
}

#[tokio::test]
async fn test_unknown_usernames_do_not_rescan_catalog() {
    let h = harness().await;
    let cancel = CancellationToken::new();

    for i in 0..50 {
        let err = h
            .state
            .auth
            .login(&format!("nobody{}", i % 2), "x", &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NO_ACCESSIBLE_DB");
    }
    assert_eq!(h.grant_loads.load(Ordering::Relaxed), 2);
    assert!(h.state.cache.get_role_view("nobody0").databases.is_empty());
    assert_eq!(h.server.opened(), 0);
}

#[tokio::test]
async fn test_unreachable_server_is_a_connection_error() {
    let h = harness().await;
    h.server.set_unreachable(true);

    let err = h
        .state
        .auth
        .login("bob", "builder", &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONNECTION_FAILED");
}

#[tokio::test]
async fn test_re_authenticate_replaces_session() {
    let h = harness().await;
    let cancel = CancellationToken::new();

    let first = h.state.auth.login("bob", "builder", &cancel).await.unwrap();
    let sealed = h.state.sessions.validate(&first.session_id).unwrap().encrypted_secret;

    let second = h
        .state
        .auth
        .re_authenticate("bob", &sealed, &cancel)
        .await
        .unwrap();
    assert_ne!(first.session_id, second.session_id);
    assert_eq!(second.initial_db, "reports");
    assert!(matches!(
        h.state.sessions.validate(&first.session_id),
        Err(LumenError::SessionNotFound)
    ));
    assert_eq!(h.state.sessions.len(), 1);
}

#[tokio::test]
async fn test_re_authenticate_rejects_tampered_secret() {
    let h = harness().await;
    let cancel = CancellationToken::new();

    let login = h.state.auth.login("bob", "builder", &cancel).await.unwrap();
    let sealed = h.state.sessions.validate(&login.session_id).unwrap().encrypted_secret;
    let mut bytes = sealed.into_bytes();
    let last = bytes.len() - 3;
    bytes[last] = if bytes[last] == b'A' { b'B' } else { b'A' };
    let tampered = String::from_utf8(bytes).unwrap();

    let err = h
        .state
        .auth
        .re_authenticate("bob", &tampered, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CRYPTO_TAMPERED");
}

#[tokio::test]
async fn test_session_expires_after_ttl() {
    let h = harness().await;
    let login = h
        .state
        .auth
        .login("bob", "builder", &CancellationToken::new())
        .await
        .unwrap();

    h.clock.advance(SESSION_TTL_SECS - 1);
    assert!(h.state.sessions.validate(&login.session_id).is_ok());

    h.clock.advance(1);
    assert!(matches!(
        h.state.sessions.validate(&login.session_id),
        Err(LumenError::SessionExpired)
    ));
    assert!(h.state.sessions.is_empty());
}

#[tokio::test]
async fn test_logout_is_idempotent() {
    let h = harness().await;
    let login = h
        .state
        .auth
        .login("bob", "builder", &CancellationToken::new())
        .await
        .unwrap();

    h.state.auth.logout(&login.session_id);
    h.state.auth.logout(&login.session_id);
    assert!(h.state.sessions.session_for_user("bob").is_none());
}
