//! Startup-sequence scenarios: the durable flag, the session snapshot,
//! and the single refresh attempt.

use super::support::*;
use crate::cache::{CacheExt, CacheKey, DurableCache};

#[tokio::test]
async fn stale_flag_triggers_exactly_one_refresh_then_logs_out() {
    let h = harness();
    // A previous run left the durable flag behind, but the remote store
    // has no live session and nothing to refresh from.
    h.cache.set_authenticated(true);

    h.client.bootstrap().await;

    assert_eq!(h.store.refresh_calls(), 1);
    assert!(h.client.session().session().is_none());
    assert!(h.client.session().identity().is_none());
    assert!(!h.cache.authenticated());
    assert!(h.cache.get(CacheKey::AuthTimestamp).is_none());
}

#[tokio::test]
async fn stale_flag_recovers_when_refresh_succeeds() {
    let h = harness();
    let user_id = h.store.register_user(EMAIL, PASSWORD, DISPLAY_NAME);
    h.cache.set_authenticated(true);
    h.store.set_restorable_session(session_for(&user_id, EMAIL));

    h.client.bootstrap().await;

    assert_eq!(h.store.refresh_calls(), 1);
    assert!(h.client.session().session().is_some());
    // No profile row existed, so one was provisioned from the session.
    let identity = h.client.session().identity().expect("identity loaded");
    assert_eq!(identity.id, user_id);
    assert!(h.cache.authenticated());
}

#[tokio::test]
async fn cold_start_never_calls_refresh() {
    let h = harness();
    h.client.bootstrap().await;

    assert_eq!(h.store.refresh_calls(), 0);
    assert!(h.client.session().session().is_none());
    assert!(!h.client.session().is_loading());
}

#[tokio::test]
async fn live_remote_session_is_adopted_without_refresh() {
    let h = harness();
    let user_id = h.store.register_user(EMAIL, PASSWORD, DISPLAY_NAME);
    h.store.set_live_session(Some(session_for(&user_id, EMAIL)));

    h.client.bootstrap().await;

    assert_eq!(h.store.refresh_calls(), 0);
    assert!(h.client.session().session().is_some());
    assert!(h.client.session().identity().is_some());
    assert!(h.cache.authenticated());
}

#[tokio::test]
async fn unloadable_profile_rolls_the_session_back() {
    let h = harness();
    let user_id = h.store.register_user(EMAIL, PASSWORD, DISPLAY_NAME);
    h.store.set_live_session(Some(session_for(&user_id, EMAIL)));
    // No profile row, and provisioning is rejected with a conflict while
    // the conflicting row never materializes: the load cannot complete.
    h.store.force_profile_conflict(true);

    h.client.bootstrap().await;

    // Never present "authenticated but no identity".
    assert!(h.client.session().identity().is_none());
    assert!(h.client.session().session().is_none());
    assert!(!h.cache.authenticated());
    assert!(!h.client.session().is_loading());
}
