//! Workspace selection: gating on the session, synchronous write-through,
//! restart restore, and corrupt-blob recovery.

use super::support::*;
use crate::cache::{CacheExt, CacheKey, DurableCache};
use crate::client::ChatClient;
use crate::store::RemoteStore;

#[tokio::test]
async fn reselect_overwrites_the_durable_blob() {
    let h = signed_in_harness().await;
    let a = workspace("ws-a", "Alpha");
    let b = workspace("ws-b", "Bravo");

    h.client.workspaces().select(a);
    h.client.workspaces().select(b.clone());

    assert_eq!(h.client.workspaces().active_workspace(), Some(b.clone()));
    // The durable blob reflects the latest selection only, immediately.
    assert_eq!(h.cache.active_workspace(), Some(b.clone()));
    let raw = h.cache.get(CacheKey::ActiveWorkspace).unwrap();
    assert!(raw.contains("ws-b"));
    assert!(!raw.contains("ws-a"));
}

#[tokio::test]
async fn select_without_a_session_is_rejected_silently() {
    let h = harness();
    h.client.bootstrap().await;

    h.client.workspaces().select(workspace("ws-a", "Alpha"));

    assert!(h.client.workspaces().active_workspace().is_none());
    assert!(h.cache.get(CacheKey::ActiveWorkspace).is_none());
    assert!(!h.cache.workspace_selected());
}

#[tokio::test]
async fn selection_survives_a_restart() {
    let h = signed_in_harness().await;
    let chosen = workspace("ws-a", "Alpha");
    h.client.workspaces().select(chosen.clone());

    // A new client over the same durable cache and remote store stands
    // in for the reloaded page.
    let reloaded = ChatClient::new(h.store.clone(), h.cache.clone(), fast_config());
    reloaded.bootstrap().await;

    assert_eq!(reloaded.workspaces().active_workspace(), Some(chosen));
    assert!(reloaded.session().identity().is_some());
}

#[tokio::test]
async fn corrupt_blob_reads_as_unset_and_is_discarded() {
    let h = signed_in_harness().await;
    h.cache
        .put(CacheKey::ActiveWorkspace, "{definitely-not-json".to_string());
    h.cache.put(CacheKey::WorkspaceSelectedFlag, "true".to_string());

    let reloaded = ChatClient::new(h.store.clone(), h.cache.clone(), fast_config());
    reloaded.bootstrap().await;

    assert!(reloaded.workspaces().active_workspace().is_none());
    assert!(h.cache.get(CacheKey::ActiveWorkspace).is_none());
}

#[tokio::test]
async fn clear_drops_the_selection_and_its_keys() {
    let h = signed_in_harness().await;
    h.client.workspaces().select(workspace("ws-a", "Alpha"));

    h.client.workspaces().clear();

    assert!(h.client.workspaces().active_workspace().is_none());
    assert!(h.cache.get(CacheKey::ActiveWorkspace).is_none());
    assert!(!h.cache.workspace_selected());
}

#[tokio::test]
async fn remote_signout_clears_the_selection() {
    let h = signed_in_harness().await;
    h.client.workspaces().select(workspace("ws-a", "Alpha"));

    // The store invalidates the session out from under the client, e.g.
    // a sign-out in another tab.
    h.store.sign_out().await.unwrap();

    let workspaces = h.client.workspaces().clone();
    wait_until("selection cleared after remote sign-out", move || {
        workspaces.active_workspace().is_none()
    })
    .await;
    let session = h.client.session().clone();
    wait_until("session cleared after remote sign-out", move || {
        session.session().is_none()
    })
    .await;
}

#[tokio::test]
async fn identity_mirrors_the_active_workspace() {
    let h = signed_in_harness().await;
    let chosen = workspace("ws-a", "Alpha");

    h.client.workspaces().select(chosen.clone());
    assert_eq!(
        h.client.session().identity().unwrap().workspace_id,
        Some(chosen.id.clone())
    );

    h.client.workspaces().clear();
    assert_eq!(h.client.session().identity().unwrap().workspace_id, None);
}
