//! Shared fixtures for the scenario tests: a client wired to the
//! in-memory store and cache, plus builders for domain records.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use crate::cache::MemoryCache;
use crate::client::ChatClient;
use crate::config::Config;
use crate::model::{Message, Session, Workspace};
use crate::store::MemoryStore;

pub const EMAIL: &str = "alice@example.com";
pub const PASSWORD: &str = "correct horse";
pub const DISPLAY_NAME: &str = "Alice";

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub cache: Arc<MemoryCache>,
    pub client: ChatClient,
}

/// Short timeouts and backoffs so failure paths resolve quickly.
pub fn fast_config() -> Config {
    Config {
        login_timeout: Duration::from_secs(2),
        resync_base: Duration::from_millis(10),
        resync_max: Duration::from_millis(40),
        event_buffer: 64,
    }
}

pub fn harness() -> Harness {
    harness_with(fast_config())
}

pub fn harness_with(config: Config) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    let client = ChatClient::new(store.clone(), cache.clone(), config);
    Harness {
        store,
        cache,
        client,
    }
}

/// A bootstrapped client signed in as Alice, whose profile was
/// provisioned during the first login.
pub async fn signed_in_harness() -> Harness {
    let h = harness();
    h.store.register_user(EMAIL, PASSWORD, DISPLAY_NAME);
    h.client.bootstrap().await;
    h.client
        .login(EMAIL, PASSWORD)
        .await
        .expect("login should succeed");
    h
}

pub fn message(id: &str, channel: &str, unix: i64) -> Message {
    Message {
        id: id.to_string(),
        channel_id: channel.to_string(),
        author_id: "author-1".to_string(),
        content: format!("body of {id}"),
        parent_id: None,
        created_at: OffsetDateTime::from_unix_timestamp(unix).unwrap(),
        updated_at: None,
        edited_at: None,
        pinned: false,
        author_name: None,
        author_avatar_url: None,
    }
}

pub fn workspace(id: &str, name: &str) -> Workspace {
    Workspace {
        id: id.to_string(),
        name: name.to_string(),
        slug: name.to_lowercase(),
        icon_url: None,
        is_admin: false,
    }
}

pub fn session_for(user_id: &str, email: &str) -> Session {
    Session {
        user_id: user_id.to_string(),
        email: Some(email.to_string()),
        display_name: None,
        access_token: format!("tok-{user_id}"),
        refresh_token: Some(format!("refresh-{user_id}")),
        expires_at: OffsetDateTime::now_utc() + time::Duration::hours(1),
    }
}

/// Poll until `predicate` holds, failing the test after two seconds.
pub async fn wait_until(description: &str, predicate: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if predicate() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {description}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Assert the two feed invariants: unique ids and non-decreasing
/// creation timestamps.
pub fn assert_feed_invariants(feed: &[Message]) {
    for pair in feed.windows(2) {
        assert!(
            pair[0].created_at <= pair[1].created_at,
            "feed order violated between {} and {}",
            pair[0].id,
            pair[1].id
        );
    }
    let mut ids: Vec<&str> = feed.iter().map(|m| m.id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), feed.len(), "feed contains duplicate ids");
}
