//! Cooperative cancellation: nothing observable may change after a
//! teardown returns, no matter what callbacks are still in flight.

use std::time::Duration;

use super::support::*;
use crate::feed::FeedChange;
use crate::store::{RemoteStore, RowChange};

#[tokio::test]
async fn events_after_close_change_nothing() {
    let h = harness();
    let channel = "channel-1".to_string();
    h.client.open_channel(channel.clone());

    let store = h.store.clone();
    let channel_owned = channel.clone();
    wait_until("pump subscribed", move || {
        store.subscriber_count(&channel_owned) > 0
    })
    .await;

    let mut events = h.client.feeds().subscribe();
    h.client.close_channel(&channel);

    h.store.emit(
        &channel,
        RowChange::Insert {
            row: message("late", &channel, 10),
        },
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!h.client.feeds().is_open(&channel));
    assert!(h.client.feed(&channel).is_empty());

    // The Closed notification is the last thing observed for this
    // channel; no Updated may follow it.
    let mut saw_closed = false;
    while let Ok(change) = events.try_recv() {
        match change {
            FeedChange::Closed(id) if id == channel => saw_closed = true,
            FeedChange::Updated(id) if id == channel => {
                assert!(!saw_closed, "feed updated after close");
            }
            _ => {}
        }
    }
    assert!(saw_closed);
}

#[tokio::test]
async fn inflight_snapshot_cannot_resurrect_a_closed_feed() {
    let h = harness();
    let channel = "channel-1".to_string();
    h.store.seed_message(message("m1", &channel, 10));
    h.store
        .set_fetch_messages_delay(Some(Duration::from_millis(60)));

    h.client.open_channel(channel.clone());
    // Close while the snapshot fetch is still sleeping inside the store.
    h.client.close_channel(&channel);

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(!h.client.feeds().is_open(&channel));
    assert!(h.client.feed(&channel).is_empty());
}

#[tokio::test]
async fn session_pump_stops_after_shutdown() {
    let h = harness();
    h.store.register_user(EMAIL, PASSWORD, DISPLAY_NAME);
    h.client.bootstrap().await;

    h.client.session().shutdown();

    // A sign-in notification pushed after shutdown must not be applied.
    h.store.sign_in(EMAIL, PASSWORD).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.client.session().session().is_none());
    assert!(h.client.session().identity().is_none());
}

#[tokio::test]
async fn reopening_a_channel_starts_from_a_clean_slate() {
    let h = harness();
    let channel = "channel-1".to_string();
    h.store.seed_message(message("m1", &channel, 10));

    h.client.open_channel(channel.clone());
    let feeds = h.client.feeds().clone();
    let channel_owned = channel.clone();
    wait_until("first open settled", move || {
        feeds.feed(&channel_owned).len() == 1
    })
    .await;

    h.client.close_channel(&channel);
    assert!(h.client.feed(&channel).is_empty());

    h.client.open_channel(channel.clone());
    let feeds = h.client.feeds().clone();
    let channel_owned = channel.clone();
    wait_until("second open settled", move || {
        feeds.feed(&channel_owned).len() == 1
    })
    .await;
    assert_eq!(h.client.feed(&channel)[0].id, "m1");
}
