//! Reconciliation of channel feeds.
//!
//! Each open channel owns a map from message id to payload plus the
//! derived `(created_at, id)`-sorted sequence. Two producers race to
//! populate it — a one-shot snapshot fetch and the push subscription —
//! and neither is guaranteed to win, so every application step is
//! idempotent: a duplicate insert is a no-op, an update ahead of its
//! insert synthesizes the row, a delete for an unknown id is ignored but
//! leaves a tombstone so a stale snapshot cannot revive the row later.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::model::{ChannelId, Message, MessageId, UserId};
use crate::store::{NewMessage, RemoteStore, StoreResult};
use crate::subscription::{ChangeFeedSubscriber, FeedEvent, Subscription};

const EVENT_CAPACITY: usize = 256;

/// Notifications about visible feed changes; consumers re-read
/// [`FeedReconciler::feed`] when one arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedChange {
    Updated(ChannelId),
    LoadingChanged(ChannelId, bool),
    Closed(ChannelId),
}

#[derive(Default)]
struct FeedInner {
    by_id: HashMap<MessageId, Message>,
    /// Message ids sorted ascending by `(created_at, id)`.
    order: Vec<MessageId>,
    /// Ids deleted locally; inserts and snapshot rows for these are
    /// dropped so out-of-order deliveries cannot revive them.
    tombstones: HashSet<MessageId>,
    loading: bool,
}

struct FeedState {
    channel_id: ChannelId,
    inner: RwLock<FeedInner>,
    /// Liveness token checked by in-flight fetches and the event pump;
    /// cleared on close so late completions cannot resurrect the feed.
    alive: AtomicBool,
}

impl FeedState {
    fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            inner: RwLock::new(FeedInner {
                loading: true,
                ..FeedInner::default()
            }),
            alive: AtomicBool::new(true),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Vec<Message> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id))
            .cloned()
            .collect()
    }

    fn set_loading(&self, loading: bool) -> bool {
        let mut inner = self.inner.write();
        let changed = inner.loading != loading;
        inner.loading = loading;
        changed
    }

    fn apply_insert(&self, message: Message) -> bool {
        let mut inner = self.inner.write();
        insert_row(&mut inner, message)
    }

    fn apply_update(&self, message: Message) -> bool {
        let mut inner = self.inner.write();
        if inner.tombstones.contains(&message.id) {
            return false;
        }
        match inner.by_id.get(&message.id).map(|existing| existing.created_at) {
            Some(created_at) => {
                // Creation time is immutable; pinning it keeps the sort
                // position stable no matter what the update payload claims.
                let mut row = message;
                row.created_at = created_at;
                inner.by_id.insert(row.id.clone(), row);
                true
            }
            // The update raced ahead of its insert; materialize the row.
            None => insert_row(&mut inner, message),
        }
    }

    fn apply_delete(&self, id: &MessageId) -> bool {
        let mut inner = self.inner.write();
        inner.tombstones.insert(id.clone());
        if inner.by_id.remove(id).is_some() {
            inner.order.retain(|existing| existing != id);
            true
        } else {
            false
        }
    }

    fn merge_snapshot(&self, rows: Vec<Message>) -> bool {
        let mut inner = self.inner.write();
        let mut changed = false;
        for row in rows {
            changed |= insert_row(&mut inner, row);
        }
        changed
    }
}

/// Insert-if-absent at the sorted position. Duplicate ids and tombstoned
/// ids are no-ops.
fn insert_row(inner: &mut FeedInner, message: Message) -> bool {
    if inner.tombstones.contains(&message.id) || inner.by_id.contains_key(&message.id) {
        return false;
    }
    let key = (message.created_at, message.id.clone());
    let position = inner
        .order
        .binary_search_by(|id| {
            let existing = &inner.by_id[id];
            (existing.created_at, existing.id.clone()).cmp(&key)
        })
        .unwrap_or_else(|insertion| insertion);
    inner.order.insert(position, message.id.clone());
    inner.by_id.insert(message.id.clone(), message);
    true
}

struct ChannelFeed {
    state: Arc<FeedState>,
    pump: JoinHandle<()>,
}

pub struct FeedReconciler {
    store: Arc<dyn RemoteStore>,
    subscriber: ChangeFeedSubscriber,
    channels: RwLock<HashMap<ChannelId, ChannelFeed>>,
    events: broadcast::Sender<FeedChange>,
}

impl FeedReconciler {
    pub fn new(store: Arc<dyn RemoteStore>, subscriber: ChangeFeedSubscriber) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            subscriber,
            channels: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedChange> {
        self.events.subscribe()
    }

    /// Current ordered view of a channel. Empty when the channel is not
    /// open or nothing has loaded yet.
    pub fn feed(&self, channel_id: &ChannelId) -> Vec<Message> {
        self.channels
            .read()
            .get(channel_id)
            .map(|feed| feed.state.snapshot())
            .unwrap_or_default()
    }

    pub fn is_loading(&self, channel_id: &ChannelId) -> bool {
        self.channels
            .read()
            .get(channel_id)
            .map(|feed| feed.state.inner.read().loading)
            .unwrap_or(false)
    }

    pub fn is_open(&self, channel_id: &ChannelId) -> bool {
        self.channels.read().contains_key(channel_id)
    }

    /// Start observing a channel: open the push subscription and fetch
    /// the snapshot concurrently. Idempotent for an already-open channel.
    pub fn open(&self, channel_id: ChannelId) {
        let mut channels = self.channels.write();
        if channels.contains_key(&channel_id) {
            return;
        }
        let state = Arc::new(FeedState::new(channel_id.clone()));
        let subscription = self.subscriber.subscribe(channel_id.clone());

        let fetch_state = state.clone();
        let fetch_store = self.store.clone();
        let fetch_events = self.events.clone();
        tokio::spawn(async move {
            fetch_snapshot(fetch_store, fetch_state, fetch_events).await;
        });

        let pump_state = state.clone();
        let pump_store = self.store.clone();
        let pump_events = self.events.clone();
        let pump = tokio::spawn(async move {
            pump_feed(pump_store, pump_state, pump_events, subscription).await;
        });

        channels.insert(channel_id, ChannelFeed { state, pump });
    }

    /// Stop observing a channel. The subscription is cancelled and any
    /// in-flight snapshot is disarmed via the liveness token.
    pub fn close(&self, channel_id: &ChannelId) {
        let removed = self.channels.write().remove(channel_id);
        if let Some(feed) = removed {
            feed.state.alive.store(false, Ordering::SeqCst);
            feed.pump.abort();
            let _ = self.events.send(FeedChange::Closed(channel_id.clone()));
        }
    }

    pub fn close_all(&self) {
        let drained: Vec<ChannelFeed> = {
            let mut channels = self.channels.write();
            channels.drain().map(|(_, feed)| feed).collect()
        };
        for feed in drained {
            feed.state.alive.store(false, Ordering::SeqCst);
            feed.pump.abort();
            let _ = self
                .events
                .send(FeedChange::Closed(feed.state.channel_id.clone()));
        }
    }

    /// Force a snapshot re-fetch for an open channel; the retry
    /// affordance behind a stale or empty view.
    pub fn refresh(&self, channel_id: &ChannelId) {
        let state = match self.channels.read().get(channel_id) {
            Some(feed) => feed.state.clone(),
            None => return,
        };
        if state.set_loading(true) {
            let _ = self
                .events
                .send(FeedChange::LoadingChanged(channel_id.clone(), true));
        }
        let store = self.store.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            fetch_snapshot(store, state, events).await;
        });
    }

    /// Compose a new message. The local feed is not mutated here; the row
    /// arrives through the change stream (or the next snapshot) and the
    /// id-based merge makes that arrival idempotent.
    pub async fn send_message(
        &self,
        channel_id: &ChannelId,
        author_id: UserId,
        content: String,
        parent_id: Option<MessageId>,
    ) -> StoreResult<Message> {
        self.store
            .insert_message(NewMessage {
                channel_id: channel_id.clone(),
                author_id,
                content,
                parent_id,
            })
            .await
    }
}

async fn fetch_snapshot(
    store: Arc<dyn RemoteStore>,
    state: Arc<FeedState>,
    events: broadcast::Sender<FeedChange>,
) {
    let result = store.fetch_messages(&state.channel_id).await;
    if !state.is_alive() {
        // The channel was closed while the fetch was in flight; applying
        // the result now would resurrect a feed nobody is observing.
        return;
    }
    match result {
        Ok(rows) => {
            let changed = state.merge_snapshot(rows);
            if state.set_loading(false) {
                let _ = events.send(FeedChange::LoadingChanged(state.channel_id.clone(), false));
            }
            if changed {
                let _ = events.send(FeedChange::Updated(state.channel_id.clone()));
            }
        }
        Err(err) => {
            tracing::warn!(
                target: "tidepool::feed",
                channel = %state.channel_id,
                error = %err,
                "snapshot fetch failed; keeping last known view"
            );
            if state.set_loading(false) {
                let _ = events.send(FeedChange::LoadingChanged(state.channel_id.clone(), false));
            }
        }
    }
}

async fn pump_feed(
    store: Arc<dyn RemoteStore>,
    state: Arc<FeedState>,
    events: broadcast::Sender<FeedChange>,
    mut subscription: Subscription,
) {
    while let Some(event) = subscription.recv().await {
        if !state.is_alive() {
            break;
        }
        match event {
            FeedEvent::Insert(message) => {
                if state.apply_insert(message) {
                    let _ = events.send(FeedChange::Updated(state.channel_id.clone()));
                }
            }
            FeedEvent::Update(message) => {
                if state.apply_update(message) {
                    let _ = events.send(FeedChange::Updated(state.channel_id.clone()));
                }
            }
            FeedEvent::Delete(id) => {
                if state.apply_delete(&id) {
                    let _ = events.send(FeedChange::Updated(state.channel_id.clone()));
                }
            }
            FeedEvent::Resync => {
                if state.set_loading(true) {
                    let _ =
                        events.send(FeedChange::LoadingChanged(state.channel_id.clone(), true));
                }
                fetch_snapshot(store.clone(), state.clone(), events.clone()).await;
            }
        }
    }
}
