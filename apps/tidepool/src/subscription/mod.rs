//! Push subscriptions over the remote store's change feed.
//!
//! One pump task per subscribed channel turns the store's raw row changes
//! into typed [`FeedEvent`]s on a bounded channel. Delivery is
//! at-least-once and ordered per channel; it may freely race a snapshot
//! fetch for the same channel, so consumers must merge idempotently.
//!
//! When the underlying stream ends without [`Subscription::cancel`], the
//! pump resubscribes with capped exponential backoff (base doubling up to
//! a ceiling, ±25% jitter) and emits [`FeedEvent::Resync`] before resuming
//! delivery, so the consumer re-fetches a snapshot to cover the gap. A
//! feed that silently stops updating is not an acceptable failure mode.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::model::{ChannelId, Message, MessageId};
use crate::store::{RemoteStore, RowChange};

/// Typed notification delivered to a subscription's consumer.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Insert(Message),
    Update(Message),
    Delete(MessageId),
    /// The stream reconnected after a drop; events may have been missed
    /// and the consumer should re-fetch a snapshot.
    Resync,
}

pub struct ChangeFeedSubscriber {
    store: Arc<dyn RemoteStore>,
    config: Config,
}

impl ChangeFeedSubscriber {
    pub fn new(store: Arc<dyn RemoteStore>, config: Config) -> Self {
        Self { store, config }
    }

    /// Open a push subscription for one channel.
    pub fn subscribe(&self, channel_id: ChannelId) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.event_buffer);
        let alive = Arc::new(AtomicBool::new(true));
        let pump = tokio::spawn(pump_changes(
            self.store.clone(),
            channel_id.clone(),
            tx,
            alive.clone(),
            self.config.resync_base,
            self.config.resync_max,
        ));
        Subscription {
            channel_id,
            rx,
            alive,
            pump,
        }
    }
}

/// Handle to one channel's push subscription.
pub struct Subscription {
    channel_id: ChannelId,
    rx: mpsc::Receiver<FeedEvent>,
    alive: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl Subscription {
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Next event, or `None` once cancelled.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        if !self.alive.load(Ordering::SeqCst) {
            return None;
        }
        let event = self.rx.recv().await;
        if !self.alive.load(Ordering::SeqCst) {
            return None;
        }
        event
    }

    /// Stop delivery. Synchronous from the caller's perspective: once this
    /// returns, `recv` yields nothing further — events still buffered in
    /// the channel are discarded, not queued.
    pub fn cancel(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        self.rx.close();
        self.pump.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn pump_changes(
    store: Arc<dyn RemoteStore>,
    channel_id: ChannelId,
    tx: mpsc::Sender<FeedEvent>,
    alive: Arc<AtomicBool>,
    base: Duration,
    cap: Duration,
) {
    let mut attempt: u32 = 0;
    let mut reconnected = false;
    loop {
        if !alive.load(Ordering::SeqCst) {
            return;
        }
        let mut stream = store.subscribe_changes(&channel_id);
        if reconnected {
            tracing::info!(
                target: "tidepool::subscription",
                channel = %channel_id,
                "push stream reconnected; requesting resync"
            );
            if tx.send(FeedEvent::Resync).await.is_err() {
                return;
            }
        }
        while let Some(change) = stream.recv().await {
            if !alive.load(Ordering::SeqCst) {
                return;
            }
            attempt = 0;
            let event = match change {
                RowChange::Insert { row } => FeedEvent::Insert(row),
                RowChange::Update { row } => FeedEvent::Update(row),
                RowChange::Delete { id } => FeedEvent::Delete(id),
            };
            if tx.send(event).await.is_err() {
                return;
            }
        }
        if !alive.load(Ordering::SeqCst) {
            return;
        }
        reconnected = true;
        let delay = jittered(backoff_delay(attempt, base, cap));
        attempt = attempt.saturating_add(1);
        tracing::warn!(
            target: "tidepool::subscription",
            channel = %channel_id,
            delay_ms = delay.as_millis() as u64,
            "push stream dropped; scheduling resubscribe"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Deterministic half of the resubscribe schedule: `base * 2^attempt`,
/// saturating at `cap`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).map(|d| d.min(cap)).unwrap_or(cap)
}

fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    delay.mul_f64(factor)
}
