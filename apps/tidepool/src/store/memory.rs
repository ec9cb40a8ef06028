//! In-memory implementation of [`RemoteStore`].
//!
//! Backs the test suite and any embedder that wants the full client stack
//! without a network. Failure injection knobs let tests exercise the
//! recovery paths (dropped streams, failed snapshots, conflicting
//! provisioning) without reaching into component internals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::model::{ChannelId, Identity, Message, Session, UserId};

use super::{
    ChangeStream, NewMessage, ProfileUpdate, RemoteStore, RowChange, SessionChange,
    SignUpAttributes, StoreError, StoreResult,
};

const CHANGE_BUFFER: usize = 256;

struct Account {
    password: String,
    user_id: UserId,
    display_name: String,
}

pub struct MemoryStore {
    accounts: RwLock<HashMap<String, Account>>,
    profiles: RwLock<HashMap<UserId, Identity>>,
    live_session: RwLock<Option<Session>>,
    restorable_session: Mutex<Option<Session>>,
    messages: RwLock<HashMap<ChannelId, Vec<Message>>>,
    change_listeners: RwLock<HashMap<ChannelId, Vec<mpsc::Sender<RowChange>>>>,
    session_listeners: RwLock<Vec<mpsc::UnboundedSender<SessionChange>>>,

    refresh_calls: AtomicUsize,
    fail_sign_out: AtomicBool,
    force_profile_conflict: AtomicBool,
    provision_race_winner: Mutex<Option<Identity>>,
    fail_update_profile: AtomicBool,
    fail_fetch_messages: AtomicUsize,
    sign_in_delay: Mutex<Option<Duration>>,
    fetch_messages_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            profiles: RwLock::new(HashMap::new()),
            live_session: RwLock::new(None),
            restorable_session: Mutex::new(None),
            messages: RwLock::new(HashMap::new()),
            change_listeners: RwLock::new(HashMap::new()),
            session_listeners: RwLock::new(Vec::new()),
            refresh_calls: AtomicUsize::new(0),
            fail_sign_out: AtomicBool::new(false),
            force_profile_conflict: AtomicBool::new(false),
            provision_race_winner: Mutex::new(None),
            fail_update_profile: AtomicBool::new(false),
            fail_fetch_messages: AtomicUsize::new(0),
            sign_in_delay: Mutex::new(None),
            fetch_messages_delay: Mutex::new(None),
        }
    }

    /// Register an account without creating a profile row; profile
    /// provisioning is the client's job.
    pub fn register_user(&self, email: &str, password: &str, display_name: &str) -> UserId {
        let user_id = format!("user-{}", uuid::Uuid::new_v4());
        self.accounts.write().insert(
            email.to_string(),
            Account {
                password: password.to_string(),
                user_id: user_id.clone(),
                display_name: display_name.to_string(),
            },
        );
        user_id
    }

    pub fn seed_profile(&self, profile: Identity) {
        self.profiles.write().insert(profile.id.clone(), profile);
    }

    pub fn seed_message(&self, message: Message) {
        let mut messages = self.messages.write();
        let rows = messages.entry(message.channel_id.clone()).or_default();
        rows.push(message);
        rows.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    }

    pub fn set_live_session(&self, session: Option<Session>) {
        *self.live_session.write() = session;
    }

    /// Session returned by the next `refresh_session` call.
    pub fn set_restorable_session(&self, session: Session) {
        *self.restorable_session.lock() = Some(session);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn fail_sign_out(&self, fail: bool) {
        self.fail_sign_out.store(fail, Ordering::SeqCst);
    }

    /// Make every `insert_profile` call report Conflict without any row
    /// materializing, so a provisioning attempt can never complete.
    pub fn force_profile_conflict(&self, force: bool) {
        self.force_profile_conflict.store(force, Ordering::SeqCst);
    }

    /// Simulate a concurrent provisioner winning the race: the next
    /// `insert_profile` call stores this row instead of the caller's and
    /// reports Conflict.
    pub fn provision_race_winner(&self, profile: Identity) {
        *self.provision_race_winner.lock() = Some(profile);
    }

    pub fn fail_profile_updates(&self, fail: bool) {
        self.fail_update_profile.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` calls to `fetch_messages` with a network error.
    pub fn fail_next_fetches(&self, count: usize) {
        self.fail_fetch_messages.store(count, Ordering::SeqCst);
    }

    pub fn set_sign_in_delay(&self, delay: Option<Duration>) {
        *self.sign_in_delay.lock() = delay;
    }

    pub fn set_fetch_messages_delay(&self, delay: Option<Duration>) {
        *self.fetch_messages_delay.lock() = delay;
    }

    /// Push a raw change notification to every subscriber of a channel.
    /// Lets tests replay duplicate or out-of-order deliveries verbatim.
    pub fn emit(&self, channel_id: &ChannelId, change: RowChange) {
        let mut listeners = self.change_listeners.write();
        if let Some(senders) = listeners.get_mut(channel_id) {
            senders.retain(|tx| tx.try_send(change.clone()).is_ok());
        }
    }

    /// Sever every push stream for a channel, as a dropped transport would.
    pub fn drop_change_streams(&self, channel_id: &ChannelId) {
        self.change_listeners.write().remove(channel_id);
    }

    pub fn subscriber_count(&self, channel_id: &ChannelId) -> usize {
        self.change_listeners
            .read()
            .get(channel_id)
            .map(|senders| senders.len())
            .unwrap_or(0)
    }

    fn new_session(&self, user_id: UserId, email: &str, display_name: &str) -> Session {
        Session {
            user_id,
            email: Some(email.to_string()),
            display_name: Some(display_name.to_string()),
            access_token: format!("tok-{}", uuid::Uuid::new_v4()),
            refresh_token: Some(format!("refresh-{}", uuid::Uuid::new_v4())),
            expires_at: OffsetDateTime::now_utc() + time::Duration::hours(1),
        }
    }

    fn notify_session(&self, change: SessionChange) {
        let mut listeners = self.session_listeners.write();
        listeners.retain(|tx| tx.send(change.clone()).is_ok());
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get_session(&self) -> StoreResult<Option<Session>> {
        Ok(self.live_session.read().clone())
    }

    async fn refresh_session(&self) -> StoreResult<Option<Session>> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let restored = self.restorable_session.lock().take();
        if let Some(session) = restored.clone() {
            *self.live_session.write() = Some(session);
        }
        Ok(restored)
    }

    fn on_session_change(&self) -> mpsc::UnboundedReceiver<SessionChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.session_listeners.write().push(tx);
        rx
    }

    async fn sign_in(&self, email: &str, password: &str) -> StoreResult<Session> {
        let delay = *self.sign_in_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let (user_id, display_name) = {
            let accounts = self.accounts.read();
            let account = accounts
                .get(email)
                .filter(|account| account.password == password)
                .ok_or_else(|| StoreError::Unauthorized("invalid email or password".into()))?;
            (account.user_id.clone(), account.display_name.clone())
        };
        let session = self.new_session(user_id, email, &display_name);
        *self.live_session.write() = Some(session.clone());
        self.notify_session(SessionChange::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        attributes: SignUpAttributes,
    ) -> StoreResult<Session> {
        {
            let mut accounts = self.accounts.write();
            if accounts.contains_key(email) {
                return Err(StoreError::Conflict);
            }
            accounts.insert(
                email.to_string(),
                Account {
                    password: password.to_string(),
                    user_id: format!("user-{}", uuid::Uuid::new_v4()),
                    display_name: attributes.display_name,
                },
            );
        }
        self.sign_in(email, password).await
    }

    async fn sign_out(&self) -> StoreResult<()> {
        if self.fail_sign_out.load(Ordering::SeqCst) {
            return Err(StoreError::Network("sign-out endpoint unreachable".into()));
        }
        *self.live_session.write() = None;
        self.notify_session(SessionChange::SignedOut);
        Ok(())
    }

    async fn fetch_profile(&self, id: &UserId) -> StoreResult<Identity> {
        self.profiles
            .read()
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn insert_profile(&self, profile: Identity) -> StoreResult<Identity> {
        if self.force_profile_conflict.load(Ordering::SeqCst) {
            return Err(StoreError::Conflict);
        }
        if let Some(winner) = self.provision_race_winner.lock().take() {
            self.profiles.write().insert(winner.id.clone(), winner);
            return Err(StoreError::Conflict);
        }
        let mut profiles = self.profiles.write();
        if profiles.contains_key(&profile.id) {
            return Err(StoreError::Conflict);
        }
        profiles.insert(profile.id.clone(), profile.clone());
        Ok(profile)
    }

    async fn update_profile(&self, id: &UserId, update: ProfileUpdate) -> StoreResult<Identity> {
        if self.fail_update_profile.load(Ordering::SeqCst) {
            return Err(StoreError::Network("profile update failed".into()));
        }
        let mut profiles = self.profiles.write();
        let profile = profiles.get_mut(id).ok_or(StoreError::NotFound)?;
        if let Some(display_name) = update.display_name {
            profile.display_name = display_name;
        }
        if let Some(status) = update.status {
            profile.status = status;
        }
        if let Some(presence) = update.presence {
            profile.presence = presence;
        }
        if let Some(workspace_id) = update.workspace_id {
            profile.workspace_id = Some(workspace_id);
        }
        Ok(profile.clone())
    }

    async fn fetch_messages(&self, channel_id: &ChannelId) -> StoreResult<Vec<Message>> {
        let delay = *self.fetch_messages_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let remaining = self.fail_fetch_messages.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_fetch_messages.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Network("snapshot fetch failed".into()));
        }
        Ok(self
            .messages
            .read()
            .get(channel_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_message(&self, message: NewMessage) -> StoreResult<Message> {
        let row = Message {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            channel_id: message.channel_id.clone(),
            author_id: message.author_id,
            content: message.content,
            parent_id: message.parent_id,
            created_at: OffsetDateTime::now_utc(),
            updated_at: None,
            edited_at: None,
            pinned: false,
            author_name: None,
            author_avatar_url: None,
        };
        self.seed_message(row.clone());
        self.emit(&message.channel_id, RowChange::Insert { row: row.clone() });
        Ok(row)
    }

    fn subscribe_changes(&self, channel_id: &ChannelId) -> ChangeStream {
        let (tx, rx) = mpsc::channel(CHANGE_BUFFER);
        self.change_listeners
            .write()
            .entry(channel_id.clone())
            .or_default()
            .push(tx);
        ChangeStream::new(rx)
    }
}
