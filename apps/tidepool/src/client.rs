//! [`ChatClient`] wires the durable cache, the remote store seam, and the
//! stateful components together, and owns the one bootstrap sequence the
//! whole client uses. There is no ambient global: embedders construct a
//! client and pass it (or its parts) to whatever renders the state.

use std::sync::Arc;

use crate::cache::DurableCache;
use crate::config::Config;
use crate::feed::FeedReconciler;
use crate::model::{ChannelId, Message, MessageId};
use crate::session::{AuthError, SessionStore};
use crate::store::RemoteStore;
use crate::subscription::ChangeFeedSubscriber;
use crate::workspace::WorkspaceSelector;

pub struct ChatClient {
    session: Arc<SessionStore>,
    workspaces: Arc<WorkspaceSelector>,
    feeds: Arc<FeedReconciler>,
}

impl ChatClient {
    pub fn new(store: Arc<dyn RemoteStore>, cache: Arc<dyn DurableCache>, config: Config) -> Self {
        let session = SessionStore::new(store.clone(), cache.clone(), config.clone());
        let workspaces = WorkspaceSelector::new(session.clone(), cache.clone());
        let subscriber = ChangeFeedSubscriber::new(store.clone(), config);
        let feeds = Arc::new(FeedReconciler::new(store, subscriber));
        Self {
            session,
            workspaces,
            feeds,
        }
    }

    /// The startup sequence, in dependency order: session state first
    /// (durable flag, snapshot, single refresh attempt, push
    /// subscription), then the persisted workspace choice. Run once,
    /// before anything renders.
    pub async fn bootstrap(&self) {
        self.workspaces.attach();
        self.session.bootstrap().await;
        self.workspaces.restore();
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn workspaces(&self) -> &Arc<WorkspaceSelector> {
        &self.workspaces
    }

    pub fn feeds(&self) -> &Arc<FeedReconciler> {
        &self.feeds
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<(), AuthError> {
        self.session.login(email, password).await
    }

    pub async fn signup(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<(), AuthError> {
        self.session.signup(email, password, display_name).await
    }

    /// Sign out and drop every piece of derived state: identity, session,
    /// active workspace, durable keys, and open feeds. Local effects run
    /// even when the remote invalidation fails.
    pub async fn logout(&self) {
        self.session.logout().await;
        self.workspaces.clear();
        self.feeds.close_all();
    }

    pub fn open_channel(&self, channel_id: ChannelId) {
        self.feeds.open(channel_id);
    }

    pub fn close_channel(&self, channel_id: &ChannelId) {
        self.feeds.close(channel_id);
    }

    pub fn feed(&self, channel_id: &ChannelId) -> Vec<Message> {
        self.feeds.feed(channel_id)
    }

    pub async fn send_message(
        &self,
        channel_id: &ChannelId,
        content: String,
        parent_id: Option<MessageId>,
    ) -> Result<Message, AuthError> {
        let identity = self.session.identity().ok_or(AuthError::NotSignedIn)?;
        self.feeds
            .send_message(channel_id, identity.id, content, parent_id)
            .await
            .map_err(AuthError::from)
    }

    /// Tear the client down: stop every pump and drop derived state.
    pub fn shutdown(&self) {
        self.feeds.close_all();
        self.workspaces.shutdown();
        self.session.shutdown();
    }
}
