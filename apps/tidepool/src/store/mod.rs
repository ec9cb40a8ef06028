//! Seam to the hosted backend.
//!
//! The core never speaks the remote store's wire protocol directly; it
//! consumes the operations below through the [`RemoteStore`] trait. The
//! in-memory [`memory::MemoryStore`] implements the same contract for
//! tests and doubles as the reference semantics of the collaborator,
//! including its at-least-once change delivery.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::{ChannelId, Identity, Message, MessageId, Presence, Session, UserId, UserStatus, WorkspaceId};

pub mod memory;

pub use memory::MemoryStore;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("record already exists")]
    Conflict,
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("store connection closed")]
    Closed,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One change notification for a channel's message rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RowChange {
    Insert { row: Message },
    Update { row: Message },
    Delete { id: MessageId },
}

/// Session lifecycle notifications pushed by the remote store.
#[derive(Debug, Clone)]
pub enum SessionChange {
    SignedIn(Session),
    Refreshed(Session),
    SignedOut,
}

/// Attributes supplied alongside a sign-up request.
#[derive(Debug, Clone, Default)]
pub struct SignUpAttributes {
    pub display_name: String,
}

/// Partial profile update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub status: Option<UserStatus>,
    pub presence: Option<Presence>,
    pub workspace_id: Option<WorkspaceId>,
}

/// Fields for a new message; the store assigns id and creation time.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub content: String,
    pub parent_id: Option<MessageId>,
}

/// Receiving half of a push subscription for one channel.
///
/// The stream ends (`recv` returns `None`) when the transport drops or the
/// subscription is released server-side; reconnection is the consumer's
/// concern (see [`crate::subscription`]).
pub struct ChangeStream {
    rx: mpsc::Receiver<RowChange>,
}

impl ChangeStream {
    pub fn new(rx: mpsc::Receiver<RowChange>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<RowChange> {
        self.rx.recv().await
    }
}

/// Operations the synchronization core consumes from the hosted backend.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get_session(&self) -> StoreResult<Option<Session>>;

    /// One-shot attempt to revive a session from a refresh token.
    async fn refresh_session(&self) -> StoreResult<Option<Session>>;

    /// Register a listener for session lifecycle changes. Each call
    /// returns an independent receiver.
    fn on_session_change(&self) -> mpsc::UnboundedReceiver<SessionChange>;

    async fn sign_in(&self, email: &str, password: &str) -> StoreResult<Session>;

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        attributes: SignUpAttributes,
    ) -> StoreResult<Session>;

    async fn sign_out(&self) -> StoreResult<()>;

    /// Fetch a profile row; `StoreError::NotFound` when none exists.
    async fn fetch_profile(&self, id: &UserId) -> StoreResult<Identity>;

    /// Create a profile row; `StoreError::Conflict` when one already exists.
    async fn insert_profile(&self, profile: Identity) -> StoreResult<Identity>;

    async fn update_profile(&self, id: &UserId, update: ProfileUpdate) -> StoreResult<Identity>;

    /// Full ordered snapshot of a channel, ascending by creation time.
    async fn fetch_messages(&self, channel_id: &ChannelId) -> StoreResult<Vec<Message>>;

    async fn insert_message(&self, message: NewMessage) -> StoreResult<Message>;

    /// Open a push subscription for one channel's row changes.
    fn subscribe_changes(&self, channel_id: &ChannelId) -> ChangeStream;
}
