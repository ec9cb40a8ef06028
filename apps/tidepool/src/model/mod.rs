//! Domain types shared across the synchronization core.
//!
//! Everything here is plain data: identity and session records mirrored
//! from the remote store, workspace descriptors, and the message type that
//! feeds are built from. Messages carry a total order — ascending creation
//! time with ties broken by id — so that every feed has exactly one stable
//! arrangement no matter which order events arrived in.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type UserId = String;
pub type WorkspaceId = String;
pub type ChannelId = String;
pub type MessageId = String;

/// Presence advertised alongside an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Active,
    Away,
    #[default]
    Offline,
    Dnd,
}

/// Free-text status with an optional emoji and expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UserStatus {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

impl UserStatus {
    pub fn is_set(&self) -> bool {
        !self.text.is_empty() || self.emoji.is_some()
    }
}

/// The authenticated user's profile as held client-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: UserId,
    pub email: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub status: UserStatus,
    #[serde(default)]
    pub presence: Presence,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<WorkspaceId>,
}

impl Identity {
    /// Default profile provisioned on first sign-in when the remote store
    /// has no record for this user yet.
    pub fn provisioned(id: UserId, email: String, display_name: String) -> Self {
        Self {
            id,
            email,
            display_name,
            avatar_url: None,
            status: UserStatus::default(),
            presence: Presence::Offline,
            timezone: None,
            role: None,
            workspace_id: None,
        }
    }
}

/// The live authentication grant backing an identity.
///
/// A session can exist while the identity is still loading; the reverse is
/// never allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: UserId,
    /// Denormalized account attributes, used to provision a profile when
    /// the remote store has none for this user yet.
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= OffsetDateTime::now_utc()
    }
}

/// A named collaboration space. Exactly one is active at a time; the
/// active choice is a persisted client preference, not server state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub icon_url: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

/// One unit of a channel feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<MessageId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub edited_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_avatar_url: Option<String>,
}

impl Message {
    /// Total, stable feed order: creation time ascending, id as tiebreak.
    pub fn sort_key(&self) -> (OffsetDateTime, &str) {
        (self.created_at, self.id.as_str())
    }
}
