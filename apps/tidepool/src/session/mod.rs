//! Identity and session lifecycle.
//!
//! [`SessionStore`] is the single writer of the client's Session and
//! Identity records. It resolves the startup race between the durable
//! authenticated-flag, the remote session snapshot, and the session-change
//! push stream, and it guarantees the visible state is never
//! "authenticated but no identity": when a profile cannot be loaded or
//! provisioned, the locally held session is rolled back and the caller
//! sees a recoverable failure instead of a half-signed-in client.

pub mod error;

use std::future::Future;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cache::{CacheExt, DurableCache};
use crate::config::Config;
use crate::model::{Identity, Presence, Session, UserId, UserStatus, WorkspaceId};
use crate::store::{ProfileUpdate, RemoteStore, SessionChange, SignUpAttributes, StoreError};

pub use error::AuthError;

const EVENT_CAPACITY: usize = 128;

/// Notifications emitted on every observable session/identity transition.
/// State changes are the only trigger; consumers re-read the snapshot
/// accessors when one arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SessionEstablished,
    IdentityLoaded,
    IdentityUpdated,
    SignedOut,
    LoadingChanged(bool),
}

#[derive(Default)]
struct SessionState {
    session: Option<Session>,
    identity: Option<Identity>,
    loading: bool,
    profile_loading: bool,
}

pub struct SessionStore {
    store: Arc<dyn RemoteStore>,
    cache: Arc<dyn DurableCache>,
    config: Config,
    state: RwLock<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    alive: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<SessionStore>,
}

impl SessionStore {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        cache: Arc<dyn DurableCache>,
        config: Config,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|weak| Self {
            store,
            cache,
            config,
            state: RwLock::new(SessionState::default()),
            events,
            alive: Arc::new(AtomicBool::new(true)),
            pump: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> Option<Session> {
        self.state.read().session.clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state.read().identity.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().session.is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.state.read().loading
    }

    /// Startup sequence: durable flag, then the live session snapshot,
    /// then at most one refresh attempt, then the push subscription.
    ///
    /// If the durable flag claims an authenticated user but the remote
    /// store disagrees even after the single refresh, the flag is cleared
    /// and the client starts logged out; the heuristic never loops.
    pub async fn bootstrap(&self) {
        let flagged = self.cache.authenticated();
        self.set_loading(true);

        let session = match self.store.get_session().await {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!(
                    target: "tidepool::session",
                    error = %err,
                    "session snapshot failed during bootstrap"
                );
                None
            }
        };

        let session = match session {
            Some(session) => Some(session),
            None if flagged => match self.store.refresh_session().await {
                Ok(session) => session,
                Err(err) => {
                    tracing::warn!(
                        target: "tidepool::session",
                        error = %err,
                        "session refresh failed during bootstrap"
                    );
                    None
                }
            },
            None => None,
        };

        match session {
            Some(session) => {
                if let Err(err) = self.install_session(session).await {
                    tracing::warn!(
                        target: "tidepool::session",
                        error = %err,
                        "bootstrap could not complete sign-in"
                    );
                }
            }
            None => {
                if flagged {
                    self.cache.set_authenticated(false);
                }
            }
        }

        self.spawn_session_listener();
        self.set_loading(false);
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<(), AuthError> {
        self.authenticate(self.store.sign_in(email, password)).await
    }

    pub async fn signup(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<(), AuthError> {
        let attributes = SignUpAttributes {
            display_name: display_name.to_string(),
        };
        self.authenticate(self.store.sign_up(email, password, attributes))
            .await
    }

    async fn authenticate(
        &self,
        request: impl Future<Output = Result<Session, StoreError>>,
    ) -> Result<(), AuthError> {
        self.set_loading(true);
        let session = match tokio::time::timeout(self.config.login_timeout, request).await {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => {
                self.set_loading(false);
                return Err(err.into());
            }
            Err(_) => {
                self.set_loading(false);
                return Err(AuthError::Timeout);
            }
        };
        let outcome = self.install_session(session).await;
        self.spawn_session_listener();
        self.set_loading(false);
        outcome
    }

    /// Local-first sign-out: the remote invalidation is requested first,
    /// but every local side effect happens regardless of its result.
    pub async fn logout(&self) {
        if let Err(err) = self.store.sign_out().await {
            tracing::warn!(
                target: "tidepool::session",
                error = %err,
                "remote sign-out failed; clearing local state anyway"
            );
        }
        self.clear_local_session();
    }

    /// No-op when no identity is loaded. The local record only changes
    /// after the remote update is acknowledged.
    pub async fn update_status(&self, status: UserStatus) -> Result<(), AuthError> {
        self.update_identity(ProfileUpdate {
            status: Some(status),
            ..ProfileUpdate::default()
        })
        .await
    }

    /// No-op when no identity is loaded. The local record only changes
    /// after the remote update is acknowledged.
    pub async fn update_presence(&self, presence: Presence) -> Result<(), AuthError> {
        self.update_identity(ProfileUpdate {
            presence: Some(presence),
            ..ProfileUpdate::default()
        })
        .await
    }

    /// Stop applying push notifications. Used on teardown; the store can
    /// not be restarted afterwards.
    pub fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }

    /// Mirror the active workspace onto the identity record. Called by
    /// the workspace selector, which owns the active-workspace decision;
    /// this store stays the single writer of the Identity record itself.
    pub(crate) fn set_identity_workspace(&self, workspace_id: Option<WorkspaceId>) {
        let changed = {
            let mut state = self.state.write();
            match state.identity.as_mut() {
                Some(identity) if identity.workspace_id != workspace_id => {
                    identity.workspace_id = workspace_id;
                    true
                }
                _ => false,
            }
        };
        if changed {
            let _ = self.events.send(SessionEvent::IdentityUpdated);
        }
    }

    async fn update_identity(&self, update: ProfileUpdate) -> Result<(), AuthError> {
        let user_id = match self.state.read().identity.as_ref() {
            Some(identity) => identity.id.clone(),
            None => return Ok(()),
        };
        let updated = self.store.update_profile(&user_id, update).await?;
        self.state.write().identity = Some(updated);
        let _ = self.events.send(SessionEvent::IdentityUpdated);
        Ok(())
    }

    async fn install_session(&self, session: Session) -> Result<(), AuthError> {
        let user_id = session.user_id.clone();
        self.state.write().session = Some(session.clone());
        self.cache.set_authenticated(true);
        let _ = self.events.send(SessionEvent::SessionEstablished);
        self.load_identity(&user_id, &session).await
    }

    /// Load (or provision) the profile for a freshly established session.
    /// Runs at most once concurrently; a failure rolls the session back
    /// so the client never presents authenticated-without-identity.
    async fn load_identity(&self, user_id: &UserId, session: &Session) -> Result<(), AuthError> {
        {
            let mut state = self.state.write();
            if state.profile_loading {
                return Ok(());
            }
            state.profile_loading = true;
        }

        let result = self.fetch_or_provision(user_id, session).await;

        let mut state = self.state.write();
        state.profile_loading = false;
        match result {
            Ok(identity) => {
                state.identity = Some(identity);
                drop(state);
                let _ = self.events.send(SessionEvent::IdentityLoaded);
                Ok(())
            }
            Err(err) => {
                state.identity = None;
                state.session = None;
                drop(state);
                self.cache.set_authenticated(false);
                let _ = self.events.send(SessionEvent::SignedOut);
                tracing::warn!(
                    target: "tidepool::session",
                    error = %err,
                    "profile load failed; session rolled back"
                );
                Err(err)
            }
        }
    }

    async fn fetch_or_provision(
        &self,
        user_id: &UserId,
        session: &Session,
    ) -> Result<Identity, AuthError> {
        match self.store.fetch_profile(user_id).await {
            Ok(profile) => Ok(profile),
            Err(StoreError::NotFound) => self.provision_profile(user_id, session).await,
            Err(err) => Err(AuthError::ProfileUnavailable(err.to_string())),
        }
    }

    /// First sign-in for this account: create a default profile. A
    /// Conflict from the remote means another provisioner won the race;
    /// that is treated as a read, never surfaced.
    async fn provision_profile(
        &self,
        user_id: &UserId,
        session: &Session,
    ) -> Result<Identity, AuthError> {
        let email = session.email.clone().unwrap_or_default();
        let display_name = session
            .display_name
            .clone()
            .filter(|name| !name.is_empty())
            .or_else(|| {
                email
                    .split('@')
                    .next()
                    .filter(|prefix| !prefix.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "member".to_string());
        let defaults = Identity::provisioned(user_id.clone(), email, display_name);

        match self.store.insert_profile(defaults).await {
            Ok(profile) => {
                tracing::info!(
                    target: "tidepool::session",
                    user = %user_id,
                    "provisioned default profile"
                );
                Ok(profile)
            }
            Err(StoreError::Conflict) => self
                .store
                .fetch_profile(user_id)
                .await
                .map_err(|err| AuthError::ProfileUnavailable(err.to_string())),
            Err(err) => Err(AuthError::ProfileUnavailable(err.to_string())),
        }
    }

    fn clear_local_session(&self) {
        let had_any = {
            let mut state = self.state.write();
            let had_any = state.session.is_some() || state.identity.is_some();
            state.identity = None;
            state.session = None;
            had_any
        };
        self.cache.clear_all();
        if had_any {
            let _ = self.events.send(SessionEvent::SignedOut);
        }
    }

    fn set_loading(&self, loading: bool) {
        let changed = {
            let mut state = self.state.write();
            let changed = state.loading != loading;
            state.loading = loading;
            changed
        };
        if changed {
            let _ = self.events.send(SessionEvent::LoadingChanged(loading));
        }
    }

    fn spawn_session_listener(&self) {
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return;
        }
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let mut rx = self.store.on_session_change();
        let alive = self.alive.clone();
        *pump = Some(tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                this.handle_session_change(change).await;
            }
        }));
    }

    async fn handle_session_change(&self, change: SessionChange) {
        match change {
            SessionChange::SignedIn(session) | SessionChange::Refreshed(session) => {
                let already_installed = self
                    .state
                    .read()
                    .session
                    .as_ref()
                    .map(|current| current.access_token == session.access_token)
                    .unwrap_or(false);
                if already_installed {
                    return;
                }
                if let Err(err) = self.install_session(session).await {
                    tracing::warn!(
                        target: "tidepool::session",
                        error = %err,
                        "pushed session change could not complete sign-in"
                    );
                }
            }
            SessionChange::SignedOut => {
                self.clear_local_session();
            }
        }
    }
}
