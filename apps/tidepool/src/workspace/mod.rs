//! Active-workspace selection: a client-side, persisted preference gated
//! on a live session. Writes reach the durable cache before
//! `select`/`clear` return, so another component reading in the same
//! tick observes the new value.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cache::{CacheExt, DurableCache};
use crate::model::Workspace;
use crate::session::{SessionEvent, SessionStore};

const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkspaceEvent {
    Selected(Workspace),
    Cleared,
}

pub struct WorkspaceSelector {
    session: Arc<SessionStore>,
    cache: Arc<dyn DurableCache>,
    active: RwLock<Option<Workspace>>,
    events: broadcast::Sender<WorkspaceEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<WorkspaceSelector>,
}

impl WorkspaceSelector {
    pub fn new(session: Arc<SessionStore>, cache: Arc<dyn DurableCache>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|weak| Self {
            session,
            cache,
            active: RwLock::new(None),
            events,
            pump: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceEvent> {
        self.events.subscribe()
    }

    pub fn active_workspace(&self) -> Option<Workspace> {
        self.active.read().clone()
    }

    /// Re-derive the selection from the durable cache after bootstrap.
    /// Requires a live session; a corrupt blob reads as unset.
    pub fn restore(&self) {
        if self.session.session().is_none() {
            return;
        }
        if !self.cache.workspace_selected() {
            return;
        }
        let Some(workspace) = self.cache.active_workspace() else {
            return;
        };
        *self.active.write() = Some(workspace.clone());
        self.session
            .set_identity_workspace(Some(workspace.id.clone()));
        let _ = self.events.send(WorkspaceEvent::Selected(workspace));
    }

    /// Make a workspace active. Rejected (silently) while no session
    /// exists; otherwise persisted before this call returns.
    pub fn select(&self, workspace: Workspace) {
        if self.session.session().is_none() {
            tracing::debug!(
                target: "tidepool::workspace",
                workspace = %workspace.id,
                "select ignored; no live session"
            );
            return;
        }
        self.cache.set_active_workspace(&workspace);
        *self.active.write() = Some(workspace.clone());
        self.session
            .set_identity_workspace(Some(workspace.id.clone()));
        let _ = self.events.send(WorkspaceEvent::Selected(workspace));
    }

    /// Drop the selection and its durable keys.
    pub fn clear(&self) {
        self.cache.clear_workspace();
        let had_selection = self.active.write().take().is_some();
        self.session.set_identity_workspace(None);
        if had_selection {
            let _ = self.events.send(WorkspaceEvent::Cleared);
        }
    }

    /// Follow session transitions: the selection cannot outlive the
    /// session that gated it. The durable keys are already gone by the
    /// time SignedOut arrives (logout clears the whole key set).
    pub fn attach(&self) {
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return;
        }
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let mut rx = self.session.subscribe();
        *pump = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::SignedOut) => {
                        let had_selection = this.active.write().take().is_some();
                        if had_selection {
                            let _ = this.events.send(WorkspaceEvent::Cleared);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }
}
