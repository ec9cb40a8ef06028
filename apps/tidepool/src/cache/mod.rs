//! Durable key-value cache surviving process restarts.
//!
//! The recognized key set is closed: a handful of flags and blobs that let
//! a restart re-derive the visible state before any remote round trip
//! completes. Values are stored as strings (JSON for the workspace blob);
//! typed accessors live on [`CacheExt`] so call sites never touch raw
//! keys. A corrupt blob is discarded on read, never propagated.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use directories::BaseDirs;
use parking_lot::RwLock;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::model::Workspace;

/// The closed set of durable keys this core recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    AuthenticatedFlag,
    AuthTimestamp,
    ActiveWorkspace,
    WorkspaceSelectedFlag,
}

impl CacheKey {
    pub const ALL: [CacheKey; 4] = [
        CacheKey::AuthenticatedFlag,
        CacheKey::AuthTimestamp,
        CacheKey::ActiveWorkspace,
        CacheKey::WorkspaceSelectedFlag,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CacheKey::AuthenticatedFlag => "authenticated-flag",
            CacheKey::AuthTimestamp => "auth-timestamp",
            CacheKey::ActiveWorkspace => "active-workspace",
            CacheKey::WorkspaceSelectedFlag => "workspace-selected-flag",
        }
    }

    fn from_str(raw: &str) -> Option<Self> {
        CacheKey::ALL.into_iter().find(|key| key.as_str() == raw)
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("unable to determine home directory")]
    NoBaseDir,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Encode(String),
}

/// Synchronous durable store. Writes are visible to subsequent reads in
/// the same process as soon as the call returns; `clear` removes the whole
/// key set under one lock so no reader observes a partial wipe.
pub trait DurableCache: Send + Sync {
    fn get(&self, key: CacheKey) -> Option<String>;
    fn put(&self, key: CacheKey, value: String);
    fn remove(&self, key: CacheKey);
    fn clear(&self, keys: &[CacheKey]);
}

/// Typed accessors over the raw key set.
pub trait CacheExt: DurableCache {
    fn authenticated(&self) -> bool {
        self.get(CacheKey::AuthenticatedFlag)
            .map(|value| value == "true")
            .unwrap_or(false)
    }

    fn set_authenticated(&self, authenticated: bool) {
        if authenticated {
            self.put(CacheKey::AuthenticatedFlag, "true".to_string());
            if let Ok(now) = OffsetDateTime::now_utc().format(&Rfc3339) {
                self.put(CacheKey::AuthTimestamp, now);
            }
        } else {
            self.clear(&[CacheKey::AuthenticatedFlag, CacheKey::AuthTimestamp]);
        }
    }

    fn auth_timestamp(&self) -> Option<OffsetDateTime> {
        let raw = self.get(CacheKey::AuthTimestamp)?;
        match OffsetDateTime::parse(&raw, &Rfc3339) {
            Ok(instant) => Some(instant),
            Err(err) => {
                tracing::warn!(
                    target: "tidepool::cache",
                    error = %err,
                    "discarding unparseable auth timestamp"
                );
                self.remove(CacheKey::AuthTimestamp);
                None
            }
        }
    }

    /// Reads the persisted workspace choice. Fails closed: a corrupt blob
    /// clears the key and reads as unset.
    fn active_workspace(&self) -> Option<Workspace> {
        let raw = self.get(CacheKey::ActiveWorkspace)?;
        match serde_json::from_str(&raw) {
            Ok(workspace) => Some(workspace),
            Err(err) => {
                tracing::warn!(
                    target: "tidepool::cache",
                    error = %err,
                    "discarding corrupt workspace blob"
                );
                self.clear(&[CacheKey::ActiveWorkspace, CacheKey::WorkspaceSelectedFlag]);
                None
            }
        }
    }

    fn set_active_workspace(&self, workspace: &Workspace) {
        match serde_json::to_string(workspace) {
            Ok(blob) => {
                self.put(CacheKey::ActiveWorkspace, blob);
                self.put(CacheKey::WorkspaceSelectedFlag, "true".to_string());
            }
            Err(err) => {
                tracing::warn!(
                    target: "tidepool::cache",
                    error = %err,
                    "failed to encode workspace blob"
                );
            }
        }
    }

    fn workspace_selected(&self) -> bool {
        self.get(CacheKey::WorkspaceSelectedFlag)
            .map(|value| value == "true")
            .unwrap_or(false)
    }

    fn clear_workspace(&self) {
        self.clear(&[CacheKey::ActiveWorkspace, CacheKey::WorkspaceSelectedFlag]);
    }

    fn clear_all(&self) {
        self.clear(&CacheKey::ALL);
    }
}

impl<C: DurableCache + ?Sized> CacheExt for C {}

/// Process-local cache for tests and embedders without a home directory.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<CacheKey, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableCache for MemoryCache {
    fn get(&self, key: CacheKey) -> Option<String> {
        self.entries.read().get(&key).cloned()
    }

    fn put(&self, key: CacheKey, value: String) {
        self.entries.write().insert(key, value);
    }

    fn remove(&self, key: CacheKey) {
        self.entries.write().remove(&key);
    }

    fn clear(&self, keys: &[CacheKey]) {
        let mut entries = self.entries.write();
        for key in keys {
            entries.remove(key);
        }
    }
}

/// Durable cache backed by a JSON state file under the user's home
/// directory. The in-memory map is the read path; every mutation rewrites
/// the file. A missing or unreadable file starts empty rather than
/// failing the caller.
pub struct DiskCache {
    path: PathBuf,
    entries: RwLock<HashMap<CacheKey, String>>,
}

impl DiskCache {
    pub fn open() -> Result<Self, CacheError> {
        let base = BaseDirs::new().ok_or(CacheError::NoBaseDir)?;
        let path = base.home_dir().join(".tidepool").join("state.json");
        Self::open_at(path)
    }

    pub fn open_at(path: PathBuf) -> Result<Self, CacheError> {
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<BTreeMap<String, String>>(&raw) {
                Ok(map) => map
                    .into_iter()
                    .filter_map(|(key, value)| CacheKey::from_str(&key).map(|key| (key, value)))
                    .collect(),
                Err(err) => {
                    tracing::warn!(
                        target: "tidepool::cache",
                        path = %path.display(),
                        error = %err,
                        "state file unreadable; starting from an empty cache"
                    );
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    fn persist(&self, entries: &HashMap<CacheKey, String>) {
        let map: BTreeMap<&str, &str> = entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        if let Err(err) = self.write_file(&map) {
            tracing::warn!(
                target: "tidepool::cache",
                path = %self.path.display(),
                error = %err,
                "failed to persist durable cache"
            );
        }
    }

    fn write_file(&self, map: &BTreeMap<&str, &str>) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(map)
            .map_err(|err| CacheError::Encode(err.to_string()))?;
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        file.write_all(serialized.as_bytes())?;
        Ok(())
    }
}

impl DurableCache for DiskCache {
    fn get(&self, key: CacheKey) -> Option<String> {
        self.entries.read().get(&key).cloned()
    }

    fn put(&self, key: CacheKey, value: String) {
        let mut entries = self.entries.write();
        entries.insert(key, value);
        self.persist(&entries);
    }

    fn remove(&self, key: CacheKey) {
        let mut entries = self.entries.write();
        if entries.remove(&key).is_some() {
            self.persist(&entries);
        }
    }

    fn clear(&self, keys: &[CacheKey]) {
        let mut entries = self.entries.write();
        let mut changed = false;
        for key in keys {
            changed |= entries.remove(key).is_some();
        }
        if changed {
            self.persist(&entries);
        }
    }
}
