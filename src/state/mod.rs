use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::FleetError;
use crate::tmux::TmuxClient;

/// One persisted worker session, keyed in the registry by session identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Remote URL scoping this session to a repository.
    pub repository_remote: String,
    /// Branch the worker's branch diverged from.
    pub base_branch: String,
    pub branch_name: String,
    pub prompt: String,
    pub worktree_path: String,
    /// Allocated dev-server port; 0 means no dev server.
    pub port: u16,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mutable fields of a session record; timestamps are managed by the store.
#[derive(Debug, Clone)]
pub struct SessionFields {
    pub repository_remote: String,
    pub base_branch: String,
    pub branch_name: String,
    pub prompt: String,
    pub worktree_path: String,
    pub port: u16,
    pub model: String,
}

/// Application data root (`~/.local/share/fleet`, falling back to `~/.fleet`).
pub fn data_root() -> PathBuf {
    dirs::data_local_dir()
        .map(|p| p.join("fleet"))
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".fleet"))
}

/// Persistent session registry: one JSON file mapping id to record.
///
/// Every mutation is a read-modify-write of the whole file, serialized by an
/// in-process lock. Mutation volume is human-triggered, so simplicity wins
/// over throughput. Readers see whole-file replacement (write goes through a
/// temp file and rename).
pub struct StateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn at_default_path() -> Self {
        Self::new(data_root().join("state.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the whole registry. A missing file is an empty mapping; invalid
    /// JSON is a hard error.
    async fn load(&self) -> Result<BTreeMap<String, SessionRecord>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new());
            }
            Err(e) => {
                return Err(e).context(format!("failed to read {}", self.path.display()));
            }
        };
        serde_json::from_str(&raw).map_err(|source| {
            FleetError::CorruptRegistry {
                path: self.path.clone(),
                source,
            }
            .into()
        })
    }

    async fn write(&self, sessions: &BTreeMap<String, SessionRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(sessions)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .context("failed to replace session registry")?;
        Ok(())
    }

    /// Insert or update a record. `created_at` is preserved for an existing
    /// identifier; `updated_at` always refreshes.
    pub async fn save(&self, session_id: &str, fields: SessionFields) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut sessions = self.load().await?;
        let now = Utc::now();
        let created_at = sessions
            .get(session_id)
            .map(|existing| existing.created_at)
            .unwrap_or(now);
        sessions.insert(
            session_id.to_string(),
            SessionRecord {
                repository_remote: fields.repository_remote,
                base_branch: fields.base_branch,
                branch_name: fields.branch_name,
                prompt: fields.prompt,
                worktree_path: fields.worktree_path,
                port: fields.port,
                model: fields.model,
                created_at,
                updated_at: now,
            },
        );
        self.write(&sessions).await
    }

    /// Delete a record. Removing an absent identifier is a no-op.
    pub async fn remove(&self, session_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut sessions = self.load().await?;
        if sessions.remove(session_id).is_none() {
            return Ok(());
        }
        self.write(&sessions).await
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.load().await?.get(session_id).cloned())
    }

    pub async fn list_all(&self) -> Result<BTreeMap<String, SessionRecord>> {
        self.load().await
    }

    /// Identifiers for this repository whose tmux session is live right now.
    /// Liveness is checked per call, never cached in the record.
    pub async fn list_active_for_repository(
        &self,
        tmux: &TmuxClient,
        repository_remote: &str,
    ) -> Result<Vec<String>> {
        let sessions = self.load().await?;
        let mut active = Vec::new();
        for (id, record) in &sessions {
            if record.repository_remote != repository_remote {
                continue;
            }
            if tmux.has_session(id).await {
                active.push(id.clone());
            }
        }
        Ok(active)
    }
}
