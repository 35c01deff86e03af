//! Events delivered to the UI layer
//!
//! The watcher emits `repo-updated`. `repo-error` and `conflict-detected`
//! come from the wider application and only travel through the broadcaster.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoUpdated {
    pub project_id: String,
    /// Epoch milliseconds when the quiet window closed
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoErrorPayload {
    pub project_id: Option<String>,
    pub message: String,
    pub name: String,
}

/// In-progress operation that left conflicts behind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictState {
    Merge,
    Rebase,
    CherryPick,
    Revert,
}

impl ConflictState {
    /// Look for an operation stopped midway in a repository control directory
    pub fn detect(git_dir: &Path) -> Option<Self> {
        if git_dir.join("rebase-merge").is_dir() || git_dir.join("rebase-apply").is_dir() {
            Some(ConflictState::Rebase)
        } else if git_dir.join("MERGE_HEAD").is_file() {
            Some(ConflictState::Merge)
        } else if git_dir.join("CHERRY_PICK_HEAD").is_file() {
            Some(ConflictState::CherryPick)
        } else if git_dir.join("REVERT_HEAD").is_file() {
            Some(ConflictState::Revert)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetected {
    pub project_id: String,
    pub state: ConflictState,
}

/// Wire form: `{"event": "repo-updated", "payload": {...}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum RepoEvent {
    RepoUpdated(RepoUpdated),
    RepoError(RepoErrorPayload),
    ConflictDetected(ConflictDetected),
}

impl RepoEvent {
    pub fn updated(project_id: &str, updated_at: i64) -> Self {
        RepoEvent::RepoUpdated(RepoUpdated { project_id: project_id.to_string(), updated_at })
    }

    pub fn error(project_id: Option<&str>, name: &str, message: impl std::fmt::Display) -> Self {
        RepoEvent::RepoError(RepoErrorPayload {
            project_id: project_id.map(str::to_string),
            message: message.to_string(),
            name: name.to_string(),
        })
    }

    pub fn conflict(project_id: &str, state: ConflictState) -> Self {
        RepoEvent::ConflictDetected(ConflictDetected { project_id: project_id.to_string(), state })
    }

    /// Channel name as the UI sees it
    pub fn name(&self) -> &'static str {
        match self {
            RepoEvent::RepoUpdated(_) => "repo-updated",
            RepoEvent::RepoError(_) => "repo-error",
            RepoEvent::ConflictDetected(_) => "conflict-detected",
        }
    }

    pub fn project_id(&self) -> Option<&str> {
        match self {
            RepoEvent::RepoUpdated(e) => Some(&e.project_id),
            RepoEvent::RepoError(e) => e.project_id.as_deref(),
            RepoEvent::ConflictDetected(e) => Some(&e.project_id),
        }
    }
}

/// Fan-out of events to every live subscriber
#[derive(Debug, Clone, Default)]
pub struct Broadcaster {
    subscribers: Arc<Mutex<Vec<Sender<RepoEvent>>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<RepoEvent> {
        let (tx, rx) = channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver to all subscribers, dropping those whose receiver is gone.
    /// Returns how many received the event.
    pub fn emit(&self, event: RepoEvent) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        log::debug!("emitted {} to {} subscriber(s)", event.name(), subscribers.len());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sender<RepoEvent>>> {
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
