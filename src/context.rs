//! Application context
//!
//! One explicit object owns the store, the event broadcaster, the watcher and
//! the git provider. Callers create it with [`AppContext::init`] and tear it
//! down with [`AppContext::close`]; nothing here is process-global.

use crate::cache::RepoSnapshot;
use crate::config::Config;
use crate::db::{Database, DbError, Project};
use crate::events::{Broadcaster, ConflictState, RepoEvent};
use crate::fingerprint::{FingerprintComputer, FingerprintError, RepoFingerprint};
use crate::git::{GitCli, GitError, GitProvider};
use crate::retention::{RetentionPolicy, SweepReport};
use crate::tree::build_tree;
use crate::watcher::RepoWatcher;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("no project with id {0}")]
    UnknownProject(String),

    #[error("cannot resolve {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ContextError {
    /// Short name carried in `repo-error` payloads
    pub fn name(&self) -> &'static str {
        match self {
            ContextError::Db(_) => "DbError",
            ContextError::Fingerprint(_) => "FingerprintError",
            ContextError::Git(_) => "GitError",
            ContextError::UnknownProject(_) => "UnknownProject",
            ContextError::Io { .. } => "IoError",
        }
    }
}

pub type Result<T> = std::result::Result<T, ContextError>;

/// Result of a read-through snapshot load
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotLoad {
    pub fingerprint: RepoFingerprint,
    pub from_cache: bool,
    pub snapshot: RepoSnapshot,
}

pub struct AppContext {
    config: Config,
    db: Database,
    events: Broadcaster,
    watcher: RepoWatcher,
    git: Arc<dyn GitProvider>,
}

impl AppContext {
    /// Open the database under the configured data directory and start the
    /// watcher dispatcher.
    pub fn init(config: Config) -> Result<Self> {
        let db = Database::open_in(config.data_dir())?;
        log::debug!("database at {}", db.path().display());
        Ok(Self::with_parts(config, db, Arc::new(GitCli::default())))
    }

    pub fn with_parts(config: Config, db: Database, git: Arc<dyn GitProvider>) -> Self {
        let events = Broadcaster::new();
        let watcher = RepoWatcher::new(events.clone(), config.watcher.debounce());
        Self { config, db, events, watcher, git }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn watcher(&self) -> &RepoWatcher {
        &self.watcher
    }

    pub fn subscribe(&self) -> Receiver<RepoEvent> {
        self.events.subscribe()
    }

    /// Stop every watch session and the dispatcher thread
    pub fn close(&self) {
        self.watcher.close();
        log::debug!("context closed");
    }

    // ========================================================================
    // Projects
    // ========================================================================

    fn project(&self, id: &str) -> Result<Project> {
        self.db.get_project(id)?.ok_or_else(|| ContextError::UnknownProject(id.to_string()))
    }

    /// Register a repository. Adding a path twice returns the existing project.
    pub fn add_project(&self, path: &Path, name: Option<&str>) -> Result<Project> {
        let path = std::fs::canonicalize(path).map_err(|source| ContextError::Io { path: path.to_path_buf(), source })?;
        self.git.git_dir(&path)?;

        let path_str = path.to_string_lossy().to_string();
        if let Some(existing) = self.db.get_project_by_path(&path_str)? {
            return Ok(existing);
        }

        let name = match name {
            Some(name) => name.to_string(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path_str.clone()),
        };
        Ok(self.db.insert_project(&name, &path_str)?)
    }

    /// Mark a project as opened and start watching it
    pub fn open_project(&self, id: &str) -> Result<Project> {
        if !self.db.update_last_opened(id)? {
            return Err(ContextError::UnknownProject(id.to_string()));
        }
        let project = self.project(id)?;
        let cwd = Path::new(&project.path);
        let git_dir = self
            .git
            .git_dir(cwd)
            .map_err(|e| log::debug!("git dir of {} not resolved, guessing: {}", project.id, e))
            .ok();
        self.watcher.watch_project(&project.id, cwd, git_dir.as_deref());
        Ok(project)
    }

    pub fn remove_project(&self, id: &str) -> Result<bool> {
        self.watcher.unwatch_project(id);
        Ok(self.db.delete_project(id)?)
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Fingerprint the repository, serve the cached snapshot on a hit, and
    /// build and store one on a miss. Cache failures fall back to building
    /// directly; fingerprint and git failures propagate.
    pub fn load_repo_snapshot(&self, project_id: &str, include_ignored: bool) -> Result<SnapshotLoad> {
        let project = self.project(project_id)?;
        let repo = PathBuf::from(&project.path);
        let (fingerprint, status) = FingerprintComputer::new(self.git.as_ref()).compute_with_status(&repo)?;

        match self.db.get_repo_cache(project_id, &fingerprint, include_ignored) {
            Ok(Some(entry)) => {
                log::debug!("snapshot cache hit for {}", project_id);
                return Ok(SnapshotLoad { fingerprint, from_cache: true, snapshot: entry.snapshot });
            }
            Ok(None) => log::debug!("snapshot cache miss for {}", project_id),
            Err(e) => log::warn!("snapshot cache lookup failed for {}: {}", project_id, e),
        }

        let files = self.git.list_files(&repo, include_ignored)?;
        let snapshot = RepoSnapshot { tree: Some(build_tree(&files, &status)), status: Some(status) };
        if let Err(e) = self.db.set_repo_cache(project_id, &fingerprint, include_ignored, &snapshot) {
            log::warn!("failed to cache snapshot for {}: {}", project_id, e);
        }

        Ok(SnapshotLoad { fingerprint, from_cache: false, snapshot })
    }

    pub fn invalidate(&self, project_id: &str) -> Result<usize> {
        self.project(project_id)?;
        Ok(self.db.invalidate_project_cache(project_id)?)
    }

    // ========================================================================
    // Signals & Maintenance
    // ========================================================================

    /// Emit `conflict-detected` when the repository is stopped mid-operation
    pub fn check_conflicts(&self, project_id: &str) -> Result<Option<ConflictState>> {
        let project = self.project(project_id)?;
        let git_dir = self.git.git_dir(Path::new(&project.path))?;
        let state = ConflictState::detect(&git_dir);
        if let Some(state) = state {
            self.events.emit(RepoEvent::conflict(project_id, state));
        }
        Ok(state)
    }

    /// Forward a failure to subscribers as `repo-error`
    pub fn report_error(&self, project_id: Option<&str>, err: &ContextError) {
        log::warn!("{}", err);
        self.events.emit(RepoEvent::error(project_id, err.name(), err));
    }

    pub fn run_retention(&self) -> Result<SweepReport> {
        let policy = RetentionPolicy::from(&self.config.retention);
        Ok(self.db.sweep_cache(&policy)?)
    }
}
