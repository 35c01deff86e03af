//! repocache - Persistent repository state cache with change notification
//!
//! Keeps a local SQLite store of recently opened git repositories: per-project
//! view preferences, content-addressed snapshots of tree/status and patches,
//! and the most recent commit log. Staleness is decided by a fingerprint of the
//! repository's observable state, and a filesystem watcher tells subscribers
//! when that state may have changed.
//!
//! # Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `fingerprint` | Cheap digest of HEAD, index/HEAD mtimes and status |
//! | `db` / `cache` | Projects, prefs, settings and the three caches |
//! | `retention` | TTL and size-cap sweeps over the caches |
//! | `watcher` | Debounced filesystem watching per project |
//! | `events` | `repo-updated`, `repo-error`, `conflict-detected` fan-out |
//! | `context` | Explicit owner of all of the above |
//!
//! # Quick Start
//!
//! ```no_run
//! use repocache::{AppContext, Config};
//! use std::path::Path;
//!
//! let ctx = AppContext::init(Config::load()).unwrap();
//! let project = ctx.add_project(Path::new("/work/demo"), None).unwrap();
//!
//! // First load builds and stores, later loads with unchanged state hit
//! let load = ctx.load_repo_snapshot(&project.id, false).unwrap();
//! println!("from cache: {}", load.from_cache);
//!
//! ctx.close();
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod debounce;
pub mod events;
pub mod fingerprint;
pub mod git;
pub mod retention;
pub mod schema;
pub mod tree;
pub mod watcher;

pub use cache::{
    CacheStats, CommitSummary, LogCacheEntry, PatchCacheEntry, PatchScope, RepoCacheEntry, RepoSnapshot,
};
pub use config::Config;
pub use context::{AppContext, ContextError, SnapshotLoad};
pub use db::{Database, DbError, Project, ProjectPrefs, ProjectPrefsUpdate, CURRENT_SCHEMA_VERSION};
pub use events::{Broadcaster, ConflictState, RepoEvent};
pub use fingerprint::{FingerprintComputer, FingerprintError, RepoFingerprint};
pub use git::{ChangeType, GitCli, GitError, GitProvider, RepoStatus, StatusEntry};
pub use retention::{RetentionPolicy, SweepReport};
pub use tree::TreeNode;
pub use watcher::RepoWatcher;
