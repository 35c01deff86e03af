//! Repository fingerprints
//!
//! A fingerprint is the freshness token for everything cached about a
//! repository: HEAD commit, index and HEAD file mtimes, and a digest of the
//! staged and unstaged changes. Any change to one of those moves the token.

use crate::git::{GitError, GitProvider, RepoStatus, StatusEntry};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;

/// Raised when a fingerprint cannot be derived.
///
/// Callers must treat this as "unknown", never as "unchanged".
#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("Repository unavailable at {}: {source}", path.display())]
    Unavailable {
        path: PathBuf,
        #[source]
        source: GitError,
    },
}

/// Composite freshness token for a repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoFingerprint {
    pub repo_path: String,
    pub head_oid: String,
    pub index_mtime_ms: i64,
    pub head_mtime_ms: i64,
    pub status_hash: String,
}

impl RepoFingerprint {
    /// Stable text form used as the cache key column.
    ///
    /// The path is length-prefixed; the remaining fields are hex or decimal
    /// and cannot contain the separator.
    pub fn cache_key(&self) -> String {
        format!(
            "{}:{}|{}|{}|{}|{}",
            self.repo_path.len(),
            self.repo_path,
            self.head_oid,
            self.index_mtime_ms,
            self.head_mtime_ms,
            self.status_hash
        )
    }
}

/// SHA-256 over the sorted staged and unstaged `(side, change, path)`
/// triples. Untracked paths do not participate.
pub fn status_digest(status: &RepoStatus) -> String {
    let mut entries: Vec<(&str, &str, &str)> = Vec::with_capacity(status.staged.len() + status.unstaged.len());
    entries.extend(status.staged.iter().map(|e| digest_entry("S", e)));
    entries.extend(status.unstaged.iter().map(|e| digest_entry("U", e)));
    entries.sort_unstable();

    let mut hasher = Sha256::new();
    for (side, change, path) in entries {
        for field in [side, change, path] {
            // Paths may contain any byte, so every field carries its length
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

fn digest_entry<'a>(side: &'a str, entry: &'a StatusEntry) -> (&'a str, &'a str, &'a str) {
    (side, entry.change.as_str(), &entry.path)
}

/// Modification time in epoch milliseconds, 0 when the file is missing
fn mtime_ms(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Derives fingerprints through a [`GitProvider`]
pub struct FingerprintComputer<'a> {
    git: &'a dyn GitProvider,
}

impl<'a> FingerprintComputer<'a> {
    pub fn new(git: &'a dyn GitProvider) -> Self {
        Self { git }
    }

    pub fn compute(&self, repo: &Path) -> Result<RepoFingerprint, FingerprintError> {
        self.compute_with_status(repo).map(|(fingerprint, _)| fingerprint)
    }

    /// Compute the fingerprint and hand back the status it was built from,
    /// so a caller building a presentation does not query status twice.
    pub fn compute_with_status(&self, repo: &Path) -> Result<(RepoFingerprint, RepoStatus), FingerprintError> {
        let unavailable = |source| FingerprintError::Unavailable { path: repo.to_path_buf(), source };

        let git_dir = self.git.git_dir(repo).map_err(unavailable)?;
        let head_oid = self.git.head_oid(repo).map_err(unavailable)?.unwrap_or_default();
        let status = self.git.status(repo).map_err(unavailable)?;

        let fingerprint = RepoFingerprint {
            repo_path: repo.to_string_lossy().to_string(),
            head_oid,
            index_mtime_ms: mtime_ms(&git_dir.join("index")),
            head_mtime_ms: mtime_ms(&git_dir.join("HEAD")),
            status_hash: status_digest(&status),
        };
        log::debug!("fingerprint for {}: head={} status={}", repo.display(), fingerprint.head_oid, fingerprint.status_hash);

        Ok((fingerprint, status))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::git::{self, ChangeType};
    use proptest::prelude::*;
    use std::sync::Mutex;

    /// In-memory provider for tests
    pub(crate) struct FakeGit {
        pub git_dir: Option<PathBuf>,
        pub head: Mutex<Option<String>>,
        pub status: Mutex<RepoStatus>,
        pub files: Vec<String>,
    }

    impl FakeGit {
        pub(crate) fn new(git_dir: &Path) -> Self {
            Self {
                git_dir: Some(git_dir.to_path_buf()),
                head: Mutex::new(Some("a".repeat(40))),
                status: Mutex::new(RepoStatus::default()),
                files: vec!["README.md".to_string(), "src/lib.rs".to_string()],
            }
        }

        pub(crate) fn missing() -> Self {
            Self {
                git_dir: None,
                head: Mutex::new(None),
                status: Mutex::new(RepoStatus::default()),
                files: Vec::new(),
            }
        }
    }

    impl GitProvider for FakeGit {
        fn git_dir(&self, repo: &Path) -> git::Result<PathBuf> {
            self.git_dir
                .clone()
                .ok_or_else(|| GitError::NotARepository { path: repo.to_path_buf() })
        }

        fn head_oid(&self, _repo: &Path) -> git::Result<Option<String>> {
            Ok(self.head.lock().unwrap().clone())
        }

        fn status(&self, _repo: &Path) -> git::Result<RepoStatus> {
            Ok(self.status.lock().unwrap().clone())
        }

        fn list_files(&self, _repo: &Path, _include_ignored: bool) -> git::Result<Vec<String>> {
            Ok(self.files.clone())
        }
    }

    fn entry(path: &str, change: ChangeType) -> StatusEntry {
        StatusEntry { path: path.to_string(), change, orig_path: None }
    }

    #[test]
    fn test_missing_index_normalizes_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let git = FakeGit::new(dir.path());
        let fp = FingerprintComputer::new(&git).compute(dir.path()).unwrap();

        assert_eq!(fp.index_mtime_ms, 0);
        assert_eq!(fp.head_mtime_ms, 0);
        assert_eq!(fp.head_oid.len(), 40);
    }

    #[test]
    fn test_unborn_head_is_empty_oid() {
        let dir = tempfile::tempdir().unwrap();
        let git = FakeGit::new(dir.path());
        *git.head.lock().unwrap() = None;

        let fp = FingerprintComputer::new(&git).compute(dir.path()).unwrap();
        assert_eq!(fp.head_oid, "");
    }

    #[test]
    fn test_index_file_contributes_mtime() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index"), b"DIRC").unwrap();
        std::fs::write(dir.path().join("HEAD"), b"ref: refs/heads/main\n").unwrap();
        let git = FakeGit::new(dir.path());

        let fp = FingerprintComputer::new(&git).compute(dir.path()).unwrap();
        assert!(fp.index_mtime_ms > 0);
        assert!(fp.head_mtime_ms > 0);
    }

    #[test]
    fn test_status_change_moves_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let git = FakeGit::new(dir.path());
        let computer = FingerprintComputer::new(&git);
        let before = computer.compute(dir.path()).unwrap();

        git.status.lock().unwrap().unstaged.push(entry("src/lib.rs", ChangeType::Modified));
        let after = computer.compute(dir.path()).unwrap();

        assert_ne!(before, after);
        assert_ne!(before.cache_key(), after.cache_key());
    }

    #[test]
    fn test_head_change_moves_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let git = FakeGit::new(dir.path());
        let computer = FingerprintComputer::new(&git);
        let before = computer.compute(dir.path()).unwrap();

        *git.head.lock().unwrap() = Some("b".repeat(40));
        assert_ne!(before, computer.compute(dir.path()).unwrap());
    }

    #[test]
    fn test_untracked_does_not_affect_digest() {
        let mut status = RepoStatus::default();
        let clean = status_digest(&status);
        status.untracked.push(entry("notes.txt", ChangeType::Untracked));
        assert_eq!(clean, status_digest(&status));
    }

    #[test]
    fn test_staged_and_unstaged_are_distinguished() {
        let mut staged = RepoStatus::default();
        staged.staged.push(entry("a.rs", ChangeType::Modified));
        let mut unstaged = RepoStatus::default();
        unstaged.unstaged.push(entry("a.rs", ChangeType::Modified));

        assert_ne!(status_digest(&staged), status_digest(&unstaged));
    }

    #[test]
    fn test_separators_in_paths_do_not_collide() {
        let mut two = RepoStatus::default();
        two.staged.push(entry("a.rs", ChangeType::Modified));
        two.staged.push(entry("b.rs", ChangeType::Modified));

        let mut one = RepoStatus::default();
        one.staged.push(entry("a.rs\nS\tM\tb.rs", ChangeType::Modified));
        let mut other = RepoStatus::default();
        other.staged.push(entry("a.rs\u{0}b.rs", ChangeType::Modified));

        assert_ne!(status_digest(&two), status_digest(&one));
        assert_ne!(status_digest(&two), status_digest(&other));
        assert_ne!(status_digest(&one), status_digest(&other));
    }

    #[test]
    fn test_cache_key_is_unambiguous() {
        let base = RepoFingerprint {
            repo_path: "/r|1".to_string(),
            head_oid: "2".to_string(),
            index_mtime_ms: 3,
            head_mtime_ms: 4,
            status_hash: "ff".to_string(),
        };
        let shifted = RepoFingerprint {
            repo_path: "/r".to_string(),
            head_oid: "1|2".to_string(),
            ..base.clone()
        };
        assert_ne!(base.cache_key(), shifted.cache_key());
        assert_eq!(base.cache_key(), base.clone().cache_key());
        assert!(base.cache_key().starts_with("4:/r|1|"));
    }

    #[test]
    fn test_unavailable_repository_is_an_error() {
        let git = FakeGit::missing();
        let result = FingerprintComputer::new(&git).compute(Path::new("/nonexistent/repo"));
        assert!(matches!(result, Err(FingerprintError::Unavailable { .. })));
    }

    proptest! {
        #[test]
        fn prop_digest_ignores_entry_order(paths in proptest::collection::vec("[a-z]{1,8}\\.rs", 0..12)) {
            let mut forward = RepoStatus::default();
            forward.unstaged = paths.iter().map(|p| entry(p, ChangeType::Modified)).collect();
            let mut reversed = forward.clone();
            reversed.unstaged.reverse();

            prop_assert_eq!(status_digest(&forward), status_digest(&reversed));
            prop_assert_eq!(status_digest(&forward).len(), 64);
        }
    }
}
