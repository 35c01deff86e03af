//! Git provider boundary
//!
//! The cache never runs version-control logic itself. Everything it needs from
//! a repository (control directory, HEAD, status, file listing) goes through the
//! [`GitProvider`] trait. [`GitCli`] is the default implementation and shells
//! out to the `git` binary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use thiserror::Error;

/// Errors raised by a git provider
#[derive(Debug, Error)]
pub enum GitError {
    #[error("Failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Not a git repository: {}", path.display())]
    NotARepository { path: PathBuf },

    #[error("git {command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("Unexpected git output: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Kind of change reported for a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
    Renamed,
    Copied,
    TypeChanged,
    Unmerged,
    Untracked,
}

impl ChangeType {
    /// Map a porcelain v1 status letter
    pub fn from_porcelain(code: char) -> Option<Self> {
        match code {
            'A' => Some(ChangeType::Added),
            'M' => Some(ChangeType::Modified),
            'D' => Some(ChangeType::Deleted),
            'R' => Some(ChangeType::Renamed),
            'C' => Some(ChangeType::Copied),
            'T' => Some(ChangeType::TypeChanged),
            'U' => Some(ChangeType::Unmerged),
            '?' => Some(ChangeType::Untracked),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Added => "A",
            ChangeType::Modified => "M",
            ChangeType::Deleted => "D",
            ChangeType::Renamed => "R",
            ChangeType::Copied => "C",
            ChangeType::TypeChanged => "T",
            ChangeType::Unmerged => "U",
            ChangeType::Untracked => "?",
        }
    }
}

/// One changed path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub path: String,
    pub change: ChangeType,
    /// Source path of a rename or copy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orig_path: Option<String>,
}

/// Working-tree status split the way the UI shows it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStatus {
    pub staged: Vec<StatusEntry>,
    pub unstaged: Vec<StatusEntry>,
    pub untracked: Vec<StatusEntry>,
}

impl RepoStatus {
    /// Parse `git status --porcelain=v1 -z` output
    ///
    /// Unmerged pairs (`UU`, `AA`, `DU`, ...) land in `unstaged` only.
    /// Ignored entries (`!!`) are dropped.
    pub fn parse_porcelain(output: &str) -> Result<Self> {
        let mut status = RepoStatus::default();
        let mut fields = output.split('\0').filter(|f| !f.is_empty());

        while let Some(field) = fields.next() {
            let mut codes = field.chars();
            let (x, y) = match (codes.next(), codes.next()) {
                (Some(x), Some(y)) => (x, y),
                _ => return Err(GitError::Parse(format!("short status entry: {:?}", field))),
            };
            let path = field
                .get(3..)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| GitError::Parse(format!("status entry without path: {:?}", field)))?
                .to_string();

            let orig_path = if matches!(x, 'R' | 'C') || matches!(y, 'R' | 'C') {
                fields.next().map(str::to_string)
            } else {
                None
            };

            if (x, y) == ('?', '?') {
                status.untracked.push(StatusEntry { path, change: ChangeType::Untracked, orig_path: None });
                continue;
            }
            if (x, y) == ('!', '!') {
                continue;
            }
            if is_unmerged(x, y) {
                status.unstaged.push(StatusEntry { path, change: ChangeType::Unmerged, orig_path: None });
                continue;
            }

            if let Some(change) = ChangeType::from_porcelain(x) {
                status.staged.push(StatusEntry { path: path.clone(), change, orig_path: orig_path.clone() });
            }
            if let Some(change) = ChangeType::from_porcelain(y) {
                status.unstaged.push(StatusEntry { path, change, orig_path });
            }
        }

        Ok(status)
    }
}

fn is_unmerged(x: char, y: char) -> bool {
    matches!(
        (x, y),
        ('D', 'D') | ('A', 'U') | ('U', 'D') | ('U', 'A') | ('D', 'U') | ('A', 'A') | ('U', 'U')
    )
}

/// Everything the cache consumes from version control
pub trait GitProvider: Send + Sync {
    /// Absolute path of the repository's control directory
    fn git_dir(&self, repo: &Path) -> Result<PathBuf>;

    /// Current HEAD commit id, `None` on an unborn branch
    fn head_oid(&self, repo: &Path) -> Result<Option<String>>;

    /// Staged, unstaged and untracked changes
    fn status(&self, repo: &Path) -> Result<RepoStatus>;

    /// Tracked and untracked file paths, ignored files too when asked
    fn list_files(&self, repo: &Path, include_ignored: bool) -> Result<Vec<String>>;
}

/// [`GitProvider`] backed by the `git` executable
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self { program: PathBuf::from("git") }
    }
}

impl GitCli {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self { program: program.into() }
    }

    fn run(&self, repo: &Path, args: &[&str]) -> Result<Output> {
        // Optional locks off: status must not rewrite the index we are watching
        let output = Command::new(&self.program)
            .arg("-C")
            .arg(repo)
            .args(args)
            .env("GIT_OPTIONAL_LOCKS", "0")
            .output()?;
        Ok(output)
    }

    fn run_checked(&self, repo: &Path, args: &[&str]) -> Result<String> {
        let output = self.run(repo, args)?;
        if !output.status.success() {
            return Err(GitError::Command {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        String::from_utf8(output.stdout).map_err(|e| GitError::Parse(e.to_string()))
    }
}

impl GitProvider for GitCli {
    fn git_dir(&self, repo: &Path) -> Result<PathBuf> {
        let output = self.run(repo, &["rev-parse", "--absolute-git-dir"])?;
        if !output.status.success() {
            return Err(GitError::NotARepository { path: repo.to_path_buf() });
        }
        let dir = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(PathBuf::from(dir))
    }

    fn head_oid(&self, repo: &Path) -> Result<Option<String>> {
        let output = self.run(repo, &["rev-parse", "--verify", "--quiet", "HEAD^{commit}"])?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(String::from_utf8(output.stdout)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    fn status(&self, repo: &Path) -> Result<RepoStatus> {
        let raw = self.run_checked(repo, &["status", "--porcelain=v1", "-z", "--untracked-files=all"])?;
        RepoStatus::parse_porcelain(&raw)
    }

    fn list_files(&self, repo: &Path, include_ignored: bool) -> Result<Vec<String>> {
        let args: &[&str] = if include_ignored {
            &["ls-files", "-z", "--cached", "--others"]
        } else {
            &["ls-files", "-z", "--cached", "--others", "--exclude-standard"]
        };
        let raw = self.run_checked(repo, args)?;
        let files: BTreeSet<String> = raw
            .split('\0')
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();
        Ok(files.into_iter().collect())
    }
}
