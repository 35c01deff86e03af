//! Repository caches: tree/status snapshots, per-file patches, commit logs
//!
//! Every `set_*` is an upsert on the row's unique key and recomputes
//! `size_bytes` from the encoded payload. Every `get_*` hit on the repo and
//! patch caches moves `accessed_at` forward, which is the LRU clock the
//! retention sweep orders by. A miss is `Ok(None)`.

use crate::db::{Database, DbConn, DbError, Result};
use crate::fingerprint::RepoFingerprint;
use crate::git::RepoStatus;
use crate::schema::*;
use crate::tree::TreeNode;
use diesel::prelude::*;
use diesel::upsert::excluded;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which side of the index a cached patch describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchScope {
    Staged,
    Unstaged,
    Untracked,
}

impl PatchScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchScope::Staged => "staged",
            PatchScope::Unstaged => "unstaged",
            PatchScope::Untracked => "untracked",
        }
    }
}

impl fmt::Display for PatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatchScope {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "staged" => Ok(PatchScope::Staged),
            "unstaged" => Ok(PatchScope::Unstaged),
            "untracked" => Ok(PatchScope::Untracked),
            other => Err(DbError::Validation(format!("Unknown patch scope: {}", other))),
        }
    }
}

/// What the repo cache stores per fingerprint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSnapshot {
    pub tree: Option<Vec<TreeNode>>,
    pub status: Option<RepoStatus>,
}

/// A decoded repo cache hit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoCacheEntry {
    pub snapshot: RepoSnapshot,
    pub size_bytes: Option<i64>,
    pub accessed_at: i64,
    pub created_at: i64,
}

/// A patch cache hit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchCacheEntry {
    pub patch: String,
    pub size_bytes: Option<i64>,
    pub accessed_at: i64,
    pub created_at: i64,
}

/// One commit in a cached log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitSummary {
    pub oid: String,
    pub summary: String,
    pub author: String,
    pub time_ms: i64,
    #[serde(default)]
    pub parents: Vec<String>,
}

/// The single cached log for a project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogCacheEntry {
    pub commits: Vec<CommitSummary>,
    pub head_oid: Option<String>,
    pub unpushed: Option<Vec<String>>,
    pub updated_at: i64,
}

impl LogCacheEntry {
    /// Whether the log was captured at the given HEAD
    pub fn is_current(&self, head_oid: Option<&str>) -> bool {
        self.head_oid.as_deref() == head_oid
    }
}

/// Row counts and byte totals across the caches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub repo_entries: i64,
    pub repo_bytes: i64,
    pub patch_entries: i64,
    pub patch_bytes: i64,
    pub log_entries: i64,
}

impl CacheStats {
    pub fn total_bytes(&self) -> i64 {
        self.repo_bytes + self.patch_bytes
    }
}

// ============================================================================
// Diesel Models
// ============================================================================

#[derive(Insertable)]
#[diesel(table_name = repo_cache)]
struct NewRepoCacheRow<'a> {
    project_id: &'a str,
    fingerprint: &'a str,
    include_ignored: bool,
    tree_json: Option<&'a str>,
    status_json: Option<&'a str>,
    size_bytes: Option<i64>,
    accessed_at: i64,
    created_at: i64,
}

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = repo_cache)]
struct RepoCacheRow {
    id: i32,
    tree_json: Option<String>,
    status_json: Option<String>,
    size_bytes: Option<i64>,
    accessed_at: i64,
    created_at: i64,
}

#[derive(Insertable)]
#[diesel(table_name = patch_cache)]
struct NewPatchCacheRow<'a> {
    project_id: &'a str,
    file_path: &'a str,
    scope: &'a str,
    fingerprint: &'a str,
    patch: &'a str,
    size_bytes: Option<i64>,
    accessed_at: i64,
    created_at: i64,
}

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = patch_cache)]
struct PatchCacheRow {
    id: i32,
    patch: String,
    size_bytes: Option<i64>,
    accessed_at: i64,
    created_at: i64,
}

#[derive(Queryable, Selectable, Insertable, Debug)]
#[diesel(table_name = log_cache)]
struct LogCacheRow {
    project_id: String,
    commits_json: String,
    head_oid: Option<String>,
    unpushed_json: Option<String>,
    updated_at: i64,
}

/// Helper for COUNT/SUM aggregate queries
#[derive(QueryableByName, Debug)]
struct CountAndBytes {
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    entries: i64,
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    bytes: i64,
}

fn encode<T: Serialize + ?Sized>(value: Option<&T>) -> Result<Option<String>> {
    value.map(|v| serde_json::to_string(v).map_err(DbError::from)).transpose()
}

fn decode<T: for<'de> Deserialize<'de>>(raw: Option<&str>) -> Result<Option<T>> {
    raw.map(|s| serde_json::from_str(s).map_err(DbError::from)).transpose()
}

fn payload_len(parts: &[Option<&str>]) -> i64 {
    parts.iter().flatten().map(|s| s.len() as i64).sum()
}

impl Database {
    // ========================================================================
    // Repo Cache
    // ========================================================================

    pub fn get_repo_cache(
        &self,
        project_id: &str,
        fingerprint: &RepoFingerprint,
        include_ignored: bool,
    ) -> Result<Option<RepoCacheEntry>> {
        let mut conn = self.get_conn()?;
        let key = fingerprint.cache_key();

        let row = repo_cache::table
            .filter(repo_cache::project_id.eq(project_id))
            .filter(repo_cache::fingerprint.eq(&key))
            .filter(repo_cache::include_ignored.eq(include_ignored))
            .select(RepoCacheRow::as_select())
            .first(&mut conn)
            .optional()?;

        let Some(row) = row else {
            return Ok(None);
        };

        let accessed_at = row.accessed_at.max(self.now_ms());
        diesel::update(repo_cache::table.find(row.id))
            .set(repo_cache::accessed_at.eq(accessed_at))
            .execute(&mut conn)?;

        Ok(Some(RepoCacheEntry {
            snapshot: RepoSnapshot {
                tree: decode(row.tree_json.as_deref())?,
                status: decode(row.status_json.as_deref())?,
            },
            size_bytes: row.size_bytes,
            accessed_at,
            created_at: row.created_at,
        }))
    }

    /// Store a snapshot, replacing any row with the same key. Returns the
    /// stored payload size.
    pub fn set_repo_cache(
        &self,
        project_id: &str,
        fingerprint: &RepoFingerprint,
        include_ignored: bool,
        snapshot: &RepoSnapshot,
    ) -> Result<i64> {
        let tree_json = encode(snapshot.tree.as_ref())?;
        let status_json = encode(snapshot.status.as_ref())?;
        let size = payload_len(&[tree_json.as_deref(), status_json.as_deref()]);
        let key = fingerprint.cache_key();
        let now = self.now_ms();

        let mut conn = self.get_conn()?;
        diesel::insert_into(repo_cache::table)
            .values(&NewRepoCacheRow {
                project_id,
                fingerprint: &key,
                include_ignored,
                tree_json: tree_json.as_deref(),
                status_json: status_json.as_deref(),
                size_bytes: Some(size),
                accessed_at: now,
                created_at: now,
            })
            .on_conflict((repo_cache::project_id, repo_cache::fingerprint, repo_cache::include_ignored))
            .do_update()
            .set((
                repo_cache::tree_json.eq(excluded(repo_cache::tree_json)),
                repo_cache::status_json.eq(excluded(repo_cache::status_json)),
                repo_cache::size_bytes.eq(excluded(repo_cache::size_bytes)),
                repo_cache::accessed_at.eq(excluded(repo_cache::accessed_at)),
                repo_cache::created_at.eq(excluded(repo_cache::created_at)),
            ))
            .execute(&mut conn)?;

        log::debug!("cached repo snapshot for {} ({} bytes)", project_id, size);
        Ok(size)
    }

    // ========================================================================
    // Patch Cache
    // ========================================================================

    pub fn get_patch_cache(
        &self,
        project_id: &str,
        file_path: &str,
        scope: PatchScope,
        fingerprint: &RepoFingerprint,
    ) -> Result<Option<PatchCacheEntry>> {
        let mut conn = self.get_conn()?;
        let key = fingerprint.cache_key();

        let row = patch_cache::table
            .filter(patch_cache::project_id.eq(project_id))
            .filter(patch_cache::file_path.eq(file_path))
            .filter(patch_cache::scope.eq(scope.as_str()))
            .filter(patch_cache::fingerprint.eq(&key))
            .select(PatchCacheRow::as_select())
            .first(&mut conn)
            .optional()?;

        let Some(row) = row else {
            return Ok(None);
        };

        let accessed_at = row.accessed_at.max(self.now_ms());
        diesel::update(patch_cache::table.find(row.id))
            .set(patch_cache::accessed_at.eq(accessed_at))
            .execute(&mut conn)?;

        Ok(Some(PatchCacheEntry {
            patch: row.patch,
            size_bytes: row.size_bytes,
            accessed_at,
            created_at: row.created_at,
        }))
    }

    pub fn set_patch_cache(
        &self,
        project_id: &str,
        file_path: &str,
        scope: PatchScope,
        fingerprint: &RepoFingerprint,
        patch: &str,
    ) -> Result<i64> {
        let key = fingerprint.cache_key();
        let size = patch.len() as i64;
        let now = self.now_ms();

        let mut conn = self.get_conn()?;
        diesel::insert_into(patch_cache::table)
            .values(&NewPatchCacheRow {
                project_id,
                file_path,
                scope: scope.as_str(),
                fingerprint: &key,
                patch,
                size_bytes: Some(size),
                accessed_at: now,
                created_at: now,
            })
            .on_conflict((
                patch_cache::project_id,
                patch_cache::file_path,
                patch_cache::scope,
                patch_cache::fingerprint,
            ))
            .do_update()
            .set((
                patch_cache::patch.eq(excluded(patch_cache::patch)),
                patch_cache::size_bytes.eq(excluded(patch_cache::size_bytes)),
                patch_cache::accessed_at.eq(excluded(patch_cache::accessed_at)),
                patch_cache::created_at.eq(excluded(patch_cache::created_at)),
            ))
            .execute(&mut conn)?;

        Ok(size)
    }

    // ========================================================================
    // Log Cache
    // ========================================================================

    pub fn get_log_cache(&self, project_id: &str) -> Result<Option<LogCacheEntry>> {
        let mut conn = self.get_conn()?;
        let row = log_cache::table
            .find(project_id)
            .select(LogCacheRow::as_select())
            .first(&mut conn)
            .optional()?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(LogCacheEntry {
            commits: serde_json::from_str(&row.commits_json)?,
            head_oid: row.head_oid,
            unpushed: decode(row.unpushed_json.as_deref())?,
            updated_at: row.updated_at,
        }))
    }

    /// Replace the project's cached log (last write wins)
    pub fn set_log_cache(
        &self,
        project_id: &str,
        commits: &[CommitSummary],
        head_oid: Option<&str>,
        unpushed: Option<&[String]>,
    ) -> Result<()> {
        let row = LogCacheRow {
            project_id: project_id.to_string(),
            commits_json: serde_json::to_string(commits)?,
            head_oid: head_oid.map(str::to_string),
            unpushed_json: encode(unpushed)?,
            updated_at: self.now_ms(),
        };

        let mut conn = self.get_conn()?;
        diesel::insert_into(log_cache::table)
            .values(&row)
            .on_conflict(log_cache::project_id)
            .do_update()
            .set((
                log_cache::commits_json.eq(excluded(log_cache::commits_json)),
                log_cache::head_oid.eq(excluded(log_cache::head_oid)),
                log_cache::unpushed_json.eq(excluded(log_cache::unpushed_json)),
                log_cache::updated_at.eq(excluded(log_cache::updated_at)),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    // ========================================================================
    // Invalidation & Stats
    // ========================================================================

    /// Drop every repo and patch cache row of one project, atomically.
    /// Returns the number of rows removed.
    pub fn invalidate_project_cache(&self, project_id: &str) -> Result<usize> {
        let mut conn = self.get_conn()?;
        let removed = conn.transaction::<_, DbError, _>(|conn| {
            let repo = diesel::delete(repo_cache::table.filter(repo_cache::project_id.eq(project_id)))
                .execute(conn)?;
            let patch = diesel::delete(patch_cache::table.filter(patch_cache::project_id.eq(project_id)))
                .execute(conn)?;
            Ok(repo + patch)
        })?;
        log::debug!("invalidated {} cache rows for {}", removed, project_id);
        Ok(removed)
    }

    pub fn cache_stats(&self) -> Result<CacheStats> {
        let mut conn = self.get_conn()?;
        let repo = count_and_bytes(&mut conn, "repo_cache")?;
        let patch = count_and_bytes(&mut conn, "patch_cache")?;
        let log_entries = log_cache::table.count().get_result::<i64>(&mut conn)?;

        Ok(CacheStats {
            repo_entries: repo.entries,
            repo_bytes: repo.bytes,
            patch_entries: patch.entries,
            patch_bytes: patch.bytes,
            log_entries,
        })
    }
}

/// Row count and summed `size_bytes` of a cache table
fn count_and_bytes(conn: &mut DbConn, table: &str) -> Result<CountAndBytes> {
    let row = diesel::sql_query(format!(
        "SELECT COUNT(*) AS entries, COALESCE(SUM(size_bytes), 0) AS bytes FROM {}",
        table
    ))
    .get_result::<CountAndBytes>(conn)?;
    Ok(row)
}
