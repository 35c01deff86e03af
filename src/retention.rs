//! Cache retention
//!
//! A sweep runs in two phases: drop repo/patch rows not read within the TTL,
//! then, if the remaining rows still exceed the size cap, evict the
//! least-recently-accessed rows (patches first) until the excess is freed.
//! The caller decides how often to sweep.

use crate::config::RetentionConfig;
use crate::db::{Database, DbConn, Result};
use crate::schema::*;
use diesel::prelude::*;
use serde::Serialize;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
const MB: i64 = 1024 * 1024;

/// Rows deleted per statement during size eviction
const EVICT_BATCH: usize = 200;

/// Bounds enforced by a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub ttl_ms: i64,
    pub max_bytes: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from(&RetentionConfig::default())
    }
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            ttl_ms: i64::from(config.ttl_days) * DAY_MS,
            max_bytes: i64::try_from(config.max_cache_mb).unwrap_or(i64::MAX / MB).saturating_mul(MB),
        }
    }
}

/// What one sweep removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub expired_repo: usize,
    pub expired_patch: usize,
    pub evicted_patch: usize,
    pub evicted_repo: usize,
    /// Bytes over the cap after the TTL phase
    pub deficit_bytes: i64,
    pub freed_bytes: i64,
}

impl SweepReport {
    pub fn total_removed(&self) -> usize {
        self.expired_repo + self.expired_patch + self.evicted_patch + self.evicted_repo
    }
}

/// Helper for SUM(size_bytes) over both cache tables
#[derive(QueryableByName, Debug)]
struct TotalBytes {
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    total: i64,
}

impl Database {
    /// Run both retention phases. An error aborts the pass; deletes already
    /// issued stay applied and the next sweep picks up from there.
    pub fn sweep_cache(&self, policy: &RetentionPolicy) -> Result<SweepReport> {
        let mut conn = self.get_conn()?;
        let mut report = SweepReport::default();

        // Phase 1: TTL
        let cutoff = self.now_ms() - policy.ttl_ms;
        report.expired_repo =
            diesel::delete(repo_cache::table.filter(repo_cache::accessed_at.lt(cutoff))).execute(&mut conn)?;
        report.expired_patch =
            diesel::delete(patch_cache::table.filter(patch_cache::accessed_at.lt(cutoff))).execute(&mut conn)?;

        // Phase 2: size cap
        let total = total_cached_bytes(&mut conn)?;
        if total > policy.max_bytes {
            report.deficit_bytes = total - policy.max_bytes;

            let patch_rows: Vec<(i32, Option<i64>)> = patch_cache::table
                .select((patch_cache::id, patch_cache::size_bytes))
                .order((patch_cache::accessed_at.asc(), patch_cache::id.asc()))
                .load(&mut conn)?;
            let (patch_ids, freed) = select_victims(&patch_rows, report.deficit_bytes);
            for chunk in patch_ids.chunks(EVICT_BATCH) {
                report.evicted_patch +=
                    diesel::delete(patch_cache::table.filter(patch_cache::id.eq_any(chunk))).execute(&mut conn)?;
            }
            report.freed_bytes = freed;

            if report.freed_bytes < report.deficit_bytes {
                let repo_rows: Vec<(i32, Option<i64>)> = repo_cache::table
                    .select((repo_cache::id, repo_cache::size_bytes))
                    .order((repo_cache::accessed_at.asc(), repo_cache::id.asc()))
                    .load(&mut conn)?;
                let (repo_ids, freed) = select_victims(&repo_rows, report.deficit_bytes - report.freed_bytes);
                for chunk in repo_ids.chunks(EVICT_BATCH) {
                    report.evicted_repo +=
                        diesel::delete(repo_cache::table.filter(repo_cache::id.eq_any(chunk))).execute(&mut conn)?;
                }
                report.freed_bytes += freed;
            }
        }

        if report.total_removed() > 0 {
            log::info!(
                "cache sweep: expired {} repo / {} patch, evicted {} patch / {} repo, freed {} bytes",
                report.expired_repo,
                report.expired_patch,
                report.evicted_patch,
                report.evicted_repo,
                report.freed_bytes
            );
        }
        Ok(report)
    }
}

fn total_cached_bytes(conn: &mut DbConn) -> Result<i64> {
    let row: TotalBytes = diesel::sql_query(
        "SELECT (SELECT COALESCE(SUM(size_bytes), 0) FROM repo_cache) \
              + (SELECT COALESCE(SUM(size_bytes), 0) FROM patch_cache) AS total",
    )
    .get_result(conn)?;
    Ok(row.total)
}

/// Take rows in order until their sizes cover `needed`. Null sizes count as
/// zero but are still taken.
fn select_victims(rows: &[(i32, Option<i64>)], needed: i64) -> (Vec<i32>, i64) {
    let mut ids = Vec::new();
    let mut freed = 0i64;
    for (id, size) in rows {
        if freed >= needed {
            break;
        }
        ids.push(*id);
        freed += size.unwrap_or(0);
    }
    (ids, freed)
}
