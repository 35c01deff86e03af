//! SQLite database with Diesel ORM
//!
//! Stores projects, per-project UI preferences, flat app settings and the
//! repository caches (see `cache.rs`). Schema changes are tracked by an
//! incrementing version counter and applied when the database is opened.

use crate::schema::*;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel::upsert::excluded;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// File name of the cache database inside the data directory
pub const DB_FILE_NAME: &str = "repocache.db";

// ============================================================================
// Schema Migrations
// ============================================================================

struct Migration {
    version: i32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial",
        sql: r#"
            CREATE TABLE IF NOT EXISTS app_settings (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                path TEXT NOT NULL UNIQUE,
                last_opened_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS project_prefs (
                project_id TEXT PRIMARY KEY NOT NULL,
                include_ignored INTEGER NOT NULL DEFAULT 0,
                changed_only INTEGER NOT NULL DEFAULT 0,
                expanded_dirs_json TEXT NOT NULL DEFAULT '[]',
                selected_path TEXT,
                scroll_top INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS repo_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                project_id TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                include_ignored INTEGER NOT NULL,
                tree_json TEXT,
                status_json TEXT,
                size_bytes INTEGER,
                accessed_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
                UNIQUE(project_id, fingerprint, include_ignored)
            );

            CREATE TABLE IF NOT EXISTS patch_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                project_id TEXT NOT NULL,
                file_path TEXT NOT NULL,
                scope TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                patch TEXT NOT NULL,
                size_bytes INTEGER,
                accessed_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
                UNIQUE(project_id, file_path, scope, fingerprint)
            );

            CREATE INDEX IF NOT EXISTS idx_repo_cache_accessed ON repo_cache(accessed_at);
            CREATE INDEX IF NOT EXISTS idx_patch_cache_accessed ON patch_cache(accessed_at);
            CREATE INDEX IF NOT EXISTS idx_projects_last_opened ON projects(last_opened_at);
        "#,
    },
    Migration {
        version: 2,
        name: "log_cache",
        sql: r#"
            CREATE TABLE IF NOT EXISTS log_cache (
                project_id TEXT PRIMARY KEY NOT NULL,
                commits_json TEXT NOT NULL,
                head_oid TEXT,
                unpushed_json TEXT,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
            );
        "#,
    },
    Migration {
        version: 3,
        name: "prefs_active_worktree",
        sql: "ALTER TABLE project_prefs ADD COLUMN active_worktree_path TEXT;",
    },
];

/// Highest schema version this build knows how to apply
pub const CURRENT_SCHEMA_VERSION: i32 = 3;

// ============================================================================
// Clock
// ============================================================================

/// Source of "now" for every timestamp the store writes
pub trait Clock: Send + Sync {
    /// Current time in Unix epoch milliseconds
    fn now_ms(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

// ============================================================================
// Diesel Models
// ============================================================================

/// A repository known to the application
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Eq, Serialize)]
#[diesel(table_name = projects)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: String,
    pub last_opened_at: i64,
    pub created_at: i64,
}

#[derive(Insertable)]
#[diesel(table_name = projects)]
struct NewProject<'a> {
    id: &'a str,
    name: &'a str,
    path: &'a str,
    last_opened_at: i64,
    created_at: i64,
}

#[derive(Queryable, Selectable, Insertable, Debug)]
#[diesel(table_name = project_prefs)]
struct PrefsRow {
    project_id: String,
    include_ignored: bool,
    changed_only: bool,
    expanded_dirs_json: String,
    selected_path: Option<String>,
    scroll_top: i32,
    active_worktree_path: Option<String>,
    updated_at: i64,
}

/// Per-project view state, decoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPrefs {
    pub project_id: String,
    pub include_ignored: bool,
    pub changed_only: bool,
    /// Expanded directories in the order the user opened them
    pub expanded_dirs: Vec<String>,
    pub selected_path: Option<String>,
    pub scroll_top: i32,
    pub active_worktree_path: Option<String>,
}

impl ProjectPrefs {
    fn defaults(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            include_ignored: false,
            changed_only: false,
            expanded_dirs: Vec::new(),
            selected_path: None,
            scroll_top: 0,
            active_worktree_path: None,
        }
    }

    /// Overlay the fields present in `update`
    fn apply(mut self, update: ProjectPrefsUpdate) -> Self {
        if let Some(v) = update.include_ignored {
            self.include_ignored = v;
        }
        if let Some(v) = update.changed_only {
            self.changed_only = v;
        }
        if let Some(dirs) = update.expanded_dirs {
            let mut seen = std::collections::HashSet::new();
            self.expanded_dirs = dirs.into_iter().filter(|d| seen.insert(d.clone())).collect();
        }
        if let Some(v) = update.selected_path {
            self.selected_path = v;
        }
        if let Some(v) = update.scroll_top {
            self.scroll_top = v;
        }
        if let Some(v) = update.active_worktree_path {
            self.active_worktree_path = v;
        }
        self
    }
}

/// Partial preferences write. `None` keeps the stored value;
/// `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default)]
pub struct ProjectPrefsUpdate {
    pub include_ignored: Option<bool>,
    pub changed_only: Option<bool>,
    pub expanded_dirs: Option<Vec<String>>,
    pub selected_path: Option<Option<String>>,
    pub scroll_top: Option<i32>,
    pub active_worktree_path: Option<Option<String>>,
}

impl TryFrom<PrefsRow> for ProjectPrefs {
    type Error = DbError;

    fn try_from(row: PrefsRow) -> Result<Self> {
        Ok(Self {
            project_id: row.project_id,
            include_ignored: row.include_ignored,
            changed_only: row.changed_only,
            expanded_dirs: serde_json::from_str(&row.expanded_dirs_json)?,
            selected_path: row.selected_path,
            scroll_top: row.scroll_top,
            active_worktree_path: row.active_worktree_path,
        })
    }
}

#[derive(Queryable, Selectable, Insertable, Debug)]
#[diesel(table_name = app_settings)]
struct SettingRow {
    key: String,
    value: String,
    updated_at: i64,
}

// ============================================================================
// Helper structs for raw SQL queries
// ============================================================================

/// Helper for MAX(version) over schema_versions
#[derive(QueryableByName, Debug)]
struct SchemaVersionRow {
    #[diesel(sql_type = diesel::sql_types::Integer)]
    version: i32,
}

// ============================================================================
// Database Connection
// ============================================================================

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub(crate) type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Per-connection pragmas. Foreign keys are off by default in SQLite and the
/// cascade deletes depend on them.
#[derive(Debug)]
struct SqlitePragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000; PRAGMA journal_mode = WAL;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Error type for database operations
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] diesel::r2d2::Error),

    #[error("Corrupt cached payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Database connection wrapper with connection pool
pub struct Database {
    pool: DbPool,
    clock: Arc<dyn Clock>,
    path: PathBuf,
}

impl Database {
    /// Open (creating if needed) `repocache.db` inside `data_dir`
    pub fn open_in<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)
            .map_err(|e| DbError::Connection(format!("{}: {}", data_dir.display(), e)))?;
        Self::open_at(data_dir.join(DB_FILE_NAME))
    }

    /// Open database at specified path
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    /// Open database with an explicit time source
    pub fn open_with_clock<P: AsRef<Path>>(path: P, clock: Arc<dyn Clock>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(&path_str);
        let pool = Pool::builder()
            .max_size(4)
            .connection_customizer(Box::new(SqlitePragmas))
            .build(manager)
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool, clock, path: path.as_ref().to_path_buf() };
        db.migrate()?;
        Ok(db)
    }

    /// Location of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn get_conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| DbError::Connection(e.to_string()))
    }

    pub(crate) fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Applied schema version, 0 for a fresh file
    pub fn schema_version(&self) -> Result<i32> {
        let mut conn = self.get_conn()?;
        Self::schema_version_on(&mut conn)
    }

    fn schema_version_on(conn: &mut DbConn) -> Result<i32> {
        let row: SchemaVersionRow =
            diesel::sql_query("SELECT COALESCE(MAX(version), 0) AS version FROM schema_versions")
                .get_result(conn)?;
        Ok(row.version)
    }

    /// Apply every migration newer than the stored version, each in its own
    /// transaction.
    fn migrate(&self) -> Result<()> {
        let mut conn = self.get_conn()?;

        conn.batch_execute(
            r#"
            CREATE TABLE IF NOT EXISTS schema_versions (
                version INTEGER PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                applied_at INTEGER NOT NULL
            )
            "#,
        )?;

        let current = Self::schema_version_on(&mut conn)?;
        if current > CURRENT_SCHEMA_VERSION {
            return Err(DbError::Validation(format!(
                "Database schema v{} is newer than this build supports (v{})",
                current, CURRENT_SCHEMA_VERSION
            )));
        }

        for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
            let now = self.now_ms();
            conn.transaction::<_, DbError, _>(|conn| {
                conn.batch_execute(migration.sql)?;
                diesel::insert_into(schema_versions::table)
                    .values((
                        schema_versions::version.eq(migration.version),
                        schema_versions::name.eq(migration.name),
                        schema_versions::applied_at.eq(now),
                    ))
                    .execute(conn)?;
                Ok(())
            })?;
            log::info!("applied schema migration v{} ({})", migration.version, migration.name);
        }

        Ok(())
    }

    // ========================================================================
    // Project Operations
    // ========================================================================

    /// All projects, most recently opened first
    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut conn = self.get_conn()?;
        let rows = projects::table
            .order((projects::last_opened_at.desc(), projects::name.asc()))
            .select(Project::as_select())
            .load(&mut conn)?;
        Ok(rows)
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let mut conn = self.get_conn()?;
        let project = projects::table
            .find(id)
            .select(Project::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(project)
    }

    pub fn get_project_by_path(&self, path: &str) -> Result<Option<Project>> {
        let mut conn = self.get_conn()?;
        let project = projects::table
            .filter(projects::path.eq(path))
            .select(Project::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(project)
    }

    /// Register a repository. Paths must be absolute and unique.
    pub fn insert_project(&self, name: &str, path: &str) -> Result<Project> {
        if !Path::new(path).is_absolute() {
            return Err(DbError::Validation(format!("Project path must be absolute: {}", path)));
        }
        if self.get_project_by_path(path)?.is_some() {
            return Err(DbError::Validation(format!("A project already exists at {}", path)));
        }

        let mut conn = self.get_conn()?;
        let now = self.now_ms();
        let id = Uuid::new_v4().to_string();

        diesel::insert_into(projects::table)
            .values(&NewProject { id: &id, name, path, last_opened_at: now, created_at: now })
            .execute(&mut conn)?;

        log::debug!("added project {} at {}", id, path);
        Ok(Project {
            id,
            name: name.to_string(),
            path: path.to_string(),
            last_opened_at: now,
            created_at: now,
        })
    }

    /// Mark a project as activated now. Returns false for unknown ids.
    pub fn update_last_opened(&self, id: &str) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let now = self.now_ms();
        let updated = diesel::update(projects::table.find(id))
            .set(projects::last_opened_at.eq(now))
            .execute(&mut conn)?;
        Ok(updated > 0)
    }

    /// Delete a project together with its prefs and every cache row.
    ///
    /// Dependent tables are cleared explicitly inside the same transaction as
    /// the project row, so no orphan is ever visible even if foreign keys
    /// were disabled on the file.
    pub fn delete_project(&self, id: &str) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let deleted = conn.transaction::<_, DbError, _>(|conn| {
            diesel::delete(repo_cache::table.filter(repo_cache::project_id.eq(id))).execute(conn)?;
            diesel::delete(patch_cache::table.filter(patch_cache::project_id.eq(id))).execute(conn)?;
            diesel::delete(log_cache::table.filter(log_cache::project_id.eq(id))).execute(conn)?;
            diesel::delete(project_prefs::table.filter(project_prefs::project_id.eq(id))).execute(conn)?;
            let n = diesel::delete(projects::table.find(id)).execute(conn)?;
            Ok(n > 0)
        })?;
        if deleted {
            log::info!("deleted project {}", id);
        }
        Ok(deleted)
    }

    // ========================================================================
    // Project Preferences
    // ========================================================================

    pub fn get_project_prefs(&self, project_id: &str) -> Result<Option<ProjectPrefs>> {
        let mut conn = self.get_conn()?;
        let row = project_prefs::table
            .find(project_id)
            .select(PrefsRow::as_select())
            .first(&mut conn)
            .optional()?;
        row.map(ProjectPrefs::try_from).transpose()
    }

    /// Merge `update` over the stored prefs (or defaults) and write the whole
    /// row back.
    pub fn set_project_prefs(&self, project_id: &str, update: ProjectPrefsUpdate) -> Result<ProjectPrefs> {
        let current = self
            .get_project_prefs(project_id)?
            .unwrap_or_else(|| ProjectPrefs::defaults(project_id));
        let prefs = current.apply(update);

        let row = PrefsRow {
            project_id: prefs.project_id.clone(),
            include_ignored: prefs.include_ignored,
            changed_only: prefs.changed_only,
            expanded_dirs_json: serde_json::to_string(&prefs.expanded_dirs)?,
            selected_path: prefs.selected_path.clone(),
            scroll_top: prefs.scroll_top,
            active_worktree_path: prefs.active_worktree_path.clone(),
            updated_at: self.now_ms(),
        };

        let mut conn = self.get_conn()?;
        diesel::insert_into(project_prefs::table)
            .values(&row)
            .on_conflict(project_prefs::project_id)
            .do_update()
            .set((
                project_prefs::include_ignored.eq(excluded(project_prefs::include_ignored)),
                project_prefs::changed_only.eq(excluded(project_prefs::changed_only)),
                project_prefs::expanded_dirs_json.eq(excluded(project_prefs::expanded_dirs_json)),
                project_prefs::selected_path.eq(excluded(project_prefs::selected_path)),
                project_prefs::scroll_top.eq(excluded(project_prefs::scroll_top)),
                project_prefs::active_worktree_path.eq(excluded(project_prefs::active_worktree_path)),
                project_prefs::updated_at.eq(excluded(project_prefs::updated_at)),
            ))
            .execute(&mut conn)?;

        Ok(prefs)
    }

    // ========================================================================
    // App Settings
    // ========================================================================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.get_conn()?;
        let value = app_settings::table
            .find(key)
            .select(app_settings::value)
            .first::<String>(&mut conn)
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.get_conn()?;
        let row = SettingRow { key: key.to_string(), value: value.to_string(), updated_at: self.now_ms() };
        diesel::insert_into(app_settings::table)
            .values(&row)
            .on_conflict(app_settings::key)
            .do_update()
            .set((
                app_settings::value.eq(excluded(app_settings::value)),
                app_settings::updated_at.eq(excluded(app_settings::updated_at)),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let n = diesel::delete(app_settings::table.find(key)).execute(&mut conn)?;
        Ok(n > 0)
    }

    /// Decode a JSON-encoded setting
    pub fn get_setting_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get_setting(key)?
            .map(|raw| serde_json::from_str(&raw).map_err(DbError::from))
            .transpose()
    }

    pub fn set_setting_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set_setting(key, &raw)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tempfile::TempDir;

    /// Clock the tests move by hand
    #[derive(Debug)]
    pub(crate) struct ManualClock(AtomicI64);

    impl ManualClock {
        pub(crate) fn new(start_ms: i64) -> Arc<Self> {
            Arc::new(Self(AtomicI64::new(start_ms)))
        }

        pub(crate) fn set(&self, ms: i64) {
            self.0.store(ms, Ordering::SeqCst);
        }

        pub(crate) fn advance(&self, ms: i64) {
            self.0.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    pub(crate) const T0: i64 = 1_700_000_000_000;

    pub(crate) fn test_db() -> (TempDir, Database, Arc<ManualClock>) {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(T0);
        let db = Database::open_with_clock(dir.path().join(DB_FILE_NAME), clock.clone()).unwrap();
        (dir, db, clock)
    }

    #[test]
    fn test_migrations_reach_current_version() {
        let (_dir, db, _clock) = test_db();
        assert_eq!(db.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_reopen_does_not_reapply_migrations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DB_FILE_NAME);
        {
            let db = Database::open_at(&path).unwrap();
            db.insert_project("one", "/tmp/one").unwrap();
        }
        let db = Database::open_at(&path).unwrap();
        assert_eq!(db.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
        assert_eq!(db.list_projects().unwrap().len(), 1);
    }

    #[test]
    fn test_open_in_creates_data_dir() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        let db = Database::open_in(&nested).unwrap();
        assert!(db.path().exists());
        assert_eq!(db.path(), nested.join(DB_FILE_NAME));
    }

    #[test]
    fn test_insert_and_lookup_project() {
        let (_dir, db, _clock) = test_db();
        let project = db.insert_project("demo", "/work/demo").unwrap();

        assert_eq!(db.get_project(&project.id).unwrap(), Some(project.clone()));
        assert_eq!(db.get_project_by_path("/work/demo").unwrap(), Some(project));
        assert_eq!(db.get_project("missing").unwrap(), None);
        assert_eq!(db.get_project_by_path("/work/other").unwrap(), None);
    }

    #[test]
    fn test_duplicate_project_path_rejected() {
        let (_dir, db, _clock) = test_db();
        db.insert_project("demo", "/work/demo").unwrap();
        let err = db.insert_project("again", "/work/demo").unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));
        assert_eq!(db.list_projects().unwrap().len(), 1);
    }

    #[test]
    fn test_relative_project_path_rejected() {
        let (_dir, db, _clock) = test_db();
        assert!(matches!(db.insert_project("rel", "work/rel"), Err(DbError::Validation(_))));
    }

    #[test]
    fn test_list_projects_orders_by_last_opened() {
        let (_dir, db, clock) = test_db();
        let a = db.insert_project("a", "/work/a").unwrap();
        clock.advance(10);
        let b = db.insert_project("b", "/work/b").unwrap();

        let ids: Vec<_> = db.list_projects().unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![b.id.clone(), a.id.clone()]);

        clock.advance(10);
        assert!(db.update_last_opened(&a.id).unwrap());
        let ids: Vec<_> = db.list_projects().unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);

        assert!(!db.update_last_opened("missing").unwrap());
    }

    #[test]
    fn test_prefs_partial_update_keeps_prior_values() {
        let (_dir, db, _clock) = test_db();
        let project = db.insert_project("demo", "/work/demo").unwrap();
        assert_eq!(db.get_project_prefs(&project.id).unwrap(), None);

        db.set_project_prefs(
            &project.id,
            ProjectPrefsUpdate {
                include_ignored: Some(true),
                expanded_dirs: Some(vec!["src".into(), "src/db".into(), "src".into()]),
                selected_path: Some(Some("src/db/mod.rs".into())),
                scroll_top: Some(120),
                ..Default::default()
            },
        )
        .unwrap();

        let prefs = db
            .set_project_prefs(&project.id, ProjectPrefsUpdate { changed_only: Some(true), ..Default::default() })
            .unwrap();

        assert!(prefs.include_ignored);
        assert!(prefs.changed_only);
        assert_eq!(prefs.expanded_dirs, vec!["src".to_string(), "src/db".to_string()]);
        assert_eq!(prefs.selected_path.as_deref(), Some("src/db/mod.rs"));
        assert_eq!(prefs.scroll_top, 120);
        assert_eq!(db.get_project_prefs(&project.id).unwrap(), Some(prefs));
    }

    #[test]
    fn test_prefs_can_clear_nullable_field() {
        let (_dir, db, _clock) = test_db();
        let project = db.insert_project("demo", "/work/demo").unwrap();
        db.set_project_prefs(
            &project.id,
            ProjectPrefsUpdate { active_worktree_path: Some(Some("/work/demo-wt".into())), ..Default::default() },
        )
        .unwrap();
        let prefs = db
            .set_project_prefs(&project.id, ProjectPrefsUpdate { active_worktree_path: Some(None), ..Default::default() })
            .unwrap();
        assert_eq!(prefs.active_worktree_path, None);
    }

    #[test]
    fn test_prefs_require_existing_project() {
        let (_dir, db, _clock) = test_db();
        let result = db.set_project_prefs("ghost", ProjectPrefsUpdate::default());
        assert!(matches!(result, Err(DbError::Query(_))));
    }

    #[test]
    fn test_settings_roundtrip_and_overwrite() {
        let (_dir, db, _clock) = test_db();
        assert_eq!(db.get_setting("theme").unwrap(), None);

        db.set_setting("theme", "dark").unwrap();
        db.set_setting("theme", "light").unwrap();
        assert_eq!(db.get_setting("theme").unwrap().as_deref(), Some("light"));

        assert!(db.delete_setting("theme").unwrap());
        assert!(!db.delete_setting("theme").unwrap());
        assert_eq!(db.get_setting("theme").unwrap(), None);
    }

    #[test]
    fn test_settings_json_boundary() {
        let (_dir, db, _clock) = test_db();
        let providers = vec!["openai".to_string(), "local".to_string()];
        db.set_setting_json("ai.providers", &providers).unwrap();

        let decoded: Option<Vec<String>> = db.get_setting_json("ai.providers").unwrap();
        assert_eq!(decoded, Some(providers));

        db.set_setting("broken", "{not json").unwrap();
        let broken: Result<Option<Vec<String>>> = db.get_setting_json("broken");
        assert!(matches!(broken, Err(DbError::Serialization(_))));
    }
}
