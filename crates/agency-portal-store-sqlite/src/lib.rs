use std::fs;
use std::path::Path;

use agency_portal_core::{PortalError, SessionStore};
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS session_entries (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_session_entries_updated_at ON session_entries(updated_at);
";

/// `SQLite`-backed [`SessionStore`] for session-scoped view state.
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionEntry {
    pub key: String,
    pub updated_at: String,
    pub bytes: usize,
}

impl SqliteSessionStore {
    /// Open a session database and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open and bring the schema up to date.
    ///
    /// # Errors
    /// Returns an error when opening or migrating fails.
    pub fn open_migrated(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let conn = self.conn.lock();
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer than
    /// this build understands.
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        let steps: [(i64, &str); 2] = [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)];
        for (target, sql) in steps {
            if version >= target {
                continue;
            }
            let tx = conn.transaction().context("failed to start migration transaction")?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration {target}"))?;
            record_schema_version(&tx, target)?;
            tx.commit().with_context(|| format!("failed to commit migration {target}"))?;
        }

        Ok(())
    }

    /// List stored entries whose key starts with `prefix`.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_entries(&self, prefix: &str) -> Result<Vec<SessionEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT key, updated_at, length(value) FROM session_entries
                 WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key",
            )
            .context("failed to prepare session entry listing")?;
        let rows = stmt.query_map(params![prefix], |row| {
            Ok(SessionEntry {
                key: row.get(0)?,
                updated_at: row.get(1)?,
                bytes: usize::try_from(row.get::<_, i64>(2)?).unwrap_or(0),
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("failed to decode session entry")?);
        }
        Ok(entries)
    }

    /// Delete every entry under `prefix`; returns the number removed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn purge_prefix(&self, prefix: &str) -> Result<usize> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM session_entries WHERE substr(key, 1, length(?1)) = ?1",
                params![prefix],
            )
            .with_context(|| format!("failed to purge session entries under {prefix}"))
    }

    /// Delete entries not written since `cutoff`; returns the number removed.
    ///
    /// # Errors
    /// Returns an error when the cutoff cannot be formatted or the delete fails.
    pub fn purge_older_than(&self, cutoff: OffsetDateTime) -> Result<usize> {
        let cutoff = rfc3339(cutoff)?;
        self.conn
            .lock()
            .execute("DELETE FROM session_entries WHERE updated_at < ?1", params![cutoff])
            .context("failed to purge expired session entries")
    }

    /// Write a consistent copy of the database to `out_file`.
    ///
    /// # Errors
    /// Returns an error when the parent directory or the backup cannot be created.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .lock()
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    fn read_value(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .lock()
            .query_row("SELECT value FROM session_entries WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .with_context(|| format!("failed to read session entry {key}"))
    }

    fn write_value(&self, key: &str, value: &str) -> Result<()> {
        let now = now_rfc3339()?;
        self.conn
            .lock()
            .execute(
                "INSERT INTO session_entries(key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now],
            )
            .with_context(|| format!("failed to write session entry {key}"))?;
        Ok(())
    }

    fn delete_value(&self, key: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM session_entries WHERE key = ?1", params![key])
            .with_context(|| format!("failed to delete session entry {key}"))?;
        Ok(())
    }
}

impl SessionStore for SqliteSessionStore {
    fn get(&self, key: &str) -> Result<Option<String>, PortalError> {
        self.read_value(key).map_err(storage_error)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PortalError> {
        self.write_value(key, value).map_err(storage_error)
    }

    fn remove(&self, key: &str) -> Result<(), PortalError> {
        self.delete_value(key).map_err(storage_error)
    }
}

#[allow(clippy::needless_pass_by_value)]
fn storage_error(err: anyhow::Error) -> PortalError {
    PortalError::Storage(format!("{err:#}"))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
