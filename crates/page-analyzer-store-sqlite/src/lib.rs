use std::collections::BTreeMap;
use std::path::Path;

use page_analyzer_core::{
    CanonicalUrl, Check, CheckId, NewCheck, StorageError, StorageErrorKind, Url, UrlId,
};
use rusqlite::{params, Connection, DatabaseName, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

const LATEST_SCHEMA_VERSION: i64 = 2;

// Fixed width so that text order in SQLite equals chronological order.
const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z");

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS urls (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS url_checks (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  url_id INTEGER NOT NULL,
  status_code INTEGER NOT NULL CHECK (status_code BETWEEN 0 AND 999),
  title TEXT NOT NULL,
  h1 TEXT NOT NULL,
  description TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (url_id) REFERENCES urls(id) ON DELETE CASCADE
);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_url_checks_latest ON url_checks(url_id, created_at DESC, id DESC);
";

const MIGRATIONS: [(i64, &str); 2] = [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)];

const URL_COLUMNS: &str = "id, name, created_at";
const CHECK_COLUMNS: &str = "id, url_id, status_code, title, h1, description, created_at";

pub type StoreResult<T> = Result<T, StorageError>;

/// `SQLite`-backed history of submitted URLs and their checks.
///
/// Every write is a single statement, so per-statement isolation is enough
/// for concurrent writers sharing the database file.
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

trait SqlContext<T> {
    fn during(self, operation: &'static str) -> StoreResult<T>;
}

impl<T> SqlContext<T> for rusqlite::Result<T> {
    fn during(self, operation: &'static str) -> StoreResult<T> {
        self.map_err(|err| StorageError::new(operation, classify(&err), err.to_string()))
    }
}

fn classify(err: &rusqlite::Error) -> StorageErrorKind {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::ConstraintViolation
                if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                StorageErrorKind::Conflict
            }
            ErrorCode::CannotOpen
            | ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::NotADatabase
            | ErrorCode::SystemIoFailure
            | ErrorCode::PermissionDenied
            | ErrorCode::ReadOnly
            | ErrorCode::DiskFull => StorageErrorKind::Unavailable,
            ErrorCode::DatabaseCorrupt => StorageErrorKind::Corrupt,
            _ => StorageErrorKind::Query,
        },
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => StorageErrorKind::Corrupt,
        _ => StorageErrorKind::Query,
    }
}

impl SqliteStore {
    /// Open the database file and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(|err| {
            StorageError::new(
                "open",
                classify(&err),
                format!("failed to open sqlite database at {}: {err}", path.display()),
            )
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .during("open")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> StoreResult<SchemaStatus> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL).during("schema_status")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = MIGRATIONS
            .iter()
            .map(|(version, _)| *version)
            .filter(|version| *version > current_version)
            .collect::<Vec<_>>();

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when a migration step fails or the database
    /// reports a schema version newer than this build understands.
    pub fn migrate(&mut self) -> StoreResult<()> {
        const OPERATION: &str = "migrate";

        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL).during(OPERATION)?;
        let current = current_schema_version(&self.conn)?;
        if current > LATEST_SCHEMA_VERSION {
            return Err(StorageError::new(
                OPERATION,
                StorageErrorKind::Corrupt,
                format!("unsupported schema version {current}; expected {LATEST_SCHEMA_VERSION}"),
            ));
        }

        for (version, sql) in MIGRATIONS {
            if version <= current {
                continue;
            }

            let tx = self.conn.transaction().during(OPERATION)?;
            tx.execute_batch(sql).during(OPERATION)?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![version, now_timestamp(OPERATION)?.0],
            )
            .during(OPERATION)?;
            tx.commit().during(OPERATION)?;
        }

        Ok(())
    }

    /// Insert a new URL; the store assigns its id and creation time.
    ///
    /// # Errors
    /// Returns a [`StorageError`] of kind `Conflict` when the name already
    /// exists, `MissingId` when no id is returned, or any other storage failure.
    pub fn save_url(&self, url: &CanonicalUrl) -> StoreResult<Url> {
        const OPERATION: &str = "save_url";

        let (stamp, created_at) = now_timestamp(OPERATION)?;
        let id = self
            .conn
            .query_row(
                "INSERT INTO urls(name, created_at) VALUES (?1, ?2) RETURNING id",
                params![url.as_str(), stamp],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .during(OPERATION)?
            .ok_or_else(|| {
                StorageError::new(
                    OPERATION,
                    StorageErrorKind::MissingId,
                    format!("database returned no id for url {url}"),
                )
            })?;

        Ok(Url { id: UrlId(id), name: url.as_str().to_string(), created_at })
    }

    /// Exact-match lookup used for deduplication before insert.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when the query fails or the row cannot be decoded.
    pub fn find_url_by_name(&self, name: &str) -> StoreResult<Option<Url>> {
        self.conn
            .query_row(
                &format!("SELECT {URL_COLUMNS} FROM urls WHERE name = ?1"),
                params![name],
                url_from_row,
            )
            .optional()
            .during("find_url_by_name")
    }

    /// # Errors
    /// Returns a [`StorageError`] when the query fails or the row cannot be decoded.
    pub fn find_url_by_id(&self, id: UrlId) -> StoreResult<Option<Url>> {
        self.conn
            .query_row(
                &format!("SELECT {URL_COLUMNS} FROM urls WHERE id = ?1"),
                params![id.0],
                url_from_row,
            )
            .optional()
            .during("find_url_by_id")
    }

    /// All URLs, most recently added first.
    ///
    /// Insertion order is the id order; stored timestamps do not affect it.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when rows cannot be read or decoded.
    pub fn list_urls(&self) -> StoreResult<Vec<Url>> {
        const OPERATION: &str = "list_urls";

        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {URL_COLUMNS} FROM urls ORDER BY id DESC"))
            .during(OPERATION)?;
        let rows = stmt.query_map([], url_from_row).during(OPERATION)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().during(OPERATION)
    }

    /// One window of [`SqliteStore::list_urls`].
    ///
    /// # Errors
    /// Returns a [`StorageError`] when rows cannot be read or decoded.
    pub fn list_urls_page(&self, offset: u64, limit: u64) -> StoreResult<Vec<Url>> {
        const OPERATION: &str = "list_urls_page";

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {URL_COLUMNS} FROM urls
                 ORDER BY id DESC
                 LIMIT ?1 OFFSET ?2"
            ))
            .during(OPERATION)?;
        let rows = stmt
            .query_map(params![clamp_to_i64(limit), clamp_to_i64(offset)], url_from_row)
            .during(OPERATION)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().during(OPERATION)
    }

    /// # Errors
    /// Returns a [`StorageError`] when the count query fails.
    pub fn count_urls(&self) -> StoreResult<u64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM urls", [], |row| row.get::<_, i64>(0))
            .during("count_urls")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Remove a URL together with its checks. Returns whether a row was removed.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when the delete fails.
    pub fn delete_url(&self, id: UrlId) -> StoreResult<bool> {
        let removed =
            self.conn.execute("DELETE FROM urls WHERE id = ?1", params![id.0]).during("delete_url")?;
        Ok(removed > 0)
    }

    /// Insert a check; the id and creation time are assigned here, at insertion.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when the owning URL does not exist, no id is
    /// returned, or the insert fails.
    pub fn save_check(&self, check: &NewCheck) -> StoreResult<Check> {
        const OPERATION: &str = "save_check";

        let (stamp, created_at) = now_timestamp(OPERATION)?;
        let id = self
            .conn
            .query_row(
                "INSERT INTO url_checks(url_id, status_code, title, h1, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 RETURNING id",
                params![
                    check.url_id.0,
                    check.status_code,
                    check.summary.title,
                    check.summary.h1,
                    check.summary.description,
                    stamp,
                ],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .during(OPERATION)?
            .ok_or_else(|| {
                StorageError::new(
                    OPERATION,
                    StorageErrorKind::MissingId,
                    format!("database returned no id for check of url {}", check.url_id),
                )
            })?;

        Ok(Check {
            id: CheckId(id),
            url_id: check.url_id,
            status_code: check.status_code,
            title: check.summary.title.clone(),
            h1: check.summary.h1.clone(),
            description: check.summary.description.clone(),
            created_at,
        })
    }

    /// The latest check of every URL that has at least one.
    ///
    /// Latest means greatest `created_at`; equal timestamps resolve to the greater id.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when rows cannot be read or decoded.
    pub fn latest_check_per_url(&self) -> StoreResult<BTreeMap<UrlId, Check>> {
        const OPERATION: &str = "latest_check_per_url";

        let mut stmt = self
            .conn
            .prepare(
                "SELECT c.id, c.url_id, c.status_code, c.title, c.h1, c.description, c.created_at
                 FROM url_checks AS c
                 WHERE c.id = (
                   SELECT latest.id FROM url_checks AS latest
                   WHERE latest.url_id = c.url_id
                   ORDER BY latest.created_at DESC, latest.id DESC
                   LIMIT 1
                 )",
            )
            .during(OPERATION)?;
        let rows = stmt.query_map([], check_from_row).during(OPERATION)?;

        let mut latest = BTreeMap::new();
        for row in rows {
            let check = row.during(OPERATION)?;
            latest.insert(check.url_id, check);
        }
        Ok(latest)
    }

    /// # Errors
    /// Returns a [`StorageError`] when the query fails or the row cannot be decoded.
    pub fn latest_check_for_url(&self, url_id: UrlId) -> StoreResult<Option<Check>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {CHECK_COLUMNS} FROM url_checks
                     WHERE url_id = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT 1"
                ),
                params![url_id.0],
                check_from_row,
            )
            .optional()
            .during("latest_check_for_url")
    }

    /// Full check history of one URL, newest first.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when rows cannot be read or decoded.
    pub fn all_checks_for_url(&self, url_id: UrlId) -> StoreResult<Vec<Check>> {
        const OPERATION: &str = "all_checks_for_url";

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CHECK_COLUMNS} FROM url_checks
                 WHERE url_id = ?1
                 ORDER BY created_at DESC, id DESC"
            ))
            .during(OPERATION)?;
        let rows = stmt.query_map(params![url_id.0], check_from_row).during(OPERATION)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().during(OPERATION)
    }

    /// # Errors
    /// Returns a [`StorageError`] when the count query fails.
    pub fn count_checks_for_url(&self, url_id: UrlId) -> StoreResult<u64> {
        let count = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM url_checks WHERE url_id = ?1",
                params![url_id.0],
                |row| row.get::<_, i64>(0),
            )
            .during("count_checks_for_url")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Delete every check and restart check ids. Returns the number of removed rows.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when the reset transaction fails.
    pub fn truncate_checks(&mut self) -> StoreResult<usize> {
        const OPERATION: &str = "truncate_checks";

        let tx = self.conn.transaction().during(OPERATION)?;
        let removed = tx.execute("DELETE FROM url_checks", []).during(OPERATION)?;
        tx.execute("DELETE FROM sqlite_sequence WHERE name = 'url_checks'", [])
            .during(OPERATION)?;
        tx.commit().during(OPERATION)?;
        Ok(removed)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> StoreResult<()> {
        const OPERATION: &str = "backup_database";

        if let Some(parent) = out_file.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                StorageError::new(
                    OPERATION,
                    StorageErrorKind::Unavailable,
                    format!("failed to create parent directory for {}: {err}", out_file.display()),
                )
            })?;
        }

        self.conn.backup(DatabaseName::Main, out_file, None).during(OPERATION)
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> StoreResult<()> {
        const OPERATION: &str = "restore_database";

        if !in_file.exists() {
            return Err(StorageError::new(
                OPERATION,
                StorageErrorKind::Unavailable,
                format!("backup file does not exist: {}", in_file.display()),
            ));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .during(OPERATION)?;
        self.migrate()
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when any integrity probe query fails.
    pub fn integrity_check(&self) -> StoreResult<IntegrityReport> {
        const OPERATION: &str = "integrity_check";

        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .during(OPERATION)?;

        let mut stmt = self.conn.prepare("PRAGMA foreign_key_check").during(OPERATION)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ForeignKeyViolation {
                    table: row.get(0)?,
                    rowid: row.get(1)?,
                    parent: row.get(2)?,
                    fk_index: row.get(3)?,
                })
            })
            .during(OPERATION)?;
        let foreign_key_violations = rows.collect::<rusqlite::Result<Vec<_>>>().during(OPERATION)?;

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

fn url_from_row(row: &Row<'_>) -> rusqlite::Result<Url> {
    Ok(Url { id: UrlId(row.get(0)?), name: row.get(1)?, created_at: timestamp_column(row, 2)? })
}

fn check_from_row(row: &Row<'_>) -> rusqlite::Result<Check> {
    Ok(Check {
        id: CheckId(row.get(0)?),
        url_id: UrlId(row.get(1)?),
        status_code: row.get(2)?,
        title: row.get(3)?,
        h1: row.get(4)?,
        description: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
    })
}

fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_timestamp(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn current_schema_version(conn: &Connection) -> StoreResult<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .during("schema_version")
}

fn format_timestamp(value: OffsetDateTime) -> Result<String, time::error::Format> {
    value.to_offset(UtcOffset::UTC).format(TIMESTAMP_FORMAT)
}

fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, time::error::Parse> {
    PrimitiveDateTime::parse(raw, TIMESTAMP_FORMAT).map(PrimitiveDateTime::assume_utc)
}

/// Current time both as stored text and as the value that text decodes to.
fn now_timestamp(operation: &'static str) -> StoreResult<(String, OffsetDateTime)> {
    let stamp = format_timestamp(OffsetDateTime::now_utc()).map_err(|err| {
        StorageError::new(operation, StorageErrorKind::Query, format!("failed to format timestamp: {err}"))
    })?;
    let value = parse_timestamp(&stamp).map_err(|err| {
        StorageError::new(operation, StorageErrorKind::Query, format!("failed to parse timestamp: {err}"))
    })?;
    Ok((stamp, value))
}

fn clamp_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
