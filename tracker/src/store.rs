//! SQLite-backed store for connections, reports and noise.
//!
//! The schema is versioned through `PRAGMA user_version` and migrated on
//! open. All access goes through one [`rusqlite::Connection`] behind a
//! mutex; callers on the async runtime wrap store calls in
//! `spawn_blocking`.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{
    Connection, DbKind, NewConnection, NoiseEntry, Report, ReportItem, ReportSummary,
};

const CURRENT_SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS connections (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    name              TEXT NOT NULL,
    kind              TEXT NOT NULL,
    host              TEXT NOT NULL,
    port              INTEGER NOT NULL,
    database_name     TEXT NOT NULL,
    username          TEXT NOT NULL,
    password          TEXT NOT NULL,
    work_time_minutes INTEGER NOT NULL,
    wait_secs         INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS reports (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    date_of_log   TEXT NOT NULL,
    connection_id INTEGER NOT NULL REFERENCES connections(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_reports_connection ON reports(connection_id);

CREATE TABLE IF NOT EXISTS report_items (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    report_id          INTEGER NOT NULL REFERENCES reports(id) ON DELETE CASCADE,
    query              TEXT NOT NULL,
    tables_and_columns TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_report_items_report ON report_items(report_id);

CREATE TABLE IF NOT EXISTS sql_noise (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    query         TEXT NOT NULL,
    connection_id INTEGER NOT NULL REFERENCES connections(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_sql_noise_connection ON sql_noise(connection_id);
";

/// Errors raised by the store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to create store directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection {0} not found")]
    ConnectionNotFound(i64),

    #[error("report {0} not found")]
    ReportNotFound(i64),

    /// The file was written by a newer build.
    #[error("store schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i32, supported: i32 },

    /// A stored value could not be mapped back to its domain type.
    #[error("corrupt {column} value: {message}")]
    Corrupt {
        column: &'static str,
        message: String,
    },
}

/// Handle to the store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (creating if needed) the store file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created, the file
    /// cannot be opened, or the schema cannot be migrated.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path)?;
        info!(path = %path.display(), "Store opened");
        Self::init(conn)
    }

    /// Opens a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(mut conn: rusqlite::Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persists a new connection and returns it with its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn add_connection(&self, new: &NewConnection) -> Result<Connection, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO connections
                 (name, kind, host, port, database_name, username, password, work_time_minutes, wait_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                new.name,
                new.kind.as_str(),
                new.host,
                new.port,
                new.database,
                new.username,
                new.password,
                new.work_time_minutes,
                new.wait_secs,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(connection_id = id, name = %new.name, "Connection added");

        Ok(Connection {
            id,
            name: new.name.clone(),
            kind: new.kind,
            host: new.host.clone(),
            port: new.port,
            database: new.database.clone(),
            username: new.username.clone(),
            password: new.password.clone(),
            work_time_minutes: new.work_time_minutes,
            wait_secs: new.wait_secs,
        })
    }

    /// Loads one connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConnectionNotFound`] if no such id exists.
    pub fn get_connection(&self, id: i64) -> Result<Connection, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, kind, host, port, database_name, username, password, work_time_minutes, wait_secs
             FROM connections
             WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        let connection = match rows.next()? {
            Some(row) => row_to_connection(row)?,
            None => return Err(StoreError::ConnectionNotFound(id)),
        };
        Ok(connection)
    }

    /// Lists all connections by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub fn list_connections(&self) -> Result<Vec<Connection>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, kind, host, port, database_name, username, password, work_time_minutes, wait_secs
             FROM connections
             ORDER BY id",
        )?;
        let mut rows = stmt.query([])?;
        let mut connections = Vec::new();
        while let Some(row) = rows.next()? {
            connections.push(row_to_connection(row)?);
        }
        Ok(connections)
    }

    /// Loads the noise set of a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn load_noise(&self, connection_id: i64) -> Result<Vec<NoiseEntry>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, query, connection_id FROM sql_noise WHERE connection_id = ?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map(params![connection_id], |row| {
                Ok(NoiseEntry {
                    id: row.get(0)?,
                    query: row.get(1)?,
                    connection_id: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Adds queries to a connection's noise set, skipping any already present
    /// (compared case-insensitively). Returns how many were added.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConnectionNotFound`] for an unknown connection,
    /// or an error if the insert fails.
    pub fn append_noise(
        &self,
        connection_id: i64,
        queries: &BTreeSet<String>,
    ) -> Result<usize, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        ensure_connection(&tx, connection_id)?;

        let mut known: HashSet<String> = {
            let mut stmt = tx.prepare("SELECT query FROM sql_noise WHERE connection_id = ?1")?;
            let existing = stmt
                .query_map(params![connection_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            existing.into_iter().map(|q| q.to_lowercase()).collect()
        };

        let mut added = 0;
        {
            let mut insert =
                tx.prepare("INSERT INTO sql_noise (query, connection_id) VALUES (?1, ?2)")?;
            for query in queries {
                if query.trim().is_empty() || !known.insert(query.to_lowercase()) {
                    continue;
                }
                insert.execute(params![query, connection_id])?;
                added += 1;
            }
        }
        tx.commit()?;

        debug!(connection_id, added, "Noise appended");
        Ok(added)
    }

    /// Saves a report and its items atomically, returning it with ids filled
    /// in.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConnectionNotFound`] for an unknown connection,
    /// or an error if any insert fails (nothing is written in that case).
    pub fn save_report(&self, report: &Report) -> Result<Report, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        ensure_connection(&tx, report.connection_id)?;

        tx.execute(
            "INSERT INTO reports (date_of_log, connection_id) VALUES (?1, ?2)",
            params![
                report.date_of_log.to_rfc3339_opts(SecondsFormat::Micros, true),
                report.connection_id
            ],
        )?;
        let report_id = tx.last_insert_rowid();

        let mut items = Vec::with_capacity(report.items.len());
        {
            let mut insert = tx.prepare(
                "INSERT INTO report_items (report_id, query, tables_and_columns) VALUES (?1, ?2, ?3)",
            )?;
            for item in &report.items {
                insert.execute(params![report_id, item.query, item.tables_and_columns])?;
                items.push(ReportItem {
                    id: Some(tx.last_insert_rowid()),
                    query: item.query.clone(),
                    tables_and_columns: item.tables_and_columns.clone(),
                });
            }
        }
        tx.commit()?;

        info!(
            report_id,
            connection_id = report.connection_id,
            items = items.len(),
            "Report saved"
        );
        Ok(Report {
            id: Some(report_id),
            date_of_log: report.date_of_log,
            connection_id: report.connection_id,
            items,
        })
    }

    /// Lists the reports of a connection, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a date is corrupt.
    pub fn list_reports(&self, connection_id: i64) -> Result<Vec<ReportSummary>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT r.id, r.date_of_log, r.connection_id, COUNT(i.id)
             FROM reports r
             LEFT JOIN report_items i ON i.report_id = r.id
             WHERE r.connection_id = ?1
             GROUP BY r.id
             ORDER BY r.date_of_log DESC, r.id DESC",
        )?;
        let mut rows = stmt.query(params![connection_id])?;
        let mut summaries = Vec::new();
        while let Some(row) = rows.next()? {
            let date: String = row.get(1)?;
            let count: i64 = row.get(3)?;
            summaries.push(ReportSummary {
                id: row.get(0)?,
                date_of_log: parse_datetime(&date)?,
                connection_id: row.get(2)?,
                item_count: usize::try_from(count).map_err(|e| StoreError::Corrupt {
                    column: "item_count",
                    message: e.to_string(),
                })?,
            });
        }
        Ok(summaries)
    }

    /// Loads one report with its items.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ReportNotFound`] if no such id exists.
    pub fn get_report(&self, id: i64) -> Result<Report, StoreError> {
        let conn = self.lock();
        let header: Option<(String, i64)> = conn
            .query_row(
                "SELECT date_of_log, connection_id FROM reports WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (date, connection_id) = header.ok_or(StoreError::ReportNotFound(id))?;

        let mut stmt = conn.prepare(
            "SELECT id, query, tables_and_columns FROM report_items WHERE report_id = ?1 ORDER BY id",
        )?;
        let items = stmt
            .query_map(params![id], |row| {
                Ok(ReportItem {
                    id: Some(row.get(0)?),
                    query: row.get(1)?,
                    tables_and_columns: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Report {
            id: Some(id),
            date_of_log: parse_datetime(&date)?,
            connection_id,
            items,
        })
    }
}

fn run_migrations(conn: &mut rusqlite::Connection) -> Result<(), StoreError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchema {
            found: version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }
    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    tx.execute_batch(SCHEMA_V1)?;
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    tx.commit()?;

    debug!(from = version, to = CURRENT_SCHEMA_VERSION, "Store migrated");
    Ok(())
}

fn ensure_connection(tx: &Transaction<'_>, connection_id: i64) -> Result<(), StoreError> {
    let exists: Option<i64> = tx
        .query_row(
            "SELECT id FROM connections WHERE id = ?1",
            params![connection_id],
            |row| row.get(0),
        )
        .optional()?;
    exists
        .map(|_| ())
        .ok_or(StoreError::ConnectionNotFound(connection_id))
}

fn row_to_connection(row: &Row<'_>) -> Result<Connection, StoreError> {
    let kind: String = row.get("kind")?;
    let port: i64 = row.get("port")?;
    let work_time_minutes: i64 = row.get("work_time_minutes")?;
    let wait_secs: i64 = row.get("wait_secs")?;

    Ok(Connection {
        id: row.get("id")?,
        name: row.get("name")?,
        kind: kind
            .parse::<DbKind>()
            .map_err(|message| StoreError::Corrupt {
                column: "kind",
                message,
            })?,
        host: row.get("host")?,
        port: narrow(port, "port")?,
        database: row.get("database_name")?,
        username: row.get("username")?,
        password: row.get("password")?,
        work_time_minutes: narrow(work_time_minutes, "work_time_minutes")?,
        wait_secs: narrow(wait_secs, "wait_secs")?,
    })
}

fn narrow<T: TryFrom<i64>>(value: i64, column: &'static str) -> Result<T, StoreError> {
    T::try_from(value).map_err(|_| StoreError::Corrupt {
        column,
        message: format!("{value} is out of range"),
    })
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            column: "date_of_log",
            message: e.to_string(),
        })
}
