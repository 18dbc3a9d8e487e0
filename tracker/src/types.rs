//! Domain types for DbListener tracking.
//!
//! These mirror the records the store persists (connections, reports, report
//! items, noise entries) plus the transient enums that drive a tracking
//! session. Persisted records serialize to camelCase JSON.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Database engine behind a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbKind {
    Postgres,
}

impl DbKind {
    /// Stable lowercase name used in the store and on the command line.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
        }
    }
}

impl fmt::Display for DbKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            other => Err(format!("unsupported database kind '{other}'")),
        }
    }
}

/// Reachability and scheduling parameters for one tracked database.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: i64,
    /// Human label shown in listings.
    pub name: String,
    pub kind: DbKind,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Observation window in minutes.
    pub work_time_minutes: u32,
    /// Wait between intermediate samples in seconds; zero samples only at the end.
    pub wait_secs: u32,
}

impl Connection {
    /// The configured observation window.
    #[must_use]
    pub fn work_time(&self) -> Duration {
        Duration::from_secs(u64::from(self.work_time_minutes) * 60)
    }

    /// Interval between intermediate samples, if polling is enabled.
    #[must_use]
    pub fn poll_wait(&self) -> Option<Duration> {
        (self.wait_secs > 0).then(|| Duration::from_secs(u64::from(self.wait_secs)))
    }
}

// Keeps the password out of logs.
impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("work_time_minutes", &self.work_time_minutes)
            .field("wait_secs", &self.wait_secs)
            .finish()
    }
}

/// A connection that has not been stored yet.
#[derive(Clone, PartialEq, Eq)]
pub struct NewConnection {
    pub name: String,
    pub kind: DbKind,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub work_time_minutes: u32,
    pub wait_secs: u32,
}

impl fmt::Debug for NewConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewConnection")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("work_time_minutes", &self.work_time_minutes)
            .field("wait_secs", &self.wait_secs)
            .finish()
    }
}

/// A query marked as irrelevant for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoiseEntry {
    pub id: i64,
    pub query: String,
    pub connection_id: i64,
}

/// One analyzed query inside a [`Report`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportItem {
    /// Store id; `None` until the owning report is saved.
    pub id: Option<i64>,
    pub query: String,
    /// Newline-separated `table: col1, col2` groups.
    pub tables_and_columns: String,
}

/// The result of one completed analyze session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    /// Store id; `None` until saved.
    pub id: Option<i64>,
    pub date_of_log: DateTime<Utc>,
    pub connection_id: i64,
    pub items: Vec<ReportItem>,
}

/// Stored report metadata without its items, used for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub id: i64,
    pub date_of_log: DateTime<Utc>,
    pub connection_id: i64,
    pub item_count: usize,
}

/// What the deferred action does with the queries it finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    /// Diff, extract and store a report.
    Analyze,
    /// Append every new query to the connection's noise set.
    NoiseCapture,
}

/// Lifecycle of a tracking session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    BaselineCaptured,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    /// Whether the session can no longer change state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}
