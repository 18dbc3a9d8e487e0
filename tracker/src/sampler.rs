//! Activity sampling.
//!
//! A sample is the set of distinct query texts the target database reports
//! as recently executed. [`ActivitySampler`] is the seam the tracking session
//! drives; [`PostgresSampler`] reads it from `pg_stat_activity` or
//! `pg_stat_statements`.
//!
//! Every statement the sampler sends carries [`SELF_MARKER`] and rows
//! containing it are filtered out, so the sampler never observes itself.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error};

use crate::types::Connection;

/// Comment embedded in every statement the sampler issues.
pub const SELF_MARKER: &str = "/* dblistener */";

const ACTIVITY_QUERY: &str = "SELECT DISTINCT query /* dblistener */ \
     FROM pg_stat_activity \
     WHERE pid <> pg_backend_pid() \
       AND datname = current_database() \
       AND query IS NOT NULL AND query <> '' \
       AND position('/* dblistener */' in query) = 0";

const ACTIVITY_SINCE_QUERY: &str = "SELECT DISTINCT query /* dblistener */ \
     FROM pg_stat_activity \
     WHERE pid <> pg_backend_pid() \
       AND datname = current_database() \
       AND query IS NOT NULL AND query <> '' \
       AND position('/* dblistener */' in query) = 0 \
       AND query_start > $1";

const STATEMENTS_QUERY: &str = "SELECT DISTINCT query /* dblistener */ \
     FROM pg_stat_statements \
     WHERE dbid = (SELECT oid FROM pg_database WHERE datname = current_database()) \
       AND query IS NOT NULL AND query <> '' \
       AND position('/* dblistener */' in query) = 0";

const RESET_STATEMENTS: &str = "SELECT pg_stat_statements_reset() /* dblistener */";

/// Errors raised while sampling the target database.
#[derive(Error, Debug)]
pub enum SamplerError {
    /// The connection could not be established.
    #[error("database unreachable: {0}")]
    Unreachable(String),

    /// The connection succeeded but the activity query failed.
    #[error("activity query failed: {0}")]
    Query(String),
}

/// Which statistics view a sample reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivityView {
    /// `pg_stat_activity`: the current or last statement per backend.
    #[default]
    Activity,
    /// `pg_stat_statements`: cumulative normalized statements.
    StatementStats,
}

impl fmt::Display for ActivityView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Activity => "activity",
            Self::StatementStats => "statements",
        })
    }
}

impl FromStr for ActivityView {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "activity" => Ok(Self::Activity),
            "statements" => Ok(Self::StatementStats),
            other => Err(format!("expected 'activity' or 'statements', got '{other}'")),
        }
    }
}

/// Source of activity samples for one target database.
pub trait ActivitySampler: Send + Sync + 'static {
    /// Returns the distinct query texts currently visible.
    ///
    /// With `since`, only statements started after that instant are
    /// returned when the underlying view can tell.
    fn sample(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<BTreeSet<String>, SamplerError>> + Send;

    /// Clears cumulative statement counters on the target.
    fn reset_statistics(&self) -> impl Future<Output = Result<(), SamplerError>> + Send;
}

/// Samples a PostgreSQL server with a fresh connection per call.
pub struct PostgresSampler {
    config: tokio_postgres::Config,
    view: ActivityView,
    target: String,
}

impl PostgresSampler {
    #[must_use]
    pub fn new(connection: &Connection, view: ActivityView, connect_timeout: Duration) -> Self {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&connection.host)
            .port(connection.port)
            .user(&connection.username)
            .password(&connection.password)
            .dbname(&connection.database)
            .application_name("dblistener")
            .connect_timeout(connect_timeout);

        Self {
            config,
            view,
            target: format!(
                "{}:{}/{}",
                connection.host, connection.port, connection.database
            ),
        }
    }

    async fn connect(&self) -> Result<Client, SamplerError> {
        debug!(target_db = %self.target, view = %self.view, "Connecting to PostgreSQL");

        let (client, connection) = self
            .config
            .connect(NoTls)
            .await
            .map_err(|e| SamplerError::Unreachable(format!("{}: {e}", self.target)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection error");
            }
        });

        Ok(client)
    }
}

impl fmt::Debug for PostgresSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresSampler")
            .field("target", &self.target)
            .field("view", &self.view)
            .finish_non_exhaustive()
    }
}

impl ActivitySampler for PostgresSampler {
    async fn sample(&self, since: Option<DateTime<Utc>>) -> Result<BTreeSet<String>, SamplerError> {
        let client = self.connect().await?;

        let rows = match (self.view, since) {
            (ActivityView::Activity, Some(since)) => {
                client.query(ACTIVITY_SINCE_QUERY, &[&since]).await
            }
            (ActivityView::Activity, None) => client.query(ACTIVITY_QUERY, &[]).await,
            // pg_stat_statements has no per-statement start time.
            (ActivityView::StatementStats, _) => client.query(STATEMENTS_QUERY, &[]).await,
        }
        .map_err(|e| SamplerError::Query(e.to_string()))?;

        let mut queries = BTreeSet::new();
        for row in rows {
            let query: Option<String> = row
                .try_get("query")
                .map_err(|e| SamplerError::Query(e.to_string()))?;
            if let Some(query) = query.filter(|q| !q.trim().is_empty()) {
                queries.insert(query);
            }
        }

        debug!(target_db = %self.target, count = queries.len(), "Sample taken");
        Ok(queries)
    }

    async fn reset_statistics(&self) -> Result<(), SamplerError> {
        if self.view != ActivityView::StatementStats {
            return Ok(());
        }
        let client = self.connect().await?;
        client
            .execute(RESET_STATEMENTS, &[])
            .await
            .map_err(|e| SamplerError::Query(e.to_string()))?;
        Ok(())
    }
}
