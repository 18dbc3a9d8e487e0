//! Tracking session lifecycle.
//!
//! A [`TrackingSession`] captures a baseline sample, then runs exactly one
//! deferred action on a background task once the observation window has
//! elapsed. Depending on the [`TrackingMode`] that action either produces a
//! [`Report`] or grows the connection's noise set.
//!
//! ```text
//! Idle -> BaselineCaptured -> Running -> Completed | Cancelled | Failed
//! ```
//!
//! [`TrackingSession::stop`] cancels a pending action and joins the task
//! before returning, so nothing the session owns is touched afterwards. Once
//! the action has fired it runs to completion; stopping then only waits.
//!
//! When the connection has a poll wait, the same task also samples every
//! `wait` inside the window and buffers what it sees, because the activity
//! view only shows statements that are in flight at sampling time.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::config::Config;
use crate::differ::diff;
use crate::error::Result;
use crate::extractor::Extractor;
use crate::report::ReportAssembler;
use crate::sampler::ActivitySampler;
use crate::store::Store;
use crate::types::{Connection, Report, SessionState, TrackingMode};

/// Errors caused by driving a session out of order.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// `start` was called on a session that is no longer idle.
    #[error("session has already been started")]
    AlreadyStarted,

    /// An operation needed a started session.
    #[error("session has not been started")]
    NotStarted,

    /// A blocking store call or the background task died.
    #[error("session task failed: {0}")]
    TaskFailed(String),
}

/// Session settings taken from [`Config`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Where the JSON usage artifact is written after an analyze run.
    pub artifact_dir: Option<PathBuf>,
    /// Reset statement counters before the baseline.
    pub reset_statistics: bool,
}

impl SessionOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            artifact_dir: config.artifact_dir.clone(),
            reset_statistics: config.reset_statistics,
        }
    }
}

/// What a completed deferred action produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// An analyze run: the stored report and, if written, its artifact.
    Report {
        report: Report,
        artifact: Option<PathBuf>,
    },
    /// A noise-capture run: how many new noise entries were stored.
    NoiseCaptured { added: usize },
}

/// One baseline plus one deferred action against one connection.
///
/// Await [`stop`](Self::stop) or [`wait`](Self::wait) before dropping a
/// started session. Dropping it aborts the background task at its next await
/// point, so an action that has already fired may end without an outcome.
/// Store writes are transactional and are never left half done.
pub struct TrackingSession<S: ActivitySampler> {
    id: Uuid,
    connection: Connection,
    sampler: Arc<S>,
    store: Store,
    assembler: ReportAssembler,
    options: SessionOptions,
    state: Arc<Mutex<SessionState>>,
    outcome: Arc<Mutex<Option<SessionOutcome>>>,
    cancel_token: CancellationToken,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<S: ActivitySampler> TrackingSession<S> {
    #[must_use]
    pub fn new(
        connection: Connection,
        sampler: S,
        store: Store,
        extractor: Arc<Extractor>,
        options: SessionOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection,
            sampler: Arc::new(sampler),
            store,
            assembler: ReportAssembler::new(extractor),
            options,
            state: Arc::new(Mutex::new(SessionState::Idle)),
            outcome: Arc::new(Mutex::new(None)),
            cancel_token: CancellationToken::new(),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Unique id used in log fields.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// The result of the deferred action, once it has completed.
    #[must_use]
    pub fn outcome(&self) -> Option<SessionOutcome> {
        lock(&self.outcome).clone()
    }

    /// Captures the baseline and schedules the deferred action to fire after
    /// `duration`. Returns as soon as the action is scheduled.
    ///
    /// # Errors
    ///
    /// - [`SessionError::AlreadyStarted`] if the session is not idle
    /// - [`crate::TrackerError::Connectivity`] if the baseline sample fails; the
    ///   session ends in [`SessionState::Failed`]
    /// - [`crate::TrackerError::Store`] if the noise set cannot be loaded
    pub async fn start(&self, duration: Duration, mode: TrackingMode) -> Result<()> {
        // Held for the whole call so concurrent starts serialize.
        let mut handle = self.handle.lock().await;
        if self.state() != SessionState::Idle {
            return Err(SessionError::AlreadyStarted.into());
        }

        info!(
            session_id = %self.id,
            connection_id = self.connection.id,
            ?mode,
            duration_secs = duration.as_secs(),
            "Starting tracking session"
        );

        if self.options.reset_statistics {
            if let Err(err) = self.sampler.reset_statistics().await {
                warn!(session_id = %self.id, error = %err, "Failed to reset statement statistics");
            }
        }

        let started_at = Utc::now();
        let baseline = match self.sampler.sample(None).await {
            Ok(baseline) => baseline,
            Err(err) => {
                self.set_state(SessionState::Failed);
                error!(session_id = %self.id, error = %err, "Baseline sample failed");
                return Err(err.into());
            }
        };
        self.set_state(SessionState::BaselineCaptured);
        debug!(session_id = %self.id, queries = baseline.len(), "Baseline captured");

        let noise = match self.load_noise().await {
            Ok(noise) => noise,
            Err(err) => {
                self.set_state(SessionState::Failed);
                return Err(err);
            }
        };

        let action = DeferredAction {
            connection: self.connection.clone(),
            sampler: Arc::clone(&self.sampler),
            store: self.store.clone(),
            assembler: self.assembler.clone(),
            artifact_dir: self.options.artifact_dir.clone(),
            mode,
            baseline,
            noise,
            buffer: Mutex::new(BTreeSet::new()),
            started_at,
            cancel_token: self.cancel_token.clone(),
        };

        // Running must be visible before the task can finish.
        self.set_state(SessionState::Running);

        let state = Arc::clone(&self.state);
        let outcome = Arc::clone(&self.outcome);
        let span = info_span!("session", session_id = %self.id, connection_id = self.connection.id);
        *handle = Some(tokio::spawn(
            async move {
                let next = match action.run(duration).await {
                    Ok(Some(result)) => {
                        info!("Tracking session completed");
                        *lock(&outcome) = Some(result);
                        SessionState::Completed
                    }
                    Ok(None) => {
                        info!("Tracking session cancelled before firing");
                        SessionState::Cancelled
                    }
                    Err(err) => {
                        error!(error = %err, "Deferred action failed");
                        SessionState::Failed
                    }
                };
                *lock(&state) = next;
            }
            .instrument(span),
        ));

        Ok(())
    }

    /// Cancels the pending action and waits for the background task to end.
    ///
    /// Does nothing on a finished session. Stopping an idle session closes it
    /// without sampling.
    pub async fn stop(&self) {
        self.cancel_token.cancel();

        let mut handle = self.handle.lock().await;
        if let Some(task) = handle.take() {
            if let Err(err) = task.await {
                error!(session_id = %self.id, error = %err, "Session task panicked");
                self.set_state(SessionState::Failed);
            }
        } else if self.state() == SessionState::Idle {
            self.set_state(SessionState::Cancelled);
        }
    }

    /// Waits for the deferred action to finish without cancelling it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotStarted`] if nothing was scheduled, or
    /// [`SessionError::TaskFailed`] if the task panicked.
    pub async fn wait(&self) -> Result<SessionState> {
        let mut handle = self.handle.lock().await;
        let Some(task) = handle.as_mut() else {
            return if self.state().is_terminal() {
                Ok(self.state())
            } else {
                Err(SessionError::NotStarted.into())
            };
        };

        let joined = task.await;
        *handle = None;
        if let Err(err) = joined {
            self.set_state(SessionState::Failed);
            return Err(SessionError::TaskFailed(err.to_string()).into());
        }
        Ok(self.state())
    }

    fn set_state(&self, next: SessionState) {
        *lock(&self.state) = next;
    }

    async fn load_noise(&self) -> Result<Vec<String>> {
        let store = self.store.clone();
        let connection_id = self.connection.id;
        let entries = tokio::task::spawn_blocking(move || store.load_noise(connection_id))
            .await
            .map_err(|e| SessionError::TaskFailed(e.to_string()))??;
        Ok(entries.into_iter().map(|entry| entry.query).collect())
    }
}

impl<S: ActivitySampler> Drop for TrackingSession<S> {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        if let Some(task) = self.handle.get_mut().take() {
            task.abort();
        }
    }
}

impl<S: ActivitySampler> std::fmt::Debug for TrackingSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingSession")
            .field("id", &self.id)
            .field("connection_id", &self.connection.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Everything the background task needs, moved into it at `start`.
struct DeferredAction<S> {
    connection: Connection,
    sampler: Arc<S>,
    store: Store,
    assembler: ReportAssembler,
    artifact_dir: Option<PathBuf>,
    mode: TrackingMode,
    baseline: BTreeSet<String>,
    noise: Vec<String>,
    /// Queries seen by intermediate polls.
    buffer: Mutex<BTreeSet<String>>,
    started_at: DateTime<Utc>,
    cancel_token: CancellationToken,
}

impl<S: ActivitySampler> DeferredAction<S> {
    /// Returns `Ok(None)` when cancelled before firing.
    async fn run(self, duration: Duration) -> Result<Option<SessionOutcome>> {
        let Some(since) = self.observe(duration).await else {
            return Ok(None);
        };

        let final_sample = self.sampler.sample(since).await?;
        let observed = {
            let mut buffer = lock(&self.buffer);
            buffer.extend(final_sample);
            std::mem::take(&mut *buffer)
        };
        let candidates = diff(&observed, &self.baseline, &self.noise);
        debug!(
            observed = observed.len(),
            candidates = candidates.len(),
            "Final sample diffed"
        );

        match self.mode {
            TrackingMode::Analyze => self.analyze(&candidates).await.map(Some),
            TrackingMode::NoiseCapture => self.capture_noise(candidates).await.map(Some),
        }
    }

    /// Waits out the window, polling when configured. Returns `None` if
    /// cancelled, otherwise the recency bound for the final sample.
    async fn observe(&self, duration: Duration) -> Option<Option<DateTime<Utc>>> {
        let deadline = Instant::now() + duration;

        let Some(wait) = self.connection.poll_wait() else {
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => return None,
                () = sleep_until(deadline) => {}
            }
            return Some(None);
        };

        let mut last_check = self.started_at;
        loop {
            let next = (Instant::now() + wait).min(deadline);
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => return None,
                () = sleep_until(next) => {}
            }
            if next >= deadline {
                return Some(Some(last_check));
            }

            let checked_at = Utc::now();
            match self.sampler.sample(Some(last_check)).await {
                Ok(queries) => {
                    debug!(queries = queries.len(), "Intermediate sample");
                    lock(&self.buffer).extend(queries);
                    last_check = checked_at;
                }
                Err(err) => warn!(error = %err, "Intermediate sample failed"),
            }
        }
    }

    async fn analyze(&self, candidates: &BTreeSet<String>) -> Result<SessionOutcome> {
        let assembled = self.assembler.assemble(self.connection.id, candidates);

        let store = self.store.clone();
        let artifact_dir = self.artifact_dir.clone();
        let span = Span::current();
        let (report, artifact) = tokio::task::spawn_blocking(move || -> Result<_> {
            let _entered = span.enter();
            let report = store.save_report(&assembled.report)?;

            let artifact = match (artifact_dir, report.id) {
                (Some(dir), Some(report_id)) => match assembled.usage.write(&dir, report_id) {
                    Ok(path) => {
                        info!(path = %path.display(), "Usage artifact written");
                        Some(path)
                    }
                    Err(err) => {
                        warn!(error = %err, "Failed to write usage artifact");
                        None
                    }
                },
                _ => None,
            };
            Ok((report, artifact))
        })
        .await
        .map_err(|e| SessionError::TaskFailed(e.to_string()))??;

        Ok(SessionOutcome::Report { report, artifact })
    }

    async fn capture_noise(&self, candidates: BTreeSet<String>) -> Result<SessionOutcome> {
        let store = self.store.clone();
        let connection_id = self.connection.id;
        let added = tokio::task::spawn_blocking(move || store.append_noise(connection_id, &candidates))
            .await
            .map_err(|e| SessionError::TaskFailed(e.to_string()))??;

        info!(added, "Noise captured");
        Ok(SessionOutcome::NoiseCaptured { added })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_follow_config_defaults() {
        let options = SessionOptions::default();
        assert!(options.artifact_dir.is_none());
        assert!(!options.reset_statistics);
    }

    #[test]
    fn session_error_messages() {
        assert_eq!(SessionError::NotStarted.to_string(), "session has not been started");
        assert_eq!(
            SessionError::TaskFailed("boom".to_string()).to_string(),
            "session task failed: boom"
        );
    }
}
