//! DbListener Tracker - database activity tracking and schema-usage extraction.
//!
//! This crate watches a PostgreSQL database's activity view for a fixed
//! window, keeps the queries that were not already running or known as noise,
//! and records which tables and columns each of them touches.
//!
//! # Overview
//!
//! A [`TrackingSession`] takes a baseline sample, waits out the connection's
//! observation window, then samples again. The difference is run through the
//! [`Extractor`] and stored as a [`Report`], or, in noise-capture mode,
//! appended to the connection's noise set so later reports skip it.
//!
//! # Modules
//!
//! - [`types`]: Connections, reports, noise entries and session enums
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for tracker operations
//! - [`extractor`]: SQL table/column extraction (AST with lexical fallback)
//! - [`differ`]: Baseline and noise subtraction
//! - [`sampler`]: Activity view sampling
//! - [`report`]: Report assembly and usage artifacts
//! - [`session`]: Tracking session lifecycle
//! - [`store`]: SQLite store for connections, reports and noise

pub mod config;
pub mod differ;
pub mod error;
pub mod extractor;
pub mod report;
pub mod sampler;
pub mod session;
pub mod store;
pub mod types;

pub use config::{Config, ConfigError, LogFormat};
pub use differ::diff;
pub use error::{Result, TrackerError};
pub use extractor::{
    ExtractionError, Extractor, ExtractorConfig, ExtractorStrategy, QueryType, SqlUsage,
};
pub use report::{AssembledReport, ReportAssembler, TableUsage, UsageArtifact};
pub use sampler::{ActivitySampler, ActivityView, PostgresSampler, SamplerError};
pub use session::{SessionError, SessionOptions, SessionOutcome, TrackingSession};
pub use store::{Store, StoreError};
pub use types::{
    Connection, DbKind, NewConnection, NoiseEntry, Report, ReportItem, ReportSummary,
    SessionState, TrackingMode,
};
