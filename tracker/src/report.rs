//! Report assembly.
//!
//! Runs the extractor over every candidate query, groups the resulting
//! columns under the tables they belong to and renders each group as a
//! `table: c1, c2` line. The groups of all items are also merged into a
//! [`UsageArtifact`], the table → columns mapping written as JSON once the
//! report is stored.
//!
//! # Column attribution
//!
//! - `x.col` goes to the table `x` names, resolving aliases first
//! - a bare `col` goes to the only table when there is exactly one
//! - anything else is unattributed: left out of the groups, the summary and
//!   the artifact, and available through [`unattributed_columns`]
//!
//! Groups are therefore limited to tables found in the item's own query.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::extractor::{Extractor, SqlUsage};
use crate::types::{Report, ReportItem};

/// Columns attributed to one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableUsage {
    pub table: String,
    /// First-seen order, no duplicates.
    pub columns: Vec<String>,
}

/// Groups the columns of `usage` by table.
///
/// Only tables of `usage` appear; columns that cannot be tied to exactly one
/// of them are dropped.
#[must_use]
pub fn group_by_table(usage: &SqlUsage) -> Vec<TableUsage> {
    attribute(usage).0
}

/// Columns of `usage` that [`group_by_table`] cannot tie to a table.
#[must_use]
pub fn unattributed_columns(usage: &SqlUsage) -> Vec<String> {
    attribute(usage).1
}

fn attribute(usage: &SqlUsage) -> (Vec<TableUsage>, Vec<String>) {
    let real_tables: Vec<&String> = usage
        .tables
        .iter()
        .filter(|table| match usage.aliases.get(*table) {
            Some(target) => target == *table,
            None => true,
        })
        .collect();

    let mut groups: Vec<TableUsage> = real_tables
        .iter()
        .map(|table| TableUsage {
            table: (*table).clone(),
            columns: Vec::new(),
        })
        .collect();
    let mut unattributed: Vec<String> = Vec::new();

    for column in &usage.columns {
        let target = match column.rsplit_once('.') {
            Some((qualifier, name)) => {
                resolve_qualifier(usage, &real_tables, qualifier).map(|table| (table, name))
            }
            None if real_tables.len() == 1 => Some((real_tables[0].as_str(), column.as_str())),
            None => None,
        };

        match target {
            Some((table, name)) => {
                if let Some(group) = groups.iter_mut().find(|g| g.table == table) {
                    push_unique(&mut group.columns, name);
                }
            }
            None => push_unique(&mut unattributed, column),
        }
    }

    (groups, unattributed)
}

fn resolve_qualifier<'a>(
    usage: &'a SqlUsage,
    real_tables: &[&'a String],
    qualifier: &str,
) -> Option<&'a str> {
    if let Some(table) = usage.aliases.get(qualifier) {
        return Some(table.as_str());
    }
    let suffix = format!(".{qualifier}");
    real_tables
        .iter()
        .find(|table| table.as_str() == qualifier)
        .or_else(|| real_tables.iter().find(|table| table.ends_with(&suffix)))
        .map(|table| table.as_str())
}

fn push_unique(values: &mut Vec<String>, value: &str) {
    if !values.iter().any(|v| v == value) {
        values.push(value.to_string());
    }
}

/// Renders groups as newline-separated `table: c1, c2` lines.
#[must_use]
pub fn format_summary(groups: &[TableUsage]) -> String {
    groups
        .iter()
        .map(|group| {
            format!("{}: {}", group.table, group.columns.join(", "))
                .trim_end()
                .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Table → columns mapping across a whole report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct UsageArtifact(BTreeMap<String, Vec<String>>);

impl UsageArtifact {
    /// Folds one item's groups into the mapping.
    pub fn merge(&mut self, groups: &[TableUsage]) {
        for group in groups {
            let columns = self.0.entry(group.table.clone()).or_default();
            for column in &group.columns {
                push_unique(columns, column);
            }
        }
    }

    /// Columns recorded for `table`, if any.
    #[must_use]
    pub fn columns(&self, table: &str) -> Option<&[String]> {
        self.0.get(table).map(Vec::as_slice)
    }

    /// Returns `true` if no table was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Writes the mapping to `<dir>/report-<report_id>.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file cannot
    /// be written.
    pub fn write(&self, dir: &Path, report_id: i64) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("report-{report_id}.json"));
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;
        Ok(path)
    }
}

/// A report ready for the store, with its usage artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledReport {
    pub report: Report,
    pub usage: UsageArtifact,
}

/// Builds reports from candidate query sets.
#[derive(Debug, Clone)]
pub struct ReportAssembler {
    extractor: Arc<Extractor>,
}

impl ReportAssembler {
    #[must_use]
    pub fn new(extractor: Arc<Extractor>) -> Self {
        Self { extractor }
    }

    /// Extracts every candidate and wraps the items into one report.
    ///
    /// A query whose extraction faults is logged and left out; the rest of
    /// the batch is still assembled.
    #[must_use]
    pub fn assemble(&self, connection_id: i64, candidates: &BTreeSet<String>) -> AssembledReport {
        let mut items = Vec::with_capacity(candidates.len());
        let mut usage = UsageArtifact::default();

        for query in candidates {
            let extracted = match self.extractor.try_extract(query) {
                Ok(extracted) => extracted,
                Err(err) => {
                    warn!(error = %err, query = %query, "Skipping query that failed extraction");
                    continue;
                }
            };

            let (groups, unattributed) = attribute(&extracted);
            debug!(
                query_type = %extracted.query_type,
                tables = extracted.tables.len(),
                columns = extracted.columns.len(),
                unattributed = unattributed.len(),
                "Query analyzed"
            );
            usage.merge(&groups);
            items.push(ReportItem {
                id: None,
                query: query.clone(),
                tables_and_columns: format_summary(&groups),
            });
        }

        AssembledReport {
            report: Report {
                id: None,
                date_of_log: Utc::now(),
                connection_id,
                items,
            },
            usage,
        }
    }
}
