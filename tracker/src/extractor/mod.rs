//! SQL usage extraction.
//!
//! Turns raw query text into the set of tables and columns it touches. Two
//! strategies are available:
//!
//! - [`ExtractorStrategy::Ast`]: parses the text with `sqlparser` for the
//!   configured dialect and walks the resulting tree (see [`ast`]). Text the
//!   parser rejects, and statements the walker does not model, go through the
//!   lexical strategy instead.
//! - [`ExtractorStrategy::Lexical`]: regex-driven best effort over normalized
//!   text (see [`lexical`]).
//!
//! Extraction is deterministic and never fails from the caller's point of view:
//! [`Extractor::extract`] returns an empty [`SqlUsage`] when anything goes
//! wrong. [`Extractor::try_extract`] surfaces the fault for callers that want
//! to log and skip.
//!
//! # Example
//!
//! ```
//! use dblistener_tracker::extractor::{Extractor, ExtractorConfig};
//!
//! let extractor = Extractor::new(&ExtractorConfig::default()).unwrap();
//! let usage = extractor.extract("select a, b from t");
//!
//! assert_eq!(usage.tables, vec!["t".to_string()]);
//! assert_eq!(usage.columns, vec!["a".to_string(), "b".to_string()]);
//! ```

pub mod ast;
pub mod lexical;

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::config::ConfigError;

pub use ast::AstExtractor;
pub use lexical::LexicalExtractor;

/// Words never accepted as column names by the lexical strategy.
pub const DEFAULT_KEYWORDS: &[&str] = &[
    "select", "from", "where", "group", "by", "having", "order", "join", "inner", "left", "right",
    "outer", "cross", "on", "as", "and", "or", "not", "in", "is", "null", "like", "between",
    "exists", "any", "all", "distinct", "case", "when", "then", "else", "end", "limit", "offset",
    "union", "except", "intersect", "insert", "into", "values", "update", "set", "delete",
    "create", "alter", "drop", "table", "view", "index", "primary", "key", "foreign",
    "references", "check", "default", "constraint", "unique", "asc", "desc", "count", "sum",
    "avg", "min", "max", "coalesce", "cast", "extract", "date", "time", "timestamp", "interval",
    "true", "false",
];

/// Errors raised while analyzing a single query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    /// The analyzer panicked on this input.
    #[error("analyzer panicked: {0}")]
    Panicked(String),
}

/// Which extraction strategy an [`Extractor`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorStrategy {
    Ast,
    Lexical,
}

impl FromStr for ExtractorStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ast" => Ok(Self::Ast),
            "lexical" => Ok(Self::Lexical),
            other => Err(format!("expected 'ast' or 'lexical', got '{other}'")),
        }
    }
}

/// Settings handed to [`Extractor::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorConfig {
    pub strategy: ExtractorStrategy,
    /// Dialect name as accepted by `sqlparser::dialect::dialect_from_str`.
    pub dialect: String,
    /// Keyword denylist for the lexical strategy.
    pub keywords: Vec<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            strategy: ExtractorStrategy::Ast,
            dialect: "postgres".to_string(),
            keywords: DEFAULT_KEYWORDS.iter().map(|k| (*k).to_string()).collect(),
        }
    }
}

/// Statement class decided from the leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
    #[default]
    Unknown,
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Tables and columns referenced by one query.
///
/// `tables` and `columns` keep first-seen order and hold no duplicates.
/// Distinctness is case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlUsage {
    pub query_type: QueryType,
    /// Table names, plus any alias introduced for them.
    pub tables: Vec<String>,
    /// Bare (`col`) or qualified (`t.col`) column references.
    pub columns: Vec<String>,
    /// Alias to table bindings found in FROM clauses.
    pub aliases: BTreeMap<String, String>,
}

impl SqlUsage {
    /// Returns `true` if no table and no column was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.columns.is_empty()
    }

    pub(crate) fn add_table(&mut self, table: impl Into<String>) {
        push_unique(&mut self.tables, table.into());
    }

    pub(crate) fn add_column(&mut self, column: impl Into<String>) {
        push_unique(&mut self.columns, column.into());
    }

    pub(crate) fn add_alias(&mut self, alias: impl Into<String>, table: impl Into<String>) {
        let alias = alias.into();
        self.add_table(alias.clone());
        self.aliases.entry(alias).or_insert_with(|| table.into());
    }
}

fn push_unique(values: &mut Vec<String>, value: String) {
    if !value.trim().is_empty() && !values.contains(&value) {
        values.push(value);
    }
}

/// Query text analyzer configured for one deployment.
///
/// Cheap to share behind an `Arc`; holds no mutable state.
#[derive(Debug)]
pub struct Extractor {
    strategy: ExtractorStrategy,
    ast: AstExtractor,
    lexical: LexicalExtractor,
}

impl Extractor {
    /// Creates an extractor from its configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if the dialect is unknown to the
    /// SQL parser.
    pub fn new(config: &ExtractorConfig) -> Result<Self, ConfigError> {
        let ast = AstExtractor::new(&config.dialect).ok_or_else(|| ConfigError::InvalidValue {
            key: "dialect".to_string(),
            message: format!("unknown SQL dialect '{}'", config.dialect),
        })?;

        Ok(Self {
            strategy: config.strategy,
            ast,
            lexical: LexicalExtractor::new(&config.keywords),
        })
    }

    /// The strategy this extractor was built with.
    #[must_use]
    pub fn strategy(&self) -> ExtractorStrategy {
        self.strategy
    }

    /// Extracts usage, reporting analyzer faults as an error.
    ///
    /// # Errors
    ///
    /// Returns `ExtractionError::Panicked` if the underlying analyzer panicked.
    pub fn try_extract(&self, sql: &str) -> Result<SqlUsage, ExtractionError> {
        panic::catch_unwind(AssertUnwindSafe(|| self.extract_unguarded(sql))).map_err(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            ExtractionError::Panicked(message)
        })
    }

    /// Extracts usage, returning an empty result on any fault.
    #[must_use]
    pub fn extract(&self, sql: &str) -> SqlUsage {
        match self.try_extract(sql) {
            Ok(usage) => usage,
            Err(err) => {
                warn!(error = %err, "SQL extraction failed, returning empty usage");
                SqlUsage::default()
            }
        }
    }

    fn extract_unguarded(&self, sql: &str) -> SqlUsage {
        let mut usage = match self.strategy {
            ExtractorStrategy::Ast => self
                .ast
                .extract(sql)
                .unwrap_or_else(|| self.lexical.extract(sql)),
            ExtractorStrategy::Lexical => self.lexical.extract(sql),
        };
        usage.query_type = lexical::classify(&lexical::normalize(sql));
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn extractor(strategy: ExtractorStrategy) -> Extractor {
        Extractor::new(&ExtractorConfig {
            strategy,
            ..ExtractorConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn strategy_parses() {
        assert_eq!("AST".parse::<ExtractorStrategy>(), Ok(ExtractorStrategy::Ast));
        assert_eq!(
            " lexical ".parse::<ExtractorStrategy>(),
            Ok(ExtractorStrategy::Lexical)
        );
        assert!("regex".parse::<ExtractorStrategy>().is_err());
    }

    #[test]
    fn unknown_dialect_is_config_error() {
        let config = ExtractorConfig {
            dialect: "cobol".to_string(),
            ..ExtractorConfig::default()
        };
        assert!(Extractor::new(&config).is_err());
    }

    #[test]
    fn simple_select_with_both_strategies() {
        for strategy in [ExtractorStrategy::Ast, ExtractorStrategy::Lexical] {
            let usage = extractor(strategy).extract("select a,b from t");
            assert_eq!(usage.tables, vec!["t"], "{strategy:?}");
            assert_eq!(usage.columns, vec!["a", "b"], "{strategy:?}");
            assert_eq!(usage.query_type, QueryType::Select);
        }
    }

    #[test]
    fn ast_falls_back_to_lexical_on_dml() {
        let usage = extractor(ExtractorStrategy::Ast)
            .extract("INSERT INTO orders (id, total) VALUES (1, 20)");
        assert_eq!(usage.query_type, QueryType::Insert);
        assert_eq!(usage.tables, vec!["orders"]);
        assert_eq!(usage.columns, vec!["id", "total"]);
    }

    #[test]
    fn ast_falls_back_to_lexical_on_parse_error() {
        let usage = extractor(ExtractorStrategy::Ast).extract("select a from t where");
        assert_eq!(usage.tables, vec!["t"]);
        assert!(usage.columns.contains(&"a".to_string()));
    }

    #[test]
    fn malformed_input_yields_empty_usage() {
        for strategy in [ExtractorStrategy::Ast, ExtractorStrategy::Lexical] {
            let extractor = extractor(strategy);
            assert!(extractor.extract("select * from").is_empty(), "{strategy:?}");
            assert!(extractor.extract("").is_empty(), "{strategy:?}");
            assert!(extractor.extract("   \n\t ").is_empty(), "{strategy:?}");
        }
    }

    #[test]
    fn extraction_is_deterministic() {
        let sql = "select u.id, o.total from users u join orders o on u.id = o.user_id where o.total > 10";
        for strategy in [ExtractorStrategy::Ast, ExtractorStrategy::Lexical] {
            let extractor = extractor(strategy);
            assert_eq!(extractor.extract(sql), extractor.extract(sql));
        }
    }

    #[test]
    fn try_extract_succeeds_on_valid_input() {
        let result = extractor(ExtractorStrategy::Ast).try_extract("select 1");
        assert!(result.is_ok());
    }

    #[test]
    fn oversized_query_falls_back_to_lexical() {
        let predicates: Vec<String> = (0..20_000).map(|i| format!("a = {i}")).collect();
        let sql = format!("select a from t where {}", predicates.join(" or "));

        let usage = extractor(ExtractorStrategy::Ast)
            .try_extract(&sql)
            .unwrap();
        assert_eq!(usage.query_type, QueryType::Select);
        assert_eq!(usage.tables, vec!["t"]);
        assert_eq!(usage.columns, vec!["a"]);
    }

    #[test]
    fn usage_dedups_case_sensitively() {
        let mut usage = SqlUsage::default();
        usage.add_column("Name");
        usage.add_column("name");
        usage.add_column("name");
        usage.add_column("  ");
        assert_eq!(usage.columns, vec!["Name", "name"]);
    }

    #[test]
    fn alias_registers_as_table() {
        let mut usage = SqlUsage::default();
        usage.add_table("test");
        usage.add_alias("t", "test");
        assert_eq!(usage.tables, vec!["test", "t"]);
        assert_eq!(usage.aliases.get("t"), Some(&"test".to_string()));
    }

    #[test]
    fn query_type_display() {
        assert_eq!(QueryType::Select.to_string(), "SELECT");
        assert_eq!(QueryType::Unknown.to_string(), "UNKNOWN");
    }

    proptest! {
        #[test]
        fn arbitrary_text_never_faults(sql in any::<String>()) {
            for strategy in [ExtractorStrategy::Ast, ExtractorStrategy::Lexical] {
                let extractor = extractor(strategy);
                let first = extractor.try_extract(&sql);
                prop_assert!(first.is_ok(), "{:?} faulted: {:?}", strategy, first);
                prop_assert_eq!(first.ok(), extractor.try_extract(&sql).ok());
                prop_assert_eq!(extractor.extract(&sql), extractor.extract(&sql));
            }
        }

        #[test]
        fn arbitrary_bytes_never_fault(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let sql = String::from_utf8_lossy(&bytes);
            for strategy in [ExtractorStrategy::Ast, ExtractorStrategy::Lexical] {
                let extractor = extractor(strategy);
                let first = extractor.try_extract(&sql);
                prop_assert!(first.is_ok(), "{:?} faulted: {:?}", strategy, first);
                prop_assert_eq!(first.ok(), extractor.try_extract(&sql).ok());
            }
        }
    }
}
