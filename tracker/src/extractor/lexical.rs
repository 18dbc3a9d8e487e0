//! Pattern-based extraction over normalized query text.
//!
//! No parser is involved: comments are stripped, whitespace is collapsed and
//! the text is lowercased, then a handful of regular expressions pick out
//! table names (after `from`, `join`, `update`, `into`) and column tokens
//! (SELECT projection, WHERE / GROUP BY / HAVING / ORDER BY, the INSERT
//! column list, the UPDATE SET clause). Candidate columns are dropped when
//! they are keywords or integer literals.
//!
//! Precision is traded for robustness: any input, however malformed, yields
//! some usage or none, never a fault.

use std::collections::HashSet;

use regex_lite::Regex;

use super::{QueryType, SqlUsage};

/// Regex-driven extractor. Compiled once per [`super::Extractor`].
#[derive(Debug)]
pub struct LexicalExtractor {
    keywords: HashSet<String>,
    table: Regex,
    insert_target: Regex,
    projection: Regex,
    clause: Regex,
    values: Regex,
    insert_columns: Regex,
    set_clause: Regex,
    projection_alias: Regex,
    string_literal: Regex,
    column_token: Regex,
}

impl LexicalExtractor {
    /// Builds the extractor with the given keyword denylist.
    #[must_use]
    pub fn new(keywords: &[String]) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            table: compile(r"\b(?:from|join|update|into)\s+([^\s,(]+)"),
            insert_target: compile(r"^insert\s+into\s+([^\s(]+)"),
            projection: compile(r"^select\s+(.*?)\s+from\b"),
            clause: compile(r"\b(?:where|group by|having|order by)\s+([^)]+)"),
            values: compile(r"\bvalues\s*\("),
            insert_columns: compile(r"^insert\s+into\s+[^\s(]+\s*\(([^)]+)"),
            set_clause: compile(r"\bset\s+(.*?)(?:\s+where\s|$)"),
            projection_alias: compile(r"\bas\s+\w+"),
            string_literal: compile(r"'[^']*'"),
            column_token: compile(r"(?:[\w.]+\.)?(\w+)(?:\s*=\s*(?:[\w.]+\.)?\w+)?"),
        }
    }

    /// Extracts best-effort usage from `sql`.
    #[must_use]
    pub fn extract(&self, sql: &str) -> SqlUsage {
        let sql = normalize(sql);
        let mut usage = SqlUsage {
            query_type: classify(&sql),
            ..SqlUsage::default()
        };
        if sql.is_empty() {
            return usage;
        }

        self.extract_tables(&sql, &mut usage);
        self.extract_columns(&sql, &mut usage);
        usage
    }

    fn extract_tables(&self, sql: &str, usage: &mut SqlUsage) {
        for captures in self.table.captures_iter(sql) {
            if let Some(table) = captures.get(1) {
                self.accept_table(table.as_str(), usage);
            }
        }

        if usage.query_type == QueryType::Insert {
            if let Some(table) = self.insert_target.captures(sql).and_then(|c| c.get(1)) {
                self.accept_table(table.as_str(), usage);
            }
        }
    }

    fn accept_table(&self, token: &str, usage: &mut SqlUsage) {
        let table = token.trim_end_matches([';', ')']);
        if !table.is_empty() && !self.keywords.contains(table) {
            usage.add_table(table);
        }
    }

    fn extract_columns(&self, sql: &str, usage: &mut SqlUsage) {
        let sql = self.string_literal.replace_all(sql, " ");

        if usage.query_type == QueryType::Select {
            if let Some(projection) = self.projection.captures(&sql).and_then(|c| c.get(1)) {
                let projection = self.projection_alias.replace_all(projection.as_str(), " ");
                self.extract_column_tokens(&projection, usage);
            }
        }

        for captures in self.clause.captures_iter(&sql) {
            if let Some(part) = captures.get(1) {
                self.extract_column_tokens(part.as_str(), usage);
            }
        }

        if usage.query_type == QueryType::Insert && self.values.is_match(&sql) {
            if let Some(columns) = self.insert_columns.captures(&sql).and_then(|c| c.get(1)) {
                self.extract_column_tokens(columns.as_str(), usage);
            }
        }

        if usage.query_type == QueryType::Update {
            if let Some(assignments) = self.set_clause.captures(&sql).and_then(|c| c.get(1)) {
                self.extract_column_tokens(assignments.as_str(), usage);
            }
        }
    }

    fn extract_column_tokens(&self, part: &str, usage: &mut SqlUsage) {
        for captures in self.column_token.captures_iter(part) {
            let Some(column) = captures.get(1).map(|m| m.as_str()) else {
                continue;
            };
            if self.keywords.contains(column) || column.parse::<i64>().is_ok() {
                continue;
            }
            usage.add_column(column);
        }
    }
}

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("built-in extraction pattern must compile")
}

/// Strips comments, collapses whitespace and lowercases `sql`.
#[must_use]
pub fn normalize(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '-' if chars.peek() == Some(&'-') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                }
                out.push(' ');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for next in chars.by_ref() {
                    if previous == '*' && next == '/' {
                        break;
                    }
                    previous = next;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }

    out.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Classifies normalized text by its leading keyword.
#[must_use]
pub fn classify(normalized: &str) -> QueryType {
    if normalized.starts_with("select") {
        QueryType::Select
    } else if normalized.starts_with("insert") {
        QueryType::Insert
    } else if normalized.starts_with("update") {
        QueryType::Update
    } else if normalized.starts_with("delete") {
        QueryType::Delete
    } else {
        QueryType::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::DEFAULT_KEYWORDS;

    fn extractor() -> LexicalExtractor {
        let keywords: Vec<String> = DEFAULT_KEYWORDS.iter().map(|k| (*k).to_string()).collect();
        LexicalExtractor::new(&keywords)
    }

    #[test]
    fn normalize_strips_comments_and_whitespace() {
        let sql = "SELECT a, -- trailing\n  b /* block\n comment */ FROM   T";
        assert_eq!(normalize(sql), "select a, b from t");
    }

    #[test]
    fn normalize_handles_unterminated_block_comment() {
        assert_eq!(normalize("select a /* never closed"), "select a");
    }

    #[test]
    fn classify_by_leading_keyword() {
        assert_eq!(classify("select 1"), QueryType::Select);
        assert_eq!(classify("insert into t values (1)"), QueryType::Insert);
        assert_eq!(classify("update t set a = 1"), QueryType::Update);
        assert_eq!(classify("delete from t"), QueryType::Delete);
        assert_eq!(classify("vacuum"), QueryType::Unknown);
    }

    #[test]
    fn select_projection_and_table() {
        let usage = extractor().extract("select a,b from t");
        assert_eq!(usage.tables, vec!["t"]);
        assert_eq!(usage.columns, vec!["a", "b"]);
    }

    #[test]
    fn table_alias_is_dropped() {
        let usage = extractor().extract("SELECT u.name FROM users u JOIN orders AS o ON u.id = o.user_id");
        assert_eq!(usage.tables, vec!["users", "orders"]);
        assert_eq!(usage.columns, vec!["name"]);
    }

    #[test]
    fn where_group_order_columns() {
        let usage = extractor()
            .extract("select count(*) from t where status = 'open' and age > 30 group by region order by region desc");
        assert_eq!(usage.tables, vec!["t"]);
        assert_eq!(usage.columns, vec!["status", "age", "region"]);
    }

    #[test]
    fn projection_aliases_are_not_columns() {
        let usage = extractor().extract("select price as p, qty from items");
        assert_eq!(usage.columns, vec!["price", "qty"]);
    }

    #[test]
    fn insert_columns_before_values() {
        let usage = extractor().extract("insert into orders (id, total) values (1, 20)");
        assert_eq!(usage.query_type, QueryType::Insert);
        assert_eq!(usage.tables, vec!["orders"]);
        assert_eq!(usage.columns, vec!["id", "total"]);
    }

    #[test]
    fn update_set_clause() {
        let usage = extractor().extract("UPDATE accounts SET balance = 10, note = 'x' WHERE id = 5");
        assert_eq!(usage.query_type, QueryType::Update);
        assert_eq!(usage.tables, vec!["accounts"]);
        assert_eq!(usage.columns, vec!["id", "balance", "note"]);
    }

    #[test]
    fn delete_from_table() {
        let usage = extractor().extract("delete from sessions where expires_at < now()");
        assert_eq!(usage.query_type, QueryType::Delete);
        assert_eq!(usage.tables, vec!["sessions"]);
        assert_eq!(usage.columns, vec!["expires_at", "now"]);
    }

    #[test]
    fn trailing_semicolon_is_trimmed() {
        let usage = extractor().extract("select a from t;");
        assert_eq!(usage.tables, vec!["t"]);
    }

    #[test]
    fn integer_literals_are_not_columns() {
        let usage = extractor().extract("select a from t where b = 42 or 7 = c");
        assert!(!usage.columns.iter().any(|c| c == "42" || c == "7"));
    }

    #[test]
    fn malformed_inputs_never_panic() {
        let extractor = extractor();
        for sql in [
            "select * from",
            "",
            "from",
            "((((",
            "insert into",
            "update set where",
            "select 'unterminated from t",
            "\u{0}\u{1}\u{fffd}",
        ] {
            let _ = extractor.extract(sql);
        }
        assert!(extractor.extract("select * from").is_empty());
    }
}
