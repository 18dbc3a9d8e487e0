//! Syntax-tree based extraction.
//!
//! Query text is parsed with `sqlparser` for the configured dialect, then
//! lowered into [`SqlNode`], a small tagged tree that keeps only the node
//! kinds usage extraction cares about. [`walk`] pattern-matches over it:
//!
//! - a table reference adds `schema.table` (or `table`) and, when aliased,
//!   the alias as one more table entry
//! - a qualified column adds `table.column`
//! - a bare identifier adds a column unless its parent is a table or a
//!   qualified column
//!
//! Anything else lowers to [`SqlNode::Other`] and is skipped. Statements other
//! than queries are not lowered at all; the caller falls back to the lexical
//! strategy for them. The same happens to text longer than [`MAX_PARSE_LEN`]
//! and to trees nested deeper than [`MAX_DEPTH`], so neither the parser nor
//! [`walk`] recurses without bound.

use sqlparser::ast::{
    Expr, Join, JoinConstraint, JoinOperator, ObjectName, Query, Select, SelectItem, SetExpr,
    Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::dialect_from_str;
use sqlparser::parser::Parser;
use tracing::debug;

use super::SqlUsage;

/// Longest query text handed to the parser, in bytes.
pub const MAX_PARSE_LEN: usize = 64 * 1024;

/// Deepest lowered tree; anything deeper is left to the lexical strategy.
pub const MAX_DEPTH: usize = 512;

/// The subset of a SQL syntax tree that usage extraction walks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlNode {
    /// A query; descends into its body.
    Select(Box<SqlNode>),
    /// A SELECT body.
    SelectQuery {
        from: Vec<SqlNode>,
        selection: Option<Box<SqlNode>>,
        projection: Vec<SqlNode>,
    },
    /// One projected expression.
    SelectItem(Box<SqlNode>),
    Table {
        schema: Option<String>,
        name: String,
        alias: Option<String>,
    },
    /// A qualified column such as `t.name`.
    Property { table: String, name: String },
    Identifier(String),
    Join {
        left: Box<SqlNode>,
        right: Box<SqlNode>,
        condition: Option<Box<SqlNode>>,
    },
    Binary {
        left: Box<SqlNode>,
        right: Box<SqlNode>,
    },
    /// Siblings with no structure of their own (set operations, CTEs, IN lists).
    List(Vec<SqlNode>),
    Other,
}

/// Extractor backed by `sqlparser`.
#[derive(Debug, Clone)]
pub struct AstExtractor {
    dialect: String,
}

impl AstExtractor {
    /// Returns `None` if `dialect` is not a known parser dialect.
    #[must_use]
    pub fn new(dialect: &str) -> Option<Self> {
        dialect_from_str(dialect)?;
        Some(Self {
            dialect: dialect.to_string(),
        })
    }

    /// Parses and walks `sql`.
    ///
    /// Returns `None` when the text does not parse or contains a statement
    /// that is not a query.
    #[must_use]
    pub fn extract(&self, sql: &str) -> Option<SqlUsage> {
        let nodes = self.lower(sql)?;
        let mut usage = SqlUsage::default();
        for node in &nodes {
            walk(node, None, &mut usage);
        }
        Some(usage)
    }

    /// Parses `sql` into lowered statement trees.
    ///
    /// Returns `None` for text over [`MAX_PARSE_LEN`] without parsing it.
    #[must_use]
    pub fn lower(&self, sql: &str) -> Option<Vec<SqlNode>> {
        if sql.len() > MAX_PARSE_LEN {
            debug!(len = sql.len(), "Query too long to parse");
            return None;
        }
        let dialect = dialect_from_str(&self.dialect)?;
        let statements = match Parser::parse_sql(dialect.as_ref(), sql) {
            Ok(statements) => statements,
            Err(err) => {
                debug!(error = %err, "SQL parse failed");
                return None;
            }
        };

        let lowered: Option<Vec<SqlNode>> = statements.iter().map(lower_statement).collect();
        if lowered.is_none() {
            debug!("Statement not lowered");
        }
        lowered
    }
}

/// Records the usage facts of `node` and its children into `usage`.
pub fn walk(node: &SqlNode, parent: Option<&SqlNode>, usage: &mut SqlUsage) {
    match node {
        SqlNode::Table {
            schema,
            name,
            alias,
        } => {
            let table = match schema {
                Some(schema) => format!("{schema}.{name}"),
                None => name.clone(),
            };
            usage.add_table(table.clone());
            if let Some(alias) = alias {
                usage.add_alias(alias.clone(), table);
            }
        }
        SqlNode::Property { table, name } => {
            usage.add_column(format!("{table}.{name}"));
        }
        SqlNode::Identifier(value) => {
            let owned_by_name = matches!(
                parent,
                Some(SqlNode::Table { .. }) | Some(SqlNode::Property { .. })
            );
            if !owned_by_name {
                usage.add_column(value.clone());
            }
        }
        SqlNode::Select(body) | SqlNode::SelectItem(body) => walk(body, Some(node), usage),
        SqlNode::SelectQuery {
            from,
            selection,
            projection,
        } => {
            for table in from {
                walk(table, Some(node), usage);
            }
            if let Some(selection) = selection {
                walk(selection, Some(node), usage);
            }
            for item in projection {
                walk(item, Some(node), usage);
            }
        }
        SqlNode::Join {
            left,
            right,
            condition,
        } => {
            walk(left, Some(node), usage);
            walk(right, Some(node), usage);
            if let Some(condition) = condition {
                walk(condition, Some(node), usage);
            }
        }
        SqlNode::Binary { left, right } => {
            walk(left, Some(node), usage);
            walk(right, Some(node), usage);
        }
        SqlNode::List(children) => {
            for child in children {
                walk(child, Some(node), usage);
            }
        }
        SqlNode::Other => {}
    }
}

fn lower_statement(statement: &Statement) -> Option<SqlNode> {
    match statement {
        Statement::Query(query) => lower_query(query, 0),
        _ => None,
    }
}

/// Next depth, or `None` once [`MAX_DEPTH`] is reached.
fn descend(depth: usize) -> Option<usize> {
    (depth < MAX_DEPTH).then_some(depth + 1)
}

fn lower_query(query: &Query, depth: usize) -> Option<SqlNode> {
    let depth = descend(depth)?;
    let body = lower_set_expr(&query.body, depth)?;
    let ctes = query
        .with
        .iter()
        .flat_map(|with| with.cte_tables.iter())
        .map(|cte| lower_query(&cte.query, depth))
        .collect::<Option<Vec<SqlNode>>>()?;

    if ctes.is_empty() {
        Some(SqlNode::Select(Box::new(body)))
    } else {
        let mut children = ctes;
        children.push(body);
        Some(SqlNode::Select(Box::new(SqlNode::List(children))))
    }
}

fn lower_set_expr(body: &SetExpr, depth: usize) -> Option<SqlNode> {
    let depth = descend(depth)?;
    match body {
        SetExpr::Select(select) => lower_select(select, depth),
        SetExpr::Query(query) => lower_query(query, depth),
        SetExpr::SetOperation { left, right, .. } => Some(SqlNode::List(vec![
            lower_set_expr(left, depth)?,
            lower_set_expr(right, depth)?,
        ])),
        _ => Some(SqlNode::Other),
    }
}

fn lower_select(select: &Select, depth: usize) -> Option<SqlNode> {
    let depth = descend(depth)?;
    Some(SqlNode::SelectQuery {
        from: select
            .from
            .iter()
            .map(|table| lower_table_with_joins(table, depth))
            .collect::<Option<_>>()?,
        selection: match select.selection.as_ref() {
            Some(expr) => Some(Box::new(lower_expr(expr, depth)?)),
            None => None,
        },
        projection: select
            .projection
            .iter()
            .map(|item| lower_select_item(item, depth))
            .collect::<Option<_>>()?,
    })
}

fn lower_select_item(item: &SelectItem, depth: usize) -> Option<SqlNode> {
    match item {
        SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
            Some(SqlNode::SelectItem(Box::new(lower_expr(expr, descend(depth)?)?)))
        }
        _ => Some(SqlNode::Other),
    }
}

fn lower_table_with_joins(table: &TableWithJoins, depth: usize) -> Option<SqlNode> {
    // Joins nest to the left, one level each.
    let mut depth = descend(depth)?;
    let mut node = lower_table_factor(&table.relation, depth)?;
    for join in &table.joins {
        depth = descend(depth)?;
        node = lower_join(node, join, depth)?;
    }
    Some(node)
}

fn lower_join(left: SqlNode, join: &Join, depth: usize) -> Option<SqlNode> {
    let constraint = match &join.join_operator {
        JoinOperator::Inner(constraint)
        | JoinOperator::LeftOuter(constraint)
        | JoinOperator::RightOuter(constraint)
        | JoinOperator::FullOuter(constraint)
        | JoinOperator::LeftSemi(constraint)
        | JoinOperator::RightSemi(constraint)
        | JoinOperator::LeftAnti(constraint)
        | JoinOperator::RightAnti(constraint) => Some(constraint),
        _ => None,
    };
    let condition = match constraint {
        Some(JoinConstraint::On(expr)) => Some(Box::new(lower_expr(expr, depth)?)),
        _ => None,
    };

    Some(SqlNode::Join {
        left: Box::new(left),
        right: Box::new(lower_table_factor(&join.relation, depth)?),
        condition,
    })
}

fn lower_table_factor(factor: &TableFactor, depth: usize) -> Option<SqlNode> {
    let depth = descend(depth)?;
    match factor {
        TableFactor::Table { name, alias, .. } => {
            let (schema, name) = split_object_name(name);
            Some(SqlNode::Table {
                schema,
                name,
                alias: alias.as_ref().map(|alias| alias.name.value.clone()),
            })
        }
        TableFactor::Derived { subquery, .. } => lower_query(subquery, depth),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => lower_table_with_joins(table_with_joins, depth),
        _ => Some(SqlNode::Other),
    }
}

fn split_object_name(name: &ObjectName) -> (Option<String>, String) {
    let mut parts: Vec<String> = name.0.iter().map(|ident| ident.value.clone()).collect();
    let table = parts.pop().unwrap_or_default();
    let schema = (!parts.is_empty()).then(|| parts.join("."));
    (schema, table)
}

fn lower_expr(expr: &Expr, depth: usize) -> Option<SqlNode> {
    let depth = descend(depth)?;
    let node = match expr {
        Expr::Identifier(ident) => SqlNode::Identifier(ident.value.clone()),
        Expr::CompoundIdentifier(idents) => match idents.split_last() {
            Some((name, qualifier)) if !qualifier.is_empty() => SqlNode::Property {
                table: qualifier
                    .iter()
                    .map(|ident| ident.value.as_str())
                    .collect::<Vec<_>>()
                    .join("."),
                name: name.value.clone(),
            },
            Some((name, _)) => SqlNode::Identifier(name.value.clone()),
            None => SqlNode::Other,
        },
        Expr::BinaryOp { left, right, .. } => SqlNode::Binary {
            left: Box::new(lower_expr(left, depth)?),
            right: Box::new(lower_expr(right, depth)?),
        },
        Expr::Nested(inner)
        | Expr::UnaryOp { expr: inner, .. }
        | Expr::IsNull(inner)
        | Expr::IsNotNull(inner) => lower_expr(inner, depth)?,
        Expr::Between {
            expr, low, high, ..
        } => SqlNode::List(vec![
            lower_expr(expr, depth)?,
            lower_expr(low, depth)?,
            lower_expr(high, depth)?,
        ]),
        Expr::InList { expr, list, .. } => {
            let mut children = vec![lower_expr(expr, depth)?];
            for item in list {
                children.push(lower_expr(item, depth)?);
            }
            SqlNode::List(children)
        }
        Expr::InSubquery { expr, subquery, .. } => SqlNode::Binary {
            left: Box::new(lower_expr(expr, depth)?),
            right: Box::new(lower_query(subquery, depth)?),
        },
        Expr::Subquery(query) | Expr::Exists { subquery: query, .. } => {
            lower_query(query, depth)?
        }
        _ => SqlNode::Other,
    };
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(sql: &str) -> SqlUsage {
        AstExtractor::new("postgres")
            .unwrap()
            .extract(sql)
            .expect("query should parse")
    }

    #[test]
    fn unknown_dialect_rejected() {
        assert!(AstExtractor::new("klingon").is_none());
    }

    #[test]
    fn aliased_table_adds_alias_entry() {
        let usage = extract("select id AS bid, t.NAME testName from test t");
        assert_eq!(usage.tables, vec!["test", "t"]);
        assert_eq!(usage.columns, vec!["id", "t.NAME"]);
        assert_eq!(usage.aliases.get("t"), Some(&"test".to_string()));
    }

    #[test]
    fn schema_qualified_table() {
        let usage = extract("select amount from billing.invoices");
        assert_eq!(usage.tables, vec!["billing.invoices"]);
        assert_eq!(usage.columns, vec!["amount"]);
    }

    #[test]
    fn join_walks_both_sides_and_condition() {
        let usage = extract(
            "select u.name, o.total from users u join orders o on u.id = o.user_id where o.total > 10",
        );
        assert_eq!(usage.tables, vec!["users", "u", "orders", "o"]);
        // FROM (join condition) first, then WHERE, then the projection
        assert_eq!(
            usage.columns,
            vec!["u.id", "o.user_id", "o.total", "u.name"]
        );
    }

    #[test]
    fn where_clause_identifiers_are_columns() {
        let usage = extract("select a from t where b = 1 and c is null");
        assert_eq!(usage.columns, vec!["b", "c", "a"]);
    }

    #[test]
    fn literals_and_wildcards_are_skipped() {
        let usage = extract("select *, 1, 'x' from t");
        assert_eq!(usage.tables, vec!["t"]);
        assert!(usage.columns.is_empty());
    }

    #[test]
    fn subqueries_are_walked() {
        let usage = extract("select a from t where b in (select c from s)");
        assert_eq!(usage.tables, vec!["t", "s"]);
        assert_eq!(usage.columns, vec!["b", "c", "a"]);
    }

    #[test]
    fn union_walks_both_sides() {
        let usage = extract("select a from t union select b from s");
        assert_eq!(usage.tables, vec!["t", "s"]);
        assert_eq!(usage.columns, vec!["a", "b"]);
    }

    #[test]
    fn cte_is_walked() {
        let usage = extract("with recent as (select id from events) select id from recent");
        assert_eq!(usage.tables, vec!["events", "recent"]);
        assert_eq!(usage.columns, vec!["id"]);
    }

    #[test]
    fn quoted_identifiers_keep_case() {
        let usage = extract("select \"UserName\" from \"Accounts\"");
        assert_eq!(usage.tables, vec!["Accounts"]);
        assert_eq!(usage.columns, vec!["UserName"]);
    }

    #[test]
    fn dml_is_not_lowered() {
        let extractor = AstExtractor::new("postgres").unwrap();
        assert!(extractor.extract("update t set a = 1").is_none());
    }

    #[test]
    fn parse_error_returns_none() {
        let extractor = AstExtractor::new("postgres").unwrap();
        assert!(extractor.extract("select * from").is_none());
    }

    #[test]
    fn empty_text_yields_empty_usage() {
        let usage = extract("");
        assert!(usage.is_empty());
    }

    fn or_chain(terms: usize) -> String {
        let predicates: Vec<String> = (0..terms).map(|i| format!("a = {i}")).collect();
        format!("select a from t where {}", predicates.join(" or "))
    }

    #[test]
    fn long_or_chain_is_not_parsed() {
        let sql = or_chain(20_000);
        assert!(sql.len() > MAX_PARSE_LEN);

        let extractor = AstExtractor::new("postgres").unwrap();
        assert!(extractor.lower(&sql).is_none());
    }

    #[test]
    fn deep_expression_is_not_lowered() {
        let sql = or_chain(2_000);
        assert!(sql.len() <= MAX_PARSE_LEN);

        let extractor = AstExtractor::new("postgres").unwrap();
        assert!(extractor.extract(&sql).is_none());
    }

    #[test]
    fn moderate_or_chain_is_lowered() {
        let usage = extract(&or_chain(100));
        assert_eq!(usage.tables, vec!["t"]);
        assert_eq!(usage.columns, vec!["a"]);
    }

    #[test]
    fn identifier_under_table_is_not_a_column() {
        let table = SqlNode::Table {
            schema: None,
            name: "t".to_string(),
            alias: None,
        };
        let mut usage = SqlUsage::default();
        walk(&SqlNode::Identifier("t".to_string()), Some(&table), &mut usage);
        assert!(usage.columns.is_empty());

        walk(&SqlNode::Identifier("a".to_string()), None, &mut usage);
        assert_eq!(usage.columns, vec!["a"]);
    }

    #[test]
    fn lowering_shape_of_simple_select() {
        let extractor = AstExtractor::new("generic").unwrap();
        let nodes = extractor.lower("select a from t").unwrap();
        assert_eq!(
            nodes,
            vec![SqlNode::Select(Box::new(SqlNode::SelectQuery {
                from: vec![SqlNode::Table {
                    schema: None,
                    name: "t".to_string(),
                    alias: None,
                }],
                selection: None,
                projection: vec![SqlNode::SelectItem(Box::new(SqlNode::Identifier(
                    "a".to_string()
                )))],
            }))]
        );
    }
}
