//! Sampling statements and their parsing
//!
//! Downsampling strategies push random sampling down to the metadata store
//! when it advertises [`crate::metadata::StoreCapabilities::sql_pushdown`].
//! The strategy renders a [`SampleStatement`] to SQL; the store parses it back
//! with [`QueryEngine`] and evaluates the resulting [`QueryPlan`].
//!
//! ## Supported SQL Subset
//!
//! - SELECT with column list or *
//! - FROM single table (no JOINs)
//! - WHERE with conjunctions of `column op literal` (>, <, =, >=, <=, !=)
//! - ORDER BY `RANDOM()` (required; a plan is always a uniform random draw)
//! - LIMIT
//!
//! References:
//! - sqlparser-rs: <https://docs.rs/sqlparser>

pub mod executor;

pub use executor::QueryExecutor;

use crate::metadata::{EligibleFilter, PipelineId, SAMPLE_TABLE};
use sqlparser::ast::{
    BinaryOperator, Expr, Query, Select, SelectItem, SetExpr, Statement, UnaryOperator, Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::fmt;

/// Comparison operator of a WHERE predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `!=` / `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
}

impl CompareOp {
    /// Evaluate the operator on two ordered values
    #[must_use]
    pub fn eval<T: PartialOrd>(self, left: &T, right: &T) -> bool {
        match self {
            Self::Eq => left == right,
            Self::NotEq => left != right,
            Self::Lt => left < right,
            Self::LtEq => left <= right,
            Self::Gt => left > right,
            Self::GtEq => left >= right,
        }
    }
}

/// Literal on the right-hand side of a predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Literal {
    /// Integer literal
    Int(i64),
    /// Boolean literal
    Bool(bool),
}

/// `column op literal`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    /// Column name
    pub column: String,
    /// Comparison operator
    pub op: CompareOp,
    /// Right-hand literal
    pub value: Literal,
}

/// Parsed SQL query with extracted components
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    /// Selected columns (or * for all)
    pub columns: Vec<String>,
    /// Table name
    pub table: String,
    /// Conjunction of WHERE predicates
    pub predicates: Vec<Predicate>,
    /// Sample size (all matching rows when absent)
    pub limit: Option<usize>,
}

/// Builder for the random-sample statement of one trigger.
///
/// ```
/// use trueno_select::metadata::EligibleFilter;
/// use trueno_select::query::SampleStatement;
///
/// let stmt = SampleStatement::new(3, EligibleFilter::unused(42)).limit(5);
/// assert_eq!(
///     stmt.to_string(),
///     "SELECT * FROM selector_state_metadata \
///      WHERE pipeline_id = 3 AND seq < 42 AND used = false ORDER BY RANDOM() LIMIT 5"
/// );
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleStatement {
    pipeline_id: PipelineId,
    filter: EligibleFilter,
    limit: Option<usize>,
}

impl SampleStatement {
    /// Sample from the records of `pipeline_id` matching `filter`
    #[must_use]
    pub const fn new(pipeline_id: PipelineId, filter: EligibleFilter) -> Self {
        Self {
            pipeline_id,
            filter,
            limit: None,
        }
    }

    /// Bound the sample size
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl fmt::Display for SampleStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SELECT * FROM {SAMPLE_TABLE} \
             WHERE pipeline_id = {} AND seq < {}",
            self.pipeline_id, self.filter.high_watermark
        )?;
        if self.filter.only_unused {
            f.write_str(" AND used = false")?;
        }
        f.write_str(" ORDER BY RANDOM()")?;
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        Ok(())
    }
}

/// Query parser
pub struct QueryEngine {
    dialect: GenericDialect,
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryEngine {
    /// Create a new query engine
    #[must_use]
    pub const fn new() -> Self {
        Self {
            dialect: GenericDialect {},
        }
    }

    /// Parse SQL query into query plan
    ///
    /// # Errors
    /// Returns error if:
    /// - SQL syntax is invalid
    /// - Query uses unsupported features (JOINs, OR, subqueries, etc.)
    /// - Query is not ordered by `RANDOM()`
    /// - Multiple statements provided
    ///
    /// # Example
    /// ```
    /// use trueno_select::query::QueryEngine;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let engine = QueryEngine::new();
    /// let plan = engine.parse("SELECT sample_key FROM samples WHERE seq < 10 ORDER BY RANDOM() LIMIT 3")?;
    /// assert_eq!(plan.table, "samples");
    /// assert_eq!(plan.limit, Some(3));
    /// # Ok(())
    /// # }
    /// ```
    pub fn parse(&self, sql: &str) -> crate::Result<QueryPlan> {
        let statements = Parser::parse_sql(&self.dialect, sql)
            .map_err(|e| crate::Error::ParseError(format!("{e}")))?;

        if statements.len() != 1 {
            return Err(crate::Error::ParseError(
                "Only single statements supported".to_string(),
            ));
        }

        let Statement::Query(query) = &statements[0] else {
            return Err(crate::Error::ParseError(
                "Only SELECT queries supported".to_string(),
            ));
        };

        Self::parse_select_query(query)
    }

    fn parse_select_query(query: &Query) -> crate::Result<QueryPlan> {
        let SetExpr::Select(select) = query.body.as_ref() else {
            return Err(crate::Error::ParseError(
                "Only SELECT queries supported".to_string(),
            ));
        };

        let table = Self::extract_table_name(select)?;
        let columns = Self::extract_columns(&select.projection)?;

        let mut predicates = Vec::new();
        if let Some(selection) = &select.selection {
            Self::extract_predicates(selection, &mut predicates)?;
        }

        Self::check_random_order(query.order_by.as_ref())?;
        let limit = Self::extract_limit(query.limit.as_ref())?;

        Ok(QueryPlan {
            columns,
            table,
            predicates,
            limit,
        })
    }

    fn extract_table_name(select: &Select) -> crate::Result<String> {
        if select.from.len() != 1 {
            return Err(crate::Error::ParseError(
                "Exactly one table must be selected from".to_string(),
            ));
        }

        let table_with_joins = &select.from[0];
        if !table_with_joins.joins.is_empty() {
            return Err(crate::Error::ParseError("JOINs not supported".to_string()));
        }

        Ok(table_with_joins.relation.to_string())
    }

    fn extract_columns(projection: &[SelectItem]) -> crate::Result<Vec<String>> {
        projection
            .iter()
            .map(|item| match item {
                SelectItem::Wildcard(_) => Ok("*".to_string()),
                SelectItem::UnnamedExpr(Expr::Identifier(ident)) => Ok(ident.value.clone()),
                other => Err(crate::Error::ParseError(format!(
                    "Unsupported projection: {other}"
                ))),
            })
            .collect()
    }

    fn extract_predicates(expr: &Expr, out: &mut Vec<Predicate>) -> crate::Result<()> {
        match expr {
            Expr::Nested(inner) => Self::extract_predicates(inner, out),
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                Self::extract_predicates(left, out)?;
                Self::extract_predicates(right, out)
            }
            Expr::BinaryOp { left, op, right } => {
                let op = match op {
                    BinaryOperator::Eq => CompareOp::Eq,
                    BinaryOperator::NotEq => CompareOp::NotEq,
                    BinaryOperator::Lt => CompareOp::Lt,
                    BinaryOperator::LtEq => CompareOp::LtEq,
                    BinaryOperator::Gt => CompareOp::Gt,
                    BinaryOperator::GtEq => CompareOp::GtEq,
                    other => {
                        return Err(crate::Error::ParseError(format!(
                            "Unsupported operator: {other}"
                        )))
                    }
                };
                let Expr::Identifier(column) = left.as_ref() else {
                    return Err(crate::Error::ParseError(format!(
                        "Left side of predicate must be a column: {left}"
                    )));
                };
                out.push(Predicate {
                    column: column.value.clone(),
                    op,
                    value: Self::extract_literal(right)?,
                });
                Ok(())
            }
            other => Err(crate::Error::ParseError(format!(
                "Unsupported filter expression: {other}"
            ))),
        }
    }

    fn extract_literal(expr: &Expr) -> crate::Result<Literal> {
        match expr {
            Expr::Value(Value::Number(n, _)) => n
                .parse()
                .map(Literal::Int)
                .map_err(|_| crate::Error::ParseError(format!("Invalid integer literal: {n}"))),
            Expr::Value(Value::Boolean(b)) => Ok(Literal::Bool(*b)),
            Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr,
            } => match Self::extract_literal(expr)? {
                Literal::Int(n) => Ok(Literal::Int(-n)),
                Literal::Bool(_) => Err(crate::Error::ParseError(
                    "Cannot negate a boolean literal".to_string(),
                )),
            },
            other => Err(crate::Error::ParseError(format!(
                "Unsupported literal: {other}"
            ))),
        }
    }

    fn check_random_order(order_by: Option<&sqlparser::ast::OrderBy>) -> crate::Result<()> {
        let exprs = order_by.map_or(&[][..], |order_by| order_by.exprs.as_slice());
        match exprs {
            [single] => match &single.expr {
                Expr::Function(func) if func.name.to_string().eq_ignore_ascii_case("RANDOM") => {
                    Ok(())
                }
                other => Err(crate::Error::ParseError(format!(
                    "Unsupported ORDER BY expression: {other}"
                ))),
            },
            _ => Err(crate::Error::ParseError(
                "Sampling statements must ORDER BY RANDOM()".to_string(),
            )),
        }
    }

    fn extract_limit(limit: Option<&Expr>) -> crate::Result<Option<usize>> {
        match limit {
            None => Ok(None),
            Some(Expr::Value(Value::Number(n, _))) => n
                .parse()
                .map(Some)
                .map_err(|_| crate::Error::ParseError(format!("Invalid LIMIT: {n}"))),
            Some(other) => Err(crate::Error::ParseError(format!(
                "Unsupported LIMIT expression: {other}"
            ))),
        }
    }
}
