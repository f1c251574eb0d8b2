//! Minimal record store used by the database driver and the job tracker.
//!
//! Rows are JSON maps. Only scalar values are stored; objects and arrays are
//! serialized to text by the caller.

mod memory;
mod sql;

pub use memory::MemoryRecordStore;
pub use sql::{connect_pool, SqlRecordStore};

use crate::error::JobResult;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// A table row.
pub type Row = Map<String, Value>;

/// Comparison operator in a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    /// SQL spelling.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Ne => "<>",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
        }
    }

    /// Applies the operator to an ordering result. `None` never matches.
    pub fn matches(&self, ordering: Option<Ordering>) -> bool {
        let Some(ordering) = ordering else {
            return false;
        };
        match self {
            Op::Eq => ordering == Ordering::Equal,
            Op::Ne => ordering != Ordering::Equal,
            Op::Lt => ordering == Ordering::Less,
            Op::Le => ordering != Ordering::Greater,
            Op::Gt => ordering == Ordering::Greater,
            Op::Ge => ordering != Ordering::Less,
        }
    }
}

/// A single `column op value` condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: Op,
    pub value: Value,
}

/// Selection over one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<String>,
    pub limit: Option<usize>,
}

impl Query {
    /// Selects every row of `table`.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    /// Adds a condition. Conditions are combined with AND.
    pub fn filter(mut self, column: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            column: column.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// Shorthand for an equality filter.
    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(column, Op::Eq, value)
    }

    /// Orders ascending by `column`.
    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by = Some(column.into());
        self
    }

    /// Caps the number of rows returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Storage contract for job rows.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Returns rows matching the query.
    async fn get(&self, query: &Query) -> JobResult<Vec<Row>>;

    /// Returns the first matching row.
    async fn first(&self, query: &Query) -> JobResult<Option<Row>> {
        let rows = self.get(&query.clone().limit(1)).await?;
        Ok(rows.into_iter().next())
    }

    /// Inserts a row and returns its `id`.
    async fn create(&self, table: &str, row: Row) -> JobResult<i64>;

    /// Applies `changes` to matching rows. Returns rows affected.
    async fn update(&self, query: &Query, changes: Row) -> JobResult<u64>;

    /// Deletes matching rows. Returns rows affected.
    async fn delete(&self, query: &Query) -> JobResult<u64>;

    /// Counts matching rows.
    async fn count(&self, query: &Query) -> JobResult<u64> {
        Ok(self.get(query).await?.len() as u64)
    }
}

/// Orders two scalar values. Numbers compare numerically, strings
/// lexically, null only equals null.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
