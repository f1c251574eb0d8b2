//! SQL record store over `sqlx`'s `Any` driver.

use super::{Op, Query, RecordStore, Row};
use crate::error::{JobError, JobResult};
use async_trait::async_trait;
use serde_json::{Number, Value};
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, Column, Row as _};
use std::time::Duration;
use tracing::{debug, info, warn};

type AnyQuery<'q> = sqlx::query::Query<'q, Any, AnyArguments<'q>>;

/// Opens an `Any` pool and checks it with `SELECT 1`.
pub async fn connect_pool(url: &str, max_connections: u32) -> JobResult<AnyPool> {
    info!("Connecting record store...");
    sqlx::any::install_default_drivers();

    let pool = AnyPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
        .map_err(|e| {
            warn!("Failed to connect record store: {}", e);
            JobError::Configuration(format!("Failed to connect to {}: {}", redact(url), e))
        })?;

    sqlx::query("SELECT 1").execute(&pool).await?;
    info!("Record store connection pool established");
    Ok(pool)
}

fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}***{}", &url[..scheme + 3], &url[at..]),
        _ => url.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

impl Dialect {
    fn from_url(url: &str) -> Self {
        if url.starts_with("postgres") {
            Dialect::Postgres
        } else if url.starts_with("mysql") || url.starts_with("mariadb") {
            Dialect::MySql
        } else {
            Dialect::Sqlite
        }
    }

    fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::MySql | Dialect::Sqlite => "?".to_string(),
        }
    }
}

/// Record store backed by a relational database.
///
/// Tables must exist; timestamps are stored as text. Identifiers are
/// validated, values are always bound.
#[derive(Clone)]
pub struct SqlRecordStore {
    pool: AnyPool,
    dialect: Dialect,
}

impl SqlRecordStore {
    /// Connects to `url`.
    pub async fn connect(url: &str, max_connections: u32) -> JobResult<Self> {
        let pool = connect_pool(url, max_connections).await?;
        Ok(Self::new(pool, url))
    }

    /// Wraps an existing pool. `url` selects the SQL dialect.
    pub fn new(pool: AnyPool, url: &str) -> Self {
        Self {
            pool,
            dialect: Dialect::from_url(url),
        }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    fn where_clause(&self, query: &Query, sql: &mut String, params: &mut Vec<Value>) -> JobResult<()> {
        for (i, filter) in query.filters.iter().enumerate() {
            ident(&filter.column)?;
            sql.push_str(if i == 0 { " WHERE " } else { " AND " });
            sql.push_str(&filter.column);
            match (filter.op, &filter.value) {
                (Op::Eq, Value::Null) => sql.push_str(" IS NULL"),
                (Op::Ne, Value::Null) => sql.push_str(" IS NOT NULL"),
                (op, value) => {
                    params.push(value.clone());
                    sql.push(' ');
                    sql.push_str(op.as_sql());
                    sql.push(' ');
                    sql.push_str(&self.dialect.placeholder(params.len()));
                }
            }
        }
        Ok(())
    }
}

fn ident(name: &str) -> JobResult<&str> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(JobError::Store(format!("invalid identifier: {name:?}")))
    }
}

fn bind(query: AnyQuery<'_>, value: Value) -> AnyQuery<'_> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => query.bind(s),
        other => query.bind(other.to_string()),
    }
}

fn bind_all(sql: &str, params: Vec<Value>) -> AnyQuery<'_> {
    params.into_iter().fold(sqlx::query(sql), bind)
}

fn decode_row(row: &AnyRow) -> Row {
    let mut out = Row::new();
    for column in row.columns() {
        let idx = column.ordinal();
        out.insert(column.name().to_string(), decode_column(row, idx));
    }
    out
}

fn decode_column(row: &AnyRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.and_then(Number::from_f64).map_or(Value::Null, Value::Number);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map_or(Value::Null, Value::String);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map_or(Value::Null, Value::Bool);
    }
    Value::Null
}

#[async_trait]
impl RecordStore for SqlRecordStore {
    async fn get(&self, query: &Query) -> JobResult<Vec<Row>> {
        let mut sql = format!("SELECT * FROM {}", ident(&query.table)?);
        let mut params = Vec::new();
        self.where_clause(query, &mut sql, &mut params)?;
        if let Some(column) = &query.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(ident(column)?);
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        debug!(sql = %sql, "Record store select");
        let rows = bind_all(&sql, params).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn create(&self, table: &str, row: Row) -> JobResult<i64> {
        let mut columns = Vec::with_capacity(row.len());
        let mut placeholders = Vec::with_capacity(row.len());
        let mut params = Vec::with_capacity(row.len());
        for (column, value) in row {
            columns.push(ident(&column)?.to_string());
            params.push(value);
            placeholders.push(self.dialect.placeholder(params.len()));
        }

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            ident(table)?,
            columns.join(", "),
            placeholders.join(", ")
        );

        if self.dialect == Dialect::Postgres {
            sql.push_str(" RETURNING id");
            let row = bind_all(&sql, params).fetch_one(&self.pool).await?;
            return Ok(row.try_get::<i64, _>(0)?);
        }

        let result = bind_all(&sql, params).execute(&self.pool).await?;
        result
            .last_insert_id()
            .ok_or_else(|| JobError::Store(format!("no id returned for insert into {table}")))
    }

    async fn update(&self, query: &Query, changes: Row) -> JobResult<u64> {
        if changes.is_empty() {
            return Ok(0);
        }

        let mut params = Vec::with_capacity(changes.len());
        let mut assignments = Vec::with_capacity(changes.len());
        for (column, value) in changes {
            ident(&column)?;
            params.push(value);
            assignments.push(format!("{} = {}", column, self.dialect.placeholder(params.len())));
        }

        let mut sql = format!("UPDATE {} SET {}", ident(&query.table)?, assignments.join(", "));
        self.where_clause(query, &mut sql, &mut params)?;

        let result = bind_all(&sql, params).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, query: &Query) -> JobResult<u64> {
        let mut sql = format!("DELETE FROM {}", ident(&query.table)?);
        let mut params = Vec::new();
        self.where_clause(query, &mut sql, &mut params)?;

        let result = bind_all(&sql, params).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn count(&self, query: &Query) -> JobResult<u64> {
        let mut sql = format!("SELECT COUNT(*) FROM {}", ident(&query.table)?);
        let mut params = Vec::new();
        self.where_clause(query, &mut sql, &mut params)?;

        let row = bind_all(&sql, params).fetch_one(&self.pool).await?;
        let count: i64 = row.try_get(0)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}
