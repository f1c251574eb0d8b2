//! In-memory record store.

use super::{compare_values, Query, RecordStore, Row};
use crate::error::JobResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Default)]
struct Table {
    next_id: i64,
    rows: Vec<Row>,
}

/// Record store kept in process memory.
///
/// Used by tests and single-process setups. Rows get an auto-incrementing
/// `id` column on insert.
#[derive(Default)]
pub struct MemoryRecordStore {
    tables: RwLock<HashMap<String, Table>>,
}

impl MemoryRecordStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies every row of a table, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    fn matches(row: &Row, query: &Query) -> bool {
        query.filters.iter().all(|f| {
            let value = row.get(&f.column).unwrap_or(&Value::Null);
            f.op.matches(compare_values(value, &f.value))
        })
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, query: &Query) -> JobResult<Vec<Row>> {
        let tables = self.tables.read();
        let Some(table) = tables.get(&query.table) else {
            return Ok(Vec::new());
        };

        let mut rows: Vec<Row> = table
            .rows
            .iter()
            .filter(|row| Self::matches(row, query))
            .cloned()
            .collect();

        if let Some(column) = &query.order_by {
            rows.sort_by(|a, b| {
                let a = a.get(column).unwrap_or(&Value::Null);
                let b = b.get(column).unwrap_or(&Value::Null);
                compare_values(a, b).unwrap_or(Ordering::Equal)
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn create(&self, table: &str, mut row: Row) -> JobResult<i64> {
        let mut tables = self.tables.write();
        let table = tables.entry(table.to_string()).or_default();
        table.next_id += 1;
        let id = table.next_id;
        row.insert("id".to_string(), Value::from(id));
        table.rows.push(row);
        Ok(id)
    }

    async fn update(&self, query: &Query, changes: Row) -> JobResult<u64> {
        let mut tables = self.tables.write();
        let Some(table) = tables.get_mut(&query.table) else {
            return Ok(0);
        };

        let mut affected = 0;
        for row in table.rows.iter_mut().filter(|row| Self::matches(row, query)) {
            for (column, value) in &changes {
                row.insert(column.clone(), value.clone());
            }
            affected += 1;
        }
        Ok(affected)
    }

    async fn delete(&self, query: &Query) -> JobResult<u64> {
        let mut tables = self.tables.write();
        let Some(table) = tables.get_mut(&query.table) else {
            return Ok(0);
        };

        let before = table.rows.len();
        table.rows.retain(|row| !Self::matches(row, query));
        Ok((before - table.rows.len()) as u64)
    }
}
