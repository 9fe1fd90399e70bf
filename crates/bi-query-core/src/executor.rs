//! Read-Only Executor: runs parameterized SQL under a database principal
//! that cannot write, applies the Policy Gate's mask plan, and enforces the
//! envelope deadline.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::policy::MaskType;

/// A single executed row, as column-name → JSON value, before masking.
pub type Row = std::collections::HashMap<String, serde_json::Value>;

/// A warehouse connection abstraction. The real analytical warehouse is out
/// of scope for this crate (spec.md §1); this trait is the seam a
/// Postgres/warehouse adapter plugs into, grounded on the teacher's
/// `LLMClient` trait-for-provider-substitution pattern.
#[async_trait]
pub trait WarehouseConnection: Send + Sync {
    async fn query(&self, sql: &str, parameters: &[serde_json::Value]) -> Result<(Vec<String>, Vec<Row>)>;
}

/// Reference implementation backed by a `rusqlite::Connection` opened
/// read-only, enforcing the "cannot write" principal requirement at the
/// connection-flag level.
pub struct SqliteWarehouse {
    conn: Mutex<Connection>,
}

impl SqliteWarehouse {
    pub fn open_read_only(path: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory connection for tests. SQLite cannot open a fresh `:memory:`
    /// database read-only (there is nothing to read), so tests open it
    /// read-write and rely on query-level SELECT-only validation instead —
    /// the production path always uses `open_read_only`.
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl WarehouseConnection for SqliteWarehouse {
    async fn query(&self, sql: &str, parameters: &[serde_json::Value]) -> Result<(Vec<String>, Vec<Row>)> {
        let sql = sql.to_string();
        let params: Vec<serde_json::Value> = parameters.to_vec();
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::ExecutionFailed(e.to_string()))?;

        let column_names: Vec<String> = stmt
            .column_names()
            .iter()
            .map(|s| s.to_string())
            .collect();

        let rusqlite_params: Vec<Box<dyn rusqlite::types::ToSql>> = params
            .iter()
            .map(json_to_sql_param)
            .collect();
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            rusqlite_params.iter().map(|p| p.as_ref()).collect();

        let rows = stmt
            .query_map(param_refs.as_slice(), |row| {
                let mut map = Row::new();
                for (i, name) in column_names.iter().enumerate() {
                    let value: rusqlite::types::Value = row.get(i)?;
                    map.insert(name.clone(), sql_value_to_json(value));
                }
                Ok(map)
            })
            .map_err(|e| Error::ExecutionFailed(e.to_string()))?
            .collect::<rusqlite::Result<Vec<Row>>>()
            .map_err(|e| Error::ExecutionFailed(e.to_string()))?;

        Ok((column_names, rows))
    }
}

fn json_to_sql_param(value: &serde_json::Value) -> Box<dyn rusqlite::types::ToSql> {
    match value {
        serde_json::Value::String(s) => Box::new(s.clone()),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Box::new(i)
            } else {
                Box::new(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::Bool(b) => Box::new(*b),
        serde_json::Value::Null => Box::new(Option::<String>::None),
        other => Box::new(other.to_string()),
    }
}

fn sql_value_to_json(value: rusqlite::types::Value) -> serde_json::Value {
    use rusqlite::types::Value as V;
    match value {
        V::Null => serde_json::Value::Null,
        V::Integer(i) => serde_json::json!(i),
        V::Real(f) => serde_json::json!(f),
        V::Text(s) => serde_json::Value::String(s),
        V::Blob(_) => serde_json::Value::Null,
    }
}

/// Outcome of executing a query: either a masked result set or a timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
    },
    TimedOut,
}

/// Executes parameterized SQL under the envelope's deadline, masking every
/// returned row per the Policy Gate's mask plan before handing results back.
pub async fn execute(
    warehouse: &dyn WarehouseConnection,
    sql: &str,
    parameters: &[serde_json::Value],
    mask_plan: &std::collections::HashMap<String, MaskType>,
    deadline: Duration,
) -> Result<ExecutionOutcome> {
    let result = tokio::time::timeout(deadline, warehouse.query(sql, parameters)).await;

    let (columns, rows) = match result {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "executor query failed");
            return Err(e);
        }
        Err(_) => {
            tracing::warn!(?deadline, "executor deadline exceeded");
            return Ok(ExecutionOutcome::TimedOut);
        }
    };

    let masked_rows: Vec<Vec<serde_json::Value>> = rows
        .into_iter()
        .map(|row| {
            columns
                .iter()
                .map(|col| {
                    let raw = row.get(col).cloned().unwrap_or(serde_json::Value::Null);
                    match mask_plan.get(col) {
                        Some(mask) => mask.apply(&raw),
                        None => raw,
                    }
                })
                .collect()
        })
        .collect();

    Ok(ExecutionOutcome::Rows {
        columns,
        rows: masked_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::MaskType;
    use std::collections::HashMap;

    #[tokio::test]
    async fn executes_simple_select() {
        let warehouse = SqliteWarehouse::open_in_memory().unwrap();
        let outcome = execute(
            &warehouse,
            "SELECT 1 AS one, 'x' AS letter",
            &[],
            &HashMap::new(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        match outcome {
            ExecutionOutcome::Rows { columns, rows } => {
                assert_eq!(columns, vec!["one".to_string(), "letter".to_string()]);
                assert_eq!(rows.len(), 1);
            }
            ExecutionOutcome::TimedOut => panic!("unexpected timeout"),
        }
    }

    #[tokio::test]
    async fn applies_mask_plan_to_returned_rows() {
        let warehouse = SqliteWarehouse::open_in_memory().unwrap();
        let mut mask_plan = HashMap::new();
        mask_plan.insert("ssn".to_string(), MaskType::Full);

        let outcome = execute(
            &warehouse,
            "SELECT '123-45-6789' AS ssn",
            &[],
            &mask_plan,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        match outcome {
            ExecutionOutcome::Rows { rows, .. } => {
                assert_eq!(rows[0][0], serde_json::json!("***"));
            }
            ExecutionOutcome::TimedOut => panic!("unexpected timeout"),
        }
    }

    #[tokio::test]
    async fn deadline_exceeded_returns_timed_out() {
        struct SlowWarehouse;

        #[async_trait]
        impl WarehouseConnection for SlowWarehouse {
            async fn query(
                &self,
                _sql: &str,
                _parameters: &[serde_json::Value],
            ) -> Result<(Vec<String>, Vec<Row>)> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok((vec![], vec![]))
            }
        }

        let outcome = execute(
            &SlowWarehouse,
            "SELECT 1",
            &[],
            &HashMap::new(),
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, ExecutionOutcome::TimedOut));
    }
}
