//! # PostgreSQL Reference Engine
//!
//! `sqlx`-backed implementation of the engine capabilities. Each queue holds
//! exactly one [`PgConnection`], matching the one-connection-per-queue
//! ownership discipline; a pool would hide the very connections the health
//! monitor is responsible for.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{Column, Connection, PgConnection, Row};
use tracing::debug;

use super::{ConnectionParams, EngineConnection, EngineError, EngineResult, QueryEngine, QueryRequest, QueryResult};

/// Engine factory for PostgreSQL backends.
#[derive(Debug, Default)]
pub struct PostgresEngine;

impl PostgresEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl QueryEngine for PostgresEngine {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn connect(&self, params: &ConnectionParams) -> EngineResult<Box<dyn EngineConnection>> {
        let conn = PgConnection::connect(&params.url)
            .await
            .map_err(map_sqlx_error)?;
        debug!(database = %params.database, "postgres connection opened");
        Ok(Box::new(PostgresConnection { conn }))
    }
}

struct PostgresConnection {
    conn: PgConnection,
}

#[async_trait]
impl EngineConnection for PostgresConnection {
    async fn execute(&mut self, request: &QueryRequest) -> EngineResult<QueryResult> {
        let started = Instant::now();

        if returns_rows(&request.sql) {
            let rows = sqlx::query(&request.sql)
                .fetch_all(&mut self.conn)
                .await
                .map_err(map_sqlx_error)?;

            let columns = rows
                .first()
                .map(|row| {
                    row.columns()
                        .iter()
                        .map(|c| c.name().to_string())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            let rows = rows.iter().map(row_to_json).collect();

            Ok(QueryResult {
                columns,
                rows,
                affected_rows: 0,
                execution_time_ms: started.elapsed().as_millis() as u64,
            })
        } else {
            let done = sqlx::query(&request.sql)
                .execute(&mut self.conn)
                .await
                .map_err(map_sqlx_error)?;

            Ok(QueryResult {
                columns: Vec::new(),
                rows: Vec::new(),
                affected_rows: done.rows_affected(),
                execution_time_ms: started.elapsed().as_millis() as u64,
            })
        }
    }

    async fn ping(&mut self) -> EngineResult<()> {
        self.conn
            .ping()
            .await
            .map_err(|e| EngineError::Connectivity(e.to_string()))
    }

    async fn execute_batch(&mut self, statements: &[String]) -> EngineResult<()> {
        run_batch(&mut self.conn, statements).await
    }
}

/// Run the migration statements as one transaction on `conn`.
///
/// Kept as a plain `async fn` because `sqlx::raw_sql(..).execute(..)` cannot
/// satisfy its higher-ranked `Executor` lifetime inside the `#[async_trait]`
/// desugaring of [`EngineConnection::execute_batch`]. The behaviour matches a
/// `sqlx::Transaction`: the batch is atomic and any failure rolls the whole
/// thing back before the error is surfaced.
async fn run_batch(conn: &mut PgConnection, statements: &[String]) -> EngineResult<()> {
    sqlx::raw_sql("BEGIN")
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;

    for statement in statements {
        if let Err(err) = sqlx::raw_sql(statement).execute(&mut *conn).await {
            let _ = sqlx::raw_sql("ROLLBACK").execute(&mut *conn).await;
            return Err(map_sqlx_error(err));
        }
    }

    sqlx::raw_sql("COMMIT")
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
    Ok(())
}

fn returns_rows(sql: &str) -> bool {
    let head = sql.trim_start().to_ascii_lowercase();
    head.starts_with("select") || head.starts_with("with") || head.starts_with("show")
}

/// Decode a row into a JSON object, falling back per column through the
/// common wire types.
fn row_to_json(row: &PgRow) -> Value {
    let mut object = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), column_to_json(row, index));
    }
    Value::Object(object)
}

fn column_to_json(row: &PgRow, index: usize) -> Value {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<i32>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<Value>, _>(index) {
        return value.unwrap_or(Value::Null);
    }
    Value::Null
}

fn map_sqlx_error(err: sqlx::Error) -> EngineError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => EngineError::Connectivity(err.to_string()),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            if code.starts_with("23") {
                EngineError::Constraint(err.to_string())
            } else if code.starts_with("42") {
                EngineError::Syntax(err.to_string())
            } else if code.starts_with("57") {
                EngineError::Timeout(err.to_string())
            } else {
                EngineError::Execution(err.to_string())
            }
        }
        _ => EngineError::Execution(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_statements_return_rows() {
        assert!(returns_rows("SELECT 1"));
        assert!(returns_rows("  with t as (select 1) select * from t"));
        assert!(!returns_rows("INSERT INTO t VALUES (1)"));
        assert!(!returns_rows("UPDATE t SET a = 1"));
    }
}
