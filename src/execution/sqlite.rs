//! SQLite engine
//!
//! Local [`SqlEngine`] backed by rusqlite. Statements run on the blocking
//! pool. File databases get a fresh read-only connection per query so
//! concurrent queries never wait on each other; an in-memory database only
//! exists inside its one connection, which queries then take turns on.
//!
//! A statement that outlives its timeout is interrupted. A query still
//! waiting for the shared connection when its deadline passes never runs.

use crate::execution::engine::{CellValue, ColumnSpec, ColumnType, RowSet, SqlEngine};
use crate::execution::error::{EngineError, EngineErrorKind};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

#[derive(Clone)]
enum Source {
    File(PathBuf),
    Memory(Arc<Mutex<Connection>>),
}

impl Source {
    fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        match self {
            Source::File(path) => f(&open_read_only(path)?),
            Source::Memory(conn) => {
                let guard = conn
                    .lock()
                    .map_err(|e| EngineError::internal(format!("Lock error: {}", e)))?;
                f(&guard)
            }
        }
    }
}

/// SQLite-backed engine
#[derive(Clone)]
pub struct SqliteEngine {
    source: Source,
    label: String,
}

impl SqliteEngine {
    /// Use a database file read-only. The file is opened once here so a
    /// missing or corrupt database fails up front.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        open_read_only(path)?;
        Ok(Self {
            source: Source::File(path.to_path_buf()),
            label: path.display().to_string(),
        })
    }

    /// In-memory database, mostly for tests and fixtures
    pub fn in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory().map_err(classify)?;
        Ok(Self {
            source: Source::Memory(Arc::new(Mutex::new(conn))),
            label: ":memory:".to_string(),
        })
    }

    /// Run a batch of statements (schema setup, fixtures)
    pub fn execute_batch(&self, sql: &str) -> Result<(), EngineError> {
        match &self.source {
            Source::File(path) => Connection::open(path)
                .and_then(|conn| conn.execute_batch(sql))
                .map_err(classify),
            source => source.with_connection(|conn| conn.execute_batch(sql).map_err(classify)),
        }
    }
}

fn open_read_only(path: &Path) -> Result<Connection, EngineError> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(classify)
}

fn timed_out(timeout: Duration) -> EngineError {
    EngineError::new(
        EngineErrorKind::Timeout,
        format!("statement exceeded {}ms", timeout.as_millis()),
    )
}

#[async_trait]
impl SqlEngine for SqliteEngine {
    fn name(&self) -> &str {
        &self.label
    }

    async fn run_query(&self, sql: &str, timeout: Duration) -> Result<RowSet, EngineError> {
        let deadline = Instant::now() + timeout;
        let source = self.source.clone();
        let sql = sql.to_string();
        let (handle_tx, mut handle_rx) = oneshot::channel();

        let task = tokio::task::spawn_blocking(move || {
            source.with_connection(|conn| {
                if Instant::now() >= deadline {
                    return Err(timed_out(timeout));
                }
                // Fails once the caller has given up on this query
                if handle_tx.send(conn.get_interrupt_handle()).is_err() {
                    return Err(timed_out(timeout));
                }
                query_rows(conn, &sql)
            })
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(EngineError::internal(format!("SQLite task failed: {}", e))),
            Err(_) => {
                // Only a statement that already started handed over its handle
                handle_rx.close();
                if let Ok(handle) = handle_rx.try_recv() {
                    handle.interrupt();
                }
                Err(timed_out(timeout))
            }
        }
    }

    async fn health_check(&self) -> Result<(), EngineError> {
        self.run_query("SELECT 1", Duration::from_secs(5))
            .await
            .map(|_| ())
            .map_err(|e| EngineError::unreachable(e.message))
    }
}

fn query_rows(conn: &Connection, sql: &str) -> Result<RowSet, EngineError> {
    let mut stmt = conn.prepare(sql).map_err(classify)?;
    let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
    let width = names.len();

    let mut observed: Vec<Option<ColumnType>> = vec![None; width];
    let mut rows = Vec::new();

    let mut cursor = stmt.query([]).map_err(classify)?;
    while let Some(row) = cursor.next().map_err(classify)? {
        let mut cells = Vec::with_capacity(width);
        for (index, seen) in observed.iter_mut().enumerate() {
            let value = row.get_ref(index).map_err(classify)?;
            let cell = to_cell(value);
            *seen = merge_type(*seen, &cell);
            cells.push(cell);
        }
        rows.push(cells);
    }

    let columns = names
        .into_iter()
        .zip(observed)
        .map(|(name, column_type)| ColumnSpec::new(name, column_type.unwrap_or(ColumnType::Unknown)))
        .collect();

    Ok(RowSet { columns, rows })
}

fn to_cell(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(n) => CellValue::Int(n),
        ValueRef::Real(f) => CellValue::Float(f),
        ValueRef::Text(bytes) => CellValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => CellValue::Text(format!("<blob {} bytes>", bytes.len())),
    }
}

/// SQLite is dynamically typed per cell; widen as values come in
fn merge_type(seen: Option<ColumnType>, cell: &CellValue) -> Option<ColumnType> {
    let current = match cell {
        CellValue::Null => return seen,
        CellValue::Bool(_) => ColumnType::Boolean,
        CellValue::Int(_) => ColumnType::Integer,
        CellValue::Float(_) => ColumnType::Float,
        CellValue::Text(_) => ColumnType::Text,
    };
    Some(match seen {
        None => current,
        Some(previous) if previous == current => previous,
        Some(ColumnType::Integer) if current == ColumnType::Float => ColumnType::Float,
        Some(ColumnType::Float) if current == ColumnType::Integer => ColumnType::Float,
        Some(_) => ColumnType::Text,
    })
}

fn classify(err: rusqlite::Error) -> EngineError {
    let message = err.to_string();
    let kind = match &err {
        // Prepare-time failures carry the offending SQL but the same codes
        rusqlite::Error::SqliteFailure(failure, _)
        | rusqlite::Error::SqlInputError { error: failure, .. } => code_kind(failure.code),
        rusqlite::Error::InvalidQuery | rusqlite::Error::MultipleStatement => EngineErrorKind::Syntax,
        _ => EngineErrorKind::Internal,
    };
    EngineError::new(kind, message)
}

fn code_kind(code: ErrorCode) -> EngineErrorKind {
    match code {
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => EngineErrorKind::Transient,
        ErrorCode::PermissionDenied
        | ErrorCode::ReadOnly
        | ErrorCode::AuthorizationForStatementDenied => EngineErrorKind::Permission,
        ErrorCode::CannotOpen | ErrorCode::NotADatabase => EngineErrorKind::Unreachable,
        ErrorCode::OperationInterrupted => EngineErrorKind::Timeout,
        _ => EngineErrorKind::Syntax,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{CancelToken, CoordinatorSettings, QueryCoordinator, QueryError, ResolvedQuery};

    /// Never finishes on its own
    const RUNAWAY: &str =
        "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT count(*) FROM c";

    const SCHEMA: &str = "CREATE TABLE cost (env TEXT, region TEXT, amount REAL, units INTEGER);
         INSERT INTO cost VALUES ('prod', 'us', 10.5, 3);
         INSERT INTO cost VALUES ('prod', 'eu', 4.0, NULL);
         INSERT INTO cost VALUES ('dev', 'us', NULL, 1);";

    fn fixture() -> SqliteEngine {
        let engine = SqliteEngine::in_memory().unwrap();
        engine.execute_batch(SCHEMA).unwrap();
        engine
    }

    fn file_fixture(dir: &Path) -> SqliteEngine {
        let path = dir.join("cost.db");
        Connection::open(&path).unwrap().execute_batch(SCHEMA).unwrap();
        SqliteEngine::open(&path).unwrap()
    }

    #[tokio::test]
    async fn test_query_rows_and_types() {
        let engine = fixture();
        let rows = engine
            .run_query(
                "SELECT env, amount, units FROM cost WHERE env IN ('prod') ORDER BY region",
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let names: Vec<&str> = rows.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["env", "amount", "units"]);
        assert_eq!(rows.columns[0].column_type, ColumnType::Text);
        assert_eq!(rows.columns[1].column_type, ColumnType::Float);
        assert_eq!(rows.columns[2].column_type, ColumnType::Integer);
        assert_eq!(rows.rows.len(), 2);
        assert_eq!(rows.rows[0][0], CellValue::Text("prod".into()));
        assert_eq!(rows.rows[0][2], CellValue::Null);
    }

    #[tokio::test]
    async fn test_syntax_error_classified() {
        let engine = fixture();
        let err = engine
            .run_query("SELECT * FORM cost", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Syntax);

        let err = engine
            .run_query("SELECT * FROM missing_table", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Syntax);
    }

    #[test]
    fn test_classify_codes() {
        use rusqlite::ffi;

        let prepare = rusqlite::Error::SqlInputError {
            error: ffi::Error::new(ffi::SQLITE_ERROR),
            msg: "near \"FORM\": syntax error".to_string(),
            sql: "SELECT * FORM cost".to_string(),
            offset: 9,
        };
        assert_eq!(classify(prepare).kind, EngineErrorKind::Syntax);

        let failure = |code| rusqlite::Error::SqliteFailure(ffi::Error::new(code), None);
        assert_eq!(classify(failure(ffi::SQLITE_AUTH)).kind, EngineErrorKind::Permission);
        assert_eq!(classify(failure(ffi::SQLITE_BUSY)).kind, EngineErrorKind::Transient);
        assert_eq!(classify(failure(ffi::SQLITE_INTERRUPT)).kind, EngineErrorKind::Timeout);
        assert_eq!(classify(rusqlite::Error::InvalidColumnIndex(3)).kind, EngineErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_runaway_statement_is_interrupted() {
        let engine = fixture();

        let started = Instant::now();
        let err = engine
            .run_query(RUNAWAY, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));

        // The interrupt released the shared connection
        let rows = engine
            .run_query("SELECT count(*) FROM cost", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(rows.rows, vec![vec![CellValue::Int(3)]]);
    }

    #[tokio::test]
    async fn test_query_waiting_on_shared_connection_keeps_its_deadline() {
        let engine = fixture();
        let slow = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_query(RUNAWAY, Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let err = engine
            .run_query("SELECT 1", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_millis(800));

        assert_eq!(slow.await.unwrap().unwrap_err().kind, EngineErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_file_queries_do_not_wait_on_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let engine = file_fixture(dir.path());
        let slow = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_query(RUNAWAY, Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let rows = engine
            .run_query("SELECT count(*) FROM cost", Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(rows.rows, vec![vec![CellValue::Int(3)]]);
        assert!(started.elapsed() < Duration::from_millis(300));

        assert_eq!(slow.await.unwrap().unwrap_err().kind, EngineErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_slow_sibling_does_not_time_out_fast_query() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(file_fixture(dir.path()));
        let coordinator = QueryCoordinator::new(
            engine,
            CoordinatorSettings {
                concurrency_limit: 2,
                query_timeout: Duration::from_millis(300),
                max_retries: 0,
                retry_backoff: Duration::from_millis(1),
            },
        );

        let outcomes = coordinator
            .execute(
                &[
                    ResolvedQuery::new("1", "A", RUNAWAY),
                    ResolvedQuery::new("2", "A", "SELECT 1"),
                ],
                &CancelToken::new(),
            )
            .await;

        assert_eq!(outcomes[0], Err(QueryError::Timeout { after_ms: 300 }));
        assert_eq!(outcomes[1].as_ref().unwrap().rows, vec![vec![CellValue::Int(1)]]);
    }

    #[tokio::test]
    async fn test_file_engine_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let engine = file_fixture(dir.path());
        let err = engine
            .run_query("DELETE FROM cost", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Permission);
    }

    #[tokio::test]
    async fn test_empty_result_keeps_columns() {
        let engine = fixture();
        let rows = engine
            .run_query("SELECT env FROM cost WHERE 1=0", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(rows.columns.len(), 1);
        assert_eq!(rows.columns[0].column_type, ColumnType::Unknown);
        assert!(rows.rows.is_empty());
    }

    #[tokio::test]
    async fn test_health_check() {
        assert!(fixture().health_check().await.is_ok());
    }

    #[test]
    fn test_open_missing_file_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let err = SqliteEngine::open(&dir.path().join("nope.db")).err().unwrap();
        assert_eq!(err.kind, EngineErrorKind::Unreachable);
    }

    #[test]
    fn test_merge_type_widens() {
        let t = merge_type(None, &CellValue::Int(1));
        let t = merge_type(t, &CellValue::Float(1.5));
        assert_eq!(t, Some(ColumnType::Float));
        let t = merge_type(t, &CellValue::Text("x".into()));
        assert_eq!(t, Some(ColumnType::Text));
        assert_eq!(merge_type(None, &CellValue::Null), None);
    }
}
