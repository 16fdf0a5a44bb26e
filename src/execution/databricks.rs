//! Databricks SQL engine
//!
//! Talks to a SQL warehouse through the Statement Execution REST API:
//! submit with `POST /api/2.0/sql/statements`, then poll
//! `GET /api/2.0/sql/statements/{id}` until the statement leaves the
//! `PENDING`/`RUNNING` states.
//!
//! A statement that is abandoned before it finishes (deadline passed, poll
//! failed, or the caller dropped the query) is cancelled on the warehouse.

use crate::config::DatabricksConfig;
use crate::execution::engine::{CellValue, ColumnSpec, ColumnType, RowSet, SqlEngine};
use crate::execution::error::{EngineError, EngineErrorKind};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

/// Server-side wait bounds accepted by the API (0 or 5..=50 seconds)
const MIN_WAIT_SECS: u64 = 5;
const MAX_WAIT_SECS: u64 = 50;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Databricks SQL warehouse engine
pub struct DatabricksEngine {
    client: Client,
    base_url: String,
    warehouse_id: String,
    access_token: String,
    wait_timeout_secs: u64,
}

impl DatabricksEngine {
    /// Create an engine from connection settings
    pub fn new(config: &DatabricksConfig) -> Result<Self, EngineError> {
        if config.server_hostname.is_empty()
            || config.http_path.is_empty()
            || config.access_token.is_empty()
        {
            return Err(EngineError::permission(
                "Databricks connection details not fully configured",
            ));
        }

        let warehouse_id = warehouse_id(&config.http_path).ok_or_else(|| {
            EngineError::internal(format!(
                "Cannot derive a warehouse id from http_path '{}'",
                config.http_path
            ))
        })?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EngineError::internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url(&config.server_hostname),
            warehouse_id,
            access_token: config.access_token.clone(),
            wait_timeout_secs: config.wait_timeout_secs,
        })
    }

    fn statements_url(&self) -> String {
        format!("{}/api/2.0/sql/statements", self.base_url)
    }

    async fn submit(&self, sql: &str, wait_secs: u64) -> Result<StatementResponse, EngineError> {
        let body = StatementRequest {
            statement: sql,
            warehouse_id: &self.warehouse_id,
            wait_timeout: format!("{}s", wait_secs),
            on_wait_timeout: "CONTINUE",
            disposition: "INLINE",
            format: "JSON_ARRAY",
        };

        let response = self
            .client
            .post(self.statements_url())
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;

        read_json(response).await
    }

    async fn poll(&self, statement_id: &str) -> Result<StatementResponse, EngineError> {
        let url = format!("{}/{}", self.statements_url(), statement_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(request_error)?;

        read_json(response).await
    }

    async fn fetch_chunk(&self, link: &str) -> Result<ResultData, EngineError> {
        let url = format!("{}{}", self.base_url, link);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(request_error)?;

        read_json(response).await
    }

    /// Best effort; a failed cancel leaves the warehouse to time it out
    async fn cancel(&self, statement_id: &str) {
        cancel_statement(
            self.client.clone(),
            self.cancel_url(statement_id),
            self.access_token.clone(),
        )
        .await
    }

    fn cancel_url(&self, statement_id: &str) -> String {
        format!("{}/{}/cancel", self.statements_url(), statement_id)
    }

    async fn collect_rows(&self, response: StatementResponse) -> Result<RowSet, EngineError> {
        let columns: Vec<ColumnSpec> = response
            .manifest
            .map(|m| m.schema.columns)
            .unwrap_or_default()
            .into_iter()
            .map(|c| ColumnSpec::new(c.name, ColumnType::from_type_name(&c.type_name)))
            .collect();

        let mut rows = Vec::new();
        let mut next = response.result;
        while let Some(data) = next.take() {
            rows.extend(
                data.data_array
                    .iter()
                    .map(|raw| convert_row(raw, &columns)),
            );
            if let Some(link) = data.next_chunk_internal_link {
                next = Some(self.fetch_chunk(&link).await?);
            }
        }

        Ok(RowSet { columns, rows })
    }
}

#[async_trait]
impl SqlEngine for DatabricksEngine {
    fn name(&self) -> &str {
        "databricks"
    }

    async fn run_query(&self, sql: &str, timeout: Duration) -> Result<RowSet, EngineError> {
        let started = Instant::now();
        let mut response = self
            .submit(sql, server_wait_secs(self.wait_timeout_secs, timeout))
            .await?;
        let mut pending = PendingStatement::new(self, &response.statement_id);

        loop {
            match response.status.state {
                StatementState::Succeeded => {
                    pending.disarm();
                    return self.collect_rows(response).await;
                }
                StatementState::Pending | StatementState::Running => {}
                StatementState::Failed => {
                    pending.disarm();
                    let message = response
                        .status
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "statement failed".to_string());
                    return Err(EngineError::syntax(message));
                }
                StatementState::Canceled | StatementState::Closed => {
                    pending.disarm();
                    return Err(EngineError::transient(format!(
                        "statement {} was {:?}",
                        response.statement_id, response.status.state
                    )));
                }
            }

            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                pending.disarm();
                self.cancel(&response.statement_id).await;
                return Err(EngineError::new(
                    EngineErrorKind::Timeout,
                    format!("statement {} still running", response.statement_id),
                ));
            }

            tokio::time::sleep(POLL_INTERVAL.min(remaining)).await;
            response = self.poll(&response.statement_id).await?;
        }
    }

    async fn health_check(&self) -> Result<(), EngineError> {
        let url = format!("{}/api/2.0/sql/warehouses/{}", self.base_url, self.warehouse_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(status_error(status, text))
        }
    }
}

/// Cancels its statement on drop unless disarmed. Covers every early exit
/// from `run_query`, including the future itself being dropped.
struct PendingStatement<'a> {
    engine: &'a DatabricksEngine,
    statement_id: String,
    armed: bool,
}

impl<'a> PendingStatement<'a> {
    fn new(engine: &'a DatabricksEngine, statement_id: &str) -> Self {
        Self {
            engine,
            statement_id: statement_id.to_string(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingStatement<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        tracing::debug!("Cancelling abandoned statement {}", self.statement_id);
        runtime.spawn(cancel_statement(
            self.engine.client.clone(),
            self.engine.cancel_url(&self.statement_id),
            self.engine.access_token.clone(),
        ));
    }
}

async fn cancel_statement(client: Client, url: String, access_token: String) {
    if let Err(e) = client.post(&url).bearer_auth(&access_token).send().await {
        tracing::debug!("Failed to cancel statement at {}: {}", url, e);
    }
}

/// Server-side wait for the submit call. It stays under the query budget so
/// the submit returns a statement id while there is still time to cancel it;
/// budgets too short for the API minimum submit asynchronously (`0s`).
fn server_wait_secs(configured: u64, timeout: Duration) -> u64 {
    let wait = configured.min(timeout.as_secs().saturating_sub(1));
    if wait < MIN_WAIT_SECS {
        0
    } else {
        wait.min(MAX_WAIT_SECS)
    }
}

/// `/sql/1.0/warehouses/<id>` or `/sql/1.0/endpoints/<id>`
fn warehouse_id(http_path: &str) -> Option<String> {
    let mut segments = http_path.trim_end_matches('/').rsplit('/');
    let id = segments.next()?;
    let parent = segments.next()?;
    if (parent == "warehouses" || parent == "endpoints") && !id.is_empty() {
        Some(id.to_string())
    } else {
        None
    }
}

fn base_url(hostname: &str) -> String {
    let host = hostname.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    }
}

fn request_error(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::new(EngineErrorKind::Timeout, e.to_string())
    } else if e.is_connect() {
        EngineError::unreachable(e.to_string())
    } else {
        EngineError::transient(e.to_string())
    }
}

fn status_error(status: StatusCode, body: String) -> EngineError {
    let message = format!("HTTP {}: {}", status.as_u16(), body);
    match status.as_u16() {
        401 | 403 => EngineError::permission(message),
        429 | 500..=599 => EngineError::transient(message),
        400 | 404 => EngineError::syntax(message),
        _ => EngineError::internal(message),
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> Result<T, EngineError> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(status_error(status, text));
    }
    response
        .json()
        .await
        .map_err(|e| EngineError::internal(format!("Malformed response: {}", e)))
}

fn convert_row(raw: &[Value], columns: &[ColumnSpec]) -> Vec<CellValue> {
    raw.iter()
        .enumerate()
        .map(|(i, value)| {
            let column_type = columns
                .get(i)
                .map(|c| c.column_type)
                .unwrap_or(ColumnType::Unknown);
            convert_cell(value, column_type)
        })
        .collect()
}

/// JSON_ARRAY results carry every value as a string
fn convert_cell(value: &Value, column_type: ColumnType) -> CellValue {
    let text = match value {
        Value::Null => return CellValue::Null,
        Value::Bool(b) => return CellValue::Bool(*b),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => return CellValue::Text(other.to_string()),
    };

    match column_type {
        ColumnType::Integer => text
            .parse()
            .map(CellValue::Int)
            .unwrap_or(CellValue::Text(text)),
        ColumnType::Float => text
            .parse()
            .map(CellValue::Float)
            .unwrap_or(CellValue::Text(text)),
        ColumnType::Boolean => match text.as_str() {
            "true" => CellValue::Bool(true),
            "false" => CellValue::Bool(false),
            _ => CellValue::Text(text),
        },
        _ => CellValue::Text(text),
    }
}

// ============================================
// Request/Response DTOs
// ============================================

#[derive(Debug, Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    warehouse_id: &'a str,
    wait_timeout: String,
    on_wait_timeout: &'static str,
    disposition: &'static str,
    format: &'static str,
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    statement_id: String,
    status: StatementStatus,
    #[serde(default)]
    manifest: Option<Manifest>,
    #[serde(default)]
    result: Option<ResultData>,
}

#[derive(Debug, Deserialize)]
struct StatementStatus {
    state: StatementState,
    #[serde(default)]
    error: Option<ServiceError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum StatementState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Closed,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    schema: Schema,
}

#[derive(Debug, Deserialize)]
struct Schema {
    #[serde(default)]
    columns: Vec<ManifestColumn>,
}

#[derive(Debug, Deserialize)]
struct ManifestColumn {
    name: String,
    #[serde(default)]
    type_name: String,
}

#[derive(Debug, Deserialize)]
struct ResultData {
    #[serde(default)]
    data_array: Vec<Vec<Value>>,
    #[serde(default)]
    next_chunk_internal_link: Option<String>,
}
