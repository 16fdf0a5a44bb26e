//! Query Execution Coordinator
//!
//! Runs resolved queries against a [`SqlEngine`] with bounded concurrency.
//! Every query has its own timeout and retry budget, and its failure is
//! reported in its own slot without touching sibling queries.
//!
//! Engines receive the timeout and enforce it themselves so they can stop
//! the statement on their side. The coordinator only drops an attempt once
//! the engine has overrun that timeout by a grace period.

use crate::config::ExecutionConfig;
use crate::execution::cancel::CancelToken;
use crate::execution::engine::{QueryResult, ResolvedQuery, SqlEngine};
use crate::execution::error::{QueryError, QueryOutcome};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Queries in flight at once (at least 1)
    pub concurrency_limit: usize,
    /// Per-attempt deadline
    pub query_timeout: Duration,
    /// Extra attempts after a transient failure
    pub max_retries: u32,
    /// First retry delay, doubled on each further retry
    pub retry_backoff: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&ExecutionConfig::default())
    }
}

impl From<&ExecutionConfig> for CoordinatorSettings {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            concurrency_limit: config.concurrency_limit,
            query_timeout: Duration::from_secs(config.query_timeout_secs),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Dispatches queries for one analysis run
pub struct QueryCoordinator {
    engine: Arc<dyn SqlEngine>,
    settings: CoordinatorSettings,
}

impl QueryCoordinator {
    pub fn new(engine: Arc<dyn SqlEngine>, settings: CoordinatorSettings) -> Self {
        Self { engine, settings }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Run every query and return one outcome per query, in input order.
    ///
    /// Queries that never started because `cancel` fired are reported as
    /// [`QueryError::Cancelled`].
    pub async fn execute(&self, queries: &[ResolvedQuery], cancel: &CancelToken) -> Vec<QueryOutcome> {
        let limit = self.settings.concurrency_limit.max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let started = Instant::now();

        debug!(
            engine = self.engine.name(),
            queries = queries.len(),
            concurrency = limit,
            "Dispatching queries"
        );

        let mut join_set = JoinSet::new();
        for (slot, query) in queries.iter().enumerate() {
            let engine = Arc::clone(&self.engine);
            let semaphore = Arc::clone(&semaphore);
            let settings = self.settings.clone();
            let cancel = cancel.clone();
            let query = query.clone();

            join_set.spawn(async move {
                let outcome = run_when_permitted(engine, semaphore, &settings, &cancel, &query).await;
                (slot, outcome)
            });
        }

        // Each task owns exactly one slot
        let mut slots: Vec<Option<QueryOutcome>> = vec![None; queries.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((slot, outcome)) => slots[slot] = Some(outcome),
                Err(e) => warn!("Query task failed: {}", e),
            }
        }

        let outcomes: Vec<QueryOutcome> = slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(QueryError::Internal {
                        message: "query task terminated abnormally".to_string(),
                    })
                })
            })
            .collect();

        let failed = outcomes.iter().filter(|o| o.is_err()).count();
        debug!(
            succeeded = outcomes.len() - failed,
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Query dispatch complete"
        );
        outcomes
    }
}

async fn run_when_permitted(
    engine: Arc<dyn SqlEngine>,
    semaphore: Arc<Semaphore>,
    settings: &CoordinatorSettings,
    cancel: &CancelToken,
    query: &ResolvedQuery,
) -> QueryOutcome {
    let _permit = tokio::select! {
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return Err(QueryError::Cancelled),
        },
        _ = cancel.cancelled() => return Err(QueryError::Cancelled),
    };

    if cancel.is_cancelled() {
        return Err(QueryError::Cancelled);
    }

    run_with_retries(engine.as_ref(), settings, cancel, query).await
}

/// Slack given to an engine past its own deadline before the attempt is
/// abandoned from the outside
fn grace_period(timeout: Duration) -> Duration {
    (timeout / 10).clamp(Duration::from_millis(50), Duration::from_secs(5))
}

async fn run_with_retries(
    engine: &dyn SqlEngine,
    settings: &CoordinatorSettings,
    cancel: &CancelToken,
    query: &ResolvedQuery,
) -> QueryOutcome {
    let timeout_ms = settings.query_timeout.as_millis() as u64;
    let backstop = settings.query_timeout + grace_period(settings.query_timeout);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        debug!(
            panel_id = %query.panel_id,
            ref_id = %query.ref_id,
            attempt,
            "Running query"
        );

        let started = Instant::now();
        let error = match tokio::time::timeout(
            backstop,
            engine.run_query(&query.sql, settings.query_timeout),
        )
        .await
        {
            Ok(Ok(rows)) => {
                debug!(
                    panel_id = %query.panel_id,
                    ref_id = %query.ref_id,
                    rows = rows.rows.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Query succeeded"
                );
                return Ok(QueryResult::new(query, rows));
            }
            Ok(Err(e)) => match QueryError::from(e) {
                QueryError::Timeout { .. } => QueryError::Timeout { after_ms: timeout_ms },
                other => other,
            },
            Err(_) => {
                warn!(
                    panel_id = %query.panel_id,
                    ref_id = %query.ref_id,
                    engine = engine.name(),
                    "Engine overran its deadline, abandoning attempt"
                );
                QueryError::Timeout { after_ms: timeout_ms }
            }
        };

        if !error.is_retryable() || attempt > settings.max_retries {
            warn!(
                panel_id = %query.panel_id,
                ref_id = %query.ref_id,
                attempts = attempt,
                "Query failed: {}",
                error
            );
            return Err(error);
        }

        // Exponential backoff: base, 2x base, 4x base...
        let delay = settings.retry_backoff.saturating_mul(1 << (attempt - 1).min(16));
        warn!(
            panel_id = %query.panel_id,
            ref_id = %query.ref_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Transient failure, retrying: {}",
            error
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(QueryError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::engine::{CellValue, ColumnSpec, ColumnType, RowSet};
    use crate::execution::error::{EngineError, EngineErrorKind};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Engine whose behavior is picked by the SQL text
    #[derive(Default)]
    struct ScriptedEngine {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        attempts: Mutex<HashMap<String, usize>>,
    }

    impl ScriptedEngine {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn one_row(value: i64) -> RowSet {
            RowSet {
                columns: vec![ColumnSpec::new("n", ColumnType::Integer)],
                rows: vec![vec![CellValue::Int(value)]],
            }
        }
    }

    #[async_trait]
    impl SqlEngine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn run_query(&self, sql: &str, timeout: Duration) -> Result<RowSet, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let n = attempts.entry(sql.to_string()).or_insert(0);
                *n += 1;
                *n
            };

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let result = match sql {
                "slow" => {
                    let work = tokio::time::sleep(Duration::from_millis(500));
                    match tokio::time::timeout(timeout, work).await {
                        Ok(()) => Ok(Self::one_row(0)),
                        Err(_) => Err(EngineError::new(EngineErrorKind::Timeout, "deadline passed")),
                    }
                }
                // Ignores its deadline entirely
                "hung" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Self::one_row(0))
                }
                "sleep" => {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    Ok(Self::one_row(0))
                }
                "flaky" if attempt <= 2 => Err(EngineError::transient("connection reset")),
                "down" => Err(EngineError::unreachable("connection refused")),
                "bad" => Err(EngineError::syntax("near \"FORM\": syntax error")),
                "denied" => Err(EngineError::permission("403")),
                _ => Ok(Self::one_row(attempt as i64)),
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn health_check(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn settings(limit: usize) -> CoordinatorSettings {
        CoordinatorSettings {
            concurrency_limit: limit,
            query_timeout: Duration::from_millis(100),
            max_retries: 2,
            retry_backoff: Duration::from_millis(5),
        }
    }

    fn queries(sqls: &[&str]) -> Vec<ResolvedQuery> {
        sqls.iter()
            .enumerate()
            .map(|(i, sql)| ResolvedQuery::new(i.to_string(), "A", *sql))
            .collect()
    }

    #[tokio::test]
    async fn test_one_timeout_among_three() {
        let engine = Arc::new(ScriptedEngine::default());
        let coordinator = QueryCoordinator::new(engine.clone(), settings(3));

        let outcomes = coordinator
            .execute(&queries(&["ok1", "slow", "ok2"]), &CancelToken::new())
            .await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_ok());
        assert_eq!(outcomes[1], Err(QueryError::Timeout { after_ms: 100 }));
        assert!(outcomes[2].is_ok());
        // No duplicate dispatch, timeouts are not retried
        assert_eq!(engine.calls(), 3);
    }

    #[tokio::test]
    async fn test_engine_ignoring_deadline_is_abandoned() {
        let engine = Arc::new(ScriptedEngine::default());
        let coordinator = QueryCoordinator::new(engine.clone(), settings(2));

        let started = Instant::now();
        let outcomes = coordinator
            .execute(&queries(&["hung", "ok"]), &CancelToken::new())
            .await;

        assert_eq!(outcomes[0], Err(QueryError::Timeout { after_ms: 100 }));
        assert!(outcomes[1].is_ok());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(engine.calls(), 2);
    }

    #[test]
    fn test_grace_period_bounds() {
        assert_eq!(grace_period(Duration::from_millis(100)), Duration::from_millis(50));
        assert_eq!(grace_period(Duration::from_secs(10)), Duration::from_secs(1));
        assert_eq!(grace_period(Duration::from_secs(600)), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let engine = Arc::new(ScriptedEngine::default());
        let coordinator = QueryCoordinator::new(engine.clone(), settings(2));

        let outcomes = coordinator
            .execute(&queries(&["flaky", "ok"]), &CancelToken::new())
            .await;

        let result = outcomes[0].as_ref().unwrap();
        assert_eq!(result.rows, vec![vec![CellValue::Int(3)]]);
        assert!(outcomes[1].is_ok());
        // 2 queries + 2 retries
        assert_eq!(engine.calls(), 4);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let engine = Arc::new(ScriptedEngine::default());
        let coordinator = QueryCoordinator::new(engine.clone(), settings(1));

        let outcomes = coordinator.execute(&queries(&["down"]), &CancelToken::new()).await;

        assert!(matches!(outcomes[0], Err(QueryError::Transient { .. })));
        assert_eq!(engine.calls(), 3);
    }

    #[tokio::test]
    async fn test_syntax_and_permission_not_retried() {
        let engine = Arc::new(ScriptedEngine::default());
        let coordinator = QueryCoordinator::new(engine.clone(), settings(2));

        let outcomes = coordinator
            .execute(&queries(&["bad", "denied"]), &CancelToken::new())
            .await;

        assert!(matches!(outcomes[0], Err(QueryError::Syntax { .. })));
        assert!(matches!(outcomes[1], Err(QueryError::Permission { .. })));
        assert_eq!(engine.calls(), 2);
    }

    #[tokio::test]
    async fn test_results_keep_input_order() {
        let engine = Arc::new(ScriptedEngine::default());
        let coordinator = QueryCoordinator::new(engine, settings(4));

        let qs = queries(&["sleep", "a", "sleep", "b"]);
        let outcomes = coordinator.execute(&qs, &CancelToken::new()).await;

        for (query, outcome) in qs.iter().zip(&outcomes) {
            assert_eq!(outcome.as_ref().unwrap().panel_id, query.panel_id);
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let engine = Arc::new(ScriptedEngine::default());
        let coordinator = QueryCoordinator::new(engine.clone(), settings(2));

        let outcomes = coordinator
            .execute(&queries(&["sleep"; 6]), &CancelToken::new())
            .await;

        assert!(outcomes.iter().all(|o| o.is_ok()));
        assert!(engine.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let engine = Arc::new(ScriptedEngine::default());
        let coordinator = QueryCoordinator::new(engine.clone(), settings(2));
        let cancel = CancelToken::new();
        cancel.cancel();

        let outcomes = coordinator.execute(&queries(&["a", "b", "c"]), &cancel).await;

        assert!(outcomes.iter().all(|o| o == &Err(QueryError::Cancelled)));
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_lets_in_flight_finish() {
        let engine = Arc::new(ScriptedEngine::default());
        let coordinator = QueryCoordinator::new(engine.clone(), settings(1));
        let cancel = CancelToken::new();

        let trigger = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(15)).await;
                cancel.cancel();
            })
        };

        let outcomes = coordinator
            .execute(&queries(&["sleep", "sleep", "sleep"]), &cancel)
            .await;
        trigger.await.unwrap();

        let ok = outcomes.iter().filter(|o| o.is_ok()).count();
        let cancelled = outcomes
            .iter()
            .filter(|o| **o == Err(QueryError::Cancelled))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(cancelled, 2);
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let engine = Arc::new(ScriptedEngine::default());
        let coordinator = QueryCoordinator::new(engine, settings(2));
        assert!(coordinator.execute(&[], &CancelToken::new()).await.is_empty());
    }
}
