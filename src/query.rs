//! The execution port.
//!
//! The SQL executor proper lives outside this crate; the engine sees it
//! only as a [`QueryBackend`]. The [`QueryRouter`] carries one
//! connection's query onto the shared pool and the outcome back, waking
//! the connection when the result is ready.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::sql_state;
use crate::tasks::{WakeHandle, WorkerPool};

/// Result of executing one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    /// The query string was empty.
    Empty,
    /// Command completed without a result set; the tag is sent verbatim
    /// in CommandComplete.
    Command { tag: String },
    /// Query produced rows; values travel in text format, `None` is NULL.
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Option<String>>>,
    },
    /// Execution failed; reported to the client as an ErrorResponse.
    Error {
        code: &'static str,
        message: String,
    },
}

/// Executes SQL on behalf of connections. Implementations must tolerate
/// being called from pool threads concurrently.
pub trait QueryBackend: Send + Sync {
    fn execute(&self, sql: &str) -> QueryOutcome;
}

/// The built-in backend: accepts connections and answers every query
/// with a well-formed error, keeping the session alive. Real executors
/// replace it through the [`QueryBackend`] trait.
pub struct LocalBackend;

impl QueryBackend for LocalBackend {
    fn execute(&self, sql: &str) -> QueryOutcome {
        if sql.trim().is_empty() {
            QueryOutcome::Empty
        } else {
            QueryOutcome::Error {
                code: sql_state::FEATURE_NOT_SUPPORTED,
                message: "query execution is not available on this server".to_string(),
            }
        }
    }
}

/// Routes one connection's queries onto the execution pool.
///
/// At most one query is in flight per connection: the protocol defers a
/// query, parks the connection, and collects the outcome after the wake
/// handle fires.
pub struct QueryRouter {
    backend: Arc<dyn QueryBackend>,
    pool: WorkerPool,
    slot: Arc<Mutex<Option<QueryOutcome>>>,
    wake: Option<WakeHandle>,
}

impl QueryRouter {
    pub fn new(backend: Arc<dyn QueryBackend>, pool: WorkerPool) -> Self {
        Self {
            backend,
            pool,
            slot: Arc::new(Mutex::new(None)),
            wake: None,
        }
    }

    /// Installs the wake handle fired on completion.
    pub fn set_wake_handle(&mut self, wake: WakeHandle) {
        self.wake = Some(wake);
    }

    /// Hands the query to the pool. The outcome lands in the slot and
    /// the wake handle fires, in that order.
    pub fn submit(&self, sql: String) {
        let backend = Arc::clone(&self.backend);
        let slot = Arc::clone(&self.slot);
        let wake = self.wake.clone();
        self.pool.submit(Box::new(move || {
            let outcome = backend.execute(&sql);
            *slot.lock() = Some(outcome);
            if let Some(wake) = wake {
                wake.wake();
            }
        }));
    }

    /// Takes the completed outcome, if any.
    pub fn take_outcome(&self) -> Option<QueryOutcome> {
        self.slot.lock().take()
    }

    /// Drops any in-flight result.
    pub fn reset(&mut self) {
        *self.slot.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_local_backend_empty_query() {
        assert_eq!(LocalBackend.execute("   "), QueryOutcome::Empty);
    }

    #[test]
    fn test_local_backend_rejects_sql() {
        match LocalBackend.execute("SELECT 1") {
            QueryOutcome::Error { code, .. } => {
                assert_eq!(code, sql_state::FEATURE_NOT_SUPPORTED);
            }
            other => panic!("expected error outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_router_delivers_outcome_and_wakes() {
        let mut router = QueryRouter::new(Arc::new(LocalBackend), WorkerPool::new(1));
        let wake = WakeHandle::new();
        router.set_wake_handle(wake.clone());

        assert!(router.take_outcome().is_none());
        router.submit("".to_string());

        tokio::time::timeout(Duration::from_secs(5), wake.woken())
            .await
            .unwrap();
        assert_eq!(router.take_outcome(), Some(QueryOutcome::Empty));
        assert!(router.take_outcome().is_none());
    }
}
