//! Compensating transaction scope (C4).
//!
//! A scoped block that registers undo actions as side effects occur, then
//! either commits (discarding them) or rolls back and runs them in reverse
//! order. Modeled on the retry executor's struct-holding-mutable-state
//! shape rather than a context-manager: callers hold a `CompensatingScope`,
//! push compensations onto it, then call `commit` or `rollback` explicitly.

use crate::error::PipelineError;
use crate::logging::{log_error, log_info, log_warn};

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of running a single compensation handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationStatus {
    Success,
    Failed { error: String },
}

/// One compensation handler's audit record.
#[derive(Debug, Clone)]
pub struct CompensationRecord {
    pub name: String,
    pub ran_at: DateTime<Utc>,
    pub status: CompensationStatus,
}

/// Terminal status of a [`CompensatingScope`], mirroring `spec.md`'s
/// `TransactionAudit.status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    Success,
    Failed,
    Compensated,
    CompensationFailed,
}

/// Audit trail for one scope, independent of whether it's persisted.
#[derive(Debug, Clone)]
pub struct TransactionAudit {
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub status: TransactionStatus,
    pub original_error: Option<String>,
    pub compensations: Vec<CompensationRecord>,
}

/// A scoped compensating-transaction block.
///
/// Register undo actions with [`register_compensation`](Self::register_compensation)
/// as side effects occur (e.g. right after an LLM file upload succeeds).
/// Call [`commit`](Self::commit) on the happy path, or
/// [`rollback`](Self::rollback) with the triggering error — compensations
/// always run LIFO and the original error is always what's returned, never
/// a compensation failure.
pub struct CompensatingScope {
    stage: String,
    started_at: DateTime<Utc>,
    compensations: Vec<(String, BoxFuture<'static, Result<(), PipelineError>>)>,
}

impl CompensatingScope {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            started_at: Utc::now(),
            compensations: Vec::new(),
        }
    }

    /// Registers an undo action. Pushed onto a stack; run LIFO on rollback.
    pub fn register_compensation<F>(&mut self, name: impl Into<String>, action: F)
    where
        F: Future<Output = Result<(), PipelineError>> + Send + 'static,
    {
        self.compensations.push((name.into(), Box::pin(action)));
    }

    /// Happy path: discard compensations, record `committed_at`.
    pub fn commit(self) -> TransactionAudit {
        log_info!(stage = %self.stage, "compensating scope committed");
        TransactionAudit {
            stage: self.stage,
            started_at: self.started_at,
            committed_at: Some(Utc::now()),
            rolled_back_at: None,
            status: TransactionStatus::Success,
            original_error: None,
            compensations: Vec::new(),
        }
    }

    /// Failure path: run every registered compensation in reverse order.
    /// Always returns `original_error`, even if a compensation fails — per
    /// `spec.md` §4.4, a compensation failure is recorded but never
    /// surfaces in place of the original.
    pub async fn rollback(mut self, original_error: PipelineError) -> (TransactionAudit, PipelineError) {
        log_warn!(
            stage = %self.stage,
            error = %original_error,
            compensation_count = self.compensations.len(),
            "compensating scope rolling back"
        );

        let mut records = Vec::with_capacity(self.compensations.len());
        let mut any_failed = false;

        while let Some((name, action)) = self.compensations.pop() {
            let ran_at = Utc::now();
            match action.await {
                Ok(()) => {
                    log_info!(name = %name, "compensation succeeded");
                    records.push(CompensationRecord {
                        name,
                        ran_at,
                        status: CompensationStatus::Success,
                    });
                }
                Err(err) => {
                    any_failed = true;
                    log_error!(name = %name, error = %err, "compensation failed");
                    records.push(CompensationRecord {
                        name,
                        ran_at,
                        status: CompensationStatus::Failed {
                            error: err.to_string(),
                        },
                    });
                }
            }
        }

        let status = if any_failed {
            TransactionStatus::CompensationFailed
        } else if records.is_empty() {
            TransactionStatus::Failed
        } else {
            TransactionStatus::Compensated
        };

        let audit = TransactionAudit {
            stage: self.stage,
            started_at: self.started_at,
            committed_at: None,
            rolled_back_at: Some(Utc::now()),
            status,
            original_error: Some(original_error.to_string()),
            compensations: records,
        };

        (audit, original_error)
    }
}

/// Pre-built compensation: delete an uploaded LLM file.
pub fn cleanup_llm_upload(
    llm: std::sync::Arc<dyn crate::llm::LlmClient>,
    file_id: String,
) -> impl Future<Output = Result<(), PipelineError>> + Send + 'static {
    async move { llm.delete_file(&file_id).await }
}

/// Pre-built compensation: detach a file from a vector store.
pub fn cleanup_vector_store(
    vector_store: std::sync::Arc<dyn crate::vector_store::VectorStoreClient>,
    store_id: String,
    file_id: String,
) -> impl Future<Output = Result<(), PipelineError>> + Send + 'static {
    async move { vector_store.detach_file(&store_id, &file_id).await }
}

/// Runs a list of cleanups LIFO, collecting (not short-circuiting on) errors.
pub async fn cleanup_multi(
    actions: Vec<BoxFuture<'static, Result<(), PipelineError>>>,
) -> Vec<Result<(), PipelineError>> {
    let mut results = Vec::with_capacity(actions.len());
    for action in actions.into_iter().rev() {
        results.push(action.await);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn commit_discards_compensations_and_sets_committed_at() {
        let mut scope = CompensatingScope::new("persist");
        scope.register_compensation("noop", async { Ok(()) });
        let audit = scope.commit();
        assert_eq!(audit.status, TransactionStatus::Success);
        assert!(audit.committed_at.is_some());
        assert!(audit.rolled_back_at.is_none());
    }

    #[tokio::test]
    async fn rollback_runs_compensations_in_lifo_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut scope = CompensatingScope::new("persist");

        let o1 = order.clone();
        scope.register_compensation("first", async move {
            o1.lock().unwrap().push("first");
            Ok(())
        });
        let o2 = order.clone();
        scope.register_compensation("second", async move {
            o2.lock().unwrap().push("second");
            Ok(())
        });

        let original = PipelineError::internal("boom");
        let (audit, returned) = scope.rollback(original).await;

        assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
        assert_eq!(audit.status, TransactionStatus::Compensated);
        assert!(matches!(returned, PipelineError::Internal { .. }));
    }

    #[tokio::test]
    async fn rollback_always_reraises_original_error_even_if_compensation_fails() {
        let mut scope = CompensatingScope::new("persist");
        scope.register_compensation("fails", async {
            Err(PipelineError::transient("llm", "boom", None))
        });

        let original = PipelineError::internal("original failure");
        let original_msg = original.to_string();
        let (audit, returned) = scope.rollback(original).await;

        assert_eq!(audit.status, TransactionStatus::CompensationFailed);
        assert_eq!(returned.to_string(), original_msg);
    }

    #[tokio::test]
    async fn compensations_run_exactly_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut scope = CompensatingScope::new("persist");
        let c = calls.clone();
        scope.register_compensation("once", async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let _ = scope.rollback(PipelineError::internal("x")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
