//! Pipeline Orchestrator (C9) — composes the eight S1-S8 stages
//! (`spec.md` §4.9) into an ordered, resumable pipeline over one
//! `ProcessingContext` per document.
//!
//! Mirrors Design Notes §9's "polymorphic stage, no inheritance": each
//! stage is a value implementing [`Stage`], held in a flat
//! `Vec<Box<dyn Stage>>` rather than a class hierarchy. The orchestrator
//! itself carries no business logic beyond stage sequencing and
//! compensation bookkeeping.

pub mod runtime;
pub mod stages;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::document::{Deadline, Document, ProcessingContext};
use crate::error::PipelineError;
use crate::logging::{log_error, log_info, log_warn};

pub use runtime::Runtime;

/// Terminal result of a completed [`Pipeline::process`] call.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Extraction, persistence, and vector registration all succeeded.
    Completed(Document),
    /// A live row already existed for this content hash with
    /// `status=completed`; no work was done.
    Duplicate { doc_id: i64 },
    /// Extraction and persistence succeeded but the vector store attach
    /// failed; best-effort, does not fail the whole document.
    VectorUploadFailed(Document),
}

impl Outcome {
    pub fn doc_id(&self) -> Option<i64> {
        match self {
            Self::Completed(doc) | Self::VectorUploadFailed(doc) => doc.id,
            Self::Duplicate { doc_id } => Some(*doc_id),
        }
    }
}

/// What a stage hands back to the orchestrator.
///
/// `Retryable` and `Fatal` are both terminal as far as the orchestrator is
/// concerned: C6/C7 already retry their own operations internally under
/// C3, so by the time a stage returns either variant the retry budget for
/// that operation is exhausted. The two are kept distinct (rather than
/// collapsed into one) because they carry different alerting weight —
/// `Retryable` surfaces as a transient-collaborator alert, `Fatal` as an
/// internal-invariant one — even though both currently abort the document.
/// Whichever variant is returned, the stage must have already unwound its
/// own compensation scope (via `ctx.compensation`) before returning, per
/// Design Notes §9 ("compensations run on every exit path").
pub enum StageOutcome {
    Continue(ProcessingContext),
    Skip(Outcome),
    Retryable(PipelineError),
    Fatal(PipelineError),
}

/// One step of the pipeline (`spec.md` §4.9: "Name; Execute(ctx) →
/// (ctx|Skip|Error)"). `runtime` carries every shared dependency a stage
/// might need; stages that don't need it simply ignore the parameter.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: ProcessingContext, runtime: &Runtime) -> StageOutcome;
}

/// An ordered, resumable pipeline: a fixed stage sequence plus the shared
/// [`Runtime`] bundle every stage executes against.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    runtime: Arc<Runtime>,
}

impl Pipeline {
    /// The canonical S1-S8 sequence from `spec.md` §4.9.
    pub fn new(runtime: Arc<Runtime>) -> Self {
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(stages::HashStage),
            Box::new(stages::DedupCheckStage),
            Box::new(stages::PreflightCostStage),
            Box::new(stages::UploadFileStage),
            Box::new(stages::ExtractStage),
            Box::new(stages::CostComputeStage),
            Box::new(stages::PersistStage),
            Box::new(stages::AttachVectorStage),
        ];
        Self { stages, runtime }
    }

    /// Constructs a pipeline from a caller-supplied stage list. Tests use
    /// this to substitute fakes for a subset of S1-S8 without touching the
    /// canonical ordering used in production.
    pub fn with_stages(runtime: Arc<Runtime>, stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages, runtime }
    }

    /// Runs one file through every stage. Reentrant: calling this twice for
    /// the same content hash returns `Duplicate` the second time (P4); a
    /// crash mid-pipeline leaves no orphaned external resource (P5, I4) and
    /// the next call for the same path re-uploads and continues.
    pub async fn process(&self, path: PathBuf) -> Result<Outcome, PipelineError> {
        self.process_with_timeout(path, Some(self.runtime.document_timeout())).await
    }

    pub async fn process_with_timeout(
        &self,
        path: PathBuf,
        timeout: Option<Duration>,
    ) -> Result<Outcome, PipelineError> {
        let deadline = Deadline::new(timeout);
        let mut ctx = ProcessingContext::new(path.clone(), deadline);

        log_info!(path = %path.display(), job_id = %ctx.job_id, "pipeline started");

        for stage in &self.stages {
            ctx.deadline.check()?;

            match stage.execute(ctx, &self.runtime).await {
                StageOutcome::Continue(next_ctx) => {
                    ctx = next_ctx;
                }
                StageOutcome::Skip(outcome) => {
                    log_info!(
                        path = %path.display(),
                        stage = stage.name(),
                        "pipeline stopped early"
                    );
                    return Ok(outcome);
                }
                StageOutcome::Retryable(err) => {
                    log_warn!(
                        path = %path.display(),
                        stage = stage.name(),
                        error = %err,
                        "pipeline stage exhausted its retries"
                    );
                    self.runtime.alerts.fire(
                        stage.name(),
                        "retries_exhausted",
                        crate::observability::Severity::Error,
                        &err.truncated_message(),
                    );
                    return Err(err);
                }
                StageOutcome::Fatal(err) => {
                    log_error!(
                        path = %path.display(),
                        stage = stage.name(),
                        error = %err,
                        "pipeline stage failed"
                    );
                    return Err(err);
                }
            }
        }

        // Every stage returned Continue; the last stage (S8) is expected to
        // have produced a terminal outcome via Skip. Reaching here means a
        // stage list was constructed without a terminal stage (tests only).
        Ok(Outcome::Completed(ctx.draft))
    }
}
