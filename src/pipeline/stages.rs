//! S1-S8: the canonical stage sequence (`spec.md` §4.9 /
//! "Data flow" in §2). Each stage is a zero-sized unit struct implementing
//! [`Stage`] — state lives in the [`Runtime`] bundle and the
//! [`ProcessingContext`], never in the stage itself.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::cost::TokenCounter;
use crate::document::{Document, DocumentStatus, ProcessingContext};
use crate::error::PipelineError;
use crate::hash::hash_file;
use crate::llm::types::{PromptMessages, UploadPurpose};
use crate::logging::{log_debug, log_warn};
use crate::observability::Severity;
use crate::transaction::{cleanup_llm_upload, CompensatingScope};

use super::{Outcome, Stage, StageOutcome};
use super::runtime::Runtime;

/// Fixed across every call so the provider can cache the prompt prefix
/// (`spec.md` §4.6: "system and developer messages are required to be
/// byte-identical across calls").
const SYSTEM_PROMPT: &str = "You are a document classification and metadata \
extraction engine. Given one attached document, extract the fields defined \
by the supplied JSON schema. Respond with a single JSON object matching \
that schema exactly. Do not include commentary outside the JSON object.";

const DEVELOPER_PROMPT: &str = "Classify the document's doc_type and \
doc_subtype, extract issuer/recipient/dates/amounts where present, write a \
concise summary, and list any action items or deadlines mentioned. If a \
field cannot be determined from the document, omit it rather than \
guessing. Quote a short verbatim excerpt (<=500 chars) in ocr_excerpt.";

fn extraction_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "doc_type": {"type": "string"},
            "doc_subtype": {"type": ["string", "null"]},
            "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
            "issuer": {"type": ["string", "null"]},
            "recipient": {"type": ["string", "null"]},
            "primary_date": {"type": ["string", "null"]},
            "secondary_date": {"type": ["string", "null"]},
            "total_amount": {"type": ["number", "null"]},
            "currency": {"type": ["string", "null"]},
            "summary": {"type": ["string", "null"]},
            "action_items": {"type": "array", "items": {"type": "string"}},
            "deadlines": {"type": "array", "items": {"type": "string"}},
            "urgency": {"type": ["string", "null"]},
            "tags": {"type": "array", "items": {"type": "string"}},
            "ocr_excerpt": {"type": ["string", "null"]},
            "language": {"type": ["string", "null"]}
        },
        "required": ["doc_type", "confidence"],
        "additionalProperties": false
    })
}

/// Validates the minimal required subset; anything else missing is
/// recorded but does not fail the stage (`spec.md` §7: "fail-soft for
/// per-doc schema (→ requires_review)").
fn validate_extraction(value: &serde_json::Value) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(obj) = value.as_object() else {
        return vec!["structured response is not a JSON object".to_string()];
    };
    if !obj.get("doc_type").is_some_and(|v| v.is_string()) {
        errors.push("doc_type missing or not a string".to_string());
    }
    if !obj.get("confidence").is_some_and(|v| v.is_number()) {
        errors.push("confidence missing or not a number".to_string());
    }
    errors
}

fn string_field(value: &serde_json::Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn f64_field(value: &serde_json::Value, key: &str) -> Option<f64> {
    value.get(key).and_then(|v| v.as_f64())
}

fn string_list_field(value: &serde_json::Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|i| i.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

/// S1 — populates `sha256_hex`/`sha256_b64url` from C1 and loads the file
/// bytes S4 will upload.
pub struct HashStage;

#[async_trait]
impl Stage for HashStage {
    fn name(&self) -> &str {
        "hash"
    }

    async fn execute(&self, mut ctx: ProcessingContext, _runtime: &Runtime) -> StageOutcome {
        let (hash, size) = match hash_file(&ctx.path).await {
            Ok(result) => result,
            Err(err) => return StageOutcome::Fatal(err),
        };
        let bytes = match tokio::fs::read(&ctx.path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                return StageOutcome::Fatal(PipelineError::io(ctx.path.display().to_string(), err.to_string()))
            }
        };

        let filename = ctx
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        ctx.sha256_hex = Some(hash.hex.clone());
        ctx.sha256_b64url = Some(hash.b64url.clone());
        ctx.bytes = Some(bytes);
        ctx.draft = Document::draft(hash.hex, hash.b64url, filename, size);

        StageOutcome::Continue(ctx)
    }
}

/// S2 — C5 lookup by hex. A live `completed` row is a duplicate; a live row
/// in any other status is resumed (reentrancy guarantee: a crash mid-job
/// does not require deleting the partial row first).
pub struct DedupCheckStage;

#[async_trait]
impl Stage for DedupCheckStage {
    fn name(&self) -> &str {
        "dedup_check"
    }

    async fn execute(&self, mut ctx: ProcessingContext, runtime: &Runtime) -> StageOutcome {
        let hex = ctx.sha256_hex.clone().expect("hash stage runs before dedup_check");

        match runtime.store.find_by_hash(&hex).await {
            Ok(Some(existing)) if existing.status == DocumentStatus::Completed => {
                StageOutcome::Skip(Outcome::Duplicate {
                    doc_id: existing.id.expect("persisted row has an id"),
                })
            }
            Ok(Some(existing)) => {
                log_debug!(doc_id = ?existing.id, status = %existing.status, "resuming a non-terminal row");
                ctx.draft = existing;
                StageOutcome::Continue(ctx)
            }
            Ok(None) => StageOutcome::Continue(ctx),
            Err(err) => StageOutcome::Fatal(err),
        }
    }
}

/// S3 — C2 pre-flight estimate; enforces `COST_ALERT_T3` as a hard ceiling
/// (Open Question resolution, see DESIGN.md: the spec names an "optional
/// per-document cost ceiling" without a dedicated config key, so this
/// reuses the top cost-alert threshold).
pub struct PreflightCostStage;

#[async_trait]
impl Stage for PreflightCostStage {
    fn name(&self) -> &str {
        "preflight_cost"
    }

    async fn execute(&self, ctx: ProcessingContext, runtime: &Runtime) -> StageOutcome {
        let counter = match TokenCounter::for_model(&runtime.config.llm_model) {
            Ok(c) => c,
            Err(err) => return StageOutcome::Fatal(err),
        };

        let user_prompt = format!("Extract metadata from {}.", ctx.draft.original_filename);
        let prompt_tokens =
            counter.count_request_tokens(SYSTEM_PROMPT, &[DEVELOPER_PROMPT, &user_prompt]);

        // No page count available before extraction (PDF text isn't parsed
        // client-side); size-based estimate at "medium" confidence per
        // `spec.md` §4.2.
        let output_estimate = ((ctx.draft.file_size_bytes as f64 / 1500.0).ceil() as u32).max(200);

        // No cached-token figure is available before the extraction call
        // runs, so the preflight estimate is a conservative upper bound
        // (all prompt tokens priced at the uncached rate).
        if let Some(estimate) =
            runtime.pricing.estimate_cost(&runtime.config.llm_model, prompt_tokens, 0, output_estimate)
        {
            log_debug!(estimate_usd = estimate, "preflight cost estimate");
            if estimate > runtime.config.cost_alert_thresholds.t3 {
                return StageOutcome::Fatal(PipelineError::validation(format!(
                    "preflight cost estimate ${estimate:.4} exceeds ceiling ${:.4}",
                    runtime.config.cost_alert_thresholds.t3
                )));
            }
        }

        StageOutcome::Continue(ctx)
    }
}

/// S4 — C6 `Upload`; opens the compensating scope the rest of the pipeline
/// carries until S7 commits or any later stage rolls it back.
pub struct UploadFileStage;

#[async_trait]
impl Stage for UploadFileStage {
    fn name(&self) -> &str {
        "upload_file"
    }

    async fn execute(&self, mut ctx: ProcessingContext, runtime: &Runtime) -> StageOutcome {
        if ctx.llm_file_id.is_some() {
            // Resumed row already has an uploaded file (reentrancy: a prior
            // crash happened after S4 but before S7 committed).
            return StageOutcome::Continue(ctx);
        }

        let bytes = ctx.bytes.clone().expect("hash stage populates bytes");
        let filename = ctx.draft.original_filename.clone();

        let file_id = match runtime.llm.upload_file(bytes, &filename, UploadPurpose::UserData).await {
            Ok(id) => id,
            Err(err) => return StageOutcome::Fatal(err),
        };

        let mut scope = CompensatingScope::new("pipeline");
        scope.register_compensation(
            "cleanup_llm_upload",
            cleanup_llm_upload(runtime.llm.clone(), file_id.clone()),
        );

        ctx.llm_file_id = Some(file_id.clone());
        ctx.draft.llm_file_id = Some(file_id);
        ctx.compensation = Some(scope);

        StageOutcome::Continue(ctx)
    }
}

/// S5 — C6 `ExtractMetadata` under C3 retry (retry lives inside the
/// `LlmClient` implementation). Schema-validation failures are recorded as
/// `validation_errors` and set `requires_review = true`; they do not fail
/// the stage.
pub struct ExtractStage;

#[async_trait]
impl Stage for ExtractStage {
    fn name(&self) -> &str {
        "extract"
    }

    async fn execute(&self, mut ctx: ProcessingContext, runtime: &Runtime) -> StageOutcome {
        let file_id = ctx.llm_file_id.clone().expect("upload_file runs before extract");
        let messages = PromptMessages {
            system: SYSTEM_PROMPT.to_string(),
            developer: DEVELOPER_PROMPT.to_string(),
            user: format!("Extract metadata from {}.", ctx.draft.original_filename),
        };

        let extraction = match runtime
            .llm
            .extract_metadata(&runtime.config.llm_model, &messages, &file_id, extraction_schema())
            .await
        {
            Ok(result) => result,
            Err(err) => return rollback_fatal(ctx, err).await,
        };

        let validation_errors = validate_extraction(&extraction.structured);
        ctx.draft.requires_review = !validation_errors.is_empty();
        ctx.draft.validation_errors = sqlx::types::Json(validation_errors);

        let structured = &extraction.structured;
        ctx.draft.doc_type = string_field(structured, "doc_type");
        ctx.draft.doc_subtype = string_field(structured, "doc_subtype");
        ctx.draft.confidence = f64_field(structured, "confidence");
        ctx.draft.issuer = string_field(structured, "issuer");
        ctx.draft.recipient = string_field(structured, "recipient");
        ctx.draft.primary_date = string_field(structured, "primary_date");
        ctx.draft.secondary_date = string_field(structured, "secondary_date");
        ctx.draft.total_amount = f64_field(structured, "total_amount");
        ctx.draft.currency = string_field(structured, "currency");
        ctx.draft.summary = string_field(structured, "summary");
        ctx.draft.action_items = sqlx::types::Json(string_list_field(structured, "action_items"));
        ctx.draft.deadlines = sqlx::types::Json(string_list_field(structured, "deadlines"));
        ctx.draft.urgency = string_field(structured, "urgency");
        ctx.draft.tags = sqlx::types::Json(string_list_field(structured, "tags"));
        ctx.draft.ocr_excerpt = string_field(structured, "ocr_excerpt").map(|s| s.chars().take(500).collect());
        ctx.draft.language = string_field(structured, "language");
        ctx.draft.raw_response = Some(sqlx::types::Json(extraction.raw.clone()));
        ctx.draft.prompt_tokens = Some(extraction.usage.prompt_tokens as i64);
        ctx.draft.completion_tokens = Some(extraction.usage.output_tokens as i64);
        ctx.draft.cached_tokens = Some(extraction.usage.cached_tokens as i64);
        ctx.draft.model_used = Some(runtime.config.llm_model.clone());

        StageOutcome::Continue(ctx)
    }
}

/// Unwinds `ctx.compensation` (if any) and returns the original error as
/// `Fatal`, per `spec.md` §4.4: "always re-raise the original error, never
/// the compensation error."
async fn rollback_fatal(mut ctx: ProcessingContext, err: PipelineError) -> StageOutcome {
    if let Some(scope) = ctx.compensation.take() {
        let (audit, original) = scope.rollback(err).await;
        log_warn!(stage = %audit.stage, status = ?audit.status, "compensation audit");
        StageOutcome::Fatal(original)
    } else {
        StageOutcome::Fatal(err)
    }
}

/// S6 — C2 translates `usage` into `cost_usd`; updates observability
/// counters and evaluates cost-alert thresholds. An unpriced model yields
/// `cost_usd = None`, which is a configuration gap, not a processing
/// failure (`spec.md` §4.2).
pub struct CostComputeStage;

#[async_trait]
impl Stage for CostComputeStage {
    fn name(&self) -> &str {
        "cost_compute"
    }

    async fn execute(&self, mut ctx: ProcessingContext, runtime: &Runtime) -> StageOutcome {
        let prompt_tokens = ctx.draft.prompt_tokens.unwrap_or(0) as u32;
        let cached_tokens = ctx.draft.cached_tokens.unwrap_or(0) as u32;
        let completion_tokens = ctx.draft.completion_tokens.unwrap_or(0) as u32;

        let cost =
            runtime.pricing.estimate_cost(&runtime.config.llm_model, prompt_tokens, cached_tokens, completion_tokens);
        if cost.is_none() {
            log_warn!(model = %runtime.config.llm_model, "no pricing entry for model; cost_usd left unset");
        }
        ctx.draft.cost_usd = cost;
        ctx.draft.processed_at = Some(Utc::now());

        if let Some(cost) = cost {
            runtime.metrics.record("cost_usd", cost);
            let thresholds = &runtime.config.cost_alert_thresholds;
            let (kind, severity) = if cost >= thresholds.t3 {
                ("cost_alert_t3", Severity::Critical)
            } else if cost >= thresholds.t2 {
                ("cost_alert_t2", Severity::Error)
            } else if cost >= thresholds.t1 {
                ("cost_alert_t1", Severity::Warning)
            } else {
                ("", Severity::Info)
            };
            if !kind.is_empty() {
                runtime.alerts.fire("cost_compute", kind, severity, &format!("document cost ${cost:.4}"));
            }
        }

        StageOutcome::Continue(ctx)
    }
}

/// S7 — within a C4 scope, insert/update the Document row. Commits the
/// scope (discarding the LLM-upload compensation) on success; rolls it
/// back on failure, so a DB error never leaves an orphaned uploaded file.
pub struct PersistStage;

#[async_trait]
impl Stage for PersistStage {
    fn name(&self) -> &str {
        "persist"
    }

    async fn execute(&self, mut ctx: ProcessingContext, runtime: &Runtime) -> StageOutcome {
        ctx.draft.status = DocumentStatus::Completed;
        if let Err(err) = ctx.draft.check_invariants() {
            return rollback_fatal(ctx, err).await;
        }

        let persisted = if ctx.draft.id.is_some() {
            runtime.store.update(ctx.draft.clone()).await
        } else {
            runtime.store.insert(ctx.draft.clone()).await
        };

        match persisted {
            Ok(doc) => {
                if let Some(scope) = ctx.compensation.take() {
                    ctx.audit.push(scope.commit());
                }
                ctx.draft = doc;
                StageOutcome::Continue(ctx)
            }
            // Lost a persist-time race against another worker inserting the
            // same content hash: this is I1/§7's expected duplicate outcome,
            // not a pipeline failure. The LLM upload this worker already
            // made is unneeded, so roll it back, but resolve the document
            // as a success.
            Err(err @ PipelineError::DuplicateHash { .. }) => {
                let doc_id = match &err {
                    PipelineError::DuplicateHash { doc_id } => *doc_id,
                    _ => unreachable!(),
                };
                if let Some(scope) = ctx.compensation.take() {
                    let (audit, _original) = scope.rollback(err).await;
                    log_warn!(stage = %audit.stage, status = ?audit.status, "compensation audit (duplicate race)");
                }
                StageOutcome::Skip(Outcome::Duplicate { doc_id })
            }
            Err(err) => rollback_fatal(ctx, err).await,
        }
    }
}

/// S8 — C7 `AttachFile`. On success records `vector_store_file_id`; on
/// failure marks `status = vector_upload_failed` without failing the
/// document (`spec.md` §4.9/E6). Separately, best-effort batch-embeds the
/// summary text through C8 for later semantic search.
pub struct AttachVectorStage;

#[async_trait]
impl Stage for AttachVectorStage {
    fn name(&self) -> &str {
        "attach_vector"
    }

    async fn execute(&self, mut ctx: ProcessingContext, runtime: &Runtime) -> StageOutcome {
        let file_id = ctx
            .draft
            .llm_file_id
            .clone()
            .expect("persist stage guarantees llm_file_id on a completed row");

        let attach_result = runtime
            .vector_store
            .attach_file(&runtime.vector_store_id, &file_id, Duration::from_secs(120))
            .await;

        let doc = match attach_result {
            Ok(vsf_id) => {
                ctx.draft.vector_store_file_id = Some(vsf_id);
                match runtime.store.update(ctx.draft.clone()).await {
                    Ok(doc) => doc,
                    Err(err) => return StageOutcome::Fatal(err),
                }
            }
            Err(err) => {
                log_warn!(error = %err, "vector attach failed, marking vector_upload_failed");
                ctx.draft.status = DocumentStatus::VectorUploadFailed;
                match runtime.store.update(ctx.draft.clone()).await {
                    Ok(doc) => doc,
                    Err(update_err) => return StageOutcome::Fatal(update_err),
                }
            }
        };

        if let Some(summary) = doc.summary.clone() {
            if let Err(err) = runtime.embedding_cache.get_or_embed(&runtime.config.embedding_model, &summary).await {
                log_warn!(error = %err, "best-effort summary embedding failed");
            }
        }

        let outcome = if doc.status == DocumentStatus::VectorUploadFailed {
            Outcome::VectorUploadFailed(doc)
        } else {
            Outcome::Completed(doc)
        };
        StageOutcome::Skip(outcome)
    }
}
