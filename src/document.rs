//! The durable `Document` row and the ephemeral `ProcessingContext` that
//! builds one (C5's data model, owned by this module so both the store and
//! the orchestrator depend on the same types).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Closed status set a `Document` moves through. Maps to a `TEXT` column
/// via `sqlx::Type`, never a free string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Duplicate,
    VectorUploadFailed,
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Duplicate => "duplicate",
            Self::VectorUploadFailed => "vector_upload_failed",
        };
        f.write_str(s)
    }
}

/// The durable row. `raw_response` is an opaque tagged JSON blob
/// (`sqlx::types::Json`), not an untyped map threaded through accessors.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Document {
    pub id: Option<i64>,
    pub sha256_hex: String,
    pub sha256_b64url: String,
    pub original_filename: String,
    pub file_size_bytes: i64,
    pub page_count: Option<i32>,

    pub doc_type: Option<String>,
    pub doc_subtype: Option<String>,
    pub confidence: Option<f64>,

    pub issuer: Option<String>,
    pub recipient: Option<String>,
    pub primary_date: Option<String>,
    pub secondary_date: Option<String>,
    pub total_amount: Option<f64>,
    pub currency: Option<String>,
    pub summary: Option<String>,
    pub action_items: Json<Vec<String>>,
    pub deadlines: Json<Vec<String>>,
    pub urgency: Option<String>,
    pub tags: Json<Vec<String>>,

    pub ocr_excerpt: Option<String>,
    pub language: Option<String>,

    pub llm_file_id: Option<String>,
    pub vector_store_file_id: Option<String>,

    pub processed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub model_used: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub cached_tokens: Option<i64>,
    pub cost_usd: Option<f64>,

    pub extraction_quality: Option<String>,
    pub validation_errors: Json<Vec<String>>,
    pub requires_review: bool,

    pub raw_response: Option<Json<serde_json::Value>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,

    pub status: DocumentStatus,
}

impl Document {
    /// A fresh draft for a newly-hashed file, before any LLM call.
    pub fn draft(sha256_hex: String, sha256_b64url: String, original_filename: String, file_size_bytes: u64) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            sha256_hex,
            sha256_b64url,
            original_filename,
            file_size_bytes: file_size_bytes as i64,
            page_count: None,
            doc_type: None,
            doc_subtype: None,
            confidence: None,
            issuer: None,
            recipient: None,
            primary_date: None,
            secondary_date: None,
            total_amount: None,
            currency: None,
            summary: None,
            action_items: Json(Vec::new()),
            deadlines: Json(Vec::new()),
            urgency: None,
            tags: Json(Vec::new()),
            ocr_excerpt: None,
            language: None,
            llm_file_id: None,
            vector_store_file_id: None,
            processed_at: None,
            duration_ms: None,
            model_used: None,
            prompt_tokens: None,
            completion_tokens: None,
            cached_tokens: None,
            cost_usd: None,
            extraction_quality: None,
            validation_errors: Json(Vec::new()),
            requires_review: false,
            raw_response: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            status: DocumentStatus::Pending,
        }
    }

    /// I2: `completed` requires `llm_file_id` and `cost_usd`. I3: cached
    /// tokens never exceed prompt tokens. Checked before persist (S7).
    pub fn check_invariants(&self) -> Result<(), crate::error::PipelineError> {
        if self.status == DocumentStatus::Completed
            && (self.llm_file_id.is_none() || self.cost_usd.is_none())
        {
            return Err(crate::error::PipelineError::internal(
                "completed document missing llm_file_id or cost_usd (I2)",
            ));
        }
        if let (Some(cached), Some(prompt)) = (self.cached_tokens, self.prompt_tokens) {
            if cached > prompt {
                return Err(crate::error::PipelineError::internal(
                    "cached_tokens exceeds prompt_tokens (I3)",
                ));
            }
        }
        if self.updated_at < self.created_at {
            return Err(crate::error::PipelineError::internal(
                "updated_at precedes created_at (I5)",
            ));
        }
        if let Some(deleted_at) = self.deleted_at {
            if deleted_at < self.created_at {
                return Err(crate::error::PipelineError::internal(
                    "deleted_at precedes created_at (I5)",
                ));
            }
        }
        Ok(())
    }

    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Hand-rolled cancellation/deadline token. `tokio-util`'s `CancellationToken`
/// isn't part of this stack, so cancellation is an `Arc<AtomicBool>` flag
/// plus an optional wall-clock deadline, checked at stage boundaries.
#[derive(Clone)]
pub struct Deadline {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Deadline {
    pub fn new(timeout: Option<std::time::Duration>) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: timeout.map(|d| Instant::now() + d),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True if explicitly cancelled or the deadline has passed.
    pub fn is_expired(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    pub fn check(&self) -> Result<(), crate::error::PipelineError> {
        if self.is_expired() {
            Err(crate::error::PipelineError::cancelled(
                "job deadline exceeded or cancelled",
            ))
        } else {
            Ok(())
        }
    }
}

/// Ephemeral per-job state the orchestrator threads through every stage.
pub struct ProcessingContext {
    pub job_id: Uuid,
    pub path: std::path::PathBuf,
    pub bytes: Option<Vec<u8>>,
    pub sha256_hex: Option<String>,
    pub sha256_b64url: Option<String>,
    pub draft: Document,
    pub llm_file_id: Option<String>,
    pub vector_store_file_id: Option<String>,
    pub audit: Vec<crate::transaction::TransactionAudit>,
    pub deadline: Deadline,
    /// Open compensating-transaction scope, live from the moment an LLM
    /// upload succeeds (S4) until S7 either commits it (persist succeeds)
    /// or rolls it back (any later stage fails fatally). `None` before S4
    /// and after a commit.
    pub compensation: Option<crate::transaction::CompensatingScope>,
}

impl ProcessingContext {
    pub fn new(path: std::path::PathBuf, deadline: Deadline) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            draft: Document::draft(String::new(), String::new(), String::new(), 0),
            path,
            bytes: None,
            sha256_hex: None,
            sha256_b64url: None,
            llm_file_id: None,
            vector_store_file_id: None,
            audit: Vec::new(),
            deadline,
            compensation: None,
        }
    }
}
