//! Durable `Document` store (C5).
//!
//! `DocumentStore` mirrors the teacher's `ProviderConfig` idiom — a trait
//! plus concrete structs per backend, switched on explicitly at startup
//! rather than via a runtime-polymorphic factory. SQLite is the dev
//! backend; Postgres is the production one. Migrations are embedded with
//! `sqlx::migrate!` and run once at `Runtime` construction.

use crate::document::{Document, DocumentStatus};
use crate::error::PipelineError;
use crate::logging::log_debug;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, SqlitePool};

/// The sole durable store for `Document` rows (`spec.md` §4.5). Does not
/// perform I/O for external resources; cooperates with `transaction`
/// (C4) for cross-resource consistency.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Consults only live (non-soft-deleted) rows.
    async fn find_by_hash(&self, sha256_hex: &str) -> Result<Option<Document>, PipelineError>;

    /// Assigns `id`, sets `created_at = updated_at = now`. Fails with
    /// [`PipelineError::DuplicateHash`] if a live row with the same hash
    /// already exists (I1).
    async fn insert(&self, draft: Document) -> Result<Document, PipelineError>;

    /// Advances `updated_at`. Forbidden on soft-deleted rows.
    async fn update(&self, doc: Document) -> Result<Document, PipelineError>;

    /// Sets `deleted_at`.
    async fn soft_delete(&self, id: i64) -> Result<(), PipelineError>;

    /// Trivial round trip.
    async fn health_check(&self) -> bool;
}

/// SQLite-backed store, the development default (`DB_URL=sqlite://...`).
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub async fn connect(url: &str) -> Result<Self, PipelineError> {
        let pool = SqlitePool::connect(url)
            .await
            .map_err(|e| PipelineError::store(format!("sqlite connect failed: {e}")))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| PipelineError::store(format!("migration failed: {e}")))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn find_by_hash(&self, sha256_hex: &str) -> Result<Option<Document>, PipelineError> {
        sqlx::query_as::<_, Document>(
            "SELECT * FROM documents WHERE sha256_hex = ?1 AND deleted_at IS NULL",
        )
        .bind(sha256_hex)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PipelineError::store(format!("find_by_hash failed: {e}")))
    }

    async fn insert(&self, mut draft: Document) -> Result<Document, PipelineError> {
        let now = Utc::now();
        draft.created_at = now;
        draft.updated_at = now;

        if self.find_by_hash(&draft.sha256_hex).await?.is_some() {
            let existing = self.find_by_hash(&draft.sha256_hex).await?.unwrap();
            return Err(PipelineError::duplicate_hash(existing.id.unwrap_or_default()));
        }

        let result = sqlx::query_as::<_, Document>(
            r#"
            INSERT INTO documents (
                sha256_hex, sha256_b64url, original_filename, file_size_bytes, page_count,
                doc_type, doc_subtype, confidence,
                issuer, recipient, primary_date, secondary_date, total_amount, currency,
                summary, action_items, deadlines, urgency, tags,
                ocr_excerpt, language,
                llm_file_id, vector_store_file_id,
                processed_at, duration_ms, model_used, prompt_tokens, completion_tokens,
                cached_tokens, cost_usd,
                extraction_quality, validation_errors, requires_review,
                raw_response,
                created_at, updated_at, deleted_at, status
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
                ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33, ?34,
                ?35, ?36, ?37, ?38
            )
            RETURNING *
            "#,
        )
        .bind(&draft.sha256_hex)
        .bind(&draft.sha256_b64url)
        .bind(&draft.original_filename)
        .bind(draft.file_size_bytes)
        .bind(draft.page_count)
        .bind(&draft.doc_type)
        .bind(&draft.doc_subtype)
        .bind(draft.confidence)
        .bind(&draft.issuer)
        .bind(&draft.recipient)
        .bind(&draft.primary_date)
        .bind(&draft.secondary_date)
        .bind(draft.total_amount)
        .bind(&draft.currency)
        .bind(&draft.summary)
        .bind(&draft.action_items)
        .bind(&draft.deadlines)
        .bind(&draft.urgency)
        .bind(&draft.tags)
        .bind(&draft.ocr_excerpt)
        .bind(&draft.language)
        .bind(&draft.llm_file_id)
        .bind(&draft.vector_store_file_id)
        .bind(draft.processed_at)
        .bind(draft.duration_ms)
        .bind(&draft.model_used)
        .bind(draft.prompt_tokens)
        .bind(draft.completion_tokens)
        .bind(draft.cached_tokens)
        .bind(draft.cost_usd)
        .bind(&draft.extraction_quality)
        .bind(&draft.validation_errors)
        .bind(draft.requires_review)
        .bind(&draft.raw_response)
        .bind(draft.created_at)
        .bind(draft.updated_at)
        .bind(draft.deleted_at)
        .bind(draft.status)
        .fetch_one(&self.pool)
        .await;

        let row = match result {
            Ok(row) => row,
            Err(e) if is_unique_violation(&e) => {
                // Lost the insert race against another worker; look up the
                // row that won so the caller gets its real id, not a
                // placeholder.
                let existing = self.find_by_hash(&draft.sha256_hex).await?;
                return Err(PipelineError::duplicate_hash(
                    existing.and_then(|d| d.id).unwrap_or_default(),
                ));
            }
            Err(e) => return Err(PipelineError::store(format!("insert failed: {e}"))),
        };

        log_debug!(doc_id = row.id, hash = %row.sha256_hex, "document inserted");
        Ok(row)
    }

    async fn update(&self, mut doc: Document) -> Result<Document, PipelineError> {
        let Some(id) = doc.id else {
            return Err(PipelineError::internal("update called on a document with no id"));
        };

        let current = sqlx::query_as::<_, Document>("SELECT * FROM documents WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PipelineError::store(format!("update lookup failed: {e}")))?
            .ok_or_else(|| PipelineError::internal(format!("document {id} not found for update")))?;

        if !current.is_live() {
            return Err(PipelineError::validation(format!(
                "cannot update soft-deleted document {id}"
            )));
        }

        doc.updated_at = Utc::now();

        sqlx::query(
            r#"
            UPDATE documents SET
                doc_type = ?1, doc_subtype = ?2, confidence = ?3,
                issuer = ?4, recipient = ?5, primary_date = ?6, secondary_date = ?7,
                total_amount = ?8, currency = ?9, summary = ?10, action_items = ?11,
                deadlines = ?12, urgency = ?13, tags = ?14, ocr_excerpt = ?15, language = ?16,
                llm_file_id = ?17, vector_store_file_id = ?18, processed_at = ?19,
                duration_ms = ?20, model_used = ?21, prompt_tokens = ?22, completion_tokens = ?23,
                cached_tokens = ?24, cost_usd = ?25, extraction_quality = ?26,
                validation_errors = ?27, requires_review = ?28, raw_response = ?29,
                updated_at = ?30, status = ?31
            WHERE id = ?32
            "#,
        )
        .bind(&doc.doc_type)
        .bind(&doc.doc_subtype)
        .bind(doc.confidence)
        .bind(&doc.issuer)
        .bind(&doc.recipient)
        .bind(&doc.primary_date)
        .bind(&doc.secondary_date)
        .bind(doc.total_amount)
        .bind(&doc.currency)
        .bind(&doc.summary)
        .bind(&doc.action_items)
        .bind(&doc.deadlines)
        .bind(&doc.urgency)
        .bind(&doc.tags)
        .bind(&doc.ocr_excerpt)
        .bind(&doc.language)
        .bind(&doc.llm_file_id)
        .bind(&doc.vector_store_file_id)
        .bind(doc.processed_at)
        .bind(doc.duration_ms)
        .bind(&doc.model_used)
        .bind(doc.prompt_tokens)
        .bind(doc.completion_tokens)
        .bind(doc.cached_tokens)
        .bind(doc.cost_usd)
        .bind(&doc.extraction_quality)
        .bind(&doc.validation_errors)
        .bind(doc.requires_review)
        .bind(&doc.raw_response)
        .bind(doc.updated_at)
        .bind(doc.status)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::store(format!("update failed: {e}")))?;

        doc.check_invariants()?;
        Ok(doc)
    }

    async fn soft_delete(&self, id: i64) -> Result<(), PipelineError> {
        sqlx::query("UPDATE documents SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| PipelineError::store(format!("soft_delete failed: {e}")))?;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

/// Postgres-backed store, the production backend (`DB_URL=postgres://...`).
/// Same contract as [`SqliteDocumentStore`]; dialect differences are
/// confined to parameter placeholders and the unique-violation check.
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub async fn connect(url: &str) -> Result<Self, PipelineError> {
        let pool = PgPool::connect(url)
            .await
            .map_err(|e| PipelineError::store(format!("postgres connect failed: {e}")))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| PipelineError::store(format!("migration failed: {e}")))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn find_by_hash(&self, sha256_hex: &str) -> Result<Option<Document>, PipelineError> {
        sqlx::query_as::<_, Document>(
            "SELECT * FROM documents WHERE sha256_hex = $1 AND deleted_at IS NULL",
        )
        .bind(sha256_hex)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PipelineError::store(format!("find_by_hash failed: {e}")))
    }

    async fn insert(&self, mut draft: Document) -> Result<Document, PipelineError> {
        let now = Utc::now();
        draft.created_at = now;
        draft.updated_at = now;

        let result = sqlx::query_as::<_, Document>(
            r#"
            INSERT INTO documents (
                sha256_hex, sha256_b64url, original_filename, file_size_bytes, page_count,
                doc_type, doc_subtype, confidence,
                issuer, recipient, primary_date, secondary_date, total_amount, currency,
                summary, action_items, deadlines, urgency, tags,
                ocr_excerpt, language,
                llm_file_id, vector_store_file_id,
                processed_at, duration_ms, model_used, prompt_tokens, completion_tokens,
                cached_tokens, cost_usd,
                extraction_quality, validation_errors, requires_review,
                raw_response,
                created_at, updated_at, deleted_at, status
            ) VALUES (
                $1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,
                $19,$20,$21,$22,$23,$24,$25,$26,$27,$28,$29,$30,$31,$32,$33,$34,
                $35,$36,$37,$38
            )
            RETURNING *
            "#,
        )
        .bind(&draft.sha256_hex)
        .bind(&draft.sha256_b64url)
        .bind(&draft.original_filename)
        .bind(draft.file_size_bytes)
        .bind(draft.page_count)
        .bind(&draft.doc_type)
        .bind(&draft.doc_subtype)
        .bind(draft.confidence)
        .bind(&draft.issuer)
        .bind(&draft.recipient)
        .bind(&draft.primary_date)
        .bind(&draft.secondary_date)
        .bind(draft.total_amount)
        .bind(&draft.currency)
        .bind(&draft.summary)
        .bind(&draft.action_items)
        .bind(&draft.deadlines)
        .bind(&draft.urgency)
        .bind(&draft.tags)
        .bind(&draft.ocr_excerpt)
        .bind(&draft.language)
        .bind(&draft.llm_file_id)
        .bind(&draft.vector_store_file_id)
        .bind(draft.processed_at)
        .bind(draft.duration_ms)
        .bind(&draft.model_used)
        .bind(draft.prompt_tokens)
        .bind(draft.completion_tokens)
        .bind(draft.cached_tokens)
        .bind(draft.cost_usd)
        .bind(&draft.extraction_quality)
        .bind(&draft.validation_errors)
        .bind(draft.requires_review)
        .bind(&draft.raw_response)
        .bind(draft.created_at)
        .bind(draft.updated_at)
        .bind(draft.deleted_at)
        .bind(draft.status)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row),
            Err(e) if is_unique_violation(&e) => {
                let existing = self.find_by_hash(&draft.sha256_hex).await?;
                Err(PipelineError::duplicate_hash(existing.and_then(|d| d.id).unwrap_or_default()))
            }
            Err(e) => Err(PipelineError::store(format!("insert failed: {e}"))),
        }
    }

    async fn update(&self, mut doc: Document) -> Result<Document, PipelineError> {
        let Some(id) = doc.id else {
            return Err(PipelineError::internal("update called on a document with no id"));
        };
        doc.updated_at = Utc::now();

        sqlx::query(
            r#"
            UPDATE documents SET
                doc_type = $1, doc_subtype = $2, confidence = $3, issuer = $4, recipient = $5,
                primary_date = $6, secondary_date = $7, total_amount = $8, currency = $9,
                summary = $10, action_items = $11, deadlines = $12, urgency = $13, tags = $14,
                ocr_excerpt = $15, language = $16, llm_file_id = $17, vector_store_file_id = $18,
                processed_at = $19, duration_ms = $20, model_used = $21, prompt_tokens = $22,
                completion_tokens = $23, cached_tokens = $24, cost_usd = $25,
                extraction_quality = $26, validation_errors = $27, requires_review = $28,
                raw_response = $29, updated_at = $30, status = $31
            WHERE id = $32 AND deleted_at IS NULL
            "#,
        )
        .bind(&doc.doc_type)
        .bind(&doc.doc_subtype)
        .bind(doc.confidence)
        .bind(&doc.issuer)
        .bind(&doc.recipient)
        .bind(&doc.primary_date)
        .bind(&doc.secondary_date)
        .bind(doc.total_amount)
        .bind(&doc.currency)
        .bind(&doc.summary)
        .bind(&doc.action_items)
        .bind(&doc.deadlines)
        .bind(&doc.urgency)
        .bind(&doc.tags)
        .bind(&doc.ocr_excerpt)
        .bind(&doc.language)
        .bind(&doc.llm_file_id)
        .bind(&doc.vector_store_file_id)
        .bind(doc.processed_at)
        .bind(doc.duration_ms)
        .bind(&doc.model_used)
        .bind(doc.prompt_tokens)
        .bind(doc.completion_tokens)
        .bind(doc.cached_tokens)
        .bind(doc.cost_usd)
        .bind(&doc.extraction_quality)
        .bind(&doc.validation_errors)
        .bind(doc.requires_review)
        .bind(&doc.raw_response)
        .bind(doc.updated_at)
        .bind(doc.status)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::store(format!("update failed: {e}")))?;

        doc.check_invariants()?;
        Ok(doc)
    }

    async fn soft_delete(&self, id: i64) -> Result<(), PipelineError> {
        sqlx::query("UPDATE documents SET deleted_at = $1, updated_at = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| PipelineError::store(format!("soft_delete failed: {e}")))?;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Explicit `DocumentStatus` round-trip check kept alongside the store so
/// a column-type regression fails a unit test, not a production insert.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    async fn memory_store() -> SqliteDocumentStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        SqliteDocumentStore::from_pool(pool)
    }

    #[tokio::test]
    async fn insert_then_find_by_hash_round_trips() {
        let store = memory_store().await;
        let draft = Document::draft("a".repeat(64), "b64".into(), "f.pdf".into(), 100);
        let inserted = store.insert(draft).await.unwrap();
        assert!(inserted.id.is_some());

        let found = store.find_by_hash(&inserted.sha256_hex).await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn duplicate_hash_is_rejected() {
        let store = memory_store().await;
        let hex = "c".repeat(64);
        let d1 = Document::draft(hex.clone(), "b64".into(), "a.pdf".into(), 10);
        let d2 = Document::draft(hex, "b64".into(), "b.pdf".into(), 20);
        store.insert(d1).await.unwrap();
        let err = store.insert(d2).await.unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateHash { .. }));
    }

    /// Two concurrent inserts with the same hash race past the `find_by_hash`
    /// pre-check; whichever loses must surface the winner's actual row id,
    /// not a placeholder.
    #[tokio::test]
    async fn concurrent_duplicate_insert_reports_the_winners_real_id() {
        let store = std::sync::Arc::new(memory_store().await);
        let hex = "f".repeat(64);
        let d1 = Document::draft(hex.clone(), "b64".into(), "a.pdf".into(), 10);
        let d2 = Document::draft(hex, "b64".into(), "b.pdf".into(), 20);

        let (store_a, store_b) = (store.clone(), store.clone());
        let (r1, r2) = tokio::join!(store_a.insert(d1), store_b.insert(d2));

        let (winner, loser) = match (r1, r2) {
            (Ok(doc), Err(err)) => (doc, err),
            (Err(err), Ok(doc)) => (doc, err),
            other => panic!("expected exactly one winner and one duplicate-hash loser, got {other:?}"),
        };

        match loser {
            PipelineError::DuplicateHash { doc_id } => {
                assert_eq!(doc_id, winner.id.unwrap());
                assert_ne!(doc_id, 0);
            }
            other => panic!("expected DuplicateHash, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn soft_deleted_rows_are_invisible_to_find_by_hash() {
        let store = memory_store().await;
        let draft = Document::draft("d".repeat(64), "b64".into(), "f.pdf".into(), 10);
        let inserted = store.insert(draft).await.unwrap();
        store.soft_delete(inserted.id.unwrap()).await.unwrap();

        let found = store.find_by_hash(&inserted.sha256_hex).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn update_advances_updated_at() {
        let store = memory_store().await;
        let draft = Document::draft("e".repeat(64), "b64".into(), "f.pdf".into(), 10);
        let inserted = store.insert(draft).await.unwrap();
        let original_updated_at = inserted.updated_at;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut to_update = inserted;
        to_update.summary = Some("done".into());
        let updated = store.update(to_update).await.unwrap();
        assert!(updated.updated_at > original_updated_at);
    }
}
