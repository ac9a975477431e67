//! Three-tier embedding cache (C8): in-process LRU → durable table → remote
//! API, write-through on miss. The LRU tier is borrowed from the `lru`
//! crate (enriched from the broader pack — the teacher itself has no
//! caching layer) and guarded by a `tokio::sync::Mutex` per Design Notes §9
//! ("large vectors stored by reference to avoid copies").

use crate::error::PipelineError;
use crate::hash::hash_bytes;
use crate::logging::log_debug;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lru::LruCache;
use sqlx::SqlitePool;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Durable row shape for tier 2, mirrors `spec.md` §3 `EmbeddingRecord`.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub cache_key: String,
    pub model: String,
    pub vector: Arc<Vec<f32>>,
    pub token_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

/// Tier 3: a remote embedding API. Kept as its own small trait, parallel to
/// [`crate::llm::LlmClient`], so it can be stubbed independently in tests.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_batch(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError>;
}

#[derive(serde::Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[derive(serde::Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

/// HTTP-backed tier-3 provider, same request/retry shape as
/// [`crate::llm::ResponsesApiClient`] — a `reqwest::Client` plus a
/// [`RetryExecutor`](crate::retry::RetryExecutor) behind a `tokio::sync::Mutex`.
pub struct HttpEmbeddingProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: Mutex<crate::retry::RetryExecutor>,
}

impl HttpEmbeddingProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        policy: crate::retry::RetryPolicy,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            retry: Mutex::new(crate::retry::RetryExecutor::new("embeddings", policy)),
        }
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    fn classify_status(status: reqwest::StatusCode, body: &str) -> PipelineError {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            PipelineError::transient("embeddings", format!("{status}: {body}"), None)
        } else {
            PipelineError::permanent("embeddings", format!("{status}: {body}"))
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed_batch(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let url = format!("{}/embeddings", self.base_url);
        let mut retry = self.retry.lock().await;
        retry
            .execute(|| async {
                let response = self
                    .http
                    .post(&url)
                    .header("Authorization", self.auth_header())
                    .json(&serde_json::json!({ "model": model, "input": texts }))
                    .send()
                    .await
                    .map_err(|e| PipelineError::transient("embeddings", e.to_string(), None))?;

                let status = response.status();
                let body = response
                    .text()
                    .await
                    .map_err(|e| PipelineError::transient("embeddings", e.to_string(), None))?;

                if !status.is_success() {
                    return Err(Self::classify_status(status, &body));
                }

                let parsed: EmbeddingsResponse = serde_json::from_str(&body)
                    .map_err(|e| PipelineError::permanent("embeddings", format!("bad response body: {e}")))?;
                Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
            })
            .await
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub remote_calls: u64,
    pub total_requests: u64,
}

impl CacheStats {
    pub fn memory_hit_rate(&self) -> f64 {
        ratio(self.memory_hits, self.total_requests)
    }

    pub fn overall_hit_rate(&self) -> f64 {
        ratio(self.memory_hits + self.persistent_hits, self.total_requests)
    }
}

fn ratio(n: u64, d: u64) -> f64 {
    if d == 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheHealth {
    Healthy,
    Warning,
    Critical,
}

struct Counters {
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    remote_calls: AtomicU64,
    total_requests: AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            memory_hits: AtomicU64::new(0),
            persistent_hits: AtomicU64::new(0),
            remote_calls: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
        }
    }
}

/// Three-tier cache over `SHA-256(model || 0x00 || normalized_text)`.
pub struct EmbeddingCache {
    memory: Mutex<LruCache<String, Arc<Vec<f32>>>>,
    pool: SqlitePool,
    provider: Arc<dyn EmbeddingProvider>,
    ttl: ChronoDuration,
    counters: Counters,
    batch_size: usize,
}

impl EmbeddingCache {
    pub fn new(
        pool: SqlitePool,
        provider: Arc<dyn EmbeddingProvider>,
        capacity: usize,
        ttl_days: i64,
        batch_size: usize,
    ) -> Self {
        Self {
            memory: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1000).unwrap()),
            )),
            pool,
            provider,
            ttl: ChronoDuration::days(ttl_days),
            counters: Counters::default(),
            batch_size,
        }
    }

    pub fn cache_key(model: &str, normalized_text: &str) -> String {
        let mut buf = Vec::with_capacity(model.len() + 1 + normalized_text.len());
        buf.extend_from_slice(model.as_bytes());
        buf.push(0);
        buf.extend_from_slice(normalized_text.as_bytes());
        hash_bytes(&buf).hex
    }

    /// Looks up one embedding, probing tiers in order and writing back
    /// through tiers 1 and 2 on a tier-3 hit.
    pub async fn get_or_embed(&self, model: &str, normalized_text: &str) -> Result<Arc<Vec<f32>>, PipelineError> {
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        let key = Self::cache_key(model, normalized_text);

        if let Some(vector) = self.memory.lock().await.get(&key).cloned() {
            self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(vector);
        }

        if let Some(record) = self.fetch_tier2(&key).await? {
            if Utc::now() - record.last_accessed_at < self.ttl {
                self.touch_tier2(&key).await?;
                self.memory.lock().await.put(key, record.vector.clone());
                self.counters.persistent_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(record.vector);
            }
            log_debug!(cache_key = %key, "tier 2 entry expired, treating as miss");
        }

        self.counters.remote_calls.fetch_add(1, Ordering::Relaxed);
        let vectors = self.provider.embed_batch(model, &[normalized_text.to_string()]).await?;
        let vector = Arc::new(
            vectors
                .into_iter()
                .next()
                .ok_or_else(|| PipelineError::internal("embedding provider returned no vectors"))?,
        );

        self.write_through(&key, model, &vector, normalized_text.len() as u32)
            .await?;
        self.memory.lock().await.put(key, vector.clone());
        Ok(vector)
    }

    /// Embeds up to `batch_size` texts per remote call (`spec.md` §4.8).
    pub async fn get_or_embed_batch(
        &self,
        model: &str,
        normalized_texts: &[String],
    ) -> Result<Vec<Arc<Vec<f32>>>, PipelineError> {
        let mut results = Vec::with_capacity(normalized_texts.len());
        let mut misses = Vec::new();
        let mut miss_indices = Vec::new();

        for (idx, text) in normalized_texts.iter().enumerate() {
            self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
            let key = Self::cache_key(model, text);
            if let Some(vector) = self.memory.lock().await.get(&key).cloned() {
                self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                results.push(Some(vector));
                continue;
            }
            results.push(None);
            misses.push(text.clone());
            miss_indices.push(idx);
        }

        let batch_size = self.batch_size.max(1);
        for (chunk_texts, chunk_indices) in misses.chunks(batch_size).zip(miss_indices.chunks(batch_size)) {
            self.counters.remote_calls.fetch_add(1, Ordering::Relaxed);
            let vectors = self.provider.embed_batch(model, chunk_texts).await?;
            for (vector, &global_idx) in vectors.into_iter().zip(chunk_indices.iter()) {
                let key = Self::cache_key(model, &normalized_texts[global_idx]);
                let vector = Arc::new(vector);
                self.write_through(&key, model, &vector, normalized_texts[global_idx].len() as u32)
                    .await?;
                self.memory.lock().await.put(key, vector.clone());
                results[global_idx] = Some(vector);
            }
        }

        results
            .into_iter()
            .map(|v| v.ok_or_else(|| PipelineError::internal("batch embedding left a hole")))
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            persistent_hits: self.counters.persistent_hits.load(Ordering::Relaxed),
            remote_calls: self.counters.remote_calls.load(Ordering::Relaxed),
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
        }
    }

    /// `healthy` at ≥80% overall hit rate, `warning` if one threshold is
    /// breached, `critical` if both (`spec.md` §4.8). Size breach is
    /// evaluated by the caller, who knows the configured cap.
    pub fn health(&self, size_over_cap: bool) -> CacheHealth {
        let hit_rate_ok = self.stats().overall_hit_rate() >= 0.80;
        match (hit_rate_ok, size_over_cap) {
            (true, false) => CacheHealth::Healthy,
            (false, true) => CacheHealth::Critical,
            _ => CacheHealth::Warning,
        }
    }

    async fn fetch_tier2(&self, key: &str) -> Result<Option<EmbeddingRecord>, PipelineError> {
        let row: Option<(String, String, String, i64, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT cache_key, model, vector, token_count, created_at, last_accessed_at FROM embeddings WHERE cache_key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PipelineError::store(format!("embedding tier2 lookup failed: {e}")))?;

        let Some((cache_key, model, vector_json, token_count, created_at, last_accessed_at)) = row else {
            return Ok(None);
        };

        let vector: Vec<f32> = serde_json::from_str(&vector_json)
            .map_err(|e| PipelineError::internal(format!("corrupt embedding vector: {e}")))?;

        Ok(Some(EmbeddingRecord {
            cache_key,
            model,
            vector: Arc::new(vector),
            token_count: token_count as u32,
            created_at,
            last_accessed_at,
        }))
    }

    async fn touch_tier2(&self, key: &str) -> Result<(), PipelineError> {
        sqlx::query("UPDATE embeddings SET last_accessed_at = ?1 WHERE cache_key = ?2")
            .bind(Utc::now())
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| PipelineError::store(format!("embedding touch failed: {e}")))?;
        Ok(())
    }

    async fn write_through(&self, key: &str, model: &str, vector: &[f32], token_count: u32) -> Result<(), PipelineError> {
        let now = Utc::now();
        let vector_json = serde_json::to_string(vector)
            .map_err(|e| PipelineError::internal(format!("failed to serialize embedding: {e}")))?;

        sqlx::query(
            "INSERT INTO embeddings (cache_key, model, vector, token_count, created_at, last_accessed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT (cache_key) DO UPDATE SET last_accessed_at = ?5",
        )
        .bind(key)
        .bind(model)
        .bind(vector_json)
        .bind(token_count as i64)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::store(format!("embedding write-through failed: {e}")))?;
        Ok(())
    }

    /// Evicts tier-2 rows by ascending `last_accessed_at` until the table
    /// holds at most `target_count` rows (`spec.md` §4.8 size eviction).
    pub async fn evict_to_size(&self, target_count: i64) -> Result<u64, PipelineError> {
        let result = sqlx::query(
            "DELETE FROM embeddings WHERE cache_key IN (
                SELECT cache_key FROM embeddings ORDER BY last_accessed_at ASC
                LIMIT MAX(0, (SELECT COUNT(*) FROM embeddings) - ?1)
            )",
        )
        .bind(target_count)
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::store(format!("size eviction failed: {e}")))?;
        Ok(result.rows_affected())
    }
}
