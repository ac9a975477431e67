//! Vector store client (C7).
//!
//! Same builder/header/retry idiom as the LLM client (C6): a thin
//! `reqwest`-based wrapper with its own [`RetryExecutor`], tracking
//! per-store metrics in-process (never a process global).

use crate::error::PipelineError;
use crate::retry::{RetryExecutor, RetryPolicy};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// A single hit from [`VectorStoreClient::search`].
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub file_id: String,
    pub score: f64,
    pub snippet: String,
}

/// State an attached file moves through while the vector store indexes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentState {
    Queued,
    InProgress,
    Completed,
    Failed,
}

/// Contract the pipeline depends on (`spec.md` §4.7).
#[async_trait]
pub trait VectorStoreClient: Send + Sync {
    /// Idempotent by local cache file (`.{app}_vs_id`, see `spec.md` §6).
    async fn ensure_store(&self, name: &str, expires_after_days: Option<u32>) -> Result<String, PipelineError>;

    /// Attaches a file then polls until `completed`/`failed`, up to `total_wait`.
    async fn attach_file(&self, store_id: &str, file_id: &str, total_wait: Duration) -> Result<String, PipelineError>;

    async fn search(&self, store_id: &str, query: &str, top_k: u32) -> Result<Vec<SearchHit>, PipelineError>;

    async fn detach_file(&self, store_id: &str, file_id: &str) -> Result<(), PipelineError>;

    fn metrics(&self) -> VectorStoreMetricsSnapshot;
}

/// In-memory, atomically-updated counters for one vector store
/// (`spec.md` §3 `VectorStoreMetrics`).
#[derive(Debug, Default)]
pub struct VectorStoreMetrics {
    uploads_ok: AtomicU64,
    uploads_failed: AtomicU64,
    bytes_uploaded: AtomicU64,
    search_count: AtomicU64,
    search_latency_sum_ms: AtomicU64,
    search_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VectorStoreMetricsSnapshot {
    pub uploads_ok: u64,
    pub uploads_failed: u64,
    pub bytes_uploaded: u64,
    pub search_count: u64,
    pub search_failures: u64,
    pub upload_success_rate: f64,
    pub avg_search_latency_ms: f64,
}

impl VectorStoreMetrics {
    fn snapshot(&self) -> VectorStoreMetricsSnapshot {
        let ok = self.uploads_ok.load(Ordering::Relaxed);
        let failed = self.uploads_failed.load(Ordering::Relaxed);
        let total_uploads = ok + failed;
        let search_count = self.search_count.load(Ordering::Relaxed);
        let latency_sum = self.search_latency_sum_ms.load(Ordering::Relaxed);

        VectorStoreMetricsSnapshot {
            uploads_ok: ok,
            uploads_failed: failed,
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            search_count,
            search_failures: self.search_failures.load(Ordering::Relaxed),
            upload_success_rate: if total_uploads == 0 {
                1.0
            } else {
                ok as f64 / total_uploads as f64
            },
            avg_search_latency_ms: if search_count == 0 {
                0.0
            } else {
                latency_sum as f64 / search_count as f64
            },
        }
    }

    /// Derived daily cost estimate per `spec.md` §4.7.
    pub fn estimated_daily_cost(&self, gb_stored: f64, free_tier_gb: f64, price_per_gb_per_day: f64) -> f64 {
        (gb_stored - free_tier_gb).max(0.0) * price_per_gb_per_day
    }
}

/// HTTP-backed vector store client.
pub struct HttpVectorStoreClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: Mutex<RetryExecutor>,
    metrics: VectorStoreMetrics,
    poll_interval: Duration,
}

impl HttpVectorStoreClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            retry: Mutex::new(RetryExecutor::new("vector_store", policy)),
            metrics: VectorStoreMetrics::default(),
            poll_interval: Duration::from_secs(1),
        }
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    fn classify_status(status: StatusCode, body: &str) -> PipelineError {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            PipelineError::transient("vector_store", format!("{status}: {body}"), None)
        } else {
            PipelineError::permanent("vector_store", format!("{status}: {body}"))
        }
    }
}

#[derive(Deserialize)]
struct StoreIdResponse {
    id: String,
}

#[derive(Deserialize)]
struct AttachStatusResponse {
    status: AttachmentState,
}

#[derive(Deserialize)]
struct SearchResponse {
    data: Vec<SearchHitPayload>,
}

#[derive(Deserialize)]
struct SearchHitPayload {
    file_id: String,
    score: f64,
    snippet: String,
}

#[async_trait]
impl VectorStoreClient for HttpVectorStoreClient {
    async fn ensure_store(&self, name: &str, expires_after_days: Option<u32>) -> Result<String, PipelineError> {
        let url = format!("{}/vector_stores", self.base_url);
        let mut retry = self.retry.lock().await;
        retry
            .execute(|| async {
                let mut body = serde_json::json!({ "name": name });
                if let Some(days) = expires_after_days {
                    body["expires_after"] = serde_json::json!({ "anchor": "last_active_at", "days": days });
                }

                let resp = self
                    .http
                    .post(&url)
                    .header("Authorization", self.auth_header())
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| PipelineError::transient("vector_store", e.to_string(), Some(Box::new(e))))?;

                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                if !status.is_success() {
                    return Err(Self::classify_status(status, &text));
                }

                let parsed: StoreIdResponse = serde_json::from_str(&text)
                    .map_err(|e| PipelineError::permanent("vector_store", format!("bad store response: {e}")))?;
                Ok(parsed.id)
            })
            .await
    }

    async fn attach_file(&self, store_id: &str, file_id: &str, total_wait: Duration) -> Result<String, PipelineError> {
        let attach_url = format!("{}/vector_stores/{}/files", self.base_url, store_id);

        let vsf_id: String = {
            let mut retry = self.retry.lock().await;
            retry
                .execute(|| async {
                    let resp = self
                        .http
                        .post(&attach_url)
                        .header("Authorization", self.auth_header())
                        .json(&serde_json::json!({ "file_id": file_id }))
                        .send()
                        .await
                        .map_err(|e| PipelineError::transient("vector_store", e.to_string(), Some(Box::new(e))))?;

                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if !status.is_success() {
                        return Err(Self::classify_status(status, &text));
                    }

                    let parsed: StoreIdResponse = serde_json::from_str(&text)
                        .map_err(|e| PipelineError::permanent("vector_store", format!("bad attach response: {e}")))?;
                    Ok(parsed.id)
                })
                .await?
        };

        let status_url = format!("{}/vector_stores/{}/files/{}", self.base_url, store_id, vsf_id);
        let deadline = Instant::now() + total_wait;
        let mut attempt: u32 = 0;

        loop {
            let resp = self
                .http
                .get(&status_url)
                .header("Authorization", self.auth_header())
                .send()
                .await
                .map_err(|e| PipelineError::transient("vector_store", e.to_string(), Some(Box::new(e))))?;
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(Self::classify_status(status, &text));
            }

            let parsed: AttachStatusResponse = serde_json::from_str(&text)
                .map_err(|e| PipelineError::permanent("vector_store", format!("bad status response: {e}")))?;

            match parsed.status {
                AttachmentState::Completed => {
                    self.metrics.uploads_ok.fetch_add(1, Ordering::Relaxed);
                    return Ok(vsf_id);
                }
                AttachmentState::Failed => {
                    self.metrics.uploads_failed.fetch_add(1, Ordering::Relaxed);
                    return Err(PipelineError::permanent("vector_store", "file attachment failed"));
                }
                AttachmentState::Queued | AttachmentState::InProgress => {
                    if Instant::now() >= deadline {
                        self.metrics.uploads_failed.fetch_add(1, Ordering::Relaxed);
                        return Err(PipelineError::transient(
                            "vector_store",
                            "attach polling exceeded total wait",
                            None,
                        ));
                    }
                    attempt += 1;
                    let backoff = { self.retry.lock().await.calculate_delay(attempt) };
                    tokio::time::sleep(backoff.min(self.poll_interval * 8)).await;
                }
            }
        }
    }

    async fn search(&self, store_id: &str, query: &str, top_k: u32) -> Result<Vec<SearchHit>, PipelineError> {
        let url = format!("{}/vector_stores/{}/search", self.base_url, store_id);
        let start = Instant::now();
        self.metrics.search_count.fetch_add(1, Ordering::Relaxed);

        let result = {
            let mut retry = self.retry.lock().await;
            retry
                .execute(|| async {
                    let resp = self
                        .http
                        .post(&url)
                        .header("Authorization", self.auth_header())
                        .json(&serde_json::json!({ "query": query, "top_k": top_k }))
                        .send()
                        .await
                        .map_err(|e| PipelineError::transient("vector_store", e.to_string(), Some(Box::new(e))))?;

                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if !status.is_success() {
                        return Err(Self::classify_status(status, &text));
                    }

                    let parsed: SearchResponse = serde_json::from_str(&text)
                        .map_err(|e| PipelineError::permanent("vector_store", format!("bad search response: {e}")))?;
                    Ok(parsed
                        .data
                        .into_iter()
                        .map(|h| SearchHit {
                            file_id: h.file_id,
                            score: h.score,
                            snippet: h.snippet,
                        })
                        .collect())
                })
                .await
        };

        self.metrics
            .search_latency_sum_ms
            .fetch_add(start.elapsed().as_millis() as u64, Ordering::Relaxed);
        if result.is_err() {
            self.metrics.search_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn detach_file(&self, store_id: &str, file_id: &str) -> Result<(), PipelineError> {
        let url = format!("{}/vector_stores/{}/files/{}", self.base_url, store_id, file_id);
        let mut retry = self.retry.lock().await;
        retry
            .execute(|| async {
                let resp = self
                    .http
                    .delete(&url)
                    .header("Authorization", self.auth_header())
                    .send()
                    .await
                    .map_err(|e| PipelineError::transient("vector_store", e.to_string(), Some(Box::new(e))))?;
                let status = resp.status();
                if status.is_success() || status == StatusCode::NOT_FOUND {
                    Ok(())
                } else {
                    let body = resp.text().await.unwrap_or_default();
                    Err(Self::classify_status(status, &body))
                }
            })
            .await
    }

    fn metrics(&self) -> VectorStoreMetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_cost_is_zero_under_free_tier() {
        let metrics = VectorStoreMetrics::default();
        assert_eq!(metrics.estimated_daily_cost(0.5, 1.0, 0.10), 0.0);
    }

    #[test]
    fn daily_cost_scales_above_free_tier() {
        let metrics = VectorStoreMetrics::default();
        let cost = metrics.estimated_daily_cost(5.0, 1.0, 0.10);
        assert!((cost - 0.40).abs() < 1e-9);
    }

    #[test]
    fn snapshot_success_rate_defaults_to_one_with_no_uploads() {
        let metrics = VectorStoreMetrics::default();
        assert_eq!(metrics.snapshot().upload_success_rate, 1.0);
    }

    #[test]
    fn snapshot_reflects_recorded_failures() {
        let metrics = VectorStoreMetrics::default();
        metrics.uploads_ok.fetch_add(3, Ordering::Relaxed);
        metrics.uploads_failed.fetch_add(1, Ordering::Relaxed);
        let snap = metrics.snapshot();
        assert_eq!(snap.upload_success_rate, 0.75);
    }
}
