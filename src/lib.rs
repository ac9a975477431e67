//! # docpipe
//!
//! A content-addressed PDF ingestion pipeline: streaming hash dedup, LLM
//! structured-metadata extraction, cost accounting, compensating-transaction
//! persistence, and semantic vector-store registration.
//!
//! ## Key components
//!
//! - **Content Hasher** ([`hash`]) — streaming SHA-256, hex + base64url.
//! - **Token & Cost Estimator** ([`cost`]) — pre-flight estimates, pricing.
//! - **Retry Executor** ([`retry`]) — exponential backoff + circuit breaker.
//! - **Compensating Transaction** ([`transaction`]) — LIFO rollback scopes.
//! - **Document Store** ([`store`]) — the durable `Document` row.
//! - **LLM Client** ([`llm`]) — structured-output extraction.
//! - **Vector Store Client** ([`vector_store`]) — upload + semantic search.
//! - **Embedding Cache** ([`embedding_cache`]) — three-tier cache.
//! - **Pipeline Orchestrator** ([`pipeline`]) — composes S1-S8.
//! - **Observability** ([`observability`]) — metrics, alerts, health.
//!
//! ## Example
//!
//! ```rust,no_run
//! use docpipe::config::Config;
//! use docpipe::pipeline::{Pipeline, Runtime};
//!
//! # async fn example() -> Result<(), docpipe::error::PipelineError> {
//! let config = Config::from_env()?;
//! // `Runtime::new` bundles the concrete store/llm/vector-store/cache
//! // implementations; see `src/bin/docpipe.rs` for full wiring.
//! # Ok(())
//! # }
//! ```

#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod cost;
pub mod document;
pub mod embedding_cache;
pub mod error;
pub mod hash;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod transaction;
pub mod vector_store;

pub(crate) mod logging;

pub use config::Config;
pub use document::{Deadline, Document, DocumentStatus, ProcessingContext};
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{Outcome, Pipeline, Runtime, Stage, StageOutcome};
