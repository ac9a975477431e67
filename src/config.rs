//! System configuration, loaded once from the environment (`spec.md` §6).
//!
//! Generalizes `LLMConfig::from_env` / `ProviderConfig`: instead of one
//! struct per LLM vendor, there is a single [`Config`] covering every
//! component (C1-C9), because this pipeline only ever talks to one LLM
//! endpoint and one vector-store endpoint at a time. Validation happens
//! once, at load, and the result is immutable afterward.

use crate::cost::{ModelRate, PricingTable};
use crate::error::{PipelineError, PipelineResult};
use crate::logging::log_debug;
use crate::retry::RetryPolicy;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Log verbosity, mirrors `LOG_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn parse(raw: &str) -> PipelineResult<Self> {
        match raw.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(PipelineError::validation(format!(
                "LOG_LEVEL must be one of debug,info,warning,error, got {other}"
            ))),
        }
    }

    /// `tracing_subscriber::EnvFilter` directive for this level.
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
        }
    }
}

/// Log encoding, mirrors `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    fn parse(raw: &str) -> PipelineResult<Self> {
        match raw.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            other => Err(PipelineError::validation(format!(
                "LOG_FORMAT must be json or text, got {other}"
            ))),
        }
    }
}

/// Strictly-ascending cost alert thresholds (`COST_ALERT_T1/T2/T3`).
#[derive(Debug, Clone, Copy)]
pub struct CostAlertThresholds {
    pub t1: f64,
    pub t2: f64,
    pub t3: f64,
}

/// Raw pricing-table TOML shape (`spec.md` §6): `model_key -> { input_per_M,
/// cached_input_per_M, output_per_M, match }`. `cached_input_per_M` defaults
/// to half of `input_per_M` when omitted. Converted into C2's
/// [`PricingTable`]/[`ModelRate`] (per-1k-token rates) rather than keeping a
/// second, parallel pricing type.
#[derive(Debug, Deserialize)]
struct PricingFile {
    #[serde(flatten)]
    models: HashMap<String, PricingFileEntry>,
}

#[derive(Debug, Deserialize)]
struct PricingFileEntry {
    input_per_m: f64,
    #[serde(default)]
    cached_input_per_m: Option<f64>,
    output_per_m: f64,
    #[serde(default)]
    #[allow(dead_code)]
    r#match: Vec<String>,
}

/// Parses a pricing TOML document into C2's [`PricingTable`].
pub fn load_pricing_table(raw: &str) -> PipelineResult<PricingTable> {
    let file: PricingFile = toml::from_str(raw)
        .map_err(|e| PipelineError::validation(format!("invalid pricing table: {e}")))?;
    let rates = file
        .models
        .into_iter()
        .map(|(key, entry)| {
            let cached_input_per_m = entry.cached_input_per_m.unwrap_or(entry.input_per_m * 0.5);
            (
                key,
                ModelRate {
                    prompt_per_1k: entry.input_per_m / 1000.0,
                    cached_per_1k: cached_input_per_m / 1000.0,
                    completion_per_1k: entry.output_per_m / 1000.0,
                },
            )
        })
        .collect();
    Ok(PricingTable::new(rates))
}

/// Loads and parses the pricing TOML file at `path`.
pub fn load_pricing_table_from_file(path: impl AsRef<Path>) -> PipelineResult<PricingTable> {
    let raw = std::fs::read_to_string(path.as_ref())
        .map_err(|e| PipelineError::io(path.as_ref().display().to_string(), e.to_string()))?;
    load_pricing_table(&raw)
}

/// System-wide, environment-resolved configuration (`spec.md` §6).
///
/// Construct with [`Config::from_env`]. Immutable after load: nothing in
/// the pipeline re-reads the environment past startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub llm_api_key: String,
    pub llm_model: String,
    pub db_url: String,
    pub api_timeout: Duration,
    pub max_retries: u32,
    pub rate_limit_rpm: u32,
    pub batch_size: usize,

    pub prompt_price_override: Option<f64>,
    pub output_price_override: Option<f64>,
    pub cached_price_override: Option<f64>,
    pub cost_alert_thresholds: CostAlertThresholds,

    pub log_level: LogLevel,
    pub log_format: LogFormat,

    pub vector_store_name: String,
    pub vector_cache_ttl_days: i64,
    pub search_top_k: u32,
    pub search_threshold: f64,
    pub embedding_model: String,
    pub embedding_dimension: usize,
}

/// Model ids `LLM_MODEL` is allowed to resolve to (`spec.md` §6 allow-list).
const ALLOWED_MODELS: &[&str] = &[
    "gpt-4o",
    "gpt-4o-mini",
    "gpt-4.1",
    "gpt-4.1-mini",
    "o1",
    "o3-mini",
];

impl Config {
    /// Loads and validates configuration from environment variables. This is
    /// the only place in the crate that reads `std::env`.
    pub fn from_env() -> PipelineResult<Self> {
        let llm_api_key = require_env("LLM_API_KEY")?;
        if llm_api_key.len() < 20 {
            return Err(PipelineError::validation(
                "LLM_API_KEY must be at least 20 characters",
            ));
        }

        let llm_model = require_env("LLM_MODEL")?;
        if !ALLOWED_MODELS.contains(&llm_model.as_str()) {
            return Err(PipelineError::validation(format!(
                "LLM_MODEL {llm_model} is not in the allow-list: {ALLOWED_MODELS:?}"
            )));
        }

        let db_url = require_env("DB_URL")?;

        let api_timeout_secs = parse_env_in_range("API_TIMEOUT_SECONDS", 30, 600)?;
        let max_retries = parse_env_in_range("MAX_RETRIES", 1, 10)?;
        let rate_limit_rpm = parse_env_in_range("RATE_LIMIT_RPM", 1, 500)?;
        let batch_size = parse_env_in_range("BATCH_SIZE", 1, 100)?;

        let prompt_price_override = optional_env_f64("PROMPT_PRICE_PER_M")?;
        let output_price_override = optional_env_f64("OUTPUT_PRICE_PER_M")?;
        let cached_price_override = optional_env_f64("CACHED_PRICE_PER_M")?;

        let t1 = parse_env_f64("COST_ALERT_T1")?;
        let t2 = parse_env_f64("COST_ALERT_T2")?;
        let t3 = parse_env_f64("COST_ALERT_T3")?;
        if !(t1 < t2 && t2 < t3) {
            return Err(PipelineError::validation(
                "COST_ALERT_T1/T2/T3 must be strictly ascending",
            ));
        }

        let log_level = LogLevel::parse(&require_env("LOG_LEVEL")?)?;
        let log_format = LogFormat::parse(&require_env("LOG_FORMAT")?)?;

        let vector_store_name = require_env("VECTOR_STORE_NAME")?;
        let vector_cache_ttl_days = parse_env_min("VECTOR_CACHE_TTL_DAYS", 1)?;
        let search_top_k = parse_env_min("SEARCH_TOP_K", 1)?;
        let search_threshold = parse_env_f64("SEARCH_THRESHOLD")?;
        if !(0.0..=1.0).contains(&search_threshold) {
            return Err(PipelineError::validation(
                "SEARCH_THRESHOLD must be in [0, 1]",
            ));
        }

        let embedding_model = require_env("EMBEDDING_MODEL")?;
        let embedding_dimension = parse_env_min("EMBEDDING_DIMENSION", 1)?;

        let config = Self {
            llm_api_key,
            llm_model,
            db_url,
            api_timeout: Duration::from_secs(api_timeout_secs),
            max_retries,
            rate_limit_rpm,
            batch_size: batch_size as usize,
            prompt_price_override,
            output_price_override,
            cached_price_override,
            cost_alert_thresholds: CostAlertThresholds { t1, t2, t3 },
            log_level,
            log_format,
            vector_store_name,
            vector_cache_ttl_days: vector_cache_ttl_days as i64,
            search_top_k,
            search_threshold,
            embedding_model,
            embedding_dimension: embedding_dimension as usize,
        };

        log_debug!(
            model = %config.llm_model,
            batch_size = config.batch_size,
            vector_store = %config.vector_store_name,
            "configuration loaded and validated"
        );

        Ok(config)
    }

    /// Retry policy derived from `MAX_RETRIES` and `API_TIMEOUT_SECONDS`,
    /// sharing C3's jittered-exponential-backoff defaults otherwise.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            request_timeout: self.api_timeout,
            ..RetryPolicy::default()
        }
    }
}

fn require_env(key: &str) -> PipelineResult<String> {
    std::env::var(key).map_err(|_| PipelineError::validation(format!("{key} is required")))
}

fn parse_env_f64(key: &str) -> PipelineResult<f64> {
    let raw = require_env(key)?;
    raw.parse::<f64>()
        .map_err(|_| PipelineError::validation(format!("{key} must be a float, got {raw}")))
}

fn optional_env_f64(key: &str) -> PipelineResult<Option<f64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<f64>()
            .map(Some)
            .map_err(|_| PipelineError::validation(format!("{key} must be a float, got {raw}"))),
        Err(_) => Ok(None),
    }
}

fn parse_env_in_range(key: &str, min: u64, max: u64) -> PipelineResult<u32> {
    let raw = require_env(key)?;
    let value: u64 = raw
        .parse()
        .map_err(|_| PipelineError::validation(format!("{key} must be an integer, got {raw}")))?;
    if value < min || value > max {
        return Err(PipelineError::validation(format!(
            "{key} must be in [{min}, {max}], got {value}"
        )));
    }
    Ok(value as u32)
}

fn parse_env_min(key: &str, min: u64) -> PipelineResult<u32> {
    let raw = require_env(key)?;
    let value: u64 = raw
        .parse()
        .map_err(|_| PipelineError::validation(format!("{key} must be an integer, got {raw}")))?;
    if value < min {
        return Err(PipelineError::validation(format!(
            "{key} must be >= {min}, got {value}"
        )));
    }
    Ok(value as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_valid_env() {
        std::env::set_var("LLM_API_KEY", "sk-test-key-with-enough-chars");
        std::env::set_var("LLM_MODEL", "gpt-4o-mini");
        std::env::set_var("DB_URL", "sqlite::memory:");
        std::env::set_var("API_TIMEOUT_SECONDS", "60");
        std::env::set_var("MAX_RETRIES", "5");
        std::env::set_var("RATE_LIMIT_RPM", "100");
        std::env::set_var("BATCH_SIZE", "10");
        std::env::set_var("COST_ALERT_T1", "1.0");
        std::env::set_var("COST_ALERT_T2", "5.0");
        std::env::set_var("COST_ALERT_T3", "20.0");
        std::env::set_var("LOG_LEVEL", "info");
        std::env::set_var("LOG_FORMAT", "json");
        std::env::set_var("VECTOR_STORE_NAME", "docs");
        std::env::set_var("VECTOR_CACHE_TTL_DAYS", "30");
        std::env::set_var("SEARCH_TOP_K", "5");
        std::env::set_var("SEARCH_THRESHOLD", "0.5");
        std::env::set_var("EMBEDDING_MODEL", "text-embedding-3-small");
        std::env::set_var("EMBEDDING_DIMENSION", "1536");
    }

    #[test]
    #[serial]
    fn loads_valid_configuration_from_env() {
        set_valid_env();
        let config = Config::from_env().unwrap();
        assert_eq!(config.llm_model, "gpt-4o-mini");
        assert_eq!(config.batch_size, 10);
    }

    #[test]
    #[serial]
    fn rejects_model_outside_allow_list() {
        set_valid_env();
        std::env::set_var("LLM_MODEL", "not-a-real-model");
        assert!(Config::from_env().is_err());
    }

    #[test]
    #[serial]
    fn rejects_non_ascending_cost_alerts() {
        set_valid_env();
        std::env::set_var("COST_ALERT_T2", "0.5");
        assert!(Config::from_env().is_err());
    }

    #[test]
    #[serial]
    fn rejects_out_of_range_batch_size() {
        set_valid_env();
        std::env::set_var("BATCH_SIZE", "0");
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn pricing_table_loads_per_1k_rates_from_per_million_toml() {
        let table = load_pricing_table(
            r#"
            [gpt-4o]
            input_per_m = 2.5
            output_per_m = 10.0
            match = ["exact"]
            "#,
        )
        .unwrap();
        let rate = table.rate_for("gpt-4o").unwrap();
        assert_eq!(rate.prompt_per_1k, 0.0025);
        assert_eq!(rate.completion_per_1k, 0.010);
        // cached_input_per_m omitted from the TOML; defaults to half of input_per_m.
        assert_eq!(rate.cached_per_1k, 0.00125);
    }

    #[test]
    fn pricing_table_honors_explicit_cached_rate() {
        let table = load_pricing_table(
            r#"
            [gpt-4o-mini]
            input_per_m = 0.15
            cached_input_per_m = 0.075
            output_per_m = 0.60
            "#,
        )
        .unwrap();
        let rate = table.rate_for("gpt-4o-mini").unwrap();
        assert_eq!(rate.cached_per_1k, 0.000075);
    }

    #[test]
    fn pricing_table_returns_none_for_unknown_model() {
        let table = PricingTable::default();
        assert!(table.rate_for("unknown-model").is_none());
    }
}
