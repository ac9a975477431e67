//! Token counting and cost estimation (C2).
//!
//! Generalized from the provider-specific tokenizers: the pipeline only
//! ever talks to one configured LLM provider/model per run, so this module
//! exposes a single [`TokenCounter`] plus a [`PricingTable`] lookup rather
//! than the teacher's multi-provider factory.

use crate::error::PipelineError;
use crate::logging::log_warn;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};

/// Counts tokens for a specific model's tokenizer.
pub struct TokenCounter {
    tokenizer: CoreBPE,
    model_name: String,
    /// Anthropic doesn't publish its tokenizer; counts are scaled by this
    /// factor over cl100k_base as a conservative (over-)estimate.
    approximation_factor: f32,
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("model_name", &self.model_name)
            .field("approximation_factor", &self.approximation_factor)
            .finish()
    }
}

impl TokenCounter {
    /// Selects cl100k_base/o200k_base by model-name prefix, same resolution
    /// order as OpenAI's own tokenizer compatibility table.
    pub fn for_model(model_name: &str) -> Result<Self, PipelineError> {
        let (tokenizer, approximation_factor) = if model_name.starts_with("gpt-")
            || model_name.starts_with("o1")
            || model_name.starts_with("o3")
        {
            let bpe = if model_name.starts_with("o1") || model_name.starts_with("o3") {
                o200k_base()
            } else {
                cl100k_base()
            }
            .map_err(|e| PipelineError::internal(format!("tokenizer init failed: {e}")))?;
            (bpe, 1.0)
        } else if model_name.starts_with("claude") {
            let bpe = cl100k_base()
                .map_err(|e| PipelineError::internal(format!("tokenizer init failed: {e}")))?;
            (bpe, 1.1)
        } else {
            log_warn!(model = %model_name, "unrecognized model, defaulting to cl100k_base 1.0x");
            let bpe = cl100k_base()
                .map_err(|e| PipelineError::internal(format!("tokenizer init failed: {e}")))?;
            (bpe, 1.0)
        };

        Ok(Self {
            tokenizer,
            model_name: model_name.to_string(),
            approximation_factor,
        })
    }

    /// Raw token count for a single string, scaled by the model's
    /// approximation factor.
    pub fn count_tokens(&self, text: &str) -> u32 {
        let raw = self.tokenizer.encode_with_special_tokens(text).len() as f32;
        (raw * self.approximation_factor).ceil() as u32
    }

    /// Token count for a full chat-style request: per-message overhead plus
    /// per-reply overhead, matching the accounting the provider's billing
    /// uses.
    pub fn count_request_tokens(&self, system: &str, messages: &[&str]) -> u32 {
        let mut total = 3u32 + self.count_tokens(system);
        for message in messages {
            total += 4 + self.count_tokens(message);
        }
        total += 3;
        total
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// USD cost per 1,000 tokens for a given model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelRate {
    pub prompt_per_1k: f64,
    /// Rate for prompt tokens served from the provider's prompt cache;
    /// cheaper than `prompt_per_1k` (`spec.md` §4.2: "defaults to half of
    /// input" when the pricing table omits it).
    pub cached_per_1k: f64,
    pub completion_per_1k: f64,
}

/// Maps model name to its [`ModelRate`], loaded from config (`spec.md` §6
/// config table: `pricing_table_path`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingTable {
    rates: HashMap<String, ModelRate>,
}

impl PricingTable {
    pub fn new(rates: HashMap<String, ModelRate>) -> Self {
        Self { rates }
    }

    pub fn rate_for(&self, model: &str) -> Option<ModelRate> {
        self.rates.get(model).copied()
    }

    /// Applies the `spec.md` §6 `PROMPT_PRICE_PER_M`/`OUTPUT_PRICE_PER_M`/
    /// `CACHED_PRICE_PER_M` config overrides to `model`'s rate. Any
    /// override left `None` falls back to the rate already loaded for
    /// `model` (or, if `model` has no existing entry at all, the
    /// half-of-input cached default from `spec.md` §4.2). A no-op (returns
    /// `self` unchanged) when none of the three overrides are set.
    pub fn with_overrides(
        mut self,
        model: &str,
        prompt_per_m: Option<f64>,
        cached_per_m: Option<f64>,
        output_per_m: Option<f64>,
    ) -> Self {
        if prompt_per_m.is_none() && cached_per_m.is_none() && output_per_m.is_none() {
            return self;
        }

        let existing = self.rate_for(model);
        let prompt_per_1k = prompt_per_m
            .map(|v| v / 1000.0)
            .or_else(|| existing.map(|r| r.prompt_per_1k))
            .unwrap_or(0.0);
        let completion_per_1k = output_per_m
            .map(|v| v / 1000.0)
            .or_else(|| existing.map(|r| r.completion_per_1k))
            .unwrap_or(0.0);
        let cached_per_1k = cached_per_m
            .map(|v| v / 1000.0)
            .or_else(|| existing.map(|r| r.cached_per_1k))
            .unwrap_or(prompt_per_1k / 2.0);

        self.rates.insert(
            model.to_string(),
            ModelRate { prompt_per_1k, cached_per_1k, completion_per_1k },
        );
        self
    }

    /// Estimated USD cost for a completed LLM call. `cached_tokens` is the
    /// subset of `prompt_tokens` served from the provider's prompt cache
    /// (I3: `cached_tokens <= prompt_tokens`) and is billed at
    /// `rate.cached_per_1k` instead of `rate.prompt_per_1k`. Returns `None`
    /// if the model isn't in the table — callers should log and continue;
    /// an unpriced model is not a processing failure.
    pub fn estimate_cost(
        &self,
        model: &str,
        prompt_tokens: u32,
        cached_tokens: u32,
        completion_tokens: u32,
    ) -> Option<f64> {
        let rate = self.rate_for(model)?;
        let uncached_prompt_tokens = prompt_tokens.saturating_sub(cached_tokens);
        Some(
            (uncached_prompt_tokens as f64 / 1000.0) * rate.prompt_per_1k
                + (cached_tokens as f64 / 1000.0) * rate.cached_per_1k
                + (completion_tokens as f64 / 1000.0) * rate.completion_per_1k,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_tokens_for_known_gpt_model() {
        let counter = TokenCounter::for_model("gpt-4o-mini").unwrap();
        let n = counter.count_tokens("Hello, world!");
        assert!(n > 0 && n < 10);
    }

    #[test]
    fn claude_models_apply_approximation_factor() {
        let counter = TokenCounter::for_model("claude-3-5-sonnet-20241022").unwrap();
        assert!((counter.approximation_factor - 1.1).abs() < f32::EPSILON);
    }

    #[test]
    fn request_tokens_include_per_message_overhead() {
        let counter = TokenCounter::for_model("gpt-4o").unwrap();
        let total = counter.count_request_tokens("be terse", &["hi", "hi"]);
        let single = counter.count_request_tokens("be terse", &["hi"]);
        assert!(total > single);
    }

    #[test]
    fn unpriced_model_returns_none_not_error() {
        let table = PricingTable::default();
        assert!(table.estimate_cost("unknown-model", 100, 0, 50).is_none());
    }

    #[test]
    fn estimate_cost_scales_linearly_with_tokens() {
        let mut rates = HashMap::new();
        rates.insert(
            "gpt-4o".to_string(),
            ModelRate {
                prompt_per_1k: 0.005,
                cached_per_1k: 0.0025,
                completion_per_1k: 0.015,
            },
        );
        let table = PricingTable::new(rates);
        let cost = table.estimate_cost("gpt-4o", 1000, 0, 1000).unwrap();
        assert!((cost - 0.020).abs() < 1e-9);
    }

    fn gpt_4o_mini_rates() -> PricingTable {
        let mut rates = HashMap::new();
        rates.insert(
            "gpt-4o-mini".to_string(),
            ModelRate { prompt_per_1k: 0.00015, cached_per_1k: 0.000075, completion_per_1k: 0.0006 },
        );
        PricingTable::new(rates)
    }

    /// E1 (`spec.md` §8): `{prompt_tokens:2429, cached_tokens:2331,
    /// output_tokens:500}` against the default $0.15/$0.60/$0.075-per-M
    /// rates.
    #[test]
    fn cached_tokens_discount_the_happy_path_example() {
        let table = gpt_4o_mini_rates();
        let cost = table.estimate_cost("gpt-4o-mini", 2429, 2331, 500).unwrap();
        assert!((cost - 0.00049).abs() < 1e-5, "got {cost}");
    }

    /// P9 (`spec.md` §8, line 268): for fixed model and usage, cost with
    /// `cached > 0` is strictly less than cost with `cached = 0`.
    #[test]
    fn cost_with_cached_tokens_is_strictly_less_than_without() {
        let table = gpt_4o_mini_rates();
        let prompt_tokens = 2429;
        let completion_tokens = 500;

        let cost_uncached = table.estimate_cost("gpt-4o-mini", prompt_tokens, 0, completion_tokens).unwrap();
        let cost_cached = table.estimate_cost("gpt-4o-mini", prompt_tokens, 2331, completion_tokens).unwrap();

        assert!(cost_cached < cost_uncached, "cached={cost_cached} uncached={cost_uncached}");
    }

    #[test]
    fn with_overrides_is_a_no_op_when_nothing_is_set() {
        let table = gpt_4o_mini_rates().with_overrides("gpt-4o-mini", None, None, None);
        let rate = table.rate_for("gpt-4o-mini").unwrap();
        assert_eq!(rate.prompt_per_1k, 0.00015);
    }

    #[test]
    fn with_overrides_replaces_only_the_given_fields() {
        let table = gpt_4o_mini_rates().with_overrides("gpt-4o-mini", Some(1.0), None, None);
        let rate = table.rate_for("gpt-4o-mini").unwrap();
        assert_eq!(rate.prompt_per_1k, 0.001);
        assert_eq!(rate.completion_per_1k, 0.0006);
    }

    #[test]
    fn with_overrides_defaults_cached_to_half_of_prompt_for_a_new_model() {
        let table = PricingTable::default().with_overrides("gpt-5", Some(2.0), None, Some(8.0));
        let rate = table.rate_for("gpt-5").unwrap();
        assert_eq!(rate.cached_per_1k, 0.001);
    }
}
