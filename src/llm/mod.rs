//! Structured-output LLM client (C6).
//!
//! One concrete implementation against the "responses API" contract in
//! `spec.md` §6, generalizing `providers/openai.rs` and
//! `core_types::provider::LlmProvider`: a config struct, a `reqwest::Client`,
//! and a retry policy, wrapped by C3's [`RetryExecutor`]. The circuit
//! breaker lives inside that executor — one instance per client, behind a
//! `tokio::sync::Mutex`, never a process global.

pub mod types;

use crate::error::PipelineError;
use crate::retry::{RetryExecutor, RetryPolicy};
use types::{
    ExtractionResult, FileUploadResponse, PromptMessages, ResponsesApiResponse,
    ResponsesFormatSpec, ResponsesInputItem, ResponsesRequest, ResponsesTextFormat, TokenUsage,
    UploadPurpose,
};

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::Mutex;

/// Contract the pipeline depends on (`spec.md` §4.6): upload a file, then
/// run a schema-constrained extraction against it.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn upload_file(&self, bytes: Vec<u8>, filename: &str, purpose: UploadPurpose) -> Result<String, PipelineError>;

    async fn extract_metadata(
        &self,
        model: &str,
        messages: &PromptMessages,
        file_id: &str,
        schema: serde_json::Value,
    ) -> Result<ExtractionResult, PipelineError>;

    async fn delete_file(&self, file_id: &str) -> Result<(), PipelineError>;
}

/// Client against any OpenAI-responses-API-compatible endpoint.
pub struct ResponsesApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: Mutex<RetryExecutor>,
}

impl ResponsesApiClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            retry: Mutex::new(RetryExecutor::new("llm", policy)),
        }
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    fn classify_status(status: StatusCode, body: &str) -> PipelineError {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            PipelineError::transient("llm", format!("{status}: {body}"), None)
        } else {
            PipelineError::permanent("llm", format!("{status}: {body}"))
        }
    }
}

#[async_trait]
impl LlmClient for ResponsesApiClient {
    async fn upload_file(&self, bytes: Vec<u8>, filename: &str, purpose: UploadPurpose) -> Result<String, PipelineError> {
        let url = format!("{}/files", self.base_url);
        let filename = filename.to_string();
        let purpose_str = purpose.as_str();

        let mut retry = self.retry.lock().await;
        retry
            .execute(|| {
                let bytes = bytes.clone();
                let filename = filename.clone();
                async move {
                    let part = reqwest::multipart::Part::bytes(bytes).file_name(filename);
                    let form = reqwest::multipart::Form::new()
                        .part("file", part)
                        .text("purpose", purpose_str);

                    let resp = self
                        .http
                        .post(&url)
                        .header("Authorization", self.auth_header())
                        .multipart(form)
                        .send()
                        .await
                        .map_err(|e| PipelineError::transient("llm", e.to_string(), Some(Box::new(e))))?;

                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if !status.is_success() {
                        return Err(Self::classify_status(status, &body));
                    }

                    let parsed: FileUploadResponse = serde_json::from_str(&body)
                        .map_err(|e| PipelineError::permanent("llm", format!("bad upload response: {e}")))?;
                    Ok(parsed.id)
                }
            })
            .await
    }

    async fn extract_metadata(
        &self,
        model: &str,
        messages: &PromptMessages,
        file_id: &str,
        schema: serde_json::Value,
    ) -> Result<ExtractionResult, PipelineError> {
        let url = format!("{}/responses", self.base_url);
        let request = ResponsesRequest {
            model: model.to_string(),
            input: vec![
                ResponsesInputItem {
                    role: "system".into(),
                    content: messages.system.clone(),
                },
                ResponsesInputItem {
                    role: "developer".into(),
                    content: format!("{}\n\n[attached file: {}]", messages.developer, file_id),
                },
                ResponsesInputItem {
                    role: "user".into(),
                    content: messages.user.clone(),
                },
            ],
            text: ResponsesTextFormat {
                format: ResponsesFormatSpec {
                    format_type: "json_schema".into(),
                    schema,
                    strict: true,
                },
            },
        };

        let mut retry = self.retry.lock().await;
        let api_response: ResponsesApiResponse = retry
            .execute(|| {
                let request = &request;
                async move {
                    let resp = self
                        .http
                        .post(&url)
                        .header("Authorization", self.auth_header())
                        .json(request)
                        .send()
                        .await
                        .map_err(|e| PipelineError::transient("llm", e.to_string(), Some(Box::new(e))))?;

                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if !status.is_success() {
                        return Err(Self::classify_status(status, &body));
                    }

                    serde_json::from_str(&body)
                        .map_err(|e| PipelineError::permanent("llm", format!("bad responses payload: {e}")))
                }
            })
            .await?;

        let text = api_response
            .output
            .first()
            .and_then(|msg| msg.content.first())
            .and_then(|c| c.text.clone())
            .ok_or_else(|| PipelineError::permanent("llm", "no output_text in responses payload"))?;

        let structured = parse_structured_output(&text)?;

        let usage = api_response
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                output_tokens: u.output_tokens,
                cached_tokens: u
                    .prompt_tokens_details
                    .map(|d| d.cached_tokens)
                    .unwrap_or(0),
            })
            .unwrap_or_default();

        let raw = serde_json::to_value(&structured).unwrap_or(serde_json::Value::Null);
        Ok(ExtractionResult {
            text,
            structured,
            usage,
            raw,
        })
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), PipelineError> {
        let url = format!("{}/files/{}", self.base_url, file_id);
        let mut retry = self.retry.lock().await;
        retry
            .execute(|| async {
                let resp = self
                    .http
                    .delete(&url)
                    .header("Authorization", self.auth_header())
                    .send()
                    .await
                    .map_err(|e| PipelineError::transient("llm", e.to_string(), Some(Box::new(e))))?;
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
}

/// 3-tier JSON-extraction fallback: direct parse, then artifact cleaning,
/// then balanced-brace extraction from mixed content. Ported from the
/// teacher's `ResponseParser`.
fn parse_structured_output(raw: &str) -> Result<serde_json::Value, PipelineError> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
        return validate_structured(value);
    }

    let cleaned = clean_artifacts(raw);
    if cleaned != raw {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&cleaned) {
            return validate_structured(value);
        }
    }

    if let Some(json_str) = extract_json_object(&cleaned) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&json_str) {
            return validate_structured(value);
        }
    }

    Err(PipelineError::permanent(
        "llm",
        format!(
            "could not parse structured JSON response from: {}{}",
            raw.chars().take(200).collect::<String>(),
            if raw.len() > 200 { "..." } else { "" }
        ),
    ))
}

fn validate_structured(value: serde_json::Value) -> Result<serde_json::Value, PipelineError> {
    match value.as_object() {
        Some(obj) if !obj.is_empty() => Ok(value),
        Some(_) => Err(PipelineError::permanent("llm", "structured response is an empty object")),
        None => Err(PipelineError::permanent("llm", "structured response must be a JSON object")),
    }
}

fn clean_artifacts(content: &str) -> String {
    content
        .replace("```json", "")
        .replace("```JSON", "")
        .replace("```", "")
        .trim()
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .collect()
}

fn extract_json_object(content: &str) -> Option<String> {
    let start_idx = content.find('{')?;
    let trimmed = &content[start_idx..];
    let chars: Vec<char> = trimmed.chars().collect();
    let end = find_balanced_json_end(&chars)?;
    Some(chars[0..=end].iter().collect())
}

fn find_balanced_json_end(chars: &[char]) -> Option<usize> {
    let mut brace_count = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in chars.iter().enumerate() {
        match ch {
            '"' if !escaped => in_string = !in_string,
            '\\' if in_string => escaped = !escaped,
            '{' if !in_string => brace_count += 1,
            '}' if !in_string => {
                brace_count -= 1;
                if brace_count == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
        if *ch != '\\' {
            escaped = false;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_direct_json() {
        let value = parse_structured_output(r#"{"doc_type":"invoice"}"#).unwrap();
        assert_eq!(value["doc_type"], "invoice");
    }

    #[test]
    fn cleans_markdown_code_fences() {
        let value = parse_structured_output("```json\n{\"doc_type\":\"invoice\"}\n```").unwrap();
        assert_eq!(value["doc_type"], "invoice");
    }

    #[test]
    fn extracts_json_from_mixed_content() {
        let value =
            parse_structured_output("Here is the result: {\"doc_type\":\"invoice\"} thanks").unwrap();
        assert_eq!(value["doc_type"], "invoice");
    }

    #[test]
    fn empty_object_is_rejected() {
        assert!(parse_structured_output("{}").is_err());
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(parse_structured_output("[1,2,3]").is_err());
    }
}
