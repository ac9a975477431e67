//! Request/response types for the structured-output LLM client (C6).
//!
//! Generalized from `core_types::messages`/`core_types::provider`: the
//! pipeline only ever sends one shape of request (system + developer +
//! user, schema-constrained), so this is a narrower, purpose-built type
//! set rather than the teacher's full multi-role/multi-tool request
//! builder.

use serde::{Deserialize, Serialize};

/// The three-role prompt `spec.md` §4.6 requires. `system` and `developer`
/// must be byte-identical across calls to maximize provider-side prompt
/// caching; `user` carries the per-document content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessages {
    pub system: String,
    pub developer: String,
    pub user: String,
}

impl PromptMessages {
    pub fn as_slice(&self) -> [&str; 3] {
        [&self.system, &self.developer, &self.user]
    }
}

/// Token usage returned by an extraction call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub output_tokens: u32,
    pub cached_tokens: u32,
}

/// Result of a structured-output extraction call.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub text: String,
    pub structured: serde_json::Value,
    pub usage: TokenUsage,
    pub raw: serde_json::Value,
}

/// `purpose` argument to `Upload`, mirrors the LLM provider's file-purpose
/// enum (`spec.md` §6: `POST /files`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPurpose {
    Assistants,
    UserData,
}

impl UploadPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assistants => "assistants",
            Self::UserData => "user_data",
        }
    }
}

/// Wire shape of `POST /responses` (`spec.md` §6).
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ResponsesRequest {
    pub model: String,
    pub input: Vec<ResponsesInputItem>,
    pub text: ResponsesTextFormat,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ResponsesInputItem {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ResponsesTextFormat {
    pub format: ResponsesFormatSpec,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ResponsesFormatSpec {
    #[serde(rename = "type")]
    pub format_type: String,
    pub schema: serde_json::Value,
    pub strict: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ResponsesApiResponse {
    pub output: Vec<ResponsesOutputMessage>,
    pub usage: Option<ResponsesUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ResponsesOutputMessage {
    pub content: Vec<ResponsesOutputContent>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ResponsesOutputContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ResponsesUsage {
    pub prompt_tokens: u32,
    pub output_tokens: u32,
    #[serde(default)]
    pub prompt_tokens_details: Option<ResponsesPromptTokensDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ResponsesPromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct FileUploadResponse {
    pub id: String,
}
