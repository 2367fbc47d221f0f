//! Chat-model seam
//!
//! The agent talks to the model through [`ChatModel`], which yields text
//! deltas as they are generated and ends with a single `Completed` event
//! carrying the full message and any requested tool calls.

pub mod openai;

pub use openai::OpenAiCompatClient;

use crate::models::{ChatMessage, ToolCall, ToolDefinition};
use crate::Result;
use futures::Stream;
use std::pin::Pin;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionEvent {
    TextDelta(String),
    Completed(CompletionResponse),
}

pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<CompletionEvent>> + Send>>;

#[async_trait::async_trait]
pub trait ChatModel: Send + Sync {
    fn model_id(&self) -> &str;

    /// Start a streaming completion.
    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream>;
}
