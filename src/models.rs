//! Core data models for the stock chat agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

//
// ================= Inbound Request =================
//

/// One caller-supplied message. `role` is a free-form label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTurn {
    pub content: String,
    pub id: String,
    pub role: String,
}

/// Envelope accepted by `POST /api/chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub prompt: ChatTurn,
    pub thread_id: String,
    /// Correlation token; echoed back, never interpreted.
    pub response_id: String,
}

//
// ================= Conversation =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        };
        write!(f, "{}", s)
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One entry of a thread's history as the model sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    fn build(role: MessageRole, content: String) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::build(MessageRole::System, content.into())
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::build(MessageRole::User, content.into())
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut message = Self::build(MessageRole::Assistant, content.into());
        message.tool_calls = tool_calls;
        message
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Self::build(MessageRole::Tool, content.into());
        message.tool_call_id = Some(tool_call_id.into());
        message
    }
}

//
// ================= Tool I/O =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInput {
    pub tool_name: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub data: serde_json::Value,
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Tool metadata handed to the model so it can choose tools on its own
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_uses_camel_case() {
        let raw = r#"{
            "prompt": {"content": "Price of AAPL?", "id": "m1", "role": "user"},
            "threadId": "t-1",
            "responseId": "r-1"
        }"#;

        let request: ChatRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.thread_id, "t-1");
        assert_eq!(request.response_id, "r-1");
        assert_eq!(request.prompt.content, "Price of AAPL?");
    }

    #[test]
    fn test_chat_request_requires_response_id() {
        let raw = r#"{
            "prompt": {"content": "hi", "id": "m1", "role": "user"},
            "threadId": "t-1"
        }"#;

        assert!(serde_json::from_str::<ChatRequest>(raw).is_err());
    }

    #[test]
    fn test_tool_message_carries_call_id() {
        let message = ChatMessage::tool("call_1", "{}");
        assert_eq!(message.role, MessageRole::Tool);
        assert_eq!(message.tool_call_id.as_deref(), Some("call_1"));
        assert!(message.tool_calls.is_empty());
    }
}
