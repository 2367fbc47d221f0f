//! Error types for the stock chat agent

use thiserror::Error;

/// Result type alias for agent and service operations
pub type Result<T> = std::result::Result<T, ChatAgentError>;

#[derive(Error, Debug)]
pub enum ChatAgentError {

    // =============================
    // Service Errors
    // =============================

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Market data error: {0}")]
    MarketDataError(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Agent error: {0}")]
    AgentError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
