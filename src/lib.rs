//! Stock Chat Agent
//!
//! A streaming chat service backed by an LLM agent with market-data tools:
//! - Accepts one user turn per request, keyed by a caller-chosen thread id
//! - Recovers earlier turns from a thread-scoped checkpoint store
//! - Lets the model call price, history, balance-sheet and news lookups
//! - Relays generated text to the HTTP client as it is produced
//!
//! REQUEST FLOW:
//! HTTP → AGENT TASK → MODEL ⇄ TOOLS → CHANNEL → RESPONSE BODY

pub mod agent;
pub mod api;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod llm;
pub mod market_data;
pub mod models;
pub mod tools;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use agent::StockAgent;
pub use config::AppConfig;
