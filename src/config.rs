//! Environment-sourced configuration
//!
//! Settings are read once at startup. A local `.env` file is loaded first
//! so development setups behave like the deployed process.

use crate::error::ChatAgentError;
use crate::Result;
use std::env;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_MODEL: &str = "c1/openai/gpt-5/v-20250930";
pub const DEFAULT_LLM_BASE_URL: &str = "https://api.thesys.dev/v1/embed";
pub const DEFAULT_MARKET_DATA_BASE_URL: &str = "https://query1.finance.yahoo.com";
pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 8;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: String,
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub market_data_base_url: String,
    pub host: String,
    pub port: u16,
    pub max_tool_rounds: usize,
    pub http_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            llm_base_url: DEFAULT_LLM_BASE_URL.to_string(),
            llm_api_key: String::new(),
            market_data_base_url: DEFAULT_MARKET_DATA_BASE_URL.to_string(),
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }
}

impl AppConfig {
    /// Load `.env` (if present) and then read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let llm_api_key = non_empty("OPENAI_API_KEY")
            .or_else(|| non_empty("THESYS_API_KEY"))
            .unwrap_or_default();
        if llm_api_key.is_empty() {
            warn!("OPENAI_API_KEY not set; model calls will be rejected by the provider");
        }

        let port = match non_empty("PORT").or_else(|| non_empty("API_PORT")) {
            Some(raw) => parse_number::<u16>("PORT", &raw)?,
            None => defaults.port,
        };

        let max_tool_rounds = match non_empty("MAX_TOOL_ROUNDS") {
            Some(raw) => parse_number::<usize>("MAX_TOOL_ROUNDS", &raw)?,
            None => defaults.max_tool_rounds,
        };

        let http_timeout = match non_empty("HTTP_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(parse_number::<u64>("HTTP_TIMEOUT_SECS", &raw)?),
            None => defaults.http_timeout,
        };

        Ok(Self {
            model: non_empty("MODEL").unwrap_or(defaults.model),
            llm_base_url: non_empty("OPENAI_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.llm_base_url),
            llm_api_key,
            market_data_base_url: non_empty("MARKET_DATA_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.market_data_base_url),
            host: non_empty("HOST").unwrap_or(defaults.host),
            port,
            max_tool_rounds,
            http_timeout,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse::<T>().map_err(|_| {
        ChatAgentError::ConfigError(format!("{} must be a number, got '{}'", key, raw))
    })
}
