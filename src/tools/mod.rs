//! Tool trait and registry
//!
//! Tools are the callable capabilities the agent may invoke on its own.
//! Each one carries a natural-language description and a JSON input schema
//! that are forwarded to the model.

use crate::error::ChatAgentError;
use crate::market_data::{parse_date_range, MarketDataProvider};
use crate::models::{ToolDefinition, ToolInput, ToolOutput};
use crate::Result;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Trait for a single tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON schema of the tool's arguments
    fn parameters(&self) -> Value;
    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput>;
}

/// Tool registry for looking up and executing tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions for the model request, sorted by name for stable prompts.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub async fn execute(&self, name: &str, parameters: Value) -> Result<ToolOutput> {
        let tool = self
            .get(name)
            .ok_or_else(|| ChatAgentError::ToolNotFound(name.to_string()))?;

        let input = ToolInput {
            tool_name: name.to_string(),
            parameters,
        };
        tool.execute(&input).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_object_parameters(input: &ToolInput) -> Result<()> {
    if input.parameters.is_object() {
        Ok(())
    } else {
        Err(ChatAgentError::InvalidToolInput(
            "tool_input must be a JSON object".to_string(),
        ))
    }
}

fn require_str<'a>(input: &'a ToolInput, key: &str) -> Result<&'a str> {
    input
        .parameters
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            ChatAgentError::InvalidToolInput(format!(
                "Expected string '{}' in {} input",
                key, input.tool_name
            ))
        })
}

fn ticker_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "ticker": {"type": "string", "description": "Ticker symbol, e.g. AAPL"}
        },
        "required": ["ticker"]
    })
}

pub struct StockPriceTool {
    provider: Arc<dyn MarketDataProvider>,
}

#[async_trait::async_trait]
impl Tool for StockPriceTool {
    fn name(&self) -> &'static str {
        "get_stock_price"
    }

    fn description(&self) -> &'static str {
        "A function that returns the current stock price based on a ticker symbol"
    }

    fn parameters(&self) -> Value {
        ticker_schema()
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        ensure_object_parameters(input)?;
        let ticker = require_str(input, "ticker")?;
        let price = self.provider.get_stock_price(ticker).await?;

        Ok(ToolOutput::ok(json!({
            "ticker": ticker,
            "price": price,
        })))
    }
}

pub struct HistoricalStockPriceTool {
    provider: Arc<dyn MarketDataProvider>,
}

#[async_trait::async_trait]
impl Tool for HistoricalStockPriceTool {
    fn name(&self) -> &'static str {
        "get_historical_stock_price"
    }

    fn description(&self) -> &'static str {
        "A function that returns the current stock price over time based on a ticker symbol and a start and end date."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "ticker": {"type": "string", "description": "Ticker symbol, e.g. AAPL"},
                "start_date": {"type": "string", "description": "Inclusive start date, YYYY-MM-DD"},
                "end_date": {"type": "string", "description": "Inclusive end date, YYYY-MM-DD"}
            },
            "required": ["ticker", "start_date", "end_date"]
        })
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        ensure_object_parameters(input)?;
        let ticker = require_str(input, "ticker")?;
        let (start, end) = parse_date_range(
            require_str(input, "start_date")?,
            require_str(input, "end_date")?,
        )?;

        let prices = self
            .provider
            .get_historical_stock_price(ticker, start, end)
            .await?;

        Ok(ToolOutput::ok(serde_json::to_value(prices)?))
    }
}

pub struct BalanceSheetTool {
    provider: Arc<dyn MarketDataProvider>,
}

#[async_trait::async_trait]
impl Tool for BalanceSheetTool {
    fn name(&self) -> &'static str {
        "get_balance_sheet"
    }

    fn description(&self) -> &'static str {
        "A function that returns the balance sheet based on a ticker symbol."
    }

    fn parameters(&self) -> Value {
        ticker_schema()
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        ensure_object_parameters(input)?;
        let ticker = require_str(input, "ticker")?;
        let sheet = self.provider.get_balance_sheet(ticker).await?;

        Ok(ToolOutput::ok(serde_json::to_value(sheet)?))
    }
}

pub struct StockNewsTool {
    provider: Arc<dyn MarketDataProvider>,
}

#[async_trait::async_trait]
impl Tool for StockNewsTool {
    fn name(&self) -> &'static str {
        "get_stock_news"
    }

    fn description(&self) -> &'static str {
        "A function that returns news based on a ticker symbol."
    }

    fn parameters(&self) -> Value {
        ticker_schema()
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        ensure_object_parameters(input)?;
        let ticker = require_str(input, "ticker")?;
        let news = self.provider.get_stock_news(ticker).await?;

        Ok(ToolOutput::ok(serde_json::to_value(news)?))
    }
}

/// Create a registry with the four market-data tools.
pub fn create_market_registry(provider: Arc<dyn MarketDataProvider>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(StockPriceTool {
        provider: provider.clone(),
    }));
    registry.register(Arc::new(HistoricalStockPriceTool {
        provider: provider.clone(),
    }));
    registry.register(Arc::new(BalanceSheetTool {
        provider: provider.clone(),
    }));
    registry.register(Arc::new(StockNewsTool { provider }));

    registry
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::market_data::{BalanceSheet, HistoricalPrices, NewsItem, PriceBar};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    /// Provider with canned data; any ticker other than AAPL is unknown.
    pub(crate) struct StubProvider;

    #[async_trait::async_trait]
    impl MarketDataProvider for StubProvider {
        async fn get_stock_price(&self, ticker: &str) -> Result<Option<f64>> {
            Ok((ticker == "AAPL").then_some(189.5))
        }

        async fn get_historical_stock_price(
            &self,
            ticker: &str,
            start: NaiveDate,
            end: NaiveDate,
        ) -> Result<HistoricalPrices> {
            let mut prices = HistoricalPrices::empty(ticker);
            if ticker == "AAPL" {
                for day in [2, 3, 4] {
                    let date = NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
                    prices.bars.insert(
                        date,
                        PriceBar {
                            open: 185.0,
                            high: 186.0,
                            low: 184.0,
                            close: 185.5,
                            adj_close: None,
                            volume: 1_000,
                        },
                    );
                }
            }
            Ok(prices.restrict_to(start, end))
        }

        async fn get_balance_sheet(&self, ticker: &str) -> Result<BalanceSheet> {
            Ok(BalanceSheet {
                ticker: ticker.to_string(),
                as_of: None,
                currency: None,
                items: BTreeMap::new(),
            })
        }

        async fn get_stock_news(&self, _ticker: &str) -> Result<Vec<NewsItem>> {
            Err(ChatAgentError::MarketDataError("news feed offline".to_string()))
        }
    }

    fn registry() -> ToolRegistry {
        create_market_registry(Arc::new(StubProvider))
    }

    #[test]
    fn test_registry_lists_market_tools() {
        let registry = registry();
        let names: Vec<String> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![
                "get_balance_sheet",
                "get_historical_stock_price",
                "get_stock_news",
                "get_stock_price"
            ]
        );
        assert!(registry.get("get_stock_price").is_some());
        assert!(ToolRegistry::default().is_empty());
    }

    #[tokio::test]
    async fn test_price_tool_returns_null_for_unknown_ticker() {
        let output = registry()
            .execute("get_stock_price", json!({"ticker": "ZZZZ9999"}))
            .await
            .unwrap();

        assert!(output.success);
        assert!(output.data["price"].is_null());
    }

    #[tokio::test]
    async fn test_historical_tool_filters_range() {
        let output = registry()
            .execute(
                "get_historical_stock_price",
                json!({"ticker": "AAPL", "start_date": "2024-01-03", "end_date": "2024-01-31"}),
            )
            .await
            .unwrap();

        let bars = output.data["bars"].as_object().unwrap();
        assert_eq!(bars.len(), 2);
        assert!(bars.contains_key("2024-01-03"));
        assert!(!bars.contains_key("2024-01-02"));
    }

    #[tokio::test]
    async fn test_invalid_inputs_are_rejected() {
        let registry = registry();

        let missing = registry.execute("get_balance_sheet", json!({})).await;
        assert!(matches!(missing, Err(ChatAgentError::InvalidToolInput(_))));

        let not_object = registry.execute("get_stock_price", json!("AAPL")).await;
        assert!(matches!(not_object, Err(ChatAgentError::InvalidToolInput(_))));

        let inverted = registry
            .execute(
                "get_historical_stock_price",
                json!({"ticker": "AAPL", "start_date": "2024-02-01", "end_date": "2024-01-01"}),
            )
            .await;
        assert!(matches!(inverted, Err(ChatAgentError::InvalidToolInput(_))));

        let unknown = registry.execute("get_dividends", json!({"ticker": "AAPL"})).await;
        assert!(matches!(unknown, Err(ChatAgentError::ToolNotFound(_))));
    }

    #[tokio::test]
    async fn test_provider_errors_propagate() {
        let result = registry()
            .execute("get_stock_news", json!({"ticker": "AAPL"}))
            .await;
        assert!(matches!(result, Err(ChatAgentError::MarketDataError(_))));
    }
}
