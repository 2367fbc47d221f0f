//! Yahoo Finance backed market-data provider
//!
//! Uses the public JSON endpoints that `yfinance`-style clients read:
//! the v8 chart API for prices, the fundamentals time series for balance
//! sheets, and the search API for news.

use super::{
    parse_balance_sheet, parse_chart, parse_news, BalanceSheet, HistoricalPrices,
    MarketDataProvider, NewsItem,
};
use crate::error::ChatAgentError;
use crate::Result;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Balance-sheet line items requested from the fundamentals time series.
const BALANCE_SHEET_ITEMS: &[&str] = &[
    "TotalAssets",
    "TotalLiabilitiesNetMinorityInterest",
    "StockholdersEquity",
    "TotalCapitalization",
    "CurrentAssets",
    "CurrentLiabilities",
    "WorkingCapital",
    "CashAndCashEquivalents",
    "AccountsReceivable",
    "Inventory",
    "NetPPE",
    "Goodwill",
    "AccountsPayable",
    "LongTermDebt",
    "TotalDebt",
    "NetDebt",
    "RetainedEarnings",
    "TangibleBookValue",
    "InvestedCapital",
    "OrdinarySharesNumber",
];

const NEWS_COUNT: u32 = 10;

/// Connection-pooled Yahoo Finance client
#[derive(Clone)]
pub struct YahooFinanceClient {
    client: Client,
    base_url: String,
}

impl YahooFinanceClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Build `{base_url}/{segments...}`, percent-encoding each segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            ChatAgentError::ConfigError(format!(
                "Invalid market data base URL '{}': {}",
                self.base_url, e
            ))
        })?;

        url.path_segments_mut()
            .map_err(|_| {
                ChatAgentError::ConfigError(format!(
                    "Market data base URL '{}' cannot carry a path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(segments);

        Ok(url)
    }

    /// GET a JSON document. A 404 is returned as `Ok(None)`.
    async fn get_json(&self, url: Url, query: &[(&str, String)]) -> Result<Option<Value>> {
        debug!(url = %url, "market data request");

        let response = self
            .client
            .get(url.clone())
            .query(query)
            .send()
            .await
            .map_err(|e| {
                ChatAgentError::MarketDataError(format!("Request to {} failed: {}", url.path(), e))
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(url = %url, "market data not found");
            return Ok(None);
        }

        let body = response.text().await.map_err(|e| {
            ChatAgentError::MarketDataError(format!("Failed to read response body: {}", e))
        })?;

        if !status.is_success() {
            return Err(ChatAgentError::MarketDataError(format!(
                "Market data provider returned {} for {}: {}",
                status,
                url.path(),
                body
            )));
        }

        let payload = serde_json::from_str::<Value>(&body).map_err(|e| {
            ChatAgentError::MarketDataError(format!("Invalid JSON from market data provider: {}", e))
        })?;

        Ok(Some(payload))
    }

    async fn chart(&self, ticker: &str, query: Vec<(&str, String)>) -> Result<HistoricalPrices> {
        let url = self.endpoint(&["v8", "finance", "chart", ticker])?;
        match self.get_json(url, &query).await? {
            Some(payload) => parse_chart(ticker, &payload),
            None => Ok(HistoricalPrices::empty(ticker)),
        }
    }
}

#[async_trait::async_trait]
impl MarketDataProvider for YahooFinanceClient {
    async fn get_stock_price(&self, ticker: &str) -> Result<Option<f64>> {
        let prices = self
            .chart(
                ticker,
                vec![("range", "1mo".to_string()), ("interval", "1d".to_string())],
            )
            .await?;

        Ok(prices.latest_close())
    }

    async fn get_historical_stock_price(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<HistoricalPrices> {
        // period2 is exclusive upstream; pad by a day and filter locally
        let period1 = start.and_hms_opt(0, 0, 0).map(|d| d.and_utc().timestamp());
        let period2 = end
            .succ_opt()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc().timestamp());

        let (Some(period1), Some(period2)) = (period1, period2) else {
            return Err(ChatAgentError::InvalidToolInput(format!(
                "Date range {}..{} is out of bounds",
                start, end
            )));
        };

        let prices = self
            .chart(
                ticker,
                vec![
                    ("period1", period1.to_string()),
                    ("period2", period2.to_string()),
                    ("interval", "1d".to_string()),
                    ("events", "div,splits".to_string()),
                ],
            )
            .await?;

        Ok(prices.restrict_to(start, end))
    }

    async fn get_balance_sheet(&self, ticker: &str) -> Result<BalanceSheet> {
        let url = self.endpoint(&[
            "ws",
            "fundamentals-timeseries",
            "v1",
            "finance",
            "timeseries",
            ticker,
        ])?;

        let types = BALANCE_SHEET_ITEMS
            .iter()
            .map(|item| format!("annual{}", item))
            .collect::<Vec<_>>()
            .join(",");

        // five fiscal years back is enough to find the latest annual report
        let period1 = (Utc::now() - ChronoDuration::days(5 * 366)).timestamp();
        let period2 = Utc::now().timestamp();

        let query = vec![
            ("symbol", ticker.to_string()),
            ("type", types),
            ("period1", period1.to_string()),
            ("period2", period2.to_string()),
        ];

        match self.get_json(url, &query).await? {
            Some(payload) => parse_balance_sheet(ticker, &payload),
            None => parse_balance_sheet(ticker, &Value::Null),
        }
    }

    async fn get_stock_news(&self, ticker: &str) -> Result<Vec<NewsItem>> {
        let url = self.endpoint(&["v1", "finance", "search"])?;
        let query = vec![
            ("q", ticker.to_string()),
            ("quotesCount", "0".to_string()),
            ("newsCount", NEWS_COUNT.to_string()),
        ];

        Ok(self
            .get_json(url, &query)
            .await?
            .map(|payload| parse_news(&payload))
            .unwrap_or_default())
    }
}
