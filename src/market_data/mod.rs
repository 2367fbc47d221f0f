//! Market-data adapter
//!
//! Four stateless lookups keyed by ticker symbol. Ticker syntax is never
//! validated here: unknown symbols come back as empty results and the agent
//! decides what to tell the user.

pub mod yahoo;

pub use yahoo::YahooFinanceClient;

use crate::error::ChatAgentError;
use crate::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Provider of the four market-data lookups exposed to the agent as tools.
#[async_trait::async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Latest closing price, or `None` when the provider has no history.
    async fn get_stock_price(&self, ticker: &str) -> Result<Option<f64>>;

    /// Daily bars whose dates fall within `[start, end]` (both inclusive).
    async fn get_historical_stock_price(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<HistoricalPrices>;

    /// Most recent annual balance-sheet line items.
    async fn get_balance_sheet(&self, ticker: &str) -> Result<BalanceSheet>;

    /// Recent news items in provider order.
    async fn get_stock_news(&self, ticker: &str) -> Result<Vec<NewsItem>>;
}

//
// ================= Result Types =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceBar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adj_close: Option<f64>,
    pub volume: u64,
}

/// Date-indexed daily price table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoricalPrices {
    pub ticker: String,
    pub bars: BTreeMap<NaiveDate, PriceBar>,
}

impl HistoricalPrices {
    pub fn empty(ticker: &str) -> Self {
        Self {
            ticker: ticker.to_string(),
            bars: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn latest_close(&self) -> Option<f64> {
        self.bars.values().next_back().map(|bar| bar.close)
    }

    /// Keep only bars in `[start, end]`.
    pub fn restrict_to(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.bars.retain(|date, _| *date >= start && *date <= end);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BalanceSheet {
    pub ticker: String,
    pub as_of: Option<NaiveDate>,
    pub currency: Option<String>,
    pub items: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewsItem {
    pub title: String,
    pub link: String,
    pub publisher: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

//
// ================= Input Helpers =================
//

/// Parse an ISO `YYYY-MM-DD` date pair and reject inverted ranges.
pub fn parse_date_range(start_date: &str, end_date: &str) -> Result<(NaiveDate, NaiveDate)> {
    let parse = |label: &str, raw: &str| {
        NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
            ChatAgentError::InvalidToolInput(format!(
                "{} must be an ISO date (YYYY-MM-DD), got '{}'",
                label, raw
            ))
        })
    };

    let start = parse("start_date", start_date)?;
    let end = parse("end_date", end_date)?;

    if start > end {
        return Err(ChatAgentError::InvalidToolInput(format!(
            "start_date {} is after end_date {}",
            start, end
        )));
    }

    Ok((start, end))
}

//
// ================= Response Parsing =================
//

fn float_at(values: Option<&Value>, index: usize) -> Option<f64> {
    values?.as_array()?.get(index)?.as_f64()
}

/// Parse a `/v8/finance/chart` payload into a date-indexed table.
///
/// Dates are taken in the exchange's local time (`meta.gmtoffset`). Bars
/// without a close (partial trading days) are skipped. A "Not Found" error
/// payload yields an empty table.
pub fn parse_chart(ticker: &str, payload: &Value) -> Result<HistoricalPrices> {
    let chart = payload.get("chart").ok_or_else(|| {
        ChatAgentError::MarketDataError("chart payload missing 'chart' field".to_string())
    })?;

    let result = match chart
        .get("result")
        .and_then(Value::as_array)
        .and_then(|r| r.first())
    {
        Some(result) => result,
        None => {
            if let Some(error) = chart.get("error").filter(|e| !e.is_null()) {
                tracing::debug!(%ticker, %error, "chart lookup returned no result");
            }
            return Ok(HistoricalPrices::empty(ticker));
        }
    };

    let offset = result
        .get("meta")
        .and_then(|m| m.get("gmtoffset"))
        .and_then(Value::as_i64)
        .unwrap_or(0);

    let timestamps = match result.get("timestamp").and_then(Value::as_array) {
        Some(ts) => ts,
        None => return Ok(HistoricalPrices::empty(ticker)),
    };

    let quote = result
        .get("indicators")
        .and_then(|i| i.get("quote"))
        .and_then(Value::as_array)
        .and_then(|q| q.first());
    let adjclose = result
        .get("indicators")
        .and_then(|i| i.get("adjclose"))
        .and_then(Value::as_array)
        .and_then(|a| a.first())
        .and_then(|a| a.get("adjclose"));

    let mut prices = HistoricalPrices::empty(ticker);

    for (index, ts) in timestamps.iter().enumerate() {
        let Some(ts) = ts.as_i64() else { continue };
        let Some(local) = DateTime::from_timestamp(ts + offset, 0) else {
            continue;
        };

        let field = |name: &str| float_at(quote.and_then(|q| q.get(name)), index);
        let Some(close) = field("close") else { continue };

        let bar = PriceBar {
            open: field("open").unwrap_or(close),
            high: field("high").unwrap_or(close),
            low: field("low").unwrap_or(close),
            close,
            adj_close: float_at(adjclose, index),
            volume: field("volume").map(|v| v.max(0.0) as u64).unwrap_or(0),
        };

        prices.bars.insert(local.date_naive(), bar);
    }

    Ok(prices)
}

/// Parse a fundamentals time-series payload, keeping the latest annual period.
pub fn parse_balance_sheet(ticker: &str, payload: &Value) -> Result<BalanceSheet> {
    let results = payload
        .get("timeseries")
        .and_then(|t| t.get("result"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    // (line item, as-of date, value, currency)
    let mut latest: Vec<(String, NaiveDate, f64, Option<String>)> = Vec::new();

    for series in &results {
        let Some(series_type) = series
            .get("meta")
            .and_then(|m| m.get("type"))
            .and_then(Value::as_array)
            .and_then(|t| t.first())
            .and_then(Value::as_str)
        else {
            continue;
        };

        let Some(entries) = series.get(series_type).and_then(Value::as_array) else {
            continue;
        };

        let newest = entries
            .iter()
            .filter_map(|entry| {
                let date = entry
                    .get("asOfDate")
                    .and_then(Value::as_str)
                    .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())?;
                let value = entry
                    .get("reportedValue")
                    .and_then(|v| v.get("raw"))
                    .and_then(Value::as_f64)?;
                let currency = entry
                    .get("currencyCode")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Some((date, value, currency))
            })
            .max_by_key(|(date, _, _)| *date);

        if let Some((date, value, currency)) = newest {
            let item = series_type
                .strip_prefix("annual")
                .unwrap_or(series_type)
                .to_string();
            latest.push((item, date, value, currency));
        }
    }

    let as_of = latest.iter().map(|(_, date, _, _)| *date).max();

    let mut sheet = BalanceSheet {
        ticker: ticker.to_string(),
        as_of,
        currency: None,
        items: BTreeMap::new(),
    };

    for (item, date, value, currency) in latest {
        if Some(date) == as_of {
            if sheet.currency.is_none() {
                sheet.currency = currency;
            }
            sheet.items.insert(item, value);
        }
    }

    Ok(sheet)
}

/// Parse the `news` array of a `/v1/finance/search` payload.
pub fn parse_news(payload: &Value) -> Vec<NewsItem> {
    payload
        .get("news")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let title = item.get("title").and_then(Value::as_str)?;
                    let link = item.get("link").and_then(Value::as_str).unwrap_or_default();
                    Some(NewsItem {
                        title: title.to_string(),
                        link: link.to_string(),
                        publisher: item
                            .get("publisher")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        published_at: item
                            .get("providerPublishTime")
                            .and_then(Value::as_i64)
                            .and_then(|ts| DateTime::from_timestamp(ts, 0)),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}
