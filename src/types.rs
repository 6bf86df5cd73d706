use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Daily (or coarser) OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Supported history intervals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Interval {
    #[default]
    #[serde(rename = "1d")]
    Day1,
    #[serde(rename = "1wk")]
    Week1,
    #[serde(rename = "1mo")]
    Month1,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Day1 => "1d",
            Interval::Week1 => "1wk",
            Interval::Month1 => "1mo",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "1d" => Some(Interval::Day1),
            "1wk" => Some(Interval::Week1),
            "1mo" => Some(Interval::Month1),
            _ => None,
        }
    }

    /// Date of the bar following `date` (weekends skipped for daily bars)
    pub fn next_date(&self, date: NaiveDate) -> NaiveDate {
        match self {
            Interval::Day1 => {
                let mut next = date + Duration::days(1);
                while matches!(next.weekday(), Weekday::Sat | Weekday::Sun) {
                    next += Duration::days(1);
                }
                next
            }
            Interval::Week1 => date + Duration::days(7),
            Interval::Month1 => date
                .checked_add_months(chrono::Months::new(1))
                .unwrap_or(date + Duration::days(30)),
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive date range for a history request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl HistoryRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// `years` years ending yesterday, relative to `today`
    pub fn trailing_years(today: NaiveDate, years: u32) -> Self {
        let end = today - Duration::days(1);
        let start = end
            .checked_sub_months(chrono::Months::new(12 * years))
            .unwrap_or(end - Duration::days(365 * years as i64));
        Self { start, end }
    }
}

/// Company details returned by ticker validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyInfo {
    pub name: String,
    pub sector: String,
    pub industry: String,
    pub market_cap: f64,
    pub current_price: f64,
}

/// Health status of a data source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHealth {
    pub source: String,
    pub is_healthy: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub success_rate: f64,
    pub avg_latency_ms: u64,
}

/// Error types for data retrieval
#[derive(Debug, thiserror::Error)]
pub enum DataRetrievalError {
    #[error("API request failed: {0}")]
    ApiError(String),

    #[error("Rate limit exceeded for {source_name}")]
    RateLimit {
        source_name: String,
        retry_after: Option<u64>,
    },

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("Asset not found: {0}")]
    AssetNotFound(String),
}

/// Result type for data retrieval operations
pub type Result<T> = std::result::Result<T, DataRetrievalError>;

/// Trait for historical market data providers
#[async_trait::async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Check that a ticker exists and is tradeable.
    ///
    /// `Ok(None)` means the source answered but the ticker is not valid.
    async fn validate(&self, ticker: &str) -> Result<Option<CompanyInfo>>;

    /// Ascending, de-duplicated bars for the range. An empty vec is a valid
    /// "no data" answer, not an error.
    async fn history(
        &self,
        ticker: &str,
        range: &HistoryRange,
        interval: Interval,
    ) -> Result<Vec<Bar>>;

    /// Health from recent requests; sources without tracking report healthy
    async fn health(&self) -> SourceHealth {
        SourceHealth {
            source: self.name().to_string(),
            is_healthy: true,
            last_success: None,
            last_error: None,
            success_rate: 1.0,
            avg_latency_ms: 0,
        }
    }

    /// Source name
    fn name(&self) -> &str;
}

/// Sort bars by date, keep the last bar for a repeated date and drop bars
/// with a non-finite close.
pub fn normalize_bars(mut bars: Vec<Bar>) -> Vec<Bar> {
    bars.retain(|b| b.close.is_finite());
    bars.sort_by_key(|b| b.date);

    let mut out: Vec<Bar> = Vec::with_capacity(bars.len());
    for bar in bars {
        match out.last_mut() {
            Some(last) if last.date == bar.date => *last = bar,
            _ => out.push(bar),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn bar(date: NaiveDate, close: f64) -> Bar {
        Bar {
            date,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        }
    }

    #[test]
    fn test_next_date_skips_weekend() {
        // 2024-03-08 is a Friday
        assert_eq!(Interval::Day1.next_date(d(2024, 3, 8)), d(2024, 3, 11));
        assert_eq!(Interval::Day1.next_date(d(2024, 3, 5)), d(2024, 3, 6));
        assert_eq!(Interval::Week1.next_date(d(2024, 3, 8)), d(2024, 3, 15));
        assert_eq!(Interval::Month1.next_date(d(2024, 1, 31)), d(2024, 2, 29));
    }

    #[test]
    fn test_interval_serde_names() {
        assert_eq!(serde_json::to_string(&Interval::Week1).unwrap(), "\"1wk\"");
        let parsed: Interval = serde_json::from_str("\"1mo\"").unwrap();
        assert_eq!(parsed, Interval::Month1);
        assert_eq!(Interval::parse("1d"), Some(Interval::Day1));
        assert_eq!(Interval::parse("5m"), None);
    }

    #[test]
    fn test_trailing_years_ends_yesterday() {
        let range = HistoryRange::trailing_years(d(2024, 6, 15), 5);
        assert_eq!(range.end, d(2024, 6, 14));
        assert_eq!(range.start, d(2019, 6, 14));
    }

    #[test]
    fn test_normalize_bars_sorts_and_dedups() {
        let bars = vec![
            bar(d(2024, 1, 3), 3.0),
            bar(d(2024, 1, 2), 2.0),
            bar(d(2024, 1, 3), 4.0),
            bar(d(2024, 1, 4), f64::NAN),
        ];
        let out = normalize_bars(bars);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].close, 2.0);
        assert_eq!(out[1].close, 4.0);
    }
}
