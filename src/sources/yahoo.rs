use crate::types::*;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";

/// Outcomes of chart calls, so `/health` can answer without hitting Yahoo
#[derive(Default)]
struct ChartStats {
    /// Wall-clock millis of the newest answered call, 0 if none
    ok_at_ms: AtomicU64,
    /// Wall-clock millis of the newest failed call, 0 if none
    failed_at_ms: AtomicU64,
    answered_count: AtomicU64,
    failed_count: AtomicU64,
    total_latency_ms: AtomicU64,
}

impl ChartStats {
    fn answered(&self, latency: Duration) {
        self.ok_at_ms.store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
        self.total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        self.answered_count.fetch_add(1, Ordering::Relaxed);
    }

    fn failed(&self) {
        self.failed_at_ms.store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
        self.failed_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Healthy until a failure is newer than the last answer
    fn healthy(&self) -> bool {
        self.failed_at_ms.load(Ordering::Relaxed) <= self.ok_at_ms.load(Ordering::Relaxed)
    }

    fn last_answer(&self) -> Option<DateTime<Utc>> {
        match self.ok_at_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms as i64),
        }
    }

    fn success_rate(&self) -> f64 {
        let answered = self.answered_count.load(Ordering::Relaxed);
        let calls = answered + self.failed_count.load(Ordering::Relaxed);
        if calls == 0 {
            1.0
        } else {
            answered as f64 / calls as f64
        }
    }

    fn avg_latency_ms(&self) -> u64 {
        let answered = self.answered_count.load(Ordering::Relaxed);
        if answered == 0 {
            0
        } else {
            self.total_latency_ms.load(Ordering::Relaxed) / answered
        }
    }
}

/// Yahoo Finance chart API client
pub struct YahooFinanceClient {
    client: Client,
    base_url: String,
    permits: tokio::sync::Semaphore,
    last_request: tokio::sync::Mutex<Instant>,
    stats: ChartStats,
}

impl YahooFinanceClient {
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
    /// Minimum spacing between chart calls
    const MIN_REQUEST_GAP: Duration = Duration::from_millis(100);
    const MAX_RETRY_WAIT_SECS: u64 = 60;

    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent("Mozilla/5.0 (compatible; forecast-api/0.1)")
            .build()
            .map_err(|e| DataRetrievalError::ApiError(format!("failed to create HTTP client: {}", e)))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        let long_ago = Instant::now()
            .checked_sub(Self::MIN_REQUEST_GAP)
            .unwrap_or_else(Instant::now);

        Ok(Self {
            client,
            base_url,
            permits: tokio::sync::Semaphore::new(2),
            last_request: tokio::sync::Mutex::new(long_ago),
            stats: ChartStats::default(),
        })
    }

    fn fail(&self, err: DataRetrievalError) -> DataRetrievalError {
        self.stats.failed();
        err
    }

    /// Holds one of the permits and keeps calls `MIN_REQUEST_GAP` apart
    async fn throttle(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| DataRetrievalError::ApiError(e.to_string()))?;
        let mut last = self.last_request.lock().await;
        let since = last.elapsed();
        if since < Self::MIN_REQUEST_GAP {
            tokio::time::sleep(Self::MIN_REQUEST_GAP - since).await;
        }
        *last = Instant::now();
        Ok(permit)
    }

    /// GET a chart path and decode the JSON body.
    ///
    /// Yahoo answers unknown symbols with 404, surfaced as `AssetNotFound`.
    /// A 429 is waited out once, honouring `retry-after`.
    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let started = Instant::now();
        let mut throttled = false;

        loop {
            let _permit = self.throttle().await.map_err(|e| self.fail(e))?;

            let send = self.client.get(&url).query(query).send();
            let response = match tokio::time::timeout(Self::REQUEST_TIMEOUT, send).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(self.fail(DataRetrievalError::ApiError(e.to_string()))),
                Err(_) => {
                    return Err(self.fail(DataRetrievalError::ApiError(format!(
                        "Yahoo chart call {} gave no answer within {}s",
                        path,
                        Self::REQUEST_TIMEOUT.as_secs()
                    ))))
                }
            };

            match response.status() {
                StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok());
                    if throttled {
                        return Err(self.fail(DataRetrievalError::RateLimit {
                            source_name: self.name().to_string(),
                            retry_after,
                        }));
                    }
                    throttled = true;
                    let wait_secs = retry_after.unwrap_or(5).min(Self::MAX_RETRY_WAIT_SECS);
                    tracing::warn!(path, wait_secs, "Yahoo throttled chart call, waiting once");
                    tokio::time::sleep(Duration::from_secs(wait_secs)).await;
                }
                StatusCode::NOT_FOUND => {
                    // Yahoo answered, so this does not count against health
                    self.stats.answered(started.elapsed());
                    return Err(DataRetrievalError::AssetNotFound(path.to_string()));
                }
                status if !status.is_success() => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(self.fail(DataRetrievalError::ApiError(format!(
                        "Yahoo API error ({}): {}",
                        status, body
                    ))));
                }
                _ => {
                    self.stats.answered(started.elapsed());
                    return response
                        .json::<T>()
                        .await
                        .map_err(|e| self.fail(DataRetrievalError::InvalidResponse(e.to_string())));
                }
            }
        }
    }

    async fn chart(&self, ticker: &str, query: &[(&str, String)]) -> Result<ChartResult> {
        let path = format!("/v8/finance/chart/{}", ticker);
        let envelope: ChartEnvelope = self.get_json(&path, query).await?;

        if let Some(err) = envelope.chart.error {
            return Err(DataRetrievalError::AssetNotFound(format!(
                "{}: {} {}",
                ticker,
                err.code,
                err.description.unwrap_or_default()
            )));
        }

        envelope
            .chart
            .result
            .and_then(|mut r| if r.is_empty() { None } else { Some(r.swap_remove(0)) })
            .ok_or_else(|| DataRetrievalError::InvalidResponse(format!("empty chart result for {}", ticker)))
    }

    /// Look up a ticker. `None` when the symbol is unknown or has no price.
    pub async fn validate(&self, ticker: &str) -> Result<Option<CompanyInfo>> {
        let query = [("range", "5d".to_string()), ("interval", "1d".to_string())];
        let chart = match self.chart(ticker, &query).await {
            Ok(chart) => chart,
            Err(DataRetrievalError::AssetNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(company_info(ticker, &chart.meta))
    }

    /// Daily, weekly or monthly bars over an inclusive date range
    pub async fn history(
        &self,
        ticker: &str,
        range: &HistoryRange,
        interval: Interval,
    ) -> Result<Vec<Bar>> {
        let period1 = range.start.and_time(NaiveTime::MIN).and_utc().timestamp();
        let period2 = (range.end + ChronoDuration::days(1))
            .and_time(NaiveTime::MIN)
            .and_utc()
            .timestamp();
        let query = [
            ("period1", period1.to_string()),
            ("period2", period2.to_string()),
            ("interval", interval.as_str().to_string()),
            ("events", "history".to_string()),
        ];

        let chart = match self.chart(ticker, &query).await {
            Ok(chart) => chart,
            Err(DataRetrievalError::AssetNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let bars = bars_from_chart(&chart);
        tracing::debug!(ticker, rows = bars.len(), "fetched Yahoo history");
        Ok(bars)
    }

    /// Get health status using internal metrics (no API call)
    pub async fn health(&self) -> SourceHealth {
        let is_healthy = self.stats.healthy();
        SourceHealth {
            source: self.name().to_string(),
            is_healthy,
            last_success: self.stats.last_answer(),
            last_error: (!is_healthy).then(|| "latest Yahoo chart call failed".to_string()),
            success_rate: self.stats.success_rate(),
            avg_latency_ms: self.stats.avg_latency_ms(),
        }
    }

    pub fn name(&self) -> &str {
        "yahoo"
    }
}

fn company_info(ticker: &str, meta: &ChartMeta) -> Option<CompanyInfo> {
    let current_price = meta.regular_market_price.filter(|p| p.is_finite() && *p > 0.0)?;
    let name = meta
        .long_name
        .clone()
        .or_else(|| meta.short_name.clone())
        .unwrap_or_else(|| ticker.to_string());

    Some(CompanyInfo {
        name,
        // Not part of the chart payload
        sector: "Unknown".to_string(),
        industry: "Unknown".to_string(),
        market_cap: 0.0,
        current_price,
    })
}

/// Bars from a chart payload, dated in the exchange's local time zone
fn bars_from_chart(chart: &ChartResult) -> Vec<Bar> {
    let Some(quote) = chart.indicators.quote.first() else {
        return Vec::new();
    };
    let offset = chart.meta.gmtoffset.unwrap_or(0);
    let at = |series: &[Option<f64>], i: usize| series.get(i).copied().flatten();

    let bars = chart
        .timestamp
        .iter()
        .enumerate()
        .filter_map(|(i, ts)| {
            let close = at(&quote.close, i)?;
            let date: NaiveDate = DateTime::from_timestamp(ts + offset, 0)?.date_naive();
            Some(Bar {
                date,
                open: at(&quote.open, i).unwrap_or(close),
                high: at(&quote.high, i).unwrap_or(close),
                low: at(&quote.low, i).unwrap_or(close),
                close,
                volume: at(&quote.volume, i).unwrap_or(0.0),
            })
        })
        .collect();

    normalize_bars(bars)
}

// Response types for the chart API
#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: ChartMeta,
    #[serde(default)]
    timestamp: Vec<i64>,
    #[serde(default)]
    indicators: Indicators,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    long_name: Option<String>,
    short_name: Option<String>,
    regular_market_price: Option<f64>,
    gmtoffset: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[async_trait::async_trait]
impl MarketDataSource for YahooFinanceClient {
    async fn validate(&self, ticker: &str) -> Result<Option<CompanyInfo>> {
        YahooFinanceClient::validate(self, ticker).await
    }

    async fn history(
        &self,
        ticker: &str,
        range: &HistoryRange,
        interval: Interval,
    ) -> Result<Vec<Bar>> {
        YahooFinanceClient::history(self, ticker, range, interval).await
    }

    async fn health(&self) -> SourceHealth {
        YahooFinanceClient::health(self).await
    }

    fn name(&self) -> &str {
        YahooFinanceClient::name(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ChartResult {
        let envelope: ChartEnvelope = serde_json::from_str(json).unwrap();
        envelope.chart.result.unwrap().remove(0)
    }

    #[test]
    fn test_bars_from_chart_skips_missing_closes() {
        // 2024-01-02 14:30 UTC, then a null close, then a repeated session
        let chart = parse(
            r#"{"chart":{"result":[{
                "meta":{"symbol":"AAPL","regularMarketPrice":185.6,"gmtoffset":-18000},
                "timestamp":[1704205800,1704292200,1704378600,1704378700],
                "indicators":{"quote":[{
                    "open":[187.1,184.2,null,182.0],
                    "high":[188.4,185.8,183.0,183.1],
                    "low":[183.8,183.4,180.9,181.0],
                    "close":[185.6,null,181.9,182.5],
                    "volume":[82488700,58414500,71983600,1000]
                }]}
            }],"error":null}}"#,
        );

        let bars = bars_from_chart(&chart);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(bars[1].date, NaiveDate::from_ymd_opt(2024, 1, 4).unwrap());
        assert_eq!(bars[1].close, 182.5);
        assert_eq!(bars[1].open, 182.0);
        assert_eq!(bars[0].volume, 82488700.0);
    }

    #[test]
    fn test_company_info_requires_price() {
        let meta = ChartMeta {
            short_name: Some("Apple".to_string()),
            regular_market_price: Some(190.0),
            ..Default::default()
        };
        let info = company_info("AAPL", &meta).unwrap();
        assert_eq!(info.name, "Apple");
        assert_eq!(info.sector, "Unknown");
        assert_eq!(info.current_price, 190.0);

        assert!(company_info("AAPL", &ChartMeta::default()).is_none());
    }

    #[test]
    fn test_chart_stats_follow_latest_outcome() {
        let stats = ChartStats::default();
        assert!(stats.healthy());
        assert!(stats.last_answer().is_none());

        stats.failed();
        assert!(!stats.healthy());
        std::thread::sleep(Duration::from_millis(2));
        stats.answered(Duration::from_millis(10));
        stats.answered(Duration::from_millis(30));
        assert!(stats.healthy());
        assert!(stats.last_answer().is_some());
        assert!((stats.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.avg_latency_ms(), 20);
    }
}
