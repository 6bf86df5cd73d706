//! Mocked MarketDataSource for testing without network access

#![allow(dead_code)]

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use forecast_api::model::TrainingConfig;
use forecast_api::{
    Bar, CompanyInfo, DataRetrievalError, HistoryRange, Interval, MarketDataSource, OrchestratorSettings,
};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Ticker the mock reports as unknown
pub const UNKNOWN_TICKER: &str = "ZZZZ";

/// Deterministic weekday series starting 2023-01-02
pub fn synthetic_bars(n: usize) -> Vec<Bar> {
    let mut date = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
    let mut bars = Vec::with_capacity(n);
    for i in 0..n {
        while matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            date += Duration::days(1);
        }
        let t = i as f64;
        let close = 100.0 + 8.0 * (t / 9.0).sin() + 0.05 * t;
        bars.push(Bar {
            date,
            open: close - 0.3,
            high: close + 0.8,
            low: close - 0.9,
            close,
            volume: 1_000_000.0 + 1_000.0 * t,
        });
        date += Duration::days(1);
    }
    bars
}

/// In-memory source that ignores the requested range
pub struct MockMarketData {
    bars: Vec<Bar>,
    empty_history_calls: usize,
    history_delay: Option<std::time::Duration>,
    fail_validation: bool,
    pub validate_calls: AtomicUsize,
    pub history_calls: AtomicUsize,
}

impl MockMarketData {
    pub fn new(bars: Vec<Bar>) -> Self {
        Self {
            bars,
            empty_history_calls: 0,
            history_delay: None,
            fail_validation: false,
            validate_calls: AtomicUsize::new(0),
            history_calls: AtomicUsize::new(0),
        }
    }

    /// The first `calls` history requests answer with no bars
    pub fn with_empty_history(mut self, calls: usize) -> Self {
        self.empty_history_calls = calls;
        self
    }

    pub fn with_history_delay(mut self, delay: std::time::Duration) -> Self {
        self.history_delay = Some(delay);
        self
    }

    pub fn with_failing_validation(mut self) -> Self {
        self.fail_validation = true;
        self
    }

    pub fn last_bar(&self) -> &Bar {
        self.bars.last().unwrap()
    }
}

#[async_trait::async_trait]
impl MarketDataSource for MockMarketData {
    async fn validate(&self, ticker: &str) -> forecast_api::Result<Option<CompanyInfo>> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_validation {
            return Err(DataRetrievalError::ApiError("connection refused".to_string()));
        }
        if ticker == UNKNOWN_TICKER {
            return Ok(None);
        }
        Ok(Some(CompanyInfo {
            name: format!("{} Corp", ticker),
            sector: "Technology".to_string(),
            industry: "Software".to_string(),
            market_cap: 1.0e12,
            current_price: self.bars.last().map(|b| b.close).unwrap_or(100.0),
        }))
    }

    async fn history(
        &self,
        _ticker: &str,
        _range: &HistoryRange,
        _interval: Interval,
    ) -> forecast_api::Result<Vec<Bar>> {
        let call = self.history_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.history_delay {
            tokio::time::sleep(delay).await;
        }
        if call < self.empty_history_calls {
            return Ok(Vec::new());
        }
        Ok(self.bars.clone())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Small, fast training settings
pub fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        default_lookback: 10,
        test_size: 0.2,
        history_years: 5,
        request_timeout: std::time::Duration::from_secs(60),
        training: TrainingConfig {
            hidden_size: 6,
            epochs: 8,
            batch_size: 16,
            learning_rate: 0.01,
            patience: 3,
            validation_split: 0.2,
            grad_clip: 5.0,
            seed: 7,
        },
        ..OrchestratorSettings::default()
    }
}
