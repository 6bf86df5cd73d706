//! Response payloads produced by the orchestrator.

use crate::recommendation::{Metrics, Recommendation, RiskLevel};
use crate::types::{CompanyInfo, Interval};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Which path produced a forecast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForecastSource {
    Model,
    Heuristic,
}

/// Company details plus the forecast summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanySummary {
    pub name: String,
    pub sector: String,
    pub industry: String,
    pub market_cap: f64,
    pub current_price: f64,
    pub risk_level: RiskLevel,
    pub predicted_price: f64,
    pub price_change: f64,
    pub price_change_percent: f64,
}

impl CompanySummary {
    pub fn new(info: CompanyInfo, current_price: f64, predicted_price: f64, risk_level: RiskLevel) -> Self {
        let change = predicted_price - current_price;
        let percent = if current_price > 0.0 {
            change / current_price * 100.0
        } else {
            0.0
        };
        Self {
            name: info.name,
            sector: info.sector,
            industry: info.industry,
            market_cap: info.market_cap,
            current_price,
            risk_level,
            predicted_price: round2(predicted_price),
            price_change: round2(change),
            price_change_percent: round2(percent),
        }
    }
}

/// Parameters the forecast was produced with
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastParams {
    pub lookback: usize,
    #[serde(rename = "useIndicators")]
    pub use_indicators: bool,
    pub interval: Interval,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub date: NaiveDate,
    pub real: f64,
    pub predicted: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatestForecast {
    pub date: NaiveDate,
    pub predicted: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub ticker: String,
    pub company_info: CompanySummary,
    pub recommendation: Recommendation,
    pub params: ForecastParams,
    pub metrics: Metrics,
    /// Held-out predictions next to the observed closes
    pub history: Vec<HistoryPoint>,
    pub latest: LatestForecast,
    /// Whether a model was trained for this request
    pub trained: bool,
    pub source: ForecastSource,
}

/// Body of `GET /latest/{ticker}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestQuote {
    pub ticker: String,
    pub date: NaiveDate,
    pub predicted: f64,
    pub source: ForecastSource,
}

pub(crate) fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
