//! Buy/sell/hold decisions, accuracy metrics and risk level

use serde::{Deserialize, Serialize};

pub const RISK_WARNING: &str =
    "Stock market investments carry risk. Never invest more than you can afford to lose.";

/// Recommended action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

/// Confidence tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    High,
    Medium,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub action: Action,
    pub confidence: Confidence,
    pub explanation: String,
    pub risk_warning: String,
}

/// Volatility bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Held-out accuracy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Metrics {
    pub rmse: f64,
    pub mae: f64,
    pub mape: f64,
}

/// Percent change from `current` to `predicted`
pub fn percent_change(current: f64, predicted: f64) -> f64 {
    if current <= 0.0 {
        return 0.0;
    }
    (predicted - current) / current * 100.0
}

/// Action and confidence for a percent change. Boundaries belong to the
/// stronger tier: 2.0 is BUY/High, 0.5 is BUY/Medium, -0.5 is SELL/Medium.
pub fn classify(pct: f64) -> (Action, Confidence) {
    if pct >= 2.0 {
        (Action::Buy, Confidence::High)
    } else if pct >= 0.5 {
        (Action::Buy, Confidence::Medium)
    } else if pct <= -2.0 {
        (Action::Sell, Confidence::High)
    } else if pct <= -0.5 {
        (Action::Sell, Confidence::Medium)
    } else {
        (Action::Hold, Confidence::Medium)
    }
}

pub fn recommend(current_price: f64, predicted_price: f64) -> Recommendation {
    let pct = percent_change(current_price, predicted_price);
    let (action, confidence) = classify(pct);

    let explanation = match (action, confidence) {
        (Action::Buy, Confidence::High) => format!(
            "Strong upward momentum detected. The model predicts a {:.1}% increase based on recent price trends.",
            pct
        ),
        (Action::Buy, _) => format!(
            "Positive trend identified. Expected growth of {:.1}% based on technical analysis.",
            pct
        ),
        (Action::Sell, Confidence::High) => format!(
            "Bearish pattern detected. The model predicts a {:.1}% decline based on market data.",
            pct.abs()
        ),
        (Action::Sell, _) => format!("Downward pressure identified. Expected decline of {:.1}%.", pct.abs()),
        (Action::Hold, _) => {
            "Price expected to remain stable. Minimal movement predicted around current levels.".to_string()
        }
    };

    Recommendation {
        action,
        confidence,
        explanation,
        risk_warning: RISK_WARNING.to_string(),
    }
}

/// RMSE, MAE and MAPE over paired observations. MAPE skips `real == 0`.
pub fn metrics(real: &[f64], predicted: &[f64]) -> Metrics {
    let n = real.len().min(predicted.len());
    if n == 0 {
        return Metrics::default();
    }
    let pairs = real.iter().zip(predicted.iter()).take(n);

    let mut sq = 0.0;
    let mut abs = 0.0;
    let mut pct = 0.0;
    let mut pct_n = 0usize;
    for (r, p) in pairs {
        let err = r - p;
        sq += err * err;
        abs += err.abs();
        if *r != 0.0 {
            pct += err.abs() / r.abs();
            pct_n += 1;
        }
    }

    Metrics {
        rmse: (sq / n as f64).sqrt(),
        mae: abs / n as f64,
        mape: if pct_n == 0 { 0.0 } else { pct / pct_n as f64 * 100.0 },
    }
}

/// Annualized volatility of daily returns bucketed into a risk level
pub fn risk_level(closes: &[f64]) -> RiskLevel {
    if closes.len() < 10 {
        return RiskLevel::Medium;
    }
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.is_empty() {
        return RiskLevel::Medium;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    let annualized = var.sqrt() * 252f64.sqrt();

    if annualized < 0.2 {
        RiskLevel::Low
    } else if annualized < 0.4 {
        RiskLevel::Medium
    } else {
        RiskLevel::High
    }
}
