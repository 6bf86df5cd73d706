//! Technical indicators over a close-price series.
//!
//! Every function returns a vector aligned with its input where warm-up
//! positions are `None`.

/// Simple moving average
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }

    let mut sum: f64 = values[..period].iter().sum();
    out[period - 1] = Some(sum / period as f64);
    for i in period..values.len() {
        sum += values[i] - values[i - period];
        out[i] = Some(sum / period as f64);
    }
    out
}

/// Exponential moving average seeded with the SMA of the first `period` values
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut current = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(current);
    for i in period..values.len() {
        current = (values[i] - current) * multiplier + current;
        out[i] = Some(current);
    }
    out
}

/// EMA over a partially defined series; the warm-up starts at the first
/// defined value.
fn ema_defined(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    let Some(first) = values.iter().position(|v| v.is_some()) else {
        return out;
    };

    let dense: Vec<f64> = values[first..].iter().map(|v| v.unwrap_or(0.0)).collect();
    for (i, v) in ema(&dense, period).into_iter().enumerate() {
        out[first + i] = v;
    }
    out
}

/// Relative strength index from simple average gain/loss over each window
/// of `period` price changes.
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() <= period {
        return out;
    }

    let changes: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    for end in period..=changes.len() {
        let window = &changes[end - period..end];
        let gain: f64 = window.iter().filter(|c| **c > 0.0).sum::<f64>() / period as f64;
        let loss: f64 = window.iter().filter(|c| **c < 0.0).map(|c| -c).sum::<f64>() / period as f64;

        let value = if loss == 0.0 && gain == 0.0 {
            50.0
        } else if loss == 0.0 {
            100.0
        } else {
            100.0 - 100.0 / (1.0 + gain / loss)
        };
        // changes[k] ends at values[k + 1]
        out[end] = Some(value);
    }
    out
}

/// MACD line (EMA 12 − EMA 26) and its EMA 9 signal line
pub fn macd(values: &[f64]) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let fast = ema(values, 12);
    let slow = ema(values, 26);
    let line: Vec<Option<f64>> = fast
        .iter()
        .zip(slow.iter())
        .map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        })
        .collect();
    let signal = ema_defined(&line, 9);
    (line, signal)
}
