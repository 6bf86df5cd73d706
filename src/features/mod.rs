//! Feature engineering: bars → feature matrix → lookback windows.

pub mod indicators;

use crate::error::{ForecastError, Result};
use crate::scaler::ScalerState;
use crate::types::Bar;
use chrono::NaiveDate;
use ndarray::{s, Array1, Array2, Array3};

/// Column names, Close first
pub const CLOSE: &str = "Close";
pub const INDICATOR_COLUMNS: [&str; 6] = ["SMA_20", "SMA_50", "EMA_20", "RSI_14", "MACD", "MACD_signal"];
/// Largest accepted lookback, about four years of daily bars
pub const MAX_LOOKBACK: usize = 1000;

/// Chronological feature table
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    pub dates: Vec<NaiveDate>,
    pub columns: Vec<&'static str>,
    pub values: Array2<f64>,
}

impl FeatureMatrix {
    pub fn rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.values.column(0).to_vec()
    }
}

/// Scaled lookback windows with their next-step targets
#[derive(Debug, Clone)]
pub struct WindowSet {
    /// `[windows, lookback, features]`
    pub inputs: Array3<f64>,
    /// Targets normalized with the target scaler (raw when none was given)
    pub targets: Array1<f64>,
    /// Unscaled Close of each target row
    pub raw_targets: Vec<f64>,
    pub target_dates: Vec<NaiveDate>,
}

impl WindowSet {
    pub fn len(&self) -> usize {
        self.raw_targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw_targets.is_empty()
    }

    /// Chronological split: `[..at]` and `[at..]`
    pub fn split_at(&self, at: usize) -> (WindowSet, WindowSet) {
        let at = at.min(self.len());
        let head = WindowSet {
            inputs: self.inputs.slice(s![..at, .., ..]).to_owned(),
            targets: self.targets.slice(s![..at]).to_owned(),
            raw_targets: self.raw_targets[..at].to_vec(),
            target_dates: self.target_dates[..at].to_vec(),
        };
        let tail = WindowSet {
            inputs: self.inputs.slice(s![at.., .., ..]).to_owned(),
            targets: self.targets.slice(s![at..]).to_owned(),
            raw_targets: self.raw_targets[at..].to_vec(),
            target_dates: self.target_dates[at..].to_vec(),
        };
        (head, tail)
    }
}

/// Build the feature matrix. Close is always present; indicators are added
/// when `use_indicators` is set. Warm-up gaps are forward- then back-filled
/// and rows that stay undefined are dropped.
pub fn compute_features(bars: &[Bar], use_indicators: bool) -> FeatureMatrix {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

    let mut columns: Vec<Vec<Option<f64>>> = vec![closes.iter().map(|c| Some(*c)).collect()];
    let mut names = vec![CLOSE];

    if use_indicators {
        let (macd_line, macd_signal) = indicators::macd(&closes);
        columns.push(indicators::sma(&closes, 20));
        columns.push(indicators::sma(&closes, 50));
        columns.push(indicators::ema(&closes, 20));
        columns.push(indicators::rsi(&closes, 14));
        columns.push(macd_line);
        columns.push(macd_signal);
        names.extend(INDICATOR_COLUMNS);
    }

    for column in columns.iter_mut() {
        fill_gaps(column);
    }

    let keep: Vec<usize> = (0..bars.len())
        .filter(|&row| columns.iter().all(|c| c[row].is_some()))
        .collect();

    let mut values = Array2::zeros((keep.len(), columns.len()));
    for (out_row, &row) in keep.iter().enumerate() {
        for (col, column) in columns.iter().enumerate() {
            values[[out_row, col]] = column[row].unwrap_or_default();
        }
    }

    FeatureMatrix {
        dates: keep.iter().map(|&row| bars[row].date).collect(),
        columns: names,
        values,
    }
}

/// [`compute_features`] plus the minimum-row check for a lookback
pub fn compute_features_for(bars: &[Bar], use_indicators: bool, lookback: usize) -> Result<FeatureMatrix> {
    let matrix = compute_features(bars, use_indicators);
    let required = lookback.saturating_add(1);
    if matrix.rows() < required {
        return Err(ForecastError::InsufficientData {
            rows: matrix.rows(),
            required,
        });
    }
    Ok(matrix)
}

fn fill_gaps(column: &mut [Option<f64>]) {
    let mut last = None;
    for v in column.iter_mut() {
        match v {
            Some(x) => last = Some(*x),
            None => *v = last,
        }
    }
    let mut next = None;
    for v in column.iter_mut().rev() {
        match v {
            Some(x) => next = Some(*x),
            None => *v = next,
        }
    }
}

/// Slide a `lookback` window with step 1 over the scaled matrix. The target
/// of each window is the Close of the row right after it.
pub fn make_windows(
    matrix: &FeatureMatrix,
    lookback: usize,
    feature_scaler: &ScalerState,
    target_scaler: Option<&ScalerState>,
) -> Result<WindowSet> {
    let rows = matrix.rows();
    if lookback == 0 || rows <= lookback {
        return Err(ForecastError::InsufficientData {
            rows,
            required: lookback + 1,
        });
    }

    let scaled = feature_scaler.transform(&matrix.values)?;
    let n_windows = rows - lookback;
    let n_features = matrix.values.ncols();

    let mut inputs = Array3::zeros((n_windows, lookback, n_features));
    let mut raw_targets = Vec::with_capacity(n_windows);
    let mut target_dates = Vec::with_capacity(n_windows);

    for i in 0..n_windows {
        inputs
            .slice_mut(s![i, .., ..])
            .assign(&scaled.slice(s![i..i + lookback, ..]));
        raw_targets.push(matrix.values[[i + lookback, 0]]);
        target_dates.push(matrix.dates[i + lookback]);
    }

    let targets = match target_scaler {
        Some(scaler) => raw_targets.iter().map(|v| scaler.transform_value(*v)).collect(),
        None => Array1::from(raw_targets.clone()),
    };

    Ok(WindowSet {
        inputs,
        targets,
        raw_targets,
        target_dates,
    })
}

/// Trailing `lookback` rows, scaled, as a single-window batch
pub fn last_window(matrix: &FeatureMatrix, lookback: usize, feature_scaler: &ScalerState) -> Result<Array3<f64>> {
    let rows = matrix.rows();
    if lookback == 0 || rows < lookback {
        return Err(ForecastError::InsufficientData {
            rows,
            required: lookback,
        });
    }
    let scaled = feature_scaler.transform(&matrix.values)?;
    let window = scaled.slice(s![rows - lookback.., ..]).to_owned();
    let (l, f) = window.dim();
    window
        .into_shape((1, l, f))
        .map_err(|e| ForecastError::Internal(e.to_string()))
}
