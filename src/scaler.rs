//! Per-column min-max normalization

use crate::error::{ForecastError, Result};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

/// Fitted min/max per column. Immutable once fit; persisted with the model
/// it was fit for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

/// Fitting entry points
pub struct MinMaxScaler;

impl MinMaxScaler {
    /// Fit on every column of `matrix`
    pub fn fit(matrix: &Array2<f64>) -> ScalerState {
        let mut min = Vec::with_capacity(matrix.ncols());
        let mut max = Vec::with_capacity(matrix.ncols());
        for column in matrix.axis_iter(Axis(1)) {
            let (lo, hi) = bounds(column.iter().copied());
            min.push(lo);
            max.push(hi);
        }
        ScalerState { min, max }
    }

    /// Fit a single-column scaler, used for regression targets
    pub fn fit_column(values: &[f64]) -> ScalerState {
        let (lo, hi) = bounds(values.iter().copied());
        ScalerState {
            min: vec![lo],
            max: vec![hi],
        }
    }
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if lo.is_finite() && hi.is_finite() {
        (lo, hi)
    } else {
        (0.0, 0.0)
    }
}

impl ScalerState {
    pub fn columns(&self) -> usize {
        self.min.len()
    }

    /// Bounds read back from disk must pair up and stay finite
    pub fn check_bounds(&self) -> Result<()> {
        if self.min.is_empty() || self.min.len() != self.max.len() {
            return Err(ForecastError::ModelLoad(format!(
                "scaler has {} minimums and {} maximums",
                self.min.len(),
                self.max.len()
            )));
        }
        if self.min.iter().chain(&self.max).any(|v| !v.is_finite()) {
            return Err(ForecastError::ModelLoad("scaler bounds are not finite".to_string()));
        }
        Ok(())
    }

    fn check_columns(&self, found: usize) -> Result<()> {
        if found != self.columns() {
            return Err(ForecastError::ModelLoad(format!(
                "scaler fit on {} columns applied to {}",
                self.columns(),
                found
            )));
        }
        Ok(())
    }

    fn scale(&self, col: usize, x: f64) -> f64 {
        let range = self.max[col] - self.min[col];
        if range == 0.0 {
            0.0
        } else {
            (x - self.min[col]) / range
        }
    }

    fn unscale(&self, col: usize, x: f64) -> f64 {
        let range = self.max[col] - self.min[col];
        if range == 0.0 {
            self.min[col]
        } else {
            x * range + self.min[col]
        }
    }

    pub fn transform(&self, matrix: &Array2<f64>) -> Result<Array2<f64>> {
        self.check_columns(matrix.ncols())?;
        let mut out = matrix.clone();
        for (col, mut column) in out.axis_iter_mut(Axis(1)).enumerate() {
            column.mapv_inplace(|x| self.scale(col, x));
        }
        Ok(out)
    }

    pub fn inverse_transform(&self, matrix: &Array2<f64>) -> Result<Array2<f64>> {
        self.check_columns(matrix.ncols())?;
        let mut out = matrix.clone();
        for (col, mut column) in out.axis_iter_mut(Axis(1)).enumerate() {
            column.mapv_inplace(|x| self.unscale(col, x));
        }
        Ok(out)
    }

    /// Scale a value with the first column's parameters
    pub fn transform_value(&self, value: f64) -> f64 {
        self.scale(0, value)
    }

    /// Map a normalized prediction back to a price
    pub fn inverse_transform_target(&self, value: f64) -> f64 {
        self.unscale(0, value)
    }
}
