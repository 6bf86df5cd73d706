//! Recurrent sequence regressor.
//!
//! A single tanh recurrent layer reads a lookback window step by step; a
//! linear read-out of the final hidden state gives the next-step normalized
//! Close. Trained with back-propagation through time and Adam.

pub mod config;

pub use config::TrainingConfig;

use crate::error::{ForecastError, Result};
use ndarray::{s, Array, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis, Dimension, Zip};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Learnable parameters; also used for gradients and Adam moments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    /// hidden × input
    pub w_x: Array2<f64>,
    /// hidden × hidden
    pub w_h: Array2<f64>,
    pub b_h: Array1<f64>,
    pub w_out: Array1<f64>,
    pub b_out: f64,
}

impl Weights {
    fn zeros(input_size: usize, hidden_size: usize) -> Self {
        Self {
            w_x: Array2::zeros((hidden_size, input_size)),
            w_h: Array2::zeros((hidden_size, hidden_size)),
            b_h: Array1::zeros(hidden_size),
            w_out: Array1::zeros(hidden_size),
            b_out: 0.0,
        }
    }

    fn norm(&self) -> f64 {
        let sq = |a: f64, x: &f64| a + x * x;
        (self.w_x.iter().fold(0.0, sq)
            + self.w_h.iter().fold(0.0, sq)
            + self.b_h.iter().fold(0.0, sq)
            + self.w_out.iter().fold(0.0, sq)
            + self.b_out * self.b_out)
            .sqrt()
    }

    fn scale(&mut self, factor: f64) {
        self.w_x *= factor;
        self.w_h *= factor;
        self.b_h *= factor;
        self.w_out *= factor;
        self.b_out *= factor;
    }

    fn is_finite(&self) -> bool {
        self.w_x.iter().all(|v| v.is_finite())
            && self.w_h.iter().all(|v| v.is_finite())
            && self.b_h.iter().all(|v| v.is_finite())
            && self.w_out.iter().all(|v| v.is_finite())
            && self.b_out.is_finite()
    }
}

/// Summary of a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub epochs_run: usize,
    pub best_epoch: usize,
    /// Validation loss of the restored parameters (training loss when no
    /// validation split was possible)
    pub best_loss: f64,
    pub train_windows: usize,
    pub validation_windows: usize,
    pub stopped_early: bool,
}

/// Single-layer recurrent regressor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrentRegressor {
    pub input_size: usize,
    pub hidden_size: usize,
    weights: Weights,
}

struct Adam {
    m: Weights,
    v: Weights,
    step: i32,
    beta1: f64,
    beta2: f64,
    eps: f64,
}

impl Adam {
    fn new(input_size: usize, hidden_size: usize) -> Self {
        Self {
            m: Weights::zeros(input_size, hidden_size),
            v: Weights::zeros(input_size, hidden_size),
            step: 0,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }

    fn update(&mut self, params: &mut Weights, grads: &Weights, lr: f64) {
        self.step += 1;
        let lr_t = lr * (1.0 - self.beta2.powi(self.step)).sqrt() / (1.0 - self.beta1.powi(self.step));
        let (b1, b2, eps) = (self.beta1, self.beta2, self.eps);

        adam_step(&mut params.w_x, &grads.w_x, &mut self.m.w_x, &mut self.v.w_x, lr_t, b1, b2, eps);
        adam_step(&mut params.w_h, &grads.w_h, &mut self.m.w_h, &mut self.v.w_h, lr_t, b1, b2, eps);
        adam_step(&mut params.b_h, &grads.b_h, &mut self.m.b_h, &mut self.v.b_h, lr_t, b1, b2, eps);
        adam_step(&mut params.w_out, &grads.w_out, &mut self.m.w_out, &mut self.v.w_out, lr_t, b1, b2, eps);

        let g = grads.b_out;
        self.m.b_out = b1 * self.m.b_out + (1.0 - b1) * g;
        self.v.b_out = b2 * self.v.b_out + (1.0 - b2) * g * g;
        params.b_out -= lr_t * self.m.b_out / (self.v.b_out.sqrt() + eps);
    }
}

#[allow(clippy::too_many_arguments)]
fn adam_step<D: Dimension>(
    param: &mut Array<f64, D>,
    grad: &Array<f64, D>,
    m: &mut Array<f64, D>,
    v: &mut Array<f64, D>,
    lr_t: f64,
    b1: f64,
    b2: f64,
    eps: f64,
) {
    Zip::from(param).and(grad).and(m).and(v).for_each(|p, &g, m, v| {
        *m = b1 * *m + (1.0 - b1) * g;
        *v = b2 * *v + (1.0 - b2) * g * g;
        *p -= lr_t * *m / (v.sqrt() + eps);
    });
}

/// rows += a ⊗ b
fn add_outer(acc: &mut Array2<f64>, a: &Array1<f64>, b: ArrayView1<f64>) {
    for (i, ai) in a.iter().enumerate() {
        acc.row_mut(i).scaled_add(*ai, &b);
    }
}

impl RecurrentRegressor {
    /// Randomly initialized model; draws only from `rng`
    pub fn new(input_size: usize, hidden_size: usize, rng: &mut StdRng) -> Self {
        let limit = (1.0 / hidden_size as f64).sqrt();
        let mut uniform = |shape: (usize, usize)| Array2::from_shape_fn(shape, |_| rng.gen_range(-limit..limit));

        let w_x = uniform((hidden_size, input_size));
        let w_h = uniform((hidden_size, hidden_size)) * 0.5;
        let w_out = uniform((hidden_size, 1)).column(0).to_owned();

        Self {
            input_size,
            hidden_size,
            weights: Weights {
                w_x,
                w_h,
                b_h: Array1::zeros(hidden_size),
                w_out,
                b_out: 0.0,
            },
        }
    }

    /// Hidden states h_0..h_T for one window `[lookback, input_size]`
    fn hidden_states(&self, window: ArrayView2<f64>) -> Vec<Array1<f64>> {
        let w = &self.weights;
        let mut states = Vec::with_capacity(window.nrows() + 1);
        states.push(Array1::zeros(self.hidden_size));
        for x in window.axis_iter(Axis(0)) {
            let prev = states.last().map(|h| w.w_h.dot(h)).unwrap_or_else(|| Array1::zeros(self.hidden_size));
            let h = (w.w_x.dot(&x) + prev + &w.b_h).mapv(f64::tanh);
            states.push(h);
        }
        states
    }

    fn output(&self, last_hidden: &Array1<f64>) -> f64 {
        self.weights.w_out.dot(last_hidden) + self.weights.b_out
    }

    /// Normalized next-step predictions for `[windows, lookback, features]`
    pub fn predict(&self, inputs: &Array3<f64>) -> Result<Vec<f64>> {
        self.check_input(inputs)?;
        Ok(inputs
            .axis_iter(Axis(0))
            .map(|window| {
                let states = self.hidden_states(window);
                self.output(&states[states.len() - 1])
            })
            .collect())
    }

    /// Weight shapes must agree with the declared input and hidden sizes
    pub fn check_shapes(&self) -> Result<()> {
        let (input, hidden) = (self.input_size, self.hidden_size);
        let w = &self.weights;
        let consistent = input > 0
            && hidden > 0
            && w.w_x.dim() == (hidden, input)
            && w.w_h.dim() == (hidden, hidden)
            && w.b_h.len() == hidden
            && w.w_out.len() == hidden;
        if !consistent {
            return Err(ForecastError::ModelLoad(format!(
                "weights do not fit input {} x hidden {} (w_x {:?}, w_h {:?}, b_h {}, w_out {})",
                input,
                hidden,
                w.w_x.dim(),
                w.w_h.dim(),
                w.b_h.len(),
                w.w_out.len()
            )));
        }
        if !w.is_finite() {
            return Err(ForecastError::ModelLoad("weights are not finite".to_string()));
        }
        Ok(())
    }

    fn check_input(&self, inputs: &Array3<f64>) -> Result<()> {
        let features = inputs.len_of(Axis(2));
        if features != self.input_size {
            return Err(ForecastError::ModelLoad(format!(
                "model expects {} features, got {}",
                self.input_size, features
            )));
        }
        Ok(())
    }

    /// Mean squared error over the selected windows
    fn loss(&self, inputs: &Array3<f64>, targets: &Array1<f64>, indices: &[usize]) -> f64 {
        if indices.is_empty() {
            return 0.0;
        }
        let total: f64 = indices
            .iter()
            .map(|&i| {
                let states = self.hidden_states(inputs.slice(s![i, .., ..]));
                let err = self.output(&states[states.len() - 1]) - targets[i];
                err * err
            })
            .sum();
        total / indices.len() as f64
    }

    /// Batch-averaged MSE gradients by back-propagation through time
    fn gradients(&self, inputs: &Array3<f64>, targets: &Array1<f64>, batch: &[usize]) -> Weights {
        let w = &self.weights;
        let mut grads = Weights::zeros(self.input_size, self.hidden_size);
        let scale = 2.0 / batch.len() as f64;

        for &i in batch {
            let window = inputs.slice(s![i, .., ..]);
            let states = self.hidden_states(window);
            let steps = window.nrows();

            let d_out = scale * (self.output(&states[steps]) - targets[i]);
            grads.w_out.scaled_add(d_out, &states[steps]);
            grads.b_out += d_out;

            let mut dh = &w.w_out * d_out;
            for t in (1..=steps).rev() {
                let h = &states[t];
                let da = &dh * &h.mapv(|v| 1.0 - v * v);
                add_outer(&mut grads.w_x, &da, window.row(t - 1));
                add_outer(&mut grads.w_h, &da, states[t - 1].view());
                grads.b_h += &da;
                dh = w.w_h.t().dot(&da);
            }
        }
        grads
    }

    /// Fit on chronologically ordered windows. The trailing
    /// `validation_split` share is held out for early stopping and the
    /// best-scoring parameters are restored at the end.
    pub fn fit(
        &mut self,
        inputs: &Array3<f64>,
        targets: &Array1<f64>,
        config: &TrainingConfig,
        rng: &mut StdRng,
    ) -> Result<TrainingReport> {
        self.check_input(inputs)?;
        let n = inputs.len_of(Axis(0));
        if n == 0 || targets.len() != n {
            return Err(ForecastError::TrainingFailure(format!(
                "{} windows with {} targets",
                n,
                targets.len()
            )));
        }

        let validation_windows = if n >= 5 {
            ((n as f64 * config.validation_split).floor() as usize).min(n - 1)
        } else {
            0
        };
        let train_windows = n - validation_windows;
        let mut train_idx: Vec<usize> = (0..train_windows).collect();
        let val_idx: Vec<usize> = (train_windows..n).collect();
        let monitor = if val_idx.is_empty() { &train_idx } else { &val_idx }.clone();

        let mut adam = Adam::new(self.input_size, self.hidden_size);
        let mut best_loss = self.loss(inputs, targets, &monitor);
        let mut best_weights = self.weights.clone();
        let mut best_epoch = 0;
        let mut since_best = 0;
        let mut epochs_run = 0;
        let mut stopped_early = false;

        for epoch in 1..=config.epochs {
            train_idx.shuffle(rng);
            for batch in train_idx.chunks(config.batch_size) {
                let mut grads = self.gradients(inputs, targets, batch);
                let norm = grads.norm();
                if norm > config.grad_clip {
                    grads.scale(config.grad_clip / norm);
                }
                adam.update(&mut self.weights, &grads, config.learning_rate);
            }
            epochs_run = epoch;

            if !self.weights.is_finite() {
                return Err(ForecastError::TrainingFailure(format!(
                    "parameters diverged at epoch {}",
                    epoch
                )));
            }

            let loss = self.loss(inputs, targets, &monitor);
            if !loss.is_finite() {
                return Err(ForecastError::TrainingFailure(format!(
                    "non-finite loss at epoch {}",
                    epoch
                )));
            }
            debug!(epoch, loss, best_loss, "epoch complete");

            if loss < best_loss {
                best_loss = loss;
                best_weights = self.weights.clone();
                best_epoch = epoch;
                since_best = 0;
            } else {
                since_best += 1;
                if since_best >= config.patience {
                    stopped_early = true;
                    break;
                }
            }
        }

        self.weights = best_weights;

        Ok(TrainingReport {
            epochs_run,
            best_epoch,
            best_loss,
            train_windows,
            validation_windows,
            stopped_early,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    /// Windows over a smooth wave; target is the next wave value
    fn wave(n: usize, lookback: usize) -> (Array3<f64>, Array1<f64>) {
        let series: Vec<f64> = (0..n + lookback)
            .map(|i| 0.5 + 0.4 * (i as f64 * 0.3).sin())
            .collect();
        let mut inputs = Array3::zeros((n, lookback, 1));
        let mut targets = Array1::zeros(n);
        for i in 0..n {
            for t in 0..lookback {
                inputs[[i, t, 0]] = series[i + t];
            }
            targets[i] = series[i + lookback];
        }
        (inputs, targets)
    }

    fn small_config() -> TrainingConfig {
        TrainingConfig {
            hidden_size: 8,
            epochs: 40,
            batch_size: 8,
            learning_rate: 0.01,
            patience: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_training_reduces_loss() {
        let (x, y) = wave(60, 6);
        let mut rng = StdRng::seed_from_u64(7);
        let mut model = RecurrentRegressor::new(1, 8, &mut rng);
        let all: Vec<usize> = (0..60).collect();
        let before = model.loss(&x, &y, &all);

        let report = model.fit(&x, &y, &small_config(), &mut rng).unwrap();
        let after = model.loss(&x, &y, &all);

        assert!(after < before, "loss {} -> {}", before, after);
        assert_eq!(report.validation_windows, 12);
        assert_eq!(report.train_windows, 48);
    }

    #[test]
    fn test_best_weights_are_restored() {
        let (x, y) = wave(40, 5);
        let mut rng = StdRng::seed_from_u64(3);
        let mut model = RecurrentRegressor::new(1, 8, &mut rng);
        let report = model.fit(&x, &y, &small_config(), &mut rng).unwrap();

        let val: Vec<usize> = (report.train_windows..40).collect();
        let restored_loss = model.loss(&x, &y, &val);
        assert!((restored_loss - report.best_loss).abs() < 1e-12);
    }

    #[test]
    fn test_same_seed_same_model() {
        let (x, y) = wave(30, 4);
        let train = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut model = RecurrentRegressor::new(1, 6, &mut rng);
            model.fit(&x, &y, &small_config(), &mut rng).unwrap();
            model.predict(&x).unwrap()
        };
        assert_eq!(train(11), train(11));
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let (x, y) = wave(4, 3);
        let mut rng = StdRng::seed_from_u64(5);
        let model = RecurrentRegressor::new(1, 3, &mut rng);
        let batch: Vec<usize> = (0..4).collect();
        let grads = model.gradients(&x, &y, &batch);

        let eps = 1e-6;
        let mut bumped = model.clone();
        bumped.weights.w_h[[1, 2]] += eps;
        let numeric = (bumped.loss(&x, &y, &batch) - model.loss(&x, &y, &batch)) / eps;
        assert!((numeric - grads.w_h[[1, 2]]).abs() < 1e-4);

        let mut bumped = model.clone();
        bumped.weights.w_x[[0, 0]] += eps;
        let numeric = (bumped.loss(&x, &y, &batch) - model.loss(&x, &y, &batch)) / eps;
        assert!((numeric - grads.w_x[[0, 0]]).abs() < 1e-4);
    }

    #[test]
    fn test_feature_mismatch_is_model_load_error() {
        let mut rng = StdRng::seed_from_u64(1);
        let model = RecurrentRegressor::new(7, 4, &mut rng);
        let (x, _) = wave(3, 2);
        assert!(matches!(model.predict(&x), Err(ForecastError::ModelLoad(_))));
    }

    #[test]
    fn test_serde_round_trip_preserves_predictions() {
        let (x, _) = wave(5, 3);
        let mut rng = StdRng::seed_from_u64(9);
        let model = RecurrentRegressor::new(1, 4, &mut rng);
        let json = serde_json::to_string(&model).unwrap();
        let restored: RecurrentRegressor = serde_json::from_str(&json).unwrap();
        let a = model.predict(&x).unwrap();
        let b = restored.predict(&x).unwrap();
        for (p, q) in a.iter().zip(b.iter()) {
            assert!((p - q).abs() < 1e-12);
        }
    }

    #[test]
    fn test_check_shapes_rejects_resized_model() {
        let mut rng = StdRng::seed_from_u64(11);
        let model = RecurrentRegressor::new(2, 4, &mut rng);
        assert!(model.check_shapes().is_ok());

        let mut json: serde_json::Value = serde_json::to_value(&model).unwrap();
        json["hidden_size"] = serde_json::json!(3);
        let resized: RecurrentRegressor = serde_json::from_value(json).unwrap();
        assert!(matches!(resized.check_shapes(), Err(ForecastError::ModelLoad(_))));

        let mut json: serde_json::Value = serde_json::to_value(&model).unwrap();
        json["input_size"] = serde_json::json!(7);
        let widened: RecurrentRegressor = serde_json::from_value(json).unwrap();
        assert!(matches!(widened.check_shapes(), Err(ForecastError::ModelLoad(_))));
    }
}
