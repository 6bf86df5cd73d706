use serde::{Deserialize, Serialize};

/// Hyper-parameters for fitting a [`super::RecurrentRegressor`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Hidden state width
    pub hidden_size: usize,
    /// Maximum number of epochs
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Epochs without validation improvement before stopping
    pub patience: usize,
    /// Chronological tail fraction of the windows used for validation
    pub validation_split: f64,
    /// Global gradient-norm clip
    pub grad_clip: f64,
    /// Base seed, combined with the ticker hash per training run
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            hidden_size: 24,
            epochs: 50,
            batch_size: 32,
            learning_rate: 0.005,
            patience: 10,
            validation_split: 0.2,
            grad_clip: 5.0,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.hidden_size == 0 {
            return Err("hidden_size must be > 0".to_string());
        }
        if self.epochs == 0 {
            return Err("epochs must be > 0".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be > 0".to_string());
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(format!(
                "validation_split must be in [0, 1), got {}",
                self.validation_split
            ));
        }
        Ok(())
    }
}
