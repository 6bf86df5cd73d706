//! Service configuration from defaults, an optional `.env` file and the
//! process environment.

use crate::features::MAX_LOOKBACK;
use crate::model::TrainingConfig;
use crate::sources::yahoo::DEFAULT_BASE_URL;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_CORS_ORIGINS: &str = "http://localhost:5173,http://localhost:3000,http://127.0.0.1:5173";

/// Forecast path used by `/predict` when the request does not choose one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ForecastMode {
    #[default]
    Model,
    Heuristic,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub port: u16,
    pub model_dir: PathBuf,
    pub default_lookback: usize,
    /// Held-out fraction of the windows
    pub test_size: f64,
    /// Length of the default history window, ending yesterday
    pub history_years: u32,
    pub request_timeout_secs: u64,
    pub forecast_mode: ForecastMode,
    /// Comma-separated allow-list
    pub cors_origins: String,
    pub yahoo_base_url: String,

    pub train_epochs: usize,
    pub train_batch_size: usize,
    pub train_patience: usize,
    pub train_validation_split: f64,
    pub train_hidden_size: usize,
    pub train_learning_rate: f64,
    pub train_seed: u64,
}

impl ServiceConfig {
    /// Load `.env` (if present) and read the environment
    pub fn load() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(error = %e, "failed to read .env");
            }
        }
        Self::from_source(config::Environment::default().try_parsing(true))
    }

    /// Defaults overlaid with `source`
    pub fn from_source<S>(source: S) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let defaults = TrainingConfig::default();
        let cfg: ServiceConfig = config::Config::builder()
            .set_default("port", 5000)?
            .set_default("model_dir", "./models")?
            .set_default("default_lookback", 60)?
            .set_default("test_size", 0.2)?
            .set_default("history_years", 5)?
            .set_default("request_timeout_secs", 600)?
            .set_default("forecast_mode", "model")?
            .set_default("cors_origins", DEFAULT_CORS_ORIGINS)?
            .set_default("yahoo_base_url", DEFAULT_BASE_URL)?
            .set_default("train_epochs", defaults.epochs as i64)?
            .set_default("train_batch_size", defaults.batch_size as i64)?
            .set_default("train_patience", defaults.patience as i64)?
            .set_default("train_validation_split", defaults.validation_split)?
            .set_default("train_hidden_size", defaults.hidden_size as i64)?
            .set_default("train_learning_rate", defaults.learning_rate)?
            .set_default("train_seed", defaults.seed as i64)?
            .add_source(source)
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("PORT must be non-zero".to_string()));
        }
        if self.default_lookback == 0 || self.default_lookback > MAX_LOOKBACK {
            return Err(ConfigError::Invalid(format!(
                "DEFAULT_LOOKBACK must be between 1 and {}",
                MAX_LOOKBACK
            )));
        }
        if !(self.test_size > 0.0 && self.test_size < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "TEST_SIZE must be in (0, 1), got {}",
                self.test_size
            )));
        }
        if self.history_years == 0 {
            return Err(ConfigError::Invalid("HISTORY_YEARS must be at least 1".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("REQUEST_TIMEOUT_SECS must be at least 1".to_string()));
        }
        self.training()
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("training: {}", e)))
    }

    pub fn training(&self) -> TrainingConfig {
        TrainingConfig {
            hidden_size: self.train_hidden_size,
            epochs: self.train_epochs,
            batch_size: self.train_batch_size,
            learning_rate: self.train_learning_rate,
            patience: self.train_patience,
            validation_split: self.train_validation_split,
            seed: self.train_seed,
            ..TrainingConfig::default()
        }
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::default().try_parsing(true).source(Some(map))
    }

    #[test]
    fn test_defaults() {
        let cfg = ServiceConfig::from_source(env(&[])).unwrap();
        assert_eq!(cfg.port, 5000);
        assert_eq!(cfg.model_dir, PathBuf::from("./models"));
        assert_eq!(cfg.default_lookback, 60);
        assert!((cfg.test_size - 0.2).abs() < 1e-12);
        assert_eq!(cfg.forecast_mode, ForecastMode::Model);
        assert_eq!(cfg.training(), TrainingConfig::default());
        assert_eq!(cfg.cors_origins().len(), 3);
        assert_eq!(cfg.yahoo_base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn test_environment_overrides() {
        let cfg = ServiceConfig::from_source(env(&[
            ("PORT", "8080"),
            ("FORECAST_MODE", "heuristic"),
            ("TRAIN_EPOCHS", "5"),
            ("TEST_SIZE", "0.25"),
            ("CORS_ORIGINS", "https://app.example.com, http://localhost:3000"),
        ]))
        .unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.forecast_mode, ForecastMode::Heuristic);
        assert_eq!(cfg.training().epochs, 5);
        assert!((cfg.test_size - 0.25).abs() < 1e-12);
        assert_eq!(
            cfg.cors_origins(),
            vec!["https://app.example.com".to_string(), "http://localhost:3000".to_string()]
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            ServiceConfig::from_source(env(&[("TEST_SIZE", "1.5")])),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ServiceConfig::from_source(env(&[("TRAIN_BATCH_SIZE", "0")])),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ServiceConfig::from_source(env(&[("DEFAULT_LOOKBACK", "5000")])),
            Err(ConfigError::Invalid(_))
        ));
        assert!(ServiceConfig::from_source(env(&[("PORT", "not-a-port")])).is_err());
        assert!(ServiceConfig::from_source(env(&[("FORECAST_MODE", "magic")])).is_err());
    }
}
