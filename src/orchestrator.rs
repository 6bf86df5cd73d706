//! The `predict` pipeline: validate → fetch → retrain or load → predict →
//! assemble.
//!
//! Network I/O stays on the async runtime; feature engineering, training,
//! inference and store access run on the blocking pool. Retrain decisions
//! and saves for one ticker are serialized through [`TickerLocks`].

use crate::config::{ForecastMode, ServiceConfig};
use crate::error::{ForecastError, Result};
use crate::features::{compute_features_for, last_window, make_windows, FeatureMatrix, MAX_LOOKBACK};
use crate::heuristic;
use crate::model::{RecurrentRegressor, TrainingConfig};
use crate::recommendation::{self, Metrics, RiskLevel};
use crate::result::*;
use crate::scaler::MinMaxScaler;
use crate::store::{ModelArtifact, ModelConfig, ModelStore, TrainDates, TrainMetadata};
use crate::types::{normalize_bars, Bar, CompanyInfo, HistoryRange, Interval, MarketDataSource};
use chrono::{NaiveDate, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

const MAX_TICKER_LEN: usize = 12;
/// Bars shown by the heuristic path
const HEURISTIC_BARS: usize = 20;
/// Trailing closes used for the risk level
const RISK_WINDOW: usize = 63;

/// Pipeline stage, used for logging and error context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ValidateTicker,
    FetchData,
    Retrain,
    LoadExisting,
    Predict,
    AssembleResult,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::ValidateTicker => "validate_ticker",
            Stage::FetchData => "fetch_data",
            Stage::Retrain => "retrain",
            Stage::LoadExisting => "load_existing",
            Stage::Predict => "predict",
            Stage::AssembleResult => "assemble_result",
        };
        f.write_str(name)
    }
}

/// Inputs of a forecast request
#[derive(Debug, Clone, PartialEq)]
pub struct PredictOptions {
    pub ticker: String,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub interval: Interval,
    /// Falls back to the configured default
    pub lookback: Option<usize>,
    pub use_indicators: bool,
    /// Falls back to the configured mode
    pub mode: Option<ForecastMode>,
}

impl PredictOptions {
    pub fn new(ticker: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            start: None,
            end: None,
            interval: Interval::Day1,
            lookback: None,
            use_indicators: true,
            mode: None,
        }
    }
}

/// Knobs of the pipeline, split from [`ServiceConfig`] so tests can build
/// one directly
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub default_lookback: usize,
    pub test_size: f64,
    pub history_years: u32,
    pub request_timeout: Duration,
    pub forecast_mode: ForecastMode,
    pub training: TrainingConfig,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_lookback: 60,
            test_size: 0.2,
            history_years: 5,
            request_timeout: Duration::from_secs(600),
            forecast_mode: ForecastMode::Model,
            training: TrainingConfig::default(),
        }
    }
}

impl From<&ServiceConfig> for OrchestratorSettings {
    fn from(cfg: &ServiceConfig) -> Self {
        Self {
            default_lookback: cfg.default_lookback,
            test_size: cfg.test_size,
            history_years: cfg.history_years,
            request_timeout: Duration::from_secs(cfg.request_timeout_secs),
            forecast_mode: cfg.forecast_mode,
            training: cfg.training(),
        }
    }
}

/// One async mutex per ticker
#[derive(Default)]
pub struct TickerLocks {
    inner: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TickerLocks {
    /// Owned guard, so it can move into a blocking task and outlive the
    /// request future
    pub async fn acquire(&self, ticker: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(map.entry(ticker.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

/// Trim and uppercase a ticker and check its shape
pub fn normalize_ticker(raw: &str) -> Result<String> {
    let ticker = raw.trim().to_uppercase();
    let valid = !ticker.is_empty()
        && ticker.len() <= MAX_TICKER_LEN
        && !ticker.starts_with('.')
        && ticker
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '^' | '='));
    if valid {
        Ok(ticker)
    } else {
        Err(ForecastError::InvalidTicker(raw.trim().to_string()))
    }
}

/// Held-out window count: the trailing `test_size` share, at least one,
/// leaving at least one window to train on
fn held_out_windows(windows: usize, test_size: f64) -> usize {
    let n = (windows as f64 * test_size).round() as usize;
    n.max(1).min(windows.saturating_sub(1))
}

struct ModelRun {
    history: Vec<HistoryPoint>,
    metrics: Metrics,
    latest: LatestForecast,
    trained: bool,
    version: u64,
}

pub struct ForecastOrchestrator {
    source: Arc<dyn MarketDataSource>,
    store: Arc<dyn ModelStore>,
    settings: OrchestratorSettings,
    locks: TickerLocks,
}

impl ForecastOrchestrator {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        store: Arc<dyn ModelStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            source,
            store,
            settings,
            locks: TickerLocks::default(),
        }
    }

    pub fn source(&self) -> &Arc<dyn MarketDataSource> {
        &self.source
    }

    /// Full forecast for a ticker, bounded by the request timeout
    pub async fn predict(&self, options: PredictOptions) -> Result<ForecastResult> {
        let timeout = self.settings.request_timeout;
        let ticker = options.ticker.clone();
        match tokio::time::timeout(timeout, self.run_predict(options)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                if e.is_client_error() {
                    info!(ticker = %ticker, error = %e, "forecast rejected");
                } else {
                    warn!(ticker = %ticker, error = %e, "forecast failed");
                }
                Err(e)
            }
            Err(_) => {
                warn!(ticker = %ticker, timeout_secs = timeout.as_secs(), "forecast timed out");
                Err(ForecastError::Timeout(timeout.as_secs()))
            }
        }
    }

    async fn run_predict(&self, options: PredictOptions) -> Result<ForecastResult> {
        let ticker = normalize_ticker(&options.ticker)?;
        let lookback = options.lookback.unwrap_or(self.settings.default_lookback);
        if lookback == 0 || lookback > MAX_LOOKBACK {
            return Err(ForecastError::Validation(format!(
                "lookback must be between 1 and {}, got {}",
                MAX_LOOKBACK, lookback
            )));
        }
        let range = self.resolve_range(options.start, options.end)?;
        let requested = ModelConfig {
            lookback,
            use_indicators: options.use_indicators,
            interval: options.interval,
        };

        let info = self.validate(&ticker).await?;

        debug!(ticker = %ticker, stage = %Stage::FetchData, start = %range.start, end = %range.end, "fetching history");
        let bars = self.fetch_history(&ticker, range, options.interval).await?;

        if options.mode.unwrap_or(self.settings.forecast_mode) == ForecastMode::Heuristic {
            return Ok(heuristic_result(&ticker, info, &bars, requested));
        }

        // Held across the blocking task so a timed-out request still
        // finishes its save before the next writer starts
        let guard = self.locks.acquire(&ticker).await;
        let store = Arc::clone(&self.store);
        let training = self.settings.training.clone();
        let test_size = self.settings.test_size;
        let task_ticker = ticker.clone();
        let task_bars = bars.clone();

        let run = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            run_model(store.as_ref(), &task_ticker, &task_bars, requested, test_size, &training)
        })
        .await
        .map_err(|e| ForecastError::Internal(format!("forecast task failed: {}", e)))??;

        debug!(ticker = %ticker, stage = %Stage::AssembleResult, trained = run.trained, version = run.version, "assembling result");
        let current_price = bars.last().map(|b| b.close).unwrap_or(info.current_price);
        let risk = trailing_risk(&bars);

        Ok(ForecastResult {
            ticker,
            company_info: CompanySummary::new(info, current_price, run.latest.predicted, risk),
            recommendation: recommendation::recommend(current_price, run.latest.predicted),
            params: ForecastParams {
                lookback,
                use_indicators: requested.use_indicators,
                interval: requested.interval,
            },
            metrics: run.metrics,
            history: run.history,
            latest: run.latest,
            trained: run.trained,
            source: ForecastSource::Model,
        })
    }

    /// Next-step forecast from the stored model, or the heuristic when no
    /// usable model or data is available
    pub async fn latest(&self, ticker: &str) -> Result<LatestQuote> {
        let timeout = self.settings.request_timeout;
        match tokio::time::timeout(timeout, self.run_latest(ticker)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(ticker, timeout_secs = timeout.as_secs(), "latest forecast timed out");
                Err(ForecastError::Timeout(timeout.as_secs()))
            }
        }
    }

    async fn run_latest(&self, raw: &str) -> Result<LatestQuote> {
        let ticker = normalize_ticker(raw)?;
        let info = self.validate(&ticker).await?;

        match self.model_latest(&ticker).await {
            Ok(quote) => return Ok(quote),
            Err(e) => {
                info!(ticker = %ticker, error = %e, "no model forecast available, using heuristic");
            }
        }

        let regime = heuristic::forecast(&ticker);
        let next = heuristic::generate_series(info.current_price, &regime, 1, &mut regime.rng());
        Ok(LatestQuote {
            ticker,
            date: Interval::Day1.next_date(Utc::now().date_naive()),
            predicted: next.first().copied().unwrap_or(info.current_price),
            source: ForecastSource::Heuristic,
        })
    }

    async fn model_latest(&self, ticker: &str) -> Result<LatestQuote> {
        let store = Arc::clone(&self.store);
        let load_ticker = ticker.to_string();
        let artifact = tokio::task::spawn_blocking(move || store.load(&load_ticker))
            .await
            .map_err(|e| ForecastError::Internal(format!("load task failed: {}", e)))??
            .ok_or_else(|| ForecastError::ModelLoad(format!("no stored model for {}", ticker)))?;

        let meta = &artifact.metadata;
        let range = self.default_range();
        let bars = self.fetch_history(ticker, range, meta.interval).await?;

        let (date, predicted) = tokio::task::spawn_blocking(move || {
            let meta = &artifact.metadata;
            let matrix = compute_features_for(&bars, meta.use_indicators, meta.lookback)?;
            next_step(&artifact, &matrix)
        })
        .await
        .map_err(|e| ForecastError::Internal(format!("forecast task failed: {}", e)))??;

        Ok(LatestQuote {
            ticker: ticker.to_string(),
            date,
            predicted,
            source: ForecastSource::Model,
        })
    }

    async fn validate(&self, ticker: &str) -> Result<CompanyInfo> {
        debug!(ticker, stage = %Stage::ValidateTicker, source = self.source.name(), "validating ticker");
        match self.source.validate(ticker).await {
            Ok(Some(info)) => Ok(info),
            Ok(None) => Err(ForecastError::InvalidTicker(ticker.to_string())),
            Err(e) => {
                warn!(ticker, stage = %Stage::ValidateTicker, error = %e, "ticker validation failed");
                Err(ForecastError::data_unavailable(ticker, e))
            }
        }
    }

    /// History for `range`; an empty or failed answer is retried once over
    /// the default trailing window
    async fn fetch_history(&self, ticker: &str, range: HistoryRange, interval: Interval) -> Result<Vec<Bar>> {
        match self.source.history(ticker, &range, interval).await {
            Ok(bars) if !bars.is_empty() => return Ok(normalize_bars(bars)),
            Ok(_) => warn!(ticker, stage = %Stage::FetchData, "empty history, retrying with default range"),
            Err(e) => warn!(ticker, stage = %Stage::FetchData, error = %e, "history fetch failed, retrying with default range"),
        }

        let relaxed = self.default_range();
        match self.source.history(ticker, &relaxed, interval).await {
            Ok(bars) if !bars.is_empty() => Ok(normalize_bars(bars)),
            Ok(_) => Err(ForecastError::DataUnavailable {
                ticker: ticker.to_string(),
                reason: "no price history returned".to_string(),
            }),
            Err(e) => Err(ForecastError::data_unavailable(ticker, e)),
        }
    }

    fn default_range(&self) -> HistoryRange {
        HistoryRange::trailing_years(Utc::now().date_naive(), self.settings.history_years)
    }

    fn resolve_range(&self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Result<HistoryRange> {
        let default = self.default_range();
        let end = end.unwrap_or(default.end);
        let start = match start {
            Some(start) => start,
            None => HistoryRange::trailing_years(end + chrono::Duration::days(1), self.settings.history_years).start,
        };
        if start > end {
            return Err(ForecastError::Validation(format!(
                "start {} is after end {}",
                start, end
            )));
        }
        Ok(HistoryRange::new(start, end))
    }
}

/// Decide between reuse and retrain, then score the held-out windows and
/// the next step. Runs on the blocking pool with the ticker lock held.
fn run_model(
    store: &dyn ModelStore,
    ticker: &str,
    bars: &[Bar],
    requested: ModelConfig,
    test_size: f64,
    training: &TrainingConfig,
) -> Result<ModelRun> {
    let lookback = requested.lookback;
    let matrix = compute_features_for(bars, requested.use_indicators, lookback)?;
    let windows = matrix.rows() - lookback;
    if windows < 2 {
        return Err(ForecastError::InsufficientData {
            rows: matrix.rows(),
            required: lookback.saturating_add(2),
        });
    }
    let held_out = held_out_windows(windows, test_size);
    let train_windows = windows - held_out;

    let existing = if store.needs_retrain(ticker, &requested) {
        None
    } else {
        match store.load(ticker) {
            Ok(Some(artifact))
                if requested.matches(&artifact.metadata)
                    && artifact.scaler_x.columns() == matrix.columns.len() =>
            {
                debug!(ticker, stage = %Stage::LoadExisting, version = artifact.metadata.version, "reusing stored model");
                Some(artifact)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(ticker, stage = %Stage::LoadExisting, error = %e, "stored model unusable, retraining");
                None
            }
        }
    };

    let (artifact, trained) = match existing {
        Some(artifact) => (artifact, false),
        None => {
            let mut artifact = train(ticker, &matrix, requested, train_windows, training)?;
            artifact.metadata = store.save(ticker, &artifact)?;
            (artifact, true)
        }
    };

    debug!(ticker, stage = %Stage::Predict, held_out, "scoring held-out windows");
    let set = make_windows(&matrix, lookback, &artifact.scaler_x, Some(&artifact.scaler_y))?;
    let (_, test) = set.split_at(train_windows);
    let predicted: Vec<f64> = artifact
        .model
        .predict(&test.inputs)?
        .into_iter()
        .map(|v| artifact.scaler_y.inverse_transform_target(v))
        .collect();

    let history: Vec<HistoryPoint> = test
        .target_dates
        .iter()
        .zip(test.raw_targets.iter())
        .zip(predicted.iter())
        .map(|((date, real), predicted)| HistoryPoint {
            date: *date,
            real: *real,
            predicted: round2(*predicted),
        })
        .collect();
    let metrics = recommendation::metrics(&test.raw_targets, &predicted);

    let (date, next) = next_step(&artifact, &matrix)?;
    if !next.is_finite() {
        return Err(ForecastError::TrainingFailure(format!(
            "non-finite forecast for {}",
            ticker
        )));
    }

    Ok(ModelRun {
        history,
        metrics,
        latest: LatestForecast {
            date,
            predicted: round2(next),
        },
        trained,
        version: artifact.metadata.version,
    })
}

/// Fit scalers on the rows feeding the training windows, then the model
fn train(
    ticker: &str,
    matrix: &FeatureMatrix,
    requested: ModelConfig,
    train_windows: usize,
    training: &TrainingConfig,
) -> Result<ModelArtifact> {
    let lookback = requested.lookback;
    let fit_rows = matrix
        .values
        .slice(ndarray::s![..train_windows + lookback, ..])
        .to_owned();
    let scaler_x = MinMaxScaler::fit(&fit_rows);
    let closes = matrix.closes();
    let scaler_y = MinMaxScaler::fit_column(&closes[lookback..lookback + train_windows]);

    let set = make_windows(matrix, lookback, &scaler_x, Some(&scaler_y))?;
    let (train_set, _) = set.split_at(train_windows);

    let mut rng = StdRng::seed_from_u64(training.seed ^ heuristic::ticker_seed(ticker));
    let mut model = RecurrentRegressor::new(matrix.columns.len(), training.hidden_size, &mut rng);
    let report = model.fit(&train_set.inputs, &train_set.targets, training, &mut rng)?;
    info!(
        ticker,
        stage = %Stage::Retrain,
        epochs = report.epochs_run,
        best_epoch = report.best_epoch,
        best_loss = report.best_loss,
        windows = report.train_windows,
        stopped_early = report.stopped_early,
        "trained model"
    );

    let (first, last) = match (train_set.target_dates.first(), train_set.target_dates.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => {
            return Err(ForecastError::TrainingFailure(format!(
                "no training windows for {}",
                ticker
            )))
        }
    };

    Ok(ModelArtifact {
        model,
        scaler_x,
        scaler_y,
        metadata: TrainMetadata {
            ticker: ticker.to_string(),
            lookback,
            use_indicators: requested.use_indicators,
            interval: requested.interval,
            train_dates: TrainDates {
                start: first,
                end: last,
            },
            created_at: Utc::now(),
            version: 0,
        },
    })
}

/// Forecast for the bar after the matrix's last row
fn next_step(artifact: &ModelArtifact, matrix: &FeatureMatrix) -> Result<(NaiveDate, f64)> {
    let meta = &artifact.metadata;
    let window = last_window(matrix, meta.lookback, &artifact.scaler_x)?;
    let normalized = artifact
        .model
        .predict(&window)?
        .first()
        .copied()
        .ok_or_else(|| ForecastError::Internal("empty prediction".to_string()))?;
    let last_date = matrix
        .dates
        .last()
        .copied()
        .ok_or_else(|| ForecastError::Internal("empty feature matrix".to_string()))?;
    Ok((
        meta.interval.next_date(last_date),
        artifact.scaler_y.inverse_transform_target(normalized),
    ))
}

/// Risk level over the trailing [`RISK_WINDOW`] closes
fn trailing_risk(bars: &[Bar]) -> RiskLevel {
    let closes: Vec<f64> = bars[bars.len().saturating_sub(RISK_WINDOW)..]
        .iter()
        .map(|b| b.close)
        .collect();
    recommendation::risk_level(&closes)
}

/// Ticker-seeded pseudo-forecast over the trailing bars
fn heuristic_result(ticker: &str, info: CompanyInfo, bars: &[Bar], requested: ModelConfig) -> ForecastResult {
    let recent = &bars[bars.len().saturating_sub(HEURISTIC_BARS)..];
    let real: Vec<f64> = recent.iter().map(|b| b.close).collect();
    let current_price = real.last().copied().unwrap_or(info.current_price);
    let base = real.first().copied().unwrap_or(current_price);

    let regime = heuristic::forecast(ticker);
    let path = heuristic::generate_series(base, &regime, real.len(), &mut regime.rng());
    let next = heuristic::generate_series(current_price, &regime, 1, &mut regime.rng())
        .first()
        .copied()
        .unwrap_or(current_price);

    let history = recent
        .iter()
        .zip(path.iter())
        .map(|(bar, predicted)| HistoryPoint {
            date: bar.date,
            real: bar.close,
            predicted: *predicted,
        })
        .collect();
    let last_date = recent
        .last()
        .map(|b| b.date)
        .unwrap_or_else(|| Utc::now().date_naive());

    debug!(ticker, direction = ?regime.direction, "heuristic forecast");
    ForecastResult {
        ticker: ticker.to_string(),
        company_info: CompanySummary::new(info, current_price, next, trailing_risk(bars)),
        recommendation: recommendation::recommend(current_price, next),
        params: ForecastParams {
            lookback: requested.lookback,
            use_indicators: requested.use_indicators,
            interval: requested.interval,
        },
        metrics: recommendation::metrics(&real, &path),
        history,
        latest: LatestForecast {
            date: requested.interval.next_date(last_date),
            predicted: next,
        },
        trained: false,
        source: ForecastSource::Heuristic,
    }
}
