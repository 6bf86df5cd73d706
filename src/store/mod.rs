//! Persisted per-ticker model artifacts.
//!
//! Layout under the model directory:
//!
//! ```text
//! <TICKER>/
//!   CURRENT          "v<version>", replaced atomically on commit
//!   v<version>/
//!     model.json
//!     scaler_x.json
//!     scaler_y.json
//!     meta.json
//! ```
//!
//! A version directory is fully written and synced before `CURRENT` is
//! swapped to it, so readers observe either the old or the new artifact.

use crate::error::{ForecastError, Result};
use crate::model::RecurrentRegressor;
use crate::scaler::ScalerState;
use crate::types::Interval;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

const CURRENT_FILE: &str = "CURRENT";
const MODEL_FILE: &str = "model.json";
const SCALER_X_FILE: &str = "scaler_x.json";
const SCALER_Y_FILE: &str = "scaler_y.json";
const META_FILE: &str = "meta.json";
/// Committed versions kept on disk, the live one included
const KEEP_VERSIONS: usize = 2;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainDates {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Training configuration recorded with an artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainMetadata {
    pub ticker: String,
    pub lookback: usize,
    pub use_indicators: bool,
    pub interval: Interval,
    pub train_dates: TrainDates,
    pub created_at: DateTime<Utc>,
    /// Assigned by the store on save
    #[serde(default)]
    pub version: u64,
}

/// Everything needed to serve forecasts for a ticker
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    pub model: RecurrentRegressor,
    pub scaler_x: ScalerState,
    pub scaler_y: ScalerState,
    pub metadata: TrainMetadata,
}

impl ModelArtifact {
    /// The model and both scalers must describe the same feature layout
    pub fn check_consistency(&self) -> Result<()> {
        self.model.check_shapes()?;
        self.scaler_x.check_bounds()?;
        self.scaler_y.check_bounds()?;
        if self.scaler_y.columns() != 1 {
            return Err(ForecastError::ModelLoad(format!(
                "target scaler has {} columns",
                self.scaler_y.columns()
            )));
        }
        if self.scaler_x.columns() != self.model.input_size {
            return Err(ForecastError::ModelLoad(format!(
                "feature scaler has {} columns, model expects {}",
                self.scaler_x.columns(),
                self.model.input_size
            )));
        }
        Ok(())
    }
}

/// The part of a request that must match a stored artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelConfig {
    pub lookback: usize,
    pub use_indicators: bool,
    pub interval: Interval,
}

impl ModelConfig {
    pub fn matches(&self, meta: &TrainMetadata) -> bool {
        meta.lookback == self.lookback
            && meta.use_indicators == self.use_indicators
            && meta.interval == self.interval
    }
}

/// Persistence for trained artifacts keyed by ticker
pub trait ModelStore: Send + Sync {
    fn exists(&self, ticker: &str) -> bool;

    /// `Ok(None)` when nothing was committed; `Err(ModelLoad)` when a
    /// committed artifact cannot be read back.
    fn load(&self, ticker: &str) -> Result<Option<ModelArtifact>>;

    /// Commit a new artifact, replacing the current one wholesale. Returns
    /// the metadata as stored (with its version).
    fn save(&self, ticker: &str, artifact: &ModelArtifact) -> Result<TrainMetadata>;

    /// Metadata of the committed artifact
    fn load_metadata(&self, ticker: &str) -> Result<Option<TrainMetadata>> {
        Ok(self.load(ticker)?.map(|a| a.metadata))
    }

    fn needs_retrain(&self, ticker: &str, requested: &ModelConfig) -> bool {
        match self.load_metadata(ticker) {
            Ok(Some(meta)) => !requested.matches(&meta),
            Ok(None) => true,
            Err(e) => {
                warn!(ticker, error = %e, "stored artifact unreadable, retraining");
                true
            }
        }
    }
}

/// Filesystem-backed [`ModelStore`]
pub struct FileModelStore {
    root: PathBuf,
    commit_lock: Mutex<()>,
}

impl FileModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            commit_lock: Mutex::new(()),
        }
    }

    /// Directory for a ticker; rejects anything that is not a plain symbol
    pub fn ticker_dir(&self, ticker: &str) -> Result<PathBuf> {
        let valid = !ticker.is_empty()
            && !ticker.starts_with('.')
            && ticker
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '='));
        if !valid {
            return Err(ForecastError::Storage(format!("unsafe ticker for storage: {:?}", ticker)));
        }
        Ok(self.root.join(ticker))
    }

    fn current_version(&self, dir: &Path) -> Result<Option<u64>> {
        let path = dir.join(CURRENT_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ForecastError::ModelLoad(format!("{}: {}", path.display(), e))),
        };
        parse_version(text.trim())
            .map(Some)
            .ok_or_else(|| ForecastError::ModelLoad(format!("corrupt {}: {:?}", path.display(), text)))
    }

    fn committed_versions(dir: &Path) -> Vec<u64> {
        let mut versions: Vec<u64> = fs::read_dir(dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.path().is_dir())
                    .filter_map(|e| e.file_name().to_str().and_then(parse_version))
                    .collect()
            })
            .unwrap_or_default();
        versions.sort_unstable();
        versions
    }

    fn read_version(&self, ticker: &str, dir: &Path, version: u64) -> Result<ModelArtifact> {
        let vdir = dir.join(version_name(version));
        let model: RecurrentRegressor = read_json(&vdir.join(MODEL_FILE))?;
        let scaler_x: ScalerState = read_json(&vdir.join(SCALER_X_FILE))?;
        let scaler_y: ScalerState = read_json(&vdir.join(SCALER_Y_FILE))?;
        let metadata: TrainMetadata = read_json(&vdir.join(META_FILE))?;

        if metadata.version != version || metadata.ticker != ticker {
            return Err(ForecastError::ModelLoad(format!(
                "{} holds {} v{}",
                vdir.display(),
                metadata.ticker,
                metadata.version
            )));
        }

        let artifact = ModelArtifact {
            model,
            scaler_x,
            scaler_y,
            metadata,
        };
        artifact
            .check_consistency()
            .map_err(|e| ForecastError::ModelLoad(format!("{}: {}", vdir.display(), e)))?;
        Ok(artifact)
    }

    fn prune(&self, dir: &Path, live: u64) {
        let versions = Self::committed_versions(dir);
        let keep_from = versions.len().saturating_sub(KEEP_VERSIONS);
        for version in versions[..keep_from].iter().filter(|v| **v != live) {
            let path = dir.join(version_name(*version));
            if let Err(e) = fs::remove_dir_all(&path) {
                warn!(path = %path.display(), error = %e, "failed to prune old model version");
            }
        }

        // Leftovers from interrupted saves
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if name.to_str().is_some_and(|n| n.starts_with(".staging-")) {
                    let _ = fs::remove_dir_all(entry.path());
                }
            }
        }
    }
}

impl ModelStore for FileModelStore {
    fn exists(&self, ticker: &str) -> bool {
        self.ticker_dir(ticker)
            .map(|dir| dir.join(CURRENT_FILE).is_file())
            .unwrap_or(false)
    }

    fn load(&self, ticker: &str) -> Result<Option<ModelArtifact>> {
        let dir = self.ticker_dir(ticker)?;
        let Some(version) = self.current_version(&dir)? else {
            return Ok(None);
        };
        let artifact = self.read_version(ticker, &dir, version)?;
        debug!(ticker, version, "loaded model artifact");
        Ok(Some(artifact))
    }

    fn save(&self, ticker: &str, artifact: &ModelArtifact) -> Result<TrainMetadata> {
        let dir = self.ticker_dir(ticker)?;
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|_| ForecastError::Storage("model store lock poisoned".to_string()))?;

        fs::create_dir_all(&dir)?;
        let current = self.current_version(&dir).ok().flatten().unwrap_or(0);
        let latest_dir = Self::committed_versions(&dir).last().copied().unwrap_or(0);
        let version = current.max(latest_dir) + 1;

        let mut metadata = artifact.metadata.clone();
        metadata.ticker = ticker.to_string();
        metadata.version = version;

        let staging = dir.join(format!(".staging-{}-{}", version_name(version), unique_suffix()));
        fs::create_dir_all(&staging)?;
        let staged = (|| -> Result<()> {
            write_json(&staging.join(MODEL_FILE), &artifact.model)?;
            write_json(&staging.join(SCALER_X_FILE), &artifact.scaler_x)?;
            write_json(&staging.join(SCALER_Y_FILE), &artifact.scaler_y)?;
            write_json(&staging.join(META_FILE), &metadata)?;
            fs::rename(&staging, dir.join(version_name(version)))?;
            Ok(())
        })();
        if let Err(e) = staged {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        // The pointer swap is the commit point
        let tmp = dir.join(format!("{}.tmp-{}", CURRENT_FILE, unique_suffix()));
        write_synced(&tmp, version_name(version).as_bytes())?;
        fs::rename(&tmp, dir.join(CURRENT_FILE))?;
        sync_dir(&dir);

        info!(ticker, version, lookback = metadata.lookback, "committed model artifact");
        self.prune(&dir, version);
        Ok(metadata)
    }
}

fn version_name(version: u64) -> String {
    format!("v{}", version)
}

fn parse_version(name: &str) -> Option<u64> {
    name.strip_prefix('v')?.parse().ok()
}

fn unique_suffix() -> String {
    format!(
        "{}-{}",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| ForecastError::Storage(e.to_string()))?;
    write_synced(path, &json)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|e| ForecastError::ModelLoad(format!("{}: {}", path.display(), e)))?;
    serde_json::from_slice(&bytes).map_err(|e| ForecastError::ModelLoad(format!("{}: {}", path.display(), e)))
}

fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scaler::MinMaxScaler;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn artifact(lookback: usize, use_indicators: bool) -> ModelArtifact {
        let mut rng = StdRng::seed_from_u64(lookback as u64);
        let features = if use_indicators { 7 } else { 1 };
        ModelArtifact {
            model: RecurrentRegressor::new(features, 4, &mut rng),
            scaler_x: ScalerState {
                min: vec![0.0; features],
                max: vec![1.0; features],
            },
            scaler_y: MinMaxScaler::fit_column(&[10.0, 20.0]),
            metadata: TrainMetadata {
                ticker: "AAPL".to_string(),
                lookback,
                use_indicators,
                interval: Interval::Day1,
                train_dates: TrainDates {
                    start: NaiveDate::from_ymd_opt(2020, 1, 2).unwrap(),
                    end: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                },
                created_at: Utc::now(),
                version: 0,
            },
        }
    }

    fn config(lookback: usize, use_indicators: bool) -> ModelConfig {
        ModelConfig {
            lookback,
            use_indicators,
            interval: Interval::Day1,
        }
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let store = FileModelStore::new(dir.path());
        assert!(!store.exists("AAPL"));
        assert!(store.load("AAPL").unwrap().is_none());

        let saved = store.save("AAPL", &artifact(30, true)).unwrap();
        assert_eq!(saved.version, 1);
        assert!(store.exists("AAPL"));

        let loaded = store.load("AAPL").unwrap().unwrap();
        assert_eq!(loaded.metadata, saved);
        assert_eq!(loaded.scaler_y, MinMaxScaler::fit_column(&[10.0, 20.0]));
        assert_eq!(loaded.model.input_size, 7);
    }

    #[test]
    fn test_needs_retrain_on_drift() {
        let dir = tempdir().unwrap();
        let store = FileModelStore::new(dir.path());
        assert!(store.needs_retrain("AAPL", &config(30, true)));

        store.save("AAPL", &artifact(30, true)).unwrap();
        assert!(!store.needs_retrain("AAPL", &config(30, true)));
        assert!(store.needs_retrain("AAPL", &config(60, true)));
        assert!(store.needs_retrain("AAPL", &config(30, false)));
        let weekly = ModelConfig {
            interval: Interval::Week1,
            ..config(30, true)
        };
        assert!(store.needs_retrain("AAPL", &weekly));
    }

    #[test]
    fn test_interrupted_save_leaves_old_artifact() {
        let dir = tempdir().unwrap();
        let store = FileModelStore::new(dir.path());
        store.save("AAPL", &artifact(30, true)).unwrap();

        // Crash after metadata was written for v2 but before weights or the
        // pointer swap
        let ticker_dir = store.ticker_dir("AAPL").unwrap();
        let partial = ticker_dir.join("v2");
        fs::create_dir_all(&partial).unwrap();
        let mut meta = artifact(60, false).metadata;
        meta.version = 2;
        write_json(&partial.join(META_FILE), &meta).unwrap();
        let staging = ticker_dir.join(".staging-v3-crashed");
        fs::create_dir_all(&staging).unwrap();
        write_json(&staging.join(META_FILE), &meta).unwrap();

        let loaded = store.load("AAPL").unwrap().unwrap();
        assert_eq!(loaded.metadata.version, 1);
        assert_eq!(loaded.metadata.lookback, 30);
        assert_eq!(loaded.model.input_size, 7);

        // The next commit skips past the orphaned version and cleans up
        let saved = store.save("AAPL", &artifact(60, false)).unwrap();
        assert_eq!(saved.version, 3);
        assert!(!staging.exists());
        let loaded = store.load("AAPL").unwrap().unwrap();
        assert_eq!(loaded.metadata.lookback, 60);
        assert_eq!(loaded.model.input_size, 1);
    }

    #[test]
    fn test_pointer_to_partial_version_is_load_error() {
        let dir = tempdir().unwrap();
        let store = FileModelStore::new(dir.path());
        store.save("AAPL", &artifact(30, true)).unwrap();

        let ticker_dir = store.ticker_dir("AAPL").unwrap();
        fs::remove_file(ticker_dir.join("v1").join(MODEL_FILE)).unwrap();

        assert!(store.exists("AAPL"));
        assert!(matches!(store.load("AAPL"), Err(ForecastError::ModelLoad(_))));
        assert!(matches!(store.load_metadata("AAPL"), Err(ForecastError::ModelLoad(_))));
        assert!(store.needs_retrain("AAPL", &config(30, true)));
    }

    fn rewrite_json(path: &Path, edit: impl FnOnce(&mut serde_json::Value)) {
        let mut value: serde_json::Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        edit(&mut value);
        fs::write(path, serde_json::to_vec(&value).unwrap()).unwrap();
    }

    #[test]
    fn test_mismatched_scaler_bounds_are_load_error() {
        let dir = tempdir().unwrap();
        let store = FileModelStore::new(dir.path());
        store.save("AAPL", &artifact(30, true)).unwrap();
        let vdir = store.ticker_dir("AAPL").unwrap().join("v1");

        rewrite_json(&vdir.join(SCALER_X_FILE), |v| v["max"] = serde_json::json!([1.0]));
        assert!(matches!(store.load("AAPL"), Err(ForecastError::ModelLoad(_))));
        assert!(store.needs_retrain("AAPL", &config(30, true)));

        store.save("AAPL", &artifact(30, true)).unwrap();
        let vdir = store.ticker_dir("AAPL").unwrap().join("v2");
        rewrite_json(&vdir.join(SCALER_Y_FILE), |v| {
            v["min"] = serde_json::json!([1.0, 2.0]);
            v["max"] = serde_json::json!([3.0, 4.0]);
        });
        assert!(matches!(store.load("AAPL"), Err(ForecastError::ModelLoad(_))));
    }

    #[test]
    fn test_weight_shape_mismatch_is_load_error() {
        let dir = tempdir().unwrap();
        let store = FileModelStore::new(dir.path());
        store.save("AAPL", &artifact(30, true)).unwrap();
        let model_path = store.ticker_dir("AAPL").unwrap().join("v1").join(MODEL_FILE);

        rewrite_json(&model_path, |v| v["hidden_size"] = serde_json::json!(3));
        assert!(matches!(store.load("AAPL"), Err(ForecastError::ModelLoad(_))));
        assert!(store.needs_retrain("AAPL", &config(30, true)));

        // Model sized for a different feature layout than its scaler
        store.save("AAPL", &artifact(30, false)).unwrap();
        let vdir = store.ticker_dir("AAPL").unwrap().join("v2");
        rewrite_json(&vdir.join(SCALER_X_FILE), |v| {
            v["min"] = serde_json::json!(vec![0.0; 7]);
            v["max"] = serde_json::json!(vec![1.0; 7]);
        });
        assert!(matches!(store.load("AAPL"), Err(ForecastError::ModelLoad(_))));
    }

    #[test]
    fn test_old_versions_pruned() {
        let dir = tempdir().unwrap();
        let store = FileModelStore::new(dir.path());
        for lookback in [10, 20, 30, 40] {
            store.save("MSFT", &artifact(lookback, false)).unwrap();
        }
        let ticker_dir = store.ticker_dir("MSFT").unwrap();
        assert_eq!(FileModelStore::committed_versions(&ticker_dir), vec![3, 4]);
        assert_eq!(store.load("MSFT").unwrap().unwrap().metadata.lookback, 40);
    }

    #[test]
    fn test_rejects_path_like_tickers() {
        let dir = tempdir().unwrap();
        let store = FileModelStore::new(dir.path());
        assert!(store.ticker_dir("../etc").is_err());
        assert!(store.ticker_dir("..").is_err());
        assert!(store.ticker_dir("A/B").is_err());
        assert!(store.ticker_dir("BRK.B").is_ok());
        assert!(!store.exists(".."));
    }

    #[test]
    fn test_concurrent_saves_commit_one_artifact() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(FileModelStore::new(dir.path()));

        let handles: Vec<_> = (1..=6)
            .map(|i| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || store.save("TSLA", &artifact(i * 5, i % 2 == 0)).unwrap())
            })
            .collect();
        let saved: Vec<TrainMetadata> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let loaded = store.load("TSLA").unwrap().unwrap();
        let last = saved.iter().max_by_key(|m| m.version).unwrap();
        assert_eq!(loaded.metadata.version, 6);
        assert_eq!(&loaded.metadata, last);
        let features = if loaded.metadata.use_indicators { 7 } else { 1 };
        assert_eq!(loaded.model.input_size, features);
    }
}
