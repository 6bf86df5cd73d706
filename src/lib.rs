pub mod config;
pub mod error;
pub mod features;
pub mod handlers;
pub mod heuristic;
pub mod model;
pub mod orchestrator;
pub mod recommendation;
pub mod result;
pub mod scaler;
pub mod store;
pub mod types;
pub mod sources {
    pub mod yahoo;
}

pub use config::{ForecastMode, ServiceConfig};
pub use error::ForecastError;
pub use orchestrator::{ForecastOrchestrator, OrchestratorSettings, PredictOptions};
pub use result::{ForecastResult, ForecastSource, LatestQuote};
pub use sources::yahoo::YahooFinanceClient;
pub use store::{FileModelStore, ModelStore};
pub use types::*;
