use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ForecastMode;
use crate::error::ForecastError;
use crate::orchestrator::{ForecastOrchestrator, PredictOptions};
use crate::result::{ForecastResult, LatestQuote};
use crate::types::{Interval, SourceHealth};

/// Application state shared across handlers
pub struct AppState {
    pub orchestrator: ForecastOrchestrator,
}

/// Body of `POST /predict`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictRequest {
    pub ticker: String,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub lookback: Option<usize>,
    #[serde(default)]
    pub use_indicators: Option<bool>,
    #[serde(default)]
    pub mode: Option<String>,
}

impl PredictRequest {
    pub fn into_options(self) -> Result<PredictOptions, ForecastError> {
        let interval = match self.interval.as_deref().map(str::trim) {
            None | Some("") => Interval::default(),
            Some(raw) => Interval::parse(raw).ok_or_else(|| {
                ForecastError::Validation(format!("unsupported interval {:?}; use 1d, 1wk or 1mo", raw))
            })?,
        };
        let mode = match self.mode.as_deref().map(str::trim) {
            None | Some("") => None,
            Some("model") => Some(ForecastMode::Model),
            Some("heuristic") => Some(ForecastMode::Heuristic),
            Some(raw) => {
                return Err(ForecastError::Validation(format!(
                    "unsupported mode {:?}; use model or heuristic",
                    raw
                )))
            }
        };

        Ok(PredictOptions {
            ticker: self.ticker,
            start: parse_date("start", self.start.as_deref())?,
            end: parse_date("end", self.end.as_deref())?,
            interval,
            lookback: self.lookback,
            use_indicators: self.use_indicators.unwrap_or(true),
            mode,
        })
    }
}

fn parse_date(field: &str, raw: Option<&str>) -> Result<Option<NaiveDate>, ForecastError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| ForecastError::Validation(format!("{} must be YYYY-MM-DD, got {:?}", field, s))),
    }
}

/// JSON error body for failed requests. 5xx bodies never carry internals.
#[derive(Debug)]
pub struct ApiError(ForecastError);

impl From<ForecastError> for ApiError {
    fn from(e: ForecastError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match &self.0 {
            ForecastError::InvalidTicker(ticker) => (
                StatusCode::BAD_REQUEST,
                "Invalid stock ticker",
                format!(
                    "'{}' is not a valid or tradeable stock symbol. Please enter a valid ticker like AAPL, TSLA, MSFT, etc.",
                    ticker
                ),
            ),
            ForecastError::Validation(msg) => (StatusCode::BAD_REQUEST, "Validation error", msg.clone()),
            e @ ForecastError::InsufficientData { .. } => {
                (StatusCode::BAD_REQUEST, "Insufficient data", e.to_string())
            }
            ForecastError::Timeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "Timeout",
                "The forecast took too long. Please try again later.".to_string(),
            ),
            ForecastError::DataUnavailable { ticker, .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Data unavailable",
                format!("Unable to fetch historical data for {}. Please try again later.", ticker),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Server error",
                "Something went wrong while generating the forecast.".to_string(),
            ),
        };

        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self.0, "request failed");
        }

        (status, Json(json!({ "error": error, "message": message }))).into_response()
    }
}

/// POST /predict - Forecast and recommendation for a ticker
pub async fn predict(
    State(state): State<Arc<AppState>>,
    body: Result<Json<PredictRequest>, JsonRejection>,
) -> Result<Json<ForecastResult>, ApiError> {
    let Json(req) = body.map_err(|e| {
        warn!("Rejected predict body: {}", e);
        ForecastError::Validation(e.body_text())
    })?;
    let options = req.into_options()?;

    info!(ticker = %options.ticker, lookback = ?options.lookback, interval = %options.interval, "predict request");
    let result = state.orchestrator.predict(options).await?;
    Ok(Json(result))
}

/// GET /latest/:ticker - Next-step forecast only
pub async fn latest(
    State(state): State<Arc<AppState>>,
    Path(ticker): Path<String>,
) -> Result<Json<LatestQuote>, ApiError> {
    Ok(Json(state.orchestrator.latest(&ticker).await?))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub data_source: SourceHealth,
}

/// GET /health - Liveness plus data source status (no API call)
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        message: "Backend is running!",
        data_source: state.orchestrator.source().health().await,
    })
}

/// Routes with CORS restricted to `cors_origins`
pub fn router(state: Arc<AppState>, cors_origins: &[String]) -> Router {
    let origins: Vec<HeaderValue> = cors_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true);

    Router::new()
        .route("/predict", post(predict))
        .route("/latest/:ticker", get(latest))
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
