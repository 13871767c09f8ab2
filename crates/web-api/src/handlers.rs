use crate::error::ApiError;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use botfleet_orchestrator::{
    BotInstance, DispatchReport, FleetController, HistoryEntry, StartPayload, StopPayload,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Envelope for status reads.
#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub status: &'static str,
    pub data: T,
}

/// Envelope for history reads and command results.
#[derive(Debug, Serialize)]
pub struct ActionResponse<T> {
    pub status: &'static str,
    pub response: T,
}

const SUCCESS: &str = "success";

impl<T> DataResponse<T> {
    const fn success(data: T) -> Self {
        Self {
            status: SUCCESS,
            data,
        }
    }
}

impl<T> ActionResponse<T> {
    const fn success(response: T) -> Self {
        Self {
            status: SUCCESS,
            response,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StartBotAction {
    pub bot_name: String,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub conf: Option<String>,
    #[serde(default)]
    pub async_backend: bool,
}

#[derive(Debug, Deserialize)]
pub struct StopBotAction {
    pub bot_name: String,
    #[serde(default)]
    pub skip_order_cancellation: bool,
    #[serde(default)]
    pub async_backend: bool,
}

#[derive(Debug, Deserialize)]
pub struct ImportStrategyAction {
    pub bot_name: String,
    pub strategy: String,
}

/// `?limit=N`. Anything that is not a count is ignored and the full history returned.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<String>,
}

impl HistoryQuery {
    fn limit(&self) -> Option<usize> {
        self.limit.as_deref().and_then(|raw| raw.trim().parse().ok())
    }
}

/// Returns the cached status of every known bot.
///
/// # Errors
/// Returns 404 if no bot has been discovered yet.
pub async fn get_active_bots_status(
    State(controller): State<Arc<FleetController>>,
) -> Result<Json<DataResponse<HashMap<String, BotInstance>>>, ApiError> {
    let bots = controller.get_all_status()?;
    Ok(Json(DataResponse::success(bots)))
}

/// # Errors
/// Returns 404 if the bot is unknown.
pub async fn get_bot_status(
    State(controller): State<Arc<FleetController>>,
    Path(bot_name): Path<String>,
) -> Result<Json<DataResponse<BotInstance>>, ApiError> {
    let bot = controller.get_status(&bot_name)?;
    Ok(Json(DataResponse::success(bot)))
}

/// History is never an error; unknown bots get an empty list.
pub async fn get_bot_history(
    State(controller): State<Arc<FleetController>>,
    Path(bot_name): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Json<ActionResponse<Vec<HistoryEntry>>> {
    let entries = match query.limit() {
        Some(limit) => controller.get_recent_history(&bot_name, limit),
        None => controller.get_history(&bot_name),
    };
    Json(ActionResponse::success(entries))
}

/// Dispatches a start command and waits for the bot's acknowledgment.
///
/// A missing acknowledgment is still a 200; the report's outcome says `timed_out`.
///
/// # Errors
/// Returns 404 for an undiscovered bot or 503 if the broker is unreachable.
pub async fn start_bot(
    State(controller): State<Arc<FleetController>>,
    Json(action): Json<StartBotAction>,
) -> Result<Json<ActionResponse<DispatchReport>>, ApiError> {
    let payload = StartPayload {
        log_level: action.log_level,
        script: action.script,
        conf: action.conf,
        async_backend: action.async_backend,
    };
    let report = controller.start_bot(&action.bot_name, payload).await?;
    Ok(Json(ActionResponse::success(report)))
}

/// # Errors
/// Returns 404 for an undiscovered bot or 503 if the broker is unreachable.
pub async fn stop_bot(
    State(controller): State<Arc<FleetController>>,
    Json(action): Json<StopBotAction>,
) -> Result<Json<ActionResponse<DispatchReport>>, ApiError> {
    let payload = StopPayload {
        skip_order_cancellation: action.skip_order_cancellation,
        async_backend: action.async_backend,
    };
    let report = controller.stop_bot(&action.bot_name, payload).await?;
    Ok(Json(ActionResponse::success(report)))
}

/// # Errors
/// Returns 404 for an undiscovered bot or 503 if the broker is unreachable.
pub async fn import_strategy(
    State(controller): State<Arc<FleetController>>,
    Json(action): Json<ImportStrategyAction>,
) -> Result<Json<ActionResponse<DispatchReport>>, ApiError> {
    let report = controller
        .import_strategy(&action.bot_name, action.strategy)
        .await?;
    Ok(Json(ActionResponse::success(report)))
}
