use std::{collections::HashMap, str::FromStr, sync::atomic::Ordering};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use heating_engine::{
    AdvancedControlConfig, Area, EngineError, HeatingEngine, PresetMode, VacationConfig,
};

use crate::host::{
    self, persist_areas, persist_runtime_from_state, publish_events, tick_time, AppState,
};

type Params = Query<HashMap<String, String>>;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct TimezoneUpdate {
    timezone: String,
}

#[derive(Debug, Serialize)]
struct TimeStatus {
    #[serde(rename = "timeSynced")]
    time_synced: bool,
    timezone: String,
    #[serde(rename = "nowEpoch")]
    now_epoch: i64,
}

#[derive(Debug, Deserialize)]
struct BoostRequest {
    temperature: f32,
    minutes: i64,
}

#[derive(Debug, Serialize)]
struct CalibrationResponse {
    setpoint: f32,
}

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/areas", get(handle_get_areas))
        .route(
            "/api/areas/{id}",
            get(handle_get_area)
                .put(handle_put_area)
                .delete(handle_delete_area),
        )
        .route("/api/areas/{id}/target", post(handle_set_area_target))
        .route("/api/areas/{id}/hysteresis", post(handle_set_area_hysteresis))
        .route("/api/areas/{id}/enabled", post(handle_set_area_enabled))
        .route("/api/areas/{id}/preset", post(handle_set_preset))
        .route(
            "/api/areas/{id}/boost",
            post(handle_set_boost).delete(handle_cancel_boost),
        )
        .route("/api/areas/{id}/override/clear", post(handle_clear_override))
        .route("/api/hysteresis", post(handle_set_hysteresis))
        .route("/api/vacation", put(handle_put_vacation))
        .route("/api/safety/clear", post(handle_safety_clear))
        .route(
            "/api/advanced",
            get(handle_get_advanced).put(handle_put_advanced),
        )
        .route(
            "/api/advanced/autotune",
            post(handle_start_autotune).delete(handle_abort_autotune),
        )
        .route("/api/calibration/start", post(handle_start_calibration))
        .route("/api/calibration/abort", post(handle_abort_calibration))
        .route("/api/learning", get(handle_get_learning))
        .route("/api/time", get(handle_get_time))
        .route("/api/timezone", put(handle_put_timezone))
        .with_state(app_state)
}

async fn handle_get_status(State(state): State<AppState>) -> Response {
    let now = tick_time(&state).await;
    let status = state.engine.lock().await.status(now.wall);
    Json(status).into_response()
}

async fn handle_get_areas(State(state): State<AppState>) -> Response {
    let areas: Vec<Area> = state.engine.lock().await.areas().cloned().collect();
    Json(areas).into_response()
}

async fn handle_get_area(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    area_response(&state, &id).await
}

async fn handle_put_area(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(area): Json<Area>,
) -> Response {
    if area.id != id {
        return error_response(StatusCode::BAD_REQUEST, "area id does not match the path");
    }
    mutate_areas(&state, &id, |engine| engine.upsert_area(area)).await
}

async fn handle_delete_area(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let removed = state.engine.lock().await.remove_area(&id);
    match removed {
        Ok(_) => {
            if let Err(err) = persist_areas(&state).await {
                warn!("failed to persist area removal: {err:#}");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist areas");
            }
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => engine_error(&err),
    }
}

async fn handle_set_area_target(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Params,
) -> Response {
    let target = match param::<f32>(&params, "value") {
        Ok(target) => target,
        Err(response) => return response,
    };
    mutate_areas(&state, &id, |engine| engine.set_area_target(&id, target)).await
}

async fn handle_set_area_hysteresis(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Params,
) -> Response {
    let hysteresis = match params.get("value").map(String::as_str) {
        None | Some("global") => None,
        Some(_) => match param::<f32>(&params, "value") {
            Ok(value) => Some(value),
            Err(response) => return response,
        },
    };
    mutate_areas(&state, &id, |engine| engine.set_area_hysteresis(&id, hysteresis)).await
}

async fn handle_set_area_enabled(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Params,
) -> Response {
    let enabled = match param::<bool>(&params, "value") {
        Ok(enabled) => enabled,
        Err(response) => return response,
    };
    mutate_areas(&state, &id, |engine| engine.set_area_enabled(&id, enabled)).await
}

async fn handle_set_preset(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Params,
) -> Response {
    let preset = match params.get("value").map(String::as_str) {
        None | Some("none") => None,
        Some(value) => match parse_preset(value) {
            Some(preset) => Some(preset),
            None => return error_response(StatusCode::BAD_REQUEST, "Unknown preset"),
        },
    };
    mutate_areas(&state, &id, |engine| engine.set_preset_mode(&id, preset)).await
}

async fn handle_set_boost(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<BoostRequest>,
) -> Response {
    let now = tick_time(&state).await;
    mutate_areas(&state, &id, |engine| {
        engine.set_boost(&id, request.temperature, request.minutes, now.wall)
    })
    .await
}

async fn handle_cancel_boost(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    mutate_areas(&state, &id, |engine| engine.cancel_boost(&id).map(|_| ())).await
}

async fn handle_clear_override(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    mutate_areas(&state, &id, |engine| {
        engine.clear_manual_override(&id).map(|cleared| {
            if cleared {
                info!(area = %id, "manual override cleared");
            }
        })
    })
    .await
}

async fn handle_set_hysteresis(State(state): State<AppState>, Query(params): Params) -> Response {
    let hysteresis = match param::<f32>(&params, "value") {
        Ok(value) => value,
        Err(response) => return response,
    };
    mutate_config(&state, |engine| engine.set_global_hysteresis(hysteresis)).await
}

async fn handle_put_vacation(
    State(state): State<AppState>,
    Json(vacation): Json<VacationConfig>,
) -> Response {
    mutate_config(&state, |engine| engine.set_vacation(vacation)).await
}

async fn handle_safety_clear(State(state): State<AppState>) -> Response {
    let event = state.engine.lock().await.clear_safety_alarm();
    if let Some(event) = event {
        publish_events(&state.mqtt, &[event]).await;
    }
    handle_get_status(State(state)).await
}

async fn handle_get_advanced(State(state): State<AppState>) -> Response {
    let advanced = state.engine.lock().await.config().advanced.clone();
    Json(advanced).into_response()
}

async fn handle_put_advanced(
    State(state): State<AppState>,
    Json(advanced): Json<AdvancedControlConfig>,
) -> Response {
    let result = state.engine.lock().await.set_advanced_control(advanced);
    if let Err(err) = result {
        return engine_error(&err);
    }
    if let Err(err) = persist_runtime_from_state(&state).await {
        warn!("failed to persist advanced control update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist runtime settings",
        );
    }
    handle_get_advanced(State(state)).await
}

async fn handle_start_autotune(State(state): State<AppState>) -> Response {
    let now = tick_time(&state).await;
    let result = state.engine.lock().await.start_pid_autotune(now);
    match result {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => engine_error(&err),
    }
}

async fn handle_abort_autotune(State(state): State<AppState>) -> Response {
    let result = state.engine.lock().await.abort_pid_autotune("aborted by user");
    match result {
        Ok(event) => {
            publish_events(&state.mqtt, &[event]).await;
            handle_get_status(State(state)).await
        }
        Err(err) => engine_error(&err),
    }
}

async fn handle_start_calibration(State(state): State<AppState>) -> Response {
    match host::start_calibration(&state).await {
        Ok(setpoint) => (StatusCode::ACCEPTED, Json(CalibrationResponse { setpoint })).into_response(),
        Err(err) => engine_error(&err),
    }
}

async fn handle_abort_calibration(State(state): State<AppState>) -> Response {
    match host::abort_calibration(&state, "aborted by user").await {
        Ok(()) => handle_get_status(State(state)).await,
        Err(err) => engine_error(&err),
    }
}

async fn handle_get_learning(State(state): State<AppState>) -> Response {
    let stats = state.engine.lock().await.learning_stats();
    Json(stats).into_response()
}

async fn handle_get_time(State(state): State<AppState>) -> Response {
    let timezone = state.timezone.lock().await.clone();
    Json(TimeStatus {
        time_synced: state.time_synced.load(Ordering::Relaxed),
        timezone,
        now_epoch: Utc::now().timestamp(),
    })
    .into_response()
}

async fn handle_put_timezone(
    State(state): State<AppState>,
    Json(update): Json<TimezoneUpdate>,
) -> Response {
    if update.timezone.parse::<Tz>().is_err() {
        return error_response(StatusCode::BAD_REQUEST, "Invalid timezone value");
    }

    {
        let mut timezone = state.timezone.lock().await;
        *timezone = update.timezone;
    }

    if let Err(err) = persist_runtime_from_state(&state).await {
        warn!("failed to persist timezone update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist runtime settings",
        );
    }

    handle_get_time(State(state)).await
}

/// Applies an area mutation, persists all areas and answers with the area.
async fn mutate_areas<F>(state: &AppState, id: &str, apply: F) -> Response
where
    F: FnOnce(&mut HeatingEngine) -> Result<(), EngineError>,
{
    let result = apply(&mut *state.engine.lock().await);
    if let Err(err) = result {
        return engine_error(&err);
    }
    if let Err(err) = persist_areas(state).await {
        warn!("failed to persist area update: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist areas");
    }
    area_response(state, id).await
}

async fn mutate_config<F>(state: &AppState, apply: F) -> Response
where
    F: FnOnce(&mut HeatingEngine) -> Result<(), EngineError>,
{
    let result = apply(&mut *state.engine.lock().await);
    if let Err(err) = result {
        return engine_error(&err);
    }
    if let Err(err) = persist_runtime_from_state(state).await {
        warn!("failed to persist runtime update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist runtime settings",
        );
    }
    handle_get_status(State(state.clone())).await
}

async fn area_response(state: &AppState, id: &str) -> Response {
    let area = state.engine.lock().await.area(id).cloned();
    match area {
        Some(area) => Json(area).into_response(),
        None => engine_error(&EngineError::UnknownArea(id.to_string())),
    }
}

fn param<T: FromStr>(params: &HashMap<String, String>, key: &str) -> Result<T, Response> {
    let Some(raw) = params.get(key) else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            &format!("Missing '{key}' parameter"),
        ));
    };
    raw.trim().parse::<T>().map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            &format!("Invalid '{key}' value: {raw}"),
        )
    })
}

fn parse_preset(value: &str) -> Option<PresetMode> {
    PresetMode::ALL
        .into_iter()
        .find(|preset| preset.as_str().eq_ignore_ascii_case(value.trim()))
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::UnknownArea(_) => StatusCode::NOT_FOUND,
        EngineError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
        EngineError::CalibrationInProgress => StatusCode::CONFLICT,
        EngineError::InsufficientLearningData { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn engine_error(err: &EngineError) -> Response {
    error_response(status_for(err), &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
