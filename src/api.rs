use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::assets::AssetError;
use crate::battle::{BattleConfig, BattleController, BattleReport, BattleVariant};
use crate::config::Locale;
use crate::interaction::{InteractionError, ScreenInteractor};
use crate::state::{AppState, RunPhase};

pub fn router(state: AppState, screen: Arc<ScreenInteractor>) -> Router {
    Router::new()
        .route("/battles/{variant}/start", post(start_battle))
        .route("/stop", post(stop_battle))
        .route("/status", get(get_status))
        .route("/language/{locale}", put(set_language))
        .route("/monitors", get(get_monitors))
        .route("/detect", get(detect_template))
        .with_state(ApiState { app: state, screen })
}

#[derive(Clone)]
struct ApiState {
    app: AppState,
    screen: Arc<ScreenInteractor>,
}

fn check_auth(headers: &HeaderMap, expected_token: Option<&str>) -> Result<(), StatusCode> {
    let Some(expected) = expected_token else {
        return Ok(());
    };
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if let Some(token) = auth.strip_prefix("Bearer ")
        && token == expected
    {
        return Ok(());
    }

    Err(StatusCode::UNAUTHORIZED)
}

async fn authorize(api: &ApiState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let token = {
        let state = api.app.lock().await;
        state.config.auth_token.clone()
    };
    check_auth(headers, token.as_deref())
}

async fn start_battle(
    State(api): State<ApiState>,
    headers: HeaderMap,
    Path(variant): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&api, &headers).await?;
    let variant: BattleVariant = variant.parse().map_err(|e| {
        tracing::warn!("{e}");
        StatusCode::BAD_REQUEST
    })?;

    let mut state = api.app.lock().await;
    let Some(ticket) = state.begin_run(variant) else {
        return Err(StatusCode::CONFLICT);
    };

    let controller = BattleController::new(
        BattleConfig::for_variant(variant),
        api.screen.clone(),
        ticket.token,
    )
    .with_outcome_log(Some(state.config.battle_log.clone()));

    let app_state = api.app.clone();
    let permit = ticket.permit;
    let handle = tokio::spawn(async move {
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            controller.run()
        })
        .await;

        let report = match result {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!("{variant} worker failed: {e}");
                None
            }
        };
        let mut state = app_state.lock().await;
        state.finish_run(report);
    });
    state.runner_handle = Some(handle);

    tracing::info!("{variant} started");
    Ok(Json(json!({"status": "started", "variant": variant})))
}

async fn stop_battle(
    State(api): State<ApiState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&api, &headers).await?;

    let mut state = api.app.lock().await;
    if state.request_stop() {
        tracing::info!("stop requested");
        Ok(Json(json!({"status": "stopping"})))
    } else {
        Ok(Json(json!({"status": "idle"})))
    }
}

#[derive(Serialize)]
struct StatusResponse {
    phase: RunPhase,
    running: bool,
    variant: Option<BattleVariant>,
    started_at: Option<DateTime<Utc>>,
    language: Locale,
    last_report: Option<BattleReport>,
}

async fn get_status(
    State(api): State<ApiState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    let state = api.app.lock().await;
    check_auth(&headers, state.config.auth_token.as_deref())?;

    Ok(Json(StatusResponse {
        phase: state.phase,
        running: state.is_running(),
        variant: state.active_variant,
        started_at: state.started_at,
        language: api.screen.assets().locale(),
        last_report: state.last_report.clone(),
    }))
}

async fn set_language(
    State(api): State<ApiState>,
    headers: HeaderMap,
    Path(locale): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&api, &headers).await?;

    let locale = api.screen.assets().set_locale(&locale).map_err(|e| {
        tracing::warn!("{e}");
        StatusCode::BAD_REQUEST
    })?;
    Ok(Json(json!({"language": locale})))
}

async fn get_monitors(
    State(api): State<ApiState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&api, &headers).await?;

    let screen = api.screen.clone();
    let monitors = tokio::task::spawn_blocking(move || screen.monitors())
        .await
        .map_err(|e| {
            tracing::error!("monitor query panicked: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            tracing::error!("monitor query failed: {e}");
            StatusCode::SERVICE_UNAVAILABLE
        })?;

    Ok(Json(monitors))
}

#[derive(Deserialize)]
struct DetectParams {
    template: String,
}

async fn detect_template(
    State(api): State<ApiState>,
    headers: HeaderMap,
    Query(params): Query<DetectParams>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&api, &headers).await?;

    let screen = api.screen.clone();
    let detection = tokio::task::spawn_blocking(move || screen.detect(&params.template))
        .await
        .map_err(|e| {
            tracing::error!("detection panicked: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            tracing::warn!("detection failed: {e}");
            detection_status(&e)
        })?;

    Ok(Json(detection))
}

fn detection_status(err: &InteractionError) -> StatusCode {
    match err {
        InteractionError::Asset(AssetError::NotFound { .. }) => StatusCode::NOT_FOUND,
        InteractionError::Asset(AssetError::Decode { .. }) => StatusCode::BAD_REQUEST,
        InteractionError::Capture(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
