// Operator control surface: health, target edits, forced polls and breaker
// resets.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use relay_common::{RelayError, Target};
use tracing::warn;

use relay_engine::Engine;

pub struct AppState {
    pub engine: Engine,
}

pub fn router(engine: Engine) -> Router {
    let state = Arc::new(AppState { engine });
    Router::new()
        .route("/health", get(health))
        .route("/targets", get(list_targets).post(add_target))
        .route("/targets/{id}", delete(remove_target))
        .route("/targets/{id}/poll", post(poll_target))
        .route("/targets/{id}/breaker/reset", post(reset_breaker))
        .with_state(state)
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(
                |request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                },
            ),
        )
}

struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::UnknownTarget(_) => StatusCode::NOT_FOUND,
            RelayError::DuplicateTarget(_) | RelayError::AttemptInProgress(_) => StatusCode::CONFLICT,
            RelayError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "Control request failed");
        }
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.health())
}

async fn list_targets(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.targets())
}

async fn add_target(
    State(state): State<Arc<AppState>>,
    Json(target): Json<Target>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.add_target(target.clone())?;
    Ok((StatusCode::CREATED, Json(target)))
}

async fn remove_target(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.remove_target(&id)?))
}

async fn poll_target(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.poll_now(&id).await?))
}

async fn reset_breaker(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.reset_breaker(&id)?))
}
