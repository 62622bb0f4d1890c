use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::channel::{serve_socket, RealtimeChannel};
use crate::constants::DEFAULT_DIMENSION;
use crate::error::GameError;
use crate::protocol::ServerMessage;
use crate::registry::SessionRegistry;
use crate::types::{Direction, GameStateView, MoveResult, QuestionView};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    rows: Option<i64>,
    cols: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct MoveRequest {
    direction: Direction,
}

#[derive(Debug, Deserialize)]
struct AnswerRequest {
    question_id: u32,
    answer: String,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    id: Option<String>,
}

#[derive(Debug, Serialize)]
struct MoveResponse {
    result: MoveResult,
    game_state: GameStateView,
    #[serde(skip_serializing_if = "Option::is_none")]
    question: Option<QuestionView>,
}

#[derive(Debug, Serialize)]
struct AnswerResponse {
    correct: bool,
    game_state: GameStateView,
}

pub fn build_router(state: AppState, static_dir: Option<PathBuf>) -> Router {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/game/start", post(start_game))
        .route("/api/game/{id}", get(get_game).delete(delete_game))
        .route("/api/game/{id}/move", post(move_player))
        .route("/api/game/{id}/answer", post(submit_answer))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let app = match static_dir {
        Some(static_dir) => {
            let index_file = static_dir.join("index.html");
            tracing::info!(root = %static_dir.display(), "serving static client bundle");
            app.fallback_service(
                ServeDir::new(static_dir).not_found_service(ServeFile::new(index_file)),
            )
        }
        None => app,
    };

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub fn resolve_static_dir(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        if path.join("index.html").is_file() {
            return Some(path.to_path_buf());
        }
        tracing::warn!(path = %path.display(), "static dir has no index.html; ignoring");
    }

    [PathBuf::from("dist"), PathBuf::from("client/dist")]
        .into_iter()
        .find(|path| path.join("index.html").is_file())
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn start_game(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<GameStateView>, GameError> {
    let request: StartRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StartRequest::default()
    } else {
        parse_body(&body)?
    };
    let rows = positive_or_default(request.rows);
    let cols = positive_or_default(request.cols);

    let handle = state.registry.create(rows, cols).await?;
    let (_, snapshot) = handle.snapshot().await;
    Ok(Json(snapshot))
}

async fn get_game(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<GameStateView>, GameError> {
    let handle = state.registry.get(&id).await?;
    let (_, snapshot) = handle.snapshot().await;
    Ok(Json(snapshot))
}

async fn delete_game(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<StatusCode, GameError> {
    state
        .registry
        .remove(&id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or(GameError::NotFound(id))
}

async fn move_player(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
    body: Bytes,
) -> Result<Json<MoveResponse>, GameError> {
    let request: MoveRequest = parse_body(&body)?;
    let handle = state.registry.get(&id).await?;
    let (outcome, game_state) = handle
        .apply_move_with(request.direction, |session| session.snapshot())
        .await?;
    Ok(Json(MoveResponse {
        result: outcome.result,
        game_state,
        question: outcome.question,
    }))
}

async fn submit_answer(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
    body: Bytes,
) -> Result<Json<AnswerResponse>, GameError> {
    let request: AnswerRequest = parse_body(&body)?;
    let handle = state.registry.get(&id).await?;
    let (outcome, game_state) = handle
        .answer_with(request.question_id, &request.answer, |session| {
            session.snapshot()
        })
        .await?;
    Ok(Json(AnswerResponse {
        correct: outcome.correct,
        game_state,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Result<Response, GameError> {
    let id = query
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| GameError::malformed("missing session id"))?;
    let (channel, greeting) = RealtimeChannel::attach(state.registry.clone(), &id).await?;
    Ok(ws.on_upgrade(move |socket| serve_socket(channel, greeting, socket)))
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, GameError> {
    serde_json::from_slice(body).map_err(|err| GameError::malformed(err.to_string()))
}

fn positive_or_default(value: Option<i64>) -> i64 {
    value.filter(|v| *v > 0).unwrap_or(DEFAULT_DIMENSION)
}

impl IntoResponse for GameError {
    fn into_response(self) -> Response {
        let status = match &self {
            GameError::NotFound(_) => StatusCode::NOT_FOUND,
            GameError::InvalidState(_) | GameError::UnknownQuestion(_) => StatusCode::CONFLICT,
            GameError::MalformedMessage(_) => StatusCode::BAD_REQUEST,
            GameError::GenerationFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            ServerMessage::error(&self).encode(),
        )
            .into_response()
    }
}
