//! HTTP and WebSocket server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/users` | Register a user (dev/bootstrap surface) |
//! | `POST` | `/items` | Post a lost/found item, embedding its image when configured |
//! | `GET`  | `/items/{id}` | Fetch one item |
//! | `POST` | `/chat/thread` | Open (or return) the conversation for an item |
//! | `GET`  | `/chat/threads` | List the caller's conversations, inbox-ordered |
//! | `POST` | `/chat/threads/{id}/close` | Record the caller's close confirmation |
//! | `GET`  | `/chat/threads/{id}/messages` | Chronological messages, `?limit=` capped at 200 |
//! | `POST` | `/search/similar-by-image` | Rank items against an uploaded image |
//! | `POST` | `/search/deduplicate` | Rank likely duplicates of an item |
//! | `GET`  | `/ws` | Realtime channel; `?token=` verified before the upgrade |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! All error responses use one JSON schema:
//!
//! ```json
//! { "error": { "code": "conflict", "message": "item 7 already has a chat" } }
//! ```
//!
//! Codes: `bad_request` (400), `unauthenticated` (401), `forbidden` (403),
//! `not_found` (404), `conflict` (409), `embeddings_disabled` (400),
//! `internal` (500).
//!
//! Every request-style endpoint except `/health` requires
//! `Authorization: Bearer <token>`. The WebSocket channel authenticates the
//! same token as a query parameter and refuses the upgrade outright on
//! failure — a bad token never produces an accepted-then-closed socket.

use axum::{
    body::Bytes,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::auth;
use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::error::DomainError;
use crate::items;
use crate::models::{ChatMessage, Item, SimilarityMatch, ThreadView, User};
use crate::realtime::{run_session, Rooms};
use crate::similarity;
use crate::threads;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
    rooms: Arc<Rooms>,
}

/// Starts the server on `[server].bind` and runs until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    // Fail fast on a bad embedding section instead of at the first upload.
    let provider = embedding::create_provider(&config.embedding)?;
    if config.embedding.is_enabled() {
        tracing::info!(
            model = provider.model_name(),
            dims = provider.dims(),
            "embedding provider configured"
        );
    }

    let pool = db::connect(config).await?;
    let state = AppState {
        config: Arc::new(config.clone()),
        pool,
        rooms: Arc::new(Rooms::new()),
    };

    let bind_addr = state.config.server.bind.clone();
    let app = router(state);

    tracing::info!(addr = %bind_addr, "server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/users", post(handle_create_user))
        .route("/items", post(handle_create_item))
        .route("/items/{id}", get(handle_get_item))
        .route("/chat/thread", post(handle_create_thread))
        .route("/chat/threads", get(handle_list_threads))
        .route("/chat/threads/{id}/close", post(handle_confirm_close))
        .route("/chat/threads/{id}/messages", get(handle_list_messages))
        .route("/search/similar-by-image", post(handle_similar_by_image))
        .route("/search/deduplicate", post(handle_deduplicate))
        .route("/ws", get(handle_ws))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"conflict"`).
    code: String,
    /// Human-readable error message.
    message: String,
}

/// Internal error type that converts into an HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<DomainError> for AppError {
    fn from(e: DomainError) -> Self {
        let status = match &e {
            DomainError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DomainError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            DomainError::Forbidden(_) => StatusCode::FORBIDDEN,
            DomainError::NotFound(_) => StatusCode::NOT_FOUND,
            DomainError::Conflict(_) => StatusCode::CONFLICT,
            DomainError::Internal(inner) => {
                tracing::error!(error = %inner, "internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match &e {
            // Never leak internal detail to the client.
            DomainError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        AppError {
            status,
            code: e.code().to_string(),
            message,
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::from(DomainError::Internal(e))
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn embeddings_disabled() -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "embeddings_disabled".to_string(),
        message: "embedding provider is disabled".to_string(),
    }
}

// ============ Authentication ============

/// Resolve the caller from the `Authorization: Bearer` header.
fn bearer_user(state: &AppState, headers: &HeaderMap) -> Result<i64, AppError> {
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            AppError::from(DomainError::Unauthenticated(
                "missing authorization header".into(),
            ))
        })?;

    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .ok_or_else(|| {
            AppError::from(DomainError::Unauthenticated(
                "authorization header is not a bearer token".into(),
            ))
        })?;

    Ok(auth::verify_token(&state.config.auth, token)?)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Users and items ============

#[derive(Deserialize)]
struct CreateUserRequest {
    name: String,
}

async fn handle_create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<User>, AppError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(bad_request("name must not be empty"));
    }
    let user = items::create_user(&state.pool, name).await?;
    Ok(Json(user))
}

#[derive(Deserialize)]
struct CreateItemRequest {
    title: String,
    #[serde(default)]
    image_url: Option<String>,
    /// Base64-encoded image bytes; embedded at creation when the provider
    /// is enabled.
    #[serde(default)]
    image_base64: Option<String>,
}

async fn handle_create_item(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateItemRequest>,
) -> Result<Json<Item>, AppError> {
    let owner_id = bearer_user(&state, &headers)?;

    let title = req.title.trim();
    if title.is_empty() {
        return Err(bad_request("title must not be empty"));
    }

    let embedding = match &req.image_base64 {
        Some(encoded) if state.config.embedding.is_enabled() => {
            let bytes = BASE64
                .decode(encoded)
                .map_err(|_| bad_request("image_base64 is not valid base64"))?;
            let vec = embedding::embed_image(&state.config.embedding, &bytes)
                .await
                .map_err(|e| bad_request(format!("could not embed image: {}", e)))?;
            Some(vec)
        }
        _ => None,
    };

    let item = items::create_item(
        &state.pool,
        owner_id,
        title,
        req.image_url.as_deref(),
        embedding.as_deref(),
    )
    .await?;

    Ok(Json(item))
}

async fn handle_get_item(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Item>, AppError> {
    bearer_user(&state, &headers)?;
    let item = items::get_item(&state.pool, id)
        .await?
        .ok_or_else(|| AppError::from(DomainError::NotFound(format!("item {}", id))))?;
    Ok(Json(item))
}

// ============ Chat threads ============

#[derive(Deserialize)]
struct CreateThreadRequest {
    item_id: i64,
    peer_id: i64,
}

async fn handle_create_thread(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateThreadRequest>,
) -> Result<Json<ThreadView>, AppError> {
    let user_id = bearer_user(&state, &headers)?;
    let view = threads::create_or_get_thread(&state.pool, user_id, req.item_id, req.peer_id).await?;
    Ok(Json(view))
}

async fn handle_list_threads(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ThreadView>>, AppError> {
    let user_id = bearer_user(&state, &headers)?;
    let views = threads::list_threads(&state.pool, user_id).await?;
    Ok(Json(views))
}

async fn handle_confirm_close(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ThreadView>, AppError> {
    let user_id = bearer_user(&state, &headers)?;
    let view = threads::confirm_close(&state.pool, user_id, id).await?;
    Ok(Json(view))
}

#[derive(Deserialize)]
struct ListMessagesQuery {
    #[serde(default)]
    limit: Option<i64>,
}

async fn handle_list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<Vec<ChatMessage>>, AppError> {
    let user_id = bearer_user(&state, &headers)?;
    let messages = threads::list_messages(&state.pool, user_id, id, query.limit).await?;
    Ok(Json(messages))
}

// ============ Similarity search ============

#[derive(Deserialize)]
struct SimilarQuery {
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    min_similarity: Option<f64>,
}

fn ranking_params(
    state: &AppState,
    top_k: Option<usize>,
    min_similarity: Option<f64>,
    default_min: f64,
) -> Result<(usize, f64), AppError> {
    let max_top_k = state.config.similarity.max_top_k;
    let top_k = top_k.unwrap_or(max_top_k).clamp(1, max_top_k);

    let min_similarity = min_similarity.unwrap_or(default_min);
    if !(0.0..=1.0).contains(&min_similarity) {
        return Err(bad_request("min_similarity must be in [0, 1]"));
    }

    Ok((top_k, min_similarity))
}

async fn handle_similar_by_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SimilarQuery>,
    body: Bytes,
) -> Result<Json<Vec<SimilarityMatch>>, AppError> {
    let user_id = bearer_user(&state, &headers)?;

    if !state.config.embedding.is_enabled() {
        return Err(embeddings_disabled());
    }
    if body.is_empty() {
        return Err(bad_request("request body must contain image bytes"));
    }

    let (top_k, min_similarity) = ranking_params(
        &state,
        query.top_k,
        query.min_similarity,
        state.config.similarity.min_similarity,
    )?;

    let vector = embedding::embed_image(&state.config.embedding, &body)
        .await
        .map_err(|e| bad_request(format!("could not embed image: {}", e)))?;

    let matches =
        similarity::find_similar_by_image(&state.pool, user_id, &vector, top_k, min_similarity)
            .await?;
    Ok(Json(matches))
}

#[derive(Deserialize)]
struct DeduplicateRequest {
    item_id: i64,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    min_similarity: Option<f64>,
}

async fn handle_deduplicate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DeduplicateRequest>,
) -> Result<Json<Vec<SimilarityMatch>>, AppError> {
    let user_id = bearer_user(&state, &headers)?;

    let (top_k, min_similarity) = ranking_params(
        &state,
        req.top_k,
        req.min_similarity,
        state.config.similarity.dedup_threshold,
    )?;

    let matches =
        similarity::find_duplicates(&state.pool, user_id, req.item_id, top_k, min_similarity)
            .await?;
    Ok(Json(matches))
}

// ============ Realtime ============

#[derive(Deserialize)]
struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

/// Upgrade handler for the realtime channel.
///
/// The token is verified *before* accepting the upgrade; a failed
/// verification is a plain 401 and no session state is ever created.
async fn handle_ws(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let token = query.token.as_deref().ok_or_else(|| {
        AppError::from(DomainError::Unauthenticated("missing token".into()))
    })?;
    let user_id = auth::verify_token(&state.config.auth, token)?;

    let pool = state.pool.clone();
    let rooms = state.rooms.clone();
    let history_limit = state.config.server.history_limit;

    Ok(ws.on_upgrade(move |socket| async move {
        tracing::debug!(user_id, "realtime session opened");
        run_session(socket, pool, rooms, user_id, history_limit).await;
        tracing::debug!(user_id, "realtime session closed");
    }))
}
