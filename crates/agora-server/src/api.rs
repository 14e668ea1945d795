use std::sync::Arc;
use std::time::Instant;

use agora_shared::protocol::{ChatMessageView, UserSummary};
use agora_shared::UserId;
use agora_store::{FileRecord, Store, StoreError};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, Method},
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::coordinator::Coordinator;
use crate::error::ServerError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::session::SessionTable;
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub store: Store,
    pub sessions: Arc<SessionTable>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws", get(ws_handler))
        .route("/files/:code", get(file_by_code))
        .route("/admin/status", get(admin_status))
        .route("/admin/users", post(admin_create_user))
        .route("/admin/users/:id", delete(admin_delete_user))
        .route("/admin/sessions", post(admin_issue_session))
        .route("/admin/announcements", post(admin_announce))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    online_count: usize,
}

/// Public file metadata. The object key stays server-side.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileResponse {
    code: String,
    owner_id: UserId,
    file_name: String,
    size: u64,
    content_type: String,
    created_at: DateTime<Utc>,
}

impl From<FileRecord> for FileResponse {
    fn from(file: FileRecord) -> Self {
        Self {
            code: file.code,
            owner_id: file.owner_id,
            file_name: file.file_name,
            size: file.size,
            content_type: file.content_type,
            created_at: file.created_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AdminStatusResponse {
    name: String,
    uptime_secs: u64,
    online_count: usize,
    connections: usize,
    users: usize,
    messages: usize,
    sessions: usize,
    pending_writes: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminCreateUserRequest {
    email: String,
    display_name: String,
    #[serde(default)]
    credential_hash: String,
    #[serde(default)]
    verified: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminSessionRequest {
    user_id: UserId,
}

#[derive(Serialize)]
struct AdminSessionResponse {
    token: String,
}

#[derive(Deserialize)]
struct AdminAnnounceRequest {
    text: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        online_count: state.coordinator.online_count().await,
    })
}

async fn file_by_code(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<FileResponse>, ServerError> {
    let file = state
        .store
        .file_by_code(&code)
        .await
        .ok_or_else(|| ServerError::NotFound(format!("no file with code {}", code.trim())))?;
    Ok(Json(file.into()))
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    // Constant-time comparison to prevent timing attacks on admin token.
    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    Ok(Json(AdminStatusResponse {
        name: state.config.instance_name.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        online_count: state.coordinator.online_count().await,
        connections: state.coordinator.connection_count().await,
        users: state.store.users().await.len(),
        messages: state.store.message_count().await,
        sessions: state.sessions.len().await,
        pending_writes: state.store.has_pending_writes(),
    }))
}

async fn admin_create_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<AdminCreateUserRequest>,
) -> Result<Json<UserSummary>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let user = state
        .store
        .create_user(&req.email, &req.display_name, &req.credential_hash)
        .await?;
    let user = if req.verified {
        state.store.set_verified(user.id, true).await?
    } else {
        user
    };

    info!(user = %user.id, verified = user.verified, "Admin created user");
    Ok(Json(user.summary()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AdminDeleteUserResponse {
    id: UserId,
    revoked_sessions: usize,
}

async fn admin_delete_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<AdminDeleteUserResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let user = state.store.delete_user(UserId(id)).await?;
    let revoked_sessions = state.sessions.revoke_user(user.id).await;

    info!(user = %user.id, revoked_sessions, "Admin deleted user");
    Ok(Json(AdminDeleteUserResponse {
        id: user.id,
        revoked_sessions,
    }))
}

async fn admin_issue_session(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<AdminSessionRequest>,
) -> Result<Json<AdminSessionResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    if state.store.user(req.user_id).await.is_none() {
        return Err(StoreError::NotFound.into());
    }
    let token = state.sessions.issue(req.user_id).await;

    info!(user = %req.user_id, "Admin issued session");
    Ok(Json(AdminSessionResponse { token }))
}

async fn admin_announce(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<AdminAnnounceRequest>,
) -> Result<Json<ChatMessageView>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let view = state.coordinator.announce(&req.text).await?;
    Ok(Json(view))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
