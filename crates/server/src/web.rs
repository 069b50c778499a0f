//! C6 Connection Gateway's HTTP half: every REST endpoint in §6, plus the
//! bidirectional stream upgrade route that hands off to `signaling`.
//! `LoginRateLimiter` and `security_headers` are carried over from the
//! precedent's `web.rs` unchanged; the rest is rebuilt around bearer tokens
//! issued by the Persistence Port instead of JWT, and sessions/files/mcp
//! servers instead of displays.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use forge_protocol::{
    CoreError, ErrorKind, ForgeConfig, LoginRequest, LoginResponse, McpConfigEntry, McpServerRecord,
    McpTransport, MessageRole, Session, User,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use uuid::Uuid;

use crate::db::Db;
use crate::sandbox::SandboxManager;
use crate::session::RuntimeTable;
use crate::signaling;
use crate::skills::SkillRegistry;
use crate::watcher::WatcherRegistry;
use crate::workspace;

/// Shared application state.
pub struct AppState {
    pub config: ForgeConfig,
    pub db: Db,
    pub sandbox: Arc<SandboxManager>,
    pub watchers: WatcherRegistry,
    pub skills: SkillRegistry,
    pub runtimes: RuntimeTable,
    pub login_limiter: LoginRateLimiter,
    pub started_at: std::time::Instant,
    pub metrics_logins_attempted: std::sync::atomic::AtomicU64,
    pub metrics_logins_failed: std::sync::atomic::AtomicU64,
    pub metrics_sessions_created: std::sync::atomic::AtomicU64,
}

/// Simple per-key rate limiter for login attempts.
/// Allows at most `max_attempts` in `window_secs`.
/// Bounded to prevent memory exhaustion from enumeration attacks.
/// Performs automatic TTL cleanup every `ttl_cleanup_interval` calls to `check()`.
pub struct LoginRateLimiter {
    attempts: std::sync::Mutex<std::collections::HashMap<String, Vec<std::time::Instant>>>,
    max_attempts: usize,
    window: std::time::Duration,
    /// Maximum number of unique keys to track (prevents unbounded growth)
    max_keys: usize,
    /// Counter for periodic TTL cleanup (every Nth call to check())
    call_count: std::sync::atomic::AtomicU64,
    /// Run TTL cleanup every this many calls to check()
    ttl_cleanup_interval: u64,
}

impl LoginRateLimiter {
    pub fn new(max_attempts: usize, window_secs: u64) -> Self {
        Self {
            attempts: std::sync::Mutex::new(std::collections::HashMap::new()),
            max_attempts,
            window: std::time::Duration::from_secs(window_secs),
            max_keys: 10_000,
            call_count: std::sync::atomic::AtomicU64::new(0),
            ttl_cleanup_interval: 100,
        }
    }

    /// Check if a login attempt from this key (IP or username) is allowed.
    /// Returns true if allowed, false if rate-limited.
    pub fn check(&self, key: &str) -> bool {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let now = std::time::Instant::now();

        let count = self
            .call_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if count.is_multiple_of(self.ttl_cleanup_interval) || attempts.len() > self.max_keys / 2 {
            attempts.retain(|_k, timestamps| {
                timestamps.retain(|t| now.duration_since(*t) < self.window);
                !timestamps.is_empty()
            });
        }

        if attempts.len() >= self.max_keys && !attempts.contains_key(key) {
            return false;
        }

        let entry = attempts.entry(key.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);

        if entry.len() >= self.max_attempts {
            return false;
        }

        entry.push(now);
        true
    }

    /// Clear rate limit entries for a key (e.g., after successful login).
    pub fn clear(&self, key: &str) {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.remove(key);
    }

    #[cfg(test)]
    fn key_count(&self) -> usize {
        let attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.len()
    }

    #[cfg(test)]
    fn with_cleanup_interval(mut self, interval: u64) -> Self {
        self.ttl_cleanup_interval = interval;
        self
    }
}

/// Middleware that adds security headers to every response.
async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert("x-xss-protection", HeaderValue::from_static("0"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static(
            "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; \
             connect-src 'self' wss: ws:; img-src 'self' data:; media-src 'self' blob:",
        ),
    );
    headers.insert(
        "permissions-policy",
        HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
    );

    response
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/me", get(me))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route(
            "/api/sessions/{id}",
            get(get_session).delete(delete_session).patch(rename_session),
        )
        .route("/api/sessions/{id}/fork", post(fork_session))
        .route(
            "/api/sessions/{id}/messages",
            get(list_messages).post(post_message),
        )
        .route("/api/sessions/{id}/stream", get(stream_upgrade))
        .route("/api/files", get(list_files))
        .route("/api/files/upload", post(upload_file))
        .route(
            "/api/files/{*path}",
            get(read_file).put(write_file).delete(delete_file),
        )
        .route("/api/files-preview/{*path}", get(preview_file))
        .route(
            "/api/mcp/servers",
            get(list_mcp_servers).post(upsert_mcp_server),
        )
        .route(
            "/api/mcp/servers/{name}",
            patch(patch_mcp_server).delete(delete_mcp_server),
        )
        .route("/api/admin/sessions", get(admin_list_sessions))
        .route("/api/health", get(health_check))
        .route("/api/health/detailed", get(health_check_detailed))
        .route("/metrics", get(metrics))
        .layer(RequestBodyLimitLayer::new(10 * 1024 * 1024)) // 10MB max request body (uploads)
        .with_state(Arc::clone(&state));

    let serve_dir = ServeDir::new(&state.config.server.web_root);

    api.fallback_service(serve_dir)
        .layer(axum::middleware::from_fn(security_headers))
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: Uuid,
}

/// Extract and validate a bearer token from the Authorization header or a
/// `token` query parameter (the latter needed for the stream upgrade, since
/// browsers cannot set custom headers on a WebSocket handshake), resolving
/// it against the Persistence Port.
async fn extract_user_from_headers(
    headers: &HeaderMap,
    query_token: Option<&str>,
    db: &Db,
) -> Result<User, (StatusCode, String)> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or(query_token)
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing token".to_string()))?;

    db.validate_token(token)
        .await
        .map_err(|e| {
            tracing::error!("token validation failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
        })?
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "invalid or expired token".to_string()))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn is_valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= 64
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

fn core_error_response(e: CoreError) -> axum::response::Response {
    let status = match e.kind() {
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    // §7/§8: a write conflict must surface the server's actual mtime as a
    // structured field, not just buried in the human-readable message.
    if let CoreError::Conflict { server_mtime } = &e {
        return (
            status,
            Json(json!({ "error": e.to_string(), "serverModified": server_mtime })),
        )
            .into_response();
    }
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

fn workspace_root(state: &AppState, session: &Session) -> std::path::PathBuf {
    std::path::PathBuf::from(&state.config.server.data_root)
        .join("workspaces")
        .join(&session.workspace_dir)
}

/// Bootstrap note written once at session creation (GLOSSARY "Session
/// workspace layout"), telling the agent where to stage intermediates vs.
/// final outputs. Best-effort: a write failure doesn't fail session create.
const AGENTS_BOOTSTRAP: &str = "\
# Working in this workspace

Put scratch files, downloads-in-progress, and other intermediates under
`.pi-work/`. Keep the rest of this directory for the final outputs you
want the user to see in the file tree.
";

fn write_agents_bootstrap(workspace_dir: &std::path::Path) {
    let path = workspace_dir.join("AGENTS.md");
    if !path.exists() {
        let _ = std::fs::write(&path, AGENTS_BOOTSTRAP);
    }
}

// --- auth --------------------------------------------------------------

#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
    display_name: String,
    password: String,
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    if !is_valid_username(&req.username) {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid username" }))).into_response();
    }
    if req.password.len() < 8 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "password must be at least 8 characters" })),
        )
            .into_response();
    }
    if state.db.user_by_username(&req.username).await.unwrap_or_default().is_some() {
        return (StatusCode::CONFLICT, Json(json!({ "error": "username taken" }))).into_response();
    }
    match state.db.create_user(&req.username, &req.display_name, &req.password).await {
        Ok(user) => (StatusCode::CREATED, Json(user)).into_response(),
        Err(e) => {
            tracing::error!("failed to create user: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response()
        }
    }
}

async fn login(State(state): State<Arc<AppState>>, Json(req): Json<LoginRequest>) -> impl IntoResponse {
    if !is_valid_username(&req.username) {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid username" }))).into_response();
    }

    state
        .metrics_logins_attempted
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    if !state.login_limiter.check(&req.username) {
        tracing::warn!(username = %req.username, "login rate limited");
        state
            .metrics_logins_failed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "too many login attempts, try again later" })),
        )
            .into_response();
    }

    let user = match state.db.authenticate(&req.username, &req.password).await {
        Ok(Some(u)) => u,
        Ok(None) => {
            state
                .metrics_logins_failed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid credentials" }))).into_response();
        }
        Err(e) => {
            tracing::error!("authentication failed: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response();
        }
    };
    state.login_limiter.clear(&req.username);

    let token = match state.db.create_token(user.id).await {
        Ok(t) => t,
        Err(e) => {
            tracing::error!("failed to issue token: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response();
        }
    };

    tracing::info!(target: "audit", event = "login_success", username = %user.username, "user logged in");
    Json(LoginResponse {
        token,
        user_id: user.id,
        username: user.username,
    })
    .into_response()
}

async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return StatusCode::NO_CONTENT.into_response();
    };
    if let Err(e) = state.db.revoke_token(&token).await {
        tracing::error!("failed to revoke token: {e}");
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    match extract_user_from_headers(&headers, query.token.as_deref(), &state.db).await {
        Ok(user) => Json(user).into_response(),
        Err((status, msg)) => (status, Json(json!({ "error": msg }))).into_response(),
    }
}

// --- sessions ------------------------------------------------------------

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    let user = match extract_user_from_headers(&headers, query.token.as_deref(), &state.db).await {
        Ok(u) => u,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };
    match state.db.list_sessions(Some(user.id)).await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => {
            tracing::error!("failed to list sessions: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response()
        }
    }
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    name: String,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(req): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    let user = match extract_user_from_headers(&headers, query.token.as_deref(), &state.db).await {
        Ok(u) => u,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };
    let id = Uuid::new_v4();
    match state.db.create_session(id, Some(user.id), &req.name).await {
        Ok(session) => {
            let root = workspace_root(&state, &session);
            std::fs::create_dir_all(&root).ok();
            write_agents_bootstrap(&root);
            sync_mcp_config(&state, &session).await;
            state
                .metrics_sessions_created
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            (StatusCode::CREATED, Json(session)).into_response()
        }
        Err(e) => {
            tracing::error!("failed to create session: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response()
        }
    }
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    let user = match extract_user_from_headers(&headers, query.token.as_deref(), &state.db).await {
        Ok(u) => u,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };
    match state.db.get_session(id, Some(user.id)).await {
        Ok(Some(session)) => Json(session).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({ "error": "session not found" }))).into_response(),
        Err(e) => {
            tracing::error!("failed to fetch session: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response()
        }
    }
}

#[derive(Deserialize)]
struct RenameRequest {
    name: String,
}

async fn rename_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(req): Json<RenameRequest>,
) -> impl IntoResponse {
    let user = match extract_user_from_headers(&headers, query.token.as_deref(), &state.db).await {
        Ok(u) => u,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };
    match state.db.rename_session(id, Some(user.id), &req.name).await {
        Ok(true) => StatusCode::OK.into_response(),
        Ok(false) => (StatusCode::NOT_FOUND, Json(json!({ "error": "session not found" }))).into_response(),
        Err(e) => {
            tracing::error!("failed to rename session: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response()
        }
    }
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    let user = match extract_user_from_headers(&headers, query.token.as_deref(), &state.db).await {
        Ok(u) => u,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };
    let session = match state.db.get_session(id, Some(user.id)).await {
        Ok(Some(s)) => s,
        Ok(None) => return (StatusCode::NOT_FOUND, Json(json!({ "error": "session not found" }))).into_response(),
        Err(e) => {
            tracing::error!("failed to fetch session: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response();
        }
    };

    state.runtimes.dispose(id).await;
    let root = workspace_root(&state, &session);
    state.watchers.stop(&root).await;

    match state.db.delete_session(id, Some(user.id)).await {
        Ok(true) => {
            std::fs::remove_dir_all(&root).ok();
            tracing::info!(target: "audit", event = "session_deleted", session_id = %id, "session deleted");
            StatusCode::OK.into_response()
        }
        Ok(false) => (StatusCode::NOT_FOUND, Json(json!({ "error": "session not found" }))).into_response(),
        Err(e) => {
            tracing::error!("failed to delete session: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response()
        }
    }
}

#[derive(Deserialize)]
struct ForkRequest {
    name: String,
}

async fn fork_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(req): Json<ForkRequest>,
) -> impl IntoResponse {
    let user = match extract_user_from_headers(&headers, query.token.as_deref(), &state.db).await {
        Ok(u) => u,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };
    let source = match state.db.get_session(id, Some(user.id)).await {
        Ok(Some(s)) => s,
        Ok(None) => return (StatusCode::NOT_FOUND, Json(json!({ "error": "session not found" }))).into_response(),
        Err(e) => {
            tracing::error!("failed to fetch session: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response();
        }
    };
    let new_id = Uuid::new_v4();
    match state.db.fork_session(id, new_id, &req.name, Some(user.id)).await {
        Ok(Some(forked)) => {
            let src_root = workspace_root(&state, &source);
            let dst_root = workspace_root(&state, &forked);
            if let Err(e) = copy_dir_recursive(&src_root, &dst_root) {
                tracing::warn!(%new_id, "failed to copy workspace on fork: {e}");
            }
            (StatusCode::CREATED, Json(forked)).into_response()
        }
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({ "error": "session not found" }))).into_response(),
        Err(e) => {
            tracing::error!("failed to fork session: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response()
        }
    }
}

fn copy_dir_recursive(src: &std::path::Path, dst: &std::path::Path) -> std::io::Result<()> {
    if !src.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let dst_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dst_path)?;
        } else {
            std::fs::copy(entry.path(), dst_path)?;
        }
    }
    Ok(())
}

// --- messages ------------------------------------------------------------

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    let user = match extract_user_from_headers(&headers, query.token.as_deref(), &state.db).await {
        Ok(u) => u,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };
    match state.db.list_messages(id, Some(user.id)).await {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => {
            tracing::error!("failed to list messages: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response()
        }
    }
}

#[derive(Deserialize)]
struct PostMessageRequest {
    content: String,
}

/// Append a message out-of-band of the live stream (e.g. a client replaying
/// history). Does not drive the agent — that only happens over
/// `/api/sessions/{id}/stream`.
async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(req): Json<PostMessageRequest>,
) -> impl IntoResponse {
    let user = match extract_user_from_headers(&headers, query.token.as_deref(), &state.db).await {
        Ok(u) => u,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };
    if state.db.get_session(id, Some(user.id)).await.ok().flatten().is_none() {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "session not found" }))).into_response();
    }
    match state
        .db
        .append_message(id, MessageRole::User, &req.content, workspace::now_secs())
        .await
    {
        Ok(message) => (StatusCode::CREATED, Json(message)).into_response(),
        Err(e) => {
            tracing::error!("failed to append message: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response()
        }
    }
}

// --- bidirectional stream --------------------------------------------------

async fn stream_upgrade(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let user = match extract_user_from_headers(&headers, query.token.as_deref(), &state.db).await {
        Ok(u) => u,
        Err((status, msg)) => return (status, msg).into_response(),
    };
    let session = match state.db.get_session(id, Some(user.id)).await {
        Ok(Some(s)) => s,
        Ok(None) => return (StatusCode::NOT_FOUND, "session not found").into_response(),
        Err(e) => {
            tracing::error!("failed to fetch session: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response();
        }
    };

    ws.max_message_size(1024 * 1024)
        .on_upgrade(move |socket| {
            signaling::handle_session_ws(socket, id, session.workspace_dir, Some(user.id), state)
        })
        .into_response()
}

// --- files -----------------------------------------------------------------

async fn session_workspace_for_request(
    state: &AppState,
    headers: &HeaderMap,
    query_token: Option<&str>,
    session_id: Uuid,
) -> Result<std::path::PathBuf, (StatusCode, String)> {
    let user = extract_user_from_headers(headers, query_token, &state.db).await?;
    let session = state
        .db
        .get_session(session_id, Some(user.id))
        .await
        .map_err(|e| {
            tracing::error!("failed to fetch session: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
        })?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "session not found".to_string()))?;
    Ok(workspace_root(state, &session))
}

#[derive(Deserialize)]
struct FilesQuery {
    #[serde(rename = "sessionId")]
    session_id: Uuid,
    token: Option<String>,
}

async fn list_files(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<FilesQuery>,
) -> impl IntoResponse {
    let root = match session_workspace_for_request(&state, &headers, query.token.as_deref(), query.session_id).await
    {
        Ok(r) => r,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };
    match workspace::tree(&root) {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => core_error_response(e),
    }
}

async fn read_file(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> impl IntoResponse {
    let root = match session_workspace_for_request(&state, &headers, None, query.session_id).await {
        Ok(r) => r,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };
    match workspace::read(&root, &path) {
        Ok(bytes) => bytes.into_response(),
        Err(e) => core_error_response(e),
    }
}

#[derive(Deserialize)]
struct WriteFileRequest {
    content: String,
    #[serde(rename = "expectedMtime")]
    expected_mtime: Option<i64>,
}

async fn write_file(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
    Json(req): Json<WriteFileRequest>,
) -> impl IntoResponse {
    let root = match session_workspace_for_request(&state, &headers, None, query.session_id).await {
        Ok(r) => r,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };
    match workspace::write(&root, &path, req.content.as_bytes(), req.expected_mtime) {
        Ok(mtime) => Json(json!({ "mtime": mtime })).into_response(),
        Err(e) => core_error_response(e),
    }
}

async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> impl IntoResponse {
    let root = match session_workspace_for_request(&state, &headers, None, query.session_id).await {
        Ok(r) => r,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };
    match workspace::delete(&root, &path) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => core_error_response(e),
    }
}

async fn preview_file(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> impl IntoResponse {
    let root = match session_workspace_for_request(&state, &headers, None, query.session_id).await {
        Ok(r) => r,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };
    match workspace::preview(&root, &path) {
        Ok(preview) => Json(preview).into_response(),
        Err(e) => core_error_response(e),
    }
}

async fn upload_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let mut session_id: Option<Uuid> = None;
    let mut subdir: Option<String> = None;
    let mut uploaded = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response(),
        };
        match field.name() {
            Some("sessionId") => {
                let text = field.text().await.unwrap_or_default();
                session_id = Uuid::parse_str(&text).ok();
            }
            Some("subdir") => {
                subdir = field.text().await.ok();
            }
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload.bin").to_string();
                let bytes = match field.bytes().await {
                    Ok(b) => b,
                    Err(e) => {
                        return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response();
                    }
                };
                uploaded.push((filename, bytes));
            }
            _ => {}
        }
    }

    let Some(session_id) = session_id else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "missing sessionId field" }))).into_response();
    };
    let root = match session_workspace_for_request(&state, &headers, None, session_id).await {
        Ok(r) => r,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };

    let mut written = Vec::new();
    for (filename, bytes) in uploaded {
        let rel = workspace::upload_destination(subdir.as_deref(), &filename);
        match workspace::write(&root, &rel, &bytes, None) {
            Ok(mtime) => written.push(json!({ "path": rel, "mtime": mtime })),
            Err(e) => return core_error_response(e),
        }
    }
    Json(json!({ "files": written })).into_response()
}

// --- mcp servers -----------------------------------------------------------

async fn list_mcp_servers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    if let Err((status, msg)) = extract_user_from_headers(&headers, query.token.as_deref(), &state.db).await {
        return (status, Json(json!({ "error": msg }))).into_response();
    }
    match state.db.list_mcp_servers().await {
        Ok(servers) => Json(servers).into_response(),
        Err(e) => {
            tracing::error!("failed to list mcp servers: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response()
        }
    }
}

#[derive(Deserialize)]
struct McpServerRequest {
    name: String,
    transport: McpTransport,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    env: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    headers: std::collections::BTreeMap<String, String>,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

async fn upsert_mcp_server(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(req): Json<McpServerRequest>,
) -> impl IntoResponse {
    if let Err((status, msg)) = extract_user_from_headers(&headers, query.token.as_deref(), &state.db).await {
        return (status, Json(json!({ "error": msg }))).into_response();
    }
    let record = McpServerRecord {
        name: req.name,
        transport: req.transport,
        command: req.command,
        args: req.args,
        url: req.url,
        env: req.env,
        headers: req.headers,
        enabled: req.enabled,
        created_at: workspace::now_secs(),
    };
    match state.db.upsert_mcp_server(&record).await {
        Ok(()) => {
            sync_mcp_config_all(&state).await;
            (StatusCode::OK, Json(record)).into_response()
        }
        Err(e) => {
            tracing::error!("failed to upsert mcp server: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response()
        }
    }
}

#[derive(Deserialize)]
struct McpPatchRequest {
    enabled: bool,
}

async fn patch_mcp_server(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(req): Json<McpPatchRequest>,
) -> impl IntoResponse {
    if let Err((status, msg)) = extract_user_from_headers(&headers, query.token.as_deref(), &state.db).await {
        return (status, Json(json!({ "error": msg }))).into_response();
    }
    let servers = match state.db.list_mcp_servers().await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("failed to list mcp servers: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response();
        }
    };
    let Some(mut record) = servers.into_iter().find(|s| s.name == name) else {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "mcp server not found" }))).into_response();
    };
    record.enabled = req.enabled;
    match state.db.upsert_mcp_server(&record).await {
        Ok(()) => {
            sync_mcp_config_all(&state).await;
            Json(record).into_response()
        }
        Err(e) => {
            tracing::error!("failed to update mcp server: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response()
        }
    }
}

async fn delete_mcp_server(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    if let Err((status, msg)) = extract_user_from_headers(&headers, query.token.as_deref(), &state.db).await {
        return (status, Json(json!({ "error": msg }))).into_response();
    }
    match state.db.delete_mcp_server(&name).await {
        Ok(true) => {
            sync_mcp_config_all(&state).await;
            StatusCode::OK.into_response()
        }
        Ok(false) => (StatusCode::NOT_FOUND, Json(json!({ "error": "mcp server not found" }))).into_response(),
        Err(e) => {
            tracing::error!("failed to delete mcp server: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response()
        }
    }
}

/// Regenerate `{workspace}/.pi/mcp.json` for one session from the enabled
/// server set. MCP servers are process-global (not per-session), so every
/// workspace shares the same config contents.
async fn sync_mcp_config(state: &AppState, session: &Session) {
    let Ok(servers) = state.db.list_mcp_servers().await else {
        return;
    };
    let mut entries = std::collections::BTreeMap::new();
    for server in servers.iter().filter(|s| s.enabled) {
        entries.insert(server.name.clone(), McpConfigEntry::from(server));
    }
    let blob = forge_protocol::McpConfigBlob { servers: entries };
    let root = workspace_root(state, session);
    let dir = root.join(".pi");
    if std::fs::create_dir_all(&dir).is_ok()
        && let Ok(json) = serde_json::to_vec_pretty(&blob)
    {
        let _ = std::fs::write(dir.join("mcp.json"), json);
    }
}

/// Refresh every active session's mcp.json after a server is added, edited,
/// or removed.
async fn sync_mcp_config_all(state: &AppState) {
    let Ok(sessions) = state.db.list_sessions(None).await else {
        return;
    };
    for summary in sessions {
        sync_mcp_config(state, &summary.session).await;
    }
}

/// Read back `{workspace}/.pi/mcp.json`, the counterpart to
/// [`sync_mcp_config`]'s writeConfig. Used by callers (and tests) that need
/// to confirm what the agent will actually see, not just what's enabled in
/// the database. A missing file reads as an empty blob.
fn read_mcp_config(workspace_root: &std::path::Path) -> forge_protocol::McpConfigBlob {
    let path = workspace_root.join(".pi").join("mcp.json");
    std::fs::read(&path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or(forge_protocol::McpConfigBlob {
            servers: std::collections::BTreeMap::new(),
        })
}

// --- admin -----------------------------------------------------------------

fn is_admin(state: &AppState, username: &str) -> bool {
    state.config.server.admin_users.iter().any(|u| u == username)
}

async fn admin_list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    let user = match extract_user_from_headers(&headers, query.token.as_deref(), &state.db).await {
        Ok(u) => u,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };
    if !is_admin(&state, &user.username) {
        return (StatusCode::FORBIDDEN, Json(json!({ "error": "admin access required" }))).into_response();
    }
    match state.db.list_sessions(None).await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => {
            tracing::error!("failed to list sessions for admin: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" }))).into_response()
        }
    }
}

// --- health and metrics ------------------------------------------------

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn health_check_detailed(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if state.config.server.metrics_require_auth && bearer_token(&headers).is_none() {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "missing token" }))).into_response();
    }
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "sandbox_available": state.sandbox.is_enabled(),
    }))
    .into_response()
}

async fn metrics(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if state.config.server.metrics_require_auth && bearer_token(&headers).is_none() {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    let uptime_secs = state.started_at.elapsed().as_secs();
    let logins_attempted = state
        .metrics_logins_attempted
        .load(std::sync::atomic::Ordering::Relaxed);
    let logins_failed = state
        .metrics_logins_failed
        .load(std::sync::atomic::Ordering::Relaxed);
    let sessions_created = state
        .metrics_sessions_created
        .load(std::sync::atomic::Ordering::Relaxed);

    let body = format!(
        "# HELP forge_uptime_seconds Server uptime in seconds\n\
         # TYPE forge_uptime_seconds gauge\n\
         forge_uptime_seconds {uptime_secs}\n\
         \n\
         # HELP forge_total_logins_attempted Total login attempts\n\
         # TYPE forge_total_logins_attempted counter\n\
         forge_total_logins_attempted {logins_attempted}\n\
         \n\
         # HELP forge_total_logins_failed Total failed login attempts\n\
         # TYPE forge_total_logins_failed counter\n\
         forge_total_logins_failed {logins_failed}\n\
         \n\
         # HELP forge_sessions_created_total Total sessions created\n\
         # TYPE forge_sessions_created_total counter\n\
         forge_sessions_created_total {sessions_created}\n"
    );

    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_allows_under_limit() {
        let limiter = LoginRateLimiter::new(3, 60);
        assert!(limiter.check("user1"));
        assert!(limiter.check("user1"));
        assert!(limiter.check("user1"));
    }

    #[test]
    fn rate_limiter_blocks_over_limit() {
        let limiter = LoginRateLimiter::new(3, 60);
        assert!(limiter.check("user1"));
        assert!(limiter.check("user1"));
        assert!(limiter.check("user1"));
        assert!(!limiter.check("user1"));
    }

    #[test]
    fn rate_limiter_independent_per_key() {
        let limiter = LoginRateLimiter::new(2, 60);
        assert!(limiter.check("user1"));
        assert!(limiter.check("user1"));
        assert!(!limiter.check("user1"));
        assert!(limiter.check("user2"));
        assert!(limiter.check("user2"));
    }

    #[test]
    fn rate_limiter_ttl_cleanup_removes_expired_entries() {
        let limiter = LoginRateLimiter::new(5, 0).with_cleanup_interval(1);
        for i in 0..50 {
            limiter.check(&format!("attacker-{i}"));
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
        limiter.check("trigger-cleanup");
        assert_eq!(limiter.key_count(), 1);
    }

    #[test]
    fn username_validation_rejects_bad_input() {
        assert!(!is_valid_username(""));
        assert!(!is_valid_username("user name"));
        assert!(!is_valid_username("user@host"));
        assert!(!is_valid_username(&"a".repeat(65)));
    }

    #[test]
    fn username_validation_accepts_valid() {
        assert!(is_valid_username("alice"));
        assert!(is_valid_username("bob_smith"));
        assert!(is_valid_username("user-123"));
    }

    #[test]
    fn mcp_config_write_then_read_contains_enabled_and_omits_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let enabled = McpServerRecord {
            name: "search".into(),
            transport: McpTransport::Stdio,
            command: Some("mcp-search".into()),
            args: vec![],
            url: None,
            env: Default::default(),
            headers: Default::default(),
            enabled: true,
            created_at: 0,
        };
        let disabled = McpServerRecord {
            name: "shelved".into(),
            transport: McpTransport::Stdio,
            command: Some("mcp-shelved".into()),
            args: vec![],
            url: None,
            env: Default::default(),
            headers: Default::default(),
            enabled: false,
            created_at: 0,
        };
        let mut entries = std::collections::BTreeMap::new();
        entries.insert(enabled.name.clone(), McpConfigEntry::from(&enabled));
        let blob = forge_protocol::McpConfigBlob { servers: entries };
        let pi_dir = dir.path().join(".pi");
        std::fs::create_dir_all(&pi_dir).unwrap();
        std::fs::write(pi_dir.join("mcp.json"), serde_json::to_vec(&blob).unwrap()).unwrap();

        let read_back = read_mcp_config(dir.path());
        assert!(read_back.servers.contains_key(&enabled.name));
        assert!(!read_back.servers.contains_key(&disabled.name));
    }

    #[test]
    fn mcp_config_read_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let read_back = read_mcp_config(dir.path());
        assert!(read_back.servers.is_empty());
    }

    // --- HTTP-level integration tests ---

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_app_state() -> Arc<AppState> {
        let config: ForgeConfig = toml::from_str("").expect("default config");
        let db = Db::connect(std::path::Path::new(":memory:")).await.unwrap();
        let sandbox_config = config.sandbox.clone();
        Arc::new(AppState {
            config,
            db,
            sandbox: Arc::new(SandboxManager::new(sandbox_config)),
            watchers: WatcherRegistry::new(),
            skills: SkillRegistry::load(std::path::Path::new("/nonexistent")),
            runtimes: RuntimeTable::new(
                Arc::new(SandboxManager::new(forge_protocol::SandboxConfig {
                    enabled: false,
                    ..Default::default()
                })),
                Arc::new(crate::agent::StubAgentFactory),
            ),
            login_limiter: LoginRateLimiter::new(5, 60),
            started_at: std::time::Instant::now(),
            metrics_logins_attempted: std::sync::atomic::AtomicU64::new(0),
            metrics_logins_failed: std::sync::atomic::AtomicU64::new(0),
            metrics_sessions_created: std::sync::atomic::AtomicU64::new(0),
        })
    }

    async fn body_json(response: axum::response::Response<Body>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok_unauthenticated() {
        let state = test_app_state().await;
        let app = build_router(state);
        let request = Request::builder().uri("/api/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn sessions_require_auth() {
        let state = test_app_state().await;
        let app = build_router(state);
        let request = Request::builder().uri("/api/sessions").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn register_then_login_roundtrip() {
        let state = test_app_state().await;
        let app = build_router(Arc::clone(&state));

        let body = json!({ "username": "alice", "display_name": "Alice", "password": "hunter2pass" });
        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/register")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let login_body = json!({ "username": "alice", "password": "hunter2pass" });
        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&login_body).unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["username"], "alice");
        assert!(json["token"].is_string());
    }

    #[tokio::test]
    async fn login_rejects_bad_credentials() {
        let state = test_app_state().await;
        let app = build_router(state);
        let body = json!({ "username": "nobody", "password": "whatever1" });
        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let state = test_app_state().await;
        let app = build_router(state);
        let request = Request::builder().uri("/api/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let headers = response.headers();
        assert_eq!(
            headers.get("strict-transport-security").map(|v| v.as_bytes()),
            Some(b"max-age=63072000; includeSubDomains".as_slice())
        );
        assert_eq!(headers.get("x-frame-options").map(|v| v.as_bytes()), Some(b"DENY".as_slice()));
    }

    #[tokio::test]
    async fn metrics_requires_auth_when_configured() {
        let state = test_app_state().await;
        assert!(state.config.server.metrics_require_auth);
        let app = build_router(state);
        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn session_not_found_for_foreign_owner_not_forbidden() {
        // Ownership-leak prevention (§7): a session that exists but belongs
        // to someone else reads back as 404, never 403.
        let state = test_app_state().await;
        let alice = state.db.create_user("alice", "Alice", "password1").await.unwrap();
        let bob = state.db.create_user("bob", "Bob", "password1").await.unwrap();
        let session = state.db.create_session(Uuid::new_v4(), Some(alice.id), "s1").await.unwrap();
        let bob_token = state.db.create_token(bob.id).await.unwrap();

        let app = build_router(Arc::clone(&state));
        let request = Request::builder()
            .uri(format!("/api/sessions/{}", session.id))
            .header("authorization", format!("Bearer {bob_token}"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn write_file_stale_mtime_returns_conflict_with_server_modified() {
        // §7/§8: PUT /api/files/a.txt with a stale expectedMtime returns 409
        // and a serverModified field the client can use to recover.
        let state = test_app_state().await;
        let alice = state.db.create_user("alice", "Alice", "password1").await.unwrap();
        let token = state.db.create_token(alice.id).await.unwrap();
        let session = state
            .db
            .create_session(Uuid::new_v4(), Some(alice.id), "s1")
            .await
            .unwrap();

        let root = workspace_root(&state, &session);
        std::fs::create_dir_all(&root).unwrap();
        let actual_mtime = workspace::write(&root, "a.txt", b"original", None).unwrap();

        let app = build_router(Arc::clone(&state));
        let body = json!({ "content": "changed", "expectedMtime": actual_mtime - 1 });
        let request = Request::builder()
            .method("PUT")
            .uri(format!("/api/files/a.txt?sessionId={}", session.id))
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = body_json(response).await;
        assert_eq!(json["serverModified"], actual_mtime);
        assert!(json["error"].as_str().unwrap().contains(&actual_mtime.to_string()));

        // The file content is left untouched by a rejected write.
        assert_eq!(std::fs::read(root.join("a.txt")).unwrap(), b"original");
    }
}
