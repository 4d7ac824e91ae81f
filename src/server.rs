//! HTTP surface: message API, SSE streaming, and admin endpoints.
//!
//! ## Endpoints
//!
//! - `POST /api/messages` — send a message into a session
//! - `GET /api/sessions/{id}/messages` — paged history (`after_id`, `limit`)
//! - `GET /api/sessions/{id}/stream` — live SSE stream with catch-up replay
//! - `GET /api/admin/health` — queue and connection health
//! - `POST /api/admin/broadcast` — post a system notice (narrator/admin only)
//!
//! The optional `x-user-id` header carries the caller's identity for
//! permission checks; message sends additionally carry the sender identity
//! in the request body.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::{ChatError, Result};
use crate::ingress::ChatService;
use crate::message::{Message, SendRequest};
use crate::permissions::PermissionService;
use crate::queue::ResponseJobQueue;
use crate::store::MessageStore;
use crate::stream::{StreamBroker, StreamEvent};

/// Default page size for history reads.
const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Hard cap on one history page.
const MAX_HISTORY_LIMIT: usize = 100;

/// Page size for catch-up replay reads. The replay itself is unbounded: a
/// resuming stream pages through the backlog until it is exhausted.
const REPLAY_PAGE: usize = 500;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub store: Arc<dyn MessageStore>,
    pub broker: Arc<StreamBroker>,
    pub queue: Arc<ResponseJobQueue>,
    pub permissions: Arc<dyn PermissionService>,
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Query parameters for history reads.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Return messages with an id strictly greater than this.
    #[serde(default)]
    pub after_id: Option<i64>,
    /// Page size, capped at [`MAX_HISTORY_LIMIT`].
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Query parameters for the SSE stream.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Resume point; equivalent to the `Last-Event-ID` header.
    #[serde(default)]
    pub last_event_id: Option<i64>,
}

/// Body of `POST /api/admin/broadcast`.
#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub session_id: i64,
    pub content: String,
}

/// Body of `GET /api/admin/health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub queue_depth: usize,
    /// Live SSE subscriber counts keyed by session id.
    pub connections: std::collections::HashMap<i64, usize>,
}

/// JSON error body.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Wrapper mapping [`ChatError`] onto HTTP responses.
pub struct ApiError(ChatError);

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            ChatError::InvalidContent(_) => StatusCode::BAD_REQUEST,
            ChatError::DuplicateMessage { .. } => StatusCode::CONFLICT,
            ChatError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ChatError::Unauthorized(_) => StatusCode::FORBIDDEN,
            ChatError::Provider(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("internal error on request: {}", self.0);
        }

        let body = Json(ErrorBody {
            error: self.0.to_string(),
        });
        let mut response = (status, body).into_response();
        if let ChatError::RateLimited { retry_after } | ChatError::DuplicateMessage { retry_after } =
            self.0
        {
            let secs = retry_after.as_secs().max(1).to_string();
            if let Ok(value) = secs.parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

// ---------------------------------------------------------------------------
// ChatServer
// ---------------------------------------------------------------------------

/// The bound HTTP server, serving in a background task.
pub struct ChatServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl ChatServer {
    /// Bind `{config.host}:{config.port}` (port `0` auto-assigns) and begin
    /// serving in a background tokio task.
    pub async fn start(state: AppState, config: &ServerConfig) -> Result<Self> {
        let app = router(state);
        let bind_addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| ChatError::Config(format!("bind {bind_addr} failed: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| ChatError::Config(format!("local addr: {e}")))?;
        info!("chat server listening on http://{addr}");

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("chat server error: {e}");
            }
        });
        Ok(Self { addr, handle })
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Abort the server task.
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for ChatServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Build the application router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/messages", post(handle_send))
        .route("/api/sessions/{id}/messages", get(handle_history))
        .route("/api/sessions/{id}/stream", get(handle_stream))
        .route("/api/admin/health", get(handle_health))
        .route("/api/admin/broadcast", post(handle_broadcast))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// `POST /api/messages`
async fn handle_send(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> std::result::Result<Json<Message>, ApiError> {
    let allowed = state
        .permissions
        .can_access(request.sender_user_id.as_deref(), request.session_id)
        .await;
    if !allowed {
        return Err(ChatError::Unauthorized("no access to session".to_owned()).into());
    }
    let message = state.chat.send(request).await?;
    Ok(Json(message))
}

/// `GET /api/sessions/{id}/messages`
async fn handle_history(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> std::result::Result<Json<Vec<Message>>, ApiError> {
    let user = user_id(&headers);
    if !state.permissions.can_access(user.as_deref(), session_id).await {
        return Err(ChatError::Unauthorized("no access to session".to_owned()).into());
    }

    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let messages = state.store.messages_after(session_id, query.after_id, limit)?;
    Ok(Json(messages))
}

/// `GET /api/sessions/{id}/stream`
async fn handle_stream(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> std::result::Result<
    Sse<impl Stream<Item = std::result::Result<Event, std::convert::Infallible>>>,
    ApiError,
> {
    let user = user_id(&headers);
    if !state.permissions.can_access(user.as_deref(), session_id).await {
        return Err(ChatError::Unauthorized("no access to session".to_owned()).into());
    }

    let resume_from = query
        .last_event_id
        .or_else(|| last_event_id_header(&headers));

    // Subscribe before reading history: anything published during the
    // replay read lands in the live queue and is deduplicated below by id.
    let mut subscription = state.broker.subscribe(session_id);

    let stream = async_stream::stream! {
        let mut last_emitted: i64 = resume_from.unwrap_or(0);
        if resume_from.is_none() {
            yield Ok(sse_event(&StreamEvent::Connected));
        } else {
            // Page through every persisted message past the resume point;
            // a short page means the backlog is exhausted.
            loop {
                let page = match state
                    .store
                    .messages_after(session_id, Some(last_emitted), REPLAY_PAGE)
                {
                    Ok(page) => page,
                    Err(e) => {
                        warn!(session = session_id, "catch-up replay read failed: {e}");
                        break;
                    }
                };
                let exhausted = page.len() < REPLAY_PAGE;
                for message in page {
                    last_emitted = message.id;
                    yield Ok(sse_event(&StreamEvent::Message(message)));
                }
                if exhausted {
                    break;
                }
            }
        }
        while let Some(event) = subscription.recv().await {
            // Skip live events already covered by the replay.
            if let Some(id) = event.event_id() {
                if id <= last_emitted {
                    continue;
                }
                last_emitted = id;
            }
            yield Ok(sse_event(&event));
        }
    };
    Ok(Sse::new(stream))
}

/// `GET /api/admin/health`
async fn handle_health(State(state): State<AppState>) -> Response {
    let healthy = state.queue.is_healthy();
    let body = Json(HealthResponse {
        healthy,
        queue_depth: state.queue.depth(),
        connections: state.broker.connection_counts(),
    });
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, body).into_response()
}

/// `POST /api/admin/broadcast`
async fn handle_broadcast(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BroadcastRequest>,
) -> std::result::Result<Json<Message>, ApiError> {
    let user = user_id(&headers);
    let allowed = state
        .permissions
        .can_manage(user.as_deref(), request.session_id)
        .await;
    if !allowed {
        return Err(ChatError::Unauthorized("narrator access required".to_owned()).into());
    }
    let message = state
        .chat
        .broadcast_system(request.session_id, &request.content)
        .await?;
    Ok(Json(message))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn last_event_id_header(headers: &HeaderMap) -> Option<i64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn sse_event(event: &StreamEvent) -> Event {
    let mut out = Event::default().event(event.name()).data(event.data_json());
    if let Some(id) = event.event_id() {
        out = out.id(id.to_string());
    }
    out
}
