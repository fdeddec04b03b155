use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Extension, Query},
    http::{
        header::{HeaderName, AUTHORIZATION, CONTENT_TYPE},
        HeaderMap, HeaderValue, Method, Request, StatusCode,
    },
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use taskd_common::{
    ConfirmAck, ConfirmRequest, DispatchedTask, NewTask, ObservationRequest, Task, TaskId,
    TaskLog, UserTaskView,
};
use tokio::net::TcpListener;
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    Stream, StreamExt,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::Span;

use crate::{
    auth::bearer_token,
    calendar::{CalendarEvent, CalendarQuery},
    config::{CorsConfig, HttpConfig},
    ServiceError, TaskServer,
};

const PANEL_TOKEN_HEADER: HeaderName = HeaderName::from_static("x-panel-token");

#[derive(Clone)]
struct HttpState {
    server: Arc<TaskServer>,
}

impl HttpState {
    fn ensure_admin(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        if self.server.admin().validate(headers.get(AUTHORIZATION)) {
            return Ok(());
        }
        Err(ApiError::Unauthorized)
    }

    /// Store engines block, so service calls leave the async workers.
    async fn call<T, F>(&self, op: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&TaskServer) -> Result<T, ServiceError> + Send + 'static,
    {
        let server = Arc::clone(&self.server);
        tokio::task::spawn_blocking(move || op(&server))
            .await
            .map_err(ApiError::internal)?
            .map_err(ApiError::from)
    }
}

#[derive(Debug)]
enum ApiError {
    Unauthorized,
    Forbidden,
    BadRequest(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl ApiError {
    fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Internal(err.into())
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unauthorized => ApiError::Unauthorized,
            ServiceError::Forbidden => ApiError::Forbidden,
            ServiceError::BadRequest(reason) => ApiError::BadRequest(reason),
            ServiceError::NotFound(reason) => ApiError::NotFound(reason),
            ServiceError::Store(err) => ApiError::internal(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "unauthorized" })),
            )
                .into_response(),
            ApiError::Forbidden => {
                (StatusCode::FORBIDDEN, Json(json!({ "error": "forbidden" }))).into_response()
            }
            ApiError::BadRequest(reason) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": reason }))).into_response()
            }
            ApiError::NotFound(reason) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": reason }))).into_response()
            }
            ApiError::Internal(err) => {
                tracing::error!("HTTP transport error: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

/// Builds the full route table. `POST /api/tasks` only exists when admin
/// tokens are configured.
pub fn router(server: Arc<TaskServer>, cors: Option<&CorsConfig>) -> Router {
    let tasks_route = if server.admin().is_enabled() {
        get(fetch_tasks).post(enqueue_task)
    } else {
        get(fetch_tasks)
    };

    Router::new()
        .route("/api/tasks", tasks_route)
        .route("/api/confirm", post(confirm_task))
        .route("/api/notify_tasks", get(notify_tasks))
        .route("/api/calendar_events", get(calendar_events))
        .route("/api/task_logs", get(task_logs))
        .route("/api/add_observation", post(add_observation))
        .route("/api/stream", get(stream_events))
        .route("/health", get(health))
        .layer(Extension(HttpState { server }))
        .layer(build_cors_layer(cors))
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
}

/// Request span without the query string, which carries host tokens.
fn request_span(request: &Request<Body>) -> Span {
    tracing::debug_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
    )
}

pub async fn run_http_transport<F>(
    server: Arc<TaskServer>,
    config: HttpConfig,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let HttpConfig { host, port, cors } = config;

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid bind address {host}:{port}"))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind taskd HTTP server to {addr}"))?;

    serve_listener(listener, server, cors.as_ref(), shutdown).await
}

/// Serves on an already bound listener until `shutdown` resolves.
pub async fn serve_listener<F>(
    listener: TcpListener,
    server: Arc<TaskServer>,
    cors: Option<&CorsConfig>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("listener has no local address")?;
    tracing::info!("taskd HTTP server listening on {addr}");

    let make_service = router(server, cors).into_make_service();

    axum::serve(listener, make_service)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP transport encountered an unrecoverable error")?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct FetchQuery {
    host: Option<String>,
    token: Option<String>,
}

async fn fetch_tasks(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Query(query): Query<FetchQuery>,
) -> Result<Json<Vec<DispatchedTask>>, ApiError> {
    let host = query
        .host
        .ok_or_else(|| ApiError::BadRequest("missing host".into()))?;
    let token = query
        .token
        .or_else(|| bearer_token(headers.get(AUTHORIZATION)).map(str::to_string));

    let tasks = state
        .call(move |server| server.fetch_pending(&host, token.as_deref()))
        .await?;
    Ok(Json(tasks.iter().map(DispatchedTask::from).collect()))
}

async fn confirm_task(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Json(report): Json<ConfirmRequest>,
) -> Result<Json<ConfirmAck>, ApiError> {
    let bearer = bearer_token(headers.get(AUTHORIZATION)).map(str::to_string);
    let ack = state
        .call(move |server| server.confirm(&report, bearer.as_deref()))
        .await?;
    Ok(Json(ack))
}

#[derive(Debug, Deserialize)]
struct NotifyQuery {
    username: Option<String>,
}

async fn notify_tasks(
    Extension(state): Extension<HttpState>,
    Query(query): Query<NotifyQuery>,
) -> Result<Json<Vec<UserTaskView>>, ApiError> {
    let username = query.username.unwrap_or_default();
    let tasks = state
        .call(move |server| server.notify_tasks(&username))
        .await?;
    Ok(Json(tasks))
}

async fn calendar_events(
    Extension(state): Extension<HttpState>,
    Query(query): Query<CalendarQuery>,
) -> Result<Json<Vec<CalendarEvent>>, ApiError> {
    let events = state
        .call(move |server| server.calendar_events(&query))
        .await?;
    Ok(Json(events))
}

async fn enqueue_task(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Json(task): Json<NewTask>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    state.ensure_admin(&headers)?;
    let task = state.call(move |server| server.enqueue(task)).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Deserialize)]
struct TaskLogsQuery {
    task_id: Option<String>,
    username: Option<String>,
}

async fn task_logs(
    Extension(state): Extension<HttpState>,
    Query(query): Query<TaskLogsQuery>,
) -> Result<Json<Vec<TaskLog>>, ApiError> {
    let task_id = query
        .task_id
        .as_deref()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(TaskId)
        .ok_or_else(|| ApiError::BadRequest("task_id must be a number".into()))?;
    let username = query.username.unwrap_or_default();
    let logs = state
        .call(move |server| server.task_logs(task_id, &username))
        .await?;
    Ok(Json(logs))
}

#[derive(Debug, Deserialize)]
struct PanelQuery {
    token: Option<String>,
}

async fn add_observation(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Query(query): Query<PanelQuery>,
    Json(note): Json<ObservationRequest>,
) -> Result<Json<Value>, ApiError> {
    let token = headers
        .get(PANEL_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or(query.token);
    let entry = state
        .call(move |server| server.add_observation(&note, token.as_deref()))
        .await?;
    Ok(Json(json!({ "ok": true, "task_id": entry.task_id, "log_id": entry.id })))
}

async fn stream_events(
    Extension(state): Extension<HttpState>,
    Query(query): Query<NotifyQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let username = query
        .username
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing username".into()))?;

    let receiver = state.server.events().subscribe();
    let hello = tokio_stream::once(Ok::<Event, Infallible>(
        Event::default().event("hello").data(r#"{"ok":true}"#),
    ));

    let events = BroadcastStream::new(receiver).filter_map(move |event| match event {
        Ok(event) if event.username == username => match serde_json::to_string(&event.payload) {
            Ok(data) => Some(Ok::<Event, Infallible>(Event::default().event("task").data(data))),
            Err(err) => {
                tracing::error!("Failed to serialize SSE payload: {err}");
                None
            }
        },
        Ok(_) => None,
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!("SSE subscriber lagged by {skipped} events");
            None
        }
    });

    let keep_alive = KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("keep-alive");

    Ok(Sse::new(hello.chain(events)).keep_alive(keep_alive))
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn build_cors_layer(config: Option<&CorsConfig>) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE, PANEL_TOKEN_HEADER]);

    if let Some(cors) = config {
        let origins: Vec<HeaderValue> = cors
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        if !origins.is_empty() {
            return layer.allow_origin(AllowOrigin::list(origins));
        }
    }

    layer
}
