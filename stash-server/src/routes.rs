//! HTTP route handlers for the JSON API.

use std::path::PathBuf;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use stash::bus::EventFilter;
use stash::core::types::{
    Conversation, Event, Message, MessagePage, NewMessage, Project, Role, Run, RunMode, RunStep,
};
use stash::io::store::ConversationUpdate;
use tracing::info;

use crate::error::ApiResult;
use crate::sse;
use crate::state::AppState;

const DEFAULT_MESSAGE_PAGE: usize = 100;
const DEFAULT_EVENT_PAGE: usize = 200;

/// Full application router: JSON API under `/api`, SSE under `/events/stream`.
pub fn app(state: AppState) -> Router {
    Router::new()
        .nest("/api", api_router())
        .route("/events/stream", get(sse::events_handler))
        .with_state(state)
}

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/projects", post(open_project))
        .route("/projects/{id}", get(get_project))
        .route(
            "/projects/{id}/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route(
            "/conversations/{id}",
            get(get_conversation).patch(update_conversation),
        )
        .route(
            "/conversations/{id}/messages",
            get(list_messages).post(post_message),
        )
        .route("/conversations/{id}/fork", post(fork_conversation))
        .route("/messages/{id}/retry", post(retry_message))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/events", get(list_events))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct OpenProjectRequest {
    name: Option<String>,
    root_path: PathBuf,
}

/// POST /api/projects - open (or reopen) a project by root folder.
async fn open_project(
    State(state): State<AppState>,
    Json(req): Json<OpenProjectRequest>,
) -> ApiResult<Json<Project>> {
    let project = state
        .store
        .open_project(req.name.as_deref(), &req.root_path)?;
    Ok(Json(project))
}

async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Project>> {
    Ok(Json(state.store.get_project(&project_id)?))
}

#[derive(Deserialize)]
struct ListConversationsQuery {
    #[serde(default)]
    include_archived: bool,
}

async fn list_conversations(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<ListConversationsQuery>,
) -> ApiResult<Json<Vec<Conversation>>> {
    let conversations = state
        .store
        .list_conversations(&project_id, query.include_archived)?;
    Ok(Json(conversations))
}

#[derive(Deserialize)]
struct CreateConversationRequest {
    title: String,
}

async fn create_conversation(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(req): Json<CreateConversationRequest>,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    let conversation = state.store.create_conversation(&project_id, &req.title)?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<Conversation>> {
    Ok(Json(state.store.get_conversation(&conversation_id)?))
}

async fn update_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(update): Json<ConversationUpdate>,
) -> ApiResult<Json<Conversation>> {
    Ok(Json(
        state.store.update_conversation(&conversation_id, &update)?,
    ))
}

#[derive(Deserialize)]
struct PostMessageRequest {
    #[serde(flatten)]
    message: NewMessage,
    mode: Option<RunMode>,
    /// Defaults to true for user messages.
    start_run: Option<bool>,
}

#[derive(Debug, Serialize)]
struct PostMessageResponse {
    message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<String>,
    /// Status of the bound run, or `recorded` when no run is attached.
    status: String,
}

impl PostMessageResponse {
    fn new(message: &Message, run: Option<&Run>) -> Self {
        Self {
            message_id: message.id.clone(),
            run_id: run.map(|r| r.id.clone()),
            status: run.map_or_else(|| "recorded".to_string(), |r| r.status.to_string()),
        }
    }
}

/// POST /api/conversations/:id/messages - append a message, optionally starting a run.
///
/// Replaying an idempotency key returns the original message and whatever
/// run it triggered instead of starting another one.
async fn post_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(req): Json<PostMessageRequest>,
) -> ApiResult<(StatusCode, Json<PostMessageResponse>)> {
    let start_run = req
        .start_run
        .unwrap_or(req.message.role() == Role::User);
    let (message, created) = state.store.append_message(&conversation_id, req.message)?;
    if !created {
        let run = state.store.latest_run_for_message(&message.id)?;
        info!(message_id = %message.id, "idempotent message replay");
        return Ok((
            StatusCode::OK,
            Json(PostMessageResponse::new(&message, run.as_ref())),
        ));
    }

    let run = if start_run {
        let mode = req.mode.unwrap_or(RunMode::Manual);
        Some(state.engine.start_run(&conversation_id, &message.id, mode)?)
    } else {
        None
    };
    Ok((
        StatusCode::CREATED,
        Json(PostMessageResponse::new(&message, run.as_ref())),
    ))
}

#[derive(Deserialize)]
struct ListMessagesQuery {
    cursor: Option<i64>,
    limit: Option<usize>,
}

async fn list_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<ListMessagesQuery>,
) -> ApiResult<Json<MessagePage>> {
    let page = state.store.list_messages(
        &conversation_id,
        query.cursor,
        query.limit.unwrap_or(DEFAULT_MESSAGE_PAGE),
    )?;
    Ok(Json(page))
}

#[derive(Deserialize)]
struct ForkRequest {
    from_message_id: String,
    title: Option<String>,
}

async fn fork_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(req): Json<ForkRequest>,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    let fork = state.store.fork_conversation(
        &conversation_id,
        &req.from_message_id,
        req.title.as_deref(),
    )?;
    Ok((StatusCode::CREATED, Json(fork)))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RetryRequest {
    mode: Option<RunMode>,
}

async fn retry_message(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    body: Option<Json<RetryRequest>>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    let Json(req) = body.unwrap_or_default();
    let run = state
        .engine
        .retry_from_message(&message_id, req.mode.unwrap_or(RunMode::Manual))?;
    Ok((StatusCode::CREATED, Json(run)))
}

#[derive(Serialize)]
struct RunDetail {
    run: Run,
    steps: Vec<RunStep>,
}

/// GET /api/runs/:id - run record plus its steps.
async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunDetail>> {
    let run = state.store.get_run(&run_id)?;
    let steps = state.store.run_steps(&run_id)?;
    Ok(Json(RunDetail { run, steps }))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Run>> {
    Ok(Json(state.engine.cancel_run(&run_id)?))
}

#[derive(Deserialize)]
struct ListEventsQuery {
    project_id: String,
    conversation_id: Option<String>,
    after: Option<i64>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct EventPage {
    events: Vec<Event>,
    /// Cursor to pass as `after` for the next page.
    next_after: i64,
}

/// GET /api/events - replay recorded events after a cursor.
async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> ApiResult<Json<EventPage>> {
    let filter = EventFilter {
        project_id: query.project_id,
        conversation_id: query.conversation_id,
    };
    let after = query.after.unwrap_or(0);
    let events = state.store.list_events(
        &filter,
        Some(after),
        query.limit.unwrap_or(DEFAULT_EVENT_PAGE),
    )?;
    let next_after = events.last().map_or(after, |e| e.seq);
    Ok(Json(EventPage { events, next_after }))
}
