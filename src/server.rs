use std::sync::{Arc, Mutex};

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post, put},
    Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    attachments::{Attachment, AttachmentError, AttachmentList},
    bus::EventBus,
    chat::Session,
    grouping::{group_chats_by_date, DateBucket},
    session_store::SessionStore,
};

/// Files shown in the chat composer.
const COMPOSER_FILES: usize = 6;

pub struct AppState {
    pub store: Arc<SessionStore>,
    pub bus: Arc<EventBus>,
    pub attachments: Mutex<AttachmentList>,
}

impl AppState {
    pub fn new(store: Arc<SessionStore>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            attachments: Mutex::new(AttachmentList::new()),
        }
    }
}

type ApiResult<T> = Result<T, (StatusCode, String)>;

#[derive(Debug, Serialize)]
pub struct ChatGroup {
    pub bucket: DateBucket,
    pub chats: Vec<Session>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateChat {
    pub preset: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SendBody {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct AddFiles {
    pub files: Vec<Attachment>,
    #[serde(default)]
    pub in_chat: bool,
}

#[derive(Debug, Serialize)]
pub struct FilesBody {
    pub files: Vec<Attachment>,
    pub composer: Vec<Attachment>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/hello", get(hello))
        .route("/api/chats", get(list_chats).post(create_chat))
        .route("/api/chats/:id", get(open_chat).delete(delete_chat))
        .route("/api/state", get(chat_state))
        .route("/api/messages", post(send_message))
        .route("/api/presets", get(presets))
        .route("/api/files", get(list_files).post(add_files))
        .route("/api/files/:index", put(replace_file).delete(remove_file))
        .route("/api/events", get(events))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn hello() -> impl IntoResponse {
    Json(json!({ "message": "Hello from PineAI" }))
}

async fn list_chats(State(state): State<Arc<AppState>>) -> Json<Vec<ChatGroup>> {
    let groups = state.store.with_sessions(|sessions| {
        group_chats_by_date(sessions)
            .into_iter()
            .map(|g| ChatGroup {
                bucket: g.bucket,
                chats: g.chats.into_iter().cloned().collect(),
            })
            .collect()
    });
    Json(groups)
}

async fn create_chat(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CreateChat>>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let preset = match body.preset {
        Some(id) => Some(state.store.preset(id).cloned().ok_or((
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("Unknown preset: {}", id),
        ))?),
        None => None,
    };

    let session = state.store.create_session(preset.as_ref()).await;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn open_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Session>> {
    if !state.store.select_session(&id) {
        return Err((StatusCode::NOT_FOUND, format!("Chat not found: {}", id)));
    }
    state
        .store
        .session(&id)
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("Chat not found: {}", id)))
}

async fn delete_chat(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> StatusCode {
    state.store.delete_session(&id).await;
    StatusCode::NO_CONTENT
}

async fn chat_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.view())
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendBody>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let pending = state.store.begin_send(&body.text).await.ok_or((
        StatusCode::UNPROCESSABLE_ENTITY,
        "Message is empty".to_string(),
    ))?;

    let session_id = pending.session_id().to_string();
    let store = state.store.clone();
    tokio::spawn(async move {
        let outcome = store.complete_send(pending).await;
        info!(
            "Reply for chat {} finished (failed: {}, delivered: {})",
            outcome.session_id, outcome.failed, outcome.delivered
        );
    });

    Ok((StatusCode::ACCEPTED, Json(json!({ "session_id": session_id }))))
}

async fn presets(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.presets().to_vec())
}

fn files_body(list: &AttachmentList) -> FilesBody {
    FilesBody {
        files: list.files().to_vec(),
        composer: list.recent(COMPOSER_FILES).to_vec(),
    }
}

async fn list_files(State(state): State<Arc<AppState>>) -> Json<FilesBody> {
    Json(files_body(&state.attachments.lock().unwrap()))
}

async fn add_files(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddFiles>,
) -> Json<FilesBody> {
    let names: Vec<String> = body.files.iter().map(|f| f.name.clone()).collect();
    let files = {
        let mut list = state.attachments.lock().unwrap();
        list.add(body.files);
        files_body(&list)
    };

    if body.in_chat {
        state.store.note_uploads(&names).await;
    }
    Json(files)
}

async fn remove_file(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> ApiResult<Json<FilesBody>> {
    let mut list = state.attachments.lock().unwrap();
    list.remove(index)
        .ok_or((StatusCode::NOT_FOUND, format!("No file at position {}", index)))?;
    Ok(Json(files_body(&list)))
}

async fn replace_file(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
    Json(file): Json<Attachment>,
) -> ApiResult<Json<FilesBody>> {
    let mut list = state.attachments.lock().unwrap();
    match list.replace(index, file) {
        Ok(_) => Ok(Json(files_body(&list))),
        Err(e @ AttachmentError::OutOfRange(_)) => Err((StatusCode::NOT_FOUND, e.to_string())),
        Err(e @ AttachmentError::MediaTypeMismatch { .. }) => {
            warn!("Rejected file replacement: {}", e);
            Err((StatusCode::CONFLICT, e.to_string()))
        }
    }
}

async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, axum::BoxError>>> {
    info!("New SSE connection established");

    let mut rx = state.bus.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    match SseEvent::default().json_data(&event) {
                        Ok(sse) => yield Ok(sse),
                        Err(e) => warn!("Failed to encode event: {}", e),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("SSE client lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
