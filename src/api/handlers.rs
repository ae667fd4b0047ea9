use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::PipelineError;
use crate::models::{BatchHandle, BatchStatus, Caller, Event, QueryMatch};
use crate::pipeline::gateway::UploadFile;
use crate::pipeline::search::SearchResponse;
use crate::pipeline::QueueDepths;
use crate::stats::StatsSnapshot;
use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub uptime_secs: u64,
    pub queues: QueueDepths,
    pub counters: StatsSnapshot,
    pub tracked_batches: usize,
    pub indexed_faces: usize,
    pub images_per_sec: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateEventRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventsResponse {
    pub events: Vec<Event>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    pub embedding: Vec<f32>,
    pub k: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub matches: Vec<QueryMatch>,
}

pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok".into(), version: env!("CARGO_PKG_VERSION").into() })
}

pub async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(StatsResponse {
        uptime_secs: state.started_at.elapsed().as_secs(),
        queues: state.gauges.depths(),
        counters: state.stats.snapshot(),
        tracked_batches: state.tracker.tracked(),
        indexed_faces: state.index.len(),
        images_per_sec: state.stats.images_per_sec(),
    })
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut text = state.stats.metrics_text();
    let d = state.gauges.depths();
    text.push_str(&format!("nazr_queue_detect {}\n", d.detect));
    text.push_str(&format!("nazr_queue_embed {}\n", d.embed));
    text.push_str(&format!("nazr_queue_index {}\n", d.index));
    text.push_str(&format!("nazr_indexed_faces {}\n", state.index.len()));
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], text)
}

pub async fn create_event(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(req): Json<CreateEventRequest>,
) -> Result<impl IntoResponse, PipelineError> {
    let event = state.create_event(&caller, &req.name).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

pub async fn list_events(State(state): State<Arc<AppState>>, caller: Caller) -> Result<Json<EventsResponse>, PipelineError> {
    Ok(Json(EventsResponse { events: state.list_events(&caller).await? }))
}

/// Collects every file part whose field name is in `fields`.
async fn read_files(multipart: &mut Multipart, fields: &[&str]) -> Result<Vec<UploadFile>, PipelineError> {
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| PipelineError::Validation(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        if !fields.contains(&name.as_str()) {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| PipelineError::Validation(format!("could not read part '{name}': {e}")))?;
        files.push(UploadFile { filename, bytes });
    }
    Ok(files)
}

pub async fn submit_batch(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<String>,
    caller: Caller,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, PipelineError> {
    let files = read_files(&mut multipart, &["files", "file"]).await?;
    let handle: BatchHandle = state.submit(&caller, &event_id, files).await?;
    Ok((StatusCode::ACCEPTED, Json(handle)))
}

pub async fn batch_status(State(state): State<Arc<AppState>>, Path(batch_id): Path<i64>) -> Result<Json<BatchStatus>, PipelineError> {
    Ok(Json(state.status(batch_id).await?))
}

pub async fn batch_stream(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, axum::Error>>>, PipelineError> {
    let updates = state.subscribe(batch_id).await?;
    let events = updates.map(|status| SseEvent::default().event("status").json_data(status));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub async fn cancel_batch(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<i64>,
    caller: Caller,
) -> Result<Json<BatchStatus>, PipelineError> {
    Ok(Json(state.cancel(&caller, batch_id).await?))
}

pub async fn query_index(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<String>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, PipelineError> {
    let k = req.k.unwrap_or(state.cfg.search_k);
    let matches = state.query(&event_id, req.embedding, k).await?;
    Ok(Json(QueryResponse { matches }))
}

pub async fn search_selfie(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<SearchResponse>, PipelineError> {
    let selfie = read_files(&mut multipart, &["selfie", "file"])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::Validation("no selfie uploaded".into()))?;
    let response = state.search_by_selfie(&event_id, selfie.bytes.to_vec()).await?;
    info!(event_id = %event_id, photos = response.results.len(), "selfie search served");
    Ok(Json(response))
}

pub async fn photo(State(state): State<Arc<AppState>>, Path(image_id): Path<i64>) -> Result<impl IntoResponse, PipelineError> {
    let photo = state.photo(image_id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, photo.content_type),
            (header::CACHE_CONTROL, "public, max-age=31536000, immutable"),
        ],
        photo.bytes,
    ))
}
