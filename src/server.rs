use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::{ConfigStore, Settings, SettingsPatch};
use crate::error::AppError;
use crate::models::load_model_catalog;
use crate::pipeline::{DiagnoseOutcome, DiagnosePipeline, DiagnoseRequest};
use crate::record::{HistoryLog, Message, ProjectMeta, ProjectSummary, Resource, Submission};
use crate::store::{ImportFile, ProjectStore};

/// Captures are large; the default axum body limit is far too small for them.
const BODY_LIMIT_BYTES: usize = 1024 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub store: Arc<dyn ProjectStore>,
    pub pipeline: Arc<DiagnosePipeline>,
    pub tool_addr: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/models", get(models_catalog))
        .route("/settings", get(settings_get).put(settings_put))
        .route("/projects", get(projects_list).post(projects_create))
        .route("/projects/import", post(projects_import))
        .route("/projects/:id", get(project_detail))
        .route("/projects/:id/upload-capture", post(upload_capture))
        .route("/projects/:id/history", get(history_get).put(history_put))
        .route("/projects/:id/resources", get(resources_list))
        .route("/projects/:id/resource", get(resource_read))
        .route("/nl-debug", post(nl_debug))
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "orchestrator listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let config = state.config.current().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "toolBackend": state.tool_addr,
        "models": { "planner": config.planner_model, "action": config.action_model },
    }))
}

async fn models_catalog(State(state): State<AppState>) -> Json<Value> {
    let config = state.config.current().await;
    let catalog = load_model_catalog(state.config.models_path(), &config);
    Json(json!({
        "models": catalog.models,
        "defaultPlanner": catalog.default_planner,
        "defaultAction": catalog.default_action,
    }))
}

async fn settings_get(State(state): State<AppState>) -> Json<Settings> {
    Json(state.config.settings().await)
}

async fn settings_put(
    State(state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<Settings>, AppError> {
    let settings = state.config.update(patch).await?;
    Ok(Json(settings))
}

#[derive(Debug, Serialize)]
struct ProjectsListResponse {
    projects: Vec<ProjectSummary>,
}

async fn projects_list(
    State(state): State<AppState>,
) -> Result<Json<ProjectsListResponse>, AppError> {
    Ok(Json(ProjectsListResponse { projects: state.store.list().await? }))
}

#[derive(Debug, Deserialize)]
struct CreateProjectBody {
    name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectCreatedResponse {
    project_id: String,
}

async fn projects_create(
    State(state): State<AppState>,
    Json(body): Json<CreateProjectBody>,
) -> Result<Json<ProjectCreatedResponse>, AppError> {
    let project_id = state.store.create(body.name).await?;
    Ok(Json(ProjectCreatedResponse { project_id }))
}

async fn projects_import(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ProjectCreatedResponse>, AppError> {
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::Validation(format!("invalid multipart payload: {err}")))?
    {
        // The uploaded filename carries the project-relative path.
        let path = field
            .file_name()
            .map(str::to_string)
            .or_else(|| field.name().map(str::to_string))
            .unwrap_or_default();
        let data = field
            .bytes()
            .await
            .map_err(|err| AppError::Validation(format!("invalid multipart payload: {err}")))?;
        files.push(ImportFile { path, data: data.to_vec() });
    }
    let project_id = state.store.import(files).await?;
    Ok(Json(ProjectCreatedResponse { project_id }))
}

#[derive(Debug, Serialize)]
struct ProjectDetailResponse {
    project: ProjectMeta,
}

async fn project_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProjectDetailResponse>, AppError> {
    Ok(Json(ProjectDetailResponse { project: state.store.get(&id).await? }))
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CaptureUploadedResponse {
    capture_path: String,
}

async fn upload_capture(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<UploadQuery>,
    body: axum::body::Bytes,
) -> Result<Json<CaptureUploadedResponse>, AppError> {
    let name = query
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| format!("capture_{}.rdc", chrono::Utc::now().timestamp_millis()));
    let capture_path = state.store.upload_capture(&id, &name, &body).await?;
    Ok(Json(CaptureUploadedResponse { capture_path }))
}

async fn history_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HistoryLog>, AppError> {
    Ok(Json(state.store.history(&id).await?))
}

#[derive(Debug, Deserialize)]
struct HistoryPutBody {
    #[serde(default)]
    submissions: Vec<Submission>,
    #[serde(default)]
    messages: Vec<Message>,
}

async fn history_put(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<HistoryPutBody>,
) -> Result<Json<Value>, AppError> {
    state.store.replace_history(&id, body.submissions, body.messages).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Serialize)]
struct ResourcesResponse {
    resources: Vec<Resource>,
}

async fn resources_list(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ResourcesResponse>, AppError> {
    Ok(Json(ResourcesResponse { resources: state.store.resources(&id).await? }))
}

#[derive(Debug, Deserialize)]
struct ResourceQuery {
    path: Option<String>,
}

async fn resource_read(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ResourceQuery>,
) -> Result<Response, AppError> {
    let path = query.path.ok_or_else(|| AppError::NotFound("resource_not_found".to_string()))?;
    let bytes = state.store.read_resource(&id, &path).await?;
    let content_type = content_type_for(&path);
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

async fn nl_debug(
    State(state): State<AppState>,
    Json(req): Json<DiagnoseRequest>,
) -> Result<Json<DiagnoseOutcome>, AppError> {
    let config = state.config.current().await;
    let outcome = state.pipeline.diagnose(&config, req).await?;
    Ok(Json(outcome))
}

fn content_type_for(path: &str) -> &'static str {
    let ext = std::path::Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "json" => "application/json",
        "txt" | "log" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type_for("exports/color.png"), "image/png");
        assert_eq!(content_type_for("history.json"), "application/json");
        assert_eq!(content_type_for("logs/run.log"), "text/plain; charset=utf-8");
        assert_eq!(content_type_for("captures/frame.rdc"), "application/octet-stream");
    }
}
