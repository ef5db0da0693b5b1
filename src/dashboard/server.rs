//! The dashboard HTTP server: REST status endpoints, config CRUD, and the
//! SSE output stream.
//!
//! The server never drives the loop — it observes artifacts on disk, relays
//! `DASHBOARD_EVENT:` marker lines over SSE, and requests pause/resume via
//! the flag file the runner polls.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::{LoadedConfig, SecurityLevel, dangerous_paths, field_schema, redact};
use crate::epics::load_epic_docs;
use crate::errors::DashboardError;
use crate::paths::{GlobalPaths, ProjectPaths};
use crate::sprint::writer::{Section, SprintDoc};
use crate::state::StateStore;
use crate::util::atomic_write_str;

use super::config_api::{self, ExportScope};
use super::content;
use super::events::DashboardEvent;
use super::sse::{SseBroadcaster, SseMessage};

/// Shared server state.
pub struct AppState {
    pub paths: ProjectPaths,
    pub loaded: tokio::sync::RwLock<LoadedConfig>,
    pub broadcaster: SseBroadcaster,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(paths: ProjectPaths, loaded: LoadedConfig) -> Arc<Self> {
        Arc::new(Self {
            paths,
            loaded: tokio::sync::RwLock::new(loaded),
            broadcaster: SseBroadcaster::new(),
            started_at: Instant::now(),
        })
    }

    /// Feed one line of runner stdout into the bus: marker lines broadcast
    /// as their typed event, everything else as raw `output`.
    pub fn ingest_line(&self, line: &str) {
        match DashboardEvent::parse_line(line) {
            Some(event) => self.broadcaster.publish(SseMessage::from_event(&event)),
            None => self.broadcaster.publish(SseMessage::new(
                "output",
                json!({ "line": line }).to_string(),
            )),
        }
    }
}

impl IntoResponse for DashboardError {
    fn into_response(self) -> Response {
        let status = match &self {
            DashboardError::NotFound(_) => StatusCode::NOT_FOUND,
            DashboardError::PathOutsideProject(_) | DashboardError::SymlinkRejected(_) => {
                StatusCode::FORBIDDEN
            }
            DashboardError::ImportTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Probe successive ports starting at `port` unless auto-discovery is off.
pub async fn find_available_port(
    host: &str,
    port: u16,
    auto: bool,
) -> Result<u16, DashboardError> {
    let attempts = if auto { 20 } else { 1 };
    for offset in 0..attempts {
        let candidate = port + offset;
        if TcpListener::bind((host, candidate)).await.is_ok() {
            if offset > 0 {
                info!("Port {port} busy, using {candidate}");
            }
            return Ok(candidate);
        }
    }
    Err(DashboardError::PortInUse { port })
}

/// Build the full router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/version", get(api_version))
        .route("/api/stories", get(api_stories))
        .route("/api/epics/{id}", get(api_epic))
        .route("/api/epics/{id}/stories/{sid}", get(api_epic_story))
        .route("/sse/output", get(sse_output))
        .route("/api/prompt/{epic}/{story}/{phase}", get(api_prompt))
        .route("/api/validation/{epic}/{story}", get(api_validation))
        .route("/api/report/content", get(api_report_content))
        .route("/api/config", get(api_config_get).put(api_config_put))
        .route("/api/config/schema", get(api_config_schema))
        .route("/api/config/export", get(api_config_export))
        .route("/api/config/import", post(api_config_import))
        .route("/api/playwright/status", get(api_playwright_status))
        .route("/api/pause", post(api_pause))
        .route("/api/resume", post(api_resume))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until shutdown.
pub async fn serve(state: Arc<AppState>, host: &str, port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("Dashboard listening on http://{addr}");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

async fn api_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let store = StateStore::new(state.paths.state_file());
    let loop_state = store.load().ok();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "paused": state.paths.pause_flag().exists(),
        "state": loop_state,
        "subscribers": state.broadcaster.subscriber_count(),
    }))
}

async fn api_version() -> Json<serde_json::Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn api_stories(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, DashboardError> {
    let epics = load_epic_docs(&state.paths.epics_dir())
        .map_err(|e| DashboardError::BadRequest(e.to_string()))?;
    let sprint = SprintDoc::load(&state.paths.sprint_status())
        .map_err(|e| DashboardError::BadRequest(e.to_string()))?;

    let stories: Vec<serde_json::Value> = epics
        .iter()
        .flat_map(|epic| {
            epic.stories.iter().map(|story| {
                let status = sprint
                    .get(Section::DevelopmentStatus, &story.entry_key())
                    .map(|e| e.value.clone())
                    .unwrap_or_else(|| "backlog".into());
                json!({
                    "epic": story.epic.to_string(),
                    "story": story.story,
                    "title": story.title,
                    "key": story.story_key(),
                    "status": status,
                })
            })
        })
        .collect();
    Ok(Json(json!({ "stories": stories })))
}

async fn api_epic(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<serde_json::Value>, DashboardError> {
    let epics = load_epic_docs(&state.paths.epics_dir())
        .map_err(|e| DashboardError::BadRequest(e.to_string()))?;
    let epic = epics
        .iter()
        .find(|e| e.frontmatter.epic_num.to_string() == id)
        .ok_or_else(|| DashboardError::NotFound(format!("epic {id}")))?;
    Ok(Json(json!({
        "epic": id,
        "title": epic.frontmatter.title,
        "status": epic.frontmatter.status,
        "stories": epic.stories.iter().map(|s| s.story_key()).collect::<Vec<_>>(),
    })))
}

async fn api_epic_story(
    State(state): State<Arc<AppState>>,
    AxumPath((id, sid)): AxumPath<(String, u32)>,
) -> Result<Json<serde_json::Value>, DashboardError> {
    let epics = load_epic_docs(&state.paths.epics_dir())
        .map_err(|e| DashboardError::BadRequest(e.to_string()))?;
    let story = epics
        .iter()
        .filter(|e| e.frontmatter.epic_num.to_string() == id)
        .flat_map(|e| &e.stories)
        .find(|s| s.story == sid)
        .ok_or_else(|| DashboardError::NotFound(format!("story {id}.{sid}")))?;

    let story_file =
        crate::sprint::inference::find_story_file(&state.paths, &id, sid).map(|p| {
            p.display().to_string()
        });
    Ok(Json(json!({
        "key": story.story_key(),
        "title": story.title,
        "entry_key": story.entry_key(),
        "story_file": story_file,
    })))
}

async fn sse_output(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Sse::new(state.broadcaster.subscribe())
}

async fn api_prompt(
    AxumPath((_epic, _story, phase)): AxumPath<(String, String, String)>,
) -> Result<String, DashboardError> {
    // Prompt files are keyed by phase name; epic/story are accepted for
    // URL stability and used by the dashboard UI for labeling.
    let prompts_dir = GlobalPaths::resolve()
        .map(|g| g.debug_prompts_dir())
        .ok_or_else(|| DashboardError::NotFound("debug prompts directory".into()))?;
    let path = content::find_prompt_file(&prompts_dir, &phase)
        .ok_or_else(|| DashboardError::NotFound(format!("prompt for phase {phase}")))?;
    std::fs::read_to_string(&path)
        .map_err(|_| DashboardError::NotFound(path.display().to_string()))
}

async fn api_validation(
    State(state): State<Arc<AppState>>,
    AxumPath((epic, story)): AxumPath<(String, String)>,
) -> Result<String, DashboardError> {
    content::load_validations(&state.paths, &epic, &story)
}

#[derive(Deserialize)]
struct ReportQuery {
    path: String,
}

async fn api_report_content(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportQuery>,
) -> Result<Response, DashboardError> {
    let text = content::read_contained(&state.paths.project_root, &query.path)?;
    Ok(([("content-type", "text/plain; charset=utf-8")], text).into_response())
}

async fn api_config_get(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let loaded = state.loaded.read().await;
    let redacted = redact(&loaded.merged);
    Json(serde_json::to_value(&redacted).unwrap_or_default())
}

#[derive(Deserialize)]
struct ConfigPut {
    path: String,
    value: serde_json::Value,
}

async fn api_config_put(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConfigPut>,
) -> Result<Json<serde_json::Value>, DashboardError> {
    // Dangerous fields are never editable over HTTP.
    if dangerous_paths()
        .iter()
        .any(|p| body.path == *p || body.path.starts_with(&format!("{p}.")))
    {
        return Err(DashboardError::BadRequest(format!(
            "field '{}' is not editable via the dashboard",
            body.path
        )));
    }

    let config_path = state.paths.project_root.join("bmad-assist.yaml");
    let mut tree: serde_yaml::Value = std::fs::read_to_string(&config_path)
        .ok()
        .and_then(|c| serde_yaml::from_str(&c).ok())
        .unwrap_or(serde_yaml::Value::Mapping(Default::default()));

    set_dotted(&mut tree, &body.path, yaml_from_json(&body.value));

    let yaml = serde_yaml::to_string(&tree)
        .map_err(|e| DashboardError::BadRequest(e.to_string()))?;
    atomic_write_str(&config_path, &yaml)
        .map_err(|e| DashboardError::BadRequest(e.to_string()))?;

    // Reload and broadcast so dashboards refresh.
    match crate::config::load_config(&state.paths.project_root) {
        Ok(reloaded) => {
            *state.loaded.write().await = reloaded;
            state
                .broadcaster
                .publish(SseMessage::new("config_reloaded", "{}"));
        }
        Err(e) => warn!("Config reload after PUT failed: {e}"),
    }

    let risky = crate::config::risky_paths().contains(&body.path);
    Ok(Json(json!({ "ok": true, "risky": risky })))
}

fn yaml_from_json(value: &serde_json::Value) -> serde_yaml::Value {
    serde_yaml::from_str(&value.to_string()).unwrap_or(serde_yaml::Value::Null)
}

fn set_dotted(tree: &mut serde_yaml::Value, path: &str, value: serde_yaml::Value) {
    let mut current = tree;
    let parts: Vec<&str> = path.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        if !matches!(current, serde_yaml::Value::Mapping(_)) {
            *current = serde_yaml::Value::Mapping(Default::default());
        }
        let serde_yaml::Value::Mapping(map) = current else {
            unreachable!()
        };
        let key = serde_yaml::Value::String((*part).to_string());
        if i == parts.len() - 1 {
            map.insert(key, value);
            return;
        }
        current = map
            .entry(key)
            .or_insert(serde_yaml::Value::Mapping(Default::default()));
    }
}

async fn api_config_schema() -> Json<serde_json::Value> {
    // Dangerous fields never appear in the schema.
    let visible: Vec<_> = field_schema()
        .into_iter()
        .filter(|f| f.level != SecurityLevel::Dangerous)
        .collect();
    Json(serde_json::to_value(visible).unwrap_or_default())
}

#[derive(Deserialize)]
struct ExportQuery {
    #[serde(default = "default_scope")]
    scope: String,
}

fn default_scope() -> String {
    "merged".into()
}

async fn api_config_export(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, DashboardError> {
    let scope = ExportScope::parse(&query.scope)?;
    let loaded = state.loaded.read().await;
    let (filename, yaml) = config_api::export_config(&loaded, scope)?;
    Ok((
        [
            ("content-type", "application/yaml".to_string()),
            (
                "content-disposition",
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        yaml,
    )
        .into_response())
}

#[derive(Deserialize)]
struct ImportBody {
    /// "preview" or "apply".
    mode: String,
    content: String,
}

async fn api_config_import(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ImportBody>,
) -> Result<Json<serde_json::Value>, DashboardError> {
    let limit = {
        let loaded = state.loaded.read().await;
        loaded.config.dashboard.import_limit_bytes
    };

    match body.mode.as_str() {
        "preview" => {
            let loaded = state.loaded.read().await;
            let preview = config_api::preview_import(&loaded.merged, &body.content, limit)?;
            Ok(Json(serde_json::to_value(preview).unwrap_or_default()))
        }
        "apply" => {
            let config_path = state.paths.project_root.join("bmad-assist.yaml");
            config_api::apply_import(&config_path, &body.content, limit)?;
            match crate::config::load_config(&state.paths.project_root) {
                Ok(reloaded) => {
                    *state.loaded.write().await = reloaded;
                }
                Err(e) => warn!("Config reload after import failed: {e}"),
            }
            state
                .broadcaster
                .publish(SseMessage::new("config_reloaded", "{}"));
            Ok(Json(json!({ "ok": true })))
        }
        other => Err(DashboardError::BadRequest(format!(
            "unknown import mode '{other}' (expected preview|apply)"
        ))),
    }
}

async fn api_playwright_status() -> Json<serde_json::Value> {
    // Probe in a worker with a hard 30-second ceiling.
    let probe = tokio::time::timeout(std::time::Duration::from_secs(30), async {
        tokio::process::Command::new("npx")
            .args(["playwright", "--version"])
            .output()
            .await
    })
    .await;

    match probe {
        Ok(Ok(output)) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Json(json!({ "installed": true, "version": version }))
        }
        _ => Json(json!({
            "installed": false,
            "hint": "npm install -D @playwright/test && npx playwright install",
        })),
    }
}

async fn api_pause(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, DashboardError> {
    let flag = state.paths.pause_flag();
    std::fs::create_dir_all(state.paths.tool_dir())
        .and_then(|_| std::fs::write(&flag, ""))
        .map_err(|e| DashboardError::BadRequest(format!("cannot write pause flag: {e}")))?;
    Ok(Json(json!({ "paused": true })))
}

async fn api_resume(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, DashboardError> {
    let flag = state.paths.pause_flag();
    if flag.exists() {
        std::fs::remove_file(&flag)
            .map_err(|e| DashboardError::BadRequest(format!("cannot clear pause flag: {e}")))?;
    }
    Ok(Json(json!({ "paused": false })))
}
