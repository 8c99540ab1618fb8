use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    routing::{get, get_service, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::services::ServeDir;

use crate::config::{Config, RepoOverrides};
use crate::error::CoreError;
use crate::models::{self, AIResponse, CommitRequest, ConversationTurn, ModelConfig, ProviderKind};
use crate::orchestrator::Orchestrator;
use crate::telemetry;

type ApiError = (StatusCode, Json<Value>);

/**
 * \brief 各路由共享的只读状态。
 */
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    orchestrator: Arc<Orchestrator>,
    catalog: Arc<Vec<ModelConfig>>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let orchestrator = Orchestrator::new(&config);
        Self {
            config: Arc::new(config),
            orchestrator: Arc::new(orchestrator),
            catalog: Arc::new(models::default_catalog()),
        }
    }
}

/**
 * \brief 构建 API 路由与静态前端。
 */
pub fn router(config: Config) -> Router {
    let static_service = get_service(
        ServeDir::new(&config.ui_dir).append_index_html_on_directories(true),
    );
    let state = AppState::new(config);

    Router::new()
        .route(
            "/api/commit",
            post(commit_file).fallback(method_not_allowed),
        )
        .route("/api/chat", post(chat))
        .route("/api/models", get(list_models))
        .route("/api/repo/files", get(repo_files))
        .route("/api/health", get(health_check))
        .fallback_service(static_service)
        .with_state(state)
}

/**
 * \brief 启动本地 HTTP 服务，提供提交代理、对话 API 与静态前端。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str, config: Config) -> Result<()> {
    let app = router(config);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Deserialize, Debug, Default)]
struct CommitPayload {
    #[serde(default)]
    file_path: Option<String>,
    #[serde(default)]
    new_content: Option<String>,
    #[serde(default)]
    commit_message: Option<String>,
}

#[derive(Serialize, Debug)]
struct CommitResponse {
    success: bool,
    message: &'static str,
    html_url: String,
}

#[derive(Deserialize, Debug)]
struct ChatPayload {
    #[serde(default)]
    history: Vec<ConversationTurn>,
    message: String,
    model_id: String,
    /** \brief 是否附带仓库文件列表作为上下文。 */
    #[serde(default)]
    include_repo_files: Option<bool>,
}

#[derive(Deserialize, Debug)]
struct RepoQuery {
    owner: Option<String>,
    repo: Option<String>,
    branch: Option<String>,
}

fn json_err(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn core_err(e: CoreError) -> ApiError {
    let status = match e {
        CoreError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_err(status, e.to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

async fn method_not_allowed() -> ApiError {
    json_err(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
}

/**
 * \brief 提交接口：POST /api/commit，创建或更新单个文件。
 */
async fn commit_file(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<CommitResponse>, ApiError> {
    let payload: CommitPayload = serde_json::from_slice(&body).unwrap_or_default();
    let (Some(file_path), Some(new_content), Some(commit_message)) = (
        payload.file_path.filter(|p| models::has_repo_path(p)),
        payload.new_content.filter(|c| models::has_content(c)),
        non_empty(payload.commit_message),
    ) else {
        return Err(json_err(
            StatusCode::BAD_REQUEST,
            "Missing required fields: file_path, new_content, commit_message",
        ));
    };

    let coords = state
        .config
        .repo_coordinates(&RepoOverrides::default())
        .filter(|c| c.token.is_some())
        .ok_or_else(|| {
            telemetry::log_error("server.commit", "GitHub credentials or repository not configured");
            json_err(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Server configuration error: GITHUB_TOKEN, GITHUB_OWNER and GITHUB_REPO must be set",
            )
        })?;

    let request = CommitRequest {
        file_path,
        new_content,
        commit_message,
    };
    let result = state
        .orchestrator
        .gateway()
        .commit(&request, &coords)
        .await
        .map_err(core_err)?;

    telemetry::log_event(
        "server.commit",
        &format!("path={} op={:?}", request.normalized_path(), result.operation),
    );
    Ok(Json(CommitResponse {
        success: result.success,
        message: result.operation.message(),
        html_url: result.html_url,
    }))
}

/**
 * \brief 对话接口：POST /api/chat，始终返回 AIResponse（Provider 错误体现在 text 中）。
 */
async fn chat(
    State(state): State<AppState>,
    Json(payload): Json<ChatPayload>,
) -> Result<Json<AIResponse>, ApiError> {
    let model = models::find_model(&state.catalog, &payload.model_id)
        .cloned()
        .ok_or_else(|| {
            json_err(
                StatusCode::BAD_REQUEST,
                format!("unknown model: {}", payload.model_id),
            )
        })?;

    let files = if payload.include_repo_files.unwrap_or(false) {
        match state.config.repo_coordinates(&RepoOverrides::default()) {
            Some(coords) => state.orchestrator.gateway().list_files(&coords).await,
            None => Vec::new(),
        }
    } else {
        Vec::new()
    };

    telemetry::log_event(
        "server.chat",
        &format!(
            "model={} history={} prompt_len={} files={}",
            model.id,
            payload.history.len(),
            payload.message.len(),
            files.len()
        ),
    );

    let response = state
        .orchestrator
        .converse_with_files(&payload.history, &payload.message, &model, &files)
        .await;
    Ok(Json(response))
}

async fn list_models(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "models": state.catalog.as_ref() }))
}

/**
 * \brief 仓库文件列表（尽力而为，失败时为空数组）。
 */
async fn repo_files(
    State(state): State<AppState>,
    Query(q): Query<RepoQuery>,
) -> Json<Value> {
    let overrides = RepoOverrides {
        owner: q.owner,
        repo: q.repo,
        branch: q.branch,
        token: None,
    };
    let files = match state.config.repo_coordinates(&overrides) {
        Some(coords) => state.orchestrator.gateway().list_files(&coords).await,
        None => Vec::new(),
    };
    Json(json!({ "files": files }))
}

/**
 * \brief 健康检查：报告各凭据是否已配置。
 */
async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let provider = state.orchestrator.provider();
    let github = state
        .config
        .repo_coordinates(&RepoOverrides::default())
        .map(|c| c.token.is_some())
        .unwrap_or(false);
    Json(json!({
        "ok": true,
        "providers": {
            "gemini": provider.has_credential(ProviderKind::Gemini),
            "openai": provider.has_credential(ProviderKind::OpenAi),
            "anthropic": provider.has_credential(ProviderKind::Anthropic),
        },
        "github": github,
    }))
}
