//! HTTP 服务
//!
//! 路由：
//! - `GET  /api/terminal/ws`       终端 WebSocket
//! - `POST /api/terminal/exec`     一次性命令执行
//! - `GET  /api/terminal/sessions` 会话列表
//! - `GET  /health`                存活检查

use std::sync::Arc;

use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::bridge::{CommandProxy, SessionRegistry};
use crate::config::{Config, TerminalConfig};
use crate::runtime::{ProcessRuntime, TargetRouter};
use crate::utils::error::BridgeError;

use super::connection;

/// 所有请求共享的状态
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub runtime: Arc<dyn ProcessRuntime>,
    pub proxy: Arc<CommandProxy>,
    pub terminal: Arc<TerminalConfig>,
}

impl AppState {
    pub fn new(config: &Config, runtime: Arc<dyn ProcessRuntime>) -> Self {
        Self {
            registry: SessionRegistry::new(),
            proxy: Arc::new(CommandProxy::new(runtime.clone(), config.exec.timeout())),
            runtime,
            terminal: Arc::new(config.terminal.clone()),
        }
    }
}

/// 命令：字符串按空白拆分，数组原样使用
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CommandSpec {
    Argv(Vec<String>),
    Line(String),
}

impl CommandSpec {
    pub fn into_argv(self) -> Vec<String> {
        match self {
            CommandSpec::Argv(argv) => argv,
            CommandSpec::Line(line) => line.split_whitespace().map(str::to_string).collect(),
        }
    }
}

/// 执行请求
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub command: Option<CommandSpec>,
}

/// 执行响应
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResponse {
    pub output: String,
    pub exit_code: i32,
    pub container_id: String,
    pub command: Vec<String>,
}

/// 构建路由
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/terminal/ws", get(ws_handler))
        .route("/api/terminal/exec", post(exec_handler))
        .route("/api/terminal/sessions", get(sessions_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| connection::run(socket, state))
}

async fn exec_handler(
    State(state): State<AppState>,
    payload: Result<Json<ExecRequest>, JsonRejection>,
) -> Result<Json<ExecResponse>, BridgeError> {
    let Json(request) =
        payload.map_err(|e| BridgeError::InvalidRequest(format!("请求体无效: {}", e)))?;

    let argv = request
        .command
        .map(CommandSpec::into_argv)
        .unwrap_or_default();
    if request.container_id.trim().is_empty() || argv.is_empty() {
        return Err(BridgeError::InvalidRequest(
            "containerId 和 command 不能为空".to_string(),
        ));
    }

    let result = state.proxy.exec(&request.container_id, &argv).await?;

    Ok(Json(ExecResponse {
        output: result.output_text(),
        exit_code: result.exit_code,
        container_id: request.container_id,
        command: argv,
    }))
}

async fn sessions_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.registry.list();
    Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
    }))
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.registry.len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// 启动服务直到收到 Ctrl-C
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let runtime: Arc<dyn ProcessRuntime> = Arc::new(TargetRouter::from_config(&config));
    let state = AppState::new(&config, runtime);

    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("监听 {} 失败", config.server.listen))?;
    tracing::info!("终端桥接服务监听于 {}", config.server.listen);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP 服务异常退出")?;

    tracing::info!("终端桥接服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("监听 Ctrl-C 失败: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("收到退出信号");
}
