//! 终端会话
//!
//! 一个会话对应一个客户端连接，最多附加一个外部进程。
//! 会话独占进程句柄和输入流，关闭时两者一起释放。

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::runtime::{ProcessHandle, ProcessWriter};
use crate::utils::state::{AtomicSessionState, SessionState};

/// 会话信息（用于列表接口）
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub connection_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
}

/// 终端会话
pub struct Session {
    id: String,
    connection_id: String,
    created_at: DateTime<Utc>,
    pub(crate) state: AtomicSessionState,
    /// 附加成功后设置，之后不再改变
    target: OnceLock<String>,
    process: Mutex<Option<Box<dyn ProcessHandle>>>,
    writer: Mutex<Option<ProcessWriter>>,
    /// 关闭时取消，用于停止输出转发和中断挂起的输入写入
    pub(crate) cancel: CancellationToken,
}

impl Session {
    pub fn new(connection_id: &str) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self {
            state: AtomicSessionState::new(id.clone()),
            id,
            connection_id: connection_id.to_string(),
            created_at: Utc::now(),
            target: OnceLock::new(),
            process: Mutex::new(None),
            writer: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    pub fn target(&self) -> Option<&str> {
        self.target.get().map(String::as_str)
    }

    pub(crate) fn set_target(&self, target: &str) {
        if self.target.set(target.to_string()).is_err() {
            tracing::warn!("会话 {} 的目标已设置，忽略: {}", self.id, target);
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            connection_id: self.connection_id.clone(),
            target: self.target().map(str::to_string),
            state: self.state(),
            created_at: self.created_at,
        }
    }

    /// 保存新创建进程的资源
    pub(crate) async fn install(&self, handle: Box<dyn ProcessHandle>, writer: ProcessWriter) {
        *self.process.lock().await = Some(handle);
        *self.writer.lock().await = Some(writer);
    }

    /// 取出进程资源，之后会话不再持有它们
    pub(crate) async fn take_resources(
        &self,
    ) -> (Option<Box<dyn ProcessHandle>>, Option<ProcessWriter>) {
        let handle = self.process.lock().await.take();
        let writer = self.writer.lock().await.take();
        (handle, writer)
    }

    pub(crate) fn process(&self) -> &Mutex<Option<Box<dyn ProcessHandle>>> {
        &self.process
    }

    pub(crate) fn writer(&self) -> &Mutex<Option<ProcessWriter>> {
        &self.writer
    }

    /// 是否持有进程资源
    pub async fn has_resources(&self) -> bool {
        self.process.lock().await.is_some() && self.writer.lock().await.is_some()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("state", &self.state())
            .field("target", &self.target())
            .finish()
    }
}
