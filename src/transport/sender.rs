//! 客户端消息发送器
//!
//! 每个连接一个有界队列，由写任务统一写入 WebSocket。
//! 发送器可以克隆，会话桥接和连接读循环共用。

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::utils::error::BridgeError;
use crate::utils::state::SessionState;

use super::protocol::{ServerMessage, ServerNotice};

/// 通知入队的最长等待时间
const NOTICE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// 客户端消息发送器
#[derive(Clone)]
pub struct ClientSender {
    tx: mpsc::Sender<ServerMessage>,
    /// 连接关闭信号
    closed: CancellationToken,
}

impl ClientSender {
    /// 创建发送器和对应的接收端
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let sender = Self {
            tx,
            closed: CancellationToken::new(),
        };
        (sender, rx)
    }

    /// 发送进程输出
    ///
    /// 队列满时等待，输出方向的背压由此传递到进程。
    pub async fn send_output(&self, data: Bytes) -> Result<(), BridgeError> {
        self.tx
            .send(ServerMessage::Output(data))
            .await
            .map_err(|_| BridgeError::stream_error("发送输出", "客户端连接已关闭"))
    }

    /// 发送结构化通知
    pub async fn send_notice(&self, notice: ServerNotice) -> Result<(), BridgeError> {
        self.tx
            .send_timeout(ServerMessage::Notice(notice), NOTICE_SEND_TIMEOUT)
            .await
            .map_err(|e| BridgeError::stream_error("发送通知", &e.to_string()))
    }

    /// 发送错误通知，失败只记录日志
    pub async fn send_error(&self, err: &BridgeError) {
        if let Err(e) = self.send_notice(ServerNotice::from(err)).await {
            tracing::debug!("发送错误通知失败: {}", e);
        }
    }

    /// 发送状态通知，失败只记录日志
    pub async fn send_status(
        &self,
        status: SessionState,
        session_id: &str,
        container_id: Option<&str>,
        reason: Option<&str>,
    ) {
        let notice = ServerNotice::Status {
            status,
            session_id: session_id.to_string(),
            container_id: container_id.map(str::to_string),
            reason: reason.map(str::to_string),
        };
        if let Err(e) = self.send_notice(notice).await {
            tracing::debug!("发送状态通知失败: {}", e);
        }
    }

    /// 请求关闭连接
    ///
    /// 写任务会先发出已入队的消息再关闭 WebSocket。
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// 连接是否已请求关闭
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// 连接关闭信号
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}
