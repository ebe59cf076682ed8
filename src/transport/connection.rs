//! WebSocket 连接处理
//!
//! 每个连接：一个读循环（解析客户端帧并同步写入进程输入）和一个写任务
//! （从发送队列取消息写入 WebSocket）。附加在独立任务中进行，读循环在附加期间
//! 仍能处理 stop 和断开。读循环退出时关闭会话。

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::{AttachBridge, CloseReason};
use crate::utils::error::BridgeError;

use super::protocol::{ClientMessage, ServerMessage};
use super::sender::ClientSender;
use super::server::AppState;

/// 等待写任务发完剩余消息的最长时间
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// 关闭后等待附加任务退出的最长时间
const ATTACH_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

impl From<ServerMessage> for Message {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::Output(data) => Message::Binary(data.to_vec()),
            ServerMessage::Notice(notice) => match serde_json::to_string(&notice) {
                Ok(json) => Message::Text(json),
                Err(e) => {
                    tracing::error!("序列化通知失败: {}", e);
                    Message::Text(r#"{"type":"error","data":"internal error"}"#.to_string())
                }
            },
        }
    }
}

/// 终端连接
pub struct TerminalConnection {
    bridge: Arc<AttachBridge>,
    client: ClientSender,
    /// 进行中的附加任务
    attach_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TerminalConnection {
    /// 注册会话并创建桥接
    pub fn open(
        connection_id: &str,
        state: &AppState,
        client: ClientSender,
    ) -> Result<Self, BridgeError> {
        let session = state.registry.register(connection_id)?;
        let bridge = Arc::new(AttachBridge::new(
            session,
            state.runtime.clone(),
            state.registry.clone(),
            client.clone(),
            state.terminal.clone(),
        ));
        Ok(Self {
            bridge,
            client,
            attach_tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn bridge(&self) -> &Arc<AttachBridge> {
        &self.bridge
    }

    /// 处理文本帧
    pub async fn handle_text(&self, text: &str) -> ControlFlow<()> {
        match ClientMessage::from_text(text) {
            Ok(msg) => self.handle_message(msg).await,
            Err(e) => {
                tracing::debug!("无效的控制消息: {}", e);
                self.client.send_error(&e).await;
                ControlFlow::Continue(())
            }
        }
    }

    /// 处理二进制帧
    pub async fn handle_binary(&self, data: Bytes) -> ControlFlow<()> {
        self.handle_message(ClientMessage::from_binary(data)).await
    }

    /// 处理客户端消息，返回 Break 表示连接应结束
    pub async fn handle_message(&self, msg: ClientMessage) -> ControlFlow<()> {
        match msg {
            ClientMessage::Start { target } => {
                self.spawn_attach(target).await;
                ControlFlow::Continue(())
            }
            ClientMessage::Resize(size) => {
                self.bridge.resize(size).await;
                ControlFlow::Continue(())
            }
            ClientMessage::Input(data) => {
                self.bridge.forward_input(&data).await;
                ControlFlow::Continue(())
            }
            ClientMessage::Stop => {
                self.close(CloseReason::ClientStop).await;
                ControlFlow::Break(())
            }
        }
    }

    /// 在独立任务中附加，读循环不等待附加完成
    async fn spawn_attach(&self, target: String) {
        let bridge = self.bridge.clone();
        let client = self.client.clone();
        let task = tokio::spawn(async move {
            match bridge.start(&target).await {
                Ok(()) => {}
                // 关闭流程已经发送了状态通知
                Err(BridgeError::SessionClosed(_)) => {
                    tracing::debug!("附加被关闭中止: {}", bridge.session().id());
                }
                Err(e) => {
                    tracing::warn!("附加失败: {}", e);
                    if !client.is_closed() {
                        client.send_error(&e).await;
                    }
                }
            }
        });

        let mut tasks = self.attach_tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    /// 关闭会话并等待附加任务退出
    pub async fn close(&self, reason: CloseReason) -> bool {
        let performed = self.bridge.close(reason).await;

        let tasks = std::mem::take(&mut *self.attach_tasks.lock().await);
        for task in tasks {
            if tokio::time::timeout(ATTACH_JOIN_TIMEOUT, task).await.is_err() {
                tracing::warn!("附加任务未在超时内退出: {}", self.bridge.session().id());
            }
        }

        performed
    }
}

/// 处理一个 WebSocket 连接直到结束
pub async fn run(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();
    run_frames(stream, sink, state).await;
}

/// 在帧流上运行连接
pub async fn run_frames<R, W>(mut frames: R, sink: W, state: AppState)
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: std::fmt::Display,
{
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (client, rx) = ClientSender::channel(state.terminal.outbound_queue);

    let connection = match TerminalConnection::open(&connection_id, &state, client.clone()) {
        Ok(connection) => connection,
        Err(e) => {
            tracing::error!("注册连接失败: {}", e);
            return;
        }
    };
    tracing::info!(
        "终端连接打开: {} (会话 {})",
        connection_id,
        connection.bridge().session().id()
    );

    let closed = client.closed_token();
    let writer = tokio::spawn(write_loop(sink, rx, closed.clone()));

    loop {
        let frame = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            frame = frames.next() => frame,
        };

        let flow = match frame {
            Some(Ok(Message::Text(text))) => connection.handle_text(&text).await,
            Some(Ok(Message::Binary(data))) => connection.handle_binary(Bytes::from(data)).await,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => ControlFlow::Continue(()),
            Some(Err(e)) => {
                tracing::debug!("读取 WebSocket 失败: {}", e);
                break;
            }
        };

        if flow.is_break() {
            break;
        }
    }

    connection.close(CloseReason::ClientDisconnected).await;
    client.close();
    drop(connection);
    drop(client);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        tracing::debug!("写任务未在超时内结束: {}", connection_id);
    }
    tracing::info!("终端连接关闭: {}", connection_id);
}

/// 写任务：发送队列 -> WebSocket
///
/// 收到关闭信号后先发出已入队的消息，再发送 Close 帧。
async fn write_loop<W>(mut sink: W, mut rx: mpsc::Receiver<ServerMessage>, closed: CancellationToken)
where
    W: Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    loop {
        let msg = tokio::select! {
            biased;
            msg = rx.recv() => msg,
            _ = closed.cancelled() => None,
        };
        let Some(msg) = msg else { break };

        if let Err(e) = sink.send(msg.into()).await {
            tracing::debug!("写入 WebSocket 失败: {}", e);
            closed.cancel();
            return;
        }
    }

    while let Ok(msg) = rx.try_recv() {
        if sink.send(msg.into()).await.is_err() {
            return;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}
