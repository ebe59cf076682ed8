//! 附加桥接
//!
//! 管理一个会话的外部进程附加：创建进程、转发输出、写入输入、调整尺寸和关闭。
//!
//! ## 生命周期
//! - `start` 在附加超时内创建进程，成功后启动输出转发任务
//! - 输出转发任务按顺序把每个块原样发送给客户端
//! - 输入在连接读循环中直接写入进程，写不动时连接读循环随之挂起
//! - `close` 可以从任意位置、任意次数调用，资源只释放一次

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::TerminalConfig;
use crate::runtime::{InteractiveProcess, ProcessReader, ProcessRuntime, ProcessSpec, TermSize};
use crate::transport::sender::ClientSender;
use crate::utils::error::BridgeError;
use crate::utils::state::{SessionState, StateTransitionResult};

use super::registry::SessionRegistry;
use super::session::Session;

/// 关闭进程输入流的最长等待时间
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// 会话关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 客户端断开连接
    ClientDisconnected,
    /// 客户端发送 stop
    ClientStop,
    /// 进程输出 EOF
    ProcessExited,
    /// 转发过程中的 IO 失败
    StreamError(String),
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientDisconnected => "client_disconnected",
            CloseReason::ClientStop => "client_stop",
            CloseReason::ProcessExited => "process_exited",
            CloseReason::StreamError(_) => "stream_error",
        }
    }
}

/// 附加桥接
pub struct AttachBridge {
    session: Arc<Session>,
    runtime: Arc<dyn ProcessRuntime>,
    registry: SessionRegistry,
    client: ClientSender,
    config: Arc<TerminalConfig>,
}

impl AttachBridge {
    pub fn new(
        session: Arc<Session>,
        runtime: Arc<dyn ProcessRuntime>,
        registry: SessionRegistry,
        client: ClientSender,
        config: Arc<TerminalConfig>,
    ) -> Self {
        Self {
            session,
            runtime,
            registry,
            client,
            config,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// 附加到目标
    ///
    /// 只能从 Idle 附加一次；附加中或已附加时返回 `AlreadyAttached`，
    /// 失败或超时后会话回到 Idle，可以重试。附加期间调用 `close` 会立即
    /// 中止进程创建并返回 `SessionClosed`。
    pub async fn start(self: &Arc<Self>, target: &str) -> Result<(), BridgeError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(BridgeError::InvalidRequest("containerId 不能为空".to_string()));
        }

        if let StateTransitionResult::Invalid { from, reason, .. } = self
            .session
            .state
            .transition(SessionState::Idle, SessionState::Attaching)
        {
            tracing::debug!("拒绝 start: {}", reason);
            return Err(match from {
                SessionState::Closed => BridgeError::SessionClosed(self.session.id().to_string()),
                _ => BridgeError::AlreadyAttached(format!(
                    "{} ({})",
                    self.session.id(),
                    from.as_str()
                )),
            });
        }

        tracing::info!("会话 {} 附加到 {}", self.session.id(), target);

        let spec = ProcessSpec {
            command: self.config.shell.clone(),
            size: self.config.default_size(),
        };
        let attach_timeout = self.config.attach_timeout();
        let created = tokio::select! {
            biased;
            // 附加期间会话被关闭：放弃创建，资源由 close 负责
            _ = self.session.cancel.cancelled() => {
                tracing::info!("会话 {} 在附加期间被关闭，取消附加", self.session.id());
                return Err(BridgeError::SessionClosed(self.session.id().to_string()));
            }
            created = tokio::time::timeout(
                attach_timeout,
                self.runtime.create_interactive_process(target, &spec),
            ) => created,
        };

        let InteractiveProcess { handle, stream } = match created {
            Ok(Ok(process)) => process,
            Ok(Err(e)) => {
                self.rollback_attach();
                return Err(e.into_attach_error(target));
            }
            Err(_) => {
                self.rollback_attach();
                return Err(BridgeError::target_unavailable(
                    target,
                    &format!("附加超时 ({}秒)", attach_timeout.as_secs()),
                ));
            }
        };

        self.session.set_target(target);
        self.session.install(handle, stream.writer).await;

        if self
            .session
            .state
            .transition(SessionState::Attaching, SessionState::Attached)
            .is_invalid()
        {
            // 创建进程期间会话被关闭，释放刚创建的进程
            tracing::info!("会话 {} 在附加期间被关闭", self.session.id());
            let (handle, _writer) = self.session.take_resources().await;
            if let Some(handle) = handle {
                if let Err(e) = handle.terminate().await {
                    tracing::warn!("终止进程失败: {}", e);
                }
            }
            return Err(BridgeError::SessionClosed(self.session.id().to_string()));
        }

        self.client
            .send_status(
                SessionState::Attached,
                self.session.id(),
                Some(target),
                None,
            )
            .await;

        tokio::spawn(self.clone().forward_output(stream.reader));
        Ok(())
    }

    fn rollback_attach(&self) {
        let result = self
            .session
            .state
            .transition(SessionState::Attaching, SessionState::Idle);
        if result.is_invalid() {
            tracing::debug!("会话 {} 附加失败时已关闭", self.session.id());
        }
    }

    /// 输出转发：进程 -> 客户端
    async fn forward_output(self: Arc<Self>, mut reader: ProcessReader) {
        let cancel = self.session.cancel.clone();
        let capacity = self.config.read_buffer_size;
        let mut buffer = BytesMut::with_capacity(capacity);

        tracing::debug!("输出转发启动: {}", self.session.id());

        loop {
            buffer.reserve(capacity);
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                read = reader.read_buf(&mut buffer) => read,
            };

            match read {
                Ok(0) => {
                    tracing::info!("进程输出 EOF: {}", self.session.id());
                    self.close(CloseReason::ProcessExited).await;
                    break;
                }
                Ok(n) => {
                    tracing::trace!("转发输出: {} bytes", n);
                    let chunk = buffer.split().freeze();
                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        sent = self.client.send_output(chunk) => sent,
                    };
                    if sent.is_err() {
                        self.close(CloseReason::ClientDisconnected).await;
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("读取进程输出失败: {}: {}", self.session.id(), e);
                    self.close(CloseReason::StreamError(format!("读取进程输出失败: {}", e)))
                        .await;
                    break;
                }
            }
        }

        tracing::debug!("输出转发结束: {}", self.session.id());
    }

    /// 输入转发：客户端 -> 进程
    ///
    /// 未附加时丢弃输入。写入在 `input_stall_timeout` 内无法完成时关闭会话。
    pub async fn forward_input(&self, data: &[u8]) {
        if self.session.state() != SessionState::Attached {
            tracing::debug!(
                "会话 {} 未附加，丢弃输入 {} bytes",
                self.session.id(),
                data.len()
            );
            return;
        }

        let stall_timeout = self.config.input_stall_timeout();
        let result = {
            let mut guard = self.session.writer().lock().await;
            let Some(writer) = guard.as_mut() else {
                return;
            };

            tokio::select! {
                biased;
                _ = self.session.cancel.cancelled() => return,
                written = tokio::time::timeout(stall_timeout, async {
                    writer.write_all(data).await?;
                    writer.flush().await
                }) => written,
            }
        };

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.close(CloseReason::StreamError(format!("写入进程输入失败: {}", e)))
                    .await;
            }
            Err(_) => {
                tracing::warn!("会话 {} 输入写入停滞", self.session.id());
                self.close(CloseReason::StreamError(format!(
                    "进程 {}秒 内未读取输入",
                    stall_timeout.as_secs()
                )))
                .await;
            }
        }
    }

    /// 调整终端尺寸
    ///
    /// 仅在 Attached 时生效，失败时通知客户端但不关闭会话。
    pub async fn resize(&self, size: TermSize) {
        if self.session.state() != SessionState::Attached {
            tracing::debug!("会话 {} 未附加，忽略 resize", self.session.id());
            return;
        }

        let guard = self.session.process().lock().await;
        if let Some(handle) = guard.as_ref() {
            if let Err(e) = handle.resize(size).await {
                tracing::warn!("调整终端尺寸失败: {}", e);
                self.client.send_error(&e).await;
            }
        }
    }

    /// 关闭会话
    ///
    /// 并发调用时只有一个调用者执行释放，返回值表示本次调用是否执行了释放。
    pub async fn close(&self, reason: CloseReason) -> bool {
        let Some(previous) = self.session.state.close() else {
            return false;
        };

        tracing::info!(
            "关闭会话 {} ({:?} -> Closed): {}",
            self.session.id(),
            previous,
            reason.as_str()
        );

        self.session.cancel.cancel();

        let (handle, writer) = self.session.take_resources().await;
        if let Some(mut writer) = writer {
            let _ = tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, writer.shutdown()).await;
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.terminate().await {
                tracing::warn!("终止进程失败: {}", e);
            }
        }

        self.registry.remove(self.session.connection_id());

        if reason != CloseReason::ClientDisconnected {
            if let CloseReason::StreamError(message) = &reason {
                self.client
                    .send_error(&BridgeError::StreamError(message.clone()))
                    .await;
            }
            self.client
                .send_status(
                    SessionState::Closed,
                    self.session.id(),
                    self.session.target(),
                    Some(reason.as_str()),
                )
                .await;
        }
        self.client.close();

        true
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use crate::transport::protocol::{ServerMessage, ServerNotice};
    use proptest::prelude::*;

    fn chunks_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
        prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..16)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// 两个方向上的字节都按产生顺序到达
        #[test]
        fn prop_order_preserved(input in chunks_strategy(), output in chunks_strategy()) {
            tokio_test::block_on(async move {
                let fake = Arc::new(FakeRuntime::new(&["web-1"]));
                let registry = SessionRegistry::new();
                let session = registry.register("conn").unwrap();
                let (client, mut rx) = ClientSender::channel(1024);
                let bridge = Arc::new(AttachBridge::new(
                    session,
                    fake.clone(),
                    registry,
                    client,
                    Arc::new(TerminalConfig::default()),
                ));

                bridge.start("web-1").await.unwrap();
                let mut process = fake.take_process().unwrap();
                assert!(matches!(rx.recv().await, Some(ServerMessage::Notice(ServerNotice::Status { .. }))));

                let expected_in: Vec<u8> = input.concat();
                let expected_out: Vec<u8> = output.concat();

                let (mut proc_read, mut proc_write) = tokio::io::split(&mut process);
                let writer = async {
                    for chunk in &output {
                        proc_write.write_all(chunk).await.unwrap();
                    }
                };
                let reader = async {
                    let mut buf = vec![0u8; expected_in.len()];
                    proc_read.read_exact(&mut buf).await.unwrap();
                    buf
                };
                let sender = async {
                    for chunk in &input {
                        bridge.forward_input(chunk).await;
                    }
                };
                let collector = async {
                    let mut collected = Vec::new();
                    while collected.len() < expected_out.len() {
                        match rx.recv().await {
                            Some(ServerMessage::Output(chunk)) => collected.extend_from_slice(&chunk),
                            other => panic!("unexpected message: {:?}", other),
                        }
                    }
                    collected
                };

                let (_, received_in, _, received_out) = tokio::join!(writer, reader, sender, collector);
                assert_eq!(received_in, expected_in);
                assert_eq!(received_out, expected_out);
            });
        }
    }
}
