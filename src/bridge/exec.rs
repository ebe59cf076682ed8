//! 一次性命令代理
//!
//! 在目标内执行单条命令，收集全部输出和退出码。没有会话、没有伪终端。

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;

use crate::runtime::ProcessRuntime;
use crate::utils::error::BridgeError;

/// 命令执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// stdout 和 stderr 按到达顺序合并
    pub output: Vec<u8>,
    pub exit_code: i32,
}

impl ExecOutput {
    /// 输出文本（非 UTF-8 字节会被替换）
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// 一次性命令代理
pub struct CommandProxy {
    runtime: Arc<dyn ProcessRuntime>,
    timeout: Duration,
}

impl CommandProxy {
    pub fn new(runtime: Arc<dyn ProcessRuntime>, timeout: Duration) -> Self {
        Self { runtime, timeout }
    }

    /// 执行命令
    ///
    /// 同一目标上的并发调用互相独立。
    pub async fn exec(&self, target: &str, command: &[String]) -> Result<ExecOutput, BridgeError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(BridgeError::InvalidRequest("containerId 不能为空".to_string()));
        }
        if command.iter().all(|arg| arg.is_empty()) {
            return Err(BridgeError::InvalidRequest("command 不能为空".to_string()));
        }

        tracing::info!("在 {} 中执行: {:?}", target, command);

        match tokio::time::timeout(self.timeout, self.run(target, command)).await {
            Ok(result) => result.map_err(BridgeError::into_exec_error),
            Err(_) => Err(BridgeError::ExecutionFailed(format!(
                "命令执行超时 ({}秒)",
                self.timeout.as_secs()
            ))),
        }
    }

    async fn run(&self, target: &str, command: &[String]) -> Result<ExecOutput, BridgeError> {
        let process = self.runtime.run_one_shot(target, command).await?;

        let mut output = BytesMut::new();
        let mut stream = process.output;
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| BridgeError::execution_failed("读取命令输出", &e.to_string()))?;
            output.extend_from_slice(&chunk);
        }

        let exit_code = process.exit_code.await?;
        tracing::debug!("命令退出: {} (code={})", target, exit_code);

        Ok(ExecOutput {
            output: output.to_vec(),
            exit_code,
        })
    }
}
