//! Docker 运行时
//!
//! 通过 docker CLI 访问容器：交互式会话在本地 PTY 中运行 `docker exec -i -t`，
//! 调整 PTY 大小时 docker 会把新尺寸转发给容器；一次性命令直接运行 `docker exec`。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tokio::process::Command;
use tokio_util::io::ReaderStream;

use crate::config::DockerConfig;
use crate::utils::error::BridgeError;

use super::pty::spawn_pty;
use super::{InteractiveProcess, OneShotProcess, ProcessRuntime, ProcessSpec};

/// Docker 运行时
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    /// docker 可执行文件
    binary: String,
    /// 容器状态探测超时
    probe_timeout: Duration,
    /// 交互式进程输入管道容量
    input_buffer_size: usize,
}

impl DockerRuntime {
    pub fn new(config: &DockerConfig, input_buffer_size: usize) -> Self {
        Self {
            binary: config.binary.clone(),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            input_buffer_size,
        }
    }

    /// 交互式会话的 docker 参数
    pub fn interactive_args(container: &str, shell: &[String]) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "-i".to_string(),
            "-t".to_string(),
            container.to_string(),
        ];
        args.extend(shell.iter().cloned());
        args
    }

    /// 一次性命令的 docker 参数
    pub fn one_shot_args(container: &str, command: &[String]) -> Vec<String> {
        let mut args = vec!["exec".to_string(), container.to_string()];
        args.extend(command.iter().cloned());
        args
    }

    /// 确认容器存在且正在运行
    async fn probe(&self, container: &str) -> Result<(), BridgeError> {
        let output = Command::new(&self.binary)
            .args(["inspect", "--format", "{{.State.Running}}", container])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.probe_timeout, output)
            .await
            .map_err(|_| {
                BridgeError::target_unavailable(
                    container,
                    &format!("探测容器超时 ({}秒)", self.probe_timeout.as_secs()),
                )
            })?
            .map_err(|e| {
                BridgeError::target_unavailable(container, &format!("无法执行 docker: {}", e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BridgeError::target_unavailable(container, stderr.trim()));
        }

        if String::from_utf8_lossy(&output.stdout).trim() != "true" {
            return Err(BridgeError::target_unavailable(container, "容器未运行"));
        }

        Ok(())
    }
}

/// 校验容器名称或 ID
///
/// 只接受 docker 名称字符集，并且不能以 `-` 开头（避免被当作参数）。
pub fn validate_container_ref(target: &str) -> Result<(), BridgeError> {
    let mut chars = target.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphanumeric()
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(BridgeError::InvalidRequest(format!(
            "无效的容器标识: {:?}",
            target
        )))
    }
}

#[async_trait]
impl ProcessRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create_interactive_process(
        &self,
        target: &str,
        spec: &ProcessSpec,
    ) -> Result<InteractiveProcess, BridgeError> {
        validate_container_ref(target)?;
        self.probe(target).await?;

        let mut argv = vec![self.binary.clone()];
        argv.extend(Self::interactive_args(target, &spec.command));

        tracing::info!("附加到容器: {}", target);
        spawn_pty(&argv, spec.size, self.input_buffer_size)
    }

    async fn run_one_shot(
        &self,
        target: &str,
        command: &[String],
    ) -> Result<OneShotProcess, BridgeError> {
        validate_container_ref(target)?;
        self.probe(target).await?;

        let mut child = Command::new(&self.binary)
            .args(Self::one_shot_args(target, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::execution_failed("启动 docker exec", &e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::execution_failed("获取 stdout", "管道不可用"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::execution_failed("获取 stderr", "管道不可用"))?;

        tracing::debug!("在容器 {} 中执行: {:?}", target, command);

        let output = futures::stream::select(ReaderStream::new(stdout), ReaderStream::new(stderr));
        let exit_code = async move {
            let status = child
                .wait()
                .await
                .map_err(|e| BridgeError::execution_failed("等待 docker exec", &e.to_string()))?;
            // 被信号终止时没有退出码
            Ok(status.code().unwrap_or(-1))
        };

        Ok(OneShotProcess {
            output: output.boxed(),
            exit_code: exit_code.boxed(),
        })
    }
}
