//! 进程运行时
//!
//! 定义终端桥接使用的外部进程抽象：交互式进程（带伪终端）和一次性进程。
//! 具体实现有 Docker（本地 PTY 中运行 `docker exec`）和 SSH 主机。

pub mod docker;
pub mod pty;
pub mod router;
pub mod ssh;

#[cfg(test)]
pub mod fake;

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};

use crate::utils::error::BridgeError;

pub use docker::DockerRuntime;
pub use router::TargetRouter;
pub use ssh::SshRuntime;

/// 终端尺寸
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TermSize {
    /// 行数
    pub rows: u16,
    /// 列数
    pub cols: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// 交互式进程规格
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// 在目标内执行的 shell 命令
    pub command: Vec<String>,
    /// 初始终端尺寸
    pub size: TermSize,
}

pub type ProcessReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ProcessWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 进程的双向字节流
pub struct ProcessStream {
    /// 进程输出
    pub reader: ProcessReader,
    /// 进程输入
    pub writer: ProcessWriter,
}

impl ProcessStream {
    /// 从内存管道的一端构造
    pub fn from_duplex(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// 外部进程句柄
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// 调整伪终端尺寸
    async fn resize(&self, size: TermSize) -> Result<(), BridgeError>;

    /// 终止进程并回收资源
    ///
    /// 多次调用是安全的。
    async fn terminate(&self) -> Result<(), BridgeError>;
}

/// 交互式进程：句柄和字节流分开持有
pub struct InteractiveProcess {
    pub handle: Box<dyn ProcessHandle>,
    pub stream: ProcessStream,
}

/// 一次性进程
pub struct OneShotProcess {
    /// 合并后的 stdout/stderr，按到达顺序
    pub output: BoxStream<'static, io::Result<Bytes>>,
    /// 进程退出码
    pub exit_code: BoxFuture<'static, Result<i32, BridgeError>>,
}

/// 进程运行时
#[async_trait]
pub trait ProcessRuntime: Send + Sync {
    /// 运行时名称（用于日志）
    fn name(&self) -> &'static str;

    /// 在目标内创建带伪终端的交互式 shell
    async fn create_interactive_process(
        &self,
        target: &str,
        spec: &ProcessSpec,
    ) -> Result<InteractiveProcess, BridgeError>;

    /// 在目标内执行一次性命令
    async fn run_one_shot(
        &self,
        target: &str,
        command: &[String],
    ) -> Result<OneShotProcess, BridgeError>;
}
