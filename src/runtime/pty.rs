//! 本地 PTY 实现
//!
//! 使用 portable-pty 在本地伪终端中启动命令，并把阻塞的 PTY 读写桥接到异步字节流。

use std::io::{Read, Write};

use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::Mutex;
use tokio_util::io::SyncIoBridge;

use crate::utils::error::BridgeError;

use super::{InteractiveProcess, ProcessHandle, ProcessStream, TermSize};

/// PTY 读缓冲区大小
const PTY_READ_BUFFER: usize = 4096;

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// PTY 进程句柄
pub struct PtyHandle {
    /// PTY master（用于调整大小）
    master: Mutex<Box<dyn MasterPty + Send>>,
    /// 子进程，终止后为 None
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
}

#[async_trait]
impl ProcessHandle for PtyHandle {
    async fn resize(&self, size: TermSize) -> Result<(), BridgeError> {
        let master = self.master.lock().await;
        master
            .resize(size.into())
            .map_err(|e| BridgeError::stream_error("调整 PTY 大小", &e.to_string()))?;
        tracing::debug!("调整 PTY 大小: {}x{}", size.cols, size.rows);
        Ok(())
    }

    async fn terminate(&self) -> Result<(), BridgeError> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = child.kill() {
            // 进程可能已经自行退出
            tracing::debug!("终止 PTY 子进程: {}", e);
        }

        // 回收子进程，避免僵尸进程
        tokio::task::spawn_blocking(move || match child.wait() {
            Ok(status) => tracing::debug!("PTY 子进程已退出: {:?}", status),
            Err(e) => tracing::warn!("等待 PTY 子进程失败: {}", e),
        });
        Ok(())
    }
}

/// 在本地 PTY 中启动命令
///
/// 返回的字节流由两个阻塞线程驱动：一个把 PTY 输出写入管道，
/// 一个把管道中的输入写入 PTY。`buffer_size` 是输入方向的管道容量，
/// 写满后调用方的写入会挂起。
pub fn spawn_pty(
    argv: &[String],
    size: TermSize,
    buffer_size: usize,
) -> Result<InteractiveProcess, BridgeError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| BridgeError::PtyCreationFailed("命令为空".to_string()))?;

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(size.into())
        .map_err(|e| BridgeError::PtyCreationFailed(e.to_string()))?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    cmd.env("TERM", "xterm-256color");

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| BridgeError::PtyCreationFailed(e.to_string()))?;
    // 释放 slave，子进程退出后 master 读取才会结束
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| BridgeError::PtyCreationFailed(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| BridgeError::PtyCreationFailed(e.to_string()))?;

    let (local, remote) = tokio::io::duplex(buffer_size);
    let (remote_read, remote_write) = tokio::io::split(remote);

    // SyncIoBridge 需要在运行时上下文中创建
    let output = SyncIoBridge::new(remote_write);
    let input = SyncIoBridge::new(remote_read);
    tokio::task::spawn_blocking(move || pump_output(reader, output));
    tokio::task::spawn_blocking(move || pump_input(input, writer));

    tracing::info!("PTY 进程已启动: {}", program);

    Ok(InteractiveProcess {
        handle: Box::new(PtyHandle {
            master: Mutex::new(pair.master),
            child: Mutex::new(Some(child)),
        }),
        stream: ProcessStream::from_duplex(local),
    })
}

/// PTY 输出 -> 管道
fn pump_output<W>(mut reader: Box<dyn Read + Send>, mut output: SyncIoBridge<W>)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; PTY_READ_BUFFER];

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                tracing::debug!("PTY 输出 EOF");
                break;
            }
            Ok(n) => {
                if let Err(e) = output.write_all(&buffer[..n]).and_then(|_| output.flush()) {
                    tracing::debug!("PTY 输出管道已关闭: {}", e);
                    break;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(ref e) if is_pty_hangup(e) => {
                // Linux 上子进程退出后读取 master 返回 EIO
                tracing::debug!("PTY 已挂断");
                break;
            }
            Err(e) => {
                tracing::error!("读取 PTY 输出失败: {}", e);
                break;
            }
        }
    }

    if let Err(e) = output.shutdown() {
        tracing::debug!("关闭 PTY 输出管道: {}", e);
    }
}

/// 管道 -> PTY 输入
fn pump_input<R>(mut input: SyncIoBridge<R>, mut writer: Box<dyn Write + Send>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; PTY_READ_BUFFER];

    loop {
        match input.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buffer[..n]).and_then(|_| writer.flush()) {
                    tracing::debug!("写入 PTY 失败: {}", e);
                    break;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!("PTY 输入管道已关闭: {}", e);
                break;
            }
        }
    }
}

fn is_pty_hangup(err: &std::io::Error) -> bool {
    const EIO: i32 = 5;
    cfg!(unix) && err.raw_os_error() == Some(EIO)
}
