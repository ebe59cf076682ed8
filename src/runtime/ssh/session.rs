//! SSH 会话
//!
//! 把 SSH 通道适配为进程运行时：PTY + shell 通道用于交互式会话，
//! exec 通道用于一次性命令。

use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::runtime::{InteractiveProcess, OneShotProcess, ProcessHandle, ProcessStream, TermSize};
use crate::utils::error::BridgeError;

use super::client::SshClient;

/// 通道输入读取缓冲区大小
const CHANNEL_READ_BUFFER: usize = 8192;

/// 一次性命令输出队列长度
const EXEC_OUTPUT_QUEUE: usize = 64;

/// 发送给通道任务的控制请求
enum ChannelControl {
    Resize(TermSize, oneshot::Sender<Result<(), BridgeError>>),
}

/// SSH shell 进程句柄
pub struct SshProcessHandle {
    control_tx: mpsc::Sender<ChannelControl>,
    stop: CancellationToken,
}

#[async_trait::async_trait]
impl ProcessHandle for SshProcessHandle {
    async fn resize(&self, size: TermSize) -> Result<(), BridgeError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.control_tx
            .send(ChannelControl::Resize(size, ack_tx))
            .await
            .map_err(|_| BridgeError::channel_error("调整大小", "通道已关闭"))?;
        ack_rx
            .await
            .map_err(|_| BridgeError::channel_error("调整大小", "通道已关闭"))?
    }

    async fn terminate(&self) -> Result<(), BridgeError> {
        self.stop.cancel();
        Ok(())
    }
}

/// 在已连接的客户端上打开 PTY + shell 通道
pub async fn open_shell(
    client: SshClient,
    size: TermSize,
    buffer_size: usize,
) -> Result<InteractiveProcess, BridgeError> {
    let channel = client.open_session().await?;

    channel
        .request_pty(
            false,
            "xterm-256color",
            size.cols as u32,
            size.rows as u32,
            0,
            0,
            &[],
        )
        .await
        .map_err(|e| BridgeError::channel_error("请求 PTY", &e.to_string()))?;

    channel
        .request_shell(false)
        .await
        .map_err(|e| BridgeError::channel_error("请求 shell", &e.to_string()))?;

    let (local, remote) = tokio::io::duplex(buffer_size);
    let (control_tx, control_rx) = mpsc::channel(8);
    let stop = CancellationToken::new();

    tokio::spawn(run_shell_channel(client, channel, remote, control_rx, stop.clone()));

    Ok(InteractiveProcess {
        handle: Box::new(SshProcessHandle { control_tx, stop }),
        stream: ProcessStream::from_duplex(local),
    })
}

/// shell 通道任务：通道输出写入管道，管道输入写入通道
async fn run_shell_channel(
    mut client: SshClient,
    mut channel: Channel<Msg>,
    remote: DuplexStream,
    mut control_rx: mpsc::Receiver<ChannelControl>,
    stop: CancellationToken,
) {
    let host = client.config().host.clone();
    let (mut input, mut output): (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) =
        tokio::io::split(remote);
    let mut buffer = vec![0u8; CHANNEL_READ_BUFFER];
    let mut input_open = true;

    tracing::info!("SSH shell 通道启动: {}", host);

    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => {
                tracing::debug!("SSH shell 通道收到停止信号: {}", host);
                break;
            }

            Some(control) = control_rx.recv() => match control {
                ChannelControl::Resize(size, ack) => {
                    let result = channel
                        .window_change(size.cols as u32, size.rows as u32, 0, 0)
                        .await
                        .map_err(|e| BridgeError::channel_error("调整大小", &e.to_string()));
                    let _ = ack.send(result);
                }
            },

            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if let Err(e) = output.write_all(&data).await {
                        tracing::debug!("SSH 输出管道已关闭: {}", e);
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    tracing::info!("SSH shell 退出: {} (code={})", host, exit_status);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    tracing::info!("SSH 通道已结束: {}", host);
                    break;
                }
                Some(other) => {
                    tracing::debug!("SSH 通道消息: {:?}", other);
                }
            },

            read = input.read(&mut buffer), if input_open => match read {
                Ok(0) | Err(_) => {
                    input_open = false;
                    let _ = channel.eof().await;
                }
                Ok(n) => {
                    if let Err(e) = channel.data(&buffer[..n]).await {
                        tracing::warn!("发送 SSH 输入失败: {}", e);
                        break;
                    }
                }
            },
        }
    }

    let _ = channel.close().await;
    let _ = output.shutdown().await;
    if let Err(e) = client.disconnect().await {
        tracing::debug!("断开 SSH 连接: {}", e);
    }
    tracing::info!("SSH shell 通道结束: {}", host);
}

/// 在已连接的客户端上执行一次性命令
pub async fn exec_command(client: SshClient, command: &[String]) -> Result<OneShotProcess, BridgeError> {
    let channel = client
        .open_session()
        .await
        .map_err(|e| BridgeError::execution_failed("打开 exec 通道", &e.to_string()))?;

    channel
        .exec(true, shell_join(command))
        .await
        .map_err(|e| BridgeError::execution_failed("执行命令", &e.to_string()))?;

    let (output_tx, output_rx) = mpsc::channel(EXEC_OUTPUT_QUEUE);
    let (exit_tx, exit_rx) = oneshot::channel();

    tokio::spawn(run_exec_channel(client, channel, output_tx, exit_tx));

    let output = futures::stream::unfold(output_rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    let exit_code = async move {
        exit_rx
            .await
            .map_err(|_| BridgeError::execution_failed("等待退出码", "通道已关闭"))?
    };

    Ok(OneShotProcess {
        output: output.boxed(),
        exit_code: exit_code.boxed(),
    })
}

async fn run_exec_channel(
    mut client: SshClient,
    mut channel: Channel<Msg>,
    output_tx: mpsc::Sender<std::io::Result<Bytes>>,
    exit_tx: oneshot::Sender<Result<i32, BridgeError>>,
) {
    let mut exit_code = None;

    // ExitStatus 可能在 Eof 之后到达，所以一直读到 Close
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. } => {
                if output_tx.send(Ok(Bytes::copy_from_slice(&data))).await.is_err() {
                    break;
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                exit_code = Some(exit_status as i32);
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    drop(output_tx);

    let result = exit_code
        .ok_or_else(|| BridgeError::execution_failed("等待退出码", "远程进程未报告退出码"));
    let _ = exit_tx.send(result);

    if let Err(e) = client.disconnect().await {
        tracing::debug!("断开 SSH 连接: {}", e);
    }
}

/// 把 argv 拼接为远程 shell 命令行
pub fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_shell_join_plain() {
        assert_eq!(shell_join(&args(&["echo", "hi"])), "echo hi");
        assert_eq!(shell_join(&args(&["ls", "-la", "/var/log"])), "ls -la /var/log");
    }

    #[test]
    fn test_shell_join_quotes() {
        assert_eq!(shell_join(&args(&["echo", "a b"])), "echo 'a b'");
        assert_eq!(shell_join(&args(&["echo", ""])), "echo ''");
        assert_eq!(shell_join(&args(&["echo", "it's"])), "echo 'it'\\''s'");
        assert_eq!(shell_join(&args(&["sh", "-c", "ls; id"])), "sh -c 'ls; id'");
    }

    #[tokio::test]
    async fn test_resize_after_channel_gone() {
        let (control_tx, control_rx) = mpsc::channel(1);
        drop(control_rx);
        let handle = SshProcessHandle {
            control_tx,
            stop: CancellationToken::new(),
        };

        let result = handle.resize(TermSize::default()).await;
        assert!(matches!(result, Err(BridgeError::ChannelError(_))));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let (control_tx, _control_rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        let handle = SshProcessHandle {
            control_tx,
            stop: stop.clone(),
        };

        handle.terminate().await.unwrap();
        handle.terminate().await.unwrap();
        assert!(stop.is_cancelled());
    }
}
