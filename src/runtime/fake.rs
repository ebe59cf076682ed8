//! 测试用运行时
//!
//! 用内存管道模拟进程，测试可以拿到"进程"一端直接读写。

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use tokio::io::{AsyncRead, DuplexStream, ReadBuf, ReadHalf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::utils::error::BridgeError;

use super::{
    InteractiveProcess, OneShotProcess, ProcessHandle, ProcessRuntime, ProcessSpec, ProcessStream,
    TermSize,
};

pub struct FakeRuntime {
    containers: Mutex<HashSet<String>>,
    attach_delay: Option<Duration>,
    buffer_size: usize,
    processes: Mutex<VecDeque<DuplexStream>>,
    output_failure: CancellationToken,
    pub specs: Arc<Mutex<Vec<ProcessSpec>>>,
    pub resizes: Arc<Mutex<Vec<TermSize>>>,
    pub terminations: Arc<AtomicUsize>,
}

impl FakeRuntime {
    pub fn new(containers: &[&str]) -> Self {
        Self {
            containers: Mutex::new(containers.iter().map(|c| c.to_string()).collect()),
            attach_delay: None,
            buffer_size: 64 * 1024,
            processes: Mutex::new(VecDeque::new()),
            output_failure: CancellationToken::new(),
            specs: Arc::default(),
            resizes: Arc::default(),
            terminations: Arc::default(),
        }
    }

    pub fn with_attach_delay(mut self, delay: Duration) -> Self {
        self.attach_delay = Some(delay);
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn add_container(&self, name: &str) {
        self.containers.lock().unwrap().insert(name.to_string());
    }

    /// 取出最早创建的进程一端
    pub fn take_process(&self) -> Option<DuplexStream> {
        self.processes.lock().unwrap().pop_front()
    }

    pub fn resize_calls(&self) -> Vec<TermSize> {
        self.resizes.lock().unwrap().clone()
    }

    pub fn termination_count(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    /// 之后进程输出的读取都返回错误
    pub fn fail_output(&self) {
        self.output_failure.cancel();
    }

    fn check_target(&self, target: &str) -> Result<(), BridgeError> {
        if self.containers.lock().unwrap().contains(target) {
            Ok(())
        } else {
            Err(BridgeError::target_unavailable(target, "No such container"))
        }
    }
}

/// 在 `fail` 取消后返回读取错误的输出流
struct FailingReader {
    inner: ReadHalf<DuplexStream>,
    fail: CancellationToken,
    failed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl FailingReader {
    fn new(inner: ReadHalf<DuplexStream>, fail: CancellationToken) -> Self {
        Self {
            inner,
            failed: Box::pin(fail.clone().cancelled_owned()),
            fail,
        }
    }
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.fail.is_cancelled() || self.failed.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "pty read failed")));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

struct FakeHandle {
    resizes: Arc<Mutex<Vec<TermSize>>>,
    terminations: Arc<AtomicUsize>,
}

#[async_trait]
impl ProcessHandle for FakeHandle {
    async fn resize(&self, size: TermSize) -> Result<(), BridgeError> {
        self.resizes.lock().unwrap().push(size);
        Ok(())
    }

    async fn terminate(&self) -> Result<(), BridgeError> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ProcessRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create_interactive_process(
        &self,
        target: &str,
        spec: &ProcessSpec,
    ) -> Result<InteractiveProcess, BridgeError> {
        if let Some(delay) = self.attach_delay {
            tokio::time::sleep(delay).await;
        }
        self.check_target(target)?;

        let (local, remote) = tokio::io::duplex(self.buffer_size);
        let (reader, writer) = tokio::io::split(local);
        self.processes.lock().unwrap().push_back(remote);
        self.specs.lock().unwrap().push(spec.clone());

        Ok(InteractiveProcess {
            handle: Box::new(FakeHandle {
                resizes: self.resizes.clone(),
                terminations: self.terminations.clone(),
            }),
            stream: ProcessStream {
                reader: Box::new(FailingReader::new(reader, self.output_failure.clone())),
                writer: Box::new(writer),
            },
        })
    }

    async fn run_one_shot(
        &self,
        target: &str,
        command: &[String],
    ) -> Result<OneShotProcess, BridgeError> {
        self.check_target(target)?;

        let (chunks, code): (Vec<Bytes>, i32) = match command.first().map(String::as_str) {
            Some("echo") => (
                vec![Bytes::from(format!("{}\n", command[1..].join(" ")))],
                0,
            ),
            Some("false") => (Vec::new(), 1),
            Some("fail-launch") => {
                return Err(BridgeError::execution_failed("启动命令", "exec: not found"))
            }
            _ => (vec![Bytes::from_static(b"unknown command\n")], 127),
        };

        Ok(OneShotProcess {
            output: futures::stream::iter(chunks.into_iter().map(Ok)).boxed(),
            exit_code: async move { Ok(code) }.boxed(),
        })
    }
}
