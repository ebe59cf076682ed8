//! SSH 运行时
//!
//! 配置文件 `[[hosts]]` 中登记的主机通过 SSH 访问，每个会话和每次一次性命令
//! 使用独立的连接。

pub mod auth;
pub mod client;
pub mod session;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::config::HostConfig;
use crate::utils::error::BridgeError;

use super::{InteractiveProcess, OneShotProcess, ProcessRuntime, ProcessSpec};

pub use client::{SshClient, SshClientConfig};

/// SSH 运行时
#[derive(Debug, Clone, Default)]
pub struct SshRuntime {
    /// 按名称索引的主机
    hosts: HashMap<String, HostConfig>,
    /// 交互式进程输入管道容量
    input_buffer_size: usize,
}

impl SshRuntime {
    pub fn new(hosts: &[HostConfig], input_buffer_size: usize) -> Self {
        Self {
            hosts: hosts
                .iter()
                .map(|host| (host.name.clone(), host.clone()))
                .collect(),
            input_buffer_size,
        }
    }

    /// 目标是否为已登记的主机
    pub fn knows(&self, target: &str) -> bool {
        self.hosts.contains_key(target)
    }

    async fn connect(&self, target: &str) -> Result<SshClient, BridgeError> {
        let host = self
            .hosts
            .get(target)
            .ok_or_else(|| BridgeError::target_unavailable(target, "未登记的主机"))?;

        let mut client = SshClient::new(SshClientConfig::from_host(host));
        client
            .connect()
            .await
            .map_err(|e| e.into_attach_error(target))?;
        Ok(client)
    }
}

#[async_trait]
impl ProcessRuntime for SshRuntime {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn create_interactive_process(
        &self,
        target: &str,
        spec: &ProcessSpec,
    ) -> Result<InteractiveProcess, BridgeError> {
        let client = self.connect(target).await?;
        // 远程主机使用登录 shell，ProcessSpec 中的命令只用于容器
        session::open_shell(client, spec.size, self.input_buffer_size).await
    }

    async fn run_one_shot(
        &self,
        target: &str,
        command: &[String],
    ) -> Result<OneShotProcess, BridgeError> {
        let client = self.connect(target).await?;
        session::exec_command(client, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str) -> HostConfig {
        HostConfig {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: 1,
            user: "test".to_string(),
            identity_file: None,
            password: Some("secret".to_string()),
        }
    }

    #[test]
    fn test_knows_registered_hosts() {
        let runtime = SshRuntime::new(&[host("vps-1"), host("vps-2")], 1024);
        assert!(runtime.knows("vps-1"));
        assert!(runtime.knows("vps-2"));
        assert!(!runtime.knows("web-container"));
    }

    #[tokio::test]
    async fn test_unknown_host_is_target_unavailable() {
        let runtime = SshRuntime::new(&[], 1024);
        let result = runtime.run_one_shot("nowhere", &["ls".to_string()]).await;
        assert!(matches!(result, Err(BridgeError::TargetUnavailable(_))));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_target_unavailable() {
        let runtime = SshRuntime::new(&[host("vps-1")], 1024);
        let spec = ProcessSpec {
            command: Vec::new(),
            size: Default::default(),
        };
        let result = runtime.create_interactive_process("vps-1", &spec).await;
        match result {
            Err(BridgeError::TargetUnavailable(msg)) => assert!(msg.starts_with("vps-1")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connection to port 1 should fail"),
        }
    }
}
