//! 目标路由
//!
//! 已登记的 SSH 主机走 SSH 运行时，其余目标视为容器。

use async_trait::async_trait;

use crate::config::Config;
use crate::utils::error::BridgeError;

use super::{
    DockerRuntime, InteractiveProcess, OneShotProcess, ProcessRuntime, ProcessSpec, SshRuntime,
};

/// 按目标名称分发的运行时
pub struct TargetRouter {
    docker: DockerRuntime,
    ssh: SshRuntime,
}

impl TargetRouter {
    pub fn new(docker: DockerRuntime, ssh: SshRuntime) -> Self {
        Self { docker, ssh }
    }

    pub fn from_config(config: &Config) -> Self {
        let buffer = config.terminal.input_buffer_size;
        Self::new(
            DockerRuntime::new(&config.docker, buffer),
            SshRuntime::new(&config.hosts, buffer),
        )
    }

    /// 选择目标对应的运行时
    pub fn route(&self, target: &str) -> &dyn ProcessRuntime {
        if self.ssh.knows(target) {
            &self.ssh
        } else {
            &self.docker
        }
    }
}

#[async_trait]
impl ProcessRuntime for TargetRouter {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn create_interactive_process(
        &self,
        target: &str,
        spec: &ProcessSpec,
    ) -> Result<InteractiveProcess, BridgeError> {
        let runtime = self.route(target);
        tracing::debug!("目标 {} 使用 {} 运行时", target, runtime.name());
        runtime.create_interactive_process(target, spec).await
    }

    async fn run_one_shot(
        &self,
        target: &str,
        command: &[String],
    ) -> Result<OneShotProcess, BridgeError> {
        let runtime = self.route(target);
        tracing::debug!("目标 {} 使用 {} 运行时", target, runtime.name());
        runtime.run_one_shot(target, command).await
    }
}
