//! 配置管理
//!
//! 从 TOML 文件加载服务配置，默认路径为 `~/.config/terminal-bridge/config.toml`。
//! 文件不存在时使用默认配置，环境变量 `TERMINAL_BRIDGE_*` 优先于文件。

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::TermSize;

/// 配置校验错误
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen 不是有效的地址: {0}")]
    InvalidListenAddr(String),

    #[error("log_level 必须是 trace, debug, info, warn, error 之一，实际为 {0}")]
    InvalidLogLevel(String),

    #[error("shell 命令不能为空")]
    EmptyShell,

    #[error("{0} 必须大于 0")]
    ZeroValue(&'static str),

    #[error("主机名重复: {0}")]
    DuplicateHost(String),

    #[error("主机 {0} 缺少 host 或 user")]
    IncompleteHost(String),
}

/// 合法的日志级别
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// 服务配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP 服务配置
    pub server: ServerConfig,

    /// 交互式终端配置
    pub terminal: TerminalConfig,

    /// 一次性执行配置
    pub exec: ExecConfig,

    /// Docker 运行时配置
    pub docker: DockerConfig,

    /// 通过 SSH 访问的主机
    pub hosts: Vec<HostConfig>,
}

/// HTTP 服务配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听地址
    pub listen: String,

    /// 日志级别
    pub log_level: String,
}

/// 交互式终端配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalConfig {
    /// 在目标内启动的 shell 命令
    pub shell: Vec<String>,

    /// 附加超时（秒）
    pub attach_timeout_secs: u64,

    /// 输入写入无进展的最长时间（秒）
    pub input_stall_timeout_secs: u64,

    /// 输出读取缓冲区大小
    pub read_buffer_size: usize,

    /// 进程输入管道容量
    pub input_buffer_size: usize,

    /// 每个连接的出站消息队列长度
    pub outbound_queue: usize,

    /// 默认列数
    pub default_cols: u16,

    /// 默认行数
    pub default_rows: u16,
}

/// 一次性执行配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecConfig {
    /// 命令执行超时（秒）
    pub timeout_secs: u64,
}

/// Docker 运行时配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DockerConfig {
    /// docker 可执行文件
    pub binary: String,

    /// 容器状态探测超时（秒）
    pub probe_timeout_secs: u64,
}

/// SSH 主机配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    /// 目标名称（客户端 start 消息中使用）
    pub name: String,

    /// 主机地址
    pub host: String,

    /// 端口
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// 用户名
    pub user: String,

    /// 私钥路径
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    /// 密码
    #[serde(default)]
    pub password: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3001".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "TERM=xterm-256color; export TERM; exec /bin/sh".to_string(),
            ],
            attach_timeout_secs: 10,
            input_stall_timeout_secs: 5,
            read_buffer_size: 8192,
            input_buffer_size: 64 * 1024,
            outbound_queue: 256,
            default_cols: 80,
            default_rows: 24,
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self { timeout_secs: 300 }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            probe_timeout_secs: 10,
        }
    }
}

impl TerminalConfig {
    pub fn attach_timeout(&self) -> Duration {
        Duration::from_secs(self.attach_timeout_secs)
    }

    pub fn input_stall_timeout(&self) -> Duration {
        Duration::from_secs(self.input_stall_timeout_secs)
    }

    pub fn default_size(&self) -> TermSize {
        TermSize {
            rows: self.default_rows,
            cols: self.default_cols,
        }
    }
}

impl ExecConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// 默认配置文件路径
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("terminal-bridge")
        .join("config.toml")
}

impl Config {
    /// 应用环境变量覆盖
    ///
    /// 支持的变量：
    /// - TERMINAL_BRIDGE_LISTEN: 监听地址
    /// - TERMINAL_BRIDGE_LOG_LEVEL: 日志级别
    /// - TERMINAL_BRIDGE_DOCKER: docker 可执行文件
    pub fn apply_env_overrides(&mut self) {
        if let Some(listen) = env_override("TERMINAL_BRIDGE_LISTEN") {
            tracing::info!("环境变量覆盖 listen: {}", listen);
            self.server.listen = listen;
        }

        if let Some(level) = env_override("TERMINAL_BRIDGE_LOG_LEVEL") {
            tracing::info!("环境变量覆盖 log_level: {}", level);
            self.server.log_level = level;
        }

        if let Some(binary) = env_override("TERMINAL_BRIDGE_DOCKER") {
            tracing::info!("环境变量覆盖 docker.binary: {}", binary);
            self.docker.binary = binary;
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(self.server.listen.clone()));
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        if self.terminal.shell.is_empty() {
            return Err(ConfigError::EmptyShell);
        }

        let positive = [
            ("terminal.attach_timeout_secs", self.terminal.attach_timeout_secs as usize),
            ("terminal.input_stall_timeout_secs", self.terminal.input_stall_timeout_secs as usize),
            ("terminal.read_buffer_size", self.terminal.read_buffer_size),
            ("terminal.input_buffer_size", self.terminal.input_buffer_size),
            ("terminal.outbound_queue", self.terminal.outbound_queue),
            ("terminal.default_cols", self.terminal.default_cols as usize),
            ("terminal.default_rows", self.terminal.default_rows as usize),
            ("exec.timeout_secs", self.exec.timeout_secs as usize),
            ("docker.probe_timeout_secs", self.docker.probe_timeout_secs as usize),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::ZeroValue(name));
            }
        }

        let mut names = HashSet::new();
        for host in &self.hosts {
            if host.host.is_empty() || host.user.is_empty() {
                return Err(ConfigError::IncompleteHost(host.name.clone()));
            }
            if !names.insert(host.name.as_str()) {
                return Err(ConfigError::DuplicateHost(host.name.clone()));
            }
        }

        Ok(())
    }

    /// 从文件加载配置
    ///
    /// 文件不存在时返回默认配置。
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("配置文件不存在 {:?}，使用默认配置", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))
    }

    /// 从 TOML 字符串解析配置
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("无效的 TOML 配置: {}", format_toml_error(&e)))
    }
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (位置 {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.listen, "127.0.0.1:3001");
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.terminal.attach_timeout(), Duration::from_secs(10));
        assert_eq!(config.exec.timeout(), Duration::from_secs(300));
        assert_eq!(config.terminal.default_size(), TermSize { rows: 24, cols: 80 });
        assert_eq!(config.docker.binary, "docker");
        assert!(config.hosts.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_shell_sets_term() {
        let config = TerminalConfig::default();
        assert_eq!(config.shell[0], "/bin/sh");
        assert!(config.shell[2].contains("TERM=xterm-256color"));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[server]
listen = "0.0.0.0:8080"

[terminal]
attach_timeout_secs = 3

[[hosts]]
name = "vps-1"
host = "10.0.0.5"
user = "root"
identity_file = "/root/.ssh/id_ed25519"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.terminal.attach_timeout_secs, 3);
        assert_eq!(config.terminal.input_stall_timeout_secs, 5);
        assert_eq!(config.hosts.len(), 1);
        assert_eq!(config.hosts[0].port, 22);
        assert_eq!(
            config.hosts[0].identity_file,
            Some(PathBuf::from("/root/.ssh/id_ed25519"))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid() {
        let result = Config::from_toml("[server\nlisten = ");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("TOML"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let path = std::env::temp_dir().join("terminal-bridge-missing-config.toml");
        let config = Config::load(&path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!(
            "terminal-bridge-config-{}.toml",
            uuid::Uuid::new_v4()
        ));
        fs::write(&path, "[exec]\ntimeout_secs = 30\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.exec.timeout_secs, 30);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_validate_invalid_listen() {
        let mut config = Config::default();
        config.server.listen = "not-an-addr".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidListenAddr("not-an-addr".to_string()))
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.server.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.server.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_validate_zero_values() {
        let mut config = Config::default();
        config.terminal.outbound_queue = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroValue("terminal.outbound_queue"))
        );

        let mut config = Config::default();
        config.terminal.shell.clear();
        assert_eq!(config.validate(), Err(ConfigError::EmptyShell));
    }

    #[test]
    fn test_validate_hosts() {
        let host = HostConfig {
            name: "vps".to_string(),
            host: "example.com".to_string(),
            port: 22,
            user: "root".to_string(),
            identity_file: None,
            password: None,
        };

        let mut config = Config::default();
        config.hosts = vec![host.clone(), host.clone()];
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateHost("vps".to_string()))
        );

        let mut incomplete = host;
        incomplete.user.clear();
        config.hosts = vec![incomplete];
        assert_eq!(
            config.validate(),
            Err(ConfigError::IncompleteHost("vps".to_string()))
        );
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("terminal-bridge/config.toml"));
    }
}
