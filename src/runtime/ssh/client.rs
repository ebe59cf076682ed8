//! SSH 客户端
//!
//! 使用 russh 建立 SSH 连接，支持密码和私钥认证。

use std::sync::Arc;
use std::time::Duration;

use russh::client::{Config, Handle, Handler, Msg};
use russh::keys::key::PublicKey;
use russh::{Channel, Disconnect};
use tokio::net::TcpStream;

use crate::config::HostConfig;
use crate::utils::error::BridgeError;

use super::auth::{load_private_key, try_load_default_key, AuthMethod};

/// SSH 客户端配置
#[derive(Debug, Clone)]
pub struct SshClientConfig {
    /// 远程主机地址
    pub host: String,
    /// 远程端口（默认 22）
    pub port: u16,
    /// 用户名
    pub user: String,
    /// 认证方式
    pub auth_method: AuthMethod,
    /// 连接超时（秒）
    pub connect_timeout: u64,
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            user: String::new(),
            auth_method: AuthMethod::None,
            connect_timeout: 30,
        }
    }
}

impl SshClientConfig {
    /// 从主机配置创建
    pub fn from_host(host: &HostConfig) -> Self {
        let user = if host.user.is_empty() {
            whoami::username()
        } else {
            host.user.clone()
        };

        Self {
            host: host.host.clone(),
            port: host.port,
            user,
            auth_method: AuthMethod::from_host(host),
            ..Self::default()
        }
    }
}

/// SSH 客户端事件处理器
///
/// 通道数据通过 `Channel::wait` 读取，这里只处理连接级事件。
#[derive(Debug, Default)]
pub struct SshClientHandler;

#[async_trait::async_trait]
impl Handler for SshClientHandler {
    type Error = BridgeError;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        // TODO: 校验 known_hosts
        tracing::warn!("接受服务器密钥（未验证 known_hosts）");
        Ok(true)
    }
}

/// SSH 客户端
pub struct SshClient {
    /// 客户端配置
    config: SshClientConfig,
    /// SSH 会话句柄
    handle: Option<Handle<SshClientHandler>>,
}

impl SshClient {
    pub fn new(config: SshClientConfig) -> Self {
        Self {
            config,
            handle: None,
        }
    }

    /// 连接并认证
    pub async fn connect(&mut self) -> Result<(), BridgeError> {
        tracing::info!(
            "连接到 SSH 服务器: {}@{}:{}",
            self.config.user,
            self.config.host,
            self.config.port
        );

        let timeout = Duration::from_secs(self.config.connect_timeout);
        let tcp = tokio::time::timeout(
            timeout,
            TcpStream::connect((self.config.host.as_str(), self.config.port)),
        )
        .await
        .map_err(|_| {
            BridgeError::connection_timeout(
                &self.config.host,
                self.config.port,
                self.config.connect_timeout,
            )
        })?
        .map_err(|e| {
            BridgeError::ssh_connection_failed(
                &self.config.host,
                self.config.port,
                &format!("TCP 连接失败: {}", e),
            )
        })?;

        let ssh_config = Arc::new(Config::default());
        let handle = russh::client::connect_stream(ssh_config, tcp, SshClientHandler)
            .await
            .map_err(|e| {
                BridgeError::ssh_connection_failed(
                    &self.config.host,
                    self.config.port,
                    &format!("SSH 握手失败: {}", e),
                )
            })?;

        self.handle = Some(handle);
        self.authenticate().await?;

        tracing::info!("SSH 连接成功: {}@{}", self.config.user, self.config.host);
        Ok(())
    }

    async fn authenticate(&mut self) -> Result<(), BridgeError> {
        let handle = self.handle.as_mut().ok_or_else(|| {
            BridgeError::ssh_connection_failed(&self.config.host, self.config.port, "未建立连接")
        })?;
        let user = self.config.user.as_str();

        let accepted = match &self.config.auth_method {
            AuthMethod::Password(password) => {
                tracing::debug!("使用密码认证");
                handle
                    .authenticate_password(user, password)
                    .await
                    .map_err(|e| BridgeError::auth_failed("密码", &e.to_string()))?
            }
            AuthMethod::PrivateKey { path, passphrase } => {
                tracing::debug!("使用私钥认证: {}", path);
                let key = load_private_key(path, passphrase.as_deref())?;
                let accepted = handle
                    .authenticate_publickey(user, Arc::new(key))
                    .await
                    .map_err(|e| BridgeError::key_auth_failed(path, &e.to_string()))?;
                if !accepted {
                    return Err(BridgeError::key_auth_failed(path, "私钥被服务器拒绝"));
                }
                true
            }
            AuthMethod::None => {
                let mut accepted = false;
                if let Some((path, key)) = try_load_default_key() {
                    accepted = handle
                        .authenticate_publickey(user, Arc::new(key))
                        .await
                        .map_err(|e| BridgeError::key_auth_failed(&path, &e.to_string()))?;
                }
                if !accepted {
                    tracing::debug!("尝试无认证连接");
                    accepted = handle
                        .authenticate_none(user)
                        .await
                        .map_err(|e| BridgeError::auth_failed("none", &e.to_string()))?;
                }
                accepted
            }
        };

        if !accepted {
            return Err(BridgeError::AuthenticationFailed(format!(
                "{} 认证被服务器拒绝",
                self.config.auth_method.name()
            )));
        }

        tracing::info!("SSH 认证成功");
        Ok(())
    }

    /// 打开会话通道
    pub async fn open_session(&self) -> Result<Channel<Msg>, BridgeError> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| BridgeError::channel_error("打开会话", "未建立连接"))?;
        handle
            .channel_open_session()
            .await
            .map_err(|e| BridgeError::channel_error("打开会话通道", &e.to_string()))
    }

    /// 获取配置
    pub fn config(&self) -> &SshClientConfig {
        &self.config
    }

    /// 检查是否已连接
    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    /// 断开连接
    pub async fn disconnect(&mut self) -> Result<(), BridgeError> {
        if let Some(handle) = self.handle.take() {
            tracing::info!("断开 SSH 连接: {}", self.config.host);
            handle
                .disconnect(Disconnect::ByApplication, "Client disconnecting", "en")
                .await
                .map_err(|e| BridgeError::SshConnectionFailed(format!("断开连接失败: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for SshClient {
    fn drop(&mut self) {
        if self.handle.is_some() {
            tracing::warn!("SSH 客户端被丢弃但未断开连接");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_config() -> HostConfig {
        HostConfig {
            name: "vps".to_string(),
            host: "example.com".to_string(),
            port: 2222,
            user: "deploy".to_string(),
            identity_file: None,
            password: Some("secret".to_string()),
        }
    }

    #[test]
    fn test_ssh_client_config_default() {
        let config = SshClientConfig::default();
        assert_eq!(config.port, 22);
        assert_eq!(config.connect_timeout, 30);
        assert!(config.host.is_empty());
    }

    #[test]
    fn test_ssh_client_config_from_host() {
        let config = SshClientConfig::from_host(&host_config());
        assert_eq!(config.host, "example.com");
        assert_eq!(config.port, 2222);
        assert_eq!(config.user, "deploy");
        assert!(matches!(config.auth_method, AuthMethod::Password(_)));
    }

    #[test]
    fn test_ssh_client_config_default_user() {
        let mut host = host_config();
        host.user.clear();
        let config = SshClientConfig::from_host(&host);
        assert!(!config.user.is_empty());
    }

    #[test]
    fn test_ssh_client_not_connected_initially() {
        let client = SshClient::new(SshClientConfig::from_host(&host_config()));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_open_session_without_connection() {
        let client = SshClient::new(SshClientConfig::default());
        let result = client.open_session().await;
        assert!(matches!(result, Err(BridgeError::ChannelError(_))));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // 绑定后立即释放，得到一个没有监听者的端口
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = SshClient::new(SshClientConfig {
            host: "127.0.0.1".to_string(),
            port,
            user: "test".to_string(),
            connect_timeout: 5,
            ..SshClientConfig::default()
        });
        let result = client.connect().await;
        assert!(matches!(result, Err(BridgeError::SshConnectionFailed(_))));
        assert!(!client.is_connected());
    }
}
