//! 错误类型定义
//!
//! 定义终端桥接服务的错误类型，提供描述性错误消息。
//!
//! ## 功能
//! - 定义 BridgeError 枚举，涵盖附加、流转发、一次性执行等所有错误类型
//! - 实现错误转换（From trait）
//! - 提供错误分类和辅助方法
//! - 支持转换为客户端结构化错误消息和 HTTP 错误响应

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::transport::protocol::ServerNotice;

/// 桥接错误类型
#[derive(Debug, Error)]
pub enum BridgeError {
    /// 目标容器/主机不可达，或进程无法创建
    #[error("目标不可用: {0}")]
    TargetUnavailable(String),

    /// 会话中途的 IO 失败
    #[error("流错误: {0}")]
    StreamError(String),

    /// 一次性命令无法启动或无法收集输出
    #[error("命令执行失败: {0}")]
    ExecutionFailed(String),

    /// 无效的请求
    #[error("无效的请求: {0}")]
    InvalidRequest(String),

    /// 客户端控制消息格式错误
    #[error("消息格式错误: {0}")]
    MalformedMessage(String),

    /// 会话已经附加到进程
    #[error("会话已附加: {0}")]
    AlreadyAttached(String),

    /// 会话已关闭
    #[error("会话已关闭: {0}")]
    SessionClosed(String),

    /// 连接已注册
    #[error("连接已注册: {0}")]
    DuplicateConnection(String),

    /// PTY 创建失败
    #[error("PTY 创建失败: {0}")]
    PtyCreationFailed(String),

    /// SSH 连接失败
    #[error("SSH 连接失败: {0}")]
    SshConnectionFailed(String),

    /// 认证失败
    #[error("认证失败: {0}")]
    AuthenticationFailed(String),

    /// 连接超时
    #[error("连接超时: {0}")]
    ConnectionTimeout(String),

    /// SSH 协议错误
    #[error("SSH 错误: {0}")]
    SshError(String),

    /// 通道错误
    #[error("通道错误: {0}")]
    ChannelError(String),

    /// 私钥加载失败
    #[error("私钥加载失败: {0}")]
    PrivateKeyLoadFailed(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<russh::Error> for BridgeError {
    fn from(err: russh::Error) -> Self {
        // 将 russh 错误转换为更友好的错误消息
        let message = match &err {
            russh::Error::Disconnect => "服务器断开连接".to_string(),
            russh::Error::NoCommonKexAlgo => "无法协商密钥交换算法".to_string(),
            russh::Error::NoCommonCipher => "无法协商加密算法".to_string(),
            russh::Error::NoCommonCompression => "无法协商压缩算法".to_string(),
            russh::Error::NoCommonMac => "无法协商 MAC 算法".to_string(),
            russh::Error::NoCommonKeyAlgo => "无法协商密钥算法".to_string(),
            _ => err.to_string(),
        };
        BridgeError::SshError(message)
    }
}

impl From<&BridgeError> for ServerNotice {
    fn from(err: &BridgeError) -> Self {
        ServerNotice::Error {
            data: err.to_string(),
            error_type: Some(err.error_type().to_string()),
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("请求处理失败: {}", self);
        } else {
            tracing::debug!("请求被拒绝: {}", self);
        }

        let body = serde_json::json!({
            "error": self.summary(),
            "details": self.to_string(),
            "errorType": self.error_type(),
            "code": self.code(),
        });
        (status, Json(body)).into_response()
    }
}

impl BridgeError {
    /// 获取错误码
    pub fn code(&self) -> i32 {
        match self {
            BridgeError::TargetUnavailable(_) => 2001,
            BridgeError::StreamError(_) => 2002,
            BridgeError::ExecutionFailed(_) => 2003,
            BridgeError::InvalidRequest(_) => 2004,
            BridgeError::MalformedMessage(_) => 2005,
            BridgeError::AlreadyAttached(_) => 2006,
            BridgeError::SessionClosed(_) => 2007,
            BridgeError::DuplicateConnection(_) => 2008,
            BridgeError::PtyCreationFailed(_) => 1001,
            BridgeError::SshConnectionFailed(_) => 1002,
            BridgeError::IoError(_) => 1005,
            BridgeError::SerializationError(_) => 1006,
            BridgeError::AuthenticationFailed(_) => 1007,
            BridgeError::ConnectionTimeout(_) => 1008,
            BridgeError::SshError(_) => 1010,
            BridgeError::ChannelError(_) => 1011,
            BridgeError::PrivateKeyLoadFailed(_) => 1013,
        }
    }

    /// 获取错误类型名称
    pub fn error_type(&self) -> &'static str {
        match self {
            BridgeError::TargetUnavailable(_) => "target_unavailable",
            BridgeError::StreamError(_) => "stream_error",
            BridgeError::ExecutionFailed(_) => "execution_failed",
            BridgeError::InvalidRequest(_) => "invalid_request",
            BridgeError::MalformedMessage(_) => "malformed_message",
            BridgeError::AlreadyAttached(_) => "already_attached",
            BridgeError::SessionClosed(_) => "session_closed",
            BridgeError::DuplicateConnection(_) => "duplicate_connection",
            BridgeError::PtyCreationFailed(_) => "pty_creation_failed",
            BridgeError::SshConnectionFailed(_) => "ssh_connection_failed",
            BridgeError::IoError(_) => "io_error",
            BridgeError::SerializationError(_) => "serialization_error",
            BridgeError::AuthenticationFailed(_) => "authentication_failed",
            BridgeError::ConnectionTimeout(_) => "connection_timeout",
            BridgeError::SshError(_) => "ssh_error",
            BridgeError::ChannelError(_) => "channel_error",
            BridgeError::PrivateKeyLoadFailed(_) => "private_key_load_failed",
        }
    }

    /// 面向用户的简短描述
    pub fn summary(&self) -> &'static str {
        match self {
            BridgeError::TargetUnavailable(_) => "Target unavailable",
            BridgeError::ExecutionFailed(_) => "Failed to execute command",
            BridgeError::InvalidRequest(_) | BridgeError::MalformedMessage(_) => "Invalid request",
            BridgeError::ConnectionTimeout(_) => "Target timed out",
            _ => "Internal error",
        }
    }

    /// HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            BridgeError::InvalidRequest(_) | BridgeError::MalformedMessage(_) => {
                StatusCode::BAD_REQUEST
            }
            BridgeError::TargetUnavailable(_) => StatusCode::NOT_FOUND,
            BridgeError::ConnectionTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::SshConnectionFailed(_)
            | BridgeError::AuthenticationFailed(_)
            | BridgeError::SshError(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 检查是否为可恢复错误（客户端可以重试）
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BridgeError::TargetUnavailable(_)
                | BridgeError::ConnectionTimeout(_)
                | BridgeError::MalformedMessage(_)
                | BridgeError::AlreadyAttached(_)
                | BridgeError::AuthenticationFailed(_)
        )
    }

    /// 检查是否为认证相关错误
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            BridgeError::AuthenticationFailed(_) | BridgeError::PrivateKeyLoadFailed(_)
        )
    }

    /// 归一化为附加错误
    ///
    /// 进程创建阶段的任何失败对客户端来说都是目标不可用。
    pub fn into_attach_error(self, target: &str) -> Self {
        match self {
            BridgeError::TargetUnavailable(_) => self,
            other => BridgeError::target_unavailable(target, &other.to_string()),
        }
    }

    /// 归一化为一次性执行错误
    pub fn into_exec_error(self) -> Self {
        match self {
            BridgeError::TargetUnavailable(_)
            | BridgeError::ExecutionFailed(_)
            | BridgeError::InvalidRequest(_) => self,
            other => BridgeError::ExecutionFailed(other.to_string()),
        }
    }

    // ============ 错误构造辅助方法 ============

    /// 创建目标不可用错误
    pub fn target_unavailable(target: &str, reason: &str) -> Self {
        BridgeError::TargetUnavailable(format!("{} - {}", target, reason))
    }

    /// 创建流错误
    pub fn stream_error(operation: &str, reason: &str) -> Self {
        BridgeError::StreamError(format!("{} 失败: {}", operation, reason))
    }

    /// 创建执行失败错误
    pub fn execution_failed(operation: &str, reason: &str) -> Self {
        BridgeError::ExecutionFailed(format!("{} 失败: {}", operation, reason))
    }

    /// 创建 SSH 连接失败错误（包含主机信息）
    pub fn ssh_connection_failed(host: &str, port: u16, reason: &str) -> Self {
        BridgeError::SshConnectionFailed(format!("无法连接到 {}:{} - {}", host, port, reason))
    }

    /// 创建认证失败错误（包含认证方式）
    pub fn auth_failed(method: &str, reason: &str) -> Self {
        BridgeError::AuthenticationFailed(format!("{}认证失败: {}", method, reason))
    }

    /// 创建私钥认证失败错误
    pub fn key_auth_failed(key_path: &str, reason: &str) -> Self {
        BridgeError::AuthenticationFailed(format!("私钥认证失败 ({}): {}", key_path, reason))
    }

    /// 创建私钥加载失败错误
    pub fn key_load_failed(key_path: &str, reason: &str) -> Self {
        BridgeError::PrivateKeyLoadFailed(format!("无法加载私钥 {}: {}", key_path, reason))
    }

    /// 创建连接超时错误
    pub fn connection_timeout(host: &str, port: u16, timeout_secs: u64) -> Self {
        BridgeError::ConnectionTimeout(format!(
            "连接 {}:{} 超时 ({}秒)",
            host, port, timeout_secs
        ))
    }

    /// 创建通道错误
    pub fn channel_error(operation: &str, reason: &str) -> Self {
        BridgeError::ChannelError(format!("{} 失败: {}", operation, reason))
    }
}
