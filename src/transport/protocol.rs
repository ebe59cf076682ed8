//! 终端会话协议
//!
//! 帧格式：
//! - 二进制帧永远是原始输入（客户端 -> 服务端）或原始输出（服务端 -> 客户端）
//! - 能解析为 JSON 对象的文本帧是控制消息
//! - 其他文本帧按原始输入处理

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::runtime::TermSize;
use crate::utils::error::BridgeError;
use crate::utils::state::SessionState;

/// 控制消息（JSON 文本帧）
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlMessage {
    Start {
        #[serde(rename = "containerId", alias = "target")]
        container_id: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    #[serde(alias = "terminate")]
    Stop,
    Input {
        /// base64 编码的输入
        data: String,
    },
}

/// 客户端消息
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// 附加到目标
    Start { target: String },
    /// 调整终端尺寸
    Resize(TermSize),
    /// 结束会话
    Stop,
    /// 原始输入
    Input(Bytes),
}

impl ClientMessage {
    /// 解析文本帧
    ///
    /// 不是 JSON 对象的文本按原始输入处理；是 JSON 对象但无法识别的返回
    /// `MalformedMessage`。
    pub fn from_text(text: &str) -> Result<Self, BridgeError> {
        let value = match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value @ serde_json::Value::Object(_)) => value,
            _ => return Ok(ClientMessage::Input(Bytes::copy_from_slice(text.as_bytes()))),
        };

        let control: ControlMessage = serde_json::from_value(value)
            .map_err(|e| BridgeError::MalformedMessage(e.to_string()))?;
        control.try_into()
    }

    /// 解析二进制帧
    pub fn from_binary(data: Bytes) -> Self {
        ClientMessage::Input(data)
    }
}

impl TryFrom<ControlMessage> for ClientMessage {
    type Error = BridgeError;

    fn try_from(control: ControlMessage) -> Result<Self, Self::Error> {
        match control {
            ControlMessage::Start { container_id } => Ok(ClientMessage::Start {
                target: container_id,
            }),
            ControlMessage::Resize { cols, rows } => {
                if cols == 0 || rows == 0 {
                    return Err(BridgeError::MalformedMessage(format!(
                        "终端尺寸必须大于 0: {}x{}",
                        cols, rows
                    )));
                }
                Ok(ClientMessage::Resize(TermSize { rows, cols }))
            }
            ControlMessage::Stop => Ok(ClientMessage::Stop),
            ControlMessage::Input { data } => base64::engine::general_purpose::STANDARD
                .decode(data.as_bytes())
                .map(|decoded| ClientMessage::Input(Bytes::from(decoded)))
                .map_err(|e| BridgeError::MalformedMessage(format!("input 不是有效的 base64: {}", e))),
        }
    }
}

/// 服务端结构化通知（JSON 文本帧）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerNotice {
    /// 错误通知，不一定结束会话
    #[serde(rename_all = "camelCase")]
    Error {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_type: Option<String>,
    },
    /// 会话状态变更
    #[serde(rename_all = "camelCase")]
    Status {
        status: SessionState,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        container_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// 服务端消息
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// 原始进程输出（二进制帧）
    Output(Bytes),
    /// 结构化通知（文本帧）
    Notice(ServerNotice),
}
