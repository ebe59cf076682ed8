//! WebSocket 传输层
//!
//! 终端协议的编解码、出站消息队列、连接处理和 HTTP 路由。

pub mod connection;
pub mod protocol;
pub mod sender;
pub mod server;

pub use protocol::{ClientMessage, ServerMessage, ServerNotice};
pub use sender::ClientSender;
pub use server::{router, serve, AppState};
