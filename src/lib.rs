//! Terminal Bridge 库
//!
//! 把 Web 客户端通过 WebSocket 附加到容器或 SSH 主机内的交互式 shell，
//! 并提供一次性命令执行。

pub mod bridge;
pub mod config;
pub mod runtime;
pub mod transport;
pub mod utils;
