//! 工具模块
//!
//! 提供错误类型和会话状态管理。

pub mod error;
pub mod state;

pub use error::BridgeError;
pub use state::{AtomicSessionState, SessionState, StateTransitionResult};
