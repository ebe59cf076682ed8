//! 终端桥接
//!
//! 会话注册表、附加桥接和一次性命令代理。

pub mod attach;
pub mod exec;
pub mod registry;
pub mod session;

pub use attach::{AttachBridge, CloseReason};
pub use exec::{CommandProxy, ExecOutput};
pub use registry::SessionRegistry;
pub use session::{Session, SessionInfo};
