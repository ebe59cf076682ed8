//! 会话状态管理
//!
//! 提供会话状态转换逻辑，以原子操作保证状态只能按规则推进。
//!
//! ## 功能
//! - 定义有效的状态转换规则
//! - 提供无锁的状态转换（compare-and-swap）
//! - 提供一次性关闭转换，保证资源最多释放一次
//! - 记录状态变更日志

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// 会话状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SessionState {
    /// 连接已打开，尚未附加进程
    Idle = 0,
    /// 正在创建进程（start 已收到，进程尚未就绪）
    Attaching = 1,
    /// 进程运行中，转发已启动
    Attached = 2,
    /// 终态，所有资源已释放
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Idle,
            1 => SessionState::Attaching,
            2 => SessionState::Attached,
            _ => SessionState::Closed,
        }
    }

    /// 状态名称
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Attaching => "attaching",
            SessionState::Attached => "attached",
            SessionState::Closed => "closed",
        }
    }

    /// 检查状态转换是否有效
    ///
    /// 状态转换规则：
    /// - Idle -> Attaching, Closed
    /// - Attaching -> Attached, Idle（附加失败回退）, Closed
    /// - Attached -> Closed
    /// - Closed -> (终态，不能转换)
    pub fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
        match from {
            SessionState::Idle => matches!(to, SessionState::Attaching | SessionState::Closed),
            SessionState::Attaching => matches!(
                to,
                SessionState::Attached | SessionState::Idle | SessionState::Closed
            ),
            SessionState::Attached => matches!(to, SessionState::Closed),
            SessionState::Closed => false,
        }
    }
}

/// 状态转换结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateTransitionResult {
    /// 转换成功
    Success,
    /// 转换无效（当前状态不允许转换到目标状态）
    Invalid {
        from: SessionState,
        to: SessionState,
        reason: String,
    },
}

impl StateTransitionResult {
    /// 检查转换是否成功
    pub fn is_success(&self) -> bool {
        matches!(self, StateTransitionResult::Success)
    }

    /// 检查转换是否失败
    pub fn is_invalid(&self) -> bool {
        matches!(self, StateTransitionResult::Invalid { .. })
    }
}

/// 原子会话状态
///
/// 所有转换都是 compare-and-swap，多个任务并发推进时只有一个能成功。
#[derive(Debug)]
pub struct AtomicSessionState {
    state: AtomicU8,
    /// 会话 ID（用于日志）
    session_id: String,
}

impl AtomicSessionState {
    /// 创建处于 Idle 状态的状态机
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            state: AtomicU8::new(SessionState::Idle as u8),
            session_id: session_id.into(),
        }
    }

    /// 获取当前状态
    pub fn load(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 尝试从 `from` 转换到 `to`
    ///
    /// 只有当前状态恰好为 `from` 且规则允许时才会成功。
    pub fn transition(&self, from: SessionState, to: SessionState) -> StateTransitionResult {
        if !SessionState::is_valid_transition(from, to) {
            return StateTransitionResult::Invalid {
                from,
                to,
                reason: format!("不允许从 {:?} 转换到 {:?}", from, to),
            };
        }

        match self.state.compare_exchange(
            from as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                tracing::debug!("会话 {} 状态转换: {:?} -> {:?}", self.session_id, from, to);
                StateTransitionResult::Success
            }
            Err(actual) => {
                let actual = SessionState::from_u8(actual);
                StateTransitionResult::Invalid {
                    from: actual,
                    to,
                    reason: Self::invalid_reason(actual, to),
                }
            }
        }
    }

    /// 一次性关闭转换
    ///
    /// 返回关闭前的状态；如果已经关闭则返回 `None`。
    /// 并发调用时恰好一个调用者得到 `Some`。
    pub fn close(&self) -> Option<SessionState> {
        let previous = SessionState::from_u8(
            self.state.swap(SessionState::Closed as u8, Ordering::AcqRel),
        );
        if previous == SessionState::Closed {
            None
        } else {
            tracing::debug!("会话 {} 状态转换: {:?} -> Closed", self.session_id, previous);
            Some(previous)
        }
    }

    /// 检查会话是否已处于终态
    pub fn is_closed(&self) -> bool {
        self.load() == SessionState::Closed
    }

    fn invalid_reason(actual: SessionState, to: SessionState) -> String {
        match actual {
            SessionState::Closed => "会话已关闭，不能再转换状态".to_string(),
            SessionState::Attached | SessionState::Attaching => {
                format!("会话已处于 {:?} 状态", actual)
            }
            SessionState::Idle => format!("不允许从 {:?} 转换到 {:?}", actual, to),
        }
    }
}
