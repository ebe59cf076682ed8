//! 会话注册表
//!
//! 连接 ID -> 会话 的并发映射。注册表只持有弱引用，会话的生命周期由连接决定。

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::utils::error::BridgeError;

use super::session::{Session, SessionInfo};

/// 会话注册表
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Weak<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为连接创建 Idle 会话
    ///
    /// 连接 ID 已存在且会话仍存活时返回 `DuplicateConnection`。
    pub fn register(&self, connection_id: &str) -> Result<Arc<Session>, BridgeError> {
        match self.sessions.entry(connection_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().strong_count() > 0 {
                    return Err(BridgeError::DuplicateConnection(connection_id.to_string()));
                }
                tracing::debug!("替换已失效的会话条目: {}", connection_id);
                let session = Arc::new(Session::new(connection_id));
                entry.insert(Arc::downgrade(&session));
                Ok(session)
            }
            Entry::Vacant(entry) => {
                let session = Arc::new(Session::new(connection_id));
                entry.insert(Arc::downgrade(&session));
                tracing::info!("注册会话: {} (连接 {})", session.id(), connection_id);
                Ok(session)
            }
        }
    }

    /// 查找连接对应的会话
    pub fn lookup(&self, connection_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(connection_id)
            .and_then(|entry| entry.value().upgrade())
    }

    /// 删除条目，不释放会话资源
    pub fn remove(&self, connection_id: &str) {
        if self.sessions.remove(connection_id).is_some() {
            tracing::debug!("移除会话条目: {}", connection_id);
        }
    }

    /// 列出存活的会话
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .map(|session| session.info())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    /// 条目数量
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = SessionRegistry::new();
        let session = registry.register("conn-1").unwrap();

        let found = registry.lookup("conn-1").unwrap();
        assert!(Arc::ptr_eq(&session, &found));
        assert!(registry.lookup("conn-2").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_duplicate() {
        let registry = SessionRegistry::new();
        let _session = registry.register("conn-1").unwrap();

        let result = registry.register("conn-1");
        assert!(matches!(result, Err(BridgeError::DuplicateConnection(_))));
    }

    #[test]
    fn test_register_replaces_dead_entry() {
        let registry = SessionRegistry::new();
        let session = registry.register("conn-1").unwrap();
        drop(session);

        assert!(registry.lookup("conn-1").is_none());
        assert!(registry.register("conn-1").is_ok());
    }

    #[test]
    fn test_remove_does_not_drop_session() {
        let registry = SessionRegistry::new();
        let session = registry.register("conn-1").unwrap();

        registry.remove("conn-1");
        registry.remove("conn-1");

        assert!(registry.lookup("conn-1").is_none());
        assert!(registry.is_empty());
        assert_eq!(session.connection_id(), "conn-1");
    }

    #[test]
    fn test_list_skips_dead_sessions() {
        let registry = SessionRegistry::new();
        let alive = registry.register("conn-1").unwrap();
        let dead = registry.register("conn-2").unwrap();
        drop(dead);

        let list = registry.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, alive.id());
    }

    #[test]
    fn test_concurrent_register_remove() {
        let registry = SessionRegistry::new();
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let id = format!("conn-{}-{}", t, i);
                        let session = registry.register(&id).unwrap();
                        assert!(registry.lookup(&id).is_some());
                        registry.remove(&id);
                        drop(session);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
