//! 会话监管：每个会话一个对话窗口锁 + 取消令牌
//!
//! 同一会话内的交互通过窗口锁串行化；不同会话之间并发执行。
//! 取消某个会话只影响该会话正在进行的交互，之后的交互拿到新的令牌。
//! 空闲超过 idle_timeout 且无人持有的会话在下次获取会话时被回收。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::context::ContextWindow;

const DEFAULT_IDLE_SECS: u64 = 30 * 60;

/// 单个会话的共享状态
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub session_id: String,
    /// 持有期间同一会话的其它交互会等待
    pub window: Arc<tokio::sync::Mutex<ContextWindow>>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// 本次交互使用的取消令牌（会话取消或进程关闭时触发）
    pub fn interaction_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }
}

#[derive(Debug)]
struct SessionSlot {
    handle: SessionHandle,
    last_used: Instant,
}

impl SessionSlot {
    /// 没有交互持有窗口且空闲超时
    fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        Arc::strong_count(&self.handle.window) == 1
            && now.saturating_duration_since(self.last_used) >= idle_timeout
    }
}

/// 会话级生命周期管理
#[derive(Debug)]
pub struct SessionSupervisor {
    /// 进程级根令牌，关闭时取消所有会话
    root: CancellationToken,
    window_capacity: usize,
    idle_timeout: Duration,
    sessions: Mutex<HashMap<String, SessionSlot>>,
}

impl SessionSupervisor {
    pub fn new(window_capacity: usize) -> Self {
        Self::with_root(window_capacity, CancellationToken::new())
    }

    pub fn with_root(window_capacity: usize, root: CancellationToken) -> Self {
        Self {
            root,
            window_capacity,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_SECS),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// 获取（必要时创建）会话，顺带回收空闲会话
    pub fn session(&self, session_id: &str) -> SessionHandle {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|id, slot| id == session_id || !slot.is_idle(now, self.idle_timeout));
        if sessions.len() < before {
            tracing::debug!(evicted = before - sessions.len(), "idle sessions evicted");
        }

        let slot = sessions.entry(session_id.to_string()).or_insert_with(|| {
            tracing::debug!(session_id, "session opened");
            SessionSlot {
                handle: SessionHandle {
                    session_id: session_id.to_string(),
                    window: Arc::new(tokio::sync::Mutex::new(ContextWindow::new(
                        self.window_capacity,
                    ))),
                    cancel: self.root.child_token(),
                },
                last_used: now,
            }
        });
        slot.last_used = now;
        slot.handle.clone()
    }

    /// 取消会话当前的交互；返回会话是否存在
    pub fn cancel_session(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        match sessions.get_mut(session_id) {
            Some(slot) => {
                slot.handle.cancel.cancel();
                slot.handle.cancel = self.root.child_token();
                tracing::info!(session_id, "session interaction cancelled");
                true
            }
            None => false,
        }
    }

    /// 关闭会话并丢弃其对话窗口
    pub fn close_session(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = sessions.remove(session_id) {
            slot.handle.cancel.cancel();
        }
    }

    /// 取消所有会话（进程关闭）
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new(20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_session_shares_window() {
        let sup = SessionSupervisor::new(4);
        let a = sup.session("s1");
        let b = sup.session("s1");
        assert!(Arc::ptr_eq(&a.window, &b.window));
        assert_eq!(sup.active_sessions(), 1);
    }

    #[test]
    fn test_cancel_session_only_affects_current_interaction() {
        let sup = SessionSupervisor::new(4);
        let handle = sup.session("s1");
        let token = handle.interaction_token();
        assert!(sup.cancel_session("s1"));
        assert!(token.is_cancelled());

        let fresh = sup.session("s1").interaction_token();
        assert!(!fresh.is_cancelled());
        assert!(!sup.cancel_session("missing"));
    }

    #[test]
    fn test_cancel_all_reaches_every_session() {
        let sup = SessionSupervisor::new(4);
        let t1 = sup.session("a").interaction_token();
        let t2 = sup.session("b").interaction_token();
        sup.cancel_all();
        assert!(t1.is_cancelled() && t2.is_cancelled());
    }

    #[tokio::test]
    async fn test_close_session_drops_window() {
        let sup = SessionSupervisor::new(4);
        {
            let handle = sup.session("s1");
            handle.window.lock().await.push_user("hello");
        }
        sup.close_session("s1");
        let handle = sup.session("s1");
        assert!(handle.window.lock().await.is_empty());
    }

    #[test]
    fn test_idle_sessions_evicted_unless_in_use() {
        let sup = SessionSupervisor::new(4).with_idle_timeout(Duration::ZERO);
        let held = sup.session("busy");
        drop(sup.session("idle"));
        assert_eq!(sup.active_sessions(), 2);

        let _other = sup.session("next");
        assert_eq!(sup.active_sessions(), 2);
        let again = sup.session("busy");
        assert!(Arc::ptr_eq(&held.window, &again.window));
    }
}
