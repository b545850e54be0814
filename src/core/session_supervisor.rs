//! 会话监管：取消、暂停与重新规划请求
//!
//! 每个运行持有一个；克隆后交给外部（UI / 信号处理），循环在每个挂起点之后检查。

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// 运行级生命周期管理：取消令牌、暂停状态与待处理的重新规划请求
#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
    paused: Arc<RwLock<bool>>,
    /// 外部请求重新规划时写入原因，循环取走后清空
    replan_request: Arc<RwLock<Option<String>>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            paused: Arc::new(RwLock::new(false)),
            replan_request: Arc::new(RwLock::new(None)),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub async fn is_paused(&self) -> bool {
        *self.paused.read().await
    }

    pub async fn set_paused(&self, paused: bool) {
        *self.paused.write().await = paused;
    }

    pub async fn request_replan(&self, reason: impl Into<String>) {
        *self.replan_request.write().await = Some(reason.into());
    }

    pub async fn take_replan_request(&self) -> Option<String> {
        self.replan_request.write().await.take()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replan_request_is_taken_once() {
        let supervisor = SessionSupervisor::new();
        let handle = supervisor.clone();
        handle.request_replan("user changed scope").await;
        assert_eq!(supervisor.take_replan_request().await.as_deref(), Some("user changed scope"));
        assert!(supervisor.take_replan_request().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_is_shared_between_clones() {
        let supervisor = SessionSupervisor::new();
        let handle = supervisor.clone();
        handle.cancel();
        assert!(supervisor.is_cancelled());
        supervisor.set_paused(true).await;
        assert!(handle.is_paused().await);
    }
}
