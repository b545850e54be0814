//! 错误恢复引擎
//!
//! 根据传输失败次数与类型返回 RecoveryAction：指数退避重试 → 降级请求一次 → 暂停。

use std::time::Duration;

use crate::config::TransportSection;
use crate::core::{RecoveryAction, TransportError};

#[derive(Debug, Clone, Default)]
pub struct RecoveryEngine {
    config: TransportSection,
}

impl RecoveryEngine {
    pub fn new(config: TransportSection) -> Self {
        Self { config }
    }

    /// 第 `failures` 次失败（从 1 开始）后的等待时间
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let ms = self
            .config
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// `degraded` 表示降级请求已经发过
    pub fn handle(&self, err: &TransportError, failures: u32, degraded: bool) -> RecoveryAction {
        if degraded {
            return RecoveryAction::Pause(format!("简化请求仍然失败：{err}"));
        }
        if !err.is_retryable() || failures > self.config.max_retries {
            return RecoveryAction::Degrade;
        }
        RecoveryAction::RetryAfter(self.backoff(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RecoveryEngine {
        RecoveryEngine::new(TransportSection {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 300,
        })
    }

    #[test]
    fn test_recovery_retries_with_backoff() {
        let engine = engine();
        let err = TransportError::Timeout;
        assert_eq!(
            engine.handle(&err, 1, false),
            RecoveryAction::RetryAfter(Duration::from_millis(100))
        );
        assert_eq!(
            engine.handle(&err, 2, false),
            RecoveryAction::RetryAfter(Duration::from_millis(200))
        );
        // 封顶
        assert_eq!(
            engine.handle(&err, 3, false),
            RecoveryAction::RetryAfter(Duration::from_millis(300))
        );
    }

    #[test]
    fn test_recovery_degrades_after_exhaustion() {
        let engine = engine();
        let err = TransportError::Connection("reset".into());
        assert_eq!(engine.handle(&err, 4, false), RecoveryAction::Degrade);
    }

    #[test]
    fn test_recovery_rejected_skips_retries() {
        let engine = engine();
        let err = TransportError::Rejected("bad request".into());
        assert_eq!(engine.handle(&err, 1, false), RecoveryAction::Degrade);
    }

    #[test]
    fn test_recovery_pauses_after_degraded_failure() {
        let engine = engine();
        let action = engine.handle(&TransportError::Timeout, 1, true);
        match action {
            RecoveryAction::Pause(msg) => assert!(msg.contains("timed out")),
            _ => panic!("Expected Pause"),
        }
    }
}
