//! 跨会话的恢复安全限额
//!
//! 并发会话数用信号量约束，取不到许可的会话不排队，直接 exhausted。
//! 恢复轮数与代码修改次数按滚动一小时窗口计数，窗口内额度用完后新的轮次被拒绝。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::RecoverySection;

const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitExceeded {
    #[error("too many concurrent recoveries (limit {0})")]
    Concurrency(usize),
    #[error("hourly recovery attempt limit reached ({0})")]
    HourlyAttempts(u32),
    #[error("hourly code modification limit reached ({0})")]
    HourlyCodeEdits(u32),
}

/// 滚动窗口计数器
#[derive(Debug)]
struct Window {
    span: Duration,
    limit: u32,
    hits: Mutex<VecDeque<Instant>>,
}

impl Window {
    fn new(span: Duration, limit: u32) -> Self {
        Self {
            span,
            limit,
            hits: Mutex::new(VecDeque::new()),
        }
    }

    /// 额度内则记一次并返回 true
    fn take(&self) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().unwrap_or_else(|p| p.into_inner());
        while matches!(hits.front(), Some(t) if now.duration_since(*t) >= self.span) {
            hits.pop_front();
        }
        if hits.len() >= self.limit as usize {
            return false;
        }
        hits.push_back(now);
        true
    }

    fn used(&self) -> usize {
        let now = Instant::now();
        let hits = self.hits.lock().unwrap_or_else(|p| p.into_inner());
        hits.iter().filter(|t| now.duration_since(**t) < self.span).count()
    }
}

#[derive(Debug)]
pub struct RecoveryLimits {
    sessions: Arc<Semaphore>,
    max_concurrent: usize,
    attempts: Window,
    code_edits: Window,
}

impl RecoveryLimits {
    pub fn new(max_concurrent: usize, attempts_per_hour: u32, code_edits_per_hour: u32) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            sessions: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            attempts: Window::new(HOUR, attempts_per_hour),
            code_edits: Window::new(HOUR, code_edits_per_hour),
        }
    }

    pub fn from_config(cfg: &RecoverySection) -> Self {
        Self::new(
            cfg.max_concurrent_recoveries,
            cfg.max_attempts_per_hour,
            cfg.max_code_edits_per_hour,
        )
    }

    /// 缩短计数窗口（测试用）
    pub fn with_window(mut self, span: Duration) -> Self {
        self.attempts.span = span;
        self.code_edits.span = span;
        self
    }

    /// 占用一个会话名额；许可随会话结束释放
    pub fn begin_session(&self) -> Result<OwnedSemaphorePermit, LimitExceeded> {
        Arc::clone(&self.sessions)
            .try_acquire_owned()
            .map_err(|_| LimitExceeded::Concurrency(self.max_concurrent))
    }

    pub fn take_attempt(&self) -> Result<(), LimitExceeded> {
        if self.attempts.take() {
            Ok(())
        } else {
            Err(LimitExceeded::HourlyAttempts(self.attempts.limit))
        }
    }

    pub fn take_code_edit(&self) -> Result<(), LimitExceeded> {
        if self.code_edits.take() {
            Ok(())
        } else {
            Err(LimitExceeded::HourlyCodeEdits(self.code_edits.limit))
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.max_concurrent - self.sessions.available_permits()
    }

    pub fn attempts_in_window(&self) -> usize {
        self.attempts.used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_permits_are_released_on_drop() {
        let limits = RecoveryLimits::new(2, 10, 5);
        let a = limits.begin_session().unwrap();
        let _b = limits.begin_session().unwrap();
        assert_eq!(limits.begin_session().unwrap_err(), LimitExceeded::Concurrency(2));
        assert_eq!(limits.active_sessions(), 2);
        drop(a);
        assert!(limits.begin_session().is_ok());
    }

    #[test]
    fn test_hourly_windows_roll_over() {
        let limits = RecoveryLimits::new(1, 2, 1).with_window(Duration::from_millis(50));
        assert!(limits.take_attempt().is_ok());
        assert!(limits.take_attempt().is_ok());
        assert_eq!(limits.take_attempt().unwrap_err(), LimitExceeded::HourlyAttempts(2));
        assert!(limits.take_code_edit().is_ok());
        assert_eq!(limits.take_code_edit().unwrap_err(), LimitExceeded::HourlyCodeEdits(1));

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(limits.attempts_in_window(), 0);
        assert!(limits.take_attempt().is_ok());
        assert!(limits.take_code_edit().is_ok());
    }
}
