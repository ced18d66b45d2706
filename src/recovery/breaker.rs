//! 按操作类别的熔断器
//!
//! 连续失败达到阈值后打开，冷却期内该类别的恢复直接 exhausted；冷却结束自动闭合并清零。
//! 所有读-改-写在同一把锁内完成，两个并发失败不会同时错过阈值。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 熔断器状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub operation_class: String,
    pub consecutive_failures: u32,
    pub open_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Entry {
    failures: u32,
    open_until: Option<(Instant, DateTime<Utc>)>,
}

impl Entry {
    /// 冷却结束则闭合
    fn refresh(&mut self, now: Instant) {
        if matches!(self.open_until, Some((until, _)) if now >= until) {
            self.failures = 0;
            self.open_until = None;
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    threshold: u32,
    cooldown: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl CircuitBreakerRegistry {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_open(&self, class: &str) -> bool {
        let mut entries = self.entries();
        match entries.get_mut(class) {
            Some(entry) => {
                entry.refresh(Instant::now());
                entry.open_until.is_some()
            }
            None => false,
        }
    }

    /// 记录一次失败；返回本次是否使熔断器打开
    pub fn record_failure(&self, class: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries();
        let entry = entries.entry(class.to_string()).or_default();
        entry.refresh(now);
        entry.failures += 1;
        if entry.open_until.is_none() && entry.failures >= self.threshold {
            let wall = chrono::Duration::from_std(self.cooldown)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d))
                .unwrap_or_else(Utc::now);
            entry.open_until = Some((now + self.cooldown, wall));
            tracing::warn!(
                operation_class = %class,
                failures = entry.failures,
                cooldown_secs = self.cooldown.as_secs(),
                "circuit breaker opened"
            );
            return true;
        }
        false
    }

    pub fn record_success(&self, class: &str) {
        self.entries().remove(class);
    }

    pub fn snapshot(&self, class: &str) -> CircuitBreakerState {
        let mut entries = self.entries();
        let (failures, open_until) = match entries.get_mut(class) {
            Some(entry) => {
                entry.refresh(Instant::now());
                (entry.failures, entry.open_until.map(|(_, wall)| wall))
            }
            None => (0, None),
        };
        CircuitBreakerState {
            operation_class: class.to_string(),
            consecutive_failures: failures,
            open_until,
        }
    }

    pub fn states(&self) -> Vec<CircuitBreakerState> {
        let mut classes: Vec<String> = self.entries().keys().cloned().collect();
        classes.sort();
        classes.iter().map(|c| self.snapshot(c)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_trips_at_threshold() {
        let breaker = CircuitBreakerRegistry::new(3, Duration::from_secs(300));
        assert!(!breaker.record_failure("run_terminal_command:pytest"));
        assert!(!breaker.record_failure("run_terminal_command:pytest"));
        assert!(!breaker.is_open("run_terminal_command:pytest"));
        assert!(breaker.record_failure("run_terminal_command:pytest"));
        assert!(breaker.is_open("run_terminal_command:pytest"));
        assert!(!breaker.is_open("run_terminal_command:npm"));

        let state = breaker.snapshot("run_terminal_command:pytest");
        assert_eq!(state.consecutive_failures, 3);
        assert!(state.open_until.unwrap() > Utc::now());
    }

    #[test]
    fn test_success_resets() {
        let breaker = CircuitBreakerRegistry::new(2, Duration::from_secs(300));
        breaker.record_failure("edit_file");
        breaker.record_success("edit_file");
        assert!(!breaker.record_failure("edit_file"));
        assert_eq!(breaker.snapshot("edit_file").consecutive_failures, 1);
    }

    #[test]
    fn test_cooldown_closes() {
        let breaker = CircuitBreakerRegistry::new(1, Duration::from_millis(30));
        assert!(breaker.record_failure("tool"));
        assert!(breaker.is_open("tool"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(!breaker.is_open("tool"));
        assert_eq!(breaker.snapshot("tool").consecutive_failures, 0);
    }

    #[test]
    fn test_concurrent_failures_trip_exactly_once() {
        let breaker = Arc::new(CircuitBreakerRegistry::new(5, Duration::from_secs(300)));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                std::thread::spawn(move || breaker.record_failure("tool"))
            })
            .collect();
        let trips = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|tripped| *tripped)
            .count();
        assert_eq!(trips, 1);
        assert_eq!(breaker.snapshot("tool").consecutive_failures, 16);
    }
}
