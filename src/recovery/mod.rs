//! 恢复引擎
//!
//! 动作失败后：诊断 → 选择策略 → {调研 | 修复 | 重试} → {resolved | exhausted}。
//! 重试受多重约束：会话内的轮数上限与墙钟上限、按操作类别共享的熔断器，
//! 以及全局的并发会话数和每小时轮数、代码修改次数限额。
//! 纠正任务与重试通过 [`RecoveryDriver`] 交回调度层执行，引擎本身不直接调用工作者或网关。

pub mod breaker;
pub mod correction;
pub mod diagnosis;
pub mod limits;
pub mod session;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::RecoverySection;
use crate::core::{ActionSuggestion, ErrorKind, Role, Task, TaskError, TaskId, TaskOrigin, TaskResult};
use crate::gateway::{AuditDecision, AuditEvent, AuditOutcome, AuditSink};
use crate::intent::Classifier;

pub use breaker::{CircuitBreakerRegistry, CircuitBreakerState};
pub use correction::ArgumentCorrector;
pub use diagnosis::{match_patterns, Diagnosis, DiagnosisSource, ErrorDiagnoser};
pub use limits::{LimitExceeded, RecoveryLimits};
pub use session::{
    select_strategy, AttemptStep, RecoveryAttempt, RecoverySession, RecoveryState, RecoveryStrategy,
};

/// 已执行的任务及其结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedTask {
    pub task: Task,
    pub result: TaskResult,
}

impl ExecutedTask {
    pub fn new(task: Task, result: TaskResult) -> Self {
        Self { task, result }
    }
}

/// 调度层为恢复引擎提供的执行能力
#[async_trait]
pub trait RecoveryDriver: Send + Sync {
    /// 执行一个纠正任务；结果中的动作建议同样执行，全部记录按执行顺序返回
    async fn run_corrective(&self, task: Task) -> Vec<ExecutedTask>;

    /// 经网关重新提交动作
    async fn retry_action(&self, origin: TaskId, action: ActionSuggestion) -> ExecutedTask;
}

/// recover 的返回值：会话终态 + 期间执行的全部任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub session: RecoverySession,
    pub executed: Vec<ExecutedTask>,
}

/// 恢复引擎；跨请求共享（熔断器状态按操作类别共享）
pub struct RecoveryEngine {
    diagnoser: ErrorDiagnoser,
    corrector: ArgumentCorrector,
    breaker: CircuitBreakerRegistry,
    audit: Arc<dyn AuditSink>,
    actor: String,
    max_attempts: u32,
    limits: RecoveryLimits,
    session_timeout: Duration,
    audit_failures: AtomicU64,
}

impl RecoveryEngine {
    pub fn new(cfg: &RecoverySection, audit: Arc<dyn AuditSink>, actor: impl Into<String>) -> Self {
        Self {
            diagnoser: ErrorDiagnoser::new(),
            corrector: ArgumentCorrector::new(cfg.program_aliases.clone()),
            breaker: CircuitBreakerRegistry::new(
                cfg.breaker_threshold,
                Duration::from_secs(cfg.breaker_cooldown_secs),
            ),
            audit,
            actor: actor.into(),
            max_attempts: cfg.max_attempts.max(1),
            limits: RecoveryLimits::from_config(cfg),
            session_timeout: cfg.session_timeout(),
            audit_failures: AtomicU64::new(0),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>, min_confidence: f32) -> Self {
        self.diagnoser = self.diagnoser.with_classifier(classifier, min_confidence);
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerRegistry) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_limits(mut self, limits: RecoveryLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn limits(&self) -> &RecoveryLimits {
        &self.limits
    }

    pub fn breaker(&self) -> &CircuitBreakerRegistry {
        &self.breaker
    }

    /// 恢复审计写入失败次数
    pub fn audit_failures(&self) -> u64 {
        self.audit_failures.load(Ordering::Relaxed)
    }

    pub async fn recover(
        &self,
        failed_task: TaskId,
        action: ActionSuggestion,
        error: TaskError,
        driver: &dyn RecoveryDriver,
        cancel: &CancellationToken,
    ) -> RecoveryReport {
        let mut session = RecoverySession::new(failed_task, action.clone(), error.clone());
        let class = session.operation_class.clone();
        let mut executed = Vec::new();
        tracing::info!(session = %session.id, task_id = %failed_task, operation_class = %class, "recovery started");

        if self.breaker.is_open(&class) {
            self.refuse(
                &mut session,
                &error,
                format!("Recovery skipped: circuit breaker for {} is open after repeated failures.", class),
            )
            .await;
            return RecoveryReport { session, executed };
        }

        let _permit = match self.limits.begin_session() {
            Ok(permit) => permit,
            Err(e) => {
                self.refuse(&mut session, &error, format!("Recovery skipped: {}.", e)).await;
                return RecoveryReport { session, executed };
            }
        };

        let rounds = self.run_rounds(&mut session, &mut executed, action, error.clone(), driver, cancel);
        if tokio::time::timeout(self.session_timeout, rounds).await.is_err() {
            self.breaker.record_failure(&class);
            let summary = format!(
                "Recovery stopped after exceeding its {}s time limit. {}",
                self.session_timeout.as_secs(),
                manual_advice(&session, &error, None)
            );
            self.exhaust(&mut session, summary);
        }
        RecoveryReport { session, executed }
    }

    /// 诊断后直接结束会话（熔断或限额拒绝）
    async fn refuse(&self, session: &mut RecoverySession, error: &TaskError, reason: String) {
        let diagnosis = self.diagnoser.diagnose(error).await;
        session.error_classification = diagnosis.kind;
        session.diagnosis_detail = diagnosis.detail;
        let summary = format!("{} {}", reason, manual_advice(session, error, None));
        self.exhaust(session, summary);
    }

    /// 轮次循环；返回时会话已处于终态
    async fn run_rounds(
        &self,
        session: &mut RecoverySession,
        executed: &mut Vec<ExecutedTask>,
        action: ActionSuggestion,
        error: TaskError,
        driver: &dyn RecoveryDriver,
        cancel: &CancellationToken,
    ) {
        let failed_task = session.original_task;
        let class = session.operation_class.clone();
        let mut current = action;
        let mut last_error = error;
        let mut research_notes: Option<String> = None;

        for number in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                self.exhaust(session, "Recovery cancelled with the request.".to_string());
                return;
            }
            if number > 1 && self.breaker.is_open(&class) {
                let summary = format!(
                    "Circuit breaker for {} opened during recovery. {}",
                    class,
                    manual_advice(session, &last_error, research_notes.as_deref())
                );
                self.exhaust(session, summary);
                return;
            }

            session.transition(RecoveryState::Diagnosing);
            let diagnosis = self.diagnoser.diagnose(&last_error).await;
            session.error_classification = diagnosis.kind;
            session.diagnosis_detail = diagnosis.detail.clone();
            let strategy = select_strategy(diagnosis.kind);
            session.strategy = Some(strategy);
            session.transition(RecoveryState::StrategySelected);
            tracing::info!(
                session = %session.id,
                attempt = number,
                diagnosis = %diagnosis.kind,
                strategy = %strategy,
                "recovery strategy selected"
            );

            if let Err(e) = self.limits.take_attempt() {
                let summary = format!(
                    "Recovery stopped: {}. {}",
                    e,
                    manual_advice(session, &last_error, research_notes.as_deref())
                );
                self.exhaust(session, summary);
                return;
            }

            match strategy {
                RecoveryStrategy::ResearchThenManual => {
                    session.transition(RecoveryState::Researching);
                    let task = Task::new(Role::WebResearch, research_prompt(&current, &last_error))
                        .with_context("error", last_error.message.clone())
                        .with_origin(TaskOrigin::Recovery {
                            for_task: failed_task,
                        });
                    let task_id = task.id;
                    let runs = driver.run_corrective(task).await;
                    let ok = all_succeeded(&runs);
                    let notes: Vec<&str> = runs
                        .iter()
                        .filter(|r| r.result.is_success())
                        .map(|r| r.result.output.as_str())
                        .collect();
                    if !notes.is_empty() {
                        research_notes = Some(notes.join("\n"));
                    }
                    let detail = if ok { "research completed" } else { "research failed" };
                    self.push_attempt(
                        session,
                        RecoveryAttempt::new(number, AttemptStep::Research, Some(task_id), None, ok, detail),
                    );
                    executed.extend(runs);
                    self.breaker.record_failure(&class);
                    let summary = manual_advice(session, &last_error, research_notes.as_deref());
                    self.exhaust(session, summary);
                    return;
                }
                RecoveryStrategy::RepairThenRetry => {
                    session.transition(RecoveryState::Repairing);
                    let repair = repair_task(failed_task, &current, &diagnosis, &last_error);
                    if repair.role == Role::CodeEdit {
                        if let Err(e) = self.limits.take_code_edit() {
                            let summary = format!(
                                "Recovery stopped: {}. {}",
                                e,
                                manual_advice(session, &last_error, research_notes.as_deref())
                            );
                            self.exhaust(session, summary);
                            return;
                        }
                    }
                    let task_id = repair.id;
                    let repair_action = repair.action.clone();
                    let runs = driver.run_corrective(repair).await;
                    let ok = all_succeeded(&runs);
                    let detail = match runs.iter().find(|r| !r.result.is_success()) {
                        Some(failed) => failed
                            .result
                            .error
                            .as_ref()
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "repair failed".to_string()),
                        None if runs.is_empty() => "repair produced no work".to_string(),
                        None => "repair applied".to_string(),
                    };
                    self.push_attempt(
                        session,
                        RecoveryAttempt::new(number, AttemptStep::Repair, Some(task_id), repair_action, ok, detail),
                    );
                    let repair_error = runs
                        .iter()
                        .find_map(|r| r.result.error.clone());
                    executed.extend(runs);
                    if !ok {
                        if let Some(e) = repair_error.filter(|e| !e.kind.is_recoverable()) {
                            let summary = format!(
                                "Repair step was stopped ({}). {}",
                                e,
                                manual_advice(session, &last_error, research_notes.as_deref())
                            );
                            self.breaker.record_failure(&class);
                            self.exhaust(session, summary);
                            return;
                        }
                        if self.breaker.record_failure(&class) {
                            break;
                        }
                        continue;
                    }
                }
                RecoveryStrategy::RetryWithCorrection => {
                    if let ActionSuggestion::RunTerminalCommand { argv } = &current {
                        if let Some(fixed) = self.corrector.correct(argv, &diagnosis, &last_error.message) {
                            tracing::info!(session = %session.id, from = ?argv, to = ?fixed, "arguments corrected");
                            current = ActionSuggestion::RunTerminalCommand { argv: fixed };
                        }
                    }
                }
            }

            session.transition(RecoveryState::Retrying);
            let retry = driver.retry_action(failed_task, current.clone()).await;
            let ok = retry.result.is_success();
            let detail = match &retry.result.error {
                Some(e) => e.to_string(),
                None => "retry succeeded".to_string(),
            };
            self.push_attempt(
                session,
                RecoveryAttempt::new(
                    number,
                    AttemptStep::Retry,
                    Some(retry.task.id),
                    Some(current.clone()),
                    ok,
                    detail,
                ),
            );
            let output = retry.result.output.clone();
            let retry_error = retry.result.error.clone();
            executed.push(retry);

            if ok {
                self.breaker.record_success(&class);
                session.final_output = Some(output);
                session.summary = Some(format!(
                    "Recovered `{}` after {} attempt(s) using {}.",
                    session.original_action.summary(),
                    number,
                    strategy
                ));
                session.transition(RecoveryState::Resolved);
                self.record_terminal(session);
                return;
            }

            last_error = retry_error
                .unwrap_or_else(|| TaskError::new(ErrorKind::ExecutionFailed, "retry failed"));
            let tripped = self.breaker.record_failure(&class);
            if !last_error.kind.is_recoverable() {
                let summary = format!(
                    "Retry was stopped ({}). {}",
                    last_error,
                    manual_advice(session, &last_error, research_notes.as_deref())
                );
                self.exhaust(session, summary);
                return;
            }
            if tripped {
                break;
            }
        }

        let summary = format!(
            "Automatic recovery exhausted after {} attempt(s). {}",
            session.rounds(),
            manual_advice(session, &last_error, research_notes.as_deref())
        );
        self.exhaust(session, summary);
    }

    fn push_attempt(&self, session: &mut RecoverySession, attempt: RecoveryAttempt) {
        let summary = format!(
            "recovery {:?} #{} for {}",
            attempt.step,
            attempt.number,
            attempt
                .action
                .as_ref()
                .map(|a| a.summary())
                .unwrap_or_else(|| session.original_action.summary())
        );
        let outcome = if attempt.succeeded {
            AuditOutcome::AttemptSucceeded
        } else {
            AuditOutcome::AttemptFailed
        };
        let event = AuditEvent::new(&self.actor, &session.id, summary, AuditDecision::Recovery, outcome)
            .with_detail(attempt.detail.clone());
        session.attempts.push(attempt);
        self.append(event);
    }

    fn exhaust(&self, session: &mut RecoverySession, summary: String) {
        tracing::warn!(session = %session.id, summary = %summary, "recovery exhausted");
        session.summary = Some(summary);
        session.transition(RecoveryState::Exhausted);
        self.record_terminal(session);
    }

    fn record_terminal(&self, session: &RecoverySession) {
        let outcome = if session.is_resolved() {
            AuditOutcome::Resolved
        } else {
            AuditOutcome::Exhausted
        };
        let summary = format!(
            "recovery {} for {}",
            session.strategy.map(|s| s.as_str()).unwrap_or("none"),
            session.original_action.summary()
        );
        self.append(
            AuditEvent::new(&self.actor, &session.id, summary, AuditDecision::Recovery, outcome)
                .with_detail(session.summary.clone().unwrap_or_default()),
        );
    }

    fn append(&self, event: AuditEvent) {
        if let Err(e) = self.audit.append(&event) {
            self.audit_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(session = %event.action_id, error = %e, "audit append failed");
        }
    }
}

fn all_succeeded(runs: &[ExecutedTask]) -> bool {
    !runs.is_empty() && runs.iter().all(|r| r.result.is_success())
}

fn research_prompt(action: &ActionSuggestion, error: &TaskError) -> String {
    format!(
        "How to fix this error from `{}`: {}",
        action.summary(),
        key_line(&error.message)
    )
}

fn key_line(text: &str) -> &str {
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(str::trim)
        .unwrap_or("")
}

/// 修复任务：能识别出缺失的包时直接合成安装动作，否则交给代码修改工作者
fn repair_task(
    failed_task: TaskId,
    action: &ActionSuggestion,
    diagnosis: &Diagnosis,
    error: &TaskError,
) -> Task {
    let origin = TaskOrigin::Recovery {
        for_task: failed_task,
    };
    if diagnosis.kind == ErrorKind::MissingDependency {
        if let Some(install) = diagnosis
            .detail
            .as_deref()
            .and_then(|pkg| install_action(action.program(), pkg, &error.message))
        {
            return Task::action(install, origin);
        }
    }
    let mut task = Task::new(
        Role::CodeEdit,
        format!(
            "Fix the code so that `{}` succeeds. Error:\n{}",
            action.summary(),
            error.message
        ),
    )
    .with_context("error", error.message.clone())
    .with_context("failed_action", action.summary())
    .with_origin(origin);
    if let Some(path) = action.target_path() {
        task = task.with_context("path", path);
    }
    task
}

/// 按失败命令所属生态合成安装命令
pub fn install_action(program: Option<&str>, package: &str, message: &str) -> Option<ActionSuggestion> {
    let ecosystem = match program.unwrap_or("") {
        p if p.starts_with("python") || p.starts_with("pip") || p == "pytest" => "python",
        "node" | "npm" | "npx" | "yarn" | "tsc" | "jest" => "node",
        "cargo" | "rustc" => "rust",
        _ if message.contains("No module named") || message.contains("No matching distribution") => "python",
        _ if message.contains("Cannot find module") => "node",
        _ if message.contains("can't find crate") => "rust",
        _ => return None,
    };
    let argv: Vec<&str> = match ecosystem {
        "python" => {
            let top = package.split('.').next().unwrap_or(package);
            vec!["pip", "install", top]
        }
        "node" => vec!["npm", "install", package],
        _ => vec!["cargo", "add", package],
    };
    Some(ActionSuggestion::RunTerminalCommand {
        argv: argv.into_iter().map(str::to_string).collect(),
    })
}

fn manual_advice(session: &RecoverySession, last_error: &TaskError, notes: Option<&str>) -> String {
    let detail = session
        .diagnosis_detail
        .as_deref()
        .map(|d| format!(" ({})", d))
        .unwrap_or_default();
    let hint = match session.error_classification {
        ErrorKind::MissingDependency => format!(
            "Install the missing dependency{} manually, then re-run `{}`.",
            detail,
            session.original_action.summary()
        ),
        ErrorKind::CodeDefect => "Inspect the traceback and fix the failing code by hand.".to_string(),
        ErrorKind::SyntaxOrArgument => format!(
            "Check the program name and arguments of `{}`{}.",
            session.original_action.summary(),
            detail
        ),
        ErrorKind::SystemOrPermission => {
            "Check permissions, disk space, network access and running services on the host.".to_string()
        }
        _ => "Review the error output and resolve it manually.".to_string(),
    };
    let mut advice = format!(
        "Diagnosis: {}{}. Last error: {}. Recommendation: {}",
        session.error_classification,
        detail,
        key_line(&last_error.message),
        hint
    );
    if let Some(notes) = notes.filter(|n| !n.trim().is_empty()) {
        advice.push_str("\nResearch notes:\n");
        advice.push_str(notes);
    }
    advice
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{AuditFilter, InMemoryAuditSink};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// 脚本化驱动：纠正任务与重试按预设结果依次返回
    struct ScriptedDriver {
        corrective: Mutex<VecDeque<bool>>,
        retries: Mutex<VecDeque<Result<String, TaskError>>>,
        corrective_tasks: Mutex<Vec<Task>>,
        retried: Mutex<Vec<ActionSuggestion>>,
    }

    impl ScriptedDriver {
        fn new(corrective: Vec<bool>, retries: Vec<Result<String, TaskError>>) -> Self {
            Self {
                corrective: Mutex::new(corrective.into()),
                retries: Mutex::new(retries.into()),
                corrective_tasks: Mutex::new(Vec::new()),
                retried: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RecoveryDriver for ScriptedDriver {
        async fn run_corrective(&self, task: Task) -> Vec<ExecutedTask> {
            self.corrective_tasks.lock().unwrap().push(task.clone());
            let ok = self.corrective.lock().unwrap().pop_front().unwrap_or(false);
            let result = if ok {
                TaskResult::success(task.id, "done")
            } else {
                TaskResult::fail(task.id, ErrorKind::ExecutionFailed, "repair failed")
            };
            vec![ExecutedTask::new(task, result)]
        }

        async fn retry_action(&self, origin: TaskId, action: ActionSuggestion) -> ExecutedTask {
            self.retried.lock().unwrap().push(action.clone());
            let task = Task::action(action, TaskOrigin::Recovery { for_task: origin });
            let next = self
                .retries
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(missing_requests()));
            let result = match next {
                Ok(out) => TaskResult::success(task.id, out),
                Err(e) => TaskResult::failure(task.id, e),
            };
            ExecutedTask::new(task, result)
        }
    }

    fn engine(audit: Arc<InMemoryAuditSink>) -> RecoveryEngine {
        RecoveryEngine::new(&RecoverySection::default(), audit, "tester")
    }

    fn python_app() -> ActionSuggestion {
        ActionSuggestion::RunTerminalCommand {
            argv: vec!["python3".into(), "app.py".into()],
        }
    }

    fn missing_requests() -> TaskError {
        TaskError::new(
            ErrorKind::ExecutionFailed,
            "`python3 app.py` exited with 1: ModuleNotFoundError: No module named 'requests'",
        )
    }

    #[tokio::test]
    async fn test_missing_dependency_repair_then_retry() {
        let audit = Arc::new(InMemoryAuditSink::new());
        let engine = engine(audit.clone());
        let driver = ScriptedDriver::new(vec![true], vec![Ok("hello".into())]);
        let report = engine
            .recover(TaskId::next(), python_app(), missing_requests(), &driver, &CancellationToken::new())
            .await;

        let session = report.session;
        assert_eq!(session.state, RecoveryState::Resolved);
        assert_eq!(session.error_classification, ErrorKind::MissingDependency);
        assert_eq!(session.strategy, Some(RecoveryStrategy::RepairThenRetry));
        assert_eq!(session.final_output.as_deref(), Some("hello"));
        assert_eq!(session.attempts.len(), 2);

        let repair = &driver.corrective_tasks.lock().unwrap()[0];
        assert_eq!(
            repair.action,
            Some(ActionSuggestion::RunTerminalCommand {
                argv: vec!["pip".into(), "install".into(), "requests".into()]
            })
        );
        assert_eq!(report.executed.len(), 2);

        let events = audit.query(&AuditFilter::new().action_id(session.id.clone())).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].outcome, AuditOutcome::Resolved);
    }

    #[tokio::test]
    async fn test_retry_with_correction() {
        let audit = Arc::new(InMemoryAuditSink::new());
        let engine = engine(audit);
        let driver = ScriptedDriver::new(vec![], vec![Ok("2 passed".into())]);
        let action = ActionSuggestion::RunTerminalCommand {
            argv: vec!["pytest".into(), "--colour=yes".into()],
        };
        let error = TaskError::new(ErrorKind::ExecutionFailed, "pytest: error: unrecognized arguments: --colour=yes");
        let report = engine
            .recover(TaskId::next(), action, error, &driver, &CancellationToken::new())
            .await;
        assert!(report.session.is_resolved());
        assert!(driver.corrective_tasks.lock().unwrap().is_empty());
        assert_eq!(
            driver.retried.lock().unwrap()[0],
            ActionSuggestion::RunTerminalCommand {
                argv: vec!["pytest".into()]
            }
        );
    }

    #[tokio::test]
    async fn test_research_then_manual_never_retries() {
        let audit = Arc::new(InMemoryAuditSink::new());
        let engine = engine(audit);
        let driver = ScriptedDriver::new(vec![true], vec![]);
        let error = TaskError::new(ErrorKind::ExecutionFailed, "curl: (6) Could not resolve host: example.invalid");
        let report = engine
            .recover(TaskId::next(), python_app(), error, &driver, &CancellationToken::new())
            .await;
        let session = report.session;
        assert_eq!(session.state, RecoveryState::Exhausted);
        assert_eq!(session.strategy, Some(RecoveryStrategy::ResearchThenManual));
        assert!(driver.retried.lock().unwrap().is_empty());
        let summary = session.summary.unwrap();
        assert!(summary.contains("Recommendation"));
        assert!(summary.contains("Research notes"));
        assert_eq!(driver.corrective_tasks.lock().unwrap()[0].role, Role::WebResearch);
    }

    #[tokio::test]
    async fn test_attempt_budget_exhausts() {
        let audit = Arc::new(InMemoryAuditSink::new());
        let engine = engine(audit.clone());
        let driver = ScriptedDriver::new(vec![true, true, true], vec![]);
        let report = engine
            .recover(TaskId::next(), python_app(), missing_requests(), &driver, &CancellationToken::new())
            .await;
        let session = report.session;
        assert_eq!(session.state, RecoveryState::Exhausted);
        assert_eq!(session.rounds(), 3);
        assert!(session.summary.unwrap().contains("exhausted after 3"));
        let terminal = audit
            .query(&AuditFilter::new().action_id(session.id).outcome(AuditOutcome::Exhausted))
            .unwrap();
        assert_eq!(terminal.len(), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits() {
        let audit = Arc::new(InMemoryAuditSink::new());
        let engine = engine(audit).with_breaker(CircuitBreakerRegistry::new(2, Duration::from_secs(300)));
        engine.breaker().record_failure("run_terminal_command:python3");
        engine.breaker().record_failure("run_terminal_command:python3");

        let driver = ScriptedDriver::new(vec![true], vec![Ok("ok".into())]);
        let report = engine
            .recover(TaskId::next(), python_app(), missing_requests(), &driver, &CancellationToken::new())
            .await;
        assert_eq!(report.session.state, RecoveryState::Exhausted);
        assert!(report.session.attempts.is_empty());
        assert!(driver.corrective_tasks.lock().unwrap().is_empty());
        assert!(driver.retried.lock().unwrap().is_empty());
        assert!(report.session.summary.unwrap().contains("circuit breaker"));
    }

    #[tokio::test]
    async fn test_denied_retry_stops_recovery() {
        let audit = Arc::new(InMemoryAuditSink::new());
        let engine = engine(audit);
        let driver = ScriptedDriver::new(
            vec![true],
            vec![Err(TaskError::new(ErrorKind::ConfirmationDenied, "denied"))],
        );
        let report = engine
            .recover(TaskId::next(), python_app(), missing_requests(), &driver, &CancellationToken::new())
            .await;
        assert_eq!(report.session.state, RecoveryState::Exhausted);
        assert_eq!(driver.retried.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_install_action_by_ecosystem() {
        let npm = install_action(Some("node"), "express", "Cannot find module 'express'").unwrap();
        assert_eq!(npm.program(), Some("npm"));
        let py = install_action(Some("python3"), "yaml.loader", "No module named 'yaml.loader'").unwrap();
        assert_eq!(
            py,
            ActionSuggestion::RunTerminalCommand {
                argv: vec!["pip".into(), "install".into(), "yaml".into()]
            }
        );
        assert!(install_action(Some("make"), "x", "weird").is_none());
    }

    /// 纠正与重试都不返回的驱动
    struct HangingDriver;

    #[async_trait]
    impl RecoveryDriver for HangingDriver {
        async fn run_corrective(&self, _task: Task) -> Vec<ExecutedTask> {
            std::future::pending::<Vec<ExecutedTask>>().await
        }

        async fn retry_action(&self, _origin: TaskId, _action: ActionSuggestion) -> ExecutedTask {
            std::future::pending::<ExecutedTask>().await
        }
    }

    fn name_error() -> TaskError {
        TaskError::new(
            ErrorKind::ExecutionFailed,
            "`python3 app.py` exited with 1: Traceback (most recent call last):\nNameError: name 'x' is not defined",
        )
    }

    #[tokio::test]
    async fn test_session_deadline_exhausts() {
        let audit = Arc::new(InMemoryAuditSink::new());
        let engine = engine(audit.clone()).with_session_timeout(Duration::from_millis(50));
        let report = engine
            .recover(TaskId::next(), python_app(), missing_requests(), &HangingDriver, &CancellationToken::new())
            .await;

        let session = report.session;
        assert_eq!(session.state, RecoveryState::Exhausted);
        assert!(session.summary.as_deref().unwrap().contains("time limit"));
        assert_eq!(engine.breaker().snapshot("run_terminal_command:python3").consecutive_failures, 1);
        let terminal = audit
            .query(&AuditFilter::new().action_id(session.id).outcome(AuditOutcome::Exhausted))
            .unwrap();
        assert_eq!(terminal.len(), 1);
        assert_eq!(engine.limits().active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_sessions_are_capped() {
        let audit = Arc::new(InMemoryAuditSink::new());
        let engine = Arc::new(engine(audit).with_limits(RecoveryLimits::new(1, 10, 5)));

        let busy = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let driver = HangingDriver;
                engine
                    .recover(TaskId::next(), python_app(), missing_requests(), &driver, &CancellationToken::new())
                    .await
            })
        };
        while engine.limits().active_sessions() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let driver = ScriptedDriver::new(vec![true], vec![Ok("ok".into())]);
        let report = engine
            .recover(TaskId::next(), python_app(), missing_requests(), &driver, &CancellationToken::new())
            .await;
        assert_eq!(report.session.state, RecoveryState::Exhausted);
        assert!(report.session.summary.as_deref().unwrap().contains("concurrent"));
        assert!(driver.corrective_tasks.lock().unwrap().is_empty());
        assert!(driver.retried.lock().unwrap().is_empty());

        busy.abort();
        let _ = busy.await;
        assert_eq!(engine.limits().active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_hourly_attempt_limit_spans_sessions() {
        let audit = Arc::new(InMemoryAuditSink::new());
        let engine = engine(audit).with_limits(RecoveryLimits::new(3, 1, 5));

        let first = ScriptedDriver::new(vec![true], vec![Ok("ok".into())]);
        let report = engine
            .recover(TaskId::next(), python_app(), missing_requests(), &first, &CancellationToken::new())
            .await;
        assert!(report.session.is_resolved());

        let second = ScriptedDriver::new(vec![true], vec![Ok("ok".into())]);
        let report = engine
            .recover(TaskId::next(), python_app(), missing_requests(), &second, &CancellationToken::new())
            .await;
        assert_eq!(report.session.state, RecoveryState::Exhausted);
        assert!(report.session.summary.as_deref().unwrap().contains("hourly recovery attempt limit"));
        assert_eq!(report.session.error_classification, ErrorKind::MissingDependency);
        assert!(second.corrective_tasks.lock().unwrap().is_empty());
        assert!(report.executed.is_empty());
    }

    #[tokio::test]
    async fn test_hourly_code_edit_limit() {
        let audit = Arc::new(InMemoryAuditSink::new());
        let engine = engine(audit).with_limits(RecoveryLimits::new(3, 10, 1));

        let first = ScriptedDriver::new(vec![true], vec![Ok("fixed".into())]);
        let report = engine
            .recover(TaskId::next(), python_app(), name_error(), &first, &CancellationToken::new())
            .await;
        assert!(report.session.is_resolved());
        assert_eq!(first.corrective_tasks.lock().unwrap()[0].role, Role::CodeEdit);

        let second = ScriptedDriver::new(vec![true], vec![Ok("fixed".into())]);
        let report = engine
            .recover(TaskId::next(), python_app(), name_error(), &second, &CancellationToken::new())
            .await;
        assert_eq!(report.session.state, RecoveryState::Exhausted);
        assert!(report.session.summary.as_deref().unwrap().contains("code modification"));
        assert!(second.corrective_tasks.lock().unwrap().is_empty());
        assert!(second.retried.lock().unwrap().is_empty());
    }
}
