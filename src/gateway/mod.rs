//! 动作执行网关
//!
//! 每个副作用动作（写文件、执行命令）都经过同一条流水线：
//! 分级（classified）→ 校验（validated）→ 确认（仅 restricted / admin）→ 沙箱执行 → 终态。
//!
//! - 风险等级由 [`ActionPolicy`] 静态推导，从不信任调用方；
//! - 校验与等级无关，先于确认执行，失败即 `rejected`，不会进入确认或执行；
//! - 确认是注入的 [`ConfirmationChannel`]，网关施加超时与取消，超时视为拒绝；
//! - 执行经注入的 [`ProcessRunner`] 或根目录受限的 [`SafeFs`]，总有墙钟与大小上限；
//! - 每个终态（succeeded / rejected / errored）在返回前恰好追加一条 [`AuditEvent`]。

pub mod audit;
pub mod confirm;
pub mod fs;
pub mod policy;
pub mod runner;
pub mod validation;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::GatewaySection;
use crate::core::{ActionRequest, ActionSuggestion, ErrorKind, TaskError, TaskId, TaskResult};

pub use audit::{
    AuditDecision, AuditError, AuditEvent, AuditFilter, AuditOutcome, AuditSink, InMemoryAuditSink,
    SqliteAuditSink,
};
pub use confirm::{
    AutoApproveConfirmation, ChannelConfirmation, ConfirmationChannel, ConfirmationDecision,
    ConfirmationRequest, DenyAllConfirmation, PendingConfirmation,
};
pub use fs::{FileWrite, FsError, SafeFs};
pub use policy::{ActionPolicy, RiskTier};
pub use runner::{ProcessOutput, ProcessRunner, RunError, TokioProcessRunner};
pub use validation::Validator;

/// 动作终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Succeeded,
    Rejected,
    Errored,
}

/// submit 的返回值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayOutcome {
    pub action_id: String,
    pub tier: RiskTier,
    pub state: ActionState,
    pub output: String,
    pub error: Option<TaskError>,
    /// 审计事件未能写入时的存储错误；动作本身的结果不受影响
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_error: Option<String>,
}

impl GatewayOutcome {
    pub fn is_success(&self) -> bool {
        self.state == ActionState::Succeeded
    }

    pub fn into_task_result(self, task_id: TaskId) -> TaskResult {
        match (self.state, self.error) {
            (ActionState::Succeeded, _) => TaskResult::success(task_id, self.output),
            (_, Some(error)) => TaskResult::failure(task_id, error),
            (state, None) => TaskResult::fail(
                task_id,
                ErrorKind::ExecutionFailed,
                format!("action {} ended {:?}", self.action_id, state),
            ),
        }
    }
}

/// 网关各阶段的超时
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayTimeouts {
    pub confirmation: Duration,
    pub admin_confirmation: Duration,
    pub execution: Duration,
}

impl GatewayTimeouts {
    pub fn from_config(cfg: &GatewaySection) -> Self {
        Self {
            confirmation: cfg.confirmation_timeout(),
            admin_confirmation: cfg.admin_confirmation_timeout(),
            execution: cfg.command_timeout(),
        }
    }
}

/// 动作执行网关
pub struct ActionGateway {
    policy: ActionPolicy,
    validator: Validator,
    fs: SafeFs,
    runner: Arc<dyn ProcessRunner>,
    confirmation: Arc<dyn ConfirmationChannel>,
    audit: Arc<dyn AuditSink>,
    timeouts: GatewayTimeouts,
    admin_phrase: String,
    audit_failures: AtomicU64,
}

impl ActionGateway {
    pub fn new(
        cfg: &GatewaySection,
        root: impl AsRef<Path>,
        runner: Arc<dyn ProcessRunner>,
        confirmation: Arc<dyn ConfirmationChannel>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let policy = ActionPolicy::from_config(&cfg.policy);
        let fs = SafeFs::new(root, cfg.max_file_bytes);
        let validator = Validator::new(fs.clone(), policy.allowed_programs());
        Self {
            policy,
            validator,
            fs,
            runner,
            confirmation,
            audit,
            timeouts: GatewayTimeouts::from_config(cfg),
            admin_phrase: cfg.admin_phrase.clone(),
            audit_failures: AtomicU64::new(0),
        }
    }

    pub fn with_timeouts(mut self, timeouts: GatewayTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn policy(&self) -> &ActionPolicy {
        &self.policy
    }

    pub fn root(&self) -> &Path {
        self.fs.root()
    }

    pub fn audit_sink(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// 向审计存储追加一条事件；失败计数并返回，由调用方附在结果上
    pub fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.audit.append(event).map_err(|e| {
            self.audit_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(action_id = %event.action_id, error = %e, "audit append failed");
            e
        })
    }

    /// 启动以来写入失败的审计事件数
    pub fn audit_failures(&self) -> u64 {
        self.audit_failures.load(Ordering::Relaxed)
    }

    pub async fn submit(&self, request: ActionRequest) -> GatewayOutcome {
        self.submit_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// 带取消的提交：取消时不会留下悬挂的确认等待
    pub async fn submit_with_cancel(
        &self,
        request: ActionRequest,
        cancel: &CancellationToken,
    ) -> GatewayOutcome {
        let tier = self.policy.classify(&request.action);
        tracing::info!(
            action_id = %request.action_id,
            tier = %tier,
            summary = %request.action.summary(),
            "action classified"
        );

        if let Err(reason) = self.validator.validate(&request.action) {
            let error = TaskError::new(ErrorKind::ValidationRejected, reason);
            return self.finish(&request, tier, AuditDecision::Invalid, ActionState::Rejected, Err(error));
        }

        let decision = if tier == RiskTier::AutoAllowed {
            AuditDecision::AutoAllowed
        } else {
            match self.confirm(&request, tier, cancel).await {
                Ok(()) => AuditDecision::Approved,
                Err((decision, error)) => {
                    return self.finish(&request, tier, decision, ActionState::Rejected, Err(error));
                }
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TaskError::cancelled()),
            result = self.execute(&request.action) => result,
        };
        let (decision, state) = match &result {
            Ok(_) => (decision, ActionState::Succeeded),
            Err(e) if e.kind == ErrorKind::Cancelled => (AuditDecision::Cancelled, ActionState::Errored),
            Err(_) => (decision, ActionState::Errored),
        };
        self.finish(&request, tier, decision, state, result)
    }

    async fn confirm(
        &self,
        request: &ActionRequest,
        tier: RiskTier,
        cancel: &CancellationToken,
    ) -> Result<(), (AuditDecision, TaskError)> {
        let timeout = match tier {
            RiskTier::Admin => self.timeouts.admin_confirmation,
            _ => self.timeouts.confirmation,
        };
        let pending = ConfirmationRequest {
            action_id: request.action_id.clone(),
            summary: request.action.summary(),
            tier,
            requested_at: Utc::now(),
        };
        let denied = |reason: String| -> Result<(), (AuditDecision, TaskError)> {
            Err((
                AuditDecision::Denied,
                TaskError::new(ErrorKind::ConfirmationDenied, reason),
            ))
        };

        let answer = tokio::select! {
            _ = cancel.cancelled() => {
                return Err((AuditDecision::Cancelled, TaskError::cancelled()));
            }
            answer = tokio::time::timeout(timeout, self.confirmation.request(pending)) => answer,
        };
        match answer {
            Err(_) => denied(format!("no confirmation within {:?}", timeout)),
            Ok(d) if d.action_id != request.action_id => {
                denied(format!("decision was for another action ({})", d.action_id))
            }
            Ok(d) if !d.approved => denied(format!("denied: {}", d.reason)),
            Ok(d) if tier == RiskTier::Admin
                && d.token.as_deref() != Some(self.admin_phrase.as_str()) =>
            {
                denied("admin action requires the confirmation phrase".to_string())
            }
            Ok(_) => Ok(()),
        }
    }

    async fn execute(&self, action: &ActionSuggestion) -> Result<String, TaskError> {
        let limit = self.timeouts.execution;
        if let ActionSuggestion::RunTerminalCommand { argv } = action {
            return match self.runner.run(argv, self.fs.root(), limit).await {
                Ok(out) if out.success() => Ok(join_streams(&out)),
                Ok(out) => Err(TaskError::new(
                    ErrorKind::ExecutionFailed,
                    format!(
                        "`{}` exited with {}: {}",
                        argv.join(" "),
                        out.exit_code
                            .map_or_else(|| "signal".to_string(), |c| c.to_string()),
                        join_streams(&out)
                    ),
                )),
                Err(RunError::Timeout(d)) => Err(TaskError::new(
                    ErrorKind::ExecutionTimeout,
                    format!("`{}` timed out after {:?}", argv.join(" "), d),
                )),
                Err(e @ RunError::OutputLimit { .. }) => {
                    Err(TaskError::new(ErrorKind::ResourceLimit, e.to_string()))
                }
                Err(e) => Err(TaskError::new(ErrorKind::ExecutionFailed, e.to_string())),
            };
        }
        match tokio::time::timeout(limit, self.file_operation(action)).await {
            Ok(result) => result.map_err(|e| TaskError::new(e.kind(), e.to_string())),
            Err(_) => Err(TaskError::new(
                ErrorKind::ExecutionTimeout,
                format!("{} timed out after {:?}", action.tool_name(), limit),
            )),
        }
    }

    async fn file_operation(&self, action: &ActionSuggestion) -> Result<String, FsError> {
        match action {
            ActionSuggestion::CreateFile { path, content } => {
                let write = self.fs.create_file(path, content).await?;
                Ok(describe_write("Created", path, &write))
            }
            ActionSuggestion::EditFile { path, content } => {
                let write = self.fs.edit_file(path, content).await?;
                Ok(describe_write("Edited", path, &write))
            }
            ActionSuggestion::ReadFile { path } => self.fs.read_file(path).await,
            ActionSuggestion::ListDir { path } => Ok(self.fs.list_dir(path).await?.join("\n")),
            ActionSuggestion::RunTerminalCommand { .. } => {
                Err(FsError::InvalidPath("not a file operation".to_string()))
            }
        }
    }

    fn finish(
        &self,
        request: &ActionRequest,
        tier: RiskTier,
        decision: AuditDecision,
        state: ActionState,
        result: Result<String, TaskError>,
    ) -> GatewayOutcome {
        let (output, error) = match result {
            Ok(output) => (output, None),
            Err(e) => (String::new(), Some(e)),
        };
        let outcome = match state {
            ActionState::Succeeded => AuditOutcome::Succeeded,
            ActionState::Rejected => AuditOutcome::Rejected,
            ActionState::Errored => AuditOutcome::Errored,
        };
        let detail = error.as_ref().map(|e| e.to_string()).unwrap_or_default();
        let event = AuditEvent::new(
            request.actor.clone(),
            request.action_id.clone(),
            request.action.summary(),
            decision,
            outcome,
        )
        .with_tier(tier)
        .with_detail(detail.clone());
        let audit_error = self.record(&event).err().map(|e| e.to_string());

        let audit = serde_json::json!({
            "event": "action_audit",
            "action_id": request.action_id,
            "task_id": request.requesting_task.map(|t| t.to_string()),
            "tool": request.action.tool_name(),
            "tier": tier.as_str(),
            "decision": decision,
            "outcome": outcome.as_str(),
            "detail": detail,
            "audit_error": audit_error,
        });
        tracing::info!(audit = %audit.to_string(), "action");

        GatewayOutcome {
            action_id: request.action_id.clone(),
            tier,
            state,
            output,
            error,
            audit_error,
        }
    }
}

fn join_streams(out: &ProcessOutput) -> String {
    let stdout = out.stdout.trim();
    let stderr = out.stderr.trim();
    match (stdout.is_empty(), stderr.is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{}\nstderr: {}", stdout, stderr),
    }
}

fn describe_write(verb: &str, path: &str, write: &FileWrite) -> String {
    match &write.backup {
        Some(backup) => format!(
            "{} {} ({} bytes), previous version saved to {}",
            verb,
            path,
            write.bytes,
            backup.display()
        ),
        None => format!("{} {} ({} bytes)", verb, path, write.bytes),
    }
}
