//! 调度器（主控）
//!
//! 每个任务：pending → ready → running → {completed | failed}。
//! - 依赖全部 completed 才 ready；必需依赖失败则不运行直接以 DependencyFailure 失败，
//!   best-effort 依赖失败时照常运行，上下文中带 `degraded:<id>`；
//! - 结果携带动作建议时合成一个依赖原任务的动作任务插入图中（图在运行中增长）；
//! - 动作任务以可恢复错误失败时交给恢复引擎，期间原任务保持 running，
//!   恢复中执行的纠正任务与重试作为记录并入图中；
//! - 取消后不再派发新任务，进行中的任务以 Cancelled 收尾，其余未终止任务标记为 Cancelled。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::core::dispatch::Dispatcher;
use crate::core::{
    EdgeKind, ErrorKind, Role, Task, TaskError, TaskGraph, TaskId, TaskOrigin, TaskResult, TaskState,
};
use crate::intent::Classification;
use crate::recovery::{RecoveryEngine, RecoveryReport, RecoverySession, RecoveryState};

/// 单个任务在聚合结果中的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub role: Role,
    pub origin: TaskOrigin,
    pub dependencies: BTreeMap<TaskId, EdgeKind>,
    pub summary: String,
    pub state: TaskState,
    pub output: String,
    pub error: Option<TaskError>,
    pub recovery: Option<RecoverySession>,
    /// 失败是否影响整体成功
    pub required: bool,
}

/// submit_request 的聚合结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub request_id: String,
    pub intent: Classification,
    pub success: bool,
    pub cancelled: bool,
    pub tasks: Vec<TaskReport>,
}

impl RequestOutcome {
    pub fn task(&self, id: TaskId) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.task_id == id)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| t.state == TaskState::Failed)
    }

    pub fn by_role(&self, role: Role) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(move |t| t.role == role)
    }

    /// 最后一个成功的生成类任务输出（给人看的回答）
    pub fn answer(&self) -> Option<&str> {
        self.tasks
            .iter()
            .rev()
            .filter(|t| t.state == TaskState::Completed && t.role != Role::ToolExecution)
            .find(|t| !matches!(t.origin, TaskOrigin::Recovery { .. }))
            .map(|t| t.output.as_str())
    }
}

#[derive(Debug)]
struct Slot {
    state: TaskState,
    result: Option<TaskResult>,
    recovery: Option<RecoverySession>,
}

impl Slot {
    fn pending() -> Self {
        Self {
            state: TaskState::Pending,
            result: None,
            recovery: None,
        }
    }

    fn finished(result: TaskResult) -> Self {
        let state = if result.is_success() {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        Self {
            state,
            result: Some(result),
            recovery: None,
        }
    }
}

enum Completion {
    Task(Task, TaskResult),
    Recovery(TaskId, RecoveryReport),
}

pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
    recovery: Arc<RecoveryEngine>,
    max_concurrent: usize,
}

impl Scheduler {
    pub fn new(dispatcher: Arc<Dispatcher>, recovery: Arc<RecoveryEngine>, max_concurrent: usize) -> Self {
        Self {
            dispatcher,
            recovery,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub async fn run(&self, request_id: String, intent: Classification, mut graph: TaskGraph) -> RequestOutcome {
        let cancel = self.dispatcher.cancel_token().clone();
        let mut slots: HashMap<TaskId, Slot> = graph.ids().iter().map(|id| (*id, Slot::pending())).collect();
        let mut jobs: JoinSet<Completion> = JoinSet::new();
        let mut running_tasks = 0usize;

        loop {
            if !cancel.is_cancelled() {
                promote(&graph, &mut slots);
                for id in graph.ids().to_vec() {
                    if running_tasks >= self.max_concurrent {
                        break;
                    }
                    let Some(slot) = slots.get_mut(&id) else { continue };
                    if slot.state != TaskState::Ready {
                        continue;
                    }
                    let Some(task) = graph.get(&id) else { continue };
                    let task = with_upstream(task, &slots);
                    if let Some(slot) = slots.get_mut(&id) {
                        slot.state = TaskState::Running;
                    }
                    running_tasks += 1;
                    self.spawn_task(&mut jobs, task);
                }
            }

            let Some(joined) = jobs.join_next().await else { break };
            let completion = match joined {
                Ok(completion) => completion,
                Err(e) => {
                    // 内层 JoinHandle 已吸收 panic，这里只会是运行时关闭
                    tracing::error!(request_id = %request_id, error = %e, "scheduler job aborted");
                    continue;
                }
            };

            match completion {
                Completion::Task(task, result) => {
                    running_tasks = running_tasks.saturating_sub(1);
                    self.on_task_result(&mut graph, &mut slots, &mut jobs, task, result);
                }
                Completion::Recovery(task_id, report) => {
                    on_recovery_report(&mut graph, &mut slots, task_id, report);
                }
            }
        }

        let cancelled = cancel.is_cancelled();
        if cancelled {
            for slot in slots.values_mut().filter(|s| !s.state.is_terminal()) {
                slot.state = TaskState::Failed;
                slot.result = None;
            }
        }
        let outcome = build_outcome(request_id, intent, &graph, slots, cancelled);
        tracing::info!(
            request_id = %outcome.request_id,
            success = outcome.success,
            cancelled = outcome.cancelled,
            tasks = outcome.tasks.len(),
            "request finished"
        );
        outcome
    }

    fn spawn_task(&self, jobs: &mut JoinSet<Completion>, task: Task) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let task_id = task.id;
        jobs.spawn(async move {
            let run = {
                let task = task.clone();
                tokio::spawn(async move { dispatcher.run(&task).await })
            };
            let result = run.await.unwrap_or_else(|e| {
                TaskResult::fail(task_id, ErrorKind::ExecutionFailed, format!("worker panicked: {}", e))
            });
            Completion::Task(task, result)
        });
    }

    fn spawn_recovery(&self, jobs: &mut JoinSet<Completion>, task: &Task, error: TaskError) {
        let Some(action) = task.action.clone() else { return };
        let dispatcher = Arc::clone(&self.dispatcher);
        let engine = Arc::clone(&self.recovery);
        let task_id = task.id;
        let aborted = RecoverySession::new(task_id, action.clone(), error.clone());
        jobs.spawn(async move {
            let cancel = dispatcher.cancel_token().clone();
            let run = tokio::spawn(async move {
                engine
                    .recover(task_id, action, error, dispatcher.as_ref(), &cancel)
                    .await
            });
            let report = match run.await {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!(task_id = %task_id, error = %e, "recovery panicked");
                    let mut session = aborted;
                    session.summary = Some(format!("Recovery aborted: {}", e));
                    session.transition(RecoveryState::Exhausted);
                    RecoveryReport {
                        session,
                        executed: Vec::new(),
                    }
                }
            };
            Completion::Recovery(task_id, report)
        });
    }

    fn on_task_result(
        &self,
        graph: &mut TaskGraph,
        slots: &mut HashMap<TaskId, Slot>,
        jobs: &mut JoinSet<Completion>,
        task: Task,
        result: TaskResult,
    ) {
        let cancelled = self.dispatcher.cancel_token().is_cancelled();
        let Some(slot) = slots.get_mut(&result.task_id) else {
            return;
        };

        if let Some(error) = result.error.clone() {
            let recoverable = task.role == Role::ToolExecution
                && task.action.is_some()
                && error.kind.is_recoverable()
                && !cancelled;
            slot.result = Some(result);
            if recoverable {
                tracing::info!(task_id = %task.id, kind = %error.kind, "action failed, starting recovery");
                self.spawn_recovery(jobs, &task, error);
            } else {
                slot.state = TaskState::Failed;
            }
            return;
        }

        slot.state = TaskState::Completed;
        let suggestion = result.suggestion.clone();
        slot.result = Some(result);

        if let (Some(action), false) = (suggestion, cancelled) {
            let follow = Task::action(action, TaskOrigin::Suggested { from: task.id })
                .depends_on(task.id, EdgeKind::Required);
            tracing::info!(task_id = %follow.id, from = %task.id, summary = %follow.prompt, "suggested action queued");
            insert_slot(graph, slots, follow, Slot::pending());
        }
    }
}

/// 推进 pending 任务；插入顺序即拓扑序，单遍即可完成级联
fn promote(graph: &TaskGraph, slots: &mut HashMap<TaskId, Slot>) {
    for id in graph.ids() {
        if slots.get(id).map(|s| s.state) != Some(TaskState::Pending) {
            continue;
        }
        let Some(task) = graph.get(id) else { continue };
        let mut blocked = false;
        let mut failed_required = None;
        for (dep, edge) in &task.dependencies {
            match (slots.get(dep).map(|s| s.state), edge) {
                (Some(TaskState::Completed), _) => {}
                (Some(TaskState::Failed), EdgeKind::BestEffort) => {}
                (Some(TaskState::Failed), EdgeKind::Required) => {
                    failed_required = Some(*dep);
                    break;
                }
                _ => blocked = true,
            }
        }
        if let Some(slot) = slots.get_mut(id) {
            if let Some(dep) = failed_required {
                tracing::debug!(task_id = %id, dependency = %dep, "dependency failed, skipping");
                *slot = Slot::finished(TaskResult::fail(
                    *id,
                    ErrorKind::DependencyFailure,
                    format!("required dependency {} failed", dep),
                ));
            } else if !blocked {
                slot.state = TaskState::Ready;
            }
        }
    }
}

/// 派发用副本：写入上游输出与降级标记
fn with_upstream(task: &Task, slots: &HashMap<TaskId, Slot>) -> Task {
    let mut prepared = task.clone();
    for dep in task.dependencies.keys() {
        let Some(result) = slots.get(dep).and_then(|s| s.result.as_ref()) else {
            continue;
        };
        match &result.error {
            None => {
                prepared
                    .context
                    .insert(format!("upstream:{}", dep), result.output.clone());
            }
            Some(e) => {
                prepared
                    .context
                    .insert(format!("degraded:{}", dep), e.to_string());
            }
        }
    }
    prepared
}

fn insert_slot(graph: &mut TaskGraph, slots: &mut HashMap<TaskId, Slot>, task: Task, slot: Slot) {
    let id = task.id;
    match graph.insert(task) {
        Ok(_) => {
            slots.insert(id, slot);
        }
        Err(e) => tracing::error!(task_id = %id, error = %e, "task insert failed"),
    }
}

fn on_recovery_report(
    graph: &mut TaskGraph,
    slots: &mut HashMap<TaskId, Slot>,
    task_id: TaskId,
    report: RecoveryReport,
) {
    for executed in report.executed {
        let slot = Slot::finished(executed.result);
        insert_slot(graph, slots, executed.task, slot);
    }
    let Some(slot) = slots.get_mut(&task_id) else { return };
    let session = report.session;
    if session.is_resolved() {
        slot.state = TaskState::Completed;
        slot.result = Some(TaskResult::success(
            task_id,
            session.final_output.clone().unwrap_or_default(),
        ));
    } else {
        slot.state = TaskState::Failed;
    }
    tracing::info!(task_id = %task_id, session = %session.id, state = ?session.state, "recovery finished");
    slot.recovery = Some(session);
}

/// 可选任务：恢复记录，或有下游且所有下游边都是 best-effort
fn is_required(task: &Task, graph: &TaskGraph) -> bool {
    if matches!(task.origin, TaskOrigin::Recovery { .. }) {
        return false;
    }
    let dependents = graph.dependents(&task.id);
    dependents.is_empty()
        || dependents.iter().any(|d| {
            graph
                .get(d)
                .and_then(|t| t.dependencies.get(&task.id))
                .map_or(true, |edge| *edge == EdgeKind::Required)
        })
}

fn build_outcome(
    request_id: String,
    intent: Classification,
    graph: &TaskGraph,
    mut slots: HashMap<TaskId, Slot>,
    cancelled: bool,
) -> RequestOutcome {
    let tasks: Vec<TaskReport> = graph
        .tasks()
        .map(|task| {
            let slot = slots.remove(&task.id).unwrap_or_else(Slot::pending);
            let (output, error) = match slot.result {
                Some(result) => (result.output, result.error),
                None if slot.state == TaskState::Failed => (String::new(), Some(TaskError::cancelled())),
                None => (String::new(), None),
            };
            TaskReport {
                task_id: task.id,
                role: task.role,
                origin: task.origin,
                dependencies: task.dependencies.clone(),
                summary: task.action.as_ref().map(|a| a.summary()).unwrap_or_else(|| task.prompt.clone()),
                state: slot.state,
                output,
                error,
                recovery: slot.recovery,
                required: is_required(task, graph),
            }
        })
        .collect();
    let success = !cancelled
        && tasks
            .iter()
            .filter(|t| t.required)
            .all(|t| t.state == TaskState::Completed);
    RequestOutcome {
        request_id,
        intent,
        success,
        cancelled,
        tasks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{ResolvedResources, ResourceNeeds, Worker, WorkerRegistry};
    use crate::cache::{InMemoryStoreProvider, RegistryModelLoader, SharedResources, TenantScope};
    use crate::config::{CacheSection, GatewaySection, LlmSection, RecoverySection};
    use crate::core::ActionSuggestion;
    use crate::gateway::{
        ActionGateway, AuditFilter, AuditSink, AutoApproveConfirmation, ConfirmationChannel, DenyAllConfirmation,
        InMemoryAuditSink, ProcessOutput, ProcessRunner, RunError, TokioProcessRunner,
    };
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// 记录开始 / 结束顺序；prompt 中含 "fail" 时失败，含 "write" 时建议写文件
    struct TraceWorker {
        role: Role,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Worker for TraceWorker {
        fn role(&self) -> Role {
            self.role
        }

        fn needs(&self) -> ResourceNeeds {
            ResourceNeeds::default()
        }

        async fn execute(&self, task: &Task, _resources: &ResolvedResources) -> TaskResult {
            self.log.lock().unwrap().push(format!("start {}", task.prompt));
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.log.lock().unwrap().push(format!("end {}", task.prompt));
            if task.prompt.contains("fail") {
                return TaskResult::fail(task.id, ErrorKind::ExecutionFailed, "boom");
            }
            let upstream: Vec<&str> = task.upstream_outputs().collect();
            let result = TaskResult::success(task.id, format!("{} <- [{}]", task.prompt, upstream.join(",")));
            if task.prompt.contains("write") {
                return result.with_suggestion(Some(ActionSuggestion::CreateFile {
                    path: "note.txt".into(),
                    content: "hi".into(),
                }));
            }
            result
        }
    }

    /// 记录同时运行的最大任务数
    #[derive(Default)]
    struct PeakWorker {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Worker for PeakWorker {
        fn role(&self) -> Role {
            Role::WebResearch
        }

        fn needs(&self) -> ResourceNeeds {
            ResourceNeeds::default()
        }

        async fn execute(&self, task: &Task, _resources: &ResolvedResources) -> TaskResult {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(40)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            TaskResult::success(task.id, task.prompt.clone())
        }
    }

    /// 每条命令都以缺失模块失败；`panic_after` 次之后的调用直接 panic
    struct BrokenRunner {
        calls: AtomicUsize,
        panic_after: usize,
    }

    impl BrokenRunner {
        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                panic_after: usize::MAX,
            })
        }

        fn panicking_after(n: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                panic_after: n,
            })
        }
    }

    #[async_trait]
    impl ProcessRunner for BrokenRunner {
        async fn run(&self, _argv: &[String], _cwd: &Path, _timeout: Duration) -> Result<ProcessOutput, RunError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n >= self.panic_after {
                panic!("runner crashed");
            }
            Ok(ProcessOutput {
                stdout: String::new(),
                stderr: "ModuleNotFoundError: No module named 'requests'".into(),
                exit_code: Some(1),
            })
        }
    }

    struct Fixture {
        scheduler: Scheduler,
        log: Arc<Mutex<Vec<String>>>,
        peak: Arc<PeakWorker>,
        audit: Arc<InMemoryAuditSink>,
        _dir: tempfile::TempDir,
    }

    fn fixture(cancel: CancellationToken) -> Fixture {
        fixture_with(
            cancel,
            Arc::new(TokioProcessRunner::new(4096)),
            Arc::new(DenyAllConfirmation),
            4,
        )
    }

    fn fixture_with(
        cancel: CancellationToken,
        runner: Arc<dyn ProcessRunner>,
        confirmation: Arc<dyn ConfirmationChannel>,
        max_concurrent: usize,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let peak = Arc::new(PeakWorker::default());
        let mut workers = WorkerRegistry::new();
        for role in [Role::ContextRetrieval, Role::Generation] {
            workers.register(TraceWorker {
                role,
                log: log.clone(),
            });
        }
        workers.register_arc(peak.clone());
        let audit = Arc::new(InMemoryAuditSink::new());
        let resources = SharedResources::new(
            Arc::new(RegistryModelLoader::default()),
            Arc::new(InMemoryStoreProvider::default()),
            &CacheSection::default(),
            LlmSection::default(),
        );
        let gateway = ActionGateway::new(&GatewaySection::default(), dir.path(), runner, confirmation, audit.clone());
        let dispatcher = Dispatcher::new(
            Arc::new(workers),
            Arc::new(resources),
            Arc::new(gateway),
            TenantScope::new("acme", None),
            cancel,
        );
        let recovery = RecoveryEngine::new(&RecoverySection::default(), audit.clone(), "hive");
        Fixture {
            scheduler: Scheduler::new(Arc::new(dispatcher), Arc::new(recovery), max_concurrent),
            log,
            peak,
            audit,
            _dir: dir,
        }
    }

    fn python_app() -> ActionSuggestion {
        ActionSuggestion::RunTerminalCommand {
            argv: vec!["python3".into(), "app.py".into()],
        }
    }

    fn chain(first: &str, second: &str, edge: EdgeKind) -> TaskGraph {
        let mut graph = TaskGraph::new();
        let a = Task::new(Role::ContextRetrieval, first);
        let b = Task::new(Role::Generation, second).depends_on(a.id, edge);
        graph.insert(a).unwrap();
        graph.insert(b).unwrap();
        graph
    }

    #[tokio::test]
    async fn test_dependent_starts_after_dependency_completes() {
        let f = fixture(CancellationToken::new());
        let outcome = f
            .scheduler
            .run("r1".into(), Classification::unknown(), chain("a", "b", EdgeKind::Required))
            .await;
        assert!(outcome.success);
        let log = f.log.lock().unwrap().clone();
        assert_eq!(log, vec!["start a", "end a", "start b", "end b"]);
        assert_eq!(outcome.tasks[1].output, "b <- [a <- []]");
    }

    #[tokio::test]
    async fn test_required_failure_propagates_without_running() {
        let f = fixture(CancellationToken::new());
        let outcome = f
            .scheduler
            .run("r2".into(), Classification::unknown(), chain("fail", "b", EdgeKind::Required))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.tasks[1].state, TaskState::Failed);
        assert_eq!(
            outcome.tasks[1].error.as_ref().map(|e| e.kind),
            Some(ErrorKind::DependencyFailure)
        );
        assert!(!f.log.lock().unwrap().iter().any(|l| l == "start b"));
    }

    #[tokio::test]
    async fn test_best_effort_failure_degrades() {
        let f = fixture(CancellationToken::new());
        let outcome = f
            .scheduler
            .run("r3".into(), Classification::unknown(), chain("fail", "b", EdgeKind::BestEffort))
            .await;
        assert!(outcome.success);
        assert!(!outcome.tasks[0].required);
        assert_eq!(outcome.tasks[1].state, TaskState::Completed);
        assert_eq!(outcome.answer(), Some("b <- []"));
    }

    #[tokio::test]
    async fn test_suggestion_grows_graph() {
        let f = fixture(CancellationToken::new());
        let mut graph = TaskGraph::new();
        graph.insert(Task::new(Role::Generation, "write a note")).unwrap();
        let outcome = f.scheduler.run("r4".into(), Classification::unknown(), graph).await;

        assert!(outcome.success);
        assert_eq!(outcome.tasks.len(), 2);
        let action = &outcome.tasks[1];
        assert_eq!(action.role, Role::ToolExecution);
        assert_eq!(action.origin, TaskOrigin::Suggested { from: outcome.tasks[0].task_id });
        assert_eq!(action.state, TaskState::Completed);
        assert_eq!(f.audit.query(&AuditFilter::new()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_request_marks_pending_tasks() {
        let token = CancellationToken::new();
        token.cancel();
        let f = fixture(token);
        let outcome = f
            .scheduler
            .run("r5".into(), Classification::unknown(), chain("a", "b", EdgeKind::Required))
            .await;
        assert!(outcome.cancelled);
        assert!(!outcome.success);
        assert!(outcome
            .tasks
            .iter()
            .all(|t| t.error.as_ref().map(|e| e.kind) == Some(ErrorKind::Cancelled)));
        assert!(f.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_running_tasks_never_exceed_pool_size() {
        let f = fixture_with(
            CancellationToken::new(),
            Arc::new(TokioProcessRunner::new(4096)),
            Arc::new(DenyAllConfirmation),
            2,
        );
        let mut graph = TaskGraph::new();
        for i in 0..6 {
            graph.insert(Task::new(Role::WebResearch, format!("topic {}", i))).unwrap();
        }
        let outcome = f.scheduler.run("r6".into(), Classification::unknown(), graph).await;
        assert!(outcome.success);
        assert_eq!(f.peak.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhausted_recovery_fails_required_dependents() {
        let runner = BrokenRunner::failing();
        let f = fixture_with(
            CancellationToken::new(),
            runner.clone(),
            Arc::new(AutoApproveConfirmation::new()),
            4,
        );
        let mut graph = TaskGraph::new();
        let tool = Task::action(python_app(), TaskOrigin::Planned);
        let report = Task::new(Role::Generation, "report").depends_on(tool.id, EdgeKind::Required);
        let notes = Task::new(Role::ContextRetrieval, "notes").depends_on(tool.id, EdgeKind::BestEffort);
        let (tool_id, report_id, notes_id) = (tool.id, report.id, notes.id);
        graph.insert(tool).unwrap();
        graph.insert(report).unwrap();
        graph.insert(notes).unwrap();

        let outcome = f.scheduler.run("r7".into(), Classification::unknown(), graph).await;
        assert!(!outcome.success);

        let tool = outcome.task(tool_id).unwrap();
        assert_eq!(tool.state, TaskState::Failed);
        assert!(tool.required);
        let session = tool.recovery.as_ref().unwrap();
        assert_eq!(session.state, RecoveryState::Exhausted);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 4);

        let report = outcome.task(report_id).unwrap();
        assert_eq!(report.state, TaskState::Failed);
        assert_eq!(report.error.as_ref().map(|e| e.kind), Some(ErrorKind::DependencyFailure));
        assert!(!f.log.lock().unwrap().iter().any(|l| l == "start report"));

        let notes = outcome.task(notes_id).unwrap();
        assert_eq!(notes.state, TaskState::Completed);
        assert!(f.log.lock().unwrap().iter().any(|l| l == "start notes"));
    }

    #[tokio::test]
    async fn test_recovery_panic_keeps_pool_accounting() {
        let f = fixture_with(
            CancellationToken::new(),
            BrokenRunner::panicking_after(1),
            Arc::new(AutoApproveConfirmation::new()),
            1,
        );
        let mut graph = TaskGraph::new();
        let tool = Task::action(python_app(), TaskOrigin::Planned);
        let after = Task::new(Role::Generation, "after").depends_on(tool.id, EdgeKind::Required);
        let (tool_id, after_id) = (tool.id, after.id);
        graph.insert(tool).unwrap();
        graph.insert(after).unwrap();
        for i in 0..3 {
            graph.insert(Task::new(Role::WebResearch, format!("topic {}", i))).unwrap();
        }

        let outcome = f.scheduler.run("r8".into(), Classification::unknown(), graph).await;
        assert!(!outcome.success);
        assert_eq!(outcome.tasks.len(), 5);

        let tool = outcome.task(tool_id).unwrap();
        assert_eq!(tool.state, TaskState::Failed);
        let session = tool.recovery.as_ref().unwrap();
        assert_eq!(session.state, RecoveryState::Exhausted);
        assert!(session.summary.as_deref().unwrap().starts_with("Recovery aborted"));
        assert_eq!(
            outcome.task(after_id).unwrap().error.as_ref().map(|e| e.kind),
            Some(ErrorKind::DependencyFailure)
        );
        assert_eq!(f.peak.peak.load(Ordering::SeqCst), 1);
    }
}
