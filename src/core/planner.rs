//! 任务图构建
//!
//! 路由表（意图标签 → 有序步骤）来自配置；这里只负责实例化任务并连接依赖边：
//! 每一步依赖紧邻的前一步，除非标记 independent；best_effort 的边在上游失败时降级而非失败。
//! 意图不可路由（无路由、置信度过低、路由中的角色未注册）时走默认回退
//! （context_retrieval → generation），回退也关闭时返回 UnroutableIntent。

use std::collections::{HashMap, HashSet};

use crate::config::{RouteStep, RoutingSection};
use crate::core::{EdgeKind, HiveError, Role, Task, TaskGraph, TaskId};
use crate::intent::Classification;

/// 可由路由表规划的工作者角色（动作执行任务只由动作建议合成）
const PLANNABLE_ROLES: [Role; 4] = [
    Role::ContextRetrieval,
    Role::Generation,
    Role::WebResearch,
    Role::CodeEdit,
];

#[derive(Debug, Clone)]
pub struct TaskGraphBuilder {
    routes: HashMap<String, Vec<RouteStep>>,
    fallback: Option<Vec<RouteStep>>,
    min_confidence: f32,
    available: HashSet<Role>,
}

impl TaskGraphBuilder {
    pub fn from_config(cfg: &RoutingSection) -> Self {
        Self {
            routes: cfg.intents.clone(),
            fallback: cfg.fallback_enabled.then(|| cfg.fallback.clone()),
            min_confidence: cfg.min_confidence,
            available: PLANNABLE_ROLES.into_iter().collect(),
        }
    }

    /// 限定为已注册工作者的角色
    pub fn with_available_roles(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
        self.available = roles
            .into_iter()
            .filter(|r| PLANNABLE_ROLES.contains(r))
            .collect();
        self
    }

    pub fn fallback(&self) -> Option<&[RouteStep]> {
        self.fallback.as_deref()
    }

    fn routable(&self, steps: &[RouteStep]) -> bool {
        !steps.is_empty() && steps.iter().all(|s| self.available.contains(&s.role))
    }

    /// 选择意图对应的步骤
    pub fn route(&self, intent: &Classification) -> Result<&[RouteStep], HiveError> {
        let routed = (intent.confidence >= self.min_confidence)
            .then(|| self.routes.get(&intent.label))
            .flatten()
            .filter(|steps| self.routable(steps));
        if let Some(steps) = routed {
            return Ok(steps);
        }
        match &self.fallback {
            Some(steps) if self.routable(steps) => {
                tracing::debug!(intent = %intent.label, confidence = intent.confidence, "using fallback route");
                Ok(steps)
            }
            _ => Err(HiveError::UnroutableIntent(intent.label.clone())),
        }
    }

    pub fn build(&self, request_text: &str, intent: &Classification) -> Result<TaskGraph, HiveError> {
        let steps = self.route(intent)?;
        let mut graph = TaskGraph::new();
        let mut previous: Option<TaskId> = None;
        for step in steps {
            let mut task = Task::new(step.role, request_text).with_context("intent", intent.label.clone());
            if let (Some(prev), false) = (previous, step.independent) {
                let edge = if step.best_effort {
                    EdgeKind::BestEffort
                } else {
                    EdgeKind::Required
                };
                task = task.depends_on(prev, edge);
            }
            previous = Some(graph.insert(task)?);
        }
        tracing::info!(intent = %intent.label, tasks = graph.len(), "task graph built");
        Ok(graph)
    }
}
