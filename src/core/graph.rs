//! 任务依赖图
//!
//! 插入顺序即拓扑序：insert 要求所有依赖已存在于图中，因此图按构造即无环。
//! 调度期间允许动态插入（动作建议任务、恢复任务）。

use std::collections::{HashMap, HashSet};

use crate::core::{HiveError, Task, TaskId};

/// 有序任务集合 + 反向邻接表
#[derive(Debug, Default, Clone)]
pub struct TaskGraph {
    order: Vec<TaskId>,
    tasks: HashMap<TaskId, Task>,
    /// 任务 ID -> 依赖它的任务
    dependents: HashMap<TaskId, Vec<TaskId>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入任务；依赖必须引用图中已有任务
    pub fn insert(&mut self, task: Task) -> Result<TaskId, HiveError> {
        if self.tasks.contains_key(&task.id) {
            return Err(HiveError::DuplicateTask(task.id));
        }
        if let Some(missing) = task.dependencies.keys().find(|d| !self.tasks.contains_key(d)) {
            return Err(HiveError::UnknownDependency {
                task: task.id,
                dependency: *missing,
            });
        }
        let id = task.id;
        for dep in task.dependencies.keys() {
            self.dependents.entry(*dep).or_default().push(id);
        }
        self.order.push(id);
        self.tasks.insert(id, task);
        Ok(id)
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    /// 按插入顺序的任务 ID
    pub fn ids(&self) -> &[TaskId] {
        &self.order
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    pub fn dependents(&self, id: &TaskId) -> &[TaskId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// 是否存在传递依赖自身的任务（DFS 三色标记）
    pub fn has_cycle(&self) -> bool {
        fn visit(
            graph: &TaskGraph,
            id: TaskId,
            visiting: &mut HashSet<TaskId>,
            done: &mut HashSet<TaskId>,
        ) -> bool {
            if done.contains(&id) {
                return false;
            }
            if !visiting.insert(id) {
                return true;
            }
            let cyclic = graph
                .get(&id)
                .map(|t| t.dependencies.keys().any(|d| visit(graph, *d, visiting, done)))
                .unwrap_or(false);
            visiting.remove(&id);
            done.insert(id);
            cyclic
        }

        let mut visiting = HashSet::new();
        let mut done = HashSet::new();
        self.order
            .iter()
            .any(|id| visit(self, *id, &mut visiting, &mut done))
    }
}
