//! 审计日志
//!
//! AuditEvent 只追加、不修改。SqliteAuditSink 用触发器在存储层拒绝 UPDATE / DELETE；
//! 追加在连接锁内单条 INSERT 完成，并发写入方之间没有读-改-写。

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::RiskTier;

/// 决策：动作是如何被放行或拦下的
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    AutoAllowed,
    Approved,
    Denied,
    Invalid,
    Cancelled,
    /// 恢复引擎记录
    Recovery,
}

/// 终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Succeeded,
    Rejected,
    Errored,
    Resolved,
    Exhausted,
    AttemptFailed,
    AttemptSucceeded,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Succeeded => "succeeded",
            AuditOutcome::Rejected => "rejected",
            AuditOutcome::Errored => "errored",
            AuditOutcome::Resolved => "resolved",
            AuditOutcome::Exhausted => "exhausted",
            AuditOutcome::AttemptFailed => "attempt_failed",
            AuditOutcome::AttemptSucceeded => "attempt_succeeded",
        }
    }
}

/// 审计事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action_id: String,
    pub action_summary: String,
    pub tier: Option<RiskTier>,
    pub decision: AuditDecision,
    pub outcome: AuditOutcome,
    pub detail: String,
}

impl AuditEvent {
    pub fn new(
        actor: impl Into<String>,
        action_id: impl Into<String>,
        action_summary: impl Into<String>,
        decision: AuditDecision,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor: actor.into(),
            action_id: action_id.into(),
            action_summary: action_summary.into(),
            tier: None,
            decision,
            outcome,
            detail: String::new(),
        }
    }

    pub fn with_tier(mut self, tier: RiskTier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Audit serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// 审计查询条件；limit 取最近的 N 条，结果按追加顺序返回
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditFilter {
    pub actor: Option<String>,
    pub action_id: Option<String>,
    pub outcome: Option<AuditOutcome>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn action_id(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = Some(action_id.into());
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.actor.as_ref().map_or(true, |a| &event.actor == a)
            && self.action_id.as_ref().map_or(true, |a| &event.action_id == a)
            && self.outcome.map_or(true, |o| event.outcome == o)
            && self.since.map_or(true, |s| event.timestamp >= s)
    }
}

/// 审计存储能力
pub trait AuditSink: Send + Sync {
    fn append(&self, event: &AuditEvent) -> Result<(), AuditError>;
    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, AuditError>;
}

/// 进程内审计存储（无持久化需求时使用）
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn events(&self) -> MutexGuard<'_, Vec<AuditEvent>> {
        self.events.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl AuditSink for InMemoryAuditSink {
    fn append(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events().push(event.clone());
        Ok(())
    }

    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
        let matched: Vec<AuditEvent> = self
            .events()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        let skip = filter
            .limit
            .map_or(0, |limit| matched.len().saturating_sub(limit));
        Ok(matched.into_iter().skip(skip).collect())
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS audit_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    ts_ms INTEGER NOT NULL,
    actor TEXT NOT NULL,
    action_id TEXT NOT NULL,
    outcome TEXT NOT NULL,
    payload TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_events(action_id);
CREATE TRIGGER IF NOT EXISTS audit_events_no_update
BEFORE UPDATE ON audit_events
BEGIN
    SELECT RAISE(ABORT, 'audit log is append-only');
END;
CREATE TRIGGER IF NOT EXISTS audit_events_no_delete
BEFORE DELETE ON audit_events
BEGIN
    SELECT RAISE(ABORT, 'audit log is append-only');
END;
";

/// SQLite 持久化审计存储
pub struct SqliteAuditSink {
    conn: Mutex<Connection>,
}

impl SqliteAuditSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, AuditError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AuditError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl AuditSink for SqliteAuditSink {
    fn append(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let payload = serde_json::to_string(event)?;
        self.conn().execute(
            "INSERT INTO audit_events (id, ts_ms, actor, action_id, outcome, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id,
                event.timestamp.timestamp_millis(),
                event.actor,
                event.action_id,
                event.outcome.as_str(),
                payload,
            ],
        )?;
        Ok(())
    }

    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
        let mut sql = String::from("SELECT payload FROM audit_events WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(actor) = &filter.actor {
            sql.push_str(" AND actor = ?");
            params.push(Box::new(actor.clone()));
        }
        if let Some(action_id) = &filter.action_id {
            sql.push_str(" AND action_id = ?");
            params.push(Box::new(action_id.clone()));
        }
        if let Some(outcome) = filter.outcome {
            sql.push_str(" AND outcome = ?");
            params.push(Box::new(outcome.as_str()));
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND ts_ms >= ?");
            params.push(Box::new(since.timestamp_millis()));
        }
        sql.push_str(" ORDER BY seq DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            params.push(Box::new(limit as i64));
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let payloads = stmt
            .query_map(param_refs.as_slice(), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut events = payloads
            .iter()
            .map(|p| serde_json::from_str::<AuditEvent>(p))
            .collect::<Result<Vec<_>, _>>()?;
        events.reverse();
        Ok(events)
    }
}
