//! 确认通道
//!
//! 网关本身不实现 UI：确认是一项注入的能力，网关在外层施加超时与取消，超时即拒绝。
//! - DenyAllConfirmation：无人值守时的默认实现；
//! - AutoApproveConfirmation：CI / 测试用，admin 级需配置口令；
//! - ChannelConfirmation：通过 mpsc 把待确认请求交给前端，前端经 oneshot 回复。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::gateway::RiskTier;

/// 待确认请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub action_id: String,
    pub summary: String,
    pub tier: RiskTier,
    pub requested_at: DateTime<Utc>,
}

/// 确认结果；admin 级动作需在 token 中携带确认口令
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationDecision {
    pub action_id: String,
    pub approved: bool,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub token: Option<String>,
}

impl ConfirmationDecision {
    pub fn approve(action_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            approved: true,
            reason: reason.into(),
            timestamp: Utc::now(),
            token: None,
        }
    }

    pub fn deny(action_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            approved: false,
            reason: reason.into(),
            timestamp: Utc::now(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// 确认通道 trait
#[async_trait]
pub trait ConfirmationChannel: Send + Sync {
    async fn request(&self, request: ConfirmationRequest) -> ConfirmationDecision;
}

/// 全部拒绝
#[derive(Debug, Default, Clone)]
pub struct DenyAllConfirmation;

#[async_trait]
impl ConfirmationChannel for DenyAllConfirmation {
    async fn request(&self, request: ConfirmationRequest) -> ConfirmationDecision {
        ConfirmationDecision::deny(request.action_id, "no interactive confirmation available")
    }
}

/// 全部批准；admin 级携带配置的口令
#[derive(Debug, Default, Clone)]
pub struct AutoApproveConfirmation {
    admin_token: Option<String>,
}

impl AutoApproveConfirmation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }
}

#[async_trait]
impl ConfirmationChannel for AutoApproveConfirmation {
    async fn request(&self, request: ConfirmationRequest) -> ConfirmationDecision {
        let decision = ConfirmationDecision::approve(request.action_id, "auto-approved");
        match (&self.admin_token, request.tier) {
            (Some(token), RiskTier::Admin) => decision.with_token(token.clone()),
            _ => decision,
        }
    }
}

/// 交给前端处理的待确认项
#[derive(Debug)]
pub struct PendingConfirmation {
    pub request: ConfirmationRequest,
    pub respond: oneshot::Sender<ConfirmationDecision>,
}

/// 基于通道的确认：前端持有 Receiver 逐条处理
#[derive(Debug, Clone)]
pub struct ChannelConfirmation {
    tx: mpsc::Sender<PendingConfirmation>,
}

impl ChannelConfirmation {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingConfirmation>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ConfirmationChannel for ChannelConfirmation {
    async fn request(&self, request: ConfirmationRequest) -> ConfirmationDecision {
        let action_id = request.action_id.clone();
        let (respond, rx) = oneshot::channel();
        if self
            .tx
            .send(PendingConfirmation { request, respond })
            .await
            .is_err()
        {
            return ConfirmationDecision::deny(action_id, "confirmation front end unavailable");
        }
        rx.await.unwrap_or_else(|_| {
            ConfirmationDecision::deny(action_id, "confirmation dropped without a decision")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(tier: RiskTier) -> ConfirmationRequest {
        ConfirmationRequest {
            action_id: "a1".into(),
            summary: "run_terminal_command rm -rf build/".into(),
            tier,
            requested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_channel_round_trip() {
        let (channel, mut rx) = ChannelConfirmation::new(4);
        let front_end = tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            assert_eq!(pending.request.tier, RiskTier::Restricted);
            let decision = ConfirmationDecision::approve(pending.request.action_id.clone(), "ok");
            pending.respond.send(decision).unwrap();
        });
        let decision = channel.request(request(RiskTier::Restricted)).await;
        assert!(decision.approved);
        assert_eq!(decision.action_id, "a1");
        front_end.await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_dropped_front_end_denies() {
        let (channel, rx) = ChannelConfirmation::new(1);
        drop(rx);
        assert!(!channel.request(request(RiskTier::Restricted)).await.approved);
    }

    #[tokio::test]
    async fn test_auto_approve_token_only_for_admin() {
        let channel = AutoApproveConfirmation::new().with_admin_token("CONFIRM");
        assert_eq!(channel.request(request(RiskTier::Restricted)).await.token, None);
        assert_eq!(
            channel.request(request(RiskTier::Admin)).await.token.as_deref(),
            Some("CONFIRM")
        );
    }
}
