//! 请求监管：每个请求一个子 CancellationToken，可单独取消或整体取消

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct RequestSupervisor {
    root: CancellationToken,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl RequestSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记请求并返回其 token；同 ID 重复登记时复用已有 token
    pub fn begin(&self, request_id: &str) -> CancellationToken {
        let Ok(mut active) = self.active.lock() else {
            return self.root.child_token();
        };
        active
            .entry(request_id.to_string())
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    /// 取消单个请求；请求不存在时返回 false
    pub fn cancel(&self, request_id: &str) -> bool {
        let token = self
            .active
            .lock()
            .ok()
            .and_then(|a| a.get(request_id).cloned());
        match token {
            Some(token) => {
                tracing::info!(request_id = %request_id, "request cancelled");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 取消全部进行中的请求；之后新登记的请求不受影响
    pub fn cancel_all(&self) {
        let tokens: Vec<CancellationToken> = self
            .active
            .lock()
            .map(|a| a.values().cloned().collect())
            .unwrap_or_default();
        tracing::info!(count = tokens.len(), "cancelling all requests");
        for token in tokens {
            token.cancel();
        }
    }

    /// 关闭：取消根 token，进行中与之后的请求全部取消
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn finish(&self, request_id: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(request_id);
        }
    }

    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .active
            .lock()
            .map(|a| a.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}
