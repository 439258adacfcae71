//! 执行上下文：单次 run 的不可变标识与取消信号
//!
//! 由 Orchestrator 在接收请求时创建，以 `Arc<ExecutionContext>` 只读共享给
//! 生命周期控制器、回调管理器与事件路由；需要变化时复制出新的上下文（如重试）。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::ids::{IdManager, RequestId, RunId, ThreadId, UserId};

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    user_id: UserId,
    thread_id: ThreadId,
    run_id: RunId,
    request_id: RequestId,
    created_at: DateTime<Utc>,
    cancel_token: CancellationToken,
}

impl ExecutionContext {
    /// 为用户新建上下文：生成 thread / run / request 三个 ID
    pub fn new(ids: &IdManager, user_id: UserId) -> Self {
        let thread_id = ids.generate_thread_id();
        Self::builder(user_id, thread_id).build(ids)
    }

    pub fn builder(user_id: UserId, thread_id: ThreadId) -> ExecutionContextBuilder {
        ExecutionContextBuilder {
            user_id,
            thread_id,
            run_id: None,
            request_id: None,
            cancel_token: None,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 触发本次 run 的取消
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// 挂起点使用：等待取消信号
    pub async fn cancelled(&self) {
        self.cancel_token.cancelled().await
    }

    /// 派生重试上下文：同一 thread，新的 run / request，取消令牌为原令牌的子令牌
    pub fn derive_retry(&self, ids: &IdManager) -> Self {
        Self {
            user_id: self.user_id.clone(),
            thread_id: self.thread_id.clone(),
            run_id: ids.generate_run_id(&self.thread_id),
            request_id: ids.generate_request_id(),
            created_at: Utc::now(),
            cancel_token: self.cancel_token.child_token(),
        }
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

pub struct ExecutionContextBuilder {
    user_id: UserId,
    thread_id: ThreadId,
    run_id: Option<RunId>,
    request_id: Option<RequestId>,
    cancel_token: Option<CancellationToken>,
}

impl ExecutionContextBuilder {
    /// 使用调用方给定的 run_id（若与 thread 不对应，只记 warn）
    pub fn run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn build(self, ids: &IdManager) -> ExecutionContext {
        let run_id = match self.run_id {
            Some(run_id) => {
                IdManager::correlate(&self.thread_id, &run_id);
                run_id
            }
            None => ids.generate_run_id(&self.thread_id),
        };
        ExecutionContext {
            user_id: self.user_id,
            thread_id: self.thread_id,
            run_id,
            request_id: self
                .request_id
                .unwrap_or_else(|| ids.generate_request_id()),
            created_at: Utc::now(),
            cancel_token: self.cancel_token.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_context_correlates() {
        let ids = IdManager::new();
        let ctx = ExecutionContext::new(&ids, UserId::new("user1"));
        assert_eq!(ctx.user_id().as_str(), "user1");
        assert_eq!(
            IdManager::extract_thread_id(ctx.run_id().as_str()).as_ref(),
            Some(ctx.thread_id())
        );
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_builder_keeps_given_ids() {
        let ids = IdManager::new();
        let thread = ThreadId::new("legacy");
        let ctx = ExecutionContext::builder(UserId::new("u"), thread.clone())
            .run_id(RunId::new("legacy-run"))
            .request_id(RequestId::new("req-1"))
            .build(&ids);
        assert_eq!(ctx.run_id().as_str(), "legacy-run");
        assert_eq!(ctx.request_id().as_str(), "req-1");
        assert_eq!(ctx.thread_id(), &thread);
    }

    #[test]
    fn test_derive_retry_is_copy_on_change() {
        let ids = IdManager::new();
        let ctx = ExecutionContext::new(&ids, UserId::new("u"));
        let retry = ctx.derive_retry(&ids);

        assert_eq!(retry.thread_id(), ctx.thread_id());
        assert_ne!(retry.run_id(), ctx.run_id());
        assert_ne!(retry.request_id(), ctx.request_id());

        ctx.cancel();
        assert!(retry.is_cancelled());

        let ctx2 = ExecutionContext::new(&ids, UserId::new("u"));
        let retry2 = ctx2.derive_retry(&ids);
        retry2.cancel();
        assert!(!ctx2.is_cancelled());
    }
}
