//! Agent 生命周期控制：pre_run → execute → post_run → cleanup
//!
//! 状态机：
//! ```text
//! IDLE --pre_run--> RUNNING --成功--> COMPLETED --cleanup--> IDLE
//!                   RUNNING --失败--> FAILED    --cleanup--> IDLE
//!                   RUNNING --取消--> CANCELLED --cleanup--> IDLE
//! IDLE --pre_run 拒绝--> IDLE（返回类型化错误，不调用 execute）
//! 占用槽位后进入失败（加载上下文 / 状态通知 / agent_started）--> FAILED --cleanup--> IDLE
//! ```
//! pre_run 成功后返回 `RunGuard`，持有运行槽位；guard 析构时执行 cleanup，
//! 因此正常结束、失败、取消乃至 panic 都只会清理一次。

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use super::callbacks::{callback_types, CallbackFailureManager};
use super::context::ExecutionContext;
use super::error::AgentError;
use super::ids::{AgentId, RunId, ThreadId, UserId};
use super::persistence::{ContextPersistence, RunRecord};
use super::router::{EventRouter, RunEmitter};

const TRANSITION_LOG_CAPACITY: usize = 64;

/// Agent 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl AgentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentState::Completed | AgentState::Failed | AgentState::Cancelled
        )
    }
}

/// 用户请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRequest {
    pub message: String,
    /// 续接已有对话时指定
    pub thread_id: Option<ThreadId>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AgentRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            thread_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_thread(mut self, thread_id: ThreadId) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// 具体 Agent 的执行能力
///
/// 实现方需在挂起点关注 `emitter.context()` 的取消信号，且五个标准事件只能经 emitter 发出。
/// 返回的 `anyhow::Error` 若本身是 `AgentError`（如 emitter 返回的 CRITICAL 失败）会被原样保留。
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    fn name(&self) -> &str {
        "agent"
    }

    async fn execute(
        &self,
        request: &AgentRequest,
        emitter: &RunEmitter,
    ) -> anyhow::Result<serde_json::Value>;
}

/// 状态变更监听（callback 类型 `state_change`，默认 CRITICAL）
#[async_trait]
pub trait StateListener: Send + Sync {
    async fn on_state_change(
        &self,
        ctx: &ExecutionContext,
        from: AgentState,
        to: AgentState,
    ) -> anyhow::Result<()>;
}

/// 生命周期统计
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LifecycleStats {
    pub runs: u64,
    pub failures: u64,
    pub cancellations: u64,
    pub cleanups: u64,
    pub average_duration_ms: f64,
}

#[derive(Default)]
struct ControllerInner {
    bound_user: Option<UserId>,
    /// 最近一次绑定的用户，解绑后保留
    last_user: Option<UserId>,
    transitions: VecDeque<AgentState>,
    stats: LifecycleStats,
    // 以下为单次 run 的临时状态，cleanup 时清空
    started_at: Option<Instant>,
    current_run: Option<RunId>,
    previous_record: Option<RunRecord>,
}

/// 单个 Agent 实例的生命周期控制器
pub struct LifecycleController {
    agent_id: AgentId,
    behavior: Arc<dyn AgentBehavior>,
    router: Arc<EventRouter>,
    callbacks: Arc<CallbackFailureManager>,
    persistence: Option<Arc<dyn ContextPersistence>>,
    listener: Option<Arc<dyn StateListener>>,
    slot: Arc<Semaphore>,
    state_tx: watch::Sender<AgentState>,
    inner: Mutex<ControllerInner>,
}

impl LifecycleController {
    pub fn new(
        agent_id: AgentId,
        behavior: Arc<dyn AgentBehavior>,
        router: Arc<EventRouter>,
        callbacks: Arc<CallbackFailureManager>,
    ) -> Self {
        let (state_tx, _) = watch::channel(AgentState::Idle);
        Self {
            agent_id,
            behavior,
            router,
            callbacks,
            persistence: None,
            listener: None,
            slot: Arc::new(Semaphore::new(1)),
            state_tx,
            inner: Mutex::new(ControllerInner::default()),
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn ContextPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn StateListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn behavior_name(&self) -> &str {
        self.behavior.name()
    }

    pub fn callbacks(&self) -> &Arc<CallbackFailureManager> {
        &self.callbacks
    }

    pub fn state(&self) -> AgentState {
        *self.state_tx.borrow()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state_tx.subscribe()
    }

    /// 最近的状态迁移记录（不含初始 IDLE）
    pub fn transitions(&self) -> Vec<AgentState> {
        self.inner.lock().transitions.iter().copied().collect()
    }

    pub fn stats(&self) -> LifecycleStats {
        self.inner.lock().stats
    }

    pub fn current_run(&self) -> Option<RunId> {
        self.inner.lock().current_run.clone()
    }

    /// pre_run 中从持久化读到的上一条记录（仅 run 期间可见）
    pub fn previous_record(&self) -> Option<RunRecord> {
        self.inner.lock().previous_record.clone()
    }

    pub fn bound_user(&self) -> Option<UserId> {
        self.inner.lock().bound_user.clone()
    }

    /// 绑定用户；换绑到不同用户时复位回调熔断状态，上一位用户的失败不会带入
    pub(crate) fn bind(&self, user_id: UserId) {
        let rebound = {
            let mut inner = self.inner.lock();
            let rebound = inner.last_user.as_ref().is_some_and(|last| last != &user_id);
            inner.last_user = Some(user_id.clone());
            inner.bound_user = Some(user_id);
            rebound
        };
        if rebound {
            self.callbacks.reset();
            tracing::debug!(agent_id = %self.agent_id, "Agent rebound, callback breakers reset");
        }
    }

    pub(crate) fn unbind(&self) {
        self.inner.lock().bound_user = None;
    }

    /// 完整生命周期：cleanup 在任何退出路径上都恰好执行一次
    pub async fn run(
        &self,
        ctx: Arc<ExecutionContext>,
        request: &AgentRequest,
        stream_updates: bool,
    ) -> Result<serde_json::Value, AgentError> {
        let emitter = RunEmitter::new(Arc::clone(&self.router), Arc::clone(&ctx), stream_updates);
        let guard = self.pre_run(&ctx, &emitter).await?;
        let outcome = self.execute(&ctx, request, &emitter).await;
        let result = self.post_run(&ctx, &emitter, outcome).await;
        self.cleanup(guard);
        result
    }

    /// 检查进入条件、占用运行槽位、发出 agent_started 并迁移到 RUNNING
    ///
    /// 进入条件不满足时不发生任何状态变化；占用槽位之后的失败经 FAILED 回到 IDLE。
    pub async fn pre_run(
        &self,
        ctx: &Arc<ExecutionContext>,
        emitter: &RunEmitter,
    ) -> Result<RunGuard<'_>, AgentError> {
        if ctx.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        if let Some(bound) = self.bound_user() {
            if &bound != ctx.user_id() {
                return Err(AgentError::UserMismatch {
                    bound: Some(bound.into_inner()),
                    requested: ctx.user_id().to_string(),
                });
            }
        }
        let permit = Arc::clone(&self.slot)
            .try_acquire_owned()
            .map_err(|_| AgentError::SlotUnavailable {
                user_id: ctx.user_id().to_string(),
            })?;
        let state = self.state();
        if state != AgentState::Idle {
            return Err(AgentError::InvalidState(format!(
                "pre_run requires IDLE, agent is {:?}",
                state
            )));
        }

        let guard = RunGuard {
            controller: self,
            ctx: Arc::clone(ctx),
            permit: Some(permit),
        };

        {
            let mut inner = self.inner.lock();
            inner.started_at = Some(Instant::now());
            inner.current_run = Some(ctx.run_id().clone());
        }

        if let Err(e) = self.enter(ctx, emitter).await {
            self.abort_entry(ctx, emitter, &e).await;
            drop(guard);
            return Err(e);
        }

        tracing::info!(
            agent_id = %self.agent_id,
            user_id = %ctx.user_id(),
            run_id = %ctx.run_id(),
            "Agent run started"
        );
        Ok(guard)
    }

    async fn enter(&self, ctx: &ExecutionContext, emitter: &RunEmitter) -> Result<(), AgentError> {
        if let Some(persistence) = &self.persistence {
            let loaded = self
                .callbacks
                .execute_callback_safely(callback_types::PERSIST_CONTEXT, || persistence.load(ctx))
                .await?;
            self.inner.lock().previous_record = loaded.flatten();
        }

        self.transition(ctx, AgentState::Running).await?;
        emitter.agent_started(self.agent_id.as_str()).await
    }

    /// 槽位已占用后进入失败：经 FAILED 收尾，发出 error 并保存记录，随后由守卫回到 IDLE
    async fn abort_entry(&self, ctx: &ExecutionContext, emitter: &RunEmitter, err: &AgentError) {
        self.record_duration();
        self.inner.lock().stats.failures += 1;

        let listener_broken = match err {
            AgentError::StateNotificationFailure { .. } => true,
            AgentError::CircuitBreakerOpen { callback_type } => {
                callback_type == callback_types::STATE_CHANGE
            }
            _ => false,
        };
        if listener_broken {
            self.set_state(AgentState::Failed);
        } else if let Err(notify_err) = self.transition(ctx, AgentState::Failed).await {
            tracing::warn!(run_id = %ctx.run_id(), "State notification failed on failure path: {}", notify_err);
        }

        if let Err(emit_err) = emitter.error(err).await {
            tracing::warn!(run_id = %ctx.run_id(), "Error event not delivered: {}", emit_err);
        }
        self.persist(ctx, RunRecord::from_context(ctx, AgentState::Failed).with_error(err.to_string()))
            .await;
        tracing::warn!(
            agent_id = %self.agent_id,
            run_id = %ctx.run_id(),
            "Agent run aborted before start: {}",
            err
        );
    }

    /// 执行具体 Agent；取消信号优先，panic 转为执行失败
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        request: &AgentRequest,
        emitter: &RunEmitter,
    ) -> Result<serde_json::Value, AgentError> {
        let work = AssertUnwindSafe(self.behavior.execute(request, emitter)).catch_unwind();
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(AgentError::Cancelled),
            outcome = work => match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(into_agent_error(e)),
                Err(_) => Err(AgentError::ExecutionFailed(format!(
                    "agent '{}' panicked",
                    self.behavior.name()
                ))),
            },
        }
    }

    /// 记录耗时与统计，发出 agent_completed / error，迁移到终态并保存上下文
    pub async fn post_run(
        &self,
        ctx: &ExecutionContext,
        emitter: &RunEmitter,
        outcome: Result<serde_json::Value, AgentError>,
    ) -> Result<serde_json::Value, AgentError> {
        let duration_ms = self.record_duration();

        let result = match outcome {
            Ok(output) => self.complete(ctx, emitter, output, duration_ms).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(output) => {
                self.persist(ctx, RunRecord::from_context(ctx, AgentState::Completed).with_output(output.clone()))
                    .await;
                tracing::info!(
                    agent_id = %self.agent_id,
                    run_id = %ctx.run_id(),
                    duration_ms,
                    "Agent run completed"
                );
                Ok(output)
            }
            Err(e) => {
                let terminal = if matches!(e, AgentError::Cancelled) {
                    AgentState::Cancelled
                } else {
                    AgentState::Failed
                };
                {
                    let mut inner = self.inner.lock();
                    match terminal {
                        AgentState::Cancelled => inner.stats.cancellations += 1,
                        _ => inner.stats.failures += 1,
                    }
                }
                if self.state() == AgentState::Running {
                    if let Err(notify_err) = self.transition(ctx, terminal).await {
                        tracing::warn!(run_id = %ctx.run_id(), "State notification failed on failure path: {}", notify_err);
                    }
                }
                if let Err(emit_err) = emitter.error(&e).await {
                    tracing::warn!(run_id = %ctx.run_id(), "Error event not delivered: {}", emit_err);
                }
                self.persist(ctx, RunRecord::from_context(ctx, terminal).with_error(e.to_string()))
                    .await;
                tracing::warn!(
                    agent_id = %self.agent_id,
                    run_id = %ctx.run_id(),
                    state = ?terminal,
                    "Agent run ended: {}",
                    e
                );
                Err(e)
            }
        }
    }

    async fn complete(
        &self,
        ctx: &ExecutionContext,
        emitter: &RunEmitter,
        output: serde_json::Value,
        duration_ms: f64,
    ) -> Result<serde_json::Value, AgentError> {
        emitter.agent_completed(&output, duration_ms).await?;
        if let Err(e) = self.transition(ctx, AgentState::Completed).await {
            self.set_state(AgentState::Failed);
            return Err(e);
        }
        Ok(output)
    }

    /// 释放 run 占用的全部资源并回到 IDLE
    pub fn cleanup(&self, guard: RunGuard<'_>) {
        drop(guard);
    }

    fn release(&self, ctx: &ExecutionContext) {
        {
            let mut inner = self.inner.lock();
            inner.started_at = None;
            inner.current_run = None;
            inner.previous_record = None;
            inner.stats.cleanups += 1;
        }
        self.set_state(AgentState::Idle);
        tracing::debug!(agent_id = %self.agent_id, run_id = %ctx.run_id(), "Agent cleaned up");
    }

    fn record_duration(&self) -> f64 {
        let mut inner = self.inner.lock();
        let duration_ms = inner
            .started_at
            .map(|t| t.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        inner.stats.runs += 1;
        let n = inner.stats.runs as f64;
        inner.stats.average_duration_ms += (duration_ms - inner.stats.average_duration_ms) / n;
        duration_ms
    }

    fn set_state(&self, to: AgentState) -> AgentState {
        let from = self.state_tx.send_replace(to);
        if from != to {
            let mut inner = self.inner.lock();
            if inner.transitions.len() == TRANSITION_LOG_CAPACITY {
                inner.transitions.pop_front();
            }
            inner.transitions.push_back(to);
        }
        from
    }

    /// 迁移状态并通知监听方（经熔断器，state_change 失败会中止 run）
    async fn transition(&self, ctx: &ExecutionContext, to: AgentState) -> Result<(), AgentError> {
        let from = self.set_state(to);
        if let Some(listener) = &self.listener {
            self.callbacks
                .execute_callback_safely(callback_types::STATE_CHANGE, || {
                    listener.on_state_change(ctx, from, to)
                })
                .await?;
        }
        Ok(())
    }

    async fn persist(&self, ctx: &ExecutionContext, record: RunRecord) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let saved = self
            .callbacks
            .execute_callback_safely(callback_types::PERSIST_CONTEXT, || {
                persistence.save(ctx, &record)
            })
            .await;
        if let Err(e) = saved {
            tracing::error!(run_id = %ctx.run_id(), "Context persistence failed: {}", e);
        }
    }
}

/// 运行守卫：持有运行槽位，析构时执行 cleanup
pub struct RunGuard<'a> {
    controller: &'a LifecycleController,
    ctx: Arc<ExecutionContext>,
    permit: Option<OwnedSemaphorePermit>,
}

impl RunGuard<'_> {
    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.controller.release(&self.ctx);
            drop(permit);
        }
    }
}

fn into_agent_error(err: anyhow::Error) -> AgentError {
    match err.downcast::<AgentError>() {
        Ok(agent_err) => agent_err,
        Err(other) => AgentError::ExecutionFailed(format!("{:#}", other)),
    }
}
