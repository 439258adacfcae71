//! Agent 池与编排器
//!
//! 负责：按用户绑定 Agent 实例（同一用户至多一个活跃实例）、限制全局并发上限、
//! 复用空闲实例（FIFO）、驱动完整生命周期并汇总执行指标。
//! 池状态只在同步临界区内修改，锁从不跨越 await。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::callbacks::{CallbackFailureManager, CallbackPolicy};
use super::context::ExecutionContext;
use super::error::AgentError;
use super::ids::{AgentId, IdManager, RequestId, RunId, ThreadId, UserId};
use super::lifecycle::{
    AgentBehavior, AgentRequest, AgentState, LifecycleController, StateListener,
};
use super::persistence::ContextPersistence;
use super::router::EventRouter;

/// 池配置
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_concurrent_agents: usize,
    /// 每个新建实例的回调熔断策略
    pub callback_policy: CallbackPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 10,
            callback_policy: CallbackPolicy::default(),
        }
    }
}

/// 为新实例构造具体 Agent 行为
pub trait AgentFactory: Send + Sync {
    fn create(&self, agent_id: &AgentId) -> Arc<dyn AgentBehavior>;
}

impl<F> AgentFactory for F
where
    F: Fn(&AgentId) -> Arc<dyn AgentBehavior> + Send + Sync,
{
    fn create(&self, agent_id: &AgentId) -> Arc<dyn AgentBehavior> {
        self(agent_id)
    }
}

/// 池中的 Agent 实例；身份（agent_id）在复用时保持不变
pub struct AgentInstance {
    id: AgentId,
    controller: LifecycleController,
    created_at: DateTime<Utc>,
}

impl AgentInstance {
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn controller(&self) -> &LifecycleController {
        &self.controller
    }

    pub fn bound_user(&self) -> Option<UserId> {
        self.controller.bound_user()
    }

    pub fn state(&self) -> AgentState {
        self.controller.state()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl std::fmt::Debug for AgentInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentInstance")
            .field("id", &self.id)
            .field("bound_user", &self.bound_user())
            .field("state", &self.state())
            .finish()
    }
}

/// 成功执行的返回值
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub status: AgentState,
    pub run_id: RunId,
    pub thread_id: ThreadId,
    pub request_id: RequestId,
    pub user_id: UserId,
    pub agent_id: AgentId,
    pub output: serde_json::Value,
    pub duration_ms: f64,
}

/// 编排指标快照
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestrationMetrics {
    pub total_executions: u64,
    pub failed_executions: u64,
    /// 百分比；total 为 0 时为 0
    pub success_rate: f64,
    pub active_agents: usize,
    pub pooled_agents: usize,
    pub concurrent_peak: usize,
    pub average_execution_time_ms: f64,
    pub agents_created: u64,
    pub agents_destroyed: u64,
}

/// 成功率（百分比）
pub fn success_rate(total_executions: u64, failed_executions: u64) -> f64 {
    if total_executions == 0 {
        return 0.0;
    }
    let succeeded = total_executions.saturating_sub(failed_executions);
    succeeded as f64 / total_executions as f64 * 100.0
}

#[derive(Default)]
struct PoolState {
    active: HashMap<UserId, Arc<AgentInstance>>,
    idle: VecDeque<Arc<AgentInstance>>,
    /// 每个用户正在进行的 run 的取消令牌
    runs: HashMap<UserId, CancellationToken>,
    agents_created: u64,
    agents_destroyed: u64,
    concurrent_peak: usize,
}

#[derive(Default)]
struct ExecutionStats {
    total_executions: u64,
    failed_executions: u64,
    total_execution_time_ms: f64,
}

/// Agent 编排器
pub struct AgentOrchestrator {
    config: PoolConfig,
    ids: Arc<IdManager>,
    router: Arc<EventRouter>,
    factory: Arc<dyn AgentFactory>,
    persistence: Option<Arc<dyn ContextPersistence>>,
    listener: Option<Arc<dyn StateListener>>,
    pool: Mutex<PoolState>,
    stats: Mutex<ExecutionStats>,
    root_token: CancellationToken,
}

impl AgentOrchestrator {
    pub fn new(
        config: PoolConfig,
        ids: Arc<IdManager>,
        router: Arc<EventRouter>,
        factory: Arc<dyn AgentFactory>,
    ) -> Self {
        Self {
            config,
            ids,
            router,
            factory,
            persistence: None,
            listener: None,
            pool: Mutex::new(PoolState::default()),
            stats: Mutex::new(ExecutionStats::default()),
            root_token: CancellationToken::new(),
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn ContextPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_state_listener(mut self, listener: Arc<dyn StateListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn ids(&self) -> &Arc<IdManager> {
        &self.ids
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn active_agents(&self) -> usize {
        self.pool.lock().active.len()
    }

    pub fn pooled_agents(&self) -> usize {
        self.pool.lock().idle.len()
    }

    /// 当前绑定到该用户的实例
    pub fn agent_for(&self, user_id: &UserId) -> Option<Arc<AgentInstance>> {
        self.pool.lock().active.get(user_id).cloned()
    }

    pub fn is_shut_down(&self) -> bool {
        self.root_token.is_cancelled()
    }

    /// 获取或创建用户的 Agent
    ///
    /// 顺序：已绑定实例 → 空闲池（FIFO，重新绑定）→ 新建（未达上限）→ ResourceExhausted。
    pub fn get_or_create_agent(&self, user_id: &UserId) -> Result<Arc<AgentInstance>, AgentError> {
        let mut pool = self.pool.lock();
        self.acquire(&mut pool, user_id)
    }

    /// 解绑用户的 Agent 并放回空闲池；关闭后直接销毁
    ///
    /// 该用户有进行中的 run 时拒绝释放并返回 false，实例由 run 结束时释放。
    pub fn release_agent(&self, user_id: &UserId) -> bool {
        let mut pool = self.pool.lock();
        if pool.runs.contains_key(user_id) {
            tracing::warn!(user_id = %user_id, "Refusing to release agent with a run in flight");
            return false;
        }
        self.release_locked(&mut pool, user_id)
    }

    /// 为用户执行一次完整的 Agent 任务
    ///
    /// thread 依次取自请求、`run_id` 中携带的 thread、新建对话；`run_id` 为 None 时由 thread 派生。
    /// 同一用户已有运行中的任务时返回 SlotUnavailable，且不影响正在运行的任务。
    pub async fn execute_agent_task(
        &self,
        user_id: UserId,
        request: AgentRequest,
        run_id: Option<RunId>,
        stream_updates: bool,
    ) -> Result<TaskResult, AgentError> {
        let thread_id = self.resolve_thread(&request, run_id.as_ref());
        let mut builder = ExecutionContext::builder(user_id.clone(), thread_id)
            .cancel_token(self.root_token.child_token());
        if let Some(run_id) = run_id {
            builder = builder.run_id(run_id);
        }
        let ctx = builder.build(&self.ids).into_shared();

        // 占用 run 与绑定实例在同一临界区内完成
        let (agent, newly_bound) = {
            let mut pool = self.pool.lock();
            if pool.runs.contains_key(&user_id) {
                tracing::warn!(user_id = %user_id, "Rejected concurrent run for busy user");
                return Err(AgentError::SlotUnavailable {
                    user_id: user_id.to_string(),
                });
            }
            let newly_bound = !pool.active.contains_key(&user_id);
            let agent = self.acquire(&mut pool, &user_id)?;
            pool.runs.insert(user_id.clone(), ctx.cancel_token().clone());
            (agent, newly_bound)
        };

        let started = Instant::now();
        let result = agent
            .controller
            .run(Arc::clone(&ctx), &request, stream_updates)
            .await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let result = match result {
            Err(e @ AgentError::SlotUnavailable { .. }) => {
                // 槽位被绕过编排器直接驱动的 run 占用；本次请求建立的绑定在这里撤销
                let mut pool = self.pool.lock();
                pool.runs.remove(&user_id);
                if newly_bound {
                    self.release_locked(&mut pool, &user_id);
                }
                drop(pool);
                tracing::warn!(user_id = %user_id, "Agent slot held outside orchestrator");
                return Err(e);
            }
            other => other,
        };

        self.record_execution(duration_ms, result.is_err());
        {
            let mut pool = self.pool.lock();
            pool.runs.remove(&user_id);
            self.release_locked(&mut pool, &user_id);
        }

        let output = result?;
        Ok(TaskResult {
            status: AgentState::Completed,
            run_id: ctx.run_id().clone(),
            thread_id: ctx.thread_id().clone(),
            request_id: ctx.request_id().clone(),
            user_id,
            agent_id: agent.id.clone(),
            output,
            duration_ms,
        })
    }

    /// 取消该用户正在进行的 run
    pub fn cancel_run(&self, user_id: &UserId) -> bool {
        match self.pool.lock().runs.get(user_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(user_id = %user_id, "Run cancellation requested");
                true
            }
            None => false,
        }
    }

    /// 取消全部 run 并销毁空闲实例；进行中的实例在释放时销毁
    pub fn shutdown(&self) -> usize {
        self.root_token.cancel();
        let mut pool = self.pool.lock();
        let destroyed = pool.idle.len();
        pool.idle.clear();
        pool.agents_destroyed += destroyed as u64;
        tracing::info!(
            destroyed,
            still_active = pool.active.len(),
            "Orchestrator shut down"
        );
        destroyed
    }

    pub fn get_orchestration_metrics(&self) -> OrchestrationMetrics {
        let (total, failed, total_time) = {
            let stats = self.stats.lock();
            (
                stats.total_executions,
                stats.failed_executions,
                stats.total_execution_time_ms,
            )
        };
        let pool = self.pool.lock();
        OrchestrationMetrics {
            total_executions: total,
            failed_executions: failed,
            success_rate: success_rate(total, failed),
            active_agents: pool.active.len(),
            pooled_agents: pool.idle.len(),
            concurrent_peak: pool.concurrent_peak,
            average_execution_time_ms: if total == 0 {
                0.0
            } else {
                total_time / total as f64
            },
            agents_created: pool.agents_created,
            agents_destroyed: pool.agents_destroyed,
        }
    }

    fn resolve_thread(&self, request: &AgentRequest, run_id: Option<&RunId>) -> ThreadId {
        if let Some(thread_id) = &request.thread_id {
            return thread_id.clone();
        }
        match run_id {
            Some(run_id) => IdManager::extract_thread_id(run_id.as_str()).unwrap_or_else(|| {
                tracing::warn!(run_id = %run_id, "Run id carries no thread, starting a new one");
                self.ids.generate_thread_id()
            }),
            None => self.ids.generate_thread_id(),
        }
    }

    fn acquire(
        &self,
        pool: &mut PoolState,
        user_id: &UserId,
    ) -> Result<Arc<AgentInstance>, AgentError> {
        if self.is_shut_down() {
            return Err(AgentError::InvalidState("orchestrator is shut down".to_string()));
        }
        if let Some(agent) = pool.active.get(user_id) {
            return Ok(Arc::clone(agent));
        }

        let agent = if let Some(agent) = pool.idle.pop_front() {
            tracing::debug!(agent_id = %agent.id, user_id = %user_id, "Reusing pooled agent");
            agent
        } else if pool.active.len() < self.config.max_concurrent_agents {
            pool.agents_created += 1;
            let agent = Arc::new(self.build_instance());
            tracing::info!(agent_id = %agent.id, user_id = %user_id, "Created agent");
            agent
        } else {
            tracing::warn!(
                user_id = %user_id,
                max = self.config.max_concurrent_agents,
                "Agent pool exhausted"
            );
            return Err(AgentError::ResourceExhausted(format!(
                "limit {}",
                self.config.max_concurrent_agents
            )));
        };

        agent.controller.bind(user_id.clone());
        pool.active.insert(user_id.clone(), Arc::clone(&agent));
        pool.concurrent_peak = pool.concurrent_peak.max(pool.active.len());
        Ok(agent)
    }

    fn release_locked(&self, pool: &mut PoolState, user_id: &UserId) -> bool {
        let Some(agent) = pool.active.remove(user_id) else {
            return false;
        };
        agent.controller.unbind();
        if self.is_shut_down() {
            pool.agents_destroyed += 1;
            tracing::debug!(agent_id = %agent.id, "Destroyed agent on release");
        } else {
            tracing::debug!(agent_id = %agent.id, user_id = %user_id, "Released agent to pool");
            pool.idle.push_back(agent);
        }
        true
    }

    fn record_execution(&self, duration_ms: f64, failed: bool) {
        let mut stats = self.stats.lock();
        stats.total_executions += 1;
        if failed {
            stats.failed_executions += 1;
        }
        stats.total_execution_time_ms += duration_ms;
    }

    fn build_instance(&self) -> AgentInstance {
        let id = self.ids.generate_agent_id();
        let callbacks = Arc::new(CallbackFailureManager::new(
            id.as_str(),
            self.config.callback_policy.clone(),
        ));
        let mut controller = LifecycleController::new(
            id.clone(),
            self.factory.create(&id),
            Arc::clone(&self.router),
            callbacks,
        );
        if let Some(persistence) = &self.persistence {
            controller = controller.with_persistence(Arc::clone(persistence));
        }
        if let Some(listener) = &self.listener {
            controller = controller.with_listener(Arc::clone(listener));
        }
        AgentInstance {
            id,
            controller,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::router::{RouterConfig, RunEmitter};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl AgentBehavior for Noop {
        async fn execute(&self, _: &AgentRequest, _: &RunEmitter) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    fn orchestrator(max: usize) -> AgentOrchestrator {
        let ids = Arc::new(IdManager::new());
        let router = Arc::new(EventRouter::new(Arc::clone(&ids), RouterConfig::default()));
        let factory = |_: &AgentId| -> Arc<dyn AgentBehavior> { Arc::new(Noop) };
        AgentOrchestrator::new(
            PoolConfig {
                max_concurrent_agents: max,
                ..PoolConfig::default()
            },
            ids,
            router,
            Arc::new(factory),
        )
    }

    #[test]
    fn test_success_rate_math() {
        assert_eq!(success_rate(10, 2), 80.0);
        assert_eq!(success_rate(0, 0), 0.0);
        assert_eq!(success_rate(1, 1), 0.0);
        assert_eq!(success_rate(4, 0), 100.0);
    }

    #[test]
    fn test_same_user_reuses_active_agent() {
        let orch = orchestrator(2);
        let a = orch.get_or_create_agent(&UserId::new("u")).unwrap();
        let b = orch.get_or_create_agent(&UserId::new("u")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(orch.active_agents(), 1);
        assert_eq!(a.bound_user(), Some(UserId::new("u")));
    }

    #[test]
    fn test_pool_bound_and_reuse() {
        let orch = orchestrator(3);
        for i in 0..3 {
            orch.get_or_create_agent(&UserId::new(format!("user_{}", i)))
                .unwrap();
        }
        let err = orch.get_or_create_agent(&UserId::new("user_3")).unwrap_err();
        assert!(err.to_string().contains("Maximum concurrent agents reached"));

        let first = orch.agent_for(&UserId::new("user_0")).unwrap();
        assert!(orch.release_agent(&UserId::new("user_0")));
        assert_eq!(orch.pooled_agents(), 1);
        assert_eq!(first.bound_user(), None);

        let reused = orch.get_or_create_agent(&UserId::new("user_3")).unwrap();
        assert!(Arc::ptr_eq(&first, &reused));
        assert_eq!(reused.bound_user(), Some(UserId::new("user_3")));
        assert_eq!(orch.pooled_agents(), 0);
        assert_eq!(orch.active_agents(), 3);
        assert_eq!(orch.get_orchestration_metrics().agents_created, 3);
    }

    #[test]
    fn test_release_unknown_user_is_noop() {
        let orch = orchestrator(1);
        assert!(!orch.release_agent(&UserId::new("ghost")));
    }

    #[test]
    fn test_shutdown_destroys_idle_agents() {
        let orch = orchestrator(2);
        orch.get_or_create_agent(&UserId::new("a")).unwrap();
        orch.get_or_create_agent(&UserId::new("b")).unwrap();
        orch.release_agent(&UserId::new("a"));

        assert_eq!(orch.shutdown(), 1);
        orch.release_agent(&UserId::new("b"));
        let metrics = orch.get_orchestration_metrics();
        assert_eq!(metrics.agents_destroyed, 2);
        assert_eq!(metrics.pooled_agents, 0);
        assert!(matches!(
            orch.get_or_create_agent(&UserId::new("c")),
            Err(AgentError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_metrics_after_task() {
        let orch = orchestrator(1);
        let result = orch
            .execute_agent_task(UserId::new("u"), AgentRequest::new("hi"), None, true)
            .await
            .unwrap();
        assert_eq!(result.status, AgentState::Completed);
        assert_eq!(
            IdManager::extract_thread_id(result.run_id.as_str()).as_ref(),
            Some(&result.thread_id)
        );
        let metrics = orch.get_orchestration_metrics();
        assert_eq!(metrics.total_executions, 1);
        assert_eq!(metrics.success_rate, 100.0);
        assert_eq!(metrics.active_agents, 0);
        assert_eq!(metrics.pooled_agents, 1);
    }

    #[tokio::test]
    async fn test_supplied_run_id_keeps_its_thread() {
        let orch = orchestrator(1);
        let result = orch
            .execute_agent_task(
                UserId::new("u"),
                AgentRequest::new("hi"),
                Some(RunId::new("run_1_3e5b06c2_thread_conv")),
                true,
            )
            .await
            .unwrap();
        assert_eq!(result.run_id.as_str(), "run_1_3e5b06c2_thread_conv");
        assert_eq!(result.thread_id, ThreadId::new("thread_conv"));

        let explicit = orch
            .execute_agent_task(
                UserId::new("u"),
                AgentRequest::new("hi").with_thread(ThreadId::new("thread_other")),
                Some(RunId::new("run_2_3e5b06c2_thread_conv")),
                true,
            )
            .await
            .unwrap();
        assert_eq!(explicit.thread_id, ThreadId::new("thread_other"));

        let malformed = orch
            .execute_agent_task(
                UserId::new("u"),
                AgentRequest::new("hi"),
                Some(RunId::new("not-a-run-id")),
                true,
            )
            .await
            .unwrap();
        assert_eq!(malformed.run_id.as_str(), "not-a-run-id");
        assert!(malformed.thread_id.as_str().starts_with("thread_"));
    }
}
