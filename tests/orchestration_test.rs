//! 编排集成测试：池上限、复用、并发用户、生命周期、取消与指标

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hive::agent::EchoAgent;
use hive::core::{
    AgentBehavior, AgentError, AgentEvent, AgentId, AgentOrchestrator, AgentRequest, AgentState,
    ChannelSender, ContextPersistence, EventRouter, ExecutionContext, IdManager,
    InMemoryContextPersistence, PoolConfig, RouterConfig, RunEmitter, StateListener, ThreadId,
    UserId,
};
use tokio::sync::{mpsc, Notify};

/// 消息以 "fail" 开头时失败
struct ScriptedAgent;

#[async_trait]
impl AgentBehavior for ScriptedAgent {
    async fn execute(
        &self,
        request: &AgentRequest,
        emitter: &RunEmitter,
    ) -> anyhow::Result<serde_json::Value> {
        emitter.agent_thinking("working").await?;
        if request.message.starts_with("fail") {
            anyhow::bail!("scripted failure");
        }
        Ok(serde_json::json!({ "reply": request.message }))
    }
}

/// 进入 execute 后通知，等待放行或取消
struct GatedAgent {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl AgentBehavior for GatedAgent {
    async fn execute(&self, _: &AgentRequest, emitter: &RunEmitter) -> anyhow::Result<serde_json::Value> {
        self.entered.notify_one();
        tokio::select! {
            _ = emitter.context().cancelled() => Err(AgentError::Cancelled.into()),
            _ = self.release.notified() => Ok(serde_json::json!("released")),
        }
    }
}

fn build(max: usize, behavior: Arc<dyn AgentBehavior>) -> (Arc<AgentOrchestrator>, Arc<EventRouter>) {
    let ids = Arc::new(IdManager::new());
    let router = Arc::new(EventRouter::new(Arc::clone(&ids), RouterConfig::default()));
    let factory = move |_: &AgentId| -> Arc<dyn AgentBehavior> { Arc::clone(&behavior) };
    let orchestrator = AgentOrchestrator::new(
        PoolConfig {
            max_concurrent_agents: max,
            ..PoolConfig::default()
        },
        ids,
        Arc::clone(&router),
        Arc::new(factory),
    );
    (Arc::new(orchestrator), router)
}

async fn connect(router: &EventRouter, user: &str) -> mpsc::UnboundedReceiver<AgentEvent> {
    let (tx, rx) = ChannelSender::new();
    router
        .register_connection(UserId::new(user), Arc::new(tx))
        .await
        .unwrap();
    rx
}

fn drain(rx: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

#[test]
fn test_pool_bound() {
    let (orch, _) = build(3, Arc::new(ScriptedAgent));
    for i in 0..3 {
        orch.get_or_create_agent(&UserId::new(format!("user_{}", i)))
            .unwrap();
    }
    assert_eq!(orch.get_orchestration_metrics().active_agents, 3);

    let err = orch.get_or_create_agent(&UserId::new("user_3")).unwrap_err();
    assert!(matches!(err, AgentError::ResourceExhausted(_)));
    assert!(err.to_string().contains("Maximum concurrent agents reached"));
    // 已绑定用户不受影响
    assert!(orch.get_or_create_agent(&UserId::new("user_0")).is_ok());
}

#[test]
fn test_pool_reuse_rebinds_instance() {
    let (orch, _) = build(3, Arc::new(ScriptedAgent));
    let first = orch.get_or_create_agent(&UserId::new("user1")).unwrap();
    orch.release_agent(&UserId::new("user1"));
    assert_eq!(orch.pooled_agents(), 1);
    assert_eq!(orch.active_agents(), 0);

    let second = orch.get_or_create_agent(&UserId::new("user2")).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.id(), first.id());
    assert_eq!(second.bound_user(), Some(UserId::new("user2")));
    assert_eq!(orch.pooled_agents(), 0);
    assert_eq!(orch.active_agents(), 1);
}

#[tokio::test]
async fn test_failing_agent() {
    let (orch, router) = build(2, Arc::new(ScriptedAgent));
    let mut rx = connect(&router, "u").await;

    let err = orch
        .execute_agent_task(UserId::new("u"), AgentRequest::new("fail now"), None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::ExecutionFailed(ref m) if m.contains("scripted failure")));

    let metrics = orch.get_orchestration_metrics();
    assert_eq!(metrics.total_executions, 1);
    assert_eq!(metrics.failed_executions, 1);
    assert_eq!(metrics.success_rate, 0.0);
    assert_eq!(metrics.active_agents, 0);

    let kinds: Vec<String> = drain(&mut rx).into_iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, vec!["agent_started", "agent_thinking", "error"]);
}

#[tokio::test]
async fn test_concurrent_distinct_users() {
    let (orch, router) = build(10, Arc::new(EchoAgent::with_latency(Duration::from_millis(50))));
    let mut receivers = Vec::new();
    for i in 0..5 {
        receivers.push(connect(&router, &format!("user_{}", i)).await);
    }

    let tasks: Vec<_> = (0..5)
        .map(|i| {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move {
                orch.execute_agent_task(
                    UserId::new(format!("user_{}", i)),
                    AgentRequest::new(format!("message {}", i)),
                    None,
                    true,
                )
                .await
            })
        })
        .collect();

    for task in tasks {
        let result = task.await.unwrap().unwrap();
        assert_eq!(result.status, AgentState::Completed);
    }

    let metrics = orch.get_orchestration_metrics();
    assert_eq!(metrics.total_executions, 5);
    assert_eq!(metrics.failed_executions, 0);
    assert_eq!(metrics.concurrent_peak, 5);
    assert_eq!(metrics.success_rate, 100.0);

    // 每个用户只收到自己 run 的事件，且序号连续递增
    for (i, rx) in receivers.iter_mut().enumerate() {
        let events = drain(rx);
        assert_eq!(events.len(), 5);
        assert!(events.iter().all(|e| e.user_id.as_str() == format!("user_{}", i)));
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        assert_eq!(events[0].event_type, "agent_started");
        assert_eq!(events[4].event_type, "agent_completed");
    }
}

#[tokio::test]
async fn test_lifecycle_transition_observable() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (orch, _) = build(
        2,
        Arc::new(GatedAgent {
            entered: entered.clone(),
            release: release.clone(),
        }),
    );
    let user = UserId::new("u");
    let agent = orch.get_or_create_agent(&user).unwrap();
    assert_eq!(agent.state(), AgentState::Idle);
    let mut states = agent.controller().subscribe();

    let task = {
        let orch = Arc::clone(&orch);
        let user = user.clone();
        tokio::spawn(async move {
            orch.execute_agent_task(user, AgentRequest::new("x"), None, true)
                .await
        })
    };

    entered.notified().await;
    assert_eq!(*states.borrow_and_update(), AgentState::Running);
    release.notify_one();
    task.await.unwrap().unwrap();

    assert_eq!(agent.state(), AgentState::Idle);
    assert_eq!(
        agent.controller().transitions(),
        vec![AgentState::Running, AgentState::Completed, AgentState::Idle]
    );
}

#[tokio::test]
async fn test_same_user_concurrent_run_rejected() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (orch, _) = build(
        2,
        Arc::new(GatedAgent {
            entered: entered.clone(),
            release: release.clone(),
        }),
    );

    let first = {
        let orch = Arc::clone(&orch);
        tokio::spawn(async move {
            orch.execute_agent_task(UserId::new("u"), AgentRequest::new("one"), None, true)
                .await
        })
    };
    entered.notified().await;

    let err = orch
        .execute_agent_task(UserId::new("u"), AgentRequest::new("two"), None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::SlotUnavailable { .. }));
    // 被拒绝的请求不释放正在运行的实例
    assert_eq!(orch.active_agents(), 1);

    release.notify_one();
    assert_eq!(first.await.unwrap().unwrap().status, AgentState::Completed);
    assert_eq!(orch.get_orchestration_metrics().total_executions, 1);
}

#[tokio::test]
async fn test_cancel_run() {
    let entered = Arc::new(Notify::new());
    let (orch, router) = build(
        2,
        Arc::new(GatedAgent {
            entered: entered.clone(),
            release: Arc::new(Notify::new()),
        }),
    );
    let mut rx = connect(&router, "u").await;

    let task = {
        let orch = Arc::clone(&orch);
        tokio::spawn(async move {
            orch.execute_agent_task(UserId::new("u"), AgentRequest::new("x"), None, true)
                .await
        })
    };
    entered.notified().await;
    assert!(orch.cancel_run(&UserId::new("u")));

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, AgentError::Cancelled));
    assert!(!orch.cancel_run(&UserId::new("u")));

    let metrics = orch.get_orchestration_metrics();
    assert_eq!(metrics.failed_executions, 1);
    assert_eq!(metrics.pooled_agents, 1);

    let last = drain(&mut rx).pop().unwrap();
    assert_eq!(last.event_type, "error");
    assert_eq!(last.payload["code"], "cancelled");
}

#[tokio::test]
async fn test_metrics_success_rate() {
    let (orch, _) = build(4, Arc::new(ScriptedAgent));
    for i in 0..10 {
        let message = if i < 2 { "fail" } else { "ok" };
        let _ = orch
            .execute_agent_task(
                UserId::new(format!("user_{}", i)),
                AgentRequest::new(message),
                None,
                false,
            )
            .await;
    }
    let metrics = orch.get_orchestration_metrics();
    assert_eq!(metrics.total_executions, 10);
    assert_eq!(metrics.failed_executions, 2);
    assert_eq!(metrics.success_rate, 80.0);
    // 顺序执行时实例被反复复用
    assert_eq!(metrics.agents_created, 1);
}

#[tokio::test]
async fn test_thread_continuation_and_persistence() {
    let ids = Arc::new(IdManager::new());
    let router = Arc::new(EventRouter::new(Arc::clone(&ids), RouterConfig::default()));
    let store = Arc::new(InMemoryContextPersistence::new());
    let factory = |_: &AgentId| -> Arc<dyn AgentBehavior> { Arc::new(ScriptedAgent) };
    let orch = AgentOrchestrator::new(
        PoolConfig::default(),
        Arc::clone(&ids),
        router,
        Arc::new(factory),
    )
    .with_persistence(store.clone());

    let thread = ThreadId::new("thread_conversation");
    let first = orch
        .execute_agent_task(
            UserId::new("u"),
            AgentRequest::new("one").with_thread(thread.clone()),
            None,
            true,
        )
        .await
        .unwrap();
    let second = orch
        .execute_agent_task(
            UserId::new("u"),
            AgentRequest::new("two").with_thread(thread.clone()),
            None,
            true,
        )
        .await
        .unwrap();

    assert_eq!(first.thread_id, thread);
    assert_eq!(second.thread_id, thread);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(
        IdManager::extract_thread_id(second.run_id.as_str()),
        Some(thread.clone())
    );

    let lookup = ExecutionContext::builder(UserId::new("u"), thread).build(&ids);
    let record = store.load(&lookup).await.unwrap().unwrap();
    assert_eq!(record.run_id, second.run_id.as_str());
    assert_eq!(record.output, Some(serde_json::json!({ "reply": "two" })));
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_release_refused_while_run_in_flight() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (orch, _) = build(
        1,
        Arc::new(GatedAgent {
            entered: entered.clone(),
            release: release.clone(),
        }),
    );
    let user = UserId::new("u");

    let first = {
        let orch = Arc::clone(&orch);
        let user = user.clone();
        tokio::spawn(async move {
            orch.execute_agent_task(user, AgentRequest::new("one"), None, true)
                .await
        })
    };
    entered.notified().await;

    assert!(!orch.release_agent(&user));
    let agent = orch.agent_for(&user).unwrap();
    assert_eq!(agent.bound_user(), Some(user.clone()));
    assert_eq!(agent.state(), AgentState::Running);
    // 实例未被释放，其他用户拿不到它
    assert!(matches!(
        orch.get_or_create_agent(&UserId::new("v")),
        Err(AgentError::ResourceExhausted(_))
    ));

    let err = orch
        .execute_agent_task(user.clone(), AgentRequest::new("two"), None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::SlotUnavailable { .. }));
    assert_eq!(orch.active_agents(), 1);

    release.notify_one();
    assert_eq!(first.await.unwrap().unwrap().status, AgentState::Completed);
    assert_eq!(orch.active_agents(), 0);
    assert_eq!(orch.pooled_agents(), 1);
    assert!(!orch.release_agent(&user));
}

/// 只对指定用户的状态变更通知失败
struct RejectUserListener(&'static str);

#[async_trait]
impl StateListener for RejectUserListener {
    async fn on_state_change(
        &self,
        ctx: &ExecutionContext,
        _: AgentState,
        _: AgentState,
    ) -> anyhow::Result<()> {
        if ctx.user_id().as_str() == self.0 {
            anyhow::bail!("listener rejects {}", self.0);
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_reused_agent_starts_with_clean_breakers() {
    let ids = Arc::new(IdManager::new());
    let router = Arc::new(EventRouter::new(Arc::clone(&ids), RouterConfig::default()));
    let factory = |_: &AgentId| -> Arc<dyn AgentBehavior> { Arc::new(ScriptedAgent) };
    let orch = AgentOrchestrator::new(
        PoolConfig {
            max_concurrent_agents: 1,
            ..PoolConfig::default()
        },
        ids,
        router,
        Arc::new(factory),
    )
    .with_state_listener(Arc::new(RejectUserListener("alice")));

    for _ in 0..3 {
        let err = orch
            .execute_agent_task(UserId::new("alice"), AgentRequest::new("x"), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::StateNotificationFailure { .. }));
    }
    // 同一用户连续失败，熔断器保持打开
    let err = orch
        .execute_agent_task(UserId::new("alice"), AgentRequest::new("x"), None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::CircuitBreakerOpen { .. }));

    let result = orch
        .execute_agent_task(UserId::new("bob"), AgentRequest::new("hello"), None, false)
        .await
        .unwrap();
    assert_eq!(result.status, AgentState::Completed);

    let metrics = orch.get_orchestration_metrics();
    assert_eq!(metrics.agents_created, 1);
    assert_eq!(metrics.total_executions, 5);
    assert_eq!(metrics.failed_executions, 4);
}
