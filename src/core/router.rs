//! 事件路由：把生命周期事件投递给且仅投递给所属用户的连接
//!
//! - 进程内一个路由实例，内部按 user_id 维护连接注册表
//! - 每个连接拥有独立的 CallbackFailureManager（熔断器按连接隔离）
//! - 五个标准事件与 error 投递失败为 IMPORTANT（重试一次后记录，run 继续）；自定义事件为 NON_CRITICAL
//! - 投递回调类型带 `event:` 前缀，自定义事件名不会落到 state_change 等保留类型上
//! - 同一 run 的事件经 RunEmitter 串行投递，接收端看到的顺序与发出顺序一致

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use super::callbacks::{callback_types, CallbackFailureManager, CallbackPolicy, Criticality};
use super::context::ExecutionContext;
use super::error::AgentError;
use super::ids::{ConnectionId, IdManager, RequestId, RunId, ThreadId, UserId};

/// 事件类型：五个标准生命周期事件 + error + 自定义
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    AgentStarted,
    AgentThinking,
    ToolExecuting,
    ToolCompleted,
    AgentCompleted,
    Error,
    Custom(String),
}

impl EventKind {
    pub const CANONICAL: [EventKind; 5] = [
        EventKind::AgentStarted,
        EventKind::AgentThinking,
        EventKind::ToolExecuting,
        EventKind::ToolCompleted,
        EventKind::AgentCompleted,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::AgentStarted => "agent_started",
            EventKind::AgentThinking => "agent_thinking",
            EventKind::ToolExecuting => "tool_executing",
            EventKind::ToolCompleted => "tool_completed",
            EventKind::AgentCompleted => "agent_completed",
            EventKind::Error => "error",
            EventKind::Custom(name) => name,
        }
    }

    pub fn is_canonical(&self) -> bool {
        Self::CANONICAL.contains(self)
    }

    /// 过程性事件：stream_updates 关闭时不投递
    pub fn is_progress(&self) -> bool {
        matches!(
            self,
            EventKind::AgentThinking
                | EventKind::ToolExecuting
                | EventKind::ToolCompleted
                | EventKind::Custom(_)
        )
    }

    /// 投递回调类型：以 `event:` 为前缀，与 state_change / connect 等生命周期回调互不相干
    pub fn callback_type(&self) -> String {
        format!("event:{}", self.as_str())
    }

    /// 标准事件与 error 投递失败后按配置重试，自定义事件不重试
    pub fn is_retried(&self) -> bool {
        self.is_canonical() || *self == EventKind::Error
    }

    /// 投递失败的默认重要程度
    pub fn delivery_criticality(&self) -> Criticality {
        if self.is_canonical() || *self == EventKind::Error {
            Criticality::Important
        } else {
            Criticality::NonCritical
        }
    }
}

/// 发给连接的事件（传输层负责序列化格式）
#[derive(Debug, Clone, Serialize)]
pub struct AgentEvent {
    #[serde(skip)]
    pub kind: EventKind,
    #[serde(rename = "type")]
    pub event_type: String,
    pub user_id: UserId,
    pub thread_id: ThreadId,
    pub run_id: RunId,
    pub request_id: RequestId,
    /// run 内从 1 开始递增
    pub sequence: u64,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AgentEvent {
    fn new(ctx: &ExecutionContext, kind: EventKind, sequence: u64, payload: serde_json::Value) -> Self {
        Self {
            event_type: kind.as_str().to_string(),
            kind,
            user_id: ctx.user_id().clone(),
            thread_id: ctx.thread_id().clone(),
            run_id: ctx.run_id().clone(),
            request_id: ctx.request_id().clone(),
            sequence,
            payload,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("Connection not found")]
    NotFound,
    #[error("Transport error: {0}")]
    Transport(String),
}

/// 实际的传输端（WebSocket / SSE 等由外部实现）
#[async_trait]
pub trait ConnectionSender: Send + Sync {
    async fn send(&self, user_id: &UserId, event: &AgentEvent) -> Result<(), SendError>;

    /// 连接注册后调用（callback 类型 `connect`）
    async fn on_connect(&self, _user_id: &UserId) -> anyhow::Result<()> {
        Ok(())
    }

    /// 连接注销后调用（callback 类型 `disconnect`）
    async fn on_disconnect(&self, _user_id: &UserId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 进程内通道实现：接收端关闭后视为连接不存在
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl ChannelSender {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ConnectionSender for ChannelSender {
    async fn send(&self, _user_id: &UserId, event: &AgentEvent) -> Result<(), SendError> {
        self.tx.send(event.clone()).map_err(|_| SendError::NotFound)
    }
}

/// 路由配置
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// 标准事件投递失败后的重试次数
    pub canonical_retries: u32,
    /// 每个连接的回调策略
    pub callback_policy: CallbackPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            canonical_retries: 1,
            callback_policy: CallbackPolicy::default(),
        }
    }
}

struct Connection {
    id: ConnectionId,
    user_id: UserId,
    sender: Arc<dyn ConnectionSender>,
    callbacks: Arc<CallbackFailureManager>,
}

/// 单次 emit 的投递结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// 该用户名下的连接数
    pub targeted: usize,
    /// 成功送达的连接数
    pub delivered: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RouterStats {
    pub connections: usize,
    pub users: usize,
    pub events_delivered: u64,
    pub events_failed: u64,
    /// 用户无连接而未投递的事件
    pub events_unrouted: u64,
}

/// 事件路由器
pub struct EventRouter {
    ids: Arc<IdManager>,
    config: RouterConfig,
    connections: RwLock<HashMap<UserId, Vec<Arc<Connection>>>>,
    events_delivered: AtomicU64,
    events_failed: AtomicU64,
    events_unrouted: AtomicU64,
}

impl EventRouter {
    pub fn new(ids: Arc<IdManager>, config: RouterConfig) -> Self {
        Self {
            ids,
            config,
            connections: RwLock::new(HashMap::new()),
            events_delivered: AtomicU64::new(0),
            events_failed: AtomicU64::new(0),
            events_unrouted: AtomicU64::new(0),
        }
    }

    /// 注册用户连接；`connect` 钩子失败按其重要程度处理（默认只记录）
    pub async fn register_connection(
        &self,
        user_id: UserId,
        sender: Arc<dyn ConnectionSender>,
    ) -> Result<ConnectionId, AgentError> {
        let id = self.ids.generate_connection_id();
        let callbacks = Arc::new(CallbackFailureManager::new(
            id.as_str(),
            self.config.callback_policy.clone(),
        ));
        let conn = Arc::new(Connection {
            id: id.clone(),
            user_id: user_id.clone(),
            sender,
            callbacks,
        });

        // connect 钩子先于入表执行：CRITICAL 失败时该连接从未收到过事件
        conn.callbacks
            .execute_callback_safely(callback_types::CONNECT, || conn.sender.on_connect(&user_id))
            .await?;

        self.connections
            .write()
            .entry(user_id.clone())
            .or_default()
            .push(conn);
        tracing::info!(user_id = %user_id, connection_id = %id, "Connection registered");
        Ok(id)
    }

    /// 注销连接；返回该连接是否存在
    pub async fn unregister_connection(&self, connection_id: &ConnectionId) -> bool {
        let Some(conn) = self.remove(connection_id) else {
            return false;
        };
        tracing::info!(user_id = %conn.user_id, connection_id = %conn.id, "Connection unregistered");
        // disconnect 默认 NON_CRITICAL，只有显式调为 CRITICAL 时才会出错
        if let Err(e) = conn
            .callbacks
            .execute_callback_safely(callback_types::DISCONNECT, || {
                conn.sender.on_disconnect(&conn.user_id)
            })
            .await
        {
            tracing::warn!(connection_id = %conn.id, "Disconnect hook failed: {}", e);
        }
        true
    }

    fn remove(&self, connection_id: &ConnectionId) -> Option<Arc<Connection>> {
        let mut connections = self.connections.write();
        let mut removed = None;
        connections.retain(|_, conns| {
            if let Some(pos) = conns.iter().position(|c| &c.id == connection_id) {
                removed = Some(conns.remove(pos));
            }
            !conns.is_empty()
        });
        removed
    }

    /// 用户当前的连接快照（只读该用户的条目）
    fn connections_for(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_connection(&self, user_id: &UserId) -> bool {
        self.connections.read().contains_key(user_id)
    }

    pub fn user_connection_count(&self, user_id: &UserId) -> usize {
        self.connections
            .read()
            .get(user_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// 取某连接的回调管理器（用于调整重要程度或查看熔断指标）
    pub fn connection_callbacks(
        &self,
        connection_id: &ConnectionId,
    ) -> Option<Arc<CallbackFailureManager>> {
        self.connections
            .read()
            .values()
            .flatten()
            .find(|c| &c.id == connection_id)
            .map(|c| Arc::clone(&c.callbacks))
    }

    pub fn stats(&self) -> RouterStats {
        let connections = self.connections.read();
        RouterStats {
            connections: connections.values().map(Vec::len).sum(),
            users: connections.len(),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            events_unrouted: self.events_unrouted.load(Ordering::Relaxed),
        }
    }

    /// 投递一条事件到 `ctx.user_id` 的全部连接
    ///
    /// 只有被调成 CRITICAL 的事件类型投递失败时才返回 Err。
    pub async fn emit(
        &self,
        ctx: &ExecutionContext,
        kind: EventKind,
        sequence: u64,
        payload: serde_json::Value,
    ) -> Result<DeliveryReport, AgentError> {
        let targets = self.connections_for(ctx.user_id());
        if targets.is_empty() {
            self.events_unrouted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                user_id = %ctx.user_id(),
                run_id = %ctx.run_id(),
                event = kind.as_str(),
                "No connection registered for user, event not delivered"
            );
            return Ok(DeliveryReport::default());
        }

        let retries = if kind.is_retried() {
            self.config.canonical_retries
        } else {
            0
        };
        let criticality = kind.delivery_criticality();
        let callback_type = kind.callback_type();
        let event = AgentEvent::new(ctx, kind, sequence, payload);

        let mut report = DeliveryReport {
            targeted: targets.len(),
            delivered: 0,
        };
        for conn in &targets {
            conn.callbacks
                .ensure_callback_criticality(&callback_type, criticality);
            let delivered = conn
                .callbacks
                .execute_callback_safely(&callback_type, || {
                    deliver(conn.sender.as_ref(), &conn.user_id, &event, retries)
                })
                .await;
            match delivered {
                Ok(Some(())) => {
                    report.delivered += 1;
                    self.events_delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => {
                    self.events_failed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.events_failed.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
        Ok(report)
    }
}

async fn deliver(
    sender: &dyn ConnectionSender,
    user_id: &UserId,
    event: &AgentEvent,
    retries: u32,
) -> anyhow::Result<()> {
    let mut attempt = 0;
    loop {
        match sender.send(user_id, event).await {
            Ok(()) => return Ok(()),
            Err(SendError::NotFound) => {
                anyhow::bail!("connection for user {} not found", user_id)
            }
            Err(e) if attempt < retries => {
                attempt += 1;
                tracing::debug!(
                    user_id = %user_id,
                    event = %event.event_type,
                    attempt,
                    "Event delivery failed, retrying: {}",
                    e
                );
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// 单次 run 的事件发射器
///
/// 持有 run 的上下文，分配递增序号；内部互斥保证同一 run 的事件串行投递。
pub struct RunEmitter {
    router: Arc<EventRouter>,
    ctx: Arc<ExecutionContext>,
    stream_updates: bool,
    sequence: Mutex<u64>,
}

impl RunEmitter {
    pub fn new(router: Arc<EventRouter>, ctx: Arc<ExecutionContext>, stream_updates: bool) -> Self {
        Self {
            router,
            ctx,
            stream_updates,
            sequence: Mutex::new(0),
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn stream_updates(&self) -> bool {
        self.stream_updates
    }

    /// 已发出的事件数
    pub async fn emitted(&self) -> u64 {
        *self.sequence.lock().await
    }

    pub async fn emit(&self, kind: EventKind, payload: serde_json::Value) -> Result<(), AgentError> {
        if !self.stream_updates && kind.is_progress() {
            return Ok(());
        }
        let mut sequence = self.sequence.lock().await;
        *sequence += 1;
        self.router.emit(&self.ctx, kind, *sequence, payload).await?;
        Ok(())
    }

    pub async fn agent_thinking(&self, thought: &str) -> Result<(), AgentError> {
        self.emit(EventKind::AgentThinking, serde_json::json!({ "thought": thought }))
            .await
    }

    pub async fn tool_executing(&self, tool: &str, args: serde_json::Value) -> Result<(), AgentError> {
        self.emit(
            EventKind::ToolExecuting,
            serde_json::json!({ "tool": tool, "args": args }),
        )
        .await
    }

    pub async fn tool_completed(&self, tool: &str, result: serde_json::Value) -> Result<(), AgentError> {
        self.emit(
            EventKind::ToolCompleted,
            serde_json::json!({ "tool": tool, "result": result }),
        )
        .await
    }

    /// 非标准事件，投递失败为 NON_CRITICAL
    pub async fn custom(&self, name: &str, payload: serde_json::Value) -> Result<(), AgentError> {
        self.emit(EventKind::Custom(name.to_string()), payload).await
    }

    pub(crate) async fn agent_started(&self, agent_id: &str) -> Result<(), AgentError> {
        self.emit(
            EventKind::AgentStarted,
            serde_json::json!({ "agent_id": agent_id }),
        )
        .await
    }

    pub(crate) async fn agent_completed(
        &self,
        output: &serde_json::Value,
        duration_ms: f64,
    ) -> Result<(), AgentError> {
        self.emit(
            EventKind::AgentCompleted,
            serde_json::json!({ "result": output, "duration_ms": duration_ms }),
        )
        .await
    }

    pub(crate) async fn error(&self, err: &AgentError) -> Result<(), AgentError> {
        self.emit(
            EventKind::Error,
            serde_json::json!({ "code": err.code(), "message": err.to_string() }),
        )
        .await
    }
}
