//! 核心层：标识符、执行上下文、回调熔断、生命周期、事件路由、Agent 池

pub mod callbacks;
pub mod context;
pub mod error;
pub mod ids;
pub mod lifecycle;
pub mod orchestrator;
pub mod persistence;
pub mod router;

pub use callbacks::{
    callback_types, BreakerSnapshot, CallbackFailure, CallbackFailureManager, CallbackPolicy,
    CircuitBreaker, Criticality, FailureMetrics,
};
pub use context::{ExecutionContext, ExecutionContextBuilder};
pub use error::AgentError;
pub use ids::{
    AgentId, ConnectionId, IdManager, IdType, ParsedId, RequestId, RunId, ThreadId, UserId,
};
pub use lifecycle::{
    AgentBehavior, AgentRequest, AgentState, LifecycleController, LifecycleStats, RunGuard,
    StateListener,
};
pub use orchestrator::{
    success_rate, AgentFactory, AgentInstance, AgentOrchestrator, OrchestrationMetrics,
    PoolConfig, TaskResult,
};
pub use persistence::{ContextPersistence, InMemoryContextPersistence, RunRecord};
pub use router::{
    AgentEvent, ChannelSender, ConnectionSender, DeliveryReport, EventKind, EventRouter,
    RouterConfig, RouterStats, RunEmitter, SendError,
};
