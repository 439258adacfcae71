//! 执行底座错误类型
//!
//! 只有 CRITICAL 回调失败、资源耗尽与执行失败会暴露给 `execute_agent_task` 的调用方；
//! IMPORTANT / NON_CRITICAL 回调失败在 CallbackFailureManager 内部记录后即恢复。

use thiserror::Error;

/// Agent 执行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// Agent 池已满（活跃数达到 max_concurrent_agents）
    #[error("Maximum concurrent agents reached: {0}")]
    ResourceExhausted(String),

    /// pre_run 拒绝：该 Agent 的运行槽位已被占用（同一用户的并发 run）
    #[error("Concurrency slot unavailable for user {user_id}")]
    SlotUnavailable { user_id: String },

    /// 熔断器打开且未到重置窗口（仅 CRITICAL 回调会抛出）
    #[error("Circuit breaker open for callback '{callback_type}'")]
    CircuitBreakerOpen { callback_type: String },

    /// CRITICAL 回调失败，中止当前 run
    #[error("Critical callback '{callback_type}' failed: {source}")]
    CriticalCallbackFailure {
        callback_type: String,
        #[source]
        source: anyhow::Error,
    },

    /// 状态变更通知（state_change）失败
    #[error("State notification failed: {source}")]
    StateNotificationFailure {
        #[source]
        source: anyhow::Error,
    },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Agent execution failed: {0}")]
    ExecutionFailed(String),

    /// 上下文中的用户与 Agent 当前绑定的用户不一致
    #[error("Agent bound to {bound:?} cannot run context for user {requested}")]
    UserMismatch {
        bound: Option<String>,
        requested: String,
    },

    #[error("Invalid lifecycle state: {0}")]
    InvalidState(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl AgentError {
    /// 是否为 CRITICAL 回调导致的失败（需强制 FAILED 并清理）
    pub fn is_critical_callback(&self) -> bool {
        matches!(
            self,
            AgentError::CriticalCallbackFailure { .. }
                | AgentError::StateNotificationFailure { .. }
                | AgentError::CircuitBreakerOpen { .. }
        )
    }

    /// 简短的错误代码，随 error 事件下发给连接
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::ResourceExhausted(_) => "resource_exhausted",
            AgentError::SlotUnavailable { .. } => "slot_unavailable",
            AgentError::CircuitBreakerOpen { .. } => "circuit_breaker_open",
            AgentError::CriticalCallbackFailure { .. } => "critical_callback_failure",
            AgentError::StateNotificationFailure { .. } => "state_notification_failure",
            AgentError::Cancelled => "cancelled",
            AgentError::ExecutionFailed(_) => "execution_failed",
            AgentError::UserMismatch { .. } => "user_mismatch",
            AgentError::InvalidState(_) => "invalid_state",
            AgentError::Config(_) => "config_error",
        }
    }
}
