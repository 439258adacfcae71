//! Hive - 多用户 Agent 执行与事件投递内核
//!
//! 模块划分：
//! - **agent**: 示例 Agent（EchoAgent）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 标识符、执行上下文、回调熔断、生命周期、事件路由、Agent 池
//! - **observability**: tracing 日志初始化

pub mod agent;
pub mod config;
pub mod core;
pub mod observability;

pub use crate::core::{AgentError, AgentOrchestrator, EventRouter, ExecutionContext, IdManager};
