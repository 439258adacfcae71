//! 上下文持久化接口
//!
//! 只在 pre_run（load）与 post_run（save）边界调用；存储格式由实现方决定。
//! 内置内存实现，供测试与单进程部署使用。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::context::ExecutionContext;
use super::lifecycle::AgentState;

/// 每个 thread 的最近一次 run 记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub user_id: String,
    pub thread_id: String,
    pub run_id: String,
    pub request_id: String,
    pub state: AgentState,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn from_context(ctx: &ExecutionContext, state: AgentState) -> Self {
        Self {
            user_id: ctx.user_id().to_string(),
            thread_id: ctx.thread_id().to_string(),
            run_id: ctx.run_id().to_string(),
            request_id: ctx.request_id().to_string(),
            state,
            output: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// 上下文持久化 trait
#[async_trait]
pub trait ContextPersistence: Send + Sync {
    async fn save(&self, ctx: &ExecutionContext, record: &RunRecord) -> anyhow::Result<()>;

    /// 读取该 thread 的上一条记录；不存在返回 None
    async fn load(&self, ctx: &ExecutionContext) -> anyhow::Result<Option<RunRecord>>;
}

/// 内存实现：按 (user_id, thread_id) 存储
#[derive(Default)]
pub struct InMemoryContextPersistence {
    records: RwLock<HashMap<(String, String), RunRecord>>,
}

impl InMemoryContextPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ContextPersistence for InMemoryContextPersistence {
    async fn save(&self, ctx: &ExecutionContext, record: &RunRecord) -> anyhow::Result<()> {
        let key = (ctx.user_id().to_string(), ctx.thread_id().to_string());
        self.records.write().await.insert(key, record.clone());
        Ok(())
    }

    async fn load(&self, ctx: &ExecutionContext) -> anyhow::Result<Option<RunRecord>> {
        let key = (ctx.user_id().to_string(), ctx.thread_id().to_string());
        Ok(self.records.read().await.get(&key).cloned())
    }
}
