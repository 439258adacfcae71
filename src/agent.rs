//! 示例 Agent：回显用户输入
//!
//! 演示 AgentBehavior 的写法：在挂起点检查取消，经 RunEmitter 发出思考与工具事件。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::{AgentBehavior, AgentError, AgentRequest, RunEmitter};

/// Echo Agent：思考 → 调用 echo 工具 → 返回回显文本
pub struct EchoAgent {
    /// 模拟工具耗时
    tool_latency: Duration,
}

impl EchoAgent {
    pub fn new() -> Self {
        Self {
            tool_latency: Duration::ZERO,
        }
    }

    pub fn with_latency(tool_latency: Duration) -> Self {
        Self { tool_latency }
    }
}

impl Default for EchoAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentBehavior for EchoAgent {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, request: &AgentRequest, emitter: &RunEmitter) -> anyhow::Result<Value> {
        emitter
            .agent_thinking(&format!("echoing {} chars", request.message.chars().count()))
            .await?;

        let args = json!({ "text": request.message });
        emitter.tool_executing("echo", args).await?;
        if !self.tool_latency.is_zero() {
            tokio::select! {
                _ = emitter.context().cancelled() => return Err(AgentError::Cancelled.into()),
                _ = tokio::time::sleep(self.tool_latency) => {}
            }
        }
        let text = if request.message.is_empty() {
            "(empty)".to_string()
        } else {
            request.message.clone()
        };
        emitter.tool_completed("echo", json!(text)).await?;

        Ok(json!({ "reply": text }))
    }
}
