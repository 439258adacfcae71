//! Hive 演示入口
//!
//! 初始化日志与配置，为几个用户并发执行 EchoAgent，打印收到的事件与编排指标。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hive::agent::EchoAgent;
use hive::config::{load_config, AppConfig};
use hive::core::{
    AgentBehavior, AgentId, AgentOrchestrator, AgentRequest, ChannelSender, EventRouter, UserId,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let ids = Arc::new(cfg.id_manager());
    let router = Arc::new(EventRouter::new(Arc::clone(&ids), cfg.router_config()));
    let factory = |_: &AgentId| -> Arc<dyn AgentBehavior> {
        Arc::new(EchoAgent::with_latency(Duration::from_millis(50)))
    };
    let orchestrator = Arc::new(AgentOrchestrator::new(
        cfg.pool_config(),
        Arc::clone(&ids),
        Arc::clone(&router),
        Arc::new(factory),
    ));

    let users: Vec<UserId> = (0..3).map(|_| ids.generate_user_id()).collect();
    let mut connections = Vec::new();
    let mut printers = Vec::new();
    for user in &users {
        let (sender, mut rx) = ChannelSender::new();
        let connection_id = router
            .register_connection(user.clone(), Arc::new(sender))
            .await
            .context("Failed to register connection")?;
        connections.push(connection_id);
        printers.push(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{}", line);
                }
            }
        }));
    }

    let mut tasks = Vec::new();
    for (i, user) in users.iter().enumerate() {
        let orchestrator = Arc::clone(&orchestrator);
        let user = user.clone();
        tasks.push(tokio::spawn(async move {
            let request = AgentRequest::new(format!("hello from user {}", i));
            orchestrator.execute_agent_task(user, request, None, true).await
        }));
    }
    for task in tasks {
        match task.await.context("Task panicked")? {
            Ok(result) => tracing::info!(run_id = %result.run_id, "Task completed"),
            Err(e) => tracing::warn!("Task failed: {}", e),
        }
    }

    let metrics = orchestrator.get_orchestration_metrics();
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    orchestrator.shutdown();

    // 注销连接后发送端被释放，打印任务随之结束
    for connection_id in &connections {
        router.unregister_connection(connection_id).await;
    }
    for printer in printers {
        let _ = printer.await;
    }

    Ok(())
}
