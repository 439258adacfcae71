//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__POOL__MAX_CONCURRENT_AGENTS=20`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{CallbackPolicy, Criticality, IdManager, PoolConfig, RouterConfig};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub callbacks: CallbacksSection,
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub ids: IdsSection,
}

/// [pool] 段：并发 Agent 上限
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_concurrent_agents: default_max_concurrent_agents(),
        }
    }
}

fn default_max_concurrent_agents() -> usize {
    10
}

/// [callbacks] 段：熔断阈值、重置窗口、失败历史上限
#[derive(Debug, Clone, Deserialize)]
pub struct CallbacksSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_history_trim_to")]
    pub history_trim_to: usize,
    #[serde(default = "default_recent_failures_capacity")]
    pub recent_failures_capacity: usize,
    /// 回调类型 -> critical / important / non_critical
    #[serde(default)]
    pub criticality: HashMap<String, Criticality>,
}

impl Default for CallbacksSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            history_limit: default_history_limit(),
            history_trim_to: default_history_trim_to(),
            recent_failures_capacity: default_recent_failures_capacity(),
            criticality: HashMap::new(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_history_limit() -> usize {
    100
}

fn default_history_trim_to() -> usize {
    50
}

fn default_recent_failures_capacity() -> usize {
    10
}

/// [router] 段
#[derive(Debug, Clone, Deserialize)]
pub struct RouterSection {
    /// 标准事件投递失败后的重试次数
    #[serde(default = "default_canonical_retries")]
    pub canonical_retries: u32,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            canonical_retries: default_canonical_retries(),
        }
    }
}

fn default_canonical_retries() -> u32 {
    1
}

/// [ids] 段
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdsSection {
    /// 生成 ID 时的前缀（如租户名）
    pub prefix: Option<String>,
}

impl AppConfig {
    pub fn callback_policy(&self) -> CallbackPolicy {
        let c = &self.callbacks;
        CallbackPolicy {
            failure_threshold: c.failure_threshold.max(1),
            reset_timeout: Duration::from_millis(c.reset_timeout_ms),
            history_limit: c.history_limit,
            history_trim_to: c.history_trim_to.min(c.history_limit),
            recent_failures_capacity: c.recent_failures_capacity,
            criticality_overrides: c.criticality.clone(),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_concurrent_agents: self.pool.max_concurrent_agents,
            callback_policy: self.callback_policy(),
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            canonical_retries: self.router.canonical_retries,
            callback_policy: self.callback_policy(),
        }
    }

    pub fn id_manager(&self) -> IdManager {
        match &self.ids.prefix {
            Some(prefix) => IdManager::with_prefix(prefix.clone()),
            None => IdManager::new(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
