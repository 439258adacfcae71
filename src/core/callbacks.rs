//! 回调失败管理：按回调类型的熔断器 + 按重要程度分级的失败处理
//!
//! 副作用回调（通知、持久化钩子、连接钩子）都经由 `execute_callback_safely` 执行：
//! - 熔断器打开且未到重置窗口：CRITICAL 抛出 `CircuitBreakerOpen`，其余直接跳过并计数
//! - 成功：熔断器完全重置（计数清零、关闭、清空近期失败）
//! - 失败：记录失败、计数、达到阈值则打开；CRITICAL 抛出，IMPORTANT / NON_CRITICAL 只记录
//!
//! 每个管理器实例对应一个连接或会话，重要程度映射只影响本实例。

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::error::AgentError;

/// 内置回调类型名
pub mod callback_types {
    pub const STATE_CHANGE: &str = "state_change";
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
    pub const PERSIST_CONTEXT: &str = "persist_context";
}

/// 回调重要程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// 失败即中止当前 run
    Critical,
    /// 失败记录并告警，run 继续
    Important,
    /// 失败静默记录
    NonCritical,
}

/// 熔断与历史记录策略
#[derive(Debug, Clone)]
pub struct CallbackPolicy {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    /// 历史超过该长度时裁剪
    pub history_limit: usize,
    /// 裁剪后保留最近的条数
    pub history_trim_to: usize,
    /// 每个熔断器保留的近期失败条数
    pub recent_failures_capacity: usize,
    /// 覆盖默认重要程度
    pub criticality_overrides: HashMap<String, Criticality>,
}

impl Default for CallbackPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            history_limit: 100,
            history_trim_to: 50,
            recent_failures_capacity: 10,
            criticality_overrides: HashMap::new(),
        }
    }
}

fn default_criticality_map() -> HashMap<String, Criticality> {
    HashMap::from([
        (callback_types::STATE_CHANGE.to_string(), Criticality::Critical),
        (callback_types::CONNECT.to_string(), Criticality::Important),
        (callback_types::DISCONNECT.to_string(), Criticality::NonCritical),
    ])
}

/// 单条回调失败记录
#[derive(Debug, Clone, Serialize)]
pub struct CallbackFailure {
    pub callback_type: String,
    pub timestamp: DateTime<Utc>,
    pub error: String,
    pub criticality: Criticality,
}

/// 单个回调类型的熔断器
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    is_open: bool,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    recent_failures: VecDeque<CallbackFailure>,
    recent_capacity: usize,
    skipped_calls: u64,
}

impl CircuitBreaker {
    fn new(recent_capacity: usize) -> Self {
        Self {
            is_open: false,
            failure_count: 0,
            last_failure_time: None,
            last_failure_at: None,
            recent_failures: VecDeque::new(),
            recent_capacity: recent_capacity.max(1),
            skipped_calls: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// 打开状态下距上次失败已超过重置窗口，允许放行一次试探调用
    fn is_reset_eligible(&self, reset_timeout: Duration, now: Instant) -> bool {
        match self.last_failure_time {
            Some(at) => now.saturating_duration_since(at) >= reset_timeout,
            None => true,
        }
    }

    fn blocks(&self, reset_timeout: Duration, now: Instant) -> bool {
        self.is_open && !self.is_reset_eligible(reset_timeout, now)
    }

    fn record_failure(&mut self, failure: CallbackFailure, threshold: u32) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(Instant::now());
        self.last_failure_at = Some(failure.timestamp);
        if self.recent_failures.len() == self.recent_capacity {
            self.recent_failures.pop_front();
        }
        self.recent_failures.push_back(failure);
        if self.failure_count >= threshold {
            self.is_open = true;
        }
    }

    fn reset(&mut self) {
        self.is_open = false;
        self.failure_count = 0;
        self.last_failure_time = None;
        self.last_failure_at = None;
        self.recent_failures.clear();
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            is_open: self.is_open,
            failure_count: self.failure_count,
            last_failure_time: self.last_failure_at,
            recent_failures: self.recent_failures.iter().cloned().collect(),
            skipped_calls: self.skipped_calls,
        }
    }
}

/// 熔断器快照（可序列化，供指标接口使用）
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub is_open: bool,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub recent_failures: Vec<CallbackFailure>,
    pub skipped_calls: u64,
}

/// 失败指标汇总
#[derive(Debug, Clone, Serialize)]
pub struct FailureMetrics {
    pub total_failures: u64,
    pub critical_failures: u64,
    pub important_failures: u64,
    pub non_critical_failures: u64,
    pub history_len: usize,
    pub circuit_breakers: HashMap<String, BreakerSnapshot>,
}

struct Inner {
    breakers: HashMap<String, CircuitBreaker>,
    history: Vec<CallbackFailure>,
    criticality: HashMap<String, Criticality>,
    total_failures: u64,
    critical_failures: u64,
    important_failures: u64,
    non_critical_failures: u64,
}

/// 回调失败管理器（按连接 / 会话构造，不做进程级共享）
pub struct CallbackFailureManager {
    scope: String,
    policy: CallbackPolicy,
    inner: Mutex<Inner>,
}

impl CallbackFailureManager {
    pub fn new(scope: impl Into<String>, policy: CallbackPolicy) -> Self {
        let mut criticality = default_criticality_map();
        criticality.extend(policy.criticality_overrides.clone());
        Self {
            scope: scope.into(),
            policy,
            inner: Mutex::new(Inner {
                breakers: HashMap::new(),
                history: Vec::new(),
                criticality,
                total_failures: 0,
                critical_failures: 0,
                important_failures: 0,
                non_critical_failures: 0,
            }),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn policy(&self) -> &CallbackPolicy {
        &self.policy
    }

    /// 设置某回调类型的重要程度（仅影响本实例）
    pub fn set_callback_criticality(&self, callback_type: &str, level: Criticality) {
        self.inner
            .lock()
            .criticality
            .insert(callback_type.to_string(), level);
    }

    /// 仅在该类型尚未配置时设置重要程度
    pub fn ensure_callback_criticality(&self, callback_type: &str, level: Criticality) {
        self.inner
            .lock()
            .criticality
            .entry(callback_type.to_string())
            .or_insert(level);
    }

    /// 未配置的类型默认为 IMPORTANT
    pub fn callback_criticality(&self, callback_type: &str) -> Criticality {
        self.inner
            .lock()
            .criticality
            .get(callback_type)
            .copied()
            .unwrap_or(Criticality::Important)
    }

    /// 在熔断器保护下执行回调
    ///
    /// 返回 `Ok(Some(v))` 表示回调成功；`Ok(None)` 表示非 CRITICAL 回调被跳过或失败后已恢复；
    /// `Err` 只会出现在 CRITICAL 回调上。回调中的 panic 视为失败。
    pub async fn execute_callback_safely<T, F, Fut>(
        &self,
        callback_type: &str,
        callback: F,
    ) -> Result<Option<T>, AgentError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let criticality = self.callback_criticality(callback_type);

        if self.check_open(callback_type) {
            if criticality == Criticality::Critical {
                tracing::error!(
                    scope = %self.scope,
                    callback_type,
                    "Circuit breaker open, rejecting critical callback"
                );
                return Err(AgentError::CircuitBreakerOpen {
                    callback_type: callback_type.to_string(),
                });
            }
            tracing::debug!(
                scope = %self.scope,
                callback_type,
                "Circuit breaker open, skipping callback"
            );
            return Ok(None);
        }

        let outcome = AssertUnwindSafe(async move { callback().await })
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!(
                "callback panicked: {}",
                panic_message(panic.as_ref())
            )),
        };

        match result {
            Ok(value) => {
                self.record_success(callback_type);
                Ok(Some(value))
            }
            Err(error) => {
                self.record_failure(callback_type, criticality, &error);
                match criticality {
                    Criticality::Critical => {
                        tracing::error!(
                            scope = %self.scope,
                            callback_type,
                            "Critical callback failed: {:#}",
                            error
                        );
                        if callback_type == callback_types::STATE_CHANGE {
                            Err(AgentError::StateNotificationFailure { source: error })
                        } else {
                            Err(AgentError::CriticalCallbackFailure {
                                callback_type: callback_type.to_string(),
                                source: error,
                            })
                        }
                    }
                    Criticality::Important => {
                        tracing::warn!(
                            scope = %self.scope,
                            callback_type,
                            "Callback failed, continuing: {:#}",
                            error
                        );
                        Ok(None)
                    }
                    Criticality::NonCritical => {
                        tracing::debug!(
                            scope = %self.scope,
                            callback_type,
                            "Non-critical callback failed: {:#}",
                            error
                        );
                        Ok(None)
                    }
                }
            }
        }
    }

    /// 熔断器是否拦截本次调用；拦截时累加 skipped_calls
    fn check_open(&self, callback_type: &str) -> bool {
        let mut inner = self.inner.lock();
        let capacity = self.policy.recent_failures_capacity;
        let breaker = inner
            .breakers
            .entry(callback_type.to_string())
            .or_insert_with(|| CircuitBreaker::new(capacity));
        if breaker.blocks(self.policy.reset_timeout, Instant::now()) {
            breaker.skipped_calls += 1;
            true
        } else {
            false
        }
    }

    fn record_success(&self, callback_type: &str) {
        let mut inner = self.inner.lock();
        if let Some(breaker) = inner.breakers.get_mut(callback_type) {
            if breaker.is_open {
                tracing::info!(scope = %self.scope, callback_type, "Circuit breaker closed");
            }
            breaker.reset();
        }
    }

    fn record_failure(&self, callback_type: &str, criticality: Criticality, error: &anyhow::Error) {
        let failure = CallbackFailure {
            callback_type: callback_type.to_string(),
            timestamp: Utc::now(),
            error: format!("{:#}", error),
            criticality,
        };

        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        match criticality {
            Criticality::Critical => inner.critical_failures += 1,
            Criticality::Important => inner.important_failures += 1,
            Criticality::NonCritical => inner.non_critical_failures += 1,
        }

        inner.history.push(failure.clone());
        if inner.history.len() > self.policy.history_limit {
            let excess = inner.history.len().saturating_sub(self.policy.history_trim_to);
            inner.history.drain(..excess);
        }

        let capacity = self.policy.recent_failures_capacity;
        let threshold = self.policy.failure_threshold;
        let breaker = inner
            .breakers
            .entry(callback_type.to_string())
            .or_insert_with(|| CircuitBreaker::new(capacity));
        let was_open = breaker.is_open;
        breaker.record_failure(failure, threshold);
        if breaker.is_open && !was_open {
            tracing::warn!(
                scope = %self.scope,
                callback_type,
                failures = breaker.failure_count,
                "Circuit breaker opened"
            );
        }
    }

    pub fn breaker_snapshot(&self, callback_type: &str) -> Option<BreakerSnapshot> {
        self.inner
            .lock()
            .breakers
            .get(callback_type)
            .map(CircuitBreaker::snapshot)
    }

    /// 手动重置某类型熔断器
    pub fn reset_breaker(&self, callback_type: &str) {
        if let Some(breaker) = self.inner.lock().breakers.get_mut(callback_type) {
            breaker.reset();
        }
    }

    /// 整体复位：熔断器、历史、计数清空，重要程度恢复为默认值加策略覆盖
    ///
    /// Agent 换绑到新用户前调用，上一位用户的熔断状态不得带入。
    pub fn reset(&self) {
        let mut criticality = default_criticality_map();
        criticality.extend(self.policy.criticality_overrides.clone());
        let mut inner = self.inner.lock();
        inner.breakers.clear();
        inner.history.clear();
        inner.criticality = criticality;
        inner.total_failures = 0;
        inner.critical_failures = 0;
        inner.important_failures = 0;
        inner.non_critical_failures = 0;
        tracing::debug!(scope = %self.scope, "Callback failure state reset");
    }

    pub fn failure_history(&self) -> Vec<CallbackFailure> {
        self.inner.lock().history.clone()
    }

    pub fn get_failure_metrics(&self) -> FailureMetrics {
        let inner = self.inner.lock();
        FailureMetrics {
            total_failures: inner.total_failures,
            critical_failures: inner.critical_failures,
            important_failures: inner.important_failures,
            non_critical_failures: inner.non_critical_failures,
            history_len: inner.history.len(),
            circuit_breakers: inner
                .breakers
                .iter()
                .map(|(k, b)| (k.clone(), b.snapshot()))
                .collect(),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
