//! 标识符管理：生成带类型前缀的唯一 ID，并在 run_id 与 thread_id 之间做可逆映射
//!
//! 普通 ID 形如 `[prefix_]type_counter_hex8`；run_id 形如 `run_counter_hex8_<thread_id>`，
//! 反向提取 thread_id 只依赖 run_id 本身，不需要任何外部查询。

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id!(
    /// 用户 ID（连接表与 Agent 池的键）
    UserId
);
define_id!(
    /// 对话线程 ID
    ThreadId
);
define_id!(
    /// 单次 run 的 ID，内嵌 thread_id
    RunId
);
define_id!(
    /// 请求 ID（每次接收请求生成一个）
    RequestId
);
define_id!(
    /// Agent 实例 ID（实例复用时保持不变）
    AgentId
);
define_id!(
    /// 连接 ID（连接注册表内唯一）
    ConnectionId
);

/// ID 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdType {
    User,
    Thread,
    Run,
    Request,
    Agent,
    Connection,
}

impl IdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdType::User => "user",
            IdType::Thread => "thread",
            IdType::Run => "run",
            IdType::Request => "request",
            IdType::Agent => "agent",
            IdType::Connection => "conn",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(IdType::User),
            "thread" => Some(IdType::Thread),
            "run" => Some(IdType::Run),
            "request" => Some(IdType::Request),
            "agent" => Some(IdType::Agent),
            "conn" => Some(IdType::Connection),
            _ => None,
        }
    }
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ID 解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedId {
    pub prefix: Option<String>,
    pub id_type: IdType,
    pub counter: u64,
    pub random: String,
    /// 仅 run_id 有值
    pub thread_id: Option<ThreadId>,
}

const RUN_MARKER: &str = "run_";

/// 标识符管理器：每种类型一个单调计数器 + 8 位随机十六进制后缀
///
/// 显式构造并按引用传递，不使用进程级单例；多个实例互不影响，
/// 随机后缀保证跨实例的碰撞概率可以忽略。
#[derive(Debug, Default)]
pub struct IdManager {
    prefix: Option<String>,
    counters: Mutex<HashMap<IdType, u64>>,
}

impl IdManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 所有非 run 的 ID 都带上该前缀（如租户名）
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn next_counter(&self, id_type: IdType) -> u64 {
        let mut counters = self.counters.lock();
        let counter = counters.entry(id_type).or_insert(0);
        *counter += 1;
        *counter
    }

    /// 生成 `[prefix_]type_counter_hex8`；`prefix` 为 None 时使用管理器默认前缀
    pub fn generate_id(&self, id_type: IdType, prefix: Option<&str>) -> String {
        let counter = self.next_counter(id_type);
        let random = random_hex8();
        match prefix.or(self.prefix.as_deref()) {
            Some(p) if !p.is_empty() => format!("{}_{}_{}_{}", p, id_type, counter, random),
            _ => format!("{}_{}_{}", id_type, counter, random),
        }
    }

    pub fn generate_user_id(&self) -> UserId {
        UserId(self.generate_id(IdType::User, None))
    }

    pub fn generate_thread_id(&self) -> ThreadId {
        ThreadId(self.generate_id(IdType::Thread, None))
    }

    pub fn generate_request_id(&self) -> RequestId {
        RequestId(self.generate_id(IdType::Request, None))
    }

    pub fn generate_agent_id(&self) -> AgentId {
        AgentId(self.generate_id(IdType::Agent, None))
    }

    pub fn generate_connection_id(&self) -> ConnectionId {
        ConnectionId(self.generate_id(IdType::Connection, None))
    }

    /// 由 thread_id 派生 run_id：`run_counter_hex8_<thread_id>`
    pub fn generate_run_id(&self, thread_id: &ThreadId) -> RunId {
        let counter = self.next_counter(IdType::Run);
        RunId(format!(
            "{}{}_{}_{}",
            RUN_MARKER,
            counter,
            random_hex8(),
            thread_id.as_str()
        ))
    }

    /// 从 run_id 中取回 thread_id；格式不合法时返回 None，从不 panic
    pub fn extract_thread_id(run_id: &str) -> Option<ThreadId> {
        let rest = run_id.strip_prefix(RUN_MARKER)?;
        let (counter, rest) = rest.split_once('_')?;
        if !is_decimal(counter) {
            return None;
        }
        let (random, thread) = rest.split_once('_')?;
        if !is_hex8(random) || thread.is_empty() {
            return None;
        }
        Some(ThreadId(thread.to_string()))
    }

    /// 校验 run_id 与 thread_id 是否相互对应；不一致只记 warn，不视为错误
    pub fn correlate(thread_id: &ThreadId, run_id: &RunId) -> bool {
        match Self::extract_thread_id(run_id.as_str()) {
            Some(extracted) if &extracted == thread_id => true,
            Some(extracted) => {
                tracing::warn!(
                    run_id = %run_id,
                    thread_id = %thread_id,
                    extracted = %extracted,
                    "Run id does not belong to thread"
                );
                false
            }
            None => {
                tracing::warn!(run_id = %run_id, "Malformed run id, cannot correlate to thread");
                false
            }
        }
    }

    /// 解析 ID 各段；无法识别时返回 None
    pub fn parse(id: &str) -> Option<ParsedId> {
        if let Some(thread_id) = Self::extract_thread_id(id) {
            let mut parts = id[RUN_MARKER.len()..].splitn(3, '_');
            let counter = parts.next()?.parse().ok()?;
            let random = parts.next()?.to_string();
            return Some(ParsedId {
                prefix: None,
                id_type: IdType::Run,
                counter,
                random,
                thread_id: Some(thread_id),
            });
        }

        let mut parts = id.rsplitn(4, '_');
        let random = parts.next()?;
        let counter = parts.next()?;
        let id_type = IdType::parse(parts.next()?)?;
        let prefix = parts.next().map(str::to_string);
        if !is_hex8(random) || !is_decimal(counter) || prefix.as_deref() == Some("") {
            return None;
        }
        Some(ParsedId {
            prefix,
            id_type,
            counter: counter.parse().ok()?,
            random: random.to_string(),
            thread_id: None,
        })
    }
}

fn random_hex8() -> String {
    // v4 UUID 的低 32 位全部为随机位
    format!("{:08x}", uuid::Uuid::new_v4().as_u128() as u32)
}

fn is_hex8(s: &str) -> bool {
    s.len() == 8 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
