//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CONDUCTOR__*` 覆盖
//! （双下划线表示嵌套，如 `CONDUCTOR__SERVICES__FAILURE_THRESHOLD=3`）。
//! 熔断阈值、确认超时等常量统一在这里命名，默认值应结合真实延迟数据再评估。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::bus::BackpressurePolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub services: ServicesSection,
    pub permissions: PermissionsSection,
    pub planner: PlannerSection,
    pub context: ContextSection,
    pub audit: AuditSection,
    pub bus: BusSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 每个会话保留的对话轮数（ContextWindow 容量）
    pub max_context_turns: usize,
    /// 非交互 / 开发模式：确认请求自动通过
    pub non_interactive: bool,
    /// 会话空闲多久后回收（秒）
    pub session_idle_secs: u64,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_context_turns: 20,
            non_interactive: false,
            session_idle_secs: 1800,
        }
    }
}

impl AppSection {
    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

/// [services] 段：端点表、熔断与重试策略、健康检查
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServicesSection {
    /// 服务名 -> 基础地址（如 system_executor = "http://localhost:5002"）
    pub endpoints: HashMap<String, String>,
    /// 连续失败多少次后打开熔断器（F）
    pub failure_threshold: u32,
    /// 熔断冷却时间（T，秒）
    pub cooldown_secs: u64,
    pub retry_base_ms: u64,
    pub retry_factor: u32,
    /// 包含首次调用在内的最大尝试次数
    pub retry_max_attempts: u32,
    pub default_timeout_secs: u64,
    pub health_interval_secs: u64,
    pub health_timeout_secs: u64,
}

impl Default for ServicesSection {
    fn default() -> Self {
        let endpoints = [
            ("planner", "http://localhost:5001"),
            ("system_executor", "http://localhost:5002"),
            ("connectors", "http://localhost:5006"),
            ("knowledge", "http://localhost:5007"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            endpoints,
            failure_threshold: 5,
            cooldown_secs: 30,
            retry_base_ms: 200,
            retry_factor: 2,
            retry_max_attempts: 3,
            default_timeout_secs: 30,
            health_interval_secs: 15,
            health_timeout_secs: 5,
        }
    }
}

impl ServicesSection {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}

/// [permissions] 段：确认超时与拒绝规则扩展
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PermissionsSection {
    pub confirmation_timeout_secs: u64,
    /// 追加到内置危险子串表的规则
    pub extra_deny_substrings: Vec<String>,
    /// 任何路径参数以这些前缀开头即拒绝
    pub forbidden_path_prefixes: Vec<String>,
    /// 路径参数落在这些前缀下时风险提升为 high
    pub sensitive_path_prefixes: Vec<String>,
}

impl Default for PermissionsSection {
    fn default() -> Self {
        Self {
            confirmation_timeout_secs: 30,
            extra_deny_substrings: Vec::new(),
            forbidden_path_prefixes: [
                "/boot", "/dev", "/proc", "/sys", "/System", "/bin", "/sbin", "/usr/bin",
                "/usr/sbin", "/etc/shadow", "/etc/sudoers",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            sensitive_path_prefixes: ["/etc", "/var", "/private", "/root", "~/.ssh", "~/.aws"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl PermissionsSection {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
}

/// [planner] 段：计划服务、硬超时、步数上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    pub service: String,
    pub timeout_secs: u64,
    pub max_steps: usize,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            service: "planner".to_string(),
            timeout_secs: 20,
            max_steps: 20,
        }
    }
}

impl PlannerSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// [context] 段：K / N / M 为固定配置，保证计划请求延迟可预期
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    /// K：注入的最近对话轮数
    pub max_turns: usize,
    /// N：知识片段条数
    pub max_snippets: usize,
    /// M：同一用户的最近审计条数
    pub max_audit_entries: usize,
    pub retrieval_timeout_ms: u64,
    /// 知识检索服务名；未设置时不做检索
    pub knowledge_service: Option<String>,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_turns: 10,
            max_snippets: 5,
            max_audit_entries: 5,
            retrieval_timeout_ms: 2000,
            knowledge_service: Some("knowledge".to_string()),
        }
    }
}

impl ContextSection {
    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_millis(self.retrieval_timeout_ms)
    }
}

/// [audit] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditSection {
    /// JSON Lines 审计文件；未设置时只保存在内存（仅用于开发）
    pub path: Option<PathBuf>,
    /// 内存中保留的最近条目数（供上下文与统计查询）
    pub recent_capacity: usize,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("data/audit/audit.jsonl")),
            recent_capacity: 1000,
        }
    }
}

/// [bus] 段：每个订阅者的有界邮箱与背压策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusSection {
    pub subscriber_capacity: usize,
    pub policy: BackpressurePolicy,
    pub block_timeout_ms: u64,
    pub history_size: usize,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
            policy: BackpressurePolicy::DropOldest,
            block_timeout_ms: 100,
            history_size: 100,
        }
    }
}

impl BusSection {
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}

/// 从 config 目录加载配置，环境变量 CONDUCTOR__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CONDUCTOR__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("CONDUCTOR")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
