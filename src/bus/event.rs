//! 感知事件：进程内广播的类型化通知

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// 用户输入到达
    UserInput,
    /// 计划生成（或降级计划）完成
    PlanProduced,
    /// 单个工具步骤执行完毕（无论结果）
    ToolExecuted,
    ErrorRaised,
    /// 走了启发式降级路径
    FallbackUsed,
    /// 交互结束，携带总耗时
    InteractionCompleted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserInput => "user_input",
            Self::PlanProduced => "plan_produced",
            Self::ToolExecuted => "tool_executed",
            Self::ErrorRaised => "error_raised",
            Self::FallbackUsed => "fallback_used",
            Self::InteractionCompleted => "interaction_completed",
        }
    }
}

/// 瞬时事件，总线本身不持久化
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerceptionEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub source: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl PerceptionEvent {
    pub fn new(kind: EventKind, source: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            source: source.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// 订阅过滤：按事件类型和/或来源
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    kinds: Option<HashSet<EventKind>>,
    source: Option<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn matches(&self, event: &PerceptionEvent) -> bool {
        let kind_ok = self
            .kinds
            .as_ref()
            .map(|k| k.contains(&event.kind))
            .unwrap_or(true);
        let source_ok = self
            .source
            .as_ref()
            .map(|s| s == &event.source)
            .unwrap_or(true);
        kind_ok && source_ok
    }
}
