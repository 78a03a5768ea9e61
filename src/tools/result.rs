//! 工具执行结果

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Error,
    Denied,
    Timeout,
    /// 交互被取消时，进行中与剩余步骤的结果
    Cancelled,
    /// 必需步骤失败后，剩余步骤不再执行
    Skipped,
}

impl ToolStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Denied => "denied",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }
}

/// 每个声明的步骤恰好对应一个 ToolResult
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub step_id: String,
    pub tool_name: String,
    pub status: ToolStatus,
    pub output: Value,
    pub error_message: Option<String>,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn ok(step_id: &str, tool_name: &str, output: Value, duration: Duration) -> Self {
        Self {
            step_id: step_id.to_string(),
            tool_name: tool_name.to_string(),
            status: ToolStatus::Ok,
            output,
            error_message: None,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn failed(
        step_id: &str,
        tool_name: &str,
        status: ToolStatus,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            step_id: step_id.to_string(),
            tool_name: tool_name.to_string(),
            status,
            output: Value::Null,
            error_message: Some(message.into()),
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ToolStatus::Ok
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}
