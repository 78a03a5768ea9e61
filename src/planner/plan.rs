//! 已校验的动作计划

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 计划中的一步；arguments 可能含 `{{steps.<id>.output}}` 引用，执行时替换
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub step_id: String,
    pub tool_name: String,
    pub arguments: Value,
    /// 该步失败或被拒时，剩余步骤全部跳过
    #[serde(default)]
    pub required_for_continuation: bool,
}

impl ToolCall {
    pub fn new(step_id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            step_id: step_id.into(),
            tool_name: tool_name.into(),
            arguments,
            required_for_continuation: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required_for_continuation = true;
        self
    }
}

/// 只由 parser 构造（或由启发式降级直接构造），进入执行器时已满足注册表与 schema 约束
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<ToolCall>,
    #[serde(default)]
    pub final_response_template: Option<String>,
}

impl Plan {
    pub fn new(steps: Vec<ToolCall>) -> Self {
        Self {
            steps,
            final_response_template: None,
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.final_response_template = Some(template.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.tool_name.as_str()).collect()
    }
}
