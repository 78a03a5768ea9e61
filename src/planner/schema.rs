//! 计划的线格式与 JSON Schema（schemars 生成，随请求发给计划服务）
//!
//! 线格式：`{"tool_calls": [{"step_id", "tool_name", "arguments", "required_for_continuation", "reasoning"}],
//! "final_response_template": "..."}`，两层都不接受未知字段。

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PlanWire {
    /// 按执行顺序排列的工具调用，最多 20 个
    pub tool_calls: Vec<StepWire>,
    /// 最终回复模板，可引用 `{{steps.<step_id>.output}}`
    #[serde(default)]
    pub final_response_template: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StepWire {
    /// 步骤 ID（字母、数字、`_`、`-`）；省略时按位置生成 step-1、step-2...
    #[serde(default)]
    pub step_id: Option<String>,
    /// 必须是工具目录中的名字
    pub tool_name: String,
    /// 工具参数，字符串值中可用 `{{steps.<step_id>.output}}` 引用前面步骤的输出
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// 该步失败时是否停止后续步骤
    #[serde(default)]
    pub required_for_continuation: bool,
    /// 选择该工具的理由（仅记录日志）
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// 计划线格式的 JSON Schema
pub fn plan_schema() -> Value {
    serde_json::to_value(schema_for!(PlanWire)).unwrap_or(Value::Null)
}

pub fn plan_schema_json() -> String {
    serde_json::to_string_pretty(&schema_for!(PlanWire)).unwrap_or_else(|_| String::new())
}
