//! 计划解析与校验（fail-closed）
//!
//! 回复必须恰好是一个 JSON 对象，前后不能有任何文本，也不做代码块提取；
//! 解析后逐步检查：步数上限、step_id 唯一且合法、工具已注册、参数符合 schema、
//! 模板只引用更早的步骤。任何一条不满足，整份计划作废。

use std::collections::HashSet;

use crate::planner::schema::PlanWire;
use crate::planner::{Plan, ToolCall};
use crate::tools::template;
use crate::tools::ToolRegistry;

pub const MAX_STEPS: usize = 20;

fn valid_step_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// 解析并校验；失败时返回全部错误
pub fn parse_plan(text: &str, registry: &ToolRegistry, max_steps: usize) -> Result<Plan, Vec<String>> {
    let trimmed = text.trim();
    if !trimmed.starts_with('{') {
        return Err(vec!["reply must be a single JSON object with no surrounding text".to_string()]);
    }
    let wire: PlanWire =
        serde_json::from_str(trimmed).map_err(|e| vec![format!("invalid plan JSON: {e}")])?;
    validate_wire(wire, registry, max_steps.min(MAX_STEPS))
}

fn validate_wire(wire: PlanWire, registry: &ToolRegistry, max_steps: usize) -> Result<Plan, Vec<String>> {
    let mut errors = Vec::new();
    if wire.tool_calls.len() > max_steps {
        errors.push(format!(
            "plan has {} steps, at most {max_steps} allowed",
            wire.tool_calls.len()
        ));
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut steps = Vec::with_capacity(wire.tool_calls.len());

    for (i, call) in wire.tool_calls.into_iter().enumerate() {
        let step_id = call.step_id.unwrap_or_else(|| format!("step-{}", i + 1));
        let label = format!("step {} ('{step_id}')", i + 1);

        if !valid_step_id(&step_id) {
            errors.push(format!("{label}: step_id may only contain letters, digits, '_' and '-'"));
        }
        if seen.contains(&step_id) {
            errors.push(format!("{label}: duplicate step_id"));
        }

        let arguments = serde_json::Value::Object(call.arguments);
        match registry.get(&call.tool_name) {
            None => errors.push(format!("{label}: unknown tool '{}'", call.tool_name)),
            Some(spec) => {
                if let Err(errs) = spec.schema.validate(&arguments) {
                    errors.extend(errs.into_iter().map(|e| format!("{label}: {e}")));
                }
            }
        }

        match template::referenced_steps(&arguments) {
            Ok(refs) => {
                for r in refs.iter().filter(|r| !seen.contains(*r)) {
                    errors.push(format!("{label}: references step '{r}' which does not run before it"));
                }
            }
            Err(e) => errors.push(format!("{label}: {e}")),
        }

        if let Some(why) = &call.reasoning {
            tracing::debug!(step_id = %step_id, tool = %call.tool_name, reasoning = %why, "plan step");
        }

        seen.insert(step_id.clone());
        steps.push(ToolCall {
            step_id,
            tool_name: call.tool_name,
            arguments,
            required_for_continuation: call.required_for_continuation,
        });
    }

    if errors.is_empty() {
        Ok(Plan {
            steps,
            final_response_template: wire.final_response_template,
        })
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OrchestratorError;
    use crate::security::RiskTier;
    use crate::tools::{ArgSchema, ArgType, ToolHandler, ToolSpec};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    struct Nop;

    #[async_trait]
    impl ToolHandler for Nop {
        async fn invoke(&self, _: &Value, _: Duration) -> Result<Value, OrchestratorError> {
            Ok(Value::Null)
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(ToolSpec::new(
            "read_file",
            "read",
            RiskTier::Low,
            ArgSchema::new().required("path", ArgType::String, "p"),
            Arc::new(Nop),
        ));
        reg.register(ToolSpec::new(
            "send_notification",
            "notify",
            RiskTier::Low,
            ArgSchema::new()
                .required("title", ArgType::String, "t")
                .required("message", ArgType::String, "m"),
            Arc::new(Nop),
        ));
        reg
    }

    #[test]
    fn test_valid_plan_with_reference() {
        let text = r#"{
            "tool_calls": [
                {"step_id": "read", "tool_name": "read_file", "arguments": {"path": "/tmp/notes.txt"}, "required_for_continuation": true},
                {"tool_name": "send_notification", "arguments": {"title": "Notes", "message": "{{steps.read.output}}"}}
            ],
            "final_response_template": "Done."
        }"#;
        let plan = parse_plan(text, &registry(), 20).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.steps[1].step_id, "step-2");
        assert!(plan.steps[0].required_for_continuation);
        assert_eq!(plan.final_response_template.as_deref(), Some("Done."));
    }

    #[test]
    fn test_surrounding_text_rejected() {
        let text = "Sure! Here is the plan: {\"tool_calls\": []}";
        assert!(parse_plan(text, &registry(), 20).is_err());
        let fenced = "```json\n{\"tool_calls\": []}\n```";
        assert!(parse_plan(fenced, &registry(), 20).is_err());
        let trailing = "{\"tool_calls\": []} thanks";
        assert!(parse_plan(trailing, &registry(), 20).is_err());
    }

    #[test]
    fn test_unknown_tool_and_bad_args_reject_whole_plan() {
        let text = json!({
            "tool_calls": [
                {"step_id": "a", "tool_name": "read_file", "arguments": {"path": "/tmp/x"}},
                {"step_id": "b", "tool_name": "format_disk", "arguments": {}},
                {"step_id": "c", "tool_name": "read_file", "arguments": {"path": 3}}
            ]
        })
        .to_string();
        let errs = parse_plan(&text, &registry(), 20).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("unknown tool 'format_disk'")));
        assert!(errs.iter().any(|e| e.contains("'path' must be string")));
    }

    #[test]
    fn test_ids_unique_and_references_backward_only() {
        let dup = json!({"tool_calls": [
            {"step_id": "a", "tool_name": "read_file", "arguments": {"path": "/a"}},
            {"step_id": "a", "tool_name": "read_file", "arguments": {"path": "/b"}}
        ]});
        assert!(parse_plan(&dup.to_string(), &registry(), 20)
            .unwrap_err()
            .iter()
            .any(|e| e.contains("duplicate step_id")));

        let forward = json!({"tool_calls": [
            {"step_id": "a", "tool_name": "read_file", "arguments": {"path": "{{steps.b.output}}"}},
            {"step_id": "b", "tool_name": "read_file", "arguments": {"path": "/b"}}
        ]});
        assert!(parse_plan(&forward.to_string(), &registry(), 20).is_err());

        let bad_id = json!({"tool_calls": [{"step_id": "a b", "tool_name": "read_file", "arguments": {"path": "/a"}}]});
        assert!(parse_plan(&bad_id.to_string(), &registry(), 20).is_err());
    }

    #[test]
    fn test_step_limit() {
        let calls: Vec<Value> = (0..21)
            .map(|_| json!({"tool_name": "read_file", "arguments": {"path": "/a"}}))
            .collect();
        let text = json!({ "tool_calls": calls }).to_string();
        let errs = parse_plan(&text, &registry(), 50).unwrap_err();
        assert!(errs[0].contains("at most 20"));
    }
}
