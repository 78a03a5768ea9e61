//! 回复生成：把计划与执行结果折叠成给用户的一段话
//!
//! TemplateResponder 是确定性的本地实现；其它实现（例如调用语言模型）通过 Responder trait 注入。

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{OrchestratorError, RecoveryAction, RecoveryEngine, RecoveryStage};
use crate::planner::Plan;
use crate::tools::template;
use crate::tools::{ToolResult, ToolStatus};

#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, request: &str, plan: &Plan, results: &[ToolResult]) -> String;
}

const MAX_OUTPUT_CHARS: usize = 300;

fn short(value: &Value) -> String {
    let text = match value {
        Value::Null => return "done".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() > MAX_OUTPUT_CHARS {
        format!("{}...", text.chars().take(MAX_OUTPUT_CHARS).collect::<String>())
    } else {
        text
    }
}

/// 失败结果还原成错误，交给恢复引擎给出说明
fn as_error(result: &ToolResult) -> OrchestratorError {
    let msg = result.error_message.clone().unwrap_or_default();
    match result.status {
        ToolStatus::Denied => OrchestratorError::PermissionDenied {
            action: result.tool_name.clone(),
            reason: msg,
        },
        ToolStatus::Cancelled => OrchestratorError::Cancelled,
        ToolStatus::Timeout => OrchestratorError::Timeout(format!("{} ({msg})", result.tool_name)),
        ToolStatus::Skipped => OrchestratorError::ToolFailed(format!("{} skipped: {msg}", result.tool_name)),
        _ => OrchestratorError::ToolFailed(format!("{}: {msg}", result.tool_name)),
    }
}

#[derive(Debug, Default)]
pub struct TemplateResponder {
    recovery: RecoveryEngine,
}

impl TemplateResponder {
    pub fn new() -> Self {
        Self::default()
    }

    fn explain(&self, result: &ToolResult) -> String {
        match self.recovery.handle(&as_error(result), RecoveryStage::Execution) {
            RecoveryAction::ReportPartial(text) => text,
            _ => format!("{} failed", result.tool_name),
        }
    }

    fn render_template(&self, tpl: &str, results: &[ToolResult]) -> Option<String> {
        let outputs: HashMap<String, Value> = results
            .iter()
            .filter(|r| r.is_ok())
            .map(|r| (r.step_id.clone(), r.output.clone()))
            .collect();
        match template::resolve(&Value::String(tpl.to_string()), &outputs) {
            Ok(Value::String(s)) => Some(s),
            Ok(other) => Some(short(&other)),
            Err(e) => {
                tracing::debug!(error = %e, "response template not renderable, summarising instead");
                None
            }
        }
    }

    pub fn compose(&self, plan: &Plan, results: &[ToolResult]) -> String {
        if results.is_empty() {
            return plan
                .final_response_template
                .as_deref()
                .and_then(|t| self.render_template(t, results))
                .unwrap_or_else(|| "Nothing needed to be done for that request.".to_string());
        }

        let (done, failed): (Vec<&ToolResult>, Vec<&ToolResult>) = results.iter().partition(|r| r.is_ok());

        if failed.is_empty() {
            if let Some(text) = plan
                .final_response_template
                .as_deref()
                .and_then(|t| self.render_template(t, results))
            {
                return text;
            }
            let lines: Vec<String> = done
                .iter()
                .map(|r| format!("{}: {}", r.tool_name, short(&r.output)))
                .collect();
            return lines.join("\n");
        }

        if results.iter().all(|r| r.status == ToolStatus::Cancelled) {
            return "The request was cancelled before anything was done.".to_string();
        }

        let reasons: Vec<String> = failed.iter().map(|r| self.explain(r)).collect();
        if done.is_empty() {
            return format!("Sorry, I couldn't do that. {}.", reasons.join("; "));
        }

        let finished: Vec<String> = done
            .iter()
            .map(|r| format!("{}: {}", r.tool_name, short(&r.output)))
            .collect();
        format!(
            "I did part of it.\n{}\nNot done: {}.",
            finished.join("\n"),
            reasons.join("; ")
        )
    }
}

#[async_trait]
impl Responder for TemplateResponder {
    async fn respond(&self, _request: &str, plan: &Plan, results: &[ToolResult]) -> String {
        self.compose(plan, results)
    }
}
