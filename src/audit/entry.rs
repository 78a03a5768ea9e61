//! 审计条目

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::security::{Decision, PermissionDecision, RiskTier};
use crate::tools::{ToolResult, ToolStatus};

/// decision：权限闸门的决策（执行前写入）；execution：步骤的最终结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Decision,
    Execution,
}

/// 只追加，不修改、不删除
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub user_id: String,
    pub action: String,
    pub risk_tier: RiskTier,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolStatus>,
    pub duration_ms: u64,
    #[serde(default)]
    pub details: Value,
}

/// 审计条目的归属信息（谁、哪次交互、哪一步）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditScope {
    pub user_id: String,
    pub interaction_id: Option<String>,
    pub step_id: Option<String>,
}

impl AuditScope {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_interaction(mut self, interaction_id: impl Into<String>) -> Self {
        self.interaction_id = Some(interaction_id.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}

impl AuditEntry {
    pub fn for_decision(scope: &AuditScope, decision: &PermissionDecision, arguments: &Value) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: AuditKind::Decision,
            interaction_id: scope.interaction_id.clone(),
            step_id: scope.step_id.clone(),
            user_id: scope.user_id.clone(),
            action: decision.action.clone(),
            risk_tier: decision.risk_tier,
            decision: decision.decision,
            status: None,
            duration_ms: 0,
            details: serde_json::json!({
                "reason": decision.reason,
                "confirmation": decision.confirmation,
                "arguments": arguments,
            }),
        }
    }

    /// 执行结果条目；decision 为 None 表示未到达权限闸门（未知工具、跳过、取消）
    pub fn for_execution(
        scope: &AuditScope,
        result: &ToolResult,
        risk_tier: RiskTier,
        decision: Option<&PermissionDecision>,
    ) -> Self {
        let mut details = serde_json::json!({ "tool": result.tool_name });
        if let Some(msg) = &result.error_message {
            details["error"] = Value::String(msg.clone());
        }
        if let Some(d) = decision {
            details["reason"] = Value::String(d.reason.clone());
        }
        Self {
            timestamp: Utc::now(),
            kind: AuditKind::Execution,
            interaction_id: scope.interaction_id.clone(),
            step_id: Some(result.step_id.clone()),
            user_id: scope.user_id.clone(),
            action: result.tool_name.clone(),
            risk_tier: decision.map(|d| d.risk_tier).unwrap_or(risk_tier),
            decision: decision.map(|d| d.decision).unwrap_or(Decision::Deny),
            status: Some(result.status),
            duration_ms: result.duration_ms,
            details,
        }
    }
}
