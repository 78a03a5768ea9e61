//! 错误恢复引擎
//!
//! 根据 OrchestratorError 类型与所处阶段返回 RecoveryAction，供计划适配器与 Dispatcher
//! 决定是修复重试、降级、报告部分成功还是终止。

use crate::core::{OrchestratorError, RecoveryAction};

/// 出错时所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStage {
    /// 计划生成阶段；repair_attempted 表示是否已经做过一次修复
    Planning { repair_attempted: bool },
    /// 工具执行阶段
    Execution,
}

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &OrchestratorError, stage: RecoveryStage) -> RecoveryAction {
        if err.is_fatal() {
            return RecoveryAction::Abort;
        }
        match (stage, err) {
            (
                RecoveryStage::Planning {
                    repair_attempted: false,
                },
                OrchestratorError::Validation(detail),
            ) => RecoveryAction::RepairPlan(repair_feedback(detail)),
            (RecoveryStage::Planning { .. }, _) => RecoveryAction::Fallback,
            (RecoveryStage::Execution, OrchestratorError::PermissionDenied { action, reason }) => {
                RecoveryAction::ReportPartial(format!("'{action}' was blocked: {reason}"))
            }
            (RecoveryStage::Execution, OrchestratorError::Cancelled) => {
                RecoveryAction::ReportPartial("the request was cancelled".to_string())
            }
            (RecoveryStage::Execution, other) => RecoveryAction::ReportPartial(other.to_string()),
        }
    }
}

/// 修复请求的纠正反馈（追加在原请求之后）
fn repair_feedback(detail: &str) -> String {
    format!(
        "Your previous plan was rejected: {detail}. \
         Reply with exactly one JSON object matching the plan schema, with no text before or after it. \
         Only use tools from the catalogue and only their declared arguments."
    )
}
