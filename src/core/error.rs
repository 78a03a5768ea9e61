//! 编排错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 OrchestratorError 决定 RepairPlan / Fallback / ReportPartial / Abort。
//! 只有 AuditUnwritable 是致命错误，其余错误都在组件边界被转换为带类型的结果。

use thiserror::Error;

/// 编排核心中可能出现的错误（校验、服务不可用、权限、超时、审计失败等）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    /// 计划格式错误（缺字段、未知工具、参数不符合 schema、JSON 前后有多余文本）
    #[error("Plan validation failed: {0}")]
    Validation(String),

    /// 熔断器打开或网络失败
    #[error("Service unavailable: {service} ({reason})")]
    ServiceUnavailable { service: String, reason: String },

    /// 服务在线，但工具执行返回失败（`success: false`）
    #[error("Tool failed: {0}")]
    ToolFailed(String),

    #[error("Permission denied for '{action}': {reason}")]
    PermissionDenied { action: String, reason: String },

    /// 计划服务、工具调用或确认通道超时
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    /// 审计日志不可写：丢失可归因性比停止更糟，调用方必须终止进程
    #[error("Audit log unwritable: {0}")]
    AuditUnwritable(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl OrchestratorError {
    pub fn unavailable(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// 是否为致命错误（需终止整个进程）
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuditUnwritable(_))
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 把错误作为纠正反馈追加到请求中，再向计划服务请求一次
    RepairPlan(String),
    /// 走启发式降级路径
    Fallback,
    /// 作为部分成功报告给用户（说明哪一步失败及原因）
    ReportPartial(String),
    /// 终止（仅致命错误）
    Abort,
}
