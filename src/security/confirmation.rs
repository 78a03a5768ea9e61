//! 确认通道：可插拔的后端
//!
//! - AutoConfirm：非交互 / 开发模式，始终通过
//! - TerminalConfirmation：终端提示，从共享的行输入读取 y/n
//! - DenyConfirm：未接入确认界面时的默认值，一律拒绝
//!
//! 超时由 PermissionGate 统一施加，超时即拒绝。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::security::RiskTier;

/// 一次确认请求
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationRequest {
    pub id: String,
    pub user_id: String,
    pub action: String,
    pub risk_tier: RiskTier,
    pub arguments: Value,
    pub description: String,
}

#[async_trait]
pub trait ConfirmationChannel: Send + Sync {
    /// 返回用户是否确认；timeout 仅供后端展示，实际超时由调用方施加
    async fn request_confirmation(&self, request: &ConfirmationRequest, timeout: Duration) -> bool;
}

/// 非交互模式：始终确认
#[derive(Debug, Default)]
pub struct AutoConfirm;

#[async_trait]
impl ConfirmationChannel for AutoConfirm {
    async fn request_confirmation(&self, request: &ConfirmationRequest, _timeout: Duration) -> bool {
        tracing::debug!(action = %request.action, tier = %request.risk_tier, "auto-confirmed (non-interactive)");
        true
    }
}

/// 终端提示：与 CLI 主循环共享同一个行输入
pub struct TerminalConfirmation {
    lines: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
}

impl TerminalConfirmation {
    pub fn new(lines: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>) -> Self {
        Self { lines }
    }
}

#[async_trait]
impl ConfirmationChannel for TerminalConfirmation {
    async fn request_confirmation(&self, request: &ConfirmationRequest, timeout: Duration) -> bool {
        println!(
            "⚠ {} [{}] {}\n  confirm within {}s? [y/N]",
            request.action,
            request.risk_tier,
            request.description,
            timeout.as_secs()
        );
        let mut lines = self.lines.lock().await;
        match lines.recv().await {
            Some(answer) => matches!(
                answer.trim().to_lowercase().as_str(),
                "y" | "yes" | "o" | "oui"
            ),
            None => false,
        }
    }
}

/// 没有接入任何确认界面时使用：一律拒绝
#[derive(Debug, Default)]
pub struct DenyConfirm;

#[async_trait]
impl ConfirmationChannel for DenyConfirm {
    async fn request_confirmation(&self, request: &ConfirmationRequest, _timeout: Duration) -> bool {
        tracing::warn!(action = %request.action, tier = %request.risk_tier, "no confirmation channel, refusing");
        false
    }
}
