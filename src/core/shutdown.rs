//! 优雅关闭
//!
//! 监听 Ctrl+C / SIGTERM，取消根令牌（会话与健康检查都挂在它下面），再执行调用方给的清理。

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C、quit 命令或 stdin 结束
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 审计不可写等致命错误
    FatalError(String),
}

/// 关闭信号管理器
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 关闭令牌；健康检查与会话根令牌都挂在它下面
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 幂等：只有第一次调用会记录原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if !self.token.is_cancelled() {
            tracing::info!(?reason, "shutdown requested");
            self.token.cancel();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

/// 运行主应用直到其结束或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F, Fut>(
    manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => tracing::info!("application finished"),
        _ = manager.wait_for_shutdown() => tracing::info!("shutdown signal received"),
    }

    cleanup().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_cancels_token_once() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        manager.shutdown(ShutdownReason::FatalError("audit".into()));
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(token.is_cancelled());
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_cleanup_runs_after_app_finishes() {
        let manager = Arc::new(ShutdownManager::new());
        let token = manager.token();
        run_with_graceful_shutdown(manager, async {}, move || async move {
            token.cancel();
        })
        .await;
    }
}
