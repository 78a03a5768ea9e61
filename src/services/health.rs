//! 后台健康检查：固定间隔并发 GET /health，与用户流量无关

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::services::ServiceDirectory;

pub struct HealthChecker {
    directory: Arc<ServiceDirectory>,
    interval: Duration,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(directory: Arc<ServiceDirectory>, interval: Duration, timeout: Duration) -> Self {
        Self {
            directory,
            interval,
            timeout,
        }
    }

    /// 检查所有端点一次，返回 (服务名, 是否健康)
    pub async fn check_once(&self) -> Vec<(String, bool)> {
        let names = self.directory.service_names();
        let checks = names.iter().map(|name| async move {
            let healthy = self
                .directory
                .check_health(name, self.timeout)
                .await
                .unwrap_or(false);
            (name.clone(), healthy)
        });
        let results = join_all(checks).await;
        let unhealthy = results.iter().filter(|(_, ok)| !ok).count();
        if unhealthy > 0 {
            tracing::warn!(unhealthy, total = results.len(), "health check found unhealthy services");
        } else {
            tracing::debug!(total = results.len(), "health check ok");
        }
        results
    }

    /// 在后台运行，直到 token 被取消
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("health checker stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.check_once().await;
                    }
                }
            }
        })
    }
}
