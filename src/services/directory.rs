//! 服务目录：命名端点 + 每端点熔断 + 有界指数退避重试
//!
//! 熔断状态放在每个端点自己的 std Mutex 里，只在同步代码段内持有，从不跨 await，
//! 也从不同时锁住两个端点：一个慢服务不会拖住对其它服务的调用。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::config::ServicesSection;
use crate::core::OrchestratorError;
use crate::services::breaker::{CircuitBreaker, CircuitState, Permit};
use crate::services::transport::{ServiceTransport, TransportError};

/// 重试策略：第 n 次重试前等待 base × factor^(n-1)
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: u32,
    /// 含首次调用
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base.saturating_mul(self.factor.max(1).saturating_pow(exp))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            factor: 2,
            max_attempts: 3,
        }
    }
}

/// 端点只读快照
#[derive(Debug, Clone, Serialize)]
pub struct ServiceEndpoint {
    pub name: String,
    pub address: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub last_healthy: Option<bool>,
}

#[derive(Debug)]
struct EndpointState {
    breaker: CircuitBreaker,
    last_check: Option<DateTime<Utc>>,
    last_healthy: Option<bool>,
}

#[derive(Debug)]
struct Endpoint {
    name: String,
    address: String,
    state: Mutex<EndpointState>,
}

impl Endpoint {
    fn lock(&self) -> std::sync::MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn url(&self, path: &str) -> String {
        let base = self.address.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }
}

pub struct ServiceDirectory {
    endpoints: HashMap<String, Arc<Endpoint>>,
    transport: Arc<dyn ServiceTransport>,
    retry: RetryPolicy,
}

impl ServiceDirectory {
    pub fn new(
        endpoints: impl IntoIterator<Item = (String, String)>,
        failure_threshold: u32,
        cooldown: Duration,
        retry: RetryPolicy,
        transport: Arc<dyn ServiceTransport>,
    ) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|(name, address)| {
                let ep = Endpoint {
                    name: name.clone(),
                    address,
                    state: Mutex::new(EndpointState {
                        breaker: CircuitBreaker::new(failure_threshold, cooldown),
                        last_check: None,
                        last_healthy: None,
                    }),
                };
                (name, Arc::new(ep))
            })
            .collect();
        Self {
            endpoints,
            transport,
            retry,
        }
    }

    pub fn from_config(cfg: &ServicesSection, transport: Arc<dyn ServiceTransport>) -> Self {
        let retry = RetryPolicy {
            base: cfg.retry_base(),
            factor: cfg.retry_factor,
            max_attempts: cfg.retry_max_attempts,
        };
        Self::new(
            cfg.endpoints.clone(),
            cfg.failure_threshold,
            cfg.cooldown(),
            retry,
            transport,
        )
    }

    pub fn contains(&self, service: &str) -> bool {
        self.endpoints.contains_key(service)
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints.keys().cloned().collect();
        names.sort();
        names
    }

    /// 调用 `{address}{path}`，payload 以 JSON POST 发送
    ///
    /// 熔断打开时立即返回 ServiceUnavailable，不做任何网络 I/O。
    /// 仅在 closed 状态下重试瞬时故障；半开试探只尝试一次。
    pub async fn call(
        &self,
        service: &str,
        path: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<Value, OrchestratorError> {
        let endpoint = self
            .endpoints
            .get(service)
            .ok_or_else(|| OrchestratorError::unavailable(service, "unknown service"))?;

        let permit = {
            let mut st = endpoint.lock();
            st.breaker.try_acquire(Instant::now())
        };
        let permit = match permit {
            Ok(p) => p,
            Err(retry_in) => {
                tracing::debug!(service, ?retry_in, "circuit open, call rejected");
                return Err(OrchestratorError::unavailable(service, "circuit open"));
            }
        };

        let url = endpoint.url(path);
        let max_attempts = match permit {
            Permit::Normal => self.retry.max_attempts.max(1),
            Permit::Trial => 1,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(timeout, self.transport.post(&url, payload, timeout)).await {
                Ok(r) => r,
                Err(_) => Err(TransportError::Timeout),
            };

            match outcome {
                Ok(value) => {
                    endpoint.lock().breaker.record_success();
                    return Ok(value);
                }
                Err(e) if !e.is_failure() => {
                    // 服务在线，只是拒绝了这个请求
                    endpoint.lock().breaker.record_success();
                    return Err(OrchestratorError::unavailable(service, e.to_string()));
                }
                Err(e) => {
                    let still_closed = endpoint.lock().breaker.state() == CircuitState::Closed;
                    if e.is_retryable() && attempt < max_attempts && still_closed {
                        let wait = self.retry.backoff(attempt);
                        tracing::debug!(service, attempt, ?wait, error = %e, "retrying service call");
                        tokio::time::sleep(wait).await;
                        continue;
                    }

                    let state = {
                        let mut st = endpoint.lock();
                        st.breaker.record_failure(Instant::now());
                        st.breaker.state()
                    };
                    tracing::warn!(service, attempt, ?state, error = %e, "service call failed");
                    return Err(match e {
                        TransportError::Timeout => {
                            OrchestratorError::Timeout(format!("{service}{path}"))
                        }
                        other => OrchestratorError::unavailable(service, other.to_string()),
                    });
                }
            }
        }
    }

    /// 健康检查（不经过熔断器，也不重试），并据结果提前打开/关闭熔断
    pub(crate) async fn check_health(&self, service: &str, timeout: Duration) -> Option<bool> {
        let endpoint = self.endpoints.get(service)?;
        let url = endpoint.url("/health");
        let healthy = match tokio::time::timeout(timeout, self.transport.get_health(&url, timeout)).await {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => {
                tracing::debug!(service, error = %e, "health check failed");
                false
            }
            Err(_) => false,
        };

        let mut st = endpoint.lock();
        st.last_check = Some(Utc::now());
        st.last_healthy = Some(healthy);
        if healthy {
            st.breaker.force_close();
        } else {
            st.breaker.force_open(Instant::now());
        }
        Some(healthy)
    }

    pub fn snapshot(&self) -> Vec<ServiceEndpoint> {
        let mut out: Vec<ServiceEndpoint> = self
            .endpoints
            .values()
            .map(|ep| {
                let st = ep.lock();
                ServiceEndpoint {
                    name: ep.name.clone(),
                    address: ep.address.clone(),
                    state: st.breaker.state(),
                    consecutive_failures: st.breaker.consecutive_failures(),
                    last_check: st.last_check,
                    last_healthy: st.last_healthy,
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn endpoint(&self, service: &str) -> Option<ServiceEndpoint> {
        self.snapshot().into_iter().find(|e| e.name == service)
    }
}
