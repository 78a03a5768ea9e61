//! 出站传输：ServiceTransport trait 与基于 reqwest 的 HTTP 实现

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    /// 5xx
    #[error("server error (HTTP {status}): {body}")]
    Server { status: u16, body: String },

    /// 4xx：服务在线但拒绝了请求
    #[error("request rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid response body: {0}")]
    Decode(String),
}

impl TransportError {
    /// 是否计入熔断失败
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }

    /// 是否允许重试（仅限瞬时故障）
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout | Self::Server { .. })
    }
}

/// 服务传输层：POST JSON 与健康检查
#[async_trait]
pub trait ServiceTransport: Send + Sync {
    async fn post(&self, url: &str, payload: &Value, timeout: Duration)
        -> Result<Value, TransportError>;

    /// GET 健康检查；200 视为健康
    async fn get_health(&self, url: &str, timeout: Duration) -> Result<bool, TransportError>;
}

/// reqwest HTTP 传输
#[derive(Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

fn map_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_decode() {
        TransportError::Decode(e.to_string())
    } else {
        TransportError::Connect(e.to_string())
    }
}

#[async_trait]
impl ServiceTransport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let resp = self
            .client
            .post(url)
            .timeout(timeout)
            .json(payload)
            .send()
            .await
            .map_err(map_reqwest)?;

        let status = resp.status();
        if status.is_server_error() || status.is_client_error() {
            let body = resp.text().await.unwrap_or_default();
            let code = status.as_u16();
            return Err(if status.is_server_error() {
                TransportError::Server { status: code, body }
            } else {
                TransportError::Rejected { status: code, body }
            });
        }

        resp.json::<Value>().await.map_err(map_reqwest)
    }

    async fn get_health(&self, url: &str, timeout: Duration) -> Result<bool, TransportError> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_reqwest)?;
        Ok(resp.status() == reqwest::StatusCode::OK)
    }
}
