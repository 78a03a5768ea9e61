//! 熔断器状态机
//!
//! closed →（连续 F 次失败）→ open →（冷却 T）→ half_open →（唯一一次试探）→ closed / open。
//! 纯状态机：时间由调用方传入，便于测试；锁由 ServiceDirectory 的每端点 Mutex 负责。

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// 正常放行
    Closed,
    /// 拒绝所有调用，等待冷却
    Open,
    /// 允许一次试探调用
    HalfOpen,
}

/// 放行凭证
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// 正常调用（closed），允许重试
    Normal,
    /// 半开试探，只能尝试一次
    Trial,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// 半开试探开始时间；试探被取消时超过冷却期可再次试探
    trial_started: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// 请求放行；被拒绝时返回距离可试探还剩多久
    pub fn try_acquire(&mut self, now: Instant) -> Result<Permit, Duration> {
        match self.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.cooldown {
                    self.state = CircuitState::HalfOpen;
                    self.trial_started = Some(now);
                    Ok(Permit::Trial)
                } else {
                    Err(self.cooldown - elapsed)
                }
            }
            CircuitState::HalfOpen => {
                let stale = self
                    .trial_started
                    .map(|t| now.saturating_duration_since(t) >= self.cooldown)
                    .unwrap_or(true);
                if stale {
                    self.trial_started = Some(now);
                    Ok(Permit::Trial)
                } else {
                    Err(Duration::ZERO)
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        if self.state != CircuitState::Closed {
            tracing::info!(from = ?self.state, "circuit closed");
        }
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.trial_started = None;
    }

    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.threshold {
                    self.trip(now);
                }
            }
            // 试探失败：重新打开并重置冷却计时
            CircuitState::HalfOpen => self.trip(now),
            // 打开前发出的调用晚到的失败
            CircuitState::Open => {}
        }
    }

    /// 健康检查判定不健康时提前打开
    pub fn force_open(&mut self, now: Instant) {
        if self.state != CircuitState::Open {
            self.trip(now);
        }
    }

    /// 健康检查判定健康时关闭
    pub fn force_close(&mut self) {
        if self.state != CircuitState::Closed {
            tracing::info!(from = ?self.state, "circuit closed by health check");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_started = None;
    }

    fn trip(&mut self, now: Instant) {
        tracing::warn!(from = ?self.state, failures = self.consecutive_failures, "circuit opened");
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_started = None;
    }
}
