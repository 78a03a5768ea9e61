//! 可观测性：tracing 订阅器与感知事件日志

use tokio::task::JoinHandle;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::bus::{EventFilter, EventKind, PerceptionBus};

/// RUST_LOG 未设置或无法解析时默认 info
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

/// 把总线上的每个事件写成一行日志
pub fn spawn_event_logger(bus: &PerceptionBus) -> JoinHandle<()> {
    bus.spawn_listener("event-logger", EventFilter::all(), |event| match event.kind {
        EventKind::ErrorRaised | EventKind::FallbackUsed => tracing::warn!(
            kind = event.kind.as_str(),
            source = %event.source,
            payload = %event.payload,
            "perception event"
        ),
        _ => tracing::debug!(
            kind = event.kind.as_str(),
            source = %event.source,
            payload = %event.payload,
            "perception event"
        ),
    })
}
