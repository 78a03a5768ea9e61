//! 感知总线：组件之间唯一的横向通道

#[allow(clippy::module_inception)]
pub mod bus;
pub mod event;

pub use bus::{BackpressurePolicy, PerceptionBus, Subscription};
pub use event::{EventFilter, EventKind, PerceptionEvent};
