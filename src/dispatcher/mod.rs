//! Dispatcher：交互信封、启发式降级、回复生成与状态机驱动

#[allow(clippy::module_inception)]
pub mod dispatcher;
pub mod envelope;
pub mod heuristic;
pub mod responder;

pub use dispatcher::{Dispatcher, InteractionOutcome};
pub use envelope::{InteractionEnvelope, Source};
pub use heuristic::{fallback, Fallback, DEGRADED_MESSAGE};
pub use responder::{Responder, TemplateResponder};
