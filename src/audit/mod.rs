//! 审计日志：每一次尝试与执行的动作都有据可查

pub mod entry;
pub mod log;

pub use entry::{AuditEntry, AuditKind, AuditScope};
pub use log::{AuditError, AuditLog, AuditSink, JsonlFileSink, MemorySink, SecurityReport};
