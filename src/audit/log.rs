//! 审计日志：只追加的持久化 sink + 内存最近条目（安全报告从这里计算）
//!
//! 写入 sink 失败即返回 AuditUnwritable（致命），调用方必须终止；成功写入后才更新内存视图。

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;

use crate::audit::{AuditEntry, AuditKind};
use crate::core::OrchestratorError;
use crate::security::{Decision, RiskTier};
use crate::tools::ToolStatus;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

/// 持久化后端
pub trait AuditSink: Send + Sync {
    fn append(&self, entry: &AuditEntry) -> Result<(), AuditError>;

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// JSON Lines 文件：每行一条，追加模式
pub struct JsonlFileSink {
    file: Mutex<File>,
}

impl JsonlFileSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for JsonlFileSink {
    fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        let file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.sync_data()?;
        Ok(())
    }
}

/// 内存 sink（开发与测试）；可切换为不可写以模拟磁盘故障
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<AuditEntry>>,
    failing: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for MemorySink {
    fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Unavailable("memory sink marked failing".into()));
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }
}

/// 全局安全报告（基于内存中的最近条目）
#[derive(Debug, Clone, Default, Serialize)]
pub struct SecurityReport {
    pub total_actions: u64,
    pub by_risk: BTreeMap<RiskTier, u64>,
    pub decisions_allowed: u64,
    pub decisions_denied: u64,
    /// 被拒绝或强制提升到 critical 的尝试
    pub critical_attempts: u64,
    pub success_rate: f64,
}

pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    recent: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>, capacity: usize) -> Self {
        Self {
            sink,
            recent: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// 仅内存（开发模式）
    pub fn in_memory(capacity: usize) -> Self {
        Self::new(Arc::new(MemorySink::new()), capacity)
    }

    /// 追加一条；sink 写入失败为致命错误
    pub fn append(&self, entry: AuditEntry) -> Result<(), OrchestratorError> {
        if let Err(e) = self.sink.append(&entry) {
            tracing::error!(error = %e, action = %entry.action, "audit append failed");
            return Err(OrchestratorError::AuditUnwritable(e.to_string()));
        }

        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() >= self.capacity {
            recent.pop_front();
        }
        recent.push_back(entry);
        Ok(())
    }

    pub fn flush(&self) -> Result<(), OrchestratorError> {
        self.sink
            .flush()
            .map_err(|e| OrchestratorError::AuditUnwritable(e.to_string()))
    }

    /// 最近 limit 条（时间正序）
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }

    /// 同一用户最近 limit 条执行记录（时间正序）
    pub fn recent_for_user(&self, user_id: &str, limit: usize) -> Vec<AuditEntry> {
        let recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<AuditEntry> = recent
            .iter()
            .rev()
            .filter(|e| e.kind == AuditKind::Execution && e.user_id == user_id)
            .take(limit)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    pub fn security_report(&self) -> SecurityReport {
        let recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        let mut report = SecurityReport::default();
        let mut succeeded = 0u64;

        for e in recent.iter() {
            match e.kind {
                AuditKind::Decision => {
                    match e.decision {
                        Decision::Allow => report.decisions_allowed += 1,
                        Decision::Deny => report.decisions_denied += 1,
                        Decision::RequireConfirmation => {}
                    }
                    if e.risk_tier == RiskTier::Critical {
                        report.critical_attempts += 1;
                    }
                }
                AuditKind::Execution => {
                    report.total_actions += 1;
                    *report.by_risk.entry(e.risk_tier).or_insert(0) += 1;
                    if e.status == Some(ToolStatus::Ok) {
                        succeeded += 1;
                    }
                }
            }
        }

        if report.total_actions > 0 {
            report.success_rate = succeeded as f64 / report.total_actions as f64;
        }
        report
    }
}
