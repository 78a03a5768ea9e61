//! 工具执行器
//!
//! 按声明顺序逐步执行计划：模板替换 → 再次校验 → 权限闸门 → 在超时内调用工具。
//! 每一步恰好产生一个 ToolResult、一条执行审计、一个 tool_executed 事件，
//! 并输出一行结构化 JSON 审计日志（tool_audit）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEntry, AuditLog, AuditScope};
use crate::bus::{EventKind, PerceptionBus, PerceptionEvent};
use crate::core::OrchestratorError;
use crate::planner::{Plan, ToolCall};
use crate::security::{PermissionDecision, PermissionGate, RiskTier};
use crate::tools::template;
use crate::tools::{ToolRegistry, ToolResult, ToolStatus};

/// 一次执行的归属与取消信号
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub user_id: String,
    pub interaction_id: String,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(user_id: impl Into<String>, interaction_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            interaction_id: interaction_id.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// 单步结果 + 审计需要的风险等级与闸门决策
struct StepOutcome {
    result: ToolResult,
    risk_tier: RiskTier,
    decision: Option<PermissionDecision>,
}

impl StepOutcome {
    fn early(step: &ToolCall, status: ToolStatus, msg: impl Into<String>, tier: RiskTier, started: Instant) -> Self {
        Self {
            result: ToolResult::failed(&step.step_id, &step.tool_name, status, msg, started.elapsed()),
            risk_tier: tier,
            decision: None,
        }
    }
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    gate: Arc<PermissionGate>,
    audit: Arc<AuditLog>,
    bus: PerceptionBus,
    default_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        gate: Arc<PermissionGate>,
        audit: Arc<AuditLog>,
        bus: PerceptionBus,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            gate,
            audit,
            bus,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 执行整个计划；只有致命错误（审计不可写）以 Err 返回，其余都体现在 ToolResult 里
    pub async fn execute(&self, plan: &Plan, ctx: &ExecutionContext) -> Result<Vec<ToolResult>, OrchestratorError> {
        let mut results = Vec::with_capacity(plan.steps.len());
        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut halted_by: Option<String> = None;

        for step in &plan.steps {
            let scope = AuditScope::user(&ctx.user_id)
                .with_interaction(&ctx.interaction_id)
                .with_step(&step.step_id);

            let outcome = self.run_step(step, &scope, ctx, &outputs, halted_by.as_deref()).await?;
            self.record(&scope, &outcome).await?;

            let result = outcome.result;
            match result.status {
                ToolStatus::Ok => {
                    outputs.insert(result.step_id.clone(), result.output.clone());
                }
                ToolStatus::Error | ToolStatus::Denied | ToolStatus::Timeout
                    if step.required_for_continuation && halted_by.is_none() =>
                {
                    tracing::warn!(step_id = %step.step_id, status = result.status.as_str(), "required step failed, skipping the rest");
                    halted_by = Some(step.step_id.clone());
                }
                _ => {}
            }
            results.push(result);
        }
        Ok(results)
    }

    async fn run_step(
        &self,
        step: &ToolCall,
        scope: &AuditScope,
        ctx: &ExecutionContext,
        outputs: &HashMap<String, Value>,
        halted_by: Option<&str>,
    ) -> Result<StepOutcome, OrchestratorError> {
        let started = Instant::now();

        let spec = self.registry.get(&step.tool_name);
        // 未注册的动作按 medium 记审计
        let tier = spec.as_ref().map(|s| s.risk_tier).unwrap_or(RiskTier::Medium);

        if ctx.cancel.is_cancelled() {
            return Ok(StepOutcome::early(step, ToolStatus::Cancelled, "interaction cancelled", tier, started));
        }
        if let Some(prev) = halted_by {
            return Ok(StepOutcome::early(step, ToolStatus::Skipped, format!("required step '{prev}' failed"), tier, started));
        }
        let Some(spec) = spec else {
            let msg = format!("unknown tool '{}'", step.tool_name);
            return Ok(StepOutcome::early(step, ToolStatus::Error, msg, tier, started));
        };

        let arguments = match template::resolve(&step.arguments, outputs) {
            Ok(args) => args,
            Err(e) => return Ok(StepOutcome::early(step, ToolStatus::Error, e, tier, started)),
        };
        if let Err(errors) = spec.schema.validate(&arguments) {
            return Ok(StepOutcome::early(step, ToolStatus::Error, errors.join("; "), tier, started));
        }

        let decision = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return Ok(StepOutcome::early(step, ToolStatus::Cancelled, "interaction cancelled", tier, started));
            }
            d = self.gate.evaluate(scope, &step.tool_name, tier, &arguments) => d?,
        };
        if !decision.is_allowed() {
            return Ok(StepOutcome {
                result: ToolResult::failed(
                    &step.step_id,
                    &step.tool_name,
                    ToolStatus::Denied,
                    decision.reason.clone(),
                    started.elapsed(),
                ),
                risk_tier: decision.risk_tier,
                decision: Some(decision),
            });
        }

        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        let invoked = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            r = tokio::time::timeout(timeout, spec.handler.invoke(&arguments, timeout)) => Some(r),
        };

        let elapsed = started.elapsed();
        let result = match invoked {
            None => ToolResult::failed(&step.step_id, &step.tool_name, ToolStatus::Cancelled, "interaction cancelled", elapsed),
            Some(Err(_)) => ToolResult::failed(
                &step.step_id,
                &step.tool_name,
                ToolStatus::Timeout,
                format!("no reply within {}s", timeout.as_secs_f32()),
                elapsed,
            ),
            Some(Ok(Ok(output))) => ToolResult::ok(&step.step_id, &step.tool_name, output, elapsed),
            Some(Ok(Err(e))) => {
                let status = match e {
                    OrchestratorError::Timeout(_) => ToolStatus::Timeout,
                    OrchestratorError::Cancelled => ToolStatus::Cancelled,
                    _ => ToolStatus::Error,
                };
                ToolResult::failed(&step.step_id, &step.tool_name, status, e.to_string(), elapsed)
            }
        };
        Ok(StepOutcome {
            result,
            risk_tier: decision.risk_tier,
            decision: Some(decision),
        })
    }

    /// 执行审计 + tool_audit 日志 + tool_executed 事件
    async fn record(&self, scope: &AuditScope, outcome: &StepOutcome) -> Result<(), OrchestratorError> {
        let result = &outcome.result;
        self.audit.append(AuditEntry::for_execution(
            scope,
            result,
            outcome.risk_tier,
            outcome.decision.as_ref(),
        ))?;

        let audit = serde_json::json!({
            "event": "tool_audit",
            "interaction_id": scope.interaction_id,
            "step_id": result.step_id,
            "tool": result.tool_name,
            "ok": result.is_ok(),
            "outcome": result.status.as_str(),
            "duration_ms": result.duration_ms,
            "error_preview": result.error_message.as_deref().map(preview),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        self.bus
            .publish(PerceptionEvent::new(
                EventKind::ToolExecuted,
                "executor",
                serde_json::json!({
                    "interaction_id": scope.interaction_id,
                    "step_id": result.step_id,
                    "tool": result.tool_name,
                    "status": result.status,
                    "duration_ms": result.duration_ms,
                }),
            ))
            .await;
        Ok(())
    }
}

fn preview(s: &str) -> String {
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditKind, MemorySink};
    use crate::config::PermissionsSection;
    use crate::security::{AutoConfirm, DenyPolicy, GrantStore};
    use crate::tools::registry::{ToolHandler, ToolSpec};
    use crate::tools::schema::{ArgSchema, ArgType};
    use async_trait::async_trait;
    use serde_json::json;

    /// 回显参数，或按名字模拟失败 / 卡住
    struct Fake {
        mode: &'static str,
    }

    #[async_trait]
    impl ToolHandler for Fake {
        async fn invoke(&self, arguments: &Value, _: Duration) -> Result<Value, OrchestratorError> {
            match self.mode {
                "fail" => Err(OrchestratorError::ToolFailed("boom".into())),
                "hang" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Value::Null)
                }
                _ => Ok(json!({ "echo": arguments })),
            }
        }
    }

    fn spec(name: &str, tier: RiskTier, mode: &'static str) -> ToolSpec {
        ToolSpec::new(
            name,
            name,
            tier,
            ArgSchema::new().optional("text", ArgType::String, "text"),
            Arc::new(Fake { mode }),
        )
    }

    struct Harness {
        executor: ToolExecutor,
        audit: Arc<AuditLog>,
        sink: Arc<MemorySink>,
        bus: PerceptionBus,
    }

    fn harness() -> Harness {
        let mut reg = ToolRegistry::new();
        reg.register(spec("echo", RiskTier::Safe, "ok"));
        reg.register(spec("notify", RiskTier::Low, "ok"));
        reg.register(spec("broken", RiskTier::Safe, "fail"));
        reg.register(spec("wipe", RiskTier::Critical, "ok"));
        reg.register(spec("slow", RiskTier::Safe, "hang").with_timeout(Duration::from_millis(30)));

        let sink = Arc::new(MemorySink::new());
        let audit = Arc::new(AuditLog::new(sink.clone(), 100));
        let gate = Arc::new(PermissionGate::new(
            DenyPolicy::from_config(&PermissionsSection::default()).unwrap(),
            audit.clone(),
            Arc::new(AutoConfirm),
            Arc::new(GrantStore::new()),
            Duration::from_millis(50),
        ));
        let bus = PerceptionBus::default();
        let executor = ToolExecutor::new(Arc::new(reg), gate, audit.clone(), bus.clone(), Duration::from_secs(1));
        Harness {
            executor,
            audit,
            sink,
            bus,
        }
    }

    fn execution_entries(audit: &AuditLog) -> usize {
        audit
            .recent(100)
            .iter()
            .filter(|e| e.kind == AuditKind::Execution)
            .count()
    }

    #[tokio::test]
    async fn test_chained_output_substitution() {
        let h = harness();
        let plan = Plan::new(vec![
            ToolCall::new("a", "echo", json!({"text": "hello"})),
            ToolCall::new("b", "echo", json!({"text": "got {{steps.a.output.echo.text}}"})),
        ]);
        let results = h.executor.execute(&plan, &ExecutionContext::new("u1", "i1")).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(ToolResult::is_ok));
        assert_eq!(results[1].output["echo"]["text"], "got hello");
        assert_eq!(execution_entries(&h.audit), 2);
        assert_eq!(h.bus.history_of(EventKind::ToolExecuted, 10).len(), 2);
    }

    #[tokio::test]
    async fn test_one_result_per_step_with_mixed_outcomes() {
        let h = harness();
        let plan = Plan::new(vec![
            ToolCall::new("s1", "ghost", json!({})),
            ToolCall::new("s2", "wipe", json!({})),
            ToolCall::new("s3", "broken", json!({})),
            ToolCall::new("s4", "slow", json!({})),
            ToolCall::new("s5", "notify", json!({"text": "done"})),
        ]);
        let results = h.executor.execute(&plan, &ExecutionContext::new("u1", "i1")).await.unwrap();
        let statuses: Vec<ToolStatus> = results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ToolStatus::Error,
                ToolStatus::Denied,
                ToolStatus::Error,
                ToolStatus::Timeout,
                ToolStatus::Ok
            ]
        );
        assert_eq!(execution_entries(&h.audit), 5);
    }

    #[tokio::test]
    async fn test_required_failure_skips_rest() {
        let h = harness();
        let plan = Plan::new(vec![
            ToolCall::new("s1", "broken", json!({})).required(),
            ToolCall::new("s2", "echo", json!({})),
            ToolCall::new("s3", "echo", json!({})),
        ]);
        let results = h.executor.execute(&plan, &ExecutionContext::new("u1", "i1")).await.unwrap();
        assert_eq!(results[0].status, ToolStatus::Error);
        assert_eq!(results[1].status, ToolStatus::Skipped);
        assert_eq!(results[2].status, ToolStatus::Skipped);
        assert_eq!(execution_entries(&h.audit), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = harness();
        let ctx = ExecutionContext::new("u1", "i1");
        ctx.cancel.cancel();
        let plan = Plan::new(vec![ToolCall::new("s1", "echo", json!({})), ToolCall::new("s2", "slow", json!({}))]);
        let results = h.executor.execute(&plan, &ctx).await.unwrap();
        assert!(results.iter().all(|r| r.status == ToolStatus::Cancelled));
        assert_eq!(execution_entries(&h.audit), 2);
    }

    #[tokio::test]
    async fn test_cancel_in_flight() {
        let mut reg = ToolRegistry::new();
        reg.register(spec("stuck", RiskTier::Safe, "hang"));
        reg.register(spec("echo", RiskTier::Safe, "ok"));
        let h = harness();
        let executor = ToolExecutor::new(
            Arc::new(reg),
            h.executor.gate.clone(),
            h.audit.clone(),
            h.bus.clone(),
            Duration::from_secs(3600),
        );
        let ctx = ExecutionContext::new("u1", "i1");
        let token = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let plan = Plan::new(vec![ToolCall::new("s1", "stuck", json!({})), ToolCall::new("s2", "echo", json!({}))]);
        let results = executor.execute(&plan, &ctx).await.unwrap();
        assert_eq!(results[0].status, ToolStatus::Cancelled);
        assert_eq!(results[1].status, ToolStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unwritable_audit_is_fatal() {
        let h = harness();
        h.sink.set_failing(true);
        let plan = Plan::new(vec![ToolCall::new("s1", "echo", json!({}))]);
        let err = h
            .executor
            .execute(&plan, &ExecutionContext::new("u1", "i1"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
