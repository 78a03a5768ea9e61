//! Dispatcher：一次交互从接收到完成的状态机
//!
//! Received → ContextAssembled → PlanRequested → {PlanValid | PlanFailed} → Executing → Responding → Done。
//! 同一会话的交互经窗口锁串行化；Done 必定到达并发布一个 interaction_completed 事件。

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::bus::{EventKind, PerceptionBus, PerceptionEvent};
use crate::context::{ContextAssembler, ContextWindow};
use crate::core::{
    DispatchState, OrchestratorError, RecoveryAction, RecoveryEngine, RecoveryStage, SessionSupervisor,
    StateTrace,
};
use crate::dispatcher::heuristic::{self, Fallback};
use crate::dispatcher::{InteractionEnvelope, Responder};
use crate::planner::{Plan, PlanGenerator};
use crate::tools::{ExecutionContext, ToolExecutor, ToolResult};

/// 一次交互的完整结果
#[derive(Debug, Clone, Serialize)]
pub struct InteractionOutcome {
    pub interaction_id: String,
    pub response: String,
    pub plan: Plan,
    pub results: Vec<ToolResult>,
    pub used_fallback: bool,
    pub states: Vec<DispatchState>,
    pub latency_ms: u64,
}

struct Completed {
    response: String,
    plan: Plan,
    results: Vec<ToolResult>,
    used_fallback: bool,
}

pub struct Dispatcher {
    sessions: Arc<SessionSupervisor>,
    assembler: Arc<ContextAssembler>,
    generator: Arc<PlanGenerator>,
    executor: Arc<ToolExecutor>,
    responder: Arc<dyn Responder>,
    bus: PerceptionBus,
    recovery: RecoveryEngine,
}

impl Dispatcher {
    pub fn new(
        sessions: Arc<SessionSupervisor>,
        assembler: Arc<ContextAssembler>,
        generator: Arc<PlanGenerator>,
        executor: Arc<ToolExecutor>,
        responder: Arc<dyn Responder>,
        bus: PerceptionBus,
    ) -> Self {
        Self {
            sessions,
            assembler,
            generator,
            executor,
            responder,
            bus,
            recovery: RecoveryEngine::new(),
        }
    }

    /// 处理一次交互；只有致命错误（审计不可写）返回 Err
    pub async fn handle(&self, envelope: InteractionEnvelope) -> Result<InteractionOutcome, OrchestratorError> {
        let started = Instant::now();
        let mut trace = StateTrace::new();
        let request = envelope.request_text();

        tracing::info!(
            interaction_id = %envelope.interaction_id(),
            user_id = %envelope.user_id(),
            session_id = %envelope.session_id(),
            source = ?envelope.source(),
            "interaction received"
        );
        self.publish(
            EventKind::UserInput,
            serde_json::json!({
                "interaction_id": envelope.interaction_id(),
                "user_id": envelope.user_id(),
                "session_id": envelope.session_id(),
                "source": envelope.source(),
                "text": request,
            }),
        )
        .await;

        let session = self.sessions.session(envelope.session_id());
        let mut window = session.window.lock().await;
        let cancel = session.interaction_token();

        let outcome = self.run(&envelope, &request, &window, &cancel, &mut trace).await;

        trace.advance(DispatchState::Done);
        let latency_ms = started.elapsed().as_millis() as u64;

        let (status, result) = match outcome {
            Ok(done) => {
                window.push_user(request.clone());
                window.push_assistant(done.response.clone());
                let status = if cancel.is_cancelled() { "cancelled" } else { "completed" };
                (
                    status,
                    Ok(InteractionOutcome {
                        interaction_id: envelope.interaction_id().to_string(),
                        response: done.response,
                        plan: done.plan,
                        results: done.results,
                        used_fallback: done.used_fallback,
                        states: trace.states().to_vec(),
                        latency_ms,
                    }),
                )
            }
            Err(e) => {
                tracing::error!(interaction_id = %envelope.interaction_id(), error = %e, "interaction aborted");
                self.publish(
                    EventKind::ErrorRaised,
                    serde_json::json!({
                        "interaction_id": envelope.interaction_id(),
                        "stage": "fatal",
                        "error": e.to_string(),
                    }),
                )
                .await;
                ("aborted", Err(e))
            }
        };
        drop(window);

        tracing::info!(
            interaction_id = %envelope.interaction_id(),
            status,
            latency_ms,
            "interaction done"
        );
        self.publish(
            EventKind::InteractionCompleted,
            serde_json::json!({
                "interaction_id": envelope.interaction_id(),
                "session_id": envelope.session_id(),
                "status": status,
                "latency_ms": latency_ms,
            }),
        )
        .await;
        result
    }

    async fn run(
        &self,
        envelope: &InteractionEnvelope,
        request: &str,
        window: &ContextWindow,
        cancel: &CancellationToken,
        trace: &mut StateTrace,
    ) -> Result<Completed, OrchestratorError> {
        let ctx = self.assembler.assemble(envelope, window).await;
        trace.advance(DispatchState::ContextAssembled);

        trace.advance(DispatchState::PlanRequested);
        let generated = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
            r = self.generator.generate(&ctx) => r.map_err(OrchestratorError::from),
        };

        let (plan, used_fallback) = match generated {
            Ok(plan) => {
                trace.advance(DispatchState::PlanValid);
                self.publish(
                    EventKind::PlanProduced,
                    serde_json::json!({
                        "interaction_id": envelope.interaction_id(),
                        "origin": "planner",
                        "steps": plan.len(),
                        "tools": plan.tool_names(),
                    }),
                )
                .await;
                (plan, false)
            }
            Err(e) => {
                trace.advance(DispatchState::PlanFailed);
                tracing::warn!(interaction_id = %envelope.interaction_id(), error = %e, "planning failed");
                self.publish(
                    EventKind::ErrorRaised,
                    serde_json::json!({
                        "interaction_id": envelope.interaction_id(),
                        "stage": "planning",
                        "error": e.to_string(),
                    }),
                )
                .await;

                let action = self
                    .recovery
                    .handle(&e, RecoveryStage::Planning { repair_attempted: true });
                if action == RecoveryAction::Abort {
                    return Err(e);
                }
                if e == OrchestratorError::Cancelled {
                    trace.advance(DispatchState::Executing);
                    trace.advance(DispatchState::Responding);
                    return Ok(Completed {
                        response: "The request was cancelled.".to_string(),
                        plan: Plan::default(),
                        results: Vec::new(),
                        used_fallback: false,
                    });
                }

                let fallback = heuristic::fallback(request, self.executor.registry());
                let tools = match &fallback {
                    Fallback::Plan(plan) => plan.tool_names(),
                    Fallback::Message(_) => Vec::new(),
                };
                self.publish(
                    EventKind::FallbackUsed,
                    serde_json::json!({
                        "interaction_id": envelope.interaction_id(),
                        "reason": e.to_string(),
                        "tools": tools,
                    }),
                )
                .await;
                match fallback {
                    Fallback::Plan(plan) => (plan, true),
                    Fallback::Message(message) => {
                        trace.advance(DispatchState::Executing);
                        trace.advance(DispatchState::Responding);
                        return Ok(Completed {
                            response: message,
                            plan: Plan::default(),
                            results: Vec::new(),
                            used_fallback: true,
                        });
                    }
                }
            }
        };

        trace.advance(DispatchState::Executing);
        let exec_ctx = ExecutionContext::new(envelope.user_id(), envelope.interaction_id()).with_cancel(cancel.clone());
        let results = self.executor.execute(&plan, &exec_ctx).await?;

        trace.advance(DispatchState::Responding);
        let response = self.responder.respond(request, &plan, &results).await;

        Ok(Completed {
            response,
            plan,
            results,
            used_fallback,
        })
    }

    async fn publish(&self, kind: EventKind, payload: serde_json::Value) {
        self.bus.publish(PerceptionEvent::new(kind, "dispatcher", payload)).await;
    }
}
