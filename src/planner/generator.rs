//! 计划生成适配器
//!
//! 一次请求 + 硬超时 + 严格校验；校验失败时把错误列表作为纠正反馈，恰好再请求一次。
//! 第二次仍失败（或超时、服务不可用）就返回错误，由 Dispatcher 走降级路径。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::context::PromptContext;
use crate::core::{OrchestratorError, RecoveryAction, RecoveryEngine, RecoveryStage};
use crate::planner::{parser, schema, Plan};
use crate::services::ServiceDirectory;
use crate::tools::{ToolDescriptor, ToolRegistry};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error("plan rejected: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("plan service timed out")]
    Timeout,
    #[error("plan service unavailable: {0}")]
    Unavailable(String),
}

impl From<PlanError> for OrchestratorError {
    fn from(e: PlanError) -> Self {
        match e {
            PlanError::Validation(errors) => OrchestratorError::Validation(errors.join("; ")),
            PlanError::Timeout => OrchestratorError::Timeout("plan generation".to_string()),
            PlanError::Unavailable(reason) => OrchestratorError::unavailable("planner", reason),
        }
    }
}

/// 发给计划服务的请求体
#[derive(Debug, Clone, Serialize)]
pub struct PlanRequest {
    pub prompt: String,
    pub catalogue: Vec<ToolDescriptor>,
    pub schema: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// 计划服务的回复：文本（待严格解析）或已经是 JSON 对象
#[derive(Debug, Clone, PartialEq)]
pub enum PlanReply {
    Text(String),
    Object(Value),
}

#[async_trait]
pub trait PlanService: Send + Sync {
    async fn request_plan(&self, request: &PlanRequest) -> Result<PlanReply, OrchestratorError>;
}

/// 经服务目录调用：POST {planner}/generate → {text} 或计划对象
pub struct ServicePlanService {
    directory: Arc<ServiceDirectory>,
    service: String,
    timeout: Duration,
}

impl ServicePlanService {
    pub fn new(directory: Arc<ServiceDirectory>, service: impl Into<String>, timeout: Duration) -> Self {
        Self {
            directory,
            service: service.into(),
            timeout,
        }
    }
}

#[async_trait]
impl PlanService for ServicePlanService {
    async fn request_plan(&self, request: &PlanRequest) -> Result<PlanReply, OrchestratorError> {
        let payload = serde_json::to_value(request)
            .map_err(|e| OrchestratorError::Validation(format!("unserializable plan request: {e}")))?;
        let reply = self
            .directory
            .call(&self.service, "/generate", &payload, self.timeout)
            .await?;
        Ok(match reply.get("text").and_then(Value::as_str) {
            Some(text) => PlanReply::Text(text.to_string()),
            None => PlanReply::Object(reply),
        })
    }
}

/// 按顺序返回预先写好的回复（测试与离线演示）
#[derive(Default)]
pub struct ScriptedPlanService {
    replies: Mutex<VecDeque<Result<PlanReply, OrchestratorError>>>,
    requests: Mutex<Vec<PlanRequest>>,
}

impl ScriptedPlanService {
    pub fn new(replies: impl IntoIterator<Item = Result<PlanReply, OrchestratorError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn text(replies: impl IntoIterator<Item = &'static str>) -> Self {
        Self::new(replies.into_iter().map(|t| Ok(PlanReply::Text(t.to_string()))))
    }

    /// 已收到的请求
    pub fn requests(&self) -> Vec<PlanRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl PlanService for ScriptedPlanService {
    async fn request_plan(&self, request: &PlanRequest) -> Result<PlanReply, OrchestratorError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let next = self.replies.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        match next {
            Some(reply) => reply,
            None => Err(OrchestratorError::unavailable("planner", "no scripted reply left")),
        }
    }
}

pub struct PlanGenerator {
    service: Arc<dyn PlanService>,
    registry: Arc<ToolRegistry>,
    recovery: RecoveryEngine,
    timeout: Duration,
    max_steps: usize,
}

impl PlanGenerator {
    pub fn new(service: Arc<dyn PlanService>, registry: Arc<ToolRegistry>, timeout: Duration, max_steps: usize) -> Self {
        Self {
            service,
            registry,
            recovery: RecoveryEngine::new(),
            timeout,
            max_steps,
        }
    }

    pub async fn generate(&self, ctx: &PromptContext) -> Result<Plan, PlanError> {
        let mut request = PlanRequest {
            prompt: ctx.render_prompt(),
            catalogue: ctx.catalogue.clone(),
            schema: schema::plan_schema(),
            feedback: None,
        };

        let errors = match self.attempt(&request).await {
            Err(PlanError::Validation(errors)) => errors,
            other => return other,
        };

        let err = OrchestratorError::Validation(errors.join("; "));
        let RecoveryAction::RepairPlan(feedback) = self
            .recovery
            .handle(&err, RecoveryStage::Planning { repair_attempted: false })
        else {
            return Err(PlanError::Validation(errors));
        };
        tracing::warn!(
            interaction_id = %ctx.interaction_id,
            errors = errors.len(),
            "plan rejected, requesting one repair"
        );
        request.feedback = Some(feedback);

        let repaired = self.attempt(&request).await;
        if let Err(e) = &repaired {
            tracing::warn!(interaction_id = %ctx.interaction_id, error = %e, "repaired plan still unusable");
        }
        repaired
    }

    async fn attempt(&self, request: &PlanRequest) -> Result<Plan, PlanError> {
        let reply = match tokio::time::timeout(self.timeout, self.service.request_plan(request)).await {
            Err(_) | Ok(Err(OrchestratorError::Timeout(_))) => return Err(PlanError::Timeout),
            Ok(Err(e)) => return Err(PlanError::Unavailable(e.to_string())),
            Ok(Ok(reply)) => reply,
        };
        let text = match reply {
            PlanReply::Text(text) => text,
            PlanReply::Object(value) => value.to_string(),
        };
        parser::parse_plan(&text, &self.registry, self.max_steps).map_err(PlanError::Validation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OrchestratorError;
    use crate::security::RiskTier;
    use crate::tools::{ArgSchema, ToolHandler, ToolSpec};

    struct Nop;

    #[async_trait]
    impl ToolHandler for Nop {
        async fn invoke(&self, _: &Value, _: Duration) -> Result<Value, OrchestratorError> {
            Ok(Value::Null)
        }
    }

    struct Slow;

    #[async_trait]
    impl PlanService for Slow {
        async fn request_plan(&self, _: &PlanRequest) -> Result<PlanReply, OrchestratorError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(PlanReply::Text(String::new()))
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut reg = ToolRegistry::new();
        reg.register(ToolSpec::new("get_system_info", "info", RiskTier::Safe, ArgSchema::new(), Arc::new(Nop)));
        Arc::new(reg)
    }

    fn ctx() -> PromptContext {
        PromptContext {
            interaction_id: "i1".into(),
            user_id: "u1".into(),
            session_id: "s1".into(),
            request: "how is my machine doing".into(),
            turns: Vec::new(),
            snippets: Vec::new(),
            grants: Vec::new(),
            recent_audit: Vec::new(),
            catalogue: registry().catalogue(),
        }
    }

    const GOOD: &str = r#"{"tool_calls": [{"tool_name": "get_system_info"}]}"#;
    const BAD: &str = r#"{"tool_calls": [{"tool_name": "format_disk"}]}"#;

    #[tokio::test]
    async fn test_first_reply_valid() {
        let svc = Arc::new(ScriptedPlanService::text([GOOD]));
        let gen = PlanGenerator::new(svc.clone(), registry(), Duration::from_secs(1), 20);
        let plan = gen.generate(&ctx()).await.unwrap();
        assert_eq!(plan.tool_names(), vec!["get_system_info"]);
        let reqs = svc.requests();
        assert_eq!(reqs.len(), 1);
        assert!(reqs[0].feedback.is_none());
        assert!(reqs[0].prompt.contains("how is my machine doing"));
    }

    #[tokio::test]
    async fn test_one_repair_with_feedback() {
        let svc = Arc::new(ScriptedPlanService::text([BAD, GOOD]));
        let gen = PlanGenerator::new(svc.clone(), registry(), Duration::from_secs(1), 20);
        assert!(gen.generate(&ctx()).await.is_ok());
        let reqs = svc.requests();
        assert_eq!(reqs.len(), 2);
        assert!(reqs[1].feedback.as_deref().unwrap().contains("format_disk"));
    }

    #[tokio::test]
    async fn test_second_failure_gives_up() {
        let svc = Arc::new(ScriptedPlanService::text([BAD, BAD, GOOD]));
        let gen = PlanGenerator::new(svc.clone(), registry(), Duration::from_secs(1), 20);
        assert!(matches!(gen.generate(&ctx()).await, Err(PlanError::Validation(_))));
        assert_eq!(svc.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_object_reply_accepted() {
        let svc = Arc::new(ScriptedPlanService::new([Ok(PlanReply::Object(
            serde_json::json!({"tool_calls": [{"tool_name": "get_system_info"}]}),
        ))]));
        let gen = PlanGenerator::new(svc, registry(), Duration::from_secs(1), 20);
        assert_eq!(gen.generate(&ctx()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_and_unavailable_not_repaired() {
        let gen = PlanGenerator::new(Arc::new(Slow), registry(), Duration::from_millis(20), 20);
        assert_eq!(gen.generate(&ctx()).await.unwrap_err(), PlanError::Timeout);

        let svc = Arc::new(ScriptedPlanService::new([Err(OrchestratorError::unavailable(
            "planner",
            "circuit open",
        ))]));
        let gen = PlanGenerator::new(svc.clone(), registry(), Duration::from_secs(1), 20);
        assert!(matches!(gen.generate(&ctx()).await, Err(PlanError::Unavailable(_))));
        assert_eq!(svc.requests().len(), 1);
        let e: OrchestratorError = PlanError::Timeout.into();
        assert!(matches!(e, OrchestratorError::Timeout(_)));
    }
}
