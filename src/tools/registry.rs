//! 工具注册表
//!
//! 启动时构建一次、之后只读：每个工具由 ToolSpec 描述（名称、说明、声明风险等级、参数 schema、超时），
//! 实际调用交给 ToolHandler。计划校验、上下文中的工具目录、执行器都只认这里注册过的名字。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::core::OrchestratorError;
use crate::security::RiskTier;
use crate::services::ServiceDirectory;
use crate::tools::schema::ArgSchema;

/// 工具的实际调用：参数已完成模板替换与 schema 校验
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, arguments: &Value, timeout: Duration) -> Result<Value, OrchestratorError>;
}

/// 远端工具：经服务目录 POST /execute {action, params} → {success, data | error}
pub struct ServiceAction {
    directory: Arc<ServiceDirectory>,
    service: String,
    action: String,
}

impl ServiceAction {
    pub fn new(directory: Arc<ServiceDirectory>, service: &str, action: &str) -> Self {
        Self {
            directory,
            service: service.to_string(),
            action: action.to_string(),
        }
    }
}

#[async_trait]
impl ToolHandler for ServiceAction {
    async fn invoke(&self, arguments: &Value, timeout: Duration) -> Result<Value, OrchestratorError> {
        let payload = serde_json::json!({ "action": self.action, "params": arguments });
        let reply = self
            .directory
            .call(&self.service, "/execute", &payload, timeout)
            .await?;

        match reply.get("success").and_then(Value::as_bool) {
            Some(true) => Ok(reply.get("data").cloned().unwrap_or(Value::Null)),
            Some(false) => {
                let msg = reply
                    .get("error")
                    .map(|e| match e {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_else(|| "tool reported failure".to_string());
                Err(OrchestratorError::ToolFailed(msg))
            }
            None => Err(OrchestratorError::ToolFailed(format!(
                "malformed reply from {}: missing 'success'",
                self.service
            ))),
        }
    }
}

#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub risk_tier: RiskTier,
    pub schema: ArgSchema,
    /// 未设置时使用执行器的默认超时
    pub timeout: Option<Duration>,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolSpec {
    pub fn new(
        name: &str,
        description: &str,
        risk_tier: RiskTier,
        schema: ArgSchema,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            risk_tier,
            schema,
            timeout: None,
            handler,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("risk_tier", &self.risk_tier)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// 工具目录中的一项（写进 PromptContext，交给计划服务）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub risk_tier: RiskTier,
    pub parameters: Value,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolSpec>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同名工具后注册的覆盖先注册的
    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name.clone(), Arc::new(spec));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolSpec>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 按名称排序的工具目录
    pub fn catalogue(&self) -> Vec<ToolDescriptor> {
        self.tool_names()
            .into_iter()
            .filter_map(|name| self.tools.get(&name))
            .map(|spec| ToolDescriptor {
                name: spec.name.clone(),
                description: spec.description.clone(),
                risk_tier: spec.risk_tier,
                parameters: spec.schema.to_json_schema(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{RetryPolicy, ServiceTransport, TransportError};
    use crate::tools::schema::ArgType;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn invoke(&self, arguments: &Value, _: Duration) -> Result<Value, OrchestratorError> {
            Ok(arguments.clone())
        }
    }

    /// 固定返回同一个 JSON 的传输层
    struct FixedReply(Value);

    #[async_trait]
    impl ServiceTransport for FixedReply {
        async fn post(&self, _: &str, payload: &Value, _: Duration) -> Result<Value, TransportError> {
            let mut reply = self.0.clone();
            if reply.get("data") == Some(&json!("echo")) {
                reply["data"] = payload.clone();
            }
            Ok(reply)
        }

        async fn get_health(&self, _: &str, _: Duration) -> Result<bool, TransportError> {
            Ok(true)
        }
    }

    fn directory(reply: Value) -> Arc<ServiceDirectory> {
        Arc::new(ServiceDirectory::new(
            [("system_executor".to_string(), "http://exec.local".to_string())],
            5,
            Duration::from_secs(30),
            RetryPolicy::default(),
            Arc::new(FixedReply(reply)),
        ))
    }

    #[test]
    fn test_catalogue_sorted_with_schema() {
        let mut reg = ToolRegistry::new();
        reg.register(ToolSpec::new(
            "write_file",
            "write",
            RiskTier::Medium,
            ArgSchema::new().required("path", ArgType::String, "p"),
            Arc::new(Echo),
        ));
        reg.register(ToolSpec::new("get_system_info", "info", RiskTier::Safe, ArgSchema::new(), Arc::new(Echo)));
        let cat = reg.catalogue();
        assert_eq!(cat.len(), 2);
        assert_eq!(cat[0].name, "get_system_info");
        assert_eq!(cat[1].parameters["required"], json!(["path"]));
        assert!(reg.contains("write_file"));
        assert!(!reg.contains("rm"));
    }

    #[tokio::test]
    async fn test_service_action_success_returns_data() {
        let handler = ServiceAction::new(directory(json!({"success": true, "data": "echo"})), "system_executor", "read_file");
        let out = handler
            .invoke(&json!({"path": "/tmp/a"}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out["action"], "read_file");
        assert_eq!(out["params"]["path"], "/tmp/a");
    }

    #[tokio::test]
    async fn test_service_action_failure_maps_to_tool_failed() {
        let handler = ServiceAction::new(
            directory(json!({"success": false, "error": "no such file"})),
            "system_executor",
            "read_file",
        );
        let err = handler.invoke(&json!({}), Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, OrchestratorError::ToolFailed("no such file".into()));

        let handler = ServiceAction::new(directory(json!({"status": "??"})), "system_executor", "read_file");
        assert!(matches!(
            handler.invoke(&json!({}), Duration::from_secs(1)).await,
            Err(OrchestratorError::ToolFailed(_))
        ));
    }
}
