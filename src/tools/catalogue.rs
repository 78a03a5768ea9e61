//! 内置工具目录
//!
//! system_executor / connectors 上的远端动作，加上两个直接走知识检索器的本地工具。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::KnowledgeRetriever;
use crate::core::OrchestratorError;
use crate::security::RiskTier;
use crate::services::ServiceDirectory;
use crate::tools::registry::{ServiceAction, ToolHandler, ToolRegistry, ToolSpec};
use crate::tools::schema::{ArgSchema, ArgType};

pub const SYSTEM_EXECUTOR: &str = "system_executor";
pub const CONNECTORS: &str = "connectors";

const DEFAULT_SEARCH_K: usize = 5;

/// search_knowledge：本地检索，返回 {results: [...]}
pub struct SearchKnowledge {
    retriever: Arc<dyn KnowledgeRetriever>,
}

#[async_trait]
impl ToolHandler for SearchKnowledge {
    async fn invoke(&self, arguments: &Value, timeout: Duration) -> Result<Value, OrchestratorError> {
        let query = arguments.get("query").and_then(Value::as_str).unwrap_or_default();
        let k = arguments
            .get("k")
            .and_then(Value::as_u64)
            .map(|k| k as usize)
            .unwrap_or(DEFAULT_SEARCH_K);
        let hits = tokio::time::timeout(timeout, self.retriever.search(query, k))
            .await
            .map_err(|_| OrchestratorError::Timeout("search_knowledge".into()))??;
        Ok(serde_json::json!({ "results": hits }))
    }
}

/// learn_fact：写入知识库
pub struct LearnFact {
    retriever: Arc<dyn KnowledgeRetriever>,
}

#[async_trait]
impl ToolHandler for LearnFact {
    async fn invoke(&self, arguments: &Value, timeout: Duration) -> Result<Value, OrchestratorError> {
        let fact = arguments.get("fact").and_then(Value::as_str).unwrap_or_default().trim();
        if fact.is_empty() {
            return Err(OrchestratorError::ToolFailed("fact is empty".into()));
        }
        let source = arguments.get("source").and_then(Value::as_str).unwrap_or("user");
        tokio::time::timeout(timeout, self.retriever.add(fact, source))
            .await
            .map_err(|_| OrchestratorError::Timeout("learn_fact".into()))??;
        Ok(serde_json::json!({ "learned": fact }))
    }
}

fn remote(
    directory: &Arc<ServiceDirectory>,
    service: &str,
    name: &str,
    description: &str,
    tier: RiskTier,
    schema: ArgSchema,
) -> ToolSpec {
    ToolSpec::new(
        name,
        description,
        tier,
        schema,
        Arc::new(ServiceAction::new(directory.clone(), service, name)),
    )
}

pub fn builtin_tools(
    directory: &Arc<ServiceDirectory>,
    retriever: Arc<dyn KnowledgeRetriever>,
) -> ToolRegistry {
    let mut reg = ToolRegistry::new();
    let path = |desc: &str| ArgSchema::new().required("path", ArgType::String, desc);

    reg.register(remote(
        directory,
        SYSTEM_EXECUTOR,
        "read_file",
        "Read a text file and return its content",
        RiskTier::Low,
        path("file to read"),
    ));
    reg.register(remote(
        directory,
        SYSTEM_EXECUTOR,
        "list_directory",
        "List the entries of a directory",
        RiskTier::Safe,
        path("directory to list"),
    ));
    reg.register(remote(
        directory,
        SYSTEM_EXECUTOR,
        "write_file",
        "Write text content to a file, replacing it",
        RiskTier::Medium,
        path("file to write").required("content", ArgType::String, "text to write"),
    ));
    reg.register(remote(
        directory,
        SYSTEM_EXECUTOR,
        "delete_file",
        "Delete a file",
        RiskTier::Critical,
        path("file to delete"),
    ));
    reg.register(
        remote(
            directory,
            SYSTEM_EXECUTOR,
            "execute_command",
            "Run a shell command and return its output",
            RiskTier::High,
            ArgSchema::new()
                .required("command", ArgType::String, "command line")
                .optional("timeout", ArgType::Integer, "seconds"),
        )
        .with_timeout(Duration::from_secs(60)),
    );
    reg.register(remote(
        directory,
        SYSTEM_EXECUTOR,
        "get_system_info",
        "Report OS, CPU, memory and disk usage",
        RiskTier::Safe,
        ArgSchema::new(),
    ));

    reg.register(remote(
        directory,
        CONNECTORS,
        "open_app",
        "Open a desktop application by name",
        RiskTier::Low,
        ArgSchema::new().required("app_name", ArgType::String, "application name"),
    ));
    reg.register(remote(
        directory,
        CONNECTORS,
        "close_app",
        "Close a running desktop application",
        RiskTier::Medium,
        ArgSchema::new().required("app_name", ArgType::String, "application name"),
    ));
    reg.register(remote(
        directory,
        CONNECTORS,
        "send_notification",
        "Show a desktop notification",
        RiskTier::Low,
        ArgSchema::new()
            .required("title", ArgType::String, "notification title")
            .required("message", ArgType::String, "notification body"),
    ));

    reg.register(ToolSpec::new(
        "search_knowledge",
        "Search the knowledge base for relevant facts",
        RiskTier::Safe,
        ArgSchema::new()
            .required("query", ArgType::String, "search text")
            .optional("k", ArgType::Integer, "max results"),
        Arc::new(SearchKnowledge {
            retriever: retriever.clone(),
        }),
    ));
    reg.register(ToolSpec::new(
        "learn_fact",
        "Remember a fact for later questions",
        RiskTier::Low,
        ArgSchema::new()
            .required("fact", ArgType::String, "fact to remember")
            .optional("source", ArgType::String, "where the fact comes from"),
        Arc::new(LearnFact { retriever }),
    ));

    reg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InMemoryRetriever;
    use crate::services::HttpTransport;
    use serde_json::json;

    fn registry(retriever: Arc<InMemoryRetriever>) -> ToolRegistry {
        let directory = Arc::new(ServiceDirectory::new(
            Vec::<(String, String)>::new(),
            5,
            Duration::from_secs(30),
            Default::default(),
            Arc::new(HttpTransport::new()),
        ));
        builtin_tools(&directory, retriever)
    }

    #[test]
    fn test_builtin_tiers() {
        let reg = registry(Arc::new(InMemoryRetriever::new(10)));
        assert_eq!(reg.len(), 11);
        assert_eq!(reg.get("delete_file").unwrap().risk_tier, RiskTier::Critical);
        assert_eq!(reg.get("list_directory").unwrap().risk_tier, RiskTier::Safe);
        assert_eq!(reg.get("execute_command").unwrap().timeout, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_learn_then_search_locally() {
        let retriever = Arc::new(InMemoryRetriever::new(10));
        let reg = registry(retriever.clone());
        let learn = reg.get("learn_fact").unwrap();
        learn
            .handler
            .invoke(&json!({"fact": "The backup disk is labelled Orion"}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(retriever.len(), 1);

        let search = reg.get("search_knowledge").unwrap();
        let out = search
            .handler
            .invoke(&json!({"query": "backup disk"}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out["results"].as_array().unwrap().len(), 1);
        assert_eq!(out["results"][0]["source_id"], "user");
    }

    #[tokio::test]
    async fn test_learn_empty_fact_fails() {
        let reg = registry(Arc::new(InMemoryRetriever::new(10)));
        let err = reg
            .get("learn_fact")
            .unwrap()
            .handler
            .invoke(&json!({"fact": "  "}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ToolFailed(_)));
    }

    #[tokio::test]
    async fn test_learn_on_read_only_store_fails() {
        let directory = Arc::new(ServiceDirectory::new(
            Vec::<(String, String)>::new(),
            5,
            Duration::from_secs(30),
            Default::default(),
            Arc::new(HttpTransport::new()),
        ));
        let reg = builtin_tools(&directory, Arc::new(crate::context::NoopRetriever));
        let err = reg
            .get("learn_fact")
            .unwrap()
            .handler
            .invoke(&json!({"fact": "the sky is blue"}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, OrchestratorError::ToolFailed("knowledge store is read-only".into()));
    }
}
