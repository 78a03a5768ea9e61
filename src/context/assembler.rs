//! 上下文组装：对话窗口 + 知识片段 + 有效授权 + 最近审计 + 工具目录 → PromptContext

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::audit::{AuditEntry, AuditLog};
use crate::config::ContextSection;
use crate::context::{ContextWindow, ConversationTurn, KnowledgeRetriever, KnowledgeSnippet, Role};
use crate::dispatcher::InteractionEnvelope;
use crate::security::{GrantStore, PermissionGrant};
use crate::tools::{ToolDescriptor, ToolRegistry};

#[derive(Debug, Clone, Serialize)]
pub struct PromptContext {
    pub interaction_id: String,
    pub user_id: String,
    pub session_id: String,
    pub request: String,
    pub turns: Vec<ConversationTurn>,
    pub snippets: Vec<KnowledgeSnippet>,
    pub grants: Vec<PermissionGrant>,
    pub recent_audit: Vec<AuditEntry>,
    pub catalogue: Vec<ToolDescriptor>,
}

impl PromptContext {
    /// 最小结构化提示：各段落标题 + 内容，工具目录与 schema 另行以 JSON 发送
    pub fn render_prompt(&self) -> String {
        let mut out = String::new();

        if !self.turns.is_empty() {
            out.push_str("## Conversation\n");
            for t in &self.turns {
                let who = match t.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                out.push_str(&format!("{who}: {}\n", t.text));
            }
            out.push('\n');
        }

        if !self.snippets.is_empty() {
            out.push_str("## Knowledge\n");
            for s in &self.snippets {
                out.push_str(&format!("- [{}] {}\n", s.source_id, s.text));
            }
            out.push('\n');
        }

        if !self.grants.is_empty() {
            out.push_str("## Standing permissions\n");
            for g in &self.grants {
                out.push_str(&format!("- {} up to {}\n", g.action, g.max_tier));
            }
            out.push('\n');
        }

        if !self.recent_audit.is_empty() {
            out.push_str("## Recent actions\n");
            for e in &self.recent_audit {
                let status = e.status.map(|s| s.as_str()).unwrap_or("-");
                out.push_str(&format!("- {} ({}): {}\n", e.action, e.risk_tier, status));
            }
            out.push('\n');
        }

        out.push_str("## Available tools\n");
        for t in &self.catalogue {
            out.push_str(&format!("- {} [{}]: {}\n", t.name, t.risk_tier, t.description));
        }
        out.push_str("\n## Request\n");
        out.push_str(&self.request);
        out.push('\n');
        out
    }
}

pub struct ContextAssembler {
    retriever: Arc<dyn KnowledgeRetriever>,
    audit: Arc<AuditLog>,
    grants: Arc<GrantStore>,
    registry: Arc<ToolRegistry>,
    max_turns: usize,
    max_snippets: usize,
    max_audit_entries: usize,
    retrieval_timeout: Duration,
}

impl ContextAssembler {
    pub fn new(
        retriever: Arc<dyn KnowledgeRetriever>,
        audit: Arc<AuditLog>,
        grants: Arc<GrantStore>,
        registry: Arc<ToolRegistry>,
        cfg: &ContextSection,
    ) -> Self {
        Self {
            retriever,
            audit,
            grants,
            registry,
            max_turns: cfg.max_turns,
            max_snippets: cfg.max_snippets,
            max_audit_entries: cfg.max_audit_entries,
            retrieval_timeout: cfg.retrieval_timeout(),
        }
    }

    /// 检索失败或超时只降级为空片段，不影响本次交互
    pub async fn assemble(&self, envelope: &InteractionEnvelope, window: &ContextWindow) -> PromptContext {
        let request = envelope.request_text();
        let snippets = self.retrieve(&request).await;

        PromptContext {
            interaction_id: envelope.interaction_id().to_string(),
            user_id: envelope.user_id().to_string(),
            session_id: envelope.session_id().to_string(),
            request,
            turns: window.recent(self.max_turns),
            snippets,
            grants: self.grants.active_for(envelope.user_id()),
            recent_audit: self.audit.recent_for_user(envelope.user_id(), self.max_audit_entries),
            catalogue: self.registry.catalogue(),
        }
    }

    async fn retrieve(&self, query: &str) -> Vec<KnowledgeSnippet> {
        if query.is_empty() || self.max_snippets == 0 {
            return Vec::new();
        }
        let mut snippets = match tokio::time::timeout(
            self.retrieval_timeout,
            self.retriever.search(query, self.max_snippets),
        )
        .await
        {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "knowledge retrieval failed, continuing without snippets");
                return Vec::new();
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.retrieval_timeout.as_millis() as u64,
                    "knowledge retrieval timed out, continuing without snippets"
                );
                return Vec::new();
            }
        };
        // 分数降序，同分时较新的在前
        snippets.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });
        snippets.truncate(self.max_snippets);
        snippets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InMemoryRetriever;
    use crate::core::OrchestratorError;
    use crate::security::RiskTier;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    struct Fixed(Vec<KnowledgeSnippet>);

    #[async_trait]
    impl KnowledgeRetriever for Fixed {
        async fn search(&self, _: &str, _: usize) -> Result<Vec<KnowledgeSnippet>, OrchestratorError> {
            Ok(self.0.clone())
        }
    }

    struct Stalled;

    #[async_trait]
    impl KnowledgeRetriever for Stalled {
        async fn search(&self, _: &str, _: usize) -> Result<Vec<KnowledgeSnippet>, OrchestratorError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    fn snippet(text: &str, score: f32, day: u32) -> KnowledgeSnippet {
        KnowledgeSnippet {
            text: text.into(),
            score,
            source_id: text.into(),
            updated_at: Some(Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()),
        }
    }

    fn assembler(retriever: Arc<dyn KnowledgeRetriever>, grants: Arc<GrantStore>) -> ContextAssembler {
        let cfg = ContextSection {
            max_turns: 2,
            max_snippets: 2,
            retrieval_timeout_ms: 30,
            ..Default::default()
        };
        ContextAssembler::new(
            retriever,
            Arc::new(AuditLog::in_memory(10)),
            grants,
            Arc::new(ToolRegistry::new()),
            &cfg,
        )
    }

    #[tokio::test]
    async fn test_snippets_ranked_by_score_then_recency() {
        let a = assembler(
            Arc::new(Fixed(vec![
                snippet("old", 0.5, 1),
                snippet("best", 0.9, 1),
                snippet("new", 0.5, 20),
            ])),
            Arc::new(GrantStore::new()),
        );
        let mut w = ContextWindow::new(10);
        w.push_user("one");
        w.push_assistant("two");
        w.push_user("three");
        let ctx = a.assemble(&InteractionEnvelope::text("where is it", "u1", "s1"), &w).await;
        let texts: Vec<&str> = ctx.snippets.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["best", "new"]);
        assert_eq!(ctx.turns.len(), 2);
        assert_eq!(ctx.turns[1].text, "three");
        assert_eq!(ctx.request, "where is it");
    }

    #[tokio::test]
    async fn test_in_memory_ties_favour_newest_facts() {
        let store = InMemoryRetriever::new(10);
        store.insert("backup old alpha", "a");
        store.insert("backup old beta", "b");
        store.insert("backup newest gamma", "c");
        let a = assembler(Arc::new(store), Arc::new(GrantStore::new()));
        let ctx = a
            .assemble(&InteractionEnvelope::text("backup", "u1", "s1"), &ContextWindow::new(5))
            .await;
        let texts: Vec<&str> = ctx.snippets.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["backup newest gamma", "backup old beta"]);
    }

    #[tokio::test]
    async fn test_retrieval_timeout_degrades_to_empty() {
        let grants = Arc::new(GrantStore::new());
        grants.grant("u1", "open_app", RiskTier::Low, None);
        let a = assembler(Arc::new(Stalled), grants);
        let ctx = a
            .assemble(&InteractionEnvelope::text("anything", "u1", "s1"), &ContextWindow::new(5))
            .await;
        assert!(ctx.snippets.is_empty());
        assert_eq!(ctx.grants.len(), 1);
        let prompt = ctx.render_prompt();
        assert!(prompt.contains("open_app up to low"));
        assert!(prompt.ends_with("anything\n"));
    }
}
