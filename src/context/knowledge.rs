//! 知识检索协作方：search(query, k) → 片段
//!
//! NoopRetriever（未配置）、InMemoryRetriever（关键词重叠）、ServiceRetriever（经服务目录 POST /search）。

use std::collections::HashSet;
use std::sync::{Arc, RwLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::OrchestratorError;
use crate::services::ServiceDirectory;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeSnippet {
    pub text: String,
    pub score: f32,
    pub source_id: String,
    /// 同分时按新近程度排序
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<KnowledgeSnippet>, OrchestratorError>;

    /// 新增知识（learn_fact 等）；只读实现返回 ToolFailed
    async fn add(&self, _text: &str, _source_id: &str) -> Result<(), OrchestratorError> {
        Err(OrchestratorError::ToolFailed("knowledge store is read-only".into()))
    }
}

#[derive(Debug, Default)]
pub struct NoopRetriever;

#[async_trait]
impl KnowledgeRetriever for NoopRetriever {
    async fn search(&self, _query: &str, _k: usize) -> Result<Vec<KnowledgeSnippet>, OrchestratorError> {
        Ok(Vec::new())
    }
}

/// 小写词集合（长度 > 1）
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 1)
        .collect()
}

struct StoredFact {
    text: String,
    source_id: String,
    tokens: HashSet<String>,
    updated_at: DateTime<Utc>,
}

/// 内存实现：分数 = 查询词与文档词的重叠比例
#[derive(Clone)]
pub struct InMemoryRetriever {
    store: Arc<RwLock<Vec<StoredFact>>>,
    max_entries: usize,
}

impl InMemoryRetriever {
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: Arc::new(RwLock::new(Vec::new())),
            max_entries: max_entries.max(1),
        }
    }

    pub fn insert(&self, text: &str, source_id: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
        store.push(StoredFact {
            text: text.to_string(),
            source_id: source_id.to_string(),
            tokens: tokenize_lower(text),
            updated_at: Utc::now(),
        });
        let n = store.len();
        if n > self.max_entries {
            store.drain(0..n - self.max_entries);
        }
    }

    pub fn len(&self) -> usize {
        self.store.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryRetriever {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl KnowledgeRetriever for InMemoryRetriever {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<KnowledgeSnippet>, OrchestratorError> {
        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }
        let store = self.store.read().unwrap_or_else(PoisonError::into_inner);
        // 从新到旧遍历，稳定排序后同分同时刻的也是新的在前
        let mut hits: Vec<KnowledgeSnippet> = store
            .iter()
            .rev()
            .filter_map(|fact| {
                let overlap = query_tokens.intersection(&fact.tokens).count();
                (overlap > 0).then(|| KnowledgeSnippet {
                    text: fact.text.clone(),
                    score: overlap as f32 / query_tokens.len() as f32,
                    source_id: fact.source_id.clone(),
                    updated_at: Some(fact.updated_at),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn add(&self, text: &str, source_id: &str) -> Result<(), OrchestratorError> {
        self.insert(text, source_id);
        Ok(())
    }
}

/// 经服务目录调用知识服务：POST /search {query, k} → {results: [...]}
pub struct ServiceRetriever {
    directory: Arc<ServiceDirectory>,
    service: String,
    timeout: Duration,
}

impl ServiceRetriever {
    pub fn new(directory: Arc<ServiceDirectory>, service: impl Into<String>, timeout: Duration) -> Self {
        Self {
            directory,
            service: service.into(),
            timeout,
        }
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<KnowledgeSnippet>,
}

#[async_trait]
impl KnowledgeRetriever for ServiceRetriever {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<KnowledgeSnippet>, OrchestratorError> {
        let payload = serde_json::json!({ "query": query, "k": k });
        let value = self
            .directory
            .call(&self.service, "/search", &payload, self.timeout)
            .await?;
        let resp: SearchResponse = serde_json::from_value(value).map_err(|e| {
            OrchestratorError::unavailable(&self.service, format!("bad search response: {e}"))
        })?;
        Ok(resp.results)
    }

    async fn add(&self, text: &str, source_id: &str) -> Result<(), OrchestratorError> {
        let payload = serde_json::json!({ "text": text, "source_id": source_id });
        self.directory
            .call(&self.service, "/learn", &payload, self.timeout)
            .await?;
        Ok(())
    }
}
