//! 上下文：会话窗口、知识检索与提示上下文组装

pub mod assembler;
pub mod knowledge;
pub mod window;

pub use assembler::{ContextAssembler, PromptContext};
pub use knowledge::{InMemoryRetriever, KnowledgeRetriever, KnowledgeSnippet, NoopRetriever, ServiceRetriever};
pub use window::{ContextWindow, ConversationTurn, Role};
