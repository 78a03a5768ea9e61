//! 启发式降级：计划服务不可用或两次给出非法计划时使用
//!
//! 确定性的关键词规则（英文 / 法文），最多选出一个风险等级不高于 low 的工具调用；
//! 同样的输入永远得到同样的结果。没有规则命中时返回降级说明。

use serde_json::{json, Value};

use crate::planner::{Plan, ToolCall};
use crate::security::RiskTier;
use crate::tools::ToolRegistry;

pub const DEGRADED_MESSAGE: &str =
    "I can't plan that right now because the planning service is unavailable. \
     I can still list directories, report system information, search or remember facts.";

/// 降级结果：一个单步计划，或直接给用户的说明
#[derive(Debug, Clone, PartialEq)]
pub enum Fallback {
    Plan(Plan),
    Message(String),
}

struct Rule {
    tool: &'static str,
    keywords: &'static [&'static str],
    build: fn(&str) -> Value,
}

const RULES: &[Rule] = &[
    Rule {
        tool: "list_directory",
        keywords: &["list", "ls", "files in", "directory", "folder", "liste", "lister", "fichiers", "dossier", "répertoire"],
        build: list_args,
    },
    Rule {
        tool: "get_system_info",
        keywords: &["system info", "system status", "cpu", "memory", "ram", "disk space", "système", "mémoire", "processeur", "espace disque"],
        build: no_args,
    },
    Rule {
        tool: "learn_fact",
        keywords: &["remember", "note that", "learn that", "souviens", "retiens", "note que"],
        build: fact_args,
    },
    Rule {
        tool: "search_knowledge",
        keywords: &["what", "who", "where", "when", "which", "search", "find", "look up", "quoi", "qui", "où", "quand", "quel", "quelle", "cherche", "trouve"],
        build: query_args,
    },
];

fn list_args(text: &str) -> Value {
    json!({ "path": path_in(text).unwrap_or_else(|| ".".to_string()) })
}

fn no_args(_: &str) -> Value {
    json!({})
}

fn fact_args(text: &str) -> Value {
    json!({ "fact": fact_in(text) })
}

fn query_args(text: &str) -> Value {
    json!({ "query": text.trim() })
}

/// 小写、标点换空格、两端补空格，便于按整词匹配
fn normalize(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let words: Vec<&str> = cleaned.split_whitespace().collect();
    format!(" {} ", words.join(" "))
}

fn mentions(normalized: &str, keyword: &str) -> bool {
    normalized.contains(&format!(" {keyword} "))
}

fn path_in(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|t| t.trim_matches(|c: char| matches!(c, '"' | '\'' | ',' | '?' | '!')))
        .find(|t| t.starts_with('/') || t.starts_with("~/") || *t == "~")
        .map(|t| t.trim_end_matches('.').to_string())
        .filter(|t| !t.is_empty())
}

/// 去掉 "remember that" 一类前缀后的事实文本
fn fact_in(text: &str) -> String {
    const PREFIXES: &[&str] = &[
        "please remember that",
        "remember that",
        "remember",
        "note that",
        "learn that",
        "souviens-toi que",
        "retiens que",
        "note que",
    ];
    let trimmed = text.trim();
    let lower = trimmed.to_lowercase();
    PREFIXES
        .iter()
        .find(|p| lower.starts_with(*p) && trimmed.is_char_boundary(p.len()))
        .map(|p| trimmed[p.len()..].trim_start_matches(&[' ', ':', ','][..]).trim().to_string())
        .filter(|f| !f.is_empty())
        .unwrap_or_else(|| trimmed.to_string())
}

/// 选出降级动作；只考虑已注册且等级不高于 low 的工具
pub fn fallback(request: &str, registry: &ToolRegistry) -> Fallback {
    let normalized = normalize(request);
    let is_question = request.trim_end().ends_with('?');

    for rule in RULES {
        let Some(spec) = registry.get(rule.tool) else {
            continue;
        };
        if spec.risk_tier > RiskTier::Low {
            continue;
        }
        let hit = rule.keywords.iter().any(|k| mentions(&normalized, k))
            || (rule.tool == "search_knowledge" && is_question);
        if !hit {
            continue;
        }
        let arguments = (rule.build)(request);
        if spec.schema.validate(&arguments).is_err() {
            continue;
        }
        return Fallback::Plan(Plan::new(vec![ToolCall::new("fallback-1", rule.tool, arguments)]));
    }
    Fallback::Message(DEGRADED_MESSAGE.to_string())
}
