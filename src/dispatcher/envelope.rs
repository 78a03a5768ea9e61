//! 交互信封：一次用户交互的不可变描述

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Voice,
    Text,
    ScheduledEvent,
}

/// 字段私有，构造后不可修改
#[derive(Debug, Clone, Serialize)]
pub struct InteractionEnvelope {
    interaction_id: String,
    source: Source,
    raw_payload: Value,
    user_id: String,
    session_id: String,
    received_at: DateTime<Utc>,
}

impl InteractionEnvelope {
    pub fn new(source: Source, raw_payload: Value, user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            interaction_id: uuid::Uuid::new_v4().to_string(),
            source,
            raw_payload,
            user_id: user_id.into(),
            session_id: session_id.into(),
            received_at: Utc::now(),
        }
    }

    /// 文本输入的快捷构造
    pub fn text(text: impl Into<String>, user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self::new(Source::Text, Value::String(text.into()), user_id, session_id)
    }

    pub fn interaction_id(&self) -> &str {
        &self.interaction_id
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn raw_payload(&self) -> &Value {
        &self.raw_payload
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// 归一化的请求文本：字符串本身，或对象的 text / transcript / command 字段
    pub fn request_text(&self) -> String {
        match &self.raw_payload {
            Value::String(s) => s.trim().to_string(),
            Value::Object(map) => ["text", "transcript", "command"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str))
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
            _ => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_text_normalization() {
        assert_eq!(InteractionEnvelope::text("  hi ", "u", "s").request_text(), "hi");
        let voice = InteractionEnvelope::new(Source::Voice, json!({"transcript": "open notes", "confidence": 0.9}), "u", "s");
        assert_eq!(voice.request_text(), "open notes");
        let cron = InteractionEnvelope::new(Source::ScheduledEvent, json!({"command": "daily report"}), "system", "cron");
        assert_eq!(cron.request_text(), "daily report");
        let odd = InteractionEnvelope::new(Source::Text, json!(42), "u", "s");
        assert_eq!(odd.request_text(), "");
    }

    #[test]
    fn test_unique_ids() {
        let a = InteractionEnvelope::text("a", "u", "s");
        let b = InteractionEnvelope::text("a", "u", "s");
        assert_ne!(a.interaction_id(), b.interaction_id());
        assert_eq!(a.source(), Source::Text);
    }
}
