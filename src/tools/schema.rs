//! 工具参数 schema：声明式参数表 + 严格校验
//!
//! 校验规则：参数必须是对象；必填项存在；类型匹配；不接受未声明的键。
//! 整串为步骤引用（`{{steps.<id>.output...}}`）的字符串可出现在任意类型位置，替换后再次校验。

use serde::Serialize;
use serde_json::{Map, Value};

use crate::tools::template;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ArgType {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }

    fn json_type(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArgSpec {
    pub name: String,
    pub ty: ArgType,
    pub required: bool,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ArgSchema {
    pub args: Vec<ArgSpec>,
}

impl ArgSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &str, ty: ArgType, description: &str) -> Self {
        self.args.push(ArgSpec {
            name: name.to_string(),
            ty,
            required: true,
            description: description.to_string(),
        });
        self
    }

    pub fn optional(mut self, name: &str, ty: ArgType, description: &str) -> Self {
        self.args.push(ArgSpec {
            name: name.to_string(),
            ty,
            required: false,
            description: description.to_string(),
        });
        self
    }

    /// 校验参数，返回全部错误（而不是遇到第一个就停）
    pub fn validate(&self, arguments: &Value) -> Result<(), Vec<String>> {
        let empty = Map::new();
        let obj = match arguments {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => return Err(vec![format!("arguments must be an object, got {}", kind_of(other))]),
        };

        let mut errors = Vec::new();
        for spec in &self.args {
            match obj.get(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    errors.push(format!("missing required argument '{}'", spec.name));
                }
                None | Some(Value::Null) => {}
                Some(value) => {
                    let is_ref = value.as_str().map(template::is_whole_reference).unwrap_or(false);
                    if !is_ref && !spec.ty.matches(value) {
                        errors.push(format!(
                            "argument '{}' must be {}, got {}",
                            spec.name,
                            spec.ty.json_type(),
                            kind_of(value)
                        ));
                    }
                }
            }
        }
        for key in obj.keys() {
            if !self.args.iter().any(|a| &a.name == key) {
                errors.push(format!("unknown argument '{key}'"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// 供计划服务使用的 JSON Schema
    pub fn to_json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .args
            .iter()
            .map(|a| {
                (
                    a.name.clone(),
                    serde_json::json!({ "type": a.ty.json_type(), "description": a.description }),
                )
            })
            .collect();
        let required: Vec<&str> = self
            .args
            .iter()
            .filter(|a| a.required)
            .map(|a| a.name.as_str())
            .collect();
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ArgSchema {
        ArgSchema::new()
            .required("path", ArgType::String, "file path")
            .optional("limit", ArgType::Integer, "max lines")
    }

    #[test]
    fn test_valid_arguments() {
        assert!(schema().validate(&json!({"path": "/tmp/a"})).is_ok());
        assert!(schema().validate(&json!({"path": "/tmp/a", "limit": 10})).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let errs = schema()
            .validate(&json!({"limit": "ten", "mode": "x"}))
            .unwrap_err();
        assert_eq!(errs.len(), 3);
        assert!(errs.iter().any(|e| e.contains("missing required argument 'path'")));
        assert!(errs.iter().any(|e| e.contains("'limit' must be integer")));
        assert!(errs.iter().any(|e| e.contains("unknown argument 'mode'")));
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(schema().validate(&json!(["/tmp"])).is_err());
        assert!(ArgSchema::new().validate(&Value::Null).is_ok());
    }

    #[test]
    fn test_step_reference_allowed_for_any_type() {
        assert!(schema()
            .validate(&json!({"path": "/tmp/a", "limit": "{{steps.s1.output.count}}"}))
            .is_ok());
    }

    #[test]
    fn test_json_schema_shape() {
        let js = schema().to_json_schema();
        assert_eq!(js["required"], json!(["path"]));
        assert_eq!(js["properties"]["limit"]["type"], "integer");
        assert_eq!(js["additionalProperties"], false);
    }
}
