//! 步骤结果引用：`{{steps.<step_id>.output}}` 或 `{{steps.<step_id>.output.<field>...}}`
//!
//! 整个字符串就是一个引用时替换为原始 JSON 值（保留类型）；嵌在文本中时替换为其文本形式。

use std::collections::HashMap;

use serde_json::Value;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, Clone, PartialEq, Eq)]
struct StepRef {
    step_id: String,
    path: Vec<String>,
}

/// 解析 `steps.<id>.output[.field...]`
fn parse_ref(inner: &str) -> Option<StepRef> {
    let mut parts = inner.trim().split('.');
    if parts.next()? != "steps" {
        return None;
    }
    let step_id = parts.next()?.to_string();
    if step_id.is_empty() || parts.next()? != "output" {
        return None;
    }
    let path: Vec<String> = parts.map(String::from).collect();
    if path.iter().any(|p| p.is_empty()) {
        return None;
    }
    Some(StepRef { step_id, path })
}

/// 字符串中所有 `{{...}}` 片段的 (起点, 终点, 内部文本)
fn placeholders(s: &str) -> Vec<(usize, usize, &str)> {
    let mut out = Vec::new();
    let mut from = 0;
    while let Some(start) = s[from..].find(OPEN).map(|i| i + from) {
        let body_start = start + OPEN.len();
        match s[body_start..].find(CLOSE) {
            Some(len) => {
                let end = body_start + len + CLOSE.len();
                out.push((start, end, &s[body_start..body_start + len]));
                from = end;
            }
            None => break,
        }
    }
    out
}

/// 是否整串恰为一个步骤引用
pub fn is_whole_reference(s: &str) -> bool {
    let t = s.trim();
    match placeholders(t).as_slice() {
        [(0, end, inner)] => *end == t.len() && parse_ref(inner).is_some(),
        _ => false,
    }
}

/// 参数中引用到的全部 step_id（含格式错误的引用时返回错误）
pub fn referenced_steps(arguments: &Value) -> Result<Vec<String>, String> {
    let mut ids = Vec::new();
    let mut bad = None;
    walk(arguments, &mut |s| {
        for (_, _, inner) in placeholders(s) {
            match parse_ref(inner) {
                Some(r) => ids.push(r.step_id),
                None => bad = Some(format!("malformed step reference '{{{{{inner}}}}}'")),
            }
        }
    });
    match bad {
        Some(e) => Err(e),
        None => Ok(ids),
    }
}

fn walk(value: &Value, f: &mut dyn FnMut(&str)) {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => items.iter().for_each(|v| walk(v, f)),
        Value::Object(map) => map.values().for_each(|v| walk(v, f)),
        _ => {}
    }
}

fn lookup(r: &StepRef, outputs: &HashMap<String, Value>) -> Result<Value, String> {
    let mut current = outputs
        .get(&r.step_id)
        .ok_or_else(|| format!("step '{}' has no output to reference", r.step_id))?;
    for field in &r.path {
        current = match current {
            Value::Object(map) => map.get(field),
            Value::Array(items) => field.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
        .ok_or_else(|| format!("output of step '{}' has no field '{}'", r.step_id, field))?;
    }
    Ok(current.clone())
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resolve_str(s: &str, outputs: &HashMap<String, Value>) -> Result<Value, String> {
    let found = placeholders(s);
    if found.is_empty() {
        return Ok(Value::String(s.to_string()));
    }
    if is_whole_reference(s) {
        let r = parse_ref(found[0].2).ok_or_else(|| format!("malformed step reference in '{s}'"))?;
        return lookup(&r, outputs);
    }
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for (start, end, inner) in found {
        let r = parse_ref(inner).ok_or_else(|| format!("malformed step reference '{{{{{inner}}}}}'"))?;
        out.push_str(&s[last..start]);
        out.push_str(&render(&lookup(&r, outputs)?));
        last = end;
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

/// 用已完成步骤的输出替换参数中的引用
pub fn resolve(arguments: &Value, outputs: &HashMap<String, Value>) -> Result<Value, String> {
    match arguments {
        Value::String(s) => resolve_str(s, outputs),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve(v, outputs))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve(v, outputs)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}
