//! 拒绝规则与参数相关的风险提升
//!
//! 扫描动作名与全部字符串参数（递归进入数组/对象）：
//! - 危险子串（rm -rf、mkfs、fork bomb ...）
//! - 命令类参数中的禁用命令词（按词边界匹配，`sudo`/`rm`/`kill` ...）
//! - 禁止的路径前缀（/boot、/dev、/etc/shadow ...），先做词法规范化再比较
//! - 越过根目录的路径（/../..）
//! - 通配符删除
//!
//! 命中任何一条即拒绝，风险强制为 critical，与工具声明的等级无关。

use regex::Regex;
use serde_json::Value;

use crate::config::PermissionsSection;
use crate::security::RiskTier;

/// 危险子串（小写匹配）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r ",
    "wget ",
    "curl | sh",
    "curl | bash",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    " -delete",
    ":(){ :|:& };:",
];

/// 禁用的命令词
const BANNED_COMMANDS: &[&str] = &[
    "rm", "rmdir", "dd", "mkfs", "fdisk", "shutdown", "reboot", "halt", "kill", "killall",
    "pkill", "sudo", "su",
];

/// 这些参数名的值按 shell 命令处理
const COMMAND_KEYS: &[&str] = &["command", "cmd", "script", "shell"];

#[derive(Debug, Clone)]
pub struct DenyPolicy {
    substrings: Vec<String>,
    banned: Regex,
    forbidden_prefixes: Vec<String>,
    sensitive_prefixes: Vec<String>,
}

impl DenyPolicy {
    pub fn new(
        extra_substrings: &[String],
        forbidden_prefixes: &[String],
        sensitive_prefixes: &[String],
    ) -> Result<Self, regex::Error> {
        let words = BANNED_COMMANDS
            .iter()
            .map(|w| regex::escape(w))
            .collect::<Vec<_>>()
            .join("|");
        let banned = Regex::new(&format!(r"(^|[\s;|&])({words})([\s;|&]|$)"))?;

        let substrings = FORBIDDEN_SUBSTR
            .iter()
            .map(|s| s.to_string())
            .chain(extra_substrings.iter().map(|s| s.to_lowercase()))
            .collect();

        Ok(Self {
            substrings,
            banned,
            forbidden_prefixes: forbidden_prefixes.to_vec(),
            sensitive_prefixes: sensitive_prefixes.to_vec(),
        })
    }

    pub fn from_config(cfg: &PermissionsSection) -> Result<Self, regex::Error> {
        Self::new(
            &cfg.extra_deny_substrings,
            &cfg.forbidden_path_prefixes,
            &cfg.sensitive_path_prefixes,
        )
    }

    /// 命中拒绝规则时返回原因
    pub fn deny_reason(&self, action: &str, arguments: &Value) -> Option<String> {
        let action_lower = action.to_lowercase();
        if let Some(reason) = self.check_text(&action_lower, true) {
            return Some(reason);
        }

        let deletes = action_lower.contains("delete") || action_lower.contains("remove");
        let mut found = None;
        visit_strings(arguments, None, &mut |key, value| {
            if found.is_some() {
                return;
            }
            let lower = value.to_lowercase();
            let is_command = key.map(|k| COMMAND_KEYS.contains(&k)).unwrap_or(false);
            if let Some(reason) = self.check_text(&lower, is_command) {
                found = Some(reason);
            } else if deletes && (value.contains('*') || value.contains('?')) {
                found = Some(format!("wildcard deletion: '{value}'"));
            }
        });
        found
    }

    /// 参数相关的风险提升（如敏感目录下的路径提升为 high）
    pub fn escalation(&self, arguments: &Value) -> Option<(RiskTier, String)> {
        let mut hit = None;
        visit_strings(arguments, None, &mut |_, value| {
            if hit.is_some() {
                return;
            }
            for token in path_tokens(value) {
                let Some(path) = PathToken::parse(token).and_then(|t| t.normalized()) else {
                    hit = Some((RiskTier::High, format!("path traversal '{token}'")));
                    return;
                };
                if let Some(prefix) = self.sensitive_prefixes.iter().find(|p| has_prefix(&path, p)) {
                    hit = Some((RiskTier::High, format!("path under sensitive location {prefix}")));
                    return;
                }
            }
        });
        hit
    }

    fn check_text(&self, lower: &str, is_command: bool) -> Option<String> {
        if let Some(s) = self.substrings.iter().find(|s| lower.contains(s.as_str())) {
            return Some(format!("forbidden pattern '{}'", s.trim()));
        }
        if is_command {
            if let Some(caps) = self.banned.captures(lower) {
                let word = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
                return Some(format!("banned command '{word}'"));
            }
        }
        for token in path_tokens(lower) {
            let Some(parsed) = PathToken::parse(token) else {
                continue;
            };
            let Some(path) = parsed.normalized() else {
                return Some(format!("path escapes the root: '{token}'"));
            };
            if let Some(prefix) = self
                .forbidden_prefixes
                .iter()
                .find(|p| has_prefix(&path, &p.to_lowercase()))
            {
                return Some(format!("protected system path {prefix}"));
            }
        }
        None
    }
}

/// 递归访问所有字符串值，回调携带最近的对象键名
fn visit_strings<'a>(value: &'a Value, key: Option<&'a str>, f: &mut dyn FnMut(Option<&'a str>, &'a str)) {
    match value {
        Value::String(s) => f(key, s),
        Value::Array(items) => items.iter().for_each(|v| visit_strings(v, key, f)),
        Value::Object(map) => map
            .iter()
            .for_each(|(k, v)| visit_strings(v, Some(k.as_str()), f)),
        _ => {}
    }
}

/// 文本中形如路径的词：以 / 或 ~ 开头，或含 `..` 段
fn path_tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| c.is_whitespace() || c == ';' || c == '|' || c == '&' || c == '"' || c == '\'')
        .filter(|t| t.starts_with('/') || t.starts_with('~') || t.split('/').any(|seg| seg == ".."))
}

/// 绝对路径（或 ~ 开头）；含 `..` 的相对路径无法确定落点，parse 返回 None
struct PathToken<'a> {
    root: &'a str,
    rest: &'a str,
}

impl<'a> PathToken<'a> {
    fn parse(token: &'a str) -> Option<Self> {
        if let Some(rest) = token.strip_prefix('~') {
            Some(Self { root: "~", rest })
        } else if token.starts_with('/') {
            Some(Self { root: "", rest: token })
        } else {
            None
        }
    }

    /// 去掉 `.` 与空段、消解 `..`；越过根目录时返回 None
    fn normalized(&self) -> Option<String> {
        let mut segments: Vec<&str> = Vec::new();
        for seg in self.rest.split('/') {
            match seg {
                "" | "." => {}
                ".." => {
                    segments.pop()?;
                }
                s => segments.push(s),
            }
        }
        Some(format!("{}/{}", self.root, segments.join("/")))
    }
}

/// 按路径段匹配前缀：/sys 匹配 /sys 与 /sys/kernel，不匹配 /system
fn has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return false;
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> DenyPolicy {
        DenyPolicy::from_config(&PermissionsSection::default()).unwrap()
    }

    #[test]
    fn test_forbidden_substring_in_any_argument() {
        let p = policy();
        let reason = p
            .deny_reason("send_notification", &json!({"message": "run rm -rf / now"}))
            .unwrap();
        assert!(reason.contains("rm -rf"));
    }

    #[test]
    fn test_banned_word_only_in_command_arguments() {
        let p = policy();
        assert!(p
            .deny_reason("execute_command", &json!({"command": "ls; sudo reboot"}))
            .is_some());
        assert!(p
            .deny_reason("execute_command", &json!({"command": "echo skill"}))
            .is_none());
        assert!(p
            .deny_reason("send_notification", &json!({"message": "time to reboot"}))
            .is_none());
    }

    #[test]
    fn test_forbidden_path_prefix_respects_segments() {
        let p = policy();
        assert!(p
            .deny_reason("read_file", &json!({"path": "/etc/shadow"}))
            .is_some());
        assert!(p
            .deny_reason("list_directory", &json!({"path": "/sys/kernel"}))
            .is_some());
        assert!(p
            .deny_reason("list_directory", &json!({"path": "/system_reports"}))
            .is_none());
        assert!(p
            .deny_reason("execute_command", &json!({"command": "cat /etc/sudoers"}))
            .is_some());
    }

    #[test]
    fn test_wildcard_deletion() {
        let p = policy();
        assert!(p
            .deny_reason("delete_file", &json!({"path": "/tmp/*.log"}))
            .is_some());
        assert!(p
            .deny_reason("list_directory", &json!({"path": "/tmp/*.log"}))
            .is_none());
    }

    #[test]
    fn test_nested_arguments_are_scanned() {
        let p = policy();
        assert!(p
            .deny_reason("write_file", &json!({"files": [{"path": "/boot/grub.cfg"}]}))
            .is_some());
    }

    #[test]
    fn test_sensitive_path_escalates_to_high() {
        let p = policy();
        let (tier, _) = p.escalation(&json!({"path": "/etc/passwd"})).unwrap();
        assert_eq!(tier, RiskTier::High);
        assert!(p.escalation(&json!({"path": "/tmp/notes.txt"})).is_none());
    }

    #[test]
    fn test_traversal_normalised_before_prefix_check() {
        let p = policy();
        let reason = p
            .deny_reason("read_file", &json!({"path": "/tmp/../etc/shadow"}))
            .unwrap();
        assert!(reason.contains("/etc/shadow"));
        assert!(p
            .deny_reason("execute_command", &json!({"command": "cat /tmp/./x/../../sys/power"}))
            .is_some());
        assert!(p
            .deny_reason("read_file", &json!({"path": "/tmp/a/../b.txt"}))
            .is_none());

        let (tier, why) = p.escalation(&json!({"path": "/tmp/./../etc/passwd"})).unwrap();
        assert_eq!(tier, RiskTier::High);
        assert!(why.contains("/etc"));
    }

    #[test]
    fn test_path_above_root_denied_and_relative_traversal_escalated() {
        let p = policy();
        let reason = p
            .deny_reason("read_file", &json!({"path": "/../../etc/hosts"}))
            .unwrap();
        assert!(reason.contains("escapes the root"));
        assert!(p.deny_reason("read_file", &json!({"path": "../../notes.txt"})).is_none());

        let (tier, why) = p.escalation(&json!({"path": "../../notes.txt"})).unwrap();
        assert_eq!(tier, RiskTier::High);
        assert!(why.contains("traversal"));
    }

    #[test]
    fn test_extra_substrings_from_config() {
        let p = DenyPolicy::new(&["DROP TABLE".to_string()], &[], &[]).unwrap();
        assert!(p
            .deny_reason("query", &json!({"sql": "drop table users"}))
            .is_some());
    }
}
