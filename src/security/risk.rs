//! 风险等级与权限决策类型

use std::fmt;

use serde::{Deserialize, Serialize};

/// 风险等级：safe < low < medium < high < critical
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn all() -> [RiskTier; 5] {
        [Self::Safe, Self::Low, Self::Medium, Self::High, Self::Critical]
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    RequireConfirmation,
    Deny,
}

/// 确认环节的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    NotRequired,
    /// 由未过期的授权自动确认
    Granted,
    Confirmed,
    Refused,
    TimedOut,
}

/// 单次工具调用的权限决策；每次调用重新计算，不缓存
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub action: String,
    pub risk_tier: RiskTier,
    pub decision: Decision,
    pub reason: String,
    pub confirmation: ConfirmationOutcome,
}

impl PermissionDecision {
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(RiskTier::Safe < RiskTier::Low);
        assert!(RiskTier::High < RiskTier::Critical);
        assert_eq!(RiskTier::Medium.max(RiskTier::High), RiskTier::High);
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&Decision::RequireConfirmation).unwrap();
        assert_eq!(json, "\"require_confirmation\"");
        let tier: RiskTier = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(tier, RiskTier::Critical);
    }
}
