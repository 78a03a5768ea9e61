//! 授权（consent）：用户预先同意某个动作在一段时间内无需再次确认
//!
//! 授权只能替代确认环节，不能越过拒绝规则，也从不覆盖 critical。

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::security::RiskTier;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub user_id: String,
    /// 动作名；"*" 表示该用户的所有动作
    pub action: String,
    /// 授权覆盖的最高风险等级（不超过 high）
    pub max_tier: RiskTier,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PermissionGrant {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| now < exp).unwrap_or(true)
    }

    fn covers(&self, user_id: &str, action: &str, tier: RiskTier, now: DateTime<Utc>) -> bool {
        self.user_id == user_id
            && (self.action == action || self.action == "*")
            && tier <= self.max_tier
            && tier < RiskTier::Critical
            && self.is_active(now)
    }
}

#[derive(Debug, Default)]
pub struct GrantStore {
    grants: Mutex<Vec<PermissionGrant>>,
}

impl GrantStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 授予权限；ttl 为 None 表示不过期。max_tier 会被限制在 high 以内
    pub fn grant(
        &self,
        user_id: &str,
        action: &str,
        max_tier: RiskTier,
        ttl: Option<Duration>,
    ) -> PermissionGrant {
        let now = Utc::now();
        let grant = PermissionGrant {
            user_id: user_id.to_string(),
            action: action.to_string(),
            max_tier: max_tier.min(RiskTier::High),
            granted_at: now,
            expires_at: ttl.map(|d| now + d),
        };
        tracing::info!(user_id, action, tier = %grant.max_tier, "permission granted");
        self.grants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(grant.clone());
        grant
    }

    pub fn revoke(&self, user_id: &str, action: &str) -> usize {
        let mut grants = self.grants.lock().unwrap_or_else(PoisonError::into_inner);
        let before = grants.len();
        grants.retain(|g| !(g.user_id == user_id && g.action == action));
        before - grants.len()
    }

    /// 是否存在覆盖该请求的未过期授权
    pub fn find(&self, user_id: &str, action: &str, tier: RiskTier) -> Option<PermissionGrant> {
        let now = Utc::now();
        self.grants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|g| g.covers(user_id, action, tier, now))
            .cloned()
    }

    /// 用户当前有效的授权（顺便清理过期项）
    pub fn active_for(&self, user_id: &str) -> Vec<PermissionGrant> {
        let now = Utc::now();
        let mut grants = self.grants.lock().unwrap_or_else(PoisonError::into_inner);
        grants.retain(|g| g.is_active(now));
        grants
            .iter()
            .filter(|g| g.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_covers_tier_and_action() {
        let store = GrantStore::new();
        store.grant("u1", "write_file", RiskTier::Medium, None);
        assert!(store.find("u1", "write_file", RiskTier::Low).is_some());
        assert!(store.find("u1", "write_file", RiskTier::High).is_none());
        assert!(store.find("u2", "write_file", RiskTier::Low).is_none());
        assert!(store.find("u1", "open_app", RiskTier::Low).is_none());
    }

    #[test]
    fn test_grant_never_covers_critical() {
        let store = GrantStore::new();
        let g = store.grant("u1", "*", RiskTier::Critical, None);
        assert_eq!(g.max_tier, RiskTier::High);
        assert!(store.find("u1", "delete_file", RiskTier::Critical).is_none());
        assert!(store.find("u1", "delete_file", RiskTier::High).is_some());
    }

    #[test]
    fn test_expired_grants_are_ignored_and_pruned() {
        let store = GrantStore::new();
        store.grant("u1", "open_app", RiskTier::Low, Some(Duration::seconds(-1)));
        store.grant("u1", "close_app", RiskTier::Medium, Some(Duration::hours(1)));
        assert!(store.find("u1", "open_app", RiskTier::Low).is_none());
        let active = store.active_for("u1");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].action, "close_app");
    }

    #[test]
    fn test_revoke() {
        let store = GrantStore::new();
        store.grant("u1", "open_app", RiskTier::Low, None);
        assert_eq!(store.revoke("u1", "open_app"), 1);
        assert!(store.find("u1", "open_app", RiskTier::Low).is_none());
    }
}
