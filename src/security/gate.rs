//! 权限闸门
//!
//! 1. 命中拒绝规则 → deny，风险强制 critical
//! 2. 有效等级 = max(声明等级, 参数相关提升)
//! 3. safe → allow
//! 4. low / medium / high → 需要确认：未过期授权或确认通道（有界超时），超时或拒绝 → deny
//! 5. critical → deny
//!
//! 每个决策在返回给调用方之前先写入审计日志。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::audit::{AuditEntry, AuditLog, AuditScope};
use crate::core::OrchestratorError;
use crate::security::{
    ConfirmationChannel, ConfirmationOutcome, ConfirmationRequest, Decision, DenyPolicy,
    GrantStore, PermissionDecision, RiskTier,
};

pub struct PermissionGate {
    policy: DenyPolicy,
    audit: Arc<AuditLog>,
    confirmation: Arc<dyn ConfirmationChannel>,
    grants: Arc<GrantStore>,
    confirmation_timeout: Duration,
}

impl PermissionGate {
    pub fn new(
        policy: DenyPolicy,
        audit: Arc<AuditLog>,
        confirmation: Arc<dyn ConfirmationChannel>,
        grants: Arc<GrantStore>,
        confirmation_timeout: Duration,
    ) -> Self {
        Self {
            policy,
            audit,
            confirmation,
            grants,
            confirmation_timeout,
        }
    }

    pub fn grants(&self) -> &Arc<GrantStore> {
        &self.grants
    }

    /// 纯分类，不做确认、不写审计
    pub fn classify(&self, action: &str, declared: RiskTier, arguments: &Value) -> PermissionDecision {
        if let Some(reason) = self.policy.deny_reason(action, arguments) {
            return PermissionDecision {
                action: action.to_string(),
                risk_tier: RiskTier::Critical,
                decision: Decision::Deny,
                reason: format!("blocked: {reason}"),
                confirmation: ConfirmationOutcome::NotRequired,
            };
        }

        let (tier, escalated) = match self.policy.escalation(arguments) {
            Some((t, why)) if t > declared => (t, Some(why)),
            _ => (declared, None),
        };

        let (decision, reason) = match tier {
            RiskTier::Safe => (Decision::Allow, "safe action".to_string()),
            RiskTier::Critical => (
                Decision::Deny,
                format!("'{action}' is critical and never executed automatically"),
            ),
            _ => (
                Decision::RequireConfirmation,
                match escalated {
                    Some(why) => format!("{tier} risk ({why}), confirmation required"),
                    None => format!("{tier} risk, confirmation required"),
                },
            ),
        };

        PermissionDecision {
            action: action.to_string(),
            risk_tier: tier,
            decision,
            reason,
            confirmation: ConfirmationOutcome::NotRequired,
        }
    }

    /// 计算最终决策（allow / deny），写入审计后返回
    pub async fn evaluate(
        &self,
        scope: &AuditScope,
        action: &str,
        declared: RiskTier,
        arguments: &Value,
    ) -> Result<PermissionDecision, OrchestratorError> {
        let mut decision = self.classify(action, declared, arguments);

        if decision.decision == Decision::RequireConfirmation {
            self.resolve_confirmation(scope, arguments, &mut decision).await;
        }

        self.audit
            .append(AuditEntry::for_decision(scope, &decision, arguments))?;

        tracing::info!(
            user_id = %scope.user_id,
            action,
            tier = %decision.risk_tier,
            decision = ?decision.decision,
            confirmation = ?decision.confirmation,
            "permission decision"
        );
        Ok(decision)
    }

    async fn resolve_confirmation(
        &self,
        scope: &AuditScope,
        arguments: &Value,
        decision: &mut PermissionDecision,
    ) {
        if let Some(grant) = self
            .grants
            .find(&scope.user_id, &decision.action, decision.risk_tier)
        {
            decision.decision = Decision::Allow;
            decision.confirmation = ConfirmationOutcome::Granted;
            decision.reason = format!(
                "covered by grant for '{}' up to {}",
                grant.action, grant.max_tier
            );
            return;
        }

        let request = ConfirmationRequest {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: scope.user_id.clone(),
            action: decision.action.clone(),
            risk_tier: decision.risk_tier,
            arguments: arguments.clone(),
            description: decision.reason.clone(),
        };

        let answer = tokio::time::timeout(
            self.confirmation_timeout,
            self.confirmation
                .request_confirmation(&request, self.confirmation_timeout),
        )
        .await;

        let (outcome, allowed, reason) = match answer {
            Ok(true) => (ConfirmationOutcome::Confirmed, true, "confirmed by user".to_string()),
            Ok(false) => (ConfirmationOutcome::Refused, false, "user declined".to_string()),
            Err(_) => (
                ConfirmationOutcome::TimedOut,
                false,
                format!(
                    "no confirmation within {}s",
                    self.confirmation_timeout.as_secs_f32()
                ),
            ),
        };
        decision.confirmation = outcome;
        decision.decision = if allowed { Decision::Allow } else { Decision::Deny };
        decision.reason = reason;
    }
}
