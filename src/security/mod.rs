//! 安全层：风险等级、拒绝规则、权限闸门、确认通道与授权

pub mod confirmation;
pub mod gate;
pub mod grants;
pub mod policy;
pub mod risk;

pub use confirmation::{
    AutoConfirm, ConfirmationChannel, ConfirmationRequest, DenyConfirm, TerminalConfirmation,
};
pub use gate::PermissionGate;
pub use grants::{GrantStore, PermissionGrant};
pub use policy::DenyPolicy;
pub use risk::{ConfirmationOutcome, Decision, PermissionDecision, RiskTier};
