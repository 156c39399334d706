//! Spending policy: the financial firewall between a verified payment
//! mandate and the chain.
//!
//! A [`SpendingPolicy`] belongs to one agent. [`evaluate`] decides whether a
//! spend fits it without side effects; [`PolicyStore::commit`] re-checks and
//! records the spend against every counter in one transaction.

mod engine;
mod store;
mod window;

pub use engine::{commit_spend, evaluate, revert_spend};
pub use store::{PolicyStore, PolicyStoreError, VersionedPolicy};
pub use window::{period_end, period_start};

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Low,
    #[default]
    Medium,
    High,
    /// Bypasses the per-transaction limit and the time windows. Merchant
    /// rules and scopes still apply.
    Unlimited,
}

/// Calendar-aligned (UTC) spending window. Evaluated in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    Daily,
    Weekly,
    Monthly,
}

impl WindowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    fn exceeded(&self) -> PolicyRejection {
        match self {
            Self::Daily => PolicyRejection::ExceedsDailyLimit,
            Self::Weekly => PolicyRejection::ExceedsWeeklyLimit,
            Self::Monthly => PolicyRejection::ExceedsMonthlyLimit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindowLimit {
    pub limit_amount: u64,
    #[serde(default)]
    pub current_spent: u64,
    /// Start of the period `current_spent` belongs to. Unset until first use.
    #[serde(default)]
    pub window_start: Option<DateTime<Utc>>,
}

impl TimeWindowLimit {
    pub fn new(limit_amount: u64) -> Self {
        Self {
            limit_amount,
            current_spent: 0,
            window_start: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MerchantMode {
    /// Only merchants matched by a live allow rule may be paid.
    AllowList,
    /// Any merchant not denied may be paid.
    #[default]
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTarget {
    Merchant(String),
    Category(String),
}

impl RuleTarget {
    fn matches(&self, request: &SpendRequest) -> bool {
        match self {
            Self::Merchant(id) => *id == request.merchant_id,
            Self::Category(c) => request.category.as_deref() == Some(c.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerchantRule {
    pub rule_type: RuleType,
    pub target: RuleTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_per_tx: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_limit: Option<u64>,
    /// Rule is ignored once `expires_at < now`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Daily counter for `daily_limit`.
    #[serde(default)]
    pub current_spent: u64,
    #[serde(default)]
    pub window_start: Option<DateTime<Utc>>,
}

impl MerchantRule {
    fn new(rule_type: RuleType, target: RuleTarget) -> Self {
        Self {
            rule_type,
            target,
            max_per_tx: None,
            daily_limit: None,
            expires_at: None,
            current_spent: 0,
            window_start: None,
        }
    }

    pub fn allow_merchant(merchant_id: impl Into<String>) -> Self {
        Self::new(RuleType::Allow, RuleTarget::Merchant(merchant_id.into()))
    }

    pub fn deny_merchant(merchant_id: impl Into<String>) -> Self {
        Self::new(RuleType::Deny, RuleTarget::Merchant(merchant_id.into()))
    }

    pub fn allow_category(category: impl Into<String>) -> Self {
        Self::new(RuleType::Allow, RuleTarget::Category(category.into()))
    }

    pub fn deny_category(category: impl Into<String>) -> Self {
        Self::new(RuleType::Deny, RuleTarget::Category(category.into()))
    }

    pub fn with_max_per_tx(mut self, max: u64) -> Self {
        self.max_per_tx = Some(max);
        self
    }

    pub fn with_daily_limit(mut self, limit: u64) -> Self {
        self.daily_limit = Some(limit);
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        !self.expires_at.is_some_and(|e| e < now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Retail,
    Digital,
    AgentToAgent,
    Subscription,
    Services,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retail => "retail",
            Self::Digital => "digital",
            Self::AgentToAgent => "agent_to_agent",
            Self::Subscription => "subscription",
            Self::Services => "services",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendingPolicy {
    pub agent_id: String,
    #[serde(default)]
    pub trust_level: TrustLevel,
    pub limit_per_tx: u64,
    #[serde(default)]
    pub windows: BTreeMap<WindowType, TimeWindowLimit>,
    #[serde(default)]
    pub merchant_mode: MerchantMode,
    /// Evaluated in order.
    #[serde(default)]
    pub merchant_rules: Vec<MerchantRule>,
    #[serde(default)]
    pub allowed_scopes: BTreeSet<Scope>,
}

impl SpendingPolicy {
    /// Policy allowing every scope, with no windows and no merchant rules.
    pub fn new(agent_id: impl Into<String>, trust_level: TrustLevel, limit_per_tx: u64) -> Self {
        Self {
            agent_id: agent_id.into(),
            trust_level,
            limit_per_tx,
            windows: BTreeMap::new(),
            merchant_mode: MerchantMode::Open,
            merchant_rules: Vec::new(),
            allowed_scopes: [
                Scope::Retail,
                Scope::Digital,
                Scope::AgentToAgent,
                Scope::Subscription,
                Scope::Services,
            ]
            .into_iter()
            .collect(),
        }
    }

    pub fn with_window(mut self, window: WindowType, limit_amount: u64) -> Self {
        self.windows.insert(window, TimeWindowLimit::new(limit_amount));
        self
    }

    pub fn with_rule(mut self, rule: MerchantRule) -> Self {
        self.merchant_rules.push(rule);
        self
    }

    pub fn with_merchant_mode(mut self, mode: MerchantMode) -> Self {
        self.merchant_mode = mode;
        self
    }

    pub fn with_scopes(mut self, scopes: impl IntoIterator<Item = Scope>) -> Self {
        self.allowed_scopes = scopes.into_iter().collect();
        self
    }
}

/// What is being spent, and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendRequest {
    pub amount_minor: u64,
    pub merchant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub scope: Scope,
}

impl SpendRequest {
    pub fn new(amount_minor: u64, merchant_id: impl Into<String>, scope: Scope) -> Self {
        Self {
            amount_minor,
            merchant_id: merchant_id.into(),
            category: None,
            scope,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyRejection {
    #[error("scope not allowed")]
    ScopeNotAllowed,

    #[error("merchant denied")]
    MerchantDenied,

    #[error("merchant not on allow list")]
    MerchantNotAllowed,

    #[error("exceeds per-transaction limit")]
    ExceedsPerTxLimit,

    #[error("exceeds merchant per-transaction limit")]
    ExceedsMerchantPerTxLimit,

    #[error("exceeds merchant daily limit")]
    ExceedsMerchantDailyLimit,

    #[error("exceeds daily limit")]
    ExceedsDailyLimit,

    #[error("exceeds weekly limit")]
    ExceedsWeeklyLimit,

    #[error("exceeds monthly limit")]
    ExceedsMonthlyLimit,
}

impl PolicyRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScopeNotAllowed => "scope_not_allowed",
            Self::MerchantDenied => "merchant_denied",
            Self::MerchantNotAllowed => "merchant_not_allowed",
            Self::ExceedsPerTxLimit => "exceeds_per_tx_limit",
            Self::ExceedsMerchantPerTxLimit => "exceeds_merchant_per_tx_limit",
            Self::ExceedsMerchantDailyLimit => "exceeds_merchant_daily_limit",
            Self::ExceedsDailyLimit => "exceeds_daily_limit",
            Self::ExceedsWeeklyLimit => "exceeds_weekly_limit",
            Self::ExceedsMonthlyLimit => "exceeds_monthly_limit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<PolicyRejection>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: PolicyRejection) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Result of [`PolicyStore::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Spend recorded; the policy row is now at `version`.
    Committed { version: i64 },
    /// This mandate was committed before; nothing changed.
    AlreadyCommitted,
    /// The spend no longer fits, e.g. a concurrent commit used the headroom.
    Rejected(PolicyRejection),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_policy_wire_form() {
        let policy = SpendingPolicy::new("agent-7", TrustLevel::High, 100)
            .with_window(WindowType::Daily, 150)
            .with_merchant_mode(MerchantMode::AllowList)
            .with_rule(MerchantRule::allow_merchant("shop.example").with_max_per_tx(90))
            .with_rule(MerchantRule::deny_category("gambling"))
            .with_scopes([Scope::Retail, Scope::AgentToAgent]);

        let value = serde_json::to_value(&policy).unwrap();
        assert_eq!(value["trust_level"], "high");
        assert_eq!(value["merchant_mode"], "allow_list");
        assert_eq!(value["windows"]["daily"]["limit_amount"], 150);
        assert_eq!(value["merchant_rules"][0]["target"], json!({"merchant": "shop.example"}));
        assert_eq!(value["merchant_rules"][1]["rule_type"], "deny");
        assert_eq!(value["allowed_scopes"], json!(["retail", "agent_to_agent"]));

        let back: SpendingPolicy = serde_json::from_value(value).unwrap();
        assert_eq!(back, policy);
    }

    #[test]
    fn test_minimal_policy_defaults() {
        let policy: SpendingPolicy =
            serde_json::from_value(json!({"agent_id": "a", "limit_per_tx": 10})).unwrap();
        assert_eq!(policy.trust_level, TrustLevel::Medium);
        assert_eq!(policy.merchant_mode, MerchantMode::Open);
        assert!(policy.allowed_scopes.is_empty());
    }

    #[test]
    fn test_negative_limit_rejected() {
        let result: Result<SpendingPolicy, _> =
            serde_json::from_value(json!({"agent_id": "a", "limit_per_tx": -1}));
        assert!(result.is_err());
    }
}
