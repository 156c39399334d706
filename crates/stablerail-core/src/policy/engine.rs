//! Policy evaluation.
//!
//! Order, first failure wins:
//! 1. Scope
//! 2. Merchant rules (deny beats allow; allow-list mode needs an allow)
//! 3. Per-transaction limit
//! 4. Daily, weekly, monthly windows
//!
//! `TrustLevel::Unlimited` skips 3 and 4 only.

use chrono::{DateTime, Utc};

use super::window::{period_start, roll_over};
use super::{
    Decision, MerchantMode, PolicyRejection, RuleType, SpendRequest, SpendingPolicy, TrustLevel,
    WindowType,
};

/// Decide whether `request` fits `policy` at `now`. Pure: rollover is
/// applied to a copy.
pub fn evaluate(policy: &SpendingPolicy, request: &SpendRequest, now: DateTime<Utc>) -> Decision {
    let mut current = policy.clone();
    roll_over_all(&mut current, now);
    match check(&current, request, now) {
        Ok(_) => Decision::allow(),
        Err(reason) => Decision::deny(reason),
    }
}

/// Roll windows over, re-check, and add the spend to every window counter
/// and to the matching allow rule's daily counter. Returns the index of that
/// rule. On rejection `policy` may have been rolled over but carries no new
/// spend.
pub fn commit_spend(
    policy: &mut SpendingPolicy,
    request: &SpendRequest,
    now: DateTime<Utc>,
) -> Result<Option<usize>, PolicyRejection> {
    roll_over_all(policy, now);
    let matched_allow = check(policy, request, now)?;

    let amount = request.amount_minor;
    for window in policy.windows.values_mut() {
        window.current_spent = window.current_spent.saturating_add(amount);
    }
    if let Some(index) = matched_allow {
        let rule = &mut policy.merchant_rules[index];
        rule.current_spent = rule.current_spent.saturating_add(amount);
    }
    Ok(matched_allow)
}

/// Take back a spend committed at `committed_at`. Only counters still in the
/// period that spend landed in are reduced. `rule_index` is the value
/// [`commit_spend`] returned; it is skipped unless that rule is still an
/// allow rule matching `request`.
pub fn revert_spend(
    policy: &mut SpendingPolicy,
    request: &SpendRequest,
    rule_index: Option<usize>,
    committed_at: DateTime<Utc>,
) {
    let amount = request.amount_minor;
    let same_period = |window: WindowType, start: Option<DateTime<Utc>>| {
        start.is_some_and(|s| period_start(window, s) == period_start(window, committed_at))
    };

    for (window_type, window) in policy.windows.iter_mut() {
        if same_period(*window_type, window.window_start) {
            window.current_spent = window.current_spent.saturating_sub(amount);
        }
    }
    if let Some(rule) = rule_index.and_then(|i| policy.merchant_rules.get_mut(i)) {
        if rule.rule_type == RuleType::Allow
            && rule.target.matches(request)
            && same_period(WindowType::Daily, rule.window_start)
        {
            rule.current_spent = rule.current_spent.saturating_sub(amount);
        }
    }
}

fn roll_over_all(policy: &mut SpendingPolicy, now: DateTime<Utc>) {
    for (window_type, window) in policy.windows.iter_mut() {
        roll_over(
            *window_type,
            &mut window.current_spent,
            &mut window.window_start,
            now,
        );
    }
    for rule in policy.merchant_rules.iter_mut() {
        roll_over(
            WindowType::Daily,
            &mut rule.current_spent,
            &mut rule.window_start,
            now,
        );
    }
}

/// `Ok(Some(i))` when `merchant_rules[i]` is the allow rule that applied.
fn check(
    policy: &SpendingPolicy,
    request: &SpendRequest,
    now: DateTime<Utc>,
) -> Result<Option<usize>, PolicyRejection> {
    let amount = request.amount_minor;

    if !policy.allowed_scopes.contains(&request.scope) {
        return Err(PolicyRejection::ScopeNotAllowed);
    }

    let matched_allow = check_merchant_rules(policy, request, now)?;

    let unlimited = policy.trust_level == TrustLevel::Unlimited;
    if !unlimited && amount > policy.limit_per_tx {
        return Err(PolicyRejection::ExceedsPerTxLimit);
    }

    if !unlimited {
        for (window_type, window) in &policy.windows {
            if !fits(window.current_spent, amount, window.limit_amount) {
                return Err(window_type.exceeded());
            }
        }
    }

    Ok(matched_allow)
}

fn check_merchant_rules(
    policy: &SpendingPolicy,
    request: &SpendRequest,
    now: DateTime<Utc>,
) -> Result<Option<usize>, PolicyRejection> {
    let matching = || {
        policy
            .merchant_rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.is_live_at(now) && rule.target.matches(request))
    };

    if matching().any(|(_, rule)| rule.rule_type == RuleType::Deny) {
        return Err(PolicyRejection::MerchantDenied);
    }

    let Some((index, rule)) = matching().find(|(_, rule)| rule.rule_type == RuleType::Allow) else {
        return match policy.merchant_mode {
            MerchantMode::AllowList => Err(PolicyRejection::MerchantNotAllowed),
            MerchantMode::Open => Ok(None),
        };
    };

    if rule.max_per_tx.is_some_and(|max| request.amount_minor > max) {
        return Err(PolicyRejection::ExceedsMerchantPerTxLimit);
    }
    if let Some(limit) = rule.daily_limit {
        if !fits(rule.current_spent, request.amount_minor, limit) {
            return Err(PolicyRejection::ExceedsMerchantDailyLimit);
        }
    }
    Ok(Some(index))
}

fn fits(spent: u64, amount: u64, limit: u64) -> bool {
    spent.checked_add(amount).is_some_and(|total| total <= limit)
}
