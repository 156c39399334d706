use super::super::RejectReason;
use super::Rejection;
use chrono::{DateTime, Utc};
use stablerail_mandate::MandateChain;

pub(crate) fn check_expiry_impl(chain: &MandateChain, now: DateTime<Utc>) -> Result<(), Rejection> {
    for mandate in chain.mandates() {
        if !mandate.is_live_at(now) {
            return Err(Rejection::new(
                RejectReason::MandateExpired,
                format!(
                    "{} {} expired at {}, now={}",
                    mandate.mandate_type(),
                    mandate.mandate_id,
                    mandate.expires_at,
                    now
                ),
            ));
        }
    }
    Ok(())
}

/// Intent domain, cart merchant domain and payment domain are one merchant,
/// and all three mandates carry the same nonce.
pub(crate) fn check_domain_binding_impl(chain: &MandateChain) -> Result<(), Rejection> {
    let cart = chain
        .cart_body()
        .ok_or_else(|| Rejection::malformed("cart slot holds no cart"))?;

    let intent_domain = chain.intent.domain.as_str();
    let payment_domain = chain.payment.domain.as_str();
    if intent_domain != cart.merchant_domain || cart.merchant_domain != payment_domain {
        return Err(Rejection::new(
            RejectReason::DomainMismatch,
            format!(
                "intent={} cart={} payment={}",
                intent_domain, cart.merchant_domain, payment_domain
            ),
        ));
    }

    let nonce = chain.intent.nonce.as_str();
    if chain.cart.nonce != nonce || chain.payment.nonce != nonce {
        return Err(Rejection::new(
            RejectReason::DomainMismatch,
            "nonce differs across the chain",
        ));
    }

    Ok(())
}

pub(crate) fn check_amount_impl(chain: &MandateChain) -> Result<(), Rejection> {
    let cart = chain
        .cart_body()
        .ok_or_else(|| Rejection::malformed("cart slot holds no cart"))?;
    let payment = chain
        .payment_body()
        .ok_or_else(|| Rejection::malformed("payment slot holds no payment"))?;
    let total = cart
        .total_minor()
        .ok_or_else(|| Rejection::malformed("subtotal + taxes overflows"))?;

    if payment.amount_minor > total {
        return Err(Rejection::new(
            RejectReason::AmountExceedsCart,
            format!("payment {} > cart total {}", payment.amount_minor, total),
        ));
    }
    Ok(())
}
