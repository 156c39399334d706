use super::Rejection;
use crate::ledger::MAX_AMOUNT_MINOR;
use stablerail_mandate::{Mandate, MandateChain, MandateType};

pub(crate) fn check_structure_impl(chain: &MandateChain) -> Result<(), Rejection> {
    let slots = [
        (MandateType::Intent, &chain.intent),
        (MandateType::Cart, &chain.cart),
        (MandateType::Payment, &chain.payment),
    ];
    for (expected, mandate) in slots {
        check_mandate_impl(expected, mandate)?;
    }

    let cart = chain
        .cart_body()
        .ok_or_else(|| Rejection::malformed("cart slot holds no cart"))?;
    if cart.total_minor().is_none() {
        return Err(Rejection::malformed(format!(
            "cart {}: subtotal + taxes overflows",
            chain.cart.mandate_id
        )));
    }

    let payment = chain
        .payment_body()
        .ok_or_else(|| Rejection::malformed("payment slot holds no payment"))?;
    if payment.amount_minor > MAX_AMOUNT_MINOR {
        return Err(Rejection::malformed(format!(
            "payment {}: amount {} exceeds {}",
            chain.payment.mandate_id, payment.amount_minor, MAX_AMOUNT_MINOR
        )));
    }
    for (field, value) in [
        ("token", &payment.token),
        ("chain", &payment.chain),
        ("destination", &payment.destination),
    ] {
        if value.trim().is_empty() {
            return Err(Rejection::malformed(format!(
                "payment {}: empty {}",
                chain.payment.mandate_id, field
            )));
        }
    }

    let [intent, cart, payment] = chain.mandates();
    if intent.mandate_id == cart.mandate_id
        || intent.mandate_id == payment.mandate_id
        || cart.mandate_id == payment.mandate_id
    {
        return Err(Rejection::malformed("mandate ids within a chain must be distinct"));
    }

    Ok(())
}

fn check_mandate_impl(expected: MandateType, mandate: &Mandate) -> Result<(), Rejection> {
    let required = [
        ("mandate_id", &mandate.mandate_id),
        ("issuer", &mandate.issuer),
        ("subject", &mandate.subject),
        ("nonce", &mandate.nonce),
        ("domain", &mandate.domain),
        ("proof.signature", &mandate.proof.signature),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(Rejection::malformed(format!(
                "{} mandate: empty {}",
                expected, field
            )));
        }
    }

    if mandate.mandate_type() != expected {
        return Err(Rejection::malformed(format!(
            "{} slot holds a {} mandate ({})",
            expected,
            mandate.mandate_type(),
            mandate.mandate_id
        )));
    }

    if mandate.created_at > mandate.expires_at {
        return Err(Rejection::malformed(format!(
            "mandate {}: created_at after expires_at",
            mandate.mandate_id
        )));
    }

    Ok(())
}
