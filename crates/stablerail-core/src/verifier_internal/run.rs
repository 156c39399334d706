use super::super::{MandateVerifier, VerificationResult, VerifierError};
use super::{binding, replay, signature, structure, Rejection};
use chrono::{DateTime, Utc};
use stablerail_mandate::MandateChain;
use tracing::{info, warn};

pub(crate) async fn verify_chain_at_impl(
    verifier: &MandateVerifier,
    chain: &MandateChain,
    now: DateTime<Utc>,
) -> Result<VerificationResult, VerifierError> {
    let mandate_id = chain.payment.mandate_id.as_str();

    if let Err(rejection) = static_checks_impl(chain, now) {
        return Ok(rejected(mandate_id, rejection));
    }
    if let Err(rejection) =
        signature::check_signatures_impl(verifier.resolver.as_ref(), chain).await?
    {
        return Ok(rejected(mandate_id, rejection));
    }
    if let Err(rejection) = replay::reserve_chain_impl(verifier, chain, now).await? {
        return Ok(rejected(mandate_id, rejection));
    }

    info!(
        mandate_id,
        intent_id = %chain.intent.mandate_id,
        cart_id = %chain.cart.mandate_id,
        "mandate chain accepted"
    );
    Ok(VerificationResult::accept())
}

pub(crate) async fn verify_json_at_impl(
    verifier: &MandateVerifier,
    bytes: &[u8],
    now: DateTime<Utc>,
) -> Result<VerificationResult, VerifierError> {
    match serde_json::from_slice::<MandateChain>(bytes) {
        Ok(chain) => verify_chain_at_impl(verifier, &chain, now).await,
        Err(e) => Ok(rejected(
            "<undecoded>",
            Rejection::malformed(format!("decode failed: {}", e)),
        )),
    }
}

fn static_checks_impl(chain: &MandateChain, now: DateTime<Utc>) -> Result<(), Rejection> {
    structure::check_structure_impl(chain)?;
    binding::check_expiry_impl(chain, now)?;
    binding::check_domain_binding_impl(chain)?;
    binding::check_amount_impl(chain)?;
    Ok(())
}

fn rejected(mandate_id: &str, rejection: Rejection) -> VerificationResult {
    warn!(
        mandate_id,
        reason = rejection.reason.as_str(),
        detail = %rejection.detail,
        "mandate chain rejected"
    );
    VerificationResult::reject(rejection.reason)
}
