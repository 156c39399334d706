use super::super::{RejectReason, VerifierError};
use super::Rejection;
use crate::keys::KeyResolver;
use stablerail_mandate::{verify_proof, Mandate, MandateChain, ProofAlgorithm};
use tracing::debug;

/// Outer `Err` is a resolver failure; inner `Err` is a protocol rejection.
pub(crate) async fn check_signatures_impl(
    resolver: &dyn KeyResolver,
    chain: &MandateChain,
) -> Result<Result<(), Rejection>, VerifierError> {
    for mandate in chain.mandates() {
        if let Err(rejection) = check_one_impl(resolver, mandate).await? {
            return Ok(Err(rejection));
        }
    }
    Ok(Ok(()))
}

async fn check_one_impl(
    resolver: &dyn KeyResolver,
    mandate: &Mandate,
) -> Result<Result<(), Rejection>, VerifierError> {
    let Some(key) = resolver.resolve(&mandate.issuer).await? else {
        return Ok(Err(Rejection::new(
            RejectReason::UnknownIssuer,
            format!("no key for issuer {}", mandate.issuer),
        )));
    };

    if ProofAlgorithm::parse(&mandate.proof.algorithm).is_none() {
        return Ok(Err(Rejection::new(
            RejectReason::SignatureMalformed,
            format!("unsupported algorithm {}", mandate.proof.algorithm),
        )));
    }

    if let Err(e) = verify_proof(mandate, &key.public_key) {
        let reason = if e.is_malformed() {
            RejectReason::SignatureMalformed
        } else {
            RejectReason::SignatureInvalid
        };
        return Ok(Err(Rejection::new(
            reason,
            format!("{} {}: {}", mandate.mandate_type(), mandate.mandate_id, e),
        )));
    }

    if mandate.proof.verification_method != key.verification_method {
        return Ok(Err(Rejection::new(
            RejectReason::SignatureInvalid,
            format!(
                "verification method {} is not the issuer's key {}",
                mandate.proof.verification_method, key.verification_method
            ),
        )));
    }

    debug!(
        mandate_id = %mandate.mandate_id,
        issuer = %mandate.issuer,
        algorithm = %key.algorithm(),
        "proof verified"
    );
    Ok(Ok(()))
}
