//! Inbound request verification
//!
//! Ties the signature primitives to actor resolution: extract the claimed
//! keyId, resolve the signer's public key, and verify the request. A
//! signature mismatch forces one fresh re-resolution of the actor before
//! rejecting, so key rotation does not permanently blacklist a peer.

use http::HeaderMap;

use crate::data::RemoteActor;
use crate::error::{AppError, VerificationError};
use crate::federation::resolver::ActorResolver;
use crate::federation::signature::{extract_signature_key_id, verify_signature};

/// Verify an inbound signed request and return the authenticated signer.
///
/// # Arguments
/// * `method` / `path` - Request target as received
/// * `headers` - All request headers
/// * `body` - Raw request body
/// * `resolver` - Used to obtain the signer's public key
/// * `clock_skew_seconds` - Accepted Date header skew
///
/// # Errors
/// `AppError::Verification` carrying the taxonomy variant; database
/// failures propagate unchanged.
pub async fn verify_inbound(
    method: &str,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
    resolver: &ActorResolver,
    clock_skew_seconds: i64,
) -> Result<RemoteActor, AppError> {
    let key_id = extract_signature_key_id(headers).map_err(AppError::Verification)?;

    let actor = resolve_signer(resolver, &key_id, false).await?;

    match verify_signature(
        method,
        path,
        headers,
        Some(body),
        &actor.public_key_pem,
        clock_skew_seconds,
    ) {
        Ok(()) => Ok(actor),
        // Only a cryptographic mismatch warrants a key refresh; stale
        // timestamps and digest mismatches would fail identically with a
        // rotated key.
        Err(VerificationError::InvalidSignature(_)) => {
            tracing::debug!(key_id = %key_id, "Signature mismatch, refreshing signer key");
            let refreshed = resolve_signer(resolver, &key_id, true).await?;

            verify_signature(
                method,
                path,
                headers,
                Some(body),
                &refreshed.public_key_pem,
                clock_skew_seconds,
            )
            .map_err(AppError::Verification)?;

            Ok(refreshed)
        }
        Err(other) => Err(AppError::Verification(other)),
    }
}

async fn resolve_signer(
    resolver: &ActorResolver,
    key_id: &str,
    force: bool,
) -> Result<RemoteActor, AppError> {
    let result = if force {
        resolver.resolve_fresh(key_id).await
    } else {
        resolver.resolve(key_id).await
    };

    match result {
        Ok(actor) => Ok(actor),
        Err(AppError::Resolution(e)) => Err(AppError::Verification(
            VerificationError::ActorUnresolvable(e),
        )),
        Err(other) => Err(other),
    }
}
