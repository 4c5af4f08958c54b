//! Ed25519 verification of signed prekeys

use ed25519_dalek::{Signature, VerifyingKey};

use crate::{
    encoding::decode_flexible_base64,
    error::{KeyFault, VerificationError},
};

/// Length in bytes of an Ed25519 public key (identity key and SPK).
pub const PUBLIC_KEY_LENGTH: usize = ed25519_dalek::PUBLIC_KEY_LENGTH;

/// Length in bytes of an Ed25519 signature.
pub const SIGNATURE_LENGTH: usize = ed25519_dalek::SIGNATURE_LENGTH;

/// Checks that a signed prekey was signed by an identity key.
///
/// The bundle service is generic over this trait so tests can substitute a
/// verifier; production uses [`Ed25519Verifier`].
pub trait PreKeyVerifier: Clone + Send + Sync + 'static {
    /// Verify `signature_b64` over the decoded `spk_b64` bytes using
    /// `identity_key_b64` as the public key.
    fn verify_signed_prekey(
        &self,
        identity_key_b64: &str,
        spk_b64: &str,
        signature_b64: &str,
    ) -> Result<(), VerificationError>;
}

/// [`PreKeyVerifier`] backed by [`verify_signed_prekey`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl PreKeyVerifier for Ed25519Verifier {
    fn verify_signed_prekey(
        &self,
        identity_key_b64: &str,
        spk_b64: &str,
        signature_b64: &str,
    ) -> Result<(), VerificationError> {
        verify_signed_prekey(identity_key_b64, spk_b64, signature_b64)
    }
}

/// Verify that `signature_b64` is the identity key's signature over the SPK.
///
/// All three inputs are base64 in any dialect accepted by
/// [`decode_flexible_base64`]. The signature covers the raw 32 SPK bytes, not
/// their base64 text.
///
/// # Errors
///
/// - `InvalidIdentityKey`: not base64, not 32 bytes, or not a curve point
/// - `InvalidSignedPreKey`: not base64 or not 32 bytes
/// - `InvalidSignature`: not base64 or not 64 bytes
/// - `SignatureMismatch`: well-formed inputs that do not verify
pub fn verify_signed_prekey(
    identity_key_b64: &str,
    spk_b64: &str,
    signature_b64: &str,
) -> Result<(), VerificationError> {
    let identity_key = decode_fixed::<PUBLIC_KEY_LENGTH>(identity_key_b64)
        .map_err(VerificationError::InvalidIdentityKey)?;
    let spk = decode_fixed::<PUBLIC_KEY_LENGTH>(spk_b64)
        .map_err(VerificationError::InvalidSignedPreKey)?;
    let signature = decode_fixed::<SIGNATURE_LENGTH>(signature_b64)
        .map_err(VerificationError::InvalidSignature)?;

    let verifying_key = VerifyingKey::from_bytes(&identity_key)
        .map_err(|_| VerificationError::InvalidIdentityKey(KeyFault::NotOnCurve))?;
    let signature = Signature::from_bytes(&signature);

    // Strict: small-order keys and R values never verify
    verifying_key
        .verify_strict(&spk, &signature)
        .map_err(|_| VerificationError::SignatureMismatch)
}

fn decode_fixed<const N: usize>(input: &str) -> Result<[u8; N], KeyFault> {
    let bytes = decode_flexible_base64(input)?;
    <[u8; N]>::try_from(bytes.as_slice())
        .map_err(|_| KeyFault::Length { expected: N, actual: bytes.len() })
}

#[cfg(test)]
mod tests {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use ed25519_dalek::{Signer, SigningKey};

    use super::*;

    struct Fixture {
        identity_key: String,
        spk: String,
        signature: String,
    }

    fn fixture(seed: u8) -> Fixture {
        let identity = SigningKey::from_bytes(&[seed; 32]);
        let spk = SigningKey::from_bytes(&[seed.wrapping_add(1); 32]).verifying_key().to_bytes();
        let signature = identity.sign(&spk);

        Fixture {
            identity_key: STANDARD.encode(identity.verifying_key().to_bytes()),
            spk: STANDARD.encode(spk),
            signature: STANDARD.encode(signature.to_bytes()),
        }
    }

    #[test]
    fn valid_signature_verifies() {
        let f = fixture(7);
        assert_eq!(verify_signed_prekey(&f.identity_key, &f.spk, &f.signature), Ok(()));
    }

    #[test]
    fn wrong_identity_key_is_mismatch() {
        let f = fixture(7);
        let other = fixture(9);

        let result = verify_signed_prekey(&other.identity_key, &f.spk, &f.signature);
        assert_eq!(result, Err(VerificationError::SignatureMismatch));
    }

    #[test]
    fn short_identity_key_is_rejected() {
        let f = fixture(7);
        let short = STANDARD.encode([1u8; 31]);

        let result = verify_signed_prekey(&short, &f.spk, &f.signature);
        assert_eq!(
            result,
            Err(VerificationError::InvalidIdentityKey(KeyFault::Length { expected: 32, actual: 31 }))
        );
    }

    #[test]
    fn long_spk_is_rejected() {
        let f = fixture(7);
        let long = STANDARD.encode([1u8; 33]);

        let result = verify_signed_prekey(&f.identity_key, &long, &f.signature);
        assert!(matches!(
            result,
            Err(VerificationError::InvalidSignedPreKey(KeyFault::Length { expected: 32, actual: 33 }))
        ));
    }

    #[test]
    fn truncated_signature_is_rejected() {
        let f = fixture(7);
        let truncated = STANDARD.encode([0u8; 63]);

        let result = verify_signed_prekey(&f.identity_key, &f.spk, &truncated);
        assert!(matches!(result, Err(VerificationError::InvalidSignature(KeyFault::Length { .. }))));
    }

    #[test]
    fn undecodable_inputs_name_the_field() {
        let f = fixture(7);

        assert!(matches!(
            verify_signed_prekey("***", &f.spk, &f.signature),
            Err(VerificationError::InvalidIdentityKey(KeyFault::Decode(_)))
        ));
        assert!(matches!(
            verify_signed_prekey(&f.identity_key, "***", &f.signature),
            Err(VerificationError::InvalidSignedPreKey(KeyFault::Decode(_)))
        ));
        assert!(matches!(
            verify_signed_prekey(&f.identity_key, &f.spk, "***"),
            Err(VerificationError::InvalidSignature(KeyFault::Decode(_)))
        ));
    }

    #[test]
    fn small_order_identity_key_is_rejected() {
        // Identity point as key, R = identity and s = 0: satisfies the plain
        // verification equation for any message
        let mut identity_point = [0u8; 32];
        identity_point[0] = 1;
        let mut signature = [0u8; 64];
        signature[..32].copy_from_slice(&identity_point);

        let f = fixture(7);
        let result = verify_signed_prekey(
            &STANDARD.encode(identity_point),
            &f.spk,
            &STANDARD.encode(signature),
        );
        assert_eq!(result, Err(VerificationError::SignatureMismatch));
    }

    #[test]
    fn trait_impl_delegates() {
        let f = fixture(3);
        let verifier = Ed25519Verifier;
        assert!(verifier.verify_signed_prekey(&f.identity_key, &f.spk, &f.signature).is_ok());
    }
}
