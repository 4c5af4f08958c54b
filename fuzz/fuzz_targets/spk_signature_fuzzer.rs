//! Fuzz target for signed prekey verification
//!
//! Signs a real SPK, then applies an arbitrary corruption before verifying.
//!
//! # Invariants
//!
//! - Verification NEVER panics, whatever text replaces a field
//! - An untouched bundle always verifies
//! - Any bit flip in the SPK or signature bytes is rejected as a mismatch

#![no_main]

use arbitrary::Arbitrary;
use base64::{Engine, engine::general_purpose::STANDARD};
use ed25519_dalek::{Signer, SigningKey};
use libfuzzer_sys::fuzz_target;
use prekey_crypto::{VerificationError, verify_signed_prekey};

#[derive(Debug, Arbitrary)]
struct Scenario {
    identity_seed: [u8; 32],
    spk_seed: [u8; 32],
    corruption: Corruption,
}

#[derive(Debug, Arbitrary)]
enum Corruption {
    None,
    /// Flip bits in one SPK byte
    FlipSpk { index: u8, mask: u8 },
    /// Flip bits in one signature byte
    FlipSignature { index: u8, mask: u8 },
    /// Replace the identity key text
    IdentityText(String),
    /// Replace the SPK text
    SpkText(String),
    /// Replace the signature text
    SignatureText(String),
}

fuzz_target!(|scenario: Scenario| {
    let identity = SigningKey::from_bytes(&scenario.identity_seed);
    let mut spk = SigningKey::from_bytes(&scenario.spk_seed).verifying_key().to_bytes();
    let mut signature = identity.sign(&spk).to_bytes();

    let mut identity_b64 = STANDARD.encode(identity.verifying_key().to_bytes());
    let mut spk_b64 = STANDARD.encode(spk);
    let mut signature_b64 = STANDARD.encode(signature);

    let mut flipped = false;
    let mut replaced = false;
    match scenario.corruption {
        Corruption::None => {},
        Corruption::FlipSpk { index, mask } => {
            spk[usize::from(index) % spk.len()] ^= mask;
            spk_b64 = STANDARD.encode(spk);
            flipped = mask != 0;
        },
        Corruption::FlipSignature { index, mask } => {
            signature[usize::from(index) % signature.len()] ^= mask;
            signature_b64 = STANDARD.encode(signature);
            flipped = mask != 0;
        },
        Corruption::IdentityText(text) => {
            replaced = text != identity_b64;
            identity_b64 = text;
        },
        Corruption::SpkText(text) => {
            replaced = text != spk_b64;
            spk_b64 = text;
        },
        Corruption::SignatureText(text) => {
            replaced = text != signature_b64;
            signature_b64 = text;
        },
    }

    let result = verify_signed_prekey(&identity_b64, &spk_b64, &signature_b64);

    if flipped {
        assert_eq!(result, Err(VerificationError::SignatureMismatch));
    } else if !replaced {
        assert_eq!(result, Ok(()), "untouched bundle must verify");
    }
});
