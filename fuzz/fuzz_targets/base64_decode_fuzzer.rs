//! Fuzz target for lenient base64 decoding
//!
//! Feeds arbitrary strings to `decode_flexible_base64` and checks:
//! - Decoding NEVER panics
//! - Anything that decodes re-encodes in standard base64 and decodes again
//!   to the same bytes

#![no_main]

use base64::{Engine, engine::general_purpose::STANDARD};
use libfuzzer_sys::fuzz_target;
use prekey_crypto::decode_flexible_base64;

fuzz_target!(|input: &str| {
    let Ok(bytes) = decode_flexible_base64(input) else {
        return;
    };

    let canonical = STANDARD.encode(&bytes);
    let again = decode_flexible_base64(&canonical).expect("standard base64 must decode");
    assert_eq!(again, bytes);
});
