//! Lenient base64 decoding for client-supplied key material

use std::borrow::Cow;

use base64::{
    Engine as _, alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};

use crate::error::DecodeError;

/// Ignore non-zero bits past the last full byte, as most client encoders do.
const LENIENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true);

const URL_SAFE_NO_PAD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    LENIENT.with_encode_padding(false).with_decode_padding_mode(DecodePaddingMode::RequireNone),
);

const URL_SAFE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    LENIENT.with_decode_padding_mode(DecodePaddingMode::RequireCanonical),
);

const STANDARD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    LENIENT.with_decode_padding_mode(DecodePaddingMode::RequireCanonical),
);

/// Decode base64 produced by any of the client dialects we accept.
///
/// Dialects are tried in order: URL-safe without padding, URL-safe with
/// padding, standard alphabet with padding. The first that succeeds wins.
/// An input that is valid in more than one dialect (no `+`, `/`, `-`, `_`)
/// decodes to the same bytes in each of them, so the order only matters for
/// which error is reported.
///
/// Line breaks (`\r`, `\n`) anywhere in the input are skipped, and the
/// unused low bits of the final character may be non-zero.
pub fn decode_flexible_base64(input: &str) -> Result<Vec<u8>, DecodeError> {
    let input = strip_line_breaks(input);

    if let Ok(bytes) = URL_SAFE_NO_PAD.decode(input.as_bytes()) {
        return Ok(bytes);
    }
    if let Ok(bytes) = URL_SAFE.decode(input.as_bytes()) {
        return Ok(bytes);
    }
    STANDARD.decode(input.as_bytes()).map_err(|source| DecodeError { source })
}

fn strip_line_breaks(input: &str) -> Cow<'_, str> {
    if input.contains(['\r', '\n']) {
        Cow::Owned(input.replace(['\r', '\n'], ""))
    } else {
        Cow::Borrowed(input)
    }
}
