//! Conversions between WireGuard public keys and DNS labels.
//!
//! A WireGuard public key is 32 random bytes, conventionally written as
//! standard base64: 44 characters including one `=` of padding, drawing on
//! `+` and `/`. All three are illegal in a DNS label, so the DNS plane uses
//! RFC 4648 base32 without padding, lowercased — 52 alphanumeric characters.
//!
//! This module is the only bridge between the two encodings. Base64 is the
//! canonical form everywhere else (cache keys, KV store keys, alias targets);
//! base32 appears exclusively in query names and CNAME targets.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use data_encoding::BASE32_NOPAD;

/// Raw key length in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the base32 label form of a 32-byte key.
pub const LABEL_LEN: usize = 52;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("not a valid base32 label: {0:?}")]
    BadLabel(String),
    #[error("not a valid base64 key: {0:?}")]
    BadKey(String),
    #[error("key decodes to {0} bytes, expected {KEY_LEN}")]
    WrongLength(usize),
    #[error("input is neither a base64 key nor a base32 label: {0:?}")]
    Unrecognized(String),
}

/// Convert a DNS label (base32) to the canonical base64 public key.
///
/// DNS is case-insensitive, so the label is uppercased before decoding.
pub fn label_to_key(label: &str) -> Result<String, CodecError> {
    let upper = label.to_ascii_uppercase();
    let bytes = BASE32_NOPAD
        .decode(upper.as_bytes())
        .map_err(|_| CodecError::BadLabel(label.to_string()))?;
    if bytes.len() != KEY_LEN {
        return Err(CodecError::WrongLength(bytes.len()));
    }
    Ok(BASE64.encode(bytes))
}

/// Convert a canonical base64 public key to its lowercase DNS label.
pub fn key_to_label(key: &str) -> Result<String, CodecError> {
    let bytes = BASE64
        .decode(key)
        .map_err(|_| CodecError::BadKey(key.to_string()))?;
    if bytes.len() != KEY_LEN {
        return Err(CodecError::WrongLength(bytes.len()));
    }
    Ok(BASE32_NOPAD.encode(&bytes).to_ascii_lowercase())
}

/// Accept a key in either encoding and return the canonical base64 form.
///
/// A 32-byte base64 key always carries its `=` padding, so the presence of
/// `+`, `/` or `=` marks base64; a 52-character input with none of those is
/// a base32 label. Anything else is rejected.
pub fn normalize(input: &str) -> Result<String, CodecError> {
    if input.contains(['+', '/', '=']) {
        let bytes = BASE64
            .decode(input)
            .map_err(|_| CodecError::BadKey(input.to_string()))?;
        if bytes.len() != KEY_LEN {
            return Err(CodecError::WrongLength(bytes.len()));
        }
        Ok(BASE64.encode(bytes))
    } else if input.len() == LABEL_LEN {
        label_to_key(input)
    } else {
        Err(CodecError::Unrecognized(input.to_string()))
    }
}
