//! Content digests, storage key generation, and content type identification.

use base64::Engine;
use rand::Rng;

use crate::defaults::{FALLBACK_CONTENT_TYPE, STORAGE_KEY_LENGTH};

const BASE36_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Compute the blob checksum: base64 of the MD5 digest.
///
/// This matches the `Content-MD5` form object stores verify uploads against.
pub fn compute_checksum(data: &[u8]) -> String {
    let digest = md5::compute(data);
    base64::engine::general_purpose::STANDARD.encode(digest.0)
}

/// Generate a fresh random storage key (lowercase base36).
pub fn generate_storage_key() -> String {
    let mut rng = rand::thread_rng();
    (0..STORAGE_KEY_LENGTH)
        .map(|_| BASE36_ALPHABET[rng.gen_range(0..BASE36_ALPHABET.len())] as char)
        .collect()
}

/// Whether a key could have been produced by [`generate_storage_key`] or is
/// otherwise safe to use as a path component.
pub fn is_valid_storage_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 256
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Pick the content type for new content.
///
/// A declared type wins; otherwise magic bytes; otherwise the fallback.
pub fn identify_content_type(declared: Option<&str>, data: &[u8]) -> String {
    match declared.map(str::trim).filter(|ct| !ct.is_empty()) {
        Some(ct) => ct.to_string(),
        None => infer::get(data)
            .map(|kind| kind.mime_type().to_string())
            .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string()),
    }
}
