//! The key-wrap primitive: HKDF-SHA256 key derivation feeding a
//! ChaCha20-Poly1305 seal/open with an all-zero nonce.
//!
//! Grounded on `internal/pivplug/wrapkey.go` in the upstream Go
//! implementation and on the `age_core::primitives` calls in
//! `age-plugin-yubikey`'s `src/format.rs`/`src/yubikey.rs`. The zero nonce is
//! safe only because every wrapping key is derived from a salt
//! containing a fresh ephemeral public key — see DESIGN.md.

use age_core::format::FileKey;
use age_core::primitives::{aead_decrypt, aead_encrypt, hkdf};
use age_core::secrecy::ExposeSecret;

pub const WRAP_LABEL: &[u8] = b"age-encryption.org/v1/piv-p256";
pub const FILE_KEY_BYTES: usize = 16;
pub const WRAPPED_KEY_BYTES: usize = FILE_KEY_BYTES + 16;

/// Strips leading zero bytes from a big-endian field element, matching
/// the variable-length representation Go's `big.Int.Bytes()` produces
/// for an ECDH X-coordinate (Rust elliptic-curve crates zero-pad to a
/// fixed width instead). See SPEC_FULL.md, "Unpadded ECDH X-coordinate".
pub fn unpadded_big_endian(fixed_width: &[u8]) -> Vec<u8> {
    match fixed_width.iter().position(|&b| b != 0) {
        Some(i) => fixed_width[i..].to_vec(),
        None => Vec::new(),
    }
}

fn wrapping_key(shared_secret: &[u8], eph_compressed: &[u8], recip_compressed: &[u8]) -> [u8; 32] {
    let mut salt = Vec::with_capacity(eph_compressed.len() + recip_compressed.len());
    salt.extend_from_slice(eph_compressed);
    salt.extend_from_slice(recip_compressed);
    hkdf(&salt, WRAP_LABEL, shared_secret)
}

/// Seals `file_key` under a key derived from `shared_secret`.
pub fn wrap(
    shared_secret: &[u8],
    eph_compressed: &[u8],
    recip_compressed: &[u8],
    file_key: &FileKey,
) -> [u8; WRAPPED_KEY_BYTES] {
    let key = wrapping_key(shared_secret, eph_compressed, recip_compressed);
    let ciphertext = aead_encrypt(&key, file_key.expose_secret());
    let mut out = [0u8; WRAPPED_KEY_BYTES];
    out.copy_from_slice(&ciphertext);
    out
}

/// Opens a wrapped file key. Fails before attempting AEAD verification
/// if `wrapped` is not exactly `FILE_KEY_BYTES + 16` bytes long.
pub fn unwrap(
    shared_secret: &[u8],
    eph_compressed: &[u8],
    recip_compressed: &[u8],
    wrapped: &[u8],
) -> Result<FileKey, ()> {
    if wrapped.len() != WRAPPED_KEY_BYTES {
        return Err(());
    }
    let key = wrapping_key(shared_secret, eph_compressed, recip_compressed);
    let plaintext = aead_decrypt(&key, FILE_KEY_BYTES, wrapped).map_err(|_| ())?;
    let mut file_key = [0u8; FILE_KEY_BYTES];
    file_key.copy_from_slice(&plaintext);
    Ok(file_key.into())
}
