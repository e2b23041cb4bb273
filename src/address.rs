//! Bech32 encoding of PIV recipient/identity strings, and the 4-byte
//! recipient tag.
//!
//! Grounded on `src/p256.rs` in `age-plugin-yubikey` and on
//! `internal/pivplug/{recipient,identity}.go` in the upstream Go
//! implementation.

use bech32::{FromBase32, ToBase32};
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, PublicKey};
use sha2::{Digest, Sha256};

use crate::error::Error;

pub const RECIPIENT_PREFIX: &str = "age1yubikey";
pub const IDENTITY_PREFIX: &str = "age-plugin-yubikey-";

pub const TAG_BYTES: usize = 4;
pub const COMPRESSED_POINT_BYTES: usize = 33;

/// Decodes `s` as Bech32 and requires (after lowercasing) that its HRP
/// equal `hrp`. Bech32 is case-normalizing: age renders recipients in
/// lowercase and identities in uppercase, but both are accepted on
/// input regardless of case.
fn decode_bech32(s: &str, hrp: &str) -> Result<Vec<u8>, Error> {
    let (got_hrp, data) = bech32::decode(&s.to_lowercase())?;
    if got_hrp != hrp {
        return Err(Error::InvalidRecipient(format!(
            "wrong human-readable prefix: {got_hrp}"
        )));
    }
    Ok(Vec::<u8>::from_base32(&data)?)
}

/// A decoded `age1yubikey...` recipient string: a compressed P-256
/// point plus the tag derived from the recipient *string* (not the key
/// bytes).
#[derive(Debug, Clone)]
pub struct PivRecipient {
    pub compressed: [u8; COMPRESSED_POINT_BYTES],
    pub public_key: PublicKey,
    pub tag: [u8; TAG_BYTES],
}

/// `SHA256(recipient_string)[0..4]`.
pub fn tag_from_recipient_string(recipient: &str) -> [u8; TAG_BYTES] {
    let digest = Sha256::digest(recipient.as_bytes());
    let mut tag = [0u8; TAG_BYTES];
    tag.copy_from_slice(&digest[..TAG_BYTES]);
    tag
}

/// Bech32-encodes a compressed P-256 point with the `age1yubikey`
/// prefix.
pub fn format_recipient(compressed: &[u8; COMPRESSED_POINT_BYTES]) -> String {
    bech32::encode(RECIPIENT_PREFIX, compressed.to_base32())
        .expect("HRP and data are always valid")
}

impl PivRecipient {
    pub fn parse(s: &str) -> Result<Self, Error> {
        let data = decode_bech32(s, RECIPIENT_PREFIX)?;
        if data.len() != COMPRESSED_POINT_BYTES {
            return Err(Error::InvalidRecipient(format!(
                "wrong payload length: {}",
                data.len()
            )));
        }
        let mut compressed = [0u8; COMPRESSED_POINT_BYTES];
        compressed.copy_from_slice(&data);

        let point = EncodedPoint::from_bytes(&compressed[..])
            .map_err(|_| Error::InvalidRecipient("not a valid SEC1 point".to_string()))?;
        let public_key = Option::<PublicKey>::from(PublicKey::from_encoded_point(&point))
            .ok_or_else(|| {
                Error::InvalidRecipient("does not contain a compressed P-256 key".to_string())
            })?;

        // The tag is defined over the recipient string, not the key
        // bytes, so it must be recomputed from the canonical (lowercase)
        // form of whatever was actually parsed.
        let tag = tag_from_recipient_string(&format_recipient(&compressed));

        Ok(PivRecipient {
            compressed,
            public_key,
            tag,
        })
    }

    pub fn from_public_key(public_key: PublicKey) -> Self {
        let encoded = public_key.to_encoded_point(true);
        let mut compressed = [0u8; COMPRESSED_POINT_BYTES];
        compressed.copy_from_slice(encoded.as_bytes());
        let tag = tag_from_recipient_string(&format_recipient(&compressed));
        PivRecipient {
            compressed,
            public_key,
            tag,
        }
    }

    pub fn to_string(&self) -> String {
        format_recipient(&self.compressed)
    }
}

/// A decoded `AGE-PLUGIN-YUBIKEY-...` identity string: which card,
/// which slot, and the tag of the key that was in that slot when the
/// identity was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PivIdentity {
    pub serial: u32,
    pub slot: u8,
    pub tag: [u8; TAG_BYTES],
}

impl PivIdentity {
    pub fn parse(s: &str) -> Result<Self, Error> {
        let data = decode_bech32(s, IDENTITY_PREFIX)?;
        if data.len() != 4 + 1 + TAG_BYTES {
            return Err(Error::InvalidIdentity(format!(
                "wrong payload length: {}",
                data.len()
            )));
        }
        let serial = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let slot = data[4];
        let mut tag = [0u8; TAG_BYTES];
        tag.copy_from_slice(&data[5..9]);
        Ok(PivIdentity { serial, slot, tag })
    }
}
