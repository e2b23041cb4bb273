//! Abstraction over PIV card hardware access: enumerate attached
//! devices, open the one with the requested serial, and perform ECDH
//! against its private key in a retired key-management slot.
//!
//! Grounded on `internal/pivcard/pivcard.go` in the upstream Go
//! implementation (the `Opener`/`Card`/`Prompter` split) and on
//! `src/yubikey.rs` in `age-plugin-yubikey` for the `yubikey-piv` call
//! sequence (open by serial, read certificate, verify PIN,
//! `decrypt_data`).

use std::convert::TryFrom;

use p256::PublicKey;
use x509_parser::X509Certificate;
use yubikey_piv::certificate::{Certificate, PublicKeyInfo};
use yubikey_piv::key::{decrypt_data, AlgorithmId, RetiredSlotId, SlotId};
use yubikey_piv::{Serial, YubiKey};

use crate::error::Error;

const PIV_ORGANIZATION: &str = "age-plugin-yubikey";

/// Asks the user for a secret, given a human-readable prompt. Supplied
/// by the caller so that `card` has no dependency on the wire protocol.
pub type Prompter<'a> = &'a mut dyn FnMut(&str) -> Result<String, Error>;

/// Opens a `Card` by serial and slot.
pub trait Opener {
    fn open(&self, serial: u32, slot: u8) -> Result<Box<dyn Card>, Error>;
}

/// A single open PIV card session, positioned at one retired
/// key-management slot.
pub trait Card {
    fn public_key(&self) -> &PublicKey;

    /// Performs ECDH between the card's private key and `peer`,
    /// returning the raw (unpadded big-endian) X-coordinate of the
    /// shared point. Prompts for a PIN via `prompt` if the card
    /// requires one.
    fn shared_key(&mut self, peer: &PublicKey, prompt: Prompter) -> Result<Vec<u8>, Error>;
}

/// The production `Opener`, backed by the `yubikey-piv` crate.
pub struct PivOpener;

impl Opener for PivOpener {
    fn open(&self, serial: u32, slot: u8) -> Result<Box<dyn Card>, Error> {
        let piv_slot = RetiredSlotId::try_from(slot).map_err(|_| Error::CardNotFound)?;

        let mut yubikey = match YubiKey::open_by_serial(Serial::from(serial)) {
            Ok(yk) => yk,
            Err(_) => return Err(Error::CardNotFound),
        };

        let cert = Certificate::read(&mut yubikey, SlotId::Retired(piv_slot))
            .map_err(|_| Error::CardNotFound)?;
        let public_key = match cert.subject_pki() {
            PublicKeyInfo::EcP256(pubkey) => {
                public_key_from_sec1(pubkey).ok_or(Error::CardNotFound)?
            }
            _ => return Err(Error::CardNotFound),
        };
        if !has_expected_organization(cert.as_ref()) {
            log::debug!("ignoring card with wrong certificate organization");
            return Err(Error::CardNotFound);
        }

        Ok(Box::new(PivCard {
            yubikey,
            slot: piv_slot,
            public_key,
        }))
    }
}

fn public_key_from_sec1(bytes: &[u8]) -> Option<PublicKey> {
    use p256::elliptic_curve::sec1::FromEncodedPoint;
    let point = p256::EncodedPoint::from_bytes(bytes).ok()?;
    Option::from(PublicKey::from_encoded_point(&point))
}

/// Parses the certificate's raw DER and checks its subject Organization
/// attribute. Cards whose certificate doesn't carry this attestation
/// are not ones this plugin provisioned, and are skipped rather than
/// treated as an error — several YubiKeys may be attached at once.
fn has_expected_organization(der: &[u8]) -> bool {
    let cert: X509Certificate = match x509_parser::parse_x509_der(der) {
        Ok((_, cert)) => cert,
        Err(_) => return false,
    };
    match cert.subject().iter_organization().next() {
        Some(org) => org.as_str() == Ok(PIV_ORGANIZATION),
        None => false,
    }
}

struct PivCard {
    yubikey: YubiKey,
    slot: RetiredSlotId,
    public_key: PublicKey,
}

impl Card for PivCard {
    fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    fn shared_key(&mut self, peer: &PublicKey, prompt: Prompter) -> Result<Vec<u8>, Error> {
        let pin = prompt(&format!(
            "Enter PIN for YubiKey with serial {}",
            self.yubikey.serial()
        ))?;
        self.yubikey
            .verify_pin(pin.as_bytes())
            .map_err(|_| Error::CardNotFound)?;

        use p256::elliptic_curve::sec1::ToEncodedPoint;
        let peer_bytes = peer.to_encoded_point(false);
        let shared_secret = decrypt_data(
            &mut self.yubikey,
            peer_bytes.as_bytes(),
            AlgorithmId::EccP256,
            SlotId::Retired(self.slot),
        )?;
        Ok(crate::wrap::unpadded_big_endian(shared_secret.as_ref()))
    }
}

/// A test-only `Opener`/`Card` pair backed by a fixed, reusable private
/// scalar, used so identity-plugin tests don't need real hardware.
/// Grounded on `mock_pivcard` in the upstream Go test suite,
/// reimplemented with `p256::ecdh` since that module (unlike `ring`)
/// can perform Diffie-Hellman from a known, non-ephemeral scalar.
///
/// Not behind `#[cfg(test)]`: the integration tests under `tests/`
/// compile this crate without the `test` cfg, so the module needs to
/// be an ordinary, always-available part of the public API.
pub mod mock {
    use super::*;
    use p256::ecdh::diffie_hellman;
    use p256::elliptic_curve::sec1::ToEncodedPoint;
    use p256::{NonZeroScalar, SecretKey};

    pub struct MockOpener {
        pub serial: u32,
        pub slot: u8,
        pub private_key: SecretKey,
    }

    impl Opener for MockOpener {
        fn open(&self, serial: u32, slot: u8) -> Result<Box<dyn Card>, Error> {
            if serial != self.serial || slot != self.slot {
                return Err(Error::CardNotFound);
            }
            Ok(Box::new(MockCard {
                public_key: self.private_key.public_key(),
                private_scalar: self.private_key.to_nonzero_scalar(),
            }))
        }
    }

    pub struct MockCard {
        public_key: PublicKey,
        private_scalar: NonZeroScalar,
    }

    impl Card for MockCard {
        fn public_key(&self) -> &PublicKey {
            &self.public_key
        }

        fn shared_key(&mut self, peer: &PublicKey, _prompt: Prompter) -> Result<Vec<u8>, Error> {
            let shared = diffie_hellman(&self.private_scalar, peer.as_affine());
            let x = shared.raw_secret_bytes();
            Ok(crate::wrap::unpadded_big_endian(x.as_slice()))
        }
    }

    #[test]
    fn mock_shared_key_matches_identity_fixture() {
        let private_scalar_dec =
            "54174045537741477645260415415255655016742280391432862109950881580092809591406";
        let scalar = NonZeroScalar::from_repr(
            p256::FieldBytes::clone_from_slice(&num_to_be_bytes(private_scalar_dec)),
        )
        .unwrap();
        let private_key = SecretKey::from(scalar);
        let opener = MockOpener {
            serial: 0x0102_0304,
            slot: 0x82,
            private_key,
        };
        let mut card = opener.open(0x0102_0304, 0x82).unwrap();

        let eph_compressed = base64_literal("AuXWo0GaigX07s5MpZ3O7W0LepaRgaQRZ8hcFzQyGPc5");
        let eph_point = p256::EncodedPoint::from_bytes(&eph_compressed).unwrap();
        let eph_public = PublicKey::from_encoded_point(&eph_point).unwrap();

        let shared = card.shared_key(&eph_public, &mut |_| Ok(String::new())).unwrap();
        assert_eq!(
            hex::encode(&shared),
            "0ec448ca7e5bbeacff89d868d714d1a9794e8538b2f92d7f8b95bc274457bded"
        );

        let recip_compressed = card.public_key().to_encoded_point(true);
        assert_eq!(
            base64::encode_config(recip_compressed.as_bytes(), base64::STANDARD_NO_PAD),
            "A2EY/MZxUdkdTAZbLn0Ly0GQGuyK58olRxAj8LghVSVe"
        );
    }

    fn num_to_be_bytes(dec: &str) -> [u8; 32] {
        // Converts a decimal string into a 32-byte big-endian scalar.
        // Avoids pulling in a bignum crate for a single test fixture.
        let mut digits: Vec<u8> = dec.bytes().map(|b| b - b'0').collect();
        let mut out = [0u8; 32];
        for i in (0..32).rev() {
            let mut rem = 0u32;
            for d in digits.iter_mut() {
                let cur = rem * 10 + *d as u32;
                *d = (cur / 256) as u8;
                rem = cur % 256;
            }
            out[i] = rem as u8;
            while digits.len() > 1 && digits[0] == 0 {
                digits.remove(0);
            }
        }
        out
    }

    fn base64_literal(s: &str) -> Vec<u8> {
        base64::decode_config(s, base64::STANDARD_NO_PAD).unwrap()
    }
}
