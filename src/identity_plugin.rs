//! The `identity-v1` state machine: unwraps file keys against PIV
//! identities supplied by the host.
//!
//! Grounded on `internal/pivplug/identity.go` in the upstream Go
//! implementation, reimplemented in idiomatic Rust with the corrected
//! EOF handling described in SPEC_FULL.md (`Conn::read_stanza` already
//! distinguishes a clean end of input from one mid-stanza).

use std::io::{Read, Write};

use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, PublicKey};

use crate::address::{format_recipient, tag_from_recipient_string, PivIdentity, TAG_BYTES};
use crate::card::Opener;
use crate::error::Error;
use crate::stanza::{Conn, Stanza};
use crate::wrap;

struct RecipientStanza {
    index: String,
    tag: [u8; TAG_BYTES],
    eph_compressed: Vec<u8>,
    wrapped_file_key: Vec<u8>,
}

/// Runs the identity (decrypt) side of the protocol to completion.
pub fn run<R: Read, W: Write>(opener: &dyn Opener, conn: &mut Conn<R, W>) -> Result<(), Error> {
    log::debug!("identity plugin start");

    let mut identities: Vec<Option<PivIdentity>> = Vec::new();
    let mut recipients: Vec<Option<RecipientStanza>> = Vec::new();

    loop {
        let stanza = match conn.read_stanza()? {
            Some(s) => s,
            None => return Ok(()),
        };
        match stanza.kind.as_str() {
            "add-identity" => {
                identities.push(None);
                if stanza.args.len() != 1 || !stanza.body.is_empty() {
                    continue;
                }
                match PivIdentity::parse(&stanza.args[0]) {
                    Ok(id) => *identities.last_mut().unwrap() = Some(id),
                    Err(e) => log::debug!("error parsing PIV identity: {e}"),
                }
            }
            "recipient-stanza" => {
                recipients.push(None);
                if stanza.args.len() != 4 || stanza.args[1] != "piv-p256" {
                    continue;
                }
                let tag_arg = &stanza.args[2];
                let tag = match base64::decode_config(tag_arg, base64::STANDARD_NO_PAD) {
                    Ok(bytes) if bytes.len() == TAG_BYTES => {
                        let mut tag = [0u8; TAG_BYTES];
                        tag.copy_from_slice(&bytes);
                        tag
                    }
                    _ => {
                        log::debug!("malformed tag in recipient-stanza");
                        continue;
                    }
                };
                let eph_compressed =
                    match base64::decode_config(&stanza.args[3], base64::STANDARD_NO_PAD) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            log::debug!("error parsing public key in recipient-stanza: {e}");
                            continue;
                        }
                    };
                *recipients.last_mut().unwrap() = Some(RecipientStanza {
                    index: stanza.args[0].clone(),
                    tag,
                    eph_compressed,
                    wrapped_file_key: stanza.body,
                });
            }
            "done" => {
                if !stanza.args.is_empty() {
                    return Err(Error::MalformedDone);
                }
                if !stanza.body.is_empty() {
                    return Err(Error::MalformedDone);
                }
                break;
            }
            _ => {}
        }
    }

    for recip in recipients.iter().flatten() {
        let eph_point = match EncodedPoint::from_bytes(&recip.eph_compressed) {
            Ok(p) => p,
            Err(_) => {
                log::debug!("cannot unmarshal P-256 key");
                continue;
            }
        };
        let eph_public: PublicKey =
            match Option::from(PublicKey::from_encoded_point(&eph_point)) {
                Some(pk) => pk,
                None => {
                    log::debug!("cannot unmarshal P-256 key");
                    continue;
                }
            };

        for ident in identities.iter().flatten() {
            if recip.tag != ident.tag {
                continue;
            }

            let mut card = match opener.open(ident.serial, ident.slot) {
                Ok(card) => card,
                Err(e) => {
                    log::debug!("cannot open PIV card: {e}");
                    continue;
                }
            };

            let piv_compressed = {
                let encoded = card.public_key().to_encoded_point(true);
                let mut out = [0u8; crate::address::COMPRESSED_POINT_BYTES];
                out.copy_from_slice(encoded.as_bytes());
                out
            };

            // Compare the tag again, computed from hardware, to avoid
            // prompting for a PIN against stale identity data.
            let tag = tag_from_recipient_string(&format_recipient(&piv_compressed));
            if tag != ident.tag {
                log::debug!("stale tag");
                continue;
            }

            let shared_secret = {
                let mut prompt_fn = |question: &str| conn.prompt(question);
                match card.shared_key(&eph_public, &mut prompt_fn) {
                    Ok(s) => s,
                    Err(e) => {
                        log::debug!("shared secret error: {e}");
                        continue;
                    }
                }
            };

            let file_key = match wrap::unwrap(
                &shared_secret,
                &recip.eph_compressed,
                &piv_compressed,
                &recip.wrapped_file_key,
            ) {
                Ok(fk) => fk,
                Err(_) => {
                    log::debug!("aead decrypt failed");
                    continue;
                }
            };

            use age_core::secrecy::ExposeSecret;
            conn.write_stanza(&Stanza::new(
                "file-key",
                vec![recip.index.clone()],
                file_key.expose_secret().to_vec(),
            ))?;
            conn.read_ok()?;
        }
    }

    conn.write_stanza(&Stanza::new("done", vec![], vec![]))?;
    log::debug!("identity plugin stop");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::mock::MockOpener;
    use std::io::Cursor;

    fn mock_scalar() -> p256::SecretKey {
        let dec = "54174045537741477645260415415255655016742280391432862109950881580092809591406";
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
        let scalar =
            p256::NonZeroScalar::from_repr(p256::FieldBytes::clone_from_slice(&out)).unwrap();
        p256::SecretKey::from(scalar)
    }

    #[test]
    fn identity_simple_unwrap() {
        let input = "-> add-identity AGE-PLUGIN-YUBIKEY-1QSPSYQVZ0DJFDPGWQ2RKZ\n\n\
-> recipient-stanza 0 piv-p256 e2SWhQ AuXWo0GaigX07s5MpZ3O7W0LepaRgaQRZ8hcFzQyGPc5\n\
fjpIzYC+PO66AJGLI2bU4k3Fg1CN+ysEcgGHg3WPpKE\n\
-> done\n\n\
-> ok\n\n";

        let opener = MockOpener {
            serial: 0x0102_0304,
            slot: 0x82,
            private_key: mock_scalar(),
        };
        let mut conn: Conn<Cursor<Vec<u8>>, Vec<u8>> =
            Conn::new(Cursor::new(input.as_bytes().to_vec()), Vec::new());
        run(&opener, &mut conn).unwrap();

        let want = "-> file-key 0\n39MwXeehyuGJAvn2xYi48A\n-> done\n\n";
        assert_eq!(String::from_utf8(conn.into_writer()).unwrap(), want);
    }

    #[test]
    fn stale_identity_tag_is_skipped() {
        // A recipient-stanza tag that does not match any add-identity
        // tag produces no file-key and a clean `done`.
        let input = "-> add-identity AGE-PLUGIN-YUBIKEY-1QSPSYQVZ0DJFDPGWQ2RKZ\n\n\
-> recipient-stanza 0 piv-p256 AAAAAA AuXWo0GaigX07s5MpZ3O7W0LepaRgaQRZ8hcFzQyGPc5\n\
fjpIzYC+PO66AJGLI2bU4k3Fg1CN+ysEcgGHg3WPpKE\n\
-> done\n\n";

        let opener = MockOpener {
            serial: 0x0102_0304,
            slot: 0x82,
            private_key: mock_scalar(),
        };
        let mut conn: Conn<Cursor<Vec<u8>>, Vec<u8>> =
            Conn::new(Cursor::new(input.as_bytes().to_vec()), Vec::new());
        run(&opener, &mut conn).unwrap();
        assert_eq!(String::from_utf8(conn.into_writer()).unwrap(), "-> done\n\n");
    }

    #[test]
    fn clean_eof_between_stanzas_returns_ok() {
        let mut conn: Conn<Cursor<Vec<u8>>, Vec<u8>> = Conn::new(Cursor::new(vec![]), Vec::new());
        let opener = MockOpener {
            serial: 1,
            slot: 1,
            private_key: mock_scalar(),
        };
        assert!(run(&opener, &mut conn).is_ok());
    }

    #[test]
    fn eof_mid_stanza_is_fatal() {
        let input = "-> add-identity AGE-PLUGIN-YUBIKEY-1QSPSYQVZ0DJFDPGWQ2RKZ\n";
        let mut conn: Conn<Cursor<Vec<u8>>, Vec<u8>> =
            Conn::new(Cursor::new(input.as_bytes().to_vec()), Vec::new());
        let opener = MockOpener {
            serial: 1,
            slot: 1,
            private_key: mock_scalar(),
        };
        assert!(matches!(run(&opener, &mut conn), Err(Error::UnexpectedEof)));
    }
}
