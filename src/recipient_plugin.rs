//! The `recipient-v1` state machine: wraps file keys to PIV recipients
//! supplied by the host.
//!
//! Grounded on `internal/pivplug/recipient.go` in the upstream Go
//! implementation.

use std::io::{Read, Write};

use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand_core::OsRng;

use crate::address::PivRecipient;
use crate::error::Error;
use crate::stanza::{Conn, Stanza};
use crate::wrap;

/// Runs the recipient (encrypt) side of the protocol to completion.
pub fn run<R: Read, W: Write>(conn: &mut Conn<R, W>) -> Result<(), Error> {
    log::debug!("recipient plugin start");

    let mut recipients: Vec<Option<String>> = Vec::new();
    let mut file_keys: Vec<Option<Vec<u8>>> = Vec::new();

    loop {
        let stanza = match conn.read_stanza()? {
            Some(s) => s,
            None => return Ok(()),
        };
        match stanza.kind.as_str() {
            "add-recipient" => {
                recipients.push(None);
                if stanza.args.len() != 1 || !stanza.body.is_empty() {
                    continue;
                }
                *recipients.last_mut().unwrap() = Some(stanza.args[0].clone());
            }
            "wrap-file-key" => {
                file_keys.push(None);
                if !stanza.args.is_empty() {
                    continue;
                }
                *file_keys.last_mut().unwrap() = Some(stanza.body);
            }
            "done" => {
                if !stanza.args.is_empty() || !stanza.body.is_empty() {
                    return Err(Error::MalformedDone);
                }
                break;
            }
            _ => {}
        }
    }

    for recip in recipients.iter() {
        let recip = match recip {
            Some(s) => s,
            None => continue,
        };
        let piv_recipient = match PivRecipient::parse(recip) {
            Ok(r) => r,
            Err(e) => {
                log::debug!("cannot parse as PIV recipient: {recip:?}: {e}");
                continue;
            }
        };

        for (key_idx, file_key) in file_keys.iter().enumerate() {
            let file_key = match file_key {
                Some(fk) => fk,
                None => continue,
            };

            let eph_secret = EphemeralSecret::random(OsRng);
            let eph_public = eph_secret.public_key();
            let eph_encoded = eph_public.to_encoded_point(true);
            let mut eph_compressed = [0u8; crate::address::COMPRESSED_POINT_BYTES];
            eph_compressed.copy_from_slice(eph_encoded.as_bytes());
            let eph_compressed_str =
                base64::encode_config(&eph_compressed, base64::STANDARD_NO_PAD);

            let shared = eph_secret.diffie_hellman(&piv_recipient.public_key);
            let shared_secret =
                wrap::unpadded_big_endian(shared.raw_secret_bytes().as_slice());

            let age_file_key: age_core::format::FileKey = {
                let mut bytes = [0u8; wrap::FILE_KEY_BYTES];
                if file_key.len() != wrap::FILE_KEY_BYTES {
                    log::debug!("wrap-file-key body has the wrong length");
                    continue;
                }
                bytes.copy_from_slice(file_key);
                bytes.into()
            };

            let wrapped = wrap::wrap(
                &shared_secret,
                &eph_compressed,
                &piv_recipient.compressed,
                &age_file_key,
            );

            conn.write_stanza(&Stanza::new(
                "recipient-stanza",
                vec![
                    key_idx.to_string(),
                    "piv-p256".to_string(),
                    base64::encode_config(&piv_recipient.tag, base64::STANDARD_NO_PAD),
                    eph_compressed_str,
                ],
                wrapped.to_vec(),
            ))?;
        }
    }

    conn.write_stanza(&Stanza::new("done", vec![], vec![]))?;
    log::debug!("recipient plugin stop");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn recipient_simple_wrap_round_trips_through_identity() {
        let recipient = "age1yubikey1qds33lxxw9gaj82vqedjulgtedqeqxhv3tnu5f28zq3lpwpp25j4u9fu8kg";
        let input = format!(
            "-> add-recipient {recipient}\n\n-> wrap-file-key\n39MwXeehyuGJAvn2xYi48A\n-> done\n\n"
        );
        let mut conn: Conn<Cursor<Vec<u8>>, Vec<u8>> =
            Conn::new(Cursor::new(input.as_bytes().to_vec()), Vec::new());
        run(&mut conn).unwrap();

        let written = conn.into_writer();
        let mut read_conn: Conn<Cursor<Vec<u8>>, Vec<u8>> =
            Conn::new(Cursor::new(written), Vec::new());
        let stanza = read_conn.read_stanza().unwrap().unwrap();
        assert_eq!(stanza.kind, "recipient-stanza");
        assert_eq!(stanza.args[0], "0");
        assert_eq!(stanza.args[1], "piv-p256");
        assert_eq!(stanza.args[2], "e2SWhQ");
        assert_eq!(stanza.body.len(), wrap::WRAPPED_KEY_BYTES);

        let done = read_conn.read_stanza().unwrap().unwrap();
        assert_eq!(done.kind, "done");
    }

    #[test]
    fn unparseable_recipient_is_silently_skipped() {
        let input = "-> add-recipient not-a-real-recipient\n\n-> done\n\n";
        let mut conn: Conn<Cursor<Vec<u8>>, Vec<u8>> =
            Conn::new(Cursor::new(input.as_bytes().to_vec()), Vec::new());
        run(&mut conn).unwrap();
        assert_eq!(
            String::from_utf8(conn.into_writer()).unwrap(),
            "-> done\n\n"
        );
    }

    #[test]
    fn clean_eof_at_start_returns_ok() {
        let mut conn: Conn<Cursor<Vec<u8>>, Vec<u8>> = Conn::new(Cursor::new(vec![]), Vec::new());
        assert!(run(&mut conn).is_ok());
    }
}
