//! End-to-end plugin-protocol scenarios, reusing the literal fixtures
//! from the upstream Go test suite (`internal/pivplug/{identity,recipient}_test.go`).

use std::io::Cursor;

use age_plugin_piv::card::mock::MockOpener;
use age_plugin_piv::error::Error;
use age_plugin_piv::stanza::Conn;
use age_plugin_piv::{identity_plugin, recipient_plugin};

fn mock_card_scalar() -> p256::SecretKey {
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
    let scalar = p256::NonZeroScalar::from_repr(p256::FieldBytes::clone_from_slice(&out)).unwrap();
    p256::SecretKey::from(scalar)
}

fn run_identity(input: &str) -> (Result<(), Error>, String) {
    let opener = MockOpener {
        serial: 0x0102_0304,
        slot: 0x82,
        private_key: mock_card_scalar(),
    };
    let mut conn: Conn<Cursor<Vec<u8>>, Vec<u8>> =
        Conn::new(Cursor::new(input.as_bytes().to_vec()), Vec::new());
    let result = identity_plugin::run(&opener, &mut conn);
    let out = String::from_utf8(conn.into_writer()).unwrap();
    (result, out)
}

fn run_recipient(input: &str) -> (Result<(), Error>, String) {
    let mut conn: Conn<Cursor<Vec<u8>>, Vec<u8>> =
        Conn::new(Cursor::new(input.as_bytes().to_vec()), Vec::new());
    let result = recipient_plugin::run(&mut conn);
    let out = String::from_utf8(conn.into_writer()).unwrap();
    (result, out)
}

#[test]
fn scenario_1_recipient_simple_wrap() {
    let input = "-> add-recipient age1yubikey1qds33lxxw9gaj82vqedjulgtedqeqxhv3tnu5f28zq3lpwpp25j4u9fu8kg\n\n\
-> wrap-file-key\n39MwXeehyuGJAvn2xYi48A\n-> done\n\n";
    let (result, out) = run_recipient(input);
    result.unwrap();

    let mut lines = out.lines();
    let header = lines.next().unwrap();
    let parts: Vec<&str> = header.trim_start_matches("-> ").split(' ').collect();
    assert_eq!(parts[0], "recipient-stanza");
    assert_eq!(parts[1], "0");
    assert_eq!(parts[2], "piv-p256");
    assert_eq!(parts[3], "e2SWhQ");
    assert_eq!(parts[4].len(), 44); // base64 of a 33-byte compressed point, no padding
    let body = lines.next().unwrap();
    assert_eq!(body.len(), 43); // base64 of a 32-byte wrapped key, no padding
    assert_eq!(lines.next().unwrap(), "-> done");
    assert_eq!(lines.next().unwrap(), "");
    assert!(lines.next().is_none());
}

#[test]
fn scenario_2_identity_simple_unwrap() {
    let input = "-> add-identity AGE-PLUGIN-YUBIKEY-1QSPSYQVZ0DJFDPGWQ2RKZ\n\n\
-> recipient-stanza 0 piv-p256 e2SWhQ AuXWo0GaigX07s5MpZ3O7W0LepaRgaQRZ8hcFzQyGPc5\n\
fjpIzYC+PO66AJGLI2bU4k3Fg1CN+ysEcgGHg3WPpKE\n\
-> done\n\n\
-> ok\n\n";
    let (result, out) = run_identity(input);
    result.unwrap();
    assert_eq!(out, "-> file-key 0\n39MwXeehyuGJAvn2xYi48A\n-> done\n\n");
}

#[test]
fn scenario_3_stale_identity_tag() {
    // Same identity, but a recipient-stanza tag that doesn't match any
    // known identity (as if the card's key had been replaced).
    let input = "-> add-identity AGE-PLUGIN-YUBIKEY-1QSPSYQVZ0DJFDPGWQ2RKZ\n\n\
-> recipient-stanza 0 piv-p256 AAAAAA AuXWo0GaigX07s5MpZ3O7W0LepaRgaQRZ8hcFzQyGPc5\n\
fjpIzYC+PO66AJGLI2bU4k3Fg1CN+ysEcgGHg3WPpKE\n\
-> done\n\n";
    let (result, out) = run_identity(input);
    result.unwrap();
    assert_eq!(out, "-> done\n\n");
}

#[test]
fn scenario_4_unknown_algorithm_in_recipient_stanza() {
    let input = "-> add-identity AGE-PLUGIN-YUBIKEY-1QSPSYQVZ0DJFDPGWQ2RKZ\n\n\
-> recipient-stanza 0 x25519 e2SWhQ AuXWo0GaigX07s5MpZ3O7W0LepaRgaQRZ8hcFzQyGPc5\n\
fjpIzYC+PO66AJGLI2bU4k3Fg1CN+ysEcgGHg3WPpKE\n\
-> done\n\n";
    let (result, out) = run_identity(input);
    result.unwrap();
    assert_eq!(out, "-> done\n\n");
}

#[test]
fn scenario_5_unexpected_eof() {
    let input = "-> foo bar baz\ndGh1ZA";
    let (result, out) = run_identity(input);
    assert!(matches!(result, Err(Error::UnexpectedEof)));
    assert!(out.is_empty());
}

#[test]
fn scenario_6_host_closes_between_stanzas() {
    let input = "-> add-identity AGE-PLUGIN-YUBIKEY-1QSPSYQVZ0DJFDPGWQ2RKZ\n\n";
    let (result, out) = run_identity(input);
    result.unwrap();
    assert!(out.is_empty());
}
