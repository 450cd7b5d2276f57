//! Integration tests.
//!
//! These exercise a real card through a real reader and are therefore all
//! `#[ignore]`d; run them with `cargo test -- --ignored` against a
//! disposable device provisioned with the default PIN (`123456`), PUK
//! (`12345678`) and admin key. `PIV_TOKEN_GUID` selects a specific token
//! by GUID-prefix when several readers are attached.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, trivial_casts, unused_qualifications)]

use lazy_static::lazy_static;
use log::trace;
use piv_client::{
    AlgorithmId, EcdhBox, Error, MgmKey, PinType, SlotId, Token,
};
use std::{env, sync::Mutex};

/// Default test PIN
const PIN: &[u8] = b"123456";

lazy_static! {
    /// Provide thread-safe access to one token
    static ref TOKEN: Mutex<Token> = init_token();
}

/// One-time test initialization and setup
fn init_token() -> Mutex<Token> {
    // Only show logs if `RUST_LOG` is set
    if env::var("RUST_LOG").is_ok() {
        env_logger::builder().format_timestamp(None).init();
    }

    let ctx = pcsc::Context::establish(pcsc::Scope::System).unwrap();

    let token = if let Ok(prefix) = env::var("PIV_TOKEN_GUID") {
        let prefix = decode_hex(&prefix);
        Token::find(&ctx, &prefix).unwrap()
    } else {
        Token::enumerate(&ctx)
            .unwrap()
            .into_iter()
            .next()
            .expect("no PIV token attached")
    };

    trace!("guid: {}", token.guid_hex());
    trace!("reader: {}", token.reader_name());

    Mutex::new(token)
}

fn decode_hex(s: &str) -> Vec<u8> {
    assert!(s.len() % 2 == 0, "pass the GUID prefix as hex");
    (0..s.len() / 2)
        .map(|i| u8::from_str_radix(&s[2 * i..2 * i + 2], 16).expect("hex"))
        .collect()
}

//
// Discovery
//

#[test]
#[ignore]
fn test_enumerate() {
    let ctx = pcsc::Context::establish(pcsc::Scope::System).unwrap();
    let tokens = Token::enumerate(&ctx).unwrap();
    assert!(!tokens.is_empty());

    for token in &tokens {
        trace!(
            "token {} on {:?} (ykpiv: {})",
            token.guid_hex(),
            token.reader_name(),
            token.is_ykpiv()
        );
    }
}

#[test]
#[ignore]
fn test_find_by_guid_prefix() {
    let guid = *TOKEN.lock().unwrap().guid();

    let ctx = pcsc::Context::establish(pcsc::Scope::System).unwrap();
    let found = Token::find(&ctx, &guid[..4]).unwrap();
    assert_eq!(found.guid(), &guid);

    assert_eq!(
        Token::find(&ctx, &[0xde, 0xad, 0xbe, 0xef, 0x42]).unwrap_err(),
        Error::NotFound
    );
}

//
// Capability probing
//

#[test]
#[ignore]
fn test_capabilities() {
    let token = TOKEN.lock().unwrap();

    trace!("auth methods: {:?}", token.auth_methods());
    trace!("default auth: {:?}", token.default_auth());
    trace!("vci: {}", token.supports_vci());
    trace!("key history: {:?}", token.key_history());

    if token.is_ykpiv() {
        assert!(token.version().is_some());
        trace!("version: {}", token.version().unwrap());
        trace!("serial: {:?}", token.serial());
    }
}

//
// Certificate enumeration
//

#[test]
#[ignore]
fn test_read_all_certs() {
    let mut token = TOKEN.lock().unwrap();
    let mut txn = token.begin_transaction().unwrap();

    let skipped = txn.read_all_certs().unwrap();
    trace!("slots skipped for PIN: {:?}", skipped);

    drop(txn);
    for slot in token.slots() {
        trace!(
            "slot {}: {:?} {:?}",
            slot.id(),
            slot.algorithm(),
            slot.subject()
        );
    }
}

//
// PIN verification and signing
//

#[test]
#[ignore]
fn test_verify_pin() {
    let mut token = TOKEN.lock().unwrap();
    let mut txn = token.begin_transaction().unwrap();

    assert!(txn.verify_pin(PinType::Piv, b"000000", None, false).is_err());
    assert!(txn.verify_pin(PinType::Piv, PIN, None, false).is_ok());

    // the card considers us verified now; the probe form must agree
    assert!(txn.verify_pin(PinType::Piv, PIN, None, true).is_ok());
}

#[test]
#[ignore]
fn test_sign_and_auth_key() {
    let mut token = TOKEN.lock().unwrap();
    let mut txn = token.begin_transaction().unwrap();

    txn.read_cert(SlotId::Authentication).unwrap();
    txn.verify_pin(PinType::Piv, PIN, None, false).unwrap();

    let public_key = txn
        .slot(SlotId::Authentication)
        .and_then(|slot| slot.public_key())
        .expect("slot 9a has no certificate")
        .clone();

    txn.auth_key(SlotId::Authentication, &public_key).unwrap();
}

//
// Admin operations
//

#[test]
#[ignore]
fn test_admin_auth_and_generate() {
    let mut token = TOKEN.lock().unwrap();
    let mut txn = token.begin_transaction().unwrap();

    txn.auth_admin(&MgmKey::default_key()).unwrap();

    let public_key = txn
        .generate(SlotId::Retired(20), AlgorithmId::EccP256)
        .unwrap();
    trace!("generated: {:?}", public_key);

    txn.force_slot(SlotId::Retired(20), AlgorithmId::EccP256);
    txn.verify_pin(PinType::Piv, PIN, None, false).unwrap();
    txn.auth_key(SlotId::Retired(20), &public_key).unwrap();
}

#[test]
#[ignore]
fn test_attest() {
    let mut token = TOKEN.lock().unwrap();
    let mut txn = token.begin_transaction().unwrap();

    match txn.attest(SlotId::Authentication) {
        Ok(cert) => assert_eq!(cert[0], 0x30),
        Err(Error::NotSupported) => trace!("card does not support attestation"),
        Err(e) => panic!("attestation failed: {:?}", e),
    }
}

//
// ECDH box against the card
//

#[test]
#[ignore]
fn test_box_seal_and_open_on_card() {
    let mut token = TOKEN.lock().unwrap();
    let mut txn = token.begin_transaction().unwrap();

    txn.read_cert(SlotId::KeyManagement)
        .expect("slot 9d has no certificate");
    txn.verify_pin(PinType::Piv, PIN, None, true).unwrap();

    let mut sealed = EcdhBox::new();
    sealed.set_data(b"hello world");
    sealed.seal(&mut txn, SlotId::KeyManagement).unwrap();

    let bytes = sealed.to_bytes().unwrap();
    let mut opened = EcdhBox::from_bytes(&bytes).unwrap();
    assert!(opened.has_guid_slot());

    opened.open(&mut txn, SlotId::KeyManagement).unwrap();
    assert_eq!(&*opened.take_data().unwrap(), b"hello world");
}
