//! PIV key slots and the cryptographic operations on them.
//!
//! Slots are populated lazily: [`Transaction::read_cert`] ingests the slot's
//! certificate (inflating it when the card stored it gzipped) and records
//! the slot in the token's registry; [`Transaction::force_slot`] creates an
//! entry for a slot that has a key but no certificate. Signing, ECDH, key
//! generation and import all go through GENERAL AUTHENTICATE or the
//! YubicoPIV vendor instructions.

// Adapted from yubico-piv-tool:
// <https://github.com/Yubico/yubico-piv-tool/>
//
// Copyright (c) 2014-2016 Yubico AB
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//   * Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//
//   * Redistributions in binary form must reproduce the above
//     copyright notice, this list of conditions and the following
//     disclaimer in the documentation and/or other materials provided
//     with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use crate::{
    apdu::{Apdu, Ins, StatusWords},
    certificate::{self, Certificate},
    consts::*,
    tlv::{TlvReader, TlvWriter},
    transaction::Transaction,
    Buffer, Error, Result,
};
use elliptic_curve::sec1::ToEncodedPoint;
use log::{debug, error, warn};
use rand_core::{OsRng, RngCore};
use rsa::{BigUint, Pkcs1v15Sign};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use ssh_key::{
    private::{EcdsaKeypair, KeypairData},
    public::{EcdsaPublicKey, KeyData, RsaPublicKey},
    Mpint, PrivateKey, PublicKey,
};
use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};
use zeroize::Zeroizing;

/// Slot identifiers. PIV key slots have an 8-bit numeric ID; this is the
/// set this library drives.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SlotId {
    /// 9A: PIV authentication (system login and the like)
    Authentication,

    /// 9B: the card administration key. Holds no certificate; targeted by
    /// admin authentication and metadata queries only.
    Administration,

    /// 9C: digital signature. PIN is demanded for every operation.
    Signature,

    /// 9D: key management (encryption/decryption, ECDH)
    KeyManagement,

    /// 9E: card authentication; usable without a PIN
    CardAuthentication,

    /// 82..95: retired key-management slots, numbered 1 through 20
    Retired(u8),

    /// F9: YubicoPIV attestation key
    Attestation,
}

impl SlotId {
    /// All slots that can hold certificates, in probe order.
    pub const ALL: [SlotId; 24] = {
        let mut slots = [SlotId::Authentication; 24];
        slots[1] = SlotId::Signature;
        slots[2] = SlotId::KeyManagement;
        slots[3] = SlotId::CardAuthentication;
        let mut i = 0;
        while i < 20 {
            slots[4 + i] = SlotId::Retired(i as u8 + 1);
            i += 1;
        }
        slots
    };

    /// The data-object tag holding this slot's certificate, if it has one.
    pub(crate) fn cert_object(self) -> Option<u32> {
        match self {
            SlotId::Authentication => Some(TAG_OBJ_CERT_9A),
            SlotId::Administration => None,
            SlotId::Signature => Some(TAG_OBJ_CERT_9C),
            SlotId::KeyManagement => Some(TAG_OBJ_CERT_9D),
            SlotId::CardAuthentication => Some(TAG_OBJ_CERT_9E),
            SlotId::Retired(n @ 1..=20) => Some(TAG_OBJ_CERT_82 + (n as u32 - 1)),
            SlotId::Retired(_) => None,
            SlotId::Attestation => Some(TAG_OBJ_CERT_ATTEST),
        }
    }
}

impl TryFrom<u8> for SlotId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x9a => Ok(SlotId::Authentication),
            0x9b => Ok(SlotId::Administration),
            0x9c => Ok(SlotId::Signature),
            0x9d => Ok(SlotId::KeyManagement),
            0x9e => Ok(SlotId::CardAuthentication),
            0x82..=0x95 => Ok(SlotId::Retired(value - 0x81)),
            0xf9 => Ok(SlotId::Attestation),
            _ => Err(Error::Argument),
        }
    }
}

impl From<SlotId> for u8 {
    fn from(slot: SlotId) -> u8 {
        match slot {
            SlotId::Authentication => 0x9a,
            SlotId::Administration => 0x9b,
            SlotId::Signature => 0x9c,
            SlotId::KeyManagement => 0x9d,
            SlotId::CardAuthentication => 0x9e,
            SlotId::Retired(n) => 0x81 + n,
            SlotId::Attestation => 0xf9,
        }
    }
}

impl Display for SlotId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", u8::from(*self))
    }
}

impl FromStr for SlotId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        u8::from_str_radix(s, 16)
            .map_err(|_| Error::Argument)
            .and_then(SlotId::try_from)
    }
}

/// Algorithm identifiers, per NIST SP 800-78-4 plus the PivApplet
/// hash-on-card extensions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlgorithmId {
    /// 1024-bit RSA
    Rsa1024,

    /// 2048-bit RSA
    Rsa2048,

    /// ECC over NIST P-256
    EccP256,

    /// ECC over NIST P-384
    EccP384,

    /// PivApplet pseudo-algorithm: P-256 with on-card SHA-1. The card is
    /// handed the raw message instead of a digest.
    EccP256Sha1,

    /// PivApplet pseudo-algorithm: P-256 with on-card SHA-256
    EccP256Sha256,
}

impl TryFrom<u8> for AlgorithmId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x06 => Ok(AlgorithmId::Rsa1024),
            0x07 => Ok(AlgorithmId::Rsa2048),
            0x11 => Ok(AlgorithmId::EccP256),
            0x14 => Ok(AlgorithmId::EccP384),
            0xf0 => Ok(AlgorithmId::EccP256Sha1),
            0xf1 => Ok(AlgorithmId::EccP256Sha256),
            _ => Err(Error::NotSupported),
        }
    }
}

impl From<AlgorithmId> for u8 {
    fn from(id: AlgorithmId) -> u8 {
        match id {
            AlgorithmId::Rsa1024 => 0x06,
            AlgorithmId::Rsa2048 => 0x07,
            AlgorithmId::EccP256 => 0x11,
            AlgorithmId::EccP384 => 0x14,
            AlgorithmId::EccP256Sha1 => 0xf0,
            AlgorithmId::EccP256Sha256 => 0xf1,
        }
    }
}

impl AlgorithmId {
    /// RSA modulus size in bytes, if this is an RSA algorithm.
    fn modulus_len(self) -> Option<usize> {
        match self {
            AlgorithmId::Rsa1024 => Some(128),
            AlgorithmId::Rsa2048 => Some(256),
            _ => None,
        }
    }

    /// EC field size in bytes, if this is an EC algorithm.
    fn field_len(self) -> Option<usize> {
        match self {
            AlgorithmId::EccP256 | AlgorithmId::EccP256Sha1 | AlgorithmId::EccP256Sha256 => {
                Some(32)
            }
            AlgorithmId::EccP384 => Some(48),
            _ => None,
        }
    }

    /// The digest negotiated when the caller expresses no preference.
    fn default_hash(self) -> HashAlgorithm {
        match self {
            AlgorithmId::EccP384 => HashAlgorithm::Sha384,
            AlgorithmId::EccP256Sha1 => HashAlgorithm::Sha1,
            _ => HashAlgorithm::Sha256,
        }
    }

    /// Does the card hash the message itself for this algorithm?
    fn hash_on_card(self) -> bool {
        matches!(self, AlgorithmId::EccP256Sha1 | AlgorithmId::EccP256Sha256)
    }
}

/// Types of cardholder authentication secrets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PinType {
    /// The PIV application PIN, local to the applet
    Piv,

    /// A global PIN shared by all applets on the card
    Global,

    /// The PIN unlock code
    Puk,
}

impl PinType {
    /// The key-reference byte used as P2 of VERIFY and friends.
    pub(crate) fn reference(self) -> u8 {
        match self {
            PinType::Piv => 0x80,
            PinType::Global => 0x00,
            PinType::Puk => 0x81,
        }
    }
}

impl TryFrom<u8> for PinType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x80 => Ok(PinType::Piv),
            0x00 => Ok(PinType::Global),
            0x81 => Ok(PinType::Puk),
            _ => Err(Error::InvalidData),
        }
    }
}

/// How often the PIN must be presented for a key's operations (YubicoPIV).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PinPolicy {
    /// The slot's default policy
    Default,
    /// Never required
    Never,
    /// Required once per transaction
    Once,
    /// Required immediately before every operation
    Always,
}

impl From<PinPolicy> for u8 {
    fn from(policy: PinPolicy) -> u8 {
        match policy {
            PinPolicy::Default => 0,
            PinPolicy::Never => 1,
            PinPolicy::Once => 2,
            PinPolicy::Always => 3,
        }
    }
}

/// When a physical touch is required for a key's operations (YubicoPIV).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TouchPolicy {
    /// The slot's default policy
    Default,
    /// Never required
    Never,
    /// Required for every operation
    Always,
    /// Required, but cached for 15 seconds
    Cached,
}

impl From<TouchPolicy> for u8 {
    fn from(policy: TouchPolicy) -> u8 {
        match policy {
            TouchPolicy::Default => 0,
            TouchPolicy::Never => 1,
            TouchPolicy::Always => 2,
            TouchPolicy::Cached => 3,
        }
    }
}

/// Digests the signing path can negotiate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Digest length in bytes.
    pub fn output_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Digest `data`.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// DER prefix turning this digest into a PKCS#1 v1.5 DigestInfo.
    fn digest_info_prefix(self) -> &'static [u8] {
        match self {
            HashAlgorithm::Sha1 => &[
                0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00,
                0x04, 0x14,
            ],
            HashAlgorithm::Sha256 => &[
                0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04,
                0x02, 0x01, 0x05, 0x00, 0x04, 0x20,
            ],
            HashAlgorithm::Sha384 => &[
                0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04,
                0x02, 0x02, 0x05, 0x00, 0x04, 0x30,
            ],
            HashAlgorithm::Sha512 => &[
                0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04,
                0x02, 0x03, 0x05, 0x00, 0x04, 0x40,
            ],
        }
    }

    /// Infer the digest from its length.
    fn from_len(len: usize) -> Result<Self> {
        match len {
            20 => Ok(HashAlgorithm::Sha1),
            32 => Ok(HashAlgorithm::Sha256),
            48 => Ok(HashAlgorithm::Sha384),
            64 => Ok(HashAlgorithm::Sha512),
            _ => Err(Error::Argument),
        }
    }
}

/// An enumerated key slot: its algorithm and, when a certificate was read,
/// the parsed certificate.
#[derive(Clone, Debug)]
pub struct Slot {
    id: SlotId,
    algorithm: AlgorithmId,
    certificate: Option<Certificate>,
    compressed: Option<bool>,
}

impl Slot {
    /// The slot's identifier.
    pub fn id(&self) -> SlotId {
        self.id
    }

    /// The slot key's algorithm.
    pub fn algorithm(&self) -> AlgorithmId {
        self.algorithm
    }

    /// The slot's certificate, absent for forced slots.
    pub fn certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }

    /// The certificate's subject DN, absent for forced slots.
    pub fn subject(&self) -> Option<&str> {
        self.certificate.as_ref().map(Certificate::subject)
    }

    /// The slot's public key in SSH form, absent for forced slots.
    pub fn public_key(&self) -> Option<&PublicKey> {
        self.certificate.as_ref().map(Certificate::public_key)
    }

    /// Whether the certificate was stored gzip-compressed, when known.
    pub fn compressed(&self) -> Option<bool> {
        self.compressed
    }
}

impl<'tx> Transaction<'tx> {
    /// An already-enumerated slot.
    pub fn slot(&self, slot: SlotId) -> Option<&Slot> {
        self.state.slots.get(&slot)
    }

    /// Read the certificate in `slot` and record the slot in the token's
    /// registry.
    pub fn read_cert(&mut self, slot: SlotId) -> Result<&Slot> {
        let tag = slot.cert_object().ok_or(Error::NotSupported)?;

        let contents = self.read_object(tag)?;
        let (der, was_compressed) = certificate::parse_cert_object(&contents)?;

        let der = if was_compressed {
            certificate::gunzip(&der)?
        } else {
            der
        };

        let certificate = Certificate::from_der(der)?;

        let entry = Slot {
            id: slot,
            algorithm: certificate.algorithm(),
            certificate: Some(certificate),
            compressed: Some(was_compressed),
        };

        self.state.slots.insert(slot, entry);
        Ok(self.state.slots.get(&slot).expect("just inserted"))
    }

    /// Read certificates from every slot in [`SlotId::ALL`]. Slots without
    /// a certificate and slots the card does not implement are skipped;
    /// slots the card refused to disclose without a PIN are skipped and
    /// returned so the caller can surface them.
    pub fn read_all_certs(&mut self) -> Result<Vec<SlotId>> {
        let mut skipped = vec![];

        for slot in SlotId::ALL {
            match self.read_cert(slot) {
                Ok(_) => (),
                Err(Error::NotFound) | Err(Error::NotSupported) => {
                    debug!("slot {}: no certificate", slot);
                }
                Err(Error::Permission { .. }) => {
                    debug!("slot {}: certificate requires PIN, skipping", slot);
                    skipped.push(slot);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(skipped)
    }

    /// Record a slot that has no readable certificate, so that signing and
    /// ECDH can still target it. Its certificate accessors return nothing.
    pub fn force_slot(&mut self, slot: SlotId, algorithm: AlgorithmId) -> &Slot {
        self.state.slots.insert(
            slot,
            Slot {
                id: slot,
                algorithm,
                certificate: None,
                compressed: None,
            },
        );
        self.state.slots.get(&slot).expect("just inserted")
    }

    /// GENERAL AUTHENTICATE with a single-operand dynamic authentication
    /// template, returning the 0x82 response payload.
    fn general_authenticate(
        &mut self,
        algorithm: AlgorithmId,
        slot: SlotId,
        operand_tag: u32,
        operand: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.ensure_selected()?;

        let mut request = TlvWriter::new();
        request.push(TAG_DYN_AUTH);
        request.write_tag(TAG_AUTH_RESPONSE, &[]);
        request.write_tag(operand_tag, operand);
        request.pop();

        let mut apdu = Apdu::new(Ins::GeneralAuthenticate);
        apdu.params(algorithm.into(), slot.into())
            .data(request.as_bytes())
            .le(256);

        let response = self.transceive(&apdu)?;

        match response.status_words() {
            StatusWords::Success => (),
            StatusWords::SecurityStatus | StatusWords::AuthBlocked => {
                error!("slot {} is locked; verify the PIN first", slot);
                return Err(Error::Permission { retries: None });
            }
            StatusWords::NotFound => return Err(Error::NotFound),
            StatusWords::WrongData | StatusWords::IncorrectParam => {
                return Err(Error::NotSupported);
            }
            other => return Err(Error::Apdu { sw: other.code() }),
        }

        dyn_auth_response(response.data()).map(Zeroizing::new)
    }

    /// Sign `data` with the key in `slot`, hashing it first (or handing it
    /// to the card whole, for the hash-on-card pseudo-algorithms).
    ///
    /// `hash` may preselect the digest; the digest actually negotiated is
    /// returned alongside the ASN.1 signature.
    pub fn sign(
        &mut self,
        slot: SlotId,
        data: &[u8],
        hash: Option<HashAlgorithm>,
    ) -> Result<(HashAlgorithm, Vec<u8>)> {
        let algorithm = self.slot(slot).ok_or(Error::NotFound)?.algorithm();

        // hash-on-card algorithms fix the digest; otherwise honor the
        // caller's choice
        let hash = if algorithm.hash_on_card() {
            algorithm.default_hash()
        } else {
            hash.unwrap_or_else(|| algorithm.default_hash())
        };

        let signature = if algorithm.hash_on_card() {
            let raw = self.general_authenticate(algorithm, slot, TAG_AUTH_CHALLENGE, data)?;
            finish_ec_signature(&raw, algorithm)?
        } else {
            let digest = Zeroizing::new(hash.digest(data));
            self.sign_digest(slot, algorithm, &digest, hash)?
        };

        Ok((hash, signature))
    }

    /// Sign a precomputed digest with the key in `slot`. The hash-on-card
    /// pseudo-algorithms cannot sign a prehash.
    pub fn sign_prehash(&mut self, slot: SlotId, digest: &[u8]) -> Result<Vec<u8>> {
        let algorithm = self.slot(slot).ok_or(Error::NotFound)?.algorithm();

        if algorithm.hash_on_card() {
            return Err(Error::NotSupported);
        }

        // For RSA the DigestInfo encoding needs to know which digest this
        // is; infer it from the length.
        let hash = HashAlgorithm::from_len(digest.len()).unwrap_or(HashAlgorithm::Sha256);
        self.sign_digest(slot, algorithm, digest, hash)
    }

    fn sign_digest(
        &mut self,
        slot: SlotId,
        algorithm: AlgorithmId,
        digest: &[u8],
        hash: HashAlgorithm,
    ) -> Result<Vec<u8>> {
        let input = if let Some(k) = algorithm.modulus_len() {
            Zeroizing::new(pkcs1_v15_pad(hash, digest, k)?)
        } else if let Some(field) = algorithm.field_len() {
            Zeroizing::new(ec_sign_input(digest, field))
        } else {
            return Err(Error::NotSupported);
        };

        let raw = self.general_authenticate(algorithm, slot, TAG_AUTH_CHALLENGE, &input)?;

        if algorithm.field_len().is_some() {
            finish_ec_signature(&raw, algorithm)
        } else {
            Ok(raw.to_vec())
        }
    }

    /// ECDH between the private key in `slot` and the given EC public key,
    /// returning the X coordinate of the shared point.
    pub fn ecdh(&mut self, slot: SlotId, public_key: &PublicKey) -> Result<Zeroizing<Vec<u8>>> {
        let algorithm = self.slot(slot).ok_or(Error::NotFound)?.algorithm();
        let field = algorithm.field_len().ok_or(Error::NotSupported)?;

        let point = match (algorithm, public_key.key_data()) {
            (
                AlgorithmId::EccP256 | AlgorithmId::EccP256Sha1 | AlgorithmId::EccP256Sha256,
                KeyData::Ecdsa(EcdsaPublicKey::NistP256(point)),
            ) => point.as_bytes().to_vec(),
            (AlgorithmId::EccP384, KeyData::Ecdsa(EcdsaPublicKey::NistP384(point))) => {
                point.as_bytes().to_vec()
            }
            _ => {
                error!("public key curve does not match slot {}", slot);
                return Err(Error::Argument);
            }
        };

        let shared = self.general_authenticate(algorithm, slot, TAG_AUTH_CHALLENGE, &point)?;

        if shared.len() != field {
            return Err(Error::InvalidData);
        }

        Ok(shared)
    }

    /// Generate a key in `slot` with default PIN and touch policies,
    /// returning the new public key.
    ///
    /// Requires admin authentication earlier in the same transaction.
    pub fn generate(&mut self, slot: SlotId, algorithm: AlgorithmId) -> Result<PublicKey> {
        self.generate_with_policy(slot, algorithm, PinPolicy::Default, TouchPolicy::Default)
    }

    /// Generate a key in `slot` with explicit YubicoPIV PIN and touch
    /// policies, returning the new public key.
    pub fn generate_with_policy(
        &mut self,
        slot: SlotId,
        algorithm: AlgorithmId,
        pin_policy: PinPolicy,
        touch_policy: TouchPolicy,
    ) -> Result<PublicKey> {
        if algorithm.hash_on_card() {
            // cards expose these only as signing aliases of an ECCP256 key
            return Err(Error::Argument);
        }

        self.check_policy_support(pin_policy, touch_policy)?;
        self.ensure_selected()?;

        let mut template = TlvWriter::new();
        template.push(0xac);
        template.write_tag(TAG_GEN_ALGORITHM, &[algorithm.into()]);
        if pin_policy != PinPolicy::Default {
            template.write_tag(TAG_PIN_POLICY, &[pin_policy.into()]);
        }
        if touch_policy != TouchPolicy::Default {
            template.write_tag(TAG_TOUCH_POLICY, &[touch_policy.into()]);
        }
        template.pop();

        let mut apdu = Apdu::new(Ins::GenerateAsymmetric);
        apdu.p2(slot.into()).data(template.as_bytes()).le(256);

        let response = self.transceive(&apdu)?;

        match response.status_words() {
            StatusWords::Success => (),
            StatusWords::SecurityStatus => {
                error!("key generation requires admin authentication");
                return Err(Error::Permission { retries: None });
            }
            StatusWords::WrongData | StatusWords::IncorrectParam => {
                error!("card rejected algorithm/policy for slot {}", slot);
                return Err(Error::Argument);
            }
            StatusWords::FuncNotSupported | StatusWords::InsNotSupported => {
                return Err(Error::NotSupported);
            }
            other => return Err(Error::Apdu { sw: other.code() }),
        }

        parse_generated_public(algorithm, response.data())
    }

    /// Import a private key into `slot` (YubicoPIV INS 0xFE).
    ///
    /// Requires admin authentication earlier in the same transaction.
    pub fn import_key(
        &mut self,
        slot: SlotId,
        key: &PrivateKey,
        pin_policy: PinPolicy,
        touch_policy: TouchPolicy,
    ) -> Result<()> {
        self.check_policy_support(pin_policy, touch_policy)?;

        let (algorithm, body) = import_key_body(key, pin_policy, touch_policy)?;

        self.ensure_selected()?;

        let mut apdu = Apdu::new(Ins::ImportAsymmetric);
        apdu.params(algorithm.into(), slot.into()).data(&*body);

        let response = self.transceive(&apdu)?;
        match response.status_words() {
            StatusWords::Success => Ok(()),
            StatusWords::SecurityStatus => {
                error!("key import requires admin authentication");
                Err(Error::Permission { retries: None })
            }
            StatusWords::WrongData | StatusWords::IncorrectParam => Err(Error::Argument),
            StatusWords::FuncNotSupported | StatusWords::InsNotSupported => {
                Err(Error::NotSupported)
            }
            other => Err(Error::Apdu { sw: other.code() }),
        }
    }

    /// Request the attestation certificate for a key generated in `slot`
    /// (YubicoPIV INS 0xF9), signed by the device attestation key.
    pub fn attest(&mut self, slot: SlotId) -> Result<Buffer> {
        self.ensure_selected()?;

        self.get_version().map_err(|_| Error::NotSupported)?;
        if !self.state.version_at_least(4, 3, 0) {
            return Err(Error::NotSupported);
        }

        let mut apdu = Apdu::new(Ins::Attest);
        apdu.p1(slot.into()).le(256);

        let response = self.transceive(&apdu)?;
        match response.status_words() {
            StatusWords::Success => (),
            StatusWords::InsNotSupported | StatusWords::FuncNotSupported => {
                return Err(Error::NotSupported);
            }
            StatusWords::NotFound => return Err(Error::NotFound),
            other => return Err(Error::Apdu { sw: other.code() }),
        }

        if response.data().first() != Some(&0x30) {
            return Err(Error::InvalidData);
        }

        Ok(Zeroizing::new(response.data().to_vec()))
    }

    /// Authenticate a slot's key: structurally match its enumerated public
    /// key against `public_key`, then have the slot sign fresh random data
    /// and verify the signature under `public_key`.
    pub fn auth_key(&mut self, slot: SlotId, public_key: &PublicKey) -> Result<()> {
        if let Some(stored) = self.slot(slot).and_then(Slot::public_key) {
            if stored.key_data() != public_key.key_data() {
                return Err(Error::KeyAuth);
            }
        }

        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);

        let (hash, signature) = self.sign(slot, &nonce, None)?;

        verify_signature(public_key, hash, &nonce, &signature).map_err(|e| {
            error!("slot {} key did not produce a valid signature", slot);
            e
        })
    }

    fn check_policy_support(&self, pin_policy: PinPolicy, touch_policy: TouchPolicy) -> Result<()> {
        if pin_policy == PinPolicy::Default && touch_policy == TouchPolicy::Default {
            return Ok(());
        }
        if !self.state.ykpiv {
            warn!("PIN/touch policies need YubicoPIV extensions");
            return Err(Error::Argument);
        }
        if touch_policy == TouchPolicy::Cached && !self.state.version_at_least(4, 3, 0) {
            return Err(Error::Argument);
        }
        Ok(())
    }
}

/// EC signing input: the digest truncated, or zero-extended on the left,
/// to the field size.
fn ec_sign_input(digest: &[u8], field: usize) -> Vec<u8> {
    if digest.len() >= field {
        digest[..field].to_vec()
    } else {
        let mut input = vec![0u8; field - digest.len()];
        input.extend_from_slice(digest);
        input
    }
}

/// EMSA-PKCS1-v1_5 encoding of a digest for a modulus of `k` bytes.
fn pkcs1_v15_pad(hash: HashAlgorithm, digest: &[u8], k: usize) -> Result<Vec<u8>> {
    if digest.len() != hash.output_len() {
        return Err(Error::Argument);
    }

    let prefix = hash.digest_info_prefix();
    let t_len = prefix.len() + digest.len();

    // at least eight bytes of 0xff filler
    if k < t_len + 11 {
        return Err(Error::Argument);
    }

    let mut em = Vec::with_capacity(k);
    em.push(0x00);
    em.push(0x01);
    em.resize(k - t_len - 1, 0xff);
    em.push(0x00);
    em.extend_from_slice(prefix);
    em.extend_from_slice(digest);
    Ok(em)
}

/// Pull the 0x82 response out of a dynamic authentication template reply.
pub(crate) fn dyn_auth_response(data: &[u8]) -> Result<Vec<u8>> {
    let mut reader = TlvReader::new(data);
    if reader.read_tag()? != TAG_DYN_AUTH {
        return Err(Error::InvalidData);
    }

    while reader.has_remaining() {
        match reader.read_tag()? {
            TAG_AUTH_RESPONSE => {
                let value = reader.read_rest().to_vec();
                reader.end()?;
                return Ok(value);
            }
            _ => reader.skip()?,
        }
    }

    Err(Error::InvalidData)
}

/// EC replies are either a ready-made DER SEQUENCE(r, s) or two bare
/// field-sized integers that still need wrapping.
fn finish_ec_signature(raw: &[u8], algorithm: AlgorithmId) -> Result<Vec<u8>> {
    if raw.first() == Some(&0x30) {
        return Ok(raw.to_vec());
    }

    let field = algorithm.field_len().ok_or(Error::InvalidData)?;
    if raw.len() != 2 * field {
        return Err(Error::InvalidData);
    }

    let mut writer = TlvWriter::new();
    writer.push(0x30);
    der_integer(&mut writer, &raw[..field]);
    der_integer(&mut writer, &raw[field..]);
    writer.pop();
    Ok(writer.into_vec())
}

/// Minimal positive DER INTEGER.
fn der_integer(writer: &mut TlvWriter, scalar: &[u8]) {
    let mut value = scalar;
    while value.len() > 1 && value[0] == 0 {
        value = &value[1..];
    }

    writer.push(0x02);
    if value[0] & 0x80 != 0 {
        writer.write_u8(0x00);
    }
    writer.write_bytes(value);
    writer.pop();
}

/// Parse the 0x7F49 public-key template returned by GENERATE ASYMMETRIC,
/// validating EC points against their claimed curve.
fn parse_generated_public(algorithm: AlgorithmId, data: &[u8]) -> Result<PublicKey> {
    let mut reader = TlvReader::new(data);
    if reader.read_tag()? != TAG_ASYM_KEYPAIR {
        return Err(Error::InvalidData);
    }

    match algorithm {
        AlgorithmId::Rsa1024 | AlgorithmId::Rsa2048 => {
            let mut modulus = None;
            let mut exponent = None;

            while reader.has_remaining() {
                match reader.read_tag()? {
                    TAG_RSA_MODULUS => {
                        modulus = Some(reader.read_rest());
                        reader.end()?;
                    }
                    TAG_RSA_EXPONENT => {
                        exponent = Some(reader.read_rest());
                        reader.end()?;
                    }
                    _ => reader.skip()?,
                }
            }

            let (n, e) = modulus.zip(exponent).ok_or(Error::InvalidData)?;
            let key_data = KeyData::Rsa(RsaPublicKey {
                e: Mpint::from_positive_bytes(e).map_err(|_| Error::InvalidData)?,
                n: Mpint::from_positive_bytes(n).map_err(|_| Error::InvalidData)?,
            });
            Ok(PublicKey::new(key_data, ""))
        }
        AlgorithmId::EccP256 | AlgorithmId::EccP384 => {
            let mut point = None;

            while reader.has_remaining() {
                match reader.read_tag()? {
                    TAG_ECC_POINT => {
                        point = Some(reader.read_rest());
                        reader.end()?;
                    }
                    _ => reader.skip()?,
                }
            }

            let point = point.ok_or(Error::InvalidData)?;

            let ecdsa_key = if algorithm == AlgorithmId::EccP256 {
                let key =
                    p256::PublicKey::from_sec1_bytes(point).map_err(|_| Error::InvalidData)?;
                EcdsaPublicKey::NistP256(key.to_encoded_point(false))
            } else {
                let key =
                    p384::PublicKey::from_sec1_bytes(point).map_err(|_| Error::InvalidData)?;
                EcdsaPublicKey::NistP384(key.to_encoded_point(false))
            };

            Ok(PublicKey::new(KeyData::Ecdsa(ecdsa_key), ""))
        }
        _ => Err(Error::Argument),
    }
}

/// Assemble the INS 0xFE body: tagged private-key components followed by
/// any non-default policies.
fn import_key_body(
    key: &PrivateKey,
    pin_policy: PinPolicy,
    touch_policy: TouchPolicy,
) -> Result<(AlgorithmId, Zeroizing<Vec<u8>>)> {
    let mut body = TlvWriter::new();

    let algorithm = match key.key_data() {
        KeypairData::Rsa(rsa) => {
            let n = rsa.public.n.as_positive_bytes().ok_or(Error::Argument)?;
            let algorithm = match n.len() * 8 {
                1024 => AlgorithmId::Rsa1024,
                2048 => AlgorithmId::Rsa2048,
                _ => return Err(Error::NotSupported),
            };
            let elem = n.len() / 2;

            let p = rsa.private.p.as_positive_bytes().ok_or(Error::Argument)?;
            let q = rsa.private.q.as_positive_bytes().ok_or(Error::Argument)?;
            let d = rsa.private.d.as_positive_bytes().ok_or(Error::Argument)?;
            let iqmp = rsa.private.iqmp.as_positive_bytes().ok_or(Error::Argument)?;

            // the card wants CRT form; derive the exponents the SSH key
            // format does not carry
            let one = BigUint::from(1u8);
            let d = BigUint::from_bytes_be(d);
            let dp = Zeroizing::new((&d % (BigUint::from_bytes_be(p) - &one)).to_bytes_be());
            let dq = Zeroizing::new((&d % (BigUint::from_bytes_be(q) - &one)).to_bytes_be());

            for (tag, component) in [
                (0x01, p),
                (0x02, q),
                (0x03, dp.as_slice()),
                (0x04, dq.as_slice()),
                (0x05, iqmp),
            ] {
                write_padded_component(&mut body, tag, component, elem)?;
            }

            algorithm
        }
        KeypairData::Ecdsa(ec) => match ec {
            EcdsaKeypair::NistP256 { private, .. } => {
                write_padded_component(&mut body, 0x06, private.as_slice(), 32)?;
                AlgorithmId::EccP256
            }
            EcdsaKeypair::NistP384 { private, .. } => {
                write_padded_component(&mut body, 0x06, private.as_slice(), 48)?;
                AlgorithmId::EccP384
            }
            _ => return Err(Error::NotSupported),
        },
        _ => return Err(Error::NotSupported),
    };

    if pin_policy != PinPolicy::Default {
        body.write_tag(TAG_PIN_POLICY, &[pin_policy.into()]);
    }
    if touch_policy != TouchPolicy::Default {
        body.write_tag(TAG_TOUCH_POLICY, &[touch_policy.into()]);
    }

    Ok((algorithm, Zeroizing::new(body.into_vec())))
}

/// Write a key component left-padded with zeros to its fixed width.
fn write_padded_component(
    writer: &mut TlvWriter,
    tag: u32,
    component: &[u8],
    width: usize,
) -> Result<()> {
    // tolerate a stray leading zero from bignum serialization
    let component = match component.split_first() {
        Some((&0, rest)) if rest.len() == width => rest,
        _ => component,
    };

    if component.len() > width {
        return Err(Error::Argument);
    }

    writer.push(tag);
    for _ in 0..width - component.len() {
        writer.write_u8(0);
    }
    writer.write_bytes(component);
    writer.pop();
    Ok(())
}

/// Verify `signature` over `data` with the supplied public key.
fn verify_signature(
    public_key: &PublicKey,
    hash: HashAlgorithm,
    data: &[u8],
    signature: &[u8],
) -> Result<()> {
    let digest = hash.digest(data);

    match public_key.key_data() {
        KeyData::Ecdsa(EcdsaPublicKey::NistP256(point)) => {
            use p256::ecdsa::signature::hazmat::PrehashVerifier;

            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(point.as_bytes())
                .map_err(|_| Error::InvalidData)?;
            let sig =
                p256::ecdsa::Signature::from_der(signature).map_err(|_| Error::InvalidData)?;
            key.verify_prehash(&digest, &sig).map_err(|_| Error::KeyAuth)
        }
        KeyData::Ecdsa(EcdsaPublicKey::NistP384(point)) => {
            use p384::ecdsa::signature::hazmat::PrehashVerifier;

            let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(point.as_bytes())
                .map_err(|_| Error::InvalidData)?;
            let sig =
                p384::ecdsa::Signature::from_der(signature).map_err(|_| Error::InvalidData)?;
            key.verify_prehash(&digest, &sig).map_err(|_| Error::KeyAuth)
        }
        KeyData::Rsa(rsa) => {
            let n = rsa.n.as_positive_bytes().ok_or(Error::InvalidData)?;
            let e = rsa.e.as_positive_bytes().ok_or(Error::InvalidData)?;
            let key = rsa::RsaPublicKey::new(BigUint::from_bytes_be(n), BigUint::from_bytes_be(e))
                .map_err(|_| Error::InvalidData)?;

            let padding = match hash {
                HashAlgorithm::Sha1 => Pkcs1v15Sign::new::<Sha1>(),
                HashAlgorithm::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
                HashAlgorithm::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
                HashAlgorithm::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
            };

            key.verify(padding, &digest, signature)
                .map_err(|_| Error::KeyAuth)
        }
        _ => Err(Error::NotSupported),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        dyn_auth_response, ec_sign_input, finish_ec_signature, parse_generated_public,
        pkcs1_v15_pad, AlgorithmId, HashAlgorithm, PinType, SlotId,
    };
    use crate::Error;

    #[test]
    fn slot_wire_values_round_trip() {
        for value in [0x9au8, 0x9b, 0x9c, 0x9d, 0x9e, 0x82, 0x8f, 0x95, 0xf9] {
            let slot = SlotId::try_from(value).unwrap();
            assert_eq!(u8::from(slot), value);
        }
        assert!(SlotId::try_from(0x80).is_err());
        assert!(SlotId::try_from(0x96).is_err());
    }

    #[test]
    fn retired_slot_cert_tags_are_contiguous() {
        assert_eq!(SlotId::Retired(1).cert_object(), Some(0x5f_c10d));
        assert_eq!(SlotId::Retired(20).cert_object(), Some(0x5f_c120));
        assert_eq!(SlotId::Administration.cert_object(), None);
    }

    #[test]
    fn probe_order_covers_all_cert_slots() {
        assert_eq!(SlotId::ALL.len(), 24);
        assert_eq!(SlotId::ALL[0], SlotId::Authentication);
        assert_eq!(SlotId::ALL[4], SlotId::Retired(1));
        assert_eq!(SlotId::ALL[23], SlotId::Retired(20));
    }

    #[test]
    fn pin_references() {
        assert_eq!(PinType::Piv.reference(), 0x80);
        assert_eq!(PinType::Global.reference(), 0x00);
        assert_eq!(PinType::Puk.reference(), 0x81);
    }

    #[test]
    fn pkcs1_padding_structure() {
        let digest = [0xabu8; 32];
        let em = pkcs1_v15_pad(HashAlgorithm::Sha256, &digest, 256).unwrap();

        assert_eq!(em.len(), 256);
        assert_eq!(&em[..2], [0x00, 0x01]);

        let t_len = 19 + 32;
        assert!(em[2..256 - t_len - 1].iter().all(|&b| b == 0xff));
        assert_eq!(em[256 - t_len - 1], 0x00);
        assert_eq!(&em[256 - 32..], digest);
    }

    #[test]
    fn pkcs1_padding_rejects_mismatched_digest() {
        assert_eq!(
            pkcs1_v15_pad(HashAlgorithm::Sha256, &[0u8; 20], 256),
            Err(Error::Argument)
        );
    }

    #[test]
    fn ec_input_truncates_and_extends() {
        // SHA-512 into P-256: truncated
        assert_eq!(ec_sign_input(&[0x11; 64], 32), vec![0x11; 32]);

        // SHA-256 into P-384: zero-extended on the left
        let input = ec_sign_input(&[0x22; 32], 48);
        assert_eq!(&input[..16], [0u8; 16]);
        assert_eq!(&input[16..], [0x22; 32]);
    }

    #[test]
    fn raw_ec_signature_gets_der_wrapped() {
        let mut raw = vec![0u8; 64];
        raw[0] = 0x80; // forces a 0x00 pad byte in the INTEGER
        raw[32] = 0x01;

        let der = finish_ec_signature(&raw, AlgorithmId::EccP256).unwrap();
        assert_eq!(der[0], 0x30);
        // r: 33 bytes (leading 0x00 + 32), s: 1 byte
        assert_eq!(der[2], 0x02);
        assert_eq!(der[3], 33);
        assert_eq!(der[4], 0x00);
        assert_eq!(der[5], 0x80);

        // an already-DER reply passes through untouched
        let passthrough = finish_ec_signature(&der, AlgorithmId::EccP256).unwrap();
        assert_eq!(passthrough, der);
    }

    #[test]
    fn dyn_auth_reply_parsing() {
        // 7c { 82 sig }
        let reply = [0x7c, 0x05, 0x82, 0x03, 0x0a, 0x0b, 0x0c];
        assert_eq!(dyn_auth_response(&reply).unwrap(), [0x0a, 0x0b, 0x0c]);

        // response tag missing
        let reply = [0x7c, 0x04, 0x81, 0x02, 0x01, 0x02];
        assert_eq!(dyn_auth_response(&reply), Err(Error::InvalidData));

        // not a dynamic authentication template at all
        assert_eq!(dyn_auth_response(&[0x30, 0x00]), Err(Error::InvalidData));
    }

    #[test]
    fn generated_ec_key_must_be_on_curve() {
        // P-256 generator point
        let mut point = vec![0x04u8];
        point.extend_from_slice(&[
            0x6b, 0x17, 0xd1, 0xf2, 0xe1, 0x2c, 0x42, 0x47, 0xf8, 0xbc, 0xe6, 0xe5, 0x63, 0xa4,
            0x40, 0xf2, 0x77, 0x03, 0x7d, 0x81, 0x2d, 0xeb, 0x33, 0xa0, 0xf4, 0xa1, 0x39, 0x45,
            0xd8, 0x98, 0xc2, 0x96, 0x4f, 0xe3, 0x42, 0xe2, 0xfe, 0x1a, 0x7f, 0x9b, 0x8e, 0xe7,
            0xeb, 0x4a, 0x7c, 0x0f, 0x9e, 0x16, 0x2b, 0xce, 0x33, 0x57, 0x6b, 0x31, 0x5e, 0xce,
            0xcb, 0xb6, 0x40, 0x68, 0x37, 0xbf, 0x51, 0xf5,
        ]);

        let mut reply = vec![0x7f, 0x49, 0x43, 0x86, 0x41];
        reply.extend_from_slice(&point);
        let key = parse_generated_public(AlgorithmId::EccP256, &reply).unwrap();
        assert!(matches!(
            key.key_data(),
            ssh_key::public::KeyData::Ecdsa(_)
        ));

        // corrupt the point: parse must fail rather than hand back a bogus key
        let last = reply.len() - 1;
        reply[last] ^= 0x01;
        assert_eq!(
            parse_generated_public(AlgorithmId::EccP256, &reply),
            Err(Error::InvalidData)
        );
    }

    #[test]
    fn generated_rsa_key_parses() {
        // 7f49 { 81 modulus, 82 exponent } with a toy 4-byte modulus
        let reply = [
            0x7f, 0x49, 0x0b, 0x81, 0x04, 0x00, 0xc0, 0xff, 0xee, 0x82, 0x03, 0x01, 0x00, 0x01,
        ];
        // modulus is not 1024/2048 bits, but the template parse itself works;
        // size policing happens at certificate ingestion
        let key = parse_generated_public(AlgorithmId::Rsa2048, &reply).unwrap();
        assert!(matches!(key.key_data(), ssh_key::public::KeyData::Rsa(_)));
    }
}
