//! ECDH-sealed envelopes ("boxes").
//!
//! A box binds a ciphertext to a card-held EC key: the sender generates an
//! ephemeral keypair on the recipient key's curve, derives a symmetric key
//! from the ephemeral-static ECDH shared secret, and seals the payload
//! under an AEAD. The serialized box is self-describing (it names its
//! cipher and KDF and carries both public keys), so the only thing needed
//! to open it is the recipient private key: either offline, or on-card via
//! GENERAL AUTHENTICATE key agreement.
//!
//! Wire format (all multi-byte fields length-prefixed like SSH strings):
//!
//! ```text
//! 0xB0 0xC5 | version | flags | [guid(16) slot(1)] |
//!   cipher-name | kdf-name | recipient-key | ephemeral-key |
//!   nonce | ciphertext
//! ```
//!
//! Version 3 is written; versions 1 (aes256-ctr + HMAC-SHA256, no cipher/
//! KDF strings on the wire) and 2 (no payload padding) are still read and
//! opened.

use crate::{
    consts::GUID_LEN,
    piv::SlotId,
    tlv::{TlvReader, TlvWriter},
    token::Token,
    transaction::Transaction,
    Error, Result,
};
use chacha20poly1305::aead::{Aead, KeyInit};
use hmac::{Hmac, Mac};
use log::error;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256, Sha384, Sha512};
use ssh_key::{
    private::{EcdsaKeypair, KeypairData},
    public::{EcdsaPublicKey, KeyData},
    PrivateKey, PublicKey,
};
use std::str;
use subtle_encoding::hex;
use zeroize::{Zeroize, Zeroizing};

/// Serialized box magic
const BOX_MAGIC: [u8; 2] = [0xb0, 0xc5];

/// Format version written by this library
const BOX_VERSION: u8 = 3;

/// Flags bit: the box is bound to a (guid, slot) pair
const FLAG_GUID_SLOT: u8 = 0x01;

/// Version 3 payload framing pads to this boundary
const PAD_BLOCK: usize = 16;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Box payload ciphers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BoxCipher {
    /// ChaCha20-Poly1305 AEAD (the default)
    ChaCha20Poly1305,

    /// AES-256-GCM AEAD
    Aes256Gcm,

    /// AES-256-CTR with HMAC-SHA256, encrypt-then-MAC. Only written by
    /// version 1 boxes; kept for opening them.
    Aes256CtrHmac,
}

impl BoxCipher {
    /// The wire name of this cipher.
    pub fn name(self) -> &'static str {
        match self {
            BoxCipher::ChaCha20Poly1305 => "chacha20-poly1305",
            BoxCipher::Aes256Gcm => "aes256-gcm",
            BoxCipher::Aes256CtrHmac => "aes256-ctr",
        }
    }

    fn from_name(name: &str) -> Result<Self> {
        match name {
            "chacha20-poly1305" => Ok(BoxCipher::ChaCha20Poly1305),
            "aes256-gcm" => Ok(BoxCipher::Aes256Gcm),
            "aes256-ctr" => Ok(BoxCipher::Aes256CtrHmac),
            _ => Err(Error::NotSupported),
        }
    }

    /// Symmetric key material this cipher consumes.
    fn key_len(self) -> usize {
        match self {
            BoxCipher::ChaCha20Poly1305 | BoxCipher::Aes256Gcm => 32,
            // 32 bytes AES + 32 bytes HMAC
            BoxCipher::Aes256CtrHmac => 64,
        }
    }

    /// Nonce length this cipher requires.
    pub(crate) fn nonce_len(self) -> usize {
        match self {
            BoxCipher::ChaCha20Poly1305 | BoxCipher::Aes256Gcm => 12,
            BoxCipher::Aes256CtrHmac => 16,
        }
    }

    fn encrypt(self, key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        match self {
            BoxCipher::ChaCha20Poly1305 => chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
                .map_err(|_| Error::InvalidData)?
                .encrypt(chacha20poly1305::Nonce::from_slice(nonce), plaintext)
                .map_err(|_| Error::InvalidData),
            BoxCipher::Aes256Gcm => aes_gcm::Aes256Gcm::new_from_slice(key)
                .map_err(|_| Error::InvalidData)?
                .encrypt(aes_gcm::Nonce::from_slice(nonce), plaintext)
                .map_err(|_| Error::InvalidData),
            BoxCipher::Aes256CtrHmac => {
                use cipher::{KeyIvInit, StreamCipher};

                let (enc_key, mac_key) = key.split_at(32);

                let mut ciphertext = plaintext.to_vec();
                Aes256Ctr::new_from_slices(enc_key, nonce)
                    .map_err(|_| Error::InvalidData)?
                    .apply_keystream(&mut ciphertext);

                let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
                    .map_err(|_| Error::InvalidData)?;
                mac.update(nonce);
                mac.update(&ciphertext);
                ciphertext.extend_from_slice(&mac.finalize().into_bytes());
                Ok(ciphertext)
            }
        }
    }

    fn decrypt(self, key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        match self {
            BoxCipher::ChaCha20Poly1305 => chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
                .map_err(|_| Error::InvalidData)?
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext)
                .map(Zeroizing::new)
                .map_err(|_| Error::InvalidData),
            BoxCipher::Aes256Gcm => aes_gcm::Aes256Gcm::new_from_slice(key)
                .map_err(|_| Error::InvalidData)?
                .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
                .map(Zeroizing::new)
                .map_err(|_| Error::InvalidData),
            BoxCipher::Aes256CtrHmac => {
                use cipher::{KeyIvInit, StreamCipher};

                if ciphertext.len() < 32 {
                    return Err(Error::InvalidData);
                }
                let (body, tag) = ciphertext.split_at(ciphertext.len() - 32);
                let (enc_key, mac_key) = key.split_at(32);

                let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
                    .map_err(|_| Error::InvalidData)?;
                mac.update(nonce);
                mac.update(body);
                mac.verify_slice(tag).map_err(|_| Error::InvalidData)?;

                let mut plaintext = Zeroizing::new(body.to_vec());
                Aes256Ctr::new_from_slices(enc_key, nonce)
                    .map_err(|_| Error::InvalidData)?
                    .apply_keystream(&mut plaintext);
                Ok(plaintext)
            }
        }
    }
}

/// Key derivation functions for turning the ECDH shared secret into cipher
/// key material.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BoxKdf {
    /// SHA-512 (the default)
    Sha512,

    /// SHA-384
    Sha384,

    /// SHA-256
    Sha256,
}

impl BoxKdf {
    /// The wire name of this KDF.
    pub fn name(self) -> &'static str {
        match self {
            BoxKdf::Sha512 => "sha512",
            BoxKdf::Sha384 => "sha384",
            BoxKdf::Sha256 => "sha256",
        }
    }

    fn from_name(name: &str) -> Result<Self> {
        match name {
            "sha512" => Ok(BoxKdf::Sha512),
            "sha384" => Ok(BoxKdf::Sha384),
            "sha256" => Ok(BoxKdf::Sha256),
            _ => Err(Error::NotSupported),
        }
    }

    /// Derive key material: a digest over the length-framed shared secret
    /// and the domain separator.
    fn derive(self, shared: &[u8], needed: usize) -> Result<Zeroizing<Vec<u8>>> {
        let mut input = TlvWriter::new();
        input.write_bytes32(shared);
        input.write_bytes(b"piv-box");

        let digest = Zeroizing::new(match self {
            BoxKdf::Sha512 => Sha512::digest(input.as_bytes()).to_vec(),
            BoxKdf::Sha384 => Sha384::digest(input.as_bytes()).to_vec(),
            BoxKdf::Sha256 => Sha256::digest(input.as_bytes()).to_vec(),
        });

        if digest.len() < needed {
            error!(
                "KDF {} yields {} bytes, cipher needs {}",
                self.name(),
                digest.len(),
                needed
            );
            return Err(Error::NotSupported);
        }

        Ok(digest)
    }
}

/// A sealed (or to-be-sealed) ECDH envelope.
///
/// Cloning yields a deep, independent copy. Dropping zeroizes any
/// plaintext still inside.
#[derive(Clone)]
pub struct EcdhBox {
    version: u8,
    guid: Option<[u8; GUID_LEN]>,
    slot: Option<SlotId>,
    cipher: BoxCipher,
    kdf: BoxKdf,
    public_key: Option<PublicKey>,
    ephemeral_key: Option<PublicKey>,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
    plaintext: Option<Zeroizing<Vec<u8>>>,
}

impl Default for EcdhBox {
    fn default() -> Self {
        Self::new()
    }
}

impl EcdhBox {
    /// An empty box with the current format defaults.
    pub fn new() -> Self {
        EcdhBox {
            version: BOX_VERSION,
            guid: None,
            slot: None,
            cipher: BoxCipher::ChaCha20Poly1305,
            kdf: BoxKdf::Sha512,
            public_key: None,
            ephemeral_key: None,
            nonce: vec![],
            ciphertext: vec![],
            plaintext: None,
        }
    }

    /// Select the payload cipher. Not available once sealed.
    pub fn set_cipher(&mut self, cipher: BoxCipher) -> Result<()> {
        if self.is_sealed() {
            return Err(Error::Argument);
        }
        if cipher == BoxCipher::Aes256CtrHmac && self.version != 1 {
            // only the v1 format pairs with the non-AEAD construction
            return Err(Error::Argument);
        }
        self.cipher = cipher;
        Ok(())
    }

    /// Select the KDF. Not available once sealed.
    pub fn set_kdf(&mut self, kdf: BoxKdf) -> Result<()> {
        if self.is_sealed() {
            return Err(Error::Argument);
        }
        self.kdf = kdf;
        Ok(())
    }

    /// Write an older format version (1 or 2), adjusting the cipher to
    /// that version's default.
    pub fn set_version(&mut self, version: u8) -> Result<()> {
        if self.is_sealed() || version == 0 || version > BOX_VERSION {
            return Err(Error::Argument);
        }
        self.version = version;
        self.cipher = if version == 1 {
            BoxCipher::Aes256CtrHmac
        } else {
            BoxCipher::ChaCha20Poly1305
        };
        Ok(())
    }

    /// Bind the box to a specific card and slot.
    pub fn set_guid_slot(&mut self, guid: [u8; GUID_LEN], slot: SlotId) {
        self.guid = Some(guid);
        self.slot = Some(slot);
    }

    /// Format version of this box.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Is the box bound to a (guid, slot) pair?
    pub fn has_guid_slot(&self) -> bool {
        self.guid.is_some() && self.slot.is_some()
    }

    /// The bound card GUID, if any.
    pub fn guid(&self) -> Option<&[u8; GUID_LEN]> {
        self.guid.as_ref()
    }

    /// The bound GUID as lowercase hex.
    pub fn guid_hex(&self) -> Option<String> {
        self.guid.map(|guid| {
            str::from_utf8(&hex::encode(guid))
                .expect("hex is ASCII")
                .to_owned()
        })
    }

    /// The bound slot, if any.
    pub fn slot(&self) -> Option<SlotId> {
        self.slot
    }

    /// The recipient public key.
    pub fn public_key(&self) -> Option<&PublicKey> {
        self.public_key.as_ref()
    }

    /// The ephemeral public key recorded at seal time.
    pub fn ephemeral_key(&self) -> Option<&PublicKey> {
        self.ephemeral_key.as_ref()
    }

    /// The payload cipher.
    pub fn cipher(&self) -> BoxCipher {
        self.cipher
    }

    /// The KDF.
    pub fn kdf(&self) -> BoxKdf {
        self.kdf
    }

    /// Has the box been sealed?
    pub fn is_sealed(&self) -> bool {
        !self.ciphertext.is_empty()
    }

    /// Ciphertext length, including the authentication tag.
    pub fn encrypted_len(&self) -> usize {
        self.ciphertext.len()
    }

    /// Nonce length the box's cipher requires; a sealed box carries a
    /// nonce of exactly this size.
    pub fn nonce_size(&self) -> usize {
        self.cipher.nonce_len()
    }

    /// Stage plaintext for sealing.
    pub fn set_data(&mut self, data: &[u8]) {
        self.plaintext = Some(Zeroizing::new(data.to_vec()));
    }

    /// Take the plaintext out of an opened box (or staged data back out of
    /// an unsealed one). The box's copy is zeroized.
    pub fn take_data(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        self.plaintext.take().ok_or(Error::Argument)
    }

    /// Seal offline to a recipient EC public key.
    pub fn seal_offline(&mut self, recipient: &PublicKey) -> Result<()> {
        let (ephemeral, shared) = ephemeral_agreement(recipient)?;
        self.seal_with_secret(recipient.clone(), ephemeral, &shared)
    }

    /// Seal to a card slot: the binding (guid, slot) is recorded and the
    /// shared secret is computed by the card. The caller must have
    /// verified the PIN beforehand if the slot demands it.
    pub fn seal(&mut self, txn: &mut Transaction<'_>, slot: SlotId) -> Result<()> {
        let recipient = txn
            .slot(slot)
            .and_then(|s| s.public_key())
            .ok_or(Error::NotFound)?
            .clone();

        let ephemeral = ephemeral_public_for(&recipient)?;
        let shared = txn.ecdh(slot, &ephemeral)?;

        self.set_guid_slot(txn.state.guid, slot);
        self.seal_with_secret(recipient, ephemeral, &shared)
    }

    fn seal_with_secret(
        &mut self,
        recipient: PublicKey,
        ephemeral: PublicKey,
        shared: &[u8],
    ) -> Result<()> {
        let plaintext = self.plaintext.take().ok_or(Error::Argument)?;

        let framed = if self.version >= 3 {
            pad_payload(&plaintext)
        } else {
            Zeroizing::new(plaintext.to_vec())
        };

        let key_len = self.cipher.key_len();
        let nonce_len = self.cipher.nonce_len();

        let (derived, nonce) = if self.cipher == BoxCipher::Aes256CtrHmac {
            // v1: the whole digest is key material, the nonce is random
            let derived = self.kdf.derive(shared, key_len)?;
            let mut nonce = vec![0u8; nonce_len];
            OsRng.fill_bytes(&mut nonce);
            (derived, nonce)
        } else {
            let derived = self.kdf.derive(shared, key_len + nonce_len)?;
            let nonce = derived[key_len..key_len + nonce_len].to_vec();
            (derived, nonce)
        };

        self.ciphertext = self.cipher.encrypt(&derived[..key_len], &nonce, &framed)?;
        self.nonce = nonce;
        self.public_key = Some(recipient);
        self.ephemeral_key = Some(ephemeral);
        // plaintext was moved out and zeroizes as `framed`/`plaintext` drop
        Ok(())
    }

    /// Open offline with the recipient private key.
    pub fn open_offline(&mut self, key: &PrivateKey) -> Result<()> {
        let ephemeral = self.ephemeral_key.as_ref().ok_or(Error::Argument)?;
        let shared = static_agreement(key, ephemeral)?;
        self.open_with_secret(&shared)
    }

    /// Open on-card: the shared secret is computed by the bound slot. The
    /// caller must have verified the PIN beforehand if the slot demands it.
    pub fn open(&mut self, txn: &mut Transaction<'_>, slot: SlotId) -> Result<()> {
        let ephemeral = self.ephemeral_key.clone().ok_or(Error::Argument)?;
        let shared = txn.ecdh(slot, &ephemeral)?;
        self.open_with_secret(&shared)
    }

    fn open_with_secret(&mut self, shared: &[u8]) -> Result<()> {
        if !self.is_sealed() {
            return Err(Error::Argument);
        }

        if self.nonce.len() != self.cipher.nonce_len() {
            return Err(Error::InvalidData);
        }

        let key_len = self.cipher.key_len();
        let derived = self.kdf.derive(shared, key_len)?;

        // never distinguish a bad tag from mangled ciphertext
        let framed = self
            .cipher
            .decrypt(&derived[..key_len], &self.nonce, &self.ciphertext)?;

        let plaintext = if self.version >= 3 {
            unpad_payload(&framed)?
        } else {
            framed
        };

        self.plaintext = Some(plaintext);
        Ok(())
    }

    /// Serialize onto the end of an existing buffer.
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        let public_key = self.public_key.as_ref().ok_or(Error::Argument)?;
        let ephemeral_key = self.ephemeral_key.as_ref().ok_or(Error::Argument)?;

        if !self.is_sealed() {
            return Err(Error::Argument);
        }

        let mut writer = TlvWriter::new();
        writer.write_bytes(&BOX_MAGIC);
        writer.write_u8(self.version);

        match (self.guid, self.slot) {
            (Some(guid), Some(slot)) => {
                writer.write_u8(FLAG_GUID_SLOT);
                writer.write_bytes(&guid);
                writer.write_u8(slot.into());
            }
            _ => writer.write_u8(0),
        }

        if self.version >= 2 {
            writer.write_bytes32(self.cipher.name().as_bytes());
            writer.write_bytes32(self.kdf.name().as_bytes());
        }

        let public_wire = public_key.to_bytes().map_err(|_| Error::InvalidData)?;
        let ephemeral_wire = ephemeral_key.to_bytes().map_err(|_| Error::InvalidData)?;
        writer.write_bytes32(&public_wire);
        writer.write_bytes32(&ephemeral_wire);
        writer.write_bytes32(&self.nonce);
        writer.write_bytes32(&self.ciphertext);

        buffer.extend_from_slice(writer.as_bytes());
        Ok(())
    }

    /// Serialize to a standalone buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buffer = vec![];
        self.encode(&mut buffer)?;
        Ok(buffer)
    }

    /// Parse a serialized box. [`EcdhBox::to_bytes`] of the result
    /// reproduces the input byte for byte.
    pub fn from_bytes(data: &[u8]) -> Result<EcdhBox> {
        let mut reader = TlvReader::new(data);

        if reader.read_bytes(BOX_MAGIC.len())? != BOX_MAGIC {
            return Err(Error::InvalidData);
        }

        let version = reader.read_u8()?;
        if version == 0 || version > BOX_VERSION {
            return Err(Error::NotSupported);
        }

        let flags = reader.read_u8()?;
        let (guid, slot) = if flags & FLAG_GUID_SLOT != 0 {
            let guid: [u8; GUID_LEN] = reader
                .read_bytes(GUID_LEN)?
                .try_into()
                .expect("sized read");
            let slot = SlotId::try_from(reader.read_u8()?)?;
            (Some(guid), Some(slot))
        } else {
            (None, None)
        };

        let (cipher, kdf) = if version >= 2 {
            let cipher_name =
                str::from_utf8(reader.read_bytes32()?).map_err(|_| Error::InvalidData)?;
            let kdf_name =
                str::from_utf8(reader.read_bytes32()?).map_err(|_| Error::InvalidData)?;
            (
                BoxCipher::from_name(cipher_name)?,
                BoxKdf::from_name(kdf_name)?,
            )
        } else {
            (BoxCipher::Aes256CtrHmac, BoxKdf::Sha512)
        };

        let public_key =
            PublicKey::from_bytes(reader.read_bytes32()?).map_err(|_| Error::InvalidData)?;
        let ephemeral_key =
            PublicKey::from_bytes(reader.read_bytes32()?).map_err(|_| Error::InvalidData)?;

        let nonce = reader.read_bytes32()?.to_vec();
        let ciphertext = reader.read_bytes32()?.to_vec();

        if reader.has_remaining() {
            return Err(Error::InvalidData);
        }

        // the two keys must live on the same curve
        if curve_of(&ephemeral_key)? != curve_of(&public_key)? {
            return Err(Error::InvalidData);
        }

        Ok(EcdhBox {
            version,
            guid,
            slot,
            cipher,
            kdf,
            public_key: Some(public_key),
            ephemeral_key: Some(ephemeral_key),
            nonce,
            ciphertext,
            plaintext: None,
        })
    }

    /// Locate the token (by index into `tokens`) and slot this box can be
    /// opened with: by GUID binding when bound, else by searching
    /// enumerated slots for the recipient public key.
    pub fn find_token(&self, tokens: &[Token]) -> Option<(usize, SlotId)> {
        for (index, token) in tokens.iter().enumerate() {
            if let (Some(guid), Some(slot)) = (&self.guid, self.slot) {
                if token.guid() == guid {
                    return Some((index, slot));
                }
                continue;
            }

            if let Some(wanted) = &self.public_key {
                for slot in token.slots() {
                    if slot
                        .public_key()
                        .map(|key| key.key_data() == wanted.key_data())
                        .unwrap_or(false)
                    {
                        return Some((index, slot.id()));
                    }
                }
            }
        }

        None
    }
}

impl std::fmt::Debug for EcdhBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdhBox")
            .field("version", &self.version)
            .field("guid", &self.guid_hex())
            .field("slot", &self.slot)
            .field("cipher", &self.cipher)
            .field("kdf", &self.kdf)
            .field("sealed", &self.is_sealed())
            .finish_non_exhaustive()
    }
}

#[derive(Eq, PartialEq)]
enum BoxCurve {
    P256,
    P384,
}

fn curve_of(key: &PublicKey) -> Result<BoxCurve> {
    match key.key_data() {
        KeyData::Ecdsa(EcdsaPublicKey::NistP256(_)) => Ok(BoxCurve::P256),
        KeyData::Ecdsa(EcdsaPublicKey::NistP384(_)) => Ok(BoxCurve::P384),
        _ => Err(Error::NotSupported),
    }
}

/// Generate an ephemeral keypair on the recipient's curve and run the
/// agreement locally.
fn ephemeral_agreement(recipient: &PublicKey) -> Result<(PublicKey, Zeroizing<Vec<u8>>)> {
    match recipient.key_data() {
        KeyData::Ecdsa(EcdsaPublicKey::NistP256(point)) => {
            let their_key =
                p256::PublicKey::from_sec1_bytes(point.as_bytes()).map_err(|_| Error::InvalidData)?;
            let secret = p256::ecdh::EphemeralSecret::random(&mut OsRng);
            let ephemeral = ecdsa_public(&secret.public_key())?;
            let shared = Zeroizing::new(
                secret
                    .diffie_hellman(&their_key)
                    .raw_secret_bytes()
                    .to_vec(),
            );
            Ok((ephemeral, shared))
        }
        KeyData::Ecdsa(EcdsaPublicKey::NistP384(point)) => {
            let their_key =
                p384::PublicKey::from_sec1_bytes(point.as_bytes()).map_err(|_| Error::InvalidData)?;
            let secret = p384::ecdh::EphemeralSecret::random(&mut OsRng);
            let ephemeral = ecdsa_public_p384(&secret.public_key())?;
            let shared = Zeroizing::new(
                secret
                    .diffie_hellman(&their_key)
                    .raw_secret_bytes()
                    .to_vec(),
            );
            Ok((ephemeral, shared))
        }
        _ => Err(Error::NotSupported),
    }
}

/// Generate an ephemeral public key on the recipient's curve for on-card
/// sealing. The card derives the shared secret from this point, so the
/// ephemeral private half is discarded here without ever being used.
fn ephemeral_public_for(recipient: &PublicKey) -> Result<PublicKey> {
    match curve_of(recipient)? {
        BoxCurve::P256 => {
            let secret = p256::SecretKey::random(&mut OsRng);
            ecdsa_public(&secret.public_key())
        }
        BoxCurve::P384 => {
            let secret = p384::SecretKey::random(&mut OsRng);
            ecdsa_public_p384(&secret.public_key())
        }
    }
}

/// Static-ephemeral agreement for offline opening.
fn static_agreement(key: &PrivateKey, ephemeral: &PublicKey) -> Result<Zeroizing<Vec<u8>>> {
    match (key.key_data(), ephemeral.key_data()) {
        (
            KeypairData::Ecdsa(EcdsaKeypair::NistP256 { private, .. }),
            KeyData::Ecdsa(EcdsaPublicKey::NistP256(point)),
        ) => {
            let secret =
                p256::SecretKey::from_slice(private.as_slice()).map_err(|_| Error::InvalidData)?;
            let their_key =
                p256::PublicKey::from_sec1_bytes(point.as_bytes()).map_err(|_| Error::InvalidData)?;
            let shared =
                p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), their_key.as_affine());
            Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
        }
        (
            KeypairData::Ecdsa(EcdsaKeypair::NistP384 { private, .. }),
            KeyData::Ecdsa(EcdsaPublicKey::NistP384(point)),
        ) => {
            let secret =
                p384::SecretKey::from_slice(private.as_slice()).map_err(|_| Error::InvalidData)?;
            let their_key =
                p384::PublicKey::from_sec1_bytes(point.as_bytes()).map_err(|_| Error::InvalidData)?;
            let shared =
                p384::ecdh::diffie_hellman(secret.to_nonzero_scalar(), their_key.as_affine());
            Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
        }
        _ => {
            error!("private key curve does not match the box's ephemeral key");
            Err(Error::Argument)
        }
    }
}

fn ecdsa_public(key: &p256::PublicKey) -> Result<PublicKey> {
    use elliptic_curve::sec1::ToEncodedPoint;

    Ok(PublicKey::new(
        KeyData::Ecdsa(EcdsaPublicKey::NistP256(key.to_encoded_point(false))),
        "",
    ))
}

fn ecdsa_public_p384(key: &p384::PublicKey) -> Result<PublicKey> {
    use elliptic_curve::sec1::ToEncodedPoint;

    Ok(PublicKey::new(
        KeyData::Ecdsa(EcdsaPublicKey::NistP384(key.to_encoded_point(false))),
        "",
    ))
}

/// Version 3 payload framing: pad-length byte, random padding, payload;
/// the whole a multiple of the block size so the ciphertext hides the
/// payload length.
fn pad_payload(data: &[u8]) -> Zeroizing<Vec<u8>> {
    let pad = (PAD_BLOCK - (data.len() + 1) % PAD_BLOCK) % PAD_BLOCK;

    let mut framed = Zeroizing::new(Vec::with_capacity(1 + pad + data.len()));
    framed.push(pad as u8);

    let mut padding = vec![0u8; pad];
    OsRng.fill_bytes(&mut padding);
    framed.extend_from_slice(&padding);
    padding.zeroize();

    framed.extend_from_slice(data);
    framed
}

fn unpad_payload(framed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let pad = *framed.first().ok_or(Error::InvalidData)? as usize;
    if 1 + pad > framed.len() {
        return Err(Error::InvalidData);
    }
    Ok(Zeroizing::new(framed[1 + pad..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::{BoxCipher, BoxKdf, EcdhBox};
    use crate::{piv::SlotId, Error};
    use rand_core::OsRng;
    use ssh_key::{Algorithm, EcdsaCurve, PrivateKey};

    fn keypair(curve: EcdsaCurve) -> PrivateKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ecdsa { curve }).unwrap()
    }

    #[test]
    fn seal_open_round_trip_p256_chacha() {
        let key = keypair(EcdsaCurve::NistP256);

        let mut sealed = EcdhBox::new();
        sealed.set_data(b"attack at dawn");
        sealed.seal_offline(key.public_key()).unwrap();
        assert!(sealed.is_sealed());

        let mut opened = EcdhBox::from_bytes(&sealed.to_bytes().unwrap()).unwrap();
        opened.open_offline(&key).unwrap();
        assert_eq!(&*opened.take_data().unwrap(), b"attack at dawn");

        // the plaintext can only be taken once
        assert_eq!(opened.take_data().unwrap_err(), Error::Argument);
    }

    #[test]
    fn seal_open_round_trip_p384_gcm() {
        let key = keypair(EcdsaCurve::NistP384);

        let mut sealed = EcdhBox::new();
        sealed.set_cipher(BoxCipher::Aes256Gcm).unwrap();
        sealed.set_data(b"hello world");
        sealed.seal_offline(key.public_key()).unwrap();

        let mut opened = EcdhBox::from_bytes(&sealed.to_bytes().unwrap()).unwrap();
        assert_eq!(opened.cipher(), BoxCipher::Aes256Gcm);
        opened.open_offline(&key).unwrap();
        assert_eq!(&*opened.take_data().unwrap(), b"hello world");
    }

    #[test]
    fn serialized_length_is_exactly_framed() {
        let key = keypair(EcdsaCurve::NistP384);

        let mut sealed = EcdhBox::new();
        sealed.set_data(b"hello world");
        sealed.seal_offline(key.public_key()).unwrap();

        let bytes = sealed.to_bytes().unwrap();
        let public_wire = key.public_key().to_bytes().unwrap();
        let ephemeral_wire = sealed.ephemeral_key().unwrap().to_bytes().unwrap();

        // "hello world" is 11 bytes; the v3 frame rounds 12 up to 16,
        // plus a 16-byte AEAD tag
        assert_eq!(sealed.encrypted_len(), 32);

        let expected = 2 + 1 + 1
            + 4 + "chacha20-poly1305".len()
            + 4 + "sha512".len()
            + 4 + public_wire.len()
            + 4 + ephemeral_wire.len()
            + 4 + 12
            + 4 + 32;
        assert_eq!(bytes.len(), expected);
    }

    #[test]
    fn parse_serialize_is_byte_exact() {
        let key = keypair(EcdsaCurve::NistP256);

        let mut sealed = EcdhBox::new();
        sealed.set_guid_slot([0xab; 16], SlotId::KeyManagement);
        sealed.set_data(b"payload");
        sealed.seal_offline(key.public_key()).unwrap();

        let bytes = sealed.to_bytes().unwrap();
        let parsed = EcdhBox::from_bytes(&bytes).unwrap();

        assert!(parsed.has_guid_slot());
        assert_eq!(parsed.guid(), Some(&[0xab; 16]));
        assert_eq!(parsed.slot(), Some(SlotId::KeyManagement));
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn bit_flips_fail_to_open() {
        let key = keypair(EcdsaCurve::NistP256);

        let mut sealed = EcdhBox::new();
        sealed.set_data(b"sensitive");
        sealed.seal_offline(key.public_key()).unwrap();
        let bytes = sealed.to_bytes().unwrap();

        // flip one bit in the ciphertext (the last field) and in the nonce
        for offset in [bytes.len() - 1, bytes.len() - 40] {
            let mut mangled = bytes.clone();
            mangled[offset] ^= 0x01;

            match EcdhBox::from_bytes(&mangled) {
                Ok(mut tampered) => {
                    assert_eq!(tampered.open_offline(&key), Err(Error::InvalidData));
                }
                // damage in a length field can kill the parse instead
                Err(e) => assert_eq!(e, Error::InvalidData),
            }
        }
    }

    #[test]
    fn v1_compatibility_round_trip() {
        let key = keypair(EcdsaCurve::NistP256);

        let mut sealed = EcdhBox::new();
        sealed.set_version(1).unwrap();
        assert_eq!(sealed.cipher(), BoxCipher::Aes256CtrHmac);
        sealed.set_data(b"legacy payload");
        sealed.seal_offline(key.public_key()).unwrap();

        let bytes = sealed.to_bytes().unwrap();
        let mut opened = EcdhBox::from_bytes(&bytes).unwrap();
        assert_eq!(opened.version(), 1);
        assert_eq!(opened.cipher(), BoxCipher::Aes256CtrHmac);
        assert_eq!(opened.kdf(), BoxKdf::Sha512);
        opened.open_offline(&key).unwrap();
        assert_eq!(&*opened.take_data().unwrap(), b"legacy payload");

        // MAC tamper
        let mut mangled = bytes;
        let last = mangled.len() - 1;
        mangled[last] ^= 0x80;
        let mut tampered = EcdhBox::from_bytes(&mangled).unwrap();
        assert_eq!(tampered.open_offline(&key), Err(Error::InvalidData));
    }

    #[test]
    fn wrong_key_fails_closed() {
        let right = keypair(EcdsaCurve::NistP256);
        let wrong = keypair(EcdsaCurve::NistP256);

        let mut sealed = EcdhBox::new();
        sealed.set_data(b"secret");
        sealed.seal_offline(right.public_key()).unwrap();

        assert_eq!(sealed.open_offline(&wrong), Err(Error::InvalidData));
    }

    #[test]
    fn curve_mismatch_is_an_argument_error() {
        let p256 = keypair(EcdsaCurve::NistP256);
        let p384 = keypair(EcdsaCurve::NistP384);

        let mut sealed = EcdhBox::new();
        sealed.set_data(b"x");
        sealed.seal_offline(p256.public_key()).unwrap();

        assert_eq!(sealed.open_offline(&p384), Err(Error::Argument));
    }

    #[test]
    fn clone_is_independent() {
        let key = keypair(EcdsaCurve::NistP256);

        let mut original = EcdhBox::new();
        original.set_data(b"twice-told");
        original.seal_offline(key.public_key()).unwrap();

        let mut copy = original.clone();
        copy.open_offline(&key).unwrap();
        assert_eq!(&*copy.take_data().unwrap(), b"twice-told");

        // the original is untouched and still opens on its own
        original.open_offline(&key).unwrap();
        assert_eq!(&*original.take_data().unwrap(), b"twice-told");
    }

    #[test]
    fn unsealed_box_cannot_serialize() {
        let mut unsealed = EcdhBox::new();
        unsealed.set_data(b"nope");
        assert_eq!(unsealed.to_bytes().unwrap_err(), Error::Argument);
    }

    #[test]
    fn padding_hides_payload_length() {
        let key = keypair(EcdsaCurve::NistP256);

        let mut lengths = std::collections::BTreeSet::new();
        for len in 0..16usize {
            let mut sealed = EcdhBox::new();
            sealed.set_data(&vec![0x5a; len]);
            sealed.seal_offline(key.public_key()).unwrap();
            lengths.insert(sealed.encrypted_len());
        }

        // every payload in 0..16 lands in the same padded bucket
        assert_eq!(lengths.len(), 1);
    }
}
