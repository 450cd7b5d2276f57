//! Cardholder Unique Identifier (CHUID) support.
//!
//! The CHUID is the card's identity document: a BER-TLV blob carrying the
//! FASC-N, the 16-byte card GUID, the expiry date and (on issued cards) an
//! issuer signature. Cards outside the US federal PIV ecosystem frequently
//! ship partial CHUIDs, so every field is optional here and a usable GUID
//! is synthesized when the card does not provide one.

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
    consts::*, tlv::TlvReader, transaction::Transaction, Error, Result,
};
use log::debug;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

/// A parsed CHUID document.
#[derive(Clone, Debug, Default)]
pub struct Chuid {
    data: Vec<u8>,
    fascn: Option<Vec<u8>>,
    guid: Option<[u8; GUID_LEN]>,
    expiry: Option<Vec<u8>>,
    signed: bool,
}

impl Chuid {
    /// Read and parse the CHUID object from the card.
    pub fn read(txn: &mut Transaction<'_>) -> Result<Chuid> {
        let contents = txn.read_object(TAG_OBJ_CHUID)?;
        Chuid::parse(&contents)
    }

    /// Parse a CHUID document from the contents of its data object.
    pub(crate) fn parse(data: &[u8]) -> Result<Chuid> {
        let mut chuid = Chuid {
            data: data.to_vec(),
            ..Chuid::default()
        };

        let mut reader = TlvReader::new(data);
        while reader.has_remaining() {
            match reader.read_tag()? {
                TAG_CHUID_FASCN => {
                    chuid.fascn = Some(reader.read_rest().to_vec());
                    reader.end()?;
                }
                TAG_CHUID_GUID => {
                    let value = reader.read_rest();
                    reader.end()?;
                    // a GUID of the wrong size is treated as absent
                    chuid.guid = value.try_into().ok();
                }
                TAG_CHUID_EXPIRY => {
                    chuid.expiry = Some(reader.read_rest().to_vec());
                    reader.end()?;
                }
                TAG_CHUID_SIG => {
                    chuid.signed = !reader.read_rest().is_empty();
                    reader.end()?;
                }
                _ => reader.skip()?,
            }
        }

        Ok(chuid)
    }

    /// The raw CHUID bytes as stored on the card.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// The FASC-N, if present.
    pub fn fascn(&self) -> Option<&[u8]> {
        self.fascn.as_deref()
    }

    /// The 16-byte card GUID, if the card stores a well-formed one.
    pub fn guid(&self) -> Option<[u8; GUID_LEN]> {
        self.guid
    }

    /// The expiry field, if present.
    pub fn expiry(&self) -> Option<&[u8]> {
        self.expiry.as_deref()
    }

    /// Whether the CHUID carries an issuer signature.
    pub fn is_signed(&self) -> bool {
        self.signed
    }

    /// The card GUID, synthesizing one when the CHUID lacks it: a digest
    /// of the FASC-N when that is present (stable across reads), random
    /// otherwise.
    pub(crate) fn effective_guid(&self) -> [u8; GUID_LEN] {
        if let Some(guid) = self.guid {
            return guid;
        }

        if let Some(fascn) = &self.fascn {
            debug!("CHUID has no GUID; deriving one from the FASC-N");
            let digest = Sha256::digest(fascn);
            return digest[..GUID_LEN].try_into().expect("digest is 32 bytes");
        }

        debug!("CHUID has neither GUID nor FASC-N; randomizing");
        let mut guid = [0u8; GUID_LEN];
        OsRng.fill_bytes(&mut guid);
        guid
    }
}

#[cfg(test)]
mod tests {
    use super::Chuid;
    use crate::Error;

    fn sample_chuid() -> Vec<u8> {
        let mut data = vec![];
        // FASC-N
        data.extend_from_slice(&[0x30, 0x04, 0xd4, 0xe7, 0x39, 0xda]);
        // GUID
        data.extend_from_slice(&[0x34, 0x10]);
        data.extend_from_slice(&[
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ]);
        // expiry
        data.extend_from_slice(b"\x35\x0820300101");
        // issuer signature
        data.extend_from_slice(&[0x3e, 0x02, 0xca, 0xfe]);
        // LRC
        data.extend_from_slice(&[0xfe, 0x00]);
        data
    }

    #[test]
    fn parses_all_fields() {
        let chuid = Chuid::parse(&sample_chuid()).unwrap();

        assert_eq!(chuid.fascn(), Some(&[0xd4, 0xe7, 0x39, 0xda][..]));
        assert_eq!(
            chuid.guid(),
            Some([
                0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc,
                0xdd, 0xee, 0xff
            ])
        );
        assert_eq!(chuid.expiry(), Some(&b"20300101"[..]));
        assert!(chuid.is_signed());
        assert_eq!(chuid.effective_guid()[0], 0x00);
    }

    #[test]
    fn missing_guid_synthesized_from_fascn() {
        let data = [0x30, 0x04, 0xd4, 0xe7, 0x39, 0xda, 0xfe, 0x00];
        let chuid = Chuid::parse(&data).unwrap();

        assert_eq!(chuid.guid(), None);
        let a = chuid.effective_guid();
        let b = chuid.effective_guid();
        assert_eq!(a, b, "FASC-N derived GUID must be stable");
        assert_ne!(a, [0u8; 16]);
    }

    #[test]
    fn wrong_size_guid_treated_as_absent() {
        let data = [0x34, 0x03, 0x01, 0x02, 0x03];
        let chuid = Chuid::parse(&data).unwrap();
        assert_eq!(chuid.guid(), None);
    }

    #[test]
    fn empty_signature_does_not_mark_signed() {
        let data = [0x3e, 0x00, 0xfe, 0x00];
        assert!(!Chuid::parse(&data).unwrap().is_signed());
    }

    #[test]
    fn truncated_chuid_is_invalid() {
        let data = [0x30, 0x20, 0x01];
        assert_eq!(Chuid::parse(&data).unwrap_err(), Error::InvalidData);
    }
}
