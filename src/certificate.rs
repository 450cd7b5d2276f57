//! Per-slot certificate handling.
//!
//! Certificates live in PIV data objects as a 0x53 envelope holding the DER
//! (0x70), a one-byte compression flag (0x71, gzip when 1) and an LRC
//! (0xFE, ignored). Reading inflates and parses the DER; writing compresses
//! automatically when the DER would not fit the card's object capacity.

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
    consts::*,
    piv::{AlgorithmId, SlotId},
    tlv::{TlvReader, TlvWriter},
    transaction::Transaction,
    Buffer, Error, Result,
};
use elliptic_curve::sec1::ToEncodedPoint;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use log::error;
use ssh_key::{
    public::{EcdsaPublicKey, KeyData, RsaPublicKey},
    Mpint, PublicKey,
};
use std::io::{Read, Write};
use x509_parser::prelude::{parse_x509_certificate, FromDer, SubjectPublicKeyInfo};
use zeroize::Zeroizing;

const OID_NIST_P256: &str = "1.2.840.10045.3.1.7";
const OID_NIST_P384: &str = "1.3.132.0.34";

/// Inflated certificates can legitimately exceed the card's object size;
/// anything past this is a corrupt stream.
const INFLATE_MAX: u64 = 1 << 20;

/// A certificate read from (or destined for) a card slot.
#[derive(Clone, Debug)]
pub struct Certificate {
    subject: String,
    public_key: PublicKey,
    algorithm: AlgorithmId,
    data: Buffer,
}

impl Certificate {
    /// Parse a certificate from DER, extracting the subject DN, the public
    /// key in SSH form, and the PIV algorithm the key maps to per
    /// NIST SP 800-78-4.
    pub fn from_der(der: impl Into<Buffer>) -> Result<Self> {
        let der = der.into();

        if der.is_empty() {
            return Err(Error::InvalidData);
        }

        let cert = match parse_x509_certificate(&der) {
            Ok((_, cert)) => cert,
            Err(e) => {
                error!("unparseable certificate: {}", e);
                return Err(Error::InvalidData);
            }
        };

        let subject = cert.tbs_certificate.subject.to_string();
        let (algorithm, public_key) = public_key_from_spki(&cert.tbs_certificate.subject_pki)?;

        Ok(Certificate {
            subject,
            public_key,
            algorithm,
            data: der,
        })
    }

    /// The certificate's subject DN.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// The subject public key, in SSH key form.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// The PIV algorithm the subject key corresponds to.
    pub fn algorithm(&self) -> AlgorithmId {
        self.algorithm
    }

    /// The raw DER.
    pub fn as_der(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for Certificate {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Map an X.509 SubjectPublicKeyInfo to (PIV algorithm, SSH public key).
pub(crate) fn public_key_from_spki(
    spki: &SubjectPublicKeyInfo<'_>,
) -> Result<(AlgorithmId, PublicKey)> {
    use x509_parser::public_key::PublicKey as Spk;

    match spki.parsed().map_err(|_| Error::InvalidData)? {
        Spk::RSA(rsa) => {
            // strip the sign byte before sizing the modulus
            let modulus = match rsa.modulus.split_first() {
                Some((&0, rest)) => rest,
                _ => rsa.modulus,
            };

            let algorithm = match modulus.len() * 8 {
                1024 => AlgorithmId::Rsa1024,
                2048 => AlgorithmId::Rsa2048,
                bits => {
                    error!("unsupported RSA modulus size: {} bits", bits);
                    return Err(Error::NotSupported);
                }
            };

            let key_data = KeyData::Rsa(RsaPublicKey {
                e: Mpint::from_positive_bytes(rsa.exponent).map_err(|_| Error::InvalidData)?,
                n: Mpint::from_positive_bytes(modulus).map_err(|_| Error::InvalidData)?,
            });

            Ok((algorithm, PublicKey::new(key_data, "")))
        }
        Spk::EC(point) => {
            let curve = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|params| params.as_oid().ok())
                .map(|oid| oid.to_id_string())
                .ok_or(Error::InvalidData)?;

            let (algorithm, ecdsa_key) = match curve.as_str() {
                OID_NIST_P256 => {
                    // reject points that are not on the curve
                    let key = p256::PublicKey::from_sec1_bytes(point.data())
                        .map_err(|_| Error::InvalidData)?;
                    (
                        AlgorithmId::EccP256,
                        EcdsaPublicKey::NistP256(key.to_encoded_point(false)),
                    )
                }
                OID_NIST_P384 => {
                    let key = p384::PublicKey::from_sec1_bytes(point.data())
                        .map_err(|_| Error::InvalidData)?;
                    (
                        AlgorithmId::EccP384,
                        EcdsaPublicKey::NistP384(key.to_encoded_point(false)),
                    )
                }
                oid => {
                    error!("unsupported EC curve: {}", oid);
                    return Err(Error::NotSupported);
                }
            };

            Ok((algorithm, PublicKey::new(KeyData::Ecdsa(ecdsa_key), "")))
        }
        _ => Err(Error::NotSupported),
    }
}

/// Split a certificate data object into its DER and compression flag.
pub(crate) fn parse_cert_object(data: &[u8]) -> Result<(Vec<u8>, bool)> {
    let mut reader = TlvReader::new(data);
    let mut der: Option<&[u8]> = None;
    let mut compressed = false;

    while reader.has_remaining() {
        match reader.read_tag()? {
            tag if tag == TAG_CERT as u32 => {
                der = Some(reader.read_rest());
                reader.end()?;
            }
            tag if tag == TAG_CERT_COMPRESS as u32 => {
                compressed = reader.read_rest().first() == Some(&CERTINFO_GZIP);
                reader.end()?;
            }
            // LRC and anything unknown
            _ => reader.skip()?,
        }
    }

    match der {
        Some(der) if !der.is_empty() => Ok((der.to_vec(), compressed)),
        _ => Err(Error::NotFound),
    }
}

pub(crate) fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![];
    GzDecoder::new(data)
        .take(INFLATE_MAX)
        .read_to_end(&mut out)
        .map_err(|e| {
            error!("certificate inflate failed: {}", e);
            Error::InvalidData
        })?;
    Ok(out)
}

pub(crate) fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(vec![], Compression::default());
    encoder.write_all(data).map_err(|_| Error::InvalidData)?;
    encoder.finish().map_err(|_| Error::InvalidData)
}

impl Transaction<'_> {
    /// Write a certificate into a slot's data object. The DER is
    /// gzip-compressed when it would not otherwise fit the card.
    ///
    /// Requires admin authentication earlier in the same transaction.
    pub fn write_cert(&mut self, slot: SlotId, der: &[u8]) -> Result<()> {
        let tag = slot.cert_object().ok_or(Error::NotSupported)?;

        if der.is_empty() {
            return Err(Error::Argument);
        }

        // 0x53 envelope overhead: three TLV headers of up to 4 bytes each
        let fits = |len: usize| len + 12 <= CB_OBJ_MAX;

        let (payload, certinfo) = if fits(der.len()) {
            (Zeroizing::new(der.to_vec()), CERTINFO_UNCOMPRESSED)
        } else {
            let deflated = Zeroizing::new(gzip(der)?);
            if !fits(deflated.len()) {
                return Err(Error::DeviceOutOfMemory);
            }
            (deflated, CERTINFO_GZIP)
        };

        let mut contents = TlvWriter::new();
        contents.write_tag(TAG_CERT as u32, &payload);
        contents.write_tag(TAG_CERT_COMPRESS as u32, &[certinfo]);
        contents.write_tag(TAG_CERT_LRC as u32, &[]);

        self.write_object(tag, contents.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::{gunzip, gzip, parse_cert_object, public_key_from_spki};
    use crate::{piv::AlgorithmId, Error};
    use ssh_key::public::KeyData;
    use x509_parser::prelude::{FromDer, SubjectPublicKeyInfo};

    /// P-256 generator point, uncompressed SEC1.
    const P256_G: [u8; 65] = [
        0x04, 0x6b, 0x17, 0xd1, 0xf2, 0xe1, 0x2c, 0x42, 0x47, 0xf8, 0xbc, 0xe6, 0xe5, 0x63, 0xa4,
        0x40, 0xf2, 0x77, 0x03, 0x7d, 0x81, 0x2d, 0xeb, 0x33, 0xa0, 0xf4, 0xa1, 0x39, 0x45, 0xd8,
        0x98, 0xc2, 0x96, 0x4f, 0xe3, 0x42, 0xe2, 0xfe, 0x1a, 0x7f, 0x9b, 0x8e, 0xe7, 0xeb, 0x4a,
        0x7c, 0x0f, 0x9e, 0x16, 0x2b, 0xce, 0x33, 0x57, 0x6b, 0x31, 0x5e, 0xce, 0xcb, 0xb6, 0x40,
        0x68, 0x37, 0xbf, 0x51, 0xf5,
    ];

    fn p256_spki_der() -> Vec<u8> {
        let mut der = vec![
            0x30, 0x59, // SEQUENCE
            0x30, 0x13, // SEQUENCE (algorithm)
            0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, // id-ecPublicKey
            0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, // prime256v1
            0x03, 0x42, 0x00, // BIT STRING, no unused bits
        ];
        der.extend_from_slice(&P256_G);
        der
    }

    #[test]
    fn spki_to_ssh_key() {
        let der = p256_spki_der();
        let (_, spki) = SubjectPublicKeyInfo::from_der(&der).unwrap();
        let (algorithm, key) = public_key_from_spki(&spki).unwrap();

        assert_eq!(algorithm, AlgorithmId::EccP256);
        match key.key_data() {
            KeyData::Ecdsa(ecdsa) => assert_eq!(ecdsa.as_sec1_bytes(), P256_G),
            other => panic!("unexpected key data: {:?}", other),
        }
    }

    #[test]
    fn spki_rejects_point_off_curve() {
        let mut der = p256_spki_der();
        let len = der.len();
        der[len - 1] ^= 0x01; // corrupt the Y coordinate
        let (_, spki) = SubjectPublicKeyInfo::from_der(&der).unwrap();
        assert_eq!(
            public_key_from_spki(&spki).unwrap_err(),
            Error::InvalidData
        );
    }

    #[test]
    fn cert_object_round_trip() {
        let data = [
            0x70, 0x04, 0xde, 0xad, 0xbe, 0xef, // "DER"
            0x71, 0x01, 0x00, // uncompressed
            0xfe, 0x00, // LRC
        ];
        let (der, compressed) = parse_cert_object(&data).unwrap();
        assert_eq!(der, [0xde, 0xad, 0xbe, 0xef]);
        assert!(!compressed);

        let data = [0x70, 0x01, 0x30, 0x71, 0x01, 0x01];
        let (_, compressed) = parse_cert_object(&data).unwrap();
        assert!(compressed);
    }

    #[test]
    fn cert_object_without_der_is_not_found() {
        assert_eq!(
            parse_cert_object(&[0x71, 0x01, 0x00, 0xfe, 0x00]),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn gzip_round_trip() {
        let der = vec![0x30u8; 3000];
        let deflated = gzip(&der).unwrap();
        assert!(deflated.len() < der.len());
        assert_eq!(gunzip(&deflated).unwrap(), der);
    }

    #[test]
    fn gunzip_rejects_garbage() {
        assert_eq!(gunzip(&[0xde, 0xad, 0xbe, 0xef]), Err(Error::InvalidData));
    }
}
