//! Protocol constants: applet IDs, data-object tags, buffer limits

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

#![allow(missing_docs)]

/// PIV applet ID (NIST SP 800-73-4 part 1, 2.2)
pub const PIV_AID: [u8; 11] = [
    0xa0, 0x00, 0x00, 0x03, 0x08, 0x00, 0x00, 0x10, 0x00, 0x01, 0x00,
];

/// Length of a card GUID
pub const GUID_LEN: usize = 16;

/// Maximum PIN length in bytes; shorter PINs are padded with 0xff
pub const CB_PIN_MAX: usize = 8;

/// Largest response we expect from a single data object
pub const CB_BUF_MAX: usize = 3072;

/// Largest value that fits in a data object once the 0x5c/0x53 envelope is
/// accounted for
pub const CB_OBJ_MAX: usize = CB_BUF_MAX - 9;

/// Minimum bytes for a TLV: one tag byte plus one length byte
pub const CB_OBJ_TAG_MIN: usize = 2;

// PIV data-object tags, NIST SP 800-73-4 part 1, table 3

pub const TAG_OBJ_CARDCAP: u32 = 0x5f_c107;
pub const TAG_OBJ_CHUID: u32 = 0x5f_c102;
pub const TAG_OBJ_SECOBJ: u32 = 0x5f_c106;
pub const TAG_OBJ_KEYHIST: u32 = 0x5f_c10c;
pub const TAG_OBJ_PRINTINFO: u32 = 0x5f_c109;
pub const TAG_OBJ_DISCOV: u32 = 0x7e;

pub const TAG_OBJ_CERT_9A: u32 = 0x5f_c105;
pub const TAG_OBJ_CERT_9C: u32 = 0x5f_c10a;
pub const TAG_OBJ_CERT_9D: u32 = 0x5f_c10b;
pub const TAG_OBJ_CERT_9E: u32 = 0x5f_c101;

/// First retired-slot certificate (slot 82); the remaining nineteen follow
/// contiguously
pub const TAG_OBJ_CERT_82: u32 = 0x5f_c10d;

/// Attestation certificate (YubicoPIV)
pub const TAG_OBJ_CERT_ATTEST: u32 = 0x5f_ff01;

// Tags inside the 0x53 certificate envelope

pub const TAG_CERT: u8 = 0x70;
pub const TAG_CERT_COMPRESS: u8 = 0x71;
pub const TAG_CERT_LRC: u8 = 0xfe;

/// 0x71 values: no compression / gzip
pub const CERTINFO_UNCOMPRESSED: u8 = 0x00;
pub const CERTINFO_GZIP: u8 = 0x01;

// Tags inside the CHUID document

pub const TAG_CHUID_FASCN: u32 = 0x30;
pub const TAG_CHUID_GUID: u32 = 0x34;
pub const TAG_CHUID_EXPIRY: u32 = 0x35;
pub const TAG_CHUID_SIG: u32 = 0x3e;

// GENERAL AUTHENTICATE dynamic authentication template tags

pub const TAG_DYN_AUTH: u32 = 0x7c;
pub const TAG_AUTH_WITNESS: u32 = 0x80;
pub const TAG_AUTH_CHALLENGE: u32 = 0x81;
pub const TAG_AUTH_RESPONSE: u32 = 0x82;

/// Asymmetric key pair template (GENERATE ASYMMETRIC response)
pub const TAG_ASYM_KEYPAIR: u32 = 0x7f49;
pub const TAG_RSA_MODULUS: u32 = 0x81;
pub const TAG_RSA_EXPONENT: u32 = 0x82;
pub const TAG_ECC_POINT: u32 = 0x86;

// Key generation / import policy tags (YubicoPIV)

pub const TAG_GEN_ALGORITHM: u32 = 0x80;
pub const TAG_PIN_POLICY: u32 = 0xaa;
pub const TAG_TOUCH_POLICY: u32 = 0xab;
