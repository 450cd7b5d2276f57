//! PIV ([Personal Identity Verification][1]) smartcard client with
//! [YubicoPIV][2] extensions.
//!
//! This library speaks the NIST SP 800-73-4 PIV applet protocol over a
//! host-provided PC/SC context: token discovery, data-object and
//! certificate access, on-card key generation and import, signing, ECDH
//! key agreement, the PIN/PUK lifecycle, administrative authentication,
//! attestation, and a self-describing ECDH-sealed envelope format
//! ([`EcdhBox`]) for encrypting payloads to a card-held key.
//!
//! Every command runs inside an exclusive [`Transaction`]; PIN and admin
//! state are scoped to it, so multi-step flows (verify-then-sign,
//! admin-auth-then-generate) hold one transaction across all their steps:
//!
//! ```no_run
//! use piv_client::{PinType, SlotId, Token};
//!
//! let ctx = pcsc::Context::establish(pcsc::Scope::System)?;
//! let mut tokens = Token::enumerate(&ctx)?;
//! let token = tokens.first_mut().ok_or(piv_client::Error::NotFound)?;
//!
//! let mut txn = token.begin_transaction()?;
//! txn.read_all_certs()?;
//! txn.verify_pin(PinType::Piv, b"123456", None, true)?;
//! let (_hash, _signature) = txn.sign(SlotId::Authentication, b"hello", None)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! [1]: https://nvlpubs.nist.gov/nistpubs/SpecialPublications/NIST.SP.800-73-4.pdf
//! [2]: https://developers.yubico.com/PIV/Introduction/Yubico_extensions.html

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

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unused_lifetimes,
    unused_qualifications
)]

pub mod ccc;
pub mod certificate;
pub mod chuid;
pub mod consts;
pub mod discovery;
pub mod ecdh_box;
pub mod keyhistory;
pub mod mgm;
pub mod piv;
pub mod tlv;
pub mod token;
pub mod transaction;

mod apdu;
mod error;

pub use crate::{
    ccc::Ccc,
    certificate::Certificate,
    chuid::Chuid,
    discovery::AuthMethods,
    ecdh_box::{BoxCipher, BoxKdf, EcdhBox},
    error::{Error, Result},
    keyhistory::KeyHistory,
    mgm::{MgmAlgorithmId, MgmKey},
    piv::{AlgorithmId, HashAlgorithm, PinPolicy, PinType, Slot, SlotId, TouchPolicy},
    token::{Token, Version},
    transaction::Transaction,
};

use zeroize::Zeroizing;

/// A self-zeroizing byte buffer for data that may hold key material, PINs
/// or plaintext.
pub type Buffer = Zeroizing<Vec<u8>>;
