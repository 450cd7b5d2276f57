//! Error types

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

use std::fmt::{self, Display};

/// Result type with the crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Kinds of errors.
///
/// The protocol engine translates card status words into the most specific
/// kind available; anything it cannot classify is surfaced as [`Error::Apdu`]
/// with the raw status word attached.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// Host transmit failed, the card was removed, or the reader is gone
    Io {
        /// Original PC/SC error, if one was reported
        inner: Option<pcsc::Error>,
    },

    /// Card returned a non-success status word not mapped to a more
    /// specific kind
    Apdu {
        /// Raw status word
        sw: u16,
    },

    /// Object, slot, or token absent
    NotFound,

    /// Card or slot does not implement the requested operation or algorithm
    NotSupported,

    /// Security status not satisfied: wrong PIN, wrong admin key, or an
    /// operation that needs prior authentication
    Permission {
        /// Remaining PIN attempts, when the card reported them
        retries: Option<u8>,
    },

    /// Card returned a structurally invalid response (truncated TLV,
    /// wrong tag, unparseable certificate, public point not on its curve)
    InvalidData,

    /// Caller passed a value outside the defined domain
    Argument,

    /// The PIN's remaining retries are below the caller's floor, so VERIFY
    /// was not attempted
    MinRetries {
        /// Attempts the card reports as remaining
        retries: u8,
    },

    /// Card reports storage exhaustion
    DeviceOutOfMemory,

    /// Factory reset preconditions unmet (PIN and PUK must both be blocked)
    ResetConditions,

    /// The slot's key does not match the supplied public key
    KeyAuth,

    /// A GUID prefix matched more than one token
    Duplicate,
}

impl Error {
    /// Name of the error.
    ///
    /// These names map to the error classes of the wire protocol
    /// documentation, to assist in web searches for relevant information.
    pub fn name(self) -> &'static str {
        match self {
            Error::Io { .. } => "IOError",
            Error::Apdu { .. } => "APDUError",
            Error::NotFound => "NotFoundError",
            Error::NotSupported => "NotSupportedError",
            Error::Permission { .. } => "PermissionError",
            Error::InvalidData => "InvalidDataError",
            Error::Argument => "ArgumentError",
            Error::MinRetries { .. } => "MinRetriesError",
            Error::DeviceOutOfMemory => "DeviceOutOfMemoryError",
            Error::ResetConditions => "ResetConditionsError",
            Error::KeyAuth => "KeyAuthError",
            Error::Duplicate => "DuplicateError",
        }
    }

    /// Error message
    pub fn msg(self) -> &'static str {
        match self {
            Error::Io { .. } => "I/O error communicating with the card",
            Error::Apdu { .. } => "card rejected the command",
            Error::NotFound => "not found",
            Error::NotSupported => "not supported",
            Error::Permission { .. } => "security status not satisfied",
            Error::InvalidData => "card returned invalid data",
            Error::Argument => "argument out of range",
            Error::MinRetries { .. } => "remaining PIN retries below requested floor",
            Error::DeviceOutOfMemory => "device out of memory",
            Error::ResetConditions => "reset conditions not met",
            Error::KeyAuth => "key authentication failed",
            Error::Duplicate => "GUID prefix matches more than one token",
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Apdu { sw } => write!(f, "{} (SW={:04x})", self.msg(), sw),
            Error::Permission {
                retries: Some(tries),
            } => write!(f, "{} ({} retries left)", self.msg(), tries),
            Error::MinRetries { retries } => {
                write!(f, "{} ({} remaining)", self.msg(), retries)
            }
            _ => f.write_str(self.msg()),
        }
    }
}

impl From<pcsc::Error> for Error {
    fn from(err: pcsc::Error) -> Error {
        Error::Io { inner: Some(err) }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { inner } => inner
                .as_ref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}
