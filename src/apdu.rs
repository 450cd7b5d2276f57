//! Application Protocol Data Unit (APDU) framing.
//!
//! Commands are built with [`Apdu`] and serialized as short or
//! extended-length ISO-7816 frames. [`transceive_chain`] runs a complete
//! exchange against a transmit function: long commands are split over the
//! 0x10 class bit, long replies are reassembled through GET RESPONSE, and a
//! 0x6Cxx "wrong Le" reply is retried once with the corrected length. The
//! transmit function is the only card dependency, so the framing logic is
//! exercised by the tests below without any hardware.

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

use crate::{Buffer, Error, Result};
use log::trace;
use zeroize::{Zeroize, Zeroizing};

/// Maximum command data in a single short APDU
pub(crate) const APDU_DATA_MAX: usize = 0xff;

/// Class bit marking a non-final fragment of a chained command
pub(crate) const CLA_CHAIN: u8 = 0x10;

/// Application Protocol Data Unit (APDU).
///
/// These messages are the packets used to communicate with the card.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Apdu {
    /// Instruction class; bit 0x10 marks a command-chain fragment
    cla: u8,

    /// Instruction code
    ins: Ins,

    /// Instruction parameter 1
    p1: u8,

    /// Instruction parameter 2
    p2: u8,

    /// Command data (`Lc` is derived from its length)
    data: Vec<u8>,

    /// Expected response length; 256 means "as much as a short APDU holds"
    le: Option<u16>,
}

impl Apdu {
    /// Create a new APDU with the given instruction code.
    pub fn new(ins: impl Into<Ins>) -> Self {
        Self {
            cla: 0,
            ins: ins.into(),
            p1: 0,
            p2: 0,
            data: vec![],
            le: None,
        }
    }

    /// Set both parameters for this APDU.
    pub fn params(&mut self, p1: u8, p2: u8) -> &mut Self {
        self.p1 = p1;
        self.p2 = p2;
        self
    }

    /// Set this APDU's first parameter only.
    pub fn p1(&mut self, value: u8) -> &mut Self {
        self.p1 = value;
        self
    }

    /// Set this APDU's second parameter only.
    pub fn p2(&mut self, value: u8) -> &mut Self {
        self.p2 = value;
        self
    }

    /// Set the command data for this APDU.
    pub fn data(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        assert!(self.data.is_empty(), "APDU command data already set");
        self.data.extend_from_slice(bytes.as_ref());
        self
    }

    /// Set the expected response length.
    pub fn le(&mut self, le: u16) -> &mut Self {
        self.le = Some(le);
        self
    }

    /// Serialize as a short APDU. Panics if the command data does not fit;
    /// callers route oversized commands through [`transceive_chain`].
    pub fn to_bytes(&self) -> Buffer {
        assert!(self.data.len() <= APDU_DATA_MAX, "short APDU overflow");

        let mut bytes = Vec::with_capacity(6 + self.data.len());
        bytes.push(self.cla);
        bytes.push(self.ins.code());
        bytes.push(self.p1);
        bytes.push(self.p2);

        if !self.data.is_empty() {
            bytes.push(self.data.len() as u8);
            bytes.extend_from_slice(&self.data);
        }

        if let Some(le) = self.le {
            // 256 encodes as 0x00
            bytes.push(le as u8);
        }

        Zeroizing::new(bytes)
    }

    /// Serialize as an extended-length APDU: Lc is a zero byte followed by a
    /// two-byte big-endian length, Le is two bytes (three when no command
    /// data is present).
    pub fn to_bytes_extended(&self) -> Buffer {
        let mut bytes = Vec::with_capacity(9 + self.data.len());
        bytes.push(self.cla);
        bytes.push(self.ins.code());
        bytes.push(self.p1);
        bytes.push(self.p2);

        if !self.data.is_empty() {
            bytes.push(0x00);
            bytes.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        }

        if let Some(le) = self.le {
            if self.data.is_empty() {
                bytes.push(0x00);
            }
            bytes.extend_from_slice(&le.to_be_bytes());
        }

        Zeroizing::new(bytes)
    }
}

impl Drop for Apdu {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl Zeroize for Apdu {
    fn zeroize(&mut self) {
        // Only `data` may contain secrets
        self.data.zeroize();
    }
}

/// Run one complete exchange: chain the command out if it exceeds a short
/// APDU (or send a single extended frame when `extended` is set), retry a
/// 0x6Cxx reply once with the corrected Le, and drain 0x61xx continuations
/// with GET RESPONSE.
///
/// `transmit` sends one serialized frame and returns the parsed reply.
pub(crate) fn transceive_chain<F>(apdu: &Apdu, extended: bool, mut transmit: F) -> Result<Response>
where
    F: FnMut(&[u8]) -> Result<Response>,
{
    let mut response = if apdu.data.len() <= APDU_DATA_MAX {
        transmit(&apdu.to_bytes())?
    } else if extended {
        transmit(&apdu.to_bytes_extended())?
    } else {
        let mut fragment = Apdu::new(apdu.ins);
        fragment.params(apdu.p1, apdu.p2);

        let mut chunks = apdu.data.chunks(APDU_DATA_MAX).peekable();
        let mut last = None;

        while let Some(chunk) = chunks.next() {
            fragment.data.clear();
            fragment.data.extend_from_slice(chunk);

            if chunks.peek().is_some() {
                fragment.cla = apdu.cla | CLA_CHAIN;
                fragment.le = None;
            } else {
                fragment.cla = apdu.cla;
                fragment.le = apdu.le;
            }

            trace!("sending {} byte fragment", chunk.len());
            let reply = transmit(&fragment.to_bytes())?;

            // anything but 9000 on an intermediate fragment aborts the chain
            // with that status preserved
            if chunks.peek().is_some() && !reply.is_success() {
                return Ok(reply);
            }

            last = Some(reply);
        }

        last.ok_or(Error::InvalidData)?
    };

    // wrong Le: retry once with the length the card asked for (a chained
    // command never carries Le on its intermediate fragments, so this only
    // applies to single-frame exchanges)
    if let StatusWords::CorrectLength { le } = response.status_words() {
        if apdu.data.len() <= APDU_DATA_MAX || extended {
            let mut retry = apdu.clone();
            retry.le = Some(if le == 0 { 256 } else { le as u16 });
            response = if apdu.data.len() <= APDU_DATA_MAX {
                transmit(&retry.to_bytes())?
            } else {
                transmit(&retry.to_bytes_extended())?
            };
        }
    }

    let mut sw = response.status_words();

    if !matches!(sw, StatusWords::BytesRemaining { .. }) {
        return Ok(response);
    }

    // 61xx: the card holds more reply data; drain it with GET RESPONSE
    let mut data = response.data().to_vec();

    while let StatusWords::BytesRemaining { len } = sw {
        trace!("card indicates {} more reply bytes", len);

        let mut cont = Apdu::new(Ins::GetResponse);
        cont.le(if len == 0 { 256 } else { len as u16 });

        let reply = transmit(&cont.to_bytes())?;
        sw = reply.status_words();

        match sw {
            StatusWords::Success | StatusWords::BytesRemaining { .. } => {
                data.extend_from_slice(reply.data());
            }
            _ => return Ok(Response::new(sw, vec![])),
        }
    }

    Ok(Response::new(sw, data))
}

/// APDU instruction codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Ins {
    // Standard commands from ISO7816-4

    /// Select application
    Select,

    /// Get data object
    GetData,

    /// Verify PIN
    Verify,

    /// Change reference data (PIN or PUK)
    ChangeReference,

    /// Reset retry counter (unblock PIN with PUK)
    ResetRetry,

    /// General authenticate (sign / ECDH / admin challenge)
    GeneralAuthenticate,

    /// Put data object
    PutData,

    /// Generate asymmetric key pair
    GenerateAsymmetric,

    /// Get response (continuation of a 61xx reply)
    GetResponse,

    // YubicoPIV vendor extensions
    // <https://developers.yubico.com/PIV/Introduction/Yubico_extensions.html>

    /// Set administrative (management) key
    SetManagementKey,

    /// Import asymmetric private key
    ImportAsymmetric,

    /// Get applet version
    GetVersion,

    /// Factory reset the applet
    Reset,

    /// Set PIN and PUK retry counts
    SetPinRetries,

    /// Generate attestation certificate for a slot
    Attest,

    /// Get device serial
    GetSerial,

    /// Get slot metadata
    GetMetadata,

    /// Other/unrecognized instruction codes
    Other(u8),
}

impl Ins {
    /// Get the code that corresponds to this instruction.
    pub fn code(self) -> u8 {
        match self {
            Ins::Select => 0xa4,
            Ins::GetData => 0xcb,
            Ins::Verify => 0x20,
            Ins::ChangeReference => 0x24,
            Ins::ResetRetry => 0x2c,
            Ins::GeneralAuthenticate => 0x87,
            Ins::PutData => 0xdb,
            Ins::GenerateAsymmetric => 0x47,
            Ins::GetResponse => 0xc0,
            Ins::SetManagementKey => 0xff,
            Ins::ImportAsymmetric => 0xfe,
            Ins::GetVersion => 0xfd,
            Ins::Reset => 0xfb,
            Ins::SetPinRetries => 0xfa,
            Ins::Attest => 0xf9,
            Ins::GetSerial => 0xf8,
            Ins::GetMetadata => 0xf7,
            Ins::Other(code) => code,
        }
    }
}

impl From<u8> for Ins {
    fn from(code: u8) -> Self {
        match code {
            0xa4 => Ins::Select,
            0xcb => Ins::GetData,
            0x20 => Ins::Verify,
            0x24 => Ins::ChangeReference,
            0x2c => Ins::ResetRetry,
            0x87 => Ins::GeneralAuthenticate,
            0xdb => Ins::PutData,
            0x47 => Ins::GenerateAsymmetric,
            0xc0 => Ins::GetResponse,
            0xff => Ins::SetManagementKey,
            0xfe => Ins::ImportAsymmetric,
            0xfd => Ins::GetVersion,
            0xfb => Ins::Reset,
            0xfa => Ins::SetPinRetries,
            0xf9 => Ins::Attest,
            0xf8 => Ins::GetSerial,
            0xf7 => Ins::GetMetadata,
            code => Ins::Other(code),
        }
    }
}

impl From<Ins> for u8 {
    fn from(ins: Ins) -> u8 {
        ins.code()
    }
}

/// APDU responses.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Response {
    /// Status words
    status_words: StatusWords,

    /// Reply data, status word stripped
    data: Vec<u8>,
}

impl Response {
    /// Create a new response from the given status words and data.
    pub fn new(status_words: StatusWords, data: Vec<u8>) -> Response {
        Response { status_words, data }
    }

    /// Get the [`StatusWords`] for this response.
    pub fn status_words(&self) -> StatusWords {
        self.status_words
    }

    /// Do the status words for this response indicate success?
    pub fn is_success(&self) -> bool {
        self.status_words.is_success()
    }

    /// Borrow the response data.
    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// Map a non-success status to the crate error it classifies as, per
    /// the decode table in the module docs.
    pub fn require_success(&self) -> Result<()> {
        self.status_words.error().map_or(Ok(()), Err)
    }
}

impl From<Vec<u8>> for Response {
    fn from(mut bytes: Vec<u8>) -> Self {
        if bytes.len() < 2 {
            return Response {
                status_words: StatusWords::None,
                data: bytes,
            };
        }

        let sw = StatusWords::from(
            ((bytes[bytes.len() - 2] as u16) << 8) | (bytes[bytes.len() - 1] as u16),
        );

        let len = bytes.len() - 2;
        bytes.truncate(len);

        Response {
            status_words: sw,
            data: bytes,
        }
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

/// Status Words (SW) are 2-byte values concluding every card reply.
///
/// See NIST SP 800-73-4, section 5.6.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum StatusWords {
    /// No status words present in response
    None,

    /// Successful execution
    Success,

    /// More reply data is available via GET RESPONSE
    BytesRemaining {
        /// Bytes the next GET RESPONSE should request (0 = 256)
        len: u8,
    },

    /// Wrong Le; retry with the indicated value
    CorrectLength {
        /// The Le the card expects (0 = 256)
        le: u8,
    },

    /// PIN verification failed
    VerifyFail {
        /// Remaining verification attempts
        tries: u8,
    },

    /// Wrong length
    WrongLength,

    /// Security status not satisfied
    SecurityStatus,

    /// Authentication method blocked
    AuthBlocked,

    /// Conditions of use not satisfied
    ConditionsNotSatisfied,

    /// Incorrect parameter in command data field
    WrongData,

    /// Function not supported
    FuncNotSupported,

    /// Data object or application not found
    NotFound,

    /// Not enough memory on the card
    NoSpace,

    /// Incorrect P1/P2 parameters
    IncorrectParam,

    /// Instruction not supported
    InsNotSupported,

    /// Other/unrecognized status words
    Other(u16),
}

impl StatusWords {
    /// Get the numerical response code for these status words.
    pub fn code(self) -> u16 {
        match self {
            StatusWords::None => 0,
            StatusWords::Success => 0x9000,
            StatusWords::BytesRemaining { len } => 0x6100 | len as u16,
            StatusWords::CorrectLength { le } => 0x6c00 | le as u16,
            StatusWords::VerifyFail { tries } => 0x63c0 | tries as u16,
            StatusWords::WrongLength => 0x6700,
            StatusWords::SecurityStatus => 0x6982,
            StatusWords::AuthBlocked => 0x6983,
            StatusWords::ConditionsNotSatisfied => 0x6985,
            StatusWords::WrongData => 0x6a80,
            StatusWords::FuncNotSupported => 0x6a81,
            StatusWords::NotFound => 0x6a82,
            StatusWords::NoSpace => 0x6a84,
            StatusWords::IncorrectParam => 0x6a86,
            StatusWords::InsNotSupported => 0x6d00,
            StatusWords::Other(sw) => sw,
        }
    }

    /// Do these status words indicate success?
    pub fn is_success(self) -> bool {
        self == StatusWords::Success
    }

    /// The error kind a non-success status classifies as, if any.
    pub fn error(self) -> Option<Error> {
        match self {
            StatusWords::Success => None,
            StatusWords::VerifyFail { tries } => Some(Error::Permission {
                retries: Some(tries),
            }),
            StatusWords::SecurityStatus => Some(Error::Permission { retries: None }),
            StatusWords::AuthBlocked => Some(Error::Permission { retries: Some(0) }),
            StatusWords::NotFound => Some(Error::NotFound),
            StatusWords::FuncNotSupported | StatusWords::InsNotSupported => {
                Some(Error::NotSupported)
            }
            StatusWords::NoSpace => Some(Error::DeviceOutOfMemory),
            other => Some(Error::Apdu { sw: other.code() }),
        }
    }
}

impl From<u16> for StatusWords {
    fn from(sw: u16) -> Self {
        match sw {
            0x0000 => StatusWords::None,
            0x9000 => StatusWords::Success,
            sw if sw & 0xff00 == 0x6100 => StatusWords::BytesRemaining {
                len: (sw & 0x00ff) as u8,
            },
            sw if sw & 0xff00 == 0x6c00 => StatusWords::CorrectLength {
                le: (sw & 0x00ff) as u8,
            },
            sw if sw & 0xfff0 == 0x63c0 => StatusWords::VerifyFail {
                tries: (sw & 0x000f) as u8,
            },
            0x6700 => StatusWords::WrongLength,
            0x6982 => StatusWords::SecurityStatus,
            0x6983 => StatusWords::AuthBlocked,
            0x6985 => StatusWords::ConditionsNotSatisfied,
            0x6a80 => StatusWords::WrongData,
            0x6a81 => StatusWords::FuncNotSupported,
            0x6a82 => StatusWords::NotFound,
            0x6a84 => StatusWords::NoSpace,
            0x6a86 => StatusWords::IncorrectParam,
            0x6d00 => StatusWords::InsNotSupported,
            _ => StatusWords::Other(sw),
        }
    }
}

impl From<StatusWords> for u16 {
    fn from(sw: StatusWords) -> u16 {
        sw.code()
    }
}

#[cfg(test)]
mod tests {
    use super::{transceive_chain, Apdu, Ins, Response, StatusWords, APDU_DATA_MAX, CLA_CHAIN};
    use crate::Error;

    #[test]
    fn status_words_round_trip() {
        let round_trip = |sw: StatusWords| {
            assert_eq!(StatusWords::from(sw.code()), sw);
        };

        round_trip(StatusWords::None);
        round_trip(StatusWords::Success);
        round_trip(StatusWords::BytesRemaining { len: 0 });
        round_trip(StatusWords::BytesRemaining { len: 0xff });
        round_trip(StatusWords::CorrectLength { le: 0x10 });
        round_trip(StatusWords::VerifyFail { tries: 3 });
        round_trip(StatusWords::VerifyFail { tries: 0 });
        round_trip(StatusWords::WrongLength);
        round_trip(StatusWords::SecurityStatus);
        round_trip(StatusWords::AuthBlocked);
        round_trip(StatusWords::ConditionsNotSatisfied);
        round_trip(StatusWords::WrongData);
        round_trip(StatusWords::FuncNotSupported);
        round_trip(StatusWords::NotFound);
        round_trip(StatusWords::NoSpace);
        round_trip(StatusWords::IncorrectParam);
        round_trip(StatusWords::InsNotSupported);
        round_trip(StatusWords::Other(0x1337));
    }

    #[test]
    fn status_word_error_mapping() {
        assert_eq!(StatusWords::Success.error(), None);
        assert_eq!(
            StatusWords::VerifyFail { tries: 2 }.error(),
            Some(Error::Permission { retries: Some(2) })
        );
        assert_eq!(
            StatusWords::SecurityStatus.error(),
            Some(Error::Permission { retries: None })
        );
        assert_eq!(StatusWords::NotFound.error(), Some(Error::NotFound));
        assert_eq!(
            StatusWords::FuncNotSupported.error(),
            Some(Error::NotSupported)
        );
        assert_eq!(StatusWords::NoSpace.error(), Some(Error::DeviceOutOfMemory));
        assert_eq!(
            StatusWords::ConditionsNotSatisfied.error(),
            Some(Error::Apdu { sw: 0x6985 })
        );
    }

    #[test]
    fn short_serialization() {
        let mut apdu = Apdu::new(Ins::Verify);
        apdu.params(0x00, 0x80);
        assert_eq!(&apdu.to_bytes()[..], [0x00, 0x20, 0x00, 0x80]);

        apdu.data([0x31, 0x32]);
        assert_eq!(&apdu.to_bytes()[..], [0x00, 0x20, 0x00, 0x80, 0x02, 0x31, 0x32]);

        let mut apdu = Apdu::new(Ins::GetResponse);
        apdu.le(256);
        assert_eq!(&apdu.to_bytes()[..], [0x00, 0xc0, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn extended_serialization() {
        let payload = vec![0xaa; 300];
        let mut apdu = Apdu::new(Ins::PutData);
        apdu.params(0x3f, 0xff).data(&payload).le(256);

        let bytes = apdu.to_bytes_extended();
        assert_eq!(&bytes[..4], [0x00, 0xdb, 0x3f, 0xff]);
        assert_eq!(&bytes[4..7], [0x00, 0x01, 0x2c]);
        assert_eq!(&bytes[7..307], &payload[..]);
        assert_eq!(&bytes[307..], [0x01, 0x00]);

        // no command data: Le is three bytes
        let mut apdu = Apdu::new(Ins::GetData);
        apdu.le(1024);
        assert_eq!(&apdu.to_bytes_extended()[..], [0x00, 0xcb, 0x00, 0x00, 0x00, 0x04, 0x00]);
    }

    /// Replays a canned reply per transmitted frame, recording the frames.
    struct MockCard {
        sent: Vec<Vec<u8>>,
        replies: Vec<Response>,
    }

    impl MockCard {
        fn new(mut replies: Vec<Response>) -> Self {
            replies.reverse();
            Self {
                sent: vec![],
                replies,
            }
        }

        fn transmit(&mut self, frame: &[u8]) -> crate::Result<Response> {
            self.sent.push(frame.to_vec());
            Ok(self.replies.pop().expect("unexpected extra APDU"))
        }
    }

    #[test]
    fn chains_long_commands() {
        let payload = vec![0x42u8; 3000];
        let fragments = payload.len().div_ceil(APDU_DATA_MAX);

        let mut apdu = Apdu::new(Ins::PutData);
        apdu.params(0x3f, 0xff).data(&payload);

        let mut card = MockCard::new(vec![
            Response::new(StatusWords::Success, vec![]);
            fragments
        ]);
        let response = transceive_chain(&apdu, false, |f| card.transmit(f)).unwrap();
        assert!(response.is_success());
        assert_eq!(card.sent.len(), fragments);

        // all but the last fragment carry the chain class bit
        let mut reassembled = vec![];
        for (i, frame) in card.sent.iter().enumerate() {
            let last = i == fragments - 1;
            assert_eq!(frame[0], if last { 0x00 } else { CLA_CHAIN });
            assert_eq!(frame[1], Ins::PutData.code());
            let lc = frame[4] as usize;
            let lc = if lc == 0 { 256 } else { lc };
            assert_eq!(frame.len(), 5 + lc);
            reassembled.extend_from_slice(&frame[5..]);
        }

        // concatenating the fragments at the card side reproduces the data
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn chain_aborts_on_intermediate_failure() {
        let payload = vec![0u8; 600];
        let mut apdu = Apdu::new(Ins::PutData);
        apdu.data(&payload);

        let mut card = MockCard::new(vec![
            Response::new(StatusWords::Success, vec![]),
            Response::new(StatusWords::SecurityStatus, vec![]),
        ]);
        let response = transceive_chain(&apdu, false, |f| card.transmit(f)).unwrap();
        assert_eq!(response.status_words(), StatusWords::SecurityStatus);
        assert_eq!(card.sent.len(), 2, "chain must stop at the failing fragment");
    }

    #[test]
    fn reassembles_long_replies() {
        // 600-byte reply: 256 + 256 + 88
        let apdu = Apdu::new(Ins::GetData);

        let mut card = MockCard::new(vec![
            Response::new(StatusWords::BytesRemaining { len: 0 }, vec![1; 256]),
            Response::new(StatusWords::BytesRemaining { len: 88 }, vec![2; 256]),
            Response::new(StatusWords::Success, vec![3; 88]),
        ]);
        let response = transceive_chain(&apdu, false, |f| card.transmit(f)).unwrap();

        assert!(response.is_success());
        assert_eq!(response.data().len(), 600);
        assert_eq!(&response.data()[..256], &[1; 256][..]);
        assert_eq!(&response.data()[256..512], &[2; 256][..]);
        assert_eq!(&response.data()[512..], &[3; 88][..]);

        // both continuations are GET RESPONSE with the advertised Le
        assert_eq!(card.sent[1], [0x00, 0xc0, 0x00, 0x00, 0x00]);
        assert_eq!(card.sent[2], [0x00, 0xc0, 0x00, 0x00, 88]);
    }

    #[test]
    fn wrong_le_retried_once() {
        let mut apdu = Apdu::new(Ins::GetData);
        apdu.le(256);

        let mut card = MockCard::new(vec![
            Response::new(StatusWords::CorrectLength { le: 0x08 }, vec![]),
            Response::new(StatusWords::Success, vec![7; 8]),
        ]);
        let response = transceive_chain(&apdu, false, |f| card.transmit(f)).unwrap();

        assert!(response.is_success());
        assert_eq!(response.data(), [7; 8]);
        assert_eq!(card.sent[1], [0x00, 0xcb, 0x00, 0x00, 0x08]);
    }

    #[test]
    fn single_frame_when_reply_fits() {
        let apdu = Apdu::new(Ins::GetData);
        let mut card = MockCard::new(vec![Response::new(StatusWords::Success, vec![9; 200])]);
        let response = transceive_chain(&apdu, false, |f| card.transmit(f)).unwrap();
        assert!(response.is_success());
        assert_eq!(card.sent.len(), 1);
        assert_eq!(response.data(), &[9; 200][..]);
    }

    #[test]
    fn response_parses_trailing_status() {
        let response = Response::from(vec![0xde, 0xad, 0x90, 0x00]);
        assert!(response.is_success());
        assert_eq!(response.data(), [0xde, 0xad]);

        let response = Response::from(vec![0x63, 0xc2]);
        assert_eq!(
            response.status_words(),
            StatusWords::VerifyFail { tries: 2 }
        );
        assert!(response.data().is_empty());
    }
}
