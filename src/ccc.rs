//! Card Capability Container (CARDCAP) support.

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

use crate::{consts::TAG_OBJ_CARDCAP, tlv::TlvReader, transaction::Transaction, Result};

/// Length of the card identifier inside the 0xF0 member
const CARD_ID_LEN: usize = 14;

/// Offset of the card identifier within the 0xF0 value (after the GSC-IS
/// RID, manufacturer ID and card type bytes)
const CARD_ID_OFFS: usize = 7;

/// Card Capability Container.
#[derive(Clone, Debug)]
pub struct Ccc {
    data: Vec<u8>,
    card_id: Option<[u8; CARD_ID_LEN]>,
}

impl Ccc {
    /// Read and parse the CARDCAP object. `NotFound` when the card has
    /// none.
    pub fn read(txn: &mut Transaction<'_>) -> Result<Ccc> {
        let contents = txn.read_object(TAG_OBJ_CARDCAP)?;
        Ccc::parse(&contents)
    }

    pub(crate) fn parse(data: &[u8]) -> Result<Ccc> {
        let mut card_id = None;

        let mut reader = TlvReader::new(data);
        while reader.has_remaining() {
            match reader.read_tag()? {
                // Card Identifier: GSC-IS RID + manufacturer + card type,
                // then the unique ID
                0xf0 => {
                    let value = reader.read_rest();
                    reader.end()?;
                    card_id = value
                        .get(CARD_ID_OFFS..CARD_ID_OFFS + CARD_ID_LEN)
                        .and_then(|id| id.try_into().ok());
                }
                _ => reader.skip()?,
            }
        }

        Ok(Ccc {
            data: data.to_vec(),
            card_id,
        })
    }

    /// The raw object contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// The 14-byte unique card identifier, when the container holds one.
    pub fn card_id(&self) -> Option<[u8; CARD_ID_LEN]> {
        self.card_id
    }
}

#[cfg(test)]
mod tests {
    use super::Ccc;

    #[test]
    fn card_id_extraction() {
        let mut data = vec![0xf0, 0x15];
        data.extend_from_slice(&[0xa0, 0x00, 0x00, 0x01, 0x16, 0xff, 0x02]);
        data.extend_from_slice(&[0x42; 14]);
        data.extend_from_slice(&[0xf1, 0x01, 0x21, 0xfe, 0x00]);

        let ccc = Ccc::parse(&data).unwrap();
        assert_eq!(ccc.card_id(), Some([0x42; 14]));
    }

    #[test]
    fn short_container_has_no_card_id() {
        let ccc = Ccc::parse(&[0xf0, 0x02, 0xa0, 0x00]).unwrap();
        assert_eq!(ccc.card_id(), None);
    }
}
