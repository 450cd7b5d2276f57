//! Key History object support.
//!
//! The Key History object (tag 0x5FC10C) records how many retired
//! key-management slots hold certificates on the card, how many have their
//! certificates stored off-card, and the URL those off-card certificates
//! can be fetched from. It should be updated after generating keys in
//! retired slots.

use crate::{
    consts::TAG_OBJ_KEYHIST,
    tlv::{TlvReader, TlvWriter},
    transaction::Transaction,
    Error, Result,
};

/// Off-card URLs beyond this length do not reliably fit the object on the
/// cards this library has been exercised against.
const OFFCARD_URL_MAX: usize = 118;

/// Parsed Key History object.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KeyHistory {
    /// Retired slots whose certificates are on the card
    pub on_card_certs: u8,

    /// Retired slots whose certificates live off-card
    pub off_card_certs: u8,

    /// Where off-card certificates can be retrieved
    pub off_card_url: Option<String>,
}

impl KeyHistory {
    /// Read and parse the Key History object. `NotFound` when the card has
    /// none.
    pub fn read(txn: &mut Transaction<'_>) -> Result<KeyHistory> {
        let contents = txn.read_object(TAG_OBJ_KEYHIST)?;
        KeyHistory::parse(&contents)
    }

    /// Parse the object contents: 0xC1 on-card count, 0xC2 off-card count,
    /// 0xF3 URL.
    pub(crate) fn parse(data: &[u8]) -> Result<KeyHistory> {
        let mut history = KeyHistory::default();

        let mut reader = TlvReader::new(data);
        while reader.has_remaining() {
            match reader.read_tag()? {
                0xc1 => {
                    history.on_card_certs = count_leaf(reader.read_rest())?;
                    reader.end()?;
                }
                0xc2 => {
                    history.off_card_certs = count_leaf(reader.read_rest())?;
                    reader.end()?;
                }
                0xf3 => {
                    let url = reader.read_rest();
                    reader.end()?;
                    if !url.is_empty() {
                        history.off_card_url = Some(
                            String::from_utf8(url.to_vec()).map_err(|_| Error::InvalidData)?,
                        );
                    }
                }
                _ => reader.skip()?,
            }
        }

        Ok(history)
    }

    /// Serialize to the object contents written under PUT DATA.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut writer = TlvWriter::new();
        writer.write_tag(0xc1, &[self.on_card_certs]);
        writer.write_tag(0xc2, &[self.off_card_certs]);
        writer.write_tag(0xf3, self.off_card_url.as_deref().unwrap_or("").as_bytes());
        writer.write_tag(0xfe, &[]);
        writer.into_vec()
    }
}

/// A count leaf is exactly one byte.
fn count_leaf(input: &[u8]) -> Result<u8> {
    use nom::{combinator::eof, number::complete::u8 as take_u8};

    let (input, count) =
        take_u8::<_, nom::error::Error<&[u8]>>(input).map_err(|_| Error::InvalidData)?;
    let _ = eof::<_, nom::error::Error<&[u8]>>(input).map_err(|_| Error::InvalidData)?;
    Ok(count)
}

impl Transaction<'_> {
    /// Write the Key History object. An off-card count above zero requires
    /// a URL.
    ///
    /// Requires admin authentication earlier in the same transaction.
    pub fn write_key_history(
        &mut self,
        on_card: u8,
        off_card: u8,
        off_card_url: Option<&str>,
    ) -> Result<()> {
        if on_card > 20 || off_card > 20 || on_card.saturating_add(off_card) > 20 {
            return Err(Error::Argument);
        }

        match off_card_url {
            None | Some("") if off_card > 0 => return Err(Error::Argument),
            Some(url) if url.len() > OFFCARD_URL_MAX => return Err(Error::Argument),
            _ => (),
        }

        let history = KeyHistory {
            on_card_certs: on_card,
            off_card_certs: off_card,
            off_card_url: off_card_url.filter(|url| !url.is_empty()).map(String::from),
        };

        self.write_object(TAG_OBJ_KEYHIST, &history.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::KeyHistory;
    use crate::Error;

    #[test]
    fn round_trip() {
        let history = KeyHistory {
            on_card_certs: 3,
            off_card_certs: 2,
            off_card_url: Some("https://certs.example.com/piv".into()),
        };

        let bytes = history.to_bytes();
        assert_eq!(KeyHistory::parse(&bytes).unwrap(), history);
    }

    #[test]
    fn fixed_layout_without_url() {
        let history = KeyHistory {
            on_card_certs: 1,
            off_card_certs: 0,
            off_card_url: None,
        };

        let bytes = history.to_bytes();
        assert_eq!(
            bytes,
            [0xc1, 0x01, 0x01, 0xc2, 0x01, 0x00, 0xf3, 0x00, 0xfe, 0x00]
        );
        assert_eq!(KeyHistory::parse(&bytes).unwrap(), history);
    }

    #[test]
    fn count_leaf_must_be_one_byte() {
        assert_eq!(
            KeyHistory::parse(&[0xc1, 0x02, 0x00, 0x01]).unwrap_err(),
            Error::InvalidData
        );
    }

    #[test]
    fn bad_url_encoding_is_invalid() {
        assert_eq!(
            KeyHistory::parse(&[0xf3, 0x02, 0xff, 0xfe]).unwrap_err(),
            Error::InvalidData
        );
    }
}
