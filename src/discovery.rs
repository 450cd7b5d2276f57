//! Discovery object parsing.
//!
//! The discovery object (tag 0x7E) advertises the applet's AID and the PIN
//! usage policy: which cardholder authentication methods the card supports,
//! which one it treats as primary, and whether the virtual contact
//! interface is available. Unlike the other data objects it is returned
//! bare, without a 0x53 envelope.

use crate::{
    apdu::{Apdu, Ins},
    consts::TAG_OBJ_DISCOV,
    piv::PinType,
    tlv::{TlvReader, TlvWriter},
    transaction::Transaction,
    Error, Result,
};
use bitflags::bitflags;
use log::warn;

bitflags! {
    /// Cardholder authentication methods a card reports supporting.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct AuthMethods: u8 {
        /// The PIV application PIN
        const PIN = 0x01;
        /// The card global PIN
        const GLOBAL_PIN = 0x02;
        /// The PIN unlock code
        const PUK = 0x04;
        /// On-chip biometric comparison (reported, never exercised here)
        const OCC = 0x08;
        /// The VCI pairing code
        const PAIRING = 0x10;
    }
}

/// Parsed discovery object.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Discovery {
    pub auth: AuthMethods,
    pub default_auth: PinType,
    pub vci: bool,
}

impl Default for Discovery {
    fn default() -> Self {
        // cards without a discovery object get the mandatory baseline
        Discovery {
            auth: AuthMethods::PIN | AuthMethods::PUK,
            default_auth: PinType::Piv,
            vci: false,
        }
    }
}

impl Discovery {
    /// Read and parse the discovery object. Returns `NotFound` when the
    /// card does not implement it.
    pub fn read(txn: &mut Transaction<'_>) -> Result<Discovery> {
        txn.ensure_selected()?;

        let mut request = TlvWriter::new();
        request.write_tag(0x5c, &[TAG_OBJ_DISCOV as u8]);

        let mut apdu = Apdu::new(Ins::GetData);
        apdu.params(0x3f, 0xff).data(request.as_bytes()).le(256);

        let response = txn.transceive(&apdu)?;
        response.require_success()?;

        Discovery::parse(response.data())
    }

    /// Parse a discovery object: 0x7E { 0x4F aid, 0x5F2F pin-usage-policy }.
    pub(crate) fn parse(data: &[u8]) -> Result<Discovery> {
        let mut reader = TlvReader::new(data);
        if reader.read_tag()? != TAG_OBJ_DISCOV {
            return Err(Error::InvalidData);
        }

        let mut discovery = Discovery::default();

        while reader.has_remaining() {
            match reader.read_tag()? {
                0x5f2f => {
                    let policy = policy_leaf(reader.read_rest())?;
                    reader.end()?;
                    discovery = Discovery::from_policy(policy);
                }
                _ => reader.skip()?,
            }
        }

        Ok(discovery)
    }

    /// Decode the two PIN usage policy bytes.
    fn from_policy(policy: u16) -> Discovery {
        let mut auth = AuthMethods::empty();

        if policy & 0x4000 != 0 {
            // cards with an application PIN always pair it with a PUK
            auth |= AuthMethods::PIN | AuthMethods::PUK;
        }
        if policy & 0x2000 != 0 {
            auth |= AuthMethods::GLOBAL_PIN;
        }
        if policy & 0x1000 != 0 {
            auth |= AuthMethods::OCC;
        }
        if policy & 0x0400 != 0 {
            auth |= AuthMethods::PAIRING;
        }

        let default_auth = match policy & 0x00ff {
            0x20 if auth.contains(AuthMethods::GLOBAL_PIN) => PinType::Global,
            0x10 => PinType::Piv,
            other => {
                if other != 0x10 && other != 0x20 {
                    warn!("unrecognized primary PIN indicator: {:02x}", other);
                }
                PinType::Piv
            }
        };

        Discovery {
            auth,
            default_auth,
            vci: policy & 0x0800 != 0,
        }
    }
}

/// The 0x5F2F leaf: two policy bytes, big-endian.
fn policy_leaf(input: &[u8]) -> Result<u16> {
    use nom::{combinator::eof, number::complete::be_u16};

    let (input, policy) = be_u16::<_, nom::error::Error<&[u8]>>(input)
        .map_err(|_| Error::InvalidData)?;
    let _ = eof::<_, nom::error::Error<&[u8]>>(input).map_err(|_| Error::InvalidData)?;
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::{AuthMethods, Discovery};
    use crate::{piv::PinType, Error};

    #[test]
    fn typical_discovery_object() {
        // 7e { 4f aid, 5f2f 4000|..10 }
        let data = [
            0x7e, 0x12, 0x4f, 0x0b, 0xa0, 0x00, 0x00, 0x03, 0x08, 0x00, 0x00, 0x10, 0x00, 0x01,
            0x00, 0x5f, 0x2f, 0x02, 0x40, 0x10,
        ];
        let discovery = Discovery::parse(&data).unwrap();

        assert!(discovery.auth.contains(AuthMethods::PIN));
        assert!(discovery.auth.contains(AuthMethods::PUK));
        assert!(!discovery.auth.contains(AuthMethods::GLOBAL_PIN));
        assert_eq!(discovery.default_auth, PinType::Piv);
        assert!(!discovery.vci);
    }

    #[test]
    fn global_pin_primary_with_vci() {
        let data = [0x7e, 0x05, 0x5f, 0x2f, 0x02, 0x68, 0x20];
        let discovery = Discovery::parse(&data).unwrap();

        assert!(discovery.auth.contains(AuthMethods::GLOBAL_PIN));
        assert!(discovery.auth.contains(AuthMethods::OCC));
        assert_eq!(discovery.default_auth, PinType::Global);
        assert!(discovery.vci);
    }

    #[test]
    fn missing_policy_falls_back_to_baseline() {
        let data = [0x7e, 0x02, 0x4f, 0x00];
        let discovery = Discovery::parse(&data).unwrap();
        assert_eq!(discovery.auth, AuthMethods::PIN | AuthMethods::PUK);
        assert_eq!(discovery.default_auth, PinType::Piv);
    }

    #[test]
    fn wrong_outer_tag_is_invalid() {
        assert_eq!(
            Discovery::parse(&[0x53, 0x00]).unwrap_err(),
            Error::InvalidData
        );
    }

    #[test]
    fn short_policy_leaf_is_invalid() {
        let data = [0x7e, 0x04, 0x5f, 0x2f, 0x01, 0x40];
        assert_eq!(Discovery::parse(&data).unwrap_err(), Error::InvalidData);
    }
}
