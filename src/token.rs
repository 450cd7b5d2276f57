//! PIV token descriptors and discovery.
//!
//! A [`Token`] is one card reachable through one reader: its identity
//! (GUID, FASC-N, CHUID), advertised capabilities, YubicoPIV fingerprint,
//! and the registry of enumerated key slots. [`Token::enumerate`] probes
//! every reader on the host context; [`Token::find`] is the GUID-prefix
//! fast path that reads only the CHUID per reader.

use crate::{
    chuid::Chuid,
    consts::GUID_LEN,
    discovery::{AuthMethods, Discovery},
    keyhistory::KeyHistory,
    piv::{PinType, Slot, SlotId},
    transaction::Transaction,
    Error, Result,
};
use log::{debug, warn};
use std::{
    collections::BTreeMap,
    ffi::CString,
    fmt::{self, Display},
    str,
};
use subtle_encoding::hex;
use uuid::Uuid;

/// Applet version triple as reported by GET VERSION.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Version {
    /// Major version component
    pub major: u8,

    /// Minor version component
    pub minor: u8,

    /// Patch version component
    pub patch: u8,
}

impl Version {
    pub(crate) fn parse(bytes: &[u8]) -> Result<Version> {
        match bytes {
            [major, minor, patch, ..] => Ok(Version {
                major: *major,
                minor: *minor,
                patch: *patch,
            }),
            _ => Err(Error::InvalidData),
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Everything known about a token besides its card handle. Split out so a
/// [`Transaction`] can borrow it alongside the transaction's borrow of the
/// card.
pub(crate) struct TokenState {
    pub reader: String,
    pub guid: [u8; GUID_LEN],
    pub chuid: Option<Vec<u8>>,
    pub signed_chuid: bool,
    pub fascn: Option<Vec<u8>>,
    pub expiry: Option<Vec<u8>>,
    pub auth: AuthMethods,
    pub default_auth: PinType,
    pub vci: bool,
    pub algorithms: Vec<u8>,
    pub key_history: Option<KeyHistory>,
    pub ykpiv: bool,
    pub version: Option<Version>,
    pub serial: Option<u32>,
    pub extended_length: bool,
    pub selected: bool,
    pub slots: BTreeMap<SlotId, Slot>,
}

impl TokenState {
    fn new(reader: String) -> Self {
        TokenState {
            reader,
            guid: [0; GUID_LEN],
            chuid: None,
            signed_chuid: false,
            fascn: None,
            expiry: None,
            auth: AuthMethods::empty(),
            default_auth: PinType::Piv,
            vci: false,
            algorithms: vec![],
            key_history: None,
            ykpiv: false,
            version: None,
            serial: None,
            extended_length: false,
            selected: false,
            slots: BTreeMap::new(),
        }
    }

    pub fn version_at_least(&self, major: u8, minor: u8, patch: u8) -> bool {
        self.version.map_or(false, |v| {
            v >= Version {
                major,
                minor,
                patch,
            }
        })
    }
}

/// One PIV card reachable through one reader.
///
/// Not safe for concurrent use from multiple threads; the caller
/// serializes access.
pub struct Token {
    card: pcsc::Card,
    state: TokenState,
}

impl Token {
    fn new(reader: String, card: pcsc::Card) -> Self {
        Token {
            card,
            state: TokenState::new(reader),
        }
    }

    /// Enumerate all PIV tokens reachable through the given host context.
    ///
    /// Readers that fail at the PC/SC level (no card, card gone, transport
    /// dead) are skipped. A reader whose card answers PC/SC but fails the
    /// PIV probe is still returned, with its capability fields cleared, so
    /// callers can show it to the user.
    pub fn enumerate(ctx: &pcsc::Context) -> Result<Vec<Token>> {
        let mut tokens = vec![];

        for name in reader_names(ctx)? {
            let card = match ctx.connect(&name, pcsc::ShareMode::Shared, pcsc::Protocols::ANY) {
                Ok(card) => card,
                Err(e) => {
                    debug!("skipping reader {:?}: {}", name, e);
                    continue;
                }
            };

            let mut token = Token::new(name.to_string_lossy().into_owned(), card);

            match token.probe() {
                Ok(()) => tokens.push(token),
                // transport-level failure: the reader is unusable
                Err(Error::Io { .. }) => {
                    debug!("skipping reader {:?}: transport failure", name);
                }
                // protocol-level failure: record the token anyway
                Err(e) => {
                    warn!("probe of {:?} failed: {}", name, e);
                    tokens.push(token);
                }
            }
        }

        Ok(tokens)
    }

    /// Find the token whose GUID starts with `guid_prefix`.
    ///
    /// Faster than [`Token::enumerate`] for a known card: each reader is
    /// probed only as far as its CHUID. Fails with [`Error::Duplicate`]
    /// when the prefix is ambiguous and [`Error::NotFound`] when nothing
    /// matches.
    pub fn find(ctx: &pcsc::Context, guid_prefix: &[u8]) -> Result<Token> {
        if guid_prefix.is_empty() || guid_prefix.len() > GUID_LEN {
            return Err(Error::Argument);
        }

        let mut found: Option<Token> = None;

        for name in reader_names(ctx)? {
            let card = match ctx.connect(&name, pcsc::ShareMode::Shared, pcsc::Protocols::ANY) {
                Ok(card) => card,
                Err(e) => {
                    debug!("skipping reader {:?}: {}", name, e);
                    continue;
                }
            };

            let mut token = Token::new(name.to_string_lossy().into_owned(), card);

            match token.probe_chuid() {
                Ok(()) => (),
                Err(e) => {
                    debug!("skipping reader {:?}: {}", name, e);
                    continue;
                }
            }

            if token.state.guid.starts_with(guid_prefix) {
                if found.is_some() {
                    return Err(Error::Duplicate);
                }
                found = Some(token);
            }
        }

        found.ok_or(Error::NotFound)
    }

    /// Begin an exclusive transaction on this token.
    ///
    /// A card that was reset behind our back (removed and reinserted,
    /// reset by another process) is reconnected once before the
    /// transaction starts; a reset in the middle of a transaction surfaces
    /// as [`Error::Io`] and the transaction must be restarted.
    pub fn begin_transaction(&mut self) -> Result<Transaction<'_>> {
        if matches!(self.card.transaction().map(drop), Err(pcsc::Error::ResetCard)) {
            debug!("card was reset; reconnecting");
            self.card.reconnect(
                pcsc::ShareMode::Shared,
                pcsc::Protocols::ANY,
                pcsc::Disposition::LeaveCard,
            )?;
        }

        let Token { card, state } = self;
        Transaction::new(card, state)
    }

    /// Full capability probe: select, CHUID, discovery, key history,
    /// YubicoPIV version and serial.
    fn probe(&mut self) -> Result<()> {
        let mut txn = self.begin_transaction()?;
        txn.select()?;

        match Chuid::read(&mut txn) {
            Ok(chuid) => {
                txn.state.guid = chuid.effective_guid();
                txn.state.fascn = chuid.fascn().map(<[u8]>::to_vec);
                txn.state.expiry = chuid.expiry().map(<[u8]>::to_vec);
                txn.state.signed_chuid = chuid.is_signed();
                txn.state.chuid = Some(chuid.as_bytes().to_vec());
            }
            Err(Error::NotFound) => {
                debug!("card has no CHUID; synthesizing a GUID");
                txn.state.guid = Chuid::default().effective_guid();
            }
            Err(e) => return Err(e),
        }

        match Discovery::read(&mut txn) {
            Ok(discovery) => {
                txn.state.auth = discovery.auth;
                txn.state.default_auth = discovery.default_auth;
                txn.state.vci = discovery.vci;
            }
            Err(e @ Error::Io { .. }) => return Err(e),
            Err(_) => {
                let defaults = Discovery::default();
                txn.state.auth = defaults.auth;
                txn.state.default_auth = defaults.default_auth;
            }
        }

        match KeyHistory::read(&mut txn) {
            Ok(history) => txn.state.key_history = Some(history),
            Err(e @ Error::Io { .. }) => return Err(e),
            Err(_) => (),
        }

        // YubicoPIV fingerprint; plain PIV cards reject both commands
        if txn.get_version().is_ok() {
            let _ = txn.get_serial();
        }

        Ok(())
    }

    /// Minimal probe for [`Token::find`]: select and CHUID only.
    fn probe_chuid(&mut self) -> Result<()> {
        let mut txn = self.begin_transaction()?;
        txn.select()?;

        let chuid = Chuid::read(&mut txn)?;
        txn.state.guid = chuid.effective_guid();
        txn.state.fascn = chuid.fascn().map(<[u8]>::to_vec);
        txn.state.signed_chuid = chuid.is_signed();
        txn.state.chuid = Some(chuid.as_bytes().to_vec());
        Ok(())
    }

    /// The PC/SC reader name this token was found on.
    pub fn reader_name(&self) -> &str {
        &self.state.reader
    }

    /// The 16-byte card GUID (from the CHUID, or synthesized).
    pub fn guid(&self) -> &[u8; GUID_LEN] {
        &self.state.guid
    }

    /// The GUID as a lowercase hex string.
    pub fn guid_hex(&self) -> String {
        str::from_utf8(&hex::encode(self.state.guid))
            .expect("hex is ASCII")
            .to_owned()
    }

    /// The GUID as a UUID.
    pub fn guid_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.state.guid)
    }

    /// The raw CHUID, when the card has one.
    pub fn chuid(&self) -> Option<&[u8]> {
        self.state.chuid.as_deref()
    }

    /// Does the card have a CHUID?
    pub fn has_chuid(&self) -> bool {
        self.state.chuid.is_some()
    }

    /// Does the CHUID carry an issuer signature?
    pub fn has_signed_chuid(&self) -> bool {
        self.state.signed_chuid
    }

    /// The card's FASC-N, when present.
    pub fn fascn(&self) -> Option<&[u8]> {
        self.state.fascn.as_deref()
    }

    /// The CHUID expiry field, when present.
    pub fn expiry(&self) -> Option<&[u8]> {
        self.state.expiry.as_deref()
    }

    /// Authentication methods the card reports supporting.
    pub fn auth_methods(&self) -> AuthMethods {
        self.state.auth
    }

    /// Does the card support the given authentication method?
    pub fn has_auth(&self, method: AuthMethods) -> bool {
        self.state.auth.contains(method)
    }

    /// The card's primary authentication method.
    pub fn default_auth(&self) -> PinType {
        self.state.default_auth
    }

    /// Does the card advertise the virtual contact interface? (Secure
    /// messaging itself is not implemented here.)
    pub fn supports_vci(&self) -> bool {
        self.state.vci
    }

    /// Raw PIV algorithm identifiers the card advertised at selection,
    /// possibly empty (the field is optional).
    pub fn algorithms(&self) -> &[u8] {
        &self.state.algorithms
    }

    /// The parsed Key History object, when the card has one.
    pub fn key_history(&self) -> Option<&KeyHistory> {
        self.state.key_history.as_ref()
    }

    /// Does the card implement the YubicoPIV extensions?
    pub fn is_ykpiv(&self) -> bool {
        self.state.ykpiv
    }

    /// YubicoPIV applet version, when known.
    pub fn version(&self) -> Option<Version> {
        self.state.version
    }

    /// Is the YubicoPIV applet at least the given version?
    pub fn version_at_least(&self, major: u8, minor: u8, patch: u8) -> bool {
        self.state.version_at_least(major, minor, patch)
    }

    /// Device serial number, when the card exposes one.
    pub fn serial(&self) -> Option<u32> {
        self.state.serial
    }

    /// Slots enumerated so far, in slot order.
    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.state.slots.values()
    }

    /// A single enumerated slot.
    pub fn slot(&self, slot: SlotId) -> Option<&Slot> {
        self.state.slots.get(&slot)
    }

    /// Switch command framing to extended-length APDUs instead of command
    /// chaining. Only meaningful on cards that advertise extended-length
    /// support; chaining is the default.
    pub fn set_extended_length(&mut self, enabled: bool) {
        self.state.extended_length = enabled;
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("reader", &self.state.reader)
            .field("guid", &self.guid_hex())
            .finish()
    }
}

/// All reader names on the context, owned so connections can outlive the
/// name buffer.
fn reader_names(ctx: &pcsc::Context) -> Result<Vec<CString>> {
    ctx.is_valid()?;

    let mut buffer = vec![0u8; ctx.list_readers_len()?];
    Ok(ctx
        .list_readers(&mut buffer)?
        .map(CString::from)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::Version;
    use crate::Error;

    #[test]
    fn version_ordering() {
        let v540 = Version {
            major: 5,
            minor: 4,
            patch: 0,
        };
        let v431 = Version {
            major: 4,
            minor: 3,
            patch: 1,
        };
        assert!(v540 > v431);
        assert_eq!(Version::parse(&[5, 4, 0]).unwrap(), v540);
        assert_eq!(Version::parse(&[5, 4, 0]).unwrap().to_string(), "5.4.0");
        assert_eq!(Version::parse(&[1]).unwrap_err(), Error::InvalidData);
    }
}
