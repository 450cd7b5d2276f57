//! Exclusive card transactions.
//!
//! A [`Transaction`] is the unit of exclusive card access: it locks the
//! reader for its lifetime (PC/SC transaction semantics) and carries the
//! card's per-transaction protocol state, most importantly whether the PIV
//! applet has been selected, which every other command depends on. PIN and
//! administrative authentication performed inside a transaction are scoped
//! to it; multi-step protocols (admin auth then generate, PIN then sign)
//! must therefore hold one transaction across all their steps.
//!
//! Transactions are non-reentrant and do not nest: the guard mutably
//! borrows the token.

use crate::{
    apdu::{transceive_chain, Apdu, Ins, Response, StatusWords},
    consts::*,
    piv::PinType,
    tlv::{TlvReader, TlvWriter},
    token::TokenState,
    Buffer, Error, Result, Version,
};
use log::{error, trace, warn};
use zeroize::Zeroizing;

/// Exclusive transaction with a PIV token.
pub struct Transaction<'tx> {
    pub(crate) inner: pcsc::Transaction<'tx>,
    pub(crate) state: &'tx mut TokenState,
}

impl<'tx> Transaction<'tx> {
    /// Begin a transaction on the given card.
    pub(crate) fn new(card: &'tx mut pcsc::Card, state: &'tx mut TokenState) -> Result<Self> {
        // Selection does not survive across transactions on all cards, and
        // PIN/admin state never does; start unselected and let the first
        // command re-select transparently.
        state.selected = false;

        Ok(Transaction {
            inner: card.transaction()?,
            state,
        })
    }

    /// Transmit a single serialized frame and parse the reply.
    fn transmit_frame(&self, frame: &[u8]) -> Result<Response> {
        trace!(">>> {:02x?}", frame);

        let mut recv_buffer = vec![0u8; CB_BUF_MAX + 2];
        let len = self.inner.transmit(frame, &mut recv_buffer)?.len();
        recv_buffer.truncate(len);

        let response = Response::from(recv_buffer);
        trace!(
            "<<< {} bytes, SW={:04x}",
            response.data().len(),
            response.status_words().code()
        );
        Ok(response)
    }

    /// Run a complete exchange: command chaining out, GET RESPONSE
    /// reassembly back.
    pub(crate) fn transceive(&self, apdu: &Apdu) -> Result<Response> {
        transceive_chain(apdu, self.state.extended_length, |frame| {
            self.transmit_frame(frame)
        })
    }

    /// Select the PIV applet, parsing the application property template the
    /// card answers with.
    pub fn select(&mut self) -> Result<()> {
        let mut apdu = Apdu::new(Ins::Select);
        apdu.p1(0x04).data(PIV_AID).le(256);

        let response = self.transceive(&apdu).map_err(|e| {
            error!("failed communicating with card: {}", e);
            e
        })?;

        match response.status_words() {
            StatusWords::Success => (),
            StatusWords::NotFound | StatusWords::FuncNotSupported => {
                return Err(Error::NotFound);
            }
            other => {
                error!("failed selecting application: {:04x}", other.code());
                return Err(Error::Apdu { sw: other.code() });
            }
        }

        self.state.algorithms = parse_select_response(response.data())?;
        self.state.selected = true;
        Ok(())
    }

    /// Re-select transparently when the applet-selected sentinel was
    /// invalidated.
    pub(crate) fn ensure_selected(&mut self) -> Result<()> {
        if !self.state.selected {
            self.select()?;
        }
        Ok(())
    }

    /// Read a data object by its BER tag number, returning the contents of
    /// the 0x53 envelope (the envelope itself is stripped).
    pub fn read_object(&mut self, tag: u32) -> Result<Buffer> {
        self.ensure_selected()?;

        let mut request = TlvWriter::new();
        request.write_tag(0x5c, &object_tag_bytes(tag));

        let mut apdu = Apdu::new(Ins::GetData);
        apdu.params(0x3f, 0xff).data(request.as_bytes()).le(256);

        let response = self.transceive(&apdu)?;
        response.require_success()?;

        let mut reader = TlvReader::new(response.data());
        if reader.read_tag()? != 0x53 {
            return Err(Error::InvalidData);
        }

        Ok(Zeroizing::new(reader.read_rest().to_vec()))
    }

    /// Write a data object by its BER tag number. `data` is the contents of
    /// the 0x53 envelope, which this method adds.
    pub fn write_object(&mut self, tag: u32, data: &[u8]) -> Result<()> {
        self.ensure_selected()?;

        if data.len() > CB_OBJ_MAX {
            return Err(Error::Argument);
        }

        let mut request = TlvWriter::new();
        request.write_tag(0x5c, &object_tag_bytes(tag));
        request.write_tag(0x53, data);

        let mut apdu = Apdu::new(Ins::PutData);
        apdu.params(0x3f, 0xff).data(request.as_bytes());

        let response = self.transceive(&apdu)?;

        match response.status_words() {
            StatusWords::Success => Ok(()),
            StatusWords::SecurityStatus => {
                error!("card requires admin authentication to write objects");
                Err(Error::Permission { retries: None })
            }
            other => other.error().map_or(Ok(()), Err),
        }
    }

    /// Get the applet version, cached after the first read.
    pub fn get_version(&mut self) -> Result<Version> {
        if let Some(version) = self.state.version {
            return Ok(version);
        }

        self.ensure_selected()?;

        let response = self.transceive(&Apdu::new(Ins::GetVersion))?;
        response.require_success()?;

        let version = Version::parse(response.data())?;
        self.state.version = Some(version);
        self.state.ykpiv = true;
        Ok(version)
    }

    /// Get the device serial, cached after the first read. Only YubicoPIV 5
    /// and later expose this over the PIV interface.
    pub fn get_serial(&mut self) -> Result<u32> {
        if let Some(serial) = self.state.serial {
            return Ok(serial);
        }

        self.get_version().map_err(|_| Error::NotSupported)?;
        if !self.state.version_at_least(5, 0, 0) {
            return Err(Error::NotSupported);
        }

        let response = self.transceive(&Apdu::new(Ins::GetSerial))?;
        response.require_success()?;

        let bytes: [u8; 4] = response
            .data()
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(Error::InvalidData)?;

        let serial = u32::from_be_bytes(bytes);
        self.state.serial = Some(serial);
        Ok(serial)
    }

    /// Verify a PIN, unlocking the operations it protects for the rest of
    /// the transaction.
    ///
    /// With `can_skip`, an empty VERIFY first probes whether the card
    /// already considers the PIN verified, and the PIN is not consumed if
    /// so. Set it to `false` before PIN-always slots such as 9C.
    ///
    /// With `min_retries`, the current retry count is read first and
    /// [`Error::MinRetries`] returned instead of attempting the PIN when
    /// fewer attempts remain.
    ///
    /// A wrong PIN surfaces as [`Error::Permission`] carrying the remaining
    /// attempts.
    pub fn verify_pin(
        &mut self,
        pin_type: PinType,
        pin: &[u8],
        min_retries: Option<u8>,
        can_skip: bool,
    ) -> Result<()> {
        let payload = pin_payload(pin)?;
        self.ensure_selected()?;

        if can_skip || min_retries.is_some() {
            let mut probe = Apdu::new(Ins::Verify);
            probe.p2(pin_type.reference());

            match self.transceive(&probe)?.status_words() {
                StatusWords::Success if can_skip => return Ok(()),
                StatusWords::Success => (),
                StatusWords::VerifyFail { tries } => {
                    if let Some(floor) = min_retries {
                        if tries < floor {
                            return Err(Error::MinRetries { retries: tries });
                        }
                    }
                }
                StatusWords::AuthBlocked => {
                    return Err(Error::Permission { retries: Some(0) });
                }
                // Some applets reject the empty probe form outright
                other => {
                    warn!("retry-count probe not supported: {:04x}", other.code());
                    if min_retries.is_some() {
                        return Err(Error::NotSupported);
                    }
                }
            }
        }

        let mut apdu = Apdu::new(Ins::Verify);
        apdu.p2(pin_type.reference()).data(&*payload);

        let response = self.transceive(&apdu)?;
        match response.status_words() {
            StatusWords::Success => Ok(()),
            StatusWords::VerifyFail { tries } => Err(Error::Permission {
                retries: Some(tries),
            }),
            StatusWords::AuthBlocked => Err(Error::Permission { retries: Some(0) }),
            other => Err(Error::Apdu { sw: other.code() }),
        }
    }

    /// Change a PIN or PUK (CHANGE REFERENCE DATA).
    pub fn change_pin(&mut self, pin_type: PinType, current: &[u8], new: &[u8]) -> Result<()> {
        self.change_reference(Ins::ChangeReference, pin_type, current, new)
    }

    /// Reset a blocked PIN using the PUK (RESET RETRY COUNTER).
    pub fn reset_pin(&mut self, pin_type: PinType, puk: &[u8], new_pin: &[u8]) -> Result<()> {
        if pin_type == PinType::Puk {
            // The PUK unblocks PINs; it cannot unblock itself
            return Err(Error::Argument);
        }
        self.change_reference(Ins::ResetRetry, pin_type, puk, new_pin)
    }

    fn change_reference(
        &mut self,
        ins: Ins,
        pin_type: PinType,
        current: &[u8],
        new: &[u8],
    ) -> Result<()> {
        let mut payload = Zeroizing::new([0u8; 2 * CB_PIN_MAX]);
        payload[..CB_PIN_MAX].copy_from_slice(&*pin_payload(current)?);
        payload[CB_PIN_MAX..].copy_from_slice(&*pin_payload(new)?);

        self.ensure_selected()?;

        let mut apdu = Apdu::new(ins);
        apdu.p2(pin_type.reference()).data(&*payload);

        let response = self.transceive(&apdu)?;
        match response.status_words() {
            StatusWords::Success => Ok(()),
            StatusWords::VerifyFail { tries } => Err(Error::Permission {
                retries: Some(tries),
            }),
            StatusWords::AuthBlocked => Err(Error::Permission { retries: Some(0) }),
            other => {
                error!("failed changing reference data: {:04x}", other.code());
                Err(Error::Apdu { sw: other.code() })
            }
        }
    }

    /// Factory-reset the applet (YubicoPIV). The card refuses unless both
    /// the PIN and the PUK are blocked.
    pub fn reset(&mut self) -> Result<()> {
        self.ensure_selected()?;

        let response = self.transceive(&Apdu::new(Ins::Reset))?;
        match response.status_words() {
            StatusWords::Success => Ok(()),
            StatusWords::ConditionsNotSatisfied => Err(Error::ResetConditions),
            StatusWords::InsNotSupported | StatusWords::FuncNotSupported => {
                Err(Error::NotSupported)
            }
            other => Err(Error::Apdu { sw: other.code() }),
        }
    }

    /// Set the maximum PIN and PUK retry counts (YubicoPIV), resetting both
    /// codes to their defaults. Requires admin authentication and PIN
    /// verification earlier in the same transaction.
    pub fn set_pin_retries(&mut self, pin_tries: u8, puk_tries: u8) -> Result<()> {
        if pin_tries == 0 || puk_tries == 0 {
            return Err(Error::Argument);
        }

        self.ensure_selected()?;

        let mut apdu = Apdu::new(Ins::SetPinRetries);
        apdu.params(pin_tries, puk_tries);

        let response = self.transceive(&apdu)?;
        match response.status_words() {
            StatusWords::Success => Ok(()),
            StatusWords::SecurityStatus | StatusWords::AuthBlocked => {
                error!("set-pin-retries requires prior admin auth and PIN verification");
                Err(Error::Permission { retries: None })
            }
            StatusWords::InsNotSupported | StatusWords::FuncNotSupported => {
                Err(Error::NotSupported)
            }
            other => Err(Error::Apdu { sw: other.code() }),
        }
    }
}

/// Pad a PIN to the 8-byte VERIFY payload with 0xff filler.
pub(crate) fn pin_payload(pin: &[u8]) -> Result<Zeroizing<[u8; CB_PIN_MAX]>> {
    if pin.is_empty() || pin.len() > CB_PIN_MAX {
        return Err(Error::Argument);
    }

    let mut payload = Zeroizing::new([0xffu8; CB_PIN_MAX]);
    payload[..pin.len()].copy_from_slice(pin);
    Ok(payload)
}

/// Minimal big-endian encoding of a data-object tag for the 0x5c request.
pub(crate) fn object_tag_bytes(tag: u32) -> Vec<u8> {
    let bytes = tag.to_be_bytes();
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(3);
    bytes[start..].to_vec()
}

/// Parse the application property template returned by SELECT, extracting
/// the advertised algorithm list (the 0xAC container, when present).
fn parse_select_response(data: &[u8]) -> Result<Vec<u8>> {
    let mut algorithms = vec![];

    if data.is_empty() {
        return Ok(algorithms);
    }

    let mut reader = TlvReader::new(data);
    if reader.read_tag()? != 0x61 {
        return Err(Error::InvalidData);
    }

    while reader.has_remaining() {
        match reader.read_tag()? {
            0xac => {
                while reader.has_remaining() {
                    match reader.read_tag()? {
                        0x80 => {
                            algorithms.extend_from_slice(reader.read_rest());
                            reader.end()?;
                        }
                        _ => reader.skip()?,
                    }
                }
                reader.end()?;
            }
            _ => reader.skip()?,
        }
    }

    Ok(algorithms)
}

#[cfg(test)]
mod tests {
    use super::{object_tag_bytes, parse_select_response, pin_payload};
    use crate::Error;

    #[test]
    fn pin_padding() {
        for len in 1..=8usize {
            let pin: Vec<u8> = b"12345678"[..len].to_vec();
            let payload = pin_payload(&pin).unwrap();
            assert_eq!(&payload[..len], &pin[..]);
            assert!(payload[len..].iter().all(|&b| b == 0xff));
        }
    }

    #[test]
    fn pin_length_is_validated_before_transmit() {
        assert_eq!(pin_payload(b"").unwrap_err(), Error::Argument);
        assert_eq!(pin_payload(b"123456789").unwrap_err(), Error::Argument);
    }

    #[test]
    fn object_tags_encode_minimally() {
        assert_eq!(object_tag_bytes(0x7e), [0x7e]);
        assert_eq!(object_tag_bytes(0x5f_c102), [0x5f, 0xc1, 0x02]);
    }

    #[test]
    fn select_template_algorithms() {
        // 61 { 4f aid, ac { 80 11, 80 14, 06 00 } }
        let data = [
            0x61, 0x10, 0x4f, 0x04, 0xa0, 0x00, 0x03, 0x08, 0xac, 0x08, 0x80, 0x01, 0x11, 0x80,
            0x01, 0x14, 0x06, 0x00,
        ];
        assert_eq!(parse_select_response(&data).unwrap(), [0x11, 0x14]);

        // template without an algorithm container
        let data = [0x61, 0x06, 0x4f, 0x04, 0xa0, 0x00, 0x03, 0x08];
        assert!(parse_select_response(&data).unwrap().is_empty());

        // empty response: applet accepted selection but sent no template
        assert!(parse_select_response(&[]).unwrap().is_empty());

        assert_eq!(
            parse_select_response(&[0x53, 0x00]),
            Err(Error::InvalidData)
        );
    }
}
