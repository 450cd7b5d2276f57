//! Byte-buffer and BER-TLV codec.
//!
//! The wire encodings this crate deals in (ISO-7816 data objects, dynamic
//! authentication templates, the sealed-box format) are all built from the
//! same primitives: big-endian integers, length-prefixed byte strings, and
//! BER tag/length framing. [`TlvWriter`] constructs them with scoped
//! push/pop (the length of a constructed tag is backpatched when the scope
//! closes); [`TlvReader`] is a destructive cursor with a bounded
//! remaining-byte count per nesting level, so a truncated or oversized
//! element is caught at the exact read that violates it.

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

use crate::{Error, Result};
use zeroize::Zeroize;

/// Encode a BER tag as its wire bytes (one to three bytes).
fn tag_bytes(tag: u32) -> ([u8; 3], usize) {
    if tag < 0x100 {
        ([tag as u8, 0, 0], 1)
    } else if tag < 0x1_0000 {
        ([(tag >> 8) as u8, tag as u8, 0], 2)
    } else {
        ([(tag >> 16) as u8, (tag >> 8) as u8, tag as u8], 3)
    }
}

/// Encode a BER length (short form, or long form with 1-3 length bytes).
fn length_bytes(len: usize) -> ([u8; 4], usize) {
    if len < 0x80 {
        ([len as u8, 0, 0, 0], 1)
    } else if len < 0x100 {
        ([0x81, len as u8, 0, 0], 2)
    } else if len < 0x1_0000 {
        ([0x82, (len >> 8) as u8, len as u8, 0], 3)
    } else {
        ([0x83, (len >> 16) as u8, (len >> 8) as u8, len as u8], 4)
    }
}

/// Growable byte buffer with scoped BER-TLV construction.
#[derive(Default)]
pub struct TlvWriter {
    buf: Vec<u8>,
    // offsets where the length bytes of still-open tags will be inserted
    stack: Vec<usize>,
}

impl TlvWriter {
    /// An empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a constructed tag. The length is written by [`TlvWriter::pop`].
    pub fn push(&mut self, tag: u32) {
        let (bytes, n) = tag_bytes(tag);
        self.buf.extend_from_slice(&bytes[..n]);
        self.stack.push(self.buf.len());
    }

    /// Close the innermost open tag, backpatching its length.
    ///
    /// Panics if no tag is open; tag scoping is a static property of the
    /// serializer code, not of input data.
    pub fn pop(&mut self) {
        let start = self.stack.pop().expect("no open tag");
        let len = self.buf.len() - start;
        let (bytes, n) = length_bytes(len);
        // Inserting shifts the tail; offsets recorded for enclosing tags all
        // precede `start` and stay valid.
        self.buf.splice(start..start, bytes[..n].iter().copied());
    }

    /// Write a complete primitive TLV in one go.
    pub fn write_tag(&mut self, tag: u32, value: &[u8]) {
        self.push(tag);
        self.write_bytes(value);
        self.pop();
    }

    /// Write a byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Write a big-endian 16-bit integer.
    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Write a big-endian 32-bit integer.
    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(value);
    }

    /// Byte string with an 8-bit length prefix.
    pub fn write_bytes8(&mut self, value: &[u8]) {
        debug_assert!(value.len() <= u8::MAX as usize);
        self.write_u8(value.len() as u8);
        self.write_bytes(value);
    }

    /// Byte string with a 16-bit big-endian length prefix.
    pub fn write_bytes16(&mut self, value: &[u8]) {
        debug_assert!(value.len() <= u16::MAX as usize);
        self.write_u16(value.len() as u16);
        self.write_bytes(value);
    }

    /// Byte string with a 32-bit big-endian length prefix (SSH "string").
    pub fn write_bytes32(&mut self, value: &[u8]) {
        self.write_u32(value.len() as u32);
        self.write_bytes(value);
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Has anything been written?
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The serialized bytes. All tags must be closed.
    pub fn as_bytes(&self) -> &[u8] {
        debug_assert!(self.stack.is_empty(), "unclosed tag");
        &self.buf
    }

    /// Consume the writer, returning the serialized bytes. All tags must
    /// be closed.
    pub fn into_vec(mut self) -> Vec<u8> {
        debug_assert!(self.stack.is_empty(), "unclosed tag");
        std::mem::take(&mut self.buf)
    }
}

impl Drop for TlvWriter {
    fn drop(&mut self) {
        // Serialized commands may carry PINs or key material
        self.buf.zeroize();
    }
}

/// Destructive parsing cursor over BER-TLV data.
///
/// Reads are bounded by the innermost open element: [`TlvReader::read_tag`]
/// pushes a bound at the element's end, [`TlvReader::end`] pops it and
/// requires the element to be fully consumed, [`TlvReader::skip`] discards
/// the remainder instead. Reading past a bound yields
/// [`Error::InvalidData`].
pub struct TlvReader<'a> {
    data: &'a [u8],
    pos: usize,
    ends: Vec<usize>,
}

impl<'a> TlvReader<'a> {
    /// A cursor over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            ends: vec![],
        }
    }

    /// End offset of the innermost open element.
    fn limit(&self) -> usize {
        self.ends.last().copied().unwrap_or(self.data.len())
    }

    /// Bytes left in the innermost open element.
    pub fn remaining(&self) -> usize {
        self.limit() - self.pos
    }

    /// Is there anything left in the innermost open element?
    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::InvalidData);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Read a byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a big-endian 16-bit integer.
    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian 32-bit integer.
    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read exactly `n` bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Byte string with an 8-bit length prefix.
    pub fn read_bytes8(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u8()? as usize;
        self.take(len)
    }

    /// Byte string with a 16-bit big-endian length prefix.
    pub fn read_bytes16(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }

    /// Byte string with a 32-bit big-endian length prefix (SSH "string").
    pub fn read_bytes32(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Consume everything left in the innermost open element.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..self.limit()];
        self.pos = self.limit();
        out
    }

    /// Read the tag and length of the next element and enter it.
    pub fn read_tag(&mut self) -> Result<u32> {
        let first = self.read_u8()?;
        let mut tag = first as u32;

        // low five bits all set: multi-byte tag, high bit continues it
        if first & 0x1f == 0x1f {
            loop {
                let b = self.read_u8()?;
                tag = (tag << 8) | b as u32;
                if b & 0x80 == 0 {
                    break;
                }
                if tag > 0x00ff_ffff {
                    return Err(Error::InvalidData);
                }
            }
        }

        let len = self.read_length()?;

        if self.remaining() < len {
            return Err(Error::InvalidData);
        }

        self.ends.push(self.pos + len);
        Ok(tag)
    }

    fn read_length(&mut self) -> Result<usize> {
        let first = self.read_u8()?;

        if first & 0x80 == 0 {
            return Ok(first as usize);
        }

        let n = (first & 0x7f) as usize;
        if n == 0 || n > 3 {
            return Err(Error::InvalidData);
        }

        let mut len = 0usize;
        for _ in 0..n {
            len = (len << 8) | self.read_u8()? as usize;
        }
        Ok(len)
    }

    /// Leave the innermost element; it must have been fully consumed.
    pub fn end(&mut self) -> Result<()> {
        match self.ends.pop() {
            Some(end) if end == self.pos => Ok(()),
            _ => Err(Error::InvalidData),
        }
    }

    /// Discard the remainder of the innermost element and leave it.
    pub fn skip(&mut self) -> Result<()> {
        match self.ends.pop() {
            Some(end) => {
                self.pos = end;
                Ok(())
            }
            None => Err(Error::InvalidData),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{TlvReader, TlvWriter};
    use crate::Error;

    #[test]
    fn primitive_round_trip() {
        let mut w = TlvWriter::new();
        w.write_u8(0xab);
        w.write_u16(0x1234);
        w.write_u32(0xdead_beef);
        w.write_bytes8(b"pin");
        w.write_bytes16(b"subject");
        w.write_bytes32(b"chacha20-poly1305");

        let buf = w.into_vec();
        let mut r = TlvReader::new(&buf);
        assert_eq!(r.read_u8().unwrap(), 0xab);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(r.read_bytes8().unwrap(), b"pin");
        assert_eq!(r.read_bytes16().unwrap(), b"subject");
        assert_eq!(r.read_bytes32().unwrap(), b"chacha20-poly1305");
        assert!(!r.has_remaining());
    }

    #[test]
    fn nested_tags_round_trip() {
        let mut w = TlvWriter::new();
        w.push(0x7c);
        w.write_tag(0x82, &[]);
        w.write_tag(0x81, &[1, 2, 3, 4]);
        w.pop();

        let buf = w.into_vec();
        assert_eq!(buf, [0x7c, 0x08, 0x82, 0x00, 0x81, 0x04, 1, 2, 3, 4]);

        let mut r = TlvReader::new(&buf);
        assert_eq!(r.read_tag().unwrap(), 0x7c);
        assert_eq!(r.read_tag().unwrap(), 0x82);
        r.end().unwrap();
        assert_eq!(r.read_tag().unwrap(), 0x81);
        assert_eq!(r.read_rest(), [1, 2, 3, 4]);
        r.end().unwrap();
        r.end().unwrap();
        assert!(!r.has_remaining());
    }

    #[test]
    fn multi_byte_tags() {
        let mut w = TlvWriter::new();
        w.push(0x5f_c102);
        w.write_tag(0x7f49, &[0xaa]);
        w.pop();

        let buf = w.into_vec();
        assert_eq!(buf[..3], [0x5f, 0xc1, 0x02]);

        let mut r = TlvReader::new(&buf);
        assert_eq!(r.read_tag().unwrap(), 0x5f_c102);
        assert_eq!(r.read_tag().unwrap(), 0x7f49);
        assert_eq!(r.read_u8().unwrap(), 0xaa);
        r.end().unwrap();
        r.end().unwrap();
    }

    #[test]
    fn long_lengths_backpatch() {
        for len in [0x7f, 0x80, 0xff, 0x100, 0x1234] {
            let payload = vec![0x5a; len];
            let mut w = TlvWriter::new();
            w.write_tag(0x53, &payload);

            let buf = w.into_vec();
            let mut r = TlvReader::new(&buf);
            assert_eq!(r.read_tag().unwrap(), 0x53);
            assert_eq!(r.read_rest(), &payload[..]);
            r.end().unwrap();
            assert!(!r.has_remaining());
        }
    }

    #[test]
    fn length_encodings_are_canonical() {
        let mut w = TlvWriter::new();
        w.write_tag(0x53, &[0u8; 0x7f]);
        assert_eq!(w.as_bytes()[1], 0x7f);

        let mut w = TlvWriter::new();
        w.write_tag(0x53, &[0u8; 0x80]);
        assert_eq!(&w.as_bytes()[1..3], [0x81, 0x80]);

        let mut w = TlvWriter::new();
        w.write_tag(0x53, &[0u8; 0x100]);
        assert_eq!(&w.as_bytes()[1..4], [0x82, 0x01, 0x00]);
    }

    #[test]
    fn truncated_reads_fail() {
        // length says 4, only 2 bytes present
        let mut r = TlvReader::new(&[0x81, 0x04, 0x01, 0x02]);
        assert_eq!(r.read_tag(), Err(Error::InvalidData));

        // element consumed only partially
        let mut r = TlvReader::new(&[0x81, 0x02, 0x01, 0x02]);
        r.read_tag().unwrap();
        r.read_u8().unwrap();
        assert_eq!(r.end(), Err(Error::InvalidData));

        // reads are bounded by the enclosing element
        let mut r = TlvReader::new(&[0x7c, 0x02, 0x01, 0x02, 0xff, 0xff]);
        r.read_tag().unwrap();
        assert_eq!(r.read_u32(), Err(Error::InvalidData));
    }

    #[test]
    fn skip_discards_remainder() {
        let mut r = TlvReader::new(&[0x30, 0x03, 1, 2, 3, 0x34, 0x01, 9]);
        assert_eq!(r.read_tag().unwrap(), 0x30);
        r.skip().unwrap();
        assert_eq!(r.read_tag().unwrap(), 0x34);
        assert_eq!(r.read_u8().unwrap(), 9);
        r.end().unwrap();
    }
}
