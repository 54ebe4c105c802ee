// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The TLV8 wire codec used by the pairing protocol and by BLE
//! characteristic bodies.
//!
//! Each item is `type:u8, length:u8, value`. Values longer than 254 bytes
//! are carried as runs of fragments: every fragment has length 255 and the
//! run is closed by an item of the same type with length below 255 (a
//! zero-length item when the value is an exact multiple of 255). Outside of
//! fragment runs, two adjacent items of the same type are malformed; item
//! groups of equal type must be separated by an item of a different type.

use crate::{Error, Result};

/// One logical TLV item with fragments already merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tlv_type: u8,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(tlv_type: u8, value: impl Into<Vec<u8>>) -> Self {
        Tlv {
            tlv_type,
            value: value.into(),
        }
    }
}

/// A slot for [`Reader::extract`]: one requested type, filled with the
/// logical value if the buffer contains it.
#[derive(Debug)]
pub struct TlvSlot {
    pub tlv_type: u8,
    pub value: Option<Vec<u8>>,
}

impl TlvSlot {
    pub fn new(tlv_type: u8) -> Self {
        TlvSlot {
            tlv_type,
            value: None,
        }
    }
}

/// Sequential TLV8 reader over a borrowed buffer.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    last_type: Option<u8>,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader {
            buf,
            pos: 0,
            last_type: None,
        }
    }

    /// Returns the next logical item, merging fragment runs, or `None` at
    /// the end of the buffer.
    pub fn next(&mut self) -> Result<Option<Tlv>> {
        let (tlv_type, mut value) = match self.read_raw()? {
            Some(item) => item,
            None => return Ok(None),
        };
        if self.last_type == Some(tlv_type) {
            // Same type as the previous logical item without a separator.
            return Err(Error::InvalidData);
        }
        let mut fragment_len = value.len();
        while fragment_len == 255 {
            match self.read_raw()? {
                Some((next_type, fragment)) if next_type == tlv_type => {
                    fragment_len = fragment.len();
                    value.extend_from_slice(&fragment);
                }
                Some(_) | None => return Err(Error::InvalidData),
            }
        }
        self.last_type = Some(tlv_type);
        Ok(Some(Tlv { tlv_type, value }))
    }

    /// Consumes the remaining buffer, filling each requested slot with its
    /// type's logical value. Each type may be requested at most once.
    /// Duplicate occurrences of a requested type and malformed framing are
    /// `InvalidData`; types absent from the buffer leave their slot `None`.
    pub fn extract(&mut self, slots: &mut [TlvSlot]) -> Result<()> {
        for i in 1..slots.len() {
            if slots[..i].iter().any(|s| s.tlv_type == slots[i].tlv_type) {
                return Err(Error::InvalidData);
            }
        }
        while let Some(tlv) = self.next()? {
            if let Some(slot) = slots.iter_mut().find(|s| s.tlv_type == tlv.tlv_type) {
                if slot.value.is_some() {
                    return Err(Error::InvalidData);
                }
                slot.value = Some(tlv.value);
            }
        }
        Ok(())
    }

    fn read_raw(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        if self.pos == self.buf.len() {
            return Ok(None);
        }
        if self.buf.len() - self.pos < 2 {
            return Err(Error::InvalidData);
        }
        let tlv_type = self.buf[self.pos];
        let len = self.buf[self.pos + 1] as usize;
        self.pos += 2;
        if self.buf.len() - self.pos < len {
            return Err(Error::InvalidData);
        }
        let value = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(Some((tlv_type, value)))
    }
}

/// TLV8 writer over a fixed-capacity buffer with automatic fragmentation.
pub struct Writer {
    buf: Box<[u8]>,
    len: usize,
}

impl Writer {
    pub fn with_capacity(capacity: usize) -> Self {
        Writer {
            buf: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Serializes one logical item. Values above 254 bytes are split into
    /// length-255 fragments; a value that is an exact multiple of 255 gets
    /// a zero-length terminator item so the run always ends below 255.
    pub fn append(&mut self, tlv_type: u8, value: &[u8]) -> Result<()> {
        let headers = value.len() / 255 + 1;
        let needed = value.len() + 2 * headers;
        if self.buf.len() - self.len < needed {
            return Err(Error::OutOfResources);
        }
        let mut rest = value;
        loop {
            let n = rest.len().min(255);
            self.buf[self.len] = tlv_type;
            self.buf[self.len + 1] = n as u8;
            self.buf[self.len + 2..self.len + 2 + n].copy_from_slice(&rest[..n]);
            self.len += 2 + n;
            rest = &rest[n..];
            if rest.is_empty() && n < 255 {
                break;
            }
            if rest.is_empty() {
                // Exact multiple of 255: close the run.
                if self.buf.len() - self.len < 2 {
                    return Err(Error::OutOfResources);
                }
                self.buf[self.len] = tlv_type;
                self.buf[self.len + 1] = 0;
                self.len += 2;
                break;
            }
        }
        Ok(())
    }

    /// Appends an item whose value bytes were staged in [`Writer::scratch`].
    pub fn append_staged(&mut self, tlv_type: u8, staged_len: usize) -> Result<()> {
        if self.buf.len() - self.len < staged_len {
            return Err(Error::OutOfResources);
        }
        let staged = self.buf[self.len..self.len + staged_len].to_vec();
        self.append(tlv_type, &staged)
    }

    /// The unused tail of the buffer, for staging value bytes before the
    /// next append. Invalidated by any append.
    pub fn scratch(&mut self) -> &mut [u8] {
        &mut self.buf[self.len..]
    }

    /// The serialized bytes written so far.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        let mut v = Vec::from(self.buf);
        v.truncate(self.len);
        v
    }
}

/// Convenience one-shot encoder for small payloads built from whole items.
pub fn encode(items: &[Tlv]) -> Vec<u8> {
    let capacity: usize = items
        .iter()
        .map(|t| t.value.len() + 2 * (t.value.len() / 255 + 1))
        .sum();
    let mut writer = Writer::with_capacity(capacity);
    for item in items {
        // Capacity is computed above, appends cannot fail.
        writer.append(item.tlv_type, &item.value).unwrap();
    }
    writer.into_bytes()
}
