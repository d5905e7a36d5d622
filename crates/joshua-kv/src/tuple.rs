//! Order-preserving tuple encoding for keys.
//!
//! Packed keys compare byte-wise in the same order as their element-wise
//! interpretation: all byte strings sort before all unicode strings, which
//! sort before all integers, which sort before all versionstamps, and
//! elements of the same kind sort by value. This is the property every
//! subspace range scan in the fabric leans on.

use thiserror::Error;

const CODE_BYTES: u8 = 0x01;
const CODE_STRING: u8 = 0x02;
const CODE_INT_ZERO: u8 = 0x14;
const CODE_STAMP: u8 = 0x33;

/// Length in bytes of a commit versionstamp element.
pub const STAMP_LEN: usize = 10;

/// One element of a packed key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Element {
    Bytes(Vec<u8>),
    Str(String),
    Int(u64),
    /// A completed 10-byte commit versionstamp.
    Stamp([u8; STAMP_LEN]),
    /// Placeholder filled in by the store at commit time via
    /// [crate::Transaction::set_versionstamped_key].
    StampPlaceholder,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TupleError {
    #[error("truncated tuple encoding")]
    Truncated,
    #[error("unknown type code {0:#x}")]
    UnknownCode(u8),
    #[error("invalid utf-8 in string element")]
    InvalidUtf8,
    #[error("integer element wider than 8 bytes")]
    IntTooWide,
}

/// Packs elements into a key. Placeholder stamps are packed as ten zero
/// bytes; use [pack_with_stamp] when the placeholder offset is needed.
pub fn pack(elements: &[Element]) -> Vec<u8> {
    pack_with_stamp(elements).0
}

/// Packs elements and reports the byte offset of the first placeholder
/// stamp's payload, if any.
pub fn pack_with_stamp(elements: &[Element]) -> (Vec<u8>, Option<usize>) {
    let mut out = Vec::new();
    let mut stamp_offset = None;
    for element in elements {
        match element {
            Element::Bytes(data) => {
                out.push(CODE_BYTES);
                escape_into(data, &mut out);
                out.push(0x00);
            }
            Element::Str(text) => {
                out.push(CODE_STRING);
                escape_into(text.as_bytes(), &mut out);
                out.push(0x00);
            }
            Element::Int(value) => {
                let width = int_width(*value);
                out.push(CODE_INT_ZERO + width as u8);
                out.extend_from_slice(&value.to_be_bytes()[8 - width..]);
            }
            Element::Stamp(stamp) => {
                out.push(CODE_STAMP);
                out.extend_from_slice(stamp);
            }
            Element::StampPlaceholder => {
                out.push(CODE_STAMP);
                if stamp_offset.is_none() {
                    stamp_offset = Some(out.len());
                }
                out.extend_from_slice(&[0u8; STAMP_LEN]);
            }
        }
    }
    (out, stamp_offset)
}

/// Decodes a packed key back into elements.
pub fn unpack(mut key: &[u8]) -> Result<Vec<Element>, TupleError> {
    let mut elements = Vec::new();
    while let Some((&code, rest)) = key.split_first() {
        match code {
            CODE_BYTES => {
                let (data, rest) = unescape(rest)?;
                elements.push(Element::Bytes(data));
                key = rest;
            }
            CODE_STRING => {
                let (data, rest) = unescape(rest)?;
                let text = String::from_utf8(data).map_err(|_| TupleError::InvalidUtf8)?;
                elements.push(Element::Str(text));
                key = rest;
            }
            code if (CODE_INT_ZERO..=CODE_INT_ZERO + 8).contains(&code) => {
                let width = (code - CODE_INT_ZERO) as usize;
                if rest.len() < width {
                    return Err(TupleError::Truncated);
                }
                let mut raw = [0u8; 8];
                raw[8 - width..].copy_from_slice(&rest[..width]);
                elements.push(Element::Int(u64::from_be_bytes(raw)));
                key = &rest[width..];
            }
            CODE_STAMP => {
                if rest.len() < STAMP_LEN {
                    return Err(TupleError::Truncated);
                }
                let mut stamp = [0u8; STAMP_LEN];
                stamp.copy_from_slice(&rest[..STAMP_LEN]);
                elements.push(Element::Stamp(stamp));
                key = &rest[STAMP_LEN..];
            }
            other => return Err(TupleError::UnknownCode(other)),
        }
    }
    Ok(elements)
}

fn int_width(value: u64) -> usize {
    (8 - value.leading_zeros() as usize / 8).max(if value == 0 { 0 } else { 1 })
}

fn escape_into(data: &[u8], out: &mut Vec<u8>) {
    for &byte in data {
        out.push(byte);
        if byte == 0x00 {
            // NUL is the terminator, so embedded NULs are escaped as 00 FF.
            out.push(0xFF);
        }
    }
}

fn unescape(data: &[u8]) -> Result<(Vec<u8>, &[u8]), TupleError> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        if data[i] == 0x00 {
            if data.get(i + 1) == Some(&0xFF) {
                out.push(0x00);
                i += 2;
            } else {
                return Ok((out, &data[i + 1..]));
            }
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    Err(TupleError::Truncated)
}
