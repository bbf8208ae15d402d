// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! CBOR header encoding.
//!
//! Only headers are produced here; payload bytes are written by the caller,
//! usually straight from NVM or from a caller-provided buffer.

use crate::cbor::Major;
use crate::io;
use crate::io::Write;

/// Returns the number of bytes [`header()`] uses to encode `arg`.
pub fn header_len(arg: u32) -> usize {
    match arg {
        0..=23 => 1,
        24..=0xff => 2,
        0x100..=0xffff => 3,
        _ => 5,
    }
}

/// Writes a minimally-encoded header.
pub fn header<W: Write>(
    w: &mut W,
    major: Major,
    arg: u32,
) -> Result<(), io::Error> {
    let ty = major.bits();
    match header_len(arg) {
        1 => w.write_be(ty | arg as u8),
        2 => {
            w.write_be(ty | 24)?;
            w.write_be(arg as u8)
        }
        3 => {
            w.write_be(ty | 25)?;
            w.write_be(arg as u16)
        }
        _ => {
            w.write_be(ty | 26)?;
            w.write_be(arg)
        }
    }
}

/// Writes a header whose argument always takes four bytes, so that it can be
/// rewritten later without moving anything that follows it.
pub fn header_u32<W: Write>(
    w: &mut W,
    major: Major,
    arg: u32,
) -> Result<(), io::Error> {
    w.write_be(major.bits() | 26)?;
    w.write_be(arg)
}

/// Writes a header whose argument always takes two bytes.
pub fn header_u16<W: Write>(
    w: &mut W,
    major: Major,
    arg: u16,
) -> Result<(), io::Error> {
    w.write_be(major.bits() | 25)?;
    w.write_be(arg)
}

/// Writes an unsigned integer.
pub fn uint<W: Write>(w: &mut W, n: u32) -> Result<(), io::Error> {
    header(w, Major::Uint, n)
}

/// Writes the header of a byte string of length `len`.
pub fn bytes_header<W: Write>(w: &mut W, len: u32) -> Result<(), io::Error> {
    header(w, Major::Bytes, len)
}

/// Writes the header of a text string of length `len`.
pub fn text_header<W: Write>(w: &mut W, len: u32) -> Result<(), io::Error> {
    header(w, Major::Utf8, len)
}

/// Writes a tag number.
pub fn tag<W: Write>(w: &mut W, tag: u32) -> Result<(), io::Error> {
    header(w, Major::Tag, tag)
}

/// Writes the header of a definite-length map with `len` entries.
pub fn map_header<W: Write>(w: &mut W, len: u32) -> Result<(), io::Error> {
    header(w, Major::Map, len)
}
