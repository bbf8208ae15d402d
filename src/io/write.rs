// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Destinations for bytes.

use core::mem;

use static_assertions::assert_obj_safe;

use crate::io;
use crate::io::endian::BeInt;

/// A destination for bytes, such as a stack buffer being filled with a CBOR
/// header.
///
/// Writes are all-or-nothing.
pub trait Write {
    /// Writes all of `buf`.
    fn write_bytes(&mut self, buf: &[u8]) -> Result<(), io::Error>;

    /// Writes a big-endian integer.
    #[inline]
    fn write_be<I: BeInt>(&mut self, val: I) -> Result<(), io::Error>
    where
        Self: Sized,
    {
        val.write_to(self)
    }
}
assert_obj_safe!(Write);

impl<W: Write + ?Sized> Write for &'_ mut W {
    #[inline]
    fn write_bytes(&mut self, buf: &[u8]) -> Result<(), io::Error> {
        (**self).write_bytes(buf)
    }
}

/// Writing to a slice shrinks it to the part not yet written.
impl Write for &'_ mut [u8] {
    fn write_bytes(&mut self, buf: &[u8]) -> Result<(), io::Error> {
        if buf.len() > self.len() {
            return Err(io::Error::BufferExhausted);
        }
        let (head, tail) = mem::take(self).split_at_mut(buf.len());
        head.copy_from_slice(buf);
        *self = tail;
        Ok(())
    }
}
