// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Sources of bytes.

use static_assertions::assert_obj_safe;

use crate::io;
use crate::io::endian::BeInt;

/// A bounded source of bytes.
///
/// Unlike `std::io::Read`, a `Read` always knows how many bytes it has left,
/// which lets decoders reject a length prefix before reading the payload it
/// announces.
pub trait Read {
    /// Fills `out` completely, or fails without a partial read being
    /// observable to the caller.
    fn read_bytes(&mut self, out: &mut [u8]) -> Result<(), io::Error>;

    /// Returns how many bytes can still be read.
    fn remaining_data(&self) -> usize;

    /// Reads a big-endian integer.
    #[inline]
    fn read_be<I: BeInt>(&mut self) -> Result<I, io::Error>
    where
        Self: Sized,
    {
        I::read_from(self)
    }
}
assert_obj_safe!(Read);

impl<R: Read + ?Sized> Read for &'_ mut R {
    #[inline]
    fn read_bytes(&mut self, out: &mut [u8]) -> Result<(), io::Error> {
        (**self).read_bytes(out)
    }

    #[inline]
    fn remaining_data(&self) -> usize {
        (**self).remaining_data()
    }
}

impl Read for &[u8] {
    fn read_bytes(&mut self, out: &mut [u8]) -> Result<(), io::Error> {
        if out.len() > self.len() {
            return Err(io::Error::BufferExhausted);
        }
        let (head, tail) = self.split_at(out.len());
        out.copy_from_slice(head);
        *self = tail;
        Ok(())
    }

    fn remaining_data(&self) -> usize {
        self.len()
    }
}
