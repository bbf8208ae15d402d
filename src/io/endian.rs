// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Big-endian integer codecs.
//!
//! CBOR arguments are the only multi-byte integers that travel through a
//! byte stream, so only network order is provided.

use byteorder::ByteOrder as _;
use byteorder::BE;

use crate::io;
use crate::io::Read;
use crate::io::Write;

/// An unsigned integer with a fixed-width big-endian encoding.
pub trait BeInt: Sized + Copy {
    /// Decodes a `Self` from the front of `r`.
    fn read_from<R: Read>(r: R) -> Result<Self, io::Error>;

    /// Encodes `self` onto `w`.
    fn write_to<W: Write>(self, w: W) -> Result<(), io::Error>;
}

impl BeInt for u8 {
    #[inline]
    fn read_from<R: Read>(mut r: R) -> Result<Self, io::Error> {
        let mut byte = [0];
        r.read_bytes(&mut byte)?;
        Ok(byte[0])
    }

    #[inline]
    fn write_to<W: Write>(self, mut w: W) -> Result<(), io::Error> {
        w.write_bytes(&[self])
    }
}

macro_rules! be_int {
    ($($ty:ty => $read:ident, $write:ident;)*) => {$(
        impl BeInt for $ty {
            #[inline]
            fn read_from<R: Read>(mut r: R) -> Result<Self, io::Error> {
                let mut bytes = [0; core::mem::size_of::<$ty>()];
                r.read_bytes(&mut bytes)?;
                Ok(BE::$read(&bytes))
            }

            #[inline]
            fn write_to<W: Write>(self, mut w: W) -> Result<(), io::Error> {
                let mut bytes = [0; core::mem::size_of::<$ty>()];
                BE::$write(&mut bytes, self);
                w.write_bytes(&bytes)
            }
        }
    )*};
}

be_int! {
    u16 => read_u16, write_u16;
    u32 => read_u32, write_u32;
}
