// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Raw non-volatile memory abstraction.
//!
//! This module provides the [`Flash`] trait, which represents an *abstract NVM
//! device*: a range of memory that can be read at any granularity, but that
//! can only be programmed in units of its write size and erased in units of
//! its erase-block size. Such a "device" can range from a simple Rust slice
//! to an on-chip flash controller or MRAM.
//!
//! Addresses are never raw pointers; they are [`Ptr`]s and [`Region`]s that
//! only make sense relative to some [`Flash`] implementation.

use core::convert::TryInto;

use static_assertions::assert_obj_safe;

use zerocopy::AsBytes;
use zerocopy::FromBytes;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::io;
use crate::io::Read as _;

/// The value of a byte of NVM after it has been erased.
pub const ERASED: u8 = 0xff;

/// A [`Flash`] error.
///
/// All of these errors are non-retryable; a [`Flash`] implementation should
/// block until the operation succeeds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Indicates that an operation failed because the requested
    /// operation was outside of the device's address space.
    OutOfRange,

    /// Indicates that a program or erase operation did not respect the
    /// device's write or erase granularity.
    Misaligned,

    /// Indicates that the device is locked in some manner and cannot
    /// be affected by the operation.
    Locked,

    /// Indicates that an internal invariant was violated.
    Internal,

    /// Indicates that an unspecified error occured.
    Unspecified,
}

/// Programming and erasing granularity of a region of NVM.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// The minimum unit of programming, in bytes. Program operations must
    /// start and end on a multiple of this value.
    pub write_size: u32,
    /// The size of an erase block, in bytes.
    pub erase_size: u32,
}

impl Geometry {
    /// Rounds `address` down to the start of its write block.
    pub fn write_floor(&self, address: u32) -> u32 {
        address - address % self.write_size
    }

    /// Rounds `address` down to the start of its erase block.
    pub fn erase_floor(&self, address: u32) -> u32 {
        address - address % self.erase_size
    }

    /// Returns whether `region` starts and ends on erase-block boundaries.
    pub fn is_erase_aligned(&self, region: Region) -> bool {
        region.ptr.address % self.erase_size == 0
            && region.len % self.erase_size == 0
    }
}

/// Provides access to an NVM device.
///
/// This is the only interface the storage layers of this crate use to touch
/// memory. Implementations are expected to enforce their own alignment
/// rules, returning [`Error::Misaligned`] rather than silently corrupting
/// neighbouring data.
pub trait Flash {
    /// Returns the size, in bytes, of this device.
    fn size(&self) -> Result<u32, Error>;

    /// Returns the programming geometry of the region of the device that
    /// contains `at`.
    ///
    /// Fails with [`Error::OutOfRange`] if `at` is not backed by the device.
    fn geometry(&self, at: Ptr) -> Result<Geometry, Error>;

    /// Attempts to read `out.len()` bytes starting at `offset`.
    fn read(&self, offset: Ptr, out: &mut [u8]) -> Result<(), Error>;

    /// Attempts to program `buf.len()` bytes starting at `offset`.
    ///
    /// Both `offset` and `buf.len()` must be multiples of the write size
    /// reported by [`Flash::geometry()`].
    fn program(&mut self, offset: Ptr, buf: &[u8]) -> Result<(), Error>;

    /// Erases `region`, setting every byte in it to [`ERASED`].
    ///
    /// `region` must be aligned to erase blocks.
    fn erase(&mut self, region: Region) -> Result<(), Error>;
}
assert_obj_safe!(Flash);

impl<F: Flash + ?Sized> Flash for &F {
    #[inline]
    fn size(&self) -> Result<u32, Error> {
        F::size(self)
    }

    #[inline]
    fn geometry(&self, at: Ptr) -> Result<Geometry, Error> {
        F::geometry(self, at)
    }

    #[inline]
    fn read(&self, offset: Ptr, out: &mut [u8]) -> Result<(), Error> {
        F::read(self, offset, out)
    }

    #[inline]
    fn program(&mut self, _: Ptr, _: &[u8]) -> Result<(), Error> {
        Err(Error::Locked)
    }

    #[inline]
    fn erase(&mut self, _: Region) -> Result<(), Error> {
        Err(Error::Locked)
    }
}

impl<F: Flash + ?Sized> Flash for &mut F {
    #[inline]
    fn size(&self) -> Result<u32, Error> {
        F::size(self)
    }

    #[inline]
    fn geometry(&self, at: Ptr) -> Result<Geometry, Error> {
        F::geometry(self, at)
    }

    #[inline]
    fn read(&self, offset: Ptr, out: &mut [u8]) -> Result<(), Error> {
        F::read(self, offset, out)
    }

    #[inline]
    fn program(&mut self, offset: Ptr, buf: &[u8]) -> Result<(), Error> {
        F::program(self, offset, buf)
    }

    #[inline]
    fn erase(&mut self, region: Region) -> Result<(), Error> {
        F::erase(self, region)
    }
}

/// Convenience functions for [`Flash`] reads, exposed as a trait.
pub trait FlashExt {
    /// Reads a value of type `T` stored at `offset`.
    fn read_object<T>(&self, offset: Ptr) -> Result<T, Error>
    where
        T: AsBytes + FromBytes + Default;

    /// Returns whether every byte of `region` is [`ERASED`].
    fn is_erased(&self, region: Region) -> Result<bool, Error>;
}

impl<F: Flash + ?Sized> FlashExt for F {
    fn read_object<T>(&self, offset: Ptr) -> Result<T, Error>
    where
        T: AsBytes + FromBytes + Default,
    {
        let mut val = T::default();
        self.read(offset, val.as_bytes_mut())?;
        Ok(val)
    }

    fn is_erased(&self, region: Region) -> Result<bool, Error> {
        let mut buf = [0; 64];
        let mut cursor = region.ptr.address;
        let end = region.end().ok_or(Error::OutOfRange)?;
        while cursor < end {
            let len = buf.len().min((end - cursor) as usize);
            self.read(Ptr::new(cursor), &mut buf[..len])?;
            if buf[..len].iter().any(|&b| b != ERASED) {
                return Ok(false);
            }
            cursor += len as u32;
        }
        Ok(true)
    }
}

/// Adapter for converting mutable, RAM-backed storage into a [`Flash`].
///
/// For the purposes of this type, "RAM-backed" means that `AsRef<[u8]>`
/// and `AsMut<[u8]>` are implemented. The whole buffer shares a single
/// [`Geometry`], and programming overwrites bytes as-is, like MRAM.
#[derive(Copy, Clone)]
pub struct RamMut<Bytes> {
    bytes: Bytes,
    geometry: Geometry,
}

impl<Bytes: AsRef<[u8]> + AsMut<[u8]>> RamMut<Bytes> {
    /// Wraps `bytes` into a device with the given geometry.
    pub fn new(bytes: Bytes, geometry: Geometry) -> Self {
        Self { bytes, geometry }
    }

    /// Returns the raw contents of the device.
    pub fn bytes(&self) -> &[u8] {
        self.bytes.as_ref()
    }

    fn range(&self, region: Region) -> Result<core::ops::Range<usize>, Error> {
        let start = region.ptr.address as usize;
        let end = start
            .checked_add(region.len as usize)
            .ok_or(Error::OutOfRange)?;
        if end > self.bytes.as_ref().len() {
            return Err(Error::OutOfRange);
        }
        Ok(start..end)
    }
}

impl<Bytes: AsRef<[u8]> + AsMut<[u8]>> Flash for RamMut<Bytes> {
    fn size(&self) -> Result<u32, Error> {
        self.bytes
            .as_ref()
            .len()
            .try_into()
            .map_err(|_| Error::Unspecified)
    }

    fn geometry(&self, at: Ptr) -> Result<Geometry, Error> {
        if at.address as usize >= self.bytes.as_ref().len() {
            return Err(Error::OutOfRange);
        }
        Ok(self.geometry)
    }

    fn read(&self, offset: Ptr, out: &mut [u8]) -> Result<(), Error> {
        let range = self.range(Region::new(offset.address, out.len() as u32))?;
        out.copy_from_slice(&self.bytes.as_ref()[range]);
        Ok(())
    }

    fn program(&mut self, offset: Ptr, buf: &[u8]) -> Result<(), Error> {
        let w = self.geometry.write_size;
        if offset.address % w != 0 || buf.len() as u32 % w != 0 {
            return Err(Error::Misaligned);
        }
        let range = self.range(Region::new(offset.address, buf.len() as u32))?;
        self.bytes.as_mut()[range].copy_from_slice(buf);
        Ok(())
    }

    fn erase(&mut self, region: Region) -> Result<(), Error> {
        if !self.geometry.is_erase_aligned(region) {
            return Err(Error::Misaligned);
        }
        let range = self.range(region)?;
        for b in &mut self.bytes.as_mut()[range] {
            *b = ERASED;
        }
        Ok(())
    }
}

/// A [`Read`] implementation for operating on a [`Region`] of a [`Flash`]
/// serially.
///
/// Reads past the end of the region fail with
/// [`io::Error::BufferExhausted`].
///
/// [`Read`]: ../../io/read/trait.Read.html
pub struct FlashIo<'f, F: ?Sized> {
    flash: &'f F,
    region: Region,
    // Offset relative to `region`; may exceed `region.len` after a `skip()`.
    cursor: u32,
}

impl<'f, F: Flash + ?Sized> FlashIo<'f, F> {
    /// Creates a new `FlashIo`, reading from the beginning of `region`.
    pub fn new(flash: &'f F, region: Region) -> Self {
        Self {
            flash,
            region,
            cursor: 0,
        }
    }

    /// Returns the cursor's offset relative to the start of the region.
    pub fn position(&self) -> u32 {
        self.cursor
    }

    /// Returns the absolute device address of the cursor.
    pub fn ptr(&self) -> Ptr {
        Ptr::new(self.region.ptr.address.saturating_add(self.cursor))
    }

    /// Skips the cursor `bytes` bytes forward.
    ///
    /// This operation always succeeds, but attempting to read past the end of
    /// the region will always result in an error.
    pub fn skip(&mut self, bytes: u32) {
        self.cursor = self.cursor.saturating_add(bytes);
    }

    /// Reads the next byte without consuming it.
    pub fn peek(&self) -> Result<u8, io::Error> {
        if self.remaining_data() == 0 {
            return Err(io::Error::BufferExhausted);
        }
        let mut byte = [0];
        self.flash
            .read(self.ptr(), &mut byte)
            .map_err(|_| io::Error::Internal)?;
        Ok(byte[0])
    }
}

impl<F: Flash + ?Sized> io::Read for FlashIo<'_, F> {
    fn read_bytes(&mut self, out: &mut [u8]) -> Result<(), io::Error> {
        if out.len() > self.remaining_data() {
            return Err(io::Error::BufferExhausted);
        }
        self.flash
            .read(self.ptr(), out)
            .map_err(|_| io::Error::Internal)?;
        self.cursor += out.len() as u32;
        Ok(())
    }

    fn remaining_data(&self) -> usize {
        self.region.len.saturating_sub(self.cursor) as usize
    }
}

/// An abstract pointer into a [`Flash`] type.
///
/// A `Ptr` needs to be used in conjunction with a [`Flash`]
/// implementation to be read from or written to.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, AsBytes, FromBytes,
)]
#[repr(transparent)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Ptr {
    /// The abstract address of this pointer.
    pub address: u32,
}

impl Ptr {
    /// Convenience method for creating a `Ptr` without having to use
    /// a struct literal.
    pub const fn new(address: u32) -> Self {
        Self { address }
    }
}

/// A region within a [`Flash`] type.
///
/// Much like a [`Ptr`], a `Region` needs to be interpreted with
/// respect to a [`Flash`] implementation.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, AsBytes, FromBytes,
)]
#[repr(C)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Region {
    /// The base pointer for this slice.
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub ptr: Ptr,
    /// The length of the slice, in bytes.
    pub len: u32,
}

impl Region {
    /// Convenience method for creating a `Region` without having to use
    /// a struct literal.
    pub const fn new(ptr: u32, len: u32) -> Self {
        Self {
            ptr: Ptr::new(ptr),
            len,
        }
    }

    /// Returns the address one past the end of this region, if it does not
    /// overflow.
    pub fn end(self) -> Option<u32> {
        self.ptr.address.checked_add(self.len)
    }

    /// Returns whether `other` lies entirely within `self`.
    pub fn contains(self, other: Region) -> bool {
        match (self.end(), other.end()) {
            (Some(end), Some(other_end)) => {
                other.ptr.address >= self.ptr.address && other_end <= end
            }
            _ => false,
        }
    }

    /// Interprets `offset..offset + len` relative to `self`, returning the
    /// absolute region, or `None` if it does not fit.
    pub fn subregion(self, offset: u32, len: u32) -> Option<Region> {
        let sub = Region::new(self.ptr.address.checked_add(offset)?, len);
        if self.contains(sub) {
            Some(sub)
        } else {
            None
        }
    }
}
