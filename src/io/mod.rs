// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Byte-stream I/O for a `no_std` world.
//!
//! The CBOR codec reads through [`Read`] and writes through [`Write`]. Both
//! are implemented for byte slices; [`Read`] is also implemented for a
//! window of NVM, see [`FlashIo`].
//!
//! [`FlashIo`]: crate::hardware::flash::FlashIo

pub mod endian;
pub mod read;
pub mod write;

pub use read::Read;
pub use write::Write;

/// A byte-stream error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The stream ended before the requested number of bytes, or a
    /// destination buffer filled up.
    BufferExhausted,

    /// The device behind the stream failed.
    Internal,
}
