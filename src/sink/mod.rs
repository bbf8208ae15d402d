// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Byte sinks.
//!
//! A [`Sink`] is the destination of every byte-producing operation in this
//! crate: manifests are installed through one, cache entries are filled
//! through one, and fetch sources stream into one. Only [`Sink::write()`] is
//! mandatory; the remaining operations return [`Error::Unsupported`] unless
//! the implementation overrides them.

use static_assertions::assert_obj_safe;

use crate::hardware::flash;

mod flash_sink;
pub use flash_sink::FlashSink;
pub use flash_sink::MAX_WRITE_SIZE;

mod ram;
pub use ram::RamSink;

/// A [`Sink`] error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The requested address or length lies outside the sink's window.
    OutOfBounds,
    /// An argument was malformed.
    Inval,
    /// The underlying device failed. The sink must not be used further.
    Io,
    /// The sink has no room left for the request.
    NoResources,
    /// The sink does not implement the requested operation.
    Unsupported,
    /// The sink is in the wrong state for the request.
    IncorrectState,
}

impl From<flash::Error> for Error {
    fn from(e: flash::Error) -> Self {
        match e {
            flash::Error::OutOfRange => Error::OutOfBounds,
            _ => Error::Io,
        }
    }
}

/// A destination for a stream of bytes.
pub trait Sink {
    /// Writes all of `buf` at the current cursor, advancing it.
    fn write(&mut self, buf: &[u8]) -> Result<(), Error>;

    /// Moves the cursor to `offset`, relative to the start of the sink.
    fn seek(&mut self, offset: u32) -> Result<(), Error> {
        let _ = offset;
        Err(Error::Unsupported)
    }

    /// Forces any buffered bytes out to the underlying storage.
    fn flush(&mut self) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    /// Returns the number of bytes of storage used so far, measured as a
    /// high-water mark.
    fn used_storage(&self) -> Result<u32, Error> {
        Err(Error::Unsupported)
    }

    /// Erases whatever storage backs this sink.
    fn erase(&mut self) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    /// Gives up the sink; it must not be written to afterwards.
    fn release(&mut self) -> Result<(), Error> {
        Err(Error::Unsupported)
    }
}
assert_obj_safe!(Sink);

impl<S: Sink + ?Sized> Sink for &mut S {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        S::write(self, buf)
    }

    #[inline]
    fn seek(&mut self, offset: u32) -> Result<(), Error> {
        S::seek(self, offset)
    }

    #[inline]
    fn flush(&mut self) -> Result<(), Error> {
        S::flush(self)
    }

    #[inline]
    fn used_storage(&self) -> Result<u32, Error> {
        S::used_storage(self)
    }

    #[inline]
    fn erase(&mut self) -> Result<(), Error> {
        S::erase(self)
    }

    #[inline]
    fn release(&mut self) -> Result<(), Error> {
        S::release(self)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::Error;

    /// A call observed by a [`fake::Sink`](Sink).
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum Call {
        /// `write()` at the given cursor with the given length.
        Write { offset: u32, len: u32 },
        /// `seek()` to the given offset.
        Seek(u32),
    }

    /// A RAM sink that records every call made to it.
    #[derive(Default)]
    pub struct Sink {
        /// The bytes written so far, indexed by sink offset.
        pub data: Vec<u8>,
        /// Every `write()` and `seek()`, in order.
        pub calls: Vec<Call>,
        /// If set, the n-th `write()` call from now (zero-based) fails.
        pub fail_write_at: Option<usize>,
        /// Whether `release()` has been called.
        pub released: bool,
        cursor: u32,
    }

    impl Sink {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl super::Sink for Sink {
        fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
            if let Some(n) = self.fail_write_at.as_mut() {
                if *n == 0 {
                    self.fail_write_at = None;
                    return Err(Error::Io);
                }
                *n -= 1;
            }
            self.calls.push(Call::Write {
                offset: self.cursor,
                len: buf.len() as u32,
            });
            let start = self.cursor as usize;
            let end = start + buf.len();
            if self.data.len() < end {
                self.data.resize(end, 0);
            }
            self.data[start..end].copy_from_slice(buf);
            self.cursor = end as u32;
            Ok(())
        }

        fn seek(&mut self, offset: u32) -> Result<(), Error> {
            self.calls.push(Call::Seek(offset));
            self.cursor = offset;
            Ok(())
        }

        fn flush(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn used_storage(&self) -> Result<u32, Error> {
            Ok(self.data.len() as u32)
        }

        fn release(&mut self) -> Result<(), Error> {
            self.released = true;
            Ok(())
        }
    }
}
