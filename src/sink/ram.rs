// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! A [`Sink`] over a caller-provided RAM buffer.

use crate::sink::Error;
use crate::sink::Sink;

/// A [`Sink`] that copies everything written to it into a byte slice.
///
/// Useful when a payload has to end up in RAM, for example to be parsed
/// right after it is fetched.
pub struct RamSink<'a> {
    buf: &'a mut [u8],
    cursor: usize,
    used: usize,
}

impl<'a> RamSink<'a> {
    /// Creates a new sink filling `buf` from the start.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            cursor: 0,
            used: 0,
        }
    }

    /// Returns the prefix of the buffer that has been written to.
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.used]
    }

    /// Gives back the written prefix, ending the sink's borrow of it.
    pub fn into_written(self) -> &'a mut [u8] {
        &mut self.buf[..self.used]
    }
}

impl Sink for RamSink<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        check!(!buf.is_empty(), Error::Inval);
        let end = match self.cursor.checked_add(buf.len()) {
            Some(end) if end <= self.buf.len() => end,
            _ => return fail!(Error::OutOfBounds),
        };
        self.buf[self.cursor..end].copy_from_slice(buf);
        self.cursor = end;
        self.used = self.used.max(end);
        Ok(())
    }

    fn seek(&mut self, offset: u32) -> Result<(), Error> {
        check!(offset as usize <= self.buf.len(), Error::OutOfBounds);
        self.cursor = offset as usize;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn used_storage(&self) -> Result<u32, Error> {
        Ok(self.used as u32)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn fills_in_order() {
        let mut buf = [0; 16];
        let mut sink = RamSink::new(&mut buf);
        assert_eq!(sink.used_storage(), Ok(0));
        sink.write(b"hello").unwrap();
        sink.write(b", ram").unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.used_storage(), Ok(10));
        assert_eq!(sink.into_written(), b"hello, ram");
    }

    #[test]
    fn seek_back_keeps_high_water_mark() {
        let mut buf = [0; 8];
        let mut sink = RamSink::new(&mut buf);
        sink.write(b"abcdef").unwrap();
        sink.seek(1).unwrap();
        sink.write(b"XY").unwrap();
        assert_eq!(sink.used_storage(), Ok(6));
        assert_eq!(sink.written(), b"aXYdef");

        sink.seek(8).unwrap();
        assert_eq!(sink.seek(9), Err(Error::OutOfBounds));
    }

    #[test]
    fn rejects_overflow_and_empty_writes() {
        let mut buf = [0; 4];
        let mut sink = RamSink::new(&mut buf);
        assert_eq!(sink.write(&[]), Err(Error::Inval));
        assert_eq!(sink.write(b"12345"), Err(Error::OutOfBounds));
        sink.write(b"123").unwrap();
        assert_eq!(sink.write(b"45"), Err(Error::OutOfBounds));
        assert_eq!(sink.written(), b"123");
        assert_eq!(sink.erase(), Err(Error::Unsupported));
    }
}
