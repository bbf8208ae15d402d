// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! A [`Sink`] over a window of raw NVM.

use crate::hardware::flash::Flash;
use crate::hardware::flash::Geometry;
use crate::hardware::flash::Ptr;
use crate::hardware::flash::Region;
use crate::hardware::flash::ERASED;
use crate::sink::Error;
use crate::sink::Sink;

/// The largest NVM write granularity a [`FlashSink`] can drive.
pub const MAX_WRITE_SIZE: usize = 16;

/// A partially-filled write block, waiting for more bytes or a flush.
struct Tail {
    /// Absolute address of the block.
    block: u32,
    buf: [u8; MAX_WRITE_SIZE],
}

/// A [`Sink`] that writes sequentially into a window of a [`Flash`] device,
/// hiding the device's write granularity from the caller.
///
/// Writes are split in three: bytes that complete a block the cursor is in
/// the middle of, a run of whole blocks programmed straight from the caller's
/// buffer, and a final partial block that is held back until the next write,
/// [`Sink::seek()`] or [`Sink::flush()`]. Bytes of a held-back block that
/// the caller never wrote are padded with [`ERASED`].
///
/// Any device failure leaves the window in an unspecified state; the sink
/// must not be used after one.
pub struct FlashSink<F> {
    flash: F,
    window: Region,
    geometry: Geometry,
    cursor: u32,
    used: u32,
    tail: Option<Tail>,
}

impl<F: Flash> FlashSink<F> {
    /// Binds a new sink to `window` of `flash`, with the cursor at its start.
    ///
    /// Fails with [`Error::OutOfBounds`] if `window` is not backed by the
    /// device.
    pub fn bind(flash: F, window: Region) -> Result<Self, Error> {
        let end = match window.end() {
            Some(end) => end,
            None => return fail!(Error::OutOfBounds),
        };
        check!(end <= flash.size()?, Error::OutOfBounds);
        let geometry = match flash.geometry(window.ptr) {
            Ok(g) => g,
            Err(_) => return fail!(Error::OutOfBounds),
        };
        check!(geometry.write_size != 0, Error::Inval);
        check!(geometry.write_size as usize <= MAX_WRITE_SIZE, Error::Inval);

        Ok(Self {
            flash,
            window,
            geometry,
            cursor: 0,
            used: 0,
            tail: None,
        })
    }

    /// Returns the window this sink is bound to.
    pub fn window(&self) -> Region {
        self.window
    }

    /// Returns the cursor, relative to the start of the window.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Returns a shared reference to the underlying device.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Unbinds the sink, returning the underlying device.
    ///
    /// Any held-back partial block is discarded; call [`Sink::flush()`]
    /// first to keep it.
    pub fn into_flash(self) -> F {
        self.flash
    }

    fn write_size(&self) -> u32 {
        self.geometry.write_size
    }

    /// Loads the block containing absolute address `addr` into a new tail.
    ///
    /// In-window bytes past the high-water mark are stale, so they are
    /// replaced with padding.
    fn load_tail(&self, addr: u32) -> Result<Tail, Error> {
        let block = self.geometry.write_floor(addr);
        let w = self.write_size() as usize;
        let mut buf = [ERASED; MAX_WRITE_SIZE];
        self.flash.read(Ptr::new(block), &mut buf[..w])?;

        let stale_from = self.window.ptr.address + self.used;
        let stale_to = self.window.ptr.address + self.window.len;
        for (i, b) in buf[..w].iter_mut().enumerate() {
            let a = block + i as u32;
            if a >= stale_from && a < stale_to {
                *b = ERASED;
            }
        }
        Ok(Tail { block, buf })
    }

    /// Programs the held-back block, if any.
    fn commit_tail(&mut self) -> Result<(), Error> {
        if let Some(tail) = self.tail.take() {
            let w = self.write_size() as usize;
            self.flash.program(Ptr::new(tail.block), &tail.buf[..w])?;
        }
        Ok(())
    }

    fn advance(&mut self, len: u32) {
        self.cursor += len;
        self.used = self.used.max(self.cursor);
    }
}

impl<F: Flash> Sink for FlashSink<F> {
    fn write(&mut self, mut buf: &[u8]) -> Result<(), Error> {
        let fits = (buf.len() as u64) + (self.cursor as u64)
            <= self.window.len as u64;
        check!(fits, Error::OutOfBounds);
        let w = self.write_size();

        // Phase 1: finish the block the cursor is in the middle of.
        let addr = self.window.ptr.address + self.cursor;
        if addr % w != 0 && !buf.is_empty() {
            let mut tail = match self.tail.take() {
                Some(t) if t.block == self.geometry.write_floor(addr) => t,
                stale => {
                    self.tail = stale;
                    self.commit_tail()?;
                    self.load_tail(addr)?
                }
            };
            let start = (addr - tail.block) as usize;
            let n = buf.len().min(w as usize - start);
            tail.buf[start..start + n].copy_from_slice(&buf[..n]);
            buf = &buf[n..];
            self.advance(n as u32);

            if start + n == w as usize {
                let block = &tail.buf[..w as usize];
                self.flash.program(Ptr::new(tail.block), block)?;
            } else {
                self.tail = Some(tail);
                return Ok(());
            }
        } else if !buf.is_empty() {
            // Aligned, so any held-back block is behind us.
            self.commit_tail()?;
        }

        // Phase 2: whole blocks, straight from the caller.
        let whole = buf.len() - buf.len() % w as usize;
        if whole > 0 {
            let addr = self.window.ptr.address + self.cursor;
            self.flash.program(Ptr::new(addr), &buf[..whole])?;
            buf = &buf[whole..];
            self.advance(whole as u32);
        }

        // Phase 3: hold back the remainder.
        if !buf.is_empty() {
            let addr = self.window.ptr.address + self.cursor;
            let mut tail = self.load_tail(addr)?;
            tail.buf[..buf.len()].copy_from_slice(buf);
            self.advance(buf.len() as u32);
            self.tail = Some(tail);
        }
        Ok(())
    }

    fn seek(&mut self, offset: u32) -> Result<(), Error> {
        check!(offset < self.window.len, Error::OutOfBounds);
        self.commit_tail()?;
        self.cursor = offset;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.commit_tail()
    }

    fn used_storage(&self) -> Result<u32, Error> {
        Ok(self.used)
    }

    fn erase(&mut self) -> Result<(), Error> {
        check!(self.geometry.is_erase_aligned(self.window), Error::Inval);
        self.flash.erase(self.window)?;
        self.tail = None;
        self.cursor = 0;
        self.used = 0;
        Ok(())
    }

    fn release(&mut self) -> Result<(), Error> {
        self.commit_tail()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::hardware::fake;

    #[test]
    fn three_phase_write() {
        let mut flash = fake::Flash::new(2048, 16, 256);
        let mut sink = FlashSink::bind(&mut flash, Region::new(1000, 64)).unwrap();

        let data: Vec<u8> = (0..40).collect();
        sink.write(&data[..10]).unwrap();
        sink.write(&data[10..]).unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.used_storage().unwrap(), 40);
        drop(sink);

        assert_eq!(
            flash.programs,
            vec![
                Region::new(992, 16),
                Region::new(1008, 16),
                Region::new(1024, 16),
            ]
        );
        assert_eq!(flash.slice(Region::new(1000, 40)), &data[..]);
        assert!(flash.slice(Region::new(992, 8)).iter().all(|&b| b == ERASED));
    }

    #[test]
    fn flush_pads_tail() {
        let mut flash = fake::Flash::new(256, 16, 64);
        let mut sink = FlashSink::bind(&mut flash, Region::new(64, 64)).unwrap();
        sink.write(b"hello").unwrap();
        sink.write(b" world").unwrap();
        assert_eq!(sink.used_storage().unwrap(), 11);
        sink.flush().unwrap();
        sink.flush().unwrap();
        drop(sink);

        assert_eq!(flash.programs, vec![Region::new(64, 16)]);
        assert_eq!(flash.slice(Region::new(64, 11)), b"hello world");
        assert!(flash.slice(Region::new(75, 5)).iter().all(|&b| b == ERASED));
    }

    #[test]
    fn byte_granular_writes_directly() {
        let mut flash = fake::Flash::new(256, 1, 64);
        let mut sink = FlashSink::bind(&mut flash, Region::new(3, 100)).unwrap();
        sink.write(b"abc").unwrap();
        sink.write(b"defgh").unwrap();
        sink.flush().unwrap();
        drop(sink);
        assert_eq!(flash.programs, vec![Region::new(3, 3), Region::new(6, 5)]);
    }

    #[test]
    fn out_of_bounds() {
        let mut flash = fake::Flash::new(256, 4, 64);
        assert!(matches!(
            FlashSink::bind(&mut flash, Region::new(200, 100)),
            Err(Error::OutOfBounds)
        ));

        let mut sink = FlashSink::bind(&mut flash, Region::new(0, 8)).unwrap();
        assert_eq!(sink.write(&[0; 9]), Err(Error::OutOfBounds));
        sink.write(&[0; 8]).unwrap();
        assert_eq!(sink.write(&[0]), Err(Error::OutOfBounds));
        assert_eq!(sink.seek(8), Err(Error::OutOfBounds));
    }

    #[test]
    fn wide_write_size() {
        let mut flash = fake::Flash::new(256, 32, 64);
        assert!(matches!(
            FlashSink::bind(&mut flash, Region::new(0, 64)),
            Err(Error::Inval)
        ));
    }

    #[test]
    fn seek_commits_and_rewrites() {
        let mut flash = fake::Flash::new(256, 4, 64);
        let mut sink = FlashSink::bind(&mut flash, Region::new(0, 64)).unwrap();
        sink.write(b"xx").unwrap();
        sink.seek(16).unwrap();
        sink.write(b"yyyy").unwrap();
        sink.seek(2).unwrap();
        sink.write(b"zz").unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.used_storage().unwrap(), 20);
        drop(sink);

        assert_eq!(flash.slice(Region::new(0, 4)), b"xxzz");
        assert_eq!(flash.slice(Region::new(16, 4)), b"yyyy");
    }

    #[test]
    fn failed_program_reports_io() {
        let mut flash = fake::Flash::new(2048, 16, 256);
        flash.fail_program_at = Some(0);
        let mut sink = FlashSink::bind(&mut flash, Region::new(1000, 64)).unwrap();
        assert_eq!(sink.write(&[0x5a; 40]), Err(Error::Io));
        drop(sink);
        assert!(flash.programs.is_empty());
        assert!(flash.slice(Region::new(992, 64)).iter().all(|&b| b == ERASED));
    }

    #[test]
    fn failed_flush_reports_io() {
        let mut flash = fake::Flash::new(256, 16, 64);
        let mut sink = FlashSink::bind(&mut flash, Region::new(64, 64)).unwrap();
        sink.write(b"hello").unwrap();
        sink.flash.fail_program_at = Some(0);
        assert_eq!(sink.flush(), Err(Error::Io));
        drop(sink);
        assert!(flash.programs.is_empty());
        assert!(flash.slice(Region::new(64, 16)).iter().all(|&b| b == ERASED));
    }

    #[test]
    fn erase_window() {
        let mut flash = fake::Flash::new(256, 4, 64);
        flash.poke(64, &[0; 64]);
        let mut sink = FlashSink::bind(&mut flash, Region::new(64, 64)).unwrap();
        sink.erase().unwrap();
        sink.write(b"data").unwrap();
        drop(sink);
        assert_eq!(flash.erases, vec![Region::new(64, 64)]);

        let mut sink = FlashSink::bind(&mut flash, Region::new(60, 64)).unwrap();
        assert_eq!(sink.erase(), Err(Error::Inval));
    }
}
