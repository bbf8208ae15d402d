// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! A [`Sink`] that fills a single cache entry.

use crate::cache::partition;
use crate::cache::Error;
use crate::cache::Slot;
use crate::hardware::flash::Flash;
use crate::hardware::flash::Region;
use crate::sink;
use crate::sink::FlashSink;
use crate::sink::Sink;

/// A [`Sink`] over the payload of a freshly allocated cache entry.
///
/// The entry only becomes visible once [`CacheSink::commit()`] is called.
/// Releasing or dropping the sink beforehand cancels the entry.
pub struct CacheSink<'c, F: Flash> {
    inner: Option<(FlashSink<&'c mut F>, Slot)>,
}

impl<'c, F: Flash> CacheSink<'c, F> {
    pub(crate) fn new(flash: &'c mut F, slot: Slot) -> Result<Self, Error> {
        let sink = FlashSink::bind(flash, slot.payload_region())?;
        Ok(Self {
            inner: Some((sink, slot)),
        })
    }

    /// Finishes the entry, returning where its payload ended up.
    ///
    /// The payload length is the furthest byte written.
    pub fn commit(mut self) -> Result<Region, Error> {
        let (mut sink, slot) = match self.inner.take() {
            Some(inner) => inner,
            None => return fail!(Error::IncorrectState),
        };
        sink.flush()?;
        let len = sink.used_storage()?;
        let payload = Region::new(sink.window().ptr.address, len);
        partition::close(sink.into_flash(), &slot, len)?;
        Ok(payload)
    }

    fn cancel(&mut self) -> Result<(), Error> {
        match self.inner.take() {
            Some((sink, slot)) => partition::cancel(sink.into_flash(), &slot),
            None => Ok(()),
        }
    }

    fn inner(&mut self) -> Result<&mut FlashSink<&'c mut F>, sink::Error> {
        match &mut self.inner {
            Some((sink, _)) => Ok(sink),
            None => Err(sink::Error::IncorrectState),
        }
    }
}

impl<F: Flash> Sink for CacheSink<'_, F> {
    fn write(&mut self, buf: &[u8]) -> Result<(), sink::Error> {
        self.inner()?.write(buf)
    }

    fn seek(&mut self, offset: u32) -> Result<(), sink::Error> {
        self.inner()?.seek(offset)
    }

    fn flush(&mut self) -> Result<(), sink::Error> {
        self.inner()?.flush()
    }

    fn used_storage(&self) -> Result<u32, sink::Error> {
        match &self.inner {
            Some((sink, _)) => sink.used_storage(),
            None => Err(sink::Error::IncorrectState),
        }
    }

    fn release(&mut self) -> Result<(), sink::Error> {
        check!(self.inner.is_some(), sink::Error::IncorrectState);
        self.cancel().map_err(|_| sink::Error::Io)
    }
}

impl<F: Flash> Drop for CacheSink<'_, F> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            info!("cancelling uncommitted cache entry");
        }
        if let Err(e) = self.cancel() {
            error!("failed to cancel cache entry: {:?}", e);
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use crate::cache::Cache;
    use crate::cache::Error;
    use crate::hardware::fake;
    use crate::hardware::flash::Region;
    use crate::sink;
    use crate::sink::Sink as _;

    fn cache() -> Cache<fake::Flash> {
        let flash = fake::Flash::new(0x2000, 8, 0x200);
        let mut cache = Cache::new(flash, Region::new(0, 0x1000)).unwrap();
        cache.register(7, Region::new(0x1000, 0x1000)).unwrap();
        cache.init(None).unwrap();
        cache
    }

    #[test]
    fn commit_in_chunks() {
        let mut cache = cache();
        let data: Vec<u8> = (0..300).map(|i| i as u8).collect();

        let mut sink = cache.create_sink(7, b"img.bin").unwrap();
        for chunk in data.chunks(7) {
            sink.write(chunk).unwrap();
        }
        let payload = sink.commit().unwrap();

        assert_eq!(cache.search(b"img.bin"), Ok(payload));
        assert_eq!(cache.flash().slice(payload), &data[..]);
    }

    #[test]
    fn seek_and_rewrite() {
        let mut cache = cache();
        let mut sink = cache.create_sink(7, b"s").unwrap();
        sink.seek(16).unwrap();
        sink.write(b"tail").unwrap();
        sink.seek(0).unwrap();
        sink.write(b"head").unwrap();
        let payload = sink.commit().unwrap();

        assert_eq!(payload.len, 20);
        let bytes = cache.flash().slice(payload);
        assert_eq!(&bytes[..4], b"head");
        assert_eq!(&bytes[16..], b"tail");
    }

    #[test]
    fn dropped_sink_cancels() {
        let mut cache = cache();
        let mut sink = cache.create_sink(7, b"gone").unwrap();
        sink.write(&[0x42; 64]).unwrap();
        drop(sink);

        assert_eq!(cache.search(b"gone"), Err(Error::NotFound));
        let sink = cache.create_sink(7, b"gone").unwrap();
        assert_eq!(sink.commit().unwrap().len, 0);
    }

    #[test]
    fn released_sink_rejects_use() {
        let mut cache = cache();
        let mut sink = cache.create_sink(7, b"r").unwrap();
        sink.write(b"abc").unwrap();
        sink.release().unwrap();

        assert_eq!(sink.write(b"d"), Err(sink::Error::IncorrectState));
        assert_eq!(sink.release(), Err(sink::Error::IncorrectState));
        assert_eq!(sink.commit(), Err(Error::IncorrectState));
        assert_eq!(cache.search(b"r"), Err(Error::NotFound));
    }

    #[test]
    fn overflow_is_out_of_bounds() {
        let mut cache = cache();
        let mut sink = cache.create_sink(7, b"o").unwrap();
        let room = 0x1000 - 1 - 2 - 5 - 1;
        assert_eq!(
            sink.write(&vec![0; room + 1]),
            Err(sink::Error::OutOfBounds)
        );
        sink.write(&vec![0; room]).unwrap();
        assert_eq!(sink.commit().unwrap().len, room as u32);
    }
}
