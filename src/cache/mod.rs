// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The payload cache.
//!
//! A [`Cache`] manages a small set of NVM partitions, each holding an
//! indefinite-length CBOR map from URIs to payloads. Entries are only ever
//! appended or cut off at the end, so a partition is parseable no matter
//! when power is lost.
//!
//! Partition 0 is special: it is not registered, but carved out of whatever
//! space the DFU staging region has left behind the candidate envelope. Its
//! extent is only known once [`Cache::init()`] is called.

use arrayvec::ArrayVec;

use crate::hardware::flash;
use crate::hardware::flash::Flash;
use crate::hardware::flash::FlashExt as _;
use crate::hardware::flash::Region;
use crate::io;
use crate::sink;
use crate::sink::FlashSink;
use crate::sink::Sink as _;

mod partition;
mod entry_sink;

pub use partition::Partition;
pub use partition::Slot;
pub use partition::MAX_SWAP_LEN;
pub use entry_sink::CacheSink;

/// The maximum number of partitions, including partition 0.
pub const MAX_PARTITIONS: usize = 4;

/// A [`Cache`] error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// An argument was malformed, or a partition is misaligned.
    Inval,
    /// No entry or partition matches.
    NotFound,
    /// An entry for the URI already exists.
    Exists,
    /// The partition has no room left.
    NoMem,
    /// The NVM device failed.
    Io,
    /// The partition table is full.
    NoResources,
    /// The partition is corrupt and must be formatted with
    /// [`Cache::format()`].
    Crash,
    /// A [`CacheSink`] was used after being committed or released.
    IncorrectState,
}

impl From<flash::Error> for Error {
    fn from(e: flash::Error) -> Self {
        match e {
            flash::Error::OutOfRange | flash::Error::Misaligned => Error::Inval,
            _ => Error::Io,
        }
    }
}

impl From<sink::Error> for Error {
    fn from(e: sink::Error) -> Self {
        match e {
            sink::Error::OutOfBounds => Error::NoMem,
            sink::Error::Inval => Error::Inval,
            sink::Error::NoResources => Error::NoResources,
            sink::Error::IncorrectState => Error::IncorrectState,
            _ => Error::Io,
        }
    }
}

impl From<io::Error> for Error {
    fn from(_: io::Error) -> Self {
        Error::Io
    }
}

/// The result of [`Cache::find_or_create()`].
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup {
    /// The URI was already cached; this is its payload.
    Found(Region),
    /// The URI was not cached; a new entry was allocated for it.
    Created(Slot),
}

/// Strips the NUL terminator C-style callers tend to leave on URIs.
pub(crate) fn trim_uri(uri: &[u8]) -> &[u8] {
    match uri.split_last() {
        Some((0, rest)) => rest,
        _ => uri,
    }
}

/// A payload cache.
pub struct Cache<F> {
    flash: F,
    dfu: Region,
    partitions: ArrayVec<Partition, MAX_PARTITIONS>,
}

impl<F: Flash> Cache<F> {
    /// Creates a new `Cache` whose partition 0 lives in the DFU staging
    /// region `dfu`.
    ///
    /// `dfu` must end on an erase-block boundary. Partition 0 stays empty
    /// until [`Cache::init()`] is called.
    pub fn new(flash: F, dfu: Region) -> Result<Self, Error> {
        let end = match dfu.end() {
            Some(end) if end <= flash.size()? => end,
            _ => return fail!(Error::Inval),
        };
        let geometry = flash.geometry(dfu.ptr)?;
        let erase_size = geometry.erase_size;
        check!(erase_size != 0 && end % erase_size == 0, Error::Inval);

        let mut partitions = ArrayVec::new();
        partitions.push(Partition {
            id: 0,
            region: Region::new(end, 0),
            geometry,
        });
        Ok(Self {
            flash,
            dfu,
            partitions,
        })
    }

    /// Returns the underlying device, for reading cached payloads.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Returns all partitions, partition 0 first.
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Adds a statically-sized partition.
    ///
    /// The partition must end on an erase-block boundary and be large
    /// enough for an empty map. It is not touched until [`Cache::init()`].
    pub fn register(&mut self, id: u8, region: Region) -> Result<(), Error> {
        check!(id != 0, Error::Inval);
        check!(self.partition(id).is_err(), Error::Exists);
        let end = match region.end() {
            Some(end) if end <= self.flash.size()? => end,
            _ => return fail!(Error::Inval),
        };
        check!(
            region.len as usize > partition::EMPTY_MAP.len(),
            Error::NoMem
        );
        let geometry = self.flash.geometry(region.ptr)?;
        let erase_size = geometry.erase_size;
        check!(erase_size != 0 && end % erase_size == 0, Error::Inval);
        let dfu_overlap = region.ptr.address < self.dfu.end().unwrap_or(0)
            && end > self.dfu.ptr.address;
        check!(!dfu_overlap, Error::Inval);

        let partition = Partition {
            id,
            region,
            geometry,
        };
        match self.partitions.try_push(partition) {
            Ok(()) => Ok(()),
            Err(_) => fail!(Error::NoResources),
        }
    }

    /// Sizes partition 0 to whatever follows `envelope` in the DFU region,
    /// and makes sure every partition holds a well-formed map.
    ///
    /// With no `envelope`, or none that leaves room behind it, partition 0
    /// is empty.
    pub fn init(&mut self, envelope: Option<Region>) -> Result<(), Error> {
        let dfu_end = self.dfu.ptr.address + self.dfu.len;
        let start = match envelope {
            Some(env) if env.len != 0 => {
                check!(self.dfu.contains(env), Error::Inval);
                env.ptr.address + env.len
            }
            _ => dfu_end,
        };
        let region = Region::new(start, dfu_end - start);
        if region.len as usize <= partition::EMPTY_MAP.len() {
            warn!("no room for cache partition 0 in the DFU region");
            self.partitions[0].region = Region::new(dfu_end, 0);
        } else {
            self.partitions[0].region = region;
        }

        for i in 0..self.partitions.len() {
            let part = self.partitions[i];
            if part.region.len == 0 {
                continue;
            }
            if self.flash.is_erased(part.region)? {
                info!("formatting erased cache partition {}", part.id);
                let mut sink = FlashSink::bind(&mut self.flash, part.region)?;
                sink.write(&partition::EMPTY_MAP)?;
                sink.flush()?;
            } else if !partition::is_formatted(&self.flash, part.region) {
                warn!("cache partition {} is corrupt; formatting", part.id);
                partition::format(&mut self.flash, &part)?;
            }
        }
        Ok(())
    }

    /// Erases every entry in a partition.
    pub fn format(&mut self, id: u8) -> Result<(), Error> {
        let part = self.partition(id)?;
        check!(part.region.len != 0, Error::NoMem);
        partition::format(&mut self.flash, &part)
    }

    /// Looks for `uri` in every partition, returning its payload.
    ///
    /// A miss is [`Error::NotFound`], and is not considered a failure.
    pub fn search(&self, uri: &[u8]) -> Result<Region, Error> {
        let uri = trim_uri(uri);
        for part in &self.partitions {
            if part.region.len == 0 {
                continue;
            }
            if let Some(payload) =
                partition::search(&self.flash, part.region, uri)?
            {
                return Ok(payload);
            }
        }
        trace!("cache miss");
        Err(Error::NotFound)
    }

    /// Allocates a new entry for `uri` at the end of partition `id`.
    ///
    /// Fails with [`Error::Exists`], without touching NVM, if any partition
    /// already holds `uri`. An entry left unfinished by an earlier run is
    /// dropped first.
    pub fn create_slot(&mut self, id: u8, uri: &[u8]) -> Result<Slot, Error> {
        let uri = trim_uri(uri);
        check!(!uri.is_empty(), Error::Inval);
        let part = self.partition(id)?;
        check!(part.region.len != 0, Error::NoMem);

        match self.search(uri) {
            Ok(_) => return fail!(Error::Exists),
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }
        partition::create(&mut self.flash, &part, uri)
    }

    /// Finishes `slot`, whose payload is `len` bytes long.
    ///
    /// The length is patched in first, then a new end-of-map marker is
    /// written right behind the payload.
    pub fn close_slot(&mut self, slot: Slot, len: u32) -> Result<(), Error> {
        partition::close(&mut self.flash, &slot, len)
    }

    /// Cancels `slot`, leaving its partition as if it had never been
    /// allocated.
    pub fn drop_slot(&mut self, slot: Slot) -> Result<(), Error> {
        partition::cancel(&mut self.flash, &slot)
    }

    /// Looks for `uri`, allocating a new entry in partition `id` if it is
    /// missing.
    pub fn find_or_create(
        &mut self,
        id: u8,
        uri: &[u8],
    ) -> Result<Lookup, Error> {
        match self.search(uri) {
            Ok(payload) => return Ok(Lookup::Found(payload)),
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }
        self.create_slot(id, uri).map(Lookup::Created)
    }

    /// Allocates a new entry for `uri` and returns a sink for filling it.
    ///
    /// See [`CacheSink`].
    pub fn create_sink(
        &mut self,
        id: u8,
        uri: &[u8],
    ) -> Result<CacheSink<'_, F>, Error> {
        let slot = self.create_slot(id, uri)?;
        CacheSink::new(&mut self.flash, slot)
    }

    fn partition(&self, id: u8) -> Result<Partition, Error> {
        match self.partitions.iter().find(|p| p.id == id) {
            Some(p) => Ok(*p),
            None => Err(Error::NotFound),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::hardware::fake;
    use crate::hardware::flash::Geometry;
    use crate::hardware::flash::Ptr;
    use crate::sink::Sink as _;

    const DFU: Region = Region::new(0, 0x2000);
    const PART: Region = Region::new(0x2000, 0x1000);

    fn cache() -> Cache<fake::Flash> {
        let flash = fake::Flash::new(0x4000, 4, 0x400);
        let mut cache = Cache::new(flash, DFU).unwrap();
        cache.register(1, PART).unwrap();
        cache.init(Some(Region::new(0x100, 0x80))).unwrap();
        cache
    }

    fn put(cache: &mut Cache<fake::Flash>, uri: &[u8], data: &[u8]) -> Region {
        let mut sink = cache.create_sink(1, uri).unwrap();
        sink.write(data).unwrap();
        sink.commit().unwrap()
    }

    #[test]
    fn init_layout() {
        let cache = cache();
        assert_eq!(cache.partitions()[0].region, Region::new(0x180, 0x1e80));
        let empty = [0xbf, 0xff, 0xff];
        assert_eq!(cache.flash().slice(Region::new(0x180, 3)), empty);
        assert_eq!(cache.flash().slice(Region::new(0x2000, 3)), empty);
    }

    #[test]
    fn append_after_closed_entry() {
        let mut cache = cache();
        let data: Vec<u8> = (0..100).collect();

        let slot = cache.create_slot(1, b"a.bin").unwrap();
        assert_eq!(slot.payload_region().ptr, Ptr::new(0x2000 + 1 + 6 + 5));
        let mut sink = FlashSink::bind(
            &mut cache.flash,
            Region::new(slot.payload_region().ptr.address, 100),
        )
        .unwrap();
        sink.write(&data).unwrap();
        sink.flush().unwrap();
        drop(sink);
        cache.close_slot(slot, 100).unwrap();

        let found = cache.search(b"a.bin\0").unwrap();
        assert_eq!(found, Region::new(0x200c, 100));
        assert_eq!(cache.flash().slice(found), &data[..]);

        let slot = cache.create_slot(1, b"b.bin").unwrap();
        assert_eq!(slot.offset, 0x200c + 100);
        cache.drop_slot(slot).unwrap();
    }

    #[test]
    fn duplicate_uri() {
        let mut cache = cache();
        put(&mut cache, b"fw.bin", b"payload");
        cache.flash.reset_stats();

        assert_eq!(cache.create_slot(1, b"fw.bin"), Err(Error::Exists));
        assert_eq!(cache.create_slot(0, b"fw.bin\0"), Err(Error::Exists));
        assert!(cache.flash().programs.is_empty());
        assert!(cache.flash().erases.is_empty());
    }

    #[test]
    fn drop_then_create() {
        let mut cache = cache();
        put(&mut cache, b"keep", &[0x11; 40]);

        let slot = cache.create_slot(1, b"x").unwrap();
        let offset = slot.offset;
        cache.drop_slot(slot).unwrap();
        assert_eq!(cache.search(b"x"), Err(Error::NotFound));
        let keep = cache.search(b"keep").unwrap();
        assert_eq!(cache.flash().slice(keep), &[0x11; 40][..]);

        let slot = cache.create_slot(1, b"x").unwrap();
        assert_eq!(slot.offset, offset);
        cache.close_slot(slot, 0).unwrap();
        assert_eq!(cache.search(b"x").unwrap().len, 0);
    }

    #[test]
    fn recovers_unfinished_entry() {
        let mut cache = cache();
        put(&mut cache, b"keep", b"kept");

        // Simulate a power cut mid-payload.
        let slot = cache.create_slot(1, b"partial").unwrap();
        let offset = slot.offset;
        let payload = slot.payload_region();
        let mut sink = FlashSink::bind(&mut cache.flash, payload).unwrap();
        sink.write(&[0; 10]).unwrap();
        sink.flush().unwrap();
        drop(sink);

        assert_eq!(cache.search(b"partial"), Err(Error::NotFound));
        let slot = cache.create_slot(1, b"next").unwrap();
        assert_eq!(slot.offset, offset);
        cache.close_slot(slot, 0).unwrap();
        let keep = cache.search(b"keep").unwrap();
        assert_eq!(cache.flash().slice(keep), b"kept");
        assert_eq!(cache.flash().slice(Region::new(0x2000, 1)), [0xbf]);
    }

    /// A device whose erases silently do nothing.
    struct StuckErase(fake::Flash);

    impl Flash for StuckErase {
        fn size(&self) -> Result<u32, flash::Error> {
            self.0.size()
        }
        fn geometry(&self, at: Ptr) -> Result<Geometry, flash::Error> {
            self.0.geometry(at)
        }
        fn read(&self, at: Ptr, out: &mut [u8]) -> Result<(), flash::Error> {
            self.0.read(at, out)
        }
        fn program(&mut self, at: Ptr, buf: &[u8]) -> Result<(), flash::Error> {
            self.0.program(at, buf)
        }
        fn erase(&mut self, _: Region) -> Result<(), flash::Error> {
            Ok(())
        }
    }

    #[test]
    fn repeated_garbage_is_a_crash() {
        let mut flash = fake::Flash::new(0x4000, 4, 0x400);
        flash.poke(0x2000, &[0xbf, 0x61, b'a', 0x41, 0x00, 0x13, 0x37]);
        let mut cache = Cache::new(StuckErase(flash), DFU).unwrap();
        cache.register(1, PART).unwrap();

        assert_eq!(cache.create_slot(1, b"b"), Err(Error::Crash));
        assert_eq!(cache.search(b"a").unwrap(), Region::new(0x2004, 1));
    }

    #[test]
    fn format_recovers_crash() {
        let mut cache = cache();
        cache.flash.poke(0x2000, &[0x00]);
        assert_eq!(cache.create_slot(1, b"b"), Err(Error::Crash));

        cache.format(1).unwrap();
        let slot = cache.create_slot(1, b"b").unwrap();
        assert_eq!(slot.offset, 0x2001);
        cache.drop_slot(slot).unwrap();
    }

    #[test]
    fn init_keeps_and_repairs() {
        let mut cache = cache();
        put(&mut cache, b"keep", b"kept");
        cache.flash.reset_stats();
        cache.init(Some(Region::new(0x100, 0x80))).unwrap();
        assert!(cache.flash().erases.is_empty());
        assert!(cache.search(b"keep").is_ok());

        cache.flash.poke(0x2000, &[0x12, 0x34]);
        cache.init(Some(Region::new(0x100, 0x80))).unwrap();
        let empty = [0xbf, 0xff, 0xff];
        assert_eq!(cache.flash().slice(Region::new(0x2000, 3)), empty);
        assert_eq!(cache.search(b"keep"), Err(Error::NotFound));
    }

    #[test]
    fn init_preserves_envelope_tail() {
        let mut flash = fake::Flash::new(0x4000, 4, 0x400);
        flash.poke(0x100, &[0xab; 0x80]);
        flash.poke(0x180, &[0x00; 4]);
        let mut cache = Cache::new(flash, DFU).unwrap();
        cache.init(Some(Region::new(0x100, 0x80))).unwrap();

        let envelope = cache.flash().slice(Region::new(0x100, 0x80));
        assert_eq!(envelope, &[0xab; 0x80][..]);
        assert_eq!(cache.flash().slice(Region::new(0x180, 2)), [0xbf, 0xff]);
    }

    #[test]
    fn partition_zero_without_room() {
        let mut cache = cache();
        cache.init(Some(Region::new(0x1000, 0xfff))).unwrap();
        assert_eq!(cache.partitions()[0].region.len, 0);
        assert_eq!(cache.create_slot(0, b"x"), Err(Error::NoMem));

        cache.init(None).unwrap();
        assert_eq!(cache.partitions()[0].region.len, 0);

        assert_eq!(
            cache.init(Some(Region::new(0x1f00, 0x200))),
            Err(Error::Inval)
        );
    }

    #[test]
    fn registration() {
        let mut cache = cache();
        let mut reg = |id, ptr, len| cache.register(id, Region::new(ptr, len));
        assert_eq!(reg(1, 0x3000, 0x400), Err(Error::Exists));
        assert_eq!(reg(0, 0x3000, 0x400), Err(Error::Inval));
        assert_eq!(reg(2, 0x3000, 0x3ff), Err(Error::Inval));
        // Overlaps the DFU region.
        assert_eq!(reg(2, 0x1c00, 0x800), Err(Error::Inval));
        assert_eq!(reg(2, 0x3ffe, 2), Err(Error::NoMem));
        drop(reg);
        cache.register(2, Region::new(0x3000, 0x400)).unwrap();
        cache.register(3, Region::new(0x3400, 0x400)).unwrap();
        assert_eq!(
            cache.register(4, Region::new(0x3800, 0x400)),
            Err(Error::NoResources)
        );
    }

    #[test]
    fn partition_full() {
        let mut cache = cache();
        let slot = cache.create_slot(1, b"big").unwrap();
        let room = slot.payload_region().len;
        assert_eq!(room, 0x1000 - 1 - 4 - 5 - 1);
        cache.close_slot(slot, room).unwrap();

        // The break byte takes up the last byte of the partition.
        assert_eq!(cache.search(b"big").unwrap().len, room);
        assert_eq!(cache.create_slot(1, b"more"), Err(Error::NoMem));
    }

    #[test]
    fn close_past_end() {
        let mut cache = cache();
        let slot = cache.create_slot(1, b"x").unwrap();
        let room = slot.payload_region().len;
        assert_eq!(cache.close_slot(slot, room + 1), Err(Error::Inval));
    }

    #[test]
    fn find_or_create() {
        let mut cache = cache();
        let payload = put(&mut cache, b"a", b"abc");
        assert_eq!(cache.find_or_create(1, b"a"), Ok(Lookup::Found(payload)));

        let slot = match cache.find_or_create(1, b"b").unwrap() {
            Lookup::Created(slot) => slot,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(slot.partition_id(), 1);
        cache.drop_slot(slot).unwrap();
    }

    #[test]
    fn failed_create_leaves_no_entry() {
        let mut cache = cache();
        cache.flash.fail_program_at = Some(0);
        assert_eq!(cache.create_slot(1, b"a"), Err(Error::Io));
        assert_eq!(cache.search(b"a"), Err(Error::NotFound));
        assert!(cache.flash().programs.is_empty());

        let slot = cache.create_slot(1, b"a").unwrap();
        assert_eq!(slot.offset, 0x2001);
        cache.close_slot(slot, 0).unwrap();
        assert_eq!(cache.search(b"a").unwrap().len, 0);
    }

    #[test]
    fn failed_close_is_recovered() {
        let mut cache = cache();
        let slot = cache.create_slot(1, b"a").unwrap();
        let offset = slot.offset;
        cache.flash.fail_program_at = Some(0);
        assert_eq!(cache.close_slot(slot, 0), Err(Error::Io));
        assert_eq!(cache.search(b"a"), Err(Error::NotFound));

        // The unfinished entry is dropped by the next allocation.
        let slot = cache.create_slot(1, b"b").unwrap();
        assert_eq!(slot.offset, offset);
        cache.close_slot(slot, 0).unwrap();
        assert_eq!(cache.search(b"a"), Err(Error::NotFound));
        assert!(cache.search(b"b").is_ok());
    }

    #[test]
    fn oversized_erase_block() {
        let flash = fake::Flash::new(0x4000, 4, 0x2000);
        let mut cache = Cache::new(flash, DFU).unwrap();
        cache.init(Some(Region::new(0x100, 0x80))).unwrap();
        let slot = cache.create_slot(0, b"x").unwrap();
        assert_eq!(cache.drop_slot(slot), Err(Error::Io));
    }
}
