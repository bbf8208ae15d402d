// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The update candidate record.
//!
//! The record is a fixed-size structure at the start of its own NVM region.
//! It is only ever rewritten wholesale, by erasing the region and writing the
//! new record in one go; on the next boot, the magic value alone decides
//! whether the region list is meaningful.

use arrayvec::ArrayVec;

use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::hardware::flash::Flash;
use crate::hardware::flash::FlashExt as _;
use crate::hardware::flash::Region;
use crate::sink::FlashSink;
use crate::sink::Sink as _;
use crate::storage::Error;

/// The maximum number of regions an update candidate may list.
pub const MAX_UPDATE_REGIONS: usize = 5;

/// An update candidate is present.
pub const MAGIC_AVAILABLE: u32 = 0x55aa55aa;
/// The record was explicitly cleared.
pub const MAGIC_CLEARED: u32 = 0xaaaa5555;
/// The record area has never been written.
pub const MAGIC_EMPTY: u32 = 0xffffffff;

/// The list of regions making up an update candidate.
pub type Regions = ArrayVec<Region, MAX_UPDATE_REGIONS>;

/// The on-NVM layout of the update candidate record.
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
#[repr(C)]
pub(crate) struct Record {
    magic: u32,
    len: u32,
    regions: [Region; MAX_UPDATE_REGIONS],
}

impl Record {
    fn cleared() -> Self {
        Self {
            magic: MAGIC_CLEARED,
            ..Self::default()
        }
    }

    /// Returns whether this record can be interpreted at all, regardless of
    /// whether it holds a candidate.
    fn is_well_formed(&self) -> bool {
        match self.magic {
            MAGIC_EMPTY => true,
            MAGIC_AVAILABLE | MAGIC_CLEARED => {
                self.len as usize <= MAX_UPDATE_REGIONS
            }
            _ => false,
        }
    }
}

/// The size of the record, in bytes.
pub(crate) const RECORD_LEN: u32 = core::mem::size_of::<Record>() as u32;

/// Reads the update candidate from `area`.
///
/// Fails with [`Error::NotFound`] unless a candidate with at least one
/// region was set.
pub(crate) fn get<F: Flash + ?Sized>(
    flash: &F,
    area: Region,
) -> Result<Regions, Error> {
    let record = flash.read_object::<Record>(area.ptr)?;
    if record.magic != MAGIC_AVAILABLE
        || record.len == 0
        || record.len as usize > MAX_UPDATE_REGIONS
        || record.regions[0].len == 0
    {
        info!("no update candidate (magic {:#010x})", record.magic);
        return Err(Error::NotFound);
    }

    Ok(record.regions[..record.len as usize].iter().copied().collect())
}

/// Replaces the update candidate in `area` with `regions`.
///
/// An empty `regions` clears the candidate. The old record is left alone if
/// `regions` is rejected.
pub(crate) fn set<F: Flash>(
    flash: F,
    area: Region,
    regions: &[Region],
) -> Result<(), Error> {
    check!(regions.len() <= MAX_UPDATE_REGIONS, Error::NoMem);
    for r in regions {
        check!(r.len != 0 && r.end().is_some(), Error::Inval);
    }

    let mut record = Record::cleared();
    if !regions.is_empty() {
        record.magic = MAGIC_AVAILABLE;
        record.len = regions.len() as u32;
        record.regions[..regions.len()].copy_from_slice(regions);
    }
    write(flash, area, &record)
}

/// Makes sure `area` holds an interpretable record, reformatting it as
/// cleared otherwise.
pub(crate) fn init<F: Flash>(flash: F, area: Region) -> Result<(), Error> {
    let record = flash.read_object::<Record>(area.ptr)?;
    if record.is_well_formed() {
        return Ok(());
    }
    warn!(
        "reformatting update candidate record (magic {:#010x}, {} regions)",
        record.magic, record.len
    );
    write(flash, area, &Record::cleared())
}

fn write<F: Flash>(flash: F, area: Region, record: &Record) -> Result<(), Error> {
    let mut sink = FlashSink::bind(flash, area)?;
    sink.erase()?;
    sink.write(record.as_bytes())?;
    sink.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::hardware::fake;
    use crate::hardware::flash::FlashExt as _;
    use crate::hardware::flash::Ptr;

    const AREA: Region = Region::new(0x400, 0x100);

    fn flash() -> fake::Flash {
        fake::Flash::new(0x800, 4, 0x100)
    }

    #[test]
    fn round_trip() {
        let mut flash = flash();
        let all: Vec<Region> = (0..MAX_UPDATE_REGIONS as u32)
            .map(|i| Region::new(0x1000 * (i + 1), 0x10 + i))
            .collect();
        for n in &[1, MAX_UPDATE_REGIONS] {
            set(&mut flash, AREA, &all[..*n]).unwrap();
            assert_eq!(get(&flash, AREA).unwrap().as_slice(), &all[..*n]);
        }
    }

    #[test]
    fn clear_is_idempotent() {
        let mut flash = flash();
        set(&mut flash, AREA, &[Region::new(0x1000, 4)]).unwrap();
        set(&mut flash, AREA, &[]).unwrap();
        set(&mut flash, AREA, &[]).unwrap();
        assert_eq!(get(&flash, AREA), Err(Error::NotFound));

        let record = flash.read_object::<Record>(AREA.ptr).unwrap();
        assert_eq!(record.magic, MAGIC_CLEARED);
        assert_eq!(record.len, 0);
    }

    #[test]
    fn too_many_regions() {
        let mut flash = flash();
        let first = [Region::new(0x1000, 4)];
        set(&mut flash, AREA, &first).unwrap();
        flash.reset_stats();

        let many = [Region::new(0x1000, 4); MAX_UPDATE_REGIONS + 1];
        assert_eq!(set(&mut flash, AREA, &many), Err(Error::NoMem));
        assert!(flash.erases.is_empty());
        assert_eq!(get(&flash, AREA).unwrap().as_slice(), &first);
    }

    #[test]
    fn degenerate_regions() {
        let mut flash = flash();
        assert_eq!(
            set(&mut flash, AREA, &[Region::new(0x1000, 0)]),
            Err(Error::Inval)
        );
        assert_eq!(
            set(&mut flash, AREA, &[Region::new(u32::MAX, 2)]),
            Err(Error::Inval)
        );
    }

    #[test]
    fn empty_area_has_no_candidate() {
        let mut flash = flash();
        assert_eq!(get(&flash, AREA), Err(Error::NotFound));
        init(&mut flash, AREA).unwrap();
        // An erased record is well-formed, so nothing is written.
        assert!(flash.erases.is_empty());
    }

    #[test]
    fn init_reformats_garbage() {
        let mut flash = flash();
        flash.poke(AREA.ptr.address, &[0x12, 0x34, 0x56, 0x78]);
        init(&mut flash, AREA).unwrap();
        assert_eq!(flash.erases, vec![AREA]);
        let record = flash.read_object::<Record>(Ptr::new(0x400)).unwrap();
        assert_eq!(record.magic, MAGIC_CLEARED);

        // A stale candidate is kept as-is.
        set(&mut flash, AREA, &[Region::new(0x1000, 4)]).unwrap();
        flash.reset_stats();
        init(&mut flash, AREA).unwrap();
        assert!(flash.erases.is_empty());
        assert_eq!(get(&flash, AREA).unwrap().len(), 1);
    }
}
