// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Manifest storage.
//!
//! A [`Storage`] owns two areas of NVM: a run of equally-sized envelope
//! slots, each holding at most one severed envelope, and a small area
//! holding the update candidate record.
//!
//! Each slot is associated with a manifest class ID by the envelope stored
//! in it. Slots holding a class ID that is not currently supported are
//! considered free, and are erased by [`Storage::init()`].

use arrayvec::ArrayVec;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::cbor;
use crate::hardware::flash;
use crate::hardware::flash::Flash;
use crate::hardware::flash::FlashIo;
use crate::hardware::flash::Region;
use crate::io;
use crate::io::Read as _;
use crate::sink;
use crate::sink::FlashSink;
use crate::sink::Sink as _;

pub mod envelope;
pub mod update;

pub use update::Regions;
pub use update::MAX_UPDATE_REGIONS;

/// The length of a manifest class ID, in bytes.
pub const CLASS_ID_LEN: usize = 16;

/// A manifest class ID.
pub type ClassId = [u8; CLASS_ID_LEN];

/// The maximum number of class IDs a [`Storage`] can be told to support.
pub const MAX_SUPPORTED_CLASSES: usize = 8;

/// A [`Storage`] error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// An argument was malformed, unsupported or too large.
    Inval,
    /// No matching envelope, free slot or update candidate exists.
    NotFound,
    /// A fixed-capacity table is full.
    NoMem,
    /// An envelope or slot could not be decoded.
    Decode,
    /// The NVM device failed.
    Io,
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
            sink::Error::OutOfBounds | sink::Error::Inval => Error::Inval,
            _ => Error::Io,
        }
    }
}

impl From<cbor::Error> for Error {
    fn from(e: cbor::Error) -> Self {
        match e {
            cbor::Error::Io => Error::Io,
            _ => Error::Decode,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e {
            io::Error::BufferExhausted => Error::Decode,
            _ => Error::Io,
        }
    }
}

/// Where a [`Storage`] keeps its data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Layout {
    /// The envelope area, split evenly into `slot_count` slots.
    pub envelopes: Region,
    /// The number of envelope slots.
    pub slot_count: u32,
    /// The update candidate area.
    pub update: Region,
}

/// A manifest store.
pub struct Storage<F> {
    flash: F,
    layout: Layout,
    slot_len: u32,
    supported: ArrayVec<ClassId, MAX_SUPPORTED_CLASSES>,
}

impl<F: Flash> Storage<F> {
    /// Creates a new `Storage` over `flash`.
    ///
    /// Every slot and the update area must be made of whole erase blocks.
    /// No class IDs are supported until [`Storage::init()`] is called.
    pub fn new(flash: F, layout: Layout) -> Result<Self, Error> {
        check!(layout.slot_count > 0, Error::Inval);
        let slot_len = layout.envelopes.len / layout.slot_count;
        check!(slot_len > 0, Error::Inval);
        check!(update::RECORD_LEN <= layout.update.len, Error::Inval);

        let size = flash.size()?;
        for &area in &[layout.envelopes, layout.update] {
            check!(
                matches!(area.end(), Some(end) if end <= size),
                Error::Inval
            );
            let geometry = flash.geometry(area.ptr)?;
            check!(geometry.is_erase_aligned(area), Error::Inval);
        }
        let geometry = flash.geometry(layout.envelopes.ptr)?;
        check!(slot_len % geometry.erase_size == 0, Error::Inval);

        Ok(Self {
            flash,
            layout,
            slot_len,
            supported: ArrayVec::new(),
        })
    }

    /// Returns the underlying device, for reading stored envelopes.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Returns the layout this store was created with.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Sets the supported class IDs, erases every slot that holds some other
    /// class ID, and makes sure the update candidate record is readable.
    pub fn init(&mut self, supported: &[ClassId]) -> Result<(), Error> {
        check!(supported.len() <= MAX_SUPPORTED_CLASSES, Error::NoMem);
        self.supported.clear();
        self.supported.extend(supported.iter().copied());

        for i in 0..self.layout.slot_count {
            let slot = self.slot(i);
            let class_id = match self.read_class_id(slot) {
                Ok((_, id)) => id,
                Err(_) => continue,
            };
            if !self.is_supported(&class_id) {
                info!("erasing slot {} with unsupported class ID", i);
                self.flash.erase(slot)?;
            }
        }

        update::init(&mut self.flash, self.layout.update)
    }

    /// Stores the severed form of `envelope` as the manifest for `class_id`.
    ///
    /// The slot already holding `class_id` is overwritten; otherwise, the
    /// first free slot is used.
    pub fn install(
        &mut self,
        class_id: &ClassId,
        envelope: &[u8],
    ) -> Result<(), Error> {
        check!(self.is_supported(class_id), Error::Inval);
        let severed = envelope::Severed::decode(envelope)?;
        check!(severed.class_id == class_id, Error::Inval);

        let header = severed.slot_header()?;
        let index = self.find_slot(class_id)?;
        let slot = self.slot(index);
        check!(
            header.len as u64 + header.envelope_len as u64 <= slot.len as u64,
            Error::Inval
        );

        let mut sink = FlashSink::bind(&mut self.flash, slot)?;
        sink.erase()?;
        severed.write_to(&mut sink)?;
        sink.flush()?;
        info!(
            "installed {}-byte envelope into slot {}",
            header.envelope_len, index
        );
        Ok(())
    }

    /// Looks up the stored envelope for `class_id`.
    ///
    /// Returns the region holding the severed envelope, after checking that
    /// it still decodes and still carries `class_id`.
    pub fn get(&self, class_id: &ClassId) -> Result<Region, Error> {
        for i in 0..self.layout.slot_count {
            let slot = self.slot(i);
            let (header, stored) = match self.read_class_id(slot) {
                Ok(found) => found,
                Err(_) => continue,
            };
            if &stored != class_id {
                continue;
            }

            let envelope = slot
                .subregion(header.len, header.envelope_len)
                .ok_or(Error::NotFound)?;
            let mut r = FlashIo::new(&self.flash, envelope);
            if let Err(e) = envelope::validate(&mut r, &header, class_id) {
                warn!("envelope in slot {} failed to validate: {:?}", i, e);
                return Err(Error::NotFound);
            }
            return Ok(envelope);
        }

        info!("no envelope stored for class ID {:02x?}", class_id);
        Err(Error::NotFound)
    }

    /// Returns the current update candidate.
    pub fn update_get(&self) -> Result<Regions, Error> {
        update::get(&self.flash, self.layout.update)
    }

    /// Replaces the update candidate; an empty `regions` clears it.
    pub fn update_set(&mut self, regions: &[Region]) -> Result<(), Error> {
        update::set(&mut self.flash, self.layout.update, regions)
    }

    fn is_supported(&self, class_id: &ClassId) -> bool {
        self.supported.iter().any(|id| id == class_id)
    }

    fn slot(&self, index: u32) -> Region {
        Region::new(
            self.layout.envelopes.ptr.address + index * self.slot_len,
            self.slot_len,
        )
    }

    /// Decodes a slot header and reads the class ID it points to.
    fn read_class_id(
        &self,
        slot: Region,
    ) -> Result<(envelope::SlotHeader, ClassId), Error> {
        let mut r = FlashIo::new(&self.flash, slot);
        let header = envelope::SlotHeader::read(&mut r)?;
        r.skip(header.class_id_offset);
        let mut class_id = [0; CLASS_ID_LEN];
        r.read_bytes(&mut class_id)?;
        Ok((header, class_id))
    }

    /// Returns the slot holding `class_id`, or else the first free one.
    fn find_slot(&self, class_id: &ClassId) -> Result<u32, Error> {
        let mut free = None;
        for i in 0..self.layout.slot_count {
            match self.read_class_id(self.slot(i)) {
                Ok((_, id)) if &id == class_id => return Ok(i),
                Ok((_, id)) if self.is_supported(&id) => {}
                _ => {
                    free.get_or_insert(i);
                }
            }
        }
        match free {
            Some(i) => Ok(i),
            None => fail!(Error::NotFound, "no free envelope slot"),
        }
    }
}
