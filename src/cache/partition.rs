// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Raw cache partition layout.
//!
//! A partition is an indefinite-length CBOR map from URIs to payloads:
//!
//! ```text
//! BF                          map(*)
//!    6x <uri>                 tstr: URI
//!    5A <u32 BE> <payload>    bstr: payload, with a fixed-width length
//!    ...
//! FF                          break
//! ```
//!
//! New entries are appended over the break byte. An entry's length starts
//! out as `FF FF FF FF` and is patched once the payload is complete, after
//! which a new break byte is written behind it. Until then, the entry does
//! not decode, so the map effectively ends right before it.
//!
//! Everything past the break is expected to be erased.

use crate::cache::Error;
use crate::cbor;
use crate::cbor::encode;
use crate::cbor::Header;
use crate::cbor::Major;
use crate::hardware::flash::Flash;
use crate::hardware::flash::FlashExt as _;
use crate::hardware::flash::FlashIo;
use crate::hardware::flash::Geometry;
use crate::hardware::flash::Ptr;
use crate::hardware::flash::Region;
use crate::hardware::flash::ERASED;
use crate::sink::FlashSink;
use crate::sink::Sink as _;

/// The contents of a freshly formatted partition: an empty, open map.
pub const EMPTY_MAP: [u8; 2] = [cbor::MAP_INDEFINITE, cbor::BREAK];

/// The largest erase block that entries can be dropped from.
pub const MAX_SWAP_LEN: usize = 4096;

/// Erase blocks above this size make dropping entries expensive.
const SWAP_WARN_LEN: u32 = 128;

/// The length placeholder of an unfinished entry.
const LEN_PLACEHOLDER: u32 = 0xffff_ffff;

/// A partition's location and erase granularity.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// The partition ID.
    pub id: u8,
    /// Where the partition lives.
    pub region: Region,
    /// The programming geometry of the device underneath.
    pub geometry: Geometry,
}

/// An entry that was allocated in a partition but not yet closed.
///
/// A `Slot` must be finished with either [`Cache::close_slot()`] or
/// [`Cache::drop_slot()`].
///
/// [`Cache::close_slot()`]: crate::cache::Cache::close_slot
/// [`Cache::drop_slot()`]: crate::cache::Cache::drop_slot
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an open slot blocks its partition until closed or dropped"]
pub struct Slot {
    pub(crate) partition: Partition,
    /// Absolute address of the entry.
    pub(crate) offset: u32,
    /// Offset of the length field, relative to `offset`.
    pub(crate) size_offset: u32,
    /// Offset of the payload, relative to `offset`.
    pub(crate) data_offset: u32,
}

impl Slot {
    /// Returns the ID of the partition this slot lives in.
    pub fn partition_id(&self) -> u8 {
        self.partition.id
    }

    /// Returns the region payload bytes may be written to.
    ///
    /// The last byte of the partition is kept back for the break byte.
    pub fn payload_region(&self) -> Region {
        let start = self.offset + self.data_offset;
        let end = self.partition.region.ptr.address + self.partition.region.len;
        Region::new(start, end.saturating_sub(start + 1))
    }
}

/// A closed entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Where the URI bytes are.
    pub key: Region,
    /// Where the payload bytes are.
    pub payload: Region,
}

/// Iterates the closed entries of a partition.
///
/// Iteration ends at the first thing that does not decode as an entry,
/// which is normally the break byte.
pub struct Entries<'f, F: ?Sized> {
    flash: &'f F,
    region: Region,
    /// Offset right past the last entry decoded; `None` once exhausted.
    next: Option<u32>,
    end: u32,
}

impl<'f, F: Flash + ?Sized> Entries<'f, F> {
    /// Starts iterating `region`.
    pub fn new(flash: &'f F, region: Region) -> Self {
        let header = FlashIo::new(flash, region).peek();
        let is_map = header == Ok(cbor::MAP_INDEFINITE);
        Self {
            flash,
            region,
            next: if is_map { Some(1) } else { None },
            end: if is_map { 1 } else { 0 },
        }
    }

    /// Returns whether the partition starts with a map header at all.
    pub fn is_map(&self) -> bool {
        self.end != 0
    }

    /// Returns the offset, relative to the partition, right past the last
    /// entry returned.
    pub fn position(&self) -> u32 {
        self.end
    }

    fn decode(&self, at: u32) -> Option<(Entry, u32)> {
        let mut io = FlashIo::new(self.flash, self.region);
        io.skip(at);

        let key = Header::read(&mut io).ok()?;
        if key.major != Major::Utf8 {
            return None;
        }
        let key_len = key.value().ok()?;
        let key = self.region.subregion(io.position(), key_len)?;
        io.skip(key_len);

        let value = Header::read(&mut io).ok()?;
        if value.major != Major::Bytes {
            return None;
        }
        let value_len = value.value().ok()?;
        let payload = self.region.subregion(io.position(), value_len)?;
        io.skip(value_len);
        Some((Entry { key, payload }, io.position()))
    }
}

impl<F: Flash + ?Sized> Iterator for Entries<'_, F> {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        let at = self.next.take()?;
        let (entry, end) = self.decode(at)?;
        self.next = Some(end);
        self.end = end;
        Some(entry)
    }
}

/// Returns whether the bytes at `key` are exactly `uri`.
pub fn key_matches<F: Flash + ?Sized>(
    flash: &F,
    key: Region,
    uri: &[u8],
) -> Result<bool, Error> {
    if key.len as usize != uri.len() {
        return Ok(false);
    }
    let mut buf = [0; 32];
    for (i, chunk) in uri.chunks(buf.len()).enumerate() {
        let at = key.ptr.address + (i * buf.len()) as u32;
        let buf = &mut buf[..chunk.len()];
        flash.read(Ptr::new(at), buf)?;
        if buf != chunk {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Looks for `uri` in a partition.
pub fn search<F: Flash + ?Sized>(
    flash: &F,
    region: Region,
    uri: &[u8],
) -> Result<Option<Region>, Error> {
    for entry in Entries::new(flash, region) {
        if key_matches(flash, entry.key, uri)? {
            return Ok(Some(entry.payload));
        }
    }
    Ok(None)
}

/// Returns whether `region` already holds an open map.
pub fn is_formatted<F: Flash + ?Sized>(flash: &F, region: Region) -> bool {
    let mut entries = Entries::new(flash, region);
    if !entries.is_map() {
        return false;
    }
    if entries.next().is_some() {
        return true;
    }
    let mut byte = [0];
    let at = region.ptr.address + entries.position();
    flash.read(Ptr::new(at), &mut byte).is_ok() && byte[0] == cbor::BREAK
}

/// Programs `bytes` at `addr`, regardless of write granularity.
fn write_at<F: Flash + ?Sized>(
    flash: &mut F,
    addr: u32,
    bytes: &[u8],
) -> Result<(), Error> {
    let mut sink = FlashSink::bind(flash, Region::new(addr, bytes.len() as u32))?;
    sink.write(bytes)?;
    sink.flush()?;
    Ok(())
}

/// Erases a partition from `addr` onwards, preserving whatever precedes
/// `addr` in its erase block.
fn clear_from<F: Flash + ?Sized>(
    flash: &mut F,
    part: &Partition,
    addr: u32,
) -> Result<(), Error> {
    let eb = part.geometry.erase_size;
    check!(eb != 0 && eb as usize <= MAX_SWAP_LEN, Error::Io);
    if eb > SWAP_WARN_LEN {
        warn!("dropping cache entries with a {}-byte swap buffer", eb);
    }

    let end = part.region.ptr.address + part.region.len;
    let block = part.geometry.erase_floor(addr);
    let lead = (addr - block) as usize;
    let mut swap = [ERASED; MAX_SWAP_LEN];
    flash.read(Ptr::new(block), &mut swap[..lead])?;

    let mut cursor = block;
    while cursor < end {
        let region = Region::new(cursor, eb);
        if !flash.is_erased(region)? {
            flash.erase(region)?;
        }
        cursor += eb;
    }

    if lead > 0 {
        write_at(flash, block, &swap[..lead])?;
    }
    Ok(())
}

/// Writes an empty map over the entire partition.
pub fn format<F: Flash + ?Sized>(
    flash: &mut F,
    part: &Partition,
) -> Result<(), Error> {
    clear_from(flash, part, part.region.ptr.address)?;
    write_at(flash, part.region.ptr.address, &EMPTY_MAP)
}

/// Cancels whatever starts at `addr`, turning it into the end of the map.
pub fn drop_at<F: Flash + ?Sized>(
    flash: &mut F,
    part: &Partition,
    addr: u32,
) -> Result<(), Error> {
    clear_from(flash, part, addr)?;
    write_at(flash, addr, &[cbor::BREAK])
}

/// Finds where the next entry goes, recovering from an entry that was left
/// unfinished.
///
/// Returns the offset of the free space, relative to the partition.
pub fn free_offset<F: Flash + ?Sized>(
    flash: &mut F,
    part: &Partition,
) -> Result<u32, Error> {
    let mut recovered = false;
    loop {
        let mut entries = Entries::new(&*flash, part.region);
        if !entries.is_map() {
            return fail!(
                Error::Crash,
                "cache partition {} has no map header; it must be formatted",
                part.id
            );
        }
        for _ in &mut entries {}
        let offset = entries.position();
        if offset >= part.region.len {
            return Ok(offset);
        }

        let mut byte = [0];
        let addr = part.region.ptr.address + offset;
        flash.read(Ptr::new(addr), &mut byte)?;
        if byte[0] == cbor::BREAK {
            return Ok(offset);
        }

        if recovered {
            return fail!(
                Error::Crash,
                "cache partition {} is corrupt past offset {}; it must be formatted",
                part.id,
                offset
            );
        }
        warn!(
            "dropping unfinished entry in cache partition {} at offset {}",
            part.id, offset
        );
        drop_at(flash, part, addr)?;
        recovered = true;
    }
}

/// Allocates a new entry for `uri` at the end of the partition.
///
/// The caller is responsible for rejecting duplicate URIs.
pub fn create<F: Flash + ?Sized>(
    flash: &mut F,
    part: &Partition,
    uri: &[u8],
) -> Result<Slot, Error> {
    let free = free_offset(flash, part)?;

    let mut header = [0; 10];
    let cap = header.len();
    let mut w = &mut header[..];
    encode::text_header(&mut w, uri.len() as u32).map_err(|_| Error::Inval)?;
    let text_len = cap - w.len();
    let mut w = &mut header[text_len..];
    encode::header_u32(&mut w, Major::Bytes, LEN_PLACEHOLDER)
        .map_err(|_| Error::Inval)?;

    let size_offset = (text_len + uri.len() + 1) as u32;
    let data_offset = size_offset + 4;
    // Room for the header and the break byte.
    let needed = data_offset as u64 + 1;
    check!(
        needed <= part.region.len.saturating_sub(free) as u64,
        Error::NoMem
    );

    let offset = part.region.ptr.address + free;
    let window = Region::new(offset, data_offset);
    let mut sink = FlashSink::bind(&mut *flash, window)?;
    sink.write(&header[..text_len])?;
    sink.write(uri)?;
    sink.write(&header[text_len..text_len + 5])?;
    sink.flush()?;

    Ok(Slot {
        partition: *part,
        offset,
        size_offset,
        data_offset,
    })
}

/// Finishes an entry whose payload is `len` bytes long.
pub fn close<F: Flash + ?Sized>(
    flash: &mut F,
    slot: &Slot,
    len: u32,
) -> Result<(), Error> {
    check!(len <= slot.payload_region().len, Error::Inval);
    write_at(flash, slot.offset + slot.size_offset, &len.to_be_bytes())?;
    write_at(flash, slot.offset + slot.data_offset + len, &[cbor::BREAK])
}

/// Cancels an entry, erasing everything from its start onwards.
pub fn cancel<F: Flash + ?Sized>(flash: &mut F, slot: &Slot) -> Result<(), Error> {
    drop_at(flash, &slot.partition, slot.offset)
}
