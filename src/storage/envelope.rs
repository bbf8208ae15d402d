// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Envelope slot encoding.
//!
//! An envelope slot holds a small CBOR map, followed immediately by the
//! severed envelope it describes:
//!
//! ```text
//! A3                      map(3)
//!    00 01                version: 1
//!    01 <uint>            class ID offset, within the envelope
//!    02 59 <u16>          envelope: bstr, always with a 2-byte length
//!       D8 6B             tag(107)
//!       A2                map(2)
//!          02 <bstr>      authentication wrapper
//!          03 <bstr>      manifest
//! ```
//!
//! Recording where the 16 class ID bytes live inside the envelope lets
//! lookups match slots without reparsing the manifest; the full envelope is
//! only reparsed once a slot matches.

use core::convert::TryInto as _;

use crate::cbor;
use crate::cbor::encode;
use crate::cbor::Arg;
use crate::cbor::Header;
use crate::cbor::Item;
use crate::cbor::Major;
use crate::io;
use crate::io::Read as _;
use crate::sink::Sink;
use crate::storage::ClassId;
use crate::storage::Error;
use crate::storage::CLASS_ID_LEN;

/// The envelope tag.
pub const ENVELOPE_TAG: u32 = 107;
/// Envelope key of the authentication wrapper.
pub const AUTH_KEY: u32 = 2;
/// Envelope key of the manifest.
pub const MANIFEST_KEY: u32 = 3;
/// Manifest key of the manifest component ID.
pub const COMPONENT_ID_KEY: u32 = 5;
/// First element of every manifest component ID this store accepts.
pub const COMPONENT_ID_TYPE: &str = "INSTLD_MFST";

/// The slot header format version.
pub const SLOT_VERSION: u32 = 1;

const SLOT_KEY_VERSION: u32 = 0;
const SLOT_KEY_CLASS_ID_OFFSET: u32 = 1;
const SLOT_KEY_ENVELOPE: u32 = 2;

/// `D8 6B A2`: the envelope tag plus its two-entry map header.
const ENVELOPE_PREFIX_LEN: u32 = 3;

/// Bounds nesting while skipping over manifest contents in NVM.
const MAX_DEPTH: u32 = 8;

/// The decoded header of an envelope slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SlotHeader {
    /// The offset of the class ID bytes, relative to the envelope start.
    pub class_id_offset: u32,
    /// The length of the envelope.
    pub envelope_len: u32,
    /// The encoded length of this header; the envelope starts right after.
    pub len: u32,
}

impl SlotHeader {
    /// Returns the encoded length of a header with the given class ID
    /// offset.
    pub fn encoded_len(class_id_offset: u32) -> u32 {
        // Map header, two single-byte pairs, the envelope key, and the
        // fixed-width envelope length.
        (1 + 2 + 1 + encode::header_len(class_id_offset) + 1 + 3) as u32
    }

    /// Writes this header to `w`.
    pub fn encode(&self, w: &mut impl io::Write) -> Result<(), Error> {
        check!(self.envelope_len <= 0xffff, Error::Inval);
        encode::map_header(w, 3)?;
        encode::uint(w, SLOT_KEY_VERSION)?;
        encode::uint(w, SLOT_VERSION)?;
        encode::uint(w, SLOT_KEY_CLASS_ID_OFFSET)?;
        encode::uint(w, self.class_id_offset)?;
        encode::uint(w, SLOT_KEY_ENVELOPE)?;
        encode::header_u16(w, Major::Bytes, self.envelope_len as u16)?;
        Ok(())
    }

    /// Reads a header from the start of a slot.
    ///
    /// This only checks that the header is well-formed; the envelope itself
    /// is not touched.
    pub fn read<R: io::Read>(r: &mut R) -> Result<Self, Error> {
        let start = r.remaining_data();
        let map = Header::read(r)?;
        check!(
            map.major == Major::Map && map.arg == Arg::Value(3),
            Error::Decode
        );

        let mut next_uint = || -> Result<u32, Error> {
            let h = Header::read(r)?;
            check!(h.major == Major::Uint, Error::Decode);
            Ok(h.value()?)
        };
        check!(next_uint()? == SLOT_KEY_VERSION, Error::Decode);
        check!(next_uint()? == SLOT_VERSION, Error::Decode);
        check!(next_uint()? == SLOT_KEY_CLASS_ID_OFFSET, Error::Decode);
        let class_id_offset = next_uint()?;
        check!(next_uint()? == SLOT_KEY_ENVELOPE, Error::Decode);

        let bstr = Header::read(r)?;
        check!(bstr.major == Major::Bytes, Error::Decode);
        let envelope_len = bstr.value()?;
        check!(envelope_len as usize <= r.remaining_data(), Error::Decode);

        let class_id_end = class_id_offset.checked_add(CLASS_ID_LEN as u32);
        check!(
            class_id_offset >= 1
                && matches!(class_id_end, Some(end) if end <= envelope_len),
            Error::Decode
        );

        Ok(Self {
            class_id_offset,
            envelope_len,
            len: (start - r.remaining_data()) as u32,
        })
    }
}

/// A parsed envelope, reduced to the parts that get stored.
#[derive(Copy, Clone, Debug)]
pub struct Severed<'a> {
    /// The authentication wrapper bytes.
    pub auth: &'a [u8],
    /// The manifest bytes.
    pub manifest: &'a [u8],
    /// The manifest's class ID.
    pub class_id: &'a ClassId,
    // Offset of `class_id` within `manifest`.
    class_id_pos: u32,
}

impl<'a> Severed<'a> {
    /// Parses an envelope, dropping everything but the authentication
    /// wrapper and the manifest.
    ///
    /// The envelope tag is optional; integrated payloads and any other
    /// envelope members are ignored.
    pub fn decode(envelope: &'a [u8]) -> Result<Self, Error> {
        let input = untrusted::Input::from(envelope);
        let parsed = input.read_all(cbor::Error::BadEncoding, |r| {
            let item = Item::parse(r)?;
            let map = match item {
                Item::Tag(..) => item.into_tagged(ENVELOPE_TAG)?,
                _ => item,
            };
            map.into_map()?.walk(|w| {
                let auth = w.must_get(AUTH_KEY)?.into_bytes()?;
                let manifest = w.must_get(MANIFEST_KEY)?.into_bytes()?;
                Ok((auth, manifest))
            })
        });
        let (auth, manifest) = match parsed {
            Ok(parts) => parts,
            Err(e) => return fail!(Error::Decode, "bad envelope: {:?}", e),
        };

        let class_id = match decode_class_id(manifest) {
            Ok(id) => id,
            Err(e) => return fail!(Error::Decode, "bad manifest: {:?}", e),
        };
        let class_id_pos = match cbor::subslice_offset(manifest, class_id) {
            Some(pos) => pos as u32,
            None => return fail!(Error::Decode),
        };
        let class_id: &ClassId = match class_id.try_into() {
            Ok(id) => id,
            Err(_) => return fail!(Error::Decode),
        };

        Ok(Self {
            auth,
            manifest,
            class_id,
            class_id_pos,
        })
    }

    fn auth_kv_len(&self) -> Result<u32, Error> {
        kv_header_len(AUTH_KEY, self.auth.len())
    }

    fn manifest_kv_len(&self) -> Result<u32, Error> {
        kv_header_len(MANIFEST_KEY, self.manifest.len())
    }

    /// Returns the length of the stored (severed) envelope.
    pub fn encoded_len(&self) -> Result<u32, Error> {
        let len = ENVELOPE_PREFIX_LEN
            + self.auth_kv_len()?
            + self.auth.len() as u32
            + self.manifest_kv_len()?
            + self.manifest.len() as u32;
        check!(len <= 0xffff, Error::Inval);
        Ok(len)
    }

    /// Returns where the class ID bytes land in the stored envelope.
    pub fn class_id_offset(&self) -> Result<u32, Error> {
        Ok(ENVELOPE_PREFIX_LEN
            + self.auth_kv_len()?
            + self.auth.len() as u32
            + self.manifest_kv_len()?
            + self.class_id_pos)
    }

    /// Returns the slot header describing this envelope.
    pub fn slot_header(&self) -> Result<SlotHeader, Error> {
        let class_id_offset = self.class_id_offset()?;
        Ok(SlotHeader {
            class_id_offset,
            envelope_len: self.encoded_len()?,
            len: SlotHeader::encoded_len(class_id_offset),
        })
    }

    /// Writes the slot header and the severed envelope to `sink`.
    pub fn write_to(&self, sink: &mut dyn Sink) -> Result<(), Error> {
        let mut buf = [0; 32];
        let cap = buf.len();

        let header = self.slot_header()?;
        let mut w = &mut buf[..];
        header.encode(&mut w)?;
        encode::tag(&mut w, ENVELOPE_TAG)?;
        encode::map_header(&mut w, 2)?;
        encode::uint(&mut w, AUTH_KEY)?;
        encode::bytes_header(&mut w, self.auth.len() as u32)?;
        let used = cap - w.len();
        sink.write(&buf[..used])?;
        sink.write(self.auth)?;

        let mut w = &mut buf[..];
        encode::uint(&mut w, MANIFEST_KEY)?;
        encode::bytes_header(&mut w, self.manifest.len() as u32)?;
        let used = cap - w.len();
        sink.write(&buf[..used])?;
        sink.write(self.manifest)?;
        Ok(())
    }
}

/// Returns the encoded length of an integer key followed by a byte string
/// header.
fn kv_header_len(key: u32, bstr_len: usize) -> Result<u32, Error> {
    check!(key <= 0xffff && bstr_len <= 0xffff, Error::Inval);
    Ok((encode::header_len(key) + encode::header_len(bstr_len as u32)) as u32)
}

/// Finds the class ID in a manifest's component ID.
fn decode_class_id(manifest: &[u8]) -> Result<&[u8], cbor::Error> {
    untrusted::Input::from(manifest).read_all(cbor::Error::BadEncoding, |r| {
        Item::parse(r)?.into_map()?.walk(|w| {
            let component = w.must_get(COMPONENT_ID_KEY)?.into_array()?;
            if component.len() != 2 {
                return Err(cbor::Error::BadEncoding);
            }

            let mut index = 0;
            let mut class_id = None;
            component.with(|elem| {
                match index {
                    0 => {
                        let kind = elem.read_all(|r| Item::parse(r)?.into_utf8())?;
                        if kind != COMPONENT_ID_TYPE {
                            return Err(cbor::Error::BadEncoding);
                        }
                    }
                    _ => class_id = Some(elem.into_bytes()?),
                }
                index += 1;
                Ok(())
            })?;

            match class_id {
                Some(id) if id.len() == CLASS_ID_LEN => Ok(id),
                _ => Err(cbor::Error::BadEncoding),
            }
        })
    })
}

/// Re-validates a stored envelope, read from `r`, against its slot header.
///
/// `r` must be positioned at the start of the envelope. The envelope must
/// have the stored shape exactly, and the class ID recorded in the slot
/// header must be the one in the manifest's component ID.
pub fn validate<R: io::Read>(
    r: &mut R,
    header: &SlotHeader,
    class_id: &ClassId,
) -> Result<(), Error> {
    let total = r.remaining_data();
    let pos = |r: &R| (total - r.remaining_data()) as u32;

    let tag = Header::read(r)?;
    check!(
        tag.major == Major::Tag && tag.arg == Arg::Value(ENVELOPE_TAG),
        Error::Decode
    );
    let map = Header::read(r)?;
    check!(
        map.major == Major::Map && map.arg == Arg::Value(2),
        Error::Decode
    );

    check!(read_uint(r)? == AUTH_KEY, Error::Decode);
    let auth_len = read_bytes_header(r)?;
    skip(r, auth_len)?;

    check!(read_uint(r)? == MANIFEST_KEY, Error::Decode);
    let manifest_len = read_bytes_header(r)?;
    let manifest_start = pos(r);
    check!(
        manifest_start + manifest_len == header.envelope_len,
        Error::Decode
    );

    let manifest = Header::read(r)?;
    check!(manifest.major == Major::Map, Error::Decode);
    let mut found = false;
    for _ in 0..manifest.value()? {
        let key = read_uint(r)?;
        if key != COMPONENT_ID_KEY {
            skip_item(r, MAX_DEPTH)?;
            continue;
        }

        let array = Header::read(r)?;
        check!(
            array.major == Major::Array && array.arg == Arg::Value(2),
            Error::Decode
        );
        let wrapper_len = read_bytes_header(r)?;
        let kind = Header::read(r)?;
        check!(
            kind.major == Major::Utf8
                && kind.arg == Arg::Value(COMPONENT_ID_TYPE.len() as u32)
                && kind.len + COMPONENT_ID_TYPE.len() as u32 == wrapper_len,
            Error::Decode
        );
        let mut kind = [0; COMPONENT_ID_TYPE.len()];
        r.read_bytes(&mut kind)?;
        check!(kind == COMPONENT_ID_TYPE.as_bytes(), Error::Decode);

        check!(
            read_bytes_header(r)? == CLASS_ID_LEN as u32,
            Error::Decode
        );
        check!(pos(r) == header.class_id_offset, Error::Decode);
        let mut stored = [0; CLASS_ID_LEN];
        r.read_bytes(&mut stored)?;
        check!(&stored == class_id, Error::Decode);
        found = true;
    }
    check!(found, Error::Decode);
    check!(pos(r) == header.envelope_len, Error::Decode);
    Ok(())
}

fn read_uint<R: io::Read>(r: &mut R) -> Result<u32, Error> {
    let h = Header::read(r)?;
    check!(h.major == Major::Uint, Error::Decode);
    Ok(h.value()?)
}

fn read_bytes_header<R: io::Read>(r: &mut R) -> Result<u32, Error> {
    let h = Header::read(r)?;
    check!(h.major == Major::Bytes, Error::Decode);
    let len = h.value()?;
    check!(len as usize <= r.remaining_data(), Error::Decode);
    Ok(len)
}

fn skip<R: io::Read>(r: &mut R, mut len: u32) -> Result<(), Error> {
    let mut buf = [0; 32];
    while len > 0 {
        let n = (len as usize).min(buf.len());
        r.read_bytes(&mut buf[..n])?;
        len -= n as u32;
    }
    Ok(())
}

/// Skips one complete data item.
fn skip_item<R: io::Read>(r: &mut R, depth: u32) -> Result<(), Error> {
    check!(depth > 0, Error::Decode);
    let h = Header::read(r)?;
    match (h.major, h.arg) {
        (Major::Uint, Arg::Value(_)) | (Major::Nint, Arg::Value(_)) => Ok(()),
        (Major::Bytes, Arg::Value(n)) | (Major::Utf8, Arg::Value(n)) => {
            skip(r, n)
        }
        (Major::Array, Arg::Value(n)) => {
            for _ in 0..n {
                skip_item(r, depth - 1)?;
            }
            Ok(())
        }
        (Major::Map, Arg::Value(n)) => {
            for _ in 0..n {
                skip_item(r, depth - 1)?;
                skip_item(r, depth - 1)?;
            }
            Ok(())
        }
        (Major::Tag, Arg::Value(_)) => skip_item(r, depth - 1),
        // Simple values and floats carry their payload in the argument.
        (Major::Simple, Arg::Value(_)) => Ok(()),
        _ => fail!(Error::Decode),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use pretty_assertions::assert_eq;
    use testutil::data::suit;

    const CLASS_ID: ClassId = *b"0123456789abcdef";

    #[test]
    fn slot_header_round_trip() {
        let header = SlotHeader {
            class_id_offset: 300,
            envelope_len: 1000,
            len: SlotHeader::encoded_len(300),
        };
        let mut buf = [0xff; 32];
        let mut w = &mut buf[..];
        header.encode(&mut w).unwrap();
        let written = 32 - w.len();
        assert_eq!(written as u32, header.len);
        assert_eq!(
            &buf[..written],
            &[0xa3, 0x00, 0x01, 0x01, 0x19, 0x01, 0x2c, 0x02, 0x59, 0x03, 0xe8]
        );

        // The header length check needs the envelope to actually be there.
        let mut slot = vec![0; written + 1000];
        slot[..written].copy_from_slice(&buf[..written]);
        let mut r = &slot[..];
        assert_eq!(SlotHeader::read(&mut r).unwrap(), header);
    }

    #[test]
    fn slot_header_rejects_bad_offsets() {
        for &offset in &[0u32, 990] {
            let raw = raw_cbor!(5 [
                0:0 0:1,
                0:1 0:(offset as u64),
                0:2 2@2:1000,
            ]);
            let mut slot = raw.clone();
            slot.resize(raw.len() + 1000, 0);
            let mut r = &slot[..];
            assert_eq!(SlotHeader::read(&mut r), Err(Error::Decode));
        }
    }

    #[test]
    fn slot_header_rejects_erased() {
        let slot = [0xff; 64];
        let mut r = &slot[..];
        assert_eq!(SlotHeader::read(&mut r), Err(Error::Decode));
    }

    #[test]
    fn sever_and_validate() {
        let envelope = suit::envelope(&CLASS_ID, b"signature", &[0xaa; 300]);
        let severed = Severed::decode(&envelope).unwrap();
        assert_eq!(severed.class_id, &CLASS_ID);
        assert_eq!(severed.auth, suit::auth(b"signature").as_slice());

        let mut sink = crate::sink::fake::Sink::new();
        severed.write_to(&mut sink).unwrap();
        let header = severed.slot_header().unwrap();

        let mut r = &sink.data[..];
        let decoded = SlotHeader::read(&mut r).unwrap();
        assert_eq!(decoded, header);
        let offset = decoded.class_id_offset as usize;
        assert_eq!(&r[offset..offset + CLASS_ID_LEN], &CLASS_ID);
        assert_eq!(r.len() as u32, decoded.envelope_len);

        validate(&mut r, &decoded, &CLASS_ID).unwrap();

        // The stored envelope is itself a valid envelope, minus the
        // integrated payload.
        let stored = &sink.data[header.len as usize..];
        let reparsed = Severed::decode(stored).unwrap();
        assert_eq!(reparsed.auth, severed.auth);
        assert_eq!(reparsed.manifest, severed.manifest);
        assert!(stored.len() < envelope.len());
    }

    #[test]
    fn validate_rejects_wrong_class() {
        let envelope = suit::envelope(&CLASS_ID, b"sig", &[]);
        let severed = Severed::decode(&envelope).unwrap();
        let mut sink = crate::sink::fake::Sink::new();
        severed.write_to(&mut sink).unwrap();

        let mut r = &sink.data[..];
        let header = SlotHeader::read(&mut r).unwrap();
        assert_eq!(
            validate(&mut r, &header, b"fedcba9876543210"),
            Err(Error::Decode)
        );
    }

    #[test]
    fn bad_component_id() {
        let manifest = raw_cbor!(5 [
            0:1 0:1,
            0:5 4 [ 2 { 3 { "OTHER" } }, 2 { h"00112233445566778899aabbccddeeff" }, ],
        ]);
        let envelope = raw_cbor!(6:107 5 [
            0:2 2 { "auth" },
            0:3 2 { manifest },
        ]);
        assert_eq!(Severed::decode(&envelope).err(), Some(Error::Decode));

        let short = raw_cbor!(5 [
            0:5 4 [ 2 { 3 { "INSTLD_MFST" } }, 2 { h"0011" }, ],
        ]);
        assert!(decode_class_id(&short).is_err());
    }

    #[test]
    fn oversized_envelope() {
        let envelope = suit::envelope(&CLASS_ID, b"sig", &[0; 0x10000]);
        let severed = Severed::decode(&envelope).unwrap();
        assert!(severed.encoded_len().unwrap() < 0x100);
        let big = suit::envelope_with_manifest_padding(&CLASS_ID, 0x10000);
        let severed = Severed::decode(&big).unwrap();
        assert_eq!(severed.encoded_len(), Err(Error::Inval));
    }
}
