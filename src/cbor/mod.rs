// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! CBOR parsing and encoding.
//!
//! This is not a complete CBOR implementation; it covers what is needed to
//! read severed envelopes and to walk the keyed maps that this crate lays out
//! in NVM. Concisely:
//! - No floats, bools, null, or undefined.
//! - Tags are surfaced as [`Item::Tag`] and must be explicitly unwrapped.
//! - Indefinite-length maps are accepted, since cache partitions are laid out
//!   as one; all other indefinite-length items are rejected.
//! - Non-minimal argument encodings are accepted, because both the envelope
//!   slot header and cache entries deliberately use fixed-width lengths so
//!   that they can be patched in place.
//! - Arguments wider than 32 bits are rejected.
//!
//! Two decoders are provided. [`Item`] walks a buffer that is already in
//! memory, on top of [`untrusted`]. [`Header::read()`] decodes one item header
//! from any [`io::Read`], which is how NVM-resident structures are scanned
//! without copying them out.
//!
//! See: https://datatracker.ietf.org/doc/html/rfc8949

use core::cmp::Ord;
use core::cmp::Ordering;
use core::cmp::PartialOrd;

use crate::io;

pub mod encode;

#[cfg(test)]
#[macro_use]
pub(crate) mod macros;

/// The initial byte of an indefinite-length map.
pub const MAP_INDEFINITE: u8 = 0xbf;

/// The "break" byte that terminates an indefinite-length item.
pub const BREAK: u8 = 0xff;

/// A CBOR decoding error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The input ended before the item was complete.
    Truncated,
    /// The input is not CBOR this module understands, or does not have the
    /// expected shape.
    BadEncoding,
    /// The underlying reader failed.
    Io,
}

impl From<untrusted::EndOfInput> for Error {
    fn from(_: untrusted::EndOfInput) -> Self {
        Error::Truncated
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e {
            io::Error::BufferExhausted => Error::Truncated,
            _ => Error::Io,
        }
    }
}

/// A CBOR major type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Major {
    /// Major type 0.
    Uint,
    /// Major type 1.
    Nint,
    /// Major type 2.
    Bytes,
    /// Major type 3.
    Utf8,
    /// Major type 4.
    Array,
    /// Major type 5.
    Map,
    /// Major type 6.
    Tag,
    /// Major type 7.
    Simple,
}

impl Major {
    fn from_initial(initial: u8) -> Self {
        match initial >> 5 {
            0 => Major::Uint,
            1 => Major::Nint,
            2 => Major::Bytes,
            3 => Major::Utf8,
            4 => Major::Array,
            5 => Major::Map,
            6 => Major::Tag,
            _ => Major::Simple,
        }
    }

    /// Returns the major type bits, shifted into place in an initial byte.
    pub fn bits(self) -> u8 {
        let n = match self {
            Major::Uint => 0,
            Major::Nint => 1,
            Major::Bytes => 2,
            Major::Utf8 => 3,
            Major::Array => 4,
            Major::Map => 5,
            Major::Tag => 6,
            Major::Simple => 7,
        };
        n << 5
    }
}

/// The argument of an item header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Arg {
    /// A definite value: an integer, a length, or a tag number.
    Value(u32),
    /// Additional information 31: indefinite length, or "break" for
    /// [`Major::Simple`].
    Indefinite,
}

/// A decoded item header: a major type plus its argument.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// The major type.
    pub major: Major,
    /// The argument.
    pub arg: Arg,
    /// The encoded length of this header, in bytes.
    pub len: u32,
}

impl Header {
    /// Decodes a header from `initial` plus however many argument bytes
    /// `next` provides.
    fn decode(
        initial: u8,
        mut next: impl FnMut(&mut [u8]) -> Result<(), Error>,
    ) -> Result<Self, Error> {
        let major = Major::from_initial(initial);
        let (arg, len) = match initial & 0b00011111 {
            b @ 0..=23 => (Arg::Value(b as u32), 1),
            24 => {
                let mut b = [0; 1];
                next(&mut b)?;
                (Arg::Value(b[0] as u32), 2)
            }
            25 => {
                let mut b = [0; 2];
                next(&mut b)?;
                (Arg::Value(u16::from_be_bytes(b) as u32), 3)
            }
            26 => {
                let mut b = [0; 4];
                next(&mut b)?;
                (Arg::Value(u32::from_be_bytes(b)), 5)
            }
            // Only maps may be indefinite; a lone 0xff is a break.
            31 if major == Major::Map || major == Major::Simple => {
                (Arg::Indefinite, 1)
            }
            // 27 is 64-bit arguments, which we don't handle;
            // 28-30 are reserved.
            _ => return Err(Error::BadEncoding),
        };
        Ok(Self { major, arg, len })
    }

    /// Reads a single header from `r`.
    pub fn read(r: &mut impl io::Read) -> Result<Self, Error> {
        let initial = r.read_be::<u8>()?;
        Self::decode(initial, |out| Ok(r.read_bytes(out)?))
    }

    /// Returns whether this header is the "break" marker.
    pub fn is_break(&self) -> bool {
        self.major == Major::Simple && self.arg == Arg::Indefinite
    }

    /// Returns the definite argument, or fails if there is none.
    pub fn value(&self) -> Result<u32, Error> {
        match self.arg {
            Arg::Value(v) => Ok(v),
            Arg::Indefinite => Err(Error::BadEncoding),
        }
    }
}

/// Returns the offset of `inner` within `outer`, if `inner` is a subslice of
/// it.
pub fn subslice_offset(outer: &[u8], inner: &[u8]) -> Option<usize> {
    let start = outer.as_ptr() as usize;
    let inner_start = inner.as_ptr() as usize;
    let offset = inner_start.checked_sub(start)?;
    if offset.checked_add(inner.len())? <= outer.len() {
        Some(offset)
    } else {
        None
    }
}

/// A CBOR 33-bit integer.
///
/// CBOR integers are a weird sign-and-magnitude thing where they map onto
/// N+1-bit integers.
// When the bool part is `false`, the value is just the `u32` part; when it's
// `true`, the value is `-n-1`, where n is the `u32` part.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Int(bool, u32);

impl Int {
    /// Creates a non-negative `Int`.
    pub const fn from_u32(n: u32) -> Self {
        Int(false, n)
    }

    /// Returns the value of this integer, if it is non-negative.
    pub fn as_u32(self) -> Option<u32> {
        match self {
            Int(false, n) => Some(n),
            _ => None,
        }
    }
}

impl From<u32> for Int {
    fn from(n: u32) -> Self {
        Int::from_u32(n)
    }
}

/// A scalar value, e.g., one which does not require recursing into the
/// parser.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Scalar<'input> {
    /// An integer.
    Int(Int),
    /// A byte string.
    Bytes(&'input [u8]),
    /// A text string.
    Utf8(&'input str),
}

impl PartialOrd for Scalar<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// NOTE: This needs to be implemented manually, since Rust defines slice
// equality such that "aa" > "z", even though "z" < "aa" in deterministic
// CBOR.
impl Ord for Scalar<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        use Scalar::*;
        match (self, other) {
            (Int(a), Int(b)) => Ord::cmp(a, b),
            (Int(_), _) => Ordering::Less,
            (_, Int(_)) => Ordering::Greater,

            (Utf8(a), Utf8(b)) => {
                Ord::cmp(&a.len(), &b.len()).then_with(|| Ord::cmp(a, b))
            }
            (Utf8(_), _) => Ordering::Less,
            (_, Utf8(_)) => Ordering::Greater,

            (Bytes(a), Bytes(b)) => {
                Ord::cmp(&a.len(), &b.len()).then_with(|| Ord::cmp(a, b))
            }
        }
    }
}

impl From<Int> for Scalar<'_> {
    fn from(i: Int) -> Self {
        Self::Int(i)
    }
}

impl From<u32> for Scalar<'_> {
    fn from(n: u32) -> Self {
        Self::Int(n.into())
    }
}

/// A CBOR item, which can be a [`Scalar`], an [`Array`], a [`Map`], or a
/// tag wrapping another item.
#[must_use = "parsing will not be driven to completion without consuming \
this value"]
pub enum Item<'input, 'reader> {
    /// A scalar.
    Scalar(Scalar<'input>),
    /// An array; its elements have not been parsed yet.
    Array(Array<'input, 'reader>),
    /// A map; its entries have not been parsed yet.
    Map(Map<'input, 'reader>),
    /// A tag number, followed by the (unparsed) tagged item.
    Tag(u32, Tagged<'input, 'reader>),
}

impl<'i, 'r> Item<'i, 'r> {
    /// Parses a single CBOR item.
    pub fn parse(buf: &'r mut untrusted::Reader<'i>) -> Result<Self, Error> {
        let initial = buf.read_byte()?;
        let header = Header::decode(initial, |out| {
            let bytes = buf.read_bytes(out.len())?.as_slice_less_safe();
            out.copy_from_slice(bytes);
            Ok(())
        })?;

        let len = match header.arg {
            Arg::Value(n) => Some(n),
            Arg::Indefinite => None,
        };
        match (header.major, len) {
            (Major::Uint, Some(n)) => Ok(Item::Scalar(Scalar::Int(Int(false, n)))),
            (Major::Nint, Some(n)) => Ok(Item::Scalar(Scalar::Int(Int(true, n)))),
            (Major::Bytes, Some(n)) => Ok(Item::Scalar(Scalar::Bytes(
                buf.read_bytes(n as usize)?.as_slice_less_safe(),
            ))),
            (Major::Utf8, Some(n)) => {
                let bytes = buf.read_bytes(n as usize)?.as_slice_less_safe();
                Ok(Item::Scalar(Scalar::Utf8(
                    core::str::from_utf8(bytes)
                        .map_err(|_| Error::BadEncoding)?,
                )))
            }
            (Major::Array, Some(n)) => Ok(Item::Array(Array { buf, len: n })),
            (Major::Map, len) => Ok(Item::Map(Map {
                buf,
                len,
                prev_key: None,
                current_key: None,
            })),
            (Major::Tag, Some(n)) => Ok(Item::Tag(n, Tagged { buf })),
            _ => Err(Error::BadEncoding),
        }
    }

    /// Folds this item into an [`Int`].
    pub fn into_int(self) -> Result<Int, Error> {
        match self {
            Item::Scalar(Scalar::Int(i)) => Ok(i),
            _ => Err(Error::BadEncoding),
        }
    }

    /// Folds this item into a UTF-8 string.
    pub fn into_utf8(self) -> Result<&'i str, Error> {
        match self {
            Item::Scalar(Scalar::Utf8(b)) => Ok(b),
            _ => Err(Error::BadEncoding),
        }
    }

    /// Folds this item into a byte string.
    pub fn into_bytes(self) -> Result<&'i [u8], Error> {
        match self {
            Item::Scalar(Scalar::Bytes(b)) => Ok(b),
            _ => Err(Error::BadEncoding),
        }
    }

    /// Folds this item into a byte string and recurses into it for reading
    /// more CBOR.
    pub fn read_all<R>(
        self,
        f: impl FnOnce(&mut untrusted::Reader<'i>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        untrusted::Input::from(self.into_bytes()?)
            .read_all(Error::BadEncoding, f)
    }

    /// Folds this item into an [`Array`].
    pub fn into_array(self) -> Result<Array<'i, 'r>, Error> {
        match self {
            Item::Array(a) => Ok(a),
            _ => Err(Error::BadEncoding),
        }
    }

    /// Folds this item into a [`Map`].
    pub fn into_map(self) -> Result<Map<'i, 'r>, Error> {
        match self {
            Item::Map(m) => Ok(m),
            _ => Err(Error::BadEncoding),
        }
    }

    /// Folds this item into the item wrapped by tag number `tag`.
    pub fn into_tagged(self, tag: u32) -> Result<Item<'i, 'r>, Error> {
        match self {
            Item::Tag(n, t) if n == tag => t.item(),
            _ => Err(Error::BadEncoding),
        }
    }

    /// Ignores this element, driving its internal state to completion.
    pub fn ignore(self) -> Result<(), Error> {
        match self {
            Item::Array(a) => a.with(|e| e.ignore()),
            Item::Map(m) => m.walk(|_| Ok(())),
            Item::Tag(_, t) => t.item()?.ignore(),
            _ => Ok(()),
        }
    }
}

/// The item following a tag number.
pub struct Tagged<'input, 'reader> {
    buf: &'reader mut untrusted::Reader<'input>,
}

impl<'i, 'r> Tagged<'i, 'r> {
    /// Parses the tagged item.
    pub fn item(self) -> Result<Item<'i, 'r>, Error> {
        Item::parse(self.buf)
    }
}

// NOTE: Array and Map cannot be iterators, because the result value needs to
// capture the &mut self lifetime.

/// A CBOR array.
///
/// The `with()` function should be used to drive parsing forward.
#[must_use = "parsing will not be driven to completion without calling `with()`"]
pub struct Array<'input, 'reader> {
    buf: &'reader mut untrusted::Reader<'input>,
    len: u32,
}

impl<'i, 'r> Array<'i, 'r> {
    /// Returns the number of elements in the array.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Returns whether the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Runs `body` on each item in the array until completion or parse failure.
    pub fn with(
        self,
        mut body: impl FnMut(Item<'i, '_>) -> Result<(), Error>,
    ) -> Result<(), Error> {
        for _ in 0..self.len {
            body(Item::parse(&mut *self.buf)?)?
        }
        Ok(())
    }
}

/// A CBOR map.
///
/// Because maps are not random-access, they need to be *walked* using the
/// `walk()` function, which returns a sort of iterator that can be used to
/// retrieve mappings.
///
/// Map keys are required to be in ascending order, making it possible to
/// request keys one-by-one, much like DER.
#[must_use = "parsing will not be driven to completion without calling `walk()`"]
pub struct Map<'input, 'reader> {
    buf: &'reader mut untrusted::Reader<'input>,
    // `None` for an indefinite-length map.
    len: Option<u32>,
    prev_key: Option<Scalar<'input>>,
    current_key: Option<Scalar<'input>>,
}

impl<'i, 'r> Map<'i, 'r> {
    fn peek(&mut self) -> Result<Option<Scalar<'i>>, Error> {
        if let Some(key) = self.current_key {
            return Ok(Some(key));
        }

        match &mut self.len {
            Some(0) => return Ok(None),
            Some(n) => *n -= 1,
            None => {
                if self.buf.peek(BREAK) {
                    self.buf.read_byte()?;
                    self.len = Some(0);
                    return Ok(None);
                }
            }
        }

        let k = match Item::parse(&mut *self.buf) {
            Ok(Item::Scalar(i @ Scalar::Int { .. })) => i,
            Ok(Item::Scalar(s @ Scalar::Utf8(..))) => s,
            _ => return Err(Error::BadEncoding),
        };

        // Map key encodings must be in ascending order, and duplicate keys
        // are not permitted.
        if let Some(prev) = self.prev_key {
            if prev >= k {
                return Err(Error::BadEncoding);
            }
        }

        self.current_key = Some(k);
        Ok(Some(k))
    }

    /// Drive forward the parse by peeling off the next pair in the map.
    fn next(&mut self) -> Result<Option<(Scalar<'i>, Item<'i, '_>)>, Error> {
        self.peek()?;
        let k = match self.current_key.take() {
            Some(k) => k,
            None => return Ok(None),
        };

        self.prev_key = Some(k);
        Item::parse(&mut *self.buf).map(move |v| Some((k, v)))
    }

    /// Starts a walk through `self`.
    ///
    /// Any entries `body` does not consume are skipped once it returns.
    pub fn walk<R>(
        self,
        mut body: impl FnMut(&mut MapWalker<'i, '_>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut walker = MapWalker {
            map: self,
            last_get: None,
        };
        let val = body(&mut walker)?;
        walker.with(|(_, v)| v.ignore())?;
        Ok(val)
    }
}

/// A walker for a [`Map`].
pub struct MapWalker<'input, 'reader> {
    map: Map<'input, 'reader>,
    last_get: Option<Scalar<'input>>,
}

impl<'i, 'r> MapWalker<'i, 'r> {
    /// Steps through the [`Map`] until `key` is reached.
    ///
    /// Note that this function should not be called with a key less than the
    /// previous one.
    pub fn get(
        &mut self,
        key: impl Into<Scalar<'i>>,
    ) -> Result<Option<Item<'i, '_>>, Error> {
        self.get_inner(key.into())
    }

    fn get_inner(
        &mut self,
        key: Scalar<'i>,
    ) -> Result<Option<Item<'i, '_>>, Error> {
        if let Some(last) = self.last_get {
            debug_assert!(last < key, "bad key order: {:?} >= {:?}", last, key);
        }
        self.last_get = Some(key);

        while let Some(next) = self.map.peek()? {
            match Ord::cmp(&next, &key) {
                // We're still in front of `key`, keep searching.
                Ordering::Less => {
                    self.map.next()?.map(|(_, v)| v.ignore()).transpose()?;
                }
                // We found it!
                Ordering::Equal => return Ok(self.map.next()?.map(|(_, v)| v)),
                // We missed it, so we give up.
                Ordering::Greater => break,
            }
        }
        Ok(None)
    }

    /// Like `get()`, but failure is an encoding error.
    pub fn must_get(
        &mut self,
        key: impl Into<Scalar<'i>>,
    ) -> Result<Item<'i, '_>, Error> {
        self.get(key)?.ok_or(Error::BadEncoding)
    }

    /// Runs `body` on remaining key-value pair in the map until completion or
    /// parse failure.
    pub fn with(
        &mut self,
        mut body: impl FnMut((Scalar<'i>, Item<'i, '_>)) -> Result<(), Error>,
    ) -> Result<(), Error> {
        while let Some(pair) = self.map.next()? {
            body(pair)?
        }
        Ok(())
    }
}
