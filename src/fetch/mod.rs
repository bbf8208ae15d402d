// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Fetch sources.
//!
//! A [`FetchSource`] knows how to produce the bytes behind some URIs. A
//! [`Registry`] holds an ordered list of sources, and satisfies a request to
//! stream a URI into a [`Sink`] by asking each source in turn.
//!
//! Sources must say whether they took the request. A source that cannot
//! serve a URI returns [`Outcome::NotHandled`] without touching the sink,
//! and the next source gets a chance. Once a source has written to the sink,
//! though, the destination cannot be rewound, so a failure at that point
//! ends the whole request.

use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;

use arrayvec::ArrayVec;

use crate::cache;
use crate::sink;
use crate::sink::Sink;

mod cache_source;
pub use cache_source::CacheSource;

mod memory;
pub use memory::MemorySource;

/// The maximum number of sources a [`Registry`] can hold.
pub const MAX_SOURCES: usize = 4;

/// A fetch error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// An argument was malformed.
    Inval,
    /// No source could serve the URI.
    NotFound,
    /// A fixed-capacity table is full; the caller may retry later.
    NoResources,
    /// A stream is already in progress, or a source failed after it had
    /// started writing.
    IncorrectState,
    /// A source did not deliver in time.
    Time,
    /// The source or the destination failed.
    Io,
}

impl From<sink::Error> for Error {
    fn from(e: sink::Error) -> Self {
        match e {
            sink::Error::Inval => Error::Inval,
            sink::Error::OutOfBounds | sink::Error::NoResources => {
                Error::NoResources
            }
            sink::Error::IncorrectState => Error::IncorrectState,
            _ => Error::Io,
        }
    }
}

impl From<cache::Error> for Error {
    fn from(e: cache::Error) -> Self {
        match e {
            cache::Error::Inval => Error::Inval,
            cache::Error::NotFound => Error::NotFound,
            cache::Error::NoResources | cache::Error::NoMem => {
                Error::NoResources
            }
            cache::Error::IncorrectState => Error::IncorrectState,
            _ => Error::Io,
        }
    }
}

/// What a [`FetchSource`] did with a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The whole resource was written to the sink.
    Done,
    /// The source does not serve this URI; the sink was not touched.
    NotHandled,
}

/// A provider of resources addressed by URI.
pub trait FetchSource {
    /// Streams the resource at `uri` into `sink`.
    ///
    /// Returns [`Outcome::NotHandled`] if this source does not know `uri`.
    /// Errors returned before the first write to `sink` are treated the same
    /// way by a [`Registry`].
    fn try_stream(
        &self,
        uri: &[u8],
        sink: &mut dyn Sink,
    ) -> Result<Outcome, Error>;
}

/// Where a stream session is in its lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    /// No session is open.
    Idle,
    /// A source has been asked, but has not touched the sink yet.
    PendingFirstResponse,
    /// A source has started writing to the sink.
    InProgress,
}

/// An ordered set of [`FetchSource`]s.
///
/// A registry runs at most one stream at a time; see [`Registry::stream()`].
pub struct Registry<'s> {
    sources: ArrayVec<&'s (dyn FetchSource + Sync), MAX_SOURCES>,
    /// The id of the open session, or zero.
    session: AtomicU32,
    last_id: AtomicU32,
}

impl<'s> Default for Registry<'s> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'s> Registry<'s> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            sources: ArrayVec::new(),
            session: AtomicU32::new(0),
            last_id: AtomicU32::new(0),
        }
    }

    /// Appends `source`; it is asked after every source registered before
    /// it.
    pub fn register(
        &mut self,
        source: &'s (dyn FetchSource + Sync),
    ) -> Result<(), Error> {
        match self.sources.try_push(source) {
            Ok(()) => Ok(()),
            Err(_) => fail!(Error::NoResources),
        }
    }

    /// Returns the number of registered sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns whether no sources are registered.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Returns the id of the stream currently running, if any.
    pub fn session_id(&self) -> Option<u32> {
        match self.session.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Streams `uri` into `sink`, using the first source that takes it.
    ///
    /// Fails with [`Error::IncorrectState`] if another stream is running, or
    /// if a source failed after writing to `sink`. Fails with
    /// [`Error::NotFound`] if no source took `uri`.
    pub fn stream(&self, uri: &[u8], sink: &mut dyn Sink) -> Result<(), Error> {
        let session = self.open()?;
        trace!("fetch session {} opened", session.id);

        for (i, source) in self.sources.iter().enumerate() {
            let mut proxy = Proxy {
                sink: &mut *sink,
                stage: Stage::PendingFirstResponse,
            };
            let result = source.try_stream(uri, &mut proxy);
            match (result, proxy.stage) {
                (Ok(Outcome::Done), _) => {
                    trace!("source {} served session {}", i, session.id);
                    return Ok(());
                }
                (Ok(Outcome::NotHandled), Stage::PendingFirstResponse) => {}
                (Err(e), Stage::PendingFirstResponse) => {
                    info!("fetch source {} failed up front: {:?}", i, e);
                }
                (_, _) => {
                    return fail!(
                        Error::IncorrectState,
                        "fetch source {} failed after writing",
                        i
                    );
                }
            }
        }

        info!("no fetch source serves the requested URI");
        Err(Error::NotFound)
    }

    fn open(&self) -> Result<Session<'_, 's>, Error> {
        let next = || self.last_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let id = match next() {
            0 => next(),
            id => id,
        };
        match self.session.compare_exchange(
            0,
            id,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(Session { registry: self, id }),
            Err(_) => fail!(Error::IncorrectState),
        }
    }
}

/// Closes its session when dropped.
struct Session<'r, 's> {
    registry: &'r Registry<'s>,
    id: u32,
}

impl Drop for Session<'_, '_> {
    fn drop(&mut self) {
        self.registry.session.store(0, Ordering::Release);
    }
}

/// The sink a source actually sees, tracking whether it has been touched.
struct Proxy<'a> {
    sink: &'a mut dyn Sink,
    stage: Stage,
}

impl Proxy<'_> {
    fn touch(&mut self) -> &mut dyn Sink {
        self.stage = Stage::InProgress;
        &mut *self.sink
    }
}

impl Sink for Proxy<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<(), sink::Error> {
        self.touch().write(buf)
    }

    fn seek(&mut self, offset: u32) -> Result<(), sink::Error> {
        self.touch().seek(offset)
    }

    fn flush(&mut self) -> Result<(), sink::Error> {
        self.touch().flush()
    }

    fn used_storage(&self) -> Result<u32, sink::Error> {
        self.sink.used_storage()
    }

    fn erase(&mut self) -> Result<(), sink::Error> {
        self.touch().erase()
    }

    /// The destination belongs to the caller of [`Registry::stream()`], so
    /// sources cannot release it.
    fn release(&mut self) -> Result<(), sink::Error> {
        Ok(())
    }
}
