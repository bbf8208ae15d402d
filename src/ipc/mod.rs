// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Chunked streaming across a domain boundary.
//!
//! Two roles cooperate to move a resource from one execution domain into a
//! [`Sink`] owned by another:
//! - the [`Requestor`] lives next to the sink. It announces that it is
//!   missing an image, accepts chunks of it into a small table, and applies
//!   them to the sink in arrival order.
//! - the [`Provider`] lives next to the data. It answers "missing image"
//!   notifications by pulling the resource through a [`Registry`], slicing
//!   it into a fixed pool of shared buffers, and enqueuing each buffer as a
//!   chunk.
//!
//! The two talk through plain method calls and notification callbacks; how
//! those calls cross the boundary is up to the integration.
//!
//! This module requires the `std` feature.
//!
//! [`Sink`]: crate::sink::Sink
//! [`Registry`]: crate::fetch::Registry

use std::sync::Arc;
use std::vec::Vec;

use crate::fetch;
use crate::sink;

pub mod provider;
pub mod requestor;

pub use provider::Provider;
pub use requestor::Requestor;

/// A chunk buffer, shared between the provider and the requestor.
///
/// The provider only writes to a buffer while it holds the sole reference
/// to it.
pub type Buffer = Arc<Vec<u8>>;

/// An IPC streaming error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// An argument was malformed.
    Inval,
    /// A stream is already running.
    NoResources,
    /// The session id is unknown, or the session no longer accepts chunks.
    IncorrectState,
    /// A fixed-size table is full; the caller should retry later.
    Busy,
    /// No chunk arrived within the inter-chunk timeout.
    Time,
    /// A notification already has a subscriber.
    NoMem,
    /// The sink refused a chunk, or the two roles disagree about buffer
    /// ownership.
    Crash,
}

impl From<Error> for fetch::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Inval => fetch::Error::Inval,
            Error::NoResources | Error::Busy | Error::NoMem => {
                fetch::Error::NoResources
            }
            Error::IncorrectState => fetch::Error::IncorrectState,
            Error::Time => fetch::Error::Time,
            Error::Crash => fetch::Error::Io,
        }
    }
}

impl From<Error> for sink::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Inval => sink::Error::Inval,
            Error::NoResources | Error::Busy | Error::NoMem => {
                sink::Error::NoResources
            }
            Error::IncorrectState | Error::Time => sink::Error::IncorrectState,
            Error::Crash => sink::Error::Io,
        }
    }
}

/// The processing status of a chunk, as reported to the provider.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChunkStatus {
    /// The chunk is waiting to be written.
    Pending,
    /// The chunk was written to the sink.
    Processed,
    /// The chunk was not written, and never will be.
    Refused,
}

/// A chunk's id and status; see [`Requestor::chunk_status_req()`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChunkInfo {
    /// The provider-assigned chunk id.
    pub chunk_id: u32,
    /// What has become of the chunk.
    pub status: ChunkStatus,
}

impl Default for ChunkInfo {
    fn default() -> Self {
        Self {
            chunk_id: 0,
            status: ChunkStatus::Pending,
        }
    }
}
