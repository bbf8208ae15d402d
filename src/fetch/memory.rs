// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! A [`FetchSource`] serving one resource straight out of memory.

use crate::cache::trim_uri;
use crate::fetch::Error;
use crate::fetch::FetchSource;
use crate::fetch::Outcome;
use crate::sink::Sink;

/// Serves a single payload that is already mapped in memory, such as one
/// integrated into the envelope being processed.
pub struct MemorySource<'a> {
    uri: &'a [u8],
    payload: &'a [u8],
}

impl<'a> MemorySource<'a> {
    /// Creates a source that answers `uri` with `payload`.
    pub fn new(uri: &'a [u8], payload: &'a [u8]) -> Self {
        Self {
            uri: trim_uri(uri),
            payload,
        }
    }
}

impl FetchSource for MemorySource<'_> {
    fn try_stream(
        &self,
        uri: &[u8],
        sink: &mut dyn Sink,
    ) -> Result<Outcome, Error> {
        if trim_uri(uri) != self.uri {
            return Ok(Outcome::NotHandled);
        }
        check!(!self.payload.is_empty(), Error::Inval);
        sink.write(self.payload)?;
        Ok(Outcome::Done)
    }
}
