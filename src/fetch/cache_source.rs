// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! A [`FetchSource`] backed by the payload cache.

use crate::cache;
use crate::cache::Cache;
use crate::fetch::Error;
use crate::fetch::FetchSource;
use crate::fetch::Outcome;
use crate::hardware::flash::Flash;
use crate::hardware::flash::Ptr;
use crate::sink::Sink;

/// The number of bytes moved from NVM to the sink at a time.
const CHUNK_LEN: usize = 64;

/// Serves URIs that are already in a [`Cache`].
pub struct CacheSource<'c, F> {
    cache: &'c Cache<F>,
}

impl<'c, F: Flash> CacheSource<'c, F> {
    /// Creates a source reading from `cache`.
    pub fn new(cache: &'c Cache<F>) -> Self {
        Self { cache }
    }
}

impl<F: Flash> FetchSource for CacheSource<'_, F> {
    fn try_stream(
        &self,
        uri: &[u8],
        sink: &mut dyn Sink,
    ) -> Result<Outcome, Error> {
        let payload = match self.cache.search(uri) {
            Ok(payload) => payload,
            Err(cache::Error::NotFound) => return Ok(Outcome::NotHandled),
            Err(e) => return Err(e.into()),
        };

        let flash = self.cache.flash();
        let mut buf = [0; CHUNK_LEN];
        let mut offset = 0;
        while offset < payload.len {
            let n = (payload.len - offset).min(CHUNK_LEN as u32);
            let buf = &mut buf[..n as usize];
            let at = Ptr::new(payload.ptr.address + offset);
            if flash.read(at, buf).is_err() {
                return fail!(Error::Io);
            }
            sink.write(buf)?;
            offset += n;
        }
        Ok(Outcome::Done)
    }
}
