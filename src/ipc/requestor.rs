// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The receiving side of an IPC stream.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::fetch;
use crate::fetch::FetchSource;
use crate::fetch::Outcome;
use crate::ipc::Buffer;
use crate::ipc::ChunkInfo;
use crate::ipc::ChunkStatus;
use crate::ipc::Error;
use crate::sink::Sink;

/// The number of chunks a [`Requestor`] can hold at once.
pub const MAX_CHUNKS: usize = 4;

/// Timing parameters for [`Requestor::stream()`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Options {
    /// How long to wait for the next chunk before giving up.
    pub inter_chunk_timeout: Duration,
    /// How often to repeat the "missing image" notification until the first
    /// chunk arrives.
    pub requesting_period: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            inter_chunk_timeout: Duration::from_secs(10),
            requesting_period: Duration::from_secs(1),
        }
    }
}

/// Called with the URI and session id when the requestor needs an image.
pub type MissingImageFn = dyn Fn(&[u8], u32) + Send + Sync;
/// Called with the session id whenever some chunk's status changes.
pub type ChunkStatusFn = dyn Fn(u32) + Send + Sync;

/// Where the session is in its lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Stage {
    Idle,
    PendingFirstResponse,
    InProgress,
    Closing,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Slot {
    Empty,
    Pending,
    Processed,
    Refused,
}

struct Chunk {
    slot: Slot,
    id: u32,
    offset: u32,
    data: Option<Buffer>,
    len: usize,
    /// Strictly increasing per session, starting at 1.
    arrival: u32,
}

impl Chunk {
    const EMPTY: Chunk = Chunk {
        slot: Slot::Empty,
        id: 0,
        offset: 0,
        data: None,
        len: 0,
        arrival: 0,
    };

    /// Marks the chunk as finished, handing its buffer back.
    fn finish(&mut self, slot: Slot) {
        self.slot = slot;
        self.data = None;
    }
}

struct State {
    stage: Stage,
    session_id: u32,
    last_session_id: u32,
    uri: Arc<[u8]>,
    last_request: Option<Instant>,
    last_response: Instant,
    last_arrival: u32,
    last_processed: u32,
    /// Arrival number of the chunk marked as last, or zero.
    last_chunk: u32,
    cursor: u32,
    failed: bool,
    /// Binary semaphore waking the data pump.
    kicked: bool,
    chunks: [Chunk; MAX_CHUNKS],
    missing_image: Option<Arc<MissingImageFn>>,
    chunk_status: Option<Arc<ChunkStatusFn>>,
}

impl State {
    fn open(&mut self, uri: &[u8]) -> u32 {
        self.last_session_id = self.last_session_id.wrapping_add(1);
        if self.last_session_id == 0 {
            self.last_session_id = 1;
        }

        self.stage = Stage::PendingFirstResponse;
        self.session_id = self.last_session_id;
        self.uri = Arc::from(uri);
        self.last_request = None;
        self.last_response = Instant::now();
        self.last_arrival = 0;
        self.last_processed = 0;
        self.last_chunk = 0;
        self.cursor = 0;
        self.failed = false;
        self.kicked = false;
        for c in &mut self.chunks {
            c.finish(Slot::Empty);
        }
        self.session_id
    }

    /// Returns to idle, giving back every buffer still held.
    fn close(&mut self) {
        self.stage = Stage::Idle;
        for c in &mut self.chunks {
            c.data = None;
        }
    }

    fn check_session(&self, session_id: u32) -> Result<(), Error> {
        if self.stage == Stage::Idle || self.session_id != session_id {
            return Err(Error::IncorrectState);
        }
        Ok(())
    }

    fn next_pending(&self) -> Option<usize> {
        self.chunks.iter().position(|c| {
            c.slot == Slot::Pending && c.arrival == self.last_processed + 1
        })
    }
}

/// The receiving side of an IPC stream.
///
/// A requestor runs one stream at a time. [`Requestor::stream()`] blocks the
/// calling thread, pumping chunks into the sink as the provider enqueues
/// them from other threads.
pub struct Requestor {
    state: Mutex<State>,
    kick: Condvar,
    options: Options,
}

impl Default for Requestor {
    fn default() -> Self {
        Self::new(Options::default())
    }
}

impl Requestor {
    /// Creates an idle requestor.
    ///
    /// `options` is used when the requestor serves as a [`FetchSource`].
    pub fn new(options: Options) -> Self {
        Self {
            state: Mutex::new(State {
                stage: Stage::Idle,
                session_id: 0,
                last_session_id: 0,
                uri: Arc::from(&[][..]),
                last_request: None,
                last_response: Instant::now(),
                last_arrival: 0,
                last_processed: 0,
                last_chunk: 0,
                cursor: 0,
                failed: false,
                kicked: false,
                chunks: [Chunk::EMPTY; MAX_CHUNKS],
                missing_image: None,
                chunk_status: None,
            }),
            kick: Condvar::new(),
            options,
        }
    }

    /// Subscribes to "missing image" notifications.
    ///
    /// Fails with [`Error::NoMem`] if there already is a subscriber.
    pub fn subscribe_missing_image(
        &self,
        f: impl Fn(&[u8], u32) + Send + Sync + 'static,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        check!(state.missing_image.is_none(), Error::NoMem);
        state.missing_image = Some(Arc::new(f));
        Ok(())
    }

    /// Removes the "missing image" subscriber, if any.
    pub fn unsubscribe_missing_image(&self) {
        self.state.lock().missing_image = None;
    }

    /// Subscribes to "chunk status changed" notifications.
    ///
    /// Fails with [`Error::NoMem`] if there already is a subscriber.
    pub fn subscribe_chunk_status(
        &self,
        f: impl Fn(u32) + Send + Sync + 'static,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        check!(state.chunk_status.is_none(), Error::NoMem);
        state.chunk_status = Some(Arc::new(f));
        Ok(())
    }

    /// Removes the "chunk status changed" subscriber, if any.
    pub fn unsubscribe_chunk_status(&self) {
        self.state.lock().chunk_status = None;
    }

    /// Streams the image at `uri` into `sink`.
    ///
    /// Blocks until the chunk marked as last has been written, the sink
    /// refuses a chunk ([`Error::Crash`]), or no chunk arrives for
    /// `options.inter_chunk_timeout` ([`Error::Time`]). Until the first chunk
    /// arrives, the "missing image" notification is repeated every
    /// `options.requesting_period`.
    ///
    /// Fails with [`Error::NoResources`] if a stream is already running.
    pub fn stream(
        &self,
        uri: &[u8],
        sink: &mut dyn Sink,
        options: &Options,
    ) -> Result<(), Error> {
        check!(!uri.is_empty(), Error::Inval);
        let mut state = self.state.lock();
        if state.stage != Stage::Idle {
            return fail!(Error::NoResources);
        }
        let id = state.open(uri);
        info!("opened IPC stream session {}", id);

        let mut sleep = Duration::from_secs(0);
        loop {
            let deadline = Instant::now() + sleep;
            while !state.kicked {
                if self.kick.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            state.kicked = false;
            let now = Instant::now();
            sleep = options.inter_chunk_timeout;

            if state.stage == Stage::InProgress {
                if let Some(i) = state.next_pending() {
                    self.process(&mut state, i, sink);
                    sleep = Duration::from_secs(0);
                }
            }

            if state.stage == Stage::Closing {
                for c in &mut state.chunks {
                    if c.slot == Slot::Pending {
                        c.finish(Slot::Refused);
                    }
                }
                self.notify_chunk_status(&mut state);
                let failed = state.failed;
                state.close();
                if failed {
                    return fail!(
                        Error::Crash,
                        "IPC stream session {} failed",
                        id
                    );
                }
                info!("IPC stream session {} complete", id);
                return Ok(());
            }

            if state.stage == Stage::PendingFirstResponse {
                let period = options.requesting_period;
                let due = match state.last_request {
                    Some(t) => now.duration_since(t) >= period,
                    None => true,
                };
                if due {
                    self.notify_missing_image(&mut state);
                    state.last_request = Some(now);
                }
                if let Some(t) = state.last_request {
                    let next = (t + period).saturating_duration_since(now);
                    sleep = sleep.min(next);
                }
            }

            let silence = now.saturating_duration_since(state.last_response);
            if silence >= options.inter_chunk_timeout {
                state.close();
                return fail!(
                    Error::Time,
                    "IPC stream session {} timed out after {:?}",
                    id,
                    silence
                );
            }
            sleep = sleep.min(options.inter_chunk_timeout - silence);
        }
    }

    /// Writes chunk `i` to the sink, with the state unlocked.
    fn process(
        &self,
        state: &mut MutexGuard<'_, State>,
        i: usize,
        sink: &mut dyn Sink,
    ) {
        let chunk = &state.chunks[i];
        let (offset, len, arrival) = (chunk.offset, chunk.len, chunk.arrival);
        let data = chunk.data.clone();
        let seek = state.cursor != offset;

        let result = MutexGuard::unlocked(state, || {
            if seek {
                sink.seek(offset)?;
            }
            match &data {
                Some(data) => sink.write(&data[..len]),
                None => Ok(()),
            }
        });
        drop(data);

        match result {
            Ok(()) => {
                state.cursor = offset + len as u32;
                state.last_processed = arrival;
                if state.last_chunk == arrival {
                    state.stage = Stage::Closing;
                }
                state.chunks[i].finish(Slot::Processed);
            }
            Err(e) => {
                error!("sink refused chunk {}: {:?}", arrival, e);
                state.failed = true;
                state.stage = Stage::Closing;
                state.chunks[i].finish(Slot::Refused);
            }
        }
        self.notify_chunk_status(state);
    }

    fn notify_chunk_status(&self, state: &mut MutexGuard<'_, State>) {
        if let Some(f) = state.chunk_status.clone() {
            let id = state.session_id;
            MutexGuard::unlocked(state, || f(id));
        }
    }

    fn notify_missing_image(&self, state: &mut MutexGuard<'_, State>) {
        if let Some(f) = state.missing_image.clone() {
            let (uri, id) = (Arc::clone(&state.uri), state.session_id);
            MutexGuard::unlocked(state, || f(&uri, id));
        }
    }

    /// Hands a chunk of the image to the session `session_id`.
    ///
    /// `data` and `len` must be both present or both empty; an empty chunk
    /// only moves the write position, or marks the end of the image when
    /// `last` is set. No chunk is accepted after the last one.
    ///
    /// Fails with [`Error::Busy`] if the chunk table is full, in which case
    /// the caller should wait for a status change and retry.
    pub fn chunk_enqueue(
        &self,
        session_id: u32,
        chunk_id: u32,
        offset: u32,
        data: Option<Buffer>,
        len: usize,
        last: bool,
    ) -> Result<(), Error> {
        match &data {
            Some(d) => check!(len != 0 && len <= d.len(), Error::Inval),
            None => check!(len == 0, Error::Inval),
        }
        check!(offset.checked_add(len as u32).is_some(), Error::Inval);

        let mut state = self.state.lock();
        state.check_session(session_id)?;
        if state.stage == Stage::Closing || state.last_chunk != 0 {
            return Err(Error::IncorrectState);
        }
        if state.stage == Stage::PendingFirstResponse {
            state.stage = Stage::InProgress;
        }
        state.last_response = Instant::now();

        let arrival = state.last_arrival + 1;
        let free = state.chunks.iter_mut().find(|c| c.slot == Slot::Empty);
        let chunk = match free {
            Some(c) => c,
            None => return Err(Error::Busy),
        };
        *chunk = Chunk {
            slot: Slot::Pending,
            id: chunk_id,
            offset,
            data,
            len,
            arrival,
        };
        state.last_arrival = arrival;
        if last {
            state.last_chunk = arrival;
        }

        state.kicked = true;
        self.kick.notify_one();
        Ok(())
    }

    /// Reports the status of every chunk of session `session_id` still in
    /// the table, in arrival order, writing them to `out`.
    ///
    /// Chunks reported as processed or refused are removed from the table.
    /// If `out` is too small, fails with [`Error::Busy`]; finished chunks are
    /// still removed, which frees up room for the next call.
    pub fn chunk_status_req(
        &self,
        session_id: u32,
        out: &mut [ChunkInfo],
    ) -> Result<usize, Error> {
        let mut state = self.state.lock();
        state.check_session(session_id)?;

        let mut order: [usize; MAX_CHUNKS] = [0; MAX_CHUNKS];
        let mut count = 0;
        for (i, c) in state.chunks.iter().enumerate() {
            if c.slot != Slot::Empty {
                order[count] = i;
                count += 1;
            }
        }
        let order = &mut order[..count];
        order.sort_unstable_by_key(|&i| state.chunks[i].arrival);
        let busy = count > out.len();

        for (n, &i) in order.iter().enumerate() {
            let c = &mut state.chunks[i];
            if !busy {
                out[n] = ChunkInfo {
                    chunk_id: c.id,
                    status: match c.slot {
                        Slot::Pending => ChunkStatus::Pending,
                        Slot::Processed => ChunkStatus::Processed,
                        _ => ChunkStatus::Refused,
                    },
                };
            }
            if c.slot != Slot::Pending {
                c.finish(Slot::Empty);
            }
        }

        if busy {
            return Err(Error::Busy);
        }
        Ok(count)
    }
}

impl FetchSource for Requestor {
    fn try_stream(
        &self,
        uri: &[u8],
        sink: &mut dyn Sink,
    ) -> Result<Outcome, fetch::Error> {
        self.stream(uri, sink, &self.options)?;
        Ok(Outcome::Done)
    }
}
