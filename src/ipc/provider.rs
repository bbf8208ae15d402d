// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The sending side of an IPC stream.

use std::string::String;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::vec::Vec;

use parking_lot::Condvar;
use parking_lot::Mutex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::fetch::Registry;
use crate::ipc::requestor::MAX_CHUNKS;
use crate::ipc::Buffer;
use crate::ipc::ChunkInfo;
use crate::ipc::ChunkStatus;
use crate::ipc::Error;
use crate::ipc::Requestor;
use crate::sink;
use crate::sink::Sink;

/// The number of buffers a [`Provider`] cycles through.
pub const BUFFER_COUNT: usize = 2;

/// Tuning parameters for a [`Provider`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Options {
    /// The size of each chunk buffer, in bytes.
    pub buffer_size: usize,
    /// How long to wait for a status notification before polling the
    /// requestor anyway.
    pub status_poll: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            buffer_size: 2048,
            status_poll: Duration::from_millis(20),
        }
    }
}

/// A "missing image" notification, queued for the worker.
struct Request {
    uri: Vec<u8>,
    session_id: u32,
}

/// State shared between the notification callbacks and the worker.
struct Shared {
    requests: Mutex<Option<mpsc::Sender<Request>>>,
    /// The session currently being served, if any.
    active: Mutex<Option<u32>>,
    status_changed: Mutex<bool>,
    status_cond: Condvar,
}

impl Shared {
    fn on_missing_image(&self, uri: &[u8], session_id: u32) {
        let mut active = self.active.lock();
        if active.is_some() {
            return;
        }
        if let Some(tx) = &*self.requests.lock() {
            let req = Request {
                uri: uri.to_vec(),
                session_id,
            };
            if tx.send(req).is_ok() {
                *active = Some(session_id);
            }
        }
    }

    fn on_chunk_status(&self) {
        *self.status_changed.lock() = true;
        self.status_cond.notify_all();
    }

    /// Waits up to `timeout` for a chunk status notification.
    fn wait_status(&self, timeout: Duration) {
        let mut changed = self.status_changed.lock();
        if !*changed {
            self.status_cond.wait_for(&mut changed, timeout);
        }
        *changed = false;
    }
}

/// Answers a [`Requestor`]'s "missing image" notifications by streaming
/// the image out of a [`Registry`].
///
/// A provider owns a worker thread and a fixed pool of [`BUFFER_COUNT`]
/// buffers. Dropping the provider unsubscribes it and joins the worker.
pub struct Provider {
    requestor: Arc<Requestor>,
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Provider {
    /// Subscribes to `requestor` and starts the worker.
    ///
    /// Fails with [`Error::NoMem`] if `requestor` already has subscribers.
    pub fn start(
        requestor: Arc<Requestor>,
        registry: Arc<Registry<'static>>,
        options: Options,
    ) -> Result<Self, Error> {
        check!(options.buffer_size != 0, Error::Inval);

        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            requests: Mutex::new(Some(tx)),
            active: Mutex::new(None),
            status_changed: Mutex::new(false),
            status_cond: Condvar::new(),
        });

        let s = Arc::clone(&shared);
        requestor.subscribe_chunk_status(move |_| s.on_chunk_status())?;
        let s = Arc::clone(&shared);
        if let Err(e) = requestor
            .subscribe_missing_image(move |uri, id| s.on_missing_image(uri, id))
        {
            requestor.unsubscribe_chunk_status();
            return Err(e);
        }

        let worker = {
            let requestor = Arc::clone(&requestor);
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(String::from("ipc-provider"))
                .spawn(move || {
                    Worker::new(&requestor, &shared, options).run(&registry, rx)
                })
        };
        let worker = match worker {
            Ok(w) => w,
            Err(_) => {
                requestor.unsubscribe_missing_image();
                requestor.unsubscribe_chunk_status();
                return fail!(Error::NoResources, "could not spawn IPC worker");
            }
        };

        Ok(Self {
            requestor,
            shared,
            worker: Some(worker),
        })
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        self.requestor.unsubscribe_missing_image();
        self.requestor.unsubscribe_chunk_status();
        self.shared.requests.lock().take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("IPC provider worker panicked");
            }
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum BufState {
    Free,
    /// Being filled; enqueued once full or when the stream jumps.
    ReadyToEnqueue,
    /// Handed to the requestor, and not yet reported as done.
    Enqueued,
}

struct Buf {
    data: Buffer,
    state: BufState,
    offset: u32,
    len: usize,
    chunk_id: u32,
}

/// The worker's half of a session: a [`Sink`] turning writes into chunks.
struct Worker<'a> {
    requestor: &'a Requestor,
    shared: &'a Shared,
    options: Options,
    pool: Vec<Buf>,
    session_id: u32,
    next_chunk_id: u32,
    requested_offset: u32,
}

impl<'a> Worker<'a> {
    fn new(
        requestor: &'a Requestor,
        shared: &'a Shared,
        options: Options,
    ) -> Self {
        let pool = (0..BUFFER_COUNT)
            .map(|_| Buf {
                data: Arc::new(std::vec![0; options.buffer_size]),
                state: BufState::Free,
                offset: 0,
                len: 0,
                chunk_id: 0,
            })
            .collect();
        Self {
            requestor,
            shared,
            options,
            pool,
            session_id: 0,
            next_chunk_id: 0,
            requested_offset: 0,
        }
    }

    fn run(mut self, registry: &Registry<'_>, rx: mpsc::Receiver<Request>) {
        for req in rx {
            info!("serving IPC stream session {}", req.session_id);
            self.reset(req.session_id);
            match registry.stream(&req.uri, &mut self) {
                Ok(()) => {
                    if let Err(e) = self.end_of_stream() {
                        error!(
                            "could not finish session {}: {:?}",
                            req.session_id,
                            e
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        "could not fetch for session {}: {:?}",
                        req.session_id,
                        e
                    );
                }
            }
            *self.shared.active.lock() = None;
        }
        trace!("IPC provider worker exiting");
    }

    /// Prepares the pool for a new session.
    ///
    /// A buffer the requestor still holds a reference to is replaced rather
    /// than reused.
    fn reset(&mut self, session_id: u32) {
        self.session_id = session_id;
        self.next_chunk_id = 0;
        self.requested_offset = 0;
        for b in &mut self.pool {
            if Arc::get_mut(&mut b.data).is_none() {
                b.data = Arc::new(std::vec![0; self.options.buffer_size]);
            }
            b.state = BufState::Free;
            b.len = 0;
        }
    }

    fn find(&self, state: BufState) -> Option<usize> {
        self.pool.iter().position(|b| b.state == state)
    }

    /// Returns the buffer currently being filled, starting a new one at the
    /// requested offset if needed.
    fn filling(&mut self) -> Result<usize, Error> {
        loop {
            if let Some(i) = self.find(BufState::ReadyToEnqueue) {
                return Ok(i);
            }
            if let Some(i) = self.find(BufState::Free) {
                self.next_chunk_id = self.next_chunk_id.wrapping_add(1);
                let b = &mut self.pool[i];
                b.state = BufState::ReadyToEnqueue;
                b.offset = self.requested_offset;
                b.len = 0;
                b.chunk_id = self.next_chunk_id;
                return Ok(i);
            }
            self.wait_for_release()?;
        }
    }

    /// Hands buffer `i` to the requestor, waiting for room in its table.
    fn enqueue(&mut self, i: usize, last: bool) -> Result<(), Error> {
        loop {
            let b = &self.pool[i];
            let data = if b.len == 0 {
                None
            } else {
                Some(Arc::clone(&b.data))
            };
            let result = self.requestor.chunk_enqueue(
                self.session_id,
                b.chunk_id,
                b.offset,
                data,
                b.len,
                last,
            );
            match result {
                Ok(()) => {
                    self.pool[i].state = BufState::Enqueued;
                    return Ok(());
                }
                Err(Error::Busy) => self.wait_for_release()?,
                Err(e) => return Err(e),
            }
        }
    }

    /// Blocks until at least one enqueued buffer comes back.
    ///
    /// Returns immediately if nothing is enqueued; the status request
    /// alone frees room in the requestor's table.
    fn wait_for_release(&mut self) -> Result<(), Error> {
        let mut out = [ChunkInfo::default(); MAX_CHUNKS];
        loop {
            let status =
                self.requestor.chunk_status_req(self.session_id, &mut out);
            let n = match status {
                Ok(n) => n,
                Err(Error::Busy) => continue,
                Err(e) => return Err(e),
            };
            let pending = &out[..n];

            let mut waiting = false;
            let mut freed = false;
            for b in &mut self.pool {
                if b.state != BufState::Enqueued {
                    continue;
                }
                let held = pending.iter().any(|c| {
                    c.chunk_id == b.chunk_id && c.status == ChunkStatus::Pending
                });
                if held {
                    waiting = true;
                } else {
                    b.state = BufState::Free;
                    freed = true;
                }
            }
            if freed || !waiting {
                return Ok(());
            }
            self.shared.wait_status(self.options.status_poll);
        }
    }

    /// Enqueues the final chunk and waits for the requestor to finish.
    fn end_of_stream(&mut self) -> Result<(), Error> {
        let i = self.filling()?;
        self.enqueue(i, true)?;
        while self.pool.iter().any(|b| b.state == BufState::Enqueued) {
            match self.wait_for_release() {
                Ok(()) => {}
                // The requestor closes the session right after the last
                // chunk.
                Err(Error::IncorrectState) => break,
                Err(e) => return Err(e),
            }
        }
        info!("IPC stream session {} sent", self.session_id);
        Ok(())
    }
}

impl Sink for Worker<'_> {
    fn write(&mut self, mut buf: &[u8]) -> Result<(), sink::Error> {
        while !buf.is_empty() {
            let i = self.filling()?;
            let b = &mut self.pool[i];
            let data = match Arc::get_mut(&mut b.data) {
                Some(data) => data,
                None => return fail!(Error::Crash, "chunk buffer still shared"),
            };
            let n = (data.len() - b.len).min(buf.len());
            data[b.len..b.len + n].copy_from_slice(&buf[..n]);
            b.len += n;
            let full = b.len == data.len();
            buf = &buf[n..];
            self.requested_offset += n as u32;
            if full {
                self.enqueue(i, false)?;
            }
        }
        Ok(())
    }

    fn seek(&mut self, offset: u32) -> Result<(), sink::Error> {
        if let Some(i) = self.find(BufState::ReadyToEnqueue) {
            let b = &mut self.pool[i];
            if b.len == 0 {
                b.offset = offset;
            } else if b.offset + b.len as u32 != offset {
                self.enqueue(i, false)?;
            }
        }
        self.requested_offset = offset;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::boxed::Box;

    use pretty_assertions::assert_eq;

    use crate::fetch;
    use crate::fetch::FetchSource;
    use crate::fetch::Outcome;
    use crate::ipc::requestor;
    use crate::sink::fake;

    /// Serves a fixed blob, with an optional seek partway through.
    struct Blob {
        uri: &'static [u8],
        data: Vec<u8>,
        seek: Option<(usize, u32)>,
        fail: bool,
    }

    impl FetchSource for Blob {
        fn try_stream(
            &self,
            uri: &[u8],
            sink: &mut dyn Sink,
        ) -> Result<Outcome, fetch::Error> {
            if self.fail {
                return Err(fetch::Error::Io);
            }
            if uri != self.uri {
                return Ok(Outcome::NotHandled);
            }
            match self.seek {
                Some((at, to)) => {
                    sink.write(&self.data[..at])?;
                    sink.seek(to)?;
                    sink.write(&self.data[at..])?;
                }
                None => sink.write(&self.data)?,
            }
            Ok(Outcome::Done)
        }
    }

    fn registry(blob: Blob) -> Arc<Registry<'static>> {
        let blob: &'static Blob = Box::leak(Box::new(blob));
        let mut registry = Registry::new();
        registry.register(blob).unwrap();
        Arc::new(registry)
    }

    fn fast() -> requestor::Options {
        requestor::Options {
            inter_chunk_timeout: Duration::from_millis(500),
            requesting_period: Duration::from_millis(50),
        }
    }

    #[test]
    fn streams_through_small_buffers() {
        let data: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        let registry = registry(Blob {
            uri: b"app://big",
            data: data.clone(),
            seek: Some((700, 700)),
            fail: false,
        });

        let requestor = Arc::new(Requestor::default());
        let options = Options {
            buffer_size: 64,
            ..Options::default()
        };
        let provider =
            Provider::start(Arc::clone(&requestor), registry, options).unwrap();

        let mut sink = fake::Sink::new();
        requestor.stream(b"app://big", &mut sink, &fast()).unwrap();
        drop(provider);

        assert_eq!(sink.data, data);
        assert!(!sink.calls.iter().any(|c| matches!(c, fake::Call::Seek(_))));
        assert_eq!(sink.calls.len(), 16);
    }

    #[test]
    fn seek_starts_new_chunk() {
        let registry = registry(Blob {
            uri: b"app://sparse",
            data: b"helloworld".to_vec(),
            seek: Some((5, 100)),
            fail: false,
        });

        let requestor = Arc::new(Requestor::default());
        let provider = Provider::start(
            Arc::clone(&requestor),
            registry,
            Options::default(),
        )
        .unwrap();

        let mut sink = fake::Sink::new();
        requestor.stream(b"app://sparse", &mut sink, &fast()).unwrap();
        drop(provider);

        assert_eq!(
            sink.calls,
            vec![
                fake::Call::Write { offset: 0, len: 5 },
                fake::Call::Seek(100),
                fake::Call::Write { offset: 100, len: 5 },
            ]
        );
        assert_eq!(&sink.data[..5], b"hello");
        assert_eq!(&sink.data[100..], b"world");
    }

    #[test]
    fn failed_fetch_times_out() {
        let registry = registry(Blob {
            uri: b"app://broken",
            data: Vec::new(),
            seek: None,
            fail: true,
        });

        let requestor = Arc::new(Requestor::default());
        let provider = Provider::start(
            Arc::clone(&requestor),
            registry,
            Options::default(),
        )
        .unwrap();

        let mut sink = fake::Sink::new();
        assert_eq!(
            requestor.stream(b"app://broken", &mut sink, &fast()),
            Err(Error::Time)
        );
        drop(provider);
        assert!(sink.calls.is_empty());
    }

    #[test]
    fn one_provider_per_requestor() {
        let registry = registry(Blob {
            uri: b"app://x",
            data: Vec::new(),
            seek: None,
            fail: false,
        });

        let requestor = Arc::new(Requestor::default());
        let provider = Provider::start(
            Arc::clone(&requestor),
            Arc::clone(&registry),
            Options::default(),
        )
        .unwrap();
        assert!(matches!(
            Provider::start(
                Arc::clone(&requestor),
                Arc::clone(&registry),
                Options::default()
            ),
            Err(Error::NoMem)
        ));

        drop(provider);
        Provider::start(requestor, registry, Options::default()).unwrap();
    }

    #[test]
    fn empty_image() {
        let registry = registry(Blob {
            uri: b"app://empty",
            data: Vec::new(),
            seek: None,
            fail: false,
        });

        let requestor = Arc::new(Requestor::default());
        let _provider = Provider::start(
            Arc::clone(&requestor),
            registry,
            Options::default(),
        )
        .unwrap();

        let mut sink = fake::Sink::new();
        requestor.stream(b"app://empty", &mut sink, &fast()).unwrap();
        assert!(sink.calls.is_empty());
    }
}
