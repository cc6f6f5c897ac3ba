//! Buffered asynchronous streams over the proactor.
//!
//! An [`AsyncStream`] is a uniform open/read/write/seek/sync surface over
//! five backends: in-memory data, files, TCP/UDP sockets (with an optional
//! SSL layer), an external HTTP client, and a filter wrapper composing a
//! [`Filter`] onto any other stream. Every operation posts into the
//! proactor and delivers its result through a callback on the worker
//! thread; the stream itself is single-owner and must not be driven from
//! two threads at once.
//!
//! A small state machine guards the surface: `closed → opening → opened`,
//! with `kill` forcing `killing → killed` and `clos` returning to
//! `closed`. Reads and writes go through optional caches; `sync` drains
//! the write cache before the backend sync runs.
//!
//! [`Filter`]: crate::filter::Filter

mod data;
mod file;
mod filter;
mod http;
mod sock;

pub use file::FileMode;
pub use http::{HttpClient, HttpOption, HttpResponseInfo};
pub use sock::{Resolver, SockType, SslEngine, ThreadResolver};

use std::io;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{trace, warn};
use parking_lot::Mutex;

use crate::aico::{Aico, Op};
use crate::proactor::ProactorHandle;
use crate::url::{Scheme, Url};
use crate::State;

/// Default per-operation timeout of every stream.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

// clos_try polling by `exit`: 30 rounds of 200 ms.
const EXIT_ROUNDS: usize = 30;
const EXIT_SPACING: Duration = Duration::from_millis(200);

/// Stream lifecycle states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Closed = 0,
    Opening = 1,
    Opened = 2,
    Killing = 3,
    Killed = 4,
}

impl StreamState {
    fn from_u8(raw: u8) -> StreamState {
        match raw {
            1 => StreamState::Opening,
            2 => StreamState::Opened,
            3 => StreamState::Killing,
            4 => StreamState::Killed,
            _ => StreamState::Closed,
        }
    }
}

/// Open callback: fires exactly once with the final open state.
pub type OpenFunc = Box<dyn FnOnce(&AsyncStream, State) + Send>;
/// Read callback: fires per delivered chunk; returning true continues the
/// read.
pub type ReadFunc = Box<dyn FnMut(&AsyncStream, State, &[u8]) -> bool + Send>;
/// Write callback: `(state, written, requested)`; returning true continues
/// an incomplete write.
pub type WriteFunc = Box<dyn FnMut(&AsyncStream, State, usize, usize) -> bool + Send>;
/// Seek callback with the resulting offset.
pub type SeekFunc = Box<dyn FnOnce(&AsyncStream, State, u64) + Send>;
/// Sync callback.
pub type SyncFunc = Box<dyn FnOnce(&AsyncStream, State) + Send>;
/// Task callback; returning true re-arms the task with the same delay.
pub type TaskFunc = Box<dyn FnMut(&AsyncStream, State) -> bool + Send>;
/// Close callback.
pub type ClosFunc = Box<dyn FnOnce(&AsyncStream, State) + Send>;

pub(crate) enum Backend {
    Data(data::DataBackend),
    File(file::FileBackend),
    Sock(sock::SockBackend),
    Http(http::HttpBackend),
    Filter(filter::FilterBackend),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum BackendKind {
    Data,
    File,
    Sock,
    Http,
    Filter,
}

impl Backend {
    fn kind(&self) -> BackendKind {
        match self {
            Backend::Data(_) => BackendKind::Data,
            Backend::File(_) => BackendKind::File,
            Backend::Sock(_) => BackendKind::Sock,
            Backend::Http(_) => BackendKind::Http,
            Backend::Filter(_) => BackendKind::Filter,
        }
    }
}

pub(crate) struct Core {
    pub aicp: ProactorHandle,
    pub kind: BackendKind,
    pub state: AtomicU8,
    pub url: Mutex<Url>,
    pub timeout_ms: AtomicU64,
    pub offset: AtomicU64,
    // Operations currently posted and not yet delivered.
    pub inflight: AtomicUsize,
    pub rcache_max: AtomicUsize,
    pub wcache_max: AtomicUsize,
    // Reused receive buffer when read caching is on.
    pub rcache: Mutex<Option<Vec<u8>>>,
    pub wcache: Mutex<Vec<u8>>,
    // Stream size when the backend knows it, -1 otherwise.
    pub size_hint: AtomicI64,
    // Close requested while the stream was still opening; honored after
    // the open callback fires.
    pub pending_clos: Mutex<Option<ClosFunc>>,
    pub backend: Mutex<Backend>,
}

/// A buffered asynchronous stream. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AsyncStream {
    pub(crate) core: Arc<Core>,
}

impl AsyncStream {
    /// Creates a stream from a URL; the backend is chosen by scheme.
    pub fn from_url(aicp: &ProactorHandle, url: &str) -> io::Result<AsyncStream> {
        let url = Url::parse(url)?;
        let backend = match url.scheme() {
            Scheme::Data => Backend::Data(data::DataBackend::new()),
            Scheme::File => Backend::File(file::FileBackend::new()),
            Scheme::Sock => Backend::Sock(sock::SockBackend::new()),
            Scheme::Http => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "http streams need a client; use AsyncStream::http",
                ))
            }
        };
        Ok(AsyncStream::with_backend(aicp, url, backend))
    }

    /// Creates an HTTP stream over an external client.
    pub fn http(
        aicp: &ProactorHandle,
        url: &str,
        client: Box<dyn HttpClient>,
    ) -> io::Result<AsyncStream> {
        let url = Url::parse(url)?;
        if url.scheme() != Scheme::Http {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not an http url",
            ));
        }
        Ok(AsyncStream::with_backend(
            aicp,
            url,
            Backend::Http(http::HttpBackend::new(client)),
        ))
    }

    /// Composes a filter onto an existing stream. The child must be driven
    /// only through the returned wrapper from here on.
    pub fn with_filter(
        aicp: &ProactorHandle,
        child: AsyncStream,
        filter: crate::filter::Filter,
    ) -> AsyncStream {
        let url = child.core.url.lock().clone();
        AsyncStream::with_backend(
            aicp,
            url,
            Backend::Filter(filter::FilterBackend::new(child, filter)),
        )
    }

    fn with_backend(aicp: &ProactorHandle, url: Url, backend: Backend) -> AsyncStream {
        AsyncStream {
            core: Arc::new(Core {
                aicp: aicp.clone(),
                kind: backend.kind(),
                state: AtomicU8::new(StreamState::Closed as u8),
                url: Mutex::new(url),
                timeout_ms: AtomicU64::new(DEFAULT_TIMEOUT.as_millis() as u64),
                offset: AtomicU64::new(0),
                inflight: AtomicUsize::new(0),
                rcache_max: AtomicUsize::new(8192),
                wcache_max: AtomicUsize::new(0),
                rcache: Mutex::new(None),
                wcache: Mutex::new(Vec::new()),
                size_hint: AtomicI64::new(-1),
                pending_clos: Mutex::new(None),
                backend: Mutex::new(backend),
            }),
        }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.core.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        self.core.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn cas_state(&self, from: StreamState, to: StreamState) -> bool {
        self.core
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// True once the stream was killed (or is being killed).
    pub fn is_killed(&self) -> bool {
        matches!(self.state(), StreamState::Killing | StreamState::Killed)
    }

    /// The stream URL.
    pub fn url(&self) -> String {
        self.core.url.lock().to_string()
    }

    /// Replaces the whole URL; only meaningful before open.
    pub fn set_url(&self, url: &str) -> bool {
        match Url::parse(url) {
            Ok(parsed) if parsed.scheme() == self.core.url.lock().scheme() => {
                *self.core.url.lock() = parsed;
                true
            }
            _ => false,
        }
    }

    /// Host component of the URL.
    pub fn host(&self) -> String {
        self.core.url.lock().host().to_string()
    }

    pub fn set_host(&self, host: &str) {
        self.core.url.lock().set_host(host);
    }

    /// Port component of the URL.
    pub fn port(&self) -> u16 {
        self.core.url.lock().port()
    }

    pub fn set_port(&self, port: u16) {
        self.core.url.lock().set_port(port);
    }

    /// Path component of the URL.
    pub fn path(&self) -> String {
        self.core.url.lock().path().to_string()
    }

    pub fn set_path(&self, path: &str) {
        self.core.url.lock().set_path(path);
    }

    /// Whether the URL requests TLS.
    pub fn is_ssl(&self) -> bool {
        self.core.url.lock().is_ssl()
    }

    pub fn set_ssl(&self, ssl: bool) {
        self.core.url.lock().set_ssl(ssl);
    }

    /// The default operation timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.core.timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.core
            .timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Total size when the backend knows it; -1 for unbounded or unknown.
    pub fn size(&self) -> i64 {
        self.core.size_hint.load(Ordering::Relaxed)
    }

    /// Byte position after the last completed read or write.
    pub fn offset(&self) -> u64 {
        self.core.offset.load(Ordering::Relaxed)
    }

    /// Read cache limit; zero reads straight into per-call buffers.
    pub fn set_read_cache(&self, max: usize) {
        self.core.rcache_max.store(max, Ordering::Relaxed);
    }

    /// Write cache limit; zero writes through immediately.
    pub fn set_write_cache(&self, max: usize) {
        self.core.wcache_max.store(max, Ordering::Relaxed);
    }

    // ---- open -----------------------------------------------------------

    /// Begins opening the stream. The callback fires exactly once with the
    /// final state. Returns false when the stream is not closed.
    pub fn open(&self, func: OpenFunc) -> bool {
        if !self.cas_state(StreamState::Closed, StreamState::Opening) {
            warn!("stream open: not closed ({:?})", self.state());
            return false;
        }
        trace!("stream: opening {}", self.url());
        let this = self.clone();
        let ok = match self.core.kind {
            BackendKind::Data => data::open(&this, func),
            BackendKind::File => file::open(&this, func),
            BackendKind::Sock => sock::open(&this, func),
            BackendKind::Http => http::open(&this, func),
            BackendKind::Filter => filter::open(&this, func),
        };
        if !ok {
            self.set_state(StreamState::Closed);
        }
        ok
    }

    /// Attempts a synchronous open. True iff the stream is `opened` on
    /// return; backends that must touch the network always return false.
    pub fn open_try(&self) -> bool {
        if self.state() == StreamState::Opened {
            return true;
        }
        if !self.cas_state(StreamState::Closed, StreamState::Opening) {
            return false;
        }
        let ok = match self.core.kind {
            BackendKind::Data => data::open_try(self),
            BackendKind::File => file::open_try(self),
            _ => false,
        };
        self.set_state(if ok {
            StreamState::Opened
        } else {
            StreamState::Closed
        });
        ok
    }

    // Shared completion for backend opens.
    pub(crate) fn open_done(&self, state: State, func: OpenFunc) {
        let killed = self.is_killed();
        let state = if killed && state != State::Ok {
            State::Killed
        } else {
            state
        };
        if state == State::Ok && !killed {
            self.set_state(StreamState::Opened);
            trace!("stream: opened {}", self.url());
            func(self, State::Ok);
        } else {
            // Failed or killed mid-opening: fold back before reporting, so
            // the callback observes a stream it can reopen.
            self.close_backend_quietly();
            self.set_state(if killed {
                StreamState::Killed
            } else {
                StreamState::Closed
            });
            trace!("stream: open failed ({})", state);
            func(self, if state == State::Ok { State::Killed } else { state });
        }
        // A close requested mid-opening runs only now, after the open
        // callback observed its state.
        let pending = self.core.pending_clos.lock().take();
        if let Some(func) = pending {
            let _ = self.clos(func);
        }
    }

    // ---- read / write / seek / sync / task ------------------------------

    /// Posts a read of up to `size` bytes. The callback may continue the
    /// read by returning true; end of stream arrives as `closed`.
    pub fn read(&self, size: usize, func: ReadFunc) -> bool {
        if self.state() != StreamState::Opened {
            return false;
        }
        // A read observing cached writes must flush them first.
        if !self.core.wcache.lock().is_empty() {
            let this = self.clone();
            return self.sync_impl(
                false,
                Box::new(move |stream: &AsyncStream, state: State| {
                    if state == State::Ok {
                        let _ = this.read_impl(size, func);
                    } else {
                        let mut func = func;
                        let _ = func(stream, state, &[]);
                    }
                }),
            );
        }
        self.read_impl(size, func)
    }

    fn read_impl(&self, size: usize, func: ReadFunc) -> bool {
        let rcache_max = self.core.rcache_max.load(Ordering::Relaxed);
        let size = if rcache_max > 0 {
            size.min(rcache_max)
        } else {
            size
        };
        let this = self.clone();
        match self.core.kind {
            BackendKind::Data => data::read(&this, size, func),
            BackendKind::File => file::read(&this, size, func),
            BackendKind::Sock => sock::read(&this, size, func),
            BackendKind::Http => http::read(&this, size, func),
            BackendKind::Filter => filter::read(&this, size, func),
        }
    }

    /// Posts a write. With a write cache configured, the bytes are appended
    /// to the cache first; once the cache crosses its limit the combined
    /// buffer flushes to the backend as one write, so a caller's bytes are
    /// never left buffered past their own round.
    pub fn write(&self, data: &[u8], func: WriteFunc) -> bool {
        if self.state() != StreamState::Opened {
            return false;
        }
        let wcache_max = self.core.wcache_max.load(Ordering::Relaxed);
        if wcache_max > 0 {
            let flush = {
                let mut wcache = self.core.wcache.lock();
                wcache.extend_from_slice(data);
                if wcache.len() < wcache_max {
                    None
                } else {
                    Some(std::mem::take(&mut *wcache))
                }
            };
            match flush {
                None => {
                    // Absorbed; report completion inline.
                    let mut func = func;
                    let _ = func(self, State::Ok, data.len(), data.len());
                    return true;
                }
                Some(combined) => {
                    // The cache filled: drive everything accepted so far,
                    // this write's bytes included, to the backend.
                    let reported = data.len();
                    let mut slot = Some(func);
                    return self.write_impl(
                        combined,
                        Box::new(move |stream: &AsyncStream, state: State, real, size| {
                            let mut func = match slot.take() {
                                Some(func) => func,
                                None => return false,
                            };
                            if state == State::Ok && real == size {
                                let _ = func(stream, State::Ok, reported, reported);
                            } else {
                                let _ = func(stream, state, 0, reported);
                            }
                            false
                        }),
                    );
                }
            }
        }
        self.write_impl(data.to_vec(), func)
    }

    fn write_impl(&self, data: Vec<u8>, func: WriteFunc) -> bool {
        let this = self.clone();
        match self.core.kind {
            BackendKind::Data => data::write(&this, data, func),
            BackendKind::File => file::write(&this, data, func),
            BackendKind::Sock => sock::write(&this, data, func),
            BackendKind::Http => http::write(&this, data, func),
            BackendKind::Filter => filter::write(&this, data, func),
        }
    }

    /// Seeks to an absolute offset. Seeking to the current offset succeeds
    /// synchronously; a non-empty write cache is drained first.
    pub fn seek(&self, offset: u64, func: SeekFunc) -> bool {
        if self.state() != StreamState::Opened {
            return false;
        }
        if !self.core.wcache.lock().is_empty() {
            let this = self.clone();
            return self.sync_impl(
                false,
                Box::new(move |stream: &AsyncStream, state: State| {
                    if state == State::Ok {
                        let _ = this.seek_impl(offset, func);
                    } else {
                        func(stream, state, this.offset());
                    }
                }),
            );
        }
        self.seek_impl(offset, func)
    }

    fn seek_impl(&self, offset: u64, func: SeekFunc) -> bool {
        if offset == self.offset() {
            func(self, State::Ok, offset);
            return true;
        }
        let this = self.clone();
        match self.core.kind {
            BackendKind::Data => data::seek(&this, offset, func),
            BackendKind::File => file::seek(&this, offset, func),
            BackendKind::Sock => {
                func(&this, State::NotSupported, this.offset());
                true
            }
            BackendKind::Http => http::seek(&this, offset, func),
            BackendKind::Filter => {
                func(&this, State::NotSupported, this.offset());
                true
            }
        }
    }

    /// Flushes the write cache and the backend.
    pub fn sync(&self, func: SyncFunc) -> bool {
        if self.state() != StreamState::Opened {
            return false;
        }
        self.sync_impl(false, func)
    }

    /// Flush variant used while closing; backends may write trailers.
    pub fn sync_closing(&self, func: SyncFunc) -> bool {
        if self.state() != StreamState::Opened {
            return false;
        }
        self.sync_impl(true, func)
    }

    fn sync_impl(&self, closing: bool, func: SyncFunc) -> bool {
        let cached = std::mem::take(&mut *self.core.wcache.lock());
        if cached.is_empty() {
            return self.backend_sync(closing, func);
        }
        let this = self.clone();
        let mut slot = Some(func);
        self.write_impl(
            cached,
            Box::new(move |stream: &AsyncStream, state: State, real, size| {
                let func = match slot.take() {
                    Some(func) => func,
                    None => return false,
                };
                if state == State::Ok && real == size {
                    let _ = this.backend_sync(closing, func);
                } else {
                    func(stream, state);
                }
                false
            }),
        )
    }

    fn backend_sync(&self, closing: bool, func: SyncFunc) -> bool {
        let this = self.clone();
        match self.core.kind {
            BackendKind::Data => data::sync(&this, closing, func),
            BackendKind::File => file::sync(&this, closing, func),
            BackendKind::Sock => sock::sync(&this, closing, func),
            BackendKind::Http => http::sync(&this, closing, func),
            BackendKind::Filter => filter::sync(&this, closing, func),
        }
    }

    /// Runs a callback on the proactor after `delay`. Returning true from
    /// the callback re-arms it.
    pub fn task(&self, delay: Duration, func: TaskFunc) -> bool {
        if self.state() != StreamState::Opened {
            return false;
        }
        let this = self.clone();
        match self.core.kind {
            BackendKind::Data => data::task(&this, delay, func),
            BackendKind::File => file::task(&this, delay, func),
            BackendKind::Sock => sock::task(&this, delay, func),
            BackendKind::Http => http::task(&this, delay, func),
            BackendKind::Filter => filter::task(&this, delay, func),
        }
    }

    // ---- chained operations ---------------------------------------------

    /// Opens the stream, then reads. An already opened stream reads
    /// directly.
    pub fn open_read(&self, size: usize, func: ReadFunc) -> bool {
        if self.state() == StreamState::Opened {
            return self.read(size, func);
        }
        let this = self.clone();
        let mut slot = Some(func);
        self.open(Box::new(move |stream: &AsyncStream, state: State| {
            let mut func = match slot.take() {
                Some(func) => func,
                None => return,
            };
            if state == State::Ok {
                let _ = this.read(size, func);
            } else {
                let _ = func(stream, state, &[]);
            }
        }))
    }

    /// Opens the stream, then writes.
    pub fn open_write(&self, data: &[u8], func: WriteFunc) -> bool {
        if self.state() == StreamState::Opened {
            return self.write(data, func);
        }
        let this = self.clone();
        let data = data.to_vec();
        let mut slot = Some(func);
        self.open(Box::new(move |stream: &AsyncStream, state: State| {
            let mut func = match slot.take() {
                Some(func) => func,
                None => return,
            };
            if state == State::Ok {
                let _ = this.write(&data, func);
            } else {
                let _ = func(stream, state, 0, data.len());
            }
        }))
    }

    /// Opens the stream, then seeks.
    pub fn open_seek(&self, offset: u64, func: SeekFunc) -> bool {
        if self.state() == StreamState::Opened {
            return self.seek(offset, func);
        }
        let this = self.clone();
        let mut slot = Some(func);
        self.open(Box::new(move |stream: &AsyncStream, state: State| {
            let func = match slot.take() {
                Some(func) => func,
                None => return,
            };
            if state == State::Ok {
                let _ = this.seek(offset, func);
            } else {
                func(stream, state, 0);
            }
        }))
    }

    // ---- close / kill / exit -------------------------------------------

    /// Begins closing the stream. Pending operations are aborted with
    /// `killed` before the close callback fires.
    pub fn clos(&self, func: ClosFunc) -> bool {
        let killed = self.is_killed();
        if !killed && !self.cas_state(StreamState::Opened, StreamState::Closed) {
            match self.state() {
                // Closing a closed stream succeeds trivially.
                StreamState::Closed => {
                    func(self, State::Ok);
                    return true;
                }
                // Mid-open: park the close, abort the open; the open
                // callback fires first with its recorded state.
                StreamState::Opening => {
                    *self.core.pending_clos.lock() = Some(func);
                    self.kill();
                    return true;
                }
                _ => return false,
            }
        }
        let this = self.clone();
        let ok = match self.core.kind {
            BackendKind::Data => data::clos(&this, func),
            BackendKind::File => file::clos(&this, func),
            BackendKind::Sock => sock::clos(&this, func),
            BackendKind::Http => http::clos(&this, func),
            BackendKind::Filter => filter::clos(&this, func),
        };
        if ok {
            self.core.offset.store(0, Ordering::Relaxed);
            self.core.wcache.lock().clear();
            self.set_state(if killed {
                StreamState::Killed
            } else {
                StreamState::Closed
            });
        }
        ok
    }

    /// Attempts a synchronous close. True iff the stream reads `closed`
    /// afterwards.
    pub fn clos_try(&self) -> bool {
        match self.state() {
            StreamState::Closed | StreamState::Killed => return true,
            StreamState::Opening => return false,
            _ => {}
        }
        if self.core.inflight.load(Ordering::Acquire) != 0 {
            return false;
        }
        self.clos(Box::new(|_, _| {}))
    }

    /// Kills the stream: cancels resolution, handshakes, and outstanding
    /// I/O. Pending callbacks observe `killed`.
    pub fn kill(&self) {
        let from = self.state();
        let moved = match from {
            StreamState::Opened => self.cas_state(StreamState::Opened, StreamState::Killing),
            StreamState::Opening => self.cas_state(StreamState::Opening, StreamState::Killing),
            StreamState::Closed => {
                let _ = self.cas_state(StreamState::Closed, StreamState::Killed);
                return;
            }
            _ => false,
        };
        if !moved {
            return;
        }
        trace!("stream: killing {}", self.url());
        let this = self.clone();
        match self.core.kind {
            BackendKind::Data => data::kill(&this),
            BackendKind::File => file::kill(&this),
            BackendKind::Sock => sock::kill(&this),
            BackendKind::Http => http::kill(&this),
            BackendKind::Filter => filter::kill(&this),
        }
    }

    /// Kills the stream and waits for it to close, polling `clos_try` a
    /// bounded number of times. Returns false if the stream would not
    /// drain; the stream is leaked in that case rather than torn down
    /// under a live operation.
    pub fn exit(self) -> bool {
        self.kill();
        for _ in 0..EXIT_ROUNDS {
            if self.clos_try() {
                return true;
            }
            std::thread::sleep(EXIT_SPACING);
        }
        warn!("stream exit: still busy, refusing to tear down");
        false
    }

    // Fire-and-forget backend close for failed opens.
    pub(crate) fn close_backend_quietly(&self) {
        let this = self.clone();
        match self.core.kind {
            BackendKind::Data => data::close_quietly(&this),
            BackendKind::File => file::close_quietly(&this),
            BackendKind::Sock => sock::close_quietly(&this),
            BackendKind::Http => http::close_quietly(&this),
            BackendKind::Filter => filter::close_quietly(&this),
        }
    }

    // ---- helpers shared with the backends ------------------------------

    pub(crate) fn op_begin(&self) {
        self.core.inflight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn op_end(&self) {
        self.core.inflight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Takes (or allocates) the reusable read buffer.
    pub(crate) fn take_rcache(&self, size: usize) -> Vec<u8> {
        let mut rcache = self.core.rcache.lock();
        match rcache.take() {
            Some(mut buf) if self.core.rcache_max.load(Ordering::Relaxed) > 0 => {
                buf.resize(size, 0);
                buf
            }
            Some(buf) => {
                drop(buf);
                vec![0u8; size]
            }
            None => vec![0u8; size],
        }
    }

    pub(crate) fn put_rcache(&self, buf: Vec<u8>) {
        if self.core.rcache_max.load(Ordering::Relaxed) > 0 {
            *self.core.rcache.lock() = Some(buf);
        }
    }

    pub(crate) fn advance_offset(&self, bytes: usize) {
        self.core.offset.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn post(
        &self,
        aico: Aico,
        op: Op,
        func: crate::aico::AicoFunc,
    ) -> bool {
        self.core.aicp.post(aico, op, Some(self.timeout()), func)
    }
}
