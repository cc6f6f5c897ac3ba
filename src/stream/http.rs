//! HTTP stream backend.
//!
//! Every operation delegates to an external asynchronous HTTP client
//! consumed through the [`HttpClient`] interface; the backend only
//! maintains the stream bookkeeping around it: the size hint from the
//! response metadata, the local offset, and the option forwarding.

use std::sync::atomic::Ordering;
use std::time::Duration;

use log::trace;

use crate::stream::{
    AsyncStream, Backend, ClosFunc, OpenFunc, ReadFunc, SeekFunc, StreamState, SyncFunc, TaskFunc,
    WriteFunc,
};
use crate::State;

/// Response metadata the stream consumes from the client after open.
#[derive(Clone, Debug, Default)]
pub struct HttpResponseInfo {
    /// Declared document size; negative when unknown.
    pub document_size: i64,
    /// Body is gzip-coded.
    pub gzip: bool,
    /// Body is deflate-coded.
    pub deflate: bool,
    /// Body uses chunked transfer coding.
    pub chunked: bool,
}

/// Options forwarded verbatim to the client through the ctrl surface.
pub enum HttpOption<'a> {
    Method(&'a str),
    Header(&'a str, &'a str),
    Range(u64, i64),
    Version(u8),
    Redirect(usize),
    Cookies(bool),
    PostUrl(&'a str),
    PostData(&'a [u8]),
    /// Bytes-per-second cap applied while posting.
    PostRate(usize),
    AutoUnzip(bool),
    Timeout(Duration),
}

/// An asynchronous HTTP request/response client, external to the engine.
///
/// Completion callbacks fire exactly once (per chunk for `read`) and may
/// run on any thread the client owns.
pub trait HttpClient: Send {
    /// Performs the request for `url`; the callback receives the final
    /// state and the response metadata.
    fn open(&mut self, url: &str, func: Box<dyn FnOnce(State, HttpResponseInfo) + Send>) -> bool;

    /// Pulls the next body chunk. Returning true from the callback
    /// continues with the following chunk.
    fn read(&mut self, size: usize, func: Box<dyn FnMut(State, &[u8]) -> bool + Send>) -> bool;

    /// Re-issues the request with a byte range starting at `offset`.
    fn seek(&mut self, offset: u64, func: Box<dyn FnOnce(State, u64) + Send>) -> bool;

    /// Closes the request.
    fn clos(&mut self, func: Box<dyn FnOnce(State) + Send>) -> bool;

    /// Aborts everything in flight.
    fn kill(&mut self);

    /// Applies one request option.
    fn ctrl(&mut self, option: HttpOption<'_>) -> bool;
}

pub(crate) struct HttpBackend {
    pub client: Option<Box<dyn HttpClient>>,
}

impl HttpBackend {
    pub fn new(client: Box<dyn HttpClient>) -> HttpBackend {
        HttpBackend {
            client: Some(client),
        }
    }
}

impl AsyncStream {
    /// Forwards an HTTP option to the client behind an HTTP stream.
    pub fn http_ctrl(&self, option: HttpOption<'_>) -> bool {
        let mut client = match take_client(self) {
            Some(client) => client,
            None => return false,
        };
        let ok = client.ctrl(option);
        put_client(self, client);
        ok
    }
}

fn take_client(stream: &AsyncStream) -> Option<Box<dyn HttpClient>> {
    match &mut *stream.core.backend.lock() {
        Backend::Http(state) => state.client.take(),
        _ => None,
    }
}

fn put_client(stream: &AsyncStream, client: Box<dyn HttpClient>) {
    if let Backend::Http(state) = &mut *stream.core.backend.lock() {
        state.client = Some(client);
    }
}

pub(crate) fn open(stream: &AsyncStream, func: OpenFunc) -> bool {
    let mut client = match take_client(stream) {
        Some(client) => client,
        None => {
            stream.open_done(State::Failed, func);
            return true;
        }
    };
    let url = stream.url();
    let this = stream.clone();
    let mut slot = Some(func);
    let started = client.open(
        &url,
        Box::new(move |state, info| {
            let func = match slot.take() {
                Some(func) => func,
                None => return,
            };
            if state == State::Ok {
                // The declared size only holds for an identity body.
                let size = if info.gzip || info.deflate || info.chunked {
                    -1
                } else {
                    info.document_size
                };
                this.core.size_hint.store(size, Ordering::Relaxed);
                this.core.offset.store(0, Ordering::Relaxed);
                trace!("http: opened, size {}", size);
            }
            this.open_done(state, func);
        }),
    );
    put_client(stream, client);
    if !started {
        stream.open_done(State::Failed, Box::new(|_: &AsyncStream, _: State| {}));
    }
    true
}

pub(crate) fn read(stream: &AsyncStream, size: usize, func: ReadFunc) -> bool {
    let mut client = match take_client(stream) {
        Some(client) => client,
        None => return false,
    };
    let this = stream.clone();
    let mut func = func;
    let ok = client.read(
        size,
        Box::new(move |state, data| {
            if state == State::Ok {
                this.advance_offset(data.len());
            }
            func(&this, state, data) && this.state() == StreamState::Opened
        }),
    );
    put_client(stream, client);
    ok
}

pub(crate) fn write(stream: &AsyncStream, data: Vec<u8>, func: WriteFunc) -> bool {
    // Request bodies travel through the post options, not stream writes.
    let mut func = func;
    let _ = func(stream, State::NotSupported, 0, data.len());
    true
}

pub(crate) fn seek(stream: &AsyncStream, offset: u64, func: SeekFunc) -> bool {
    let mut client = match take_client(stream) {
        Some(client) => client,
        None => return false,
    };
    let this = stream.clone();
    let mut slot = Some(func);
    let ok = client.seek(
        offset,
        Box::new(move |state, at| {
            if let Some(func) = slot.take() {
                if state == State::Ok {
                    this.core.offset.store(at, Ordering::Relaxed);
                }
                func(&this, state, at);
            }
        }),
    );
    put_client(stream, client);
    ok
}

pub(crate) fn sync(stream: &AsyncStream, _closing: bool, func: SyncFunc) -> bool {
    // Nothing is buffered on this side of the client.
    func(stream, State::Ok);
    true
}

pub(crate) fn task(stream: &AsyncStream, _delay: Duration, mut func: TaskFunc) -> bool {
    let _ = func(stream, State::NotSupported);
    true
}

pub(crate) fn clos(stream: &AsyncStream, func: ClosFunc) -> bool {
    let mut client = match take_client(stream) {
        Some(client) => client,
        None => {
            func(stream, State::Ok);
            return true;
        }
    };
    let this = stream.clone();
    let mut slot = Some(func);
    let started = client.clos(Box::new(move |state| {
        if let Some(func) = slot.take() {
            func(&this, state);
        }
    }));
    put_client(stream, client);
    if !started {
        return false;
    }
    true
}

pub(crate) fn close_quietly(stream: &AsyncStream) {
    if let Some(mut client) = take_client(stream) {
        let _ = client.clos(Box::new(|_| {}));
        put_client(stream, client);
    }
}

pub(crate) fn kill(stream: &AsyncStream) {
    if let Some(mut client) = take_client(stream) {
        client.kill();
        put_client(stream, client);
    }
}
