//! TCP/UDP stream backend.
//!
//! Opening a TCP stream resolves the host, takes a socket (from the
//! process pool when one fits), connects, and optionally runs the SSL
//! engine's handshake when the URL asks for TLS. UDP skips the connect and
//! rejects TLS. A keep-alive stream returns its socket to the pool on
//! close instead of destroying it.
//!
//! DNS resolution and TLS record processing are external: the engine
//! consumes them through the [`Resolver`] and [`SslEngine`] interfaces.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{trace, warn};

use crate::aico::{Aico, Op};
use crate::endpoint::Endpoint;
use crate::stream::{
    AsyncStream, Backend, ClosFunc, OpenFunc, ReadFunc, SeekFunc, StreamState, SyncFunc, TaskFunc,
    WriteFunc,
};
use crate::State;

/// Transport selected by the URL (`?tcp=` / `?udp=`) or by ctrl.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SockType {
    Tcp,
    Udp,
}

/// Asynchronous host resolution, consumed during TCP connect.
///
/// Implementations must invoke the callback exactly once, from any thread.
pub trait Resolver: Send + Sync {
    fn resolve(
        &self,
        host: &str,
        timeout: Duration,
        func: Box<dyn FnOnce(io::Result<Endpoint>) + Send>,
    );
}

/// Default resolver: one short-lived thread per lookup around the blocking
/// platform resolver.
pub struct ThreadResolver;

impl Resolver for ThreadResolver {
    fn resolve(
        &self,
        host: &str,
        _timeout: Duration,
        func: Box<dyn FnOnce(io::Result<Endpoint>) + Send>,
    ) {
        let host = host.to_string();
        let spawned = std::thread::Builder::new()
            .name("cio-resolve".to_string())
            .spawn(move || func(crate::net::addrinfo::addr(&host)));
        if let Err(err) = spawned {
            warn!("resolver thread spawn failed: {}", err);
        }
    }
}

/// Asynchronous TLS record processing layered onto a TCP stream.
///
/// The engine drives the handshake during open and routes reads and writes
/// through the engine once it is up; everything else about TLS is the
/// implementation's business.
pub trait SslEngine: Send {
    fn open(&mut self, func: Box<dyn FnOnce(State) + Send>) -> bool;
    fn clos(&mut self, func: Box<dyn FnOnce(State) + Send>) -> bool;
    fn read(&mut self, size: usize, func: Box<dyn FnMut(State, &[u8]) -> bool + Send>) -> bool;
    fn writ(&mut self, data: &[u8], func: Box<dyn FnMut(State, usize, usize) -> bool + Send>)
        -> bool;
    fn kill(&mut self);
}

pub(crate) struct SockBackend {
    pub ty: SockType,
    pub aico: Option<Aico>,
    pub addr: Option<Endpoint>,
    pub bind: Option<Endpoint>,
    pub ssl: Option<Box<dyn SslEngine>>,
    pub ssl_up: bool,
    pub keep_alive: bool,
    pub resolver: Arc<dyn Resolver>,
}

impl SockBackend {
    pub fn new() -> SockBackend {
        SockBackend {
            ty: SockType::Tcp,
            aico: None,
            addr: None,
            bind: None,
            ssl: None,
            ssl_up: false,
            keep_alive: false,
            resolver: Arc::new(ThreadResolver),
        }
    }
}

impl AsyncStream {
    /// Selects TCP or UDP; only meaningful before open. The URL arguments
    /// `?tcp=` and `?udp=` override this at open time.
    pub fn set_sock_type(&self, ty: SockType) -> bool {
        let mut backend = self.core.backend.lock();
        match &mut *backend {
            Backend::Sock(state) => {
                state.ty = ty;
                true
            }
            _ => false,
        }
    }

    /// The selected transport.
    pub fn sock_type(&self) -> Option<SockType> {
        match &*self.core.backend.lock() {
            Backend::Sock(state) => Some(state.ty),
            _ => None,
        }
    }

    /// Recycles the socket into the process pool on close instead of
    /// destroying it.
    pub fn set_keep_alive(&self, keep_alive: bool) -> bool {
        let mut backend = self.core.backend.lock();
        match &mut *backend {
            Backend::Sock(state) => {
                state.keep_alive = keep_alive;
                true
            }
            _ => false,
        }
    }

    /// Binds the socket to a local endpoint before use; needed for UDP
    /// receivers.
    pub fn set_bind(&self, endpoint: Endpoint) -> bool {
        let mut backend = self.core.backend.lock();
        match &mut *backend {
            Backend::Sock(state) => {
                state.bind = Some(endpoint);
                true
            }
            _ => false,
        }
    }

    /// Installs the SSL engine used when the URL requests TLS.
    pub fn set_ssl_engine(&self, engine: Box<dyn SslEngine>) -> bool {
        let mut backend = self.core.backend.lock();
        match &mut *backend {
            Backend::Sock(state) => {
                state.ssl = Some(engine);
                true
            }
            _ => false,
        }
    }

    /// Replaces the resolver used during TCP connect.
    pub fn set_resolver(&self, resolver: Arc<dyn Resolver>) -> bool {
        let mut backend = self.core.backend.lock();
        match &mut *backend {
            Backend::Sock(state) => {
                state.resolver = resolver;
                true
            }
            _ => false,
        }
    }
}

fn aico_of(stream: &AsyncStream) -> Option<Aico> {
    match &*stream.core.backend.lock() {
        Backend::Sock(state) => state.aico,
        _ => None,
    }
}

fn peer_of(stream: &AsyncStream) -> Option<Endpoint> {
    match &*stream.core.backend.lock() {
        Backend::Sock(state) => state.addr,
        _ => None,
    }
}

fn ssl_wanted(stream: &AsyncStream) -> bool {
    stream.core.url.lock().is_ssl()
}

// Takes the engine out for a call; sock operations are serialized so the
// slot is never contended.
fn take_ssl(stream: &AsyncStream) -> Option<Box<dyn SslEngine>> {
    match &mut *stream.core.backend.lock() {
        Backend::Sock(state) => state.ssl.take(),
        _ => None,
    }
}

fn put_ssl(stream: &AsyncStream, engine: Box<dyn SslEngine>) {
    if let Backend::Sock(state) = &mut *stream.core.backend.lock() {
        state.ssl = Some(engine);
    }
}

fn ssl_up(stream: &AsyncStream) -> bool {
    match &*stream.core.backend.lock() {
        Backend::Sock(state) => state.ssl_up,
        _ => false,
    }
}

pub(crate) fn open(stream: &AsyncStream, func: OpenFunc) -> bool {
    let (host, port, ty, resolver) = {
        let url = stream.core.url.lock();
        let mut backend = stream.core.backend.lock();
        let state = match &mut *backend {
            Backend::Sock(state) => state,
            _ => return false,
        };
        // The URL's transport argument wins over the ctrl setting.
        if url.arg("udp").is_some() {
            state.ty = SockType::Udp;
        } else if url.arg("tcp").is_some() {
            state.ty = SockType::Tcp;
        }
        (
            url.host().to_string(),
            url.port(),
            state.ty,
            Arc::clone(&state.resolver),
        )
    };
    if host.is_empty() || port == 0 {
        stream.open_done(State::InvalidArgument, func);
        return true;
    }
    if ty == SockType::Udp && ssl_wanted(stream) {
        // The platform gives no TLS over datagrams here.
        stream.open_done(State::NotSupported, func);
        return true;
    }

    trace!("sock: resolving {}", host);
    let this = stream.clone();
    let mut slot = Some(func);
    resolver.resolve(
        &host,
        stream.timeout(),
        Box::new(move |resolved| {
            let func = match slot.take() {
                Some(func) => func,
                None => return,
            };
            if this.is_killed() {
                this.open_done(State::Killed, func);
                return;
            }
            match resolved {
                Ok(mut addr) => {
                    addr.set_port(port);
                    connect(&this, addr, func);
                }
                Err(err) => {
                    trace!("sock: dns failed: {}", err);
                    this.open_done(State::DnsFailed, func);
                }
            }
        }),
    );
    true
}

// Socket creation and (for TCP) the connect posting.
fn connect(stream: &AsyncStream, addr: Endpoint, func: OpenFunc) {
    let ty = match &*stream.core.backend.lock() {
        Backend::Sock(state) => state.ty,
        _ => {
            stream.open_done(State::Failed, func);
            return;
        }
    };
    let domain = match addr {
        Endpoint::V4(..) => socket2::Domain::IPV4,
        Endpoint::V6(..) => socket2::Domain::IPV6,
        Endpoint::Unspec => {
            stream.open_done(State::DnsFailed, func);
            return;
        }
    };
    let sock_ty = match ty {
        SockType::Tcp => socket2::Type::STREAM,
        SockType::Udp => socket2::Type::DGRAM,
    };

    // Prefer a pooled keep-alive socket over a fresh one.
    let sock = crate::env::pool_get(domain, sock_ty)
        .map(Ok)
        .unwrap_or_else(|| socket2::Socket::new(domain, sock_ty, None));
    let sock = match sock {
        Ok(sock) => sock,
        Err(err) => {
            trace!("sock: socket creation failed: {}", err);
            stream.open_done(State::from_io_error(&err), func);
            return;
        }
    };

    let bind = match &*stream.core.backend.lock() {
        Backend::Sock(state) => state.bind,
        _ => None,
    };
    if let Some(bind) = bind {
        let std_addr: Result<std::net::SocketAddr, _> = bind.try_into();
        let bound = match std_addr {
            Ok(std_addr) => sock.bind(&std_addr.into()),
            Err(_) => Err(io::Error::new(io::ErrorKind::InvalidInput, "unspec bind")),
        };
        if let Err(err) = bound {
            stream.open_done(State::from_io_error(&err), func);
            return;
        }
    }

    let aico = match stream.core.aicp.attach_socket(sock) {
        Ok(aico) => aico,
        Err(err) => {
            stream.open_done(State::from_io_error(&err), func);
            return;
        }
    };
    {
        let mut backend = stream.core.backend.lock();
        if let Backend::Sock(state) = &mut *backend {
            state.aico = Some(aico);
            state.addr = Some(addr);
        }
    }
    stream.core.offset.store(0, Ordering::Relaxed);

    match ty {
        SockType::Udp => {
            // Nothing to connect; deliver the open on the worker.
            let this = stream.clone();
            let mut slot = Some(func);
            this.op_begin();
            let posted = stream.core.aicp.run_after(
                aico,
                Duration::ZERO,
                Box::new(move |aice| {
                    this.op_end();
                    if let Some(func) = slot.take() {
                        this.open_done(aice.state, func);
                    }
                    false
                }),
            );
            if !posted {
                stream.op_end();
                // The proactor refused; report through the normal path.
                let func: OpenFunc = Box::new(|_: &AsyncStream, _: State| {});
                stream.open_done(State::Killed, func);
            }
        }
        SockType::Tcp => {
            trace!("sock: connecting {}", addr);
            let this = stream.clone();
            let mut slot = Some(func);
            this.op_begin();
            let posted = stream.post(
                aico,
                Op::Conn(addr),
                Box::new(move |aice| {
                    this.op_end();
                    let func = match slot.take() {
                        Some(func) => func,
                        None => return false,
                    };
                    match aice.state {
                        State::Ok if ssl_wanted(&this) => ssl_open(&this, func),
                        state => this.open_done(state, func),
                    }
                    false
                }),
            );
            if !posted {
                stream.op_end();
                stream.open_done(State::Killed, func_noop());
            }
        }
    }
}

fn func_noop() -> OpenFunc {
    Box::new(|_: &AsyncStream, _: State| {})
}

fn ssl_open(stream: &AsyncStream, func: OpenFunc) {
    let mut engine = match take_ssl(stream) {
        Some(engine) => engine,
        None => {
            warn!("sock: url requests tls but no ssl engine is installed");
            stream.open_done(State::NotSupported, func);
            return;
        }
    };
    let this = stream.clone();
    let mut slot = Some(func);
    let started = engine.open(Box::new(move |state| {
        if let Some(func) = slot.take() {
            if state == State::Ok {
                if let Backend::Sock(inner) = &mut *this.core.backend.lock() {
                    inner.ssl_up = true;
                }
                this.open_done(State::Ok, func);
            } else {
                this.open_done(State::SslFailed, func);
            }
        }
    }));
    put_ssl(stream, engine);
    if !started {
        // The engine never calls back; surface the failure ourselves. The
        // slot above was moved into the engine's callback, so fold through
        // the state machine directly.
        stream.open_done(State::SslFailed, func_noop());
    }
}

pub(crate) fn read(stream: &AsyncStream, size: usize, func: ReadFunc) -> bool {
    if ssl_up(stream) {
        let mut engine = match take_ssl(stream) {
            Some(engine) => engine,
            None => return false,
        };
        let this = stream.clone();
        let mut func = func;
        let ok = engine.read(
            size,
            Box::new(move |state, data| {
                if state == State::Ok {
                    this.advance_offset(data.len());
                }
                func(&this, state, data)
            }),
        );
        put_ssl(stream, engine);
        return ok;
    }

    let aico = match aico_of(stream) {
        Some(aico) => aico,
        None => return false,
    };
    let ty = stream.sock_type().unwrap_or(SockType::Tcp);
    let buf = stream.take_rcache(size.max(1));
    let op = match ty {
        SockType::Tcp => Op::Recv(buf),
        SockType::Udp => Op::Urecv(buf),
    };
    let this = stream.clone();
    let mut func = func;
    this.op_begin();
    let posted = stream.post(
        aico,
        op,
        Box::new(move |aice| {
            let state = aice.state;
            let again = match state {
                State::Ok => {
                    let real = aice.bytes();
                    this.advance_offset(real);
                    func(&this, State::Ok, aice.data().unwrap_or(&[]))
                }
                state => {
                    func(&this, state, &[]);
                    false
                }
            };
            let again = again && state == State::Ok && this.state() == StreamState::Opened;
            if !again {
                this.op_end();
                if let Some(buf) = aice.take_buf() {
                    this.put_rcache(buf);
                }
            }
            again
        }),
    );
    if !posted {
        stream.op_end();
    }
    posted
}

pub(crate) fn write(stream: &AsyncStream, data: Vec<u8>, func: WriteFunc) -> bool {
    if ssl_up(stream) {
        let mut engine = match take_ssl(stream) {
            Some(engine) => engine,
            None => return false,
        };
        let this = stream.clone();
        let mut func = func;
        let ok = engine.writ(
            &data,
            Box::new(move |state, real, size| {
                if state == State::Ok {
                    this.advance_offset(real);
                }
                func(&this, state, real, size)
            }),
        );
        put_ssl(stream, engine);
        return ok;
    }

    let aico = match aico_of(stream) {
        Some(aico) => aico,
        None => return false,
    };
    let ty = stream.sock_type().unwrap_or(SockType::Tcp);
    let op = match ty {
        SockType::Tcp => Op::Send(data),
        SockType::Udp => {
            let peer = match peer_of(stream) {
                Some(peer) => peer,
                None => return false,
            };
            Op::Usend(peer, data)
        }
    };
    let this = stream.clone();
    let mut func = func;
    this.op_begin();
    let posted = stream.post(
        aico,
        op,
        Box::new(move |aice| {
            this.op_end();
            let real = aice.bytes();
            if aice.state == State::Ok {
                this.advance_offset(real);
            }
            let _ = func(&this, aice.state, real, aice.requested());
            false
        }),
    );
    if !posted {
        stream.op_end();
    }
    posted
}

#[allow(dead_code)]
pub(crate) fn seek(stream: &AsyncStream, _offset: u64, func: SeekFunc) -> bool {
    func(stream, State::NotSupported, stream.offset());
    true
}

pub(crate) fn sync(stream: &AsyncStream, _closing: bool, func: SyncFunc) -> bool {
    // Socket writes are unbuffered below the stream cache; syncing only
    // has to round-trip the worker.
    let aico = match aico_of(stream) {
        Some(aico) => aico,
        None => return false,
    };
    let this = stream.clone();
    let mut slot = Some(func);
    this.op_begin();
    let posted = stream.core.aicp.run_after(
        aico,
        Duration::ZERO,
        Box::new(move |aice| {
            this.op_end();
            if let Some(func) = slot.take() {
                func(&this, aice.state);
            }
            false
        }),
    );
    if !posted {
        stream.op_end();
    }
    posted
}

pub(crate) fn task(stream: &AsyncStream, delay: Duration, func: TaskFunc) -> bool {
    let mut slot = Some(func);
    task_next(stream, delay, &mut slot)
}

fn task_next(stream: &AsyncStream, delay: Duration, slot: &mut Option<TaskFunc>) -> bool {
    let aico = match aico_of(stream) {
        Some(aico) => aico,
        None => return false,
    };
    let mut func = match slot.take() {
        Some(func) => func,
        None => return false,
    };
    let this = stream.clone();
    this.op_begin();
    let posted = stream.core.aicp.run_after(
        aico,
        delay,
        Box::new(move |aice| {
            this.op_end();
            if func(&this, aice.state)
                && aice.state == State::Ok
                && this.state() == StreamState::Opened
            {
                let mut slot = Some(std::mem::replace(
                    &mut func,
                    Box::new(|_: &AsyncStream, _: State| false),
                ));
                let _ = task_next(&this, delay, &mut slot);
            }
            false
        }),
    );
    if !posted {
        stream.op_end();
    }
    posted
}

pub(crate) fn clos(stream: &AsyncStream, func: ClosFunc) -> bool {
    // Shut the SSL layer down first; its close records ride the socket.
    if ssl_up(stream) {
        if let Some(mut engine) = take_ssl(stream) {
            let this = stream.clone();
            let mut slot = Some(func);
            let started = engine.clos(Box::new(move |_state| {
                if let Some(func) = slot.take() {
                    if let Backend::Sock(inner) = &mut *this.core.backend.lock() {
                        inner.ssl_up = false;
                    }
                    let _ = clos_socket(&this, func);
                }
            }));
            put_ssl(stream, engine);
            if started {
                return true;
            }
            // Fall through and close the socket anyway.
            return clos_socket(stream, Box::new(|_: &AsyncStream, _: State| {}));
        }
    }
    clos_socket(stream, func)
}

fn clos_socket(stream: &AsyncStream, func: ClosFunc) -> bool {
    let (aico, keep_alive) = {
        let mut backend = stream.core.backend.lock();
        match &mut *backend {
            Backend::Sock(state) => (state.aico.take(), state.keep_alive),
            _ => (None, false),
        }
    };
    let aico = match aico {
        Some(aico) => aico,
        None => {
            func(stream, State::Ok);
            return true;
        }
    };
    if keep_alive && !stream.is_killed() {
        // Pool-on-close-unless-killed.
        let _ = stream.core.aicp.set_keep_alive(aico, true);
    }
    let this = stream.clone();
    let mut slot = Some(func);
    stream.core.aicp.post(
        aico,
        Op::Clos,
        None,
        Box::new(move |aice| {
            if let Some(func) = slot.take() {
                func(&this, aice.state);
            }
            false
        }),
    )
}

pub(crate) fn close_quietly(stream: &AsyncStream) {
    let aico = {
        let mut backend = stream.core.backend.lock();
        match &mut *backend {
            Backend::Sock(state) => state.aico.take(),
            _ => None,
        }
    };
    if let Some(aico) = aico {
        stream
            .core
            .aicp
            .post(aico, Op::Clos, None, Box::new(|_| false));
    }
}

pub(crate) fn kill(stream: &AsyncStream) {
    if let Some(mut engine) = take_ssl(stream) {
        engine.kill();
        put_ssl(stream, engine);
    }
    if let Some(aico) = aico_of(stream) {
        stream.core.aicp.cancel(aico);
    }
}
