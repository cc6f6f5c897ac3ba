//! The proactor worker: one thread that consumes the posting queues, runs
//! platform primitives, fires timeouts, and delivers completions.
//!
//! Loop shape per iteration: take the kill list and at most one posting
//! (high-priority queue first) under the lock, service kills, dispatch the
//! posting, spak both wheels, then sleep on the selector no longer than the
//! nearest timer deadline. Synchronous primitive failures are delivered
//! through the same completion path as asynchronous ones, so callers observe
//! exactly one result per operation.

use std::sync::Arc;

use log::trace;

use crate::aico::{AiceValue, Aico, Op, OpCode};
use crate::endpoint::Endpoint;
use crate::state::State;

use super::Shared;

#[cfg(unix)]
pub(crate) fn run(shared: Arc<Shared>) {
    unix::run(shared)
}

#[cfg(windows)]
pub(crate) fn run(shared: Arc<Shared>) {
    crate::sys::windows::worker::run(shared)
}

/// A finalized platform result, fed to the completion path.
pub(crate) struct Done {
    pub state: State,
    pub real: usize,
    pub peer: Option<Endpoint>,
    pub accepted: Option<socket2::Socket>,
}

impl Done {
    pub fn state(state: State) -> Done {
        Done {
            state,
            real: 0,
            peer: None,
            accepted: None,
        }
    }

    pub fn bytes(state: State, real: usize) -> Done {
        Done {
            state,
            real,
            peer: None,
            accepted: None,
        }
    }
}

/// Applies the per-op-code completion contract to a platform state.
/// `forced` marks a state recorded by the engine itself (timeout task,
/// kill, drain) rather than observed from the platform.
pub(crate) fn adjust_state(code: OpCode, state: State, real: usize, forced: bool) -> State {
    use OpCode::*;
    match code {
        Recv | Urecv | Recvv | Urecvv | Read | Readv => match state {
            State::Ok if real > 0 => State::Ok,
            // A zero byte completion is a half shutdown (or file end).
            State::Ok => State::Closed,
            State::Reset | State::Eof => State::Closed,
            state => state,
        },
        Send | Usend | Sendv | Usendv | Sendf | Writ | Writv => match state {
            State::Reset | State::Eof => State::Closed,
            state => state,
        },
        Conn => match state {
            State::Ok | State::Timeout => state,
            // Only an engine-recorded kill is a cancellation; an
            // errno-level interrupt or abort during connect is a timeout.
            State::Killed if forced => State::Killed,
            State::Killed => State::Timeout,
            State::Refused => {
                trace!("conn refused, reported failed");
                State::Failed
            }
            _ => State::Failed,
        },
        Fsync => match state {
            State::Ok | State::Closed => state,
            State::Reset | State::Eof => State::Closed,
            State::Killed | State::Timeout => state,
            _ => State::Failed,
        },
        RunTask => match state {
            State::Ok | State::Killed => state,
            _ => State::Failed,
        },
        _ => state,
    }
}

/// Folds a consumed op plus a result into the completion payload.
pub(crate) fn value_from(
    op: Op,
    real: usize,
    peer: Option<Endpoint>,
    sock: Option<Aico>,
) -> AiceValue {
    match op {
        Op::Acpt => AiceValue::Acpt {
            sock,
            peer: peer.unwrap_or_default(),
        },
        Op::Conn(addr) => AiceValue::Conn { addr },
        Op::Recv(buf) | Op::Send(buf) => AiceValue::Data { buf, real },
        Op::Urecv(buf) => AiceValue::Udata {
            buf,
            real,
            peer: peer.unwrap_or_default(),
        },
        Op::Usend(addr, buf) => AiceValue::Udata {
            buf,
            real,
            peer: addr,
        },
        Op::Recvv(bufs) | Op::Sendv(bufs) => AiceValue::Datav { bufs, real },
        Op::Urecvv(bufs) => AiceValue::Udatav {
            bufs,
            real,
            peer: peer.unwrap_or_default(),
        },
        Op::Usendv(addr, bufs) => AiceValue::Udatav {
            bufs,
            real,
            peer: addr,
        },
        Op::Sendf { file, .. } => AiceValue::Sendf { file, real },
        Op::Read { buf, .. } | Op::Writ { data: buf, .. } => AiceValue::Data { buf, real },
        Op::Readv { bufs, .. } | Op::Writv { data: bufs, .. } => AiceValue::Datav { bufs, real },
        Op::Fsync | Op::RunTask(..) | Op::Clos => AiceValue::None,
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::mem;
    use std::os::fd::{AsRawFd, RawFd};
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    use log::{error, warn};

    use crate::aico::{Aice, AicoFunc, RunWhen};
    use crate::proactor::object::{inflight, Object, Objects, Phase, WheelId};
    use crate::proactor::{Handle, Posting};
    use crate::sys::unix::waker::WAKER_TOKEN;
    use crate::sys::unix::{fileio, sockio};
    use crate::sys::{Selector, SelectorEvents};
    use crate::timer::Wheel;

    #[derive(Copy, Clone, Debug)]
    enum Action {
        /// Per-operation timeout on the coarse wheel.
        OpTimeout { index: usize },
        /// A posted runtask came due.
        RunTask { index: usize },
    }

    enum Issue {
        Ready(Done),
        Park { readable: bool, writable: bool },
    }

    struct Worker {
        shared: Arc<Shared>,
        selector: Selector,
        objects: Objects,
        hi: Wheel<Action>,
        lo: Wheel<Action>,
        events: SelectorEvents,
        // Continued operations queue here and re-dispatch iteratively, so
        // a long run of synchronous completions cannot recurse the stack.
        reposts: Vec<(Aico, Op, Option<Duration>, AicoFunc)>,
    }

    pub(crate) fn run(shared: Arc<Shared>) {
        let selector = match Selector::new(shared.maxn / 64 + 16) {
            Ok(selector) => selector,
            Err(err) => {
                error!("worker: selector init failed: {}", err);
                shared.done.store(true, Ordering::Release);
                return;
            }
        };
        if let Err(err) = selector.arm_waker(shared.waker.as_raw_fd()) {
            error!("worker: waker registration failed: {}", err);
            shared.done.store(true, Ordering::Release);
            return;
        }

        let wheel_cap = shared.maxn / 256 + 16;
        let mut worker = Worker {
            shared,
            selector,
            objects: Objects::new(),
            hi: Wheel::new(Duration::from_millis(1), wheel_cap),
            lo: Wheel::new(Duration::from_secs(1), wheel_cap),
            events: SelectorEvents::new(),
            reposts: Vec::new(),
        };

        trace!("worker: running");
        while worker.spak() {}
        worker.drain();
        worker.shared.done.store(true, Ordering::Release);
        trace!("worker: done");
    }

    impl Worker {
        /// One iteration of the post loop. Returns false on shutdown.
        fn spak(&mut self) -> bool {
            let (posting, kills, more) = {
                let mut queues = self.shared.queues.lock();
                let kills = mem::take(&mut queues.kill);
                let posting = queues.high.pop_front().or_else(|| queues.low.pop_front());
                let more = !queues.high.is_empty() || !queues.low.is_empty();
                (posting, kills, more)
            };

            for aico in kills {
                self.kill_one(aico);
            }

            let had_posting = posting.is_some();
            if let Some(posting) = posting {
                self.dispatch(posting);
            }
            self.flush_reposts();

            if self.shared.killed.load(Ordering::Acquire) {
                return false;
            }

            self.spak_timers();
            self.flush_reposts();

            if !had_posting {
                let timeout = if more {
                    Some(Duration::ZERO)
                } else {
                    match (self.hi.delay(), self.lo.delay()) {
                        (Some(hi), Some(lo)) => Some(hi.min(lo)),
                        (hi, lo) => hi.or(lo),
                    }
                };
                let mut events = mem::take(&mut self.events);
                events.clear();
                if let Err(err) = self.selector.select(&mut events, timeout) {
                    error!("worker: select failed: {}", err);
                }
                for i in 0..events.len() {
                    let event = events[i];
                    if event.token == WAKER_TOKEN {
                        let _ = self.shared.waker.ack();
                    } else {
                        self.resume(event.token);
                        self.flush_reposts();
                    }
                }
                self.events = events;
            }
            true
        }

        fn spak_timers(&mut self) {
            let mut fired: Vec<(Action, bool)> = Vec::new();
            self.hi.spak_with(|action, killed| fired.push((*action, killed)));
            self.lo.spak_with(|action, killed| fired.push((*action, killed)));
            for (action, killed) in fired {
                self.on_timer(action, killed);
            }
        }

        fn on_timer(&mut self, action: Action, killed: bool) {
            match action {
                Action::OpTimeout { index } => {
                    if killed {
                        return;
                    }
                    let progress = match self.objects.get_mut(index) {
                        Some(obj) if obj.phase == Phase::Waiting => {
                            match obj.inflight.as_mut() {
                                Some(infl) => {
                                    // Record the timeout before the platform
                                    // result can be observed; it wins.
                                    infl.forced = Some(State::Timeout);
                                    infl.timer = None;
                                    infl.progress
                                }
                                None => return,
                            }
                        }
                        _ => return,
                    };
                    trace!("worker: op timeout on object {}", index);
                    self.finish(index, Done::bytes(State::Timeout, progress));
                }
                Action::RunTask { index } => {
                    match self.objects.get_mut(index) {
                        Some(obj) if obj.phase == Phase::Waiting => {
                            if let Some(infl) = obj.inflight.as_mut() {
                                infl.timer = None;
                            }
                        }
                        _ => return,
                    }
                    let state = if killed { State::Killed } else { State::Ok };
                    self.finish(index, Done::state(state));
                }
            }
        }

        fn dispatch(&mut self, posting: Posting) {
            let Posting {
                aico,
                op,
                timeout,
                func,
            } = posting;
            trace!("worker: dispatch {:?} on {:?}", op.code(), aico);
            match op {
                Op::Clos => self.do_clos(aico, func),
                Op::RunTask(when) => self.do_task(aico, when, func),
                op => self.start_io(aico, op, timeout, func),
            }
        }

        fn start_io(&mut self, aico: Aico, op: Op, timeout: Option<Duration>, func: AicoFunc) {
            let lookup = {
                let registry = self.shared.registry.lock();
                registry.get(aico).map(|e| (e.handle.fd(), e.killed))
            };
            let (fd, killed) = match lookup {
                Some((Some(fd), killed)) => (fd, killed),
                Some((None, _)) | None => {
                    return self.deliver_orphan(aico, op, func, State::InvalidArgument)
                }
            };
            if killed {
                return self.deliver_orphan(aico, op, func, State::Killed);
            }

            let index = aico.index;
            {
                let obj = self.objects.get_or_new(index);
                if obj.phase != Phase::Ok {
                    warn!("worker: overlapping operation on object {}", index);
                    return self.deliver_orphan(aico, op, func, State::Failed);
                }
                obj.phase = Phase::Pending;
                obj.code = op.code();
                let mut infl = inflight(aico, op, func);
                infl.timeout_dur = timeout;
                obj.inflight = Some(infl);
            }
            if let Some(timeout) = timeout {
                let task = self
                    .lo
                    .entry(timeout, Duration::ZERO, Action::OpTimeout { index });
                if let Some(infl) = self
                    .objects
                    .get_mut(index)
                    .and_then(|obj| obj.inflight.as_mut())
                {
                    infl.timer = Some((WheelId::Lo, task));
                }
            }
            self.attempt(index, fd);
        }

        fn attempt(&mut self, index: usize, fd: RawFd) {
            match self.issue(index, fd) {
                Issue::Ready(done) => self.finish(index, done),
                Issue::Park { readable, writable } => {
                    let added = match self.objects.get_mut(index) {
                        Some(obj) => {
                            obj.phase = Phase::Waiting;
                            let added = obj.added;
                            obj.added = true;
                            added
                        }
                        None => return,
                    };
                    if let Err(err) = self.selector.arm(fd, index, readable, writable, added) {
                        // Uniform failure path: deliver a synthetic
                        // completion instead of surfacing the error here.
                        warn!("worker: arm failed on object {}: {}", index, err);
                        if let Some(obj) = self.objects.get_mut(index) {
                            obj.phase = Phase::Pending;
                            obj.added = added;
                        }
                        let state = State::from_io_error(&err);
                        let state = if state == State::Ok { State::Failed } else { state };
                        self.finish(index, Done::state(state));
                    }
                }
            }
        }

        /// Runs the platform primitive for the object's operation once.
        fn issue(&mut self, index: usize, fd: RawFd) -> Issue {
            let obj = match self.objects.get_mut(index) {
                Some(obj) => obj,
                None => return Issue::Ready(Done::state(State::Failed)),
            };
            let Object {
                inflight: slot,
                scratch,
                ..
            } = obj;
            let infl = match slot.as_mut() {
                Some(infl) => infl,
                None => return Issue::Ready(Done::state(State::Failed)),
            };
            let started = infl.started;
            infl.started = true;
            let progress = &mut infl.progress;

            match &mut infl.op {
                Op::Acpt => loop {
                    match sockio::accept(fd) {
                        Ok((sock, peer)) => {
                            return Issue::Ready(Done {
                                state: State::Ok,
                                real: 0,
                                peer: Some(peer),
                                accepted: Some(sock),
                            })
                        }
                        Err(ref err) if would_block(err) => {
                            return Issue::Park {
                                readable: true,
                                writable: false,
                            }
                        }
                        Err(ref err) if interrupted(err) => continue,
                        Err(err) => return Issue::Ready(Done::state(State::from_io_error(&err))),
                    }
                },
                Op::Conn(addr) => {
                    if !started {
                        match sockio::connect(fd, addr) {
                            Ok(()) => Issue::Ready(Done::state(State::Ok)),
                            Err(ref err) if connect_pending(err) => Issue::Park {
                                readable: false,
                                writable: true,
                            },
                            Err(err) => Issue::Ready(Done::state(State::from_io_error(&err))),
                        }
                    } else {
                        match sockio::connect_result(fd) {
                            Ok(()) => Issue::Ready(Done::state(State::Ok)),
                            Err(err) => Issue::Ready(Done::state(State::from_io_error(&err))),
                        }
                    }
                }
                Op::Recv(buf) => loop {
                    match sockio::recv(fd, buf) {
                        Ok(n) => return Issue::Ready(Done::bytes(State::Ok, n)),
                        Err(ref err) if would_block(err) => {
                            return Issue::Park {
                                readable: true,
                                writable: false,
                            }
                        }
                        Err(ref err) if interrupted(err) => continue,
                        Err(err) => return Issue::Ready(Done::state(State::from_io_error(&err))),
                    }
                },
                Op::Send(buf) => loop {
                    if *progress >= buf.len() {
                        return Issue::Ready(Done::bytes(State::Ok, *progress));
                    }
                    match sockio::send(fd, &buf[*progress..]) {
                        Ok(n) => *progress += n,
                        Err(ref err) if would_block(err) => {
                            return Issue::Park {
                                readable: false,
                                writable: true,
                            }
                        }
                        Err(ref err) if interrupted(err) => {}
                        Err(err) => {
                            return Issue::Ready(Done::bytes(State::from_io_error(&err), *progress))
                        }
                    }
                },
                Op::Urecv(buf) => loop {
                    match sockio::recvfrom(fd, buf) {
                        Ok((n, peer)) => {
                            return Issue::Ready(Done {
                                state: State::Ok,
                                real: n,
                                peer: Some(peer),
                                accepted: None,
                            })
                        }
                        Err(ref err) if would_block(err) => {
                            return Issue::Park {
                                readable: true,
                                writable: false,
                            }
                        }
                        Err(ref err) if interrupted(err) => continue,
                        Err(err) => return Issue::Ready(Done::state(State::from_io_error(&err))),
                    }
                },
                Op::Usend(addr, buf) => loop {
                    match sockio::sendto(fd, buf, addr) {
                        Ok(n) => return Issue::Ready(Done::bytes(State::Ok, n)),
                        Err(ref err) if would_block(err) => {
                            return Issue::Park {
                                readable: false,
                                writable: true,
                            }
                        }
                        Err(ref err) if interrupted(err) => continue,
                        Err(err) => return Issue::Ready(Done::state(State::from_io_error(&err))),
                    }
                },
                Op::Recvv(bufs) => loop {
                    match sockio::recvv(fd, bufs, 0) {
                        Ok(n) => return Issue::Ready(Done::bytes(State::Ok, n)),
                        Err(ref err) if would_block(err) => {
                            return Issue::Park {
                                readable: true,
                                writable: false,
                            }
                        }
                        Err(ref err) if interrupted(err) => continue,
                        Err(err) => return Issue::Ready(Done::state(State::from_io_error(&err))),
                    }
                },
                Op::Sendv(bufs) => {
                    let total: usize = bufs.iter().map(Vec::len).sum();
                    loop {
                        if *progress >= total {
                            return Issue::Ready(Done::bytes(State::Ok, *progress));
                        }
                        match sockio::sendv(fd, bufs, *progress) {
                            Ok(n) => *progress += n,
                            Err(ref err) if would_block(err) => {
                                return Issue::Park {
                                    readable: false,
                                    writable: true,
                                }
                            }
                            Err(ref err) if interrupted(err) => {}
                            Err(err) => {
                                return Issue::Ready(Done::bytes(
                                    State::from_io_error(&err),
                                    *progress,
                                ))
                            }
                        }
                    }
                }
                Op::Urecvv(bufs) => {
                    let name = scratch_buf(scratch, mem::size_of::<libc::sockaddr_storage>());
                    loop {
                        match sockio::urecvv(fd, bufs, name) {
                            Ok((n, peer)) => {
                                return Issue::Ready(Done {
                                    state: State::Ok,
                                    real: n,
                                    peer: Some(peer),
                                    accepted: None,
                                })
                            }
                            Err(ref err) if would_block(err) => {
                                return Issue::Park {
                                    readable: true,
                                    writable: false,
                                }
                            }
                            Err(ref err) if interrupted(err) => continue,
                            Err(err) => {
                                return Issue::Ready(Done::state(State::from_io_error(&err)))
                            }
                        }
                    }
                }
                Op::Usendv(addr, bufs) => loop {
                    match sockio::usendv(fd, bufs, addr) {
                        Ok(n) => return Issue::Ready(Done::bytes(State::Ok, n)),
                        Err(ref err) if would_block(err) => {
                            return Issue::Park {
                                readable: false,
                                writable: true,
                            }
                        }
                        Err(ref err) if interrupted(err) => continue,
                        Err(err) => return Issue::Ready(Done::state(State::from_io_error(&err))),
                    }
                },
                Op::Sendf { file, offset, size } => loop {
                    if *progress >= *size {
                        return Issue::Ready(Done::bytes(State::Ok, *progress));
                    }
                    match sockio::sendfile(
                        fd,
                        file.as_raw_fd(),
                        *offset + *progress as u64,
                        *size - *progress,
                    ) {
                        Ok(0) => return Issue::Ready(Done::bytes(State::Ok, *progress)),
                        Ok(n) => *progress += n,
                        Err(ref err) if would_block(err) => {
                            return Issue::Park {
                                readable: false,
                                writable: true,
                            }
                        }
                        Err(ref err) if interrupted(err) => {}
                        Err(err) => {
                            return Issue::Ready(Done::bytes(State::from_io_error(&err), *progress))
                        }
                    }
                },
                Op::Read { offset, buf } => loop {
                    match fileio::pread(fd, buf, *offset) {
                        Ok(n) => return Issue::Ready(Done::bytes(State::Ok, n)),
                        Err(ref err) if interrupted(err) => continue,
                        Err(err) => return Issue::Ready(Done::state(State::from_io_error(&err))),
                    }
                },
                Op::Writ { offset, data } => loop {
                    if *progress >= data.len() {
                        return Issue::Ready(Done::bytes(State::Ok, *progress));
                    }
                    match fileio::pwrite(fd, &data[*progress..], *offset + *progress as u64) {
                        Ok(0) => return Issue::Ready(Done::bytes(State::Failed, *progress)),
                        Ok(n) => *progress += n,
                        Err(ref err) if interrupted(err) => {}
                        Err(err) => {
                            return Issue::Ready(Done::bytes(State::from_io_error(&err), *progress))
                        }
                    }
                },
                Op::Readv { offset, bufs } => loop {
                    match fileio::preadv(fd, bufs, *offset) {
                        Ok(n) => return Issue::Ready(Done::bytes(State::Ok, n)),
                        Err(ref err) if interrupted(err) => continue,
                        Err(err) => return Issue::Ready(Done::state(State::from_io_error(&err))),
                    }
                },
                Op::Writv { offset, data } => loop {
                    match fileio::pwritev(fd, data, *offset) {
                        Ok(n) => return Issue::Ready(Done::bytes(State::Ok, n)),
                        Err(ref err) if interrupted(err) => continue,
                        Err(err) => {
                            return Issue::Ready(Done::bytes(State::from_io_error(&err), 0))
                        }
                    }
                },
                Op::Fsync => loop {
                    match fileio::fsync(fd) {
                        Ok(()) => return Issue::Ready(Done::state(State::Ok)),
                        Err(ref err) if interrupted(err) => continue,
                        Err(err) => return Issue::Ready(Done::state(State::from_io_error(&err))),
                    }
                },
                Op::RunTask(..) | Op::Clos => {
                    debug_assert!(false, "task/clos ops never reach issue()");
                    Issue::Ready(Done::state(State::Failed))
                }
            }
        }

        /// Finalizes an operation: cancels its timeout, applies the per-op
        /// state contract, invokes the user callback, and reposts continued
        /// operations.
        fn finish(&mut self, index: usize, done: Done) {
            let (code, mut infl) = match self.objects.get_mut(index) {
                Some(obj) => {
                    obj.phase = Phase::Finished;
                    let code = obj.code;
                    match obj.inflight.take() {
                        Some(infl) => (code, infl),
                        None => {
                            obj.clear();
                            return;
                        }
                    }
                }
                None => return,
            };

            if let Some((wheel, task)) = infl.timer.take() {
                match wheel {
                    WheelId::Lo => {
                        let _ = self.lo.cancel(&task);
                    }
                    WheelId::Hi => {
                        let _ = self.hi.cancel(&task);
                    }
                }
            }

            let aico = infl.aico;
            let forced = infl.forced.is_some();
            let state = infl.forced.unwrap_or(done.state);
            // A zero byte request legitimately transfers zero bytes; it must
            // not read as a peer shutdown.
            let state = if state == State::Ok && done.real == 0 && op_requested(&infl.op) == 0 {
                State::Ok
            } else {
                adjust_state(code, state, done.real, forced)
            };

            // Accept produced a client socket: finish its setup and register
            // it so the callback receives a live handle.
            let mut client = None;
            if let Some(sock) = done.accepted {
                if state == State::Ok {
                    if let Err(err) = sock.set_nodelay(true) {
                        trace!("accept: nodelay failed: {}", err);
                    }
                    let mut registry = self.shared.registry.lock();
                    client = Some(registry.insert(Handle::Sock(sock)));
                }
            }

            let offset = op_offset(&infl.op);
            let timeout_dur = infl.timeout_dur;
            let value = value_from(infl.op, done.real, done.peer, client);
            let mut func = infl.func;
            let mut aice = Aice {
                aico,
                code,
                state,
                value,
            };
            let again = (func)(&mut aice);

            if let Some(obj) = self.objects.get_mut(index) {
                obj.phase = Phase::Ok;
                obj.code = OpCode::None;
            }

            // Repost policy: a successful accept reposts on the listener
            // unconditionally; reads continue with the returned buffer only
            // when the callback asks for more; writes continue only when
            // bytes remain, which the issue loops already drain.
            let engine_killed = self.shared.killed.load(Ordering::Acquire);
            let next = match code {
                OpCode::Acpt if state == State::Ok && !engine_killed => Some(Op::Acpt),
                _ if !again || engine_killed => None,
                OpCode::Recv if state == State::Ok => aice.take_buf().map(Op::Recv),
                OpCode::Urecv if state == State::Ok => aice.take_buf().map(Op::Urecv),
                OpCode::Read if state == State::Ok && aice.bytes() > 0 => {
                    let real = aice.bytes() as u64;
                    aice.take_buf().map(|buf| Op::Read {
                        offset: offset + real,
                        buf,
                    })
                }
                _ => None,
            };
            if let Some(op) = next {
                self.reposts.push((aico, op, timeout_dur, func));
            }
        }

        fn flush_reposts(&mut self) {
            while let Some((aico, op, timeout, func)) = self.reposts.pop() {
                self.start_io(aico, op, timeout, func);
            }
        }

        fn resume(&mut self, index: usize) {
            let aico = match self.objects.get_mut(index) {
                Some(obj) if obj.phase == Phase::Waiting => {
                    match obj.inflight.as_ref() {
                        Some(infl) => infl.aico,
                        None => return,
                    }
                }
                _ => return,
            };
            let fd = {
                let registry = self.shared.registry.lock();
                registry.get(aico).and_then(|e| e.handle.fd())
            };
            let fd = match fd {
                Some(fd) => fd,
                None => {
                    // The socket went away under the operation.
                    return self.finish(index, Done::state(State::Killed));
                }
            };
            if let Some(obj) = self.objects.get_mut(index) {
                obj.phase = Phase::Pending;
            }
            self.attempt(index, fd);
        }

        fn kill_one(&mut self, aico: Aico) {
            let index = aico.index;
            trace!("worker: kill object {}", index);
            let progress = match self.objects.get_mut(index) {
                Some(obj) if obj.phase == Phase::Waiting => match obj.inflight.as_mut() {
                    Some(infl) => {
                        infl.forced = Some(State::Killed);
                        infl.progress
                    }
                    None => return,
                },
                _ => return,
            };
            self.finish(index, Done::bytes(State::Killed, progress));
        }

        fn do_task(&mut self, aico: Aico, when: RunWhen, func: AicoFunc) {
            let alive = {
                let registry = self.shared.registry.lock();
                registry.get(aico).map(|e| !e.killed)
            };
            match alive {
                Some(true) => {}
                Some(false) => {
                    return self.deliver_orphan(aico, Op::RunTask(when), func, State::Killed)
                }
                None => {
                    return self.deliver_orphan(
                        aico,
                        Op::RunTask(when),
                        func,
                        State::InvalidArgument,
                    )
                }
            }

            let index = aico.index;
            {
                let obj = self.objects.get_or_new(index);
                if obj.phase != Phase::Ok {
                    warn!("worker: overlapping task on object {}", index);
                    return self.deliver_orphan(aico, Op::RunTask(when), func, State::Failed);
                }
                obj.phase = Phase::Waiting;
                obj.code = OpCode::RunTask;
                obj.inflight = Some(inflight(aico, Op::RunTask(when), func));
            }

            let timer = match when {
                RunWhen::After(delay) if delay.is_zero() => None,
                RunWhen::After(delay) => Some((
                    WheelId::Lo,
                    self.lo
                        .entry(delay, Duration::ZERO, Action::RunTask { index }),
                )),
                RunWhen::At(at) => {
                    let now = Instant::now();
                    if at <= now {
                        None
                    } else {
                        let when_ms = self.hi.clock(at);
                        Some((
                            WheelId::Hi,
                            self.hi
                                .entry_at(when_ms, Duration::ZERO, Action::RunTask { index }),
                        ))
                    }
                }
            };

            match timer {
                Some(timer) => {
                    if let Some(infl) = self
                        .objects
                        .get_mut(index)
                        .and_then(|obj| obj.inflight.as_mut())
                    {
                        infl.timer = Some(timer);
                    }
                }
                // Already due: complete through the normal path right away.
                None => self.finish(index, Done::state(State::Ok)),
            }
        }

        fn do_clos(&mut self, aico: Aico, mut func: AicoFunc) {
            let index = aico.index;
            trace!("worker: clos object {}", index);

            // Abort whatever is still in flight; its callback observes
            // `Killed` before the close callback fires.
            let waiting = matches!(
                self.objects.get_mut(index).map(|o| o.phase),
                Some(Phase::Waiting)
            );
            if waiting {
                if let Some(infl) = self
                    .objects
                    .get_mut(index)
                    .and_then(|obj| obj.inflight.as_mut())
                {
                    infl.forced = Some(State::Killed);
                }
                self.finish(index, Done::state(State::Killed));
            }

            let entry = {
                let mut registry = self.shared.registry.lock();
                registry.remove(aico)
            };
            if let Some(entry) = entry {
                if let Handle::Sock(sock) = entry.handle {
                    let _ = self.selector.disarm(sock.as_raw_fd());
                    if entry.keep_alive && !entry.killed {
                        // Recycle for the next accept/connect.
                        crate::env::pool_put(sock);
                    }
                }
            }
            let _ = self.objects.remove(index);

            let mut aice = Aice {
                aico,
                code: OpCode::Clos,
                state: State::Ok,
                value: AiceValue::None,
            };
            let _ = (func)(&mut aice);
        }

        fn deliver_orphan(&mut self, aico: Aico, op: Op, mut func: AicoFunc, state: State) {
            let code = op.code();
            let value = value_from(op, 0, None, None);
            let mut aice = Aice {
                aico,
                code,
                state,
                value,
            };
            let _ = (func)(&mut aice);
        }

        /// Shutdown: deliver `Killed` to everything still queued or in
        /// flight.
        fn drain(&mut self) {
            let (high, low, kills) = {
                let mut queues = self.shared.queues.lock();
                (
                    mem::take(&mut queues.high),
                    mem::take(&mut queues.low),
                    mem::take(&mut queues.kill),
                )
            };
            drop(kills);
            for posting in high.into_iter().chain(low) {
                self.deliver_orphan(posting.aico, posting.op, posting.func, State::Killed);
            }

            for index in self.objects.indices() {
                let waiting = matches!(
                    self.objects.get_mut(index).map(|o| o.phase),
                    Some(Phase::Waiting)
                );
                if waiting {
                    if let Some(infl) = self
                        .objects
                        .get_mut(index)
                        .and_then(|obj| obj.inflight.as_mut())
                    {
                        infl.forced = Some(State::Killed);
                    }
                    self.finish(index, Done::state(State::Killed));
                }
            }
        }
    }

    fn would_block(err: &std::io::Error) -> bool {
        err.kind() == std::io::ErrorKind::WouldBlock
    }

    fn interrupted(err: &std::io::Error) -> bool {
        err.kind() == std::io::ErrorKind::Interrupted
    }

    fn connect_pending(err: &std::io::Error) -> bool {
        err.raw_os_error() == Some(libc::EINPROGRESS)
            || err.kind() == std::io::ErrorKind::WouldBlock
    }

    fn scratch_buf(scratch: &mut Option<Box<[u8]>>, len: usize) -> &mut [u8] {
        let grow = match scratch {
            Some(buf) => buf.len() < len,
            None => true,
        };
        if grow {
            *scratch = Some(vec![0u8; len].into_boxed_slice());
        }
        match scratch {
            Some(buf) => &mut buf[..],
            None => unreachable!(),
        }
    }

    fn op_offset(op: &Op) -> u64 {
        match op {
            Op::Read { offset, .. }
            | Op::Writ { offset, .. }
            | Op::Readv { offset, .. }
            | Op::Writv { offset, .. }
            | Op::Sendf { offset, .. } => *offset,
            _ => 0,
        }
    }

    fn op_requested(op: &Op) -> usize {
        match op {
            Op::Recv(buf) | Op::Send(buf) | Op::Urecv(buf) | Op::Usend(_, buf) => buf.len(),
            Op::Read { buf, .. } | Op::Writ { data: buf, .. } => buf.len(),
            Op::Recvv(bufs) | Op::Sendv(bufs) | Op::Urecvv(bufs) | Op::Usendv(_, bufs) => {
                bufs.iter().map(Vec::len).sum()
            }
            Op::Readv { bufs, .. } | Op::Writv { data: bufs, .. } => bufs.iter().map(Vec::len).sum(),
            Op::Sendf { size, .. } => *size,
            _ => 0,
        }
    }
}
