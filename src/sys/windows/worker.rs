//! The IOCP worker: the Windows twin of the readiness worker, sharing its
//! queue discipline, wheels, and completion contract.
//!
//! Socket operations are true overlapped calls; each carries a boxed
//! record whose `OVERLAPPED` header sits first so the kernel writes into
//! it. File operations complete synchronously (the handles are not opened
//! overlapped) and go straight to the completion path, as do synchronous
//! socket failures.

use std::collections::HashMap;
use std::mem;
use std::os::windows::io::AsRawSocket;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, trace, warn};

use windows_sys::Win32::Foundation::{ERROR_IO_PENDING, FALSE, HANDLE};
use windows_sys::Win32::Networking::WinSock::{
    setsockopt, WSAGetLastError, WSARecv, WSARecvFrom, WSASend, WSASendTo, WSABUF,
    SOCKADDR_STORAGE, SOCKET, SOCKET_ERROR, SOL_SOCKET, SO_UPDATE_ACCEPT_CONTEXT,
    SO_UPDATE_CONNECT_CONTEXT, WSA_IO_PENDING,
};
use windows_sys::Win32::Storage::FileSystem::{FlushFileBuffers, ReadFile, WriteFile};
use windows_sys::Win32::System::IO::{
    CancelIoEx, GetQueuedCompletionStatusEx, OVERLAPPED, OVERLAPPED_ENTRY,
};

use crate::aico::{Aice, AiceValue, Aico, AicoFunc, Op, OpCode, RunWhen};
use crate::endpoint::{ntstatus, Endpoint};
use crate::proactor::object::{inflight, Objects, Phase, WheelId};
use crate::proactor::worker::{adjust_state, value_from, Done};
use crate::proactor::{Handle, Posting, Shared};
use crate::state::State;
use crate::timer::Wheel;

use super::ext::{self, Extensions};
use super::{Port, WAKE_KEY};

// One batch of completion entries per wait.
const BATCH_MAXN: usize = 64;

#[derive(Copy, Clone, Debug)]
enum Action {
    OpTimeout { index: usize },
    RunTask { index: usize },
}

// The kernel writes into the leading OVERLAPPED; the tail routes the
// completion back to its object.
#[repr(C)]
struct OverlappedOp {
    overlapped: OVERLAPPED,
    index: usize,
}

impl OverlappedOp {
    fn boxed(index: usize) -> Box<OverlappedOp> {
        Box::new(OverlappedOp {
            overlapped: unsafe { mem::zeroed() },
            index,
        })
    }
}

struct Worker {
    shared: Arc<Shared>,
    port: Arc<Port>,
    ext: Extensions,
    objects: Objects,
    hi: Wheel<Action>,
    lo: Wheel<Action>,
    // Aico index -> client socket parked for a pending AcceptEx.
    accepting: HashMap<usize, socket2::Socket>,
    // Handles already associated with the port.
    associated: HashMap<usize, HANDLE>,
    // Continued operations queue here and re-dispatch iteratively, so a
    // long run of synchronous completions cannot recurse the stack.
    reposts: Vec<(Aico, Op, Option<Duration>, AicoFunc)>,
}

pub(crate) fn run(shared: Arc<Shared>) {
    let ext = match ext::load() {
        Ok(ext) => ext,
        Err(err) => {
            error!("worker: winsock extensions unavailable: {}", err);
            shared.done.store(true, Ordering::Release);
            return;
        }
    };
    let port = shared.waker.port();
    let wheel_cap = shared.maxn / 256 + 16;
    let mut worker = Worker {
        shared,
        port,
        ext,
        objects: Objects::new(),
        hi: Wheel::new(Duration::from_millis(1), wheel_cap),
        lo: Wheel::new(Duration::from_secs(1), wheel_cap),
        accepting: HashMap::new(),
        associated: HashMap::new(),
        reposts: Vec::new(),
    };
    trace!("worker: running (iocp)");
    while worker.spak() {}
    worker.drain();
    worker.shared.done.store(true, Ordering::Release);
}

type AcceptExFn = unsafe extern "system" fn(
    SOCKET,
    SOCKET,
    *mut core::ffi::c_void,
    u32,
    u32,
    u32,
    *mut u32,
    *mut OVERLAPPED,
) -> i32;
type ConnectExFn = unsafe extern "system" fn(
    SOCKET,
    *const SOCKADDR_STORAGE,
    i32,
    *const core::ffi::c_void,
    u32,
    *mut u32,
    *mut OVERLAPPED,
) -> i32;

impl Worker {
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
                0
            } else {
                match (self.hi.delay(), self.lo.delay()) {
                    (Some(hi), Some(lo)) => hi.min(lo).as_millis() as u32,
                    (Some(delay), None) | (None, Some(delay)) => delay.as_millis() as u32,
                    (None, None) => u32::MAX,
                }
            };
            self.wait(timeout);
            self.spak_timers();
        }
        true
    }

    fn wait(&mut self, timeout_ms: u32) {
        let mut entries: [OVERLAPPED_ENTRY; BATCH_MAXN] = unsafe { mem::zeroed() };
        let mut count: u32 = 0;
        let rc = unsafe {
            GetQueuedCompletionStatusEx(
                self.port.raw(),
                entries.as_mut_ptr(),
                BATCH_MAXN as u32,
                &mut count,
                timeout_ms,
                FALSE,
            )
        };
        if rc == FALSE {
            return;
        }
        for entry in entries.iter().take(count as usize) {
            if entry.lpCompletionKey == WAKE_KEY {
                continue;
            }
            if entry.lpOverlapped.is_null() {
                continue;
            }
            // Reclaim the op record posted with the operation.
            let op = unsafe { Box::from_raw(entry.lpOverlapped as *mut OverlappedOp) };
            let status = op.overlapped.Internal as u32;
            let bytes = entry.dwNumberOfBytesTransferred as usize;
            self.complete(op.index, ntstatus::to_state(status), bytes);
            self.flush_reposts();
        }
    }

    fn complete(&mut self, index: usize, state: State, bytes: usize) {
        let phase = match self.objects.get_mut(index) {
            Some(obj) => obj.phase,
            None => {
                // The object was removed while the op was cancelled.
                self.objects.reclaim(index);
                return;
            }
        };
        if phase != Phase::Waiting {
            return;
        }
        // Post-completion fixups per op before the shared path runs.
        let peer = self.finish_fixup(index, state);
        let accepted = self.accepting.remove(&index);
        self.finish(
            index,
            Done {
                state,
                real: bytes,
                peer,
                accepted,
            },
        );
    }

    // Accept context and source address decoding after a successful
    // overlapped completion.
    fn finish_fixup(&mut self, index: usize, state: State) -> Option<Endpoint> {
        if state != State::Ok {
            return None;
        }
        let obj = self.objects.get_mut(index)?;
        if matches!(obj.code, OpCode::Urecv | OpCode::Urecvv) {
            // WSARecvFrom wrote [len][storage] into the scratch buffer.
            let scratch = obj.scratch.as_ref()?;
            let storage = unsafe {
                &*(scratch[mem::size_of::<i32>()..].as_ptr() as *const SOCKADDR_STORAGE)
            };
            let (peer, size) = Endpoint::from_sockaddr(storage);
            return if size == 0 { None } else { Some(peer) };
        }
        if obj.code != OpCode::Acpt {
            return None;
        }
        let listener: SOCKET = {
            let registry = self.shared.registry.lock();
            let aico = obj.inflight.as_ref()?.aico;
            match registry.get(aico).map(|e| &e.handle) {
                Some(Handle::Sock(sock)) => sock.as_raw_socket() as SOCKET,
                _ => return None,
            }
        };
        let client = self.accepting.get(&index)?;
        let client_raw = client.as_raw_socket() as SOCKET;
        unsafe {
            setsockopt(
                client_raw,
                SOL_SOCKET,
                SO_UPDATE_ACCEPT_CONTEXT,
                &listener as *const SOCKET as *const u8,
                mem::size_of::<SOCKET>() as i32,
            );
        }
        // The scratch buffer holds both address blocks AcceptEx filled in;
        // the remote one sits in the second half.
        let scratch = obj.scratch.as_ref()?;
        let storage =
            unsafe { &*(scratch[addr_block_len()..].as_ptr() as *const SOCKADDR_STORAGE) };
        let (peer, size) = Endpoint::from_sockaddr(storage);
        if size == 0 {
            None
        } else {
            Some(peer)
        }
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
                let handle = match self.objects.get_mut(index) {
                    Some(obj) if obj.phase == Phase::Waiting => {
                        if let Some(infl) = obj.inflight.as_mut() {
                            infl.forced = Some(State::Timeout);
                            infl.timer = None;
                        }
                        self.associated.get(&index).copied()
                    }
                    _ => return,
                };
                // Cancel the overlapped op; the completion arrives with the
                // aborted status and the recorded timeout wins over it.
                if let Some(handle) = handle {
                    unsafe { CancelIoEx(handle, std::ptr::null_mut()) };
                }
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
        match op {
            Op::Clos => self.do_clos(aico, func),
            Op::RunTask(when) => self.do_task(aico, when, func),
            op => self.start_io(aico, op, timeout, func),
        }
    }

    fn start_io(&mut self, aico: Aico, op: Op, timeout: Option<Duration>, func: AicoFunc) {
        let lookup = {
            let registry = self.shared.registry.lock();
            registry.get(aico).map(|e| (raw_handle(&e.handle), e.killed))
        };
        let (handle, killed) = match lookup {
            Some((Some(handle), killed)) => (handle, killed),
            _ => return self.deliver_orphan(aico, op, func, State::InvalidArgument),
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

        if let Err(state) = self.issue(index, handle) {
            // Synchronous failure: same completion path, synthetic result.
            self.finish(index, Done::state(state));
        }
    }

    /// Issues the overlapped primitive. `Ok(())` means either pending or
    /// queued-to-port synchronous success; the completion arrives through
    /// the port in both cases.
    fn issue(&mut self, index: usize, handle: HANDLE) -> Result<(), State> {
        if !self.associated.contains_key(&index) {
            let is_sock = {
                let obj = self.objects.get_mut(index);
                let aico = obj.and_then(|o| o.inflight.as_ref()).map(|i| i.aico);
                match aico {
                    Some(aico) => {
                        let registry = self.shared.registry.lock();
                        matches!(registry.get(aico).map(|e| &e.handle), Some(Handle::Sock(_)))
                    }
                    None => false,
                }
            };
            if is_sock {
                self.port
                    .associate(handle, index)
                    .map_err(|err| State::from_io_error(&err))?;
                self.associated.insert(index, handle);
            }
        }

        let sock = handle as SOCKET;
        let obj = match self.objects.get_mut(index) {
            Some(obj) => obj,
            None => return Err(State::Failed),
        };
        let crate::proactor::object::Object {
            inflight: slot,
            scratch,
            ..
        } = obj;
        let infl = match slot.as_mut() {
            Some(infl) => infl,
            None => return Err(State::Failed),
        };

        let record = OverlappedOp::boxed(index);
        let overlapped = Box::into_raw(record);
        let overlapped_ptr = overlapped as *mut OVERLAPPED;

        let rc: Result<(), State> = match &mut infl.op {
            Op::Acpt => {
                let client = socket2::Socket::new(
                    socket2::Domain::IPV4,
                    socket2::Type::STREAM,
                    None,
                )
                .map_err(|err| State::from_io_error(&err))?;
                let client_raw = client.as_raw_socket() as SOCKET;
                self.accepting.insert(index, client);
                let buf = scratch_buf(scratch, 2 * addr_block_len());
                let accept_ex: AcceptExFn = unsafe { mem::transmute(self.ext.accept_ex) };
                let mut received = 0u32;
                let ok = unsafe {
                    accept_ex(
                        sock,
                        client_raw,
                        buf.as_mut_ptr() as *mut _,
                        0,
                        addr_block_len() as u32,
                        addr_block_len() as u32,
                        &mut received,
                        overlapped_ptr,
                    )
                };
                overlapped_result(ok)
            }
            Op::Conn(addr) => {
                let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
                let len = addr.to_sockaddr(&mut storage);
                if len == 0 {
                    Err(State::InvalidArgument)
                } else {
                    bind_any(sock, addr)?;
                    let connect_ex: ConnectExFn = unsafe { mem::transmute(self.ext.connect_ex) };
                    let mut sent = 0u32;
                    let ok = unsafe {
                        connect_ex(
                            sock,
                            &storage,
                            len,
                            std::ptr::null(),
                            0,
                            &mut sent,
                            overlapped_ptr,
                        )
                    };
                    let result = overlapped_result(ok);
                    if result.is_ok() {
                        unsafe {
                            setsockopt(
                                sock,
                                SOL_SOCKET,
                                SO_UPDATE_CONNECT_CONTEXT,
                                std::ptr::null(),
                                0,
                            );
                        }
                    }
                    result
                }
            }
            Op::Recv(buf) => {
                let mut wsabuf = WSABUF {
                    len: buf.len() as u32,
                    buf: buf.as_mut_ptr(),
                };
                let mut flags = 0u32;
                let rc = unsafe {
                    WSARecv(
                        sock,
                        &mut wsabuf,
                        1,
                        std::ptr::null_mut(),
                        &mut flags,
                        overlapped_ptr,
                        None,
                    )
                };
                wsa_result(rc)
            }
            Op::Send(buf) => {
                let mut wsabuf = WSABUF {
                    len: buf.len() as u32,
                    buf: buf.as_mut_ptr(),
                };
                let rc = unsafe {
                    WSASend(sock, &mut wsabuf, 1, std::ptr::null_mut(), 0, overlapped_ptr, None)
                };
                wsa_result(rc)
            }
            Op::Urecv(buf) => {
                let name = scratch_buf(scratch, addr_block_len());
                let mut wsabuf = WSABUF {
                    len: buf.len() as u32,
                    buf: buf.as_mut_ptr(),
                };
                let mut flags = 0u32;
                // The kernel writes the source length after the storage.
                let len_at = name.as_mut_ptr() as *mut i32;
                unsafe { *len_at = mem::size_of::<SOCKADDR_STORAGE>() as i32 };
                let rc = unsafe {
                    WSARecvFrom(
                        sock,
                        &mut wsabuf,
                        1,
                        std::ptr::null_mut(),
                        &mut flags,
                        name.as_mut_ptr().add(mem::size_of::<i32>()) as *mut _,
                        len_at,
                        overlapped_ptr,
                        None,
                    )
                };
                wsa_result(rc)
            }
            Op::Usend(addr, buf) => {
                let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
                let len = addr.to_sockaddr(&mut storage);
                if len == 0 {
                    Err(State::InvalidArgument)
                } else {
                    let mut wsabuf = WSABUF {
                        len: buf.len() as u32,
                        buf: buf.as_mut_ptr(),
                    };
                    let rc = unsafe {
                        WSASendTo(
                            sock,
                            &mut wsabuf,
                            1,
                            std::ptr::null_mut(),
                            0,
                            &storage as *const SOCKADDR_STORAGE as *const _,
                            len,
                            overlapped_ptr,
                            None,
                        )
                    };
                    wsa_result(rc)
                }
            }
            Op::Recvv(bufs) | Op::Urecvv(bufs) => {
                let mut wsabufs: Vec<WSABUF> = bufs
                    .iter_mut()
                    .map(|buf| WSABUF {
                        len: buf.len() as u32,
                        buf: buf.as_mut_ptr(),
                    })
                    .collect();
                let mut flags = 0u32;
                let rc = unsafe {
                    WSARecv(
                        sock,
                        wsabufs.as_mut_ptr(),
                        wsabufs.len() as u32,
                        std::ptr::null_mut(),
                        &mut flags,
                        overlapped_ptr,
                        None,
                    )
                };
                wsa_result(rc)
            }
            Op::Sendv(bufs) | Op::Usendv(_, bufs) => {
                let mut wsabufs: Vec<WSABUF> = bufs
                    .iter_mut()
                    .map(|buf| WSABUF {
                        len: buf.len() as u32,
                        buf: buf.as_mut_ptr(),
                    })
                    .collect();
                let rc = unsafe {
                    WSASend(
                        sock,
                        wsabufs.as_mut_ptr(),
                        wsabufs.len() as u32,
                        std::ptr::null_mut(),
                        0,
                        overlapped_ptr,
                        None,
                    )
                };
                wsa_result(rc)
            }
            // File and sendfile paths complete synchronously; reclaim the
            // record and feed the completion path directly.
            Op::Read { offset, buf } => {
                drop(unsafe { Box::from_raw(overlapped) });
                let n = file_read(handle, buf, *offset)?;
                let done = Done::bytes(State::Ok, n);
                return {
                    self.finish(index, done);
                    Ok(())
                };
            }
            Op::Writ { offset, data } => {
                drop(unsafe { Box::from_raw(overlapped) });
                let n = file_write(handle, data, *offset)?;
                let done = Done::bytes(State::Ok, n);
                return {
                    self.finish(index, done);
                    Ok(())
                };
            }
            Op::Readv { offset, bufs } => {
                drop(unsafe { Box::from_raw(overlapped) });
                let mut total = 0;
                let mut at = *offset;
                for buf in bufs.iter_mut() {
                    let n = file_read(handle, buf, at)?;
                    total += n;
                    at += n as u64;
                    if n < buf.len() {
                        break;
                    }
                }
                self.finish(index, Done::bytes(State::Ok, total));
                return Ok(());
            }
            Op::Writv { offset, data } => {
                drop(unsafe { Box::from_raw(overlapped) });
                let mut total = 0;
                let mut at = *offset;
                for buf in data.iter() {
                    let n = file_write(handle, buf, at)?;
                    total += n;
                    at += n as u64;
                    if n < buf.len() {
                        break;
                    }
                }
                self.finish(index, Done::bytes(State::Ok, total));
                return Ok(());
            }
            Op::Sendf { .. } => {
                drop(unsafe { Box::from_raw(overlapped) });
                return Err(State::NotImplemented);
            }
            Op::Fsync => {
                drop(unsafe { Box::from_raw(overlapped) });
                let ok = unsafe { FlushFileBuffers(handle) };
                let state = if ok == 0 {
                    State::from_io_error(&std::io::Error::last_os_error())
                } else {
                    State::Ok
                };
                self.finish(index, Done::state(state));
                return Ok(());
            }
            Op::RunTask(..) | Op::Clos => Err(State::Failed),
        };

        match rc {
            Ok(()) => {
                if let Some(obj) = self.objects.get_mut(index) {
                    obj.phase = Phase::Waiting;
                }
                Ok(())
            }
            Err(state) => {
                // The kernel never saw the overlapped; reclaim it.
                drop(unsafe { Box::from_raw(overlapped) });
                self.accepting.remove(&index);
                Err(state)
            }
        }
    }

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
        let state = adjust_state(code, state, done.real, forced);

        let mut client = None;
        if let Some(sock) = done.accepted {
            if state == State::Ok {
                let _ = sock.set_nonblocking(true);
                let _ = sock.set_nodelay(true);
                let mut registry = self.shared.registry.lock();
                client = Some(registry.insert(Handle::Sock(sock)));
            }
        }

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
        // A successful accept reposts on the listener unconditionally; the
        // callback's verdict only governs the data operations.
        let engine_killed = self.shared.killed.load(Ordering::Acquire);
        let next = match code {
            OpCode::Acpt if state == State::Ok && !engine_killed => Some(Op::Acpt),
            _ if !again || engine_killed => None,
            OpCode::Recv if state == State::Ok => aice.take_buf().map(Op::Recv),
            OpCode::Urecv if state == State::Ok => aice.take_buf().map(Op::Urecv),
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

    fn kill_one(&mut self, aico: Aico) {
        let index = aico.index;
        let waiting = matches!(
            self.objects.get_mut(index).map(|o| o.phase),
            Some(Phase::Waiting)
        );
        if !waiting {
            return;
        }
        if let Some(infl) = self
            .objects
            .get_mut(index)
            .and_then(|obj| obj.inflight.as_mut())
        {
            infl.forced = Some(State::Killed);
        }
        if let Some(handle) = self.associated.get(&index).copied() {
            unsafe { CancelIoEx(handle, std::ptr::null_mut()) };
        } else {
            // Timer-armed only (runtask): no kernel op to cancel.
            self.finish(index, Done::state(State::Killed));
        }
    }

    fn do_task(&mut self, aico: Aico, when: RunWhen, func: AicoFunc) {
        let alive = {
            let registry = self.shared.registry.lock();
            registry.get(aico).map(|e| !e.killed)
        };
        match alive {
            Some(true) => {}
            Some(false) => return self.deliver_orphan(aico, Op::RunTask(when), func, State::Killed),
            None => {
                return self.deliver_orphan(aico, Op::RunTask(when), func, State::InvalidArgument)
            }
        }
        let index = aico.index;
        {
            let obj = self.objects.get_or_new(index);
            if obj.phase != Phase::Ok {
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
                self.lo.entry(delay, Duration::ZERO, Action::RunTask { index }),
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
            None => self.finish(index, Done::state(State::Ok)),
        }
    }

    fn do_clos(&mut self, aico: Aico, mut func: AicoFunc) {
        let index = aico.index;
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
            if let Some(handle) = self.associated.get(&index).copied() {
                unsafe { CancelIoEx(handle, std::ptr::null_mut()) };
            }
            self.finish(index, Done::state(State::Killed));
        }

        self.associated.remove(&index);
        self.accepting.remove(&index);
        let entry = {
            let mut registry = self.shared.registry.lock();
            registry.remove(aico)
        };
        if let Some(entry) = entry {
            if let Handle::Sock(sock) = entry.handle {
                if entry.keep_alive && !entry.killed {
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

    fn drain(&mut self) {
        let (high, low) = {
            let mut queues = self.shared.queues.lock();
            (mem::take(&mut queues.high), mem::take(&mut queues.low))
        };
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

fn raw_handle(handle: &Handle) -> Option<HANDLE> {
    use std::os::windows::io::AsRawHandle;
    match handle {
        Handle::Sock(sock) => Some(sock.as_raw_socket() as HANDLE),
        Handle::File(file) => Some(file.as_raw_handle() as HANDLE),
        Handle::Task => None,
    }
}

// ConnectEx requires a bound socket.
fn bind_any(sock: SOCKET, addr: &Endpoint) -> Result<(), State> {
    use windows_sys::Win32::Networking::WinSock::bind;
    let any = match addr {
        Endpoint::V4(..) => Endpoint::any4(0),
        Endpoint::V6(..) => Endpoint::any6(0),
        Endpoint::Unspec => return Err(State::InvalidArgument),
    };
    let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
    let len = any.to_sockaddr(&mut storage);
    let rc = unsafe { bind(sock, &storage as *const SOCKADDR_STORAGE as *const _, len) };
    if rc == SOCKET_ERROR {
        // Already bound is fine for a recycled socket.
        let err = unsafe { WSAGetLastError() };
        if err != windows_sys::Win32::Networking::WinSock::WSAEINVAL {
            return Err(State::from_io_error(&std::io::Error::from_raw_os_error(err)));
        }
    }
    Ok(())
}

fn overlapped_result(ok: i32) -> Result<(), State> {
    if ok != 0 {
        return Ok(());
    }
    let err = unsafe { WSAGetLastError() };
    if err == WSA_IO_PENDING as i32 || err as u32 == ERROR_IO_PENDING {
        Ok(())
    } else {
        Err(State::from_io_error(&std::io::Error::from_raw_os_error(err)))
    }
}

fn wsa_result(rc: i32) -> Result<(), State> {
    if rc == 0 {
        // Synchronous success still queues a completion packet.
        return Ok(());
    }
    let err = unsafe { WSAGetLastError() };
    if err == WSA_IO_PENDING as i32 {
        Ok(())
    } else {
        Err(State::from_io_error(&std::io::Error::from_raw_os_error(err)))
    }
}

fn file_read(handle: HANDLE, buf: &mut [u8], offset: u64) -> Result<usize, State> {
    let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
    overlapped.Anonymous.Anonymous.Offset = offset as u32;
    overlapped.Anonymous.Anonymous.OffsetHigh = (offset >> 32) as u32;
    let mut read = 0u32;
    let ok = unsafe {
        ReadFile(
            handle,
            buf.as_mut_ptr(),
            buf.len() as u32,
            &mut read,
            &mut overlapped,
        )
    };
    if ok == 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(38) {
            // ERROR_HANDLE_EOF
            return Ok(0);
        }
        return Err(State::from_io_error(&err));
    }
    Ok(read as usize)
}

fn file_write(handle: HANDLE, buf: &[u8], offset: u64) -> Result<usize, State> {
    let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
    overlapped.Anonymous.Anonymous.Offset = offset as u32;
    overlapped.Anonymous.Anonymous.OffsetHigh = (offset >> 32) as u32;
    let mut written = 0u32;
    let ok = unsafe {
        WriteFile(
            handle,
            buf.as_ptr(),
            buf.len() as u32,
            &mut written,
            &mut overlapped,
        )
    };
    if ok == 0 {
        return Err(State::from_io_error(&std::io::Error::last_os_error()));
    }
    Ok(written as usize)
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

// AcceptEx address block: sockaddr storage plus the documented 16 bytes.
fn addr_block_len() -> usize {
    mem::size_of::<SOCKADDR_STORAGE>() + 16
}
