//! The completion proactor.
//!
//! A [`Proactor`] owns a platform completion source, two timer wheels, two
//! priority posting queues, and one worker thread. Operations are posted
//! against [`Aico`] handles and their results delivered through completion
//! callbacks on the worker; see the crate docs for the full model.
//!
//! Posting is thread-safe and cheap: the posting thread appends to a queue
//! under a short lock and wakes the worker. The worker is the sole consumer
//! of the queues and the sole owner of the timer wheels and completion
//! objects.

pub(crate) mod object;
pub(crate) mod worker;

use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{trace, warn};
use parking_lot::Mutex;
use slab::Slab;

use crate::aico::{Aico, AicoFunc, Op};
use crate::sys;

/// How long [`Proactor::exit`] waits for the worker to drain.
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct Posting {
    pub aico: Aico,
    pub op: Op,
    pub timeout: Option<Duration>,
    pub func: AicoFunc,
}

pub(crate) struct Queues {
    pub high: VecDeque<Posting>,
    pub low: VecDeque<Posting>,
    pub kill: Vec<Aico>,
}

/// The native resource behind an aico.
pub(crate) enum Handle {
    Sock(socket2::Socket),
    File(File),
    Task,
}

impl Handle {
    #[cfg(unix)]
    pub fn fd(&self) -> Option<std::os::fd::RawFd> {
        use std::os::fd::AsRawFd;
        match self {
            Handle::Sock(sock) => Some(sock.as_raw_fd()),
            Handle::File(file) => Some(file.as_raw_fd()),
            Handle::Task => None,
        }
    }
}

pub(crate) struct Entry {
    pub gen: u32,
    pub handle: Handle,
    pub killed: bool,
    pub keep_alive: bool,
}

pub(crate) struct Registry {
    slab: Slab<Entry>,
    next_gen: u32,
}

impl Registry {
    fn new(maxn: usize) -> Registry {
        Registry {
            slab: Slab::with_capacity(maxn.min(4096)),
            next_gen: 1,
        }
    }

    pub fn insert(&mut self, handle: Handle) -> Aico {
        let gen = self.next_gen;
        self.next_gen = self.next_gen.wrapping_add(1).max(1);
        let index = self.slab.insert(Entry {
            gen,
            handle,
            killed: false,
            keep_alive: false,
        });
        Aico { index, gen }
    }

    pub fn get(&self, aico: Aico) -> Option<&Entry> {
        self.slab.get(aico.index).filter(|e| e.gen == aico.gen)
    }

    pub fn get_mut(&mut self, aico: Aico) -> Option<&mut Entry> {
        self.slab.get_mut(aico.index).filter(|e| e.gen == aico.gen)
    }

    pub fn remove(&mut self, aico: Aico) -> Option<Entry> {
        match self.slab.get(aico.index) {
            Some(entry) if entry.gen == aico.gen => Some(self.slab.remove(aico.index)),
            _ => None,
        }
    }
}

pub(crate) struct Shared {
    pub maxn: usize,
    pub qcap: usize,
    pub queues: Mutex<Queues>,
    pub registry: Mutex<Registry>,
    pub waker: sys::Waker,
    pub killed: AtomicBool,
    pub done: AtomicBool,
}

/// Cloneable posting surface of a [`Proactor`].
///
/// Handles stay valid after the proactor is killed; postings on a killed
/// proactor are refused.
#[derive(Clone)]
pub struct ProactorHandle {
    shared: Arc<Shared>,
}

impl ProactorHandle {
    /// Registers a socket with the proactor, taking ownership. The socket is
    /// switched to nonblocking mode.
    pub fn attach_socket(&self, sock: socket2::Socket) -> io::Result<Aico> {
        sock.set_nonblocking(true)?;
        let mut registry = self.shared.registry.lock();
        Ok(registry.insert(Handle::Sock(sock)))
    }

    /// Registers a file with the proactor, taking ownership.
    pub fn attach_file(&self, file: File) -> io::Result<Aico> {
        let mut registry = self.shared.registry.lock();
        Ok(registry.insert(Handle::File(file)))
    }

    /// Registers a bare task anchor, used only for `Op::RunTask` postings.
    pub fn attach_task(&self) -> io::Result<Aico> {
        let mut registry = self.shared.registry.lock();
        Ok(registry.insert(Handle::Task))
    }

    /// Posts an operation. The callback fires exactly once per completion on
    /// the worker thread (more for continued operations).
    ///
    /// Returns false when the proactor is killed or the posting queue is
    /// full; the callback is dropped unfired in that case.
    pub fn post(
        &self,
        aico: Aico,
        op: Op,
        timeout: Option<Duration>,
        func: AicoFunc,
    ) -> bool {
        if self.shared.killed.load(Ordering::Acquire) {
            trace!("post refused: proactor killed");
            return false;
        }
        {
            let mut queues = self.shared.queues.lock();
            let queue = if op.is_urgent() {
                &mut queues.high
            } else {
                &mut queues.low
            };
            if queue.len() >= self.shared.qcap {
                warn!("post refused: queue full (cap {})", self.shared.qcap);
                return false;
            }
            queue.push_back(Posting {
                aico,
                op,
                timeout,
                func,
            });
        }
        let _ = self.shared.waker.wake();
        true
    }

    /// Posts a one-shot task after a delay, on the coarse wheel.
    pub fn run_after(&self, aico: Aico, delay: Duration, func: AicoFunc) -> bool {
        self.post(aico, Op::RunTask(crate::aico::RunWhen::After(delay)), None, func)
    }

    /// Posts a one-shot task at an absolute time, on the millisecond wheel.
    pub fn run_at(&self, aico: Aico, when: Instant, func: AicoFunc) -> bool {
        self.post(aico, Op::RunTask(crate::aico::RunWhen::At(when)), None, func)
    }

    /// Cancels the in-flight operation of one aico from any thread. The
    /// pending callback is delivered with `State::Killed`.
    pub fn cancel(&self, aico: Aico) {
        {
            let mut registry = self.shared.registry.lock();
            match registry.get_mut(aico) {
                Some(entry) => entry.killed = true,
                None => return,
            }
            let mut queues = self.shared.queues.lock();
            queues.kill.push(aico);
        }
        let _ = self.shared.waker.wake();
    }

    /// Marks a socket for pool recycling on close instead of destruction.
    pub fn set_keep_alive(&self, aico: Aico, keep_alive: bool) -> bool {
        let mut registry = self.shared.registry.lock();
        match registry.get_mut(aico) {
            Some(entry) => {
                entry.keep_alive = keep_alive;
                true
            }
            None => false,
        }
    }

    /// Runs a closure against the registered socket, e.g. to query or tune
    /// socket options. Returns `None` for a stale handle or a non-socket.
    pub fn with_socket<R>(
        &self,
        aico: Aico,
        f: impl FnOnce(&socket2::Socket) -> R,
    ) -> Option<R> {
        let registry = self.shared.registry.lock();
        match registry.get(aico) {
            Some(Entry {
                handle: Handle::Sock(sock),
                ..
            }) => Some(f(sock)),
            _ => None,
        }
    }

    /// True once the proactor was killed.
    pub fn is_killed(&self) -> bool {
        self.shared.killed.load(Ordering::Acquire)
    }
}

/// A completion-based I/O engine with one worker thread.
pub struct Proactor {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Proactor {
    /// Creates a proactor sized for roughly `maxn` concurrent objects and
    /// spawns its worker thread.
    pub fn new(maxn: usize) -> io::Result<Proactor> {
        crate::env::init();
        let maxn = maxn.max(16);
        let shared = Arc::new(Shared {
            maxn,
            qcap: maxn / 16 + 16,
            queues: Mutex::new(Queues {
                high: VecDeque::with_capacity(maxn / 16 + 16),
                low: VecDeque::with_capacity(maxn / 16 + 16),
                kill: Vec::with_capacity(maxn / 64 + 16),
            }),
            registry: Mutex::new(Registry::new(maxn)),
            waker: sys::Waker::new()?,
            killed: AtomicBool::new(false),
            done: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("cio-worker".to_string())
            .spawn(move || worker::run(worker_shared))?;

        Ok(Proactor {
            shared,
            worker: Some(worker),
        })
    }

    /// The posting surface, cloneable and shareable across threads.
    pub fn handle(&self) -> ProactorHandle {
        ProactorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Kills the proactor: the worker stops taking postings and delivers
    /// `State::Killed` to every abandoned operation.
    pub fn kill(&self) {
        if !self.shared.killed.swap(true, Ordering::AcqRel) {
            let _ = self.shared.waker.wake();
        }
    }

    /// Kills the proactor and waits up to five seconds for the worker to
    /// drain. Returns false (and leaves the worker detached) if it does not.
    pub fn exit(mut self) -> bool {
        self.kill();
        let deadline = Instant::now() + EXIT_TIMEOUT;
        while !self.shared.done.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                warn!("proactor exit: worker still busy, refusing to join");
                // Leave the thread detached; Drop must not block forever.
                let _ = self.worker.take();
                return false;
            }
            thread::sleep(Duration::from_millis(50));
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        true
    }
}

impl Drop for Proactor {
    fn drop(&mut self) {
        self.kill();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
