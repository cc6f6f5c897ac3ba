//! Worker-local completion objects.
//!
//! One object exists per (aico, worker) pair, created lazily on the first
//! operation and kept in a worker-local map. Objects are recycled through a
//! bounded cache so hot accept/read paths do not churn the allocator. An
//! object whose operation is being cancelled moves to the `Killing` phase
//! and rejoins the cache only once its cancelled completion has been
//! observed, which decouples its lifetime from the socket's.

use std::collections::HashMap;

use log::trace;

use crate::aico::{AicoFunc, Op, OpCode};
use crate::timer::TimerTask;
use crate::State;

// Upper bound on idle objects kept per worker.
const CACHE_MAXN: usize = 256;

/// Phase of a completion object, observable only from the worker.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Idle, ready to take an operation.
    Ok,
    /// The object's operation was cancelled and the object is parked until
    /// the cancellation completes.
    Killing,
    /// An operation was posted but the platform has not accepted it yet.
    Pending,
    /// The platform holds the operation; a completion will arrive.
    Waiting,
    /// A completion arrived and is being finalized.
    Finished,
}

/// Which wheel holds a task of an in-flight operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum WheelId {
    Hi,
    Lo,
}

/// An operation in flight on one object.
pub(crate) struct Inflight {
    pub aico: crate::aico::Aico,
    pub op: Op,
    pub func: AicoFunc,
    /// Cumulative bytes already transferred by earlier partial completions
    /// of this posting (gather sends and positioned writes resume here).
    pub progress: usize,
    /// Whether the platform primitive was issued at least once. Connects
    /// harvest `SO_ERROR` instead of reissuing on resume.
    pub started: bool,
    /// State recorded out-of-band before the completion was observed, e.g.
    /// by the timeout task. It wins over the platform result.
    pub forced: Option<State>,
    /// Timer task armed for this posting, cancelled on completion.
    pub timer: Option<(WheelId, TimerTask)>,
    /// The posting's timeout, re-armed for continued operations.
    pub timeout_dur: Option<std::time::Duration>,
}

/// Per-(aico, worker) state record.
pub(crate) struct Object {
    pub phase: Phase,
    pub code: OpCode,
    pub inflight: Option<Inflight>,
    /// Private scratch, lazily allocated and reused across operations on
    /// this object: source address decoding for unconnected receives and
    /// accept address pairs.
    pub scratch: Option<Box<[u8]>>,
    /// Whether the object's fd currently has a selector registration.
    pub added: bool,
}

impl Object {
    fn new() -> Box<Object> {
        Box::new(Object {
            phase: Phase::Ok,
            code: OpCode::None,
            inflight: None,
            scratch: None,
            added: false,
        })
    }

    /// Returns the scratch buffer, allocating it on first use.
    pub fn scratch(&mut self, len: usize) -> &mut [u8] {
        let grow = match &self.scratch {
            Some(buf) => buf.len() < len,
            None => true,
        };
        if grow {
            self.scratch = Some(vec![0u8; len].into_boxed_slice());
        }
        match &mut self.scratch {
            Some(buf) => &mut buf[..],
            None => unreachable!(),
        }
    }

    /// Resets the object to the idle phase, dropping the operation but
    /// keeping the scratch buffer for reuse.
    pub fn clear(&mut self) {
        self.phase = Phase::Ok;
        self.code = OpCode::None;
        self.inflight = None;
        self.added = false;
    }
}

/// The worker's object map plus its reclaim cache.
pub(crate) struct Objects {
    map: HashMap<usize, Box<Object>>,
    cache: Vec<Box<Object>>,
}

impl Objects {
    pub fn new() -> Objects {
        Objects {
            map: HashMap::new(),
            cache: Vec::new(),
        }
    }

    /// Finds the object for an aico index, reclaiming a cached idle object
    /// or allocating a fresh one if this is the first operation.
    pub fn get_or_new(&mut self, index: usize) -> &mut Object {
        self.map.entry(index).or_insert_with(|| {
            // Prefer a cached object that is not parked in Killing.
            let mut cached = None;
            for i in 0..self.cache.len() {
                if self.cache[i].phase != Phase::Killing {
                    cached = Some(self.cache.swap_remove(i));
                    break;
                }
            }
            cached
                .map(|mut obj| {
                    obj.clear();
                    obj
                })
                .unwrap_or_else(Object::new)
        })
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Object> {
        self.map.get_mut(&index).map(Box::as_mut)
    }

    /// Removes the object for a closed aico.
    ///
    /// Idle objects rejoin the cache directly. An object still waiting on
    /// the platform is parked in `Killing` at the cache tail; it is cleared
    /// and becomes reclaimable when its cancelled completion arrives. Cache
    /// entries beyond the cap that are not killing are swept first.
    pub fn remove(&mut self, index: usize) -> Option<Inflight> {
        self.sweep();
        let mut obj = self.map.remove(&index)?;
        let inflight = obj.inflight.take();
        if obj.phase == Phase::Waiting {
            obj.phase = Phase::Killing;
            trace!("object[{}]: parked killing", index);
            self.cache.push(obj);
        } else {
            obj.clear();
            if self.cache.len() < CACHE_MAXN {
                self.cache.push(obj);
            }
        }
        inflight
    }

    /// Marks a parked object reclaimable after its cancelled completion.
    #[allow(dead_code)] // the readiness backend cancels synchronously
    pub fn reclaim(&mut self, index: usize) {
        // The object left the map at remove(); find it parked in the cache.
        for obj in self.cache.iter_mut() {
            if obj.phase == Phase::Killing {
                obj.clear();
                trace!("object[{}]: reclaimed", index);
                break;
            }
        }
    }

    /// Delivers every live object's index, for shutdown drains.
    pub fn indices(&self) -> Vec<usize> {
        self.map.keys().copied().collect()
    }

    fn sweep(&mut self) {
        let mut i = 0;
        while self.cache.len() > CACHE_MAXN && i < self.cache.len() {
            if self.cache[i].phase != Phase::Killing {
                let _ = self.cache.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }
}

/// Builds a detached inflight record.
pub(crate) fn inflight(aico: crate::aico::Aico, op: Op, func: AicoFunc) -> Inflight {
    Inflight {
        aico,
        op,
        func,
        progress: 0,
        started: false,
        forced: None,
        timer: None,
        timeout_dur: None,
    }
}
