//! Filter-wrapper stream backend.
//!
//! Composes a [`Filter`] onto a child stream: reads pull child bytes
//! through the transform, writes push caller bytes through it before they
//! reach the child, and sync flushes the transform's tail with the
//! end-of-stream flag before syncing the child. When the child hits end of
//! stream while the transform still holds staged output, draining proceeds
//! through task postings so each chunk is delivered from the worker like
//! any other completion.
//!
//! [`Filter`]: crate::filter::Filter

use std::time::Duration;

use log::{trace, warn};

use crate::aico::{Aico, Op};
use crate::filter::{Filter, Spak};
use crate::stream::{
    AsyncStream, Backend, ClosFunc, OpenFunc, ReadFunc, SeekFunc, StreamState, SyncFunc, TaskFunc,
    WriteFunc,
};
use crate::State;

pub(crate) struct FilterBackend {
    pub child: AsyncStream,
    pub filter: Option<Filter>,
    // Drain chunks are delivered through this anchor once the child is
    // closed and can no longer carry task postings.
    pub task: Option<Aico>,
}

impl FilterBackend {
    pub fn new(child: AsyncStream, filter: Filter) -> FilterBackend {
        FilterBackend {
            child,
            filter: Some(filter),
            task: None,
        }
    }
}

impl AsyncStream {
    /// The wrapped stream behind a filter stream.
    pub fn filter_child(&self) -> Option<AsyncStream> {
        match &*self.core.backend.lock() {
            Backend::Filter(state) => Some(state.child.clone()),
            _ => None,
        }
    }

    /// Replaces the filter; only meaningful before open.
    pub fn set_filter(&self, filter: Filter) -> bool {
        let mut backend = self.core.backend.lock();
        match &mut *backend {
            Backend::Filter(state) => {
                state.filter = Some(filter);
                true
            }
            _ => false,
        }
    }
}

fn child_of(stream: &AsyncStream) -> Option<AsyncStream> {
    stream.filter_child()
}

fn take_filter(stream: &AsyncStream) -> Option<Filter> {
    match &mut *stream.core.backend.lock() {
        Backend::Filter(state) => state.filter.take(),
        _ => None,
    }
}

fn put_filter(stream: &AsyncStream, filter: Filter) {
    if let Backend::Filter(state) = &mut *stream.core.backend.lock() {
        state.filter = Some(filter);
    }
}

fn task_aico(stream: &AsyncStream) -> Option<Aico> {
    match &*stream.core.backend.lock() {
        Backend::Filter(state) => state.task,
        _ => None,
    }
}

pub(crate) fn open(stream: &AsyncStream, func: OpenFunc) -> bool {
    let child = match child_of(stream) {
        Some(child) => child,
        None => {
            stream.open_done(State::Failed, func);
            return true;
        }
    };
    {
        let mut filter = match take_filter(stream) {
            Some(filter) => filter,
            None => {
                stream.open_done(State::Failed, func);
                return true;
            }
        };
        let opened = filter.open();
        put_filter(stream, filter);
        if !opened {
            stream.open_done(State::Failed, func);
            return true;
        }
    }
    match stream.core.aicp.attach_task() {
        Ok(task) => {
            if let Backend::Filter(state) = &mut *stream.core.backend.lock() {
                state.task = Some(task);
            }
        }
        Err(_) => {
            stream.open_done(State::OutOfMemory, func);
            return true;
        }
    }

    if child.state() == StreamState::Opened {
        stream.open_done(State::Ok, func);
        return true;
    }

    let this = stream.clone();
    let mut slot = Some(func);
    child.open(Box::new(move |_child: &AsyncStream, state: State| {
        if let Some(func) = slot.take() {
            this.open_done(state, func);
        }
    }))
}

pub(crate) fn read(stream: &AsyncStream, size: usize, func: ReadFunc) -> bool {
    let child = match child_of(stream) {
        Some(child) => child,
        None => return false,
    };
    let this = stream.clone();
    let mut func = func;
    child.read(
        size,
        Box::new(move |_child: &AsyncStream, state: State, data: &[u8]| {
            match state {
                State::Ok => {
                    let mut filter = match take_filter(&this) {
                        Some(filter) => filter,
                        None => return false,
                    };
                    let keep_going = match filter.spak(data, size, 0) {
                        Spak::Data(bytes) => {
                            this.advance_offset(bytes.len());
                            func(&this, State::Ok, bytes)
                                && this.state() == StreamState::Opened
                        }
                        // Not enough transformed bytes yet: keep feeding.
                        Spak::None => true,
                        Spak::Eof => {
                            func(&this, State::Closed, &[]);
                            false
                        }
                    };
                    put_filter(&this, filter);
                    keep_going
                }
                State::Closed => {
                    // Child end: drain what the transform still holds.
                    trace!("filter stream: child closed, draining");
                    let mut slot = Some(std::mem::replace(
                        &mut func,
                        Box::new(|_: &AsyncStream, _: State, _: &[u8]| false),
                    ));
                    drain(&this, size, &mut slot);
                    false
                }
                state => {
                    func(&this, state, &[]);
                    false
                }
            }
        }),
    )
}

// Delivers one staged chunk per task posting until the ring runs dry.
fn drain(stream: &AsyncStream, size: usize, slot: &mut Option<ReadFunc>) {
    let mut func = match slot.take() {
        Some(func) => func,
        None => return,
    };
    let mut filter = match take_filter(stream) {
        Some(filter) => filter,
        None => return,
    };
    let verdict = match filter.spak(&[], size, -1) {
        Spak::Data(bytes) => {
            stream.advance_offset(bytes.len());
            let again = func(stream, State::Ok, bytes) && stream.state() == StreamState::Opened;
            Some(again)
        }
        Spak::Eof | Spak::None => None,
    };
    put_filter(stream, filter);
    match verdict {
        Some(true) => {
            let anchor = match task_aico(stream) {
                Some(anchor) => anchor,
                None => return,
            };
            let this = stream.clone();
            let mut slot = Some(func);
            let posted = stream.core.aicp.run_after(
                anchor,
                Duration::ZERO,
                Box::new(move |aice| {
                    if aice.state == State::Ok {
                        drain(&this, size, &mut slot);
                    } else if let Some(mut func) = slot.take() {
                        let _ = func(&this, aice.state, &[]);
                    }
                    false
                }),
            );
            if !posted {
                warn!("filter stream: drain task refused");
            }
        }
        Some(false) => {}
        None => {
            let _ = func(stream, State::Closed, &[]);
        }
    }
}

pub(crate) fn write(stream: &AsyncStream, data: Vec<u8>, func: WriteFunc) -> bool {
    let child = match child_of(stream) {
        Some(child) => child,
        None => return false,
    };
    let mut filter = match take_filter(stream) {
        Some(filter) => filter,
        None => return false,
    };
    enum Pushed {
        Absorbed,
        Bytes(Vec<u8>),
        Ended,
    }
    let out = match filter.spak(&data, 0, 0) {
        Spak::Data(bytes) => Pushed::Bytes(bytes.to_vec()),
        Spak::None => Pushed::Absorbed,
        Spak::Eof => Pushed::Ended,
    };
    put_filter(stream, filter);

    match out {
        Pushed::Ended => {
            let mut func = func;
            let _ = func(stream, State::Closed, 0, data.len());
            true
        }
        // The transform absorbed everything; the write is complete.
        Pushed::Absorbed => {
            stream.advance_offset(data.len());
            let mut func = func;
            let _ = func(stream, State::Ok, data.len(), data.len());
            true
        }
        Pushed::Bytes(bytes) => {
            let this = stream.clone();
            let total = data.len();
            let mut func = func;
            child.write(
                &bytes,
                Box::new(move |_child: &AsyncStream, state: State, _real, _size| {
                    let _ = match state {
                        State::Ok => {
                            this.advance_offset(total);
                            func(&this, State::Ok, total, total)
                        }
                        state => func(&this, state, 0, total),
                    };
                    false
                }),
            )
        }
    }
}

#[allow(dead_code)]
pub(crate) fn seek(stream: &AsyncStream, _offset: u64, func: SeekFunc) -> bool {
    func(stream, State::NotSupported, stream.offset());
    true
}

pub(crate) fn sync(stream: &AsyncStream, closing: bool, func: SyncFunc) -> bool {
    flush_then_sync(stream, closing, func)
}

// Flushes the transform tail into the child, then syncs the child.
fn flush_then_sync(stream: &AsyncStream, closing: bool, func: SyncFunc) -> bool {
    let child = match child_of(stream) {
        Some(child) => child,
        None => return false,
    };
    let mut filter = match take_filter(stream) {
        Some(filter) => filter,
        None => return false,
    };
    let out = match filter.spak(&[], 0, if closing { -1 } else { 1 }) {
        Spak::Data(bytes) => Some(bytes.to_vec()),
        Spak::None | Spak::Eof => None,
    };
    put_filter(stream, filter);

    match out {
        Some(bytes) => {
            let this = stream.clone();
            let mut slot = Some(func);
            child.write(
                &bytes,
                Box::new(move |_child: &AsyncStream, state: State, _real, _size| {
                    let func = match slot.take() {
                        Some(func) => func,
                        None => return false,
                    };
                    if state == State::Ok {
                        // There may be more tail staged than one write.
                        let _ = flush_then_sync(&this, closing, func);
                    } else {
                        func(&this, state);
                    }
                    false
                }),
            )
        }
        None => {
            let this = stream.clone();
            let mut slot = Some(func);
            if closing {
                child.sync_closing(Box::new(move |_c: &AsyncStream, state: State| {
                    if let Some(func) = slot.take() {
                        func(&this, state);
                    }
                }))
            } else {
                child.sync(Box::new(move |_c: &AsyncStream, state: State| {
                    if let Some(func) = slot.take() {
                        func(&this, state);
                    }
                }))
            }
        }
    }
}

pub(crate) fn task(stream: &AsyncStream, delay: Duration, func: TaskFunc) -> bool {
    let child = match child_of(stream) {
        Some(child) => child,
        None => return false,
    };
    let this = stream.clone();
    let mut func = func;
    child.task(
        delay,
        Box::new(move |_child: &AsyncStream, state: State| func(&this, state)),
    )
}

pub(crate) fn clos(stream: &AsyncStream, func: ClosFunc) -> bool {
    if let Some(mut filter) = take_filter(stream) {
        filter.clos();
        put_filter(stream, filter);
    }
    release_task(stream);
    let child = match child_of(stream) {
        Some(child) => child,
        None => {
            func(stream, State::Ok);
            return true;
        }
    };
    if child.state() != StreamState::Opened && !child.is_killed() {
        func(stream, State::Ok);
        return true;
    }
    let this = stream.clone();
    let mut slot = Some(func);
    child.clos(Box::new(move |_child: &AsyncStream, state: State| {
        if let Some(func) = slot.take() {
            func(&this, state);
        }
    }))
}

pub(crate) fn close_quietly(stream: &AsyncStream) {
    if let Some(mut filter) = take_filter(stream) {
        filter.clos();
        put_filter(stream, filter);
    }
    release_task(stream);
    if let Some(child) = child_of(stream) {
        let _ = child.clos(Box::new(|_: &AsyncStream, _: State| {}));
    }
}

fn release_task(stream: &AsyncStream) {
    let task = match &mut *stream.core.backend.lock() {
        Backend::Filter(state) => state.task.take(),
        _ => None,
    };
    if let Some(task) = task {
        stream
            .core
            .aicp
            .post(task, Op::Clos, None, Box::new(|_| false));
    }
}

pub(crate) fn kill(stream: &AsyncStream) {
    if let Some(task) = task_aico(stream) {
        stream.core.aicp.cancel(task);
    }
    if let Some(child) = child_of(stream) {
        child.kill();
    }
}
