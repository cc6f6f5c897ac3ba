//! In-memory stream backend.
//!
//! The buffer either comes from a `data://BASE64` URL or is installed with
//! [`AsyncStream::set_data`]; writes grow it. Completions are deferred
//! through a task posting so callers observe the same asynchronous shape
//! as network streams.
//!
//! [`AsyncStream::set_data`]: crate::stream::AsyncStream::set_data

use std::sync::atomic::Ordering;
use std::time::Duration;

use log::trace;

use crate::aico::Aico;
use crate::stream::{
    AsyncStream, Backend, ClosFunc, OpenFunc, ReadFunc, SeekFunc, StreamState, SyncFunc, TaskFunc,
    WriteFunc,
};
use crate::State;

pub(crate) struct DataBackend {
    pub buf: Vec<u8>,
    pub task: Option<Aico>,
    // Buffer installed by ctrl before open, replacing the URL payload.
    pub preset: Option<Vec<u8>>,
}

impl DataBackend {
    pub fn new() -> DataBackend {
        DataBackend {
            buf: Vec::new(),
            task: None,
            preset: None,
        }
    }
}

impl AsyncStream {
    /// Installs the buffer served by a data stream, replacing any URL
    /// payload. Only meaningful before open.
    pub fn set_data(&self, data: &[u8]) -> bool {
        let mut backend = self.core.backend.lock();
        match &mut *backend {
            Backend::Data(state) => {
                state.preset = Some(data.to_vec());
                true
            }
            _ => false,
        }
    }
}

// Prepares the buffer and the deferral aico.
fn setup(stream: &AsyncStream) -> Result<(), State> {
    let payload = {
        let backend = stream.core.backend.lock();
        match &*backend {
            Backend::Data(state) if state.preset.is_some() => None,
            _ => stream.core.url.lock().data_payload(),
        }
    };
    let task = stream
        .core
        .aicp
        .attach_task()
        .map_err(|_| State::OutOfMemory)?;
    let mut backend = stream.core.backend.lock();
    let state = match &mut *backend {
        Backend::Data(state) => state,
        _ => return Err(State::Failed),
    };
    state.buf = match state.preset.take() {
        Some(preset) => preset,
        None => payload.unwrap_or_default(),
    };
    state.task = Some(task);
    stream
        .core
        .size_hint
        .store(state.buf.len() as i64, Ordering::Relaxed);
    stream.core.offset.store(0, Ordering::Relaxed);
    Ok(())
}

fn task_aico(stream: &AsyncStream) -> Option<Aico> {
    match &*stream.core.backend.lock() {
        Backend::Data(state) => state.task,
        _ => None,
    }
}

// Defers a closure onto the proactor worker.
fn defer(
    stream: &AsyncStream,
    delay: Duration,
    func: impl FnOnce(&AsyncStream, State) + Send + 'static,
) -> bool {
    let aico = match task_aico(stream) {
        Some(aico) => aico,
        None => return false,
    };
    let this = stream.clone();
    let mut slot = Some(func);
    this.op_begin();
    let posted = stream.core.aicp.run_after(
        aico,
        delay,
        Box::new(move |aice| {
            this.op_end();
            if let Some(func) = slot.take() {
                let state = if aice.state == State::Ok {
                    State::Ok
                } else {
                    aice.state
                };
                func(&this, state);
            }
            false
        }),
    );
    if !posted {
        stream.op_end();
    }
    posted
}

pub(crate) fn open(stream: &AsyncStream, func: OpenFunc) -> bool {
    if let Err(state) = setup(stream) {
        stream.open_done(state, func);
        return true;
    }
    let mut slot = Some(func);
    defer(stream, Duration::ZERO, move |stream, state| {
        if let Some(func) = slot.take() {
            stream.open_done(state, func);
        }
    })
}

pub(crate) fn open_try(stream: &AsyncStream) -> bool {
    setup(stream).is_ok()
}

pub(crate) fn read(stream: &AsyncStream, size: usize, func: ReadFunc) -> bool {
    let mut slot = Some((size, func));
    read_next(stream, &mut slot)
}

// One deferred read step; continues itself while the callback asks for
// more.
fn read_next(stream: &AsyncStream, slot: &mut Option<(usize, ReadFunc)>) -> bool {
    let (size, mut func) = match slot.take() {
        Some(inner) => inner,
        None => return false,
    };
    defer(stream, Duration::ZERO, move |stream, state| {
        if state != State::Ok {
            let _ = func(stream, state, &[]);
            return;
        }
        let (chunk, eof) = {
            let backend = stream.core.backend.lock();
            let data = match &*backend {
                Backend::Data(state) => &state.buf,
                _ => return,
            };
            let offset = stream.offset() as usize;
            if offset >= data.len() {
                (Vec::new(), true)
            } else {
                let n = size.min(data.len() - offset);
                (data[offset..offset + n].to_vec(), false)
            }
        };
        if eof {
            trace!("data: read eof");
            let _ = func(stream, State::Closed, &[]);
            return;
        }
        stream.advance_offset(chunk.len());
        if func(stream, State::Ok, &chunk) && stream.state() == StreamState::Opened {
            let mut slot = Some((size, func));
            let _ = read_next(stream, &mut slot);
        }
    })
}

pub(crate) fn write(stream: &AsyncStream, data: Vec<u8>, func: WriteFunc) -> bool {
    let mut slot = Some((data, func));
    defer(stream, Duration::ZERO, move |stream, state| {
        let (data, mut func) = match slot.take() {
            Some(inner) => inner,
            None => return,
        };
        if state != State::Ok {
            let _ = func(stream, state, 0, data.len());
            return;
        }
        {
            let mut backend = stream.core.backend.lock();
            let buf = match &mut *backend {
                Backend::Data(state) => &mut state.buf,
                _ => return,
            };
            let offset = stream.offset() as usize;
            if offset + data.len() > buf.len() {
                buf.resize(offset + data.len(), 0);
            }
            buf[offset..offset + data.len()].copy_from_slice(&data);
            stream
                .core
                .size_hint
                .store(buf.len() as i64, Ordering::Relaxed);
        }
        stream.advance_offset(data.len());
        let _ = func(stream, State::Ok, data.len(), data.len());
    })
}

pub(crate) fn seek(stream: &AsyncStream, offset: u64, func: SeekFunc) -> bool {
    let size = stream.size();
    if size >= 0 && offset > size as u64 {
        func(stream, State::InvalidArgument, stream.offset());
        return true;
    }
    stream.core.offset.store(offset, Ordering::Relaxed);
    func(stream, State::Ok, offset);
    true
}

pub(crate) fn sync(stream: &AsyncStream, _closing: bool, func: SyncFunc) -> bool {
    let mut slot = Some(func);
    defer(stream, Duration::ZERO, move |stream, state| {
        if let Some(func) = slot.take() {
            func(stream, state);
        }
    })
}

pub(crate) fn task(stream: &AsyncStream, delay: Duration, func: TaskFunc) -> bool {
    let mut slot = Some(func);
    task_next(stream, delay, &mut slot)
}

fn task_next(stream: &AsyncStream, delay: Duration, slot: &mut Option<TaskFunc>) -> bool {
    let mut func = match slot.take() {
        Some(func) => func,
        None => return false,
    };
    defer(stream, delay, move |stream, state| {
        if func(stream, state) && state == State::Ok && stream.state() == StreamState::Opened {
            let mut slot = Some(func);
            let _ = task_next(stream, delay, &mut slot);
        }
    })
}

pub(crate) fn clos(stream: &AsyncStream, func: ClosFunc) -> bool {
    close_quietly(stream);
    func(stream, State::Ok);
    true
}

pub(crate) fn close_quietly(stream: &AsyncStream) {
    let task = {
        let mut backend = stream.core.backend.lock();
        match &mut *backend {
            Backend::Data(state) => state.task.take(),
            _ => None,
        }
    };
    if let Some(task) = task {
        stream
            .core
            .aicp
            .post(task, crate::aico::Op::Clos, None, Box::new(|_| false));
    }
}

pub(crate) fn kill(stream: &AsyncStream) {
    if let Some(task) = task_aico(stream) {
        stream.core.aicp.cancel(task);
    }
}
