//! File stream backend.
//!
//! The file opens synchronously (opening a regular file does not block in
//! any way the engine could usefully overlap) and all data operations run
//! through the proactor as positioned reads and writes against the
//! tracked offset. Stream-mode files (pipes, devices) refuse seeking and
//! report no size.

use std::fs::OpenOptions;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::trace;

use crate::aico::{Aico, Op};
use crate::stream::{
    AsyncStream, Backend, ClosFunc, OpenFunc, ReadFunc, SeekFunc, StreamState, SyncFunc, TaskFunc,
    WriteFunc,
};
use crate::State;

const RO: u8 = 0b000_0001;
const WO: u8 = 0b000_0010;
const CREATE: u8 = 0b000_0100;
const APPEND: u8 = 0b000_1000;
const TRUNCATE: u8 = 0b001_0000;
const DIRECT: u8 = 0b010_0000;

/// File open mode bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FileMode(u8);

impl FileMode {
    /// Read only.
    pub const RO: FileMode = FileMode(RO);
    /// Write only.
    pub const WO: FileMode = FileMode(WO);
    /// Read and write.
    pub const RW: FileMode = FileMode(RO | WO);
    /// Create the file when absent.
    pub const CREATE: FileMode = FileMode(CREATE);
    /// Append instead of positioned writes.
    pub const APPEND: FileMode = FileMode(APPEND);
    /// Truncate on open.
    pub const TRUNCATE: FileMode = FileMode(TRUNCATE);
    /// Hint to bypass the page cache where the platform supports it.
    pub const DIRECT: FileMode = FileMode(DIRECT);

    /// Combines mode bits; the `BitOr` impl as a const fn.
    pub const fn add(self, other: FileMode) -> FileMode {
        FileMode(self.0 | other.0)
    }

    pub const fn is_readable(self) -> bool {
        self.0 & RO != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & WO != 0
    }
}

impl Default for FileMode {
    fn default() -> FileMode {
        FileMode::RO
    }
}

impl std::ops::BitOr for FileMode {
    type Output = FileMode;

    fn bitor(self, other: FileMode) -> FileMode {
        self.add(other)
    }
}

pub(crate) struct FileBackend {
    pub aico: Option<Aico>,
    pub mode: FileMode,
    pub stream_mode: bool,
}

impl FileBackend {
    pub fn new() -> FileBackend {
        FileBackend {
            aico: None,
            mode: FileMode::RO,
            stream_mode: false,
        }
    }
}

impl AsyncStream {
    /// Sets the file open mode; only meaningful before open.
    pub fn set_file_mode(&self, mode: FileMode) -> bool {
        let mut backend = self.core.backend.lock();
        match &mut *backend {
            Backend::File(state) => {
                state.mode = mode;
                true
            }
            _ => false,
        }
    }

    /// The file open mode.
    pub fn file_mode(&self) -> Option<FileMode> {
        match &*self.core.backend.lock() {
            Backend::File(state) => Some(state.mode),
            _ => None,
        }
    }

    /// Marks the file as stream-mode: no size, no seeking.
    pub fn set_stream_mode(&self, stream_mode: bool) -> bool {
        let mut backend = self.core.backend.lock();
        match &mut *backend {
            Backend::File(state) => {
                state.stream_mode = stream_mode;
                true
            }
            _ => false,
        }
    }

    /// Whether the file is in stream mode.
    pub fn is_stream_mode(&self) -> bool {
        match &*self.core.backend.lock() {
            Backend::File(state) => state.stream_mode,
            _ => false,
        }
    }
}

fn setup(stream: &AsyncStream) -> Result<(), State> {
    let (path, mode, stream_mode) = {
        let url = stream.core.url.lock();
        let backend = stream.core.backend.lock();
        let state = match &*backend {
            Backend::File(state) => state,
            _ => return Err(State::Failed),
        };
        (url.path().to_string(), state.mode, state.stream_mode)
    };

    let mut options = OpenOptions::new();
    options
        .read(mode.is_readable())
        .write(mode.is_writable())
        .create(mode.0 & CREATE != 0)
        .append(mode.0 & APPEND != 0)
        .truncate(mode.0 & TRUNCATE != 0);
    #[cfg(target_os = "linux")]
    if mode.0 & DIRECT != 0 {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_DIRECT);
    }

    let file = options.open(&path).map_err(|err| {
        trace!("file open failed: {}: {}", path, err);
        State::from_io_error(&err)
    })?;
    let size = if stream_mode {
        -1
    } else {
        file.metadata().map(|m| m.len() as i64).unwrap_or(-1)
    };
    let aico = stream
        .core
        .aicp
        .attach_file(file)
        .map_err(|_| State::OutOfMemory)?;

    let mut backend = stream.core.backend.lock();
    if let Backend::File(state) = &mut *backend {
        state.aico = Some(aico);
    }
    stream.core.size_hint.store(size, Ordering::Relaxed);
    stream.core.offset.store(0, Ordering::Relaxed);
    Ok(())
}

fn aico_of(stream: &AsyncStream) -> Option<Aico> {
    match &*stream.core.backend.lock() {
        Backend::File(state) => state.aico,
        _ => None,
    }
}

pub(crate) fn open(stream: &AsyncStream, func: OpenFunc) -> bool {
    if let Err(state) = setup(stream) {
        stream.open_done(state, func);
        return true;
    }
    let aico = match aico_of(stream) {
        Some(aico) => aico,
        None => {
            stream.open_done(State::Failed, func);
            return true;
        }
    };
    // Deliver the open completion on the worker like every other backend.
    let this = stream.clone();
    let mut slot = Some(func);
    this.op_begin();
    stream.core.aicp.run_after(
        aico,
        Duration::ZERO,
        Box::new(move |aice| {
            this.op_end();
            if let Some(func) = slot.take() {
                this.open_done(aice.state, func);
            }
            false
        }),
    )
}

pub(crate) fn open_try(stream: &AsyncStream) -> bool {
    setup(stream).is_ok()
}

pub(crate) fn read(stream: &AsyncStream, size: usize, func: ReadFunc) -> bool {
    let aico = match aico_of(stream) {
        Some(aico) => aico,
        None => return false,
    };
    let buf = stream.take_rcache(size.max(1));
    let this = stream.clone();
    let mut func = func;
    this.op_begin();
    let posted = stream.post(
        aico,
        Op::Read {
            offset: stream.offset(),
            buf,
        },
        Box::new(move |aice| {
            let state = aice.state;
            let again = match state {
                State::Ok => {
                    let real = aice.bytes();
                    this.advance_offset(real);
                    func(&this, State::Ok, aice.data().unwrap_or(&[]))
                }
                state => {
                    // End of file arrives as `closed`.
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
    let aico = match aico_of(stream) {
        Some(aico) => aico,
        None => return false,
    };
    let this = stream.clone();
    let mut func = func;
    this.op_begin();
    let posted = stream.post(
        aico,
        Op::Writ {
            offset: stream.offset(),
            data,
        },
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

pub(crate) fn seek(stream: &AsyncStream, offset: u64, func: SeekFunc) -> bool {
    if stream.is_stream_mode() {
        func(stream, State::NotSupported, stream.offset());
        return true;
    }
    stream.core.offset.store(offset, Ordering::Relaxed);
    func(stream, State::Ok, offset);
    true
}

pub(crate) fn sync(stream: &AsyncStream, _closing: bool, func: SyncFunc) -> bool {
    let aico = match aico_of(stream) {
        Some(aico) => aico,
        None => return false,
    };
    let this = stream.clone();
    let mut slot = Some(func);
    this.op_begin();
    let posted = stream.post(
        aico,
        Op::Fsync,
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
    let aico = {
        let mut backend = stream.core.backend.lock();
        match &mut *backend {
            Backend::File(state) => state.aico.take(),
            _ => None,
        }
    };
    match aico {
        Some(aico) => {
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
        None => {
            func(stream, State::Ok);
            true
        }
    }
}

pub(crate) fn close_quietly(stream: &AsyncStream) {
    let aico = {
        let mut backend = stream.core.backend.lock();
        match &mut *backend {
            Backend::File(state) => state.aico.take(),
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
    if let Some(aico) = aico_of(stream) {
        stream.core.aicp.cancel(aico);
    }
}
