//! Windows backend: a real I/O completion port.
//!
//! Operations are issued as overlapped calls against handles associated
//! with one completion port; the worker dequeues completion batches with
//! `GetQueuedCompletionStatusEx`, folds the NT status of each overlapped
//! into the completion taxonomy, and feeds the shared completion path.

pub(crate) mod ext;
pub(crate) mod poller;
pub(crate) mod worker;

use std::io;
use std::sync::Arc;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::IO::{CreateIoCompletionPort, PostQueuedCompletionStatus};

// Completion key reserved for wakeups.
pub(crate) const WAKE_KEY: usize = usize::MAX;

pub(crate) struct Port {
    handle: HANDLE,
}

// The port handle is thread-safe by contract of the API.
unsafe impl Send for Port {}
unsafe impl Sync for Port {}

impl Port {
    pub fn new() -> io::Result<Port> {
        let handle = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0, 0, 1) };
        if handle == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Port { handle })
    }

    pub fn raw(&self) -> HANDLE {
        self.handle
    }

    /// Associates a socket or file handle, keyed by the aico index.
    pub fn associate(&self, handle: HANDLE, key: usize) -> io::Result<()> {
        let rc = unsafe { CreateIoCompletionPort(handle, self.handle, key, 0) };
        if rc == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn post(&self, key: usize) -> io::Result<()> {
        let rc =
            unsafe { PostQueuedCompletionStatus(self.handle, 0, key, std::ptr::null_mut()) };
        if rc == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.handle) };
    }
}

/// Waker: owns the completion port so posting threads can wake the worker
/// before the worker even exists.
pub(crate) struct Waker {
    port: Arc<Port>,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        Ok(Waker {
            port: Arc::new(Port::new()?),
        })
    }

    pub fn wake(&self) -> io::Result<()> {
        self.port.post(WAKE_KEY)
    }

    pub(crate) fn port(&self) -> Arc<Port> {
        Arc::clone(&self.port)
    }
}
