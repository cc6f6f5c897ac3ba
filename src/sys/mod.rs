//! Platform-specific bindings.
//!
//! `sys::unix` drives completion over an edge-triggered readiness selector
//! (epoll or kqueue) with nonblocking syscalls retried on readiness;
//! `sys::windows` drives a real I/O completion port with overlapped
//! operations. The proactor worker above is shared between both.

#[cfg(unix)]
pub(crate) mod unix;
#[cfg(unix)]
pub(crate) use self::unix::*;

#[cfg(windows)]
pub(crate) mod windows;
#[cfg(windows)]
pub(crate) use self::windows::*;
