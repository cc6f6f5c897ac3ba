//! Edge-triggered, oneshot readiness selector.
//!
//! Registrations are armed per pending operation and disarm themselves on
//! delivery, so a completion is only ever observed by the operation that
//! armed it.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// A single readiness event: which object, which directions.
#[derive(Copy, Clone, Debug)]
pub(crate) struct SelectorEvent {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

pub(crate) type SelectorEvents = Vec<SelectorEvent>;

#[cfg(any(target_os = "linux", target_os = "android", target_os = "illumos"))]
pub(crate) use epoll::Selector;

#[cfg(any(target_os = "linux", target_os = "android", target_os = "illumos"))]
mod epoll {
    use super::*;

    #[derive(Debug)]
    pub(crate) struct Selector {
        ep: OwnedFd,
        events: Vec<libc::epoll_event>,
    }

    impl Selector {
        pub fn new(capacity: usize) -> io::Result<Selector> {
            // SAFETY: `epoll_create1(2)` ensures the fd is valid.
            let ep =
                unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
            Ok(Selector {
                ep,
                events: Vec::with_capacity(capacity.clamp(16, 1024)),
            })
        }

        /// Arms a oneshot registration. `added` tells whether the fd is
        /// already in the epoll set from an earlier arm.
        pub fn arm(
            &self,
            fd: RawFd,
            token: usize,
            readable: bool,
            writable: bool,
            added: bool,
        ) -> io::Result<()> {
            let mut event = libc::epoll_event {
                events: interests_to_epoll(readable, writable),
                u64: token as u64,
            };
            let op = if added {
                libc::EPOLL_CTL_MOD
            } else {
                libc::EPOLL_CTL_ADD
            };
            syscall!(epoll_ctl(self.ep.as_raw_fd(), op, fd, &mut event)).map(|_| ())
        }

        pub fn disarm(&self, fd: RawFd) -> io::Result<()> {
            syscall!(epoll_ctl(
                self.ep.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            ))
            .map(|_| ())
        }

        /// Persistent registration for the worker's waker fd.
        pub fn arm_waker(&self, fd: RawFd) -> io::Result<()> {
            let mut event = libc::epoll_event {
                events: libc::EPOLLIN as u32,
                u64: super::super::waker::WAKER_TOKEN as u64,
            };
            syscall!(epoll_ctl(
                self.ep.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                fd,
                &mut event
            ))
            .map(|_| ())
        }

        /// Persistent edge-triggered registration, for the poller front-end.
        pub fn watch(
            &self,
            fd: RawFd,
            token: usize,
            readable: bool,
            writable: bool,
            added: bool,
        ) -> io::Result<()> {
            let mut kind = libc::EPOLLET;
            if readable {
                kind |= libc::EPOLLIN | libc::EPOLLRDHUP;
            }
            if writable {
                kind |= libc::EPOLLOUT;
            }
            let mut event = libc::epoll_event {
                events: kind as u32,
                u64: token as u64,
            };
            let op = if added {
                libc::EPOLL_CTL_MOD
            } else {
                libc::EPOLL_CTL_ADD
            };
            syscall!(epoll_ctl(self.ep.as_raw_fd(), op, fd, &mut event)).map(|_| ())
        }

        pub fn select(
            &mut self,
            out: &mut SelectorEvents,
            timeout: Option<Duration>,
        ) -> io::Result<()> {
            let timeout = timeout
                .map(|to| {
                    // `Duration::as_millis` truncates, so round up; a
                    // sub-millisecond timeout must not busy-spin as zero.
                    to.checked_add(Duration::from_nanos(999_999))
                        .unwrap_or(to)
                        .as_millis()
                        .min(libc::c_int::MAX as u128) as libc::c_int
                })
                .unwrap_or(-1);

            self.events.clear();
            let capacity = self.events.capacity();
            let n_events = match syscall!(epoll_wait(
                self.ep.as_raw_fd(),
                self.events.as_mut_ptr(),
                capacity as i32,
                timeout,
            )) {
                Ok(n) => n as usize,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => 0,
                Err(err) => return Err(err),
            };
            // SAFETY: `epoll_wait` ensures that `n_events` are assigned.
            unsafe { self.events.set_len(n_events) };

            for event in self.events.iter() {
                let bits = event.events as libc::c_int;
                out.push(SelectorEvent {
                    token: event.u64 as usize,
                    readable: bits & (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP) != 0,
                    writable: bits & (libc::EPOLLOUT | libc::EPOLLHUP) != 0,
                    error: bits & libc::EPOLLERR != 0,
                });
            }
            Ok(())
        }
    }

    fn interests_to_epoll(readable: bool, writable: bool) -> u32 {
        let mut kind = libc::EPOLLET | libc::EPOLLONESHOT;
        if readable {
            kind |= libc::EPOLLIN | libc::EPOLLRDHUP;
        }
        if writable {
            kind |= libc::EPOLLOUT;
        }
        kind as u32
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
pub(crate) use kqueue::Selector;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
mod kqueue {
    use super::*;
    use std::mem;

    #[derive(Debug)]
    pub(crate) struct Selector {
        kq: OwnedFd,
        events: Vec<libc::kevent>,
    }

    impl Selector {
        pub fn new(capacity: usize) -> io::Result<Selector> {
            let kq = unsafe { OwnedFd::from_raw_fd(syscall!(kqueue())?) };
            syscall!(fcntl(kq.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;
            Ok(Selector {
                kq,
                events: Vec::with_capacity(capacity.clamp(16, 1024)),
            })
        }

        pub fn arm(
            &self,
            fd: RawFd,
            token: usize,
            readable: bool,
            writable: bool,
            _added: bool,
        ) -> io::Result<()> {
            let mut changes: Vec<libc::kevent> = Vec::with_capacity(2);
            let flags = libc::EV_ADD | libc::EV_CLEAR | libc::EV_ONESHOT | libc::EV_RECEIPT;
            if readable {
                changes.push(kevent(fd, libc::EVFILT_READ, flags, token));
            }
            if writable {
                changes.push(kevent(fd, libc::EVFILT_WRITE, flags, token));
            }
            syscall!(kevent(
                self.kq.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as _,
                changes.as_mut_ptr(),
                changes.len() as _,
                std::ptr::null(),
            ))
            .map(|_| ())
        }

        /// Persistent edge-triggered registration, for the poller front-end.
        pub fn watch(
            &self,
            fd: RawFd,
            token: usize,
            readable: bool,
            writable: bool,
            _added: bool,
        ) -> io::Result<()> {
            let mut changes: Vec<libc::kevent> = Vec::with_capacity(2);
            let flags = libc::EV_ADD | libc::EV_CLEAR | libc::EV_RECEIPT;
            if readable {
                changes.push(kevent(fd, libc::EVFILT_READ, flags, token));
            }
            if writable {
                changes.push(kevent(fd, libc::EVFILT_WRITE, flags, token));
            }
            syscall!(kevent(
                self.kq.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as _,
                changes.as_mut_ptr(),
                changes.len() as _,
                std::ptr::null(),
            ))
            .map(|_| ())
        }

        /// Persistent registration for the worker's waker fd.
        pub fn arm_waker(&self, fd: RawFd) -> io::Result<()> {
            let mut changes = [kevent(
                fd,
                libc::EVFILT_READ,
                libc::EV_ADD | libc::EV_CLEAR,
                super::super::waker::WAKER_TOKEN,
            )];
            syscall!(kevent(
                self.kq.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as _,
                changes.as_mut_ptr(),
                changes.len() as _,
                std::ptr::null(),
            ))
            .map(|_| ())
        }

        pub fn disarm(&self, fd: RawFd) -> io::Result<()> {
            let flags = libc::EV_DELETE | libc::EV_RECEIPT;
            let mut changes = [
                kevent(fd, libc::EVFILT_READ, flags, 0),
                kevent(fd, libc::EVFILT_WRITE, flags, 0),
            ];
            // Deleting a filter that was never added reports per-event
            // receipts; ignore them.
            let _ = syscall!(kevent(
                self.kq.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as _,
                changes.as_mut_ptr(),
                changes.len() as _,
                std::ptr::null(),
            ));
            Ok(())
        }

        pub fn select(
            &mut self,
            out: &mut SelectorEvents,
            timeout: Option<Duration>,
        ) -> io::Result<()> {
            let timespec = timeout.map(|to| libc::timespec {
                tv_sec: to.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
                tv_nsec: to.subsec_nanos() as _,
            });
            let timespec_ptr = timespec
                .as_ref()
                .map(|ts| ts as *const libc::timespec)
                .unwrap_or(std::ptr::null());

            self.events.clear();
            let capacity = self.events.capacity();
            let n_events = match syscall!(kevent(
                self.kq.as_raw_fd(),
                std::ptr::null(),
                0,
                self.events.as_mut_ptr(),
                capacity as _,
                timespec_ptr,
            )) {
                Ok(n) => n as usize,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => 0,
                Err(err) => return Err(err),
            };
            unsafe { self.events.set_len(n_events) };

            for event in self.events.iter() {
                out.push(SelectorEvent {
                    token: event.udata as usize,
                    readable: event.filter == libc::EVFILT_READ,
                    writable: event.filter == libc::EVFILT_WRITE,
                    error: event.flags & libc::EV_ERROR != 0 && event.data != 0,
                });
            }
            Ok(())
        }
    }

    fn kevent(fd: RawFd, filter: i16, flags: u16, token: usize) -> libc::kevent {
        let mut ev: libc::kevent = unsafe { mem::zeroed() };
        ev.ident = fd as libc::uintptr_t;
        ev.filter = filter as _;
        ev.flags = flags;
        ev.udata = token as _;
        ev
    }
}
