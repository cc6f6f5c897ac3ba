//! Cross-thread wakeup for the worker's selector sleep.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

/// Token reserved for the waker registration inside the worker's selector.
pub(crate) const WAKER_TOKEN: usize = usize::MAX;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use eventfd::Waker;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod eventfd {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::FromRawFd;

    /// Waker backed by `eventfd`.
    ///
    /// `eventfd` is effectively a 64 bit counter. All writes must be of 8
    /// bytes (64 bits) and are added to the count; reads reset it.
    #[derive(Debug)]
    pub(crate) struct Waker {
        fd: File,
    }

    impl Waker {
        pub fn new() -> io::Result<Waker> {
            let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
            let file = unsafe { File::from_raw_fd(fd) };
            Ok(Waker { fd: file })
        }

        #[allow(clippy::unused_io_amount)] // Don't care about partial writes.
        pub fn wake(&self) -> io::Result<()> {
            let buf: [u8; 8] = 1u64.to_ne_bytes();
            match (&self.fd).write(&buf) {
                Ok(_) => Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // Writing only blocks if the counter is about to
                    // overflow; reset and wake again.
                    self.ack()?;
                    self.wake()
                }
                Err(err) => Err(err),
            }
        }

        /// Drains the counter after the selector reported the waker
        /// readable.
        #[allow(clippy::unused_io_amount)] // Don't care about partial reads.
        pub fn ack(&self) -> io::Result<()> {
            let mut buf: [u8; 8] = 0u64.to_ne_bytes();
            match (&self.fd).read(&mut buf) {
                Ok(_) => Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
                Err(err) => Err(err),
            }
        }
    }

    impl AsRawFd for Waker {
        fn as_raw_fd(&self) -> RawFd {
            self.fd.as_raw_fd()
        }
    }
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
pub(crate) use pipe::Waker;

#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
mod pipe {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::FromRawFd;

    /// Waker backed by a unix pipe, for platforms without `eventfd`.
    #[derive(Debug)]
    pub(crate) struct Waker {
        sender: File,
        receiver: File,
    }

    impl Waker {
        pub fn new() -> io::Result<Waker> {
            let mut fds = [-1; 2];
            syscall!(pipe(fds.as_mut_ptr()))?;
            for fd in fds {
                syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK))?;
                syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
            }
            Ok(Waker {
                sender: unsafe { File::from_raw_fd(fds[1]) },
                receiver: unsafe { File::from_raw_fd(fds[0]) },
            })
        }

        pub fn wake(&self) -> io::Result<()> {
            match (&self.sender).write(&[1]) {
                Ok(_) => Ok(()),
                // The reading end is full; the worker will wake anyway.
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
                Err(err) => Err(err),
            }
        }

        pub fn ack(&self) -> io::Result<()> {
            let mut buf = [0u8; 128];
            loop {
                match (&self.receiver).read(&mut buf) {
                    Ok(n) if n > 0 => continue,
                    Ok(_) => return Ok(()),
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(err) => return Err(err),
                }
            }
        }
    }

    impl AsRawFd for Waker {
        fn as_raw_fd(&self) -> RawFd {
            self.receiver.as_raw_fd()
        }
    }
}
