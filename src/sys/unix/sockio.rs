//! Nonblocking socket primitives, retried on readiness by the worker.

use std::io;
use std::mem;
use std::os::fd::{FromRawFd, RawFd};

use crate::Endpoint;

/// Accepts one pending connection, returning the client socket (already
/// nonblocking and cloexec) and the peer endpoint.
pub(crate) fn accept(fd: RawFd) -> io::Result<(socket2::Socket, Endpoint)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    let client = {
        let client = syscall!(accept4(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        unsafe { socket2::Socket::from_raw_fd(client) }
    };

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    let client = {
        use std::os::fd::AsRawFd;
        let client = syscall!(accept(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        let client = unsafe { socket2::Socket::from_raw_fd(client) };
        client.set_nonblocking(true)?;
        syscall!(fcntl(client.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;
        client
    };

    let (peer, _) = Endpoint::from_sockaddr(&storage);
    Ok((client, peer))
}

/// Starts a nonblocking connect. `WouldBlock`/`InProgress` surface as raw
/// errors; the caller arms writability and finishes with
/// [`connect_result`].
pub(crate) fn connect(fd: RawFd, addr: &Endpoint) -> io::Result<()> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = addr.to_sockaddr(&mut storage);
    if len == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "unspec endpoint"));
    }
    syscall!(connect(fd, &storage as *const _ as *const libc::sockaddr, len)).map(|_| ())
}

/// Harvests the result of a pending connect after the socket reported
/// writable.
pub(crate) fn connect_result(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut _ as *mut libc::c_void,
        &mut len,
    ))?;
    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = syscall!(recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0))?;
    Ok(n as usize)
}

pub(crate) fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = syscall!(send(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len(),
        flag_no_sigpipe(),
    ))?;
    Ok(n as usize)
}

pub(crate) fn recvfrom(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Endpoint)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = syscall!(recvfrom(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        0,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
    ))?;
    let (peer, _) = Endpoint::from_sockaddr(&storage);
    Ok((n as usize, peer))
}

pub(crate) fn sendto(fd: RawFd, buf: &[u8], addr: &Endpoint) -> io::Result<usize> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = addr.to_sockaddr(&mut storage);
    if len == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "unspec endpoint"));
    }
    let n = syscall!(sendto(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len(),
        flag_no_sigpipe(),
        &storage as *const _ as *const libc::sockaddr,
        len,
    ))?;
    Ok(n as usize)
}

/// Scatter receive across `bufs`, skipping the first `skip` bytes worth of
/// buffer space already filled by an earlier partial completion.
pub(crate) fn recvv(fd: RawFd, bufs: &mut [Vec<u8>], skip: usize) -> io::Result<usize> {
    let mut iovs = iovecs_mut(bufs, skip);
    if iovs.is_empty() {
        return Ok(0);
    }
    let n = syscall!(readv(fd, iovs.as_mut_ptr(), iovs.len() as libc::c_int))?;
    Ok(n as usize)
}

pub(crate) fn sendv(fd: RawFd, bufs: &[Vec<u8>], skip: usize) -> io::Result<usize> {
    let iovs = iovecs(bufs, skip);
    if iovs.is_empty() {
        return Ok(0);
    }
    let n = syscall!(writev(fd, iovs.as_ptr(), iovs.len() as libc::c_int))?;
    Ok(n as usize)
}

/// Scatter receive of one datagram; the source address lands in `name`,
/// the object's scratch buffer.
pub(crate) fn urecvv(fd: RawFd, bufs: &mut [Vec<u8>], name: &mut [u8]) -> io::Result<(usize, Endpoint)> {
    debug_assert!(name.len() >= mem::size_of::<libc::sockaddr_storage>());
    let mut iovs = iovecs_mut(bufs, 0);
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = name.as_mut_ptr() as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = iovs.as_mut_ptr();
    msg.msg_iovlen = iovs.len() as _;
    let n = syscall!(recvmsg(fd, &mut msg, 0))?;
    let storage = unsafe { &*(name.as_ptr() as *const libc::sockaddr_storage) };
    let (peer, _) = Endpoint::from_sockaddr(storage);
    Ok((n as usize, peer))
}

pub(crate) fn usendv(fd: RawFd, bufs: &[Vec<u8>], addr: &Endpoint) -> io::Result<usize> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = addr.to_sockaddr(&mut storage);
    if len == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "unspec endpoint"));
    }
    let mut iovs = iovecs(bufs, 0);
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
    msg.msg_namelen = len;
    msg.msg_iov = iovs.as_mut_ptr();
    msg.msg_iovlen = iovs.len() as _;
    let n = syscall!(sendmsg(fd, &msg, flag_no_sigpipe()))?;
    Ok(n as usize)
}

/// Transmits up to `size` bytes of `file` starting at `offset` over a TCP
/// socket. Linux uses `sendfile(2)`; elsewhere a bounded copy through a
/// scratch buffer keeps the same contract.
pub(crate) fn sendfile(fd: RawFd, file: RawFd, offset: u64, size: usize) -> io::Result<usize> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let mut off = offset as libc::off_t;
        let n = syscall!(sendfile(fd, file, &mut off, size))?;
        Ok(n as usize)
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let mut chunk = vec![0u8; size.min(64 * 1024)];
        let n = super::fileio::pread(file, &mut chunk, offset)?;
        if n == 0 {
            return Ok(0);
        }
        send(fd, &chunk[..n])
    }
}

fn iovecs(bufs: &[Vec<u8>], mut skip: usize) -> Vec<libc::iovec> {
    let mut iovs = Vec::with_capacity(bufs.len());
    for buf in bufs {
        if skip >= buf.len() {
            skip -= buf.len();
            continue;
        }
        iovs.push(libc::iovec {
            iov_base: unsafe { buf.as_ptr().add(skip) } as *mut libc::c_void,
            iov_len: buf.len() - skip,
        });
        skip = 0;
    }
    iovs
}

fn iovecs_mut(bufs: &mut [Vec<u8>], mut skip: usize) -> Vec<libc::iovec> {
    let mut iovs = Vec::with_capacity(bufs.len());
    for buf in bufs {
        if skip >= buf.len() {
            skip -= buf.len();
            continue;
        }
        iovs.push(libc::iovec {
            iov_base: unsafe { buf.as_mut_ptr().add(skip) } as *mut libc::c_void,
            iov_len: buf.len() - skip,
        });
        skip = 0;
    }
    iovs
}

// macOS has no MSG_NOSIGNAL; sockets get SO_NOSIGPIPE at creation instead.
fn flag_no_sigpipe() -> libc::c_int {
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    {
        libc::MSG_NOSIGNAL
    }
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        0
    }
}
