//! Positioned file primitives. Regular files never report `WouldBlock`, so
//! these complete synchronously inside the worker.

use std::io;
use std::os::fd::RawFd;

pub(crate) fn pread(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let n = syscall!(pread(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        offset as libc::off_t,
    ))?;
    Ok(n as usize)
}

pub(crate) fn pwrite(fd: RawFd, buf: &[u8], offset: u64) -> io::Result<usize> {
    let n = syscall!(pwrite(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len(),
        offset as libc::off_t,
    ))?;
    Ok(n as usize)
}

pub(crate) fn preadv(fd: RawFd, bufs: &mut [Vec<u8>], offset: u64) -> io::Result<usize> {
    let mut total = 0;
    let mut offset = offset;
    // Sequential preads keep this portable; the platform preadv variants
    // differ in offset types across the BSDs.
    for buf in bufs {
        let n = pread(fd, buf, offset)?;
        total += n;
        offset += n as u64;
        if n < buf.len() {
            break;
        }
    }
    Ok(total)
}

pub(crate) fn pwritev(fd: RawFd, bufs: &[Vec<u8>], offset: u64) -> io::Result<usize> {
    let mut total = 0;
    let mut offset = offset;
    for buf in bufs {
        let n = pwrite(fd, buf, offset)?;
        total += n;
        offset += n as u64;
        if n < buf.len() {
            break;
        }
    }
    Ok(total)
}

pub(crate) fn fsync(fd: RawFd) -> io::Result<()> {
    syscall!(fsync(fd)).map(|_| ())
}
