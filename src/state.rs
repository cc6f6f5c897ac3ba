use std::fmt;
use std::io;

/// Final state of a completed operation.
///
/// Every platform error is folded into this taxonomy before a completion
/// callback fires; no raw OS error ever crosses the engine boundary. The
/// variants are deliberately coarse: a caller decides between retrying,
/// continuing, and abandoning, nothing finer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// The operation completed successfully.
    Ok,
    /// The operation failed for an unclassified reason.
    Failed,
    /// The operation was aborted by a kill on its object or its engine.
    Killed,
    /// The peer closed the connection (or end of a file-backed stream).
    Closed,
    /// The operation is still in flight.
    Pending,
    /// The per-operation timeout fired before completion.
    Timeout,
    /// The remote end refused the connection.
    Refused,
    /// The network or host is unreachable.
    Unreachable,
    /// The connection was reset by the peer.
    Reset,
    /// The platform ran out of buffer space or quota.
    NoBuffers,
    /// A datagram or buffer exceeded the platform limit.
    MsgTooBig,
    /// The operation is not supported by this object or backend.
    NotSupported,
    /// The operation is recognised but not implemented here.
    NotImplemented,
    /// An argument failed validation before the platform was reached.
    InvalidArgument,
    /// End of stream.
    Eof,
    /// An allocation failed.
    OutOfMemory,
    /// Host name resolution failed.
    DnsFailed,
    /// The SSL layer reported a failure during handshake or transfer.
    SslFailed,
    /// An unclassified Win32 error code, preserved for diagnosis.
    Win32(u16),
}

impl State {
    /// Returns true for [`State::Ok`].
    pub fn is_ok(self) -> bool {
        self == State::Ok
    }

    /// Returns true for the states a caller may treat as "try again later".
    pub fn is_pending(self) -> bool {
        self == State::Pending
    }

    /// Folds a BSD errno value into the taxonomy.
    #[cfg(unix)]
    pub(crate) fn from_errno(errno: i32) -> State {
        match errno {
            0 => State::Ok,
            libc::EAGAIN | libc::EINPROGRESS => State::Pending,
            libc::ETIMEDOUT => State::Timeout,
            libc::ECONNREFUSED => State::Refused,
            libc::ENETUNREACH | libc::EHOSTUNREACH | libc::ENETDOWN => State::Unreachable,
            libc::ECONNRESET | libc::EPIPE => State::Reset,
            libc::ECONNABORTED => State::Closed,
            libc::ENOBUFS | libc::ENOMEM => State::NoBuffers,
            libc::EMSGSIZE => State::MsgTooBig,
            libc::EOPNOTSUPP => State::NotSupported,
            libc::EINVAL => State::InvalidArgument,
            libc::EINTR | libc::ECANCELED => State::Killed,
            _ => State::Failed,
        }
    }

    /// Folds an `io::Error` into the taxonomy.
    pub(crate) fn from_io_error(err: &io::Error) -> State {
        #[cfg(unix)]
        if let Some(errno) = err.raw_os_error() {
            return State::from_errno(errno);
        }
        match err.kind() {
            io::ErrorKind::WouldBlock => State::Pending,
            io::ErrorKind::TimedOut => State::Timeout,
            io::ErrorKind::ConnectionRefused => State::Refused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => State::Reset,
            io::ErrorKind::ConnectionAborted => State::Closed,
            io::ErrorKind::UnexpectedEof => State::Eof,
            io::ErrorKind::InvalidInput => State::InvalidArgument,
            io::ErrorKind::Interrupted => State::Killed,
            io::ErrorKind::OutOfMemory => State::OutOfMemory,
            io::ErrorKind::Unsupported => State::NotSupported,
            _ => State::Failed,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            State::Ok => "ok",
            State::Failed => "failed",
            State::Killed => "killed",
            State::Closed => "closed",
            State::Pending => "pending",
            State::Timeout => "timeout",
            State::Refused => "refused",
            State::Unreachable => "unreachable",
            State::Reset => "reset",
            State::NoBuffers => "no buffers",
            State::MsgTooBig => "message too big",
            State::NotSupported => "not supported",
            State::NotImplemented => "not implemented",
            State::InvalidArgument => "invalid argument",
            State::Eof => "end of stream",
            State::OutOfMemory => "out of memory",
            State::DnsFailed => "dns failed",
            State::SslFailed => "ssl failed",
            State::Win32(code) => return write!(fmt, "win32 error {}", code),
        };
        fmt.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_kinds_fold() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(State::from_io_error(&err), State::Refused);
        let err = io::Error::new(io::ErrorKind::WouldBlock, "block");
        assert_eq!(State::from_io_error(&err), State::Pending);
    }

    #[cfg(unix)]
    #[test]
    fn errno_folds() {
        assert_eq!(State::from_errno(libc::ECONNRESET), State::Reset);
        assert_eq!(State::from_errno(libc::ETIMEDOUT), State::Timeout);
        assert_eq!(State::from_errno(0), State::Ok);
    }
}
