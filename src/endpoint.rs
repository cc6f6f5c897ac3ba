use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// An abstract IP endpoint: an address family, an address, and a port.
///
/// `Endpoint` is the engine's wire-neutral address type. It converts to and
/// from the platform `sockaddr` layout at the system boundary and nowhere
/// else. The IPv6 variant carries a scope id which is meaningful only for
/// link-local unicast and link-local multicast addresses; for every other
/// address the scope id is normalized to zero on construction and on decode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// No address family. Produced by default construction and by decoding an
    /// unknown `sockaddr` family.
    Unspec,
    /// An IPv4 address and port.
    V4(SocketAddrV4),
    /// An IPv6 address, port and (link-local only) scope id.
    V6(SocketAddrV6),
}

impl Endpoint {
    /// Creates an IPv4 endpoint.
    pub fn v4(addr: Ipv4Addr, port: u16) -> Endpoint {
        Endpoint::V4(SocketAddrV4::new(addr, port))
    }

    /// Creates an IPv6 endpoint.
    ///
    /// The scope id is kept only when `addr` is link-local unicast or
    /// link-local multicast.
    pub fn v6(addr: Ipv6Addr, scope: u32, port: u16) -> Endpoint {
        let scope = if is_link_local(&addr) { scope } else { 0 };
        Endpoint::V6(SocketAddrV6::new(addr, port, 0, scope))
    }

    /// The IPv4 wildcard endpoint, for binding.
    pub fn any4(port: u16) -> Endpoint {
        Endpoint::v4(Ipv4Addr::UNSPECIFIED, port)
    }

    /// The IPv6 wildcard endpoint, for binding.
    pub fn any6(port: u16) -> Endpoint {
        Endpoint::v6(Ipv6Addr::UNSPECIFIED, 0, port)
    }

    /// Returns true if no address family is set.
    pub fn is_unspec(&self) -> bool {
        matches!(self, Endpoint::Unspec)
    }

    /// Returns true for the wildcard ("any") address of either family.
    pub fn is_any(&self) -> bool {
        match self {
            Endpoint::Unspec => false,
            Endpoint::V4(v4) => v4.ip().is_unspecified(),
            Endpoint::V6(v6) => v6.ip().is_unspecified(),
        }
    }

    /// The port, zero for [`Endpoint::Unspec`].
    pub fn port(&self) -> u16 {
        match self {
            Endpoint::Unspec => 0,
            Endpoint::V4(v4) => v4.port(),
            Endpoint::V6(v6) => v6.port(),
        }
    }

    /// Replaces the port in place. No effect on [`Endpoint::Unspec`].
    pub fn set_port(&mut self, port: u16) {
        match self {
            Endpoint::Unspec => {}
            Endpoint::V4(v4) => v4.set_port(port),
            Endpoint::V6(v6) => v6.set_port(port),
        }
    }

    /// Returns true when the address is IPv6 link-local (unicast or
    /// multicast), the only case in which the scope id is meaningful.
    pub fn is_link_local(&self) -> bool {
        match self {
            Endpoint::V6(v6) => is_link_local(v6.ip()),
            _ => false,
        }
    }
}

impl Default for Endpoint {
    fn default() -> Endpoint {
        Endpoint::Unspec
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unspec => fmt.write_str("<unspec>"),
            Endpoint::V4(v4) => v4.fmt(fmt),
            Endpoint::V6(v6) => v6.fmt(fmt),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Endpoint {
        match addr {
            SocketAddr::V4(v4) => Endpoint::V4(v4),
            SocketAddr::V6(v6) => Endpoint::v6(*v6.ip(), v6.scope_id(), v6.port()),
        }
    }
}

impl TryFrom<Endpoint> for SocketAddr {
    type Error = ();

    fn try_from(ep: Endpoint) -> Result<SocketAddr, ()> {
        match ep {
            Endpoint::Unspec => Err(()),
            Endpoint::V4(v4) => Ok(SocketAddr::V4(v4)),
            Endpoint::V6(v6) => Ok(SocketAddr::V6(v6)),
        }
    }
}

fn is_link_local(addr: &Ipv6Addr) -> bool {
    let seg = addr.segments();
    // fe80::/10 unicast, or multicast with link-local scope (ff_2::).
    (seg[0] & 0xffc0) == 0xfe80 || (seg[0] & 0xff0f) == 0xff02
}

#[cfg(unix)]
mod sockaddr {
    use super::*;
    use std::mem;

    impl Endpoint {
        /// Decodes a platform `sockaddr` into an endpoint, returning the size
        /// of the concrete `sockaddr` that was read. An unknown family is a
        /// programming error and yields `(Unspec, 0)`.
        pub(crate) fn from_sockaddr(
            storage: &libc::sockaddr_storage,
        ) -> (Endpoint, libc::socklen_t) {
            match storage.ss_family as libc::c_int {
                libc::AF_INET => {
                    let sin = unsafe {
                        &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in)
                    };
                    let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                    let port = u16::from_be(sin.sin_port);
                    (
                        Endpoint::v4(ip, port),
                        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    )
                }
                libc::AF_INET6 => {
                    let sin6 = unsafe {
                        &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6)
                    };
                    let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                    let port = u16::from_be(sin6.sin6_port);
                    (
                        Endpoint::v6(ip, sin6.sin6_scope_id, port),
                        mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    )
                }
                _ => (Endpoint::Unspec, 0),
            }
        }

        /// Encodes the endpoint into a zeroed platform `sockaddr`, returning
        /// the size written, or 0 for [`Endpoint::Unspec`].
        pub(crate) fn to_sockaddr(
            &self,
            storage: &mut libc::sockaddr_storage,
        ) -> libc::socklen_t {
            *storage = unsafe { mem::zeroed() };
            match self {
                Endpoint::Unspec => 0,
                Endpoint::V4(v4) => {
                    let sin = unsafe {
                        &mut *(storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in)
                    };
                    sin.sin_family = libc::AF_INET as libc::sa_family_t;
                    sin.sin_port = v4.port().to_be();
                    sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
                    mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
                }
                Endpoint::V6(v6) => {
                    let sin6 = unsafe {
                        &mut *(storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6)
                    };
                    sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    sin6.sin6_port = v6.port().to_be();
                    sin6.sin6_addr.s6_addr = v6.ip().octets();
                    if is_link_local(v6.ip()) {
                        sin6.sin6_scope_id = v6.scope_id();
                    }
                    mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
                }
            }
        }
    }
}

#[cfg(windows)]
mod sockaddr {
    use super::*;
    use std::mem;
    use windows_sys::Win32::Networking::WinSock::{
        AF_INET, AF_INET6, SOCKADDR_IN, SOCKADDR_IN6, SOCKADDR_STORAGE,
    };

    impl Endpoint {
        pub(crate) fn from_sockaddr(storage: &SOCKADDR_STORAGE) -> (Endpoint, i32) {
            match storage.ss_family {
                AF_INET => {
                    let sin = unsafe { &*(storage as *const SOCKADDR_STORAGE as *const SOCKADDR_IN) };
                    let ip = Ipv4Addr::from(unsafe { sin.sin_addr.S_un.S_addr }.to_ne_bytes());
                    let port = u16::from_be(sin.sin_port);
                    (Endpoint::v4(ip, port), mem::size_of::<SOCKADDR_IN>() as i32)
                }
                AF_INET6 => {
                    let sin6 =
                        unsafe { &*(storage as *const SOCKADDR_STORAGE as *const SOCKADDR_IN6) };
                    let ip = Ipv6Addr::from(unsafe { sin6.sin6_addr.u.Byte });
                    let port = u16::from_be(sin6.sin6_port);
                    let scope = unsafe { sin6.Anonymous.sin6_scope_id };
                    (Endpoint::v6(ip, scope, port), mem::size_of::<SOCKADDR_IN6>() as i32)
                }
                _ => (Endpoint::Unspec, 0),
            }
        }

        pub(crate) fn to_sockaddr(&self, storage: &mut SOCKADDR_STORAGE) -> i32 {
            *storage = unsafe { mem::zeroed() };
            match self {
                Endpoint::Unspec => 0,
                Endpoint::V4(v4) => {
                    let sin =
                        unsafe { &mut *(storage as *mut SOCKADDR_STORAGE as *mut SOCKADDR_IN) };
                    sin.sin_family = AF_INET;
                    sin.sin_port = v4.port().to_be();
                    sin.sin_addr.S_un.S_addr = u32::from_ne_bytes(v4.ip().octets());
                    mem::size_of::<SOCKADDR_IN>() as i32
                }
                Endpoint::V6(v6) => {
                    let sin6 =
                        unsafe { &mut *(storage as *mut SOCKADDR_STORAGE as *mut SOCKADDR_IN6) };
                    sin6.sin6_family = AF_INET6;
                    sin6.sin6_port = v6.port().to_be();
                    sin6.sin6_addr.u.Byte = v6.ip().octets();
                    if v6.scope_id() != 0 {
                        sin6.Anonymous.sin6_scope_id = v6.scope_id();
                    }
                    mem::size_of::<SOCKADDR_IN6>() as i32
                }
            }
        }
    }
}

/// NT status normalization.
///
/// On the IOCP backend a completed overlapped carries an NT status in its
/// `Internal` field. This table folds every status the network and file paths
/// can produce into the completion taxonomy. Codes outside the table whose
/// facility is NT-Win32 and whose severity bits are set are surfaced as their
/// low 16 bits; everything else is an invalid argument.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) mod ntstatus {
    use crate::State;

    pub const STATUS_SUCCESS: u32 = 0x0000_0000;
    pub const STATUS_PENDING: u32 = 0x0000_0103;
    pub const STATUS_END_OF_FILE: u32 = 0xC000_0011;
    pub const STATUS_INVALID_HANDLE: u32 = 0xC000_0008;
    pub const STATUS_OBJECT_TYPE_MISMATCH: u32 = 0xC000_0024;
    pub const STATUS_INSUFFICIENT_RESOURCES: u32 = 0xC000_009A;
    pub const STATUS_PAGEFILE_QUOTA: u32 = 0xC000_0007;
    pub const STATUS_COMMITMENT_LIMIT: u32 = 0xC000_012D;
    pub const STATUS_WORKING_SET_QUOTA: u32 = 0xC000_00A1;
    pub const STATUS_NO_MEMORY: u32 = 0xC000_0017;
    pub const STATUS_CONFLICTING_ADDRESSES: u32 = 0xC000_0018;
    pub const STATUS_QUOTA_EXCEEDED: u32 = 0xC000_0044;
    pub const STATUS_TOO_MANY_PAGING_FILES: u32 = 0xC000_0097;
    pub const STATUS_REMOTE_RESOURCES: u32 = 0xC000_013D;
    pub const STATUS_TOO_MANY_ADDRESSES: u32 = 0xC000_0209;
    pub const STATUS_SHARING_VIOLATION: u32 = 0xC000_0043;
    pub const STATUS_ADDRESS_ALREADY_EXISTS: u32 = 0xC000_020A;
    pub const STATUS_LINK_TIMEOUT: u32 = 0xC000_013F;
    pub const STATUS_IO_TIMEOUT: u32 = 0xC000_00B5;
    pub const STATUS_TIMEOUT: u32 = 0x0000_0102;
    pub const STATUS_GRACEFUL_DISCONNECT: u32 = 0xC000_013B;
    pub const STATUS_REMOTE_DISCONNECT: u32 = 0xC000_013C;
    pub const STATUS_CONNECTION_RESET: u32 = 0xC000_020D;
    pub const STATUS_LINK_FAILED: u32 = 0xC000_013E;
    pub const STATUS_CONNECTION_DISCONNECTED: u32 = 0xC000_020C;
    pub const STATUS_PORT_UNREACHABLE: u32 = 0xC000_023F;
    pub const STATUS_HOPLIMIT_EXCEEDED: u32 = 0xC000_A012;
    pub const STATUS_INVALID_DEVICE_STATE: u32 = 0xC000_0184;
    pub const STATUS_LOCAL_DISCONNECT: u32 = 0xC000_013A;
    pub const STATUS_CONNECTION_ABORTED: u32 = 0xC000_0241;
    pub const STATUS_BAD_NETWORK_PATH: u32 = 0xC000_00BE;
    pub const STATUS_NETWORK_UNREACHABLE: u32 = 0xC000_023C;
    pub const STATUS_PROTOCOL_UNREACHABLE: u32 = 0xC000_023E;
    pub const STATUS_HOST_UNREACHABLE: u32 = 0xC000_023D;
    pub const STATUS_CANCELLED: u32 = 0xC000_0120;
    pub const STATUS_REQUEST_ABORTED: u32 = 0xC000_0240;
    pub const STATUS_BUFFER_OVERFLOW: u32 = 0x8000_0005;
    pub const STATUS_INVALID_BUFFER_SIZE: u32 = 0xC000_0206;
    pub const STATUS_BUFFER_TOO_SMALL: u32 = 0xC000_0023;
    pub const STATUS_ACCESS_VIOLATION: u32 = 0xC000_0005;
    pub const STATUS_DEVICE_NOT_READY: u32 = 0xC000_00A3;
    pub const STATUS_REQUEST_NOT_ACCEPTED: u32 = 0xC000_00D0;
    pub const STATUS_INVALID_NETWORK_RESPONSE: u32 = 0xC000_00C3;
    pub const STATUS_NETWORK_BUSY: u32 = 0xC000_00BF;
    pub const STATUS_NO_SUCH_DEVICE: u32 = 0xC000_000E;
    pub const STATUS_NO_SUCH_FILE: u32 = 0xC000_000F;
    pub const STATUS_OBJECT_PATH_NOT_FOUND: u32 = 0xC000_003A;
    pub const STATUS_OBJECT_NAME_NOT_FOUND: u32 = 0xC000_0034;
    pub const STATUS_UNEXPECTED_NETWORK_ERROR: u32 = 0xC000_00C4;
    pub const STATUS_INVALID_CONNECTION: u32 = 0xC000_023A;
    pub const STATUS_REMOTE_NOT_LISTENING: u32 = 0xC000_0236;
    pub const STATUS_CONNECTION_REFUSED: u32 = 0xC000_0237;
    pub const STATUS_PIPE_DISCONNECTED: u32 = 0xC000_00B0;
    pub const STATUS_INVALID_ADDRESS: u32 = 0xC000_0141;
    pub const STATUS_INVALID_ADDRESS_COMPONENT: u32 = 0xC000_0207;
    pub const STATUS_NOT_SUPPORTED: u32 = 0xC000_00BB;
    pub const STATUS_NOT_IMPLEMENTED: u32 = 0xC000_0002;
    pub const STATUS_ACCESS_DENIED: u32 = 0xC000_0022;

    const FACILITY_NTWIN32: u32 = 0x7;
    const SEVERITY_BITS: u32 = 0xC000_0000;

    /// Folds an NT status into the completion taxonomy.
    pub fn to_state(status: u32) -> State {
        match status {
            STATUS_SUCCESS => State::Ok,
            STATUS_PENDING => State::Pending,
            STATUS_END_OF_FILE => State::Eof,
            STATUS_TIMEOUT | STATUS_LINK_TIMEOUT | STATUS_IO_TIMEOUT => State::Timeout,
            STATUS_CONNECTION_RESET
            | STATUS_REMOTE_DISCONNECT
            | STATUS_LINK_FAILED
            | STATUS_CONNECTION_DISCONNECTED
            | STATUS_PORT_UNREACHABLE
            | STATUS_HOPLIMIT_EXCEEDED
            | STATUS_INVALID_DEVICE_STATE => State::Reset,
            STATUS_CANCELLED | STATUS_REQUEST_ABORTED => State::Killed,
            STATUS_BUFFER_OVERFLOW | STATUS_INVALID_BUFFER_SIZE => State::MsgTooBig,
            STATUS_NO_MEMORY
            | STATUS_PAGEFILE_QUOTA
            | STATUS_WORKING_SET_QUOTA
            | STATUS_COMMITMENT_LIMIT
            | STATUS_CONFLICTING_ADDRESSES
            | STATUS_QUOTA_EXCEEDED
            | STATUS_REMOTE_RESOURCES
            | STATUS_INSUFFICIENT_RESOURCES
            | STATUS_TOO_MANY_PAGING_FILES
            | STATUS_TOO_MANY_ADDRESSES => State::NoBuffers,
            STATUS_CONNECTION_REFUSED | STATUS_REMOTE_NOT_LISTENING => State::Refused,
            STATUS_BAD_NETWORK_PATH
            | STATUS_NETWORK_UNREACHABLE
            | STATUS_PROTOCOL_UNREACHABLE
            | STATUS_HOST_UNREACHABLE
            | STATUS_INVALID_NETWORK_RESPONSE
            | STATUS_NETWORK_BUSY
            | STATUS_UNEXPECTED_NETWORK_ERROR => State::Unreachable,
            STATUS_GRACEFUL_DISCONNECT
            | STATUS_LOCAL_DISCONNECT
            | STATUS_CONNECTION_ABORTED
            | STATUS_PIPE_DISCONNECTED => State::Closed,
            STATUS_DEVICE_NOT_READY | STATUS_REQUEST_NOT_ACCEPTED => State::Pending,
            STATUS_NOT_SUPPORTED => State::NotSupported,
            STATUS_NOT_IMPLEMENTED => State::NotImplemented,
            STATUS_INVALID_HANDLE
            | STATUS_OBJECT_TYPE_MISMATCH
            | STATUS_BUFFER_TOO_SMALL
            | STATUS_ACCESS_VIOLATION
            | STATUS_INVALID_ADDRESS
            | STATUS_INVALID_ADDRESS_COMPONENT => State::InvalidArgument,
            STATUS_SHARING_VIOLATION
            | STATUS_ADDRESS_ALREADY_EXISTS
            | STATUS_INVALID_CONNECTION
            | STATUS_NO_SUCH_DEVICE
            | STATUS_NO_SUCH_FILE
            | STATUS_OBJECT_PATH_NOT_FOUND
            | STATUS_OBJECT_NAME_NOT_FOUND
            | STATUS_ACCESS_DENIED => State::Failed,
            _ => {
                if (status >> 16) & 0x1fff == FACILITY_NTWIN32 && status & SEVERITY_BITS != 0 {
                    State::Win32((status & 0xffff) as u16)
                } else {
                    State::InvalidArgument
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::State;

    #[test]
    fn scope_zeroed_unless_link_local() {
        let global: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let ep = Endpoint::v6(global, 3, 80);
        match ep {
            Endpoint::V6(v6) => assert_eq!(v6.scope_id(), 0),
            _ => unreachable!(),
        }

        let ll: Ipv6Addr = "fe80::1".parse().unwrap();
        let ep = Endpoint::v6(ll, 3, 80);
        assert!(ep.is_link_local());
        match ep {
            Endpoint::V6(v6) => assert_eq!(v6.scope_id(), 3),
            _ => unreachable!(),
        }

        let llm: Ipv6Addr = "ff02::1".parse().unwrap();
        assert!(Endpoint::v6(llm, 1, 0).is_link_local());
    }

    #[cfg(unix)]
    #[test]
    fn sockaddr_round_trip_v4() {
        let ep = Endpoint::v4(Ipv4Addr::new(192, 168, 3, 7), 8080);
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = ep.to_sockaddr(&mut storage);
        assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in>());
        let (back, len2) = Endpoint::from_sockaddr(&storage);
        assert_eq!(back, ep);
        assert_eq!(len, len2);
    }

    #[cfg(unix)]
    #[test]
    fn sockaddr_round_trip_v6() {
        let ll: Ipv6Addr = "fe80::dead:beef".parse().unwrap();
        let ep = Endpoint::v6(ll, 2, 443);
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = ep.to_sockaddr(&mut storage);
        assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in6>());
        let (back, _) = Endpoint::from_sockaddr(&storage);
        assert_eq!(back, ep);
    }

    #[cfg(unix)]
    #[test]
    fn sockaddr_unknown_family_is_rejected() {
        let storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let (ep, len) = Endpoint::from_sockaddr(&storage);
        assert!(ep.is_unspec());
        assert_eq!(len, 0);
    }

    #[test]
    fn ntstatus_listed_codes() {
        use super::ntstatus::*;
        assert_eq!(to_state(STATUS_SUCCESS), State::Ok);
        assert_eq!(to_state(STATUS_PENDING), State::Pending);
        assert_eq!(to_state(STATUS_TIMEOUT), State::Timeout);
        assert_eq!(to_state(STATUS_IO_TIMEOUT), State::Timeout);
        assert_eq!(to_state(STATUS_CONNECTION_RESET), State::Reset);
        assert_eq!(to_state(STATUS_PORT_UNREACHABLE), State::Reset);
        assert_eq!(to_state(STATUS_CANCELLED), State::Killed);
        assert_eq!(to_state(STATUS_BUFFER_OVERFLOW), State::MsgTooBig);
        assert_eq!(to_state(STATUS_NO_MEMORY), State::NoBuffers);
        assert_eq!(to_state(STATUS_END_OF_FILE), State::Eof);
        assert_eq!(to_state(STATUS_CONNECTION_REFUSED), State::Refused);
        assert_eq!(to_state(STATUS_NETWORK_UNREACHABLE), State::Unreachable);
        assert_eq!(to_state(STATUS_GRACEFUL_DISCONNECT), State::Closed);
    }

    #[test]
    fn ntstatus_unlisted_codes() {
        use super::ntstatus::to_state;
        // Facility NT-Win32 with error severity: low 16 bits surface.
        assert_eq!(to_state(0xC007_0042), State::Win32(0x42));
        // Anything else is an invalid argument.
        assert_eq!(to_state(0x1234_5678), State::InvalidArgument);
    }
}
