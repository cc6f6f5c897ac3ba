//! Name and address lookup.
//!
//! `getaddrinfo` does the forward work and `getnameinfo` the reverse; on
//! unix a `gethostbyname` fallback covers libcs whose `getaddrinfo` is
//! unusable. All of these block the calling thread: the async resolver used
//! by the sock stream runs them off the worker.

use std::io;
use std::net::{IpAddr, Ipv4Addr};

use crate::Endpoint;

/// Looks up the first address of a host name. A literal IP address parses
/// without touching the resolver.
pub fn addr(host: &str) -> io::Result<Endpoint> {
    let mut found = addrs(host)?;
    if found.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address for {}", host),
        ));
    }
    // Prefer IPv4 the way the rest of the engine defaults to it.
    found.sort_by_key(|ep| matches!(ep, Endpoint::V6(..)));
    Ok(found.remove(0))
}

/// Looks up every address of a host name, port zero.
pub fn addrs(host: &str) -> io::Result<Vec<Endpoint>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![match ip {
            IpAddr::V4(v4) => Endpoint::v4(v4, 0),
            IpAddr::V6(v6) => Endpoint::v6(v6, 0, 0),
        }]);
    }
    imp::getaddrinfo(host)
}

/// Reverse lookup of an endpoint's host name.
pub fn name(endpoint: &Endpoint) -> io::Result<String> {
    imp::getnameinfo(endpoint)
}

#[cfg(unix)]
mod imp {
    use super::*;
    use std::ffi::{CStr, CString};
    use std::mem;
    use std::ptr;

    pub fn getaddrinfo(host: &str) -> io::Result<Vec<Endpoint>> {
        let host = CString::new(host)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul in host name"))?;
        let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
        hints.ai_family = libc::AF_UNSPEC;
        hints.ai_socktype = libc::SOCK_STREAM;

        let mut list: *mut libc::addrinfo = ptr::null_mut();
        let rc = unsafe { libc::getaddrinfo(host.as_ptr(), ptr::null(), &hints, &mut list) };
        if rc != 0 {
            // EAI_* is not an errno; try the old interface before giving up.
            return gethostbyname(&host);
        }

        let mut found = Vec::new();
        let mut curr = list;
        while !curr.is_null() {
            let info = unsafe { &*curr };
            if !info.ai_addr.is_null() {
                let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
                let len = (info.ai_addrlen as usize).min(mem::size_of::<libc::sockaddr_storage>());
                unsafe {
                    ptr::copy_nonoverlapping(
                        info.ai_addr as *const u8,
                        &mut storage as *mut _ as *mut u8,
                        len,
                    );
                }
                let (endpoint, size) = Endpoint::from_sockaddr(&storage);
                if size != 0 {
                    found.push(endpoint);
                }
            }
            curr = info.ai_next;
        }
        unsafe { libc::freeaddrinfo(list) };
        found.dedup();
        Ok(found)
    }

    fn gethostbyname(host: &CStr) -> io::Result<Vec<Endpoint>> {
        extern "C" {
            fn gethostbyname(name: *const libc::c_char) -> *mut libc::hostent;
        }
        let entry = unsafe { gethostbyname(host.as_ptr()) };
        if entry.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "host name lookup failed",
            ));
        }
        let entry = unsafe { &*entry };
        if entry.h_addrtype != libc::AF_INET || entry.h_addr_list.is_null() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        let mut list = entry.h_addr_list;
        unsafe {
            while !(*list).is_null() {
                let mut octets = [0u8; 4];
                ptr::copy_nonoverlapping((*list) as *const u8, octets.as_mut_ptr(), 4);
                found.push(Endpoint::v4(Ipv4Addr::from(octets), 0));
                list = list.add(1);
            }
        }
        Ok(found)
    }

    pub fn getnameinfo(endpoint: &Endpoint) -> io::Result<String> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = endpoint.to_sockaddr(&mut storage);
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "unspec endpoint"));
        }
        let mut host = [0 as libc::c_char; libc::NI_MAXHOST as usize];
        let rc = unsafe {
            libc::getnameinfo(
                &storage as *const _ as *const libc::sockaddr,
                len,
                host.as_mut_ptr(),
                host.len() as libc::socklen_t,
                ptr::null_mut(),
                0,
                libc::NI_NAMEREQD,
            )
        };
        if rc != 0 {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "reverse lookup failed",
            ));
        }
        let name = unsafe { CStr::from_ptr(host.as_ptr()) };
        Ok(name.to_string_lossy().into_owned())
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use std::ffi::CString;
    use std::mem;
    use std::ptr;
    use windows_sys::Win32::Networking::WinSock::{
        freeaddrinfo, getaddrinfo as sys_getaddrinfo, ADDRINFOA, AF_UNSPEC, SOCKADDR_STORAGE,
        SOCK_STREAM,
    };

    pub fn getaddrinfo(host: &str) -> io::Result<Vec<Endpoint>> {
        crate::env::init();
        let host = CString::new(host)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul in host name"))?;
        let mut hints: ADDRINFOA = unsafe { mem::zeroed() };
        hints.ai_family = AF_UNSPEC as i32;
        hints.ai_socktype = SOCK_STREAM as i32;

        let mut list: *mut ADDRINFOA = ptr::null_mut();
        let rc = unsafe {
            sys_getaddrinfo(host.as_ptr() as *const u8, ptr::null(), &hints, &mut list)
        };
        if rc != 0 {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "host name lookup failed",
            ));
        }

        let mut found = Vec::new();
        let mut curr = list;
        while !curr.is_null() {
            let info = unsafe { &*curr };
            if !info.ai_addr.is_null() {
                let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
                let len = (info.ai_addrlen as usize).min(mem::size_of::<SOCKADDR_STORAGE>());
                unsafe {
                    ptr::copy_nonoverlapping(
                        info.ai_addr as *const u8,
                        &mut storage as *mut _ as *mut u8,
                        len,
                    );
                }
                let (endpoint, size) = Endpoint::from_sockaddr(&storage);
                if size != 0 {
                    found.push(endpoint);
                }
            }
            curr = info.ai_next;
        }
        unsafe { freeaddrinfo(list) };
        found.dedup();
        Ok(found)
    }

    pub fn getnameinfo(_endpoint: &Endpoint) -> io::Result<String> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "reverse lookup not wired on this platform",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_addresses_skip_the_resolver() {
        let ep = addr("127.0.0.1").unwrap();
        assert_eq!(ep, Endpoint::v4(Ipv4Addr::LOCALHOST, 0));

        let all = addrs("::1").unwrap();
        assert_eq!(all.len(), 1);
        assert!(matches!(all[0], Endpoint::V6(..)));
    }

    #[test]
    fn localhost_resolves() {
        // Resolver configuration permitting; every supported platform maps
        // localhost in hosts(5).
        if let Ok(found) = addrs("localhost") {
            assert!(!found.is_empty());
        }
    }
}
