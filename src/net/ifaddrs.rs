//! Network interface inventory.
//!
//! Enumerates interfaces with their flags, hardware address, and one IPv4
//! and IPv6 address each. Results are cached per [`IfAddrs`] instance and
//! refreshed on demand. Linux walks a netlink route dump, the BSDs and
//! macOS use `getifaddrs(3)`, Windows uses the IP Helper adapter table.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

const FLAG_UP: u8 = 0b001;
const FLAG_LOOPBACK: u8 = 0b010;
const FLAG_MULTICAST: u8 = 0b100;

/// One enumerated interface.
#[derive(Clone, Debug, Default)]
pub struct Interface {
    pub name: String,
    flags: u8,
    pub hwaddr: Option<[u8; 6]>,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

impl Interface {
    pub fn is_up(&self) -> bool {
        self.flags & FLAG_UP != 0
    }

    pub fn is_loopback(&self) -> bool {
        self.flags & FLAG_LOOPBACK != 0
    }

    pub fn is_multicast(&self) -> bool {
        self.flags & FLAG_MULTICAST != 0
    }

    /// The hardware address as `aa:bb:cc:dd:ee:ff`, if the interface has
    /// one.
    pub fn hwaddr_string(&self) -> Option<String> {
        self.hwaddr.map(|mac| {
            format!(
                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
            )
        })
    }

    fn set_flags(&mut self, up: bool, loopback: bool, multicast: bool) {
        self.flags = 0;
        if up {
            self.flags |= FLAG_UP;
        }
        if loopback {
            self.flags |= FLAG_LOOPBACK;
        }
        if multicast {
            self.flags |= FLAG_MULTICAST;
        }
    }
}

/// A cached interface inventory.
pub struct IfAddrs {
    cache: Option<Vec<Interface>>,
}

impl IfAddrs {
    /// Creates an empty inventory; nothing is enumerated until the first
    /// query.
    pub fn new() -> IfAddrs {
        IfAddrs { cache: None }
    }

    /// The interface list. Pass `reload` to drop the cache and enumerate
    /// again.
    pub fn interfaces(&mut self, reload: bool) -> io::Result<&[Interface]> {
        if reload {
            self.cache = None;
        }
        if self.cache.is_none() {
            self.cache = Some(imp::enumerate()?);
        }
        match &self.cache {
            Some(list) => Ok(list),
            None => unreachable!(),
        }
    }

    /// Finds an interface by name.
    pub fn interface(&mut self, name: &str, reload: bool) -> io::Result<Option<Interface>> {
        let list = self.interfaces(reload)?;
        Ok(list.iter().find(|i| i.name == name).cloned())
    }

    /// The hardware address of a named interface, or of the first
    /// non-loopback interface carrying one when `name` is empty.
    pub fn hwaddr(&mut self, name: &str, reload: bool) -> io::Result<Option<[u8; 6]>> {
        let list = self.interfaces(reload)?;
        Ok(list
            .iter()
            .filter(|i| name.is_empty() || i.name == name)
            .filter(|i| !i.is_loopback() || !name.is_empty())
            .find_map(|i| i.hwaddr))
    }
}

impl Default for IfAddrs {
    fn default() -> IfAddrs {
        IfAddrs::new()
    }
}

// Merges per-address records into the named interface slot.
fn slot<'a>(list: &'a mut Vec<Interface>, name: &str) -> &'a mut Interface {
    if let Some(at) = list.iter().position(|i| i.name == name) {
        return &mut list[at];
    }
    list.push(Interface {
        name: name.to_string(),
        ..Interface::default()
    });
    let at = list.len() - 1;
    &mut list[at]
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod imp {
    //! Netlink route dump: one RTM_GETLINK pass for names, flags and
    //! hardware addresses, one RTM_GETADDR pass for addresses.

    use super::*;
    use std::mem;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    const IFLA_ADDRESS: u16 = 1;
    const IFLA_IFNAME: u16 = 3;
    const IFA_ADDRESS: u16 = 1;
    const IFA_LOCAL: u16 = 2;
    const IFA_LABEL: u16 = 3;
    const NLMSG_ERROR: u16 = 2;
    const NLMSG_DONE: u16 = 3;

    // Not exposed by this version of the `libc` crate; matches the kernel's
    // `struct rtgenmsg` (linux/rtnetlink.h) ABI.
    #[repr(C)]
    struct rtgenmsg {
        rtgen_family: u8,
    }

    #[repr(C)]
    struct Request {
        header: libc::nlmsghdr,
        body: rtgenmsg,
    }

    pub fn enumerate() -> io::Result<Vec<Interface>> {
        let sock = unsafe {
            OwnedFd::from_raw_fd(syscall!(socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            ))?)
        };

        let mut list = Vec::new();
        dump(&sock, libc::RTM_GETLINK, 1, &mut list)?;
        dump(&sock, libc::RTM_GETADDR, 2, &mut list)?;
        Ok(list)
    }

    fn dump(
        sock: &OwnedFd,
        kind: u16,
        seq: u32,
        list: &mut Vec<Interface>,
    ) -> io::Result<()> {
        let mut request: Request = unsafe { mem::zeroed() };
        request.header.nlmsg_len = mem::size_of::<Request>() as u32;
        request.header.nlmsg_type = kind;
        request.header.nlmsg_flags = (libc::NLM_F_REQUEST | libc::NLM_F_DUMP) as u16;
        request.header.nlmsg_seq = seq;
        request.body.rtgen_family = libc::AF_UNSPEC as u8;

        let sent = syscall!(send(
            sock.as_raw_fd(),
            &request as *const _ as *const libc::c_void,
            mem::size_of::<Request>(),
            0,
        ))?;
        if sent as usize != mem::size_of::<Request>() {
            return Err(io::Error::new(io::ErrorKind::Other, "short netlink send"));
        }

        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let received = syscall!(recv(
                sock.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            ))? as usize;
            if received == 0 {
                return Ok(());
            }

            let mut at = 0;
            while at + mem::size_of::<libc::nlmsghdr>() <= received {
                let header = unsafe { &*(buf.as_ptr().add(at) as *const libc::nlmsghdr) };
                let len = header.nlmsg_len as usize;
                if len < mem::size_of::<libc::nlmsghdr>() || at + len > received {
                    break;
                }
                match header.nlmsg_type {
                    NLMSG_DONE => return Ok(()),
                    NLMSG_ERROR => {
                        return Err(io::Error::new(io::ErrorKind::Other, "netlink error"))
                    }
                    libc::RTM_NEWLINK => {
                        parse_link(&buf[at..at + len], list);
                    }
                    libc::RTM_NEWADDR => {
                        parse_addr(&buf[at..at + len], list);
                    }
                    _ => {}
                }
                at += align4(len);
            }
        }
    }

    fn parse_link(msg: &[u8], list: &mut Vec<Interface>) {
        let head = mem::size_of::<libc::nlmsghdr>();
        if msg.len() < head + mem::size_of::<libc::ifinfomsg>() {
            return;
        }
        let info = unsafe { &*(msg.as_ptr().add(head) as *const libc::ifinfomsg) };
        let flags = info.ifi_flags;

        let mut name = None;
        let mut hwaddr = None;
        for (kind, payload) in attrs(&msg[head + align4(mem::size_of::<libc::ifinfomsg>())..]) {
            match kind {
                IFLA_IFNAME => {
                    name = std::str::from_utf8(cstr_bytes(payload))
                        .ok()
                        .map(str::to_string);
                }
                IFLA_ADDRESS if payload.len() == 6 => {
                    let mut mac = [0u8; 6];
                    mac.copy_from_slice(payload);
                    if mac != [0; 6] {
                        hwaddr = Some(mac);
                    }
                }
                _ => {}
            }
        }

        if let Some(name) = name {
            let entry = slot(list, &name);
            entry.set_flags(
                flags & libc::IFF_UP as u32 != 0,
                flags & libc::IFF_LOOPBACK as u32 != 0,
                flags & libc::IFF_MULTICAST as u32 != 0,
            );
            if hwaddr.is_some() {
                entry.hwaddr = hwaddr;
            }
        }
    }

    fn parse_addr(msg: &[u8], list: &mut Vec<Interface>) {
        let head = mem::size_of::<libc::nlmsghdr>();
        if msg.len() < head + mem::size_of::<libc::ifaddrmsg>() {
            return;
        }
        let info = unsafe { &*(msg.as_ptr().add(head) as *const libc::ifaddrmsg) };

        let mut label = None;
        let mut v4 = None;
        let mut v6 = None;
        for (kind, payload) in attrs(&msg[head + align4(mem::size_of::<libc::ifaddrmsg>())..]) {
            match kind {
                IFA_LABEL => {
                    label = std::str::from_utf8(cstr_bytes(payload))
                        .ok()
                        .map(str::to_string);
                }
                IFA_ADDRESS | IFA_LOCAL => match info.ifa_family as i32 {
                    libc::AF_INET if payload.len() == 4 => {
                        let mut octets = [0u8; 4];
                        octets.copy_from_slice(payload);
                        v4 = Some(Ipv4Addr::from(octets));
                    }
                    libc::AF_INET6 if payload.len() == 16 => {
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(payload);
                        v6 = Some(Ipv6Addr::from(octets));
                    }
                    _ => {}
                },
                _ => {}
            }
        }

        // RTM_GETADDR reports the interface by index; the label attribute
        // names it for IPv4, and the index is resolved for the rest.
        let name = label.or_else(|| index_name(info.ifa_index));
        if let Some(name) = name {
            let entry = slot(list, &name);
            if v4.is_some() {
                entry.ipv4 = v4;
            }
            if v6.is_some() {
                entry.ipv6 = v6;
            }
        }
    }

    fn index_name(index: u32) -> Option<String> {
        let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
        let rc = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
        if rc.is_null() {
            return None;
        }
        let name = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
        Some(name.to_string_lossy().into_owned())
    }

    // Iterates netlink attributes in a message tail.
    fn attrs(mut tail: &[u8]) -> Vec<(u16, &[u8])> {
        let mut out = Vec::new();
        while tail.len() >= mem::size_of::<libc::rtattr>() {
            let attr = unsafe { &*(tail.as_ptr() as *const libc::rtattr) };
            let len = attr.rta_len as usize;
            if len < mem::size_of::<libc::rtattr>() || len > tail.len() {
                break;
            }
            out.push((attr.rta_type, &tail[mem::size_of::<libc::rtattr>()..len]));
            let step = align4(len);
            if step >= tail.len() {
                break;
            }
            tail = &tail[step..];
        }
        out
    }

    fn align4(len: usize) -> usize {
        (len + 3) & !3
    }

    // Trims a NUL-terminated attribute payload to the name bytes.
    fn cstr_bytes(payload: &[u8]) -> &[u8] {
        match payload.iter().position(|b| *b == 0) {
            Some(at) => &payload[..at],
            None => payload,
        }
    }
}

#[cfg(all(
    unix,
    not(any(target_os = "linux", target_os = "android"))
))]
mod imp {
    //! `getifaddrs(3)` walk; the AF_LINK records carry the hardware
    //! addresses on the BSDs and macOS.

    use super::*;
    use std::ffi::CStr;
    use std::ptr;

    pub fn enumerate() -> io::Result<Vec<Interface>> {
        let mut base: *mut libc::ifaddrs = ptr::null_mut();
        syscall!(getifaddrs(&mut base))?;

        let mut list = Vec::new();
        let mut curr = base;
        while !curr.is_null() {
            let ifa = unsafe { &*curr };
            curr = ifa.ifa_next;
            if ifa.ifa_name.is_null() {
                continue;
            }
            let name = unsafe { CStr::from_ptr(ifa.ifa_name) }
                .to_string_lossy()
                .into_owned();
            let entry = slot(&mut list, &name);
            entry.set_flags(
                ifa.ifa_flags & libc::IFF_UP as u32 != 0,
                ifa.ifa_flags & libc::IFF_LOOPBACK as u32 != 0,
                ifa.ifa_flags & libc::IFF_MULTICAST as u32 != 0,
            );
            if ifa.ifa_addr.is_null() {
                continue;
            }
            match unsafe { (*ifa.ifa_addr).sa_family } as i32 {
                libc::AF_INET => {
                    let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
                    entry.ipv4 = Some(Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()));
                }
                libc::AF_INET6 => {
                    let sin6 = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in6) };
                    entry.ipv6 = Some(Ipv6Addr::from(sin6.sin6_addr.s6_addr));
                }
                libc::AF_LINK => {
                    let dl = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_dl) };
                    if dl.sdl_alen as usize == 6 {
                        let base = dl.sdl_data.as_ptr() as *const u8;
                        let mut mac = [0u8; 6];
                        unsafe {
                            ptr::copy_nonoverlapping(
                                base.add(dl.sdl_nlen as usize),
                                mac.as_mut_ptr(),
                                6,
                            );
                        }
                        if mac != [0; 6] {
                            entry.hwaddr = Some(mac);
                        }
                    }
                }
                _ => {}
            }
        }
        unsafe { libc::freeifaddrs(base) };
        Ok(list)
    }
}

#[cfg(windows)]
mod imp {
    //! IP Helper adapter enumeration.

    use super::*;
    use std::mem;
    use windows_sys::Win32::Foundation::ERROR_BUFFER_OVERFLOW;
    use windows_sys::Win32::NetworkManagement::IpHelper::{
        GetAdaptersAddresses, GAA_FLAG_SKIP_ANYCAST, GAA_FLAG_SKIP_DNS_SERVER,
        GAA_FLAG_SKIP_MULTICAST, IP_ADAPTER_ADDRESSES_LH,
    };
    use windows_sys::Win32::Networking::WinSock::{AF_UNSPEC, SOCKADDR_STORAGE};

    pub fn enumerate() -> io::Result<Vec<Interface>> {
        crate::env::init();
        let flags = GAA_FLAG_SKIP_ANYCAST | GAA_FLAG_SKIP_MULTICAST | GAA_FLAG_SKIP_DNS_SERVER;
        let mut size = 16 * 1024u32;
        let mut buf: Vec<u8>;
        loop {
            buf = vec![0u8; size as usize];
            let rc = unsafe {
                GetAdaptersAddresses(
                    AF_UNSPEC as u32,
                    flags,
                    std::ptr::null(),
                    buf.as_mut_ptr() as *mut IP_ADAPTER_ADDRESSES_LH,
                    &mut size,
                )
            };
            if rc == ERROR_BUFFER_OVERFLOW {
                continue;
            }
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc as i32));
            }
            break;
        }

        let mut list = Vec::new();
        let mut curr = buf.as_ptr() as *const IP_ADAPTER_ADDRESSES_LH;
        while !curr.is_null() {
            let adapter = unsafe { &*curr };
            curr = adapter.Next;

            let name = wide_string(adapter.FriendlyName);
            let entry = slot(&mut list, &name);
            entry.set_flags(adapter.OperStatus == 1, adapter.IfType == 24, true);
            if adapter.PhysicalAddressLength == 6 {
                let mut mac = [0u8; 6];
                mac.copy_from_slice(&adapter.PhysicalAddress[..6]);
                entry.hwaddr = Some(mac);
            }

            let mut unicast = adapter.FirstUnicastAddress;
            while !unicast.is_null() {
                let record = unsafe { &*unicast };
                unicast = record.Next;
                let sockaddr = record.Address.lpSockaddr;
                if sockaddr.is_null() {
                    continue;
                }
                let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
                let len =
                    (record.Address.iSockaddrLength as usize).min(mem::size_of::<SOCKADDR_STORAGE>());
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        sockaddr as *const u8,
                        &mut storage as *mut _ as *mut u8,
                        len,
                    );
                }
                match crate::Endpoint::from_sockaddr(&storage).0 {
                    crate::Endpoint::V4(v4) => entry.ipv4 = Some(*v4.ip()),
                    crate::Endpoint::V6(v6) => entry.ipv6 = Some(*v6.ip()),
                    crate::Endpoint::Unspec => {}
                }
            }
        }
        Ok(list)
    }

    fn wide_string(ptr: *const u16) -> String {
        if ptr.is_null() {
            return String::new();
        }
        let mut len = 0;
        while unsafe { *ptr.add(len) } != 0 {
            len += 1;
        }
        let slice = unsafe { std::slice::from_raw_parts(ptr, len) };
        String::from_utf16_lossy(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerates_and_caches() {
        let mut inventory = IfAddrs::new();
        let first = match inventory.interfaces(false) {
            Ok(list) => list.len(),
            // Containers without netlink/getifaddrs access still pass.
            Err(_) => return,
        };
        assert_eq!(inventory.interfaces(false).unwrap().len(), first);
        assert_eq!(inventory.interfaces(true).unwrap().len(), first);
    }

    #[test]
    fn loopback_has_address() {
        let mut inventory = IfAddrs::new();
        let list = match inventory.interfaces(false) {
            Ok(list) => list,
            Err(_) => return,
        };
        if let Some(lo) = list.iter().find(|i| i.is_loopback()) {
            assert!(lo.ipv4.is_some() || lo.ipv6.is_some());
        }
    }

    #[test]
    fn hwaddr_formats() {
        let mut ifa = Interface::default();
        ifa.hwaddr = Some([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        assert_eq!(ifa.hwaddr_string().unwrap(), "de:ad:be:ef:00:01");
    }
}
