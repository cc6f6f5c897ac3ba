//! Winsock extension entry points, resolved once per process.
//!
//! AcceptEx, ConnectEx, DisconnectEx, TransmitFile, and
//! GetAcceptExSockaddrs live behind `WSAIoctl` GUID lookups rather than the
//! import table; the essential ones must resolve or the engine refuses to
//! start.

use std::io;
use std::mem;
use std::sync::OnceLock;

use windows_sys::core::GUID;
use windows_sys::Win32::Networking::WinSock::{
    closesocket, WSAIoctl, WSASocketW, AF_INET, INVALID_SOCKET, IPPROTO_TCP,
    SIO_GET_EXTENSION_FUNCTION_POINTER, SOCKET, SOCK_STREAM, WSAID_ACCEPTEX, WSAID_CONNECTEX,
    WSAID_DISCONNECTEX, WSAID_GETACCEPTEXSOCKADDRS, WSAID_TRANSMITFILE, WSA_FLAG_OVERLAPPED,
};

#[derive(Copy, Clone)]
pub(crate) struct Extensions {
    pub accept_ex: usize,
    pub connect_ex: usize,
    pub disconnect_ex: usize,
    pub transmit_file: usize,
    pub get_acceptex_sockaddrs: usize,
}

static EXTENSIONS: OnceLock<io::Result<Extensions>> = OnceLock::new();

/// Resolves the extension table, caching the result process-wide.
pub(crate) fn load() -> io::Result<Extensions> {
    match EXTENSIONS.get_or_init(probe) {
        Ok(ext) => Ok(*ext),
        Err(err) => Err(io::Error::new(err.kind(), err.to_string())),
    }
}

fn probe() -> io::Result<Extensions> {
    crate::env::init();
    let probe_sock = unsafe {
        WSASocketW(
            AF_INET as i32,
            SOCK_STREAM as i32,
            IPPROTO_TCP,
            std::ptr::null(),
            0,
            WSA_FLAG_OVERLAPPED,
        )
    };
    if probe_sock == INVALID_SOCKET {
        return Err(io::Error::last_os_error());
    }

    let result = (|| {
        let accept_ex = lookup(probe_sock, &WSAID_ACCEPTEX)?;
        let connect_ex = lookup(probe_sock, &WSAID_CONNECTEX)?;
        let get_acceptex_sockaddrs = lookup(probe_sock, &WSAID_GETACCEPTEXSOCKADDRS)?;
        // The recycling extensions are optional; keep-alive close just
        // degrades to a plain close without them.
        let disconnect_ex = lookup(probe_sock, &WSAID_DISCONNECTEX).unwrap_or(0);
        let transmit_file = lookup(probe_sock, &WSAID_TRANSMITFILE).unwrap_or(0);
        Ok(Extensions {
            accept_ex,
            connect_ex,
            disconnect_ex,
            transmit_file,
            get_acceptex_sockaddrs,
        })
    })();

    unsafe { closesocket(probe_sock) };
    result
}

fn lookup(sock: SOCKET, guid: &GUID) -> io::Result<usize> {
    let mut func: usize = 0;
    let mut bytes: u32 = 0;
    let rc = unsafe {
        WSAIoctl(
            sock,
            SIO_GET_EXTENSION_FUNCTION_POINTER,
            guid as *const GUID as *const _,
            mem::size_of::<GUID>() as u32,
            &mut func as *mut usize as *mut _,
            mem::size_of::<usize>() as u32,
            &mut bytes,
            std::ptr::null_mut(),
            None,
        )
    };
    if rc != 0 || func == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(func)
}
