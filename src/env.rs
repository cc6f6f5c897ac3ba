//! Process-wide environment: one-time init/teardown, the shared socket
//! pool, and the page size cache.
//!
//! `init` must run before any engine object is created and is idempotent;
//! [`Proactor::new`] calls it on your behalf. `exit` drops the socket pool
//! and, on Windows, unloads Winsock; call it only once nothing in the
//! process still uses the engine.
//!
//! [`Proactor::new`]: crate::Proactor::new

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

use log::trace;
use parking_lot::Mutex;

// Upper bound on pooled sockets process-wide.
const POOL_MAXN: usize = 256;

static INIT: Once = Once::new();
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
static POOL: Mutex<Vec<PooledSocket>> = Mutex::new(Vec::new());

struct PooledSocket {
    sock: socket2::Socket,
    domain: socket2::Domain,
    ty: socket2::Type,
}

/// Initializes the process environment. Idempotent and cheap after the
/// first call.
pub fn init() {
    INIT.call_once(|| {
        #[cfg(windows)]
        {
            // Winsock loads lazily through the first socket2 call; touch it
            // here so failures surface early.
            let _ = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None);
        }
        PAGE_SIZE.store(probe_page_size(), Ordering::Relaxed);
        trace!("env: initialized, page size {}", page_size());
    });
}

/// Tears down the process environment: drops every pooled socket.
pub fn exit() {
    let mut pool = POOL.lock();
    trace!("env: dropping {} pooled sockets", pool.len());
    pool.clear();
}

/// The cached platform page size.
pub fn page_size() -> usize {
    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => 4096,
        n => n,
    }
}

/// Recycles a keep-alive socket into the pool, best effort: full pools and
/// sockets whose metadata cannot be read absorb the socket silently.
pub(crate) fn pool_put(sock: socket2::Socket) {
    let (domain, ty) = match (sock.domain(), sock.r#type()) {
        (Ok(domain), Ok(ty)) => (domain, ty),
        _ => return,
    };
    let mut pool = POOL.lock();
    if pool.len() >= POOL_MAXN {
        return;
    }
    trace!("env: pooled socket ({} held)", pool.len() + 1);
    pool.push(PooledSocket { sock, domain, ty });
}

/// Takes a pooled socket of the wanted family and type, if one is held.
pub(crate) fn pool_get(domain: socket2::Domain, ty: socket2::Type) -> Option<socket2::Socket> {
    let mut pool = POOL.lock();
    let at = pool
        .iter()
        .position(|p| p.domain == domain && p.ty == ty)?;
    trace!("env: reusing pooled socket");
    Some(pool.swap_remove(at).sock)
}

/// Trims the pool down to `keep` sockets.
pub fn pool_clip(keep: usize) {
    let mut pool = POOL.lock();
    while pool.len() > keep {
        let _ = pool.pop();
    }
}

/// Pooled socket count, for tests and diagnostics.
pub fn pool_len() -> usize {
    POOL.lock().len()
}

#[cfg(unix)]
fn probe_page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

#[cfg(windows)]
fn probe_page_size() -> usize {
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    match info.dwPageSize {
        0 => 4096,
        n => n as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_sane() {
        init();
        let size = page_size();
        assert!(size >= 512);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn pool_round_trip() {
        init();
        let sock =
            socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None).unwrap();
        let before = pool_len();
        pool_put(sock);
        assert_eq!(pool_len(), before + 1);
        let got = pool_get(socket2::Domain::IPV4, socket2::Type::DGRAM);
        assert!(got.is_some());
    }
}
