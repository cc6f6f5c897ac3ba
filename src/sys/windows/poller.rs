//! Event front-end on Windows.
//!
//! The readiness translation rides `WSAPoll`, which matches the batched
//! contract of the portable poller: one call fills one batch of event
//! bitmasks. Completion-port integration stays with the proactor; this
//! front-end exists for callers that want plain events.

use std::collections::HashMap;
use std::io;
use std::os::windows::io::AsRawSocket;
use std::time::Duration;

use windows_sys::Win32::Networking::WinSock::{
    WSAPoll, POLLERR, POLLHUP, POLLRDNORM, POLLWRNORM, SOCKET, SOCKET_ERROR, WSAPOLLFD,
};

use crate::poller::{Event, Events, Interest};
use crate::Token;

pub struct Poller {
    sources: HashMap<usize, (SOCKET, Interest)>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        crate::env::init();
        Ok(Poller {
            sources: HashMap::new(),
        })
    }

    pub fn attach(
        &mut self,
        source: &impl AsRawSocket,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.sources
            .insert(token.0, (source.as_raw_socket() as SOCKET, interest));
        Ok(())
    }

    pub fn modify(
        &mut self,
        source: &impl AsRawSocket,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.attach(source, token, interest)
    }

    pub fn detach(&mut self, _source: &impl AsRawSocket, token: Token) -> io::Result<()> {
        self.sources.remove(&token.0);
        Ok(())
    }

    pub fn wait(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        events.reset();
        if self.sources.is_empty() {
            if let Some(timeout) = timeout {
                std::thread::sleep(timeout);
            }
            return Ok(0);
        }

        let tokens: Vec<usize> = self.sources.keys().copied().collect();
        let mut fds: Vec<WSAPOLLFD> = tokens
            .iter()
            .map(|token| {
                let (sock, interest) = self.sources[token];
                let mut want = 0i16;
                if interest.is_readable() {
                    want |= POLLRDNORM;
                }
                if interest.is_writable() {
                    want |= POLLWRNORM;
                }
                WSAPOLLFD {
                    fd: sock,
                    events: want,
                    revents: 0,
                }
            })
            .collect();

        let timeout_ms = timeout
            .map(|to| to.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);
        let rc = unsafe { WSAPoll(fds.as_mut_ptr(), fds.len() as u32, timeout_ms) };
        if rc == SOCKET_ERROR {
            return Err(io::Error::last_os_error());
        }

        for (token, fd) in tokens.iter().zip(fds.iter()) {
            if fd.revents == 0 {
                continue;
            }
            let (_, interest) = self.sources[token];
            let readable = fd.revents & (POLLRDNORM | POLLHUP) != 0;
            let writable = fd.revents & (POLLWRNORM | POLLERR) != 0;
            if let Some(event) = Event::translate(Token(*token), interest, readable, writable) {
                events.push(event);
            }
        }
        Ok(events.len())
    }
}
