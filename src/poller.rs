//! Event-driven front-end.
//!
//! `Poller` is the alternative to callback-per-operation: sources are
//! attached with an [`Interest`] and a [`Token`], and each call to
//! [`Poller::wait`] fills an [`Events`] batch whose entries carry readiness
//! bitmasks (read, write, accept, connect). Use it when integrating the
//! engine into an existing event loop instead of handing it callbacks.

use std::fmt;
use std::io;
use std::num::NonZeroU8;
use std::time::Duration;

use crate::Token;

const READABLE: u8 = 0b0001;
const WRITABLE: u8 = 0b0010;
const ACCEPT: u8 = 0b0100;
const CONN: u8 = 0b1000;

/// Interest set used when attaching a source.
///
/// The size of `Option<Interest>` is identical to `Interest` itself.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Interest(NonZeroU8);

impl Interest {
    /// Interest in plain readability.
    pub const READABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(READABLE) });
    /// Interest in plain writability.
    pub const WRITABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(WRITABLE) });
    /// Interest in incoming connections on a listener.
    pub const ACCEPT: Interest = Interest(unsafe { NonZeroU8::new_unchecked(ACCEPT) });
    /// Interest in the outcome of a pending connect.
    pub const CONN: Interest = Interest(unsafe { NonZeroU8::new_unchecked(CONN) });

    /// Adds together two interest sets; the `BitOr` impl as a const fn.
    pub const fn add(self, other: Interest) -> Interest {
        Interest(unsafe { NonZeroU8::new_unchecked(self.0.get() | other.0.get()) })
    }

    pub const fn is_readable(self) -> bool {
        self.0.get() & (READABLE | ACCEPT) != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0.get() & (WRITABLE | CONN) != 0
    }

    pub const fn is_accept(self) -> bool {
        self.0.get() & ACCEPT != 0
    }

    pub const fn is_conn(self) -> bool {
        self.0.get() & CONN != 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        self.add(other)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        let mut put = |name: &str, fmt: &mut fmt::Formatter<'_>| -> fmt::Result {
            if one {
                write!(fmt, " | ")?;
            }
            one = true;
            write!(fmt, "{}", name)
        };
        if self.0.get() & READABLE != 0 {
            put("READABLE", fmt)?;
        }
        if self.0.get() & WRITABLE != 0 {
            put("WRITABLE", fmt)?;
        }
        if self.0.get() & ACCEPT != 0 {
            put("ACCEPT", fmt)?;
        }
        if self.0.get() & CONN != 0 {
            put("CONN", fmt)?;
        }
        debug_assert!(one, "printing empty interest");
        Ok(())
    }
}

/// One delivered event: a token and its readiness bitmask.
#[derive(Copy, Clone, Debug)]
pub struct Event {
    token: Token,
    flags: u8,
}

impl Event {
    /// The token supplied when the source was attached.
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.flags & READABLE != 0
    }

    pub fn is_writable(&self) -> bool {
        self.flags & WRITABLE != 0
    }

    /// A listener has at least one connection to accept.
    pub fn is_accept(&self) -> bool {
        self.flags & ACCEPT != 0
    }

    /// A pending connect finished; check the socket error to learn how.
    pub fn is_conn(&self) -> bool {
        self.flags & CONN != 0
    }
}

/// A reusable batch of events filled by [`Poller::wait`].
pub struct Events {
    inner: Vec<Event>,
}

impl Events {
    /// Creates a batch able to hold `capacity` events per wait.
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity.max(1)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.inner.iter()
    }

    fn clear(&mut self) {
        self.inner.clear();
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_list().entries(self.inner.iter()).finish()
    }
}

#[cfg(windows)]
impl Event {
    // Folds raw readiness into the interest-shaped bitmask.
    pub(crate) fn translate(
        token: Token,
        interest: Interest,
        readable: bool,
        writable: bool,
    ) -> Option<Event> {
        let mut flags = 0;
        if readable && interest.is_readable() {
            flags |= if interest.is_accept() { ACCEPT } else { READABLE };
        }
        if writable && interest.is_writable() {
            flags |= if interest.is_conn() { CONN } else { WRITABLE };
        }
        if flags == 0 {
            None
        } else {
            Some(Event { token, flags })
        }
    }
}

#[cfg(windows)]
impl Events {
    pub(crate) fn reset(&mut self) {
        self.inner.clear();
    }

    pub(crate) fn push(&mut self, event: Event) {
        if self.inner.len() < self.inner.capacity() {
            self.inner.push(event);
        }
    }
}

#[cfg(unix)]
pub use self::imp::Poller;

#[cfg(unix)]
mod imp {
    use super::*;
    use std::collections::HashMap;
    use std::os::fd::{AsRawFd, RawFd};

    use crate::sys::{Selector, SelectorEvents};

    /// Edge-triggered poller over the platform selector.
    ///
    /// Attached sources stay registered until detached; a delivered event
    /// does not disarm its source. Readiness is translated to the attached
    /// interest: a readable listener surfaces as `ACCEPT`, a writable
    /// connecting socket as `CONN`.
    pub struct Poller {
        selector: Selector,
        interests: HashMap<usize, Interest>,
        scratch: SelectorEvents,
    }

    impl Poller {
        pub fn new() -> io::Result<Poller> {
            Ok(Poller {
                selector: Selector::new(256)?,
                interests: HashMap::new(),
                scratch: SelectorEvents::new(),
            })
        }

        /// Attaches a source. One token per source; attaching a second
        /// source with the same token replaces the translation entry but
        /// not the registration, so don't.
        pub fn attach(
            &mut self,
            source: &impl AsRawFd,
            token: Token,
            interest: Interest,
        ) -> io::Result<()> {
            self.watch(source.as_raw_fd(), token, interest, false)
        }

        /// Changes the interest or token of an attached source.
        pub fn modify(
            &mut self,
            source: &impl AsRawFd,
            token: Token,
            interest: Interest,
        ) -> io::Result<()> {
            self.watch(source.as_raw_fd(), token, interest, true)
        }

        /// Detaches a source; its pending events are dropped on the next
        /// wait.
        pub fn detach(&mut self, source: &impl AsRawFd, token: Token) -> io::Result<()> {
            self.interests.remove(&token.0);
            self.selector.disarm(source.as_raw_fd())
        }

        /// Waits for the next batch of events, up to the batch capacity.
        pub fn wait(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
            events.clear();
            self.scratch.clear();
            self.selector.select(&mut self.scratch, timeout)?;
            for ready in self.scratch.iter() {
                let interest = match self.interests.get(&ready.token) {
                    Some(interest) => *interest,
                    None => continue,
                };
                let mut flags = 0;
                if ready.readable && interest.is_readable() {
                    flags |= if interest.is_accept() { ACCEPT } else { READABLE };
                }
                if (ready.writable || ready.error) && interest.is_writable() {
                    flags |= if interest.is_conn() { CONN } else { WRITABLE };
                }
                if flags != 0 && events.inner.len() < events.inner.capacity() {
                    events.inner.push(Event {
                        token: Token(ready.token),
                        flags,
                    });
                }
            }
            Ok(events.len())
        }

        fn watch(
            &mut self,
            fd: RawFd,
            token: Token,
            interest: Interest,
            added: bool,
        ) -> io::Result<()> {
            self.selector.watch(
                fd,
                token.0,
                interest.is_readable(),
                interest.is_writable(),
                added,
            )?;
            self.interests.insert(token.0, interest);
            Ok(())
        }
    }
}

#[cfg(windows)]
pub use crate::sys::windows::poller::Poller;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_bit_algebra() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!both.is_accept());
        assert!(Interest::ACCEPT.is_readable());
        assert!(Interest::CONN.is_writable());
        assert_eq!(
            std::mem::size_of::<Option<Interest>>(),
            std::mem::size_of::<Interest>()
        );
    }
}
