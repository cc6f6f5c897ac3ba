/// Associates user data with an attached event source.
///
/// `Token` is a wrapper around `usize`, completely opaque to the engine:
/// whatever value is supplied when a source is attached to a [`Poller`] comes
/// back unchanged in the matching [`Event`]. The common pattern is to use the
/// token as an index into a slab of connection state.
///
/// [`Poller`]: crate::Poller
/// [`Event`]: crate::poller::Event
///
/// # Examples
///
/// ```
/// use cio::Token;
///
/// let token = Token(7);
/// assert_eq!(usize::from(token), 7);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}
