pub(crate) mod fileio;
pub(crate) mod selector;
pub(crate) mod sockio;
pub(crate) mod waker;

pub(crate) use selector::{Selector, SelectorEvents};
pub(crate) use waker::Waker;
