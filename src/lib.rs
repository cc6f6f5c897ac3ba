//! Completion-based portable asynchronous I/O.
//!
//! cio multiplexes socket, file, and timer operations on a proactor: the
//! caller posts whole operations with completion callbacks, a worker thread
//! runs the platform primitives, and results come back through a single
//! delivery path per operation. On Windows the worker drives an I/O
//! completion port; on POSIX an edge-triggered readiness selector with
//! nonblocking syscalls provides the same contract.
//!
//! Three layers build on each other:
//!
//! * [`Proactor`] — operation posting against [`Aico`] handles, two timer
//!   wheels for timeouts and scheduled tasks, priority queues, cancellation
//!   and graceful shutdown.
//! * [`AsyncStream`] — a buffered open/read/write/seek/sync surface over
//!   in-memory data, files, TCP/UDP sockets (with pluggable TLS), an
//!   external HTTP client, and filter composition.
//! * [`Filter`] — incremental push/pull byte transformers: HTTP chunked
//!   decoding, zip inflate/deflate, charset conversion, and forced
//!   buffering.
//!
//! # Examples
//!
//! Echo five bytes through a TCP stream:
//!
//! ```no_run
//! use cio::{AsyncStream, Proactor, State};
//!
//! # fn main() -> std::io::Result<()> {
//! let proactor = Proactor::new(1024)?;
//! let stream = AsyncStream::from_url(&proactor.handle(), "sock://127.0.0.1:9999/?tcp=")?;
//! stream.open_write(b"hello", Box::new(|stream, state, real, _size| {
//!     assert_eq!(state, State::Ok);
//!     stream.read(5, Box::new(|_, state, data| {
//!         if state == State::Ok {
//!             println!("echoed: {:?}", data);
//!         }
//!         false
//!     }));
//!     false
//! }));
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
mod macros;

mod aico;
mod endpoint;
pub mod env;
pub mod filter;
pub mod net;
mod poller;
mod proactor;
mod state;
pub mod stream;
mod sys;
mod timer;
mod token;
mod url;

pub use aico::{Aice, AiceValue, Aico, AicoFunc, Op, OpCode, RunWhen};
pub use endpoint::Endpoint;
pub use filter::Filter;
pub use poller::{Event, Events, Interest, Poller};
pub use proactor::{Proactor, ProactorHandle};
pub use state::State;
pub use stream::AsyncStream;
pub use timer::{Timer, TimerFunc, TimerTask, Wheel};
pub use token::Token;
pub use url::{Scheme, Url};
