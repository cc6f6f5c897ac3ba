//! Event front-end tests.

mod util;

use std::io::Write;
use std::time::Duration;

use cio::{Events, Interest, Poller, Token};
use util::init;

const PEER: Token = Token(1);
const LISTENER: Token = Token(2);

#[test]
fn readable_event_after_peer_write() {
    init();
    let mut poller = Poller::new().expect("poller");
    let mut events = Events::with_capacity(8);

    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let mut sender = std::net::TcpStream::connect(addr).expect("connect");
    let (receiver, _) = listener.accept().expect("accept");
    receiver.set_nonblocking(true).expect("nonblocking");

    poller
        .attach(&receiver, PEER, Interest::READABLE)
        .expect("attach");

    // Nothing readable yet.
    poller
        .wait(&mut events, Some(Duration::from_millis(50)))
        .expect("empty wait");
    assert!(events.is_empty());

    sender.write_all(b"wake").expect("peer write");
    poller
        .wait(&mut events, Some(Duration::from_secs(5)))
        .expect("wait");
    let event = events.iter().next().expect("one event");
    assert_eq!(event.token(), PEER);
    assert!(event.is_readable());
    assert!(!event.is_writable());

    poller.detach(&receiver, PEER).expect("detach");
}

#[test]
fn accept_interest_translates_to_accept_events() {
    init();
    let mut poller = Poller::new().expect("poller");
    let mut events = Events::with_capacity(8);

    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.set_nonblocking(true).expect("nonblocking");
    let addr = listener.local_addr().expect("addr");

    poller
        .attach(&listener, LISTENER, Interest::ACCEPT)
        .expect("attach");

    let _client = std::net::TcpStream::connect(addr).expect("connect");
    poller
        .wait(&mut events, Some(Duration::from_secs(5)))
        .expect("wait");
    let event = events.iter().next().expect("one event");
    assert_eq!(event.token(), LISTENER);
    assert!(event.is_accept());

    let accepted = listener.accept();
    assert!(accepted.is_ok());
}

#[test]
fn conn_interest_reports_connect_completion() {
    init();
    let mut poller = Poller::new().expect("poller");
    let mut events = Events::with_capacity(8);

    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");

    let client = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None)
        .expect("client");
    client.set_nonblocking(true).expect("nonblocking");
    let pending = client.connect(&addr.into());
    // In-progress is the expected nonblocking result.
    if let Err(err) = pending {
        assert!(
            err.kind() == std::io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc_einprogress()),
            "unexpected connect error: {}",
            err
        );
    }

    poller
        .attach(&client, PEER, Interest::CONN)
        .expect("attach");
    poller
        .wait(&mut events, Some(Duration::from_secs(5)))
        .expect("wait");
    let event = events.iter().next().expect("one event");
    assert_eq!(event.token(), PEER);
    assert!(event.is_conn());
}

#[cfg(unix)]
fn libc_einprogress() -> i32 {
    libc::EINPROGRESS
}

#[cfg(windows)]
fn libc_einprogress() -> i32 {
    10035 // WSAEWOULDBLOCK
}
