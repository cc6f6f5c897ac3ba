//! Proactor-level operation tests: postings, completions, timeouts, and
//! cancellation against real sockets.

mod util;

use std::net::SocketAddr;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use cio::{Aice, AiceValue, Op, OpCode, State};
use util::{expect_within, init_with_proactor};

fn listen_socket() -> (socket2::Socket, SocketAddr) {
    let sock = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None)
        .expect("listener socket");
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    sock.bind(&addr.into()).expect("bind listener");
    sock.listen(16).expect("listen");
    let local = sock
        .local_addr()
        .expect("local addr")
        .as_socket()
        .expect("inet addr");
    (sock, local)
}

fn udp_socket() -> (socket2::Socket, SocketAddr) {
    let sock = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None)
        .expect("udp socket");
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    sock.bind(&addr.into()).expect("bind udp");
    let local = sock
        .local_addr()
        .expect("local addr")
        .as_socket()
        .expect("inet addr");
    (sock, local)
}

#[test]
fn tcp_accept_echo() {
    let proactor = init_with_proactor();
    let handle = proactor.handle();

    let (listener, addr) = listen_socket();
    let listener = handle.attach_socket(listener).expect("attach listener");

    // Accept completions surface the client as a live aico.
    let (acpt_tx, acpt_rx) = mpsc::channel();
    let posted = handle.post(
        listener,
        Op::Acpt,
        Some(Duration::from_secs(8)),
        Box::new(move |aice: &mut Aice| {
            let client = match &aice.value {
                AiceValue::Acpt { sock, .. } => *sock,
                _ => None,
            };
            acpt_tx.send((aice.state, client)).unwrap();
            false
        }),
    );
    assert!(posted);

    // A plain blocking peer drives the other side.
    let peer = std::thread::spawn(move || {
        let mut stream = std::net::TcpStream::connect(addr).expect("connect");
        use std::io::{Read, Write};
        stream.write_all(b"hello").expect("peer write");
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).expect("peer read");
        buf
    });

    let (state, client) = expect_within(&acpt_rx, 10, "accept completion");
    assert_eq!(state, State::Ok);
    let client = client.expect("accepted aico");

    let (recv_tx, recv_rx) = mpsc::channel();
    handle.post(
        client,
        Op::Recv(vec![0u8; 16]),
        Some(Duration::from_secs(8)),
        Box::new(move |aice: &mut Aice| {
            let data = aice.data().map(<[u8]>::to_vec).unwrap_or_default();
            recv_tx.send((aice.state, data)).unwrap();
            false
        }),
    );
    let (state, data) = expect_within(&recv_rx, 10, "recv completion");
    assert_eq!(state, State::Ok);
    assert_eq!(data, b"hello");

    let (send_tx, send_rx) = mpsc::channel();
    handle.post(
        client,
        Op::Send(data),
        Some(Duration::from_secs(8)),
        Box::new(move |aice: &mut Aice| {
            send_tx.send((aice.state, aice.bytes())).unwrap();
            false
        }),
    );
    let (state, sent) = expect_within(&send_rx, 10, "send completion");
    assert_eq!(state, State::Ok);
    assert_eq!(sent, 5);

    assert_eq!(&peer.join().expect("peer thread"), b"hello");
    assert!(proactor.exit());
}

#[test]
fn udp_round_trip() {
    let proactor = init_with_proactor();
    let handle = proactor.handle();

    let (receiver, recv_addr) = udp_socket();
    let (sender, _) = udp_socket();
    let receiver = handle.attach_socket(receiver).expect("attach receiver");
    let sender = handle.attach_socket(sender).expect("attach sender");

    let (recv_tx, recv_rx) = mpsc::channel();
    handle.post(
        receiver,
        Op::Urecv(vec![0u8; 16]),
        Some(Duration::from_secs(8)),
        Box::new(move |aice: &mut Aice| {
            let data = aice.data().map(<[u8]>::to_vec).unwrap_or_default();
            recv_tx.send((aice.state, data, aice.peer())).unwrap();
            false
        }),
    );

    let (send_tx, send_rx) = mpsc::channel();
    handle.post(
        sender,
        Op::Usend(recv_addr.into(), b"ping".to_vec()),
        Some(Duration::from_secs(8)),
        Box::new(move |aice: &mut Aice| {
            send_tx.send((aice.state, aice.bytes())).unwrap();
            false
        }),
    );

    let (state, sent) = expect_within(&send_rx, 10, "usend completion");
    assert_eq!(state, State::Ok);
    assert_eq!(sent, 4);

    let (state, data, peer) = expect_within(&recv_rx, 10, "urecv completion");
    assert_eq!(state, State::Ok);
    assert_eq!(data, b"ping");
    let peer = peer.expect("datagram source");
    assert_eq!(peer.port() != 0, true);

    assert!(proactor.exit());
}

#[test]
fn runtask_fires_in_order() {
    let proactor = init_with_proactor();
    let handle = proactor.handle();
    let anchor = handle.attach_task().expect("task aico");

    let started = Instant::now();
    let (tx, rx) = mpsc::channel();
    let tx2 = tx.clone();
    handle.run_after(
        anchor,
        Duration::from_millis(50),
        Box::new(move |aice: &mut Aice| {
            tx2.send((1, aice.state)).unwrap();
            false
        }),
    );
    let anchor2 = handle.attach_task().expect("second task aico");
    handle.run_at(
        anchor2,
        Instant::now(),
        Box::new(move |aice: &mut Aice| {
            tx.send((2, aice.state)).unwrap();
            false
        }),
    );

    let (first, state) = expect_within(&rx, 5, "immediate task");
    assert_eq!(first, 2);
    assert_eq!(state, State::Ok);
    let (second, state) = expect_within(&rx, 5, "delayed task");
    assert_eq!(second, 1);
    assert_eq!(state, State::Ok);
    assert!(started.elapsed() < Duration::from_secs(4));

    assert!(proactor.exit());
}

#[test]
fn recv_times_out() {
    let proactor = init_with_proactor();
    let handle = proactor.handle();

    let (listener, addr) = listen_socket();
    let _listener = handle.attach_socket(listener).expect("attach listener");
    // Peer connects but never writes, so the recv must hit its timeout.
    let peer = std::net::TcpStream::connect(addr).expect("connect");

    let client = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None)
        .expect("client");
    client.connect(&addr.into()).ok();
    let client = handle.attach_socket(client).expect("attach client");

    let started = Instant::now();
    let (tx, rx) = mpsc::channel();
    handle.post(
        client,
        Op::Recv(vec![0u8; 8]),
        Some(Duration::from_secs(1)),
        Box::new(move |aice: &mut Aice| {
            tx.send(aice.state).unwrap();
            false
        }),
    );
    let state = expect_within(&rx, 10, "recv timeout");
    assert_eq!(state, State::Timeout);
    // The coarse wheel rounds to its one second tick, so allow half a tick
    // early and a few late.
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert!(started.elapsed() < Duration::from_secs(5));

    drop(peer);
    assert!(proactor.exit());
}

#[test]
fn cancel_delivers_killed() {
    let proactor = init_with_proactor();
    let handle = proactor.handle();

    let (listener, addr) = listen_socket();
    let _listener = handle.attach_socket(listener).expect("attach listener");
    let _peer = std::net::TcpStream::connect(addr).expect("connect");

    let client = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None)
        .expect("client");
    client.connect(&addr.into()).ok();
    let client = handle.attach_socket(client).expect("attach client");

    let (tx, rx) = mpsc::channel();
    handle.post(
        client,
        Op::Recv(vec![0u8; 8]),
        Some(Duration::from_secs(30)),
        Box::new(move |aice: &mut Aice| {
            tx.send(aice.state).unwrap();
            false
        }),
    );
    // Give the worker a moment to park the recv, then cancel from here.
    std::thread::sleep(Duration::from_millis(100));
    handle.cancel(client);

    let state = expect_within(&rx, 5, "killed completion");
    assert_eq!(state, State::Killed);
    assert!(proactor.exit());
}

#[test]
fn shutdown_kills_pending_operations() {
    let proactor = init_with_proactor();
    let handle = proactor.handle();

    let (listener, addr) = listen_socket();
    let _listener = handle.attach_socket(listener).expect("attach listener");
    let _peer = std::net::TcpStream::connect(addr).expect("connect");

    let client = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None)
        .expect("client");
    client.connect(&addr.into()).ok();
    let client = handle.attach_socket(client).expect("attach client");

    let (tx, rx) = mpsc::channel();
    handle.post(
        client,
        Op::Recv(vec![0u8; 8]),
        None,
        Box::new(move |aice: &mut Aice| {
            tx.send(aice.state).unwrap();
            false
        }),
    );
    std::thread::sleep(Duration::from_millis(100));

    proactor.kill();
    let state = expect_within(&rx, 5, "drained completion");
    assert_eq!(state, State::Killed);
    assert!(proactor.exit());
}

#[test]
fn close_recycles_keep_alive_sockets() {
    let proactor = init_with_proactor();
    let handle = proactor.handle();

    // IPv6 so no concurrently running test takes this socket back out of
    // the process-wide pool.
    let sock = socket2::Socket::new(socket2::Domain::IPV6, socket2::Type::DGRAM, None)
        .expect("udp6 socket");
    let aico = handle.attach_socket(sock).expect("attach");
    handle.set_keep_alive(aico, true);

    let before = cio::env::pool_len();
    let (tx, rx) = mpsc::channel();
    handle.post(
        aico,
        Op::Clos,
        None,
        Box::new(move |aice: &mut Aice| {
            assert_eq!(aice.code, OpCode::Clos);
            tx.send(aice.state).unwrap();
            false
        }),
    );
    let state = expect_within(&rx, 5, "clos completion");
    assert_eq!(state, State::Ok);
    assert!(cio::env::pool_len() > before);

    cio::env::pool_clip(0);
    assert!(proactor.exit());
}
