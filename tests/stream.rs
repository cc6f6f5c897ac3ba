//! End-to-end stream tests across the data, file, and sock backends.

mod util;

use std::io::{Read, Write};
use std::sync::mpsc;
use std::time::Duration;

use cio::stream::StreamState;
use cio::{AsyncStream, State};
use util::{expect_within, init_with_proactor};

#[test]
fn data_stream_serves_url_payload() {
    let proactor = init_with_proactor();
    // base64 of "hello"
    let stream = AsyncStream::from_url(&proactor.handle(), "data://aGVsbG8=").expect("stream");

    let (tx, rx) = mpsc::channel();
    let ok = stream.open_read(
        16,
        Box::new(move |_stream, state, data| {
            tx.send((state, data.to_vec())).unwrap();
            false
        }),
    );
    assert!(ok);
    let (state, data) = expect_within(&rx, 5, "data read");
    assert_eq!(state, State::Ok);
    assert_eq!(data, b"hello");
    assert_eq!(stream.size(), 5);

    assert!(stream.exit());
    assert!(proactor.exit());
}

#[test]
fn data_stream_write_seek_read_round_trip() {
    let proactor = init_with_proactor();
    let stream = AsyncStream::from_url(&proactor.handle(), "data://").expect("stream");

    let (tx, rx) = mpsc::channel();
    stream.open_write(
        b"roundtrip",
        Box::new(move |_stream, state, real, size| {
            tx.send((state, real, size)).unwrap();
            false
        }),
    );
    let (state, real, size) = expect_within(&rx, 5, "data write");
    assert_eq!(state, State::Ok);
    assert_eq!(real, 9);
    assert_eq!(size, 9);
    assert_eq!(stream.offset(), 9);

    let (tx, rx) = mpsc::channel();
    stream.seek(
        0,
        Box::new(move |_stream, state, offset| {
            tx.send((state, offset)).unwrap();
        }),
    );
    let (state, offset) = expect_within(&rx, 5, "data seek");
    assert_eq!(state, State::Ok);
    assert_eq!(offset, 0);

    let (tx, rx) = mpsc::channel();
    stream.read(
        64,
        Box::new(move |_stream, state, data| {
            tx.send((state, data.to_vec())).unwrap();
            false
        }),
    );
    let (state, data) = expect_within(&rx, 5, "data read back");
    assert_eq!(state, State::Ok);
    assert_eq!(data, b"roundtrip");

    assert!(stream.exit());
    assert!(proactor.exit());
}

#[test]
fn seek_to_current_offset_is_synchronous() {
    let proactor = init_with_proactor();
    let stream = AsyncStream::from_url(&proactor.handle(), "data://aGVsbG8=").expect("stream");
    assert!(stream.open_try());

    let (tx, rx) = mpsc::channel();
    stream.seek(
        0,
        Box::new(move |_stream, state, offset| {
            tx.send((state, offset)).unwrap();
        }),
    );
    // No worker round-trip: the result must already be queued.
    let (state, offset) = rx.try_recv().expect("synchronous seek completion");
    assert_eq!(state, State::Ok);
    assert_eq!(offset, 0);

    assert!(stream.exit());
    assert!(proactor.exit());
}

#[test]
fn file_stream_reads_whole_file() {
    let proactor = init_with_proactor();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("payload.bin");
    let payload: Vec<u8> = (0..1337u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, &payload).expect("write payload");

    let url = format!("file://{}", path.display());
    let stream = AsyncStream::from_url(&proactor.handle(), &url).expect("stream");
    stream.set_read_cache(256);

    let (tx, rx) = mpsc::channel();
    let ok = stream.open_read(
        4096,
        Box::new(move |_stream, state, data| {
            tx.send((state, data.to_vec())).unwrap();
            // Keep reading until end of file.
            state == State::Ok
        }),
    );
    assert!(ok);

    let mut collected = Vec::new();
    loop {
        let (state, data) = expect_within(&rx, 10, "file chunk");
        match state {
            State::Ok => collected.extend_from_slice(&data),
            State::Closed => break,
            state => panic!("unexpected read state {}", state),
        }
    }
    assert_eq!(collected, payload);
    assert_eq!(stream.size(), 1337);

    assert!(stream.exit());
    assert!(proactor.exit());
}

#[test]
fn file_stream_writes_and_syncs() {
    let proactor = init_with_proactor();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("out.bin");

    let url = format!("file://{}", path.display());
    let stream = AsyncStream::from_url(&proactor.handle(), &url).expect("stream");
    stream.set_file_mode(cio::stream::FileMode::RW | cio::stream::FileMode::CREATE);

    let (tx, rx) = mpsc::channel();
    stream.open_write(
        b"persisted",
        Box::new(move |_stream, state, real, _size| {
            tx.send((state, real)).unwrap();
            false
        }),
    );
    let (state, real) = expect_within(&rx, 5, "file write");
    assert_eq!(state, State::Ok);
    assert_eq!(real, 9);

    let (tx, rx) = mpsc::channel();
    stream.sync(Box::new(move |_stream, state| {
        tx.send(state).unwrap();
    }));
    let state = expect_within(&rx, 5, "file sync");
    assert_eq!(state, State::Ok);

    assert!(stream.exit());
    assert!(proactor.exit());
    assert_eq!(std::fs::read(&path).expect("read back"), b"persisted");
}

#[test]
fn write_cache_flushes_on_sync() {
    let proactor = init_with_proactor();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("cached.bin");

    let url = format!("file://{}", path.display());
    let stream = AsyncStream::from_url(&proactor.handle(), &url).expect("stream");
    stream.set_file_mode(cio::stream::FileMode::RW | cio::stream::FileMode::CREATE);
    stream.set_write_cache(1024);
    assert!(stream.open_try());

    // Both writes land in the cache and complete inline.
    for piece in [&b"cached "[..], &b"bytes"[..]] {
        let (tx, rx) = mpsc::channel();
        stream.write(
            piece,
            Box::new(move |_stream, state, real, size| {
                tx.send((state, real, size)).unwrap();
                false
            }),
        );
        let (state, real, size) = expect_within(&rx, 5, "cached write");
        assert_eq!(state, State::Ok);
        assert_eq!(real, size);
    }
    // Nothing reached the file yet.
    assert_eq!(std::fs::metadata(&path).expect("metadata").len(), 0);

    let (tx, rx) = mpsc::channel();
    stream.sync(Box::new(move |_stream, state| {
        tx.send(state).unwrap();
    }));
    let state = expect_within(&rx, 5, "sync");
    assert_eq!(state, State::Ok);

    assert!(stream.exit());
    assert!(proactor.exit());
    assert_eq!(std::fs::read(&path).expect("read back"), b"cached bytes");
}

// A blocking echo peer on its own thread.
fn spawn_echo_server() -> (std::net::SocketAddr, std::thread::JoinHandle<()>) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind echo");
    let addr = listener.local_addr().expect("echo addr");
    let thread = std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut buf = [0u8; 64];
            if let Ok(n) = stream.read(&mut buf) {
                let _ = stream.write_all(&buf[..n]);
            }
        }
    });
    (addr, thread)
}

#[test]
fn sock_stream_tcp_echo() {
    let proactor = init_with_proactor();
    let (addr, server) = spawn_echo_server();

    let url = format!("sock://127.0.0.1:{}/?tcp=", addr.port());
    let stream = AsyncStream::from_url(&proactor.handle(), &url).expect("stream");

    let (tx, rx) = mpsc::channel();
    let ok = stream.open_write(
        b"hello",
        Box::new(move |_stream, state, real, size| {
            tx.send((state, real, size)).unwrap();
            false
        }),
    );
    assert!(ok);
    let (state, real, size) = expect_within(&rx, 10, "sock write");
    assert_eq!(state, State::Ok);
    assert_eq!(real, 5);
    assert_eq!(size, 5);

    let (tx, rx) = mpsc::channel();
    stream.read(
        5,
        Box::new(move |_stream, state, data| {
            tx.send((state, data.to_vec())).unwrap();
            false
        }),
    );
    let (state, data) = expect_within(&rx, 10, "sock read");
    assert_eq!(state, State::Ok);
    assert_eq!(data, b"hello");

    assert!(stream.exit());
    server.join().expect("echo server");
    assert!(proactor.exit());
}

#[test]
fn sock_stream_udp_round_trip() {
    let proactor = init_with_proactor();

    // The peer bounces one datagram back to its source.
    let peer = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind peer");
    let peer_addr = peer.local_addr().expect("peer addr");
    let bounce = std::thread::spawn(move || {
        let mut buf = [0u8; 64];
        let (n, from) = peer.recv_from(&mut buf).expect("peer recv");
        peer.send_to(&buf[..n], from).expect("peer send");
    });

    let url = format!("sock://127.0.0.1:{}/?udp=", peer_addr.port());
    let stream = AsyncStream::from_url(&proactor.handle(), &url).expect("stream");

    let (tx, rx) = mpsc::channel();
    stream.open_write(
        b"ping",
        Box::new(move |_stream, state, real, _size| {
            tx.send((state, real)).unwrap();
            false
        }),
    );
    let (state, real) = expect_within(&rx, 10, "udp send");
    assert_eq!(state, State::Ok);
    assert_eq!(real, 4);

    let (tx, rx) = mpsc::channel();
    stream.read(
        16,
        Box::new(move |_stream, state, data| {
            tx.send((state, data.to_vec())).unwrap();
            false
        }),
    );
    let (state, data) = expect_within(&rx, 10, "udp recv");
    assert_eq!(state, State::Ok);
    assert_eq!(data, b"ping");

    bounce.join().expect("bounce thread");
    assert!(stream.exit());
    assert!(proactor.exit());
}

#[test]
fn kill_during_read_delivers_killed() {
    let proactor = init_with_proactor();

    // A peer that accepts and then stays silent.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let silent = std::thread::spawn(move || {
        let held = listener.accept();
        std::thread::sleep(Duration::from_secs(2));
        drop(held);
    });

    let url = format!("sock://127.0.0.1:{}/?tcp=", addr.port());
    let stream = AsyncStream::from_url(&proactor.handle(), &url).expect("stream");

    let (open_tx, open_rx) = mpsc::channel();
    stream.open(Box::new(move |_stream, state| {
        open_tx.send(state).unwrap();
    }));
    assert_eq!(expect_within(&open_rx, 10, "open"), State::Ok);

    let (tx, rx) = mpsc::channel();
    stream.read(
        8,
        Box::new(move |_stream, state, _data| {
            tx.send(state).unwrap();
            false
        }),
    );

    std::thread::sleep(Duration::from_millis(100));
    let killer = {
        let stream = stream.clone();
        std::thread::spawn(move || stream.kill())
    };
    killer.join().expect("killer thread");

    let state = expect_within(&rx, 5, "killed read");
    assert_eq!(state, State::Killed);
    assert!(stream.is_killed());
    assert_eq!(stream.state(), StreamState::Killing);

    silent.join().expect("silent peer");
    assert!(proactor.exit());
}

#[test]
fn open_failure_folds_back_to_closed() {
    let proactor = init_with_proactor();
    // Nothing listens on this port; TCP connect must be refused.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let url = format!("sock://127.0.0.1:{}/?tcp=", addr.port());
    let stream = AsyncStream::from_url(&proactor.handle(), &url).expect("stream");

    let (tx, rx) = mpsc::channel();
    stream.open(Box::new(move |_stream, state| {
        tx.send(state).unwrap();
    }));
    let state = expect_within(&rx, 10, "refused open");
    assert_ne!(state, State::Ok);
    assert_eq!(stream.state(), StreamState::Closed);

    assert!(proactor.exit());
}
