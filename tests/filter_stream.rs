//! Filter-composed stream tests.

mod util;

use std::sync::mpsc;

use cio::filter::{Spak, ZipAction, ZipAlgo};
use cio::{AsyncStream, Filter, State};
use util::{expect_within, init_with_proactor};

#[test]
fn chunked_decode_over_data_stream() {
    let proactor = init_with_proactor();
    // base64 of "5\r\nhello\r\n0\r\n\r\n"
    let child =
        AsyncStream::from_url(&proactor.handle(), "data://NQ0KaGVsbG8NCjANCg0K").expect("child");
    let stream = AsyncStream::with_filter(&proactor.handle(), child, Filter::chunked());

    let (tx, rx) = mpsc::channel();
    let ok = stream.open_read(
        64,
        Box::new(move |_stream, state, data| {
            tx.send((state, data.to_vec())).unwrap();
            state == State::Ok
        }),
    );
    assert!(ok);

    let mut decoded = Vec::new();
    loop {
        let (state, data) = expect_within(&rx, 10, "decoded chunk");
        match state {
            State::Ok => decoded.extend_from_slice(&data),
            State::Closed => break,
            state => panic!("unexpected state {}", state),
        }
    }
    assert_eq!(decoded, b"hello");

    assert!(stream.exit());
    assert!(proactor.exit());
}

#[test]
fn cache_filter_is_transparent() {
    let proactor = init_with_proactor();
    let child =
        AsyncStream::from_url(&proactor.handle(), "data://dHJhbnNwYXJlbnQ=").expect("child");
    let stream = AsyncStream::with_filter(&proactor.handle(), child, Filter::cache(4));

    let (tx, rx) = mpsc::channel();
    stream.open_read(
        64,
        Box::new(move |_stream, state, data| {
            tx.send((state, data.to_vec())).unwrap();
            state == State::Ok
        }),
    );

    let mut collected = Vec::new();
    loop {
        let (state, data) = expect_within(&rx, 10, "identity chunk");
        match state {
            State::Ok => collected.extend_from_slice(&data),
            State::Closed => break,
            state => panic!("unexpected state {}", state),
        }
    }
    assert_eq!(collected, b"transparent");

    assert!(stream.exit());
    assert!(proactor.exit());
}

#[test]
fn deflate_filter_compresses_file_writes() {
    let proactor = init_with_proactor();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("packed.z");

    let url = format!("file://{}", path.display());
    let child = AsyncStream::from_url(&proactor.handle(), &url).expect("child");
    child.set_file_mode(cio::stream::FileMode::RW | cio::stream::FileMode::CREATE);
    let stream = AsyncStream::with_filter(
        &proactor.handle(),
        child,
        Filter::zip(ZipAlgo::Zlib, ZipAction::Deflate),
    );

    let payload = b"compress me through the stream layer".repeat(32);
    let (tx, rx) = mpsc::channel();
    let payload2 = payload.clone();
    stream.open_write(
        &payload,
        Box::new(move |_stream, state, real, _size| {
            tx.send((state, real)).unwrap();
            false
        }),
    );
    let (state, real) = expect_within(&rx, 10, "filtered write");
    assert_eq!(state, State::Ok);
    assert_eq!(real, payload2.len());

    // A closing sync flushes the deflate tail into the child.
    let (tx, rx) = mpsc::channel();
    stream.sync_closing(Box::new(move |_stream, state| {
        tx.send(state).unwrap();
    }));
    assert_eq!(expect_within(&rx, 10, "filtered sync"), State::Ok);

    assert!(stream.exit());
    assert!(proactor.exit());

    // What landed on disk must inflate back to the payload.
    let packed = std::fs::read(&path).expect("packed bytes");
    assert!(!packed.is_empty());
    assert!(packed.len() < payload.len());
    let mut inflate = Filter::zip(ZipAlgo::Zlib, ZipAction::Inflate);
    assert!(inflate.open());
    let mut unpacked = Vec::new();
    match inflate.spak(&packed, 0, 1) {
        Spak::Data(bytes) => unpacked.extend_from_slice(bytes),
        _ => {}
    }
    loop {
        match inflate.spak(&[], 0, -1) {
            Spak::Data(bytes) => unpacked.extend_from_slice(bytes),
            _ => break,
        }
    }
    assert_eq!(unpacked, payload);
}
