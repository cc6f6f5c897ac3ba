// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Once;
use std::time::Duration;

use cio::Proactor;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

pub fn init_with_proactor() -> Proactor {
    init();
    Proactor::new(256).expect("unable to create proactor")
}

/// Receives one completion notification with a generous deadline so slow CI
/// machines do not flake.
pub fn expect_within<T>(rx: &Receiver<T>, secs: u64, what: &str) -> T {
    match rx.recv_timeout(Duration::from_secs(secs)) {
        Ok(value) => value,
        Err(RecvTimeoutError::Timeout) => panic!("timed out waiting for {}", what),
        Err(RecvTimeoutError::Disconnected) => panic!("sender dropped waiting for {}", what),
    }
}

pub fn assert_send<T: Send>() {}
pub fn assert_sync<T: Sync>() {}
