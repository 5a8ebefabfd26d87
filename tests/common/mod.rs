#![allow(dead_code)]
use std::{
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use procpty::{EventRegistry, Process, StopReason};

/// Only one child reaper can exist per process, so tests that spawn children take turns.
pub fn serial() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Dispatch events until the host sets an exit reason, failing the test after ten seconds.
pub fn run_until_exit<T: Process>(registry: &mut EventRegistry<T>, host: &mut T) -> T::Exit {
    let deadline = Instant::now() + Duration::from_secs(10);

    while Instant::now() < deadline {
        match registry
            .poll_once(host, Some(Duration::from_millis(100)))
            .unwrap()
        {
            Some(StopReason::Exit(reason)) => return reason,
            Some(StopReason::Break(_)) => panic!("unexpected break"),
            None => {}
        }
    }

    panic!("timed out waiting for the event loop to exit");
}

/// Whether `pid` is gone, waiting up to five seconds for it to disappear.
pub fn disappears(pid: libc::pid_t) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);

    while Instant::now() < deadline {
        if unsafe { libc::kill(pid, 0) } == -1 {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    false
}
