use std::{
    collections::BTreeMap,
    io,
    os::fd::{AsRawFd, RawFd},
    time::Duration,
};

use crate::cutils::cerr;
use libc::{c_int, c_short, pollfd, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

/// The kind of event that will be monitored for a file descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PollEvent {
    /// Data may be read without blocking.
    Readable,
    /// Data may be written without blocking.
    Writable,
}

/// A set of indexed file descriptors to be polled using the [`poll`](https://manpage.me/?q=poll) system call.
pub struct PollSet<K> {
    fds: BTreeMap<K, (RawFd, bool, c_short)>,
}

impl<K: Eq + PartialEq + Ord + PartialOrd + Clone> PollSet<K> {
    /// Create an empty set of file descriptors.
    pub const fn new() -> Self {
        Self {
            fds: BTreeMap::new(),
        }
    }

    /// Add a file descriptor under the provided key. This descriptor will be checked for the given
    /// poll event and return a unique identifier for the descriptor inside the set.
    ///
    /// If the provided key is already in the set, calling this function will overwrite the file
    /// descriptor for that key.
    pub fn add_fd<F: AsRawFd>(&mut self, key: K, fd: &F, event: PollEvent) {
        let event = match event {
            PollEvent::Readable => POLLIN,
            PollEvent::Writable => POLLOUT,
        };
        self.fds.insert(key, (fd.as_raw_fd(), true, event));
    }

    /// Remove the file descriptor under the provided key, if any.
    pub fn remove_fd(&mut self, key: &K) {
        self.fds.remove(key);
    }

    /// Ignore the file descriptor under the provided key, if any.
    pub fn ignore_fd(&mut self, key: &K) {
        if let Some((_, should_poll, _)) = self.fds.get_mut(key) {
            *should_poll = false;
        }
    }

    /// Stop ignoring the file descriptor under the provided key, if any.
    pub fn resume_fd(&mut self, key: &K) {
        if let Some((_, should_poll, _)) = self.fds.get_mut(key) {
            *should_poll = true;
        }
    }

    /// Whether the key is in the set and not ignored.
    pub fn is_active(&self, key: &K) -> bool {
        self.fds
            .get(key)
            .is_some_and(|&(_, should_poll, _)| should_poll)
    }

    pub fn is_empty(&self) -> bool {
        self.fds.values().all(|&(_, should_poll, _)| !should_poll)
    }

    /// Poll the set of file descriptors and return the key of the descriptors that are ready to be
    /// read or written.
    ///
    /// Calling this function will block until one of the file descriptors in the set is ready or
    /// `timeout` elapses; `None` waits forever. A hang-up or error on a descriptor counts as
    /// ready, so that the following read or write can observe it. Descriptors that are no longer
    /// open are dropped from the set. An interrupted wait returns no keys.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<K>> {
        let (keys, mut fds): (Vec<K>, Vec<pollfd>) = self
            .fds
            .iter()
            .filter_map(|(key, &(fd, should_poll, events))| {
                should_poll.then(|| {
                    (
                        key.clone(),
                        pollfd {
                            fd,
                            events,
                            revents: 0,
                        },
                    )
                })
            })
            .unzip();

        let timeout = match timeout {
            None => -1,
            Some(timeout) => timeout.as_millis().min(c_int::MAX as u128) as c_int,
        };

        let n = match cerr(unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as _, timeout) }) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut ready = Vec::with_capacity(n as usize);

        for (key, fd) in keys.into_iter().zip(fds) {
            if fd.revents & POLLNVAL != 0 {
                // The descriptor was closed behind our back, it will never become ready again.
                self.fds.remove(&key);
                continue;
            }

            let events = fd.events & fd.revents;
            let failed = fd.revents & (POLLHUP | POLLERR) != 0;

            if events & (POLLIN | POLLOUT) != 0 || failed {
                ready.push(key);
            }
        }

        Ok(ready)
    }
}
