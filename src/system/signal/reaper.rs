use std::{
    io,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    sync::atomic::{AtomicI32, Ordering},
};

use libc::c_int;

use crate::{
    cutils::{cerr, errno, set_errno},
    log::dev_error,
    system::{interface::ProcessId, pipe, set_cloexec, set_nonblocking, wait::WaitStatus},
};

use super::SignalNumber;

/// Write end of the live [`ExitRecordPipe`], or -1 if there is none.
static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

const RECORD_SIZE: usize = 2 * std::mem::size_of::<c_int>();

pub(super) extern "C" fn reap_children(_signal: SignalNumber) {
    let saved_errno = errno();

    // Several terminations may be coalesced into one SIGCHLD.
    loop {
        let mut status: c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }

        let fd = WRITE_FD.load(Ordering::SeqCst);
        if fd != -1 {
            let mut record = [0u8; RECORD_SIZE];
            record[..RECORD_SIZE / 2].copy_from_slice(&pid.to_ne_bytes());
            record[RECORD_SIZE / 2..].copy_from_slice(&status.to_ne_bytes());
            // A full pipe loses the wakeup; there is nothing async-signal-safe left to do.
            unsafe { libc::write(fd, record.as_ptr().cast(), RECORD_SIZE) };
        }
    }

    set_errno(saved_errno);
}

/// A child that was reaped by the SIGCHLD handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExitRecord {
    pub(crate) pid: ProcessId,
    pub(crate) status: WaitStatus,
}

impl ExitRecord {
    fn decode(bytes: &[u8; RECORD_SIZE]) -> Self {
        let mut pid = [0; RECORD_SIZE / 2];
        let mut status = [0; RECORD_SIZE / 2];
        pid.copy_from_slice(&bytes[..RECORD_SIZE / 2]);
        status.copy_from_slice(&bytes[RECORD_SIZE / 2..]);

        Self {
            pid: ProcessId::new(c_int::from_ne_bytes(pid)),
            status: WaitStatus::from_raw(c_int::from_ne_bytes(status)),
        }
    }
}

/// The pipe through which the SIGCHLD handler hands reaped children to the event loop.
///
/// Only one of these can be live at a time; creating a new one redirects the handler to it.
pub(crate) struct ExitRecordPipe {
    rx: OwnedFd,
    tx: OwnedFd,
}

impl ExitRecordPipe {
    pub(crate) fn new() -> io::Result<Self> {
        let (rx, tx) = pipe().map_err(|err| {
            dev_error!("cannot create pipe for the child reaper: {err}");
            err
        })?;

        for fd in [&rx, &tx] {
            set_nonblocking(fd)?;
            set_cloexec(fd, true)?;
        }

        WRITE_FD.store(tx.as_raw_fd(), Ordering::SeqCst);

        Ok(Self { rx, tx })
    }

    /// Stop the SIGCHLD handler from writing into this pipe. Children reaped afterwards are
    /// not reported anywhere.
    pub(crate) fn unpublish(&self) {
        let _ = WRITE_FD.compare_exchange(
            self.tx.as_raw_fd(),
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Read one record. Returns `Ok(None)` if no complete record was available.
    pub(crate) fn recv(&self) -> io::Result<Option<ExitRecord>> {
        let mut buf = [0u8; RECORD_SIZE];
        let res = cerr(unsafe {
            libc::read(self.rx.as_raw_fd(), buf.as_mut_ptr().cast(), RECORD_SIZE)
        });

        match res {
            Ok(n) if n as usize == RECORD_SIZE => Ok(Some(ExitRecord::decode(&buf))),
            Ok(n) => {
                dev_error!("short read of {n} bytes from the child reaper pipe");
                Ok(None)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl AsRawFd for ExitRecordPipe {
    fn as_raw_fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }
}

impl Drop for ExitRecordPipe {
    fn drop(&mut self) {
        // The handler must never write to a recycled descriptor.
        self.unpublish();
    }
}
