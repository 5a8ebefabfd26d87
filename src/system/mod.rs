use std::{
    collections::BTreeSet,
    ffi::{c_uint, CStr, CString},
    io,
    mem::MaybeUninit,
    os::{
        fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        unix::prelude::OsStrExt,
    },
    path::Path,
};

use crate::cutils::*;
use interface::{GroupId, ProcessId, UserId};
use libc::STDERR_FILENO;

use self::signal::SignalNumber;

// generalized traits for when we want to hide implementations
pub mod interface;

pub mod poll;

pub mod signal;

pub mod term;

pub mod utmp;

pub mod wait;

pub(crate) fn can_execute<P: AsRef<Path>>(path: P) -> bool {
    let Ok(path) = CString::new(path.as_ref().as_os_str().as_bytes()) else {
        return false;
    };

    unsafe { libc::access(path.as_ptr(), libc::X_OK) == 0 }
}

/// Check whether the real user may read and write the file at `path`.
pub(crate) fn can_read_write(path: &CStr) -> bool {
    unsafe { libc::access(path.as_ptr(), libc::R_OK | libc::W_OK) == 0 }
}

pub(crate) fn _exit(status: libc::c_int) -> ! {
    unsafe { libc::_exit(status) }
}

/// A type able to close every file descriptor except for the ones pased via [`FileCloser::except`]
/// and the IO streams.
pub(crate) struct FileCloser {
    fds: BTreeSet<c_uint>,
}

impl FileCloser {
    pub(crate) const fn new() -> Self {
        Self {
            fds: BTreeSet::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn except<F: AsRawFd>(&mut self, fd: &F) {
        self.fds.insert(fd.as_raw_fd() as c_uint);
    }

    /// Close every file descriptor that is not one of the IO streams or one of the file
    /// descriptors passed via [`FileCloser::except`].
    pub(crate) fn close_the_universe(self) -> io::Result<()> {
        let mut fds = self.fds.into_iter();

        let Some(mut curr_fd) = fds.next() else {
            return close_range(STDERR_FILENO as c_uint + 1, c_uint::MAX);
        };

        if let Some(max_fd) = curr_fd.checked_sub(1) {
            close_range(STDERR_FILENO as c_uint + 1, max_fd)?;
        }

        for next_fd in fds {
            if let Some(min_fd) = curr_fd.checked_add(1) {
                if let Some(max_fd) = next_fd.checked_sub(1) {
                    close_range(min_fd, max_fd)?;
                }
            }

            curr_fd = next_fd;
        }

        if let Some(min_fd) = curr_fd.checked_add(1) {
            close_range(min_fd, c_uint::MAX)?;
        }

        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn close_range(min_fd: c_uint, max_fd: c_uint) -> io::Result<()> {
    if min_fd <= max_fd {
        let res = cerr(unsafe { libc::syscall(libc::SYS_close_range, min_fd, max_fd, 0 as c_uint) });
        match res {
            // Kernels older than 5.9 lack the syscall.
            Err(err) if err.raw_os_error() == Some(libc::ENOSYS) => {
                close_range_by_hand(min_fd, max_fd)
            }
            res => res.map(|_| ()),
        }
    } else {
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
fn close_range(min_fd: c_uint, max_fd: c_uint) -> io::Result<()> {
    close_range_by_hand(min_fd, max_fd)
}

fn close_range_by_hand(min_fd: c_uint, max_fd: c_uint) -> io::Result<()> {
    let open_max = match unsafe { libc::sysconf(libc::_SC_OPEN_MAX) } {
        n if n > 0 => n as c_uint,
        _ => 1024,
    };

    for fd in min_fd..=max_fd.min(open_max.saturating_sub(1)) {
        // EBADF just means there was nothing to close.
        unsafe { libc::close(fd as RawFd) };
    }

    Ok(())
}

pub(crate) enum ForkResult {
    // Parent process branch with the child process' PID.
    Parent(ProcessId),
    // Child process branch.
    Child,
}

/// Create a new process.
///
/// # Safety
///
/// In a multithreaded program, only async-signal-safe functions are guaranteed to work in the
/// child process until a call to `execve` or a similar function is done.
pub(crate) unsafe fn fork() -> io::Result<ForkResult> {
    let pid = cerr(unsafe { libc::fork() })?;
    if pid == 0 {
        Ok(ForkResult::Child)
    } else {
        Ok(ForkResult::Parent(ProcessId::new(pid)))
    }
}

pub fn setsid() -> io::Result<ProcessId> {
    cerr(unsafe { libc::setsid() }).map(ProcessId::new)
}

pub fn syslog(priority: libc::c_int, facility: libc::c_int, message: &str) {
    const MSG: *const libc::c_char = match CStr::from_bytes_until_nul(b"%s\0") {
        Ok(cstr) => cstr.as_ptr(),
        Err(_) => panic!("syslog formatting string is not null-terminated"),
    };

    // Interior NUL bytes cannot be passed to syslog; cut the message at the first one.
    let message = match CString::new(message) {
        Ok(message) => message,
        Err(err) => {
            let end = err.nul_position();
            let mut bytes = err.into_vec();
            bytes.truncate(end);
            // the remaining bytes contain no NUL
            CString::new(bytes).unwrap_or_default()
        }
    };

    unsafe {
        libc::syslog(priority | facility, MSG, message.as_ptr());
    }
}

/// Send a signal to a process with the specified ID.
pub fn kill(pid: ProcessId, signal: SignalNumber) -> io::Result<()> {
    // SAFETY: This function cannot cause UB even if `pid` is not a valid process ID or if
    // `signal` is not a valid signal code.
    cerr(unsafe { libc::kill(pid.get(), signal) }).map(|_| ())
}

/// Get the ID of the current process.
pub fn getpid() -> ProcessId {
    ProcessId::new(unsafe { libc::getpid() })
}

pub fn chown<S: AsRef<CStr>>(path: &S, uid: UserId, gid: GroupId) -> io::Result<()> {
    let path = path.as_ref().as_ptr();

    cerr(unsafe { libc::chown(path, uid.get(), gid.get()) }).map(|_| ())
}

pub fn chmod<S: AsRef<CStr>>(path: &S, mode: libc::mode_t) -> io::Result<()> {
    let path = path.as_ref().as_ptr();

    cerr(unsafe { libc::chmod(path, mode) }).map(|_| ())
}

pub fn real_uid() -> UserId {
    UserId::new(unsafe { libc::getuid() })
}

pub fn real_gid() -> GroupId {
    GroupId::new(unsafe { libc::getgid() })
}

pub fn effective_uid() -> UserId {
    UserId::new(unsafe { libc::geteuid() })
}

#[derive(Debug, Clone)]
#[cfg_attr(test, derive(PartialEq))]
pub struct Group {
    pub gid: GroupId,
    pub name: String,
}

impl Group {
    /// # Safety
    /// This function expects `grp` to be a result from a succesful call to `getgrXXX_r`; the
    /// name is expected to be a null-terminated string.
    unsafe fn from_libc(grp: &libc::group) -> Group {
        Group {
            gid: GroupId::new(grp.gr_gid),
            name: unsafe { os_string_from_ptr(grp.gr_name) }
                .to_string_lossy()
                .into_owned(),
        }
    }

    pub fn from_name(name_c: &CStr) -> io::Result<Option<Group>> {
        let max_gr_size = sysconf(libc::_SC_GETGR_R_SIZE_MAX).unwrap_or(16_384);
        let mut buf = vec![0; max_gr_size as usize];
        let mut grp = MaybeUninit::uninit();
        let mut grp_ptr = std::ptr::null_mut();
        let res = unsafe {
            libc::getgrnam_r(
                name_c.as_ptr(),
                grp.as_mut_ptr(),
                buf.as_mut_ptr(),
                buf.len(),
                &mut grp_ptr,
            )
        };
        // getgrnam_r reports failures through its return value instead of errno
        if res != 0 {
            return Err(io::Error::from_raw_os_error(res));
        }
        if grp_ptr.is_null() {
            Ok(None)
        } else {
            let grp = unsafe { grp.assume_init() };
            Ok(Some(unsafe { Group::from_libc(&grp) }))
        }
    }
}

fn sysconf(name: libc::c_int) -> Option<libc::c_long> {
    set_errno(0);
    match cerr(unsafe { libc::sysconf(name) }) {
        Ok(res) if res > 0 => Some(res),
        _ => None,
    }
}

/// Create a pipe. The first descriptor is the read end.
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [-1 as RawFd; 2];
    cerr(unsafe { libc::pipe(fds.as_mut_ptr()) })?;

    // SAFETY: `pipe` succeeded so both descriptors are open and owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Put a file descriptor in non-blocking mode.
pub(crate) fn set_nonblocking<F: AsRawFd>(fd: &F) -> io::Result<()> {
    let fd = fd.as_raw_fd();
    let flags = cerr(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    cerr(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}

/// Set or clear the close-on-exec flag of a file descriptor.
pub(crate) fn set_cloexec<F: AsRawFd>(fd: &F, enable: bool) -> io::Result<()> {
    let fd = fd.as_raw_fd();
    let flags = cerr(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    let flags = if enable {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    cerr(unsafe { libc::fcntl(fd, libc::F_SETFD, flags) })?;
    Ok(())
}

/// Duplicate `fd` onto the descriptor number `target`, closing whatever was there.
pub(crate) fn dup2<F: AsRawFd>(fd: &F, target: RawFd) -> io::Result<()> {
    cerr(unsafe { libc::dup2(fd.as_raw_fd(), target) })?;
    Ok(())
}

pub fn make_zeroed_sigaction() -> libc::sigaction {
    // SAFETY: since sigaction is a C struct, all-zeroes is a valid representation
    // We cannot use a "literal struct" initialization method since the exact representation
    // of libc::sigaction is not fixed.
    unsafe { std::mem::zeroed() }
}
