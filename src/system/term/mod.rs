use std::{
    ffi::CString,
    io,
    mem::MaybeUninit,
    os::fd::AsRawFd,
};

use crate::cutils::cerr;

use super::{getpid, interface::ProcessId, setsid};

/// The size of a terminal window in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub rows: u16,
    pub cols: u16,
}

impl TermSize {
    pub const fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

mod sealed {
    use std::os::fd::AsRawFd;

    pub(crate) trait Sealed {}

    impl<F: AsRawFd> Sealed for F {}
}

pub(crate) trait Terminal: sealed::Sealed {
    fn tcgetpgrp(&self) -> io::Result<ProcessId>;
    fn tcsetpgrp(&self, pgrp: ProcessId) -> io::Result<()>;
    fn make_controlling_terminal(&self) -> io::Result<()>;
    fn tcgetattr(&self) -> io::Result<libc::termios>;
    fn tcsetattr(&self, term: &libc::termios) -> io::Result<()>;
    fn get_size(&self) -> io::Result<TermSize>;
    fn set_size(&self, size: TermSize) -> io::Result<()>;
}

impl<F: AsRawFd> Terminal for F {
    /// Get the foreground process group ID associated with this terminal.
    fn tcgetpgrp(&self) -> io::Result<ProcessId> {
        cerr(unsafe { libc::tcgetpgrp(self.as_raw_fd()) }).map(ProcessId::new)
    }
    /// Set the foreground process group ID associated with this terminalto `pgrp`.
    fn tcsetpgrp(&self, pgrp: ProcessId) -> io::Result<()> {
        cerr(unsafe { libc::tcsetpgrp(self.as_raw_fd(), pgrp.get()) }).map(|_| ())
    }

    /// Make the given terminal the controlling terminal of the calling process.
    fn make_controlling_terminal(&self) -> io::Result<()> {
        cerr(unsafe { libc::ioctl(self.as_raw_fd(), libc::TIOCSCTTY as _, 0) })?;
        Ok(())
    }

    fn tcgetattr(&self) -> io::Result<libc::termios> {
        let mut term = MaybeUninit::<libc::termios>::uninit();
        cerr(unsafe { libc::tcgetattr(self.as_raw_fd(), term.as_mut_ptr()) })?;
        Ok(unsafe { term.assume_init() })
    }

    fn tcsetattr(&self, term: &libc::termios) -> io::Result<()> {
        cerr(unsafe { libc::tcsetattr(self.as_raw_fd(), libc::TCSANOW, term) })?;
        Ok(())
    }

    fn get_size(&self) -> io::Result<TermSize> {
        let mut term_size = MaybeUninit::<libc::winsize>::uninit();

        cerr(unsafe {
            libc::ioctl(
                self.as_raw_fd(),
                libc::TIOCGWINSZ as _,
                term_size.as_mut_ptr(),
            )
        })?;

        let term_size = unsafe { term_size.assume_init() };
        Ok(TermSize::new(term_size.ws_row, term_size.ws_col))
    }

    fn set_size(&self, size: TermSize) -> io::Result<()> {
        let wsize = libc::winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        cerr(unsafe { libc::ioctl(self.as_raw_fd(), libc::TIOCSWINSZ as _, &wsize) })?;
        Ok(())
    }
}

/// Start a new session and make `tty` its controlling terminal, with the calling process in the
/// foreground. Meant to run in a freshly forked child.
pub(crate) fn attach_controlling_terminal<F: AsRawFd>(tty: &F) -> io::Result<()> {
    setsid()?;
    tty.make_controlling_terminal()?;
    tty.tcsetpgrp(getpid())
}

/// Get the path of the follower device paired with the pseudo-terminal leader `fd`.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn ptsname<F: AsRawFd>(fd: &F) -> io::Result<CString> {
    let mut buf: [libc::c_char; 128] = [0; 128];

    let res = unsafe { libc::ptsname_r(fd.as_raw_fd(), buf.as_mut_ptr(), buf.len()) };
    if res != 0 {
        return Err(io::Error::from_raw_os_error(res));
    }

    Ok(unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) }.to_owned())
}

/// Get the path of the follower device paired with the pseudo-terminal leader `fd`.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn ptsname<F: AsRawFd>(fd: &F) -> io::Result<CString> {
    let ptr = unsafe { libc::ptsname(fd.as_raw_fd()) };
    if ptr.is_null() {
        return Err(io::Error::last_os_error());
    }

    Ok(unsafe { std::ffi::CStr::from_ptr(ptr) }.to_owned())
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        os::{
            fd::{AsRawFd, FromRawFd, OwnedFd},
            unix::net::UnixStream,
        },
        process::exit,
    };

    use crate::cutils::cerr;
    use crate::system::{
        fork, getpid,
        interface::ProcessId,
        term::*,
        wait::{Wait, WaitOptions},
        ForkResult,
    };

    fn getsid() -> ProcessId {
        ProcessId::new(unsafe { libc::getsid(0) })
    }

    fn openpty() -> (OwnedFd, OwnedFd) {
        let (mut leader, mut follower) = (0, 0);
        cerr(unsafe {
            libc::openpty(
                &mut leader,
                &mut follower,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        })
        .unwrap();
        unsafe { (OwnedFd::from_raw_fd(leader), OwnedFd::from_raw_fd(follower)) }
    }

    #[test]
    fn ptsname_names_the_follower() {
        let (leader, follower) = openpty();
        let name = ptsname(&leader).unwrap();
        let link = std::fs::read_link(format!("/proc/self/fd/{}", follower.as_raw_fd())).unwrap();
        assert_eq!(
            name.to_bytes(),
            std::os::unix::ffi::OsStrExt::as_bytes(link.as_os_str())
        );
    }

    #[test]
    fn window_size_roundtrip() {
        let (leader, follower) = openpty();
        follower.set_size(TermSize::new(24, 80)).unwrap();
        assert_eq!(leader.get_size().unwrap(), TermSize::new(24, 80));
    }

    #[test]
    fn termios_roundtrip() {
        let (_leader, follower) = openpty();
        let mut term = follower.tcgetattr().unwrap();
        term.c_lflag &= !libc::ECHO;
        follower.tcsetattr(&term).unwrap();
        assert_eq!(follower.tcgetattr().unwrap().c_lflag & libc::ECHO, 0);
    }

    #[test]
    fn follower_becomes_the_controlling_terminal() {
        let (mut rx, mut tx) = UnixStream::pair().unwrap();

        let ForkResult::Parent(child_pid) = unsafe { fork() }.unwrap() else {
            let (_leader, follower) = openpty();
            let ok = attach_controlling_terminal(&follower).is_ok()
                && follower.tcgetpgrp().ok() == Some(getpid())
                && getsid() == getpid();
            tx.write_all(&[ok as u8]).ok();

            exit(0);
        };

        drop(tx);

        let mut buf = [0];
        rx.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], 1);

        child_pid.wait(WaitOptions::new()).unwrap();
    }
}
