//! The privileged helper that hands a pseudo-terminal follower to the user who allocated it.
//!
//! Usage: `grantpty --grant|--revoke FD`, where `FD` is an inherited descriptor of the leader.
use std::{ffi::CString, fmt, os::fd::BorrowedFd, process};

use crate::{
    cutils::safe_isatty,
    log::{auth_info, auth_warn, user_error, ProcLogger},
    system::{
        chmod, chown,
        interface::{GroupId, UserId},
        real_gid, real_uid,
        term::ptsname,
        Group,
    },
};

const USAGE_MSG: &str = "usage: grantpty --grant|--revoke FD";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    /// Hand the follower to the real user and the tty group.
    Grant(i32),
    /// Hand the follower back to root.
    Revoke(i32),
}

#[derive(Debug, PartialEq, Eq)]
enum ArgError {
    Usage,
    InvalidDescriptor(String),
}

impl fmt::Display for ArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgError::Usage => f.write_str(USAGE_MSG),
            ArgError::InvalidDescriptor(arg) => write!(f, "'{arg}' is not a file descriptor"),
        }
    }
}

impl Action {
    fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Self, ArgError> {
        let mut args = args.into_iter();
        let (Some(mode), Some(fd), None) = (args.next(), args.next(), args.next()) else {
            return Err(ArgError::Usage);
        };

        let fd = match fd.parse::<i32>() {
            Ok(fd) if fd >= 0 => fd,
            _ => return Err(ArgError::InvalidDescriptor(fd)),
        };

        match mode.as_str() {
            "--grant" => Ok(Action::Grant(fd)),
            "--revoke" => Ok(Action::Revoke(fd)),
            _ => Err(ArgError::Usage),
        }
    }

    fn fd(self) -> i32 {
        match self {
            Action::Grant(fd) | Action::Revoke(fd) => fd,
        }
    }
}

fn tty_gid() -> GroupId {
    CString::new(env!("PROCPTY_TTY_GROUP"))
        .ok()
        .and_then(|name| Group::from_name(&name).ok().flatten())
        .map_or_else(real_gid, |group| group.gid)
}

fn run(action: Action) -> Result<(), String> {
    let fd = action.fd();
    if !safe_isatty(fd) {
        return Err(format!("descriptor {fd} is not a terminal"));
    }

    // SAFETY: the descriptor was checked to be open and is not closed while borrowed.
    let master = unsafe { BorrowedFd::borrow_raw(fd) };
    let tty_name = ptsname(&master).map_err(|err| format!("cannot resolve follower: {err}"))?;

    let (uid, gid, mode) = match action {
        Action::Grant(_) => (real_uid(), tty_gid(), 0o620),
        Action::Revoke(_) => (UserId::ROOT, GroupId::ROOT, 0o666),
    };

    chown(&tty_name, uid, gid)
        .and_then(|()| chmod(&tty_name, mode))
        .map_err(|err| format!("cannot change owner of {tty_name:?}: {err}"))?;

    auth_info!("{tty_name:?} now belongs to {uid}:{gid}, mode {mode:o}");

    Ok(())
}

pub fn main() {
    let _ = ProcLogger::new("grantpty: ").into_global_logger();

    let action = match Action::parse(std::env::args().skip(1)) {
        Ok(action) => action,
        Err(error) => {
            user_error!("{error}");
            process::exit(1);
        }
    };

    if let Err(error) = run(action) {
        auth_warn!("{error}");
        user_error!("{error}");
        process::exit(1);
    }
}
