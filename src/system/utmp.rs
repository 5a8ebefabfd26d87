//! Session accounting for pseudo-terminals.
//!
//! Records are written through the utmpx interface of the C library. On platforms where that
//! interface is not available these functions do nothing.

/// Strip the `/dev/` prefix from a terminal path, giving the `ut_line` value.
pub(crate) fn line_of(tty_name: &[u8]) -> &[u8] {
    tty_name.strip_prefix(b"/dev/").unwrap_or(tty_name)
}

/// The `ut_id` value for a terminal: the last four bytes of its line, like `login` uses.
pub(crate) fn id_of(line: &[u8]) -> &[u8] {
    &line[line.len().saturating_sub(4)..]
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod imp {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::{id_of, line_of};
    use crate::{cutils::copy_to_c_array, log::dev_warn, system::interface::ProcessId};

    fn zeroed() -> libc::utmpx {
        // SAFETY: utmpx is a plain C struct for which all-zeroes is a valid value.
        unsafe { std::mem::zeroed() }
    }

    fn stamp(entry: &mut libc::utmpx) {
        if let Ok(now) = SystemTime::now().duration_since(UNIX_EPOCH) {
            entry.ut_tv.tv_sec = now.as_secs() as _;
            entry.ut_tv.tv_usec = now.subsec_micros() as _;
        }
    }

    /// Record a login of `user` on the terminal `tty_name` by process `pid`.
    pub(crate) fn login(tty_name: &[u8], user: &[u8], remote_host: &[u8], pid: ProcessId) {
        let line = line_of(tty_name);

        let mut entry = zeroed();
        entry.ut_type = libc::USER_PROCESS;
        entry.ut_pid = pid.get();
        copy_to_c_array(&mut entry.ut_line, line);
        copy_to_c_array(&mut entry.ut_id, id_of(line));
        copy_to_c_array(&mut entry.ut_user, user);
        copy_to_c_array(&mut entry.ut_host, remote_host);
        stamp(&mut entry);

        unsafe {
            libc::setutxent();
            if libc::pututxline(&entry).is_null() {
                dev_warn!("cannot write utmp entry: {}", std::io::Error::last_os_error());
            }
            libc::endutxent();
        }
    }

    /// Mark the login on `tty_name` as finished.
    pub(crate) fn logout(tty_name: &[u8]) {
        let line = line_of(tty_name);

        let mut query = zeroed();
        copy_to_c_array(&mut query.ut_line, line);

        unsafe {
            libc::setutxent();
            let found = libc::getutxline(&query);
            if !found.is_null() {
                let mut entry = *found;
                entry.ut_type = libc::DEAD_PROCESS;
                copy_to_c_array(&mut entry.ut_user, b"");
                copy_to_c_array(&mut entry.ut_host, b"");
                stamp(&mut entry);
                if libc::pututxline(&entry).is_null() {
                    dev_warn!("cannot clear utmp entry: {}", std::io::Error::last_os_error());
                }
            }
            libc::endutxent();
        }
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
mod imp {
    use crate::system::interface::ProcessId;

    pub(crate) fn login(_tty_name: &[u8], _user: &[u8], _remote_host: &[u8], _pid: ProcessId) {}

    pub(crate) fn logout(_tty_name: &[u8]) {}
}

pub(crate) use imp::{login, logout};
