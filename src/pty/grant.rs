use std::{
    ffi::CString,
    fs::File,
    io,
    os::{fd::AsRawFd, unix::ffi::OsStrExt},
    path::Path,
    ptr,
};

use crate::{
    log::dev_info,
    system::{
        _exit, fork, set_cloexec,
        signal::{consts::SIGCHLD, SignalSet},
        wait::{Wait, WaitError, WaitOptions},
        ForkResult,
    },
};

/// Run the ownership helper for the follower of `master` and wait for it.
///
/// With `grant` the follower is handed to the real user, otherwise it is handed back to root.
/// Returns whether the helper reported success.
pub(super) fn run_helper(helper: &Path, grant: bool, master: &File) -> io::Result<bool> {
    let invalid = |_| io::Error::new(io::ErrorKind::InvalidInput, "helper path contains a nul byte");
    let program = CString::new(helper.as_os_str().as_bytes()).map_err(invalid)?;
    let mode = CString::new(if grant { "--grant" } else { "--revoke" }).map_err(invalid)?;
    let fd = CString::new(master.as_raw_fd().to_string()).map_err(invalid)?;
    let argv = [program.as_ptr(), mode.as_ptr(), fd.as_ptr(), ptr::null()];

    // Keep the child reaper, if any, away from the helper.
    let original_mask = SignalSet::single(SIGCHLD)?.block()?;

    let pid = match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let _ = original_mask.set_mask();
            // The helper must inherit the leader to find the follower.
            if set_cloexec(master, false).is_ok() {
                unsafe { libc::execv(program.as_ptr(), argv.as_ptr()) };
            }
            _exit(127)
        }
        Ok(ForkResult::Parent(pid)) => pid,
        Err(err) => {
            original_mask.set_mask()?;
            return Err(err);
        }
    };

    let status = loop {
        match pid.wait(WaitOptions::new()) {
            Ok((_, status)) => break Ok(status),
            Err(WaitError::Io(err)) if err.kind() != io::ErrorKind::Interrupted => break Err(err),
            Err(_) => {}
        }
    };
    original_mask.set_mask()?;
    let status = status?;

    dev_info!("{} exited with {status:?}", helper.display());

    Ok(status.exit_status() == Some(0))
}
