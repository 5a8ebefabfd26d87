//! Pseudo-terminal allocation and configuration.
use std::{
    ffi::{CStr, CString, OsStr},
    fs::{File, OpenOptions},
    io,
    os::unix::{
        ffi::OsStrExt,
        fs::{MetadataExt, OpenOptionsExt},
        io::{AsRawFd, FromRawFd},
    },
    path::{Path, PathBuf},
};

use crate::{
    common::{Error, Result},
    cutils::cerr,
    log::{dev_debug, dev_info, user_warn},
    system::{
        can_read_write, chmod, chown, effective_uid, getpid,
        interface::{GroupId, UserId},
        real_gid, real_uid, set_cloexec,
        term::{attach_controlling_terminal, ptsname, TermSize, Terminal},
        utmp, Group,
    },
};

pub use device::{DeviceNotification, PtyIODevice};

mod device;
mod grant;

/// `^C`
const CTRL_C: libc::cc_t = 0x03;
/// `^\`
const CTRL_BACKSLASH: libc::cc_t = 0x1c;
const DEL: libc::cc_t = 0x7f;

/// How new pseudo-terminals are set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtySettings {
    /// The privileged program that changes the owner of a follower device.
    pub helper: PathBuf,
    /// The group that may write to the follower, for `write(1)` and friends.
    pub tty_group: String,
    pub size: TermSize,
    pub xon_xoff: bool,
    pub utf8: bool,
}

impl Default for PtySettings {
    fn default() -> Self {
        Self {
            helper: PathBuf::from(env!("PROCPTY_GRANTPTY_PATH")),
            tty_group: env!("PROCPTY_TTY_GROUP").to_owned(),
            size: TermSize::new(24, 80),
            xon_xoff: false,
            utf8: false,
        }
    }
}

/// A leader/follower pair of terminal devices.
///
/// The descriptors and the follower path are only available while the pair is open. Both
/// descriptors are close-on-exec.
pub struct PseudoTerminal {
    master: Option<File>,
    slave: Option<File>,
    tty_name: Option<CString>,
    size: TermSize,
    xon_xoff: bool,
    utf8: bool,
    logged_in: bool,
    owner_changed: bool,
    settings: PtySettings,
}

impl Default for PseudoTerminal {
    fn default() -> Self {
        Self::new()
    }
}

fn set_flag(flags: &mut libc::tcflag_t, mask: libc::tcflag_t, enable: bool) {
    if enable {
        *flags |= mask;
    } else {
        *flags &= !mask;
    }
}

/// Allocate a pair through the Unix 98 interface.
fn open_unified() -> io::Result<(File, CString)> {
    let fd = cerr(unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY) })?;
    // SAFETY: `posix_openpt` returned a fresh descriptor that nobody else owns.
    let master = unsafe { File::from_raw_fd(fd) };

    cerr(unsafe { libc::grantpt(master.as_raw_fd()) })?;
    cerr(unsafe { libc::unlockpt(master.as_raw_fd()) })?;
    let tty_name = ptsname(&master)?;

    Ok((master, tty_name))
}

/// Find a free pair among the BSD style `/dev/ptyXY` devices.
fn open_legacy() -> io::Result<(File, CString)> {
    for major in b"pqrstuvwxyzabcde" {
        for minor in b"0123456789abcdef" {
            let suffix = [*major, *minor];
            let pty_name = [&b"/dev/pty"[..], &suffix].concat();
            let tty_name = [&b"/dev/tty"[..], &suffix].concat();

            let Ok(master) = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NOCTTY)
                .open(OsStr::from_bytes(&pty_name))
            else {
                continue;
            };

            let Ok(tty_name) = CString::new(tty_name) else {
                continue;
            };

            if !can_read_write(&tty_name) {
                continue;
            }

            // A foreground process group means the pair is still in use.
            if matches!(master.tcgetpgrp(), Ok(pgrp) if pgrp.get() > 0) {
                continue;
            }

            return Ok((master, tty_name));
        }
    }

    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "no free pseudo-terminal",
    ))
}

impl PseudoTerminal {
    pub fn new() -> Self {
        Self::with_settings(PtySettings::default())
    }

    pub fn with_settings(settings: PtySettings) -> Self {
        Self {
            master: None,
            slave: None,
            tty_name: None,
            size: settings.size,
            xon_xoff: settings.xon_xoff,
            utf8: settings.utf8,
            logged_in: false,
            owner_changed: false,
            settings,
        }
    }

    pub fn settings(&self) -> &PtySettings {
        &self.settings
    }

    pub fn is_open(&self) -> bool {
        self.master.is_some()
    }

    /// Allocate a pair and set up its terminal modes. Does nothing if the pair is already open.
    pub fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }

        let (master, tty_name) = match open_unified() {
            Ok(pair) => pair,
            Err(err) => {
                dev_info!("cannot allocate a Unix 98 pseudo-terminal: {err}");
                open_legacy()?
            }
        };

        self.adopt(master, tty_name)
    }

    /// Take over an allocated pair. On failure the pair is closed again, which also reverts any
    /// ownership change.
    fn adopt(&mut self, master: File, tty_name: CString) -> Result<()> {
        self.owner_changed = self.fix_ownership(&master, &tty_name);
        self.master = Some(master);
        self.tty_name = Some(tty_name);

        if let Err(err) = self.open_follower().and_then(|()| self.apply_initial_mode()) {
            self.close();
            return Err(err);
        }

        Ok(())
    }

    fn open_follower(&mut self) -> Result<()> {
        let master = self.master()?;
        let path = self.tty_name().ok_or(Error::PtyNotOpen)?;

        let slave = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(path)
            .map_err(|err| Error::at(path, err))?;

        set_cloexec(master, true)?;
        set_cloexec(&slave, true)?;

        dev_debug!("opened pseudo-terminal {}", path.display());

        self.slave = Some(slave);
        Ok(())
    }

    fn apply_initial_mode(&mut self) -> Result<()> {
        let slave = self.slave()?;
        let mut term = slave.tcgetattr()?;

        set_flag(&mut term.c_iflag, libc::IXON | libc::IXOFF, self.xon_xoff);
        #[cfg(any(target_os = "linux", target_os = "android"))]
        set_flag(&mut term.c_iflag, libc::IUTF8, self.utf8);
        term.c_cc[libc::VINTR] = CTRL_C;
        term.c_cc[libc::VQUIT] = CTRL_BACKSLASH;
        term.c_cc[libc::VERASE] = DEL;

        slave.tcsetattr(&term)?;
        slave.set_size(self.size)?;

        Ok(())
    }

    /// Give the follower to the real user and the tty group if anybody else can access it.
    ///
    /// Returns whether the owner was changed.
    fn fix_ownership(&self, master: &File, tty_name: &CStr) -> bool {
        let path = Path::new(OsStr::from_bytes(tty_name.to_bytes()));
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) => {
                user_warn!("cannot inspect {}: {err}", path.display());
                return false;
            }
        };

        let exposed = (libc::S_IRGRP | libc::S_IXGRP | libc::S_IROTH | libc::S_IWOTH | libc::S_IXOTH)
            as u32;
        if metadata.uid() == real_uid().get() && metadata.mode() & exposed == 0 {
            return false;
        }

        let gid = CString::new(self.settings.tty_group.as_bytes())
            .ok()
            .and_then(|name| Group::from_name(&name).ok().flatten())
            .map_or_else(real_gid, |group| group.gid);

        let res = chown(&tty_name, real_uid(), gid).and_then(|()| chmod(&tty_name, 0o620));
        let changed = match res {
            Ok(()) => true,
            Err(err) if err.raw_os_error() == Some(libc::EPERM) => {
                grant::run_helper(&self.settings.helper, true, master).unwrap_or_else(|err| {
                    dev_info!("cannot run {}: {err}", self.settings.helper.display());
                    false
                })
            }
            Err(err) => {
                dev_info!("cannot change owner of {}: {err}", path.display());
                false
            }
        };

        if !changed {
            user_warn!(
                "cannot change owner of {}, the communication can be eavesdropped",
                path.display()
            );
        }

        changed
    }

    /// Hand the follower back, as it was before [`PseudoTerminal::open`] changed its owner.
    fn revoke_ownership(&self) {
        let (Some(master), Some(tty_name)) = (&self.master, &self.tty_name) else {
            return;
        };

        // Devpts follower devices disappear with the pair.
        if !self.owner_changed || tty_name.to_bytes().starts_with(b"/dev/pts/") {
            return;
        }

        let res = if effective_uid() == UserId::ROOT {
            chown(tty_name, UserId::ROOT, GroupId::ROOT).and_then(|()| chmod(tty_name, 0o666))
        } else {
            match grant::run_helper(&self.settings.helper, false, master) {
                Ok(true) => Ok(()),
                Ok(false) => Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "the helper failed",
                )),
                Err(err) => Err(err),
            }
        };

        if let Err(err) = res {
            dev_info!("cannot revoke ownership of {tty_name:?}: {err}");
        }
    }

    /// Log out, revert ownership of the follower and close both descriptors.
    pub fn close(&mut self) {
        if !self.is_open() {
            return;
        }

        self.logout();
        self.revoke_ownership();

        self.slave = None;
        self.master = None;
        self.tty_name = None;
        self.owner_changed = false;
    }

    /// Close the follower descriptor of this process, leaving the leader open.
    pub fn close_slave(&mut self) {
        self.slave = None;
    }

    pub fn master(&self) -> Result<&File> {
        self.master.as_ref().ok_or(Error::PtyNotOpen)
    }

    pub fn slave(&self) -> Result<&File> {
        self.slave.as_ref().ok_or(Error::PtyNotOpen)
    }

    /// The path of the follower device.
    pub fn tty_name(&self) -> Option<&Path> {
        self.tty_name
            .as_ref()
            .map(|name| Path::new(OsStr::from_bytes(name.to_bytes())))
    }

    /// The terminal whose attributes are changed: the follower, or the leader once the follower
    /// was closed.
    fn terminal(&self) -> Result<&File> {
        self.slave.as_ref().map_or_else(|| self.master(), Ok)
    }

    pub fn tc_get_attr(&self) -> Result<libc::termios> {
        Ok(self.terminal()?.tcgetattr()?)
    }

    pub fn tc_set_attr(&self, term: &libc::termios) -> Result<()> {
        Ok(self.terminal()?.tcsetattr(term)?)
    }

    fn update_iflag(&self, mask: libc::tcflag_t, enable: bool) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }

        let mut term = self.tc_get_attr()?;
        set_flag(&mut term.c_iflag, mask, enable);
        self.tc_set_attr(&term)
    }

    /// Turn software flow control (`^S`/`^Q`) on or off.
    pub fn set_xon_xoff(&mut self, enable: bool) -> Result<()> {
        self.xon_xoff = enable;
        self.update_iflag(libc::IXON | libc::IXOFF, enable)
    }

    /// Tell the line discipline whether input is UTF-8, for correct erasing of characters.
    /// Not supported everywhere; the setting is then only remembered.
    pub fn set_utf8_mode(&mut self, enable: bool) -> Result<()> {
        self.utf8 = enable;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        self.update_iflag(libc::IUTF8, enable)?;
        Ok(())
    }

    pub fn set_echo(&mut self, enable: bool) -> Result<()> {
        let mut term = self.tc_get_attr()?;
        if enable {
            term.c_lflag |= libc::ECHO;
        } else {
            term.c_lflag &= !libc::ECHO;
        }
        self.tc_set_attr(&term)
    }

    /// Set the window size, right away if the pair is open.
    pub fn set_win_size(&mut self, rows: u16, cols: u16) -> Result<()> {
        self.size = TermSize::new(rows, cols);
        if self.is_open() {
            self.terminal()?.set_size(self.size)?;
        }
        Ok(())
    }

    /// The window size of the terminal, or the one it will get once opened.
    pub fn win_size(&self) -> TermSize {
        self.terminal()
            .ok()
            .and_then(|tty| tty.get_size().ok())
            .unwrap_or(self.size)
    }

    /// Make the follower the controlling terminal of the calling process, in a new session with
    /// the caller in the foreground. Meant for a child between fork and exec.
    pub fn set_ctty(&self) -> Result<()> {
        Ok(attach_controlling_terminal(self.slave()?)?)
    }

    /// Record a login session of `user` from `remote_host` on the follower.
    pub fn login(&mut self, user: &str, remote_host: &str) -> Result<()> {
        let tty_name = self.tty_name.as_ref().ok_or(Error::PtyNotOpen)?;
        utmp::login(
            tty_name.to_bytes(),
            user.as_bytes(),
            remote_host.as_bytes(),
            getpid(),
        );
        self.logged_in = true;
        Ok(())
    }

    /// End the login session recorded by [`PseudoTerminal::login`], if any.
    pub fn logout(&mut self) {
        if !self.logged_in {
            return;
        }

        if let Some(tty_name) = &self.tty_name {
            utmp::logout(tty_name.to_bytes());
        }
        self.logged_in = false;
    }
}

impl Drop for PseudoTerminal {
    fn drop(&mut self) {
        self.close();
    }
}
