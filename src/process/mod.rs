//! Asynchronous management of child processes.
//!
//! A [`ChildProcess`] is started on an [`EventRegistry`] it does not own: the parent side of every
//! enabled channel is registered there, and the application forwards the resulting events back
//! through [`ChildProcess::on_event`]. Terminations are picked up by the [`ProcessController`].
use std::{
    cell::RefCell,
    collections::VecDeque,
    ffi::{OsStr, OsString},
    fmt,
    fs::File,
    io::{self, Read, Write},
    ops::BitOr,
    path::PathBuf,
    rc::Rc,
    time::Duration,
};

use crate::{
    common::{Error, Result},
    event::{EventHandle, EventRegistry, PollEvent, Process},
    log::{dev_debug, dev_warn},
    pty::PseudoTerminal,
    system::{
        fork,
        interface::ProcessId,
        kill, pipe,
        poll::PollSet,
        signal::{consts::*, SignalNumber, SignalSet},
        wait::{Wait, WaitError, WaitOptions, WaitStatus},
        ForkResult,
    },
};

use spawn::{ChildStdio, ExecPlan, LaunchConfig};

mod controller;
mod spawn;

pub use controller::ProcessController;

/// The amount of bytes read from an output channel per readiness notification.
const READ_CHUNK: usize = 1024;

/// How a started child is followed up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// No exit notification, and the child is left alone when its handle is dropped.
    FireAndForget,
    /// [`Notification::Exited`] is queued once the child has been reaped.
    NotifyOnExit,
    /// [`ChildProcess::start`] only returns once the child has exited.
    Blocking,
}

/// One of the standard streams of a child.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    Stdin,
    Stdout,
    Stderr,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::Stdin => "stdin",
            Channel::Stdout => "stdout",
            Channel::Stderr => "stderr",
        })
    }
}

/// The set of channels the parent talks to the child through.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Communication(u8);

impl Communication {
    pub const NONE: Self = Self(0);
    pub const STDIN: Self = Self(1);
    pub const STDOUT: Self = Self(1 << 1);
    pub const STDERR: Self = Self(1 << 2);
    pub const ALL_OUTPUT: Self = Self(Self::STDOUT.0 | Self::STDERR.0);
    pub const ALL: Self = Self(Self::STDIN.0 | Self::ALL_OUTPUT.0);

    /// Whether every channel of `other` is part of this set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether this set shares at least one channel with `other`.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Communication {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Something that happened to a child, drained with [`ChildProcess::next_notification`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The child terminated and was reaped.
    Exited(WaitStatus),
    /// A chunk of the child's standard output.
    Stdout(Vec<u8>),
    /// A chunk of the child's standard error.
    Stderr(Vec<u8>),
    /// The last buffer passed to [`ChildProcess::write_stdin`] was fully transmitted.
    StdinWritten,
}

/// The parent side of a channel.
struct Endpoint {
    file: File,
    handle: Option<EventHandle>,
}

impl Endpoint {
    fn close<T: Process>(self, registry: &mut EventRegistry<T>) {
        if let Some(handle) = self.handle {
            handle.deregister(registry);
        }
    }

    fn release(self) {
        if let Some(handle) = self.handle {
            handle.release();
        }
    }
}

struct PendingWrite {
    bytes: Vec<u8>,
    offset: usize,
}

enum ReadOutcome {
    Data(Vec<u8>),
    Eof,
    Idle,
}

/// The state shared between a [`ChildProcess`] and the [`ProcessController`].
struct ChildCore {
    pid: Option<ProcessId>,
    running: bool,
    status: Option<WaitStatus>,
    run_mode: RunMode,
    stdin: Option<Endpoint>,
    stdout: Option<Endpoint>,
    stderr: Option<Endpoint>,
    pending: Option<PendingWrite>,
    suspended: bool,
    outbox: VecDeque<Notification>,
}

impl ChildCore {
    fn new() -> Self {
        Self {
            pid: None,
            running: false,
            status: None,
            run_mode: RunMode::NotifyOnExit,
            stdin: None,
            stdout: None,
            stderr: None,
            pending: None,
            suspended: false,
            outbox: VecDeque::new(),
        }
    }

    fn endpoint_mut(&mut self, channel: Channel) -> &mut Option<Endpoint> {
        match channel {
            Channel::Stdin => &mut self.stdin,
            Channel::Stdout => &mut self.stdout,
            Channel::Stderr => &mut self.stderr,
        }
    }

    fn close_channel<T: Process>(
        &mut self,
        channel: Channel,
        registry: &mut EventRegistry<T>,
    ) -> Result<()> {
        let endpoint = self
            .endpoint_mut(channel)
            .take()
            .ok_or(Error::ChannelDisabled(channel))?;
        endpoint.close(registry);

        if channel == Channel::Stdin {
            self.pending = None;
        }

        Ok(())
    }

    /// Read one chunk from an output channel, closing it on end of file.
    fn read_output<T: Process>(
        &mut self,
        channel: Channel,
        registry: &mut EventRegistry<T>,
    ) -> ReadOutcome {
        let Some(endpoint) = self.endpoint_mut(channel) else {
            return ReadOutcome::Eof;
        };

        let mut chunk = [0; READ_CHUNK];
        let outcome = match endpoint.file.read(&mut chunk) {
            Ok(0) => ReadOutcome::Eof,
            Ok(n) => ReadOutcome::Data(chunk[..n].to_vec()),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                ReadOutcome::Idle
            }
            // A pseudo-terminal reports a hung up follower as EIO.
            Err(err) if err.raw_os_error() == Some(libc::EIO) => ReadOutcome::Eof,
            Err(err) => {
                dev_warn!("cannot read child {channel}: {err}");
                ReadOutcome::Eof
            }
        };

        match &outcome {
            ReadOutcome::Data(bytes) => self.outbox.push_back(match channel {
                Channel::Stderr => Notification::Stderr(bytes.clone()),
                _ => Notification::Stdout(bytes.clone()),
            }),
            ReadOutcome::Eof => {
                let _ = self.close_channel(channel, registry);
            }
            ReadOutcome::Idle => {}
        }

        outcome
    }

    /// Push the pending stdin write as far as the pipe accepts it.
    fn flush_stdin<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        let Some(endpoint) = &mut self.stdin else {
            return;
        };

        let Some(pending) = &mut self.pending else {
            if let Some(handle) = &mut endpoint.handle {
                handle.ignore(registry);
            }
            return;
        };

        while pending.offset < pending.bytes.len() {
            match endpoint.file.write(&pending.bytes[pending.offset..]) {
                Ok(n) => pending.offset += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    dev_debug!("stdin of the child is gone: {err}");
                    let _ = self.close_channel(Channel::Stdin, registry);
                    return;
                }
            }
        }

        self.pending = None;
        if let Some(handle) = &mut endpoint.handle {
            handle.ignore(registry);
        }
        self.outbox.push_back(Notification::StdinWritten);
    }

    /// Record the termination of the child and release its channels.
    fn process_exit<T: Process>(&mut self, status: WaitStatus, registry: &mut EventRegistry<T>) {
        if !self.running {
            return;
        }

        self.running = false;
        self.status = Some(status);

        for channel in [Channel::Stdout, Channel::Stderr] {
            while let ReadOutcome::Data(_) = self.read_output(channel, registry) {}
        }

        for channel in [Channel::Stdin, Channel::Stdout, Channel::Stderr] {
            if let Some(endpoint) = self.endpoint_mut(channel).take() {
                endpoint.close(registry);
            }
        }
        self.pending = None;

        if self.run_mode != RunMode::FireAndForget {
            self.outbox.push_back(Notification::Exited(status));
        }
    }
}

/// A child process together with its launch configuration.
pub struct ChildProcess {
    core: Rc<RefCell<ChildCore>>,
    controller: Rc<ProcessController>,
    executable: Option<OsString>,
    arguments: Vec<OsString>,
    shell: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
    priority: Option<libc::c_int>,
    pty: Option<PseudoTerminal>,
}

impl ChildProcess {
    /// Create a child that is not started yet, setting up the [`ProcessController`] if needed.
    pub fn new() -> Result<Self> {
        Ok(Self::with_controller(ProcessController::create()?))
    }

    pub fn with_controller(controller: Rc<ProcessController>) -> Self {
        Self {
            core: Rc::new(RefCell::new(ChildCore::new())),
            controller,
            executable: None,
            arguments: Vec::new(),
            shell: None,
            working_dir: None,
            env: Vec::new(),
            priority: None,
            pty: None,
        }
    }

    pub fn controller(&self) -> &Rc<ProcessController> {
        &self.controller
    }

    fn ensure_stopped(&self) -> Result<()> {
        if self.is_running() {
            Err(Error::AlreadyRunning)
        } else {
            Ok(())
        }
    }

    pub fn set_executable(&mut self, executable: impl Into<OsString>) -> Result<()> {
        self.ensure_stopped()?;
        self.executable = Some(executable.into());
        Ok(())
    }

    pub fn executable(&self) -> Option<&OsStr> {
        self.executable.as_deref()
    }

    pub fn arg(&mut self, arg: impl Into<OsString>) -> &mut Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.arguments
    }

    pub fn clear_arguments(&mut self) {
        self.arguments.clear();
    }

    /// Run the executable and its arguments as one command line through `shell -c`.
    ///
    /// Arguments are joined with spaces and not escaped; see [`ChildProcess::quote`].
    pub fn set_shell(&mut self, shell: Option<PathBuf>) -> Result<()> {
        self.ensure_stopped()?;
        self.shell = shell;
        Ok(())
    }

    pub fn set_working_directory(&mut self, dir: impl Into<PathBuf>) -> Result<()> {
        self.ensure_stopped()?;
        self.working_dir = Some(dir.into());
        Ok(())
    }

    /// Override an environment variable for the child. The rest of the environment is inherited.
    pub fn set_env(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) {
        let key = key.into();
        let value = value.into();
        match self.env.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.env.push((key, value)),
        }
    }

    /// Set the nice value of the child, right away if it is running.
    pub fn set_priority(&mut self, priority: libc::c_int) -> Result<()> {
        if let Some(pid) = self.running_pid() {
            crate::cutils::cerr(unsafe {
                libc::setpriority(libc::PRIO_PROCESS, pid.get() as libc::id_t, priority)
            })?;
        }
        self.priority = Some(priority);
        Ok(())
    }

    /// Run the child on `pty` instead of pipes. The pseudo-terminal is opened on start if needed.
    pub fn set_pty(&mut self, pty: Option<PseudoTerminal>) -> Result<()> {
        self.ensure_stopped()?;
        self.pty = pty;
        Ok(())
    }

    pub fn pty(&self) -> Option<&PseudoTerminal> {
        self.pty.as_ref()
    }

    pub fn pty_mut(&mut self) -> Option<&mut PseudoTerminal> {
        self.pty.as_mut()
    }

    /// Quote `arg` for a POSIX shell.
    pub fn quote(arg: &str) -> String {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }

    /// Start the child.
    ///
    /// Output readiness of the enabled channels is registered on `registry` with the events
    /// produced by `tag`; forward them to [`ChildProcess::on_event`]. In [`RunMode::Blocking`]
    /// nothing is registered and this only returns once the child has exited.
    pub fn start<T: Process>(
        &mut self,
        run_mode: RunMode,
        comm: Communication,
        registry: &mut EventRegistry<T>,
        tag: impl Fn(Channel) -> T::Event,
    ) -> Result<()> {
        self.ensure_stopped()?;
        let executable = self.executable.as_deref().ok_or(Error::NoExecutable)?;

        let plan = ExecPlan::new(&LaunchConfig {
            executable,
            arguments: &self.arguments,
            shell: self.shell.as_deref(),
            working_dir: self.working_dir.as_deref(),
            env: &self.env,
            priority: self.priority,
        })?;

        if let Some(pty) = &mut self.pty {
            if !pty.is_open() {
                pty.open()?;
            }
        }

        let channels = Channels::open(comm, self.pty.as_ref())?;

        // The reaper must not see the child before it is registered.
        let original_mask = SignalSet::single(SIGCHLD)?.block()?;
        let pid = match unsafe { fork() } {
            Ok(ForkResult::Child) => spawn::exec_child(&plan, &original_mask, channels.stdio()),
            Ok(ForkResult::Parent(pid)) => pid,
            Err(err) => {
                original_mask.set_mask()?;
                return Err(err.into());
            }
        };

        let res = self.setup_parent(pid, run_mode, channels, registry, &tag);
        if run_mode == RunMode::Blocking {
            let res = res.and_then(|()| self.wait_inline(pid, registry));
            original_mask.set_mask()?;
            return res;
        }
        original_mask.set_mask()?;

        res
    }

    fn setup_parent<T: Process>(
        &mut self,
        pid: ProcessId,
        run_mode: RunMode,
        channels: Channels,
        registry: &mut EventRegistry<T>,
        tag: &impl Fn(Channel) -> T::Event,
    ) -> Result<()> {
        let Channels {
            parent, child_ends, ..
        } = channels;
        // The child owns its ends now.
        drop(child_ends);

        for (_, file) in &parent {
            spawn::prepare_parent_end(file)?;
        }

        let mut core = self.core.borrow_mut();
        core.pid = Some(pid);
        core.running = true;
        core.status = None;
        core.run_mode = run_mode;
        core.pending = None;
        core.suspended = false;

        dev_debug!("started {:?} as {pid}", self.executable);

        for (channel, file) in parent {
            let handle = (run_mode != RunMode::Blocking).then(|| {
                let poll_event = match channel {
                    Channel::Stdin => PollEvent::Writable,
                    _ => PollEvent::Readable,
                };
                let mut handle = registry.register_event(&file, poll_event, |_| tag(channel));
                if channel == Channel::Stdin {
                    // Only polled while a write is pending.
                    handle.ignore(registry);
                }
                handle
            });

            *core.endpoint_mut(channel) = Some(Endpoint { file, handle });
        }

        if run_mode != RunMode::Blocking {
            drop(core);
            self.controller.add_child(pid, &self.core);
        }

        Ok(())
    }

    /// Collect output until the child exits, then run the exit path.
    fn wait_inline<T: Process>(
        &mut self,
        pid: ProcessId,
        registry: &mut EventRegistry<T>,
    ) -> Result<()> {
        let mut core = self.core.borrow_mut();
        // Nobody can write to a blocking child.
        let _ = core.close_channel(Channel::Stdin, registry);

        let status = loop {
            let mut poll_set = PollSet::new();
            for channel in [Channel::Stdout, Channel::Stderr] {
                if let Some(endpoint) = core.endpoint_mut(channel) {
                    poll_set.add_fd(channel, &endpoint.file, PollEvent::Readable);
                }
            }

            if poll_set.is_empty() {
                if let Some(status) = wait_for(pid, WaitOptions::new())? {
                    break status;
                }
                continue;
            }

            for channel in poll_set.poll(Some(Duration::from_millis(100)))? {
                core.read_output(channel, registry);
            }

            if let Some(status) = wait_for(pid, WaitOptions::new().no_hang())? {
                break status;
            }
        };

        core.process_exit(status, registry);
        Ok(())
    }

    fn running_pid(&self) -> Option<ProcessId> {
        let core = self.core.borrow();
        core.pid.filter(|_| core.running)
    }

    /// Send `signal` to the running child.
    pub fn kill(&self, signal: SignalNumber) -> Result<()> {
        let pid = self.running_pid().ok_or(Error::NotRunning)?;
        kill(pid, signal)?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.core.borrow().running
    }

    /// The pid of the child, kept after it exited.
    pub fn pid(&self) -> Option<ProcessId> {
        self.core.borrow().pid
    }

    pub fn exit_status(&self) -> Option<WaitStatus> {
        self.core.borrow().status
    }

    /// Whether the child exited by itself rather than being killed by a signal.
    pub fn normal_exit(&self) -> bool {
        self.exit_status().is_some_and(|status| status.did_exit())
    }

    /// The exit code of the child, or `None` if it did not exit normally.
    pub fn exit_code(&self) -> Option<libc::c_int> {
        self.exit_status().and_then(|status| status.exit_status())
    }

    pub fn signalled(&self) -> bool {
        self.exit_status().is_some_and(|status| status.was_signaled())
    }

    pub fn exit_signal(&self) -> Option<SignalNumber> {
        self.exit_status().and_then(|status| status.term_signal())
    }

    pub fn core_dumped(&self) -> bool {
        self.exit_status().is_some_and(|status| status.core_dumped())
    }

    /// Start transmitting `bytes` to the stdin of the child.
    ///
    /// [`Notification::StdinWritten`] is queued once every byte was written.
    pub fn write_stdin<T: Process>(
        &mut self,
        bytes: impl Into<Vec<u8>>,
        registry: &mut EventRegistry<T>,
    ) -> Result<()> {
        let mut core = self.core.borrow_mut();
        if !core.running {
            return Err(Error::NotRunning);
        }
        if core.pending.is_some() {
            return Err(Error::WritePending);
        }
        let endpoint = core
            .stdin
            .as_mut()
            .ok_or(Error::ChannelDisabled(Channel::Stdin))?;

        if let Some(handle) = &mut endpoint.handle {
            handle.resume(registry);
        }
        core.pending = Some(PendingWrite {
            bytes: bytes.into(),
            offset: 0,
        });

        Ok(())
    }

    /// Close stdin so the child sees end of file. Drops any pending write.
    pub fn close_stdin<T: Process>(&mut self, registry: &mut EventRegistry<T>) -> Result<()> {
        self.core.borrow_mut().close_channel(Channel::Stdin, registry)
    }

    pub fn close_stdout<T: Process>(&mut self, registry: &mut EventRegistry<T>) -> Result<()> {
        self.core
            .borrow_mut()
            .close_channel(Channel::Stdout, registry)
    }

    pub fn close_stderr<T: Process>(&mut self, registry: &mut EventRegistry<T>) -> Result<()> {
        self.core
            .borrow_mut()
            .close_channel(Channel::Stderr, registry)
    }

    /// Stop reading output. The child blocks once the pipes are full.
    pub fn suspend<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        let mut core = self.core.borrow_mut();
        core.suspended = true;
        for channel in [Channel::Stdout, Channel::Stderr] {
            if let Some(handle) = core
                .endpoint_mut(channel)
                .as_mut()
                .and_then(|endpoint| endpoint.handle.as_mut())
            {
                handle.ignore(registry);
            }
        }
    }

    pub fn resume<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        let mut core = self.core.borrow_mut();
        core.suspended = false;
        for channel in [Channel::Stdout, Channel::Stderr] {
            if let Some(handle) = core
                .endpoint_mut(channel)
                .as_mut()
                .and_then(|endpoint| endpoint.handle.as_mut())
            {
                handle.resume(registry);
            }
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.core.borrow().suspended
    }

    /// Forget about the child: its channels are closed, no exit is reported and it is not killed
    /// when this handle is dropped.
    pub fn detach<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        self.controller.remove_child(&self.core);

        let mut core = self.core.borrow_mut();
        if core.running {
            dev_debug!("detached from {:?}", core.pid);
        }
        for channel in [Channel::Stdin, Channel::Stdout, Channel::Stderr] {
            let _ = core.close_channel(channel, registry);
        }
        core.running = false;
        core.pid = None;
    }

    /// Handle readiness of `channel`, as registered by [`ChildProcess::start`].
    pub fn on_event<T: Process>(&mut self, channel: Channel, registry: &mut EventRegistry<T>) {
        let mut core = self.core.borrow_mut();
        match channel {
            Channel::Stdin => core.flush_stdin(registry),
            Channel::Stdout | Channel::Stderr => {
                if !core.suspended {
                    core.read_output(channel, registry);
                }
            }
        }
    }

    /// Take the oldest notification that was not handled yet.
    pub fn next_notification(&mut self) -> Option<Notification> {
        self.core.borrow_mut().outbox.pop_front()
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        let mut core = self.core.borrow_mut();
        if core.running && core.run_mode != RunMode::FireAndForget {
            if let Some(pid) = core.pid {
                if let Err(err) = kill(pid, SIGKILL) {
                    dev_warn!("cannot kill {pid}: {err}");
                }
            }
        }
        // The descriptors close with the core, and their numbers may be reused by the next pipe.
        for channel in [Channel::Stdin, Channel::Stdout, Channel::Stderr] {
            if let Some(endpoint) = core.endpoint_mut(channel).take() {
                endpoint.release();
            }
        }
        drop(core);

        self.controller.remove_child(&self.core);
    }
}

/// Wait for `pid` to terminate. Returns `None` if it has not terminated yet and `options` do not
/// allow to block.
fn wait_for(pid: ProcessId, options: WaitOptions) -> io::Result<Option<WaitStatus>> {
    loop {
        match pid.wait(options) {
            Ok((_, status)) => return Ok(Some(status)),
            Err(WaitError::NotReady) => return Ok(None),
            Err(WaitError::Io(err)) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(WaitError::Io(err)) => return Err(err),
        }
    }
}

/// The descriptors created for one start, before and after the fork.
struct Channels {
    parent: Vec<(Channel, File)>,
    child_ends: Vec<File>,
    child_stdin: Option<usize>,
    child_stdout: Option<usize>,
    child_stderr: Option<usize>,
    pty_slave: Option<File>,
}

impl Channels {
    fn open(comm: Communication, pty: Option<&PseudoTerminal>) -> Result<Self> {
        let mut channels = Channels {
            parent: Vec::new(),
            child_ends: Vec::new(),
            child_stdin: None,
            child_stdout: None,
            child_stderr: None,
            pty_slave: None,
        };

        if let Some(pty) = pty {
            let master = pty.master()?;
            if comm.contains(Communication::STDIN) {
                channels.parent.push((Channel::Stdin, master.try_clone()?));
            }
            // The follower merges both output streams.
            if comm.intersects(Communication::ALL_OUTPUT) {
                channels.parent.push((Channel::Stdout, master.try_clone()?));
            }
            channels.pty_slave = Some(pty.slave()?.try_clone()?);
            return Ok(channels);
        }

        for (flag, channel) in [
            (Communication::STDIN, Channel::Stdin),
            (Communication::STDOUT, Channel::Stdout),
            (Communication::STDERR, Channel::Stderr),
        ] {
            if !comm.contains(flag) {
                continue;
            }

            let (rx, tx) = pipe()?;
            let (parent_end, child_end) = match channel {
                Channel::Stdin => (tx, rx),
                _ => (rx, tx),
            };
            channels.parent.push((channel, File::from(parent_end)));
            channels.child_ends.push(File::from(child_end));

            let index = Some(channels.child_ends.len() - 1);
            match channel {
                Channel::Stdin => channels.child_stdin = index,
                Channel::Stdout => channels.child_stdout = index,
                Channel::Stderr => channels.child_stderr = index,
            }
        }

        Ok(channels)
    }

    fn stdio(&self) -> ChildStdio<'_> {
        match &self.pty_slave {
            Some(slave) => ChildStdio::Pty(slave),
            None => ChildStdio::Pipes {
                stdin: self.child_stdin.map(|i| &self.child_ends[i]),
                stdout: self.child_stdout.map(|i| &self.child_ends[i]),
                stderr: self.child_stderr.map(|i| &self.child_ends[i]),
            },
        }
    }
}
