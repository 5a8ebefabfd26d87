use std::{rc::Rc, time::Duration};

use pretty_assertions::assert_eq;
use procpty::{
    signals::{SIGKILL, SIGTERM},
    Channel, ChildProcess, Communication, Error, EventRegistry, Notification, PollEvent, Process,
    ProcessController, ProcessId, RunMode, WaitStatus,
};

mod common;
use common::{disappears, run_until_exit, serial};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Reaper,
    Child(Channel),
}

struct Host {
    controller: Rc<ProcessController>,
    child: ChildProcess,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    close_after_write: bool,
}

impl Host {
    fn new(controller: Rc<ProcessController>, child: ChildProcess) -> Self {
        Self {
            controller,
            child,
            stdout: Vec::new(),
            stderr: Vec::new(),
            close_after_write: false,
        }
    }
}

impl Process for Host {
    type Event = Event;
    type Break = ();
    type Exit = WaitStatus;

    fn on_event(&mut self, event: Event, registry: &mut EventRegistry<Self>) {
        match event {
            Event::Reaper => {
                self.controller.housekeeping(registry).unwrap();
            }
            Event::Child(channel) => self.child.on_event(channel, registry),
        }

        while let Some(notification) = self.child.next_notification() {
            match notification {
                Notification::Stdout(bytes) => self.stdout.extend(bytes),
                Notification::Stderr(bytes) => self.stderr.extend(bytes),
                Notification::StdinWritten => {
                    if self.close_after_write {
                        self.child.close_stdin(registry).unwrap();
                    }
                }
                Notification::Exited(status) => registry.set_exit(status),
            }
        }
    }
}

fn reaping_registry(controller: &ProcessController) -> EventRegistry<Host> {
    let mut registry = EventRegistry::new();
    controller.register(&mut registry, |_: PollEvent| Event::Reaper);
    registry
}

fn sh(controller: &Rc<ProcessController>, script: &str) -> ChildProcess {
    let mut child = ChildProcess::with_controller(controller.clone());
    child.set_executable("sh").unwrap();
    child.args(["-c", script]);
    child
}

fn drain(child: &mut ChildProcess) -> (Vec<u8>, Vec<u8>, Option<WaitStatus>) {
    let (mut stdout, mut stderr, mut exited) = (Vec::new(), Vec::new(), None);
    while let Some(notification) = child.next_notification() {
        match notification {
            Notification::Stdout(bytes) => stdout.extend(bytes),
            Notification::Stderr(bytes) => stderr.extend(bytes),
            Notification::StdinWritten => {}
            Notification::Exited(status) => exited = Some(status),
        }
    }
    (stdout, stderr, exited)
}

#[test]
fn blocking_run_collects_output_and_status() {
    let _guard = serial();
    let controller = ProcessController::create().unwrap();
    let mut registry = EventRegistry::<Host>::new();

    let mut child = sh(&controller, "echo out; echo err >&2; exit 3");
    child
        .start(
            RunMode::Blocking,
            Communication::ALL_OUTPUT,
            &mut registry,
            Event::Child,
        )
        .unwrap();

    assert!(!child.is_running());
    assert!(child.pid().is_some());
    assert!(child.normal_exit());
    assert_eq!(child.exit_code(), Some(3));
    assert!(registry.is_idle());

    let (stdout, stderr, exited) = drain(&mut child);
    assert_eq!(stdout, b"out\n");
    assert_eq!(stderr, b"err\n");
    assert_eq!(exited.and_then(|status| status.exit_status()), Some(3));
    assert_eq!(controller.pending_children(), 0);
}

#[test]
fn blocking_run_survives_large_output() {
    let _guard = serial();
    let controller = ProcessController::create().unwrap();
    let mut registry = EventRegistry::<Host>::new();

    // More than a pipe buffer, so the child only finishes while its output is read.
    let mut child = sh(&controller, "head -c 200000 /dev/zero");
    child
        .start(
            RunMode::Blocking,
            Communication::STDOUT,
            &mut registry,
            Event::Child,
        )
        .unwrap();

    let (stdout, _, _) = drain(&mut child);
    assert_eq!(stdout.len(), 200000);
    assert_eq!(child.exit_code(), Some(0));
}

#[test]
fn missing_program_exits_with_127() {
    let _guard = serial();
    let controller = ProcessController::create().unwrap();
    let mut registry = EventRegistry::<Host>::new();

    let mut child = ChildProcess::with_controller(controller.clone());
    child.set_executable("/nonexistent/program").unwrap();
    child
        .start(
            RunMode::Blocking,
            Communication::NONE,
            &mut registry,
            Event::Child,
        )
        .unwrap();

    assert_eq!(child.exit_code(), Some(127));
}

#[test]
fn start_needs_an_executable() {
    let _guard = serial();
    let controller = ProcessController::create().unwrap();
    let mut registry = EventRegistry::<Host>::new();

    let mut child = ChildProcess::with_controller(controller);
    let err = child
        .start(
            RunMode::Blocking,
            Communication::NONE,
            &mut registry,
            Event::Child,
        )
        .unwrap_err();
    assert!(matches!(err, Error::NoExecutable));
}

#[test]
fn notify_on_exit_reports_through_the_reaper() {
    let _guard = serial();
    let controller = ProcessController::create().unwrap();
    let mut registry = reaping_registry(&controller);

    let mut child = sh(&controller, "printf hello; exit 5");
    child
        .start(
            RunMode::NotifyOnExit,
            Communication::STDOUT,
            &mut registry,
            Event::Child,
        )
        .unwrap();
    assert!(child.is_running());
    assert_eq!(controller.pending_children(), 1);

    let mut host = Host::new(controller.clone(), child);
    let status = run_until_exit(&mut registry, &mut host);

    assert_eq!(status.exit_status(), Some(5));
    assert_eq!(host.stdout, b"hello");
    assert!(!host.child.is_running());
    assert_eq!(host.child.exit_code(), Some(5));
    assert!(host.child.pid().is_some());
    assert_eq!(controller.pending_children(), 0);
}

#[test]
fn a_running_child_cannot_be_started_again() {
    let _guard = serial();
    let controller = ProcessController::create().unwrap();
    let mut registry = reaping_registry(&controller);

    let mut child = sh(&controller, "sleep 30");
    child
        .start(
            RunMode::NotifyOnExit,
            Communication::NONE,
            &mut registry,
            Event::Child,
        )
        .unwrap();

    let err = child
        .start(
            RunMode::NotifyOnExit,
            Communication::NONE,
            &mut registry,
            Event::Child,
        )
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyRunning));
    assert!(matches!(
        child.set_executable("true").unwrap_err(),
        Error::AlreadyRunning
    ));
}

#[test]
fn killed_child_reports_the_signal() {
    let _guard = serial();
    let controller = ProcessController::create().unwrap();
    let mut registry = reaping_registry(&controller);

    let mut child = sh(&controller, "exec sleep 30");
    child
        .start(
            RunMode::NotifyOnExit,
            Communication::NONE,
            &mut registry,
            Event::Child,
        )
        .unwrap();
    child.kill(SIGTERM).unwrap();

    let mut host = Host::new(controller.clone(), child);
    let status = run_until_exit(&mut registry, &mut host);

    assert_eq!(status.term_signal(), Some(SIGTERM));
    assert!(host.child.signalled());
    assert!(!host.child.normal_exit());
    assert_eq!(host.child.exit_code(), None);
    assert_eq!(host.child.exit_signal(), Some(SIGTERM));
    assert!(matches!(
        host.child.kill(SIGTERM).unwrap_err(),
        Error::NotRunning
    ));
}

#[test]
fn dropping_a_running_child_kills_it() {
    let _guard = serial();
    let controller = ProcessController::create().unwrap();
    let mut registry = reaping_registry(&controller);

    let mut child = sh(&controller, "exec sleep 30");
    child
        .start(
            RunMode::NotifyOnExit,
            Communication::NONE,
            &mut registry,
            Event::Child,
        )
        .unwrap();
    let pid = child.pid().unwrap().get();

    drop(child);
    assert_eq!(controller.pending_children(), 0);
    assert!(disappears(pid));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tagged {
    Dropped,
    Live,
}

#[derive(Default)]
struct Tally {
    dropped: usize,
    live: usize,
}

impl Process for Tally {
    type Event = Tagged;
    type Break = ();
    type Exit = ();

    fn on_event(&mut self, event: Tagged, _: &mut EventRegistry<Self>) {
        match event {
            Tagged::Dropped => self.dropped += 1,
            Tagged::Live => self.live += 1,
        }
    }
}

#[test]
fn dropped_child_stops_dispatching() {
    let _guard = serial();
    let controller = ProcessController::create().unwrap();
    let mut registry = EventRegistry::<Tally>::new();

    let mut dropped = sh(&controller, "exec sleep 30");
    dropped
        .start(
            RunMode::NotifyOnExit,
            Communication::STDOUT,
            &mut registry,
            |_| Tagged::Dropped,
        )
        .unwrap();
    drop(dropped);

    // The new stdout pipe is likely to reuse the descriptor number of the dropped one, and it is
    // never drained, so it stays readable.
    let mut live = sh(&controller, "echo ready; exec sleep 30");
    live.start(
        RunMode::NotifyOnExit,
        Communication::STDOUT,
        &mut registry,
        |_| Tagged::Live,
    )
    .unwrap();

    let mut tally = Tally::default();
    for _ in 0..5 {
        registry
            .poll_once(&mut tally, Some(Duration::from_secs(2)))
            .unwrap();
    }

    assert_eq!(tally.dropped, 0);
    assert!(tally.live > 0);
}

#[test]
fn restart_after_exit() {
    let _guard = serial();
    let controller = ProcessController::create().unwrap();
    let mut registry = reaping_registry(&controller);

    let mut child = sh(&controller, "printf one; exit 1");
    child
        .start(
            RunMode::NotifyOnExit,
            Communication::STDOUT,
            &mut registry,
            Event::Child,
        )
        .unwrap();
    let first_pid = child.pid().unwrap();

    let mut host = Host::new(controller.clone(), child);
    let status = run_until_exit(&mut registry, &mut host);
    assert_eq!(status.exit_status(), Some(1));
    assert_eq!(host.stdout, b"one");

    host.child.clear_arguments();
    host.child.args(["-c", "printf two; exit 2"]);
    host.child
        .start(
            RunMode::NotifyOnExit,
            Communication::STDOUT,
            &mut registry,
            Event::Child,
        )
        .unwrap();
    assert!(host.child.is_running());
    assert_eq!(host.child.exit_code(), None);
    assert_ne!(host.child.pid(), Some(first_pid));

    host.stdout.clear();
    let status = run_until_exit(&mut registry, &mut host);
    assert_eq!(status.exit_status(), Some(2));
    assert_eq!(host.stdout, b"two");
    assert_eq!(host.child.exit_code(), Some(2));
    assert_eq!(controller.pending_children(), 0);
}

#[test]
fn reaped_unknown_pid_is_ignored() {
    let _guard = serial();
    let controller = ProcessController::create().unwrap();
    let mut registry = reaping_registry(&controller);

    let mut child = sh(&controller, "exec sleep 30");
    child
        .start(
            RunMode::NotifyOnExit,
            Communication::NONE,
            &mut registry,
            Event::Child,
        )
        .unwrap();
    let pid = child.pid().unwrap();

    // Larger than any pid the kernel hands out.
    controller.notify_on_exit(
        ProcessId::new(libc::pid_t::MAX),
        WaitStatus::from_raw(0),
        &mut registry,
    );
    assert_eq!(controller.pending_children(), 1);
    assert!(child.is_running());
    assert!(child.next_notification().is_none());

    controller.notify_on_exit(pid, WaitStatus::from_raw(4 << 8), &mut registry);
    assert_eq!(controller.pending_children(), 0);
    assert!(!child.is_running());
    assert_eq!(child.exit_code(), Some(4));
    let (_, _, exited) = drain(&mut child);
    assert_eq!(exited.and_then(|status| status.exit_status()), Some(4));

    unsafe { libc::kill(pid.get(), SIGKILL) };
    assert!(disappears(pid.get()));
}

#[test]
fn detached_child_keeps_running() {
    let _guard = serial();
    let controller = ProcessController::create().unwrap();
    let mut registry = reaping_registry(&controller);

    let mut child = sh(&controller, "exec sleep 30");
    child
        .start(
            RunMode::NotifyOnExit,
            Communication::STDOUT,
            &mut registry,
            Event::Child,
        )
        .unwrap();
    let pid = child.pid().unwrap().get();

    child.detach(&mut registry);
    assert!(!child.is_running());
    assert_eq!(child.pid(), None);
    assert_eq!(controller.pending_children(), 0);

    drop(child);
    assert_eq!(unsafe { libc::kill(pid, 0) }, 0);

    unsafe { libc::kill(pid, SIGKILL) };
    assert!(disappears(pid));
}

#[test]
fn stdin_is_delivered_before_close() {
    let _guard = serial();
    let controller = ProcessController::create().unwrap();
    let mut registry = reaping_registry(&controller);

    let mut child = ChildProcess::with_controller(controller.clone());
    child.set_executable("cat").unwrap();
    child
        .start(
            RunMode::NotifyOnExit,
            Communication::STDIN | Communication::STDOUT,
            &mut registry,
            Event::Child,
        )
        .unwrap();

    let input: Vec<u8> = (0..100_000u32).map(|i| b'a' + (i % 26) as u8).collect();
    child.write_stdin(input.clone(), &mut registry).unwrap();
    assert!(matches!(
        child.write_stdin(b"more".to_vec(), &mut registry).unwrap_err(),
        Error::WritePending
    ));

    let mut host = Host::new(controller.clone(), child);
    host.close_after_write = true;
    let status = run_until_exit(&mut registry, &mut host);

    assert_eq!(status.exit_status(), Some(0));
    assert_eq!(host.stdout, input);
    assert!(matches!(
        host.child.write_stdin(b"late".to_vec(), &mut registry).unwrap_err(),
        Error::NotRunning
    ));
}

#[test]
fn disabled_channels_refuse_io() {
    let _guard = serial();
    let controller = ProcessController::create().unwrap();
    let mut registry = reaping_registry(&controller);

    let mut child = sh(&controller, "exec sleep 30");
    child
        .start(
            RunMode::NotifyOnExit,
            Communication::STDOUT,
            &mut registry,
            Event::Child,
        )
        .unwrap();

    assert!(matches!(
        child.write_stdin(b"x".to_vec(), &mut registry).unwrap_err(),
        Error::ChannelDisabled(Channel::Stdin)
    ));
    assert!(matches!(
        child.close_stderr(&mut registry).unwrap_err(),
        Error::ChannelDisabled(Channel::Stderr)
    ));
    child.close_stdout(&mut registry).unwrap();
    assert!(matches!(
        child.close_stdout(&mut registry).unwrap_err(),
        Error::ChannelDisabled(Channel::Stdout)
    ));
}

#[test]
fn environment_and_working_directory_are_applied() {
    let _guard = serial();
    let controller = ProcessController::create().unwrap();
    let mut registry = EventRegistry::<Host>::new();

    let mut child = sh(&controller, "pwd; echo \"$PROCPTY_TEST_VALUE\"");
    child.set_working_directory("/").unwrap();
    child.set_env("PROCPTY_TEST_VALUE", "forty two");
    child
        .start(
            RunMode::Blocking,
            Communication::STDOUT,
            &mut registry,
            Event::Child,
        )
        .unwrap();

    let (stdout, _, _) = drain(&mut child);
    assert_eq!(stdout, b"/\nforty two\n");
}

#[test]
fn shell_mode_joins_quoted_arguments() {
    let _guard = serial();
    let controller = ProcessController::create().unwrap();
    let mut registry = EventRegistry::<Host>::new();

    let mut child = ChildProcess::with_controller(controller.clone());
    child.set_shell(Some("/bin/sh".into())).unwrap();
    child.set_executable("echo").unwrap();
    child.arg(ChildProcess::quote("it's a b"));
    child
        .start(
            RunMode::Blocking,
            Communication::STDOUT,
            &mut registry,
            Event::Child,
        )
        .unwrap();

    let (stdout, _, _) = drain(&mut child);
    assert_eq!(stdout, b"it's a b\n");
}

#[test]
fn suspended_output_is_read_after_resume() {
    let _guard = serial();
    let controller = ProcessController::create().unwrap();
    let mut registry = reaping_registry(&controller);

    let mut child = sh(&controller, "echo suspended");
    child
        .start(
            RunMode::NotifyOnExit,
            Communication::STDOUT,
            &mut registry,
            Event::Child,
        )
        .unwrap();
    child.suspend(&mut registry);
    assert!(child.is_suspended());
    child.resume(&mut registry);
    assert!(!child.is_suspended());

    let mut host = Host::new(controller.clone(), child);
    run_until_exit(&mut registry, &mut host);
    assert_eq!(host.stdout, b"suspended\n");
}

#[test]
fn controller_is_shared_while_in_use() {
    let _guard = serial();
    let controller = ProcessController::create().unwrap();

    let again = ProcessController::create().unwrap();
    assert!(Rc::ptr_eq(&controller, &again));
    assert!(!ProcessController::destroy(again));

    assert!(ProcessController::destroy(controller));
}
