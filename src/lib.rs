//! Child process and pseudo-terminal management for single threaded, event driven programs.
//!
//! Nothing in this crate owns an event loop. Descriptors are registered on an [`EventRegistry`]
//! and the application hands readiness back to the objects that registered them. Terminated
//! children are reaped by a `SIGCHLD` handler owned by the [`ProcessController`].
pub(crate) mod buffer;
pub(crate) mod common;
pub(crate) mod cutils;
pub mod event;
pub(crate) mod log;
pub mod process;
pub mod procio;
pub mod pty;
pub(crate) mod system;

mod grantpty;

pub use common::{Error, Result};
pub use event::{EventHandle, EventRegistry, PollEvent, Process, StopReason};
pub use grantpty::main as grantpty_main;
pub use crate::log::ProcLogger;
pub use process::{
    Channel, ChildProcess, Communication, Notification, ProcessController, RunMode,
};
pub use procio::{BufferedChildIO, IoNotification, TextCodec};
pub use pty::{DeviceNotification, PseudoTerminal, PtyIODevice, PtySettings};
pub use system::{
    interface::ProcessId,
    signal::{consts as signals, signal_name, SignalNumber},
    term::TermSize,
    wait::WaitStatus,
};
