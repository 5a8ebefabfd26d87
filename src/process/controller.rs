use std::{
    cell::RefCell,
    io,
    rc::{Rc, Weak},
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    common::{Error, Result},
    event::{EventHandle, EventRegistry, PollEvent, Process},
    log::{dev_debug, dev_info, dev_warn},
    system::{
        interface::ProcessId,
        signal::{consts::*, ExitRecordPipe, SignalHandler, SignalHandlerBehavior},
        wait::WaitStatus,
    },
};

use super::ChildCore;

thread_local! {
    static CONTROLLER: RefCell<Weak<ProcessController>> = const { RefCell::new(Weak::new()) };
}

/// Set while some thread owns a controller; the SIGCHLD disposition is process-wide.
static IN_USE: AtomicBool = AtomicBool::new(false);

/// The process-wide child reaper and the table of children waiting for their exit.
///
/// A single instance exists at a time. [`ProcessController::create`] hands out the live one, or
/// sets one up on first use; every [`super::ChildProcess`] keeps it alive.
pub struct ProcessController {
    children: RefCell<Vec<(ProcessId, Weak<RefCell<ChildCore>>)>>,
    // Field order is teardown order: handlers are restored before the pipe is closed.
    _sigchld: SignalHandler,
    _sigpipe: SignalHandler,
    pipe: ExitRecordPipe,
}

impl ProcessController {
    /// Get the live controller of this thread, creating and installing it if there is none.
    pub fn create() -> Result<Rc<Self>> {
        CONTROLLER.with(|current| {
            if let Some(controller) = current.borrow().upgrade() {
                return Ok(controller);
            }

            if IN_USE.swap(true, Ordering::SeqCst) {
                return Err(Error::Io(
                    None,
                    io::Error::new(
                        io::ErrorKind::Other,
                        "the child reaper is already owned by another thread",
                    ),
                ));
            }

            let controller = match Self::install() {
                Ok(controller) => Rc::new(controller),
                Err(err) => {
                    IN_USE.store(false, Ordering::SeqCst);
                    return Err(err.into());
                }
            };

            *current.borrow_mut() = Rc::downgrade(&controller);
            Ok(controller)
        })
    }

    fn install() -> io::Result<Self> {
        // The pipe must exist before the handler can fire.
        let pipe = ExitRecordPipe::new()?;
        let sigchld = SignalHandler::register(SIGCHLD, SignalHandlerBehavior::ReapChildren)?;
        let sigpipe = SignalHandler::register(SIGPIPE, SignalHandlerBehavior::Ignore)?;

        dev_info!("child reaper installed");

        Ok(Self {
            children: RefCell::new(Vec::new()),
            _sigchld: sigchld,
            _sigpipe: sigpipe,
            pipe,
        })
    }

    /// Tear the controller down if `this` is the last reference to it.
    ///
    /// Returns `false` if children still hold it; it is then torn down when the last of them is
    /// dropped.
    pub fn destroy(this: Rc<Self>) -> bool {
        Rc::try_unwrap(this).map(drop).is_ok()
    }

    /// Watch the reaper pipe on `registry`, producing `event_fn(..)` whenever a child was reaped.
    /// Call [`ProcessController::housekeeping`] from that event.
    pub fn register<T: Process>(
        &self,
        registry: &mut EventRegistry<T>,
        event_fn: impl FnOnce(PollEvent) -> T::Event,
    ) -> EventHandle {
        registry.register_event(&self.pipe, PollEvent::Readable, event_fn)
    }

    /// Consume one reaped child and run the exit handling of its owner.
    ///
    /// Returns the pid of the reaped child, if a record was available.
    pub fn housekeeping<T: Process>(
        &self,
        registry: &mut EventRegistry<T>,
    ) -> Result<Option<ProcessId>> {
        let Some(record) = self.pipe.recv()? else {
            return Ok(None);
        };

        self.notify_on_exit(record.pid, record.status, registry);

        Ok(Some(record.pid))
    }

    /// Deliver the exit of `pid` to every registered child with that pid.
    pub fn notify_on_exit<T: Process>(
        &self,
        pid: ProcessId,
        status: WaitStatus,
        registry: &mut EventRegistry<T>,
    ) {
        let matches: Vec<_> = {
            let mut children = self.children.borrow_mut();
            let mut matches = Vec::new();
            children.retain(|(child_pid, core)| {
                if *child_pid == pid {
                    matches.push(core.clone());
                    false
                } else {
                    true
                }
            });
            matches
        };

        if matches.is_empty() {
            dev_debug!("reaped {pid} ({status:?}) which nobody waits for");
        } else if matches.len() > 1 {
            dev_warn!("{} children are registered with pid {pid}", matches.len());
        }

        for core in matches.iter().filter_map(Weak::upgrade) {
            core.borrow_mut().process_exit(status, registry);
        }
    }

    pub(super) fn add_child(&self, pid: ProcessId, core: &Rc<RefCell<ChildCore>>) {
        let mut children = self.children.borrow_mut();
        children.retain(|(_, core)| core.strong_count() > 0);
        children.push((pid, Rc::downgrade(core)));
    }

    pub(super) fn remove_child(&self, core: &Rc<RefCell<ChildCore>>) {
        let core = Rc::downgrade(core);
        self.children
            .borrow_mut()
            .retain(|(_, registered)| !registered.ptr_eq(&core));
    }

    /// The number of children waiting for their exit notification.
    pub fn pending_children(&self) -> usize {
        self.children.borrow().len()
    }
}

impl Drop for ProcessController {
    fn drop(&mut self) {
        // Make the handler stop writing before anything is released.
        self.pipe.unpublish();
        IN_USE.store(false, Ordering::SeqCst);
        dev_info!("child reaper removed");
    }
}
