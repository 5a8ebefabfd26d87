//! A small `poll(2)` based event loop.
//!
//! Everything in this crate that waits for a descriptor does so by registering it on an
//! [`EventRegistry`] and being called back through the application's [`Process::on_event`].
use std::{
    cell::RefCell,
    collections::BTreeMap,
    io,
    os::fd::AsRawFd,
    rc::{Rc, Weak},
    time::Duration,
};

use crate::log::dev_warn;
pub use crate::system::poll::PollEvent;
use crate::system::poll::PollSet;

pub trait Process: Sized {
    /// IO Events that this process should handle.
    type Event: Copy + Eq;
    /// Reason why the event loop should break.
    ///
    /// See [`EventRegistry::set_break`] for more information.
    type Break;
    /// Reason why the event loop should exit.
    ///
    /// See [`EventRegistry::set_exit`] for more information.
    type Exit;
    /// Handle the corresponding event.
    fn on_event(&mut self, event: Self::Event, registry: &mut EventRegistry<Self>);
}

enum Status<T: Process> {
    Continue,
    Stop(StopReason<T>),
}

impl<T: Process> Status<T> {
    fn is_break(&self) -> bool {
        matches!(self, Self::Stop(StopReason::Break(_)))
    }

    fn take_stop(&mut self) -> Option<StopReason<T>> {
        // If the status ends up to be `Continue`, we are replacing it by another `Continue`.
        let status = std::mem::replace(self, Self::Continue);
        match status {
            Status::Continue => None,
            Status::Stop(reason) => Some(reason),
        }
    }
}

pub enum StopReason<T: Process> {
    Break(T::Break),
    Exit(T::Exit),
}

#[derive(PartialEq, Eq, Hash, Ord, PartialOrd, Clone, Copy, Debug)]
struct EventId(usize);

/// A handle to a registered event. Dropping it leaves the event registered.
#[derive(Debug)]
pub struct EventHandle {
    id: EventId,
    should_poll: bool,
    released: Weak<RefCell<Vec<EventId>>>,
}

impl EventHandle {
    /// Ignore the event associated with this handle, meaning that the file descriptor for this
    /// event will not be polled anymore for that specific event.
    pub fn ignore<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        if self.should_poll {
            registry.poll_set.ignore_fd(&self.id);
            self.should_poll = false;
        }
    }

    /// Stop ignoring the event associated with this handle, meaning that the file descriptor for
    /// this event will be polled for that specific event.
    pub fn resume<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        if !self.should_poll {
            registry.poll_set.resume_fd(&self.id);
            self.should_poll = true;
        }
    }

    /// Whether the event is currently being polled.
    pub fn is_active(&self) -> bool {
        self.should_poll
    }

    /// Remove the event from the registry. Must be called before the descriptor is closed.
    pub fn deregister<T: Process>(self, registry: &mut EventRegistry<T>) {
        registry.poll_set.remove_fd(&self.id);
        registry.events.remove(&self.id);
    }

    /// Remove the event from its registry without access to it.
    ///
    /// The event is never dispatched again and is dropped from the poll set before the next
    /// `poll(2)` call, so the descriptor may be closed right away.
    pub fn release(self) {
        if let Some(released) = self.released.upgrade() {
            released.borrow_mut().push(self.id);
        }
    }
}

/// A type able to register file descriptors to be polled.
pub struct EventRegistry<T: Process> {
    seed: usize,
    poll_set: PollSet<EventId>,
    events: BTreeMap<EventId, T::Event>,
    released: Rc<RefCell<Vec<EventId>>>,
    status: Status<T>,
}

impl<T: Process> Default for EventRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Process> EventRegistry<T> {
    /// Create a new and empty registry.
    pub fn new() -> Self {
        Self {
            seed: 0,
            poll_set: PollSet::new(),
            events: BTreeMap::new(),
            released: Rc::default(),
            status: Status::Continue,
        }
    }

    fn next_id(&mut self) -> EventId {
        let id = EventId(self.seed);
        self.seed += 1;
        id
    }

    /// Set the `fd` descriptor to be polled for `poll_event` events and produce `event_fn(poll_event)`
    /// when `fd` is ready.
    pub fn register_event<F: AsRawFd>(
        &mut self,
        fd: &F,
        poll_event: PollEvent,
        event_fn: impl FnOnce(PollEvent) -> T::Event,
    ) -> EventHandle {
        let id = self.next_id();
        self.poll_set.add_fd(id, fd, poll_event);
        self.events.insert(id, event_fn(poll_event));

        EventHandle {
            id,
            should_poll: true,
            released: Rc::downgrade(&self.released),
        }
    }

    fn collect_released(&mut self) {
        for id in self.released.borrow_mut().drain(..) {
            self.poll_set.remove_fd(&id);
            self.events.remove(&id);
        }
    }

    /// Whether no event is currently being polled.
    pub fn is_idle(&mut self) -> bool {
        self.collect_released();
        self.poll_set.is_empty()
    }

    /// Stop the event loop when the current callback is done and set a reason for it.
    ///
    /// This means that the event loop will stop even if other events are ready.
    pub fn set_break(&mut self, reason: T::Break) {
        self.status = Status::Stop(StopReason::Break(reason));
    }

    /// Stop the event loop when the callbacks for the events that are ready by now have been
    /// dispatched and set a reason for it.
    pub fn set_exit(&mut self, reason: T::Exit) {
        self.status = Status::Stop(StopReason::Exit(reason));
    }

    /// Return whether a break reason has been set already. This function will return `false` after
    /// [`EventRegistry::event_loop`] has been called.
    pub fn got_break(&self) -> bool {
        self.status.is_break()
    }

    /// Wait up to `timeout` for ready descriptors and dispatch their events once.
    ///
    /// Returns the stop reason if one was set while dispatching.
    pub fn poll_once(
        &mut self,
        process: &mut T,
        timeout: Option<Duration>,
    ) -> io::Result<Option<StopReason<T>>> {
        self.collect_released();
        let ids = self.poll_set.poll(timeout)?;

        for id in ids {
            // An earlier callback of this round may have ignored, removed or released this event.
            self.collect_released();
            if !self.poll_set.is_active(&id) {
                continue;
            }
            let Some(&event) = self.events.get(&id) else {
                continue;
            };

            process.on_event(event, self);

            if self.status.is_break() {
                break;
            }
        }

        Ok(self.status.take_stop())
    }

    /// Run the event loop for this handler.
    ///
    /// The event loop will continue indefinitely unless you call [`EventRegistry::set_break`] or
    /// [`EventRegistry::set_exit`].
    pub fn event_loop(&mut self, process: &mut T) -> StopReason<T> {
        loop {
            match self.poll_once(process, None) {
                Ok(Some(reason)) => return reason,
                Ok(None) => {}
                Err(err) => {
                    dev_warn!("poll failed: {err}");
                    if let Some(reason) = self.status.take_stop() {
                        return reason;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        os::unix::net::UnixStream,
        time::Duration,
    };

    use super::{EventHandle, EventRegistry, PollEvent, Process, StopReason};

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    enum Event {
        First,
        Second,
    }

    struct Recorder {
        first: UnixStream,
        second: UnixStream,
        seen: Vec<Event>,
        second_handle: Option<EventHandle>,
    }

    impl Process for Recorder {
        type Event = Event;
        type Break = ();
        type Exit = usize;

        fn on_event(&mut self, event: Event, registry: &mut EventRegistry<Self>) {
            self.seen.push(event);
            match event {
                Event::First => {
                    self.first.read_exact(&mut [0; 1]).unwrap();
                    // Stop the other event before it gets dispatched in this round.
                    if let Some(handle) = self.second_handle.take() {
                        handle.deregister(registry);
                    }
                    registry.set_exit(self.seen.len());
                }
                Event::Second => {
                    self.second.read_exact(&mut [0; 1]).unwrap();
                }
            }
        }
    }

    #[test]
    fn deregistered_events_are_not_dispatched() {
        let (first, mut first_tx) = UnixStream::pair().unwrap();
        let (second, mut second_tx) = UnixStream::pair().unwrap();

        let mut registry = EventRegistry::new();
        registry.register_event(&first, PollEvent::Readable, |_| Event::First);
        let second_handle = registry.register_event(&second, PollEvent::Readable, |_| Event::Second);

        let mut recorder = Recorder {
            first,
            second,
            seen: Vec::new(),
            second_handle: Some(second_handle),
        };

        first_tx.write_all(b"1").unwrap();
        second_tx.write_all(b"2").unwrap();

        let Ok(Some(StopReason::Exit(count))) =
            registry.poll_once(&mut recorder, Some(Duration::from_secs(1)))
        else {
            panic!("expected the loop to exit");
        };

        assert_eq!(count, 1);
        assert_eq!(recorder.seen, vec![Event::First]);
    }

    #[test]
    fn ignored_events_can_be_resumed() {
        let (first, mut first_tx) = UnixStream::pair().unwrap();
        let (second, _second_tx) = UnixStream::pair().unwrap();

        let mut registry = EventRegistry::new();
        let mut handle = registry.register_event(&first, PollEvent::Readable, |_| Event::First);
        let mut recorder = Recorder {
            first,
            second,
            seen: Vec::new(),
            second_handle: None,
        };

        first_tx.write_all(b"1").unwrap();
        handle.ignore(&mut registry);
        assert!(!handle.is_active());
        assert!(registry.is_idle());

        let res = registry
            .poll_once(&mut recorder, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(res.is_none());
        assert!(recorder.seen.is_empty());

        handle.resume(&mut registry);
        let reason = registry.event_loop(&mut recorder);
        assert!(matches!(reason, StopReason::Exit(1)));
    }

    #[test]
    fn released_events_are_dropped_before_polling() {
        let (first, mut first_tx) = UnixStream::pair().unwrap();
        let (second, _second_tx) = UnixStream::pair().unwrap();

        let mut registry = EventRegistry::new();
        let handle = registry.register_event(&first, PollEvent::Readable, |_| Event::First);
        let mut recorder = Recorder {
            first,
            second,
            seen: Vec::new(),
            second_handle: None,
        };

        first_tx.write_all(b"1").unwrap();
        handle.release();

        let res = registry
            .poll_once(&mut recorder, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(res.is_none());
        assert!(recorder.seen.is_empty());
        assert!(registry.is_idle());
    }

    #[test]
    fn releasing_after_the_registry_is_gone_does_nothing() {
        let (first, _first_tx) = UnixStream::pair().unwrap();

        let mut registry = EventRegistry::<Recorder>::new();
        let handle = registry.register_event(&first, PollEvent::Readable, |_| Event::First);
        drop(registry);

        handle.release();
    }
}
