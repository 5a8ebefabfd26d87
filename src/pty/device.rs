use std::{
    collections::VecDeque,
    io::{self, Read},
};

use crate::{
    buffer::ByteQueue,
    common::{Error, Result},
    event::{EventHandle, EventRegistry, PollEvent, Process},
    log::dev_warn,
    system::set_nonblocking,
};

use super::PseudoTerminal;

/// Something that happened to a [`PtyIODevice`], drained with [`PtyIODevice::next_notification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceNotification {
    /// New data can be read.
    ReadyRead,
    /// This many bytes were written to the leader.
    BytesWritten(usize),
    /// Nothing more will be read: the follower side was hung up.
    ReadChannelFinished,
}

/// A buffered byte stream over the leader side of a [`PseudoTerminal`].
///
/// Register it on an [`EventRegistry`] with [`PtyIODevice::open`] and forward the events to
/// [`PtyIODevice::on_event`]. Reads are served from the buffer, writes are queued and flushed
/// when the leader is writable.
pub struct PtyIODevice {
    pty: PseudoTerminal,
    read_buffer: ByteQueue,
    write_buffer: ByteQueue,
    read_handle: Option<EventHandle>,
    write_handle: Option<EventHandle>,
    suspended: bool,
    finished: bool,
    outbox: VecDeque<DeviceNotification>,
}

impl PtyIODevice {
    pub fn new(pty: PseudoTerminal) -> Self {
        Self {
            pty,
            read_buffer: ByteQueue::new(),
            write_buffer: ByteQueue::new(),
            read_handle: None,
            write_handle: None,
            suspended: false,
            finished: false,
            outbox: VecDeque::new(),
        }
    }

    pub fn pty(&self) -> &PseudoTerminal {
        &self.pty
    }

    pub fn pty_mut(&mut self) -> &mut PseudoTerminal {
        &mut self.pty
    }

    pub fn is_open(&self) -> bool {
        self.read_handle.is_some()
    }

    /// Open the pseudo-terminal if needed and start watching its leader.
    pub fn open<T: Process>(
        &mut self,
        registry: &mut EventRegistry<T>,
        tag: impl Fn(PollEvent) -> T::Event,
    ) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }

        self.pty.open()?;
        let master = self.pty.master()?;
        set_nonblocking(master)?;

        let mut read_handle = registry.register_event(master, PollEvent::Readable, &tag);
        if self.suspended {
            read_handle.ignore(registry);
        }
        let mut write_handle = registry.register_event(master, PollEvent::Writable, &tag);
        write_handle.ignore(registry);

        self.read_handle = Some(read_handle);
        self.write_handle = Some(write_handle);
        self.finished = false;

        Ok(())
    }

    /// Stop watching the leader, drop buffered data and close the pseudo-terminal.
    pub fn close<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        for handle in [self.read_handle.take(), self.write_handle.take()]
            .into_iter()
            .flatten()
        {
            handle.deregister(registry);
        }

        self.read_buffer.clear();
        self.write_buffer.clear();
        self.pty.close();
    }

    /// Handle readiness of the leader, as registered by [`PtyIODevice::open`].
    pub fn on_event<T: Process>(&mut self, event: PollEvent, registry: &mut EventRegistry<T>) {
        match event {
            PollEvent::Readable => self.fill(registry),
            PollEvent::Writable => self.flush(registry),
        }
    }

    fn fill<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        if self.suspended || self.finished {
            return;
        }
        let Ok(mut master) = self.pty.master() else {
            return;
        };

        match self.read_buffer.insert(&mut master) {
            Ok(0) => self.finish(registry),
            Ok(_) => self.outbox.push_back(DeviceNotification::ReadyRead),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            // The follower was closed by everyone.
            Err(err) if err.raw_os_error() == Some(libc::EIO) => self.finish(registry),
            Err(err) => {
                dev_warn!("cannot read from pseudo-terminal: {err}");
                self.finish(registry);
            }
        }
    }

    fn finish<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        self.finished = true;
        if let Some(handle) = &mut self.read_handle {
            handle.ignore(registry);
        }
        self.outbox
            .push_back(DeviceNotification::ReadChannelFinished);
    }

    fn flush<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        let Ok(mut master) = self.pty.master() else {
            return;
        };

        match self.write_buffer.remove(&mut master) {
            Ok(written) => self
                .outbox
                .push_back(DeviceNotification::BytesWritten(written)),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return
            }
            Err(err) => {
                dev_warn!("cannot write to pseudo-terminal: {err}");
                self.write_buffer.clear();
            }
        }

        if self.write_buffer.is_empty() {
            if let Some(handle) = &mut self.write_handle {
                handle.ignore(registry);
            }
        }
    }

    /// Queue `bytes` for the leader. Returns the amount of bytes queued.
    pub fn write<T: Process>(
        &mut self,
        bytes: &[u8],
        registry: &mut EventRegistry<T>,
    ) -> Result<usize> {
        let handle = self.write_handle.as_mut().ok_or(Error::PtyNotOpen)?;
        if !bytes.is_empty() {
            self.write_buffer.extend(bytes);
            handle.resume(registry);
        }

        Ok(bytes.len())
    }

    /// Move buffered bytes into `buf`. Returns the amount of bytes moved.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        self.read_buffer.read(buf)
    }

    /// Take the next line from the buffer, newline included. Without a complete line, everything
    /// that is buffered is taken.
    pub fn read_line(&mut self) -> Vec<u8> {
        self.read_buffer.read_line()
    }

    pub fn can_read_line(&self) -> bool {
        self.read_buffer.index_after(b'\n').is_some()
    }

    pub fn bytes_available(&self) -> usize {
        self.read_buffer.len()
    }

    pub fn bytes_to_write(&self) -> usize {
        self.write_buffer.len()
    }

    /// Stop or restart reading from the leader, leaving the data in the terminal.
    pub fn set_suspended<T: Process>(&mut self, suspended: bool, registry: &mut EventRegistry<T>) {
        self.suspended = suspended;
        if let Some(handle) = &mut self.read_handle {
            if suspended || self.finished {
                handle.ignore(registry);
            } else {
                handle.resume(registry);
            }
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Whether the follower side was hung up.
    pub fn at_end(&self) -> bool {
        self.finished && self.read_buffer.is_empty()
    }

    /// Take the oldest notification that was not handled yet.
    pub fn next_notification(&mut self) -> Option<DeviceNotification> {
        self.outbox.pop_front()
    }
}

impl Read for PtyIODevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.read_buffer.is_empty() && !self.finished && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        Ok(PtyIODevice::read(self, buf))
    }
}

impl Drop for PtyIODevice {
    fn drop(&mut self) {
        for handle in [self.read_handle.take(), self.write_handle.take()]
            .into_iter()
            .flatten()
        {
            handle.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        time::Duration,
    };

    use pretty_assertions::assert_eq;

    use super::{DeviceNotification, PtyIODevice};
    use crate::{
        event::{EventRegistry, PollEvent, Process},
        pty::PseudoTerminal,
    };

    struct Host {
        device: PtyIODevice,
    }

    impl Process for Host {
        type Event = PollEvent;
        type Break = ();
        type Exit = ();

        fn on_event(&mut self, event: PollEvent, registry: &mut EventRegistry<Self>) {
            self.device.on_event(event, registry);
            if self.device.next_notification().is_some() {
                registry.set_exit(());
            }
        }
    }

    fn raw_pty() -> PseudoTerminal {
        let mut pty = PseudoTerminal::new();
        pty.open().unwrap();
        let mut term = pty.tc_get_attr().unwrap();
        unsafe { libc::cfmakeraw(&mut term) };
        pty.tc_set_attr(&term).unwrap();
        pty
    }

    #[test]
    fn follower_data_is_buffered() {
        let mut registry = EventRegistry::<Host>::new();
        let mut host = Host {
            device: PtyIODevice::new(raw_pty()),
        };
        host.device.open(&mut registry, |event| event).unwrap();

        let mut slave = host.device.pty().slave().unwrap().try_clone().unwrap();
        slave.write_all(b"first\nsecond").unwrap();

        while host.device.bytes_available() < 12 {
            registry
                .poll_once(&mut host, Some(Duration::from_secs(5)))
                .unwrap();
        }

        assert!(host.device.can_read_line());
        assert_eq!(host.device.read_line(), b"first\n");
        assert!(!host.device.can_read_line());
        assert_eq!(host.device.read_line(), b"second");

        let mut buf = [0; 4];
        let err = Read::read(&mut host.device, &mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn writes_are_flushed_when_writable() {
        let mut registry = EventRegistry::<Host>::new();
        let mut host = Host {
            device: PtyIODevice::new(raw_pty()),
        };
        host.device.open(&mut registry, |event| event).unwrap();

        assert_eq!(host.device.write(b"ping", &mut registry).unwrap(), 4);
        assert_eq!(host.device.bytes_to_write(), 4);

        while host.device.bytes_to_write() > 0 {
            registry
                .poll_once(&mut host, Some(Duration::from_secs(5)))
                .unwrap();
        }

        let mut slave = host.device.pty().slave().unwrap();
        let mut buf = [0; 4];
        slave.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn writing_needs_an_open_device() {
        let mut registry = EventRegistry::<Host>::new();
        let mut device = PtyIODevice::new(PseudoTerminal::new());
        assert!(device.write(b"x", &mut registry).is_err());
    }

    #[test]
    fn suspended_device_does_not_read() {
        let mut registry = EventRegistry::<Host>::new();
        let mut host = Host {
            device: PtyIODevice::new(raw_pty()),
        };
        host.device.open(&mut registry, |event| event).unwrap();
        host.device.set_suspended(true, &mut registry);
        assert!(registry.is_idle());

        host.device.pty().slave().unwrap().write_all(b"x").unwrap();
        host.device.set_suspended(false, &mut registry);
        registry
            .poll_once(&mut host, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(host.device.bytes_available(), 1);
        assert_eq!(
            host.device.next_notification(),
            None,
            "the notification was consumed by the host"
        );
    }
}
