//! Line oriented, buffered communication with a child process.
use std::collections::VecDeque;

use crate::{
    common::Result,
    event::{EventRegistry, Process},
    log::dev_debug,
    process::{Channel, ChildProcess, Communication, Notification, RunMode},
    system::{signal::consts::SIGKILL, wait::WaitStatus},
};

pub use codec::TextCodec;

mod codec;

/// Something that happened to a [`BufferedChildIO`], drained with
/// [`BufferedChildIO::next_notification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoNotification {
    /// New output can be read with [`BufferedChildIO::readln`].
    ReadReady,
    /// The child terminated.
    Exited(WaitStatus),
}

/// Output received from the child and the position up to which it was consumed.
#[derive(Default)]
struct LineBuffer {
    data: Vec<u8>,
    cursor: usize,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    fn has_unread(&self) -> bool {
        self.cursor < self.data.len()
    }

    fn clear(&mut self) {
        self.data.clear();
        self.cursor = 0;
    }

    /// Take the next complete line without its newline.
    fn next_line(&mut self) -> Option<&[u8]> {
        let unread = &self.data[self.cursor..];
        match unread.iter().position(|&b| b == b'\n') {
            Some(len) => {
                let start = self.cursor;
                self.cursor += len + 1;
                Some(&self.data[start..start + len])
            }
            None => {
                if !self.has_unread() {
                    self.clear();
                }
                None
            }
        }
    }

    /// Take whatever is left after the last complete line.
    fn take_rest(&mut self) -> Option<Vec<u8>> {
        let rest = self.has_unread().then(|| self.data[self.cursor..].to_vec());
        self.clear();
        rest
    }
}

/// What to do with stdin after the queue changed.
#[derive(Debug, PartialEq, Eq)]
enum WriteAction {
    Write(Vec<u8>),
    Close,
    Wait,
}

/// Buffers waiting to be written to stdin. `None` stands for closing stdin.
struct WriteQueue {
    buffers: VecDeque<Option<Vec<u8>>>,
    write_ready: bool,
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self {
            buffers: VecDeque::new(),
            write_ready: true,
        }
    }
}

impl WriteQueue {
    fn push(&mut self, bytes: Vec<u8>) -> WriteAction {
        if self.write_ready {
            self.write_ready = false;
            WriteAction::Write(bytes)
        } else {
            self.buffers.push_back(Some(bytes));
            WriteAction::Wait
        }
    }

    fn close_when_done(&mut self) -> WriteAction {
        if self.write_ready {
            WriteAction::Close
        } else {
            self.buffers.push_back(None);
            WriteAction::Wait
        }
    }

    /// The buffer in flight was fully written.
    fn written(&mut self) -> WriteAction {
        match self.buffers.pop_front() {
            None => {
                self.write_ready = true;
                WriteAction::Wait
            }
            Some(None) => WriteAction::Close,
            Some(Some(bytes)) => WriteAction::Write(bytes),
        }
    }

    /// The buffer in flight was dropped without being written.
    fn abort(&mut self) {
        self.write_ready = true;
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Gate for [`IoNotification::ReadReady`]: one notification until it is acknowledged.
struct ReadSignal {
    enabled: bool,
    pending: bool,
}

impl Default for ReadSignal {
    fn default() -> Self {
        Self {
            enabled: true,
            pending: false,
        }
    }
}

impl ReadSignal {
    /// New data arrived. Returns whether the notification must be delivered now.
    fn fire(&mut self) -> bool {
        if self.enabled {
            self.enabled = false;
            self.pending = false;
            true
        } else {
            self.pending = true;
            false
        }
    }

    fn ack(&mut self, has_unread: bool) -> bool {
        self.enabled = true;
        (self.pending || has_unread) && self.fire()
    }

    fn enable(&mut self, enable: bool) -> bool {
        self.enabled = enable;
        enable && self.pending && self.fire()
    }
}

/// A [`ChildProcess`] talked to through lines of text.
///
/// Writes to stdin are queued and transmitted in order, one at a time. Output is accumulated
/// until it is read line by line with [`BufferedChildIO::readln`].
pub struct BufferedChildIO {
    process: ChildProcess,
    codec: TextCodec,
    lines: LineBuffer,
    writes: WriteQueue,
    read_signal: ReadSignal,
    outbox: VecDeque<IoNotification>,
}

impl BufferedChildIO {
    pub fn new() -> Result<Self> {
        Ok(Self::with_process(ChildProcess::new()?))
    }

    pub fn with_process(process: ChildProcess) -> Self {
        Self {
            process,
            codec: TextCodec::default(),
            lines: LineBuffer::default(),
            writes: WriteQueue::default(),
            read_signal: ReadSignal::default(),
            outbox: VecDeque::new(),
        }
    }

    pub fn process(&self) -> &ChildProcess {
        &self.process
    }

    pub fn process_mut(&mut self) -> &mut ChildProcess {
        &mut self.process
    }

    pub fn set_codec(&mut self, codec: TextCodec) {
        self.codec = codec;
    }

    pub fn codec(&self) -> TextCodec {
        self.codec
    }

    /// Start the child with stdin and stdout enabled, and stderr mixed into the output if
    /// `include_stderr` is set.
    pub fn start<T: Process>(
        &mut self,
        run_mode: RunMode,
        include_stderr: bool,
        registry: &mut EventRegistry<T>,
        tag: impl Fn(Channel) -> T::Event,
    ) -> Result<()> {
        let comm = if include_stderr {
            Communication::ALL
        } else {
            Communication::STDIN | Communication::STDOUT
        };

        if !self.process.is_running() {
            self.writes.clear();
        }
        self.process.start(run_mode, comm, registry, tag)?;
        self.pump(registry)
    }

    /// Queue `bytes` for the stdin of the child. Empty buffers are ignored.
    pub fn write_stdin<T: Process>(
        &mut self,
        bytes: impl Into<Vec<u8>>,
        registry: &mut EventRegistry<T>,
    ) -> Result<()> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Ok(());
        }

        let action = self.writes.push(bytes);
        self.apply(action, registry)
    }

    /// Queue `text` for the stdin of the child, encoded with the current codec.
    pub fn write_stdin_text<T: Process>(
        &mut self,
        text: &str,
        append_newline: bool,
        registry: &mut EventRegistry<T>,
    ) -> Result<()> {
        let mut bytes = self.codec.encode(text);
        if append_newline {
            bytes.push(b'\n');
        }

        self.write_stdin(bytes, registry)
    }

    /// Close stdin once everything queued so far was written.
    pub fn close_when_done<T: Process>(&mut self, registry: &mut EventRegistry<T>) -> Result<()> {
        let action = self.writes.close_when_done();
        self.apply(action, registry)
    }

    fn apply<T: Process>(
        &mut self,
        action: WriteAction,
        registry: &mut EventRegistry<T>,
    ) -> Result<()> {
        match action {
            WriteAction::Write(bytes) => {
                let res = self.process.write_stdin(bytes, registry);
                if res.is_err() {
                    self.writes.abort();
                }
                res
            }
            WriteAction::Close => self.process.close_stdin(registry),
            WriteAction::Wait => Ok(()),
        }
    }

    /// Move what the child reported into this object's buffers and outbox.
    fn pump<T: Process>(&mut self, registry: &mut EventRegistry<T>) -> Result<()> {
        while let Some(notification) = self.process.next_notification() {
            match notification {
                Notification::Stdout(bytes) | Notification::Stderr(bytes) => {
                    self.lines.push(&bytes);
                    self.controlled_emission();
                }
                Notification::StdinWritten => {
                    let action = self.writes.written();
                    self.apply(action, registry)?;
                }
                Notification::Exited(status) => {
                    // A write cut short by the exit never completes.
                    self.writes.clear();
                    self.outbox.push_back(IoNotification::Exited(status));
                }
            }
        }

        Ok(())
    }

    fn controlled_emission(&mut self) {
        if self.read_signal.fire() {
            self.outbox.push_back(IoNotification::ReadReady);
        }
    }

    /// Handle readiness of `channel`, as registered by [`BufferedChildIO::start`].
    pub fn on_event<T: Process>(
        &mut self,
        channel: Channel,
        registry: &mut EventRegistry<T>,
    ) -> Result<()> {
        self.process.on_event(channel, registry);
        self.pump(registry)
    }

    /// Take the oldest notification that was not handled yet.
    pub fn next_notification<T: Process>(
        &mut self,
        registry: &mut EventRegistry<T>,
    ) -> Result<Option<IoNotification>> {
        self.pump(registry)?;
        Ok(self.outbox.pop_front())
    }

    /// Allow the next [`IoNotification::ReadReady`], delivering it right away if output is
    /// waiting.
    pub fn ack_read(&mut self) {
        if self.read_signal.ack(self.lines.has_unread()) {
            self.outbox.push_back(IoNotification::ReadReady);
        }
    }

    pub fn enable_read_signals(&mut self, enable: bool) {
        if self.read_signal.enable(enable) {
            self.outbox.push_back(IoNotification::ReadReady);
        }
    }

    /// Read the next complete line of output, without its newline.
    ///
    /// With `auto_ack`, read notifications are re-armed. Returns `None` if no complete line is
    /// buffered.
    pub fn readln(&mut self, auto_ack: bool) -> Option<String> {
        if auto_ack {
            self.read_signal.enabled = true;
        }

        let codec = self.codec;
        self.lines.next_line().map(|line| codec.decode(line))
    }

    /// Like [`BufferedChildIO::readln`], but when no complete line is left, the remaining bytes
    /// are returned as well. The flag tells whether the text is such a partial line.
    pub fn readln_partial(&mut self, auto_ack: bool) -> Option<(String, bool)> {
        if let Some(line) = self.readln(auto_ack) {
            return Some((line, false));
        }

        self.lines
            .take_rest()
            .map(|rest| (self.codec.decode(&rest), true))
    }

    /// Kill the child if it runs and forget its arguments, queued input and buffered output.
    pub fn reset_all(&mut self) {
        if self.process.is_running() {
            if let Err(err) = self.process.kill(SIGKILL) {
                dev_debug!("cannot kill child on reset: {err}");
            }
        }

        self.process.clear_arguments();
        self.lines.clear();
        self.writes.clear();
        self.read_signal = ReadSignal::default();
        self.outbox.clear();
    }
}
