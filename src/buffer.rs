use std::{
    collections::VecDeque,
    io::{self, IoSlice, Read, Write},
};

/// A growable FIFO of bytes used to stage data between a descriptor and its consumer.
pub(crate) struct ByteQueue {
    storage: VecDeque<u8>,
}

impl ByteQueue {
    /// The amount of bytes read from a descriptor in one go.
    pub(crate) const CHUNK: usize = 4 * 1024;

    /// Create a new, empty queue.
    pub(crate) fn new() -> Self {
        Self {
            storage: VecDeque::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.storage.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.storage.clear()
    }

    /// Append `bytes` at the back of the queue.
    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.storage.extend(bytes)
    }

    /// Read at most [`ByteQueue::CHUNK`] bytes from `read` into the back of the queue.
    ///
    /// Returns the number of bytes inserted; zero means end of file.
    pub(crate) fn insert<R: Read>(&mut self, read: &mut R) -> io::Result<usize> {
        let mut chunk = [0; Self::CHUNK];
        let inserted_len = read.read(&mut chunk)?;
        self.storage.extend(&chunk[..inserted_len]);

        Ok(inserted_len)
    }

    /// Write as much as `write` accepts from the front of the queue and drop what was written.
    // rustc 1.77.1 clippy gives false diagnostics, https://github.com/rust-lang/rust-clippy/issues/12519
    #[allow(clippy::unused_io_amount)]
    pub(crate) fn remove<W: Write>(&mut self, write: &mut W) -> io::Result<usize> {
        let (first_slice, second_slice) = self.storage.as_slices();
        let removed_len = if second_slice.is_empty() {
            // The filled section is contiguous.
            write.write(first_slice)?
        } else {
            // The filled section wraps around the storage.
            write.write_vectored(&[first_slice, second_slice].map(IoSlice::new))?
        };

        self.storage.drain(..removed_len);

        Ok(removed_len)
    }

    /// Move up to `buf.len()` bytes from the front of the queue into `buf`.
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> usize {
        let len = buf.len().min(self.storage.len());
        for (dst, src) in buf.iter_mut().zip(self.storage.drain(..len)) {
            *dst = src;
        }
        len
    }

    /// The number of bytes up to and including the first `byte`, if `byte` is queued.
    pub(crate) fn index_after(&self, byte: u8) -> Option<usize> {
        self.storage.iter().position(|&b| b == byte).map(|i| i + 1)
    }

    /// Remove and return the next line, newline included. Without a complete line, everything
    /// that is queued is returned.
    pub(crate) fn read_line(&mut self) -> Vec<u8> {
        let len = self.index_after(b'\n').unwrap_or(self.storage.len());
        self.storage.drain(..len).collect()
    }
}
