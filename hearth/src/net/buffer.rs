use slice_deque::SliceDeque;
use std::io;

type ByteDeque = SliceDeque<u8>;

// Mirror-page granularity of the underlying deque.
const BUF_SIZE_INCREMENT: usize = 65536;

/// Bounded FIFO byte queue backed by a mirrored slice deque, so both the
/// pending data and the free space are always available as single
/// contiguous slices. Data is committed at the tail and consumed from the
/// head.
pub struct Buffer {
    data: ByteDeque,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        if size % BUF_SIZE_INCREMENT != 0 {
            panic!("Buffer size must be divisible by {}, got {}", BUF_SIZE_INCREMENT, size);
        }

        let mut data = ByteDeque::new();
        data.reserve(size);
        Buffer { data, size }
    }

    /// Number of pending bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Free capacity left for `commit`.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Discards `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    /// Marks `count` bytes of the free slice as pending data.
    #[inline]
    pub fn commit(&mut self, count: usize) {
        unsafe { self.data.move_tail(count as isize) }
    }

    /// The pending data, oldest byte first.
    #[inline]
    pub fn pending(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// The free slice following the pending data. Bytes written here become
    /// visible after a matching `commit`.
    #[inline]
    pub fn space(&mut self) -> &mut [u8] {
        unsafe { self.data.tail_head_slice() }
    }

    #[inline]
    pub fn clear(&mut self) {
        let len = self.len();
        self.consume(len);
    }

    /// Appends a byte slice wholesale. Returns false without writing
    /// anything if the slice does not fit.
    #[inline]
    pub fn push(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.free_capacity() {
            return false;
        }

        self.space()[..bytes.len()].copy_from_slice(bytes);
        self.commit(bytes.len());
        true
    }

    /// Drains pending data into the supplied writer, consuming what was
    /// written. Stops at the first `WouldBlock` and reports the byte count
    /// moved so far; a zero-length write is an error.
    pub fn drain_to<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.data.len();

        while !self.data.is_empty() {
            match writer.write(&self.data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => self.consume(count),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(orig_len - self.data.len())
    }

    /// Fills the free space from the supplied reader, committing what was
    /// read. Stops at `WouldBlock` or end-of-stream and reports both the
    /// byte count moved and whether the reader hit EOF; reaching the
    /// capacity limit with the reader still pending is an error.
    pub fn fill_from<R: io::Read>(&mut self, mut reader: R) -> io::Result<(usize, bool)> {
        let orig_len = self.data.len();

        while self.data.len() < self.size {
            let count = unsafe {
                match reader.read(self.data.tail_head_slice()) {
                    Ok(count) => count,
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            };

            if count == 0 {
                return Ok((self.data.len() - orig_len, true));
            }
            self.commit(count);
        }

        if self.data.len() == self.size {
            return Err(io::Error::new(io::ErrorKind::Other, "buffer overrun"));
        }

        Ok((self.data.len() - orig_len, false))
    }
}
