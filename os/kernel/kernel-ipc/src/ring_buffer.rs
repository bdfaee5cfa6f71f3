use alloc::boxed::Box;
use alloc::vec;

/// Fixed-capacity byte FIFO.
#[derive(Debug)]
pub struct RingBuffer {
    data: Box<[u8]>,
    head: usize,
    len: usize,
}

impl RingBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    #[must_use]
    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Append as much of `bytes` as fits; returns the count.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.free());
        if n == 0 {
            return 0;
        }
        let cap = self.capacity();
        let tail = (self.head + self.len) % cap;
        let first = n.min(cap - tail);
        self.data[tail..tail + first].copy_from_slice(&bytes[..first]);
        self.data[..n - first].copy_from_slice(&bytes[first..n]);
        self.len += n;
        n
    }

    /// Remove up to `out.len()` bytes into `out`; returns the count.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        if n == 0 {
            return 0;
        }
        let cap = self.capacity();
        let first = n.min(cap - self.head);
        out[..first].copy_from_slice(&self.data[self.head..self.head + first]);
        out[first..n].copy_from_slice(&self.data[..n - first]);
        self.head = (self.head + n) % cap;
        self.len -= n;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_write_then_drain() {
        let mut rb = RingBuffer::new(64);
        assert_eq!(rb.write(&[7; 100]), 64);
        assert!(rb.is_full());
        let mut out = [0; 200];
        assert_eq!(rb.read(&mut out), 64);
        assert!(out[..64].iter().all(|&b| b == 7));
        assert_eq!(rb.read(&mut out), 0);
    }

    #[test]
    fn wraps_around() {
        let mut rb = RingBuffer::new(8);
        assert_eq!(rb.write(b"abcdef"), 6);
        let mut out = [0; 4];
        assert_eq!(rb.read(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(rb.write(b"ghijkl"), 6);
        assert_eq!(rb.len(), 8);
        let mut out = [0; 8];
        assert_eq!(rb.read(&mut out), 8);
        assert_eq!(&out, b"efghijkl");
        assert!(rb.is_empty());
    }

    #[test]
    fn zero_capacity_accepts_nothing() {
        let mut rb = RingBuffer::new(0);
        assert_eq!(rb.write(b"x"), 0);
        assert_eq!(rb.read(&mut [0; 1]), 0);
    }
}
