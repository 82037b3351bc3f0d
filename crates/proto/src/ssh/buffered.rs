//! Reassembly buffer for byte-stream channel consumers.
//!
//! Channel traffic arrives as framed CHANNEL_DATA payloads, but sinks
//! like a child's stdin pipe or an upstream socket want a contiguous
//! byte stream and may accept it only partially. [`BufferedChannel`]
//! concatenates incoming payloads, feeds the consumer the largest
//! contiguous slice available, and keeps whatever the consumer does not
//! take for the next attempt - triggered by the next DATA arrival or an
//! explicit wakeup. Once EOF is recorded and the buffer drains, a
//! single buffered-EOF notification fires.

use bytes::{Buf, BytesMut};

/// Rolling reassembly buffer with deferred EOF.
#[derive(Debug, Default)]
pub struct BufferedChannel {
    buffer: BytesMut,
    eof: bool,
    eof_delivered: bool,
}

impl BufferedChannel {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an incoming payload.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Records that no more data will arrive.
    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    /// Feeds the consumer the buffered bytes; the consumer returns how
    /// many it actually took. Returns the number consumed.
    pub fn drain<F>(&mut self, mut consumer: F) -> usize
    where
        F: FnMut(&[u8]) -> usize,
    {
        if self.buffer.is_empty() {
            return 0;
        }

        let taken = consumer(&self.buffer);
        debug_assert!(taken <= self.buffer.len());
        let taken = taken.min(self.buffer.len());
        self.buffer.advance(taken);

        if self.buffer.is_empty() {
            // release large reassembly allocations once drained
            self.buffer = BytesMut::new();
        }

        taken
    }

    /// True exactly once: after EOF was recorded and the buffer fully
    /// drained.
    pub fn take_buffered_eof(&mut self) -> bool {
        if self.eof && !self.eof_delivered && self.buffer.is_empty() {
            self.eof_delivered = true;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concatenates_payloads() {
        let mut buffered = BufferedChannel::new();
        buffered.push(b"hel");
        buffered.push(b"lo");

        let mut seen = Vec::new();
        buffered.drain(|bytes| {
            seen.extend_from_slice(bytes);
            bytes.len()
        });
        assert_eq!(seen, b"hello");
        assert!(buffered.is_empty());
    }

    #[test]
    fn test_partial_consumption_retries() {
        let mut buffered = BufferedChannel::new();
        buffered.push(b"abcdef");

        // consumer takes only two bytes
        let taken = buffered.drain(|_| 2);
        assert_eq!(taken, 2);
        assert_eq!(buffered.len(), 4);

        // remaining bytes come back on the next attempt, in order
        let mut seen = Vec::new();
        buffered.drain(|bytes| {
            seen.extend_from_slice(bytes);
            bytes.len()
        });
        assert_eq!(seen, b"cdef");
    }

    #[test]
    fn test_consumer_refusing_everything() {
        let mut buffered = BufferedChannel::new();
        buffered.push(b"xyz");
        assert_eq!(buffered.drain(|_| 0), 0);
        assert_eq!(buffered.len(), 3);
    }

    #[test]
    fn test_eof_deferred_until_drained() {
        let mut buffered = BufferedChannel::new();
        buffered.push(b"tail");
        buffered.set_eof();

        // buffer still holds data: no EOF yet
        assert!(!buffered.take_buffered_eof());

        buffered.drain(|b| b.len());
        assert!(buffered.take_buffered_eof());

        // fires exactly once
        assert!(!buffered.take_buffered_eof());
    }

    #[test]
    fn test_eof_without_data() {
        let mut buffered = BufferedChannel::new();
        buffered.set_eof();
        assert!(buffered.take_buffered_eof());
    }
}
