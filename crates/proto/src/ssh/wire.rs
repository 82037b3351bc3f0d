//! SSH wire-format primitives (RFC 4251 Section 5).
//!
//! [`PacketWriter`] serializes payloads into a buffer bounded by
//! [`MAX_PACKET_SIZE`](crate::ssh::packet::MAX_PACKET_SIZE); any write
//! that would exceed the bound fails instead of growing. [`PacketReader`]
//! is the bounds-checked mirror. Both cover the full primitive set:
//! fixed-width integers, booleans, strings, mpints and name-lists, plus
//! the mark/rewind and length-placeholder patterns used for nested
//! structures such as public key blobs.
//!
//! # Example
//!
//! ```rust
//! use passage_proto::ssh::wire::{PacketReader, PacketWriter};
//!
//! let mut w = PacketWriter::new();
//! w.put_u32(42).unwrap();
//! w.put_string(b"ssh-ed25519").unwrap();
//!
//! let bytes = w.into_bytes();
//! let mut r = PacketReader::new(&bytes);
//! assert_eq!(r.get_u32().unwrap(), 42);
//! assert_eq!(r.get_string().unwrap(), b"ssh-ed25519");
//! ```

use crate::ssh::packet::MAX_PACKET_SIZE;
use passage_platform::{PassageError, PassageResult};

fn too_large() -> PassageError {
    PassageError::Protocol("packet too large".to_string())
}

fn truncated(what: &str) -> PassageError {
    PassageError::Protocol(format!("truncated field: {}", what))
}

/// Serializer for SSH payloads with a fixed capacity bound.
///
/// All writers return an error once the payload would exceed
/// `MAX_PACKET_SIZE`; the buffer never reallocates past the bound, so an
/// oversized message is rejected before it ever reaches the packet
/// layer.
#[derive(Debug)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
        }
    }

    /// Current payload length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the serialized payload.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the writer and returns the payload.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn reserve(&mut self, nbytes: usize) -> PassageResult<()> {
        if self.buf.len() + nbytes > MAX_PACKET_SIZE {
            return Err(too_large());
        }
        Ok(())
    }

    /// Appends raw bytes.
    pub fn put_raw(&mut self, bytes: &[u8]) -> PassageResult<()> {
        self.reserve(bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Appends a single byte.
    pub fn put_u8(&mut self, value: u8) -> PassageResult<()> {
        self.reserve(1)?;
        self.buf.push(value);
        Ok(())
    }

    /// Appends a big-endian u16.
    pub fn put_u16(&mut self, value: u16) -> PassageResult<()> {
        self.put_raw(&value.to_be_bytes())
    }

    /// Appends a big-endian u32.
    pub fn put_u32(&mut self, value: u32) -> PassageResult<()> {
        self.put_raw(&value.to_be_bytes())
    }

    /// Appends a big-endian u64.
    pub fn put_u64(&mut self, value: u64) -> PassageResult<()> {
        self.put_raw(&value.to_be_bytes())
    }

    /// Appends a boolean as one byte, 0 or 1.
    pub fn put_bool(&mut self, value: bool) -> PassageResult<()> {
        self.put_u8(u8::from(value))
    }

    /// Appends a length-prefixed string (binary blob or UTF-8 text).
    pub fn put_string(&mut self, bytes: &[u8]) -> PassageResult<()> {
        self.put_u32(bytes.len() as u32)?;
        self.put_raw(bytes)
    }

    /// Appends a length-prefixed UTF-8 string.
    pub fn put_str(&mut self, s: &str) -> PassageResult<()> {
        self.put_string(s.as_bytes())
    }

    /// Appends an mpint (RFC 4251 "bignum2").
    ///
    /// Leading zero bytes are stripped; when the high bit of the first
    /// remaining byte is set, a zero byte is prepended so the value
    /// stays non-negative. An empty (zero) value encodes as length 0.
    pub fn put_mpint(&mut self, bytes: &[u8]) -> PassageResult<()> {
        let mut src = bytes;
        while let Some((first, rest)) = src.split_first() {
            if *first != 0 {
                break;
            }
            src = rest;
        }

        let leading_msb = src.first().is_some_and(|b| b & 0x80 != 0);

        self.put_u32((src.len() + usize::from(leading_msb)) as u32)?;
        if leading_msb {
            self.put_u8(0)?;
        }
        self.put_raw(src)
    }

    /// Appends a name-list: a string containing comma-separated names.
    pub fn put_name_list<S: AsRef<str>>(&mut self, names: &[S]) -> PassageResult<()> {
        let joined = names
            .iter()
            .map(|s| s.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.put_str(&joined)
    }

    /// Returns the current position, for a later [`rewind`](Self::rewind).
    pub fn mark(&self) -> usize {
        self.buf.len()
    }

    /// Discards everything written after `mark`.
    pub fn rewind(&mut self, mark: usize) {
        debug_assert!(mark <= self.buf.len());
        self.buf.truncate(mark);
    }

    /// Reserves four bytes for a length field and returns its position
    /// for [`commit_length`](Self::commit_length).
    pub fn prepare_length(&mut self) -> PassageResult<usize> {
        let at = self.buf.len();
        self.put_u32(0)?;
        Ok(at)
    }

    /// Patches the length field reserved at `at` with the number of
    /// bytes written since.
    pub fn commit_length(&mut self, at: usize) {
        let value = (self.buf.len() - at - 4) as u32;
        self.buf[at..at + 4].copy_from_slice(&value.to_be_bytes());
    }
}

impl Default for PacketWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds-checked reader over a received payload.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Creates a reader over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Returns the unconsumed tail without advancing.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Consumes and returns `nbytes` bytes.
    pub fn take(&mut self, nbytes: usize) -> PassageResult<&'a [u8]> {
        if self.remaining() < nbytes {
            return Err(truncated("raw bytes"));
        }
        let slice = &self.data[self.pos..self.pos + nbytes];
        self.pos += nbytes;
        Ok(slice)
    }

    /// Reads one byte.
    pub fn get_u8(&mut self) -> PassageResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a big-endian u32.
    pub fn get_u32(&mut self) -> PassageResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian u64.
    pub fn get_u64(&mut self) -> PassageResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Reads a boolean byte; any nonzero value is true.
    pub fn get_bool(&mut self) -> PassageResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Reads a length-prefixed string as raw bytes.
    pub fn get_string(&mut self) -> PassageResult<&'a [u8]> {
        let len = self.get_u32()? as usize;
        if len > MAX_PACKET_SIZE {
            return Err(PassageError::Protocol(format!(
                "oversized string field: {} bytes",
                len
            )));
        }
        if self.remaining() < len {
            return Err(truncated("string"));
        }
        self.take(len)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn get_str(&mut self) -> PassageResult<&'a str> {
        let bytes = self.get_string()?;
        std::str::from_utf8(bytes)
            .map_err(|_| PassageError::Protocol("invalid UTF-8 in string field".to_string()))
    }

    /// Reads an mpint as its minimal big-endian magnitude.
    pub fn get_mpint(&mut self) -> PassageResult<&'a [u8]> {
        let mut bytes = self.get_string()?;
        // tolerate the sign-padding zero
        while let Some((first, rest)) = bytes.split_first() {
            if *first != 0 {
                break;
            }
            bytes = rest;
        }
        Ok(bytes)
    }

    /// Reads a name-list into its comma-separated names.
    pub fn get_name_list(&mut self) -> PassageResult<Vec<String>> {
        let s = self.get_str()?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        Ok(s.split(',').map(String::from).collect())
    }

    /// Reads and checks the leading message type byte.
    pub fn expect_msg(&mut self, expected: crate::ssh::message::MessageType) -> PassageResult<()> {
        let got = self.get_u8()?;
        if got != expected as u8 {
            return Err(PassageError::Protocol(format!(
                "expected {}, got message number {}",
                expected, got
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_round_trip() {
        let mut w = PacketWriter::new();
        w.put_u8(7).unwrap();
        w.put_u16(0x1234).unwrap();
        w.put_u32(0xdeadbeef).unwrap();
        w.put_u64(0x0102030405060708).unwrap();
        w.put_bool(true).unwrap();
        w.put_bool(false).unwrap();
        w.put_str("ssh-connection").unwrap();

        let bytes = w.into_bytes();
        let mut r = PacketReader::new(&bytes);
        assert_eq!(r.get_u8().unwrap(), 7);
        assert_eq!(r.take(2).unwrap(), &[0x12, 0x34]);
        assert_eq!(r.get_u32().unwrap(), 0xdeadbeef);
        assert_eq!(r.get_u64().unwrap(), 0x0102030405060708);
        assert!(r.get_bool().unwrap());
        assert!(!r.get_bool().unwrap());
        assert_eq!(r.get_str().unwrap(), "ssh-connection");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_mpint_strips_leading_zeros() {
        let mut w = PacketWriter::new();
        w.put_mpint(&[0x00, 0x00, 0x12, 0x34]).unwrap();
        assert_eq!(w.as_slice(), &[0, 0, 0, 2, 0x12, 0x34]);
    }

    #[test]
    fn test_mpint_high_bit_padding() {
        let mut w = PacketWriter::new();
        w.put_mpint(&[0x80, 0x01]).unwrap();
        // a zero byte is prepended so the value reads as non-negative
        assert_eq!(w.as_slice(), &[0, 0, 0, 3, 0x00, 0x80, 0x01]);
    }

    #[test]
    fn test_mpint_empty() {
        let mut w = PacketWriter::new();
        w.put_mpint(&[]).unwrap();
        assert_eq!(w.as_slice(), &[0, 0, 0, 0]);

        let mut w = PacketWriter::new();
        w.put_mpint(&[0x00, 0x00]).unwrap();
        assert_eq!(w.as_slice(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_mpint_round_trip() {
        for value in [&[0x80u8, 0x01][..], &[0x01], &[0x7f, 0xff, 0xff]] {
            let mut w = PacketWriter::new();
            w.put_mpint(value).unwrap();
            let bytes = w.into_bytes();
            let mut r = PacketReader::new(&bytes);
            assert_eq!(r.get_mpint().unwrap(), value);
        }
    }

    #[test]
    fn test_name_list() {
        let mut w = PacketWriter::new();
        w.put_name_list(&["curve25519-sha256", "ecdh-sha2-nistp256"])
            .unwrap();
        let bytes = w.into_bytes();
        let mut r = PacketReader::new(&bytes);
        assert_eq!(
            r.get_name_list().unwrap(),
            vec!["curve25519-sha256", "ecdh-sha2-nistp256"]
        );
    }

    #[test]
    fn test_empty_name_list() {
        let mut w = PacketWriter::new();
        w.put_name_list::<&str>(&[]).unwrap();
        let bytes = w.into_bytes();
        let mut r = PacketReader::new(&bytes);
        assert!(r.get_name_list().unwrap().is_empty());
    }

    #[test]
    fn test_length_placeholder() {
        let mut w = PacketWriter::new();
        w.put_u8(31).unwrap();
        let at = w.prepare_length().unwrap();
        w.put_str("ssh-ed25519").unwrap();
        w.put_string(&[0xaa; 32]).unwrap();
        w.commit_length(at);

        let bytes = w.into_bytes();
        let mut r = PacketReader::new(&bytes);
        assert_eq!(r.get_u8().unwrap(), 31);
        let blob = r.get_string().unwrap();
        assert_eq!(blob.len(), 4 + 11 + 4 + 32);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_mark_rewind() {
        let mut w = PacketWriter::new();
        w.put_u32(1).unwrap();
        let mark = w.mark();
        w.put_str("discarded").unwrap();
        w.rewind(mark);
        assert_eq!(w.len(), 4);
    }

    #[test]
    fn test_writer_rejects_oversize() {
        let mut w = PacketWriter::new();
        w.put_raw(&vec![0u8; MAX_PACKET_SIZE]).unwrap();
        assert!(w.put_u8(0).is_err());
    }

    #[test]
    fn test_reader_rejects_truncated_string() {
        // declared length 10, only 2 bytes present
        let bytes = [0, 0, 0, 10, 0xaa, 0xbb];
        let mut r = PacketReader::new(&bytes);
        assert!(r.get_string().is_err());
    }

    #[test]
    fn test_reader_rejects_oversized_string() {
        let bytes = [0xff, 0xff, 0xff, 0xff];
        let mut r = PacketReader::new(&bytes);
        assert!(r.get_string().is_err());
    }
}
