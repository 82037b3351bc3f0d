//! SSH binary packet framing (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (MAC = Message Authentication Code)
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does NOT include the `mac` or the length field
//!   itself
//! - `padding_length` is between 4 and 255 bytes
//! - The padded region is a multiple of the cipher block size (minimum
//!   8); AEAD ciphers exclude the length field from that alignment
//! - Total packet size is at least 16 and at most 35000 bytes
//!
//! This module holds the framing arithmetic and the cleartext
//! encode/decode steps; encryption and MAC live in
//! [`crypto`](crate::ssh::crypto), which calls in here on both paths.

use passage_platform::{PassageError, PassageResult};
use rand::RngCore;

/// Maximum packet size in bytes (RFC 4253 Section 6.1).
///
/// This limit prevents denial-of-service attacks via extremely large
/// packets.
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum total packet size in bytes.
pub const MIN_PACKET_SIZE: usize = 16;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Minimum cipher block size used for padding alignment.
pub const MIN_BLOCK_SIZE: usize = 8;

/// Computes the padding length for a payload.
///
/// Returns the smallest `P >= 4` such that the padded region is a
/// multiple of `block_size` and the total packet (including the length
/// field) is at least [`MIN_PACKET_SIZE`]. When `length_excluded` is
/// true (AEAD ciphers), the 4-byte length field does not participate in
/// the alignment.
///
/// # Example
///
/// ```rust
/// use passage_proto::ssh::packet::padding_length;
///
/// // 1 (padding_length) + 7 (payload) + 8 (padding) + 4 (length) = 20,
/// // and 20 % 8 == 4 -- so an 8-byte pad brings the total to 8*k
/// let p = padding_length(7, 8, false);
/// assert!(p >= 4);
/// assert_eq!((4 + 1 + 7 + p) % 8, 0);
/// ```
pub fn padding_length(payload_len: usize, block_size: usize, length_excluded: bool) -> usize {
    let block_size = block_size.max(MIN_BLOCK_SIZE);
    let base = if length_excluded {
        1 + payload_len
    } else {
        4 + 1 + payload_len
    };

    let mut padding = block_size - (base % block_size);
    while padding < MIN_PADDING_LEN {
        padding += block_size;
    }
    // minimum total packet size, rarely relevant beyond empty payloads
    while 4 + 1 + payload_len + padding < MIN_PACKET_SIZE {
        padding += block_size;
    }
    padding
}

/// Validates an inbound `packet_length` field against the size bounds
/// and the cipher's block alignment.
pub fn check_packet_length(
    packet_length: usize,
    block_size: usize,
    length_excluded: bool,
) -> PassageResult<()> {
    if packet_length > MAX_PACKET_SIZE {
        return Err(PassageError::Protocol(format!(
            "packet too large: {} bytes (maximum {})",
            packet_length, MAX_PACKET_SIZE
        )));
    }
    // padding_length byte + at least 4 bytes of padding
    if packet_length < 1 + MIN_PADDING_LEN {
        return Err(PassageError::Protocol(format!(
            "packet too small: {} bytes",
            packet_length
        )));
    }

    let block_size = block_size.max(MIN_BLOCK_SIZE);
    let aligned = if length_excluded {
        packet_length
    } else {
        4 + packet_length
    };
    if aligned % block_size != 0 {
        return Err(PassageError::Protocol(format!(
            "packet length {} not aligned to cipher block size {}",
            packet_length, block_size
        )));
    }

    Ok(())
}

/// Builds the cleartext frame for a payload:
/// `length || padding_length || payload || random padding`.
///
/// The result is what a cipher context encrypts (entirely, or without
/// the first four bytes for AEAD).
pub fn encode_clear(payload: &[u8], block_size: usize, length_excluded: bool) -> Vec<u8> {
    let padding = padding_length(payload.len(), block_size, length_excluded);
    let packet_length = 1 + payload.len() + padding;

    let mut out = Vec::with_capacity(4 + packet_length);
    out.extend_from_slice(&(packet_length as u32).to_be_bytes());
    out.push(padding as u8);
    out.extend_from_slice(payload);

    let start = out.len();
    out.resize(start + padding, 0);
    rand::thread_rng().fill_bytes(&mut out[start..]);

    out
}

/// Extracts the payload from a decrypted packet body (everything after
/// the length field), validating the padding length.
pub fn decode_clear(body: &[u8]) -> PassageResult<Vec<u8>> {
    let (&padding_length, rest) = body
        .split_first()
        .ok_or_else(|| PassageError::Protocol("empty packet body".to_string()))?;
    let padding_length = padding_length as usize;

    if padding_length < MIN_PADDING_LEN {
        return Err(PassageError::Protocol(format!(
            "padding too short: {} bytes (minimum {})",
            padding_length, MIN_PADDING_LEN
        )));
    }
    if padding_length > rest.len() {
        return Err(PassageError::Protocol(format!(
            "padding length {} exceeds packet body {}",
            padding_length,
            rest.len()
        )));
    }

    Ok(rest[..rest.len() - padding_length].to_vec())
}
