//! Framed packet transport over an async byte stream.
//!
//! [`Transport`] owns the socket plus the send/receive crypto contexts.
//! Every inbound packet is decrypted, MAC-verified and unpadded here;
//! every outbound payload is framed, encrypted and queued here. The
//! pending context pair built during a key exchange is installed
//! per-direction on NEWKEYS: the send context when we send ours, the
//! receive context when the peer's arrives, so each direction switches
//! cipher independently and mid-stream.
//!
//! The transport also owns the rekey counters (bytes and packets per
//! direction since the last key installation) and the bounded outbound
//! queue that backs the write side of flow control.

use crate::ssh::crypto::{OpeningContext, SealingContext};
use crate::ssh::message::{DisconnectReason, MessageType};
use crate::ssh::version::{Version, MAX_VERSION_LENGTH};
use crate::ssh::wire::PacketWriter;
use bytes::{Buf, BytesMut};
use passage_platform::{PassageError, PassageResult};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Rekey after this many bytes in either direction (1 GiB).
pub const REKEY_BYTES_LIMIT: u64 = 1 << 30;

/// Rekey after this many packets in either direction.
pub const REKEY_PACKETS_LIMIT: u64 = 1 << 32;

/// Rekey after this much time on the same keys (1 hour).
pub const REKEY_TIME_LIMIT: std::time::Duration = std::time::Duration::from_secs(3600);

/// Bound on queued-but-unflushed outbound bytes. Exceeding it is a
/// resource error that tears the connection down.
pub const SEND_QUEUE_LIMIT: usize = 4 * 1024 * 1024;

/// Queued bytes above which channels are told to stop producing.
pub const WRITE_HIGH_WATER: usize = 256 * 1024;

/// Framed and encrypted SSH packet stream.
pub struct Transport<S> {
    stream: S,
    seal: SealingContext,
    open: OpeningContext,
    pending_seal: Option<SealingContext>,
    pending_open: Option<OpeningContext>,

    queue: VecDeque<Vec<u8>>,
    queued_bytes: usize,

    /// Inbound reassembly buffer; keeps [`recv_packet`] safe to cancel
    /// mid-read (partial bytes survive in the transport, not in a
    /// dropped future).
    in_buf: BytesMut,
    /// (packet_length, prefix_len) of the packet currently being read,
    /// once its length prefix was decrypted.
    in_progress: Option<(usize, usize)>,

    sent_bytes: u64,
    sent_packets: u64,
    received_bytes: u64,
    received_packets: u64,
    keys_installed_at: std::time::Instant,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    /// Wraps a stream; both directions start unencrypted.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            seal: SealingContext::plaintext(),
            open: OpeningContext::plaintext(),
            pending_seal: None,
            pending_open: None,
            queue: VecDeque::new(),
            queued_bytes: 0,
            in_buf: BytesMut::with_capacity(4096),
            in_progress: None,
            sent_bytes: 0,
            sent_packets: 0,
            received_bytes: 0,
            received_packets: 0,
            keys_installed_at: std::time::Instant::now(),
        }
    }

    /// Performs the identification exchange (RFC 4253 Section 4.2).
    ///
    /// Writes our line, reads the client's, and returns both verbatim
    /// without CR LF, as the key exchange hashes them.
    pub async fn exchange_versions(&mut self, server_id: &Version) -> PassageResult<(String, String)> {
        let server_line = server_id.to_string();
        self.stream
            .write_all(format!("{}\r\n", server_line).as_bytes())
            .await?;
        self.stream.flush().await?;

        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.stream.read_exact(&mut byte).await?;
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            if line.len() > MAX_VERSION_LENGTH {
                return Err(PassageError::Protocol(
                    "client identification line too long".to_string(),
                ));
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        let client_line = String::from_utf8(line).map_err(|_| {
            PassageError::Protocol("client identification line is not UTF-8".to_string())
        })?;

        // validates the SSH-2.0 prefix
        Version::parse(&client_line)?;

        tracing::debug!(client = %client_line, "identification exchange complete");
        Ok((client_line, server_line))
    }

    async fn fill(&mut self, needed: usize) -> PassageResult<()> {
        while self.in_buf.len() < needed {
            let n = self.stream.read_buf(&mut self.in_buf).await?;
            if n == 0 {
                return Err(PassageError::Io(std::io::Error::from(
                    std::io::ErrorKind::UnexpectedEof,
                )));
            }
        }
        Ok(())
    }

    /// Reads, decrypts and authenticates one packet, returning its
    /// payload. Cancel-safe: partially read packets stay buffered in
    /// the transport.
    pub async fn recv_packet(&mut self) -> PassageResult<Vec<u8>> {
        let (packet_length, prefix_len) = match self.in_progress {
            Some(state) => state,
            None => {
                let prefix_len = self.open.length_prefix_size();
                self.fill(prefix_len).await?;
                let packet_length = self.open.decrypt_length(&self.in_buf[..prefix_len])?;
                self.in_progress = Some((packet_length, prefix_len));
                (packet_length, prefix_len)
            }
        };

        let total = 4 + packet_length + self.open.trailer_size();
        self.fill(total).await?;
        self.in_progress = None;

        let packet = &self.in_buf[..total];
        let payload = self
            .open
            .open(packet_length, &packet[..prefix_len], &packet[prefix_len..])?;
        self.in_buf.advance(total);

        self.received_bytes += total as u64;
        self.received_packets += 1;

        Ok(payload)
    }

    /// Sequence number of the most recently received packet.
    pub fn last_recv_seq(&self) -> u32 {
        self.open.seq().wrapping_sub(1)
    }

    /// Encrypts a payload and appends it to the outbound queue without
    /// writing. Packets are sealed in queue order, which fixes their
    /// sequence numbers.
    pub fn queue_packet(&mut self, payload: &[u8]) -> PassageResult<()> {
        let packet = self.seal.seal(payload)?;
        self.queued_bytes += packet.len();
        if self.queued_bytes > SEND_QUEUE_LIMIT {
            return Err(PassageError::Resource(
                "outbound send queue overflow".to_string(),
            ));
        }
        self.sent_bytes += packet.len() as u64;
        self.sent_packets += 1;
        self.queue.push_back(packet);
        Ok(())
    }

    /// Writes out every queued packet.
    pub async fn flush(&mut self) -> PassageResult<()> {
        while let Some(packet) = self.queue.pop_front() {
            self.queued_bytes -= packet.len();
            self.stream.write_all(&packet).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// Queues and immediately flushes one payload.
    pub async fn send_packet(&mut self, payload: &[u8]) -> PassageResult<()> {
        self.queue_packet(payload)?;
        self.flush().await
    }

    /// Bytes currently queued but not yet written.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Stores the context pair derived by a key exchange, to be
    /// installed on NEWKEYS.
    pub fn set_pending(&mut self, seal: SealingContext, open: OpeningContext) {
        self.pending_seal = Some(seal);
        self.pending_open = Some(open);
    }

    /// Installs the pending send context; called after sending our
    /// NEWKEYS. The outbound sequence number carries over.
    pub fn install_pending_send(&mut self) -> PassageResult<()> {
        let mut seal = self.pending_seal.take().ok_or_else(|| {
            PassageError::Internal("no pending send context to install".to_string())
        })?;
        seal.set_seq(self.seal.seq());
        self.seal = seal;
        self.sent_bytes = 0;
        self.sent_packets = 0;
        Ok(())
    }

    /// Installs the pending receive context; called after the peer's
    /// NEWKEYS. The inbound sequence number carries over.
    pub fn install_pending_recv(&mut self) -> PassageResult<()> {
        let mut open = self.pending_open.take().ok_or_else(|| {
            PassageError::Internal("no pending receive context to install".to_string())
        })?;
        open.set_seq(self.open.seq());
        self.open = open;
        self.received_bytes = 0;
        self.received_packets = 0;
        self.keys_installed_at = std::time::Instant::now();
        Ok(())
    }

    /// True when either direction has crossed the rekey thresholds, or
    /// the current keys have been in use too long.
    pub fn should_rekey(&self) -> bool {
        self.sent_bytes >= REKEY_BYTES_LIMIT
            || self.received_bytes >= REKEY_BYTES_LIMIT
            || self.sent_packets >= REKEY_PACKETS_LIMIT
            || self.received_packets >= REKEY_PACKETS_LIMIT
            || self.keys_installed_at.elapsed() >= REKEY_TIME_LIMIT
    }

    /// Sends SSH_MSG_DISCONNECT. The connection should be dropped
    /// afterwards; write errors are ignored since the peer may already
    /// be gone.
    pub async fn send_disconnect(&mut self, reason: DisconnectReason, description: &str) {
        let mut w = PacketWriter::new();
        let ok = w.put_u8(MessageType::Disconnect as u8).is_ok()
            && w.put_u32(reason as u32).is_ok()
            && w.put_str(description).is_ok()
            && w.put_str("").is_ok();
        if ok {
            let _ = self.send_packet(w.as_slice()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::{CipherAlgorithm, KeyMaterial};

    async fn pair() -> (Transport<tokio::io::DuplexStream>, Transport<tokio::io::DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Transport::new(a), Transport::new(b))
    }

    #[tokio::test]
    async fn test_version_exchange() {
        let (mut server, mut client) = pair().await;

        let client_task = tokio::spawn(async move {
            client
                .exchange_versions(&Version::new("client_1.0", None))
                .await
                .unwrap()
        });

        let (client_line, server_line) = server
            .exchange_versions(&Version::default_passage())
            .await
            .unwrap();

        assert_eq!(client_line, "SSH-2.0-client_1.0");
        assert!(server_line.starts_with("SSH-2.0-Passage_"));
        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_plaintext_packet_round_trip() {
        let (mut server, mut client) = pair().await;

        server.send_packet(&[20u8, 1, 2, 3]).await.unwrap();
        let payload = client.recv_packet().await.unwrap();
        assert_eq!(payload, vec![20, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_encrypted_round_trip_after_install() {
        let (mut server, mut client) = pair().await;

        let cipher = CipherAlgorithm::ChaCha20Poly1305;
        let k = [0x42u8; 32];
        let h = [0x07u8; 32];
        let s2c = KeyMaterial::derive(cipher, None, &k, &h, &h, false).unwrap();

        server.set_pending(
            SealingContext::new(cipher, None, &s2c).unwrap(),
            OpeningContext::plaintext(),
        );
        client.set_pending(
            SealingContext::plaintext(),
            OpeningContext::new(cipher, None, &s2c).unwrap(),
        );

        // one packet in the clear before the switch
        server.send_packet(&[21u8]).await.unwrap();
        assert_eq!(client.recv_packet().await.unwrap(), vec![21]);

        server.install_pending_send().unwrap();
        client.install_pending_recv().unwrap();

        server.send_packet(&[94u8, 0, 0, 0, 0]).await.unwrap();
        assert_eq!(client.recv_packet().await.unwrap(), vec![94, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_sequence_number_carries_over_install() {
        let (mut server, mut client) = pair().await;

        for _ in 0..5 {
            server.send_packet(&[2u8, 0]).await.unwrap();
            client.recv_packet().await.unwrap();
        }

        let cipher = CipherAlgorithm::ChaCha20Poly1305;
        let k = [0x42u8; 32];
        let h = [0x07u8; 32];
        let s2c = KeyMaterial::derive(cipher, None, &k, &h, &h, false).unwrap();

        server.set_pending(
            SealingContext::new(cipher, None, &s2c).unwrap(),
            OpeningContext::plaintext(),
        );
        client.set_pending(
            SealingContext::plaintext(),
            OpeningContext::new(cipher, None, &s2c).unwrap(),
        );
        server.install_pending_send().unwrap();
        client.install_pending_recv().unwrap();

        // decryption only succeeds if both sides agree the sequence
        // number is now 5, since it feeds the AEAD nonce
        server.send_packet(&[2u8, 1]).await.unwrap();
        assert_eq!(client.recv_packet().await.unwrap(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_queue_accumulates_until_flush() {
        let (mut server, mut client) = pair().await;

        server.queue_packet(&[2u8, 1]).unwrap();
        server.queue_packet(&[2u8, 2]).unwrap();
        assert!(server.queued_bytes() > 0);

        server.flush().await.unwrap();
        assert_eq!(server.queued_bytes(), 0);

        assert_eq!(client.recv_packet().await.unwrap(), vec![2, 1]);
        assert_eq!(client.recv_packet().await.unwrap(), vec![2, 2]);
    }

    #[tokio::test]
    async fn test_oversized_inbound_length_rejected() {
        let (server, mut client) = pair().await;
        let mut stream = server.stream;

        // hand-written frame with an absurd packet_length
        stream.write_all(&[0xff, 0xff, 0xff, 0xff]).await.unwrap();
        stream.write_all(&[0u8; 16]).await.unwrap();

        assert!(matches!(
            client.recv_packet().await,
            Err(PassageError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_rekey_counters() {
        let (mut server, _client) = pair().await;
        assert!(!server.should_rekey());
        server.sent_bytes = REKEY_BYTES_LIMIT;
        assert!(server.should_rekey());
    }
}
