//! Channel abstraction and flow-control bookkeeping (RFC 4254
//! Section 5).
//!
//! A [`Channel`] is one multiplexed stream over the connection: the id
//! pair, the two flow-control windows, the lifecycle state and a boxed
//! [`ChannelHandler`] implementing the type-specific behavior (session,
//! direct-tcpip). The connection engine owns the channel table and calls
//! into here for every channel message; handlers never touch the
//! transport directly - they hand produced bytes back through
//! [`ChannelEvent`]s and the engine emits CHANNEL_DATA under window
//! control.
//!
//! # Windows
//!
//! `local_window` is what we are still willing to receive: debited by
//! every inbound DATA byte, refilled with WINDOW_ADJUST once it falls
//! below half of [`RECEIVE_WINDOW`]. `peer_window` is what the peer will
//! accept: debited by every outbound DATA byte; when it reaches zero,
//! produced output parks in the channel's pending queue until the peer
//! adjusts. Data beyond `local_window` is a protocol error.

use passage_platform::{PassageError, PassageResult};
use std::collections::VecDeque;

/// Initial and target size of our receive window per channel (1 MiB).
pub const RECEIVE_WINDOW: u32 = 1024 * 1024;

/// Maximum packet size we advertise per channel.
pub const CHANNEL_MAX_PACKET: u32 = 32 * 1024;

/// Bound on bytes parked per channel waiting for peer window. A channel
/// source that outruns this is a resource error.
pub const SEND_BUFFER_LIMIT: usize = 2 * 1024 * 1024;

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, CHANNEL_OPEN_CONFIRMATION not yet sent.
    Opening,
    /// Fully open, data may flow both ways.
    Open,
    /// We sent CHANNEL_EOF; peer may still send.
    EofSent,
    /// Peer sent CHANNEL_EOF; we may still send.
    EofReceived,
    /// One side has sent CHANNEL_CLOSE.
    Closing,
    /// Both sides have sent CHANNEL_CLOSE; the id may be reused.
    Closed,
}

/// Which output stream a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStream {
    /// CHANNEL_DATA
    Stdout,
    /// CHANNEL_EXTENDED_DATA with type stderr
    Stderr,
}

/// Events produced by channel back-ends (child process I/O tasks,
/// upstream sockets) and consumed by the connection engine.
#[derive(Debug)]
pub enum ChannelEvent {
    /// Bytes produced for the peer.
    Output {
        /// Local channel id.
        id: u32,
        /// Stream the bytes belong to.
        stream: DataStream,
        /// The bytes.
        data: Vec<u8>,
    },
    /// A source stream reached EOF (child stdout/stderr, upstream
    /// socket).
    SourceEof {
        /// Local channel id.
        id: u32,
    },
    /// The channel's child process exited.
    ChildExit {
        /// Local channel id.
        id: u32,
        /// How it terminated.
        outcome: passage_platform::ExitOutcome,
    },
    /// A buffered sink made progress; retry the channel's buffer.
    Wakeup {
        /// Local channel id.
        id: u32,
    },
}

/// Parameters a channel is constructed with, taken from CHANNEL_OPEN.
#[derive(Debug, Clone, Copy)]
pub struct ChannelInit {
    /// Our id for the channel.
    pub local_id: u32,
    /// The peer's id for the channel.
    pub peer_id: u32,
    /// The peer's initial receive window.
    pub peer_window: u32,
    /// The peer's maximum packet size.
    pub max_packet: u32,
}

/// What a finished channel reports before EOF and CLOSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    /// Session child exited; emit exit-status or exit-signal first.
    Exit(passage_platform::ExitOutcome),
    /// Stream ended without a child (direct-tcpip).
    Plain,
}

/// Type-specific channel behavior.
///
/// Implemented by session and direct-tcpip channels. Handlers receive
/// inbound traffic and requests; they emit outbound traffic through the
/// connection's event queue, never directly.
#[async_trait::async_trait]
pub trait ChannelHandler: Send {
    /// Inbound CHANNEL_DATA payload. The window has already been
    /// debited and validated.
    async fn on_data(&mut self, data: &[u8]) -> PassageResult<()>;

    /// Inbound CHANNEL_EXTENDED_DATA payload.
    async fn on_extended_data(&mut self, _data_type: u32, _data: &[u8]) -> PassageResult<()> {
        Ok(())
    }

    /// Peer will send no more data.
    async fn on_eof(&mut self) -> PassageResult<()>;

    /// A CHANNEL_REQUEST for this channel; returns true for SUCCESS.
    async fn on_request(&mut self, request_type: &str, type_specific: &[u8])
        -> PassageResult<bool>;

    /// Retry buffered work after a [`ChannelEvent::Wakeup`].
    async fn on_wakeup(&mut self) -> PassageResult<()> {
        Ok(())
    }

    /// One of the channel's output sources reached EOF.
    fn on_source_eof(&mut self) {}

    /// The channel's child process exited.
    fn on_child_exit(&mut self, _outcome: passage_platform::ExitOutcome) {}

    /// Reports completion once every source has drained: the engine
    /// then emits exit status (if any), EOF and CLOSE.
    fn finish_status(&self) -> Option<Finish> {
        None
    }

    /// Peer grew our send window.
    fn on_window_adjust(&mut self, _additional: u32) {}

    /// The transport write side is congested; stop draining sources.
    fn on_write_blocked(&mut self) {}

    /// The transport drained; sources may resume.
    fn on_write_unblocked(&mut self) {}

    /// The channel is going away; release resources. Must not block.
    fn on_close(&mut self) {}
}

struct OutChunk {
    stream: DataStream,
    data: Vec<u8>,
}

/// One entry in the connection's channel table.
pub struct Channel {
    /// Our channel id, stable for the channel's lifetime.
    pub local_id: u32,
    /// The peer's channel id.
    pub peer_id: u32,
    /// Peer's maximum packet size for outbound DATA.
    pub max_packet: u32,
    /// Type-specific behavior.
    pub handler: Box<dyn ChannelHandler>,

    local_window: u32,
    peer_window: u32,

    state: ChannelState,
    eof_sent: bool,
    eof_received: bool,
    close_sent: bool,
    close_received: bool,
    finish_sent: bool,

    pending_out: VecDeque<OutChunk>,
    pending_out_bytes: usize,
}

impl Channel {
    /// Creates a channel in the Opening state.
    pub fn new(init: ChannelInit, handler: Box<dyn ChannelHandler>) -> Self {
        Self {
            local_id: init.local_id,
            peer_id: init.peer_id,
            max_packet: init.max_packet,
            handler,
            local_window: RECEIVE_WINDOW,
            peer_window: init.peer_window,
            state: ChannelState::Opening,
            eof_sent: false,
            eof_received: false,
            close_sent: false,
            close_received: false,
            finish_sent: false,
            pending_out: VecDeque::new(),
            pending_out_bytes: 0,
        }
    }

    /// Marks the channel open (confirmation sent).
    pub fn confirm(&mut self) {
        self.state = ChannelState::Open;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Bytes the peer may still send us.
    pub fn local_window(&self) -> u32 {
        self.local_window
    }

    /// Bytes we may still send the peer.
    pub fn peer_window(&self) -> u32 {
        self.peer_window
    }

    /// Debits the local window for an inbound payload; a payload larger
    /// than the window is a protocol violation.
    pub fn consume_local_window(&mut self, nbytes: usize) -> PassageResult<()> {
        crate::ssh::connection::check_window(self.local_window, nbytes)?;
        self.local_window -= nbytes as u32;
        Ok(())
    }

    /// Refills the local window once it drops below half of
    /// [`RECEIVE_WINDOW`]; returns the credit to send as WINDOW_ADJUST.
    pub fn refill_local_window(&mut self) -> Option<u32> {
        if self.local_window >= RECEIVE_WINDOW / 2 {
            return None;
        }
        let credit = RECEIVE_WINDOW - self.local_window;
        self.local_window = RECEIVE_WINDOW;
        Some(credit)
    }

    /// Credits the peer window from WINDOW_ADJUST.
    pub fn add_peer_window(&mut self, additional: u32) {
        self.peer_window = self.peer_window.saturating_add(additional);
        self.handler.on_window_adjust(additional);
    }

    /// Parks produced output until the peer window allows sending it.
    pub fn queue_output(&mut self, stream: DataStream, data: Vec<u8>) -> PassageResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.pending_out_bytes += data.len();
        if self.pending_out_bytes > SEND_BUFFER_LIMIT {
            return Err(PassageError::Resource(format!(
                "channel {} send buffer overflow",
                self.local_id
            )));
        }
        self.pending_out.push_back(OutChunk { stream, data });
        Ok(())
    }

    /// True when output is parked waiting for window.
    pub fn has_pending_output(&self) -> bool {
        !self.pending_out.is_empty()
    }

    /// Takes chunks that fit the current peer window and packet limit,
    /// debiting the window. A chunk larger than what fits is split and
    /// its tail stays parked.
    pub fn take_sendable(&mut self) -> Vec<(DataStream, Vec<u8>)> {
        let mut out = Vec::new();

        while self.peer_window > 0 {
            let Some(mut chunk) = self.pending_out.pop_front() else {
                break;
            };

            let budget = (self.peer_window as usize).min(self.max_packet.max(1) as usize);
            if chunk.data.len() > budget {
                let tail = chunk.data.split_off(budget);
                self.pending_out.push_front(OutChunk {
                    stream: chunk.stream,
                    data: tail,
                });
            }

            self.peer_window -= chunk.data.len() as u32;
            self.pending_out_bytes -= chunk.data.len();
            out.push((chunk.stream, chunk.data));
        }

        out
    }

    /// Records that we sent CHANNEL_EOF.
    pub fn mark_eof_sent(&mut self) {
        self.eof_sent = true;
        if self.state == ChannelState::Open {
            self.state = ChannelState::EofSent;
        }
    }

    /// Records the peer's CHANNEL_EOF.
    pub fn mark_eof_received(&mut self) {
        self.eof_received = true;
        if self.state == ChannelState::Open {
            self.state = ChannelState::EofReceived;
        }
    }

    /// True once we have sent CHANNEL_EOF.
    pub fn eof_sent(&self) -> bool {
        self.eof_sent
    }

    /// Records that we sent CHANNEL_CLOSE.
    pub fn mark_close_sent(&mut self) {
        self.close_sent = true;
        self.state = if self.close_received {
            ChannelState::Closed
        } else {
            ChannelState::Closing
        };
    }

    /// Records the peer's CHANNEL_CLOSE.
    pub fn mark_close_received(&mut self) {
        self.close_received = true;
        self.state = if self.close_sent {
            ChannelState::Closed
        } else {
            ChannelState::Closing
        };
    }

    /// True once we have sent CHANNEL_CLOSE.
    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    /// True once both sides have sent CHANNEL_CLOSE; the table entry
    /// can be removed and the id reused.
    pub fn fully_closed(&self) -> bool {
        self.close_sent && self.close_received
    }

    /// Returns the handler's completion report exactly once, and only
    /// after all parked output has been sent.
    pub fn take_finish(&mut self) -> Option<Finish> {
        if self.finish_sent || self.has_pending_output() || self.close_sent {
            return None;
        }
        let finish = self.handler.finish_status()?;
        self.finish_sent = true;
        Some(finish)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("local_id", &self.local_id)
            .field("peer_id", &self.peer_id)
            .field("state", &self.state)
            .field("local_window", &self.local_window)
            .field("peer_window", &self.peer_window)
            .field("pending_out_bytes", &self.pending_out_bytes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;

    #[async_trait::async_trait]
    impl ChannelHandler for NullHandler {
        async fn on_data(&mut self, _data: &[u8]) -> PassageResult<()> {
            Ok(())
        }
        async fn on_eof(&mut self) -> PassageResult<()> {
            Ok(())
        }
        async fn on_request(&mut self, _t: &str, _b: &[u8]) -> PassageResult<bool> {
            Ok(false)
        }
    }

    fn channel(peer_window: u32, max_packet: u32) -> Channel {
        Channel::new(
            ChannelInit {
                local_id: 0,
                peer_id: 7,
                peer_window,
                max_packet,
            },
            Box::new(NullHandler),
        )
    }

    #[test]
    fn test_local_window_accounting() {
        let mut ch = channel(1000, 1000);
        assert_eq!(ch.local_window(), RECEIVE_WINDOW);

        ch.consume_local_window(100).unwrap();
        assert_eq!(ch.local_window(), RECEIVE_WINDOW - 100);

        // nothing to refill while above half
        assert!(ch.refill_local_window().is_none());

        ch.consume_local_window((RECEIVE_WINDOW / 2) as usize).unwrap();
        let credit = ch.refill_local_window().unwrap();
        assert_eq!(ch.local_window(), RECEIVE_WINDOW);
        assert_eq!(credit, RECEIVE_WINDOW / 2 + 100);
    }

    #[test]
    fn test_window_violation() {
        let mut ch = channel(1000, 1000);
        ch.consume_local_window(RECEIVE_WINDOW as usize).unwrap();
        assert!(matches!(
            ch.consume_local_window(1),
            Err(PassageError::Protocol(_))
        ));
    }

    #[test]
    fn test_send_respects_peer_window() {
        // the window-exhaustion scenario: 5 byte window, 10 byte payload
        let mut ch = channel(5, 32768);
        ch.queue_output(DataStream::Stdout, b"0123456789".to_vec())
            .unwrap();

        let sent = ch.take_sendable();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, b"01234");
        assert_eq!(ch.peer_window(), 0);
        assert!(ch.has_pending_output());

        // nothing more until the peer adjusts
        assert!(ch.take_sendable().is_empty());

        ch.add_peer_window(5);
        let sent = ch.take_sendable();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, b"56789");
        assert!(!ch.has_pending_output());
    }

    #[test]
    fn test_send_respects_max_packet() {
        let mut ch = channel(1 << 20, 4);
        ch.queue_output(DataStream::Stdout, b"abcdefgh".to_vec())
            .unwrap();

        let sent = ch.take_sendable();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, b"abcd");
        assert_eq!(sent[1].1, b"efgh");
    }

    #[test]
    fn test_peer_window_debit_exact() {
        let mut ch = channel(100, 32768);
        ch.queue_output(DataStream::Stdout, vec![0u8; 30]).unwrap();
        let sent = ch.take_sendable();
        assert_eq!(sent[0].1.len(), 30);
        assert_eq!(ch.peer_window(), 70);
    }

    #[test]
    fn test_send_buffer_overflow() {
        let mut ch = channel(0, 32768);
        ch.queue_output(DataStream::Stdout, vec![0u8; SEND_BUFFER_LIMIT])
            .unwrap();
        assert!(matches!(
            ch.queue_output(DataStream::Stdout, vec![0u8; 1]),
            Err(PassageError::Resource(_))
        ));
    }

    #[test]
    fn test_stderr_stream_tagged() {
        let mut ch = channel(100, 32768);
        ch.queue_output(DataStream::Stderr, b"oops".to_vec()).unwrap();
        let sent = ch.take_sendable();
        assert_eq!(sent[0].0, DataStream::Stderr);
    }

    #[test]
    fn test_lifecycle_states() {
        let mut ch = channel(100, 100);
        assert_eq!(ch.state(), ChannelState::Opening);

        ch.confirm();
        assert_eq!(ch.state(), ChannelState::Open);

        ch.mark_eof_received();
        assert_eq!(ch.state(), ChannelState::EofReceived);

        ch.mark_close_received();
        assert_eq!(ch.state(), ChannelState::Closing);
        assert!(!ch.fully_closed());

        ch.mark_close_sent();
        assert_eq!(ch.state(), ChannelState::Closed);
        assert!(ch.fully_closed());
    }

    #[test]
    fn test_close_order_symmetric() {
        let mut ch = channel(100, 100);
        ch.confirm();
        ch.mark_close_sent();
        assert_eq!(ch.state(), ChannelState::Closing);
        ch.mark_close_received();
        assert!(ch.fully_closed());
    }
}
