//! SSH connection protocol messages (RFC 4254).
//!
//! Typed encode/decode for every channel-multiplexing message the
//! server handles. The dispatch logic that consumes these lives in the
//! server engine; the channel behaviors live in
//! [`channel`](crate::ssh::channel) and its implementations.
//!
//! All `to_bytes` forms include the leading message number; all
//! `from_bytes` forms expect it.

use crate::ssh::message::{ChannelOpenFailureReason, MessageType};
use crate::ssh::wire::{PacketReader, PacketWriter};
use passage_platform::{PassageError, PassageResult};

/// SSH_MSG_CHANNEL_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type ("session", "direct-tcpip", ...).
    pub channel_type: String,
    /// Peer's channel id.
    pub sender_channel: u32,
    /// Peer's initial receive window.
    pub initial_window: u32,
    /// Peer's maximum packet size.
    pub max_packet: u32,
    /// Type-specific trailing fields, unparsed.
    pub type_specific: Vec<u8>,
}

impl ChannelOpen {
    /// Parses a CHANNEL_OPEN payload.
    pub fn from_bytes(payload: &[u8]) -> PassageResult<Self> {
        let mut r = PacketReader::new(payload);
        r.expect_msg(MessageType::ChannelOpen)?;
        Ok(Self {
            channel_type: r.get_str()?.to_string(),
            sender_channel: r.get_u32()?,
            initial_window: r.get_u32()?,
            max_packet: r.get_u32()?,
            type_specific: r.rest().to_vec(),
        })
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> PassageResult<Vec<u8>> {
        let mut w = PacketWriter::new();
        w.put_u8(MessageType::ChannelOpen as u8)?;
        w.put_str(&self.channel_type)?;
        w.put_u32(self.sender_channel)?;
        w.put_u32(self.initial_window)?;
        w.put_u32(self.max_packet)?;
        w.put_raw(&self.type_specific)?;
        Ok(w.into_bytes())
    }
}

/// The type-specific body of a "direct-tcpip" CHANNEL_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectTcpipOpen {
    /// Host the client asks us to connect to.
    pub host: String,
    /// Port to connect to.
    pub port: u32,
    /// Originator address reported by the client.
    pub originator_host: String,
    /// Originator port.
    pub originator_port: u32,
}

impl DirectTcpipOpen {
    /// Parses the type-specific fields of a direct-tcpip open.
    pub fn from_bytes(type_specific: &[u8]) -> PassageResult<Self> {
        let mut r = PacketReader::new(type_specific);
        Ok(Self {
            host: r.get_str()?.to_string(),
            port: r.get_u32()?,
            originator_host: r.get_str()?.to_string(),
            originator_port: r.get_u32()?,
        })
    }

    /// Serializes the type-specific fields.
    pub fn to_bytes(&self) -> PassageResult<Vec<u8>> {
        let mut w = PacketWriter::new();
        w.put_str(&self.host)?;
        w.put_u32(self.port)?;
        w.put_str(&self.originator_host)?;
        w.put_u32(self.originator_port)?;
        Ok(w.into_bytes())
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Peer's channel id.
    pub recipient_channel: u32,
    /// Our channel id.
    pub sender_channel: u32,
    /// Our initial receive window.
    pub initial_window: u32,
    /// Our maximum packet size.
    pub max_packet: u32,
}

impl ChannelOpenConfirmation {
    /// Serializes the message.
    pub fn to_bytes(&self) -> PassageResult<Vec<u8>> {
        let mut w = PacketWriter::new();
        w.put_u8(MessageType::ChannelOpenConfirmation as u8)?;
        w.put_u32(self.recipient_channel)?;
        w.put_u32(self.sender_channel)?;
        w.put_u32(self.initial_window)?;
        w.put_u32(self.max_packet)?;
        Ok(w.into_bytes())
    }

    /// Parses the message.
    pub fn from_bytes(payload: &[u8]) -> PassageResult<Self> {
        let mut r = PacketReader::new(payload);
        r.expect_msg(MessageType::ChannelOpenConfirmation)?;
        Ok(Self {
            recipient_channel: r.get_u32()?,
            sender_channel: r.get_u32()?,
            initial_window: r.get_u32()?,
            max_packet: r.get_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// Peer's channel id.
    pub recipient_channel: u32,
    /// Failure reason code.
    pub reason: ChannelOpenFailureReason,
    /// Human-readable description.
    pub description: String,
}

impl ChannelOpenFailure {
    /// Serializes the message.
    pub fn to_bytes(&self) -> PassageResult<Vec<u8>> {
        let mut w = PacketWriter::new();
        w.put_u8(MessageType::ChannelOpenFailure as u8)?;
        w.put_u32(self.recipient_channel)?;
        w.put_u32(self.reason as u32)?;
        w.put_str(&self.description)?;
        w.put_str("")?; // language tag
        Ok(w.into_bytes())
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    /// Peer's channel id.
    pub recipient_channel: u32,
    /// Bytes to add to the window.
    pub additional: u32,
}

impl ChannelWindowAdjust {
    /// Serializes the message.
    pub fn to_bytes(&self) -> PassageResult<Vec<u8>> {
        let mut w = PacketWriter::new();
        w.put_u8(MessageType::ChannelWindowAdjust as u8)?;
        w.put_u32(self.recipient_channel)?;
        w.put_u32(self.additional)?;
        Ok(w.into_bytes())
    }

    /// Parses the message.
    pub fn from_bytes(payload: &[u8]) -> PassageResult<Self> {
        let mut r = PacketReader::new(payload);
        r.expect_msg(MessageType::ChannelWindowAdjust)?;
        Ok(Self {
            recipient_channel: r.get_u32()?,
            additional: r.get_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Peer's channel id.
    pub recipient_channel: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl ChannelData {
    /// Serializes the message.
    pub fn to_bytes(&self) -> PassageResult<Vec<u8>> {
        let mut w = PacketWriter::new();
        w.put_u8(MessageType::ChannelData as u8)?;
        w.put_u32(self.recipient_channel)?;
        w.put_string(&self.data)?;
        Ok(w.into_bytes())
    }

    /// Parses the message.
    pub fn from_bytes(payload: &[u8]) -> PassageResult<Self> {
        let mut r = PacketReader::new(payload);
        r.expect_msg(MessageType::ChannelData)?;
        Ok(Self {
            recipient_channel: r.get_u32()?,
            data: r.get_string()?.to_vec(),
        })
    }
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    /// Peer's channel id.
    pub recipient_channel: u32,
    /// Extended data type (1 = stderr).
    pub data_type: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Serializes the message.
    pub fn to_bytes(&self) -> PassageResult<Vec<u8>> {
        let mut w = PacketWriter::new();
        w.put_u8(MessageType::ChannelExtendedData as u8)?;
        w.put_u32(self.recipient_channel)?;
        w.put_u32(self.data_type)?;
        w.put_string(&self.data)?;
        Ok(w.into_bytes())
    }

    /// Parses the message.
    pub fn from_bytes(payload: &[u8]) -> PassageResult<Self> {
        let mut r = PacketReader::new(payload);
        r.expect_msg(MessageType::ChannelExtendedData)?;
        Ok(Self {
            recipient_channel: r.get_u32()?,
            data_type: r.get_u32()?,
            data: r.get_string()?.to_vec(),
        })
    }
}

/// SSH_MSG_CHANNEL_EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEof {
    /// Peer's channel id.
    pub recipient_channel: u32,
}

impl ChannelEof {
    /// Serializes the message.
    pub fn to_bytes(&self) -> PassageResult<Vec<u8>> {
        let mut w = PacketWriter::new();
        w.put_u8(MessageType::ChannelEof as u8)?;
        w.put_u32(self.recipient_channel)?;
        Ok(w.into_bytes())
    }

    /// Parses the message.
    pub fn from_bytes(payload: &[u8]) -> PassageResult<Self> {
        let mut r = PacketReader::new(payload);
        r.expect_msg(MessageType::ChannelEof)?;
        Ok(Self {
            recipient_channel: r.get_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_CLOSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClose {
    /// Peer's channel id.
    pub recipient_channel: u32,
}

impl ChannelClose {
    /// Serializes the message.
    pub fn to_bytes(&self) -> PassageResult<Vec<u8>> {
        let mut w = PacketWriter::new();
        w.put_u8(MessageType::ChannelClose as u8)?;
        w.put_u32(self.recipient_channel)?;
        Ok(w.into_bytes())
    }

    /// Parses the message.
    pub fn from_bytes(payload: &[u8]) -> PassageResult<Self> {
        let mut r = PacketReader::new(payload);
        r.expect_msg(MessageType::ChannelClose)?;
        Ok(Self {
            recipient_channel: r.get_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Peer's channel id.
    pub recipient_channel: u32,
    /// Request type ("pty-req", "exec", "exit-status", ...).
    pub request_type: String,
    /// Whether the peer wants SUCCESS/FAILURE.
    pub want_reply: bool,
    /// Type-specific trailing fields, unparsed.
    pub type_specific: Vec<u8>,
}

impl ChannelRequest {
    /// Serializes the message.
    pub fn to_bytes(&self) -> PassageResult<Vec<u8>> {
        let mut w = PacketWriter::new();
        w.put_u8(MessageType::ChannelRequest as u8)?;
        w.put_u32(self.recipient_channel)?;
        w.put_str(&self.request_type)?;
        w.put_bool(self.want_reply)?;
        w.put_raw(&self.type_specific)?;
        Ok(w.into_bytes())
    }

    /// Parses the message.
    pub fn from_bytes(payload: &[u8]) -> PassageResult<Self> {
        let mut r = PacketReader::new(payload);
        r.expect_msg(MessageType::ChannelRequest)?;
        Ok(Self {
            recipient_channel: r.get_u32()?,
            request_type: r.get_str()?.to_string(),
            want_reply: r.get_bool()?,
            type_specific: r.rest().to_vec(),
        })
    }
}

/// SSH_MSG_CHANNEL_SUCCESS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSuccess {
    /// Peer's channel id.
    pub recipient_channel: u32,
}

impl ChannelSuccess {
    /// Serializes the message.
    pub fn to_bytes(&self) -> PassageResult<Vec<u8>> {
        let mut w = PacketWriter::new();
        w.put_u8(MessageType::ChannelSuccess as u8)?;
        w.put_u32(self.recipient_channel)?;
        Ok(w.into_bytes())
    }

    /// Parses the message.
    pub fn from_bytes(payload: &[u8]) -> PassageResult<Self> {
        let mut r = PacketReader::new(payload);
        r.expect_msg(MessageType::ChannelSuccess)?;
        Ok(Self {
            recipient_channel: r.get_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_FAILURE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFailure {
    /// Peer's channel id.
    pub recipient_channel: u32,
}

impl ChannelFailure {
    /// Serializes the message.
    pub fn to_bytes(&self) -> PassageResult<Vec<u8>> {
        let mut w = PacketWriter::new();
        w.put_u8(MessageType::ChannelFailure as u8)?;
        w.put_u32(self.recipient_channel)?;
        Ok(w.into_bytes())
    }

    /// Parses the message.
    pub fn from_bytes(payload: &[u8]) -> PassageResult<Self> {
        let mut r = PacketReader::new(payload);
        r.expect_msg(MessageType::ChannelFailure)?;
        Ok(Self {
            recipient_channel: r.get_u32()?,
        })
    }
}

/// Parsed type-specific body of a "pty-req" channel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// TERM value.
    pub term: String,
    /// Width in columns.
    pub cols: u32,
    /// Height in rows.
    pub rows: u32,
    /// Width in pixels.
    pub pixel_width: u32,
    /// Height in pixels.
    pub pixel_height: u32,
    /// Encoded terminal modes, unparsed.
    pub modes: Vec<u8>,
}

impl PtyRequest {
    /// Parses the type-specific fields.
    pub fn from_bytes(type_specific: &[u8]) -> PassageResult<Self> {
        let mut r = PacketReader::new(type_specific);
        Ok(Self {
            term: r.get_str()?.to_string(),
            cols: r.get_u32()?,
            rows: r.get_u32()?,
            pixel_width: r.get_u32()?,
            pixel_height: r.get_u32()?,
            modes: r.get_string()?.to_vec(),
        })
    }
}

/// Parsed type-specific body of a "window-change" channel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowChange {
    /// Width in columns.
    pub cols: u32,
    /// Height in rows.
    pub rows: u32,
    /// Width in pixels.
    pub pixel_width: u32,
    /// Height in pixels.
    pub pixel_height: u32,
}

impl WindowChange {
    /// Parses the type-specific fields.
    pub fn from_bytes(type_specific: &[u8]) -> PassageResult<Self> {
        let mut r = PacketReader::new(type_specific);
        Ok(Self {
            cols: r.get_u32()?,
            rows: r.get_u32()?,
            pixel_width: r.get_u32()?,
            pixel_height: r.get_u32()?,
        })
    }
}

/// Parses the body of an "env" request into (name, value).
pub fn parse_env(type_specific: &[u8]) -> PassageResult<(String, String)> {
    let mut r = PacketReader::new(type_specific);
    Ok((r.get_str()?.to_string(), r.get_str()?.to_string()))
}

/// Parses the body of an "exec" request into the command line.
pub fn parse_exec(type_specific: &[u8]) -> PassageResult<String> {
    let mut r = PacketReader::new(type_specific);
    Ok(r.get_str()?.to_string())
}

/// Parses the body of a "subsystem" request into the subsystem name.
pub fn parse_subsystem(type_specific: &[u8]) -> PassageResult<String> {
    let mut r = PacketReader::new(type_specific);
    Ok(r.get_str()?.to_string())
}

/// Parses the body of a "signal" request into the signal name (without
/// the SIG prefix).
pub fn parse_signal(type_specific: &[u8]) -> PassageResult<String> {
    let mut r = PacketReader::new(type_specific);
    Ok(r.get_str()?.to_string())
}

/// Builds an "exit-status" channel request body.
pub fn exit_status_request(recipient_channel: u32, status: u32) -> PassageResult<Vec<u8>> {
    let mut body = PacketWriter::new();
    body.put_u32(status)?;
    ChannelRequest {
        recipient_channel,
        request_type: "exit-status".to_string(),
        want_reply: false,
        type_specific: body.into_bytes(),
    }
    .to_bytes()
}

/// Builds an "exit-signal" channel request body from a signal number.
pub fn exit_signal_request(recipient_channel: u32, signal: i32) -> PassageResult<Vec<u8>> {
    let name = match signal {
        1 => "HUP",
        2 => "INT",
        3 => "QUIT",
        6 => "ABRT",
        9 => "KILL",
        13 => "PIPE",
        14 => "ALRM",
        15 => "TERM",
        _ => "KILL",
    };

    let mut body = PacketWriter::new();
    body.put_str(name)?;
    body.put_bool(false)?; // core dumped
    body.put_str("")?; // error message
    body.put_str("")?; // language tag
    ChannelRequest {
        recipient_channel,
        request_type: "exit-signal".to_string(),
        want_reply: false,
        type_specific: body.into_bytes(),
    }
    .to_bytes()
}

/// Validation helper: rejects a data payload that exceeds what the
/// window permits.
pub fn check_window(window: u32, data_len: usize) -> PassageResult<()> {
    if data_len as u64 > window as u64 {
        return Err(PassageError::Protocol(format!(
            "channel data of {} bytes exceeds window of {}",
            data_len, window
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_open_round_trip() {
        let open = ChannelOpen {
            channel_type: "session".to_string(),
            sender_channel: 0,
            initial_window: 0x200000,
            max_packet: 0x8000,
            type_specific: Vec::new(),
        };
        let bytes = open.to_bytes().unwrap();
        assert_eq!(bytes[0], 90);
        assert_eq!(ChannelOpen::from_bytes(&bytes).unwrap(), open);
    }

    #[test]
    fn test_direct_tcpip_open_round_trip() {
        let open = DirectTcpipOpen {
            host: "internal.example".to_string(),
            port: 8080,
            originator_host: "10.0.0.1".to_string(),
            originator_port: 52000,
        };
        let bytes = open.to_bytes().unwrap();
        assert_eq!(DirectTcpipOpen::from_bytes(&bytes).unwrap(), open);
    }

    #[test]
    fn test_channel_data_round_trip() {
        let data = ChannelData {
            recipient_channel: 3,
            data: b"hello channel".to_vec(),
        };
        let bytes = data.to_bytes().unwrap();
        assert_eq!(ChannelData::from_bytes(&bytes).unwrap(), data);
    }

    #[test]
    fn test_channel_request_round_trip() {
        let mut body = PacketWriter::new();
        body.put_str("printf hi").unwrap();

        let request = ChannelRequest {
            recipient_channel: 1,
            request_type: "exec".to_string(),
            want_reply: true,
            type_specific: body.into_bytes(),
        };
        let bytes = request.to_bytes().unwrap();
        let parsed = ChannelRequest::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(parse_exec(&parsed.type_specific).unwrap(), "printf hi");
    }

    #[test]
    fn test_pty_request_parse() {
        let mut w = PacketWriter::new();
        w.put_str("xterm-256color").unwrap();
        w.put_u32(120).unwrap();
        w.put_u32(40).unwrap();
        w.put_u32(0).unwrap();
        w.put_u32(0).unwrap();
        w.put_string(&[]).unwrap();

        let pty = PtyRequest::from_bytes(w.as_slice()).unwrap();
        assert_eq!(pty.term, "xterm-256color");
        assert_eq!(pty.cols, 120);
        assert_eq!(pty.rows, 40);
    }

    #[test]
    fn test_env_parse() {
        let mut w = PacketWriter::new();
        w.put_str("LANG").unwrap();
        w.put_str("C.UTF-8").unwrap();

        let (name, value) = parse_env(w.as_slice()).unwrap();
        assert_eq!(name, "LANG");
        assert_eq!(value, "C.UTF-8");
    }

    #[test]
    fn test_exit_status_request() {
        let bytes = exit_status_request(7, 0).unwrap();
        let parsed = ChannelRequest::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.request_type, "exit-status");
        assert!(!parsed.want_reply);

        let mut r = PacketReader::new(&parsed.type_specific);
        assert_eq!(r.get_u32().unwrap(), 0);
    }

    #[test]
    fn test_exit_signal_request() {
        let bytes = exit_signal_request(7, 15).unwrap();
        let parsed = ChannelRequest::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.request_type, "exit-signal");

        let mut r = PacketReader::new(&parsed.type_specific);
        assert_eq!(r.get_str().unwrap(), "TERM");
    }

    #[test]
    fn test_open_failure_format() {
        let failure = ChannelOpenFailure {
            recipient_channel: 2,
            reason: ChannelOpenFailureReason::AdministrativelyProhibited,
            description: "policy".to_string(),
        };
        let bytes = failure.to_bytes().unwrap();

        let mut r = PacketReader::new(&bytes);
        assert_eq!(r.get_u8().unwrap(), 92);
        assert_eq!(r.get_u32().unwrap(), 2);
        assert_eq!(r.get_u32().unwrap(), 1);
        assert_eq!(r.get_str().unwrap(), "policy");
    }

    #[test]
    fn test_check_window() {
        check_window(10, 10).unwrap();
        assert!(check_window(9, 10).is_err());
    }
}
