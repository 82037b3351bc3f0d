//! SSH message numbers and reason codes (RFC 4253 Section 12,
//! RFC 4254).
//!
//! The protocol assigns fixed numbers per layer: transport-generic
//! (1-19), algorithm negotiation (20-29), key-exchange method (30-49),
//! user authentication (50-79) and the connection protocol (80-127).
//! Each message is declared once in the table below, which generates
//! the enum, the byte conversion and the RFC wire name together so the
//! three can never drift apart.

/// Declares the message table: enum variant, message number and wire
/// name in one place.
macro_rules! message_table {
    ($( $(#[$doc:meta])* $variant:ident = $number:literal as $wire:literal ),+ $(,)?) => {
        /// SSH message types handled by the server.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum MessageType {
            $( $(#[$doc])* $variant = $number, )+
        }

        impl MessageType {
            /// Maps a wire byte to a message type, if known.
            pub fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $( $number => Some(MessageType::$variant), )+
                    _ => None,
                }
            }

            /// The RFC name of the message.
            pub fn name(&self) -> &'static str {
                match self {
                    $( MessageType::$variant => $wire, )+
                }
            }

            #[cfg(test)]
            const ALL: &'static [MessageType] = &[ $( MessageType::$variant, )+ ];
        }
    };
}

message_table! {
    /// Terminates the connection with a reason code.
    Disconnect = 1 as "SSH_MSG_DISCONNECT",
    /// No-op; usable for padding and keep-alive.
    Ignore = 2 as "SSH_MSG_IGNORE",
    /// Answer to a message number the peer does not implement.
    Unimplemented = 3 as "SSH_MSG_UNIMPLEMENTED",
    /// Free-form debugging information.
    Debug = 4 as "SSH_MSG_DEBUG",
    /// Asks for a service ("ssh-userauth").
    ServiceRequest = 5 as "SSH_MSG_SERVICE_REQUEST",
    /// Grants a service request.
    ServiceAccept = 6 as "SSH_MSG_SERVICE_ACCEPT",

    /// Opens algorithm negotiation; carries the ten name-lists.
    KexInit = 20 as "SSH_MSG_KEXINIT",
    /// Switches the sender's direction to the freshly derived keys.
    NewKeys = 21 as "SSH_MSG_NEWKEYS",

    /// Client ephemeral public key (shared with classic DH init).
    EcdhKexInit = 30 as "SSH_MSG_KEX_ECDH_INIT",
    /// Host key blob, server ephemeral and signature over H.
    EcdhKexInitReply = 31 as "SSH_MSG_KEX_ECDH_REPLY",

    /// One authentication attempt.
    UserauthRequest = 50 as "SSH_MSG_USERAUTH_REQUEST",
    /// Attempt rejected; lists the methods that may continue.
    UserauthFailure = 51 as "SSH_MSG_USERAUTH_FAILURE",
    /// Authentication complete.
    UserauthSuccess = 52 as "SSH_MSG_USERAUTH_SUCCESS",
    /// Banner text shown before authentication.
    UserauthBanner = 53 as "SSH_MSG_USERAUTH_BANNER",
    /// The offered public key would be acceptable with a signature.
    UserauthPkOk = 60 as "SSH_MSG_USERAUTH_PK_OK",

    /// Connection-wide request (port forwards and the like).
    GlobalRequest = 80 as "SSH_MSG_GLOBAL_REQUEST",
    /// Global request granted.
    RequestSuccess = 81 as "SSH_MSG_REQUEST_SUCCESS",
    /// Global request refused.
    RequestFailure = 82 as "SSH_MSG_REQUEST_FAILURE",

    /// Opens a channel of a given type.
    ChannelOpen = 90 as "SSH_MSG_CHANNEL_OPEN",
    /// Accepts a channel open; carries our id and window.
    ChannelOpenConfirmation = 91 as "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
    /// Refuses a channel open with a reason code.
    ChannelOpenFailure = 92 as "SSH_MSG_CHANNEL_OPEN_FAILURE",
    /// Grows the sender's receive window.
    ChannelWindowAdjust = 93 as "SSH_MSG_CHANNEL_WINDOW_ADJUST",
    /// Channel payload bytes.
    ChannelData = 94 as "SSH_MSG_CHANNEL_DATA",
    /// Typed out-of-band payload (stderr).
    ChannelExtendedData = 95 as "SSH_MSG_CHANNEL_EXTENDED_DATA",
    /// The sender will transmit no more data on the channel.
    ChannelEof = 96 as "SSH_MSG_CHANNEL_EOF",
    /// Half of the close handshake; the id is freed when both sides
    /// have sent it.
    ChannelClose = 97 as "SSH_MSG_CHANNEL_CLOSE",
    /// Typed per-channel request (pty-req, exec, exit-status, ...).
    ChannelRequest = 98 as "SSH_MSG_CHANNEL_REQUEST",
    /// Channel request granted.
    ChannelSuccess = 99 as "SSH_MSG_CHANNEL_SUCCESS",
    /// Channel request refused.
    ChannelFailure = 100 as "SSH_MSG_CHANNEL_FAILURE",
}

impl MessageType {
    /// True for messages scoped to an already-open channel, i.e. the
    /// connection-protocol range past CHANNEL_OPEN.
    pub fn is_channel(&self) -> bool {
        *self as u8 > MessageType::ChannelOpen as u8
            && *self as u8 <= MessageType::ChannelFailure as u8
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// DISCONNECT reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum DisconnectReason {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    Reserved = 4,
    MacError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}

/// CHANNEL_OPEN_FAILURE reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum ChannelOpenFailureReason {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
}

/// CHANNEL_EXTENDED_DATA type codes (RFC 4254 Section 5.2).
pub const EXTENDED_DATA_STDERR: u32 = 1;
