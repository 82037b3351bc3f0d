//! SSH (Secure Shell) server protocol implementation.
//!
//! This module implements the server side of the SSH protocol according
//! to RFC 4251-4254, structured in layers:
//!
//! 1. **Wire primitives** ([`wire`]) - u8..u64, string, mpint, name-list
//! 2. **Packet layer** ([`packet`], [`crypto`]) - Framing, padding,
//!    encryption and MAC under per-direction crypto contexts
//! 3. **Transport layer** ([`transport`], [`kex`], [`kex_dh`]) - Version
//!    exchange, key exchange, rekeying
//! 4. **Authentication layer** ([`auth`]) - none / password / publickey
//! 5. **Connection layer** ([`connection`], [`channel`], [`session`],
//!    [`direct_tcpip`]) - Channel multiplexing, windows, requests
//! 6. **Server** ([`server`]) - Listener and per-connection engine
//!
//! Inbound bytes flow socket → packet layer (decrypt, verify MAC, strip
//! padding, check sequence) → dispatcher (transport/KEX → auth →
//! connection). Outbound, every component serializes a payload through
//! [`wire::PacketWriter`] and the packet layer adds padding, encrypts
//! and MACs it.

pub mod auth;
pub mod authorized_keys;
pub mod buffered;
pub mod channel;
pub mod connection;
pub mod crypto;
pub mod direct_tcpip;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod message;
pub mod packet;
pub mod privatekey;
pub mod server;
pub mod session;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use auth::AuthEngine;
pub use authorized_keys::{AuthorizedKey, AuthorizedKeysFile};
pub use buffered::BufferedChannel;
pub use channel::{
    Channel, ChannelEvent, ChannelHandler, ChannelInit, ChannelState, DataStream, Finish,
    RECEIVE_WINDOW,
};
pub use connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelRequest, ChannelSuccess,
    ChannelWindowAdjust, DirectTcpipOpen,
};
pub use crypto::{CipherAlgorithm, KeyMaterial, MacAlgorithm, OpeningContext, SealingContext};
pub use direct_tcpip::DirectTcpipChannel;
pub use hostkey::{
    verify_ssh_signature, EcdsaP256HostKey, Ed25519HostKey, HostKey, HostKeyAlgorithm, RsaHostKey,
};
pub use kex::{negotiate, ExchangeTranscript, KexAlgorithms, KexInit, KexMethod};
pub use message::{ChannelOpenFailureReason, DisconnectReason, MessageType};
pub use packet::{MAX_PACKET_SIZE, MIN_PACKET_SIZE};
pub use server::{ServerConfig, ServerSession, SshServer};
pub use session::{SessionChannel, SessionConfig};
pub use transport::Transport;
pub use version::Version;
pub use wire::{PacketReader, PacketWriter};
