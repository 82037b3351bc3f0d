//! SSH protocol engine for the Passage gateway.
//!
//! This crate implements the server side of SSH-2:
//!
//! - **Packet layer** ([`ssh::packet`], [`ssh::wire`]) - Binary packet
//!   protocol and primitive serialization (RFC 4253 Section 6)
//! - **Transport layer** ([`ssh::transport`], [`ssh::kex`],
//!   [`ssh::crypto`]) - Key exchange, encryption, MAC (RFC 4253)
//! - **Authentication layer** ([`ssh::auth`]) - User authentication
//!   (RFC 4252)
//! - **Connection layer** ([`ssh::connection`], [`ssh::channel`]) -
//!   Channels and requests (RFC 4254)
//! - **Server** ([`ssh::server`]) - Listener and per-connection engine
//!
//! Once authenticated, a channel either spawns a child process through
//! the spawn-service contract or proxies a TCP stream; the engine itself
//! never forks.
//!
//! # Security
//!
//! - All packet parsing validates size limits (max 35000 bytes)
//! - Authentication uses constant-time comparisons
//! - Secrets are zeroized on drop using `zeroize`
//! - Modern algorithms preferred: ChaCha20-Poly1305, Curve25519, Ed25519
//! - No `unsafe` code
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ssh;
