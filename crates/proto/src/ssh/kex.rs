//! SSH key exchange (RFC 4253 Section 7).
//!
//! This module implements the server side of key exchange:
//!
//! - SSH_MSG_KEXINIT build, parse and algorithm negotiation
//! - The ECDH exchange responder (SSH_MSG_KEX_ECDH_INIT →
//!   SSH_MSG_KEX_ECDH_REPLY) for all offered methods
//! - The exchange hash H and derivation of the new crypto context pair
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client preference the server
//!    supports wins; no match disconnects with KEY_EXCHANGE_FAILED)
//! 3. Client sends its ephemeral public key, the server replies with
//!    host key blob, its own ephemeral and a signature over H
//! 4. Both sides send SSH_MSG_NEWKEYS and install the derived contexts
//!
//! The first exchange hash becomes the session identifier and never
//! changes across rekeys.

use crate::ssh::crypto::{
    CipherAlgorithm, KeyMaterial, MacAlgorithm, OpeningContext, SealingContext,
};
use crate::ssh::hostkey::HostKey;
use crate::ssh::kex_dh::{Curve25519Exchange, DhGroup14Exchange, EcdhP256Exchange};
use crate::ssh::message::MessageType;
use crate::ssh::wire::{PacketReader, PacketWriter};
use passage_platform::{PassageError, PassageResult};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Size of the random KEXINIT cookie.
pub const KEX_COOKIE_SIZE: usize = 16;

/// Key exchange methods offered by the server, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexMethod {
    /// curve25519-sha256 (and the @libssh.org alias)
    Curve25519,
    /// ecdh-sha2-nistp256
    EcdhP256,
    /// diffie-hellman-group14-sha256
    DhGroup14,
}

impl KexMethod {
    /// Parses a negotiated method name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "curve25519-sha256" | "curve25519-sha256@libssh.org" => Some(KexMethod::Curve25519),
            "ecdh-sha2-nistp256" => Some(KexMethod::EcdhP256),
            "diffie-hellman-group14-sha256" => Some(KexMethod::DhGroup14),
            _ => None,
        }
    }
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Carries a random cookie and ten name-lists of algorithm preferences,
/// most preferred first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie (16 bytes)
    pub cookie: [u8; KEX_COOKIE_SIZE],
    /// Key exchange algorithms
    pub kex_algorithms: Vec<String>,
    /// Server host key algorithms
    pub server_host_key_algorithms: Vec<String>,
    /// Encryption algorithms client to server
    pub encryption_client_to_server: Vec<String>,
    /// Encryption algorithms server to client
    pub encryption_server_to_client: Vec<String>,
    /// MAC algorithms client to server
    pub mac_client_to_server: Vec<String>,
    /// MAC algorithms server to client
    pub mac_server_to_client: Vec<String>,
    /// Compression algorithms client to server
    pub compression_client_to_server: Vec<String>,
    /// Compression algorithms server to client
    pub compression_server_to_client: Vec<String>,
    /// Languages client to server (usually empty)
    pub languages_client_to_server: Vec<String>,
    /// Languages server to client (usually empty)
    pub languages_server_to_client: Vec<String>,
    /// Whether a guessed first KEX packet follows
    pub first_kex_packet_follows: bool,
}

impl KexInit {
    /// Creates the server's KEXINIT for a host key of the given
    /// algorithm name.
    pub fn server_default(host_key_algorithm: &str) -> Self {
        let mut cookie = [0u8; KEX_COOKIE_SIZE];
        rand::thread_rng().fill_bytes(&mut cookie);

        let ciphers: Vec<String> = [
            "chacha20-poly1305@openssh.com",
            "aes256-gcm@openssh.com",
            "aes128-gcm@openssh.com",
            "aes256-ctr",
            "aes128-ctr",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let macs: Vec<String> = ["hmac-sha2-256", "hmac-sha2-512"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        Self {
            cookie,
            kex_algorithms: vec![
                "curve25519-sha256".to_string(),
                "curve25519-sha256@libssh.org".to_string(),
                "ecdh-sha2-nistp256".to_string(),
                "diffie-hellman-group14-sha256".to_string(),
            ],
            server_host_key_algorithms: vec![host_key_algorithm.to_string()],
            encryption_client_to_server: ciphers.clone(),
            encryption_server_to_client: ciphers,
            mac_client_to_server: macs.clone(),
            mac_server_to_client: macs,
            compression_client_to_server: vec!["none".to_string()],
            compression_server_to_client: vec!["none".to_string()],
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Serializes the message, including the leading message number.
    pub fn to_bytes(&self) -> PassageResult<Vec<u8>> {
        let mut w = PacketWriter::new();
        w.put_u8(MessageType::KexInit as u8)?;
        w.put_raw(&self.cookie)?;
        w.put_name_list(&self.kex_algorithms)?;
        w.put_name_list(&self.server_host_key_algorithms)?;
        w.put_name_list(&self.encryption_client_to_server)?;
        w.put_name_list(&self.encryption_server_to_client)?;
        w.put_name_list(&self.mac_client_to_server)?;
        w.put_name_list(&self.mac_server_to_client)?;
        w.put_name_list(&self.compression_client_to_server)?;
        w.put_name_list(&self.compression_server_to_client)?;
        w.put_name_list(&self.languages_client_to_server)?;
        w.put_name_list(&self.languages_server_to_client)?;
        w.put_bool(self.first_kex_packet_follows)?;
        w.put_u32(0)?; // reserved
        Ok(w.into_bytes())
    }

    /// Parses a KEXINIT payload (including the message number).
    pub fn from_bytes(payload: &[u8]) -> PassageResult<Self> {
        let mut r = PacketReader::new(payload);
        r.expect_msg(MessageType::KexInit)?;

        let cookie: [u8; KEX_COOKIE_SIZE] = r
            .take(KEX_COOKIE_SIZE)?
            .try_into()
            .expect("fixed-size cookie");

        let kex_algorithms = r.get_name_list()?;
        let server_host_key_algorithms = r.get_name_list()?;
        let encryption_client_to_server = r.get_name_list()?;
        let encryption_server_to_client = r.get_name_list()?;
        let mac_client_to_server = r.get_name_list()?;
        let mac_server_to_client = r.get_name_list()?;
        let compression_client_to_server = r.get_name_list()?;
        let compression_server_to_client = r.get_name_list()?;
        let languages_client_to_server = r.get_name_list()?;
        let languages_server_to_client = r.get_name_list()?;
        let first_kex_packet_follows = r.get_bool()?;
        let _reserved = r.get_u32()?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_client_to_server,
            encryption_server_to_client,
            mac_client_to_server,
            mac_server_to_client,
            compression_client_to_server,
            compression_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// The algorithm set agreed by negotiation.
#[derive(Debug, Clone)]
pub struct KexAlgorithms {
    /// Key exchange method.
    pub kex: KexMethod,
    /// Host key algorithm name.
    pub host_key: String,
    /// Cipher for client-to-server packets.
    pub cipher_client_to_server: CipherAlgorithm,
    /// Cipher for server-to-client packets.
    pub cipher_server_to_client: CipherAlgorithm,
    /// MAC for client-to-server packets (None for AEAD).
    pub mac_client_to_server: Option<MacAlgorithm>,
    /// MAC for server-to-client packets (None for AEAD).
    pub mac_server_to_client: Option<MacAlgorithm>,
}

fn pick(client: &[String], server: &[String], what: &str) -> PassageResult<String> {
    client
        .iter()
        .find(|name| server.contains(name))
        .cloned()
        .ok_or_else(|| {
            PassageError::Protocol(format!(
                "no common {} algorithm (client offered: {})",
                what,
                client.join(",")
            ))
        })
}

/// Negotiates the algorithm set from both KEXINIT messages: for each
/// list, the first client preference the server also supports.
pub fn negotiate(client: &KexInit, server: &KexInit) -> PassageResult<KexAlgorithms> {
    let kex_name = pick(&client.kex_algorithms, &server.kex_algorithms, "kex")?;
    let kex = KexMethod::from_name(&kex_name).ok_or_else(|| {
        PassageError::Protocol(format!("negotiated unknown kex algorithm {}", kex_name))
    })?;

    let host_key = pick(
        &client.server_host_key_algorithms,
        &server.server_host_key_algorithms,
        "host key",
    )?;

    let cipher_c2s_name = pick(
        &client.encryption_client_to_server,
        &server.encryption_client_to_server,
        "client-to-server cipher",
    )?;
    let cipher_s2c_name = pick(
        &client.encryption_server_to_client,
        &server.encryption_server_to_client,
        "server-to-client cipher",
    )?;

    let cipher_client_to_server = CipherAlgorithm::from_name(&cipher_c2s_name).ok_or_else(|| {
        PassageError::Protocol(format!("negotiated unknown cipher {}", cipher_c2s_name))
    })?;
    let cipher_server_to_client = CipherAlgorithm::from_name(&cipher_s2c_name).ok_or_else(|| {
        PassageError::Protocol(format!("negotiated unknown cipher {}", cipher_s2c_name))
    })?;

    // AEAD ciphers imply their own integrity; the MAC lists only matter
    // for CTR modes
    let mac_client_to_server = if cipher_client_to_server.needs_mac() {
        let name = pick(
            &client.mac_client_to_server,
            &server.mac_client_to_server,
            "client-to-server MAC",
        )?;
        Some(MacAlgorithm::from_name(&name).ok_or_else(|| {
            PassageError::Protocol(format!("negotiated unknown MAC {}", name))
        })?)
    } else {
        None
    };
    let mac_server_to_client = if cipher_server_to_client.needs_mac() {
        let name = pick(
            &client.mac_server_to_client,
            &server.mac_server_to_client,
            "server-to-client MAC",
        )?;
        Some(MacAlgorithm::from_name(&name).ok_or_else(|| {
            PassageError::Protocol(format!("negotiated unknown MAC {}", name))
        })?)
    } else {
        None
    };

    // only "none" compression is supported
    pick(
        &client.compression_client_to_server,
        &server.compression_client_to_server,
        "compression",
    )?;
    pick(
        &client.compression_server_to_client,
        &server.compression_server_to_client,
        "compression",
    )?;

    Ok(KexAlgorithms {
        kex,
        host_key,
        cipher_client_to_server,
        cipher_server_to_client,
        mac_client_to_server,
        mac_server_to_client,
    })
}

/// Transcript inputs to the exchange hash.
#[derive(Debug, Clone)]
pub struct ExchangeTranscript {
    /// Client identification line, without CR LF.
    pub client_version: String,
    /// Server identification line, without CR LF.
    pub server_version: String,
    /// Client KEXINIT payload I_C.
    pub client_kexinit: Vec<u8>,
    /// Server KEXINIT payload I_S.
    pub server_kexinit: Vec<u8>,
}

/// Computes the exchange hash H (RFC 4253 Section 8 / RFC 5656):
///
/// ```text
/// H = SHA-256(string V_C || string V_S || string I_C || string I_S ||
///             string K_S || string Q_C || string Q_S || mpint K)
/// ```
pub fn exchange_hash(
    transcript: &ExchangeTranscript,
    host_key_blob: &[u8],
    client_ephemeral: &[u8],
    server_ephemeral: &[u8],
    shared_secret: &[u8],
) -> PassageResult<Vec<u8>> {
    let mut w = PacketWriter::new();
    w.put_str(&transcript.client_version)?;
    w.put_str(&transcript.server_version)?;
    w.put_string(&transcript.client_kexinit)?;
    w.put_string(&transcript.server_kexinit)?;
    w.put_string(host_key_blob)?;
    w.put_string(client_ephemeral)?;
    w.put_string(server_ephemeral)?;
    w.put_mpint(shared_secret)?;

    Ok(Sha256::digest(w.as_slice()).to_vec())
}

/// Result of answering an ECDH exchange: the reply payload plus the
/// secrets needed to derive keys.
pub struct KexOutcome {
    /// SSH_MSG_KEX_ECDH_REPLY payload.
    pub reply: Vec<u8>,
    /// Exchange hash H; becomes the session id on first exchange.
    pub exchange_hash: Vec<u8>,
    /// Shared secret K.
    pub shared_secret: Vec<u8>,
}

impl Drop for KexOutcome {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

/// Answers an SSH_MSG_KEX_ECDH_INIT with a fresh server ephemeral.
///
/// Generates the ephemeral key pair for the negotiated method, computes
/// K and H, and signs H with the host key.
pub fn respond_ecdh_init(
    method: KexMethod,
    transcript: &ExchangeTranscript,
    host_key: &dyn HostKey,
    ecdh_init_payload: &[u8],
) -> PassageResult<KexOutcome> {
    let ephemeral = match method {
        KexMethod::Curve25519 => {
            let mut scalar = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut scalar);
            Ephemeral::Curve25519(scalar)
        }
        KexMethod::EcdhP256 => Ephemeral::P256(EcdhP256Exchange::new()),
        KexMethod::DhGroup14 => Ephemeral::Group14(DhGroup14Exchange::new()),
    };
    respond_with_ephemeral(ephemeral, transcript, host_key, ecdh_init_payload)
}

enum Ephemeral {
    Curve25519([u8; 32]),
    P256(EcdhP256Exchange),
    Group14(DhGroup14Exchange),
}

fn respond_with_ephemeral(
    ephemeral: Ephemeral,
    transcript: &ExchangeTranscript,
    host_key: &dyn HostKey,
    ecdh_init_payload: &[u8],
) -> PassageResult<KexOutcome> {
    let mut r = PacketReader::new(ecdh_init_payload);
    r.expect_msg(MessageType::EcdhKexInit)?;
    let client_ephemeral = match ephemeral {
        // classic DH carries the client value as an mpint
        Ephemeral::Group14(_) => r.get_mpint()?.to_vec(),
        _ => r.get_string()?.to_vec(),
    };

    let (server_ephemeral, shared_secret) = match ephemeral {
        Ephemeral::Curve25519(scalar) => {
            let exchange = Curve25519Exchange::from_scalar(scalar);
            let public = exchange.public_key().to_vec();
            let secret = exchange.compute_shared_secret(&client_ephemeral)?;
            (public, secret)
        }
        Ephemeral::P256(exchange) => {
            let public = exchange.public_key().to_vec();
            let secret = exchange.compute_shared_secret(&client_ephemeral)?;
            (public, secret)
        }
        Ephemeral::Group14(exchange) => {
            let public = exchange.public_key().to_vec();
            let secret = exchange.compute_shared_secret(&client_ephemeral)?;
            (public, secret)
        }
    };

    let host_key_blob = host_key.public_key_blob();
    let hash = exchange_hash(
        transcript,
        &host_key_blob,
        &client_ephemeral,
        &server_ephemeral,
        &shared_secret,
    )?;

    let signature = host_key.sign(&hash)?;

    let mut w = PacketWriter::new();
    w.put_u8(MessageType::EcdhKexInitReply as u8)?;
    w.put_string(&host_key_blob)?;
    w.put_string(&server_ephemeral)?;
    w.put_string(&signature)?;

    Ok(KexOutcome {
        reply: w.into_bytes(),
        exchange_hash: hash,
        shared_secret,
    })
}

/// Derives the pending context pair for the server from a completed
/// exchange: sealing for server-to-client, opening for client-to-server.
pub fn derive_contexts(
    algorithms: &KexAlgorithms,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
) -> PassageResult<(SealingContext, OpeningContext)> {
    let send_keys = KeyMaterial::derive(
        algorithms.cipher_server_to_client,
        algorithms.mac_server_to_client,
        shared_secret,
        exchange_hash,
        session_id,
        false,
    )?;
    let recv_keys = KeyMaterial::derive(
        algorithms.cipher_client_to_server,
        algorithms.mac_client_to_server,
        shared_secret,
        exchange_hash,
        session_id,
        true,
    )?;

    let seal = SealingContext::new(
        algorithms.cipher_server_to_client,
        algorithms.mac_server_to_client,
        &send_keys,
    )?;
    let open = OpeningContext::new(
        algorithms.cipher_client_to_server,
        algorithms.mac_client_to_server,
        &recv_keys,
    )?;

    Ok((seal, open))
}
