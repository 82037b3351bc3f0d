//! Packet encryption and integrity (RFC 4253 Section 6, RFC 5647,
//! openssh PROTOCOL.chacha20poly1305).
//!
//! A connection holds one [`SealingContext`] for the send direction and
//! one [`OpeningContext`] for the receive direction. Each context owns
//! its cipher state, optional MAC key and 32-bit packet sequence number;
//! the pair is replaced atomically when NEWKEYS installs the keys of a
//! key exchange. Before the first NEWKEYS both directions run the
//! [`SealingContext::plaintext`] context (no cipher, no MAC).
//!
//! Supported ciphers:
//!
//! - `chacha20-poly1305@openssh.com` - two-key construction: the packet
//!   length is encrypted with its own ChaCha20 key, the body with the
//!   main key, and a Poly1305 tag covers both ciphertexts
//! - `aes128-gcm@openssh.com` / `aes256-gcm@openssh.com` - the length is
//!   associated data; the nonce is the derived IV with its low 64 bits
//!   incremented per packet
//! - `aes128-ctr` / `aes256-ctr` - the whole packet is encrypted with a
//!   running CTR keystream and an HMAC over (sequence || cleartext) is
//!   appended

use crate::ssh::packet::{self, MIN_BLOCK_SIZE};
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use hmac::{Hmac, Mac};
use passage_platform::{PassageError, PassageResult};
use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Cipher algorithm for SSH packet encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// ChaCha20-Poly1305, OpenSSH variant (two keys, encrypted length)
    ChaCha20Poly1305,
    /// AES-128-GCM, OpenSSH variant (length as associated data)
    Aes128Gcm,
    /// AES-256-GCM, OpenSSH variant
    Aes256Gcm,
    /// AES-128-CTR stream cipher with separate HMAC
    Aes128Ctr,
    /// AES-256-CTR stream cipher with separate HMAC
    Aes256Ctr,
}

impl CipherAlgorithm {
    /// Returns the algorithm name used in KEXINIT negotiation.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305@openssh.com",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
        }
    }

    /// Parses a cipher algorithm from its negotiated name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "chacha20-poly1305@openssh.com" => Some(CipherAlgorithm::ChaCha20Poly1305),
            "aes128-gcm@openssh.com" => Some(CipherAlgorithm::Aes128Gcm),
            "aes256-gcm@openssh.com" => Some(CipherAlgorithm::Aes256Gcm),
            "aes128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "aes256-ctr" => Some(CipherAlgorithm::Aes256Ctr),
            _ => None,
        }
    }

    /// Returns the encryption key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            // two ChaCha20 keys: payload and length
            CipherAlgorithm::ChaCha20Poly1305 => 64,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes128Ctr => 16,
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::Aes256Ctr => 32,
        }
    }

    /// Returns the IV size in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 0,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => 12,
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => 16,
        }
    }

    /// Returns the authentication tag size in bytes (0 for non-AEAD).
    pub fn tag_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305
            | CipherAlgorithm::Aes128Gcm
            | CipherAlgorithm::Aes256Gcm => 16,
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => 0,
        }
    }

    /// Returns the block size used for padding alignment.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 8,
            CipherAlgorithm::Aes128Gcm
            | CipherAlgorithm::Aes256Gcm
            | CipherAlgorithm::Aes128Ctr
            | CipherAlgorithm::Aes256Ctr => 16,
        }
    }

    /// Returns true for AEAD ciphers, which keep the 4-byte length out
    /// of the encrypted-and-aligned region.
    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            CipherAlgorithm::ChaCha20Poly1305
                | CipherAlgorithm::Aes128Gcm
                | CipherAlgorithm::Aes256Gcm
        )
    }

    /// Returns true when the cipher needs a separate MAC algorithm.
    pub fn needs_mac(&self) -> bool {
        !self.is_aead()
    }
}

/// MAC algorithm for non-AEAD ciphers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA2-256
    HmacSha256,
    /// HMAC-SHA2-512
    HmacSha512,
}

impl MacAlgorithm {
    /// Returns the algorithm name used in KEXINIT negotiation.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
        }
    }

    /// Parses a MAC algorithm from its negotiated name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            _ => None,
        }
    }

    /// Returns the MAC key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }

    /// Returns the MAC tag size in bytes.
    pub fn tag_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }
}

/// Derives one key from the shared secret per RFC 4253 Section 7.2.
///
/// ```text
/// K1 = HASH(K || H || letter || session_id)
/// Kn = HASH(K || H || K1 || ... || K(n-1))
/// key = K1 || K2 || ... truncated to key_len
/// ```
///
/// `K` is encoded as an mpint. The hash is the key-exchange hash
/// (SHA-256 for every exchange method this server offers).
pub fn derive_key(
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    letter: u8,
    key_len: usize,
) -> PassageResult<Vec<u8>> {
    let mut k_mpint = crate::ssh::wire::PacketWriter::new();
    k_mpint.put_mpint(shared_secret)?;

    let mut output = Vec::with_capacity(key_len);

    let mut hasher = Sha256::new();
    hasher.update(k_mpint.as_slice());
    hasher.update(exchange_hash);
    hasher.update([letter]);
    hasher.update(session_id);
    output.extend_from_slice(&hasher.finalize());

    while output.len() < key_len {
        let mut hasher = Sha256::new();
        hasher.update(k_mpint.as_slice());
        hasher.update(exchange_hash);
        hasher.update(&output);
        output.extend_from_slice(&hasher.finalize());
    }

    output.truncate(key_len);
    Ok(output)
}

/// Key material for one direction, derived after a key exchange.
///
/// Letters follow RFC 4253: IV "A"/"B", encryption key "C"/"D",
/// integrity key "E"/"F" for client-to-server / server-to-client.
pub struct KeyMaterial {
    /// Initial IV.
    pub iv: Vec<u8>,
    /// Encryption key.
    pub enc: Vec<u8>,
    /// Integrity key (unused by AEAD ciphers).
    pub integ: Vec<u8>,
}

impl KeyMaterial {
    /// Derives the material for one direction.
    ///
    /// `client_to_server` selects the letter set; `session_id` is the
    /// exchange hash of the first key exchange of the connection.
    pub fn derive(
        cipher: CipherAlgorithm,
        mac: Option<MacAlgorithm>,
        shared_secret: &[u8],
        exchange_hash: &[u8],
        session_id: &[u8],
        client_to_server: bool,
    ) -> PassageResult<Self> {
        let (iv_letter, enc_letter, integ_letter) = if client_to_server {
            (b'A', b'C', b'E')
        } else {
            (b'B', b'D', b'F')
        };

        let iv = derive_key(
            shared_secret,
            exchange_hash,
            session_id,
            iv_letter,
            cipher.iv_size(),
        )?;
        let enc = derive_key(
            shared_secret,
            exchange_hash,
            session_id,
            enc_letter,
            cipher.key_size(),
        )?;
        let integ = derive_key(
            shared_secret,
            exchange_hash,
            session_id,
            integ_letter,
            mac.map_or(0, |m| m.key_size()),
        )?;

        Ok(Self { iv, enc, integ })
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.iv.zeroize();
        self.enc.zeroize();
        self.integ.zeroize();
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("iv", &"<redacted>")
            .field("enc", &"<redacted>")
            .field("integ", &"<redacted>")
            .finish()
    }
}

struct HmacState {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl HmacState {
    fn compute(&self, seq: u32, clear: &[u8]) -> Vec<u8> {
        match self.algorithm {
            MacAlgorithm::HmacSha256 => {
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.key)
                    .expect("HMAC accepts any key length");
                mac.update(&seq.to_be_bytes());
                mac.update(clear);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha512 => {
                let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(&self.key)
                    .expect("HMAC accepts any key length");
                mac.update(&seq.to_be_bytes());
                mac.update(clear);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    fn verify(&self, seq: u32, clear: &[u8], tag: &[u8]) -> bool {
        let expected = self.compute(seq, clear);
        expected.len() == tag.len() && bool::from(expected.ct_eq(tag))
    }
}

impl Drop for HmacState {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

struct ChaPolyState {
    /// Payload key (first 32 bytes of derived material).
    k_payload: [u8; 32],
    /// Length key (second 32 bytes).
    k_length: [u8; 32],
}

impl ChaPolyState {
    fn new(key: &[u8]) -> PassageResult<Self> {
        if key.len() != 64 {
            return Err(PassageError::Internal(
                "chacha20-poly1305 requires 64 bytes of key material".to_string(),
            ));
        }
        let mut k_payload = [0u8; 32];
        let mut k_length = [0u8; 32];
        k_payload.copy_from_slice(&key[..32]);
        k_length.copy_from_slice(&key[32..]);
        Ok(Self {
            k_payload,
            k_length,
        })
    }

    fn nonce(seq: u32) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[8..].copy_from_slice(&seq.to_be_bytes());
        nonce
    }

    fn crypt_length(&self, seq: u32, length: &mut [u8; 4]) {
        let nonce = Self::nonce(seq);
        let mut cipher = ChaCha20::new(&self.k_length.into(), &nonce.into());
        cipher.apply_keystream(length);
    }

    /// Returns the Poly1305 key and leaves `cipher` positioned at the
    /// start of keystream block 1, where the payload begins.
    fn payload_cipher(&self, seq: u32) -> (ChaCha20, [u8; 32]) {
        let nonce = Self::nonce(seq);
        let mut cipher = ChaCha20::new(&self.k_payload.into(), &nonce.into());
        let mut poly_key = [0u8; 32];
        cipher.apply_keystream(&mut poly_key);
        cipher.seek(64u64);
        (cipher, poly_key)
    }

    fn tag(poly_key: &[u8; 32], data: &[u8]) -> [u8; 16] {
        let poly = Poly1305::new(poly_key.into());
        poly.compute_unpadded(data).into()
    }
}

impl Drop for ChaPolyState {
    fn drop(&mut self) {
        self.k_payload.zeroize();
        self.k_length.zeroize();
    }
}

enum CtrState {
    Aes128(Box<Aes128Ctr>),
    Aes256(Box<Aes256Ctr>),
}

impl CtrState {
    fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> PassageResult<Self> {
        let bad_key =
            || PassageError::Internal("invalid CTR key or IV length".to_string());
        match algorithm {
            CipherAlgorithm::Aes128Ctr => Ok(CtrState::Aes128(Box::new(
                Aes128Ctr::new_from_slices(key, iv).map_err(|_| bad_key())?,
            ))),
            CipherAlgorithm::Aes256Ctr => Ok(CtrState::Aes256(Box::new(
                Aes256Ctr::new_from_slices(key, iv).map_err(|_| bad_key())?,
            ))),
            _ => Err(PassageError::Internal(
                "not a CTR cipher algorithm".to_string(),
            )),
        }
    }

    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            CtrState::Aes128(c) => c.apply_keystream(buf),
            CtrState::Aes256(c) => c.apply_keystream(buf),
        }
    }
}

struct GcmState {
    key: LessSafeKey,
    nonce: [u8; 12],
}

impl GcmState {
    fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> PassageResult<Self> {
        let ring_alg = match algorithm {
            CipherAlgorithm::Aes128Gcm => &AES_128_GCM,
            CipherAlgorithm::Aes256Gcm => &AES_256_GCM,
            _ => {
                return Err(PassageError::Internal(
                    "not a GCM cipher algorithm".to_string(),
                ))
            }
        };
        let unbound = UnboundKey::new(ring_alg, key)
            .map_err(|_| PassageError::Internal("invalid GCM key length".to_string()))?;
        let mut nonce = [0u8; 12];
        if iv.len() != 12 {
            return Err(PassageError::Internal("invalid GCM IV length".to_string()));
        }
        nonce.copy_from_slice(iv);
        Ok(Self {
            key: LessSafeKey::new(unbound),
            nonce,
        })
    }

    fn take_nonce(&mut self) -> Nonce {
        let nonce = Nonce::assume_unique_for_key(self.nonce);
        // RFC 5647: the low 64 bits are an invocation counter
        let mut counter = u64::from_be_bytes(self.nonce[4..].try_into().expect("8 bytes"));
        counter = counter.wrapping_add(1);
        self.nonce[4..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }
}

enum CipherState {
    Plaintext,
    ChaPoly(ChaPolyState),
    Gcm(GcmState),
    Ctr(CtrState, HmacState),
}

fn mac_error() -> PassageError {
    PassageError::Protocol("MAC verification failed".to_string())
}

/// Encrypting context for the send direction.
///
/// Owns the cipher state and the outbound packet sequence number. The
/// sequence number is carried over when a rekey installs a new context;
/// it never resets during a connection.
pub struct SealingContext {
    state: CipherState,
    block_size: usize,
    length_excluded: bool,
    seq: u32,
}

impl SealingContext {
    /// Creates the initial unencrypted context.
    pub fn plaintext() -> Self {
        Self {
            state: CipherState::Plaintext,
            block_size: MIN_BLOCK_SIZE,
            length_excluded: false,
            seq: 0,
        }
    }

    /// Creates a context from negotiated algorithms and derived keys.
    /// The sequence number is installed by the transport when the
    /// context is activated.
    pub fn new(
        cipher: CipherAlgorithm,
        mac: Option<MacAlgorithm>,
        keys: &KeyMaterial,
    ) -> PassageResult<Self> {
        let state = build_cipher_state(cipher, mac, keys)?;
        Ok(Self {
            state,
            block_size: cipher.block_size(),
            length_excluded: cipher.is_aead(),
            seq: 0,
        })
    }

    /// Returns the next outbound sequence number.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Sets the sequence number; used when installing a rekeyed context.
    pub fn set_seq(&mut self, seq: u32) {
        self.seq = seq;
    }

    /// Frames, encrypts and MACs one payload, consuming one sequence
    /// number. Returns the full wire packet.
    pub fn seal(&mut self, payload: &[u8]) -> PassageResult<Vec<u8>> {
        if payload.is_empty() {
            return Err(PassageError::Internal("refusing to seal empty payload".to_string()));
        }

        let mut frame = packet::encode_clear(payload, self.block_size, self.length_excluded);
        let seq = self.seq;

        let out = match &mut self.state {
            CipherState::Plaintext => frame,
            CipherState::ChaPoly(chapoly) => {
                let (len_bytes, body) = frame.split_at_mut(4);
                let mut length: [u8; 4] = len_bytes.try_into().expect("4 bytes");
                chapoly.crypt_length(seq, &mut length);
                len_bytes.copy_from_slice(&length);

                let (mut cipher, poly_key) = chapoly.payload_cipher(seq);
                cipher.apply_keystream(body);

                let tag = ChaPolyState::tag(&poly_key, &frame);
                frame.extend_from_slice(&tag);
                frame
            }
            CipherState::Gcm(gcm) => {
                let nonce = gcm.take_nonce();
                let (len_bytes, body) = frame.split_at_mut(4);
                let aad: [u8; 4] = len_bytes.try_into().expect("4 bytes");
                let tag = gcm
                    .key
                    .seal_in_place_separate_tag(nonce, Aad::from(aad), body)
                    .map_err(|_| PassageError::Internal("GCM seal failed".to_string()))?;
                frame.extend_from_slice(tag.as_ref());
                frame
            }
            CipherState::Ctr(ctr, hmac) => {
                let tag = hmac.compute(seq, &frame);
                ctr.apply(&mut frame);
                frame.extend_from_slice(&tag);
                frame
            }
        };

        self.seq = self.seq.wrapping_add(1);
        Ok(out)
    }
}

/// Decrypting context for the receive direction.
pub struct OpeningContext {
    state: CipherState,
    block_size: usize,
    length_excluded: bool,
    trailer: usize,
    seq: u32,
    /// Decrypted prefix bytes beyond the length field (CTR mode only,
    /// where the keystream cannot be rewound).
    pending: Vec<u8>,
}

impl OpeningContext {
    /// Creates the initial unencrypted context.
    pub fn plaintext() -> Self {
        Self {
            state: CipherState::Plaintext,
            block_size: MIN_BLOCK_SIZE,
            length_excluded: false,
            trailer: 0,
            seq: 0,
            pending: Vec::new(),
        }
    }

    /// Creates a context from negotiated algorithms and derived keys.
    pub fn new(
        cipher: CipherAlgorithm,
        mac: Option<MacAlgorithm>,
        keys: &KeyMaterial,
    ) -> PassageResult<Self> {
        let trailer = if cipher.is_aead() {
            cipher.tag_size()
        } else {
            mac.map_or(0, |m| m.tag_size())
        };
        let state = build_cipher_state(cipher, mac, keys)?;
        Ok(Self {
            state,
            block_size: cipher.block_size(),
            length_excluded: cipher.is_aead(),
            trailer,
            seq: 0,
            pending: Vec::new(),
        })
    }

    /// Returns the next inbound sequence number.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Sets the sequence number; used when installing a rekeyed context.
    pub fn set_seq(&mut self, seq: u32) {
        self.seq = seq;
    }

    /// Number of bytes the transport must read before the packet length
    /// is known: one cipher block for CTR modes, four bytes otherwise.
    pub fn length_prefix_size(&self) -> usize {
        match self.state {
            CipherState::Ctr(..) => self.block_size,
            _ => 4,
        }
    }

    /// MAC or tag bytes that follow the packet body.
    pub fn trailer_size(&self) -> usize {
        self.trailer
    }

    /// Recovers and validates `packet_length` from the first
    /// [`length_prefix_size`](Self::length_prefix_size) wire bytes.
    ///
    /// For CTR modes this consumes keystream; the decrypted remainder of
    /// the block is kept for [`open`](Self::open).
    pub fn decrypt_length(&mut self, prefix: &[u8]) -> PassageResult<usize> {
        if prefix.len() != self.length_prefix_size() {
            return Err(PassageError::Internal(
                "length prefix size mismatch".to_string(),
            ));
        }

        let packet_length = match &mut self.state {
            CipherState::Plaintext | CipherState::Gcm(_) => {
                u32::from_be_bytes(prefix[..4].try_into().expect("4 bytes")) as usize
            }
            CipherState::ChaPoly(chapoly) => {
                let mut length: [u8; 4] = prefix[..4].try_into().expect("4 bytes");
                chapoly.crypt_length(self.seq, &mut length);
                u32::from_be_bytes(length) as usize
            }
            CipherState::Ctr(ctr, _) => {
                let mut block = prefix.to_vec();
                ctr.apply(&mut block);
                let packet_length =
                    u32::from_be_bytes(block[..4].try_into().expect("4 bytes")) as usize;
                self.pending = block.split_off(4);
                packet_length
            }
        };

        packet::check_packet_length(packet_length, self.block_size, self.length_excluded)?;
        Ok(packet_length)
    }

    /// Decrypts and authenticates the rest of the packet, returning the
    /// payload and consuming one sequence number.
    ///
    /// `prefix` is the encrypted length prefix exactly as read from the
    /// wire; `rest` is everything after it including the MAC or tag.
    pub fn open(
        &mut self,
        packet_length: usize,
        prefix: &[u8],
        rest: &[u8],
    ) -> PassageResult<Vec<u8>> {
        let seq = self.seq;

        let body = match &mut self.state {
            CipherState::Plaintext => rest[..packet_length].to_vec(),
            CipherState::ChaPoly(chapoly) => {
                let (ciphertext, tag) = rest.split_at(packet_length);

                let (mut cipher, poly_key) = chapoly.payload_cipher(seq);
                let mut signed = Vec::with_capacity(4 + packet_length);
                signed.extend_from_slice(prefix);
                signed.extend_from_slice(ciphertext);
                let expected = ChaPolyState::tag(&poly_key, &signed);
                if !bool::from(expected.ct_eq(tag)) {
                    return Err(mac_error());
                }

                let mut body = ciphertext.to_vec();
                cipher.apply_keystream(&mut body);
                body
            }
            CipherState::Gcm(gcm) => {
                let nonce = gcm.take_nonce();
                let aad: [u8; 4] = prefix[..4].try_into().expect("4 bytes");
                let mut in_out = rest.to_vec();
                let plain = gcm
                    .key
                    .open_in_place(nonce, Aad::from(aad), &mut in_out)
                    .map_err(|_| mac_error())?;
                plain.to_vec()
            }
            CipherState::Ctr(ctr, hmac) => {
                // pending holds the already-decrypted tail of the first block
                let consumed = self.pending.len();
                let (ciphertext, tag) = rest.split_at(packet_length - consumed);
                let mut clear = Vec::with_capacity(4 + packet_length);
                clear.extend_from_slice(&(packet_length as u32).to_be_bytes());
                clear.append(&mut self.pending);
                let start = clear.len();
                clear.extend_from_slice(ciphertext);
                ctr.apply(&mut clear[start..]);

                if !hmac.verify(seq, &clear, tag) {
                    return Err(mac_error());
                }
                clear.split_off(4)
            }
        };

        self.seq = self.seq.wrapping_add(1);
        packet::decode_clear(&body)
    }
}

fn build_cipher_state(
    cipher: CipherAlgorithm,
    mac: Option<MacAlgorithm>,
    keys: &KeyMaterial,
) -> PassageResult<CipherState> {
    if keys.enc.len() != cipher.key_size() || keys.iv.len() != cipher.iv_size() {
        return Err(PassageError::Internal(format!(
            "bad key material for {}",
            cipher.name()
        )));
    }

    match cipher {
        CipherAlgorithm::ChaCha20Poly1305 => {
            Ok(CipherState::ChaPoly(ChaPolyState::new(&keys.enc)?))
        }
        CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => {
            Ok(CipherState::Gcm(GcmState::new(cipher, &keys.enc, &keys.iv)?))
        }
        CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => {
            let mac = mac.ok_or_else(|| {
                PassageError::Internal(format!("{} requires a MAC algorithm", cipher.name()))
            })?;
            if keys.integ.len() != mac.key_size() {
                return Err(PassageError::Internal("bad MAC key material".to_string()));
            }
            Ok(CipherState::Ctr(
                CtrState::new(cipher, &keys.enc, &keys.iv)?,
                HmacState {
                    algorithm: mac,
                    key: keys.integ.clone(),
                },
            ))
        }
    }
}
