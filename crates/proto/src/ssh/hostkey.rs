//! Host keys and SSH signature handling.
//!
//! The server holds exactly one [`HostKey`]: it emits the public key
//! blob carried in the key-exchange reply and signs exchange hashes.
//! The same wire formats are used in the other direction to verify
//! client public-key authentication signatures
//! ([`verify_ssh_signature`]).
//!
//! # Wire formats
//!
//! Public key blobs and signatures are nested SSH strings:
//!
//! - Ed25519: blob `"ssh-ed25519" || string key`, signature
//!   `"ssh-ed25519" || string sig(64)`
//! - ECDSA P-256 (RFC 5656): blob `"ecdsa-sha2-nistp256" || "nistp256" ||
//!   string point`, signature `"ecdsa-sha2-nistp256" || string (mpint r ||
//!   mpint s)`
//! - RSA (RFC 8332): blob `"ssh-rsa" || mpint e || mpint n`, signature
//!   `"rsa-sha2-256" / "rsa-sha2-512" || string sig`

use crate::ssh::wire::{PacketReader, PacketWriter};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use passage_platform::{PassageError, PassageResult};
use rand::RngCore;
use ring::signature::{
    RsaKeyPair, RsaPublicKeyComponents, RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_2048_8192_SHA512,
    RSA_PKCS1_SHA256, RSA_PKCS1_SHA512,
};

/// Host key algorithm identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    /// Ed25519 (recommended)
    SshEd25519,
    /// ECDSA with P-256 and SHA-256
    EcdsaSha2Nistp256,
    /// RSA with SHA-256
    RsaSha2_256,
    /// RSA with SHA-512
    RsaSha2_512,
}

impl HostKeyAlgorithm {
    /// Returns the algorithm name used in negotiation.
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::EcdsaSha2Nistp256 => "ecdsa-sha2-nistp256",
            HostKeyAlgorithm::RsaSha2_256 => "rsa-sha2-256",
            HostKeyAlgorithm::RsaSha2_512 => "rsa-sha2-512",
        }
    }

    /// Parses an algorithm from its negotiated name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-ed25519" => Some(HostKeyAlgorithm::SshEd25519),
            "ecdsa-sha2-nistp256" => Some(HostKeyAlgorithm::EcdsaSha2Nistp256),
            "rsa-sha2-256" => Some(HostKeyAlgorithm::RsaSha2_256),
            "rsa-sha2-512" => Some(HostKeyAlgorithm::RsaSha2_512),
            _ => None,
        }
    }
}

/// Server host key: emits the public blob and signs exchange hashes.
pub trait HostKey: Send + Sync {
    /// The algorithm this key signs with.
    fn algorithm(&self) -> HostKeyAlgorithm;

    /// The public key in SSH wire format (K_S in the exchange hash).
    fn public_key_blob(&self) -> Vec<u8>;

    /// Signs `data` and returns the signature in SSH wire format.
    fn sign(&self, data: &[u8]) -> PassageResult<Vec<u8>>;

    /// The negotiated algorithm name.
    fn algorithm_name(&self) -> &'static str {
        self.algorithm().name()
    }
}

/// Ed25519 host key (ssh-ed25519).
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519HostKey {
    /// Generates a new random key pair.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::from_seed(&secret)
    }

    /// Creates a key from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Returns the verifying key.
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }
}

impl HostKey for Ed25519HostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshEd25519
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut w = PacketWriter::new();
        // a host key blob cannot overflow the packet bound
        let _ = w.put_str("ssh-ed25519");
        let _ = w.put_string(self.verifying_key.as_bytes());
        w.into_bytes()
    }

    fn sign(&self, data: &[u8]) -> PassageResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);

        let mut w = PacketWriter::new();
        w.put_str("ssh-ed25519")?;
        w.put_string(&signature.to_bytes())?;
        Ok(w.into_bytes())
    }
}

impl std::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("algorithm", &"ssh-ed25519")
            .field("public_key", &hex::encode(self.verifying_key.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// ECDSA P-256 host key (ecdsa-sha2-nistp256).
#[derive(Clone)]
pub struct EcdsaP256HostKey {
    signing_key: p256::ecdsa::SigningKey,
}

impl EcdsaP256HostKey {
    /// Generates a new random key pair.
    pub fn generate() -> Self {
        Self {
            signing_key: p256::ecdsa::SigningKey::random(&mut rand::thread_rng()),
        }
    }

    /// Creates a key from a 32-byte scalar.
    pub fn from_bytes(bytes: &[u8]) -> PassageResult<Self> {
        let signing_key = p256::ecdsa::SigningKey::from_slice(bytes)
            .map_err(|e| PassageError::Config(format!("invalid P-256 private key: {}", e)))?;
        Ok(Self { signing_key })
    }
}

impl HostKey for EcdsaP256HostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::EcdsaSha2Nistp256
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let point = self
            .signing_key
            .verifying_key()
            .to_encoded_point(false);

        let mut w = PacketWriter::new();
        let _ = w.put_str("ecdsa-sha2-nistp256");
        let _ = w.put_str("nistp256");
        let _ = w.put_string(point.as_bytes());
        w.into_bytes()
    }

    fn sign(&self, data: &[u8]) -> PassageResult<Vec<u8>> {
        use p256::ecdsa::signature::Signer as _;
        let signature: p256::ecdsa::Signature = self.signing_key.sign(data);
        let (r, s) = signature.split_bytes();

        // RFC 5656: the signature blob is two mpints, not raw r || s
        let mut inner = PacketWriter::new();
        inner.put_mpint(r.as_slice())?;
        inner.put_mpint(s.as_slice())?;

        let mut w = PacketWriter::new();
        w.put_str("ecdsa-sha2-nistp256")?;
        w.put_string(inner.as_slice())?;
        Ok(w.into_bytes())
    }
}

impl std::fmt::Debug for EcdsaP256HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdsaP256HostKey")
            .field("algorithm", &"ecdsa-sha2-nistp256")
            .finish_non_exhaustive()
    }
}

/// RSA host key signing with SHA-256 or SHA-512 (RFC 8332).
///
/// The public blob always carries the legacy "ssh-rsa" tag; only the
/// signature algorithm name differs. Minimum modulus is 2048 bits,
/// enforced by `ring` when the key is loaded.
pub struct RsaHostKey {
    key_pair: RsaKeyPair,
    algorithm: HostKeyAlgorithm,
    /// Public exponent, big-endian.
    e: Vec<u8>,
    /// Modulus, big-endian.
    n: Vec<u8>,
}

impl RsaHostKey {
    /// Loads an RSA key pair from PKCS#8 DER, signing with SHA-256.
    pub fn from_pkcs8(der: &[u8]) -> PassageResult<Self> {
        Self::from_pkcs8_with_algorithm(der, HostKeyAlgorithm::RsaSha2_256)
    }

    /// Loads an RSA key pair from PKCS#8 DER with an explicit signature
    /// algorithm (rsa-sha2-256 or rsa-sha2-512).
    pub fn from_pkcs8_with_algorithm(
        der: &[u8],
        algorithm: HostKeyAlgorithm,
    ) -> PassageResult<Self> {
        if !matches!(
            algorithm,
            HostKeyAlgorithm::RsaSha2_256 | HostKeyAlgorithm::RsaSha2_512
        ) {
            return Err(PassageError::Config(
                "RSA host key requires an rsa-sha2 algorithm".to_string(),
            ));
        }

        let key_pair = RsaKeyPair::from_pkcs8(der)
            .map_err(|e| PassageError::Config(format!("invalid RSA private key: {}", e)))?;

        let (n, e) = parse_rsa_public_der(key_pair.public().as_ref())?;

        Ok(Self {
            key_pair,
            algorithm,
            e,
            n,
        })
    }
}

impl HostKey for RsaHostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        self.algorithm
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut w = PacketWriter::new();
        let _ = w.put_str("ssh-rsa");
        let _ = w.put_mpint(&self.e);
        let _ = w.put_mpint(&self.n);
        w.into_bytes()
    }

    fn sign(&self, data: &[u8]) -> PassageResult<Vec<u8>> {
        let padding = match self.algorithm {
            HostKeyAlgorithm::RsaSha2_512 => &RSA_PKCS1_SHA512,
            _ => &RSA_PKCS1_SHA256,
        };

        let rng = ring::rand::SystemRandom::new();
        let mut signature = vec![0u8; self.key_pair.public().modulus_len()];
        self.key_pair
            .sign(padding, &rng, data, &mut signature)
            .map_err(|_| PassageError::Internal("RSA signing failed".to_string()))?;

        let mut w = PacketWriter::new();
        w.put_str(self.algorithm.name())?;
        w.put_string(&signature)?;
        Ok(w.into_bytes())
    }
}

impl std::fmt::Debug for RsaHostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaHostKey")
            .field("algorithm", &self.algorithm.name())
            .field("modulus_bits", &(self.n.len() * 8))
            .finish_non_exhaustive()
    }
}

/// Parses a DER-encoded RSAPublicKey (SEQUENCE of two INTEGERs) into
/// (modulus, exponent), both big-endian without leading zeros.
fn parse_rsa_public_der(der: &[u8]) -> PassageResult<(Vec<u8>, Vec<u8>)> {
    fn bad() -> PassageError {
        PassageError::Config("malformed RSA public key DER".to_string())
    }

    fn read_len(der: &[u8], pos: &mut usize) -> PassageResult<usize> {
        let first = *der.get(*pos).ok_or_else(bad)?;
        *pos += 1;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let nbytes = (first & 0x7f) as usize;
        if nbytes == 0 || nbytes > 4 {
            return Err(bad());
        }
        let mut len = 0usize;
        for _ in 0..nbytes {
            let b = *der.get(*pos).ok_or_else(bad)?;
            *pos += 1;
            len = (len << 8) | b as usize;
        }
        Ok(len)
    }

    fn read_integer<'a>(der: &'a [u8], pos: &mut usize) -> PassageResult<&'a [u8]> {
        if der.get(*pos) != Some(&0x02) {
            return Err(bad());
        }
        *pos += 1;
        let len = read_len(der, pos)?;
        let bytes = der.get(*pos..*pos + len).ok_or_else(bad)?;
        *pos += len;
        Ok(bytes)
    }

    let mut pos = 0;
    if der.first() != Some(&0x30) {
        return Err(bad());
    }
    pos += 1;
    let _seq_len = read_len(der, &mut pos)?;

    let mut n = read_integer(der, &mut pos)?;
    let mut e = read_integer(der, &mut pos)?;

    while n.first() == Some(&0) {
        n = &n[1..];
    }
    while e.first() == Some(&0) {
        e = &e[1..];
    }

    Ok((n.to_vec(), e.to_vec()))
}

fn left_pad_32(bytes: &[u8]) -> PassageResult<[u8; 32]> {
    if bytes.len() > 32 {
        return Err(PassageError::Protocol(
            "ECDSA scalar longer than 32 bytes".to_string(),
        ));
    }
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(bytes);
    Ok(out)
}

/// Verifies an SSH signature blob over `data` with an SSH public key
/// blob, as used by publickey authentication (RFC 4252 Section 7).
///
/// Returns `Ok(false)` on a well-formed but invalid signature and an
/// error on malformed blobs or unsupported algorithms.
pub fn verify_ssh_signature(
    public_key_blob: &[u8],
    signature_blob: &[u8],
    data: &[u8],
) -> PassageResult<bool> {
    let mut key = PacketReader::new(public_key_blob);
    let key_algorithm = key.get_str()?.to_string();

    let mut sig = PacketReader::new(signature_blob);
    let sig_algorithm = sig.get_str()?.to_string();
    let sig_bytes = sig.get_string()?;

    match key_algorithm.as_str() {
        "ssh-ed25519" => {
            if sig_algorithm != "ssh-ed25519" {
                return Err(PassageError::Protocol(format!(
                    "signature algorithm {} does not match key type ssh-ed25519",
                    sig_algorithm
                )));
            }
            let key_bytes: [u8; 32] = key
                .get_string()?
                .try_into()
                .map_err(|_| PassageError::Protocol("Ed25519 key must be 32 bytes".to_string()))?;
            let sig_bytes: [u8; 64] = sig_bytes.try_into().map_err(|_| {
                PassageError::Protocol("Ed25519 signature must be 64 bytes".to_string())
            })?;

            let verifying_key = VerifyingKey::from_bytes(&key_bytes)
                .map_err(|e| PassageError::Protocol(format!("invalid Ed25519 key: {}", e)))?;
            let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
            Ok(verifying_key.verify(data, &signature).is_ok())
        }
        "ecdsa-sha2-nistp256" => {
            if sig_algorithm != "ecdsa-sha2-nistp256" {
                return Err(PassageError::Protocol(format!(
                    "signature algorithm {} does not match key type ecdsa-sha2-nistp256",
                    sig_algorithm
                )));
            }
            let curve = key.get_str()?;
            if curve != "nistp256" {
                return Err(PassageError::Protocol(format!(
                    "unexpected curve {} for ecdsa-sha2-nistp256",
                    curve
                )));
            }
            let point = key.get_string()?;
            let verifying_key = p256::ecdsa::VerifyingKey::from_sec1_bytes(point)
                .map_err(|e| PassageError::Protocol(format!("invalid P-256 key: {}", e)))?;

            let mut scalars = PacketReader::new(sig_bytes);
            let r = left_pad_32(scalars.get_mpint()?)?;
            let s = left_pad_32(scalars.get_mpint()?)?;
            let signature =
                p256::ecdsa::Signature::from_scalars(r, s).map_err(|e| {
                    PassageError::Protocol(format!("invalid ECDSA signature scalars: {}", e))
                })?;

            use p256::ecdsa::signature::Verifier as _;
            Ok(verifying_key.verify(data, &signature).is_ok())
        }
        "ssh-rsa" => {
            let verify_alg = match sig_algorithm.as_str() {
                "rsa-sha2-256" => &RSA_PKCS1_2048_8192_SHA256,
                "rsa-sha2-512" => &RSA_PKCS1_2048_8192_SHA512,
                other => {
                    return Err(PassageError::Protocol(format!(
                        "unsupported RSA signature algorithm: {}",
                        other
                    )))
                }
            };
            let e = key.get_mpint()?;
            let n = key.get_mpint()?;
            let components = RsaPublicKeyComponents { n, e };
            Ok(components.verify(verify_alg, data, sig_bytes).is_ok())
        }
        other => Err(PassageError::Protocol(format!(
            "unsupported public key algorithm: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ed25519_sign_verify() {
        let key = Ed25519HostKey::generate();
        let blob = key.public_key_blob();
        let sig = key.sign(b"exchange hash").unwrap();

        assert!(verify_ssh_signature(&blob, &sig, b"exchange hash").unwrap());
        assert!(!verify_ssh_signature(&blob, &sig, b"different data").unwrap());
    }

    #[test]
    fn test_ed25519_deterministic_from_seed() {
        let a = Ed25519HostKey::from_seed(&[7u8; 32]);
        let b = Ed25519HostKey::from_seed(&[7u8; 32]);
        assert_eq!(a.public_key_blob(), b.public_key_blob());
    }

    #[test]
    fn test_ed25519_blob_format() {
        let key = Ed25519HostKey::from_seed(&[1u8; 32]);
        let blob = key.public_key_blob();

        let mut r = PacketReader::new(&blob);
        assert_eq!(r.get_str().unwrap(), "ssh-ed25519");
        assert_eq!(r.get_string().unwrap().len(), 32);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_ecdsa_p256_sign_verify() {
        let key = EcdsaP256HostKey::generate();
        let blob = key.public_key_blob();
        let sig = key.sign(b"exchange hash").unwrap();

        assert!(verify_ssh_signature(&blob, &sig, b"exchange hash").unwrap());
        assert!(!verify_ssh_signature(&blob, &sig, b"tampered").unwrap());
    }

    #[test]
    fn test_ecdsa_blob_format() {
        let key = EcdsaP256HostKey::generate();
        let blob = key.public_key_blob();

        let mut r = PacketReader::new(&blob);
        assert_eq!(r.get_str().unwrap(), "ecdsa-sha2-nistp256");
        assert_eq!(r.get_str().unwrap(), "nistp256");
        // uncompressed SEC1 point: 0x04 || x || y
        let point = r.get_string().unwrap();
        assert_eq!(point.len(), 65);
        assert_eq!(point[0], 0x04);
    }

    #[test]
    fn test_ecdsa_signature_is_mpint_pair() {
        let key = EcdsaP256HostKey::generate();
        let sig = key.sign(b"data").unwrap();

        let mut r = PacketReader::new(&sig);
        assert_eq!(r.get_str().unwrap(), "ecdsa-sha2-nistp256");
        let inner = r.get_string().unwrap();
        let mut scalars = PacketReader::new(inner);
        assert!(scalars.get_mpint().unwrap().len() <= 32);
        assert!(scalars.get_mpint().unwrap().len() <= 32);
        assert_eq!(scalars.remaining(), 0);
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(HostKeyAlgorithm::SshEd25519.name(), "ssh-ed25519");
        assert_eq!(
            HostKeyAlgorithm::from_name("rsa-sha2-256"),
            Some(HostKeyAlgorithm::RsaSha2_256)
        );
        assert_eq!(HostKeyAlgorithm::from_name("ssh-dss"), None);
    }

    #[test]
    fn test_verify_rejects_algorithm_mismatch() {
        let key = Ed25519HostKey::generate();
        let blob = key.public_key_blob();

        // signature blob claiming a different algorithm
        let mut w = PacketWriter::new();
        w.put_str("ecdsa-sha2-nistp256").unwrap();
        w.put_string(&[0u8; 64]).unwrap();

        assert!(verify_ssh_signature(&blob, w.as_slice(), b"data").is_err());
    }

    #[test]
    fn test_parse_rsa_public_der() {
        // SEQUENCE { INTEGER 0x00BC614E, INTEGER 65537 }
        let der = [
            0x30, 0x0b, 0x02, 0x04, 0x00, 0xbc, 0x61, 0x4e, 0x02, 0x03, 0x01, 0x00, 0x01,
        ];
        let (n, e) = parse_rsa_public_der(&der).unwrap();
        assert_eq!(n, vec![0xbc, 0x61, 0x4e]);
        assert_eq!(e, vec![0x01, 0x00, 0x01]);
    }

    #[test]
    fn test_parse_rsa_public_der_rejects_garbage() {
        assert!(parse_rsa_public_der(&[0x02, 0x01, 0x00]).is_err());
        assert!(parse_rsa_public_der(&[]).is_err());
    }
}
