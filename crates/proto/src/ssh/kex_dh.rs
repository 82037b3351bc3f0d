//! Key-agreement backends for the SSH key exchange (RFC 8731, RFC 5656,
//! RFC 8268).
//!
//! Three exchanges are offered, all hashed with SHA-256:
//!
//! - `curve25519-sha256` - X25519 (preferred)
//! - `ecdh-sha2-nistp256` - NIST P-256 ECDH
//! - `diffie-hellman-group14-sha256` - 2048-bit MODP group, kept for
//!   clients without elliptic-curve support
//!
//! Each backend produces the server's ephemeral public key for the
//! exchange reply and computes the shared secret K from the client's
//! ephemeral. Ephemeral secrets are consumed by the computation or
//! zeroized on drop.

use num_bigint::BigUint;
use passage_platform::{PassageError, PassageResult};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Diffie-Hellman Group 14 parameters (RFC 3526).
mod dh_group14 {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    /// DH Group 14 prime (2048-bit)
    pub static P: Lazy<BigUint> = Lazy::new(|| {
        BigUint::from_bytes_be(
            &hex::decode(
                "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
             29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
             EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
             E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
             EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
             C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
             83655D23DCA3AD961C62F356208552BB9ED529077096966D\
             670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
             E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
             DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
             15728E5A8AACAA68FFFFFFFFFFFFFFFF",
            )
            .expect("valid hex constant"),
        )
    });

    /// DH Group 14 generator
    pub static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));
}

/// Curve25519 key exchange (curve25519-sha256, RFC 8731).
pub struct Curve25519Exchange {
    secret: StaticSecret,
    public: [u8; 32],
}

impl Curve25519Exchange {
    /// Generates a fresh ephemeral key pair.
    pub fn new() -> Self {
        let mut scalar = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut scalar);
        let exchange = Self::from_scalar(scalar);
        scalar.zeroize();
        exchange
    }

    /// Builds the exchange from a fixed scalar; used by deterministic
    /// test vectors.
    pub fn from_scalar(scalar: [u8; 32]) -> Self {
        let secret = StaticSecret::from(scalar);
        let public = PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// The server's ephemeral public key Q_S.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public
    }

    /// Computes the shared secret K from the client's ephemeral Q_C,
    /// consuming the exchange.
    ///
    /// # Errors
    ///
    /// Rejects a peer key of the wrong size and the all-zero shared
    /// secret produced by low-order points.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> PassageResult<Vec<u8>> {
        let peer: [u8; 32] = peer_public.try_into().map_err(|_| {
            PassageError::Protocol("curve25519 public key must be 32 bytes".to_string())
        })?;

        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        if shared.as_bytes().iter().all(|&b| b == 0) {
            return Err(PassageError::Protocol(
                "curve25519 produced an all-zero shared secret".to_string(),
            ));
        }
        Ok(shared.as_bytes().to_vec())
    }
}

impl Default for Curve25519Exchange {
    fn default() -> Self {
        Self::new()
    }
}

/// NIST P-256 ECDH key exchange (ecdh-sha2-nistp256, RFC 5656).
pub struct EcdhP256Exchange {
    secret: p256::ecdh::EphemeralSecret,
    public: Vec<u8>,
}

impl EcdhP256Exchange {
    /// Generates a fresh ephemeral key pair.
    pub fn new() -> Self {
        use p256::elliptic_curve::sec1::ToEncodedPoint;

        let secret = p256::ecdh::EphemeralSecret::random(&mut rand::thread_rng());
        let public = secret
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        Self { secret, public }
    }

    /// The server's ephemeral public key Q_S as an uncompressed SEC1
    /// point.
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Computes the shared secret K (the x coordinate) from the
    /// client's ephemeral point, consuming the exchange.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> PassageResult<Vec<u8>> {
        let peer = p256::PublicKey::from_sec1_bytes(peer_public)
            .map_err(|e| PassageError::Protocol(format!("invalid P-256 point: {}", e)))?;

        let shared = self.secret.diffie_hellman(&peer);
        Ok(shared.raw_secret_bytes().to_vec())
    }
}

impl Default for EcdhP256Exchange {
    fn default() -> Self {
        Self::new()
    }
}

/// Diffie-Hellman Group 14 key exchange
/// (diffie-hellman-group14-sha256, RFC 8268).
pub struct DhGroup14Exchange {
    /// Private exponent x
    private_key: Vec<u8>,
    /// Public value g^x mod p
    public_key: Vec<u8>,
}

impl DhGroup14Exchange {
    /// Generates a fresh key pair.
    pub fn new() -> Self {
        use num_bigint::RandBigInt;

        let mut rng = rand::thread_rng();

        // random exponent 1 < x < p-1
        let p_minus_one = dh_group14::P.clone() - 1u32;
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);

        let y = dh_group14::G.modpow(&x, &dh_group14::P);

        Self {
            private_key: x.to_bytes_be(),
            public_key: y.to_bytes_be(),
        }
    }

    /// The server's public value f.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes the shared secret K from the client's public value e.
    ///
    /// # Errors
    ///
    /// Rejects a peer value outside (1, p-1).
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> PassageResult<Vec<u8>> {
        let y_peer = BigUint::from_bytes_be(peer_public);

        if y_peer <= BigUint::from(1u32) || y_peer >= *dh_group14::P {
            return Err(PassageError::Protocol(
                "DH peer public value out of range".to_string(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        let k = y_peer.modpow(&x, &dh_group14::P);

        Ok(k.to_bytes_be())
    }
}

impl Default for DhGroup14Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DhGroup14Exchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_curve25519_agreement() {
        let client = Curve25519Exchange::new();
        let server = Curve25519Exchange::new();

        let client_public = *client.public_key();
        let server_public = *server.public_key();

        let client_secret = client.compute_shared_secret(&server_public).unwrap();
        let server_secret = server.compute_shared_secret(&client_public).unwrap();

        assert_eq!(client_secret, server_secret);
        assert_eq!(client_secret.len(), 32);
    }

    #[test]
    fn test_curve25519_deterministic_scalars() {
        // fixed ephemerals give a reproducible shared secret
        let client = Curve25519Exchange::from_scalar([0x11; 32]);
        let server = Curve25519Exchange::from_scalar([0x22; 32]);

        let again_client = Curve25519Exchange::from_scalar([0x11; 32]);
        let again_server = Curve25519Exchange::from_scalar([0x22; 32]);

        let k1 = server.compute_shared_secret(client.public_key()).unwrap();
        let k2 = again_client
            .compute_shared_secret(again_server.public_key())
            .unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_curve25519_rejects_bad_length() {
        let server = Curve25519Exchange::new();
        assert!(server.compute_shared_secret(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_curve25519_rejects_low_order_point() {
        let server = Curve25519Exchange::new();
        assert!(server.compute_shared_secret(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_p256_agreement() {
        let client = EcdhP256Exchange::new();
        let server = EcdhP256Exchange::new();

        let client_public = client.public_key().to_vec();
        let server_public = server.public_key().to_vec();

        let client_secret = client.compute_shared_secret(&server_public).unwrap();
        let server_secret = server.compute_shared_secret(&client_public).unwrap();

        assert_eq!(client_secret, server_secret);
        assert_eq!(client_secret.len(), 32);
    }

    #[test]
    fn test_p256_public_key_is_uncompressed_point() {
        let exchange = EcdhP256Exchange::new();
        assert_eq!(exchange.public_key().len(), 65);
        assert_eq!(exchange.public_key()[0], 0x04);
    }

    #[test]
    fn test_p256_rejects_garbage_point() {
        let server = EcdhP256Exchange::new();
        assert!(server.compute_shared_secret(&[0xff; 65]).is_err());
    }

    #[test]
    fn test_group14_agreement() {
        let client = DhGroup14Exchange::new();
        let server = DhGroup14Exchange::new();

        let client_secret = client.compute_shared_secret(server.public_key()).unwrap();
        let server_secret = server.compute_shared_secret(client.public_key()).unwrap();

        assert_eq!(client_secret, server_secret);
    }

    #[test]
    fn test_group14_rejects_out_of_range() {
        let server = DhGroup14Exchange::new();
        assert!(server.compute_shared_secret(&[0u8]).is_err());
        assert!(server.compute_shared_secret(&[1u8]).is_err());

        let p = dh_group14::P.to_bytes_be();
        assert!(server.compute_shared_secret(&p).is_err());
    }
}
