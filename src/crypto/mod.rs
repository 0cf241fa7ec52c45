// Sealed-envelope crypto: anonymous X25519 ECDH + XChaCha20-Poly1305
//
// Flow (sealing to a peer's long-term public key):
// 1. Generate ephemeral X25519 keypair
// 2. ECDH: ephemeral_secret × recipient_public → shared_secret
// 3. KDF: Blake3::derive_key(shared_secret) → symmetric_key
// 4. Encrypt: XChaCha20-Poly1305(symmetric_key, random_nonce, plaintext)
// 5. Output: ephemeral_pub(32) || nonce(24) || ciphertext
//
// The recipient reverses with its static secret. The sender stays
// anonymous: nothing in the sealed bytes identifies it.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

/// KDF context string for deriving sealing keys from ECDH shared secrets.
/// Changing this breaks compatibility with every peer in the wild.
const KDF_CONTEXT: &str = "slick greeting seal 2026-06-01";

const EPHEMERAL_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// Fixed overhead a sealed payload adds over its plaintext.
pub const SEAL_OVERHEAD: usize = EPHEMERAL_LEN + NONCE_LEN + TAG_LEN;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("sealing failed")]
    Seal,
    #[error("unsealing failed: truncated, tampered, or wrong key")]
    Unseal,
}

/// SHA-256 fingerprint of a peer certificate (over its PEM bytes).
///
/// The digest is the canonical peer identity everywhere: friend files,
/// LAN advertisements, pairing verification.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(hex_str: &str) -> Option<Self> {
        let decoded = hex::decode(hex_str).ok()?;
        decoded.try_into().ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Six-character prefix used in service instance names and displays.
    pub fn short_hex(&self) -> String {
        self.to_hex()[..6].to_string()
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", self.short_hex())
    }
}

fn derive_key(shared_secret: &[u8]) -> [u8; 32] {
    blake3::derive_key(KDF_CONTEXT, shared_secret)
}

/// Seal `plaintext` to a recipient's X25519 public key.
///
/// Anyone holding the public key can seal; only the holder of the matching
/// static secret can open. The sender's identity is not bound.
pub fn seal(recipient_public: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let recipient = X25519PublicKey::from(*recipient_public);

    let ephemeral_secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

    let shared_secret = ephemeral_secret.diffie_hellman(&recipient);
    let mut symmetric_key = derive_key(shared_secret.as_bytes());

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let cipher =
        XChaCha20Poly1305::new_from_slice(&symmetric_key).map_err(|_| CryptoError::Seal)?;
    let ciphertext = cipher.encrypt(nonce, plaintext).map_err(|_| CryptoError::Seal)?;

    symmetric_key.zeroize();

    let mut out = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed payload with the recipient's static secret.
///
/// Fails on truncation, tampering, or a mismatched key; the error carries
/// no distinction between those cases.
pub fn open(secret: &StaticSecret, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(CryptoError::Unseal);
    }

    let mut ephemeral_bytes = [0u8; EPHEMERAL_LEN];
    ephemeral_bytes.copy_from_slice(&sealed[..EPHEMERAL_LEN]);
    let ephemeral_public = X25519PublicKey::from(ephemeral_bytes);

    let nonce = XNonce::from_slice(&sealed[EPHEMERAL_LEN..EPHEMERAL_LEN + NONCE_LEN]);
    let ciphertext = &sealed[EPHEMERAL_LEN + NONCE_LEN..];

    let shared_secret = secret.diffie_hellman(&ephemeral_public);
    let mut symmetric_key = derive_key(shared_secret.as_bytes());

    let cipher =
        XChaCha20Poly1305::new_from_slice(&symmetric_key).map_err(|_| CryptoError::Unseal)?;
    let plaintext = cipher.decrypt(nonce, ciphertext).map_err(|_| CryptoError::Unseal)?;

    symmetric_key.zeroize();

    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (StaticSecret, [u8; 32]) {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = X25519PublicKey::from(&secret).to_bytes();
        (secret, public)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (secret, public) = keypair();
        let plaintext = b"greetings from across the lan";

        let sealed = seal(&public, plaintext).unwrap();
        assert_eq!(sealed.len(), plaintext.len() + SEAL_OVERHEAD);

        let opened = open(&secret, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let (_secret, public) = keypair();
        let (other_secret, _) = keypair();

        let sealed = seal(&public, b"secret").unwrap();
        assert!(open(&other_secret, &sealed).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (secret, public) = keypair();
        let mut sealed = seal(&public, b"secret").unwrap();

        if let Some(byte) = sealed.last_mut() {
            *byte ^= 0xFF;
        }
        assert!(open(&secret, &sealed).is_err());
    }

    #[test]
    fn test_truncated_payload_fails() {
        let (secret, public) = keypair();
        let sealed = seal(&public, b"secret").unwrap();

        assert!(open(&secret, &sealed[..SEAL_OVERHEAD - 1]).is_err());
        assert!(open(&secret, b"").is_err());
    }

    #[test]
    fn test_empty_plaintext() {
        let (secret, public) = keypair();
        let sealed = seal(&public, b"").unwrap();
        assert_eq!(open(&secret, &sealed).unwrap(), b"");
    }

    #[test]
    fn test_same_plaintext_different_sealed_bytes() {
        let (_secret, public) = keypair();
        let a = seal(&public, b"same").unwrap();
        let b = seal(&public, b"same").unwrap();
        // Fresh ephemeral key and nonce every time
        assert_ne!(a, b);
    }

    #[test]
    fn test_digest_hex_roundtrip() {
        let digest = Digest::of(b"some certificate pem");
        let hex_str = digest.to_hex();
        assert_eq!(hex_str.len(), 64);
        assert_eq!(Digest::from_hex(&hex_str), Some(digest));
        assert_eq!(digest.short_hex().len(), 6);
    }

    #[test]
    fn test_digest_distinguishes_inputs() {
        assert_ne!(Digest::of(b"a"), Digest::of(b"b"));
    }
}
