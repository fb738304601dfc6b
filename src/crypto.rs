//! Key material, signatures and digests.
//!
//! Public keys travel in base58, signatures in base64-free hex, block and
//! identity digests as uppercase hex. The signing side is kept behind the
//! [`Signer`] trait so key storage stays outside the chain core; the miner
//! worker receives a base58-encoded secret through its request message and
//! signs candidate blocks itself.

use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer as _, Verifier as _};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid base58 encoding")]
    Base58(#[from] bs58::decode::Error),
    #[error("invalid key or signature bytes")]
    Material(#[from] ed25519_dalek::SignatureError),
    #[error("invalid hex encoding")]
    Hex(#[from] hex::FromHexError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Anything able to sign a message on behalf of the node's identity.
pub trait Signer: Send + Sync {
    /// Public key of the signing identity, base58.
    fn pubkey(&self) -> String;
    /// Sign `message` and return the signature in hex.
    fn sign(&self, message: &[u8]) -> String;
}

/// An in-process ed25519 signer.
pub struct KeypairSigner {
    keypair: Keypair,
}

impl KeypairSigner {
    pub fn new(keypair: Keypair) -> Self {
        KeypairSigner { keypair }
    }

    /// Deterministic keypair derived from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let secret = SecretKey::from_bytes(&seed).expect("32 bytes is a valid ed25519 seed");
        let public = PublicKey::from(&secret);
        KeypairSigner {
            keypair: Keypair { secret, public },
        }
    }

    /// Rebuild a signer from a base58 secret key, the form carried by the
    /// miner worker request.
    pub fn from_base58_secret(encoded: &str) -> Result<Self> {
        let bytes = bs58::decode(encoded).into_vec()?;
        let secret = SecretKey::from_bytes(&bytes)?;
        let public = PublicKey::from(&secret);
        Ok(KeypairSigner {
            keypair: Keypair { secret, public },
        })
    }

    pub fn secret_base58(&self) -> String {
        bs58::encode(self.keypair.secret.as_bytes()).into_string()
    }
}

impl Signer for KeypairSigner {
    fn pubkey(&self) -> String {
        bs58::encode(self.keypair.public.as_bytes()).into_string()
    }

    fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.keypair.sign(message).to_bytes())
    }
}

/// Verify a hex signature made by the base58 `pubkey` over `message`.
pub fn verify(pubkey: &str, message: &[u8], signature: &str) -> Result<bool> {
    let key_bytes = bs58::decode(pubkey).into_vec()?;
    let public = PublicKey::from_bytes(&key_bytes)?;
    let sig_bytes = hex::decode(signature)?;
    let signature = Signature::from_bytes(&sig_bytes)?;
    Ok(public.verify(message, &signature).is_ok())
}

/// `true` when the string parses as a base58 ed25519 public key.
pub fn looks_like_pubkey(pubkey: &str) -> bool {
    bs58::decode(pubkey)
        .into_vec()
        .map(|bytes| bytes.len() == 32)
        .unwrap_or(false)
}

/// `true` when the string parses as a hex ed25519 signature.
pub fn looks_like_signature(signature: &str) -> bool {
    hex::decode(signature)
        .map(|bytes| bytes.len() == 64)
        .unwrap_or(false)
}

/// Uppercase hex SHA-1, the digest used for block hashes and identity hashes.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode_upper(hasher.finalize())
}

/// Uppercase hex SHA-256, used for transaction hashes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode_upper(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_roundtrip() {
        let signer = KeypairSigner::from_seed([7u8; 32]);
        let sig = signer.sign(b"some payload");
        assert!(verify(&signer.pubkey(), b"some payload", &sig).unwrap());
        assert!(!verify(&signer.pubkey(), b"other payload", &sig).unwrap());
    }

    #[test]
    fn secret_transport_rebuilds_same_identity() {
        let signer = KeypairSigner::from_seed([3u8; 32]);
        let rebuilt = KeypairSigner::from_base58_secret(&signer.secret_base58()).unwrap();
        assert_eq!(signer.pubkey(), rebuilt.pubkey());
    }

    #[test]
    fn digests_are_uppercase_hex() {
        let digest = sha1_hex(b"abc");
        assert_eq!(digest.len(), 40);
        assert_eq!(digest, digest.to_uppercase());
        assert_eq!(sha256_hex(b"abc").len(), 64);
    }
}
