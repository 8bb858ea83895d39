// src/crypto.rs
//! Key agreement and key derivation primitives
//!
//! Thin wrappers over x25519-dalek and HKDF-SHA256 with byte-slice inputs and
//! outputs, so the rest of the crate never touches curve types directly.

use hkdf::Hkdf;
use log::{error, trace};
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::models::ConversationId;

/// Errors related to cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Error during KDF derivation
    #[error("KDF error: {0}")]
    KdfError(String),

    /// Invalid input data
    #[error("Invalid input: {0}")]
    InvalidInputError(String),
}

/// Size of X25519 private and public keys in bytes
pub const X25519_KEY_SIZE: usize = 32;

/// HKDF salt that tags a shared secret with its conversation
pub const CONVERSATION_SALT: &[u8] = b"our first rendezvous";

/// Generate a long-term X25519 key pair, returned as (private, public)
pub fn generate_x25519_keypair() -> (Vec<u8>, Vec<u8>) {
    let static_secret = StaticSecret::random_from_rng(OsRng);
    let public_key = PublicKey::from(&static_secret);

    let public_key_bytes = public_key.as_bytes().to_vec();
    trace!("Generated X25519 key pair with public key {}", fingerprint(&public_key_bytes));

    (static_secret.to_bytes().to_vec(), public_key_bytes)
}

fn to_key_array(key: &[u8], what: &str) -> Result<[u8; X25519_KEY_SIZE], CryptoError> {
    if key.len() != X25519_KEY_SIZE {
        error!("Invalid X25519 {} length: {}", what, key.len());
        return Err(CryptoError::InvalidInputError(format!(
            "Invalid {} length: {} (expected {} bytes)",
            what,
            key.len(),
            X25519_KEY_SIZE
        )));
    }
    let mut bytes = [0u8; X25519_KEY_SIZE];
    bytes.copy_from_slice(key);
    Ok(bytes)
}

/// Derive the public key that belongs to a stored private key
pub fn x25519_public_key(private_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let secret = StaticSecret::from(to_key_array(private_key, "private key")?);
    Ok(PublicKey::from(&secret).as_bytes().to_vec())
}

/// Perform a Diffie-Hellman key exchange with X25519
///
/// The returned secret is wiped from memory when dropped.
pub fn x25519_diffie_hellman(private_key: &[u8], public_key: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let secret = StaticSecret::from(to_key_array(private_key, "private key")?);
    let public = PublicKey::from(to_key_array(public_key, "public key")?);

    let shared_secret = secret.diffie_hellman(&public);
    if !shared_secret.was_contributory() {
        error!("X25519 exchange with low order public key {}", fingerprint(public_key));
        return Err(CryptoError::InvalidInputError("Non-contributory public key".to_string()));
    }

    Ok(Zeroizing::new(shared_secret.as_bytes().to_vec()))
}

/// Derive a key using HKDF-SHA256 with an empty info string
pub fn hkdf_derive(salt: &[u8], ikm: &[u8], output_len: usize) -> Result<Vec<u8>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; output_len];

    if let Err(e) = hk.expand(&[], &mut okm) {
        error!("HKDF expansion failed: {}", e);
        return Err(CryptoError::KdfError(format!("HKDF expansion failed: {}", e)));
    }

    Ok(okm)
}

/// Derive the conversation id both parties agree on from their shared secret
///
/// The first eight HKDF output bytes are read as a little-endian u64.
pub fn derive_conversation_id(shared_secret: &[u8]) -> Result<ConversationId, CryptoError> {
    let okm = hkdf_derive(CONVERSATION_SALT, shared_secret, 8)?;
    let mut id = [0u8; 8];
    id.copy_from_slice(&okm);
    Ok(u64::from_le_bytes(id))
}

/// Short hex fingerprint of a public key for log output
pub fn fingerprint(public_key: &[u8]) -> String {
    let len = public_key.len().min(8);
    hex::encode(&public_key[..len])
}
