//! Cryptographic primitives for a safe
//!
//! - **Identity & Authentication**: Ed25519 keypairs. The hex public key is the user id
//!   and signs permission changes, ACLs, manifests and events
//! - **Encryption**: ChaCha20-Poly1305 `Secret`s, one per zone key epoch for headers
//!   and one per file for the chunked body
//! - **Key Sharing**: ECDH over X25519 plus AES-KW wraps a zone key for each user
//! - **Digests**: SHA-384 for content hashes and signed payloads
//!
//! # Key Sharing Protocol
//!
//! To hand a zone key to a user:
//! 1. Generate ephemeral Ed25519 keypair
//! 2. Convert both Ed25519 keys to X25519 (Montgomery curve)
//! 3. Perform ECDH to derive shared secret
//! 4. Use AES-KW (key wrap) to encrypt the zone key with the shared secret
//! 5. Package as a `SecretShare` (ephemeral_pubkey || wrapped_secret)

mod keys;
mod secret;
mod secret_share;

use sha2::{Digest, Sha384};

pub use ed25519_dalek::Signature;
pub use keys::{KeyError, PublicKey, SecretKey};
pub use secret::{
    chunk_count, generate_iv, sealed_size, BodySealer, Secret, SecretError, BLAKE3_HASH_SIZE,
    CHUNK_SIZE, IV_SIZE, TAG_SIZE,
};
pub use secret_share::{SecretShare, SecretShareError};

/// Serde helper storing an Ed25519 signature as a hex string.
pub mod signature_hex {
    use ed25519_dalek::Signature;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(signature: &Signature, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(signature.to_bytes()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Signature, D::Error> {
        let hex = String::deserialize(deserializer)?;
        let bytes = hex::decode(hex).map_err(serde::de::Error::custom)?;
        Signature::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

/// SHA-384 digest of `data`.
pub fn sha384(data: &[u8]) -> Vec<u8> {
    Sha384::digest(data).to_vec()
}

/// Sign the SHA-384 digest of `data`.
pub fn sign_digest(key: &SecretKey, data: &[u8]) -> Signature {
    key.sign(&sha384(data))
}

/// Verify a signature produced by [`sign_digest`].
pub fn verify_digest(key: &PublicKey, data: &[u8], signature: &Signature) -> bool {
    key.verify(&sha384(data), signature).is_ok()
}
