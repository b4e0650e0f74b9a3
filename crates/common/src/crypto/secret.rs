//! Symmetric encryption using ChaCha20-Poly1305
//!
//! A `Secret` is used two ways:
//! - **Zone keys**: one per key epoch, sealing header batches as a single message
//! - **Body keys**: one per file, sealing the body as a sequence of fixed-size
//!   chunks so that byte ranges can be decrypted without reading the whole body

use std::io::{self, Write};
use std::ops::Deref;

use chacha20poly1305::aead::Payload;
use chacha20poly1305::Key;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use serde::{Deserialize, Serialize};

/// Size of ChaCha20-Poly1305 nonce in bytes
pub const NONCE_SIZE: usize = 12;
/// Size of ChaCha20-Poly1305 key in bytes (256 bits)
pub const SECRET_SIZE: usize = 32;
/// Size of BLAKE3 hash in bytes (256 bits)
pub const BLAKE3_HASH_SIZE: usize = 32;
/// Size of the Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;
/// Size of the per-file IV prefixed to every chunk nonce
pub const IV_SIZE: usize = 8;
/// Plaintext bytes per body chunk
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Errors that can occur during encryption/decryption
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Number of chunks a body of `size` plaintext bytes is split into.
///
/// An empty body still carries one (empty) chunk so truncation is detectable.
pub fn chunk_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64).max(1)
}

/// Size of the encrypted body for `size` plaintext bytes.
pub fn sealed_size(size: u64) -> u64 {
    size + chunk_count(size) * TAG_SIZE as u64
}

/// Generate a fresh random IV for a body.
pub fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    getrandom::getrandom(&mut iv).expect("failed to generate random bytes");
    iv
}

/// A 256-bit symmetric encryption key
///
/// Single messages are encrypted as
/// `nonce (12 bytes) || encrypted(hash(32 bytes) || plaintext) || tag (16 bytes)`,
/// with the BLAKE3 hash of the plaintext verified on decryption.
///
/// Bodies are encrypted chunk by chunk. Chunk `i` uses the nonce
/// `iv (8 bytes) || i (4 bytes, big endian)` and the final chunk is bound to
/// its position through the associated data, so reordering or truncating
/// chunks fails authentication.
///
/// # Examples
///
/// ```ignore
/// let secret = Secret::generate();
/// let ciphertext = secret.encrypt(b"sensitive data")?;
/// let recovered = secret.decrypt(&ciphertext)?;
/// ```
#[derive(PartialEq, Clone, Serialize, Deserialize)]
pub struct Secret([u8; SECRET_SIZE]);

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(..)")
    }
}

impl Default for Secret {
    fn default() -> Self {
        Secret([0; SECRET_SIZE])
    }
}

impl Deref for Secret {
    type Target = [u8; SECRET_SIZE];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<[u8; SECRET_SIZE]> for Secret {
    fn from(bytes: [u8; SECRET_SIZE]) -> Self {
        Secret(bytes)
    }
}

impl Secret {
    /// Generate a new random secret using a cryptographically secure RNG
    pub fn generate() -> Self {
        let mut buff = [0; SECRET_SIZE];
        getrandom::getrandom(&mut buff).expect("failed to generate random bytes");
        Self(buff)
    }

    /// Create a secret from a byte slice of exactly `SECRET_SIZE` bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self, SecretError> {
        if data.len() != SECRET_SIZE {
            return Err(anyhow::anyhow!(
                "invalid secret size, expected {}, got {}",
                SECRET_SIZE,
                data.len()
            )
            .into());
        }
        let mut buff = [0; SECRET_SIZE];
        buff.copy_from_slice(data);
        Ok(buff.into())
    }

    pub fn bytes(&self) -> &[u8] {
        self.0.as_ref()
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(self.bytes()))
    }

    /// Encrypt a single message with a random nonce.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, SecretError> {
        let plaintext_hash = blake3::hash(data);

        let mut data_with_hash = Vec::with_capacity(BLAKE3_HASH_SIZE + data.len());
        data_with_hash.extend_from_slice(plaintext_hash.as_bytes());
        data_with_hash.extend_from_slice(data);

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes)
            .map_err(|e| anyhow::anyhow!("failed to generate nonce: {}", e))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()
            .encrypt(nonce, data_with_hash.as_ref())
            .map_err(|_| anyhow::anyhow!("encrypt error"))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(nonce.as_ref());
        out.extend_from_slice(ciphertext.as_ref());

        Ok(out)
    }

    /// Decrypt a message produced by [`Secret::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Data is too short to contain a nonce
    /// - Authentication fails (tampered data or wrong key)
    /// - The embedded plaintext hash does not match
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, SecretError> {
        if data.len() < NONCE_SIZE {
            return Err(anyhow::anyhow!("data too short for nonce").into());
        }

        let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
        let decrypted = self
            .cipher()
            .decrypt(nonce, &data[NONCE_SIZE..])
            .map_err(|_| anyhow::anyhow!("decrypt error"))?;

        if decrypted.len() < BLAKE3_HASH_SIZE {
            return Err(anyhow::anyhow!("decrypted data too short for hash header").into());
        }

        let stored_hash = &decrypted[..BLAKE3_HASH_SIZE];
        let plaintext = &decrypted[BLAKE3_HASH_SIZE..];

        if stored_hash != blake3::hash(plaintext).as_bytes() {
            return Err(anyhow::anyhow!("hash verification failed - data corrupted").into());
        }

        Ok(plaintext.to_vec())
    }

    fn chunk_nonce(iv: &[u8; IV_SIZE], index: u64) -> Result<[u8; NONCE_SIZE], SecretError> {
        let index = u32::try_from(index).map_err(|_| anyhow::anyhow!("body too large"))?;
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..IV_SIZE].copy_from_slice(iv);
        nonce[IV_SIZE..].copy_from_slice(&index.to_be_bytes());
        Ok(nonce)
    }

    /// Encrypt chunk `index` of a body.
    pub fn encrypt_chunk(
        &self,
        iv: &[u8; IV_SIZE],
        index: u64,
        last: bool,
        chunk: &[u8],
    ) -> Result<Vec<u8>, SecretError> {
        let nonce = Self::chunk_nonce(iv, index)?;
        let aad = [last as u8];
        self.cipher()
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: chunk,
                    aad: &aad,
                },
            )
            .map_err(|_| anyhow::anyhow!("chunk {} encrypt error", index).into())
    }

    /// Decrypt chunk `index` of a body.
    pub fn decrypt_chunk(
        &self,
        iv: &[u8; IV_SIZE],
        index: u64,
        last: bool,
        chunk: &[u8],
    ) -> Result<Vec<u8>, SecretError> {
        let nonce = Self::chunk_nonce(iv, index)?;
        let aad = [last as u8];
        self.cipher()
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: chunk,
                    aad: &aad,
                },
            )
            .map_err(|_| anyhow::anyhow!("chunk {} decrypt error", index).into())
    }

    /// Encrypt a whole body.
    pub fn encrypt_body(&self, iv: &[u8; IV_SIZE], data: &[u8]) -> Result<Vec<u8>, SecretError> {
        let mut sealer = BodySealer::new(self, *iv);
        sealer.write_all(data)?;
        let (_, sealed) = sealer.finish()?;
        Ok(sealed)
    }

    /// Decrypt a whole body of `size` plaintext bytes.
    pub fn decrypt_body(
        &self,
        iv: &[u8; IV_SIZE],
        size: u64,
        data: &[u8],
    ) -> Result<Vec<u8>, SecretError> {
        if data.len() as u64 != sealed_size(size) {
            return Err(anyhow::anyhow!(
                "sealed body size mismatch, expected {}, got {}",
                sealed_size(size),
                data.len()
            )
            .into());
        }
        let chunks = chunk_count(size);
        let mut out = Vec::with_capacity(size as usize);
        for (index, chunk) in data.chunks(CHUNK_SIZE + TAG_SIZE).enumerate() {
            let index = index as u64;
            out.extend(self.decrypt_chunk(iv, index, index + 1 == chunks, chunk)?);
        }
        Ok(out)
    }
}

/// Incremental body encryption fed through [`Write`].
///
/// A full chunk is sealed only once more plaintext arrives, so the final
/// chunk is known when [`BodySealer::finish`] runs.
pub struct BodySealer {
    key: Secret,
    iv: [u8; IV_SIZE],
    index: u64,
    pending: Vec<u8>,
    size: u64,
    sealed: Vec<u8>,
}

impl BodySealer {
    pub fn new(key: &Secret, iv: [u8; IV_SIZE]) -> Self {
        Self {
            key: key.clone(),
            iv,
            index: 0,
            pending: Vec::with_capacity(CHUNK_SIZE),
            size: 0,
            sealed: Vec::new(),
        }
    }

    fn seal_pending(&mut self, last: bool) -> Result<(), SecretError> {
        let chunk = self
            .key
            .encrypt_chunk(&self.iv, self.index, last, &self.pending)?;
        self.sealed.extend(chunk);
        self.pending.clear();
        self.index += 1;
        Ok(())
    }

    /// Seal the last chunk. Returns the plaintext size and the sealed body.
    pub fn finish(mut self) -> Result<(u64, Vec<u8>), SecretError> {
        self.seal_pending(true)?;
        Ok((self.size, self.sealed))
    }
}

impl Write for BodySealer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.len() == CHUNK_SIZE {
            self.seal_pending(false).map_err(io::Error::other)?;
        }
        let n = buf.len().min(CHUNK_SIZE - self.pending.len());
        self.pending.extend_from_slice(&buf[..n]);
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_secret_encrypt_decrypt() {
        let secret = Secret::generate();
        let data = b"hello world, this is a test message for encryption";

        let encrypted = secret.encrypt(data).unwrap();
        let decrypted = secret.decrypt(&encrypted).unwrap();

        assert_eq!(data.as_slice(), decrypted.as_slice());
        assert!(Secret::generate().decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_secret_size_validation() {
        assert!(Secret::from_slice(&[1u8; 16]).is_err());
        assert!(Secret::from_slice(&[1u8; 64]).is_err());
        assert!(Secret::from_slice(&[1u8; SECRET_SIZE]).is_ok());
    }

    #[test]
    fn test_tampered_message_fails() {
        let secret = Secret::generate();
        let mut encrypted = secret.encrypt(b"test data for integrity check").unwrap();
        encrypted[NONCE_SIZE + 10] ^= 0xFF;
        assert!(secret.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_body_roundtrip_multi_chunk() {
        let secret = Secret::generate();
        let iv = generate_iv();
        let data: Vec<u8> = (0..(CHUNK_SIZE * 2 + 100)).map(|i| (i % 251) as u8).collect();

        let sealed = secret.encrypt_body(&iv, &data).unwrap();
        assert_eq!(sealed.len() as u64, sealed_size(data.len() as u64));
        assert_eq!(chunk_count(data.len() as u64), 3);

        let opened = secret.decrypt_body(&iv, data.len() as u64, &sealed).unwrap();
        assert_eq!(opened, data);

        // second chunk decrypts on its own
        let start = CHUNK_SIZE + TAG_SIZE;
        let middle = secret
            .decrypt_chunk(&iv, 1, false, &sealed[start..start * 2])
            .unwrap();
        assert_eq!(middle, &data[CHUNK_SIZE..CHUNK_SIZE * 2]);
    }

    #[test]
    fn test_body_truncation_detected() {
        let secret = Secret::generate();
        let iv = generate_iv();
        let data = vec![9u8; CHUNK_SIZE * 2];
        let sealed = secret.encrypt_body(&iv, &data).unwrap();

        // dropping the final chunk and claiming the first is last must fail
        let first = &sealed[..CHUNK_SIZE + TAG_SIZE];
        assert!(secret.decrypt_chunk(&iv, 0, true, first).is_err());
        assert!(secret.decrypt_chunk(&iv, 0, false, first).is_ok());
    }

    #[test]
    fn test_empty_body() {
        let secret = Secret::generate();
        let iv = generate_iv();
        let sealed = secret.encrypt_body(&iv, b"").unwrap();
        assert_eq!(sealed.len(), TAG_SIZE);
        assert!(secret.decrypt_body(&iv, 0, &sealed).unwrap().is_empty());
    }

    #[test]
    fn test_sealer_fed_in_pieces() {
        let secret = Secret::generate();
        let iv = generate_iv();
        for size in [CHUNK_SIZE, CHUNK_SIZE * 2 + 7] {
            let data: Vec<u8> = (0..size).map(|i| (i % 241) as u8).collect();
            let mut sealer = BodySealer::new(&secret, iv);
            for piece in data.chunks(1000) {
                sealer.write_all(piece).unwrap();
            }
            let (written, sealed) = sealer.finish().unwrap();
            assert_eq!(written, size as u64);
            assert_eq!(sealed, secret.encrypt_body(&iv, &data).unwrap());
            assert_eq!(secret.decrypt_body(&iv, written, &sealed).unwrap(), data);
        }
    }
}
