//! Per-user wrapping of zone keys, and sealed messages built on it.
//!
//! ACLs carry one share per user for the zone key of their epoch. Events and
//! access tokens addressed to a single identity are sealed with a throwaway
//! secret wrapped the same way.

use aes_kw::KekAes256 as Kek;
use serde::{Deserialize, Serialize};

use super::keys::{KeyError, PublicKey, SecretKey, PUBLIC_KEY_SIZE};
use super::secret::{Secret, SecretError, SECRET_SIZE};

/// AES-KW grows the wrapped key by one 8 byte block
const WRAP_OVERHEAD: usize = 8;
const SECRET_SHARE_SIZE: usize = PUBLIC_KEY_SIZE + SECRET_SIZE + WRAP_OVERHEAD;

#[derive(Debug, thiserror::Error)]
pub enum SecretShareError {
    #[error("share error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("secret error: {0}")]
    Secret(#[from] SecretError),
}

/// A zone key wrapped for one user: `ephemeral public key (32) || wrapped key (40)`.
///
/// Stored in ACL files as hex.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SecretShare([u8; SECRET_SHARE_SIZE]);

impl Serialize for SecretShare {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SecretShare {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;
        SecretShare::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// Key-encryption key agreed between an X25519 private and public key.
fn agree(private: x25519_dalek::StaticSecret, public: &x25519_dalek::PublicKey) -> Kek {
    Kek::from(*private.diffie_hellman(public).as_bytes())
}

impl SecretShare {
    pub fn from_hex(hex: &str) -> Result<Self, SecretShareError> {
        let mut buff = [0; SECRET_SHARE_SIZE];
        hex::decode_to_slice(hex, &mut buff).map_err(|_| anyhow::anyhow!("hex decode error"))?;
        Ok(SecretShare(buff))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn from_slice(data: &[u8]) -> Result<Self, SecretShareError> {
        let bytes = <[u8; SECRET_SHARE_SIZE]>::try_from(data).map_err(|_| {
            anyhow::anyhow!(
                "invalid share size, expected {}, got {}",
                SECRET_SHARE_SIZE,
                data.len()
            )
        })?;
        Ok(SecretShare(bytes))
    }

    /// Wrap `secret` so that only the holder of `recipient`'s private key can unwrap it.
    pub fn new(secret: &Secret, recipient: &PublicKey) -> Result<Self, SecretShareError> {
        let ephemeral = SecretKey::generate();
        let wrapped = agree(ephemeral.to_x25519(), &recipient.to_x25519()?)
            .wrap_vec(secret.bytes())
            .map_err(|_| anyhow::anyhow!("AES-KW wrap error"))?;

        let mut share = [0; SECRET_SHARE_SIZE];
        share[..PUBLIC_KEY_SIZE].copy_from_slice(&ephemeral.public().to_bytes());
        share[PUBLIC_KEY_SIZE..].copy_from_slice(&wrapped);
        Ok(SecretShare(share))
    }

    /// Unwrap the zone key. Fails for any identity other than the recipient.
    pub fn recover(&self, identity: &SecretKey) -> Result<Secret, SecretShareError> {
        let ephemeral = PublicKey::try_from(&self.0[..PUBLIC_KEY_SIZE])?;
        let unwrapped = agree(identity.to_x25519(), &ephemeral.to_x25519()?)
            .unwrap_vec(&self.0[PUBLIC_KEY_SIZE..])
            .map_err(|_| anyhow::anyhow!("AES-KW unwrap error"))?;
        Ok(Secret::from_slice(&unwrapped)?)
    }

    /// Encrypt `data` for `recipient`: `share || Secret::encrypt(data)` under a fresh secret.
    pub fn seal(data: &[u8], recipient: &PublicKey) -> Result<Vec<u8>, SecretShareError> {
        let secret = Secret::generate();
        let share = SecretShare::new(&secret, recipient)?;
        let ciphertext = secret.encrypt(data)?;
        let mut out = Vec::with_capacity(SECRET_SHARE_SIZE + ciphertext.len());
        out.extend_from_slice(&share.0);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Reverse of [`SecretShare::seal`].
    pub fn unseal(data: &[u8], identity: &SecretKey) -> Result<Vec<u8>, SecretShareError> {
        if data.len() < SECRET_SHARE_SIZE {
            return Err(anyhow::anyhow!("sealed data too short").into());
        }
        let share = SecretShare::from_slice(&data[..SECRET_SHARE_SIZE])?;
        let secret = share.recover(identity)?;
        Ok(secret.decrypt(&data[SECRET_SHARE_SIZE..])?)
    }
}
