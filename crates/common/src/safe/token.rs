//! Access tokens handed out to open a safe.
//!
//! Encoding: JSON, gzip, optionally sealed for one identity, then standard
//! base64 with `/` replaced by `_`.

use std::io::{Read, Write};

use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::crypto::{PublicKey, SecretKey, SecretShare};

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub name: String,
    pub creator_id: PublicKey,
    /// Optional key material for the store, passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub urls: Vec<String>,
}

impl AccessToken {
    pub fn new(name: &str, creator_id: PublicKey, urls: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            creator_id,
            key: None,
            urls,
        }
    }

    /// Encode the token, sealed for `recipient` when given.
    pub fn encode(&self, recipient: Option<&PublicKey>) -> Result<String, TokenError> {
        let json = serde_json::to_vec(self)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        let mut data = encoder.finish()?;

        if let Some(recipient) = recipient {
            data = SecretShare::seal(&data, recipient)
                .map_err(|e| anyhow::anyhow!("cannot seal token: {}", e))?;
        }

        Ok(base64::engine::general_purpose::STANDARD
            .encode(data)
            .replace('/', "_"))
    }

    /// Decode a token, unsealing it with `identity` when it was sealed.
    pub fn decode(raw: &str, identity: Option<&SecretKey>) -> Result<Self, TokenError> {
        let data = base64::engine::general_purpose::STANDARD.decode(raw.trim().replace('_', "/"))?;

        let data = match identity.map(|id| SecretShare::unseal(&data, id)) {
            Some(Ok(unsealed)) => unsealed,
            _ => data,
        };

        let mut json = Vec::new();
        GzDecoder::new(data.as_slice()).read_to_end(&mut json)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn token() -> AccessToken {
        let mut token = AccessToken::new(
            "family",
            SecretKey::generate().public(),
            vec!["mem://family".to_string(), "file:///tmp/family".to_string()],
        );
        token.key = Some("s3cret".to_string());
        token
    }

    #[test]
    fn test_plain_token_roundtrip() {
        let token = token();
        let raw = token.encode(None).unwrap();
        assert!(!raw.contains('/'));
        assert_eq!(AccessToken::decode(&raw, None).unwrap(), token);
        // a private key does not get in the way of a plain token
        let bob = SecretKey::generate();
        assert_eq!(AccessToken::decode(&raw, Some(&bob)).unwrap(), token);
    }

    #[test]
    fn test_sealed_token() {
        let token = token();
        let bob = SecretKey::generate();
        let raw = token.encode(Some(&bob.public())).unwrap();

        assert_eq!(AccessToken::decode(&raw, Some(&bob)).unwrap(), token);
        assert!(AccessToken::decode(&raw, None).is_err());
        assert!(AccessToken::decode(&raw, Some(&SecretKey::generate())).is_err());
    }

    #[test]
    fn test_json_shape() {
        let token = token();
        let json = serde_json::to_string(&token).unwrap();
        assert!(json.contains("\"creatorId\""));
        assert!(json.contains("\"urls\""));
    }
}
