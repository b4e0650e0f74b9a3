//! File headers and the encrypted batch format they travel in.
//!
//! A batch is `key_id (8 bytes, big endian) || Secret::encrypt(json(headers))`
//! where the secret is the zone key of epoch `key_id`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{PublicKey, Secret, SecretError, IV_SIZE};

const KEY_ID_SIZE: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("header error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("no encryption key for epoch {0}")]
    NoEncryptionKey(u64),
    #[error("secret error: {0}")]
    Secret(#[from] SecretError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Searchable attributes of a file
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attributes {
    /// Hex SHA-384 of the plaintext body
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// Metadata of one file version.
///
/// `cached`, `cached_expires` and `downloads` are local bookkeeping kept by
/// the index and never written to the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub name: String,
    pub creator: PublicKey,
    /// Plaintext size
    pub size: u64,
    /// Size of the payload fed to the cipher, the compressed size when `zip`
    pub body_size: u64,
    pub mod_time: DateTime<Utc>,
    pub file_id: u64,
    /// `YYYYMMDD` folder holding the body
    pub bucket: String,
    pub iv: [u8; IV_SIZE],
    #[serde(default)]
    pub zip: bool,
    #[serde(default)]
    pub attributes: Attributes,
    pub body_key: Secret,
    #[serde(default)]
    pub deleted: bool,

    #[serde(skip)]
    pub cached: Option<PathBuf>,
    #[serde(skip)]
    pub cached_expires: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub downloads: BTreeMap<String, DateTime<Utc>>,
}

impl Header {
    /// Whether a cache entry exists and has not expired.
    pub fn is_cached(&self) -> bool {
        self.cached.is_some() && self.cached_expires.is_some_and(|e| e > Utc::now())
    }

    pub fn body_path(&self, zone: &str) -> String {
        format!("{}/{}/{}.b", zone, self.bucket, self.file_id)
    }
}

/// Encrypt `headers` under the zone key `key` of epoch `key_id`.
pub fn marshal_headers(
    headers: &[Header],
    key_id: u64,
    key: &Secret,
) -> Result<Vec<u8>, HeaderError> {
    let data = serde_json::to_vec(headers)?;
    let ciphertext = key.encrypt(&data)?;
    let mut out = Vec::with_capacity(KEY_ID_SIZE + ciphertext.len());
    out.extend_from_slice(&key_id.to_be_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Epoch a batch was encrypted under.
pub fn batch_key_id(data: &[u8]) -> Result<u64, HeaderError> {
    let prefix: [u8; KEY_ID_SIZE] = data
        .get(..KEY_ID_SIZE)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| anyhow::anyhow!("header batch too short"))?;
    Ok(u64::from_be_bytes(prefix))
}

/// Decrypt a batch with whichever of `keys` matches its epoch.
pub fn unmarshal_headers(
    data: &[u8],
    keys: &BTreeMap<u64, Secret>,
) -> Result<Vec<Header>, HeaderError> {
    let key_id = batch_key_id(data)?;
    let key = keys
        .get(&key_id)
        .ok_or(HeaderError::NoEncryptionKey(key_id))?;
    let plaintext = key.decrypt(&data[KEY_ID_SIZE..])?;
    Ok(serde_json::from_slice(&plaintext)?)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::crypto::{generate_iv, SecretKey};

    pub(crate) fn sample_header(name: &str, file_id: u64) -> Header {
        Header {
            name: name.to_string(),
            creator: SecretKey::generate().public(),
            size: 42,
            body_size: 42,
            mod_time: Utc::now(),
            file_id,
            bucket: "20240101".to_string(),
            iv: generate_iv(),
            zip: false,
            attributes: Attributes {
                hash: "ab".repeat(48),
                content_type: "text/plain".to_string(),
                tags: vec!["draft".to_string()],
                meta: BTreeMap::new(),
            },
            body_key: Secret::generate(),
            deleted: false,
            cached: None,
            cached_expires: None,
            downloads: BTreeMap::new(),
        }
    }

    #[test]
    fn test_header_batch_roundtrip() {
        let key = Secret::generate();
        let headers = vec![sample_header("a.txt", 1), sample_header("docs/b.txt", 2)];
        let data = marshal_headers(&headers, 99, &key).unwrap();
        assert_eq!(batch_key_id(&data).unwrap(), 99);

        let keys = BTreeMap::from([(99, key)]);
        assert_eq!(unmarshal_headers(&data, &keys).unwrap(), headers);
    }

    #[test]
    fn test_header_missing_key() {
        let data = marshal_headers(&[sample_header("a.txt", 1)], 5, &Secret::generate()).unwrap();
        let keys = BTreeMap::from([(4, Secret::generate())]);
        assert!(matches!(
            unmarshal_headers(&data, &keys),
            Err(HeaderError::NoEncryptionKey(5))
        ));
        assert!(matches!(
            unmarshal_headers(&data, &BTreeMap::new()),
            Err(HeaderError::NoEncryptionKey(5))
        ));
    }

    #[test]
    fn test_local_fields_not_serialized() {
        let mut header = sample_header("a.txt", 1);
        header.cached = Some(PathBuf::from("/tmp/1.cache"));
        header.cached_expires = Some(Utc::now());
        header
            .downloads
            .insert("/home/a.txt".to_string(), Utc::now());
        let json = serde_json::to_string(&header).unwrap();
        assert!(!json.contains("1.cache"));
        assert!(!json.contains("/home/a.txt"));
        let back: Header = serde_json::from_str(&json).unwrap();
        assert!(back.cached.is_none() && back.downloads.is_empty());
    }
}
