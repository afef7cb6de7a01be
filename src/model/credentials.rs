use std::fs;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use openssl::hash::MessageDigest;
use openssl::pkcs5::pbkdf2_hmac;
use openssl::rand::rand_bytes;
use openssl::symm::{Cipher, decrypt_aead, encrypt_aead};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HaCredentials {
    pub base_url: String,
    pub token: String,
}

/// Somewhere previously entered Home Assistant credentials can be read from.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn load_credentials(&self) -> ApiResult<Option<HaCredentials>>;
}

/// Home Assistant credentials encrypted at rest with AES-256-GCM.
///
/// The key is derived (PBKDF2-SHA256) from a random per-device key kept in a
/// separate file. The blob is hex of `nonce || ciphertext || tag`.
#[derive(Clone, Debug)]
pub struct CredentialStore {
    credentials_file: Utf8PathBuf,
    device_key_file: Utf8PathBuf,
}

impl CredentialStore {
    const PBKDF2_ITERATIONS: usize = 200_000;
    const SALT: &'static [u8] = b"neolia-ha-salt";
    const NONCE_LEN: usize = 12;
    const TAG_LEN: usize = 16;

    #[must_use]
    pub const fn new(credentials_file: Utf8PathBuf, device_key_file: Utf8PathBuf) -> Self {
        Self {
            credentials_file,
            device_key_file,
        }
    }

    fn device_key(&self) -> ApiResult<String> {
        if self.device_key_file.is_file() {
            let key = fs::read_to_string(&self.device_key_file)?;
            let key = key.trim();
            if !key.is_empty() {
                return Ok(key.to_string());
            }
        }

        let mut raw = [0u8; 32];
        rand_bytes(&mut raw)?;
        let key = hex::encode(raw);
        if let Some(parent) = self.device_key_file.parent() {
            if !parent.as_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.device_key_file, &key)?;
        log::debug!("Generated new device key [{}]", self.device_key_file);
        Ok(key)
    }

    fn derive_key(device_key: &str) -> ApiResult<[u8; 32]> {
        let mut key = [0u8; 32];
        pbkdf2_hmac(
            device_key.as_bytes(),
            Self::SALT,
            Self::PBKDF2_ITERATIONS,
            MessageDigest::sha256(),
            &mut key,
        )?;
        Ok(key)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> ApiResult<String> {
        let key = Self::derive_key(&self.device_key()?)?;
        let mut nonce = [0u8; Self::NONCE_LEN];
        rand_bytes(&mut nonce)?;
        let mut tag = [0u8; Self::TAG_LEN];

        let ciphertext = encrypt_aead(
            Cipher::aes_256_gcm(),
            &key,
            Some(&nonce),
            &[],
            plaintext,
            &mut tag,
        )?;

        let mut blob = Vec::with_capacity(nonce.len() + ciphertext.len() + tag.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        blob.extend_from_slice(&tag);
        Ok(hex::encode(blob))
    }

    pub fn decrypt(&self, encoded: &str) -> ApiResult<Vec<u8>> {
        let blob = hex::decode(encoded.trim())?;
        if blob.len() < Self::NONCE_LEN + Self::TAG_LEN {
            return Err(ApiError::InvalidFormat(
                "encrypted credentials too short".to_string(),
            ));
        }
        let (nonce, rest) = blob.split_at(Self::NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - Self::TAG_LEN);

        let key = Self::derive_key(&self.device_key()?)?;
        Ok(decrypt_aead(
            Cipher::aes_256_gcm(),
            &key,
            Some(nonce),
            &[],
            ciphertext,
            tag,
        )?)
    }

    pub fn store(&self, creds: &HaCredentials) -> ApiResult<()> {
        let encoded = self.encrypt(&serde_json::to_vec(creds)?)?;
        if let Some(parent) = self.credentials_file.parent() {
            if !parent.as_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.credentials_file, encoded)?;
        Ok(())
    }

    pub fn load(&self) -> ApiResult<Option<HaCredentials>> {
        if !self.credentials_file.is_file() {
            return Ok(None);
        }
        let encoded = fs::read_to_string(&self.credentials_file)?;
        let plaintext = self.decrypt(&encoded)?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    pub fn clear(&self) -> ApiResult<()> {
        if self.credentials_file.is_file() {
            fs::remove_file(&self.credentials_file)?;
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialSource for CredentialStore {
    async fn load_credentials(&self) -> ApiResult<Option<HaCredentials>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.load()).await?
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    use crate::model::credentials::{CredentialSource, CredentialStore, HaCredentials};

    fn store_in(dir: &TempDir) -> CredentialStore {
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        CredentialStore::new(root.join("ha.enc"), root.join("device.key"))
    }

    fn creds() -> HaCredentials {
        HaCredentials {
            base_url: "http://192.168.1.80:8123".to_string(),
            token: "long-lived-token".to_string(),
        }
    }

    #[test]
    fn stored_credentials_are_not_plaintext() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.store(&creds()).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("ha.enc")).unwrap();
        assert!(!raw.contains("long-lived-token"));
        assert_eq!(store.load().unwrap(), Some(creds()));
    }

    #[test]
    fn other_device_key_cannot_decrypt() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.store(&creds()).unwrap();

        std::fs::write(dir.path().join("device.key"), "00ff").unwrap();
        assert!(store.load().is_err());
    }

    #[test]
    fn truncated_blob_is_a_format_error() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let err = store.decrypt("abcd").unwrap_err();
        assert!(err.is_payload());
    }

    #[tokio::test]
    async fn missing_file_yields_none() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        assert_eq!(store.load_credentials().await.unwrap(), None);
        store.clear().unwrap();
    }
}
