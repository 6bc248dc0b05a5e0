//! Encrypted persistence for the brokerage session token.
//!
//! AES-256-GCM with a random 12-byte nonce prepended to the ciphertext.
//! The key is derived from the `ENCRYPTION_KEY_SALT` environment secret via
//! PBKDF2-HMAC-SHA256 (600k iterations). Writes go through a sibling
//! `.tmp` file, get 0600 permissions, then rename into place so a crash
//! never leaves a partially written blob.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const PBKDF2_ITERATIONS: u32 = 600_000;
const SALT_SIZE: usize = 16;

#[cfg(unix)]
const SECURE_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum TokenStoreError {
    /// GCM authentication failed or the payload cannot be parsed. The
    /// on-disk file is cleared before this surfaces.
    #[error("token store corrupt (key mismatch or tampered data)")]
    Corrupt,

    #[error("token store io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Serialize, Deserialize)]
struct StoredToken {
    token: String,
    expires_at: DateTime<Utc>,
}

pub struct TokenStore {
    path: PathBuf,
    memory_only: bool,
    salt_base: String,
    cached: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl TokenStore {
    /// `memory_only` skips disk entirely (tokens die with the process).
    pub fn new(path: impl Into<PathBuf>, memory_only: bool) -> std::io::Result<Self> {
        let salt_base = match std::env::var("ENCRYPTION_KEY_SALT") {
            Ok(v) if !v.is_empty() => v,
            _ => {
                warn!("ENCRYPTION_KEY_SALT not set, using default (NOT SECURE for production)");
                "default-salt-change-in-production".to_string()
            }
        };
        Self::with_salt(path, memory_only, salt_base)
    }

    pub fn with_salt(
        path: impl Into<PathBuf>,
        memory_only: bool,
        salt_base: String,
    ) -> std::io::Result<Self> {
        let path = path.into();
        if !memory_only {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            debug!(path = %path.display(), "token store initialized");
        } else {
            debug!("token store initialized in memory-only mode");
        }
        Ok(Self {
            path,
            memory_only,
            salt_base,
            cached: Mutex::new(None),
        })
    }

    fn derive_key(&self) -> [u8; KEY_SIZE] {
        let mut salt = [0u8; SALT_SIZE];
        let base = self.salt_base.as_bytes();
        let n = base.len().min(SALT_SIZE);
        salt[..n].copy_from_slice(&base[..n]);

        let mut key = [0u8; KEY_SIZE];
        pbkdf2_hmac::<Sha256>(base, &salt, PBKDF2_ITERATIONS, &mut key);
        key
    }

    fn encrypt(&self, stored: &StoredToken) -> Result<Vec<u8>, TokenStoreError> {
        let plaintext = serde_json::to_vec(stored).map_err(|_| TokenStoreError::Corrupt)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = self.derive_key();
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| TokenStoreError::Corrupt)?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<StoredToken, TokenStoreError> {
        if blob.len() <= NONCE_SIZE {
            return Err(TokenStoreError::Corrupt);
        }
        let nonce = Nonce::from_slice(&blob[..NONCE_SIZE]);
        let key = self.derive_key();
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let plaintext = cipher
            .decrypt(nonce, &blob[NONCE_SIZE..])
            .map_err(|_| TokenStoreError::Corrupt)?;
        serde_json::from_slice(&plaintext).map_err(|_| TokenStoreError::Corrupt)
    }

    /// Encrypt and persist the token (atomic write, 0600).
    pub fn store(&self, token: &str, expires_at: DateTime<Utc>) -> Result<(), TokenStoreError> {
        *self.cached.lock() = Some((token.to_string(), expires_at));

        if self.memory_only {
            debug!("token stored in memory only");
            return Ok(());
        }

        let blob = self.encrypt(&StoredToken {
            token: token.to_string(),
            expires_at,
        })?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &blob)?;
        set_secure_permissions(&tmp_path)?;
        std::fs::rename(&tmp_path, &self.path)?;
        set_secure_permissions(&self.path)?;

        info!(path = %self.path.display(), "token stored securely");
        Ok(())
    }

    /// Load the token if one exists and has not expired. Corrupt or
    /// tampered blobs are cleared from disk and reported as an error.
    pub fn load(&self) -> Result<Option<(String, DateTime<Utc>)>, TokenStoreError> {
        let now = Utc::now();

        {
            let mut cached = self.cached.lock();
            if let Some((token, expires_at)) = cached.clone() {
                if expires_at > now {
                    return Ok(Some((token, expires_at)));
                }
                debug!("cached token expired, clearing cache");
                *cached = None;
            }
        }

        if self.memory_only || !self.path.exists() {
            return Ok(None);
        }

        let blob = std::fs::read(&self.path)?;
        let stored = match self.decrypt(&blob) {
            Ok(stored) => stored,
            Err(err) => {
                warn!("token store failed authentication, clearing file");
                let _ = std::fs::remove_file(&self.path);
                return Err(err);
            }
        };

        if stored.expires_at <= now {
            info!("stored token has expired");
            self.clear()?;
            return Ok(None);
        }

        *self.cached.lock() = Some((stored.token.clone(), stored.expires_at));
        Ok(Some((stored.token, stored.expires_at)))
    }

    pub fn clear(&self) -> Result<(), TokenStoreError> {
        *self.cached.lock() = None;
        if !self.memory_only && self.path.exists() {
            std::fs::remove_file(&self.path)?;
            info!("token file deleted");
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.load(), Ok(Some(_)))
    }
}

#[cfg(unix)]
fn set_secure_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SECURE_MODE))
}

#[cfg(not(unix))]
fn set_secure_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store_at(dir: &tempfile::TempDir) -> TokenStore {
        TokenStore::with_salt(
            dir.path().join("tokens.enc"),
            false,
            "unit-test-salt".to_string(),
        )
        .unwrap()
    }

    #[test]
    fn test_store_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(&dir);
        let expires = Utc::now() + Duration::hours(4);

        store.store("jwt-abc123", expires).unwrap();

        // Fresh instance forces a disk read.
        let reloaded = store_at(&dir);
        let (token, loaded_expiry) = reloaded.load().unwrap().expect("token present");
        assert_eq!(token, "jwt-abc123");
        assert_eq!(loaded_expiry.timestamp(), expires.timestamp());
    }

    #[test]
    fn test_expired_token_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(&dir);
        store
            .store("stale", Utc::now() - Duration::hours(1))
            .unwrap();

        let reloaded = store_at(&dir);
        assert!(reloaded.load().unwrap().is_none());
        assert!(!dir.path().join("tokens.enc").exists());
    }

    #[test]
    fn test_tampered_blob_is_rejected_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(&dir);
        store
            .store("secret", Utc::now() + Duration::hours(1))
            .unwrap();

        let path = dir.path().join("tokens.enc");
        let mut blob = std::fs::read(&path).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        std::fs::write(&path, &blob).unwrap();

        let reloaded = store_at(&dir);
        assert!(matches!(reloaded.load(), Err(TokenStoreError::Corrupt)));
        assert!(!path.exists());
    }

    #[test]
    fn test_wrong_salt_cannot_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(&dir);
        store
            .store("secret", Utc::now() + Duration::hours(1))
            .unwrap();

        let other = TokenStore::with_salt(
            dir.path().join("tokens.enc"),
            false,
            "different-salt".to_string(),
        )
        .unwrap();
        assert!(matches!(other.load(), Err(TokenStoreError::Corrupt)));
    }

    #[test]
    fn test_memory_only_never_touches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::with_salt(
            dir.path().join("tokens.enc"),
            true,
            "unit-test-salt".to_string(),
        )
        .unwrap();
        store
            .store("ephemeral", Utc::now() + Duration::hours(1))
            .unwrap();

        assert!(!dir.path().join("tokens.enc").exists());
        assert!(store.is_valid());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(&dir);
        store
            .store("secret", Utc::now() + Duration::hours(1))
            .unwrap();

        let mode = std::fs::metadata(dir.path().join("tokens.enc"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
