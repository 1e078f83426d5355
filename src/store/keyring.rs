use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Ordered ring of symmetric keys. Encryption always uses the active key;
/// decryption tries the active key first and then each old key in order, so
/// rotation never strands previously written data. Structurally invalid
/// ciphertext fails immediately instead of cycling through the ring, so a
/// corrupt file is reported as corruption rather than a key mismatch.
pub struct KeyRing {
    inner: RwLock<Ring>,
    path: Option<PathBuf>,
}

struct Ring {
    active: [u8; KEY_LEN],
    old: Vec<[u8; KEY_LEN]>,
}

#[derive(Serialize, Deserialize)]
struct RingFile {
    active: String,
    #[serde(default)]
    old: Vec<String>,
}

fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

fn decode_key(hex_key: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = hex::decode(hex_key)
        .map_err(|_| EngineError::Corrupt("key ring entry is not hex".into()))?;
    bytes
        .try_into()
        .map_err(|_| EngineError::Corrupt("key ring entry has wrong length".into()))
}

impl KeyRing {
    /// Fixed-key ring shared by every cluster member, derived from the
    /// cluster secret. Never rotated and never persisted.
    pub fn from_secret(secret: &str) -> Self {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(secret.as_bytes());
        Self {
            inner: RwLock::new(Ring {
                active: digest.into(),
                old: Vec::new(),
            }),
            path: None,
        }
    }

    /// Ephemeral ring, used by tests and standalone mode without a data dir.
    pub fn ephemeral() -> Self {
        Self {
            inner: RwLock::new(Ring {
                active: random_key(),
                old: Vec::new(),
            }),
            path: None,
        }
    }

    /// Load the ring persisted at `path`, or create and persist a fresh one.
    pub fn open(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)?;
            let file: RingFile = serde_json::from_str(&raw)
                .map_err(|_| EngineError::Corrupt(format!("key ring at {}", path.display())))?;
            let active = decode_key(&file.active)?;
            let old = file
                .old
                .iter()
                .map(|k| decode_key(k))
                .collect::<Result<Vec<_>>>()?;
            Ok(Self {
                inner: RwLock::new(Ring { active, old }),
                path: Some(path.to_path_buf()),
            })
        } else {
            let ring = Self {
                inner: RwLock::new(Ring {
                    active: random_key(),
                    old: Vec::new(),
                }),
                path: Some(path.to_path_buf()),
            };
            ring.persist()?;
            Ok(ring)
        }
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let inner = self.inner.read().expect("key ring lock poisoned");
        let file = RingFile {
            active: hex::encode(inner.active),
            old: inner.old.iter().map(hex::encode).collect(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(&file)?)?;
        Ok(())
    }

    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let inner = self.inner.read().expect("key ring lock poisoned");
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&inner.active));
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| EngineError::Internal("encryption failure".into()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(EngineError::Corrupt("ciphertext shorter than header".into()));
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);
        let inner = self.inner.read().expect("key ring lock poisoned");
        for key in std::iter::once(&inner.active).chain(inner.old.iter()) {
            let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
            if let Ok(plain) = cipher.decrypt(Nonce::from_slice(nonce), sealed) {
                return Ok(plain);
            }
        }
        Err(EngineError::DecryptFailed)
    }

    /// Retire the active key to the head of the old list and start
    /// encrypting with a fresh one.
    pub fn rotate(&self) -> Result<()> {
        {
            let mut inner = self.inner.write().expect("key ring lock poisoned");
            let retired = std::mem::replace(&mut inner.active, random_key());
            inner.old.insert(0, retired);
        }
        self.persist()
    }

    pub fn fingerprint(&self) -> String {
        let inner = self.inner.read().expect("key ring lock poisoned");
        hex::encode(&inner.active[..4])
    }

    /// Zero key material. The ring is unusable afterwards.
    pub fn wipe(&self) {
        let mut inner = self.inner.write().expect("key ring lock poisoned");
        inner.active.fill(0);
        for key in inner.old.iter_mut() {
            key.fill(0);
        }
        inner.old.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let ring = KeyRing::ephemeral();
        let sealed = ring.encrypt(b"hello").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"hello");
        assert_eq!(ring.decrypt(&sealed).unwrap(), b"hello");
    }

    #[test]
    fn old_keys_still_decrypt_after_rotation() {
        let ring = KeyRing::ephemeral();
        let sealed = ring.encrypt(b"pre-rotation").unwrap();
        ring.rotate().unwrap();
        ring.rotate().unwrap();
        assert_eq!(ring.decrypt(&sealed).unwrap(), b"pre-rotation");
        let fresh = ring.encrypt(b"post").unwrap();
        assert_eq!(ring.decrypt(&fresh).unwrap(), b"post");
    }

    #[test]
    fn short_ciphertext_is_corrupt_not_key_mismatch() {
        let ring = KeyRing::ephemeral();
        let err = ring.decrypt(&[0u8; 8]).unwrap_err();
        assert!(matches!(err, EngineError::Corrupt(_)));
    }

    #[test]
    fn unknown_key_exhausts_ring() {
        let a = KeyRing::ephemeral();
        let b = KeyRing::ephemeral();
        let sealed = a.encrypt(b"secret").unwrap();
        assert!(matches!(
            b.decrypt(&sealed).unwrap_err(),
            EngineError::DecryptFailed
        ));
    }

    #[test]
    fn persisted_ring_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring.json");
        let sealed = {
            let ring = KeyRing::open(&path).unwrap();
            ring.rotate().unwrap();
            ring.encrypt(b"durable").unwrap()
        };
        let reloaded = KeyRing::open(&path).unwrap();
        assert_eq!(reloaded.decrypt(&sealed).unwrap(), b"durable");
    }
}
