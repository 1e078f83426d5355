use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::raft::command::Command;
use crate::store::KeyRing;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Command,
}

/// Append-only consensus log of length-prefixed encrypted frames, indexed in
/// memory. Truncation and compaction rewrite the file; compaction runs with
/// the post-rotation key so the discarded prefix is unreadable afterwards.
pub struct LogStore {
    path: PathBuf,
    keys: Arc<KeyRing>,
    inner: Mutex<BTreeMap<u64, LogEntry>>,
}

fn read_frames(path: &Path, keys: &KeyRing) -> Result<BTreeMap<u64, LogEntry>> {
    let mut entries = BTreeMap::new();
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(e.into()),
    };
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let mut pos = 0usize;
    while pos + 4 <= buf.len() {
        let len = u32::from_be_bytes(buf[pos..pos + 4].try_into().expect("4-byte slice")) as usize;
        pos += 4;
        if pos + len > buf.len() {
            // Torn tail from a crash mid-append; everything before it is
            // intact.
            log::warn!("consensus log has a torn tail frame, dropping it");
            break;
        }
        let plain = keys.decrypt(&buf[pos..pos + len])?;
        let entry: LogEntry = serde_json::from_slice(&plain)
            .map_err(|_| EngineError::Corrupt("consensus log frame".into()))?;
        entries.insert(entry.index, entry);
        pos += len;
    }
    Ok(entries)
}

impl LogStore {
    pub fn open(path: &Path, keys: Arc<KeyRing>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let entries = read_frames(path, &keys)?;
        Ok(Self {
            path: path.to_path_buf(),
            keys,
            inner: Mutex::new(entries),
        })
    }

    fn append_frame(&self, file: &mut File, entry: &LogEntry) -> Result<()> {
        let plain = serde_json::to_vec(entry)?;
        let sealed = self.keys.encrypt(&plain)?;
        file.write_all(&(sealed.len() as u32).to_be_bytes())?;
        file.write_all(&sealed)?;
        Ok(())
    }

    fn rewrite(&self, entries: &BTreeMap<u64, LogEntry>) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            for entry in entries.values() {
                self.append_frame(&mut file, entry)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn append(&self, new: &[LogEntry]) -> Result<()> {
        let mut inner = self.inner.lock().expect("log lock poisoned");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for entry in new {
            self.append_frame(&mut file, entry)?;
            inner.insert(entry.index, entry.clone());
        }
        file.sync_all()?;
        Ok(())
    }

    pub fn get(&self, index: u64) -> Option<LogEntry> {
        self.inner
            .lock()
            .expect("log lock poisoned")
            .get(&index)
            .cloned()
    }

    pub fn term_of(&self, index: u64) -> Option<u64> {
        self.inner
            .lock()
            .expect("log lock poisoned")
            .get(&index)
            .map(|e| e.term)
    }

    pub fn first_index(&self) -> u64 {
        self.inner
            .lock()
            .expect("log lock poisoned")
            .keys()
            .next()
            .copied()
            .unwrap_or(0)
    }

    pub fn last_index(&self) -> u64 {
        self.inner
            .lock()
            .expect("log lock poisoned")
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }

    pub fn last_term(&self) -> u64 {
        self.inner
            .lock()
            .expect("log lock poisoned")
            .values()
            .next_back()
            .map(|e| e.term)
            .unwrap_or(0)
    }

    pub fn range_from(&self, index: u64) -> Vec<LogEntry> {
        self.inner
            .lock()
            .expect("log lock poisoned")
            .range(index..)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn range(&self, from: u64, to_inclusive: u64) -> Vec<LogEntry> {
        if from > to_inclusive {
            return Vec::new();
        }
        self.inner
            .lock()
            .expect("log lock poisoned")
            .range(from..=to_inclusive)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry at or above `index` (follower conflict repair).
    pub fn truncate_from(&self, index: u64) -> Result<()> {
        let mut inner = self.inner.lock().expect("log lock poisoned");
        inner.retain(|i, _| *i < index);
        self.rewrite(&inner)
    }

    /// Drop every entry at or below `index` (post-snapshot compaction).
    pub fn compact_through(&self, index: u64) -> Result<()> {
        let mut inner = self.inner.lock().expect("log lock poisoned");
        inner.retain(|i, _| *i > index);
        self.rewrite(&inner)
    }
}

/// Small encrypted KV used for raft hard state (current term, voted-for,
/// snapshot bookkeeping). The whole map is rewritten on every set; the keys
/// are few and writes are rare.
pub struct StableStore {
    path: PathBuf,
    keys: Arc<KeyRing>,
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl StableStore {
    pub fn open(path: &Path, keys: Arc<KeyRing>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let inner = match fs::read(path) {
            Ok(sealed) => {
                let plain = keys.decrypt(&sealed)?;
                serde_json::from_slice(&plain)
                    .map_err(|_| EngineError::Corrupt("stable store".into()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            keys,
            inner: Mutex::new(inner),
        })
    }

    fn persist(&self, inner: &HashMap<String, Vec<u8>>) -> Result<()> {
        let plain = serde_json::to_vec(inner)?;
        let sealed = self.keys.encrypt(&plain)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, sealed)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().expect("stable lock poisoned");
        inner.insert(key.to_string(), value.to_vec());
        self.persist(&inner)
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .expect("stable lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn set_u64(&self, key: &str, value: u64) -> Result<()> {
        self.set(key, &value.to_be_bytes())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key)
            .and_then(|v| v.try_into().ok())
            .map(u64::from_be_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActionRecord;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            command: Command::ApplyAction {
                game_id: "g".into(),
                actions: vec![ActionRecord::new(format!("a-{index}"), "PITCH")],
                origin: None,
            },
        }
    }

    #[test]
    fn append_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft-log");
        let keys = Arc::new(KeyRing::ephemeral());
        {
            let store = LogStore::open(&path, Arc::clone(&keys)).unwrap();
            store.append(&[entry(1, 1), entry(2, 1), entry(3, 2)]).unwrap();
        }
        let store = LogStore::open(&path, keys).unwrap();
        assert_eq!(store.first_index(), 1);
        assert_eq!(store.last_index(), 3);
        assert_eq!(store.term_of(3), Some(2));
    }

    #[test]
    fn truncate_and_compact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft-log");
        let keys = Arc::new(KeyRing::ephemeral());
        let store = LogStore::open(&path, Arc::clone(&keys)).unwrap();
        store
            .append(&[entry(1, 1), entry(2, 1), entry(3, 1), entry(4, 1)])
            .unwrap();

        store.truncate_from(4).unwrap();
        assert_eq!(store.last_index(), 3);

        store.compact_through(2).unwrap();
        assert_eq!(store.first_index(), 3);
        assert_eq!(store.last_index(), 3);

        let reopened = LogStore::open(&path, keys).unwrap();
        assert_eq!(reopened.first_index(), 3);
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn compaction_after_rotation_uses_fresh_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft-log");
        let keys = Arc::new(KeyRing::ephemeral());
        let store = LogStore::open(&path, Arc::clone(&keys)).unwrap();
        store.append(&[entry(1, 1), entry(2, 1)]).unwrap();
        keys.rotate().unwrap();
        store.compact_through(1).unwrap();
        // Still readable through the ring after rotation.
        let reopened = LogStore::open(&path, keys).unwrap();
        assert_eq!(reopened.first_index(), 2);
    }

    #[test]
    fn stable_store_u64_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stable-store");
        let keys = Arc::new(KeyRing::ephemeral());
        {
            let stable = StableStore::open(&path, Arc::clone(&keys)).unwrap();
            stable.set_u64("current_term", 7).unwrap();
            stable.set("voted_for", b"node-2").unwrap();
        }
        let stable = StableStore::open(&path, keys).unwrap();
        assert_eq!(stable.get_u64("current_term"), Some(7));
        assert_eq!(stable.get("voted_for").unwrap(), b"node-2");
    }
}
