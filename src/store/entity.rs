use std::collections::{HashMap, HashSet};
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::error::{EngineError, Result};
use crate::model::Entity;
use crate::store::keyring::KeyRing;

const STRIPES: usize = 32;

/// Directory-backed store for one entity kind. Memory is the write-through
/// cache; the dirty set tracks entities whose latest state has not reached
/// disk yet (delayed persistence under clustered mode). Disk bytes are
/// encrypted through the key ring.
pub struct EntityStore<T: Entity> {
    dir: PathBuf,
    keys: Arc<KeyRing>,
    cache: RwLock<HashMap<String, T>>,
    dirty: Mutex<HashSet<String>>,
    stripes: Vec<Mutex<()>>,
}

fn file_stem(id: &str) -> String {
    // Ids are UUIDs or emails; only path separators need mangling.
    id.replace(['/', '\\'], "_")
}

impl<T: Entity> EntityStore<T> {
    pub fn open(root: &Path, keys: Arc<KeyRing>) -> Result<Self> {
        let dir = root.join(T::KIND);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            keys,
            cache: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(id)))
    }

    fn stripe(&self, id: &str) -> MutexGuard<'_, ()> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        id.hash(&mut hasher);
        self.stripes[hasher.finish() as usize % STRIPES]
            .lock()
            .expect("stripe lock poisoned")
    }

    fn write_disk(&self, entity: &T) -> Result<()> {
        let plain = serde_json::to_vec(entity)?;
        let sealed = self.keys.encrypt(&plain)?;
        let path = self.file_path(entity.id());
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, sealed)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_disk(&self, id: &str) -> Result<T> {
        let path = self.file_path(id);
        let sealed = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::NotExist(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let plain = self.keys.decrypt(&sealed)?;
        serde_json::from_slice(&plain)
            .map_err(|_| EngineError::Corrupt(format!("{}/{}", T::KIND, id)))
    }

    /// Synchronous write of memory and disk.
    pub fn save(&self, entity: &T) -> Result<()> {
        let _guard = self.stripe(entity.id());
        self.write_disk(entity)?;
        self.cache
            .write()
            .expect("cache lock poisoned")
            .insert(entity.id().to_string(), entity.clone());
        self.dirty
            .lock()
            .expect("dirty lock poisoned")
            .remove(entity.id());
        Ok(())
    }

    /// Always updates memory; flushes to disk only when asked, otherwise the
    /// entity joins the dirty set for a later `flush_all`.
    pub fn save_in_memory(&self, entity: &T, flush: bool) -> Result<()> {
        if flush {
            return self.save(entity);
        }
        let _guard = self.stripe(entity.id());
        self.cache
            .write()
            .expect("cache lock poisoned")
            .insert(entity.id().to_string(), entity.clone());
        self.dirty
            .lock()
            .expect("dirty lock poisoned")
            .insert(entity.id().to_string());
        Ok(())
    }

    /// Memory first, then disk (read-through), else NotExist.
    pub fn load(&self, id: &str) -> Result<T> {
        if let Some(hit) = self
            .cache
            .read()
            .expect("cache lock poisoned")
            .get(id)
            .cloned()
        {
            return Ok(hit);
        }
        let _guard = self.stripe(id);
        let entity = self.read_disk(id)?;
        self.cache
            .write()
            .expect("cache lock poisoned")
            .insert(id.to_string(), entity.clone());
        Ok(entity)
    }

    /// Tombstone: the entity stays on disk with deleted status so concurrent
    /// readers observe the deletion until the GC purges it.
    pub fn delete(&self, id: &str, at_ns: i64) -> Result<T> {
        let mut entity = self.load(id)?;
        entity.mark_deleted(at_ns);
        self.save(&entity)?;
        Ok(entity)
    }

    /// Remove a tombstone entirely.
    pub fn purge(&self, id: &str) -> Result<()> {
        let _guard = self.stripe(id);
        self.cache.write().expect("cache lock poisoned").remove(id);
        self.dirty.lock().expect("dirty lock poisoned").remove(id);
        match fs::remove_file(self.file_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().expect("dirty lock poisoned").len()
    }

    /// Write every dirty entity to disk and clear the dirty set.
    pub fn flush_all(&self) -> Result<usize> {
        let pending: Vec<String> = self
            .dirty
            .lock()
            .expect("dirty lock poisoned")
            .iter()
            .cloned()
            .collect();
        let mut flushed = 0;
        for id in &pending {
            let entity = self.cache.read().expect("cache lock poisoned").get(id).cloned();
            if let Some(entity) = entity {
                let _guard = self.stripe(id);
                self.write_disk(&entity)?;
                flushed += 1;
            }
            self.dirty.lock().expect("dirty lock poisoned").remove(id);
        }
        Ok(flushed)
    }

    pub fn ids_on_disk(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".json") {
                ids.push(stem.to_string());
            }
        }
        Ok(ids)
    }

    /// One-shot streaming union of disk entries and dirty memory entries,
    /// deduplicated by id with memory winning. Restartable: each call builds
    /// a fresh iterator over a point-in-time id set.
    pub fn list_all(&self) -> Result<impl Iterator<Item = Result<T>> + '_> {
        let mut ids = self.ids_on_disk()?;
        let mut seen: HashSet<String> = ids.iter().cloned().collect();
        for id in self.dirty.lock().expect("dirty lock poisoned").iter() {
            if seen.insert(file_stem(id)) {
                ids.push(file_stem(id));
            }
        }
        Ok(ids.into_iter().map(move |id| {
            if let Some(hit) = self
                .cache
                .read()
                .expect("cache lock poisoned")
                .get(&id)
                .cloned()
            {
                return Ok(hit);
            }
            self.read_disk(&id)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityStatus, Game, now_ns};

    fn store(dir: &Path) -> EntityStore<Game> {
        EntityStore::open(dir, Arc::new(KeyRing::ephemeral())).unwrap()
    }

    #[test]
    fn save_load_round_trip_is_encrypted_at_rest() {
        let dir = tempfile::tempdir().unwrap();
        let games = store(dir.path());
        let game = Game::new("g-1");
        games.save(&game).unwrap();

        let raw = fs::read(games.file_path("g-1")).unwrap();
        assert!(!raw.windows(3).any(|w| w == b"g-1"));

        let loaded = games.load("g-1").unwrap();
        assert_eq!(loaded.id, "g-1");
    }

    #[test]
    fn load_missing_is_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let games = store(dir.path());
        assert!(matches!(
            games.load("nope").unwrap_err(),
            EngineError::NotExist(_)
        ));
    }

    #[test]
    fn delete_tombstones_and_purge_removes() {
        let dir = tempfile::tempdir().unwrap();
        let games = store(dir.path());
        games.save(&Game::new("g-2")).unwrap();

        let tombstone = games.delete("g-2", now_ns()).unwrap();
        assert_eq!(tombstone.status, EntityStatus::Deleted);
        assert!(tombstone.deleted_at > 0);
        assert_eq!(games.load("g-2").unwrap().status, EntityStatus::Deleted);

        games.purge("g-2").unwrap();
        assert!(matches!(
            games.load("g-2").unwrap_err(),
            EngineError::NotExist(_)
        ));
        assert!(!games.file_path("g-2").exists());
    }

    #[test]
    fn dirty_entities_flush_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let games = store(dir.path());
        games.save_in_memory(&Game::new("g-3"), false).unwrap();

        assert_eq!(games.dirty_count(), 1);
        assert!(!games.file_path("g-3").exists());
        // Visible from memory before any disk write.
        assert_eq!(games.load("g-3").unwrap().id, "g-3");

        assert_eq!(games.flush_all().unwrap(), 1);
        assert_eq!(games.dirty_count(), 0);
        assert!(games.file_path("g-3").exists());
    }

    #[test]
    fn list_all_unions_disk_and_dirty_memory() {
        let dir = tempfile::tempdir().unwrap();
        let games = store(dir.path());
        games.save(&Game::new("on-disk")).unwrap();

        let mut newer = Game::new("on-disk");
        newer.event = "memory wins".into();
        games.save_in_memory(&newer, false).unwrap();
        games.save_in_memory(&Game::new("memory-only"), false).unwrap();

        let mut listed: Vec<Game> = games
            .list_all()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        listed.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "memory-only");
        assert_eq!(listed[1].event, "memory wins");
    }
}
