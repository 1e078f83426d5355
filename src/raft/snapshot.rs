use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::core::Core;
use crate::error::{EngineError, Result};
use crate::model::{Entity, Game, GameUsersIndex, NodeMeta, Team, TeamGamesIndex, TeamUsersIndex,
    UserAccessPolicy, UserIndex};
use crate::raft::fsm::{FsmState, StateMachine};
use crate::store::{EntityStore, KeyRing};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// First entry of every replication archive: enough for a receiver to decide
/// whether it needs the entity payload at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub raft_index: u64,
    pub term: u64,
    pub nodes: HashMap<String, NodeMeta>,
    pub initialized: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapMeta {
    id: String,
    index: u64,
    term: u64,
    timestamp: i64,
}

/// Snapshot directory store. Local snapshots are cheap: a manifest plus
/// hardlinks into the encrypted entity files, so taking one never copies
/// entity bytes. Serving one for replication hydrates a logical export
/// (manifest-first TAR, gzipped, encrypted with the cluster key) and caches
/// it so repeated opens return byte-identical streams.
pub struct SnapshotStore {
    dir: PathBuf,
    core: Arc<Core>,
    cluster_key: Arc<KeyRing>,
}

fn link_dir_into(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if name.to_string_lossy().ends_with(".tmp") {
            continue;
        }
        fs::hard_link(entry.path(), dst.join(&name))?;
    }
    Ok(())
}

impl SnapshotStore {
    pub fn open(dir: &Path, core: Arc<Core>, cluster_key: Arc<KeyRing>) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            core,
            cluster_key,
        })
    }

    pub fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    /// Take a local snapshot: manifest as the encrypted state stream, entity
    /// files as hardlinks to the live store. Call only after a `flush_all`
    /// so disk is the source of truth.
    pub fn create(&self, manifest: &Manifest) -> Result<String> {
        let id = format!(
            "{}-{}-{}",
            manifest.term, manifest.raft_index, manifest.timestamp
        );
        let snap = self.snapshot_dir(&id);
        fs::create_dir_all(&snap)?;

        let meta = SnapMeta {
            id: id.clone(),
            index: manifest.raft_index,
            term: manifest.term,
            timestamp: manifest.timestamp,
        };
        fs::write(snap.join("meta.json"), serde_json::to_vec_pretty(&meta)?)?;

        let state = self.cluster_key.encrypt(&serde_json::to_vec(manifest)?)?;
        fs::write(snap.join("state.bin"), state)?;

        let data = &self.core.data_dir;
        for kind in [
            Game::KIND,
            Team::KIND,
            UserIndex::KIND,
            TeamGamesIndex::KIND,
            GameUsersIndex::KIND,
            TeamUsersIndex::KIND,
        ] {
            link_dir_into(&data.join(kind), &snap.join(kind))?;
        }
        for single in ["sys_access_policy", "metrics.json", "nodes.json", "fsm_state.json"] {
            let src = data.join(single);
            if src.is_file() {
                fs::hard_link(&src, snap.join(single))?;
            }
        }
        log::info!("snapshot {id} created at index {}", manifest.raft_index);
        Ok(id)
    }

    /// Persist an archive delivered by a leader so this node can serve it
    /// onward. The state stream is the raw archive; `open` detects that by
    /// the gzip magic after decryption.
    pub fn save_received(&self, index: u64, term: u64, sealed: &[u8]) -> Result<String> {
        let timestamp = crate::model::now_ns();
        let id = format!("{term}-{index}-{timestamp}");
        let snap = self.snapshot_dir(&id);
        fs::create_dir_all(&snap)?;
        let meta = SnapMeta {
            id: id.clone(),
            index,
            term,
            timestamp,
        };
        fs::write(snap.join("meta.json"), serde_json::to_vec_pretty(&meta)?)?;
        fs::write(snap.join("state.bin"), sealed)?;
        Ok(id)
    }

    fn read_meta(&self, id: &str) -> Result<SnapMeta> {
        let raw = fs::read(self.snapshot_dir(id).join("meta.json"))?;
        serde_json::from_slice(&raw).map_err(|_| EngineError::Corrupt(format!("snapshot {id} meta")))
    }

    pub fn latest(&self) -> Option<String> {
        let mut best: Option<SnapMeta> = None;
        let entries = fs::read_dir(&self.dir).ok()?;
        for entry in entries.flatten() {
            let id = entry.file_name().to_string_lossy().to_string();
            if let Ok(meta) = self.read_meta(&id) {
                let better = match &best {
                    Some(b) => (meta.term, meta.index, meta.timestamp) > (b.term, b.index, b.timestamp),
                    None => true,
                };
                if better {
                    best = Some(meta);
                }
            }
        }
        best.map(|m| m.id)
    }

    /// Assemble the logical export for one snapshot: manifest first, then
    /// one TAR entry per entity, gzipped and encrypted. Entities are read
    /// from the snapshot's own hardlinks, so the export reflects the state
    /// at snapshot time even if the live store has moved on.
    fn hydrate(&self, snap: &Path, manifest_plain: &[u8]) -> Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        append_tar(&mut builder, "manifest.json", manifest_plain)?;

        for kind in [
            Game::KIND,
            Team::KIND,
            UserIndex::KIND,
            TeamGamesIndex::KIND,
            GameUsersIndex::KIND,
            TeamUsersIndex::KIND,
        ] {
            let dir = snap.join(kind);
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                let sealed = fs::read(entry.path())?;
                match self.core.keys.decrypt(&sealed) {
                    Ok(plain) => append_tar(&mut builder, &format!("{kind}/{name}"), &plain)?,
                    // Per-file corruption is logged and skipped; the rest of
                    // the export still ships.
                    Err(e) => log::warn!("snapshot hydration skipping {kind}/{name}: {e}"),
                }
            }
        }
        for single in ["sys_access_policy", "metrics.json", "nodes.json", "fsm_state.json"] {
            let path = snap.join(single);
            if !path.is_file() {
                continue;
            }
            let sealed = fs::read(&path)?;
            match self.core.keys.decrypt(&sealed) {
                Ok(plain) => append_tar(&mut builder, single, &plain)?,
                Err(e) => log::warn!("snapshot hydration skipping {single}: {e}"),
            }
        }

        let tarball = builder
            .into_inner()
            .map_err(|e| EngineError::Internal(format!("tar assembly: {e}")))?;
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut gz, &tarball)?;
        let compressed = gz.finish()?;
        self.cluster_key.encrypt(&compressed)
    }

    /// Open a snapshot for replication. Returns `(size, stream)` pairs that
    /// are identical across calls for the same snapshot; consensus snapshot
    /// transfer accounts bytes against the advertised size.
    pub fn open_snapshot(&self, id: &str) -> Result<(u64, Vec<u8>)> {
        let snap = self.snapshot_dir(id);
        let cache = snap.join("replication.cache");
        let size_file = snap.join("replication.size");
        if cache.is_file() && size_file.is_file() {
            let sealed = fs::read(&cache)?;
            let recorded: u64 = fs::read_to_string(&size_file)?
                .trim()
                .parse()
                .map_err(|_| EngineError::Corrupt(format!("snapshot {id} size record")))?;
            if recorded != sealed.len() as u64 {
                return Err(EngineError::Corrupt(format!(
                    "snapshot {id} cache does not match its recorded size"
                )));
            }
            return Ok((recorded, sealed));
        }

        let state = fs::read(snap.join("state.bin"))?;
        let plain = self.cluster_key.decrypt(&state)?;
        let sealed = if plain.len() >= 2 && plain[..2] == GZIP_MAGIC {
            // Remote-delivered archive: already a gzip export, re-use as-is.
            state
        } else {
            self.hydrate(&snap, &plain)?
        };
        fs::write(&cache, &sealed)?;
        fs::write(&size_file, sealed.len().to_string())?;
        Ok((sealed.len() as u64, sealed))
    }

    /// Restore a replication archive into the local stores. Skips the
    /// entity payload entirely when local state is already at or past the
    /// manifest's index ("smart restore"); the manifest's node map and
    /// initialized flag are absorbed either way.
    pub fn restore(&self, sealed: &[u8], sm: &StateMachine) -> Result<()> {
        let compressed = self.cluster_key.decrypt(sealed)?;
        let mut tarball = Vec::new();
        GzDecoder::new(&compressed[..]).read_to_end(&mut tarball)?;
        let mut archive = tar::Archive::new(&tarball[..]);

        let mut manifest: Option<Manifest> = None;
        let mut skip_entities = false;
        let mut games: Vec<Vec<u8>> = Vec::new();
        let mut teams: Vec<Vec<u8>> = Vec::new();
        let mut seen_games: HashSet<String> = HashSet::new();
        let mut seen_teams: HashSet<String> = HashSet::new();
        let mut fsm_state: Option<FsmState> = None;

        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_string_lossy().to_string();
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;

            if manifest.is_none() {
                if path != "manifest.json" {
                    return Err(EngineError::Corrupt(
                        "snapshot archive does not start with its manifest".into(),
                    ));
                }
                let m: Manifest = serde_json::from_slice(&bytes)
                    .map_err(|_| EngineError::Corrupt("snapshot manifest".into()))?;
                // Smart restore: local state already covers this snapshot.
                if sm.is_initialized() && m.raft_index > 0 && sm.last_applied() >= m.raft_index {
                    log::info!(
                        "skipping snapshot restore at index {}; local state is at {}",
                        m.raft_index,
                        sm.last_applied()
                    );
                    skip_entities = true;
                }
                manifest = Some(m);
                continue;
            }
            if skip_entities {
                continue;
            }

            if let Some(rest) = path.strip_prefix("games/") {
                seen_games.insert(rest.trim_end_matches(".json").to_string());
                games.push(bytes);
            } else if let Some(rest) = path.strip_prefix("teams/") {
                seen_teams.insert(rest.trim_end_matches(".json").to_string());
                teams.push(bytes);
            } else if path.starts_with("users/") {
                restore_entity::<UserIndex>(&self.core.users, &bytes);
            } else if path.starts_with("team_games/") {
                restore_entity::<TeamGamesIndex>(&self.core.team_games, &bytes);
            } else if path.starts_with("game_users/") {
                restore_entity::<GameUsersIndex>(&self.core.game_users, &bytes);
            } else if path.starts_with("team_users/") {
                restore_entity::<TeamUsersIndex>(&self.core.team_users, &bytes);
            } else {
                match path.as_str() {
                    "sys_access_policy" => {
                        if let Ok(policy) = serde_json::from_slice::<UserAccessPolicy>(&bytes) {
                            *self.core.policy.write().expect("policy lock poisoned") = policy;
                            let _ = self.core.save_policy();
                        }
                    }
                    "nodes.json" => {
                        if let Ok(nodes) =
                            serde_json::from_slice::<HashMap<String, NodeMeta>>(&bytes)
                        {
                            self.core.nodes.replace_all(nodes);
                            let _ = self.core.save_nodes();
                        }
                    }
                    "metrics.json" => {
                        if let Ok(view) = serde_json::from_slice::<
                            HashMap<String, crate::metrics::MetricsBatch>,
                        >(&bytes)
                        {
                            for batch in view.into_values() {
                                self.core.metrics.merge_batch(batch);
                            }
                        }
                    }
                    "fsm_state.json" => {
                        fsm_state = serde_json::from_slice(&bytes).ok();
                    }
                    other => log::warn!("snapshot restore: unrecognized entry {other}"),
                }
            }
        }

        let manifest = manifest.ok_or_else(|| EngineError::Corrupt("empty snapshot".into()))?;
        for meta in manifest.nodes.values() {
            if let Err(e) = self.core.nodes.upsert(meta.clone()) {
                log::warn!("snapshot node map entry rejected: {e}");
            }
        }
        let _ = self.core.save_nodes();
        if manifest.initialized {
            sm.mark_initialized();
        }
        if skip_entities {
            return Ok(());
        }

        // Unmarshal+store of games and teams is the hot path; spread it over
        // a small worker pool.
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let game_queue = Mutex::new(games);
        let team_queue = Mutex::new(teams);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let next = game_queue.lock().expect("queue lock poisoned").pop();
                        match next {
                            Some(bytes) => restore_entity::<Game>(&self.core.games, &bytes),
                            None => break,
                        }
                    }
                    loop {
                        let next = team_queue.lock().expect("queue lock poisoned").pop();
                        match next {
                            Some(bytes) => restore_entity::<Team>(&self.core.teams, &bytes),
                            None => break,
                        }
                    }
                });
            }
        });

        // Zombies: anything on disk the snapshot does not know about was
        // deleted on the leader while this node was away.
        for id in self.core.games.ids_on_disk()? {
            if !seen_games.contains(&id) {
                log::info!("restore: purging zombie game {id}");
                self.core.games.purge(&id)?;
            }
        }
        for id in self.core.teams.ids_on_disk()? {
            if !seen_teams.contains(&id) {
                log::info!("restore: purging zombie team {id}");
                self.core.teams.purge(&id)?;
            }
        }

        if let Some(state) = fsm_state {
            sm.set_last_applied(state.last_applied_index);
        }
        sm.set_last_applied(manifest.raft_index);
        self.core.registry.rebuild(&self.core.games, &self.core.teams)?;
        Ok(())
    }

    /// Keep the newest `retain` snapshots; remove the rest. Entity files are
    /// hardlinks, so removal only drops link counts and never touches the
    /// live store.
    pub fn gc(&self, retain: usize) -> Result<usize> {
        let mut metas: Vec<SnapMeta> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let id = entry.file_name().to_string_lossy().to_string();
            match self.read_meta(&id) {
                Ok(meta) => metas.push(meta),
                Err(_) => log::warn!("snapshot gc: {id} has no readable meta, leaving it"),
            }
        }
        metas.sort_by(|a, b| {
            (b.term, b.index, b.timestamp).cmp(&(a.term, a.index, a.timestamp))
        });
        let mut removed = 0;
        for meta in metas.into_iter().skip(retain) {
            fs::remove_dir_all(self.snapshot_dir(&meta.id))?;
            removed += 1;
        }
        Ok(removed)
    }
}

fn append_tar(builder: &mut tar::Builder<Vec<u8>>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, name, bytes)
        .map_err(|e| EngineError::Internal(format!("tar entry {name}: {e}")))
}

fn restore_entity<T: Entity>(store: &EntityStore<T>, bytes: &[u8]) {
    match serde_json::from_slice::<T>(bytes) {
        Ok(entity) => {
            if let Err(e) = store.save(&entity) {
                log::warn!("restore write for {}/{} failed: {e}", T::KIND, entity.id());
            }
        }
        Err(e) => log::warn!("restore: skipping corrupt {} entry: {e}", T::KIND),
    }
}
