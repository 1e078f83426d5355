// Snapshot store behavior: logical export round-trip, the smart-restore
// skip, and the hardlink contract under snapshot GC.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use scorebook::core::Core;
use scorebook::model::{ActionRecord, now_ns};
use scorebook::raft::snapshot::{Manifest, SnapshotStore};
use scorebook::raft::{Command, StateMachine};
use scorebook::store::KeyRing;

struct Node {
    _dir: tempfile::TempDir,
    core: Arc<Core>,
    sm: Arc<StateMachine>,
    snaps: SnapshotStore,
}

fn node(name: &str, bootstrap: bool, secret: &str) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let core = Arc::new(Core::open(dir.path(), Arc::new(KeyRing::ephemeral())).unwrap());
    let sm = Arc::new(StateMachine::new(
        Arc::clone(&core),
        name.to_string(),
        false,
        bootstrap,
    ));
    let snaps = SnapshotStore::open(
        &dir.path().join("raft/snapshots"),
        Arc::clone(&core),
        Arc::new(KeyRing::from_secret(secret)),
    )
    .unwrap();
    Node {
        _dir: dir,
        core,
        sm,
        snaps,
    }
}

fn manifest(node: &Node, raft_index: u64) -> Manifest {
    Manifest {
        raft_index,
        term: 1,
        nodes: node.core.nodes.all(),
        initialized: node.sm.is_initialized(),
        timestamp: now_ns(),
    }
}

fn seed_game(node: &Node, game_id: &str, owner: &str) {
    node.sm
        .apply_local(Command::ApplyAction {
            game_id: game_id.to_string(),
            actions: vec![
                ActionRecord::new(Uuid::new_v4().to_string(), "GAME_START").with_payload(json!({
                    "owner": owner,
                    "home": "A",
                    "away": "B",
                })),
                ActionRecord::new(Uuid::new_v4().to_string(), "PITCH")
                    .with_payload(json!({"activeCtx": {"b": 0, "i": 1}})),
            ],
            origin: None,
        })
        .unwrap();
}

#[test]
fn snapshot_round_trip_restores_identical_state() {
    let source = node("n1", true, "s3cret");
    let g1 = Uuid::new_v4().to_string();
    let g2 = Uuid::new_v4().to_string();
    seed_game(&source, &g1, "a@e");
    seed_game(&source, &g2, "b@e");
    source
        .sm
        .apply_local(Command::SaveTeam {
            id: "t1".into(),
            team: Box::new({
                let mut t = scorebook::model::Team::default();
                t.id = "t1".into();
                t.name = "Falcons".into();
                t.owner = "a@e".into();
                t.roles.scorekeepers.insert("k@e".into());
                t
            }),
            origin: None,
        })
        .unwrap();
    source.core.flush_all().unwrap();

    let id = source.snaps.create(&manifest(&source, source.sm.last_applied())).unwrap();
    let (size, stream) = source.snaps.open_snapshot(&id).unwrap();
    assert_eq!(size as usize, stream.len());

    // Opening again returns the identical (size, stream) pair.
    let (size2, stream2) = source.snaps.open_snapshot(&id).unwrap();
    assert_eq!(size, size2);
    assert_eq!(stream, stream2);

    let target = node("n2", false, "s3cret");
    target.snaps.restore(&stream, &target.sm).unwrap();

    for gid in [&g1, &g2] {
        let a = source.core.games.load(gid).unwrap();
        let b = target.core.games.load(gid).unwrap();
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }
    let team = target.core.teams.load("t1").unwrap();
    assert_eq!(team.name, "Falcons");
    assert!(target.core.users.load("a@e").unwrap().games.contains(&g1));
    assert_eq!(target.sm.last_applied(), source.sm.last_applied());
    assert!(target.core.registry.games_owned_by("b@e").contains(&g2));
}

#[test]
fn restore_purges_zombies() {
    let source = node("n1", true, "s3cret");
    let keep = Uuid::new_v4().to_string();
    seed_game(&source, &keep, "a@e");
    source.core.flush_all().unwrap();
    let id = source.snaps.create(&manifest(&source, source.sm.last_applied())).unwrap();
    let (_, stream) = source.snaps.open_snapshot(&id).unwrap();

    let target = node("n2", false, "s3cret");
    let zombie = Uuid::new_v4().to_string();
    seed_game(&target, &zombie, "z@e");
    target.core.flush_all().unwrap();

    target.snaps.restore(&stream, &target.sm).unwrap();
    assert!(target.core.games.load(&keep).is_ok());
    assert!(target.core.games.load(&zombie).is_err());
    assert!(!target.core.games.file_path(&zombie).exists());
}

#[test]
fn smart_restore_skips_when_local_state_is_fresher() {
    // F2 serves a snapshot taken at index 100.
    let source = node("n2", true, "s3cret");
    let g_b = Uuid::new_v4().to_string();
    seed_game(&source, &g_b, "b@e");
    source.core.flush_all().unwrap();
    let mut m = manifest(&source, 100);
    m.initialized = true;
    let id = source.snaps.create(&m).unwrap();
    let (_, stream) = source.snaps.open_snapshot(&id).unwrap();

    // F1 is initialized and already applied through index 200.
    let target = node("n1", true, "s3cret");
    let g_a = Uuid::new_v4().to_string();
    seed_game(&target, &g_a, "a@e");
    target.core.flush_all().unwrap();
    target.sm.set_last_applied(200);

    target.snaps.restore(&stream, &target.sm).unwrap();

    // Local game survives, the snapshot's game never materializes, and the
    // zombie pass did not run.
    assert!(target.core.games.load(&g_a).is_ok());
    assert!(target.core.games.load(&g_b).is_err());
    assert!(target.core.games.file_path(&g_a).exists());
    assert_eq!(target.sm.last_applied(), 200);
}

#[cfg(unix)]
#[test]
fn snapshot_gc_preserves_source_files() {
    use std::os::unix::fs::MetadataExt;

    let n = node("n1", true, "s3cret");
    let gid = Uuid::new_v4().to_string();
    seed_game(&n, &gid, "a@e");
    n.core.flush_all().unwrap();

    let source_path = n.core.games.file_path(&gid);
    let before = std::fs::metadata(&source_path).unwrap();
    let before_bytes = std::fs::read(&source_path).unwrap();

    let snap1 = n.snaps.create(&manifest(&n, 1)).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    let snap2 = n.snaps.create(&manifest(&n, 2)).unwrap();

    assert_eq!(n.snaps.gc(1).unwrap(), 1);
    assert!(!n.snaps.snapshot_dir(&snap1).exists());

    // Snapshot 2 still holds a hardlink to the very same inode.
    let linked = n
        .snaps
        .snapshot_dir(&snap2)
        .join("games")
        .join(format!("{gid}.json"));
    assert!(linked.exists());
    assert_eq!(
        std::fs::metadata(&linked).unwrap().ino(),
        std::fs::metadata(&source_path).unwrap().ino()
    );

    // The source survived untouched, mode and contents alike.
    let after = std::fs::metadata(&source_path).unwrap();
    assert_eq!(before.mode(), after.mode());
    assert_eq!(before_bytes, std::fs::read(&source_path).unwrap());
    assert!(n.core.games.load(&gid).is_ok());
}

#[test]
fn remote_delivered_archive_is_served_verbatim() {
    let source = node("n1", true, "s3cret");
    let gid = Uuid::new_v4().to_string();
    seed_game(&source, &gid, "a@e");
    source.core.flush_all().unwrap();
    let id = source.snaps.create(&manifest(&source, source.sm.last_applied())).unwrap();
    let (_, stream) = source.snaps.open_snapshot(&id).unwrap();

    // A follower stores the delivered archive and can serve it onward
    // byte-identically.
    let follower = node("n2", false, "s3cret");
    let saved = follower.snaps.save_received(100, 1, &stream).unwrap();
    let (size, served) = follower.snaps.open_snapshot(&saved).unwrap();
    assert_eq!(size as usize, served.len());

    let third = node("n3", false, "s3cret");
    third.snaps.restore(&served, &third.sm).unwrap();
    assert!(third.core.games.load(&gid).is_ok());
}
