use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::access::{self, Principal};
use crate::action::validate;
use crate::core::Core;
use crate::error::{EngineError, Result};
use crate::model::{AccessLevel, ActionRecord, EntityStatus, Game, Team, action::kind};
use crate::raft::{Command, Commit};
use crate::server::message::Message;

pub mod manager;

pub use manager::HubManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Game,
    Team,
}

/// Per-subscriber bounded queue. When the queue overflows the oldest frame
/// is displaced and the subscriber is flagged so its next delivery starts
/// with a sync-required marker.
struct Subscriber {
    user: Option<String>,
    tx: async_channel::Sender<Message>,
    needs_sync: Arc<AtomicBool>,
}

const SUBSCRIBER_QUEUE: usize = 64;

/// Single writer for one game or team: serializes concurrent submissions,
/// enforces optimistic concurrency against the action log, and fans out
/// accepted actions to subscribers. The serialization mutex is held across
/// local store I/O and the commit, and released before any broadcast send;
/// the entity cache sits behind its own brief lock so the state machine can
/// refresh it from apply side-effects.
pub struct Hub {
    pub kind: ResourceKind,
    pub id: String,
    core: Arc<Core>,
    commit: Arc<Commit>,
    node_id: String,
    strict: bool,
    bootstrap_admin: Option<String>,
    serial: Mutex<()>,
    cache: StdMutex<Option<Game>>,
    subscribers: StdMutex<HashMap<u64, Subscriber>>,
    next_subscriber: AtomicU64,
    last_activity_ns: AtomicI64,
}

/// Reconcile an incoming batch against the current log. Returns the
/// non-overlapping tail to append, or a conflict carrying the server head.
///
/// The permissive mode accepts partially overlapping retries (a client that
/// succeeded but lost the response); strict mode accepts only exact head
/// matches, still allowing pure replays so idempotent retries keep working.
pub fn reconcile(
    log: &[ActionRecord],
    head: &str,
    base: Option<&str>,
    incoming: &[ActionRecord],
    strict: bool,
) -> Result<Vec<ActionRecord>> {
    let base = base.unwrap_or("");
    if incoming.is_empty() {
        return Ok(Vec::new());
    }
    if log.is_empty() && base.is_empty() {
        return Ok(incoming.to_vec());
    }
    if base == head {
        return Ok(incoming.to_vec());
    }
    if base.is_empty() {
        // Claim-from-start against a non-empty log: valid only when the
        // batch begins at the current head.
        if !strict && incoming[0].id == head {
            return Ok(incoming[1..].to_vec());
        }
        return Err(EngineError::Divergent {
            head: head.to_string(),
        });
    }
    if let Some(pos) = log.iter().rposition(|rec| rec.id == base) {
        let suffix = &log[pos + 1..];
        if suffix.len() <= incoming.len()
            && suffix
                .iter()
                .zip(incoming.iter())
                .all(|(s, i)| s.id == i.id)
        {
            let tail = &incoming[suffix.len()..];
            if tail.is_empty() || !strict {
                return Ok(tail.to_vec());
            }
        }
    }
    Err(EngineError::Divergent {
        head: head.to_string(),
    })
}

impl Hub {
    pub fn new(
        kind: ResourceKind,
        id: String,
        core: Arc<Core>,
        commit: Arc<Commit>,
        node_id: String,
        strict: bool,
        bootstrap_admin: Option<String>,
    ) -> Self {
        Self {
            kind,
            id,
            core,
            commit,
            node_id,
            strict,
            bootstrap_admin,
            serial: Mutex::new(()),
            cache: StdMutex::new(None),
            subscribers: StdMutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            last_activity_ns: AtomicI64::new(crate::model::now_ns()),
        }
    }

    fn touch(&self) {
        self.last_activity_ns
            .store(crate::model::now_ns(), Ordering::Relaxed);
    }

    pub fn idle_since_ns(&self) -> i64 {
        self.last_activity_ns.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("subscriber lock poisoned").len()
    }

    fn principal<'a>(&'a self, user: Option<&'a str>) -> Principal<'a> {
        Principal {
            user,
            bootstrap_admin: self.bootstrap_admin.as_deref(),
        }
    }

    fn cached(&self) -> Option<Game> {
        self.cache.lock().expect("hub cache lock poisoned").clone()
    }

    fn set_cache(&self, game: Option<Game>) {
        *self.cache.lock().expect("hub cache lock poisoned") = game;
    }

    fn ensure_loaded(&self) -> Option<Game> {
        if let Some(game) = self.cached() {
            return Some(game);
        }
        let loaded = self.core.games.load(&self.id).ok();
        self.set_cache(loaded.clone());
        loaded
    }

    /// Stale-cache probe: bypass the cache and re-read through the store.
    fn reload(&self) -> Option<Game> {
        let loaded = self.core.games.load(&self.id).ok();
        self.set_cache(loaded.clone());
        loaded
    }

    fn game_level(&self, game: &Game, user: Option<&str>) -> AccessLevel {
        let policy = self.core.policy.read().expect("policy lock poisoned");
        let (away, home) = self.core.team_pair(game);
        access::game_access(
            self.principal(user),
            &policy,
            game,
            away.as_ref(),
            home.as_ref(),
        )
    }

    fn required_level(actions: &[ActionRecord]) -> AccessLevel {
        if actions
            .iter()
            .any(|a| matches!(a.kind.as_str(), kind::GAME_METADATA_UPDATE | kind::GAME_FINALIZE))
        {
            AccessLevel::Admin
        } else {
            AccessLevel::Write
        }
    }

    /// Validate, authorize, reconcile and commit one ACTION message.
    /// `originator` is the submitting connection's subscriber id so the
    /// fanout can skip echoing back to it.
    pub async fn process_action(
        &self,
        msg: &Message,
        user: Option<&str>,
        originator: Option<u64>,
    ) -> Message {
        self.touch();
        let incoming = msg.incoming_actions();
        if incoming.is_empty() {
            return Message::error(&self.id, "ACTION carries no actions");
        }
        for action in &incoming {
            if let Err(e) = validate::validate(action) {
                return Message::error(&self.id, e.to_string());
            }
        }

        let _serial = self.serial.lock().await;
        let mut current = self.ensure_loaded();

        if let Some(game) = current.as_ref().filter(|g| g.status != EntityStatus::Deleted) {
            let level = self.game_level(game, user);
            if level < Self::required_level(&incoming) {
                return Message::error(&self.id, "Forbidden");
            }
        } else {
            // Creation: the first action must bootstrap the game, by an
            // authenticated owner within quota.
            if incoming[0].kind != kind::GAME_START {
                return Message::error(&self.id, format!("no such game {}", self.id));
            }
            let Some(user) = user else {
                return Message::error(&self.id, "Forbidden: sign in to create a game");
            };
            let policy = self.core.policy.read().expect("policy lock poisoned");
            if !policy.allows(user) {
                return Message::error(&self.id, format!("Forbidden: {}", policy.default_denial_message));
            }
            // The bootstrap action must claim the creating user as owner;
            // only admins may create games on someone else's behalf.
            let claimed_owner = incoming[0]
                .payload
                .as_ref()
                .and_then(|raw| {
                    serde_json::from_str::<validate::GameStartPayload>(raw.get()).ok()
                })
                .and_then(|p| p.owner);
            if let Some(owner) = claimed_owner
                && owner != user
                && !self.principal(Some(user)).is_admin(&policy)
            {
                return Message::error(&self.id, "Forbidden: owner mismatch");
            }
            let owned = self.core.registry.games_owned_by(user).len();
            if let Err(e) = access::check_game_quota(&policy, user, owned) {
                return Message::error(&self.id, e.to_string());
            }
        }

        // Concurrency reconciliation, with one stale-cache probe before
        // declaring a conflict: the hub's copy may lag a sibling node's
        // apply, so re-read through the store and retry.
        let attempt = |game: Option<&Game>| {
            let empty: &[ActionRecord] = &[];
            let (log, head) = match game {
                Some(g) => (g.action_log.as_slice(), g.head()),
                None => (empty, ""),
            };
            reconcile(log, head, msg.base_revision.as_deref(), &incoming, self.strict)
        };
        let to_append = match attempt(current.as_ref()) {
            Ok(tail) => tail,
            Err(_) => {
                current = self.reload();
                match attempt(current.as_ref()) {
                    Ok(tail) => tail,
                    Err(e) => {
                        let mut reply = Message::from(&e);
                        reply.game_id = self.id.clone();
                        return reply;
                    }
                }
            }
        };

        let head_now = current
            .as_ref()
            .map(|g| g.head().to_string())
            .unwrap_or_default();
        if to_append.is_empty() {
            // Pure replay of already-applied actions.
            return Message::ack(&self.id, &head_now);
        }

        let cmd = Command::ApplyAction {
            game_id: self.id.clone(),
            actions: to_append,
            origin: Some(self.node_id.clone()),
        };
        let outcome = match self.commit.submit(cmd).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let mut reply = Message::from(&e);
                reply.game_id = self.id.clone();
                return reply;
            }
        };

        if let Some(game) = &outcome.game {
            self.set_cache(Some((**game).clone()));
        }
        let head = self
            .cached()
            .map(|g| g.head().to_string())
            .unwrap_or_default();
        let appended = outcome.appended;
        drop(_serial);

        if !appended.is_empty() {
            self.broadcast(
                Message::sync_update(&self.id, appended, &head),
                originator,
            );
        }
        Message::ack(&self.id, &head)
    }

    /// Full-game overwrite (`POST /api/save`). Conflict detection against
    /// forked or rewound logs happens inside the state machine.
    pub async fn save_game(&self, game: Game, user: Option<&str>, force: bool) -> Message {
        self.touch();
        let _serial = self.serial.lock().await;

        if let Some(existing) = &self.ensure_loaded() {
            let level = self.game_level(existing, user);
            if level < AccessLevel::Write {
                return Message::error(&self.id, "Forbidden");
            }
        } else {
            let Some(user) = user else {
                return Message::error(&self.id, "Forbidden: sign in to create a game");
            };
            let policy = self.core.policy.read().expect("policy lock poisoned");
            let owned = self.core.registry.games_owned_by(user).len();
            if let Err(e) = access::check_game_quota(&policy, user, owned) {
                return Message::error(&self.id, e.to_string());
            }
        }

        let cmd = Command::SaveGame {
            id: self.id.clone(),
            game: Box::new(game),
            force,
            origin: Some(self.node_id.clone()),
        };
        let outcome = match self.commit.submit(cmd).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let mut reply = Message::from(&e);
                reply.game_id = self.id.clone();
                return reply;
            }
        };
        if let Some(game) = &outcome.game {
            self.set_cache(Some((**game).clone()));
        }
        let head = self
            .cached()
            .map(|g| g.head().to_string())
            .unwrap_or_default();
        let appended = outcome.appended;
        drop(_serial);
        if !appended.is_empty() {
            self.broadcast(Message::sync_update(&self.id, appended, &head), None);
        }
        Message::ack(&self.id, &head)
    }

    pub async fn delete_game(&self, user: Option<&str>) -> Message {
        self.touch();
        let _serial = self.serial.lock().await;
        let Some(game) = self.ensure_loaded() else {
            return Message::error(&self.id, format!("no such game {}", self.id));
        };
        if self.game_level(&game, user) < AccessLevel::Admin {
            return Message::error(&self.id, "Forbidden");
        }
        match self
            .commit
            .submit(Command::DeleteGame { id: self.id.clone() })
            .await
        {
            Ok(_) => {
                self.set_cache(None);
                Message::ack(&self.id, "")
            }
            Err(e) => {
                let mut reply = Message::from(&e);
                reply.game_id = self.id.clone();
                reply
            }
        }
    }

    pub async fn save_team(&self, team: Team, user: Option<&str>) -> Message {
        self.touch();
        let _serial = self.serial.lock().await;
        let policy = self.core.policy.read().expect("policy lock poisoned").clone();
        match self.core.teams.load(&self.id) {
            Ok(existing) if existing.status != EntityStatus::Deleted => {
                let level = access::team_access(self.principal(user), &policy, &existing);
                if level < AccessLevel::Admin {
                    return Message::error(&self.id, "Forbidden");
                }
            }
            _ => {
                let Some(user) = user else {
                    return Message::error(&self.id, "Forbidden: sign in to create a team");
                };
                let owned = self
                    .core
                    .users
                    .load(user)
                    .map(|idx| idx.teams.len())
                    .unwrap_or(0);
                if let Err(e) = access::check_team_quota(&policy, user, owned) {
                    return Message::error(&self.id, e.to_string());
                }
            }
        }
        match self
            .commit
            .submit(Command::SaveTeam {
                id: self.id.clone(),
                team: Box::new(team),
                origin: Some(self.node_id.clone()),
            })
            .await
        {
            Ok(_) => Message::ack(&self.id, ""),
            Err(e) => {
                let mut reply = Message::from(&e);
                reply.game_id = self.id.clone();
                reply
            }
        }
    }

    pub async fn delete_team(&self, user: Option<&str>) -> Message {
        self.touch();
        let _serial = self.serial.lock().await;
        let policy = self.core.policy.read().expect("policy lock poisoned").clone();
        match self.core.teams.load(&self.id) {
            Ok(existing) => {
                let level = access::team_access(self.principal(user), &policy, &existing);
                if level < AccessLevel::Admin {
                    return Message::error(&self.id, "Forbidden");
                }
            }
            Err(_) => return Message::error(&self.id, format!("no such team {}", self.id)),
        }
        match self
            .commit
            .submit(Command::DeleteTeam { id: self.id.clone() })
            .await
        {
            Ok(_) => Message::ack(&self.id, ""),
            Err(e) => {
                let mut reply = Message::from(&e);
                reply.game_id = self.id.clone();
                reply
            }
        }
    }

    /// JOIN catch-up. An empty `lastRevision` is a plain attach; a known one
    /// yields the tail since it; an unknown one means the client's history
    /// diverged and it must refetch.
    pub async fn join(&self, user: Option<&str>, last_revision: Option<&str>) -> Message {
        self.touch();
        let _serial = self.serial.lock().await;
        let Some(game) = self.ensure_loaded() else {
            return match last_revision {
                None | Some("") => Message::ack(&self.id, ""),
                Some(_) => Message::conflict(&self.id, "", "divergent"),
            };
        };
        if self.game_level(&game, user) < AccessLevel::Read {
            return Message::error(&self.id, "Forbidden");
        }
        match last_revision {
            None | Some("") => Message::ack(&self.id, game.head()),
            Some(rev) => match game.actions_since(rev) {
                Some(tail) => Message::sync_update(&self.id, tail.to_vec(), game.head()),
                None => Message::conflict(&self.id, game.head(), "divergent"),
            },
        }
    }

    pub fn subscribe(&self, user: Option<String>) -> (u64, async_channel::Receiver<Message>) {
        self.touch();
        let (tx, rx) = async_channel::bounded(SUBSCRIBER_QUEUE);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .insert(
                id,
                Subscriber {
                    user,
                    tx,
                    needs_sync: Arc::new(AtomicBool::new(false)),
                },
            );
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .remove(&id);
    }

    /// Fan out one frame to every subscriber except the originator. Slow
    /// subscribers lose their oldest queued frame and get flagged for a
    /// sync-required marker.
    pub fn broadcast(&self, msg: Message, skip: Option<u64>) {
        let subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        for (id, sub) in subscribers.iter() {
            if Some(*id) == skip {
                continue;
            }
            if sub.needs_sync.swap(false, Ordering::Relaxed) {
                let marker =
                    Message::conflict(&self.id, "", "sync required; rejoin with lastRevision");
                if sub.tx.force_send(marker).is_ok_and(|d| d.is_some()) {
                    sub.needs_sync.store(true, Ordering::Relaxed);
                    continue;
                }
            }
            match sub.tx.force_send(msg.clone()) {
                Ok(Some(_)) => {
                    // Displaced the oldest frame; the subscriber is behind.
                    sub.needs_sync.store(true, Ordering::Relaxed);
                }
                Ok(None) => {}
                Err(_) => {
                    // Receiver gone; cleanup happens on unsubscribe.
                }
            }
        }
    }

    /// Absorb an apply that originated elsewhere (another node, or the local
    /// state machine replaying the log): refresh the cache and fan out.
    pub fn note_remote_apply(&self, game: &Game, appended: &[ActionRecord]) {
        self.set_cache(Some(game.clone()));
        if !appended.is_empty() {
            self.broadcast(
                Message::sync_update(&self.id, appended.to_vec(), game.head()),
                None,
            );
        }
    }

    pub fn head(&self) -> Option<String> {
        self.cached().map(|g| g.head().to_string())
    }
}
