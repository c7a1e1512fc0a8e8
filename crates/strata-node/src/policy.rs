//! Content policy: blocked CIDs, blocked peers and guild filtering.
//!
//! The filter keeps the current [`PolicyState`] in memory for the hot
//! `is_allowed` path and writes every effective mutation through an injected
//! [`PolicyStore`] before publishing it. Writers are serialized among
//! themselves; readers are only blocked for the final swap, never for the
//! save.

use std::collections::BTreeSet;
use std::sync::{Mutex, RwLock, RwLockReadGuard};

use chrono::Utc;
use libp2p::PeerId;
use tracing::{debug, info};

use strata_shared::{Cid, GuildId};
use strata_store::{Database, GuildMode, PolicyState, StoreError};

/// Durable side-store for the policy document.
pub trait PolicyStore: Send + Sync {
    fn load(&self) -> Result<Option<PolicyState>, StoreError>;
    fn save(&self, state: &PolicyState) -> Result<(), StoreError>;
}

/// Policy persisted in the node's SQLite database.
pub struct SqlitePolicyStore {
    db: Mutex<Database>,
}

impl SqlitePolicyStore {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }
}

impl PolicyStore for SqlitePolicyStore {
    fn load(&self) -> Result<Option<PolicyState>, StoreError> {
        self.db
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?
            .load_policy()
    }

    fn save(&self, state: &PolicyState) -> Result<(), StoreError> {
        self.db
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?
            .save_policy(state)
    }
}

pub struct PolicyFilter {
    state: RwLock<PolicyState>,
    store: Box<dyn PolicyStore>,
    writer: Mutex<()>,
}

impl PolicyFilter {
    /// Load the persisted policy, or start from an empty one.
    pub fn load(store: Box<dyn PolicyStore>) -> Result<Self, StoreError> {
        let state = store.load()?.unwrap_or_default();
        info!(
            version = state.version,
            blocked_cids = state.blocked_cids.len(),
            blocked_peers = state.blocked_peers.len(),
            guild_mode = ?state.guild_mode,
            "Loaded content policy"
        );
        Ok(Self {
            state: RwLock::new(state),
            store,
            writer: Mutex::new(()),
        })
    }

    /// `peer` is `None` for content submitted by a local client.
    pub fn is_allowed(&self, cid: &Cid, peer: Option<&PeerId>, guild: Option<&GuildId>) -> bool {
        let state = self.read();
        if state.blocked_cids.contains(cid) {
            return false;
        }
        if let Some(peer) = peer {
            if state.blocked_peers.contains(&peer.to_string()) {
                return false;
            }
        }
        match state.guild_mode {
            GuildMode::All => true,
            GuildMode::Allowlist => guild.is_some_and(|g| state.allowed_guilds.contains(g)),
            GuildMode::Blocklist => guild.map_or(true, |g| !state.blocked_guilds.contains(g)),
        }
    }

    pub fn is_cid_blocked(&self, cid: &Cid) -> bool {
        self.read().blocked_cids.contains(cid)
    }

    pub fn is_peer_blocked(&self, peer: &PeerId) -> bool {
        self.read().blocked_peers.contains(&peer.to_string())
    }

    pub fn snapshot(&self) -> PolicyState {
        self.read().clone()
    }

    pub fn block_cid(&self, cid: Cid) -> Result<bool, StoreError> {
        self.mutate("block_cid", |s| s.blocked_cids.insert(cid))
    }

    pub fn unblock_cid(&self, cid: &Cid) -> Result<bool, StoreError> {
        self.mutate("unblock_cid", |s| s.blocked_cids.remove(cid))
    }

    pub fn block_peer(&self, peer: &PeerId) -> Result<bool, StoreError> {
        self.mutate("block_peer", |s| s.blocked_peers.insert(peer.to_string()))
    }

    pub fn unblock_peer(&self, peer: &PeerId) -> Result<bool, StoreError> {
        self.mutate("unblock_peer", |s| s.blocked_peers.remove(&peer.to_string()))
    }

    /// Replace the guild mode and both guild lists at once.
    pub fn set_guild_policy(
        &self,
        mode: GuildMode,
        allowed: BTreeSet<GuildId>,
        blocked: BTreeSet<GuildId>,
    ) -> Result<bool, StoreError> {
        self.mutate("set_guild_policy", |s| {
            let changed =
                s.guild_mode != mode || s.allowed_guilds != allowed || s.blocked_guilds != blocked;
            s.guild_mode = mode;
            s.allowed_guilds = allowed;
            s.blocked_guilds = blocked;
            changed
        })
    }

    pub fn allow_guild(&self, guild: GuildId) -> Result<bool, StoreError> {
        self.mutate("allow_guild", |s| s.allowed_guilds.insert(guild))
    }

    pub fn block_guild(&self, guild: GuildId) -> Result<bool, StoreError> {
        self.mutate("block_guild", |s| s.blocked_guilds.insert(guild))
    }

    /// Apply `change` to a copy of the state. Returns `Ok(false)` without
    /// persisting or bumping the version when nothing changed.
    fn mutate<F>(&self, op: &'static str, change: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut PolicyState) -> bool,
    {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snapshot();
        let mut next = current.clone();
        if !change(&mut next) {
            debug!(op, version = current.version, "Policy unchanged");
            return Ok(false);
        }

        next.version = current.version + 1;
        next.updated_at = Utc::now().max(current.updated_at);
        self.store.save(&next)?;

        let version = next.version;
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = next;

        info!(op, version, "Policy updated");
        Ok(true)
    }

    fn read(&self) -> RwLockReadGuard<'_, PolicyState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc};
    use std::thread;

    /// In-memory store that also counts saves.
    #[derive(Default)]
    struct MemoryStore {
        saved: Mutex<Option<PolicyState>>,
        saves: Mutex<usize>,
    }

    impl PolicyStore for Arc<MemoryStore> {
        fn load(&self) -> Result<Option<PolicyState>, StoreError> {
            Ok(self.saved.lock().unwrap().clone())
        }

        fn save(&self, state: &PolicyState) -> Result<(), StoreError> {
            *self.saved.lock().unwrap() = Some(state.clone());
            *self.saves.lock().unwrap() += 1;
            Ok(())
        }
    }

    /// Store whose `save` parks until the test releases it.
    struct GatedStore {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl PolicyStore for GatedStore {
        fn load(&self) -> Result<Option<PolicyState>, StoreError> {
            Ok(None)
        }

        fn save(&self, _state: &PolicyState) -> Result<(), StoreError> {
            self.entered.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
            Ok(())
        }
    }

    fn filter() -> (PolicyFilter, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let filter = PolicyFilter::load(Box::new(store.clone())).unwrap();
        (filter, store)
    }

    fn guilds(names: &[&str]) -> BTreeSet<GuildId> {
        names.iter().map(|n| GuildId::new(*n)).collect()
    }

    #[test]
    fn test_blocking_is_idempotent_and_does_not_bump_on_noop() {
        let (filter, store) = filter();
        let cid = Cid::of(b"spam");

        assert!(filter.block_cid(cid).unwrap());
        let after_first = filter.snapshot();
        assert_eq!(after_first.version, 1);

        assert!(!filter.block_cid(cid).unwrap());
        let after_second = filter.snapshot();
        assert_eq!(after_second.blocked_cids.len(), 1);
        assert_eq!(after_second.version, 1);
        assert_eq!(after_second.updated_at, after_first.updated_at);
        assert_eq!(*store.saves.lock().unwrap(), 1);
    }

    #[test]
    fn test_version_and_timestamp_move_forward() {
        let (filter, _) = filter();
        let peer = PeerId::random();

        filter.block_peer(&peer).unwrap();
        let first = filter.snapshot();
        filter.unblock_peer(&peer).unwrap();
        let second = filter.snapshot();

        assert_eq!(second.version, first.version + 1);
        assert!(second.updated_at >= first.updated_at);
        assert!(!filter.unblock_peer(&peer).unwrap());
        assert_eq!(filter.snapshot().version, second.version);
    }

    #[test]
    fn test_blocked_cid_and_peer_are_refused() {
        let (filter, _) = filter();
        let cid = Cid::of(b"blocked content");
        let other = Cid::of(b"fine content");
        let peer = PeerId::random();

        filter.block_cid(cid).unwrap();
        filter.block_peer(&peer).unwrap();

        assert!(!filter.is_allowed(&cid, None, None));
        assert!(!filter.is_allowed(&other, Some(&peer), None));
        assert!(filter.is_allowed(&other, Some(&PeerId::random()), None));
        assert!(filter.is_peer_blocked(&peer));
    }

    #[test]
    fn test_guild_mode_all() {
        let (filter, _) = filter();
        let cid = Cid::of(b"post");
        assert!(filter.is_allowed(&cid, None, Some(&GuildId::new("anything"))));
        assert!(filter.is_allowed(&cid, None, None));
    }

    #[test]
    fn test_guild_mode_allowlist() {
        let (filter, _) = filter();
        let cid = Cid::of(b"post");
        filter
            .set_guild_policy(GuildMode::Allowlist, guilds(&["rust"]), guilds(&["rust"]))
            .unwrap();

        assert!(filter.is_allowed(&cid, None, Some(&GuildId::new("rust"))));
        assert!(!filter.is_allowed(&cid, None, Some(&GuildId::new("go"))));
        assert!(!filter.is_allowed(&cid, None, None));
    }

    #[test]
    fn test_guild_mode_blocklist() {
        let (filter, _) = filter();
        let cid = Cid::of(b"post");
        filter
            .set_guild_policy(GuildMode::Blocklist, guilds(&["spam"]), guilds(&["spam"]))
            .unwrap();

        assert!(!filter.is_allowed(&cid, None, Some(&GuildId::new("spam"))));
        assert!(filter.is_allowed(&cid, None, Some(&GuildId::new("rust"))));
        assert!(filter.is_allowed(&cid, None, None));
    }

    #[test]
    fn test_guild_edits_persist_and_reload() {
        let store = Arc::new(MemoryStore::default());
        {
            let filter = PolicyFilter::load(Box::new(store.clone())).unwrap();
            filter.allow_guild(GuildId::new("rust")).unwrap();
            filter.block_guild(GuildId::new("spam")).unwrap();
            assert!(!filter.allow_guild(GuildId::new("rust")).unwrap());
        }

        let reloaded = PolicyFilter::load(Box::new(store)).unwrap();
        let state = reloaded.snapshot();
        assert_eq!(state.version, 2);
        assert_eq!(state.allowed_guilds, guilds(&["rust"]));
        assert_eq!(state.blocked_guilds, guilds(&["spam"]));
    }

    #[test]
    fn test_reads_proceed_while_save_is_in_flight() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let store = GatedStore {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };
        let filter = Arc::new(PolicyFilter::load(Box::new(store)).unwrap());
        let cid = Cid::of(b"slow save");

        let writer = {
            let filter = filter.clone();
            thread::spawn(move || filter.block_cid(cid).unwrap())
        };
        entered_rx.recv().unwrap();

        // save is parked: the state lock is free and readers see the old version
        assert!(filter.state.try_read().is_ok());
        assert!(filter.is_allowed(&cid, None, None));
        assert_eq!(filter.snapshot().version, 0);

        release_tx.send(()).unwrap();
        assert!(writer.join().unwrap());
        assert!(!filter.is_allowed(&cid, None, None));
        assert_eq!(filter.snapshot().version, 1);
    }

    #[test]
    fn test_sqlite_store_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let filter = PolicyFilter::load(Box::new(SqlitePolicyStore::new(db))).unwrap();
        filter.block_cid(Cid::of(b"x")).unwrap();
        assert_eq!(filter.snapshot().version, 1);
    }
}
