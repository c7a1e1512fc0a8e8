//! Content-addressed blob storage.
//!
//! Payloads are written once under `blobs/<hh>/<hex cid>` (temp file +
//! rename, so a crash never leaves a truncated blob under its final name).
//! Metadata writes for one CID are serialized through [`CidLocks`]; the
//! SQLite handle itself is only held for single statements, never across an
//! `.await`. Bytes admitted under the storage ceiling are reserved store-wide
//! until their metadata row exists, so concurrent puts of different CIDs
//! cannot overshoot it together.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, info, warn};

use strata_shared::{Cid, ShardRouter};

use crate::database::Database;
use crate::error::{ProtectReason, Result, StoreError};
use crate::guard::{ReplicaCheck, ReplicaGuard};
use crate::locks::CidLocks;
use crate::models::{BlobOrigin, BlobRecord, PutOptions, StoreStats};

/// Size limits enforced on `put`.
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    /// Largest accepted payload in bytes.
    pub max_blob_size: usize,
    /// Storage ceiling in bytes, 0 = unlimited.
    pub max_storage_bytes: u64,
}

pub struct ContentStore {
    db: Mutex<Database>,
    blobs_dir: PathBuf,
    router: ShardRouter,
    limits: StoreLimits,
    locks: CidLocks,
    /// Bytes admitted by `put` but not yet recorded in the blobs table.
    pending: Mutex<u64>,
}

/// Admitted bytes of one in-flight `put`. Dropping it releases them.
struct Reservation<'a> {
    pending: &'a Mutex<u64>,
    bytes: u64,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = pending.saturating_sub(self.bytes);
    }
}

impl ContentStore {
    /// Open the store rooted at `data_dir`, creating it if needed.
    ///
    /// Fails with [`StoreError::ShardCountMismatch`] if the data directory was
    /// created under a different shard count.
    pub async fn open(data_dir: &Path, router: ShardRouter, limits: StoreLimits) -> Result<Self> {
        let db = Database::open(data_dir)?;
        Self::with_database(db, data_dir.join("blobs"), router, limits).await
    }

    pub async fn with_database(
        db: Database,
        blobs_dir: PathBuf,
        router: ShardRouter,
        limits: StoreLimits,
    ) -> Result<Self> {
        db.ensure_shard_count(router.shard_count())?;
        fs::create_dir_all(&blobs_dir).await?;

        info!(path = %blobs_dir.display(), "Content store initialized");

        Ok(Self {
            db: Mutex::new(db),
            blobs_dir,
            router,
            limits,
            locks: CidLocks::default(),
            pending: Mutex::new(0),
        })
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    /// Store a payload and return its CID.
    ///
    /// Storing bytes that are already present does not rewrite them; only the
    /// pin flag is merged in. A local put of a blob held as a replica makes
    /// this node its origin, and the peer that pushed it stays recorded as a
    /// holder.
    pub async fn put(&self, payload: &[u8], opts: PutOptions) -> Result<Cid> {
        if payload.is_empty() {
            return Err(StoreError::EmptyBlob);
        }
        if payload.len() > self.limits.max_blob_size {
            return Err(StoreError::SizeExceeded {
                size: payload.len(),
                max: self.limits.max_blob_size,
            });
        }

        let cid = Cid::of(payload);
        let shard = self.router.shard_of(&cid);
        if opts.origin.is_local() && !self.router.owns_shard(shard) {
            return Err(StoreError::NotResponsible { cid, shard });
        }

        let _guard = self.locks.lock(&cid).await;

        let existing = self.db()?.find_blob(&cid)?;
        if let Some(existing) = existing {
            if opts.pin && !existing.pinned {
                self.db()?.set_pinned(&cid, true)?;
            }
            if let (true, BlobOrigin::Replica { from }) = (opts.origin.is_local(), &existing.origin) {
                let db = self.db()?;
                db.set_origin(&cid, &BlobOrigin::Local)?;
                db.upsert_replica(&cid, from, existing.stored_at)?;
                info!(cid = %cid, from = %from, "Replica promoted to local origin");
            }
            let path = self.blob_path(&cid);
            if !fs::try_exists(&path).await? {
                warn!(cid = %cid, "Payload file missing for known blob, rewriting");
                self.write_payload(&cid, payload).await?;
            }
            debug!(cid = %cid, "Duplicate put, nothing written");
            return Ok(cid);
        }

        let _reservation = self.reserve(payload.len() as u64)?;

        self.write_payload(&cid, payload).await?;

        let now = Utc::now();
        let record = BlobRecord {
            cid,
            size: payload.len() as u64,
            content_type: opts.content_type,
            guild: opts.guild,
            shard,
            origin: opts.origin,
            pinned: opts.pin,
            stored_at: now,
            last_accessed: now,
            replicas: Vec::new(),
        };
        self.db()?.insert_blob(&record)?;

        debug!(cid = %cid, size = payload.len(), shard, "Stored blob");
        Ok(cid)
    }

    /// Read a payload and record the access.
    pub async fn get(&self, cid: &Cid) -> Result<Vec<u8>> {
        let data = self.read(cid).await?;
        self.record_access(cid, Utc::now()).await?;
        Ok(data)
    }

    /// Read a payload without touching its access time (replication and
    /// verification reads must not look like client demand to the GC).
    pub async fn read(&self, cid: &Cid) -> Result<Vec<u8>> {
        let path = self.blob_path(cid);
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(*cid)),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    pub async fn record_access(&self, cid: &Cid, at: DateTime<Utc>) -> Result<()> {
        let _guard = self.locks.lock(cid).await;
        if !self.db()?.touch_blob(cid, at)? {
            return Err(StoreError::NotFound(*cid));
        }
        Ok(())
    }

    /// Delete a blob unless it is pinned or `guard` cannot confirm that
    /// enough other replicas are live.
    pub async fn delete<G>(&self, cid: &Cid, guard: &G) -> Result<u64>
    where
        G: ReplicaGuard + ?Sized,
    {
        let record = self.metadata(cid)?;
        if record.pinned {
            return Err(StoreError::Protected {
                cid: *cid,
                reason: ProtectReason::Pinned,
            });
        }

        // The live check talks to the network; the CID lock is taken only
        // after it so verification can still update this blob's replica set.
        match guard.check_other_replicas(&record).await {
            ReplicaCheck::Confirmed(_) => {}
            ReplicaCheck::Insufficient { live, required } => {
                return Err(StoreError::Protected {
                    cid: *cid,
                    reason: ProtectReason::InsufficientReplicas { live, required },
                });
            }
            ReplicaCheck::Unverifiable => {
                return Err(StoreError::Protected {
                    cid: *cid,
                    reason: ProtectReason::Unverifiable,
                });
            }
        }

        let _lock = self.locks.lock(cid).await;
        let current = self.metadata(cid)?;
        if current.pinned {
            return Err(StoreError::Protected {
                cid: *cid,
                reason: ProtectReason::Pinned,
            });
        }

        self.db()?.delete_blob(cid)?;
        match fs::remove_file(self.blob_path(cid)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(cid = %cid, "Payload file already gone");
            }
            Err(e) => return Err(StoreError::Io(e)),
        }

        debug!(cid = %cid, size = current.size, "Deleted blob");
        Ok(current.size)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.db()?.blob_stats()
    }

    pub fn metadata(&self, cid: &Cid) -> Result<BlobRecord> {
        self.db()?.get_blob(cid)
    }

    pub fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.db()?.find_blob(cid)?.is_some())
    }

    /// All blob records, least recently accessed first.
    pub fn list(&self) -> Result<Vec<BlobRecord>> {
        self.db()?.list_blobs()
    }

    pub async fn pin(&self, cid: &Cid) -> Result<()> {
        self.set_pinned(cid, true).await
    }

    pub async fn unpin(&self, cid: &Cid) -> Result<()> {
        self.set_pinned(cid, false).await
    }

    async fn set_pinned(&self, cid: &Cid, pinned: bool) -> Result<()> {
        let _guard = self.locks.lock(cid).await;
        if !self.db()?.set_pinned(cid, pinned)? {
            return Err(StoreError::NotFound(*cid));
        }
        debug!(cid = %cid, pinned, "Pin flag updated");
        Ok(())
    }

    /// Record (or refresh) a verified replica holder.
    pub async fn add_replica(&self, cid: &Cid, peer_id: &str, at: DateTime<Utc>) -> Result<()> {
        let _guard = self.locks.lock(cid).await;
        if self.db()?.find_blob(cid)?.is_none() {
            return Err(StoreError::NotFound(*cid));
        }
        self.db()?.upsert_replica(cid, peer_id, at)
    }

    pub async fn remove_replica(&self, cid: &Cid, peer_id: &str) -> Result<bool> {
        let _guard = self.locks.lock(cid).await;
        self.db()?.delete_replica(cid, peer_id)
    }

    /// Admit `needed` bytes under the storage ceiling, counting what other
    /// in-flight puts already hold.
    fn reserve(&self, needed: u64) -> Result<Option<Reservation<'_>>> {
        if self.limits.max_storage_bytes == 0 {
            return Ok(None);
        }
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let used = self.db()?.blob_stats()?.total_bytes.saturating_add(*pending);
        let available = self.limits.max_storage_bytes.saturating_sub(used);
        if needed > available {
            return Err(StoreError::CapacityExceeded { needed, available });
        }
        *pending += needed;
        Ok(Some(Reservation {
            pending: &self.pending,
            bytes: needed,
        }))
    }

    fn db(&self) -> Result<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    fn blob_path(&self, cid: &Cid) -> PathBuf {
        let hex = cid.to_hex();
        self.blobs_dir.join(&hex[..2]).join(hex)
    }

    async fn write_payload(&self, cid: &Cid, payload: &[u8]) -> Result<()> {
        let path = self.blob_path(cid);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, payload).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
