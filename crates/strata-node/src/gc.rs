//! Garbage collector.
//!
//! Each cycle reclaims space from non-pinned blobs: expired blobs first
//! (time and hybrid modes), then least recently accessed blobs while usage is
//! above the threshold (size and hybrid modes). Every deletion goes through
//! [`ContentStore::delete`], so the replica guard must confirm the durability
//! floor live before a copy is dropped.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use strata_store::{BlobRecord, ContentStore, ProtectReason, ReplicaGuard, StoreError};

use crate::events::{emit, NodeEvent};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionMode {
    /// Evict least recently accessed blobs above the size ceiling.
    Size,
    /// Evict blobs older than the age ceiling.
    Time,
    #[default]
    Hybrid,
}

impl RetentionMode {
    fn uses_size(self) -> bool {
        matches!(self, Self::Size | Self::Hybrid)
    }

    fn uses_age(self) -> bool {
        matches!(self, Self::Time | Self::Hybrid)
    }
}

#[derive(Debug, Clone)]
pub struct GcSettings {
    pub mode: RetentionMode,
    /// 0 disables the size ceiling.
    pub max_storage_bytes: u64,
    pub reserved_for_pinned_bytes: u64,
    /// `None` disables the age ceiling.
    pub max_age: Option<Duration>,
    pub max_candidates: usize,
}

impl GcSettings {
    /// Usage above which size-driven eviction starts.
    pub fn threshold(&self) -> u64 {
        self.max_storage_bytes
            .saturating_sub(self.reserved_for_pinned_bytes)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GcReport {
    pub checked: usize,
    /// Candidates deleted.
    pub passed: usize,
    /// Candidates kept because too few other replicas were live.
    pub failed: usize,
    /// Candidates kept because no holder could be verified.
    pub orphaned: usize,
    pub bytes_reclaimed: u64,
    pub usage_before: u64,
    pub usage_after: u64,
    pub skipped: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl GcReport {
    fn new(usage: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            checked: 0,
            passed: 0,
            failed: 0,
            orphaned: 0,
            bytes_reclaimed: 0,
            usage_before: usage,
            usage_after: usage,
            skipped: false,
            started_at,
            finished_at: started_at,
        }
    }
}

pub struct GarbageCollector {
    store: Arc<ContentStore>,
    guard: Arc<dyn ReplicaGuard>,
    settings: GcSettings,
    events: broadcast::Sender<NodeEvent>,
    last_report: RwLock<Option<GcReport>>,
    running: Mutex<()>,
}

impl GarbageCollector {
    pub fn new(
        store: Arc<ContentStore>,
        guard: Arc<dyn ReplicaGuard>,
        settings: GcSettings,
        events: broadcast::Sender<NodeEvent>,
    ) -> Self {
        if settings.max_storage_bytes > 0
            && settings.reserved_for_pinned_bytes > settings.max_storage_bytes
        {
            warn!("Reserved-for-pinned exceeds max storage; GC runs best-effort");
        }
        Self {
            store,
            guard,
            settings,
            events,
            last_report: RwLock::new(None),
            running: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &GcSettings {
        &self.settings
    }

    pub async fn last_report(&self) -> Option<GcReport> {
        self.last_report.read().await.clone()
    }

    pub async fn run_cycle(&self) -> Result<GcReport, StoreError> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one cycle with `now` as the reference time for age checks.
    /// Cycles never overlap; a call made while one is running waits for it.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<GcReport, StoreError> {
        let _running = self.running.lock().await;

        let usage = self.store.stats()?.total_bytes;
        let mut report = GcReport::new(usage, Utc::now());
        let threshold = self.settings.threshold();
        let over_size = self.settings.max_storage_bytes > 0 && usage > threshold;

        let records = self.store.list()?;
        let expired = |r: &BlobRecord| {
            self.settings
                .max_age
                .is_some_and(|max_age| now.signed_duration_since(r.stored_at) > max_age)
        };
        let any_expired = records.iter().any(|r| !r.pinned && expired(r));

        let size_active = self.settings.mode.uses_size() && over_size;
        let age_active = self.settings.mode.uses_age() && any_expired;

        if !size_active && !age_active {
            debug!(usage, threshold, mode = ?self.settings.mode, "GC skipped, nothing to reclaim");
            report.skipped = true;
            report.finished_at = Utc::now();
            *self.last_report.write().await = Some(report.clone());
            return Ok(report);
        }

        // `list` is least recently accessed first, so both passes keep LRU order.
        let (aged, fresh): (Vec<BlobRecord>, Vec<BlobRecord>) = records
            .into_iter()
            .filter(|r| !r.pinned)
            .partition(|r| age_active && expired(r));
        let mut candidates = aged;
        let aged_count = candidates.len();
        if size_active {
            candidates.extend(fresh);
        }
        candidates.truncate(self.settings.max_candidates);

        let mut current = usage;
        for (index, record) in candidates.into_iter().enumerate() {
            let is_aged = index < aged_count;
            if !is_aged && current <= threshold {
                break;
            }

            report.checked += 1;
            match self.store.delete(&record.cid, self.guard.as_ref()).await {
                Ok(size) => {
                    report.passed += 1;
                    report.bytes_reclaimed += size;
                    current = current.saturating_sub(size);
                    emit(
                        &self.events,
                        NodeEvent::BlobDeleted {
                            cid: record.cid,
                            size,
                        },
                    );
                }
                Err(StoreError::Protected { reason, .. }) => match reason {
                    ProtectReason::InsufficientReplicas { live, required } => {
                        debug!(cid = %record.cid, live, required, "GC kept blob, too few live replicas");
                        report.failed += 1;
                    }
                    ProtectReason::Unverifiable => {
                        debug!(cid = %record.cid, "GC kept blob, replicas unverifiable");
                        report.orphaned += 1;
                    }
                    ProtectReason::Pinned => {
                        debug!(cid = %record.cid, "Blob pinned during GC");
                    }
                },
                Err(StoreError::NotFound(_)) => {
                    debug!(cid = %record.cid, "Blob already gone");
                }
                Err(e) => {
                    warn!(cid = %record.cid, error = %e, "GC delete failed");
                    report.failed += 1;
                }
            }
        }

        report.usage_after = current;
        report.finished_at = Utc::now();
        info!(
            checked = report.checked,
            passed = report.passed,
            failed = report.failed,
            orphaned = report.orphaned,
            bytes_reclaimed = report.bytes_reclaimed,
            "GC cycle complete"
        );

        *self.last_report.write().await = Some(report.clone());
        emit(&self.events, NodeEvent::GcCompleted(report.clone()));
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use strata_shared::constants::MAX_BLOB_SIZE;
    use strata_shared::{Cid, ContentType, ShardRouter};
    use strata_store::{PutOptions, ReplicaCheck, StoreLimits};
    use tempfile::TempDir;

    use crate::events::event_channel;

    struct FixedGuard {
        answer: ReplicaCheck,
        calls: AtomicUsize,
    }

    impl FixedGuard {
        fn new(answer: ReplicaCheck) -> Arc<Self> {
            Arc::new(Self {
                answer,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ReplicaGuard for FixedGuard {
        async fn check_other_replicas(&self, _record: &BlobRecord) -> ReplicaCheck {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    async fn store() -> (TempDir, Arc<ContentStore>) {
        let dir = TempDir::new().unwrap();
        let limits = StoreLimits {
            max_blob_size: MAX_BLOB_SIZE,
            max_storage_bytes: 0,
        };
        let store = ContentStore::open(dir.path(), ShardRouter::full(1024).unwrap(), limits)
            .await
            .unwrap();
        (dir, Arc::new(store))
    }

    fn settings(mode: RetentionMode, max_storage_bytes: u64) -> GcSettings {
        GcSettings {
            mode,
            max_storage_bytes,
            reserved_for_pinned_bytes: 0,
            max_age: Some(Duration::days(30)),
            max_candidates: 256,
        }
    }

    fn collector(store: &Arc<ContentStore>, guard: Arc<FixedGuard>, settings: GcSettings) -> GarbageCollector {
        GarbageCollector::new(store.clone(), guard, settings, event_channel())
    }

    async fn put(store: &ContentStore, data: &[u8], pin: bool) -> Cid {
        store
            .put(data, PutOptions::local(ContentType::Message).pinned(pin))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_unverifiable_replicas_block_every_deletion() {
        let (_dir, store) = store().await;
        let a = put(&store, b"0123456789", false).await;
        let b = put(&store, b"abcdefghij", false).await;

        let gc = collector(&store, FixedGuard::new(ReplicaCheck::Unverifiable), settings(RetentionMode::Hybrid, 5));
        let report = gc.run_cycle().await.unwrap();

        assert_eq!(report.checked, 2);
        assert_eq!(report.passed, 0);
        assert_eq!(report.orphaned, 2);
        assert_eq!(report.bytes_reclaimed, 0);
        assert!(store.has(&a).unwrap());
        assert!(store.has(&b).unwrap());
    }

    #[tokio::test]
    async fn test_insufficient_replicas_count_as_failed() {
        let (_dir, store) = store().await;
        put(&store, b"0123456789", false).await;

        let guard = FixedGuard::new(ReplicaCheck::Insufficient { live: 1, required: 2 });
        let gc = collector(&store, guard, settings(RetentionMode::Size, 5));
        let report = gc.run_cycle().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.passed, 0);
        assert_eq!(store.stats().unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_pinned_blobs_are_never_evicted() {
        let (_dir, store) = store().await;
        let pinned = put(&store, b"keep me forever", true).await;
        let loose = put(&store, b"drop me", false).await;

        let guard = FixedGuard::new(ReplicaCheck::Confirmed(2));
        let gc = collector(&store, guard.clone(), settings(RetentionMode::Hybrid, 1));
        let report = gc.run_cycle_at(Utc::now() + Duration::days(365)).await.unwrap();

        assert_eq!(report.passed, 1);
        assert!(store.has(&pinned).unwrap());
        assert!(!store.has(&loose).unwrap());
        assert_eq!(guard.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_size_mode_evicts_least_recently_accessed_until_under_threshold() {
        let (_dir, store) = store().await;
        let oldest = put(&store, b"aaaaaaaaaa", false).await;
        let middle = put(&store, b"bbbbbbbbbb", false).await;
        let newest = put(&store, b"cccccccccc", false).await;
        let now = Utc::now();
        store.record_access(&middle, now + Duration::seconds(1)).await.unwrap();
        store.record_access(&newest, now + Duration::seconds(2)).await.unwrap();

        let gc = collector(&store, FixedGuard::new(ReplicaCheck::Confirmed(2)), settings(RetentionMode::Size, 25));
        let report = gc.run_cycle().await.unwrap();

        assert_eq!(report.passed, 1);
        assert_eq!(report.bytes_reclaimed, 10);
        assert_eq!(report.usage_after, 20);
        assert!(!store.has(&oldest).unwrap());
        assert!(store.has(&middle).unwrap());
        assert!(store.has(&newest).unwrap());
    }

    #[tokio::test]
    async fn test_no_age_ceiling_never_expires() {
        let (_dir, store) = store().await;
        let cid = put(&store, b"kept forever", false).await;
        let mut unlimited = settings(RetentionMode::Hybrid, 0);
        unlimited.max_age = None;
        let gc = collector(&store, FixedGuard::new(ReplicaCheck::Confirmed(2)), unlimited);

        let report = gc.run_cycle_at(Utc::now() + Duration::days(3650)).await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.passed, 0);
        assert!(store.has(&cid).unwrap());
    }

    #[tokio::test]
    async fn test_time_mode_only_evicts_expired_blobs() {
        let (_dir, store) = store().await;
        let cid = put(&store, b"old news", false).await;
        let guard = FixedGuard::new(ReplicaCheck::Confirmed(2));
        let gc = collector(&store, guard.clone(), settings(RetentionMode::Time, 0));

        let fresh = gc.run_cycle().await.unwrap();
        assert!(fresh.skipped);
        assert_eq!(guard.calls.load(Ordering::SeqCst), 0);
        assert!(store.has(&cid).unwrap());

        let later = gc.run_cycle_at(Utc::now() + Duration::days(31)).await.unwrap();
        assert_eq!(later.passed, 1);
        assert!(!store.has(&cid).unwrap());
    }

    #[tokio::test]
    async fn test_hybrid_skips_when_under_size_and_nothing_expired() {
        let (_dir, store) = store().await;
        put(&store, b"small", false).await;
        let guard = FixedGuard::new(ReplicaCheck::Confirmed(2));
        let gc = collector(&store, guard.clone(), settings(RetentionMode::Hybrid, 1024));

        let report = gc.run_cycle().await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.checked, 0);
        assert_eq!(guard.calls.load(Ordering::SeqCst), 0);
        assert!(gc.last_report().await.unwrap().skipped);
    }

    #[tokio::test]
    async fn test_reserved_for_pinned_lowers_threshold() {
        let (_dir, store) = store().await;
        put(&store, b"0123456789", false).await;

        let mut gc_settings = settings(RetentionMode::Size, 15);
        gc_settings.reserved_for_pinned_bytes = 10;
        assert_eq!(gc_settings.threshold(), 5);

        let gc = collector(&store, FixedGuard::new(ReplicaCheck::Confirmed(2)), gc_settings);
        assert_eq!(gc.run_cycle().await.unwrap().passed, 1);
    }

    #[tokio::test]
    async fn test_candidate_cap_bounds_cycle() {
        let (_dir, store) = store().await;
        for i in 0..5u8 {
            put(&store, &[i; 8], false).await;
        }
        let mut gc_settings = settings(RetentionMode::Size, 1);
        gc_settings.max_candidates = 2;

        let gc = collector(&store, FixedGuard::new(ReplicaCheck::Confirmed(2)), gc_settings);
        let report = gc.run_cycle().await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(store.stats().unwrap().count, 3);
    }
}
