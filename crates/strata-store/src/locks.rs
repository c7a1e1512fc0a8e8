use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use strata_shared::Cid;

/// Per-CID async locks. Two writers of the same blob's metadata serialize;
/// writers of different blobs never wait on each other.
#[derive(Default)]
pub(crate) struct CidLocks {
    slots: Mutex<HashMap<Cid, Arc<AsyncMutex<()>>>>,
}

pub(crate) struct CidGuard<'a> {
    locks: &'a CidLocks,
    cid: Cid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl CidLocks {
    pub(crate) async fn lock(&self, cid: &Cid) -> CidGuard<'_> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(*cid).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        CidGuard {
            locks: self,
            cid: *cid,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for CidGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = self
            .locks
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Only the map itself still references the slot: nobody is waiting.
        if slots
            .get(&self.cid)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.cid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_distinct_cids_do_not_block() {
        let locks = CidLocks::default();
        let a = locks.lock(&Cid::of(b"a")).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&Cid::of(b"b")))
            .await
            .expect("other cid must not wait");
        drop(a);
        drop(b);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_same_cid_serializes() {
        let locks = CidLocks::default();
        let cid = Cid::of(b"same");
        let held = locks.lock(&cid).await;
        assert!(
            tokio::time::timeout(Duration::from_millis(50), locks.lock(&cid))
                .await
                .is_err()
        );
        drop(held);
        let _again = locks.lock(&cid).await;
    }
}
