use std::{
    collections::VecDeque,
    mem,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::ratelimit::{AdmissionResult, RateLimitStore};

/// Bounded in-memory ledger.
///
/// The key table is a sharded `DashMap`; each key owns its own mutex, so
/// requests for different keys only contend on the shard they hash to.
/// Creating a key while at `max_keys` evicts the least recently written key.
pub struct InMemoryStore {
    records: DashMap<String, Arc<Mutex<KeyRecord>>>,
    max_keys: usize,
    touch_seq: AtomicU64,
    admission: Mutex<()>,
}

struct KeyRecord {
    // kept sorted ascending
    entries: VecDeque<DateTime<Utc>>,
    last_touch: u64,
}

impl KeyRecord {
    fn insert(&mut self, at: DateTime<Utc>) {
        let idx = self.entries.partition_point(|t| *t <= at);
        self.entries.insert(idx, at);
    }

    fn first_after(&self, cutoff: DateTime<Utc>) -> usize {
        self.entries.partition_point(|t| *t <= cutoff)
    }

    fn prune(&mut self, cutoff: DateTime<Utc>) {
        let expired = self.first_after(cutoff);
        self.entries.drain(..expired);
    }
}

fn lock(record: &Mutex<KeyRecord>) -> MutexGuard<'_, KeyRecord> {
    record.lock().unwrap_or_else(|e| e.into_inner())
}

impl InMemoryStore {
    pub fn new(max_keys: usize) -> Self {
        Self {
            records: DashMap::new(),
            max_keys: max_keys.max(1),
            touch_seq: AtomicU64::new(0),
            admission: Mutex::new(()),
        }
    }

    fn next_touch(&self) -> u64 {
        self.touch_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record(&self, key: &str) -> Option<Arc<Mutex<KeyRecord>>> {
        self.records.get(key).map(|r| r.value().clone())
    }

    /// Appends under the shard read guard so cleanup and eviction, which
    /// remove under the shard write guard, cannot orphan the record mid-write.
    fn append_existing(&self, key: &str, at: DateTime<Utc>) -> bool {
        match self.records.get(key) {
            Some(record) => {
                let mut record = lock(record.value());
                record.insert(at);
                record.last_touch = self.next_touch();
                true
            }
            None => false,
        }
    }

    fn admit_and_append(&self, key: &str, at: DateTime<Utc>) {
        // only brand-new keys serialize here
        let _guard = self.admission.lock().unwrap_or_else(|e| e.into_inner());
        if self.append_existing(key, at) {
            return;
        }

        while self.records.len() >= self.max_keys {
            if !self.evict_least_recent() {
                break;
            }
        }

        let record = self.records.entry(key.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(KeyRecord {
                entries: VecDeque::new(),
                last_touch: 0,
            }))
        });
        let mut record = lock(record.value());
        record.insert(at);
        record.last_touch = self.next_touch();
    }

    fn evict_least_recent(&self) -> bool {
        let victim = self
            .records
            .iter()
            .map(|entry| (lock(entry.value()).last_touch, entry.key().clone()))
            .min();

        let Some((seen_touch, key)) = victim else {
            return false;
        };

        // a write since the scan makes it no longer the least recent; the
        // caller rescans
        if self
            .records
            .remove_if(&key, |_, record| lock(record).last_touch == seen_touch)
            .is_some()
        {
            tracing::debug!(key = %key, "evicted least recently used rate limit key");
        }
        true
    }
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
    async fn add_request(&self, key: &str, at: DateTime<Utc>) -> AdmissionResult<()> {
        if !self.append_existing(key, at) {
            self.admit_and_append(key, at);
        }
        Ok(())
    }

    async fn get_requests(
        &self,
        key: &str,
        cutoff: DateTime<Utc>,
    ) -> AdmissionResult<Vec<DateTime<Utc>>> {
        let Some(record) = self.record(key) else {
            return Ok(Vec::new());
        };
        let record = lock(&record);
        let start = record.first_after(cutoff);
        Ok(record.entries.range(start..).copied().collect())
    }

    async fn get_request_count(&self, key: &str, cutoff: DateTime<Utc>) -> AdmissionResult<u64> {
        let Some(record) = self.record(key) else {
            return Ok(0);
        };
        let record = lock(&record);
        Ok((record.entries.len() - record.first_after(cutoff)) as u64)
    }

    async fn cleanup(&self, cutoff: DateTime<Utc>) -> AdmissionResult<usize> {
        let keys: Vec<String> = self.records.iter().map(|e| e.key().clone()).collect();
        let mut removed = 0;

        for key in keys {
            let Some(record) = self.record(&key) else {
                continue;
            };
            let emptied = {
                let mut record = lock(&record);
                record.prune(cutoff);
                record.entries.is_empty()
            };

            // re-check under the shard write guard; writers append under the
            // read guard, so an empty record here has no write in flight
            if emptied
                && self
                    .records
                    .remove_if(&key, |_, current| {
                        Arc::ptr_eq(current, &record) && lock(current).entries.is_empty()
                    })
                    .is_some()
            {
                removed += 1;
            }
        }

        Ok(removed)
    }

    async fn key_count(&self) -> AdmissionResult<usize> {
        Ok(self.records.len())
    }

    async fn memory_usage(&self) -> AdmissionResult<usize> {
        let per_entry = mem::size_of::<DateTime<Utc>>();
        let overhead = mem::size_of::<String>()
            + mem::size_of::<Arc<Mutex<KeyRecord>>>()
            + mem::size_of::<Mutex<KeyRecord>>();

        Ok(self
            .records
            .iter()
            .map(|entry| {
                let capacity = lock(entry.value()).entries.capacity();
                overhead + entry.key().capacity() + capacity * per_entry
            })
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    #[tokio::test]
    async fn count_matches_listed_requests() {
        let store = InMemoryStore::new(8);
        for ms in [100, 300, 200, 400] {
            store.add_request("ip:1", at(ms)).await.unwrap();
        }

        for cutoff in [0, 100, 250, 400] {
            let listed = store.get_requests("ip:1", at(cutoff)).await.unwrap();
            let counted = store.get_request_count("ip:1", at(cutoff)).await.unwrap();
            assert_eq!(listed.len() as u64, counted, "cutoff {cutoff}");
            assert!(listed.iter().all(|t| *t > at(cutoff)));
        }
        assert_eq!(store.get_request_count("ip:1", at(250)).await.unwrap(), 2);
        assert_eq!(store.get_request_count("ip:missing", at(0)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn never_holds_more_than_max_keys() {
        let clock = ManualClock::starting_at_epoch_millis(1_000);
        let store = InMemoryStore::new(3);

        for i in 0..4 {
            store.add_request(&format!("ip:{i}"), clock.now()).await.unwrap();
            clock.advance(Duration::from_millis(1));
        }

        assert_eq!(store.key_count().await.unwrap(), 3);
        assert_eq!(store.get_request_count("ip:0", at(0)).await.unwrap(), 0);
        for i in 1..4 {
            assert_eq!(
                store.get_request_count(&format!("ip:{i}"), at(0)).await.unwrap(),
                1
            );
        }
    }

    #[tokio::test]
    async fn eviction_keeps_recently_written_keys() {
        let store = InMemoryStore::new(2);
        store.add_request("ip:a", at(1)).await.unwrap();
        store.add_request("ip:b", at(2)).await.unwrap();
        // a is written again and becomes the most recent
        store.add_request("ip:a", at(3)).await.unwrap();
        store.add_request("ip:c", at(4)).await.unwrap();

        assert_eq!(store.get_request_count("ip:a", at(0)).await.unwrap(), 2);
        assert_eq!(store.get_request_count("ip:b", at(0)).await.unwrap(), 0);
        assert_eq!(store.get_request_count("ip:c", at(0)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_keeps_live_entries() {
        let store = InMemoryStore::new(8);
        store.add_request("ip:old", at(100)).await.unwrap();
        store.add_request("ip:mixed", at(100)).await.unwrap();
        store.add_request("ip:mixed", at(900)).await.unwrap();
        store.add_request("ip:new", at(1_000)).await.unwrap();

        assert_eq!(store.cleanup(at(500)).await.unwrap(), 1);
        assert_eq!(store.key_count().await.unwrap(), 2);
        assert_eq!(store.get_requests("ip:mixed", at(0)).await.unwrap(), vec![at(900)]);

        assert_eq!(store.cleanup(at(500)).await.unwrap(), 0);
        assert_eq!(store.key_count().await.unwrap(), 2);
        assert_eq!(store.get_request_count("ip:mixed", at(0)).await.unwrap(), 1);
        assert_eq!(store.get_request_count("ip:new", at(0)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_writers_lose_nothing() {
        let store = Arc::new(InMemoryStore::new(64));
        let mut tasks = Vec::new();
        for worker in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..100 {
                    store
                        .add_request("user:shared", at(worker * 1_000 + i))
                        .await
                        .unwrap();
                    store
                        .add_request(&format!("user:{worker}"), at(i))
                        .await
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.get_request_count("user:shared", at(-1)).await.unwrap(), 800);
        assert_eq!(store.key_count().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn memory_usage_tracks_growth() {
        let store = InMemoryStore::new(8);
        assert_eq!(store.memory_usage().await.unwrap(), 0);

        store.add_request("ip:1", at(1)).await.unwrap();
        let one = store.memory_usage().await.unwrap();
        assert!(one > 0);

        for ms in 2..50 {
            store.add_request("ip:1", at(ms)).await.unwrap();
        }
        assert!(store.memory_usage().await.unwrap() > one);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cleanup_racing_writers_never_drops_a_live_write() {
        let store = Arc::new(InMemoryStore::new(64));
        let mut tasks = Vec::new();

        for worker in 0..4 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..500 {
                    store
                        .add_request("ip:contended", at(10_000 + worker * 1_000 + i))
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }

        let sweeper = {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    // every live entry is newer than the cutoff, so only an
                    // empty record may ever be removed
                    store.cleanup(at(5_000)).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        for task in tasks {
            task.await.unwrap();
        }
        sweeper.await.unwrap();

        assert_eq!(store.get_request_count("ip:contended", at(0)).await.unwrap(), 2_000);
    }
}
