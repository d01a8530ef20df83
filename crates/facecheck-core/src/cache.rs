//! TTL-bounded in-memory gallery of enrolled encodings.
//!
//! Readers share an `Arc<Gallery>` snapshot. Rebuilds are serialized by a
//! dedicated mutex so concurrent callers on a cold cache trigger one store
//! scan, and a generation counter keeps an `invalidate()` that lands during
//! a rebuild from being overwritten by stale data.

use crate::store::{EncodingStore, StoreError};
use crate::types::{CacheEntry, Encoding, Gallery};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache rebuild failed: {0}")]
    Store(#[from] StoreError),
}

struct Snapshot {
    gallery: Arc<Gallery>,
    loaded_at: Instant,
}

pub struct EncodingCache {
    store: Arc<dyn EncodingStore>,
    ttl: Duration,
    snapshot: RwLock<Option<Snapshot>>,
    rebuild: Mutex<()>,
    generation: AtomicU64,
}

impl EncodingCache {
    pub fn new(store: Arc<dyn EncodingStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            snapshot: RwLock::new(None),
            rebuild: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The current gallery, rebuilt from the store when missing or expired.
    ///
    /// Blocks on store I/O during a rebuild.
    pub fn load(&self) -> Result<Arc<Gallery>, CacheError> {
        if let Some(gallery) = self.fresh() {
            return Ok(gallery);
        }

        let _guard = self.rebuild.lock().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have finished a rebuild while we waited.
        if let Some(gallery) = self.fresh() {
            return Ok(gallery);
        }

        let generation = self.generation.load(Ordering::Acquire);
        let gallery = Arc::new(self.build()?);

        let mut slot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::Acquire) == generation {
            *slot = Some(Snapshot {
                gallery: Arc::clone(&gallery),
                loaded_at: Instant::now(),
            });
        } else {
            tracing::debug!("cache invalidated during rebuild; result not installed");
        }
        Ok(gallery)
    }

    /// Drop the snapshot; the next `load()` rebuilds.
    pub fn invalidate(&self) {
        let mut slot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::AcqRel);
        *slot = None;
        tracing::info!("face encoding cache cleared");
    }

    /// Invalidate and rebuild eagerly. Returns the number of entries loaded.
    pub fn reload(&self) -> Result<usize, CacheError> {
        self.invalidate();
        Ok(self.load()?.len())
    }

    /// Entry count of the installed snapshot, without triggering a rebuild.
    pub fn cached_len(&self) -> Option<usize> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.gallery.len())
    }

    fn fresh(&self) -> Option<Arc<Gallery>> {
        let slot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref()
            .filter(|s| s.loaded_at.elapsed() < self.ttl)
            .map(|s| Arc::clone(&s.gallery))
    }

    fn build(&self) -> Result<Gallery, StoreError> {
        let started = Instant::now();
        let rows = self.store.list_records_with_encoding()?;
        let total = rows.len();

        let mut gallery = Gallery::with_capacity(total);
        for row in rows {
            let encoding = match Encoding::from_bytes(&row.blob) {
                Ok(e) => e,
                Err(error) => {
                    tracing::warn!(record_id = row.record_id, %error, "skipping corrupt encoding");
                    continue;
                }
            };
            let display_name = self
                .store
                .get_person_label(row.person_id)?
                .unwrap_or_else(|| format!("Person {}", row.person_id));
            gallery.insert(
                row.record_id,
                CacheEntry {
                    record_id: row.record_id,
                    person_id: row.person_id,
                    display_name,
                    encoding,
                },
            );
        }

        tracing::info!(
            loaded = gallery.len(),
            skipped = total - gallery.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "face encoding cache rebuilt"
        );
        Ok(gallery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::types::{FaceRecord, PersonId, RecordId, StoredEncoding, ENCODING_DIM};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    fn blob(fill: f32) -> Vec<u8> {
        Encoding::new(vec![fill; ENCODING_DIM]).unwrap().to_bytes()
    }

    /// Store with `valid` encoded records plus one corrupt blob.
    fn seeded(valid: usize) -> Arc<SqliteStore> {
        let store = SqliteStore::open_in_memory().unwrap();
        let person = store.add_person("Grace").unwrap();
        for i in 0..valid {
            let id = store.add_record(person, &[vec![0]]).unwrap();
            store.save_encoding(id, &blob(i as f32 * 0.01)).unwrap();
        }
        let corrupt = store.add_record(person, &[vec![0]]).unwrap();
        store.save_encoding(corrupt, &[0x80, 0x04, 0x95]).unwrap();
        Arc::new(store)
    }

    /// Counts full-table scans.
    struct CountingStore {
        inner: Arc<SqliteStore>,
        scans: AtomicUsize,
    }

    impl EncodingStore for CountingStore {
        fn get_record(&self, id: RecordId) -> Result<Option<FaceRecord>, StoreError> {
            self.inner.get_record(id)
        }
        fn list_records_with_encoding(&self) -> Result<Vec<StoredEncoding>, StoreError> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            self.inner.list_records_with_encoding()
        }
        fn list_records_missing_encoding(&self) -> Result<Vec<RecordId>, StoreError> {
            self.inner.list_records_missing_encoding()
        }
        fn save_encoding(&self, id: RecordId, blob: &[u8]) -> Result<(), StoreError> {
            self.inner.save_encoding(id, blob)
        }
        fn get_person_label(&self, person_id: PersonId) -> Result<Option<String>, StoreError> {
            self.inner.get_person_label(person_id)
        }
    }

    #[test]
    fn test_corrupt_entries_skipped() {
        let cache = EncodingCache::new(seeded(3), Duration::from_secs(60));
        let gallery = cache.load().unwrap();
        assert_eq!(gallery.len(), 3);
        assert!(gallery.values().all(|e| e.display_name == "Grace"));
    }

    #[test]
    fn test_missing_label_falls_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        let person = store.add_person("").unwrap();
        let id = store.add_record(person, &[vec![0]]).unwrap();
        store.save_encoding(id, &blob(0.1)).unwrap();
        let cache = EncodingCache::new(Arc::new(store), Duration::from_secs(60));
        assert_eq!(cache.load().unwrap()[&id].display_name, format!("Person {person}"));
    }

    #[test]
    fn test_load_is_cached_within_ttl() {
        let store = seeded(2);
        let cache = EncodingCache::new(store.clone(), Duration::from_secs(60));
        let first = cache.load().unwrap();

        let person = store.add_person("Late").unwrap();
        let id = store.add_record(person, &[vec![0]]).unwrap();
        store.save_encoding(id, &blob(0.5)).unwrap();

        let second = cache.load().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn test_invalidate_reflects_store() {
        let store = seeded(2);
        let cache = EncodingCache::new(store.clone(), Duration::from_secs(60));
        assert_eq!(cache.load().unwrap().len(), 2);

        let person = store.add_person("Late").unwrap();
        let id = store.add_record(person, &[vec![0]]).unwrap();
        store.save_encoding(id, &blob(0.5)).unwrap();

        cache.invalidate();
        assert_eq!(cache.cached_len(), None);
        let gallery = cache.load().unwrap();
        assert_eq!(gallery.len(), 3);
        assert_eq!(gallery[&id].display_name, "Late");
    }

    #[test]
    fn test_zero_ttl_always_rebuilds() {
        let counting = Arc::new(CountingStore {
            inner: seeded(1),
            scans: AtomicUsize::new(0),
        });
        let cache = EncodingCache::new(counting.clone(), Duration::ZERO);
        cache.load().unwrap();
        cache.load().unwrap();
        assert_eq!(counting.scans.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reload_returns_count() {
        let cache = EncodingCache::new(seeded(3), Duration::from_secs(60));
        assert_eq!(cache.reload().unwrap(), 3);
        assert_eq!(cache.cached_len(), Some(3));
    }

    #[test]
    fn test_concurrent_cold_loads_rebuild_once() {
        let counting = Arc::new(CountingStore {
            inner: seeded(3),
            scans: AtomicUsize::new(0),
        });
        let cache = Arc::new(EncodingCache::new(counting.clone(), Duration::from_secs(60)));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    cache.load().unwrap().len()
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), 3);
        }
        assert_eq!(counting.scans.load(Ordering::SeqCst), 1);
    }
}
