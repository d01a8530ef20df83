//! Recognition, enrollment and cache administration over one shared pool.

use crate::batch::{BatchOrchestrator, BatchReport, ProbeImage};
use crate::cache::EncodingCache;
use crate::config::Config;
use crate::encoder::RegionVerdict;
use crate::error::RecognitionError;
use crate::matcher::{best_match, Matcher};
use crate::notifier::{notify_attendance, AttendanceEvent, AttendanceNotifier, CaptureContext, LogNotifier};
use crate::pool::{PoolError, WorkerPool};
use crate::store::{EncodingStore, SqliteStore, StoreError};
use crate::types::{Encoding, Gallery, MatchResult, RecordId};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("worker pool: {0}")]
    Pool(#[from] PoolError),
}

/// Outcome of a bulk encoding regeneration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegenerateReport {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

pub struct RecognitionService {
    store: Arc<dyn EncodingStore>,
    cache: Arc<EncodingCache>,
    pool: Arc<WorkerPool>,
    matcher: Arc<dyn Matcher>,
    notifier: Arc<dyn AttendanceNotifier>,
    batch: BatchOrchestrator,
}

impl RecognitionService {
    pub fn new(
        store: Arc<dyn EncodingStore>,
        cache: Arc<EncodingCache>,
        pool: Arc<WorkerPool>,
        matcher: Arc<dyn Matcher>,
        notifier: Arc<dyn AttendanceNotifier>,
    ) -> Self {
        let batch = BatchOrchestrator::new(Arc::clone(&pool), Arc::clone(&matcher), Arc::clone(&notifier));
        Self {
            store,
            cache,
            pool,
            matcher,
            notifier,
            batch,
        }
    }

    /// Open the configured database and start the worker pool.
    pub fn from_config(config: &Config) -> Result<Self, BootstrapError> {
        let store = Arc::new(SqliteStore::open(&config.db_path)?);
        Self::with_sqlite(config, store)
    }

    /// Build on an already-open store, which also records attendance unless
    /// `record_attendance` is off.
    pub fn with_sqlite(config: &Config, store: Arc<SqliteStore>) -> Result<Self, BootstrapError> {
        let pool = WorkerPool::spawn(config.workers, config.job_timeout(), || config.build_generator())?;
        let notifier: Arc<dyn AttendanceNotifier> = if config.record_attendance {
            store.clone()
        } else {
            Arc::new(LogNotifier)
        };
        let cache = Arc::new(EncodingCache::new(store.clone(), config.cache_ttl()));
        Ok(Self::new(
            store,
            cache,
            Arc::new(pool),
            Arc::new(config.matcher()),
            notifier,
        ))
    }

    /// The cached gallery; rebuilds run on the blocking pool.
    pub async fn gallery(&self) -> Result<Arc<Gallery>, RecognitionError> {
        let cache = Arc::clone(&self.cache);
        blocking(move || Ok(cache.load()?)).await
    }

    /// Identify the person in one probe image and record their attendance.
    ///
    /// The probe is decoded and encoded before the gallery is checked, so an
    /// unusable image is reported as such even when nobody is enrolled.
    pub async fn recognize_one(
        &self,
        image: Vec<u8>,
        ctx: CaptureContext,
    ) -> Result<MatchResult, RecognitionError> {
        let gallery = self.gallery().await?;
        let enrolled = gallery.len();

        let recognized = self
            .pool
            .recognize(image, gallery, Arc::clone(&self.matcher))
            .await?;
        if enrolled == 0 {
            return Err(RecognitionError::EmptyGallery);
        }
        let Some(top) = best_match(&recognized.matches).cloned() else {
            let best_distance = recognized.matches.first().map(|m| m.distance);
            tracing::debug!(?best_distance, "no confident match");
            return Err(RecognitionError::NoConfidentMatch { best_distance });
        };

        let event = AttendanceEvent::from_match(&top, &ctx);
        if let Err(source) = notify_attendance(&self.notifier, event).await {
            tracing::warn!(person_id = top.person_id, error = %source, "attendance write failed");
            return Err(RecognitionError::NotifierFailure {
                source,
                matched: Box::new(top),
            });
        }

        tracing::info!(
            record_id = top.record_id,
            person_id = top.person_id,
            distance = top.distance,
            confidence = top.confidence,
            "face recognized"
        );
        Ok(top)
    }

    /// Recognize many probes concurrently; per-item failures stay in the report.
    pub async fn recognize_batch(
        &self,
        images: Vec<ProbeImage>,
        ctx: CaptureContext,
    ) -> Result<BatchReport, RecognitionError> {
        let gallery = self.gallery().await?;
        if gallery.is_empty() {
            return Err(RecognitionError::EmptyGallery);
        }
        Ok(self.batch.run(images, gallery, ctx).await)
    }

    pub fn clear_cache(&self) {
        self.cache.invalidate();
    }

    /// Rebuild the cache now; returns the number of encodings loaded.
    pub async fn reload_cache(&self) -> Result<usize, RecognitionError> {
        let cache = Arc::clone(&self.cache);
        blocking(move || Ok(cache.reload()?)).await
    }

    /// (Re)generate and persist the encoding of one face record.
    pub async fn enroll(&self, record_id: RecordId) -> Result<Encoding, RecognitionError> {
        let encoding = self.encode_record(record_id).await?;
        self.cache.invalidate();
        Ok(encoding)
    }

    /// Regenerate the listed records, or every record lacking an encoding.
    /// A failing record is counted and skipped.
    pub async fn regenerate(
        &self,
        record_ids: Option<Vec<RecordId>>,
    ) -> Result<RegenerateReport, RecognitionError> {
        let ids = match record_ids {
            Some(ids) => ids,
            None => {
                let store = Arc::clone(&self.store);
                blocking(move || Ok(store.list_records_missing_encoding()?)).await?
            }
        };

        let mut report = RegenerateReport {
            total: ids.len(),
            success: 0,
            failed: 0,
        };
        for id in ids {
            match self.encode_record(id).await {
                Ok(_) => report.success += 1,
                Err(error) => {
                    tracing::warn!(record_id = id, %error, "encoding regeneration failed");
                    report.failed += 1;
                }
            }
        }

        if report.success > 0 {
            self.cache.invalidate();
        }
        tracing::info!(total = report.total, success = report.success, failed = report.failed, "regeneration finished");
        Ok(report)
    }

    /// Candidate regions and their validation outcome for one image.
    pub async fn inspect(&self, image: Vec<u8>) -> Result<Vec<RegionVerdict>, RecognitionError> {
        self.pool.inspect(image).await
    }

    /// Entry count of the current cache snapshot, if one is loaded.
    pub fn cached_encodings(&self) -> Option<usize> {
        self.cache.cached_len()
    }

    pub fn strategy(&self) -> &'static str {
        self.pool.strategy_name()
    }

    pub fn workers(&self) -> usize {
        self.pool.size()
    }

    async fn encode_record(&self, record_id: RecordId) -> Result<Encoding, RecognitionError> {
        let store = Arc::clone(&self.store);
        let record = blocking(move || Ok(store.get_record(record_id)?))
            .await?
            .ok_or(RecognitionError::UnknownRecord(record_id))?;

        let encoding = self.pool.enroll(record.images).await?;

        let store = Arc::clone(&self.store);
        let blob = encoding.to_bytes();
        blocking(move || Ok(store.save_encoding(record_id, &blob)?)).await?;
        tracing::info!(record_id, person_id = record.person_id, "face encoding saved");
        Ok(encoding)
    }
}

async fn blocking<T, F>(f: F) -> Result<T, RecognitionError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RecognitionError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RecognitionError::Internal(format!("blocking task failed: {e}")))?
}
