//! Concurrent recognition of many probe images with per-item isolation.

use crate::error::RecognitionError;
use crate::matcher::{best_match, Matcher};
use crate::notifier::{notify_attendance, AttendanceEvent, AttendanceNotifier, CaptureContext};
use crate::pool::WorkerPool;
use crate::types::{BatchItemResult, Gallery};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinSet;

/// One uploaded probe.
#[derive(Debug, Clone)]
pub struct ProbeImage {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub success: bool,
    pub total_images: usize,
    /// Items with a confident match.
    pub processed: usize,
    pub failed: usize,
    pub results: Vec<BatchItemResult>,
}

impl BatchReport {
    fn from_results(results: Vec<BatchItemResult>) -> Self {
        let processed = results.iter().filter(|r| r.success).count();
        Self {
            success: true,
            total_images: results.len(),
            processed,
            failed: results.len() - processed,
            results,
        }
    }
}

pub struct BatchOrchestrator {
    pool: Arc<WorkerPool>,
    matcher: Arc<dyn Matcher>,
    notifier: Arc<dyn AttendanceNotifier>,
}

impl BatchOrchestrator {
    pub fn new(
        pool: Arc<WorkerPool>,
        matcher: Arc<dyn Matcher>,
        notifier: Arc<dyn AttendanceNotifier>,
    ) -> Self {
        Self {
            pool,
            matcher,
            notifier,
        }
    }

    /// Recognize every image; results come back in submission order.
    pub async fn run(
        &self,
        images: Vec<ProbeImage>,
        gallery: Arc<Gallery>,
        ctx: CaptureContext,
    ) -> BatchReport {
        let filenames: Vec<String> = images.iter().map(|i| i.filename.clone()).collect();
        let mut tasks = JoinSet::new();

        for (index, image) in images.into_iter().enumerate() {
            let pool = Arc::clone(&self.pool);
            let matcher = Arc::clone(&self.matcher);
            let notifier = Arc::clone(&self.notifier);
            let gallery = Arc::clone(&gallery);
            tasks.spawn(async move {
                let item = evaluate(&pool, &matcher, &notifier, index, image, gallery, ctx).await;
                (index, item)
            });
        }

        let mut slots: Vec<Option<BatchItemResult>> = vec![None; filenames.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, item)) => slots[index] = Some(item),
                Err(error) => tracing::warn!(%error, "batch item task failed"),
            }
        }

        let results = slots
            .into_iter()
            .zip(filenames)
            .enumerate()
            .map(|(index, (slot, filename))| {
                slot.unwrap_or_else(|| BatchItemResult::failed(index, filename, "processing error"))
            })
            .collect::<Vec<_>>();

        let report = BatchReport::from_results(results);
        tracing::info!(
            total = report.total_images,
            processed = report.processed,
            failed = report.failed,
            "batch recognition finished"
        );
        report
    }
}

async fn evaluate(
    pool: &WorkerPool,
    matcher: &Arc<dyn Matcher>,
    notifier: &Arc<dyn AttendanceNotifier>,
    index: usize,
    image: ProbeImage,
    gallery: Arc<Gallery>,
    ctx: CaptureContext,
) -> BatchItemResult {
    let ProbeImage { filename, bytes } = image;

    let recognized = match pool.recognize(bytes, gallery, Arc::clone(matcher)).await {
        Ok(r) => r,
        Err(error) => {
            tracing::debug!(index, %filename, %error, "batch item failed");
            return BatchItemResult::failed(index, filename, error.to_string());
        }
    };

    let Some(top) = best_match(&recognized.matches).cloned() else {
        let best_distance = recognized.matches.first().map(|m| m.distance);
        tracing::debug!(index, %filename, ?best_distance, "no confident match");
        return BatchItemResult::unmatched(index, filename, best_distance);
    };

    let event = AttendanceEvent::from_match(&top, &ctx);
    match notify_attendance(notifier, event).await {
        Ok(()) => BatchItemResult::matched(index, filename, top),
        Err(source) => {
            tracing::warn!(index, person_id = top.person_id, error = %source, "attendance write failed");
            let error = RecognitionError::NotifierFailure {
                source,
                matched: Box::new(top.clone()),
            };
            BatchItemResult {
                index,
                filename,
                success: false,
                top_match: Some(top),
                error: Some(error.to_string()),
                best_distance: None,
            }
        }
    }
}
