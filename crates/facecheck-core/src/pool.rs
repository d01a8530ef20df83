//! Fixed set of OS threads that own the encoders.
//!
//! Decoding and encoding are CPU-bound and the ONNX sessions are stateful, so
//! every worker holds its own [`EncodingGenerator`] and pulls jobs from a
//! shared queue. Callers wait for a worker to pick the job up, then await a
//! one-shot reply bounded by the job timeout.

use crate::codec;
use crate::encoder::{EncoderError, EncodingGenerator, RegionVerdict};
use crate::error::RecognitionError;
use crate::matcher::Matcher;
use crate::types::{Encoding, Gallery, MatchResult, Region};
use crossbeam_channel::{Receiver, Sender};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("worker pool needs at least one worker")]
    NoWorkers,
    #[error("encoder setup failed: {0}")]
    Encoder(#[from] EncoderError),
    #[error("cannot spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Output of a recognize job.
#[derive(Debug, Clone)]
pub struct Recognized {
    /// All gallery entries, nearest first.
    pub matches: Vec<MatchResult>,
    /// Face regions accepted by the locator (empty for the fallback strategy).
    pub regions: Vec<Region>,
}

type Reply<T> = oneshot::Sender<Result<T, RecognitionError>>;

/// A job plus the signal a worker fires when it starts on it.
struct Queued {
    job: Job,
    started: oneshot::Sender<()>,
}

enum Job {
    Recognize {
        image: Vec<u8>,
        gallery: Arc<Gallery>,
        matcher: Arc<dyn Matcher>,
        reply: Reply<Recognized>,
    },
    Enroll {
        images: Vec<Vec<u8>>,
        reply: Reply<Encoding>,
    },
    Inspect {
        image: Vec<u8>,
        reply: Reply<Vec<RegionVerdict>>,
    },
}

pub struct WorkerPool {
    tx: Option<Sender<Queued>>,
    workers: Vec<JoinHandle<()>>,
    job_timeout: Duration,
    strategy: &'static str,
}

impl WorkerPool {
    /// Build `size` encoders with `factory`, then start one thread per encoder.
    ///
    /// Every encoder is constructed before any thread starts, so a missing
    /// model fails the whole pool up front.
    pub fn spawn<F>(size: usize, job_timeout: Duration, mut factory: F) -> Result<Self, PoolError>
    where
        F: FnMut() -> Result<EncodingGenerator, EncoderError>,
    {
        if size == 0 {
            return Err(PoolError::NoWorkers);
        }
        let generators = (0..size)
            .map(|_| factory())
            .collect::<Result<Vec<_>, _>>()?;
        let strategy = generators[0].strategy_name();

        let (tx, rx) = crossbeam_channel::unbounded::<Queued>();
        let mut workers = Vec::with_capacity(size);
        for (index, generator) in generators.into_iter().enumerate() {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("facecheck-worker-{index}"))
                .spawn(move || worker_loop(index, rx, generator))?;
            workers.push(handle);
        }

        tracing::info!(workers = size, strategy, timeout_ms = job_timeout.as_millis() as u64, "worker pool started");
        Ok(Self {
            tx: Some(tx),
            workers,
            job_timeout,
            strategy,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy
    }

    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }

    /// Decode, encode and compare one probe image against `gallery`.
    pub async fn recognize(
        &self,
        image: Vec<u8>,
        gallery: Arc<Gallery>,
        matcher: Arc<dyn Matcher>,
    ) -> Result<Recognized, RecognitionError> {
        self.submit(self.job_timeout, |reply| Job::Recognize {
            image,
            gallery,
            matcher,
            reply,
        })
        .await
    }

    /// Produce one pooled encoding from a record's source images.
    pub async fn enroll(&self, images: Vec<Vec<u8>>) -> Result<Encoding, RecognitionError> {
        let timeout = self.job_timeout * images.len().max(1) as u32;
        self.submit(timeout, |reply| Job::Enroll { images, reply }).await
    }

    /// Report every candidate region and its validation outcome.
    pub async fn inspect(&self, image: Vec<u8>) -> Result<Vec<RegionVerdict>, RecognitionError> {
        self.submit(self.job_timeout, |reply| Job::Inspect { image, reply })
            .await
    }

    /// Queue a job. Time spent waiting for a free worker is not counted
    /// against `timeout`; only the job's own processing is.
    async fn submit<T>(
        &self,
        timeout: Duration,
        job: impl FnOnce(Reply<T>) -> Job,
    ) -> Result<T, RecognitionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (started_tx, started_rx) = oneshot::channel();
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| RecognitionError::Internal("worker pool is shut down".into()))?;
        tx.send(Queued {
            job: job(reply_tx),
            started: started_tx,
        })
        .map_err(|_| RecognitionError::Internal("worker pool is shut down".into()))?;

        if started_rx.await.is_err() {
            return Err(RecognitionError::Internal("worker dropped the job".into()));
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RecognitionError::Internal("worker dropped the job".into())),
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "job timed out");
                Err(RecognitionError::DetectorTimeout(timeout))
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queue ends every worker loop once it drains.
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().map(str::to_owned);
            if handle.join().is_err() {
                tracing::warn!(worker = ?name, "worker thread panicked during shutdown");
            }
        }
        tracing::debug!("worker pool stopped");
    }
}

fn worker_loop(index: usize, rx: Receiver<Queued>, mut generator: EncodingGenerator) {
    tracing::debug!(worker = index, "worker started");
    while let Ok(Queued { job, started }) = rx.recv() {
        match job {
            Job::Recognize {
                image,
                gallery,
                matcher,
                reply,
            } => {
                if abandoned(&reply, index) {
                    continue;
                }
                let _ = started.send(());
                let result = contained(index, || {
                    let grid = codec::decode(&image)?;
                    let (probe, regions) = generator.generate(&grid)?;
                    Ok(Recognized {
                        matches: matcher.compare(Some(&probe), &gallery),
                        regions,
                    })
                });
                let _ = reply.send(result);
            }
            Job::Enroll { images, reply } => {
                if abandoned(&reply, index) {
                    continue;
                }
                let _ = started.send(());
                let result = contained(index, || Ok(generator.enroll(&images)?));
                let _ = reply.send(result);
            }
            Job::Inspect { image, reply } => {
                if abandoned(&reply, index) {
                    continue;
                }
                let _ = started.send(());
                let result = contained(index, || {
                    let grid = codec::decode(&image)?;
                    Ok(generator.inspect(&grid)?)
                });
                let _ = reply.send(result);
            }
        }
    }
    tracing::debug!(worker = index, "worker exiting");
}

fn abandoned<T>(reply: &Reply<T>, worker: usize) -> bool {
    let closed = reply.is_closed();
    if closed {
        tracing::debug!(worker, "requester gone; skipping job");
    }
    closed
}

/// Run one job, turning a panic into an error for that job alone.
fn contained<T>(
    worker: usize,
    job: impl FnOnce() -> Result<T, RecognitionError>,
) -> Result<T, RecognitionError> {
    panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        tracing::warn!(worker, panic = %message, "job panicked");
        Err(RecognitionError::Internal(format!("processing error: {message}")))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
