//! facecheck-core — face encoding, gallery cache and matching engine.
//!
//! Probe images are decoded and encoded on a fixed pool of worker threads,
//! compared against a TTL-cached gallery of enrolled encodings, and
//! confident matches are forwarded to an attendance notifier.

pub mod alignment;
pub mod batch;
pub mod cache;
pub mod codec;
pub mod config;
pub mod detector;
pub mod encoder;
pub mod error;
pub mod matcher;
pub mod notifier;
pub mod pool;
pub mod recognizer;
pub mod service;
pub mod store;
pub mod types;

pub use batch::{BatchOrchestrator, BatchReport, ProbeImage};
pub use cache::EncodingCache;
pub use config::{Config, EncoderKind};
pub use encoder::{EncoderStrategy, EncodingGenerator, RegionThresholds};
pub use error::RecognitionError;
pub use matcher::{best_match, EuclideanMatcher, Matcher};
pub use notifier::{AttendanceEvent, AttendanceNotifier, CaptureContext, CaptureMethod, LogNotifier};
pub use pool::WorkerPool;
pub use service::{RecognitionService, RegenerateReport};
pub use store::{EncodingStore, SqliteStore};
pub use types::{BatchItemResult, Encoding, Gallery, MatchResult, Region};
