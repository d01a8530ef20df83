use crate::encoder::{EncoderError, EncoderStrategy, EncodingGenerator, RegionThresholds};
use crate::matcher::EuclideanMatcher;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const SCRFD_MODEL: &str = "det_10g.onnx";
const DESCRIPTOR_MODEL: &str = "face_recognition_sface_2021dec.onnx";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Which encoder every worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    /// SCRFD locator plus descriptor network. Requires the model files.
    Detector,
    /// Grid-statistics descriptor over the whole image.
    Fallback,
}

impl FromStr for EncoderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "detector" => Ok(Self::Detector),
            "fallback" => Ok(Self::Fallback),
            other => Err(format!("unknown encoder strategy {other:?}")),
        }
    }
}

/// Service configuration.
///
/// Defaults, then an optional TOML file named by `FACECHECK_CONFIG`, then
/// `FACECHECK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listen address (default: 127.0.0.1:8080).
    pub bind_addr: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub strategy: EncoderKind,
    /// Number of encoder worker threads.
    pub workers: usize,
    /// Upper bound on a single recognize job, in seconds.
    pub job_timeout_secs: u64,
    /// Gallery cache lifetime, in seconds.
    pub cache_ttl_secs: u64,
    /// Maximum Euclidean distance for a match.
    pub distance_threshold: f32,
    /// Minimum derived confidence for a match.
    pub min_confidence: f32,
    pub min_face_size: f32,
    pub min_intensity_variance: f32,
    pub min_red_ratio: f32,
    /// Persist attendance rows on a confident match (otherwise log only).
    pub record_attendance: bool,
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facecheck")
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        let thresholds = RegionThresholds::default();
        let matcher = EuclideanMatcher::default();
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            db_path: data_dir.join("facecheck.db"),
            model_dir: data_dir.join("models"),
            strategy: EncoderKind::Fallback,
            workers: 4,
            job_timeout_secs: 10,
            cache_ttl_secs: 3600,
            distance_threshold: matcher.distance_threshold,
            min_confidence: matcher.min_confidence,
            min_face_size: thresholds.min_face_size,
            min_intensity_variance: thresholds.min_intensity_variance,
            min_red_ratio: thresholds.min_red_ratio,
            record_attendance: true,
        }
    }
}

impl Config {
    /// Load configuration from `FACECHECK_*` environment variables, layered
    /// over the file in `FACECHECK_CONFIG` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base = match std::env::var_os("FACECHECK_CONFIG") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        Ok(base.with_overrides(|key| std::env::var(key).ok()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `FACECHECK_*` overrides from `lookup`. Unparsable values are
    /// logged and ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("FACECHECK_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("FACECHECK_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACECHECK_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        override_parsed(&lookup, "FACECHECK_STRATEGY", &mut self.strategy);
        override_parsed(&lookup, "FACECHECK_WORKERS", &mut self.workers);
        override_parsed(&lookup, "FACECHECK_JOB_TIMEOUT_SECS", &mut self.job_timeout_secs);
        override_parsed(&lookup, "FACECHECK_CACHE_TTL_SECS", &mut self.cache_ttl_secs);
        override_parsed(&lookup, "FACECHECK_DISTANCE_THRESHOLD", &mut self.distance_threshold);
        override_parsed(&lookup, "FACECHECK_MIN_CONFIDENCE", &mut self.min_confidence);
        override_parsed(&lookup, "FACECHECK_MIN_FACE_SIZE", &mut self.min_face_size);
        override_parsed(&lookup, "FACECHECK_MIN_INTENSITY_VARIANCE", &mut self.min_intensity_variance);
        override_parsed(&lookup, "FACECHECK_MIN_RED_RATIO", &mut self.min_red_ratio);
        if let Some(v) = lookup("FACECHECK_RECORD_ATTENDANCE") {
            self.record_attendance = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        self
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join(SCRFD_MODEL)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the 128-d descriptor model.
    pub fn descriptor_model_path(&self) -> String {
        self.model_dir
            .join(DESCRIPTOR_MODEL)
            .to_string_lossy()
            .into_owned()
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn region_thresholds(&self) -> RegionThresholds {
        RegionThresholds {
            min_face_size: self.min_face_size,
            min_intensity_variance: self.min_intensity_variance,
            min_red_ratio: self.min_red_ratio,
        }
    }

    pub fn matcher(&self) -> EuclideanMatcher {
        EuclideanMatcher {
            distance_threshold: self.distance_threshold,
            min_confidence: self.min_confidence,
        }
    }

    /// Build one encoder for the configured strategy, loading models from disk.
    pub fn build_generator(&self) -> Result<EncodingGenerator, EncoderError> {
        let strategy = match self.strategy {
            EncoderKind::Detector => EncoderStrategy::detector_from_models(
                &self.scrfd_model_path(),
                &self.descriptor_model_path(),
            )?,
            EncoderKind::Fallback => EncoderStrategy::FeatureFallback,
        };
        Ok(EncodingGenerator::new(strategy, self.region_thresholds()))
    }
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, field: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *field = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable config override"),
    }
}
