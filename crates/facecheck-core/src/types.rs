use crate::error::RecognitionError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Identifier of a face record (one enrollment: up to three images + encoding).
pub type RecordId = i64;
/// Identifier of the enrolled person owning a face record.
pub type PersonId = i64;

/// Number of values in every face encoding.
pub const ENCODING_DIM: usize = 128;

/// Tag prefixed to every persisted encoding blob.
pub const ENCODING_FORMAT_TAG: [u8; 4] = *b"FCE1";

/// Size of a persisted encoding blob: tag + 128 little-endian f32.
pub const ENCODING_BLOB_LEN: usize = ENCODING_FORMAT_TAG.len() + ENCODING_DIM * 4;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodingError {
    #[error("encoding must have {ENCODING_DIM} values, got {0}")]
    WrongLength(usize),
    #[error("encoding blob is {0} bytes, expected {ENCODING_BLOB_LEN}")]
    BlobLength(usize),
    #[error("unknown encoding format tag {0:?}")]
    UnknownTag([u8; 4]),
    #[error("encoding contains a non-finite value at index {0}")]
    NonFinite(usize),
}

/// Face region found by a detector, in source-image pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl Region {
    /// Intersection-over-Union with another region.
    pub fn iou(&self, other: &Region) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.width * self.height + other.width * other.height - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Fixed-length face descriptor.
///
/// Always exactly [`ENCODING_DIM`] values; every constructor enforces it.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoding {
    values: Vec<f32>,
}

impl Encoding {
    pub fn new(values: Vec<f32>) -> Result<Self, EncodingError> {
        if values.len() != ENCODING_DIM {
            return Err(EncodingError::WrongLength(values.len()));
        }
        Ok(Self { values })
    }

    /// Build an encoding scaled to unit L2 norm. A zero vector is kept as-is.
    pub fn normalized(mut values: Vec<f32>) -> Result<Self, EncodingError> {
        l2_normalize(&mut values);
        Self::new(values)
    }

    /// Zero-pad or truncate to [`ENCODING_DIM`], then L2-normalize.
    pub fn padded_normalized(mut values: Vec<f32>) -> Self {
        values.resize(ENCODING_DIM, 0.0);
        l2_normalize(&mut values);
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Euclidean (L2) distance between two encodings.
    pub fn euclidean_distance(&self, other: &Encoding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Element-wise mean of several encodings. `None` for an empty slice.
    pub fn mean(encodings: &[Encoding]) -> Option<Encoding> {
        let first = encodings.first()?;
        if encodings.len() == 1 {
            return Some(first.clone());
        }
        let mut sum = vec![0.0f32; ENCODING_DIM];
        for enc in encodings {
            for (acc, v) in sum.iter_mut().zip(enc.values.iter()) {
                *acc += v;
            }
        }
        let n = encodings.len() as f32;
        Some(Encoding {
            values: sum.into_iter().map(|v| v / n).collect(),
        })
    }

    /// Serialize to the versioned blob layout: `FCE1` + 128 little-endian f32.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENCODING_BLOB_LEN);
        out.extend_from_slice(&ENCODING_FORMAT_TAG);
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Parse a persisted blob, rejecting wrong sizes, unknown tags and NaN/inf.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        if bytes.len() != ENCODING_BLOB_LEN {
            return Err(EncodingError::BlobLength(bytes.len()));
        }
        let (tag, body) = bytes.split_at(ENCODING_FORMAT_TAG.len());
        if tag != ENCODING_FORMAT_TAG {
            let mut found = [0u8; 4];
            found.copy_from_slice(tag);
            return Err(EncodingError::UnknownTag(found));
        }

        let mut values = Vec::with_capacity(ENCODING_DIM);
        for (i, chunk) in body.chunks_exact(4).enumerate() {
            let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if !v.is_finite() {
                return Err(EncodingError::NonFinite(i));
            }
            values.push(v);
        }
        Self::new(values)
    }
}

fn l2_normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
}

/// An enrolled face record as held by the encoding store.
#[derive(Debug, Clone)]
pub struct FaceRecord {
    pub id: RecordId,
    pub person_id: PersonId,
    /// Raw source images (1–3), in upload order.
    pub images: Vec<Vec<u8>>,
    /// Persisted encoding blob, if one has been generated.
    pub encoding: Option<Vec<u8>>,
}

/// A persisted encoding row, as listed for a cache rebuild.
#[derive(Debug, Clone)]
pub struct StoredEncoding {
    pub record_id: RecordId,
    pub person_id: PersonId,
    pub blob: Vec<u8>,
}

/// One gallery entry held by the encoding cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub record_id: RecordId,
    pub person_id: PersonId,
    pub display_name: String,
    pub encoding: Encoding,
}

/// Cached gallery, keyed by record id.
pub type Gallery = HashMap<RecordId, CacheEntry>;

/// Outcome of comparing a probe against one gallery entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub record_id: RecordId,
    pub person_id: PersonId,
    pub display_name: String,
    pub distance: f32,
    pub is_match: bool,
    /// Normalized inverse distance in [0, 1]; 0 for non-matches.
    pub confidence: f32,
}

/// Per-image outcome of a batch recognition run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResult {
    pub index: usize,
    pub filename: String,
    pub success: bool,
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub top_match: Option<MatchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Nearest gallery distance when no candidate cleared the match gate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_distance: Option<f32>,
}

impl BatchItemResult {
    pub fn matched(index: usize, filename: String, top: MatchResult) -> Self {
        Self {
            index,
            filename,
            success: true,
            top_match: Some(top),
            error: None,
            best_distance: None,
        }
    }

    pub fn failed(index: usize, filename: String, error: impl Into<String>) -> Self {
        Self {
            index,
            filename,
            success: false,
            top_match: None,
            error: Some(error.into()),
            best_distance: None,
        }
    }

    /// An item whose probe encoded fine but matched nobody confidently.
    pub fn unmatched(index: usize, filename: String, best_distance: Option<f32>) -> Self {
        Self {
            best_distance,
            ..Self::failed(
                index,
                filename,
                RecognitionError::NoConfidentMatch { best_distance }.to_string(),
            )
        }
    }
}
