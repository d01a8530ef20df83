use facecheck_core::MatchResult;
use facecheck_core::types::RecordId;
use serde::{Deserialize, Serialize};

/// Body of `POST /cache`.
#[derive(Debug, Deserialize)]
pub struct CacheRequest {
    pub action: String,
}

/// Body of `POST /encodings/regenerate`. No ids means every record lacking an encoding.
#[derive(Debug, Default, Deserialize)]
pub struct RegenerateRequest {
    #[serde(default)]
    pub record_ids: Option<Vec<RecordId>>,
}

#[derive(Debug, Serialize)]
pub struct RecognizeResponse {
    pub success: bool,
    #[serde(rename = "match")]
    pub top_match: MatchResult,
}

#[derive(Debug, Serialize)]
pub struct RegenerateResponse {
    pub success: bool,
    pub total: usize,
    pub success_count: usize,
    pub failed: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub strategy: &'static str,
    pub workers: usize,
    /// Entries in the loaded snapshot; 0 when nothing is cached.
    pub cached_encodings: usize,
}
