use crate::cache::CacheError;
use crate::codec::DecodeError;
use crate::encoder::EncoderError;
use crate::notifier::NotifierError;
use crate::store::StoreError;
use crate::types::{EncodingError, MatchResult, RecordId};
use std::time::Duration;
use thiserror::Error;

/// Failure of a recognition or enrollment request.
#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("Invalid image: {0}")]
    Decode(#[from] DecodeError),
    #[error("No face detected")]
    NoFaceDetected,
    #[error("No face detected: processing exceeded {0:?}")]
    DetectorTimeout(Duration),
    #[error("Corrupt face encoding: {0}")]
    EncodingCorrupt(#[from] EncodingError),
    #[error("No face encodings available")]
    EmptyGallery,
    #[error("No confident match")]
    NoConfidentMatch { best_distance: Option<f32> },
    #[error("Match found but attendance could not be recorded: {source}")]
    NotifierFailure {
        source: NotifierError,
        matched: Box<MatchResult>,
    },
    #[error("Face record {0} not found")]
    UnknownRecord(RecordId),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Cache(#[from] CacheError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<EncoderError> for RecognitionError {
    fn from(err: EncoderError) -> Self {
        match err {
            EncoderError::NoFaceDetected => Self::NoFaceDetected,
            other => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_error_mapping() {
        assert!(matches!(
            RecognitionError::from(EncoderError::NoFaceDetected),
            RecognitionError::NoFaceDetected
        ));
        let inference = EncoderError::Recognizer(crate::recognizer::RecognizerError::InferenceFailed(
            "bad shape".into(),
        ));
        assert!(matches!(RecognitionError::from(inference), RecognitionError::Internal(_)));
    }

    #[test]
    fn test_messages() {
        assert_eq!(RecognitionError::NoFaceDetected.to_string(), "No face detected");
        assert_eq!(
            RecognitionError::NoConfidentMatch { best_distance: Some(0.3) }.to_string(),
            "No confident match"
        );
    }
}
