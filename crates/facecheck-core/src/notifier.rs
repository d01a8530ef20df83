//! Attendance side effect fired on a confident match.

use crate::types::{MatchResult, PersonId, RecordId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum NotifierError {
    #[error("attendance write failed: {0}")]
    Write(String),
    #[error("attendance task aborted: {0}")]
    Aborted(String),
}

/// How an attendance event was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaptureMethod {
    Face,
    Form,
}

impl CaptureMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Face => "FACE",
            Self::Form => "FORM",
        }
    }
}

/// Request-scoped context forwarded with every recognition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureContext {
    /// Service or event the check-in is recorded against.
    pub service_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEvent {
    pub id: Uuid,
    pub person_id: PersonId,
    pub service_id: Option<i64>,
    pub capture_method: CaptureMethod,
    pub checked_in_at: DateTime<Utc>,
    pub record_id: Option<RecordId>,
    pub confidence: Option<f32>,
}

impl AttendanceEvent {
    pub fn from_match(matched: &MatchResult, ctx: &CaptureContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            person_id: matched.person_id,
            service_id: ctx.service_id,
            capture_method: CaptureMethod::Face,
            checked_in_at: Utc::now(),
            record_id: Some(matched.record_id),
            confidence: Some(matched.confidence),
        }
    }
}

/// Receives attendance events. Implementations may block.
pub trait AttendanceNotifier: Send + Sync {
    fn notify(&self, event: &AttendanceEvent) -> Result<(), NotifierError>;
}

/// Logs events without persisting them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl AttendanceNotifier for LogNotifier {
    fn notify(&self, event: &AttendanceEvent) -> Result<(), NotifierError> {
        tracing::info!(
            event_id = %event.id,
            person_id = event.person_id,
            service_id = ?event.service_id,
            method = event.capture_method.as_str(),
            "attendance"
        );
        Ok(())
    }
}

/// Run a (possibly blocking) notifier off the async worker threads.
pub async fn notify_attendance(
    notifier: &Arc<dyn AttendanceNotifier>,
    event: AttendanceEvent,
) -> Result<(), NotifierError> {
    let notifier = Arc::clone(notifier);
    tokio::task::spawn_blocking(move || notifier.notify(&event))
        .await
        .map_err(|e| NotifierError::Aborted(e.to_string()))?
}
