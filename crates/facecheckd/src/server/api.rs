use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, State};
use axum::Json;
use facecheck_core::{BatchReport, CaptureContext, ProbeImage};
use serde_json::{json, Value};

use super::error::{ApiError, Result};
use super::state::AppState;
use super::types::*;

/// Uploaded files for one field name plus the optional `serviceId`.
struct UploadForm {
    files: Vec<ProbeImage>,
    ctx: CaptureContext,
}

async fn read_form(
    multipart: std::result::Result<Multipart, MultipartRejection>,
    file_field: &str,
) -> Result<UploadForm> {
    let mut multipart = multipart?;
    let mut form = UploadForm {
        files: Vec::new(),
        ctx: CaptureContext::default(),
    };

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("serviceId") => {
                let raw = field.text().await?;
                let raw = raw.trim();
                if !raw.is_empty() {
                    let id = raw
                        .parse()
                        .map_err(|_| ApiError::BadRequest(format!("Invalid serviceId: {raw}")))?;
                    form.ctx.service_id = Some(id);
                }
            }
            Some(name) if name == file_field => {
                let filename = field
                    .file_name()
                    .map(str::to_owned)
                    .unwrap_or_else(|| format!("image-{}", form.files.len()));
                let bytes = field.bytes().await?;
                form.files.push(ProbeImage {
                    filename,
                    bytes: bytes.to_vec(),
                });
            }
            _ => {}
        }
    }
    Ok(form)
}

/// Recognize one face and check the person in.
pub async fn recognize_handler(
    State(state): State<Arc<AppState>>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<RecognizeResponse>> {
    let form = read_form(multipart, "image").await?;
    let Some(image) = form.files.into_iter().next() else {
        return Err(ApiError::BadRequest("Image file is required".into()));
    };

    let start = Instant::now();
    let top_match = state.service.recognize_one(image.bytes, form.ctx).await?;
    tracing::debug!(elapsed_ms = start.elapsed().as_millis() as u64, "recognize handled");

    Ok(Json(RecognizeResponse {
        success: true,
        top_match,
    }))
}

/// Recognize every uploaded image; per-image failures are reported inline.
pub async fn batch_recognize_handler(
    State(state): State<Arc<AppState>>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<BatchReport>> {
    let form = read_form(multipart, "images").await?;
    if form.files.is_empty() {
        return Err(ApiError::BadRequest("No images provided".into()));
    }

    let count = form.files.len();
    let start = Instant::now();
    let report = state.service.recognize_batch(form.files, form.ctx).await?;
    tracing::info!(
        images = count,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "batch recognize handled"
    );
    Ok(Json(report))
}

/// Clear or reload the gallery cache.
pub async fn cache_handler(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<CacheRequest>, JsonRejection>,
) -> Result<Json<Value>> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    match request.action.as_str() {
        "clear" => {
            state.service.clear_cache();
            Ok(Json(json!({
                "success": true,
                "message": "Face encoding cache cleared",
            })))
        }
        "reload" => {
            let loaded = state.service.reload_cache().await?;
            Ok(Json(json!({
                "success": true,
                "encodings_loaded": loaded,
            })))
        }
        other => Err(ApiError::BadRequest(format!(
            "Invalid action: {other}. Use 'clear' or 'reload'"
        ))),
    }
}

/// Regenerate stored encodings. An empty body targets records without one.
pub async fn regenerate_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<RegenerateResponse>> {
    let request: RegenerateRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RegenerateRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {e}")))?
    };

    let report = state.service.regenerate(request.record_ids).await?;
    Ok(Json(RegenerateResponse {
        success: true,
        total: report.total,
        success_count: report.success,
        failed: report.failed,
    }))
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        strategy: state.service.strategy(),
        workers: state.service.workers(),
        cached_encodings: state.service.cached_encodings().unwrap_or(0),
    })
}
