use std::sync::Arc;

use facecheck_core::RecognitionService;

/// Shared state handed to every handler.
pub struct AppState {
    pub service: RecognitionService,
}

impl AppState {
    pub fn new(service: RecognitionService) -> Arc<Self> {
        Arc::new(AppState { service })
    }
}
