//! 128-d face descriptor model via ONNX Runtime.
//!
//! Runs an SFace-style network on a 112×112 RGB crop (landmark-aligned when
//! the locator supplies landmarks) and L2-normalizes the output.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::codec::PixelGrid;
use crate::encoder::DescriptorExtractor;
use crate::types::{Encoding, Region, ENCODING_DIM};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// SFace consumes raw 0–255 RGB.
const DESCRIPTOR_MEAN: f32 = 0.0;
const DESCRIPTOR_STD: f32 = 1.0;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Descriptor network producing [`ENCODING_DIM`]-value encodings.
pub struct DescriptorModel {
    session: Session,
}

impl DescriptorModel {
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded descriptor model"
        );

        Ok(Self { session })
    }

    /// Packed 112×112 RGB crop → NCHW float tensor.
    fn preprocess(crop: &[u8]) -> Array4<f32> {
        let mut tensor = Array4::<f32>::zeros((1, 3, ALIGNED_SIZE, ALIGNED_SIZE));
        for (i, px) in crop.chunks_exact(3).take(ALIGNED_SIZE * ALIGNED_SIZE).enumerate() {
            let (y, x) = (i / ALIGNED_SIZE, i % ALIGNED_SIZE);
            for c in 0..3 {
                tensor[[0, c, y, x]] = (px[c] as f32 - DESCRIPTOR_MEAN) / DESCRIPTOR_STD;
            }
        }
        tensor
    }
}

impl DescriptorExtractor for DescriptorModel {
    fn describe(&mut self, grid: &PixelGrid, region: &Region) -> Result<Encoding, RecognizerError> {
        let crop = alignment::face_crop(grid, region);
        let input = Self::preprocess(&crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("descriptor extraction: {e}")))?;

        if raw.len() != ENCODING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ENCODING_DIM}-dim descriptor, got {}",
                raw.len()
            )));
        }

        Encoding::normalized(raw.to_vec())
            .map_err(|e| RecognizerError::InferenceFailed(e.to_string()))
    }
}
