//! SCRFD face locator via ONNX Runtime.
//!
//! 3-stride anchor-free decoding with letterboxed RGB input and NMS.

use crate::codec::PixelGrid;
use crate::encoder::FaceLocator;
use crate::types::Region;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied when letterboxing into the model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize, target: usize) -> (Self, usize, usize) {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as usize).clamp(1, target);
        let new_h = ((height as f32 * scale).round() as usize).clamp(1, target);
        let lb = Self {
            scale,
            pad_x: (target - new_w) as f32 / 2.0,
            pad_y: (target - new_h) as f32 / 2.0,
        };
        (lb, new_w, new_h)
    }

    /// Map a point from model-input space back to the source image.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

/// SCRFD-based face locator (e.g. `det_10g.onnx`).
pub struct ScrfdLocator {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
}

impl ScrfdLocator {
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_outputs = discover_outputs(&output_names);
        tracing::info!(path = model_path, outputs = ?output_names, "loaded SCRFD model");

        Ok(Self {
            session,
            stride_outputs,
        })
    }

    /// Letterbox an RGB grid into a normalized NCHW tensor.
    fn preprocess(grid: &PixelGrid) -> (Array4<f32>, Letterbox) {
        let (w, h) = (grid.width() as usize, grid.height() as usize);
        let (lb, new_w, new_h) = Letterbox::fit(w, h, SCRFD_INPUT_SIZE);
        let off_x = lb.pad_x.floor() as usize;
        let off_y = lb.pad_y.floor() as usize;
        let inv = 1.0 / lb.scale;

        // Padding normalizes to 0.0.
        let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));

        for y in 0..new_h {
            let src_y = ((y as f32 + 0.5) * inv - 0.5).clamp(0.0, (h - 1) as f32);
            let y0 = src_y.floor() as usize;
            let y1 = (y0 + 1).min(h - 1);
            let fy = src_y - y0 as f32;

            for x in 0..new_w {
                let src_x = ((x as f32 + 0.5) * inv - 0.5).clamp(0.0, (w - 1) as f32);
                let x0 = src_x.floor() as usize;
                let x1 = (x0 + 1).min(w - 1);
                let fx = src_x - x0 as f32;

                let (tl, tr) = (grid.pixel(x0, y0), grid.pixel(x1, y0));
                let (bl, br) = (grid.pixel(x0, y1), grid.pixel(x1, y1));
                for c in 0..3 {
                    let v = tl[c] as f32 * (1.0 - fx) * (1.0 - fy)
                        + tr[c] as f32 * fx * (1.0 - fy)
                        + bl[c] as f32 * (1.0 - fx) * fy
                        + br[c] as f32 * fx * fy;
                    tensor[[0, c, off_y + y, off_x + x]] = (v - SCRFD_MEAN) / SCRFD_STD;
                }
            }
        }

        (tensor, lb)
    }
}

impl FaceLocator for ScrfdLocator {
    fn locate(&mut self, grid: &PixelGrid) -> Result<Vec<Region>, DetectorError> {
        let (input, letterbox) = Self::preprocess(grid);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_outputs[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(score_idx, "scores")?;
            let bboxes = extract(bbox_idx, "bboxes")?;
            let kps = extract(kps_idx, "kps")?;

            candidates.extend(decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        let regions = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(count = regions.len(), "SCRFD candidate regions");
        Ok(regions)
    }
}

/// Map SCRFD outputs to stride slots by name (`score_8`, `bbox_16`, ...),
/// falling back to positional ordering [scores 8/16/32, bboxes, kps].
fn discover_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => {
            tracing::info!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode one stride level into source-space regions.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<Region> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let s = stride as f32;

    (0..grid_w * grid_h * SCRFD_ANCHORS_PER_CELL)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= threshold {
                return None;
            }
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid_w) as f32 * s;
            let ay = (cell / grid_w) as f32 * s;

            let b = bboxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = letterbox.unmap(ax - b[0] * s, ay - b[1] * s);
            let (x2, y2) = letterbox.unmap(ax + b[2] * s, ay + b[3] * s);

            let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| letterbox.unmap(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s))
            });

            Some(Region {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Non-maximum suppression; output is sorted by descending confidence.
fn nms(mut regions: Vec<Region>, iou_threshold: f32) -> Vec<Region> {
    regions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Region> = Vec::new();
    for candidate in regions {
        if keep.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(x: f32, y: f32, w: f32, h: f32, conf: f32) -> Region {
        Region { x, y, width: w, height: h, confidence: conf, landmarks: None }
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let kept = nms(
            vec![
                region(5.0, 5.0, 100.0, 100.0, 0.8),
                region(0.0, 0.0, 100.0, 100.0, 0.9),
                region(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.7);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_unmap_roundtrip() {
        let (lb, new_w, new_h) = Letterbox::fit(320, 240, SCRFD_INPUT_SIZE);
        assert_eq!((new_w, new_h), (640, 480));
        let (x, y) = (100.0f32, 50.0f32);
        let (rx, ry) = lb.unmap(x * lb.scale + lb.pad_x, y * lb.scale + lb.pad_y);
        assert!((rx - x).abs() < 0.1 && (ry - y).abs() < 0.1);
    }

    #[test]
    fn test_preprocess_uniform_grid() {
        let grid = PixelGrid::from_rgb(64, 32, vec![255; 64 * 32 * 3]).unwrap();
        let (tensor, lb) = ScrfdLocator::preprocess(&grid);
        assert_eq!(tensor.shape(), &[1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE]);
        // Top rows are padding, centre is image content.
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let expected = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 2, 320, 320]] - expected).abs() < 1e-5);
        assert!(lb.pad_y > 0.0);
    }

    #[test]
    fn test_decode_stride_single_anchor() {
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let stride = 32;
        let cells = (SCRFD_INPUT_SIZE / stride).pow(2) * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0; cells];
        let mut bboxes = vec![0.0; cells * 4];
        let kps = vec![0.0; cells * 10];
        // Anchor 2 → cell 1 → (32, 0)
        scores[2] = 0.9;
        bboxes[8..12].copy_from_slice(&[0.5, 0.0, 1.0, 2.0]);

        let regions = decode_stride(&scores, &bboxes, &kps, stride, &lb, 0.5);
        assert_eq!(regions.len(), 1);
        let r = &regions[0];
        assert_eq!((r.x, r.y, r.width, r.height), (16.0, 0.0, 48.0, 64.0));
        assert_eq!(r.landmarks.unwrap()[0], (32.0, 0.0));
    }

    #[test]
    fn test_discover_outputs_named_and_positional() {
        let named: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(discover_outputs(&named), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);

        let generic: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_outputs(&generic), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }
}
